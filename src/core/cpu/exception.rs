/// Guest-visible fault tags, numbered after the original simulator's
/// `exc_t` enumeration. Never aborts the engine; always delivered
/// through `deliver` below or folded into a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Interrupt,
    Mod,
    TlbLoad,
    TlbStore,
    AddrErrorLoad,
    AddrErrorStore,
    InstructionBusError,
    DataBusError,
    SysCall,
    BreakPoint,
    ReservedInstruction,
    CoprocessorUnusable(u8),
    Overflow,
    Trap,
    Watch,
    /// TLB refill variants, delivered through the dedicated refill
    /// vector rather than the general one.
    TlbLoadRefill,
    TlbStoreRefill,
    Reset,
}

impl Fault {
    /// Numbering drawn from the original simulator's exc_t enum.
    pub fn id(&self) -> u32 {
        match self {
            Fault::Interrupt => 0,
            Fault::Mod => 1,
            Fault::TlbLoad => 2,
            Fault::TlbStore => 3,
            Fault::AddrErrorLoad => 4,
            Fault::AddrErrorStore => 5,
            Fault::InstructionBusError => 6,
            Fault::DataBusError => 7,
            Fault::SysCall => 8,
            Fault::BreakPoint => 9,
            Fault::ReservedInstruction => 10,
            Fault::CoprocessorUnusable(_) => 11,
            Fault::Overflow => 12,
            Fault::Trap => 13,
            Fault::Watch => 23,
            Fault::TlbLoadRefill => 64,
            Fault::TlbStoreRefill => 65,
            Fault::Reset => 32,
        }
    }

    fn is_refill(&self) -> bool {
        matches!(self, Fault::TlbLoadRefill | Fault::TlbStoreRefill)
    }

    /// The ExcCode actually written to Cause: refill variants collapse
    /// onto the base TLBL/TLBS code, the dedicated refill vector is
    /// what distinguishes them.
    fn exc_code(&self) -> u32 {
        match self {
            Fault::TlbLoadRefill => Fault::TlbLoad.id(),
            Fault::TlbStoreRefill => Fault::TlbStore.id(),
            other => other.id(),
        }
    }
}

pub const RESET_VECTOR: u32 = 0xBFC00000;
pub const BOOT_EXCEPTION_BASE: u32 = 0xBFC00200;
pub const NORMAL_EXCEPTION_BASE: u32 = 0x8000_0000;
pub const GENERAL_OFFSET: u32 = 0x180;

/// Everything `deliver` needs to compute from/into CP0, kept as a
/// narrow struct so this module has no dependency on `Cop0`'s layout.
pub struct DeliveryContext {
    pub pc: u32,
    pub exc_addr: u32,
    pub branch_passed: bool,
    pub standby: bool,
    pub exl: bool,
    pub bev: bool,
    pub coprocessor: u8,
}

pub struct DeliveryResult {
    pub epc: Option<u32>,
    pub cause_exc_code: u32,
    pub cause_bd: bool,
    pub cause_ce: Option<u8>,
    pub new_pc: u32,
    pub wake_from_standby: bool,
}

/// Implements §4.6's delivery algorithm without touching CP0 directly,
/// so `Cop0`/`Cpu` apply the result to their own registers.
pub fn deliver(fault: Fault, ctx: &DeliveryContext) -> DeliveryResult {
    let wake_from_standby = ctx.standby;

    let cause_bd = ctx.branch_passed;
    let epc = if !ctx.exl {
        if matches!(fault, Fault::Interrupt) && !ctx.branch_passed {
            Some(if wake_from_standby { ctx.pc.wrapping_add(4) } else { ctx.pc })
        } else {
            Some(ctx.exc_addr)
        }
    } else {
        None
    };

    let vector_base = if fault == Fault::Reset {
        RESET_VECTOR
    } else if ctx.bev {
        BOOT_EXCEPTION_BASE
    } else {
        NORMAL_EXCEPTION_BASE
    };

    let new_pc = if fault == Fault::Reset {
        vector_base
    } else if ctx.exl || !fault.is_refill() {
        vector_base.wrapping_add(GENERAL_OFFSET)
    } else {
        vector_base
    };

    let cause_ce = if matches!(fault, Fault::CoprocessorUnusable(_)) {
        Some(ctx.coprocessor)
    } else {
        None
    };

    DeliveryResult {
        epc,
        cause_exc_code: fault.exc_code(),
        cause_bd,
        cause_ce,
        new_pc,
        wake_from_standby,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_goes_to_reset_vector() {
        let ctx = DeliveryContext {
            pc: 0,
            exc_addr: 0,
            branch_passed: false,
            standby: false,
            exl: false,
            bev: false,
            coprocessor: 0,
        };
        let result = deliver(Fault::Reset, &ctx);
        assert_eq!(result.new_pc, RESET_VECTOR);
    }

    #[test]
    fn general_exception_with_bev_uses_boot_vector_plus_offset() {
        let ctx = DeliveryContext {
            pc: 0x1000,
            exc_addr: 0x1000,
            branch_passed: false,
            standby: false,
            exl: false,
            bev: true,
            coprocessor: 0,
        };
        let result = deliver(Fault::SysCall, &ctx);
        assert_eq!(result.new_pc, BOOT_EXCEPTION_BASE + GENERAL_OFFSET);
        assert_eq!(result.epc, Some(0x1000));
    }

    #[test]
    fn refill_with_exl_clear_uses_refill_vector_without_offset() {
        let ctx = DeliveryContext {
            pc: 0x1000,
            exc_addr: 0x1000,
            branch_passed: false,
            standby: false,
            exl: false,
            bev: false,
            coprocessor: 0,
        };
        let result = deliver(Fault::TlbLoadRefill, &ctx);
        assert_eq!(result.new_pc, NORMAL_EXCEPTION_BASE);
        assert_eq!(result.cause_exc_code, Fault::TlbLoad.id());
    }

    #[test]
    fn refill_with_exl_set_falls_back_to_general_vector() {
        let ctx = DeliveryContext {
            pc: 0x1000,
            exc_addr: 0x1000,
            branch_passed: false,
            standby: false,
            exl: true,
            bev: false,
            coprocessor: 0,
        };
        let result = deliver(Fault::TlbLoadRefill, &ctx);
        assert_eq!(result.new_pc, NORMAL_EXCEPTION_BASE + GENERAL_OFFSET);
        assert_eq!(result.epc, None);
    }

    #[test]
    fn standby_wake_on_interrupt_advances_epc_by_four() {
        let ctx = DeliveryContext {
            pc: 0x1000,
            exc_addr: 0x1000,
            branch_passed: false,
            standby: true,
            exl: false,
            bev: false,
            coprocessor: 0,
        };
        let result = deliver(Fault::Interrupt, &ctx);
        assert_eq!(result.epc, Some(0x1004));
        assert!(result.wake_from_standby);
    }
}
