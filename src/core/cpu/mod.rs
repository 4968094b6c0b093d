use crate::core::cpu::cop0::Cop0;
use crate::core::cpu::exception::{deliver, DeliveryContext, Fault};
use crate::core::cpu::instruction::{Instruction, Opcode};
use crate::core::cpu::tlb::{Tlb, TranslateFault};
use crate::core::memory::bus::Bus;
use crate::core::memory::{ReadMemoryAccess, WriteMemoryAccess};
use tracing::warn;

pub mod cop0;
pub mod exception;
pub mod instruction;
pub mod tlb;

pub const RESET_ADDRESS: u32 = 0xBFC0_0000;

type StepFault = Result<(), Fault>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchState {
    None,
    Cond,
    Passed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Simulator,
    Debugger,
}

#[derive(Debug, Clone, Copy)]
pub struct Breakpoint {
    pub pc: u32,
    pub hits: u64,
    pub kind: BreakpointKind,
}

/// Hook the debugging opcodes (`DVAL/DTRC/DTRO/DRV/DHLT/DINT`) dispatch
/// through. None of these affect architectural state; a collaborator
/// not interested in them can rely on the no-op default.
pub trait DebugHook {
    fn on_dval(&mut self, _cpu: &Cpu, _value: u32) {}
    fn on_dtrc(&mut self, _enable: bool) {}
    fn on_dtro(&mut self, _enable: bool) {}
    fn on_drv(&mut self, _cpu: &Cpu) {}
    fn on_dhlt(&mut self) {}
    fn on_dint(&mut self, _cpu: &Cpu) {}
}

pub struct NullDebugHook;

impl DebugHook for NullDebugHook {}

/// The 32-bit R4000 integer pipeline: register file, CP0, TLB, and
/// the fetch/decode/execute loop. Owns everything a single CPU needs
/// to translate addresses and deliver exceptions on its own; `Bus` is
/// just the shared physical memory behind it.
pub struct Cpu {
    pub regs: [u32; 32],
    pub hi: u32,
    pub lo: u32,
    pub pc: u32,
    pub pc_next: u32,
    /// Prospective next-next PC, computed at the start of each step
    /// and overwritten by branch/jump handlers.
    pca: u32,
    branch: BranchState,
    pub cop0: Cop0,
    pub tlb: Tlb,
    pub standby: bool,
    pub llbit: bool,
    pub lladdr: u32,
    pub watch_pending: bool,
    pub watch_exc_addr: u32,
    pub watch_addr: u32,
    current_exc_addr: u32,
    pub cycles_kernel: u64,
    pub cycles_user: u64,
    pub cycles_wait: u64,
    pub interrupt_counts: [u64; 8],
    pub breakpoints: Vec<Breakpoint>,
}

impl Default for Cpu {
    fn default() -> Self {
        Cpu {
            regs: [0; 32],
            hi: 0,
            lo: 0,
            pc: RESET_ADDRESS,
            pc_next: RESET_ADDRESS.wrapping_add(4),
            pca: RESET_ADDRESS.wrapping_add(8),
            branch: BranchState::None,
            cop0: Cop0::new(),
            tlb: Tlb::new(),
            standby: false,
            llbit: false,
            lladdr: 0,
            watch_pending: false,
            watch_exc_addr: 0,
            watch_addr: 0,
            current_exc_addr: RESET_ADDRESS,
            cycles_kernel: 0,
            cycles_user: 0,
            cycles_wait: 0,
            interrupt_counts: [0; 8],
            breakpoints: Vec::new(),
        }
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        let mut fresh = Cpu::new();
        std::mem::swap(self, &mut fresh);
    }

    pub fn set_pc(&mut self, addr: u32) {
        self.pc = addr;
        self.pc_next = addr.wrapping_add(4);
        self.branch = BranchState::None;
    }

    pub fn interrupt_up(&mut self, line: u8) {
        self.cop0.set_ip_bit(line, true);
        if let Some(count) = self.interrupt_counts.get_mut(line as usize) {
            *count += 1;
        }
    }

    pub fn interrupt_down(&mut self, line: u8) {
        self.cop0.set_ip_bit(line, false);
    }

    pub fn set_breakpoint(&mut self, pc: u32, kind: BreakpointKind) {
        self.breakpoints.push(Breakpoint { pc, hits: 0, kind });
    }

    pub fn clear_breakpoint(&mut self, pc: u32) {
        self.breakpoints.retain(|bp| bp.pc != pc);
    }

    pub fn list_breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    fn check_breakpoint_hit(&mut self) {
        let pc = self.pc;
        if let Some(bp) = self.breakpoints.iter_mut().find(|bp| bp.pc == pc) {
            bp.hits += 1;
            tracing::debug!("breakpoint hit at {:#010x} (hits={})", pc, bp.hits);
        }
    }

    /// Reads a word for disassembly/console inspection without
    /// triggering CP0 side effects or watchpoints.
    pub fn read_ins(&mut self, bus: &mut Bus, vaddr: u32) -> Result<u32, Fault> {
        let paddr = self.translate(vaddr, false, false)?;
        match bus.read::<32>(paddr) {
            ReadMemoryAccess::Ok(value) => Ok(value),
            ReadMemoryAccess::BusError => Err(Fault::InstructionBusError),
        }
    }

    pub fn read_mem_external(&mut self, bus: &mut Bus, vaddr: u32, size: u8, noisy: bool) -> Result<u32, Fault> {
        match size {
            1 => self.read_mem::<8>(bus, vaddr, noisy),
            2 => self.read_mem::<16>(bus, vaddr, noisy),
            4 => self.read_mem::<32>(bus, vaddr, noisy),
            _ => Err(Fault::AddrErrorLoad),
        }
    }

    // --------------------------------------------------------------
    // translation
    // --------------------------------------------------------------

    fn translate(&mut self, vaddr: u32, for_write: bool, noisy: bool) -> Result<u32, Fault> {
        if self.cop0.ts() {
            return Ok(vaddr);
        }

        let addr_fault = || if for_write { Fault::AddrErrorStore } else { Fault::AddrErrorLoad };
        let needs_tlb;
        let mut direct: Option<u32> = None;

        if self.cop0.is_kernel_mode() {
            match vaddr {
                0x8000_0000..=0x9FFF_FFFF => {
                    needs_tlb = false;
                    direct = Some(vaddr - 0x8000_0000);
                }
                0xA000_0000..=0xBFFF_FFFF => {
                    needs_tlb = false;
                    direct = Some(vaddr - 0xA000_0000);
                }
                _ => needs_tlb = true,
            }
        } else if self.cop0.is_supervisor_mode() {
            if vaddr < 0x8000_0000 || (0xC000_0000..0xE000_0000).contains(&vaddr) {
                needs_tlb = true;
            } else {
                return Err(addr_fault());
            }
        } else {
            if vaddr >= 0x8000_0000 {
                return Err(addr_fault());
            }
            needs_tlb = true;
        }

        if !needs_tlb {
            return Ok(direct.unwrap());
        }

        let asid = self.cop0.asid();
        match self.tlb.translate(vaddr, asid, for_write) {
            Ok(paddr) => Ok(paddr),
            Err(tlb_fault) => {
                if noisy {
                    self.cop0.set_bad_vaddr(vaddr);
                    self.cop0.set_context_badvpn2(vaddr);
                    self.cop0.splice_entry_hi_vpn2(vaddr);
                    match tlb_fault {
                        TranslateFault::TlbRefill => {
                            let line = if for_write { 3 } else { 2 };
                            let _ = line;
                        }
                        _ => {}
                    }
                }
                Err(match tlb_fault {
                    TranslateFault::AddrError => addr_fault(),
                    TranslateFault::TlbRefill => {
                        if for_write {
                            Fault::TlbStoreRefill
                        } else {
                            Fault::TlbLoadRefill
                        }
                    }
                    TranslateFault::TlbInvalid => {
                        if for_write {
                            Fault::TlbStore
                        } else {
                            Fault::TlbLoad
                        }
                    }
                    TranslateFault::TlbModified => Fault::Mod,
                })
            }
        }
    }

    fn check_watch(&mut self, paddr: u32, is_write: bool) -> Result<(), Fault> {
        let enabled = if is_write {
            self.cop0.watch_write_enabled()
        } else {
            self.cop0.watch_read_enabled()
        };
        if !enabled || (paddr & !0x7) != self.cop0.watch_address() {
            return Ok(());
        }
        if !self.cop0.exl() {
            Err(Fault::Watch)
        } else {
            self.watch_pending = true;
            self.watch_exc_addr = self.current_exc_addr;
            self.watch_addr = paddr;
            Ok(())
        }
    }

    fn read_mem<const SIZE: usize>(&mut self, bus: &mut Bus, vaddr: u32, noisy: bool) -> Result<u32, Fault> {
        if SIZE == 16 && vaddr & 1 != 0 {
            return Err(Fault::AddrErrorLoad);
        }
        if SIZE == 32 && vaddr & 3 != 0 {
            return Err(Fault::AddrErrorLoad);
        }
        let paddr = self.translate(vaddr, false, noisy)?;
        if noisy {
            self.check_watch(paddr, false)?;
        }
        match bus.read::<SIZE>(paddr) {
            ReadMemoryAccess::Ok(value) => Ok(value),
            ReadMemoryAccess::BusError => Err(Fault::DataBusError),
        }
    }

    fn write_mem<const SIZE: usize>(&mut self, bus: &mut Bus, vaddr: u32, value: u32, noisy: bool) -> Result<(), Fault> {
        if SIZE == 16 && vaddr & 1 != 0 {
            return Err(Fault::AddrErrorStore);
        }
        if SIZE == 32 && vaddr & 3 != 0 {
            return Err(Fault::AddrErrorStore);
        }
        let paddr = self.translate(vaddr, true, noisy)?;
        if noisy {
            self.check_watch(paddr, true)?;
        }
        match bus.write::<SIZE>(paddr, value) {
            WriteMemoryAccess::Ok => Ok(()),
            WriteMemoryAccess::ReadOnly => Ok(()),
            WriteMemoryAccess::BusError => Err(Fault::DataBusError),
        }
    }

    // --------------------------------------------------------------
    // main step loop
    // --------------------------------------------------------------

    pub fn step(&mut self, bus: &mut Bus, debug: &mut dyn DebugHook) {
        if self.standby {
            if self.cop0.interrupt_pending() {
                self.deliver(Fault::Interrupt, false, self.pc);
            }
            self.tick_cycle_manager();
            return;
        }

        let in_delay_slot = self.branch == BranchState::Passed;
        let exc_addr = if in_delay_slot { self.pc.wrapping_sub(4) } else { self.pc };
        self.current_exc_addr = exc_addr;

        let fetch_paddr = self.translate(self.pc, false, true);
        let word = match fetch_paddr {
            Ok(paddr) => match bus.read::<32>(paddr) {
                ReadMemoryAccess::Ok(value) => value,
                ReadMemoryAccess::BusError => {
                    self.deliver(Fault::InstructionBusError, in_delay_slot, exc_addr);
                    self.tick_cycle_manager();
                    return;
                }
            },
            Err(fault) => {
                self.deliver(fault, in_delay_slot, exc_addr);
                self.tick_cycle_manager();
                return;
            }
        };

        let instr = Instruction(word);
        let opcode = Opcode::from_instruction(&instr);
        self.pca = self.pc_next.wrapping_add(4);

        let result = self.execute(bus, &instr, opcode, debug);
        match result {
            Ok(()) => {
                if self.cop0.interrupt_pending() {
                    self.deliver(Fault::Interrupt, in_delay_slot, exc_addr);
                } else {
                    self.pc = self.pc_next;
                    self.pc_next = self.pca;
                }
            }
            Err(fault) => {
                self.deliver(fault, in_delay_slot, exc_addr);
            }
        }
        self.regs[0] = 0;
        self.tick_cycle_manager();
        self.check_breakpoint_hit();
    }

    fn deliver(&mut self, fault: Fault, in_delay_slot: bool, exc_addr: u32) {
        let coprocessor = match fault {
            Fault::CoprocessorUnusable(n) => n,
            _ => 0,
        };
        let ctx = DeliveryContext {
            pc: self.pc,
            exc_addr,
            branch_passed: in_delay_slot,
            standby: self.standby,
            exl: self.cop0.exl(),
            bev: self.cop0.bev(),
            coprocessor,
        };
        let result = deliver(fault, &ctx);
        if let Some(epc) = result.epc {
            self.cop0.set_epc(epc);
        }
        self.cop0.set_exc_code(result.cause_exc_code);
        self.cop0.set_bd(result.cause_bd);
        if let Some(ce) = result.cause_ce {
            self.cop0.set_ce(ce);
        }
        self.standby = false;
        self.cop0.set_exl(true);
        self.pc = result.new_pc;
        self.pc_next = result.new_pc.wrapping_add(4);
        self.branch = BranchState::None;
    }

    fn tick_cycle_manager(&mut self) {
        let _ = self.cop0.tick_count();
        self.cop0.decrement_random();
        if self.standby {
            self.cycles_wait += 1;
        } else if self.cop0.is_kernel_mode() {
            self.cycles_kernel += 1;
        } else {
            self.cycles_user += 1;
        }
        self.branch = match self.branch {
            BranchState::Cond => BranchState::Passed,
            BranchState::Passed => BranchState::None,
            BranchState::None => BranchState::None,
        };
    }

    // --------------------------------------------------------------
    // execute unit
    // --------------------------------------------------------------

    fn execute(&mut self, bus: &mut Bus, i: &Instruction, opcode: Opcode, debug: &mut dyn DebugHook) -> StepFault {
        use Opcode::*;

        if opcode.is_doubleword() {
            return Err(Fault::ReservedInstruction);
        }

        let rs = i.rs();
        let rt = i.rt();
        let rd = i.rd();
        let sa = i.shift_amount();
        let imm = i.signed_immediate16();
        let uimm = i.unsigned_immediate16();

        match opcode {
            NOP => Ok(()),
            SLL => {
                self.regs[rd] = self.regs[rt] << sa;
                Ok(())
            }
            SRL => {
                self.regs[rd] = self.regs[rt] >> sa;
                Ok(())
            }
            SRA => {
                self.regs[rd] = ((self.regs[rt] as i32) >> sa) as u32;
                Ok(())
            }
            SLLV => {
                self.regs[rd] = self.regs[rt] << (self.regs[rs] & 0x1F);
                Ok(())
            }
            SRLV => {
                self.regs[rd] = self.regs[rt] >> (self.regs[rs] & 0x1F);
                Ok(())
            }
            SRAV => {
                self.regs[rd] = ((self.regs[rt] as i32) >> (self.regs[rs] & 0x1F)) as u32;
                Ok(())
            }
            JR => {
                self.pca = self.regs[rs];
                self.branch = BranchState::Cond;
                Ok(())
            }
            JALR => {
                let target = self.regs[rs];
                self.regs[rd] = self.pc_next.wrapping_add(4);
                self.pca = target;
                self.branch = BranchState::Cond;
                Ok(())
            }
            SYSCALL => Err(Fault::SysCall),
            BREAK => Err(Fault::BreakPoint),
            SYNC => Ok(()),
            MFHI => {
                self.regs[rd] = self.hi;
                Ok(())
            }
            MTHI => {
                self.hi = self.regs[rs];
                Ok(())
            }
            MFLO => {
                self.regs[rd] = self.lo;
                Ok(())
            }
            MTLO => {
                self.lo = self.regs[rs];
                Ok(())
            }
            MULT => {
                let product = (self.regs[rs] as i32 as i64) * (self.regs[rt] as i32 as i64);
                self.hi = (product >> 32) as u32;
                self.lo = product as u32;
                Ok(())
            }
            MULTU => {
                let product = (self.regs[rs] as u64) * (self.regs[rt] as u64);
                self.hi = (product >> 32) as u32;
                self.lo = product as u32;
                Ok(())
            }
            DIV => {
                let (dividend, divisor) = (self.regs[rs] as i32, self.regs[rt] as i32);
                if divisor == 0 {
                    self.hi = 0;
                    self.lo = 0;
                } else {
                    self.hi = dividend.wrapping_rem(divisor) as u32;
                    self.lo = dividend.wrapping_div(divisor) as u32;
                }
                Ok(())
            }
            DIVU => {
                let (dividend, divisor) = (self.regs[rs], self.regs[rt]);
                if divisor == 0 {
                    self.hi = 0;
                    self.lo = 0;
                } else {
                    self.hi = dividend % divisor;
                    self.lo = dividend / divisor;
                }
                Ok(())
            }
            ADD | ADDI => {
                let b = if opcode == ADDI { imm } else { self.regs[rt] };
                let dest = if opcode == ADDI { rt } else { rd };
                match (self.regs[rs] as i32).checked_add(b as i32) {
                    Some(sum) => {
                        self.regs[dest] = sum as u32;
                        Ok(())
                    }
                    None => Err(Fault::Overflow),
                }
            }
            ADDU => {
                self.regs[rd] = self.regs[rs].wrapping_add(self.regs[rt]);
                Ok(())
            }
            ADDIU => {
                self.regs[rt] = self.regs[rs].wrapping_add(imm);
                Ok(())
            }
            SUB => match (self.regs[rs] as i32).checked_sub(self.regs[rt] as i32) {
                Some(diff) => {
                    self.regs[rd] = diff as u32;
                    Ok(())
                }
                None => Err(Fault::Overflow),
            },
            SUBU => {
                self.regs[rd] = self.regs[rs].wrapping_sub(self.regs[rt]);
                Ok(())
            }
            AND => {
                self.regs[rd] = self.regs[rs] & self.regs[rt];
                Ok(())
            }
            OR => {
                self.regs[rd] = self.regs[rs] | self.regs[rt];
                Ok(())
            }
            XOR => {
                self.regs[rd] = self.regs[rs] ^ self.regs[rt];
                Ok(())
            }
            NOR => {
                self.regs[rd] = !(self.regs[rs] | self.regs[rt]);
                Ok(())
            }
            SLT => {
                self.regs[rd] = ((self.regs[rs] as i32) < (self.regs[rt] as i32)) as u32;
                Ok(())
            }
            SLTU => {
                self.regs[rd] = (self.regs[rs] < self.regs[rt]) as u32;
                Ok(())
            }
            SLTI => {
                self.regs[rt] = ((self.regs[rs] as i32) < (imm as i32)) as u32;
                Ok(())
            }
            SLTIU => {
                self.regs[rt] = (self.regs[rs] < imm) as u32;
                Ok(())
            }
            ANDI => {
                self.regs[rt] = self.regs[rs] & uimm;
                Ok(())
            }
            ORI => {
                self.regs[rt] = self.regs[rs] | uimm;
                Ok(())
            }
            XORI => {
                self.regs[rt] = self.regs[rs] ^ uimm;
                Ok(())
            }
            LUI => {
                self.regs[rt] = uimm << 16;
                Ok(())
            }
            TGE | TGEI => self.trap_if((self.regs[rs] as i32) >= self.trap_rhs(opcode, rt, imm)),
            TGEU | TGEIU => self.trap_if(self.regs[rs] >= self.trap_rhs_u(opcode, rt, imm)),
            TLT | TLTI => self.trap_if((self.regs[rs] as i32) < self.trap_rhs(opcode, rt, imm)),
            TLTU | TLTIU => self.trap_if(self.regs[rs] < self.trap_rhs_u(opcode, rt, imm)),
            TEQ | TEQI => self.trap_if(self.regs[rs] == self.trap_rhs_u(opcode, rt, imm)),
            TNE | TNEI => self.trap_if(self.regs[rs] != self.trap_rhs_u(opcode, rt, imm)),
            MADD => {
                let acc = ((self.hi as u64) << 32 | self.lo as u64) as i64;
                let product = (self.regs[rs] as i32 as i64) * (self.regs[rt] as i32 as i64);
                let sum = acc.wrapping_add(product) as u64;
                self.hi = (sum >> 32) as u32;
                self.lo = sum as u32;
                Ok(())
            }
            MADDU => {
                let acc = (self.hi as u64) << 32 | self.lo as u64;
                let product = (self.regs[rs] as u64) * (self.regs[rt] as u64);
                let sum = acc.wrapping_add(product);
                self.hi = (sum >> 32) as u32;
                self.lo = sum as u32;
                Ok(())
            }
            MSUB => {
                let acc = ((self.hi as u64) << 32 | self.lo as u64) as i64;
                let product = (self.regs[rs] as i32 as i64) * (self.regs[rt] as i32 as i64);
                let diff = acc.wrapping_sub(product) as u64;
                self.hi = (diff >> 32) as u32;
                self.lo = diff as u32;
                Ok(())
            }
            MSUBU => {
                let acc = (self.hi as u64) << 32 | self.lo as u64;
                let product = (self.regs[rs] as u64) * (self.regs[rt] as u64);
                let diff = acc.wrapping_sub(product);
                self.hi = (diff >> 32) as u32;
                self.lo = diff as u32;
                Ok(())
            }
            MUL => {
                let product = (self.regs[rs] as i32).wrapping_mul(self.regs[rt] as i32);
                self.regs[rd] = product as u32;
                Ok(())
            }
            CLZ => {
                self.regs[rd] = self.regs[rs].leading_zeros();
                Ok(())
            }
            CLO => {
                self.regs[rd] = self.regs[rs].leading_ones();
                Ok(())
            }
            BLTZ | BLTZL | BLTZAL | BLTZALL => {
                let cond = (self.regs[rs] as i32) < 0;
                self.do_branch(cond, matches!(opcode, BLTZAL | BLTZALL), matches!(opcode, BLTZL | BLTZALL), imm);
                Ok(())
            }
            BGEZ | BGEZL | BGEZAL | BGEZALL => {
                let cond = (self.regs[rs] as i32) >= 0;
                self.do_branch(cond, matches!(opcode, BGEZAL | BGEZALL), matches!(opcode, BGEZL | BGEZALL), imm);
                Ok(())
            }
            J => {
                self.pca = (self.pc_next & 0xF000_0000) | (i.imm26() << 2);
                self.branch = BranchState::Cond;
                Ok(())
            }
            JAL => {
                self.regs[31] = self.pc_next.wrapping_add(4);
                self.pca = (self.pc_next & 0xF000_0000) | (i.imm26() << 2);
                self.branch = BranchState::Cond;
                Ok(())
            }
            BEQ | BEQL => {
                self.do_branch(self.regs[rs] == self.regs[rt], false, opcode == BEQL, imm);
                Ok(())
            }
            BNE | BNEL => {
                self.do_branch(self.regs[rs] != self.regs[rt], false, opcode == BNEL, imm);
                Ok(())
            }
            BLEZ | BLEZL => {
                self.do_branch((self.regs[rs] as i32) <= 0, false, opcode == BLEZL, imm);
                Ok(())
            }
            BGTZ | BGTZL => {
                self.do_branch((self.regs[rs] as i32) > 0, false, opcode == BGTZL, imm);
                Ok(())
            }
            MFCn => {
                let coprocessor = self.cop_number(i);
                self.cop0_gate(coprocessor)?;
                self.regs[rt] = if coprocessor == 0 { self.cop0.read(rd) } else { 0 };
                Ok(())
            }
            CFCn => {
                let coprocessor = self.cop_number(i);
                self.cop0_gate(coprocessor)?;
                self.regs[rt] = if coprocessor == 0 { self.cop0.read(rd) } else { 0 };
                Ok(())
            }
            MTCn => {
                let coprocessor = self.cop_number(i);
                self.cop0_gate(coprocessor)?;
                if coprocessor == 0 {
                    self.cop0.write(rd, self.regs[rt]);
                }
                Ok(())
            }
            CTCn => {
                let coprocessor = self.cop_number(i);
                self.cop0_gate(coprocessor)?;
                if coprocessor == 0 {
                    self.cop0.write(rd, self.regs[rt]);
                }
                Ok(())
            }
            BCnF | BCnT => {
                let coprocessor = self.cop_number(i);
                self.cop0_gate(coprocessor)?;
                Ok(())
            }
            TLBR => {
                self.cop0_gate(0)?;
                match self.tlb.read(self.cop0.index() as usize) {
                    Some(entry) => self.cop0.load_entry(entry),
                    None => self.cop0.load_entry(Default::default()),
                }
                Ok(())
            }
            TLBWI => {
                self.cop0_gate(0)?;
                let entry = self.cop0.current_entry();
                self.tlb.write(self.cop0.index() as usize, entry);
                Ok(())
            }
            TLBWR => {
                self.cop0_gate(0)?;
                let entry = self.cop0.current_entry();
                self.tlb.write(self.cop0.random() as usize, entry);
                Ok(())
            }
            TLBP => {
                self.cop0_gate(0)?;
                let asid = self.cop0.asid();
                let vaddr = self.cop0.entry_hi();
                let mut found = 0x8000_0000u32;
                for (index, entry) in self.tlb.entries.iter().enumerate() {
                    if entry.present
                        && (vaddr & entry.mask) == entry.vpn2
                        && (entry.global || entry.asid == asid)
                    {
                        found = index as u32;
                        break;
                    }
                }
                self.cop0.set_index(found);
                Ok(())
            }
            ERET => {
                self.cop0_gate(0)?;
                if self.branch == BranchState::Passed {
                    warn!("ERET executed inside a branch delay slot");
                }
                self.llbit = false;
                let target = if self.cop0.erl() {
                    self.cop0.set_erl(false);
                    self.cop0.error_epc()
                } else {
                    self.cop0.set_exl(false);
                    self.cop0.epc()
                };
                // ERET jumps immediately; it has no delay slot of its own.
                self.pc_next = target;
                self.pca = target.wrapping_add(4);
                self.branch = BranchState::None;
                Ok(())
            }
            WAIT => {
                self.standby = true;
                self.pca = self.pc;
                self.branch = BranchState::None;
                Ok(())
            }
            DVAL => {
                debug.on_dval(self, self.regs[4]);
                Ok(())
            }
            DTRC => {
                debug.on_dtrc(true);
                Ok(())
            }
            DTRO => {
                debug.on_dtro(false);
                Ok(())
            }
            DRV => {
                debug.on_drv(self);
                Ok(())
            }
            DHLT => {
                debug.on_dhlt();
                Ok(())
            }
            DINT => {
                debug.on_dint(self);
                Ok(())
            }
            COPn => Err(Fault::ReservedInstruction),
            LB => {
                let addr = self.regs[rs].wrapping_add(imm);
                let value = self.read_mem::<8>(bus, addr, true)?;
                self.regs[rt] = (value as i8) as i32 as u32;
                Ok(())
            }
            LBU => {
                let addr = self.regs[rs].wrapping_add(imm);
                let value = self.read_mem::<8>(bus, addr, true)?;
                self.regs[rt] = value & 0xFF;
                Ok(())
            }
            LH => {
                let addr = self.regs[rs].wrapping_add(imm);
                let value = self.read_mem::<16>(bus, addr, true)?;
                self.regs[rt] = (value as i16) as i32 as u32;
                Ok(())
            }
            LHU => {
                let addr = self.regs[rs].wrapping_add(imm);
                let value = self.read_mem::<16>(bus, addr, true)?;
                self.regs[rt] = value & 0xFFFF;
                Ok(())
            }
            LW => {
                let addr = self.regs[rs].wrapping_add(imm);
                self.regs[rt] = self.read_mem::<32>(bus, addr, true)?;
                Ok(())
            }
            LL => {
                let addr = self.regs[rs].wrapping_add(imm);
                let value = self.read_mem::<32>(bus, addr, true)?;
                self.regs[rt] = value;
                let paddr = self.translate(addr, false, false)?;
                self.llbit = true;
                self.lladdr = paddr;
                Ok(())
            }
            SB => {
                let addr = self.regs[rs].wrapping_add(imm);
                self.write_mem::<8>(bus, addr, self.regs[rt] & 0xFF, true)
            }
            SH => {
                let addr = self.regs[rs].wrapping_add(imm);
                self.write_mem::<16>(bus, addr, self.regs[rt] & 0xFFFF, true)
            }
            SW => {
                let addr = self.regs[rs].wrapping_add(imm);
                self.write_mem::<32>(bus, addr, self.regs[rt], true)
            }
            SC => {
                let addr = self.regs[rs].wrapping_add(imm);
                if !self.llbit {
                    self.regs[rt] = 0;
                    return Ok(());
                }
                self.write_mem::<32>(bus, addr, self.regs[rt], true)?;
                let paddr = self.translate(addr, true, false)?;
                if paddr != self.lladdr {
                    warn!("SC address mismatch: expected {:#010x}, got {:#010x}", self.lladdr, paddr);
                }
                self.regs[rt] = 1;
                self.llbit = false;
                Ok(())
            }
            LWL => self.unaligned_load(bus, rs, rt, imm, true),
            LWR => self.unaligned_load(bus, rs, rt, imm, false),
            SWL => self.unaligned_store(bus, rs, rt, imm, true),
            SWR => self.unaligned_store(bus, rs, rt, imm, false),
            LWC1 | LWC2 | LWC3 | SWC1 | SWC2 | SWC3 => Err(Fault::ReservedInstruction),
            UNKNOWN => Err(Fault::ReservedInstruction),
            _ => {
                // Doubleword family is rejected earlier via is_doubleword();
                // this arm only catches genuinely unrecognized encodings.
                Err(Fault::ReservedInstruction)
            }
        }
    }

    /// Coprocessor number encoded in a COP-format instruction's opcode
    /// field (0x10..=0x13 -> coprocessor 0..=3).
    fn cop_number(&self, i: &Instruction) -> u8 {
        (i.op() - 0x10) as u8
    }

    fn cop0_gate(&self, coprocessor: u8) -> Result<(), Fault> {
        if self.cop0.cu_enabled(coprocessor) {
            Ok(())
        } else {
            Err(Fault::CoprocessorUnusable(coprocessor))
        }
    }

    fn trap_if(&mut self, condition: bool) -> StepFault {
        if condition {
            Err(Fault::Trap)
        } else {
            Ok(())
        }
    }

    fn trap_rhs(&self, opcode: Opcode, rt: usize, imm: u32) -> i32 {
        use Opcode::*;
        match opcode {
            TGEI | TLTI | TEQI | TNEI => imm as i32,
            _ => self.regs[rt] as i32,
        }
    }

    fn trap_rhs_u(&self, opcode: Opcode, rt: usize, imm: u32) -> u32 {
        use Opcode::*;
        match opcode {
            TGEIU | TLTIU | TEQI | TNEI => imm,
            _ => self.regs[rt],
        }
    }

    fn do_branch(&mut self, cond: bool, link: bool, likely: bool, imm: u32) {
        if link {
            self.regs[31] = self.pc_next.wrapping_add(4);
        }
        if cond {
            self.pca = self.pc_next.wrapping_add(imm << 2);
            self.branch = BranchState::Cond;
        } else if likely {
            self.pc_next = self.pc_next.wrapping_add(4);
            self.pca = self.pc_next.wrapping_add(4);
        }
    }

    /// Byte-index lookup tables from spec §6.3, shared by LWL/LWR/SWL/SWR.
    fn unaligned_load(&mut self, bus: &mut Bus, rs: usize, rt: usize, imm: u32, left: bool) -> StepFault {
        const LWL_MASK: [u32; 4] = [0x00FF_FFFF, 0x0000_FFFF, 0x0000_00FF, 0x0000_0000];
        const LWL_SHL: [u32; 4] = [24, 16, 8, 0];
        const LWR_MASK: [u32; 4] = [0x0000_0000, 0xFF00_0000, 0xFFFF_0000, 0xFFFF_FF00];
        const LWR_SHR: [u32; 4] = [0, 8, 16, 24];

        let addr = self.regs[rs].wrapping_add(imm);
        let aligned = addr & !0x3;
        let k = (addr & 0x3) as usize;
        let word = self.read_mem::<32>(bus, aligned, true)?;
        let old = self.regs[rt];
        self.regs[rt] = if left {
            (old & LWL_MASK[k]) | (word << LWL_SHL[k])
        } else {
            (old & LWR_MASK[k]) | (word >> LWR_SHR[k])
        };
        Ok(())
    }

    fn unaligned_store(&mut self, bus: &mut Bus, rs: usize, rt: usize, imm: u32, left: bool) -> StepFault {
        const SWL_MASK: [u32; 4] = [0xFFFF_FF00, 0xFFFF_0000, 0xFF00_0000, 0x0000_0000];
        const SWL_SHR: [u32; 4] = [24, 16, 8, 0];
        const SWR_MASK: [u32; 4] = [0x0000_0000, 0x0000_00FF, 0x0000_FFFF, 0x00FF_FFFF];
        const SWR_SHL: [u32; 4] = [0, 8, 16, 24];

        let addr = self.regs[rs].wrapping_add(imm);
        let aligned = addr & !0x3;
        let k = (addr & 0x3) as usize;
        let current = self.read_mem::<32>(bus, aligned, true)?;
        let rt_value = self.regs[rt];
        let merged = if left {
            (current & SWL_MASK[k]) | (rt_value >> SWL_SHR[k])
        } else {
            (current & SWR_MASK[k]) | (rt_value << SWR_SHL[k])
        };
        self.write_mem::<32>(bus, aligned, merged, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::Ram;

    fn test_bus() -> Bus {
        Bus::new(Ram::zeroed(0x10000))
    }

    fn encode_addiu(rt: usize, rs: usize, imm: u16) -> u32 {
        (0x09 << 26) | ((rs as u32) << 21) | ((rt as u32) << 16) | imm as u32
    }

    #[test]
    fn reset_then_fetch_executes_from_reset_vector() {
        let mut cpu = Cpu::new();
        let mut bus = test_bus();
        // addiu $t0, $zero, 5 placed at the reset vector's physical location
        let paddr = RESET_ADDRESS - 0xBFC0_0000 + 0x0; // kseg1 maps 1:1 off RAM base in this test harness
        let _ = paddr;
        // Directly exercise decode + execute instead of relying on the
        // reset-vector mapping, since this test harness has no ROM image.
        let instr = Instruction(encode_addiu(8, 0, 5));
        let opcode = Opcode::from_instruction(&instr);
        cpu.execute(&mut bus, &instr, opcode, &mut NullDebugHook).unwrap();
        assert_eq!(cpu.regs[8], 5);
        assert_eq!(cpu.regs[0], 0);
    }

    #[test]
    fn tlb_refill_on_unmapped_kuseg_address() {
        let mut cpu = Cpu::new();
        cpu.cop0.set_status(0); // user/kernel bits clear -> kernel mode (ksu==0)
        let result = cpu.translate(0x1000, false, true);
        assert_eq!(result, Err(Fault::TlbLoadRefill));
    }

    #[test]
    fn branch_likely_not_taken_annuls_delay_slot() {
        let mut cpu = Cpu::new();
        cpu.regs[1] = 1;
        cpu.pc = 0x1000;
        cpu.pc_next = 0x1004;
        cpu.pca = 0x1008;
        // BEQL r0, r1, +8: r0 != r1, branch not taken, likely annuls delay slot
        cpu.do_branch(cpu.regs[0] == cpu.regs[1], false, true, 2);
        assert_eq!(cpu.pc_next, 0x1008);
        assert_eq!(cpu.pca, 0x100C);
    }

    #[test]
    fn ll_then_matching_sc_succeeds() {
        let mut cpu = Cpu::new();
        let mut bus = test_bus();
        cpu.cop0.set_status(0);
        cpu.regs[1] = 0x8000_0100;
        let instr = Instruction(0);
        let opcode = Opcode::LL;
        let i = Instruction((0x30 << 26) | (1 << 21) | (2 << 16));
        cpu.execute(&mut bus, &i, opcode, &mut NullDebugHook).unwrap();
        assert!(cpu.llbit);
        let sc = Instruction((0x38 << 26) | (1 << 21) | (2 << 16));
        cpu.regs[2] = 0x1234;
        cpu.execute(&mut bus, &sc, Opcode::SC, &mut NullDebugHook).unwrap();
        assert_eq!(cpu.regs[2], 1);
        assert!(!cpu.llbit);
        let _ = instr;
    }

    #[test]
    fn add_overflow_raises_fault_without_writing_rd() {
        let mut cpu = Cpu::new();
        let mut bus = test_bus();
        cpu.regs[1] = i32::MAX as u32;
        cpu.regs[2] = 1;
        let instr = Instruction((0x20) | (1 << 21) | (2 << 16) | (3 << 11));
        let result = cpu.execute(&mut bus, &instr, Opcode::ADD, &mut NullDebugHook);
        assert_eq!(result, Err(Fault::Overflow));
        assert_eq!(cpu.regs[3], 0);
    }

    #[test]
    fn divide_by_zero_yields_zero_hi_lo_no_trap() {
        let mut cpu = Cpu::new();
        let mut bus = test_bus();
        cpu.regs[1] = 10;
        cpu.regs[2] = 0;
        let instr = Instruction((0x1A) | (1 << 21) | (2 << 16));
        let result = cpu.execute(&mut bus, &instr, Opcode::DIV, &mut NullDebugHook);
        assert!(result.is_ok());
        assert_eq!(cpu.hi, 0);
        assert_eq!(cpu.lo, 0);
    }

    #[test]
    fn timer_interrupt_sets_ip7_on_count_compare_match() {
        let mut cpu = Cpu::new();
        cpu.cop0.write(cop0::Cop0Reg::Compare as usize, 1);
        cpu.cop0.set_count(0);
        let _ = cpu.cop0.tick_count();
        assert_ne!(cpu.cop0.ip() & (1 << 7), 0);
    }
}
