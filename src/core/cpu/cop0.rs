use crate::core::cpu::tlb::TlbEntry;
use tracing::warn;

/// Index into the flat 32-word CP0 register file, named per the R4000
/// system control coprocessor layout. Unused indices are reserved and
/// read back as whatever was last written (no side effects).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cop0Reg {
    Index = 0,
    Random = 1,
    EntryLo0 = 2,
    EntryLo1 = 3,
    Context = 4,
    PageMask = 5,
    Wired = 6,
    BadVAddr = 8,
    Count = 9,
    EntryHi = 10,
    Compare = 11,
    Status = 12,
    Cause = 13,
    EPC = 14,
    PRId = 15,
    Config = 16,
    LLAddr = 17,
    WatchLo = 18,
    WatchHi = 19,
    ErrorEPC = 30,
}

/// Legal PageMask patterns and the page size (bytes) they represent.
/// Spec §6.1.
const LEGAL_PAGE_MASKS: [u32; 7] = [0, 0x3, 0xF, 0x3F, 0xFF, 0x3FF, 0xFFF];

pub const STATUS_IE: u32 = 1 << 0;
pub const STATUS_EXL: u32 = 1 << 1;
pub const STATUS_ERL: u32 = 1 << 2;
pub const STATUS_KSU_SHIFT: u32 = 3;
pub const STATUS_KSU_MASK: u32 = 0x3 << STATUS_KSU_SHIFT;
pub const STATUS_IM_SHIFT: u32 = 8;
pub const STATUS_IM_MASK: u32 = 0xFF << STATUS_IM_SHIFT;
pub const STATUS_TS: u32 = 1 << 21;
pub const STATUS_BEV: u32 = 1 << 22;
pub const STATUS_CU0: u32 = 1 << 28;
pub const STATUS_CU1: u32 = 1 << 29;
pub const STATUS_CU2: u32 = 1 << 30;
pub const STATUS_CU3: u32 = 1 << 31;

pub const CAUSE_EXCCODE_SHIFT: u32 = 2;
pub const CAUSE_EXCCODE_MASK: u32 = 0x1F << CAUSE_EXCCODE_SHIFT;
pub const CAUSE_IP_SHIFT: u32 = 8;
pub const CAUSE_IP_MASK: u32 = 0xFF << CAUSE_IP_SHIFT;
pub const CAUSE_CE_SHIFT: u32 = 28;
pub const CAUSE_CE_MASK: u32 = 0x3 << CAUSE_CE_SHIFT;
pub const CAUSE_BD: u32 = 1 << 31;

/// The system control coprocessor: translation/exception registers
/// plus the behavior spec §4.4 documents for writes with side
/// effects (Wired resetting Random, Compare clearing IP7, and so on).
pub struct Cop0 {
    regs: [u32; 32],
}

impl Default for Cop0 {
    fn default() -> Self {
        Cop0 { regs: [0; 32] }
    }
}

impl Cop0 {
    pub fn new() -> Self {
        let mut cop0 = Self::default();
        cop0.reset();
        cop0
    }

    /// Hardware reset values per spec §6.1.
    pub fn reset(&mut self) {
        self.regs = [0; 32];
        self.regs[Cop0Reg::Status as usize] = STATUS_ERL | STATUS_BEV;
        self.regs[Cop0Reg::PRId as usize] = 0x0000_0400;
        self.regs[Cop0Reg::Random as usize] = 47;
        self.regs[Cop0Reg::Wired as usize] = 0;
    }

    pub fn read(&self, index: usize) -> u32 {
        self.regs.get(index).copied().unwrap_or(0)
    }

    /// Raw write with the read-only/side-effect policy of spec §4.4.
    /// `MFC0`/`MTC0` route through here rather than touching `regs`
    /// directly.
    pub fn write(&mut self, index: usize, value: u32) {
        match index {
            i if i == Cop0Reg::Random as usize => {}
            i if i == Cop0Reg::BadVAddr as usize => {}
            i if i == Cop0Reg::PRId as usize => {}
            i if i == Cop0Reg::Wired as usize => {
                self.regs[index] = value & 0x3F;
                self.regs[Cop0Reg::Random as usize] = 47;
            }
            i if i == Cop0Reg::Compare as usize => {
                self.regs[index] = value;
                self.regs[Cop0Reg::Cause as usize] &= !(1 << (CAUSE_IP_SHIFT + 7));
            }
            i if i == Cop0Reg::PageMask as usize => {
                let mask = (value >> 13) & 0xFFF;
                if LEGAL_PAGE_MASKS.contains(&mask) {
                    self.regs[index] = value;
                } else {
                    warn!("illegal PageMask pattern {:#x}, zeroed", mask);
                    self.regs[index] = 0;
                }
            }
            i if i == Cop0Reg::WatchLo as usize || i == Cop0Reg::WatchHi as usize => {
                self.regs[index] = value;
            }
            _ => self.regs[index] = value,
        }
    }

    // --- Status ---
    pub fn status(&self) -> u32 {
        self.regs[Cop0Reg::Status as usize]
    }

    pub fn set_status(&mut self, value: u32) {
        self.regs[Cop0Reg::Status as usize] = value;
    }

    pub fn ie(&self) -> bool {
        self.status() & STATUS_IE != 0
    }

    pub fn exl(&self) -> bool {
        self.status() & STATUS_EXL != 0
    }

    pub fn set_exl(&mut self, exl: bool) {
        let status = self.status();
        self.set_status(if exl { status | STATUS_EXL } else { status & !STATUS_EXL });
    }

    pub fn erl(&self) -> bool {
        self.status() & STATUS_ERL != 0
    }

    pub fn set_erl(&mut self, erl: bool) {
        let status = self.status();
        self.set_status(if erl { status | STATUS_ERL } else { status & !STATUS_ERL });
    }

    pub fn ksu(&self) -> u32 {
        (self.status() & STATUS_KSU_MASK) >> STATUS_KSU_SHIFT
    }

    pub fn im(&self) -> u8 {
        ((self.status() & STATUS_IM_MASK) >> STATUS_IM_SHIFT) as u8
    }

    pub fn ts(&self) -> bool {
        self.status() & STATUS_TS != 0
    }

    pub fn bev(&self) -> bool {
        self.status() & STATUS_BEV != 0
    }

    pub fn cu0(&self) -> bool {
        self.status() & STATUS_CU0 != 0
    }

    /// `cop0_usable` per §4.4: CU0 OR kernel/EXL/ERL.
    pub fn cop0_usable(&self) -> bool {
        self.cu0() || self.is_kernel_mode() || self.exl() || self.erl()
    }

    pub fn cu_enabled(&self, coprocessor: u8) -> bool {
        match coprocessor {
            0 => self.cop0_usable(),
            1 => self.status() & STATUS_CU1 != 0,
            2 => self.status() & STATUS_CU2 != 0,
            3 => self.status() & STATUS_CU3 != 0,
            _ => false,
        }
    }

    pub fn is_kernel_mode(&self) -> bool {
        self.exl() || self.erl() || self.ksu() == 0
    }

    pub fn is_supervisor_mode(&self) -> bool {
        !self.exl() && !self.erl() && self.ksu() == 1
    }

    pub fn is_user_mode(&self) -> bool {
        !self.exl() && !self.erl() && self.ksu() == 2
    }

    // --- Cause ---
    pub fn cause(&self) -> u32 {
        self.regs[Cop0Reg::Cause as usize]
    }

    pub fn set_exc_code(&mut self, code: u32) {
        let cause = self.cause();
        self.regs[Cop0Reg::Cause as usize] =
            (cause & !CAUSE_EXCCODE_MASK) | ((code << CAUSE_EXCCODE_SHIFT) & CAUSE_EXCCODE_MASK);
    }

    pub fn set_bd(&mut self, bd: bool) {
        let cause = self.cause();
        self.regs[Cop0Reg::Cause as usize] = if bd { cause | CAUSE_BD } else { cause & !CAUSE_BD };
    }

    pub fn set_ce(&mut self, coprocessor: u8) {
        let cause = self.cause();
        self.regs[Cop0Reg::Cause as usize] =
            (cause & !CAUSE_CE_MASK) | (((coprocessor as u32) << CAUSE_CE_SHIFT) & CAUSE_CE_MASK);
    }

    pub fn ip(&self) -> u8 {
        ((self.cause() & CAUSE_IP_MASK) >> CAUSE_IP_SHIFT) as u8
    }

    pub fn set_ip_bit(&mut self, line: u8, value: bool) {
        let bit = 1u32 << (CAUSE_IP_SHIFT + line as u32);
        let cause = self.cause();
        self.regs[Cop0Reg::Cause as usize] = if value { cause | bit } else { cause & !bit };
    }

    pub fn interrupt_pending(&self) -> bool {
        !self.exl() && !self.erl() && self.ie() && (self.ip() & self.im()) != 0
    }

    // --- EPC / ErrorEPC ---
    pub fn epc(&self) -> u32 {
        self.regs[Cop0Reg::EPC as usize]
    }

    pub fn set_epc(&mut self, value: u32) {
        self.regs[Cop0Reg::EPC as usize] = value;
    }

    pub fn error_epc(&self) -> u32 {
        self.regs[Cop0Reg::ErrorEPC as usize]
    }

    pub fn set_error_epc(&mut self, value: u32) {
        self.regs[Cop0Reg::ErrorEPC as usize] = value;
    }

    // --- Count / Compare ---
    pub fn count(&self) -> u32 {
        self.regs[Cop0Reg::Count as usize]
    }

    pub fn set_count(&mut self, value: u32) {
        self.regs[Cop0Reg::Count as usize] = value;
    }

    pub fn tick_count(&mut self) -> bool {
        let next = self.count().wrapping_add(1);
        self.set_count(next);
        if next == self.regs[Cop0Reg::Compare as usize] {
            self.set_ip_bit(7, true);
            true
        } else {
            false
        }
    }

    // --- Random / Wired ---
    pub fn random(&self) -> u32 {
        self.regs[Cop0Reg::Random as usize]
    }

    pub fn wired(&self) -> u32 {
        self.regs[Cop0Reg::Wired as usize]
    }

    pub fn decrement_random(&mut self) {
        let wired = self.wired();
        let random = self.random();
        let next = if random == 0 || random <= wired { 47 } else { random - 1 };
        self.regs[Cop0Reg::Random as usize] = next;
    }

    // --- EntryHi / EntryLo0/1 / PageMask / Index / Context ---
    pub fn entry_hi(&self) -> u32 {
        self.regs[Cop0Reg::EntryHi as usize]
    }

    pub fn set_entry_hi(&mut self, value: u32) {
        self.regs[Cop0Reg::EntryHi as usize] = value;
    }

    pub fn asid(&self) -> u8 {
        (self.entry_hi() & 0xFF) as u8
    }

    pub fn vpn2(&self) -> u32 {
        self.entry_hi() & !0xFFF
    }

    pub fn entry_lo0(&self) -> u32 {
        self.regs[Cop0Reg::EntryLo0 as usize]
    }

    pub fn entry_lo1(&self) -> u32 {
        self.regs[Cop0Reg::EntryLo1 as usize]
    }

    pub fn page_mask(&self) -> u32 {
        self.regs[Cop0Reg::PageMask as usize]
    }

    pub fn index(&self) -> u32 {
        self.regs[Cop0Reg::Index as usize] & 0x3F
    }

    pub fn set_index(&mut self, value: u32) {
        self.regs[Cop0Reg::Index as usize] = value;
    }

    pub fn set_bad_vaddr(&mut self, value: u32) {
        self.regs[Cop0Reg::BadVAddr as usize] = value;
    }

    pub fn set_context_badvpn2(&mut self, vaddr: u32) {
        let context = self.regs[Cop0Reg::Context as usize];
        let badvpn2 = (vaddr >> 13) & 0x7_FFFF;
        self.regs[Cop0Reg::Context as usize] = (context & !0x7FFF_FFF8) | (badvpn2 << 4);
    }

    pub fn splice_entry_hi_vpn2(&mut self, vaddr: u32) {
        let asid = self.asid();
        self.regs[Cop0Reg::EntryHi as usize] = (vaddr & !0xFFF) | asid as u32;
    }

    /// Build a `TlbEntry` out of the current EntryHi/EntryLo0/EntryLo1/
    /// PageMask registers, as `TLBWI`/`TLBWR` require.
    pub fn current_entry(&self) -> TlbEntry {
        let mask_field = (self.page_mask() >> 13) & 0xFFF;
        let mask = !((mask_field << 13) | 0x1FFF);
        let vpn2 = self.entry_hi() & mask;
        let to_page = |lo: u32| crate::core::cpu::tlb::TlbPage {
            pfn: (lo >> 6) << 12,
            cache_hint: ((lo >> 3) & 0x7) as u8,
            dirty: (lo & 0x4) != 0,
            valid: (lo & 0x2) != 0,
        };
        TlbEntry {
            mask,
            vpn2,
            asid: self.asid(),
            global: (self.entry_lo0() & 1) != 0 && (self.entry_lo1() & 1) != 0,
            pg: [to_page(self.entry_lo0()), to_page(self.entry_lo1())],
            present: true,
        }
    }

    /// Scatter a `TlbEntry` back into PageMask/EntryHi/EntryLo0/1, as
    /// `TLBR` requires.
    pub fn load_entry(&mut self, entry: TlbEntry) {
        let from_page = |page: crate::core::cpu::tlb::TlbPage| -> u32 {
            ((page.pfn >> 12) << 6)
                | ((page.cache_hint as u32) << 3)
                | ((page.dirty as u32) << 2)
                | ((page.valid as u32) << 1)
                | (if entry.global { 1 } else { 0 })
        };
        self.regs[Cop0Reg::EntryLo0 as usize] = from_page(entry.pg[0]);
        self.regs[Cop0Reg::EntryLo1 as usize] = from_page(entry.pg[1]);
        self.regs[Cop0Reg::EntryHi as usize] = entry.vpn2 | entry.asid as u32;
        let mask_field = (!entry.mask >> 13) & 0xFFF;
        self.regs[Cop0Reg::PageMask as usize] = mask_field << 13;
    }

    pub fn ll_addr(&self) -> u32 {
        self.regs[Cop0Reg::LLAddr as usize]
    }

    pub fn set_ll_addr(&mut self, value: u32) {
        self.regs[Cop0Reg::LLAddr as usize] = value;
    }

    pub fn watch_lo(&self) -> u32 {
        self.regs[Cop0Reg::WatchLo as usize]
    }

    pub fn watch_hi(&self) -> u32 {
        self.regs[Cop0Reg::WatchHi as usize]
    }

    pub fn watch_read_enabled(&self) -> bool {
        self.watch_lo() & 0x2 != 0
    }

    pub fn watch_write_enabled(&self) -> bool {
        self.watch_lo() & 0x1 != 0
    }

    /// The cached 8-byte-aligned watch address, spliced from WatchLo's
    /// upper bits and WatchHi's PAddr1 extension.
    pub fn watch_address(&self) -> u32 {
        (self.watch_lo() & !0x7) | (self.watch_hi() & 0xF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reset_sets_hardware_defaults() {
        let cop0 = Cop0::new();
        assert_eq!(cop0.status(), STATUS_ERL | STATUS_BEV);
        assert_eq!(cop0.read(Cop0Reg::PRId as usize), 0x400);
        assert_eq!(cop0.random(), 47);
        assert_eq!(cop0.wired(), 0);
        assert!(cop0.is_kernel_mode());
    }

    #[test]
    fn writing_wired_resets_random() {
        let mut cop0 = Cop0::new();
        cop0.regs[Cop0Reg::Random as usize] = 3;
        cop0.write(Cop0Reg::Wired as usize, 10);
        assert_eq!(cop0.wired(), 10);
        assert_eq!(cop0.random(), 47);
    }

    #[test]
    fn writing_compare_clears_ip7() {
        let mut cop0 = Cop0::new();
        cop0.set_ip_bit(7, true);
        cop0.write(Cop0Reg::Compare as usize, 100);
        assert_eq!(cop0.ip() & (1 << 7), 0);
    }

    #[test]
    fn illegal_page_mask_is_zeroed() {
        let mut cop0 = Cop0::new();
        cop0.write(Cop0Reg::PageMask as usize, 0x5 << 13);
        assert_eq!(cop0.page_mask(), 0);
    }

    #[test]
    fn legal_page_mask_is_kept() {
        let mut cop0 = Cop0::new();
        cop0.write(Cop0Reg::PageMask as usize, 0x3 << 13);
        assert_eq!(cop0.page_mask(), 0x3 << 13);
    }

    #[test]
    fn random_wraps_at_47_and_respects_wired() {
        let mut cop0 = Cop0::new();
        cop0.write(Cop0Reg::Wired as usize, 40);
        assert_eq!(cop0.random(), 47);
        for _ in 0..7 {
            cop0.decrement_random();
        }
        assert_eq!(cop0.random(), 40);
        cop0.decrement_random();
        assert_eq!(cop0.random(), 47);
    }

    #[test]
    fn write_then_read_back_tlb_entry_roundtrips() {
        let mut cop0 = Cop0::new();
        cop0.write(Cop0Reg::EntryHi as usize, 0x1234_0000 | 5);
        cop0.write(Cop0Reg::EntryLo0 as usize, (0x5000 >> 12) << 6 | 0b0110);
        cop0.write(Cop0Reg::EntryLo1 as usize, (0x6000 >> 12) << 6 | 0b0110);
        let entry = cop0.current_entry();
        cop0.load_entry(entry);
        let entry2 = cop0.current_entry();
        assert_eq!(entry.vpn2, entry2.vpn2);
        assert_eq!(entry.pg[0].pfn, entry2.pg[0].pfn);
        assert_eq!(entry.pg[1].pfn, entry2.pg[1].pfn);
    }

    #[test]
    fn every_legal_page_mask_roundtrips_through_tlbwi_tlbr() {
        const LEGAL_PAGE_MASKS: [u32; 7] =
            [0, 0x6000, 0x1E000, 0x7E000, 0x1FE000, 0x7FE000, 0x1FFE000];
        for page_mask in LEGAL_PAGE_MASKS {
            let mut cop0 = Cop0::new();
            cop0.write(Cop0Reg::PageMask as usize, page_mask);
            cop0.write(Cop0Reg::EntryHi as usize, 0xABCD_E000 | 7);
            cop0.write(Cop0Reg::EntryLo0 as usize, (0x5000 >> 12) << 6 | 0b0110);
            cop0.write(Cop0Reg::EntryLo1 as usize, (0x6000 >> 12) << 6 | 0b0110);
            let entry = cop0.current_entry();
            cop0.load_entry(entry);
            assert_eq!(cop0.page_mask(), page_mask, "page_mask {page_mask:#x} did not round-trip");
            let entry2 = cop0.current_entry();
            assert_eq!(entry.mask, entry2.mask);
            assert_eq!(entry.vpn2, entry2.vpn2);
            assert_eq!(entry.pg[0].pfn, entry2.pg[0].pfn);
            assert_eq!(entry.pg[1].pfn, entry2.pg[1].pfn);
        }
    }
}
