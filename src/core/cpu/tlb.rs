use tracing::warn;

/// Result of a virtual-to-physical translation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateFault {
    AddrError,
    TlbRefill,
    TlbInvalid,
    TlbModified,
}

pub const TLB_ENTRIES: usize = 48;

/// One sub-page half of a TLB entry (EntryLo0 or EntryLo1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbPage {
    pub pfn: u32,
    pub cache_hint: u8,
    pub dirty: bool,
    pub valid: bool,
}

/// A single 48-slot TLB entry, written by `TLBWI`/`TLBWR` from the
/// current EntryHi/EntryLo0/EntryLo1/PageMask registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbEntry {
    pub mask: u32,
    pub vpn2: u32,
    pub asid: u8,
    pub global: bool,
    pub pg: [TlbPage; 2],
    /// False for a never-written slot. A reset TLB is all zeroed
    /// entries, which would otherwise spuriously compare-match every
    /// ASID-0 lookup at mask=0/vpn2=0; this keeps an empty slot a
    /// guaranteed miss.
    pub present: bool,
}

pub struct Tlb {
    pub entries: [TlbEntry; TLB_ENTRIES],
    /// Index of the last successful lookup; purely an optimization,
    /// must never change observable translation results.
    pub hint: usize,
}

impl Default for Tlb {
    fn default() -> Self {
        Tlb {
            entries: [TlbEntry::default(); TLB_ENTRIES],
            hint: 0,
        }
    }
}

impl Tlb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, index: usize, mut entry: TlbEntry) {
        if index >= TLB_ENTRIES {
            warn!("TLBWI/TLBWR with out-of-range index {}, ignored", index);
            return;
        }
        entry.present = true;
        self.entries[index] = entry;
    }

    pub fn read(&self, index: usize) -> Option<TlbEntry> {
        if index >= TLB_ENTRIES {
            warn!("TLBR with out-of-range index {}, returning zeroed entry", index);
            return None;
        }
        Some(self.entries[index])
    }

    /// Scans all entries starting at `hint`, returns the matching
    /// entry index and which sub-page (0 or 1) the address selects.
    fn lookup(&mut self, vaddr: u32, asid: u8) -> Option<(usize, usize)> {
        for offset in 0..TLB_ENTRIES {
            let index = (self.hint + offset) % TLB_ENTRIES;
            let entry = &self.entries[index];
            if entry.present
                && (vaddr & entry.mask) == entry.vpn2
                && (entry.global || entry.asid == asid)
            {
                // The comparison bit just above the page offset selects
                // pg[0] or pg[1]. The page offset width is implied by
                // mask: bit position of the lowest zero bit of mask+1
                // (i.e. the bit just above where mask's 1s end).
                let sub_page_bit = sub_page_selector_bit(entry.mask);
                let which = ((vaddr >> sub_page_bit) & 1) as usize;
                self.hint = index;
                return Some((index, which));
            }
        }
        None
    }

    /// Attempts translation of a single TLB-mapped address (kuseg,
    /// kseg2/kseg3, suseg, ssseg) against the current ASID.
    pub fn translate(&mut self, vaddr: u32, asid: u8, for_write: bool) -> Result<u32, TranslateFault> {
        let Some((index, which)) = self.lookup(vaddr, asid) else {
            return Err(TranslateFault::TlbRefill);
        };
        let entry = &self.entries[index];
        let page = &entry.pg[which];
        if !page.valid {
            return Err(TranslateFault::TlbInvalid);
        }
        if for_write && !page.dirty {
            return Err(TranslateFault::TlbModified);
        }
        // The sub-page selector bit is the top bit of the single page's
        // offset; everything below it comes from vaddr, everything at
        // or above comes from the page frame number.
        let sub_page_bit = sub_page_selector_bit(entry.mask);
        let offset_mask = (1u32 << sub_page_bit) - 1;
        let page_offset = vaddr & offset_mask;
        Ok((page.pfn & !offset_mask) | page_offset)
    }
}

/// Given a `TlbEntry::mask` compare mask (high bits set, e.g.
/// `0xFFFFE000` for a 4 KiB pair), returns the bit index that selects
/// between pg[0]/pg[1]: the highest bit cleared by the mask.
fn sub_page_selector_bit(mask: u32) -> u32 {
    let clear_mask = !mask;
    31 - clear_mask.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn make_entry(vpn2: u32, pfn0: u32, pfn1: u32) -> TlbEntry {
        TlbEntry {
            mask: !0xFFFu32,
            vpn2,
            asid: 0,
            global: false,
            pg: [
                TlbPage { pfn: pfn0, cache_hint: 0, dirty: true, valid: true },
                TlbPage { pfn: pfn1, cache_hint: 0, dirty: true, valid: true },
            ],
            present: true,
        }
    }

    #[test]
    fn refill_on_no_match() {
        let mut tlb = Tlb::new();
        let result = tlb.translate(0x1000, 0, false);
        assert_eq!(result, Err(TranslateFault::TlbRefill));
    }

    #[test]
    fn fresh_tlb_misses_even_at_zero_address_and_asid() {
        let mut tlb = Tlb::new();
        assert_eq!(tlb.translate(0, 0, false), Err(TranslateFault::TlbRefill));
    }

    #[test]
    fn translate_respects_a_larger_compare_mask_without_panicking() {
        // 16 KiB page pair: clear_mask = 0x7FFF, compare mask = !0x7FFF.
        let mut tlb = Tlb::new();
        tlb.write(
            0,
            TlbEntry {
                mask: !0x7FFFu32,
                vpn2: 0x8000 & !0x7FFF,
                asid: 0,
                global: false,
                pg: [
                    TlbPage { pfn: 0x4_0000, cache_hint: 0, dirty: true, valid: true },
                    TlbPage { pfn: 0x4_4000, cache_hint: 0, dirty: true, valid: true },
                ],
                present: true,
            },
        );
        // bit 14 (just above the 14-bit single-page offset) selects pg[1].
        assert_eq!(tlb.translate(0x8000 | (1 << 14), 0, false), Ok(0x4_4000));
        assert_eq!(tlb.translate(0x8000, 0, false), Ok(0x4_0000));
    }

    #[test]
    fn matches_and_translates_low_sub_page() {
        let mut tlb = Tlb::new();
        tlb.entries[0] = make_entry(0x1000 & !0xFFF, 0x2000, 0x3000);
        let result = tlb.translate(0x1000, 0, false);
        assert_eq!(result, Ok(0x2000));
    }

    #[test]
    fn out_of_range_write_is_ignored() {
        let mut tlb = Tlb::new();
        tlb.write(100, make_entry(0, 0, 0));
        assert_eq!(tlb.read(100), None);
    }

    #[test]
    fn invalid_subpage_raises_tlb_invalid() {
        let mut tlb = Tlb::new();
        let mut entry = make_entry(0, 0x2000, 0x3000);
        entry.pg[0].valid = false;
        tlb.entries[0] = entry;
        assert_eq!(tlb.translate(0, 0, false), Err(TranslateFault::TlbInvalid));
    }

    #[test]
    fn write_then_read_back_roundtrips() {
        let mut tlb = Tlb::new();
        let entry = make_entry(0x4000, 0x5000, 0x6000);
        tlb.write(10, entry);
        assert_eq!(tlb.read(10), Some(entry));
    }
}
