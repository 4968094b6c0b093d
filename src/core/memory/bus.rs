use crate::core::memory::{Memory, MmioDevice, Ram, ReadMemoryAccess, WriteMemoryAccess};
use std::ops::Range;
use tracing::warn;

/// Physical-address space: a flat RAM region plus a list of
/// collaborator-registered MMIO device ranges. Shared across every
/// CPU instance in a multi-CPU simulation; each CPU keeps its own
/// TLB, CP0 and register file, so translation and watchpoint
/// matching happen one layer up rather than here.
pub struct Bus {
    ram: Ram,
    devices: Vec<(Range<u32>, Box<dyn MmioDevice>)>,
}

impl Bus {
    pub fn new(ram: Ram) -> Self {
        Bus { ram, devices: Vec::new() }
    }

    pub fn register_device(&mut self, range: Range<u32>, device: Box<dyn MmioDevice>) {
        self.devices.push((range, device));
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut Ram {
        &mut self.ram
    }

    fn find_device(&mut self, paddr: u32) -> Option<(&Range<u32>, &mut Box<dyn MmioDevice>)> {
        self.devices.iter_mut().find(|(range, _)| range.contains(&paddr))
    }

    /// Read `SIZE` bits (8/16/32) from a physical address. The caller
    /// is responsible for alignment checking and TLB translation.
    pub fn read<const SIZE: usize>(&mut self, paddr: u32) -> ReadMemoryAccess {
        if (paddr as usize) < self.ram.len() {
            return self.ram.read::<SIZE>(paddr);
        }
        if let Some((range, device)) = self.find_device(paddr) {
            let offset = paddr - range.start;
            return ReadMemoryAccess::Ok(device.read(offset, (SIZE >> 3) as u8));
        }
        warn!("bus read from unmapped physical address {:08x}", paddr);
        ReadMemoryAccess::BusError
    }

    pub fn write<const SIZE: usize>(&mut self, paddr: u32, value: u32) -> WriteMemoryAccess {
        if (paddr as usize) < self.ram.len() {
            return self.ram.write::<SIZE>(paddr, value);
        }
        if let Some((range, device)) = self.find_device(paddr) {
            let offset = paddr - range.start;
            device.write(offset, (SIZE >> 3) as u8, value);
            return WriteMemoryAccess::Ok;
        }
        warn!("bus write to unmapped physical address {:08x}", paddr);
        WriteMemoryAccess::BusError
    }

    pub fn peek<const SIZE: usize>(&self, paddr: u32) -> Option<u32> {
        if (paddr as usize) < self.ram.len() {
            return self.ram.peek::<SIZE>(paddr);
        }
        None
    }
}
