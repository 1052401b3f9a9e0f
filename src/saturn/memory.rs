//! Memory image: ROM, RAM and the optional port cards.
//!
//! Everything is stored one nibble per byte in the hot path; the packed
//! two-per-byte form exists only on disk (`romio`).  The image hands out
//! plain nibble reads/writes; address routing is the MMU's job.

use super::Variant;
use crate::error::{Error, Result};

/// A plugged-in memory card.  `mask` is `size - 1` (sizes are powers of
/// two); `is_ram` gates writes.
pub struct PortCard {
    pub data: Vec<u8>,
    pub mask: u32,
    pub is_ram: bool,
}

impl PortCard {
    pub fn new(data: Vec<u8>, is_ram: bool) -> Self {
        debug_assert!(data.len().is_power_of_two());
        let mask = (data.len() - 1) as u32;
        Self { data, mask, is_ram }
    }

    pub fn read(&self, offset: u32) -> u8 {
        self.data[(offset & self.mask) as usize]
    }

    /// Write one nibble; dropped when the card is read-only.
    pub fn write(&mut self, offset: u32, val: u8) {
        if self.is_ram {
            self.data[(offset & self.mask) as usize] = val & 0xF;
        }
    }
}

pub struct MemoryImage {
    rom: Vec<u8>,
    rom_mask: u32,
    pub ram: Vec<u8>,
    pub port1: Option<PortCard>,
    pub port2: Option<PortCard>,
}

impl MemoryImage {
    /// Build the image from a loaded ROM (one nibble per byte, size
    /// already validated) and a fresh zeroed RAM for the variant.
    pub fn new(rom: Vec<u8>, variant: Variant) -> Result<Self> {
        debug_assert!(rom.len().is_power_of_two());
        let rom_mask = (rom.len() - 1) as u32;
        let ram_size = variant.ram_size();

        let mut ram = Vec::new();
        ram.try_reserve_exact(ram_size).map_err(|_| Error::AllocFailed)?;
        ram.resize(ram_size, 0);

        Ok(Self {
            rom,
            rom_mask,
            ram,
            port1: None,
            port2: None,
        })
    }

    pub fn rom_size(&self) -> usize {
        self.rom.len()
    }

    /// ROM nibble read; the image mirrors across the 20-bit space.
    pub fn read_rom(&self, addr: u32) -> u8 {
        self.rom[(addr & self.rom_mask) as usize]
    }

    pub fn read_ram(&self, offset: u32) -> u8 {
        self.ram[offset as usize % self.ram.len()]
    }

    pub fn write_ram(&mut self, offset: u32, val: u8) {
        let len = self.ram.len();
        self.ram[offset as usize % len] = val & 0xF;
    }

    pub fn port(&self, slot: usize) -> Option<&PortCard> {
        match slot {
            1 => self.port1.as_ref(),
            2 => self.port2.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rom_mirrors_and_rejects_nothing() {
        let rom = vec![7u8; 0x100];
        let mem = MemoryImage::new(rom, Variant::Sx).unwrap();
        assert_eq!(mem.read_rom(0x40), 7);
        assert_eq!(mem.read_rom(0xFFFFF), 7);
    }

    #[test]
    fn readonly_port_drops_writes() {
        let mut card = PortCard::new(vec![0u8; 0x8000], false);
        card.write(0x10, 0xF);
        assert_eq!(card.read(0x10), 0);

        let mut card = PortCard::new(vec![0u8; 0x8000], true);
        card.write(0x10, 0xF);
        assert_eq!(card.read(0x10), 0xF);
        // Offsets wrap at the card mask.
        assert_eq!(card.read(0x8010), 0xF);
    }
}
