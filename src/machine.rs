//! The complete machine.
//!
//! One value owns everything — CPU, memory image, MMU, LCD — and every
//! host entry point is a method on it.  No ambient statics; a host that
//! wants two calculators makes two `Machine`s.
//!
//! Lifecycle: `init` loads the ROM (required), then tries the snapshot
//! and RAM images, falling back to a fresh power-on state when either is
//! missing or unreadable.  The host drives `tick` once per animation
//! frame, feeds keys with `set_key`, and blits `display_buffer` whenever
//! `is_display_dirty` says so.  On the way out it calls `snapshot_save`
//! and `save_ram`.

use std::path::Path;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::lcd::Lcd;
use crate::romio;
use crate::saturn::cpu::Cpu;
use crate::saturn::io::DeviceFlags;
use crate::saturn::memory::{MemoryImage, PortCard};
use crate::saturn::mmu::Mmu;
use crate::saturn::Variant;
use crate::snapshot;

// Card status bits.
const CARD_P1_PRESENT: u8 = 0x1;
const CARD_P2_PRESENT: u8 = 0x2;
const CARD_P1_RAM: u8 = 0x4;
const CARD_P2_RAM: u8 = 0x8;

pub struct Machine {
    pub cpu: Cpu,
    pub mem: MemoryImage,
    pub mmu: Mmu,
    pub lcd: Lcd,
    pub device: DeviceFlags,
    pub variant: Variant,
}

impl Machine {
    /// Build a machine around an already loaded ROM image (one nibble
    /// per byte, power-of-two length).
    pub fn with_rom(rom: Vec<u8>, variant: Variant) -> Result<Self> {
        if !rom.len().is_power_of_two() {
            return Err(Error::BadRomSize(rom.len()));
        }
        Ok(Self {
            cpu: Cpu::new(),
            mem: MemoryImage::new(rom, variant)?,
            mmu: Mmu::new(),
            lcd: Lcd::new(),
            device: DeviceFlags::new(),
            variant,
        })
    }

    /// Bring up the emulator from files.  The ROM is required; snapshot
    /// and RAM are best-effort with a fresh fallback.
    pub fn init(
        rom_path: &Path,
        ram_path: &Path,
        conf_path: &Path,
        variant: Variant,
    ) -> Result<Self> {
        let rom = romio::read_rom_file(rom_path)?;
        let mut m = Self::with_rom(rom, variant)?;

        match snapshot::load_file(&mut m, conf_path) {
            Ok(()) => info!("restored state from {}", conf_path.display()),
            Err(e) => {
                warn!("{e}; starting from power-on state");
                m.cpu.reset();
                m.mmu.reset();
            }
        }

        match romio::read_mem_file(ram_path, variant.ram_size()) {
            Ok(ram) => m.mem.ram = ram,
            Err(e) => warn!("{e}; RAM starts zeroed"),
        }

        m.device = DeviceFlags::new();
        Ok(m)
    }

    // ── Frame-boundary host inputs ────────────────────────────

    /// OR (press) or clear (release) key bits on a keyboard row.  Only
    /// called between frames; the interrupt gate picks it up on the next
    /// scheduled instruction.
    pub fn set_key(&mut self, row: usize, mask: u16, pressed: bool) {
        self.cpu.keybuf.set_key(row, mask, pressed);
    }

    /// Host-requested shutdown: the scheduler drains the current frame
    /// and consumes no more time until something posts a wake.
    pub fn shutdown(&mut self) {
        self.cpu.shutdown = true;
    }

    // ── Persistence ───────────────────────────────────────────

    pub fn snapshot_save(&self, path: &Path) -> Result<()> {
        snapshot::save_file(self, path)
    }

    pub fn save_ram(&self, path: &Path) -> Result<()> {
        romio::write_mem_file(path, &self.mem.ram)
    }

    /// Plug a card image into port 1.
    pub fn load_port1(&mut self, path: &Path, writable: bool) -> Result<()> {
        let data = romio::read_port_file(path)?;
        self.mem.port1 = Some(PortCard::new(data, writable));
        self.refresh_card_status();
        Ok(())
    }

    /// Plug a card image into port 2.
    pub fn load_port2(&mut self, path: &Path, writable: bool) -> Result<()> {
        let data = romio::read_port_file(path)?;
        self.mem.port2 = Some(PortCard::new(data, writable));
        self.refresh_card_status();
        Ok(())
    }

    pub fn save_port1(&self, path: &Path) -> Result<()> {
        match &self.mem.port1 {
            Some(card) => romio::write_mem_file(path, &card.data),
            None => Ok(()),
        }
    }

    pub fn save_port2(&self, path: &Path) -> Result<()> {
        match &self.mem.port2 {
            Some(card) => romio::write_mem_file(path, &card.data),
            None => Ok(()),
        }
    }

    fn refresh_card_status(&mut self) {
        let mut status = 0;
        if let Some(card) = &self.mem.port1 {
            status |= CARD_P1_PRESENT;
            if card.is_ram {
                status |= CARD_P1_RAM;
            }
        }
        if let Some(card) = &self.mem.port2 {
            status |= CARD_P2_PRESENT;
            if card.is_ram {
                status |= CARD_P2_RAM;
            }
        }
        self.cpu.card_status = status;
    }

    // ── Display surface ───────────────────────────────────────

    /// The RGBA pixel buffer and its geometry: (pixels, width, height,
    /// stride in bytes).
    pub fn display_buffer(&self) -> (&[u8], usize, usize, usize) {
        (
            self.lcd.buffer(),
            crate::lcd::DISPLAY_WIDTH,
            crate::lcd::DISPLAY_HEIGHT,
            crate::lcd::DISPLAY_WIDTH * 4,
        )
    }

    /// The six annunciator bits (LEFT, RIGHT, ALPHA, BATTERY, BUSY, IO).
    pub fn annunciator_state(&self) -> u8 {
        self.lcd.annunc & 0x3F
    }

    pub fn is_display_dirty(&self) -> bool {
        self.lcd.is_dirty()
    }

    pub fn clear_display_dirty(&mut self) {
        self.lcd.clear_dirty()
    }
}
