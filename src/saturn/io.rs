//! Device register block.
//!
//! Sixty-four nibble-wide registers at the base the guest configures for
//! controller 0 (0x00100 by convention).  Reads and writes dispatch by
//! offset; a handful have side effects — display geometry latches mark
//! the LCD stale, the receive buffer pops its interrupt, timer control
//! writes re-arm the instruction counters.
//!
//! Multi-nibble registers store low nibble first at the lowest offset.

use log::debug;

use crate::machine::Machine;

// ── Register offsets ──────────────────────────────────────────

pub const DISP_IO: u8 = 0x00;
pub const CONTRAST: u8 = 0x01;
pub const DISP_TEST: u8 = 0x02;
/// 16-bit CRC, four nibbles ending at 0x0F.
pub const CRC: u8 = 0x0C;
pub const CRC_END: u8 = 0x0F;
/// Read = power status (battery flags), write = power control.
pub const POWER: u8 = 0x10;
pub const MODE: u8 = 0x11;
/// Annunciator byte, two nibbles.
pub const ANNUNC: u8 = 0x12;
pub const ANNUNC_END: u8 = 0x13;
pub const IR_CTRL: u8 = 0x14;
pub const BASE_OFF: u8 = 0x15;
pub const LCR: u8 = 0x16;
pub const LBR: u8 = 0x17;
pub const SCRATCH: u8 = 0x18;
pub const BAUD: u8 = 0x19;
pub const CARD_CTRL: u8 = 0x1A;
pub const CARD_STATUS: u8 = 0x1B;
pub const IO_CTRL: u8 = 0x1C;
pub const RCS: u8 = 0x1D;
pub const TCS: u8 = 0x1E;
pub const RBR: u8 = 0x20;
pub const TBR: u8 = 0x21;
pub const SREQ: u8 = 0x22;
pub const BASE_NIBBLE: u8 = 0x23;
pub const UNKNOWN: u8 = 0x24;
pub const UNKNOWN_END: u8 = 0x27;
pub const T1_CTRL: u8 = 0x29;
pub const T2_CTRL: u8 = 0x2A;
pub const UNKNOWN2: u8 = 0x2B;
pub const UNKNOWN2_END: u8 = 0x2C;
/// Display bitmap start, five nibbles.
pub const DISP_ADDR: u8 = 0x2E;
pub const DISP_ADDR_END: u8 = 0x32;
/// Extra nibbles per scanline, three nibbles.
pub const LINE_OFFSET: u8 = 0x34;
pub const LINE_OFFSET_END: u8 = 0x36;
pub const LINE_COUNT: u8 = 0x37;
/// Menu bitmap start, five nibbles.
pub const MENU_ADDR: u8 = 0x38;
pub const MENU_ADDR_END: u8 = 0x3C;
pub const TIMER1: u8 = 0x3E;
pub const TIMER2: u8 = 0x3F;

// Timer control bits.
pub const TCTL_RUN: u8 = 0x1;
pub const TCTL_INT: u8 = 0x2;
pub const TCTL_WAKE: u8 = 0x4;

// Card control bits.
pub const CARD_WE1: u8 = 0x1;
pub const CARD_WE2: u8 = 0x2;

// Service request bits.
pub const SREQ_TIMER1: u8 = 0x1;
pub const SREQ_TIMER2: u8 = 0x2;
pub const SREQ_SERIAL: u8 = 0x4;
pub const SREQ_KBD: u8 = 0x8;

// I/O control bits.
pub const IOC_SERIAL_INT: u8 = 0x2;

/// Which device state the guest has touched since the LCD last looked.
#[derive(Debug, Clone, Copy)]
pub struct DeviceFlags {
    pub display_touched: bool,
    pub contrast_touched: bool,
    pub ann_touched: bool,
    pub baud_touched: bool,
}

impl DeviceFlags {
    /// Everything starts touched so the first frame paints fully.
    pub fn new() -> Self {
        Self {
            display_touched: true,
            contrast_touched: true,
            ann_touched: true,
            baud_touched: true,
        }
    }
}

impl Default for DeviceFlags {
    fn default() -> Self {
        Self::new()
    }
}

fn nibble_of(v: u32, i: u8) -> u8 {
    ((v >> (4 * i)) & 0xF) as u8
}

fn with_nibble(v: u32, i: u8, n: u8) -> u32 {
    (v & !(0xF << (4 * i))) | ((n as u32 & 0xF) << (4 * i))
}

impl Machine {
    /// Read a device register nibble.
    pub(crate) fn io_read(&mut self, off: u8) -> u8 {
        let cpu = &mut self.cpu;
        match off {
            DISP_IO => cpu.disp_io,
            CONTRAST => cpu.contrast_ctrl,
            DISP_TEST => cpu.disp_test,
            CRC..=CRC_END => nibble_of(cpu.crc as u32, off - CRC),
            POWER => cpu.power_status,
            MODE => cpu.mode,
            ANNUNC..=ANNUNC_END => nibble_of(cpu.annunc as u32, off - ANNUNC),
            IR_CTRL => cpu.ir_ctrl,
            BASE_OFF => cpu.base_off,
            LCR => cpu.lcr,
            LBR => cpu.lbr,
            SCRATCH => cpu.scratch,
            BAUD => cpu.baud,
            CARD_CTRL => cpu.card_ctrl,
            CARD_STATUS => cpu.card_status,
            IO_CTRL => cpu.io_ctrl,
            RCS => cpu.rcs,
            TCS => cpu.tcs,
            RBR => {
                // Reading the receive buffer pops its service request.
                cpu.rcs &= !0x1;
                cpu.sreq &= !SREQ_SERIAL;
                cpu.rbr & 0xF
            }
            TBR => cpu.tbr & 0xF,
            SREQ => cpu.sreq,
            BASE_NIBBLE => cpu.base_nibble,
            UNKNOWN..=UNKNOWN_END => nibble_of(cpu.unknown as u32, off - UNKNOWN),
            T1_CTRL => cpu.t1_ctrl,
            T2_CTRL => cpu.t2_ctrl,
            UNKNOWN2..=UNKNOWN2_END => nibble_of(cpu.unknown2 as u32, off - UNKNOWN2),
            DISP_ADDR..=DISP_ADDR_END => nibble_of(cpu.disp_addr, off - DISP_ADDR),
            LINE_OFFSET..=LINE_OFFSET_END => {
                nibble_of(cpu.line_offset as u32, off - LINE_OFFSET)
            }
            LINE_COUNT => cpu.line_count & 0xF,
            MENU_ADDR..=MENU_ADDR_END => nibble_of(cpu.menu_addr, off - MENU_ADDR),
            TIMER1 => cpu.timer1 & 0xF,
            TIMER2 => (cpu.timer2 & 0xF) as u8,
            _ => 0,
        }
    }

    /// Write a device register nibble.
    pub(crate) fn io_write(&mut self, off: u8, val: u8) {
        let val = val & 0xF;
        let cpu = &mut self.cpu;
        match off {
            DISP_IO => {
                cpu.disp_io = val;
                self.device.display_touched = true;
            }
            CONTRAST => {
                cpu.contrast_ctrl = val;
                self.device.contrast_touched = true;
            }
            DISP_TEST => {
                // Bit 0 is the contrast MSB; the rest latches for timing.
                cpu.disp_test = val;
                self.device.contrast_touched = true;
            }
            CRC..=CRC_END => cpu.crc = with_nibble(cpu.crc as u32, off - CRC, val) as u16,
            POWER => cpu.power_ctrl = val,
            MODE => cpu.mode = val,
            ANNUNC..=ANNUNC_END => {
                cpu.annunc = with_nibble(cpu.annunc as u32, off - ANNUNC, val) as u8;
                self.device.ann_touched = true;
            }
            IR_CTRL => cpu.ir_ctrl = val,
            BASE_OFF => cpu.base_off = val,
            LCR => cpu.lcr = val,
            LBR => cpu.lbr = val,
            SCRATCH => cpu.scratch = val,
            BAUD => {
                cpu.baud = val & 0x7;
                self.device.baud_touched = true;
                debug!("baud index set to {}", cpu.baud);
            }
            CARD_CTRL => cpu.card_ctrl = val,
            CARD_STATUS => cpu.card_status = val,
            IO_CTRL => cpu.io_ctrl = val,
            RCS => cpu.rcs = val,
            TCS => cpu.tcs = val,
            RBR => cpu.rbr = val,
            TBR => {
                // Loopback-free transmit: completion is immediate.
                cpu.tbr = val;
                cpu.tcs |= 0x1;
                if cpu.io_ctrl & IOC_SERIAL_INT != 0 {
                    cpu.sreq |= SREQ_SERIAL;
                    cpu.int_pending = true;
                }
            }
            SREQ => cpu.sreq = val,
            BASE_NIBBLE => cpu.base_nibble = val,
            UNKNOWN..=UNKNOWN_END => {
                cpu.unknown = with_nibble(cpu.unknown as u32, off - UNKNOWN, val) as u16;
            }
            T1_CTRL => {
                let was = cpu.t1_ctrl;
                cpu.t1_ctrl = val;
                if val & TCTL_RUN != 0 && was & TCTL_RUN == 0 {
                    cpu.t1_instr = cpu.t1_tick as i32;
                }
            }
            T2_CTRL => {
                let was = cpu.t2_ctrl;
                cpu.t2_ctrl = val;
                if val & TCTL_RUN != 0 && was & TCTL_RUN == 0 {
                    cpu.t2_instr = cpu.t2_tick as i32;
                }
            }
            UNKNOWN2..=UNKNOWN2_END => {
                cpu.unknown2 = with_nibble(cpu.unknown2 as u32, off - UNKNOWN2, val) as u8;
            }
            DISP_ADDR..=DISP_ADDR_END => {
                cpu.disp_addr = with_nibble(cpu.disp_addr, off - DISP_ADDR, val) & 0xFFFFF;
                self.device.display_touched = true;
            }
            LINE_OFFSET..=LINE_OFFSET_END => {
                cpu.line_offset =
                    (with_nibble(cpu.line_offset as u32, off - LINE_OFFSET, val) & 0xFFF) as u16;
                self.device.display_touched = true;
            }
            LINE_COUNT => {
                cpu.line_count = val;
                self.device.display_touched = true;
            }
            MENU_ADDR..=MENU_ADDR_END => {
                cpu.menu_addr = with_nibble(cpu.menu_addr, off - MENU_ADDR, val) & 0xFFFFF;
                self.device.display_touched = true;
            }
            TIMER1 => cpu.timer1 = val,
            TIMER2 => cpu.timer2 = (cpu.timer2 & !0xF) | val as u32,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use crate::saturn::Variant;

    fn machine() -> Machine {
        let mut m = Machine::with_rom(vec![0u8; 0x80000], Variant::Sx).unwrap();
        m.mmu.configure(0x00100);
        m
    }

    #[test]
    fn display_writes_mark_the_lcd_stale() {
        let mut m = machine();
        m.device.display_touched = false;

        m.write_nibble(0x00100 + DISP_IO as u32, 0x8);
        assert!(m.device.display_touched);
        assert_eq!(m.cpu.disp_io, 0x8);

        m.device.display_touched = false;
        for (i, n) in [0xE, 0xD, 0xC, 0xB, 0xA].iter().enumerate() {
            m.write_nibble(0x00100 + DISP_ADDR as u32 + i as u32, *n);
        }
        assert_eq!(m.cpu.disp_addr, 0xABCDE);
        assert!(m.device.display_touched);
    }

    #[test]
    fn crc_register_reads_back_nibblewise() {
        let mut m = machine();
        m.cpu.crc = 0x1234;
        let base = 0x00100 + CRC as u32;
        assert_eq!(m.read_nibble(base), 0x4);
        assert_eq!(m.read_nibble(base + 1), 0x3);
        assert_eq!(m.read_nibble(base + 2), 0x2);
        assert_eq!(m.read_nibble(base + 3), 0x1);

        m.write_nibble(base + 3, 0xF);
        assert_eq!(m.cpu.crc, 0xF234);
    }

    #[test]
    fn rbr_read_pops_the_serial_request() {
        let mut m = machine();
        m.cpu.rbr = 0x9;
        m.cpu.rcs = 0x1;
        m.cpu.sreq = SREQ_SERIAL;
        assert_eq!(m.read_nibble(0x00100 + RBR as u32), 0x9);
        assert_eq!(m.cpu.rcs & 0x1, 0);
        assert_eq!(m.cpu.sreq & SREQ_SERIAL, 0);
    }

    #[test]
    fn timer_control_rearm_resets_instruction_budget() {
        let mut m = machine();
        m.cpu.t1_instr = 3;
        m.write_nibble(0x00100 + T1_CTRL as u32, TCTL_RUN);
        assert_eq!(m.cpu.t1_instr, m.cpu.t1_tick as i32);

        // Re-writing RUN while already running does not reset.
        m.cpu.t1_instr = 3;
        m.write_nibble(0x00100 + T1_CTRL as u32, TCTL_RUN | TCTL_INT);
        assert_eq!(m.cpu.t1_instr, 3);
    }

    #[test]
    fn unassigned_offsets_read_zero_and_drop_writes() {
        let mut m = machine();
        m.write_nibble(0x00100 + 0x05, 0xF);
        assert_eq!(m.read_nibble(0x00100 + 0x05), 0);
    }
}
