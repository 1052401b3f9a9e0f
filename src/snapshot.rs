//! State snapshots.
//!
//! A snapshot is a packed big-endian dump of the CPU, I/O and MMU state;
//! RAM, ROM and port images live in their own files (`romio`).  Three
//! layouts load:
//!
//! - the current 0.4 layout, written by [`save_state`];
//! - the 0.3 layout (magic + older version): per-controller state did not
//!   exist yet, so the six controllers are reconstructed from the old
//!   `devices` / `ram32k` probe values (or the fixed G/GX map);
//! - the pre-0.3 magicless dump: the 0.3 field sequence without magic,
//!   version or timer tick fields, recognized by its exact size.
//!
//! Anything else is `BadSnapshot` and the caller falls back to a fresh
//! init.

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};

use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::saturn::cpu::{Cpu, NR_PSTAT, NR_RSTK, T1_TICK, T2_TICK};
use crate::saturn::keyboard::NR_ROWS;
use crate::saturn::registers::Register;
use crate::saturn::Variant;

pub const MAGIC: u32 = 0x48503438;
pub const VERSION: [u8; 4] = [0, 4, 0, 0];

/// Layout versions older than this use the 0.3 body.
const VERSION_0_4_0: u32 = 0x0004_0000;

/// Exact byte size of the magicless pre-0.3 dump.
const LEGACY_RAW_LEN: usize = 336;

// ── Save ──────────────────────────────────────────────────────

fn write_register<W: Write>(w: &mut W, r: &Register) -> io::Result<()> {
    w.write_all(r)
}

/// Serialize the machine state in the current layout.
pub fn save_state<W: Write>(m: &Machine, w: &mut W) -> io::Result<()> {
    use crate::saturn::cpu::RegId::*;
    let cpu = &m.cpu;
    w.write_u32::<BigEndian>(MAGIC)?;
    w.write_all(&VERSION)?;

    for id in [A, B, C, D] {
        write_register(w, &cpu.reg(id))?;
    }
    w.write_u32::<BigEndian>(cpu.d0)?;
    w.write_u32::<BigEndian>(cpu.d1)?;
    w.write_u8(cpu.p)?;
    w.write_u32::<BigEndian>(cpu.pc)?;
    for id in [R0, R1, R2, R3, R4] {
        write_register(w, &cpu.reg(id))?;
    }
    w.write_all(&cpu.in_reg)?;
    w.write_all(&cpu.out_reg)?;
    w.write_u8(cpu.carry as u8)?;
    for i in 0..NR_PSTAT {
        w.write_u8(cpu.pstat[i] as u8)?;
    }
    w.write_u8(cpu.xm as u8)?;
    w.write_u8(cpu.sb as u8)?;
    w.write_u8(cpu.sr as u8)?;
    w.write_u8(cpu.mp as u8)?;
    w.write_u8(cpu.hexmode)?;
    for i in 0..NR_RSTK {
        w.write_u32::<BigEndian>(cpu.rstk[i])?;
    }
    w.write_i16::<BigEndian>(cpu.rstkp as i16)?;
    for i in 0..NR_ROWS {
        w.write_u16::<BigEndian>(cpu.keybuf.rows[i])?;
    }
    w.write_u8(cpu.intenable as u8)?;
    w.write_u8(cpu.int_pending as u8)?;
    w.write_u8(cpu.kbd_ien as u8)?;

    w.write_u8(cpu.disp_io)?;
    w.write_u8(cpu.contrast_ctrl)?;
    w.write_u8(cpu.disp_test)?;
    w.write_u16::<BigEndian>(cpu.crc)?;
    w.write_u8(cpu.power_status)?;
    w.write_u8(cpu.power_ctrl)?;
    w.write_u8(cpu.mode)?;
    w.write_u8(cpu.annunc)?;
    w.write_u8(cpu.baud)?;
    w.write_u8(cpu.card_ctrl)?;
    w.write_u8(cpu.card_status)?;
    w.write_u8(cpu.io_ctrl)?;
    w.write_u8(cpu.rcs)?;
    w.write_u8(cpu.tcs)?;
    w.write_u8(cpu.rbr)?;
    w.write_u8(cpu.tbr)?;
    w.write_u8(cpu.sreq)?;
    w.write_u8(cpu.ir_ctrl)?;
    w.write_u8(cpu.base_off)?;
    w.write_u8(cpu.lcr)?;
    w.write_u8(cpu.lbr)?;
    w.write_u8(cpu.scratch)?;
    w.write_u8(cpu.base_nibble)?;
    w.write_u32::<BigEndian>(cpu.disp_addr)?;
    w.write_u16::<BigEndian>(cpu.line_offset)?;
    w.write_u8(cpu.line_count)?;
    w.write_u16::<BigEndian>(cpu.unknown)?;
    w.write_u8(cpu.t1_ctrl)?;
    w.write_u8(cpu.t2_ctrl)?;
    w.write_u32::<BigEndian>(cpu.menu_addr)?;
    w.write_u8(cpu.unknown2)?;
    w.write_u8(cpu.timer1)?;
    w.write_u32::<BigEndian>(cpu.timer2)?;
    w.write_i32::<BigEndian>(cpu.t1_instr)?;
    w.write_i32::<BigEndian>(cpu.t2_instr)?;
    w.write_i16::<BigEndian>(cpu.t1_tick)?;
    w.write_i16::<BigEndian>(cpu.t2_tick)?;
    w.write_i32::<BigEndian>(cpu.i_per_s)?;

    w.write_u16::<BigEndian>(m.mmu.bank_switch)?;
    for c in &m.mmu.ctl {
        w.write_u16::<BigEndian>(c.unconfigured as u16)?;
        w.write_u32::<BigEndian>(c.config[0])?;
        w.write_u32::<BigEndian>(c.config[1])?;
    }
    Ok(())
}

// ── Load ──────────────────────────────────────────────────────

fn read_register<R: Read>(r: &mut R) -> io::Result<Register> {
    let mut reg = [0u8; 16];
    r.read_exact(&mut reg)?;
    for n in reg.iter_mut() {
        *n &= 0xF;
    }
    Ok(reg)
}

/// Fields shared by every layout, up to and including `kbd_ien`.
fn read_common<R: Read>(cpu: &mut Cpu, r: &mut R) -> io::Result<()> {
    use crate::saturn::cpu::RegId::*;
    for id in [A, B, C, D] {
        let reg = read_register(r)?;
        cpu.set_reg(id, reg);
    }
    cpu.d0 = r.read_u32::<BigEndian>()? & 0xFFFFF;
    cpu.d1 = r.read_u32::<BigEndian>()? & 0xFFFFF;
    cpu.p = r.read_u8()? & 0xF;
    cpu.pc = r.read_u32::<BigEndian>()? & 0xFFFFF;
    for id in [R0, R1, R2, R3, R4] {
        let reg = read_register(r)?;
        cpu.set_reg(id, reg);
    }
    r.read_exact(&mut cpu.in_reg)?;
    r.read_exact(&mut cpu.out_reg)?;
    cpu.carry = r.read_u8()? != 0;
    for i in 0..NR_PSTAT {
        cpu.pstat[i] = r.read_u8()? != 0;
    }
    cpu.xm = r.read_u8()? != 0;
    cpu.sb = r.read_u8()? != 0;
    cpu.sr = r.read_u8()? != 0;
    cpu.mp = r.read_u8()? != 0;
    cpu.hexmode = r.read_u8()?;
    for i in 0..NR_RSTK {
        cpu.rstk[i] = r.read_u32::<BigEndian>()? & 0xFFFFF;
    }
    cpu.rstkp = (r.read_i16::<BigEndian>()?).clamp(-1, 7) as i8;
    for i in 0..NR_ROWS {
        cpu.keybuf.rows[i] = r.read_u16::<BigEndian>()?;
    }
    cpu.intenable = r.read_u8()? != 0;
    cpu.int_pending = r.read_u8()? != 0;
    cpu.kbd_ien = r.read_u8()? != 0;
    Ok(())
}

/// The device register block and timers, shared by 0.3 and 0.4.
fn read_io_block<R: Read>(cpu: &mut Cpu, r: &mut R) -> io::Result<()> {
    cpu.disp_io = r.read_u8()?;
    cpu.contrast_ctrl = r.read_u8()?;
    cpu.disp_test = r.read_u8()?;
    cpu.crc = r.read_u16::<BigEndian>()?;
    cpu.power_status = r.read_u8()?;
    cpu.power_ctrl = r.read_u8()?;
    cpu.mode = r.read_u8()?;
    cpu.annunc = r.read_u8()?;
    cpu.baud = r.read_u8()?;
    cpu.card_ctrl = r.read_u8()?;
    cpu.card_status = r.read_u8()?;
    cpu.io_ctrl = r.read_u8()?;
    cpu.rcs = r.read_u8()?;
    cpu.tcs = r.read_u8()?;
    cpu.rbr = r.read_u8()?;
    cpu.tbr = r.read_u8()?;
    cpu.sreq = r.read_u8()?;
    cpu.ir_ctrl = r.read_u8()?;
    cpu.base_off = r.read_u8()?;
    cpu.lcr = r.read_u8()?;
    cpu.lbr = r.read_u8()?;
    cpu.scratch = r.read_u8()?;
    cpu.base_nibble = r.read_u8()?;
    cpu.disp_addr = r.read_u32::<BigEndian>()? & 0xFFFFF;
    cpu.line_offset = r.read_u16::<BigEndian>()? & 0xFFF;
    cpu.line_count = r.read_u8()?;
    cpu.unknown = r.read_u16::<BigEndian>()?;
    cpu.t1_ctrl = r.read_u8()?;
    cpu.t2_ctrl = r.read_u8()?;
    cpu.menu_addr = r.read_u32::<BigEndian>()? & 0xFFFFF;
    cpu.unknown2 = r.read_u8()?;
    cpu.timer1 = r.read_u8()? & 0xF;
    cpu.timer2 = r.read_u32::<BigEndian>()?;
    cpu.t1_instr = r.read_i32::<BigEndian>()?;
    cpu.t2_instr = r.read_i32::<BigEndian>()?;
    Ok(())
}

fn load_0_4_0(m: &mut Machine, r: &mut impl Read) -> io::Result<()> {
    read_common(&mut m.cpu, r)?;
    read_io_block(&mut m.cpu, r)?;
    m.cpu.t1_tick = r.read_i16::<BigEndian>()?;
    m.cpu.t2_tick = r.read_i16::<BigEndian>()?;
    m.cpu.i_per_s = r.read_i32::<BigEndian>()?;
    m.mmu.bank_switch = r.read_u16::<BigEndian>()?;
    for c in m.mmu.ctl.iter_mut() {
        c.unconfigured = (r.read_u16::<BigEndian>()?).min(2) as u8;
        c.config[0] = r.read_u32::<BigEndian>()? & 0xFFFFF;
        c.config[1] = r.read_u32::<BigEndian>()? & 0xFFFFF;
    }
    Ok(())
}

/// The 0.3 body: eight flat configs plus the RAM/devices probe results
/// instead of per-controller state.  `with_ticks` is false for the
/// magicless pre-0.3 dump, which ends at `t2_instr`.
fn load_0_3_0(m: &mut Machine, r: &mut impl Read, with_ticks: bool) -> io::Result<()> {
    read_common(&mut m.cpu, r)?;
    for _ in 0..8 {
        let _config = r.read_u32::<BigEndian>()?;
    }
    let _daisy_state = r.read_u16::<BigEndian>()?; // ignored on load
    let ram32k = r.read_u32::<BigEndian>()?;
    let devices = r.read_u32::<BigEndian>()?;
    read_io_block(&mut m.cpu, r)?;
    if with_ticks {
        m.cpu.t1_tick = r.read_i16::<BigEndian>()?;
        m.cpu.t2_tick = r.read_i16::<BigEndian>()?;
        m.cpu.i_per_s = r.read_i32::<BigEndian>()?;
    } else {
        m.cpu.t1_tick = T1_TICK;
        m.cpu.t2_tick = T2_TICK;
        m.cpu.i_per_s = 0;
    }

    m.mmu.bank_switch = 0;
    match m.variant {
        Variant::Gx => m.mmu.preset_gx(),
        Variant::Sx => m.mmu.preset_sx_legacy(devices, ram32k),
    }
    Ok(())
}

/// Parse a snapshot in any accepted layout.
pub fn load_bytes(m: &mut Machine, data: &[u8]) -> Result<()> {
    let magic = data
        .get(..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));

    if magic == Some(MAGIC) {
        let mut r = Cursor::new(&data[4..]);
        let mut version = [0u8; 4];
        r.read_exact(&mut version).map_err(|_| Error::BadSnapshot)?;
        let v = u32::from_be_bytes(version);
        let result = if v < VERSION_0_4_0 {
            info!("snapshot version {version:?}: converting 0.3 layout");
            load_0_3_0(m, &mut r, true)
        } else {
            load_0_4_0(m, &mut r)
        };
        result.map_err(|_| Error::BadSnapshot)
    } else if data.len() == LEGACY_RAW_LEN {
        info!("magicless snapshot: converting pre-0.3 layout");
        let mut r = Cursor::new(data);
        load_0_3_0(m, &mut r, false).map_err(|_| Error::BadSnapshot)
    } else {
        Err(Error::BadSnapshot)
    }
}

// ── File surface ──────────────────────────────────────────────

pub fn save_file(m: &Machine, path: &Path) -> Result<()> {
    let mut bytes = Vec::new();
    save_state(m, &mut bytes).map_err(|_| Error::IoWrite(path.to_path_buf()))?;
    fs::write(path, bytes).map_err(|_| Error::IoWrite(path.to_path_buf()))
}

pub fn load_file(m: &mut Machine, path: &Path) -> Result<()> {
    let data = fs::read(path).map_err(|_| Error::IoRead(path.to_path_buf()))?;
    load_bytes(m, &data).inspect_err(|_| {
        warn!("{}: unrecognized snapshot layout", path.display());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saturn::cpu::RegId;
    use byteorder::WriteBytesExt;

    fn machine() -> Machine {
        Machine::with_rom(vec![0u8; 0x80000], Variant::Sx).unwrap()
    }

    fn scrambled() -> Machine {
        let mut m = machine();
        let mut a = [0u8; 16];
        for (i, n) in a.iter_mut().enumerate() {
            *n = (i & 0xF) as u8;
        }
        m.cpu.set_reg(RegId::A, a);
        m.cpu.set_reg(RegId::R3, a);
        m.cpu.d0 = 0x12345;
        m.cpu.d1 = 0xFEDCB;
        m.cpu.p = 7;
        m.cpu.pc = 0x0ABCD;
        m.cpu.carry = true;
        m.cpu.pstat[3] = true;
        m.cpu.pstat[12] = true;
        m.cpu.sb = true;
        m.cpu.hexmode = crate::saturn::registers::DEC;
        m.cpu.push_rstk(0x11111);
        m.cpu.push_rstk(0x22222);
        m.cpu.keybuf.rows[4] = 0x8001;
        m.cpu.int_pending = true;
        m.cpu.disp_io = 0xB;
        m.cpu.crc = 0xBEEF;
        m.cpu.annunc = 0x25;
        m.cpu.disp_addr = 0x70100;
        m.cpu.line_offset = 0x002;
        m.cpu.line_count = 0x3F;
        m.cpu.menu_addr = 0x70440;
        m.cpu.timer1 = 0x9;
        m.cpu.timer2 = 0xDEADBEEF;
        m.cpu.t1_instr = 1234;
        m.cpu.t2_instr = -5;
        m.cpu.unknown = 0x1234;
        m.cpu.unknown2 = 0x56;
        m.cpu.i_per_s = 42;
        m.mmu.configure(0x00100);
        m.mmu.configure(0xF0000);
        m.mmu.configure(0x70000);
        m.mmu.bank_switch = 1;
        m
    }

    #[test]
    fn roundtrip_restores_cpu_and_mmu_state() {
        let m = scrambled();
        let mut bytes = Vec::new();
        save_state(&m, &mut bytes).unwrap();

        let mut fresh = machine();
        fresh.cpu.reset();
        load_bytes(&mut fresh, &bytes).unwrap();

        assert!(fresh.cpu == m.cpu, "CPU state survives the roundtrip");
        assert_eq!(fresh.mmu, m.mmu);
    }

    #[test]
    fn saved_size_is_stable() {
        let m = scrambled();
        let mut bytes = Vec::new();
        save_state(&m, &mut bytes).unwrap();
        // 8 header + 302 body + 2 bank + 60 controllers.
        assert_eq!(bytes.len(), 372);
    }

    #[test]
    fn garbage_is_bad_snapshot() {
        let mut m = machine();
        assert!(matches!(
            load_bytes(&mut m, b"not a snapshot"),
            Err(Error::BadSnapshot)
        ));
    }

    /// Build a magicless pre-0.3 dump by hand.
    fn legacy_raw(ram32k: u32, devices: u32) -> Vec<u8> {
        let mut w = Vec::new();
        for _ in 0..4 {
            w.extend_from_slice(&[1u8; 16]); // A, B, C, D
        }
        w.write_u32::<BigEndian>(0x00010).unwrap(); // d0
        w.write_u32::<BigEndian>(0x00020).unwrap(); // d1
        w.write_u8(3).unwrap(); // P
        w.write_u32::<BigEndian>(0x00123).unwrap(); // PC
        for _ in 0..5 {
            w.extend_from_slice(&[2u8; 16]); // R0..R4
        }
        w.extend_from_slice(&[0u8; 4]); // IN
        w.extend_from_slice(&[0u8; 3]); // OUT
        w.write_u8(1).unwrap(); // CARRY
        w.extend_from_slice(&[0u8; NR_PSTAT]);
        w.extend_from_slice(&[0u8; 4]); // XM SB SR MP
        w.write_u8(16).unwrap(); // hexmode
        for _ in 0..NR_RSTK {
            w.write_u32::<BigEndian>(0).unwrap();
        }
        w.write_i16::<BigEndian>(-1).unwrap(); // rstkp
        for _ in 0..NR_ROWS {
            w.write_u16::<BigEndian>(0).unwrap();
        }
        w.extend_from_slice(&[1, 0, 1]); // intenable, int_pending, kbd_ien
        for _ in 0..8 {
            w.write_u32::<BigEndian>(0).unwrap(); // old configs
        }
        w.write_u16::<BigEndian>(0x5A).unwrap(); // daisy_state (ignored)
        w.write_u32::<BigEndian>(ram32k).unwrap();
        w.write_u32::<BigEndian>(devices).unwrap();
        w.extend_from_slice(&[0u8; 3]); // disp_io, contrast, disp_test
        w.write_u16::<BigEndian>(0).unwrap(); // crc
        w.extend_from_slice(&[0u8; 19]); // power..base_nibble
        w.write_u32::<BigEndian>(0).unwrap(); // disp_addr
        w.write_u16::<BigEndian>(0).unwrap(); // line_offset
        w.write_u8(0).unwrap(); // line_count
        w.write_u16::<BigEndian>(0).unwrap(); // unknown
        w.write_u8(0).unwrap(); // t1_ctrl
        w.write_u8(0).unwrap(); // t2_ctrl
        w.write_u32::<BigEndian>(0).unwrap(); // menu_addr
        w.write_u8(0).unwrap(); // unknown2
        w.write_u8(0).unwrap(); // timer1
        w.write_u32::<BigEndian>(0x2000).unwrap(); // timer2
        w.write_i32::<BigEndian>(0).unwrap(); // t1_instr
        w.write_i32::<BigEndian>(0).unwrap(); // t2_instr
        w
    }

    #[test]
    fn magicless_legacy_maps_controllers() {
        let data = legacy_raw(0x70000, 0x100);
        assert_eq!(data.len(), LEGACY_RAW_LEN);

        let mut m = machine();
        load_bytes(&mut m, &data).unwrap();

        assert_eq!(m.cpu.pc, 0x00123);
        assert_eq!(m.cpu.p, 3);
        assert!(m.cpu.carry);
        assert_eq!(m.cpu.t1_tick, T1_TICK, "ticks reset to defaults");
        assert_eq!(m.cpu.t2_tick, T2_TICK);

        // devices == 0x100 -> controller 0 configured at the MMIO base.
        assert_eq!(m.mmu.ctl[0].unconfigured, 0);
        assert_eq!(m.mmu.ctl[0].config[0], 0x100);
        // ram32k == 0x70000 -> controller 1 = (0, 0x70000, 0xF0000).
        assert_eq!(m.mmu.ctl[1].unconfigured, 0);
        assert_eq!(m.mmu.ctl[1].config, [0x70000, 0xF0000]);
        // ROM mapping for the S/SX legacy map.
        assert_eq!(m.mmu.ctl[5].config, [0x00000, 0x80000]);
    }

    #[test]
    fn unprobed_legacy_ram_stays_unconfigured() {
        let data = legacy_raw(0xDEAD0, 0);
        let mut m = machine();
        load_bytes(&mut m, &data).unwrap();
        assert_eq!(m.mmu.ctl[0].unconfigured, 1);
        assert_eq!(m.mmu.ctl[1].unconfigured, 2);
    }
}
