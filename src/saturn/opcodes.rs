//! Saturn instruction decode and execute.
//!
//! A hand-written decision tree over the nibble stream at PC.  Decoding
//! reads exactly the nibbles the current opcode owns — never past the end
//! of the instruction — so jumps into partially mapped memory behave like
//! the hardware.  Relative branch offsets are signed and counted from the
//! first offset nibble, except the subroutine forms which count from the
//! return address.
//!
//! Unassigned encodings bump a counter, log a warning and retire as a
//! one-nibble NOP so a buggy ROM cannot wedge the interpreter.

use log::warn;

use super::cpu::{Ptr, RegId};
use super::cpu::RegId::{A, B, C, D};
use super::registers::{self as regs, Field, DEC, HEX};
use crate::machine::Machine;

fn sext(v: u32, bits: u32) -> i32 {
    if v & (1 << (bits - 1)) != 0 {
        v as i32 - (1 << bits)
    } else {
        v as i32
    }
}

fn rel(base: u32, off: i32) -> u32 {
    ((base as i64 + off as i64) & 0xFFFFF) as u32
}

impl Machine {
    /// Execute one instruction, taking a pending interrupt first.  Vector
    /// entry consumes the step; the handler starts on the next one.
    pub fn step_instruction(&mut self) {
        if self.cpu.intenable && self.cpu.int_pending {
            self.cpu.interrupt();
            return;
        }
        match self.fetch(0) {
            0x0 => self.op0(),
            0x1 => self.op1(),
            0x2 => {
                self.cpu.p = self.fetch(1);
                self.advance(2);
            }
            0x3 => self.op_load_c(),
            0x4 => self.op_branch_carry(true),
            0x5 => self.op_branch_carry(false),
            0x6 => self.op_goto(),
            0x7 => self.op_gosub(),
            0x8 => self.op8(),
            0x9 => self.op_test_field(),
            0xA => self.op_arith_field(),
            0xB => self.op_arith_field_2(),
            0xC => {
                let n = self.fetch(1);
                self.alu_add_group(Field::A, n);
                self.advance(2);
            }
            0xD => {
                let n = self.fetch(1);
                self.alu_move_group(Field::A, n);
                self.advance(2);
            }
            0xE => {
                let n = self.fetch(1);
                self.alu_sub_group(Field::A, n);
                self.advance(2);
            }
            _ => {
                let n = self.fetch(1);
                self.alu_shift_group(Field::A, n);
                self.advance(2);
            }
        }
    }

    fn fetch(&mut self, i: u32) -> u8 {
        let pc = self.cpu.pc;
        self.read_nibble(pc.wrapping_add(i) & 0xFFFFF)
    }

    fn advance(&mut self, n: u32) {
        self.cpu.pc = (self.cpu.pc + n) & 0xFFFFF;
    }

    fn invalid(&mut self) {
        self.cpu.invalid_ops += 1;
        warn!(
            "unassigned opcode at {:#07x}, retiring as 1-nibble NOP",
            self.cpu.pc
        );
        self.advance(1);
    }

    fn ret(&mut self) {
        self.cpu.pc = self.cpu.pop_rstk();
    }

    /// Conditional epilogue shared by every test instruction: carry takes
    /// the result; a taken test follows the two-nibble GOYES offset
    /// (offset 0 = RTNYES).
    fn go_yes(&mut self, taken: bool, oplen: u32) {
        self.cpu.carry = taken;
        if taken {
            let base = (self.cpu.pc + oplen) & 0xFFFFF;
            let o = self.read_nibbles(base, 2);
            if o == 0 {
                self.ret();
            } else {
                self.cpu.pc = rel(base, sext(o, 8));
            }
        } else {
            self.advance(oplen + 2);
        }
    }

    // ── Memory transfer helpers ───────────────────────────────

    fn dat_store(&mut self, d: Ptr, r: RegId, f: Field) {
        let (lo, hi) = f.bounds(self.cpu.p);
        let base = self.cpu.ptr(d);
        let reg = self.cpu.reg(r);
        for i in lo..=hi {
            self.write_nibble(base.wrapping_add((i - lo) as u32), reg[i]);
        }
    }

    fn dat_recall(&mut self, r: RegId, d: Ptr, f: Field) {
        let (lo, hi) = f.bounds(self.cpu.p);
        let base = self.cpu.ptr(d);
        let mut reg = self.cpu.reg(r);
        for i in lo..=hi {
            reg[i] = self.read_nibble_crc(base.wrapping_add((i - lo) as u32));
        }
        self.cpu.set_reg(r, reg);
    }

    fn dat_store_n(&mut self, d: Ptr, r: RegId, n: usize) {
        let base = self.cpu.ptr(d);
        let reg = self.cpu.reg(r);
        for (i, &nib) in reg.iter().enumerate().take(n) {
            self.write_nibble(base.wrapping_add(i as u32), nib);
        }
    }

    fn dat_recall_n(&mut self, r: RegId, d: Ptr, n: usize) {
        let base = self.cpu.ptr(d);
        let mut reg = self.cpu.reg(r);
        for (i, slot) in reg.iter_mut().enumerate().take(n) {
            *slot = self.read_nibble_crc(base.wrapping_add(i as u32));
        }
        self.cpu.set_reg(r, reg);
    }

    // ── 0x: returns, status, P, logic ─────────────────────────

    fn op0(&mut self) {
        match self.fetch(1) {
            0x0 => {
                self.cpu.xm = true;
                self.ret();
            }
            0x1 => self.ret(),
            0x2 => {
                self.cpu.carry = true;
                self.ret();
            }
            0x3 => {
                self.cpu.carry = false;
                self.ret();
            }
            0x4 => {
                self.cpu.hexmode = HEX;
                self.advance(2);
            }
            0x5 => {
                self.cpu.hexmode = DEC;
                self.advance(2);
            }
            0x6 => {
                let addr = regs::register_to_address(self.cpu.reg(C), 5);
                self.cpu.push_rstk(addr);
                self.advance(2);
            }
            0x7 => {
                let addr = self.cpu.pop_rstk();
                let c = regs::address_to_register(addr, self.cpu.reg(C), 5);
                self.cpu.set_reg(C, c);
                self.advance(2);
            }
            0x8 => {
                self.cpu.clear_status();
                self.advance(2);
            }
            0x9 => {
                self.cpu.status_to_register(C);
                self.advance(2);
            }
            0xA => {
                self.cpu.register_to_status(C);
                self.advance(2);
            }
            0xB => {
                self.cpu.swap_register_status(C);
                self.advance(2);
            }
            0xC => {
                self.cpu.p = (self.cpu.p + 1) & 0xF;
                self.cpu.carry = self.cpu.p == 0;
                self.advance(2);
            }
            0xD => {
                self.cpu.p = self.cpu.p.wrapping_sub(1) & 0xF;
                self.cpu.carry = self.cpu.p == 0xF;
                self.advance(2);
            }
            0xE => self.op0e(),
            _ => {
                // RTI
                self.cpu.int_pending = false;
                self.cpu.intenable = true;
                self.ret();
            }
        }
    }

    fn op0e(&mut self) {
        let f = Field::from_ext_code(self.fetch(2));
        let o = self.fetch(3);
        match o {
            0x0 => self.cpu.op_and(A, A, B, f),
            0x1 => self.cpu.op_and(B, B, C, f),
            0x2 => self.cpu.op_and(C, C, A, f),
            0x3 => self.cpu.op_and(D, D, C, f),
            0x4 => self.cpu.op_and(B, B, A, f),
            0x5 => self.cpu.op_and(C, C, B, f),
            0x6 => self.cpu.op_and(A, A, C, f),
            0x7 => self.cpu.op_and(C, C, D, f),
            0x8 => self.cpu.op_or(A, A, B, f),
            0x9 => self.cpu.op_or(B, B, C, f),
            0xA => self.cpu.op_or(C, C, A, f),
            0xB => self.cpu.op_or(D, D, C, f),
            0xC => self.cpu.op_or(B, B, A, f),
            0xD => self.cpu.op_or(C, C, B, f),
            0xE => self.cpu.op_or(A, A, C, f),
            _ => self.cpu.op_or(C, C, D, f),
        }
        self.advance(4);
    }

    // ── 1x: scratch registers, pointers, DAT transfers ────────

    fn op1(&mut self) {
        match self.fetch(1) {
            0x0 => {
                let n = self.fetch(2);
                if n & 0x7 > 4 {
                    return self.invalid();
                }
                let (src, rn) = if n < 8 {
                    (A, RegId::scratch(n))
                } else {
                    (C, RegId::scratch(n - 8))
                };
                self.cpu.op_copy(rn, src, Field::W);
                self.advance(3);
            }
            0x1 => {
                let n = self.fetch(2);
                if n & 0x7 > 4 {
                    return self.invalid();
                }
                let (dst, rn) = if n < 8 {
                    (A, RegId::scratch(n))
                } else {
                    (C, RegId::scratch(n - 8))
                };
                self.cpu.op_copy(dst, rn, Field::W);
                self.advance(3);
            }
            0x2 => {
                let n = self.fetch(2);
                if n & 0x7 > 4 {
                    return self.invalid();
                }
                let (r, rn) = if n < 8 {
                    (A, RegId::scratch(n))
                } else {
                    (C, RegId::scratch(n - 8))
                };
                self.cpu.op_exchange(r, rn, Field::W);
                self.advance(3);
            }
            0x3 => self.op13(),
            0x4 => self.op14(),
            0x5 => self.op15(),
            0x6 => {
                let n = self.fetch(2) as i32;
                self.cpu.add_ptr(Ptr::D0, n + 1);
                self.advance(3);
            }
            0x7 => {
                let n = self.fetch(2) as i32;
                self.cpu.add_ptr(Ptr::D1, n + 1);
                self.advance(3);
            }
            0x8 => {
                let n = self.fetch(2) as i32;
                self.cpu.add_ptr(Ptr::D0, -(n + 1));
                self.advance(3);
            }
            0x9 => self.load_ptr(Ptr::D0, 2),
            0xA => self.load_ptr(Ptr::D0, 4),
            0xB => self.load_ptr(Ptr::D0, 5),
            0xC => {
                let n = self.fetch(2) as i32;
                self.cpu.add_ptr(Ptr::D1, -(n + 1));
                self.advance(3);
            }
            0xD => self.load_ptr(Ptr::D1, 2),
            0xE => self.load_ptr(Ptr::D1, 4),
            _ => self.load_ptr(Ptr::D1, 5),
        }
    }

    /// `D0=(n)` forms: replace the low `n` nibbles of a data pointer with
    /// an immediate.
    fn load_ptr(&mut self, d: Ptr, n: u32) {
        let pc = self.cpu.pc;
        let imm = self.read_nibbles(pc + 2, n);
        let keep = !(((1u32 << (4 * n)) - 1)) & 0xFFFFF;
        let v = (self.cpu.ptr(d) & keep) | imm;
        self.cpu.set_ptr(d, v);
        self.advance(2 + n);
    }

    fn op13(&mut self) {
        let n = self.fetch(2);
        let r = if n & 0x4 == 0 { A } else { C };
        let d = if n & 0x1 == 0 { Ptr::D0 } else { Ptr::D1 };
        let short = n & 0x8 != 0;
        let width = if short { 4 } else { 5 };
        let keep = if short { 0xF0000 } else { 0 };
        if n & 0x2 == 0 {
            // D0=A family
            let v = regs::register_to_address(self.cpu.reg(r), width);
            self.cpu.set_ptr(d, (self.cpu.ptr(d) & keep) | v);
        } else {
            // AD0EX family
            let old = self.cpu.ptr(d);
            let v = regs::register_to_address(self.cpu.reg(r), width);
            let reg = regs::address_to_register(old, self.cpu.reg(r), width);
            self.cpu.set_reg(r, reg);
            self.cpu.set_ptr(d, (old & keep) | v);
        }
        self.advance(3);
    }

    fn op14(&mut self) {
        let n = self.fetch(2);
        let f = if n < 8 { Field::A } else { Field::B };
        self.dat_op(n & 0x7, f);
        self.advance(3);
    }

    fn op15(&mut self) {
        let o = self.fetch(2);
        let m = self.fetch(3);
        if o < 8 {
            let f = Field::from_ext_code(m);
            self.dat_op(o, f);
        } else {
            let r = if o & 0x4 == 0 { A } else { C };
            let d = if o & 0x1 == 0 { Ptr::D0 } else { Ptr::D1 };
            let n = m as usize + 1;
            if o & 0x2 == 0 {
                self.dat_store_n(d, r, n);
            } else {
                self.dat_recall_n(r, d, n);
            }
        }
        self.advance(4);
    }

    fn dat_op(&mut self, o: u8, f: Field) {
        let r = if o & 0x4 == 0 { A } else { C };
        let d = if o & 0x1 == 0 { Ptr::D0 } else { Ptr::D1 };
        if o & 0x2 == 0 {
            self.dat_store(d, r, f);
        } else {
            self.dat_recall(r, d, f);
        }
    }

    // ── 3x: load constant ─────────────────────────────────────

    fn op_load_c(&mut self) {
        let k = self.fetch(1) as u32;
        let pc = self.cpu.pc;
        let mut nibs = [0u8; 16];
        for i in 0..=k {
            nibs[i as usize] = self.read_nibble(pc.wrapping_add(2 + i) & 0xFFFFF);
        }
        let c = regs::load_constant(self.cpu.reg(C), self.cpu.p, &nibs[..=k as usize]);
        self.cpu.set_reg(C, c);
        self.advance(2 + k + 1);
    }

    // ── 4x/5x/6x/7x: branches ─────────────────────────────────

    fn op_branch_carry(&mut self, on_carry: bool) {
        if self.cpu.carry == on_carry {
            let base = (self.cpu.pc + 1) & 0xFFFFF;
            let o = self.read_nibbles(base, 2);
            if o == 0 {
                self.ret(); // RTNC / RTNNC
            } else {
                self.cpu.pc = rel(base, sext(o, 8));
            }
        } else {
            self.advance(3);
        }
    }

    fn op_goto(&mut self) {
        let base = (self.cpu.pc + 1) & 0xFFFFF;
        let o = self.read_nibbles(base, 3);
        self.cpu.pc = rel(base, sext(o, 12));
    }

    fn op_gosub(&mut self) {
        let pc = self.cpu.pc;
        let o = self.read_nibbles(pc + 1, 3);
        let ret_addr = (pc + 4) & 0xFFFFF;
        self.cpu.push_rstk(ret_addr);
        self.cpu.pc = rel(ret_addr, sext(o, 12));
    }

    // ── 8x: specials, tests, long jumps ───────────────────────

    fn op8(&mut self) {
        match self.fetch(1) {
            0x0 => self.op80(),
            0x1 => self.op81(),
            0x2 => {
                let mask = self.fetch(2);
                self.cpu.clear_hardware_stat(mask);
                self.advance(3);
            }
            0x3 => {
                let mask = self.fetch(2);
                let t = self.cpu.is_zero_hardware_stat(mask);
                self.go_yes(t, 3);
            }
            0x4 => {
                let n = self.fetch(2) as usize;
                self.cpu.pstat[n] = false;
                self.advance(3);
            }
            0x5 => {
                let n = self.fetch(2) as usize;
                self.cpu.pstat[n] = true;
                self.advance(3);
            }
            0x6 => {
                let n = self.fetch(2) as usize;
                let t = !self.cpu.pstat[n];
                self.go_yes(t, 3);
            }
            0x7 => {
                let n = self.fetch(2) as usize;
                let t = self.cpu.pstat[n];
                self.go_yes(t, 3);
            }
            0x8 => {
                let n = self.fetch(2);
                let t = self.cpu.p != n;
                self.go_yes(t, 3);
            }
            0x9 => {
                let n = self.fetch(2);
                let t = self.cpu.p == n;
                self.go_yes(t, 3);
            }
            0xA => {
                let n = self.fetch(2);
                let t = self.test_eq_group(Field::A, n);
                self.go_yes(t, 3);
            }
            0xB => {
                let n = self.fetch(2);
                let t = self.test_ord_group(Field::A, n);
                self.go_yes(t, 3);
            }
            0xC => {
                let base = (self.cpu.pc + 2) & 0xFFFFF;
                let o = self.read_nibbles(base, 4);
                self.cpu.pc = rel(base, sext(o, 16));
            }
            0xD => {
                let pc = self.cpu.pc;
                self.cpu.pc = self.read_nibbles(pc + 2, 5);
            }
            0xE => {
                let pc = self.cpu.pc;
                let o = self.read_nibbles(pc + 2, 4);
                let ret_addr = (pc + 6) & 0xFFFFF;
                self.cpu.push_rstk(ret_addr);
                self.cpu.pc = rel(ret_addr, sext(o, 16));
            }
            _ => {
                let pc = self.cpu.pc;
                let target = self.read_nibbles(pc + 2, 5);
                self.cpu.push_rstk((pc + 7) & 0xFFFFF);
                self.cpu.pc = target;
            }
        }
    }

    fn op80(&mut self) {
        match self.fetch(2) {
            0x0 => {
                // OUT=CS
                self.cpu.out_reg[0] = self.cpu.reg(C)[0];
                self.advance(3);
            }
            0x1 => {
                let c = self.cpu.reg(C);
                self.cpu.out_reg = [c[0], c[1], c[2]];
                self.advance(3);
            }
            0x2 => {
                self.cpu.do_in();
                let inr = self.cpu.in_reg;
                let mut a = self.cpu.reg(A);
                a[..4].copy_from_slice(&inr);
                self.cpu.set_reg(A, a);
                self.advance(3);
            }
            0x3 => {
                self.cpu.do_in();
                let inr = self.cpu.in_reg;
                let mut c = self.cpu.reg(C);
                c[..4].copy_from_slice(&inr);
                self.cpu.set_reg(C, c);
                self.advance(3);
            }
            0x4 => {
                self.mmu.unconfigure();
                self.advance(3);
            }
            0x5 => {
                let v = regs::register_to_address(self.cpu.reg(C), 5);
                self.mmu.configure(v);
                self.advance(3);
            }
            0x6 => {
                self.do_c_id();
                self.advance(3);
            }
            0x7 => {
                self.cpu.shutdown = true;
                self.advance(3);
            }
            0x8 => self.op808(),
            0x9 => {
                // C+P+1
                self.cpu.op_add_const(C, Field::A, self.cpu.p + 1);
                self.advance(3);
            }
            0xA => {
                self.mmu.guest_reset();
                self.advance(3);
            }
            0xB => self.advance(3), // BUSCC
            0xC => {
                let n = self.fetch(3) as usize;
                let mut c = self.cpu.reg(C);
                c[n] = self.cpu.p;
                self.cpu.set_reg(C, c);
                self.advance(4);
            }
            0xD => {
                let n = self.fetch(3) as usize;
                self.cpu.p = self.cpu.reg(C)[n];
                self.advance(4);
            }
            0xE => {
                // SREQ?
                let sreq = self.cpu.sreq;
                let mut c = self.cpu.reg(C);
                c[0] = sreq & 0xF;
                self.cpu.set_reg(C, c);
                self.cpu.carry = sreq != 0;
                self.advance(3);
            }
            _ => {
                // CPEX n
                let n = self.fetch(3) as usize;
                let mut c = self.cpu.reg(C);
                std::mem::swap(&mut c[n], &mut self.cpu.p);
                self.cpu.set_reg(C, c);
                self.advance(4);
            }
        }
    }

    fn op808(&mut self) {
        match self.fetch(3) {
            0x0 => {
                self.cpu.intenable = true;
                self.advance(4);
            }
            0x1 => {
                if self.fetch(4) != 0 {
                    return self.invalid();
                }
                // RSI: reopen the keyboard gate and re-evaluate held keys.
                self.cpu.kbd_ien = true;
                if self.cpu.keybuf.any_pressed() {
                    self.cpu.kbd_interrupt();
                }
                self.advance(5);
            }
            0x2 => {
                // LA(m): immediate into A at P.
                let k = self.fetch(4) as u32;
                let pc = self.cpu.pc;
                let mut nibs = [0u8; 16];
                for i in 0..=k {
                    nibs[i as usize] = self.read_nibble(pc.wrapping_add(5 + i) & 0xFFFFF);
                }
                let a = regs::load_constant(self.cpu.reg(A), self.cpu.p, &nibs[..=k as usize]);
                self.cpu.set_reg(A, a);
                self.advance(5 + k + 1);
            }
            0x3 => self.advance(4), // BUSCB
            0x4 => {
                let n = self.fetch(4) as usize;
                self.cpu.set_reg_bit(A, n, false);
                self.advance(5);
            }
            0x5 => {
                let n = self.fetch(4) as usize;
                self.cpu.set_reg_bit(A, n, true);
                self.advance(5);
            }
            0x6 => {
                let n = self.fetch(4) as usize;
                let t = !self.cpu.reg_bit(A, n);
                self.go_yes(t, 5);
            }
            0x7 => {
                let n = self.fetch(4) as usize;
                let t = self.cpu.reg_bit(A, n);
                self.go_yes(t, 5);
            }
            0x8 => {
                let n = self.fetch(4) as usize;
                self.cpu.set_reg_bit(C, n, false);
                self.advance(5);
            }
            0x9 => {
                let n = self.fetch(4) as usize;
                self.cpu.set_reg_bit(C, n, true);
                self.advance(5);
            }
            0xA => {
                let n = self.fetch(4) as usize;
                let t = !self.cpu.reg_bit(C, n);
                self.go_yes(t, 5);
            }
            0xB => {
                let n = self.fetch(4) as usize;
                let t = self.cpu.reg_bit(C, n);
                self.go_yes(t, 5);
            }
            0xC => {
                // PC=(A)
                let addr = regs::register_to_address(self.cpu.reg(A), 5);
                self.cpu.pc = self.read_nibbles(addr, 5);
            }
            0xD => self.advance(4), // BUSCD
            0xE => {
                let addr = regs::register_to_address(self.cpu.reg(C), 5);
                self.cpu.pc = self.read_nibbles(addr, 5);
            }
            _ => {
                self.cpu.intenable = false;
                self.advance(4);
            }
        }
    }

    fn op81(&mut self) {
        let n = self.fetch(2);
        match n {
            0x0..=0x3 => {
                self.cpu
                    .op_shift_left_circular([A, B, C, D][n as usize], Field::W);
                self.advance(3);
            }
            0x4..=0x7 => {
                self.cpu
                    .op_shift_right_circular([A, B, C, D][(n - 4) as usize], Field::W);
                self.advance(3);
            }
            0x8 => {
                // r = r +/- (n+1), any field.
                let f = Field::from_ext_code(self.fetch(3));
                let m = self.fetch(4);
                let k = self.fetch(5) + 1;
                let r = [A, B, C, D][(m & 0x3) as usize];
                if m & 0x8 == 0 {
                    self.cpu.op_add_const(r, f, k);
                } else {
                    self.cpu.op_sub_const(r, f, k);
                }
                self.advance(6);
            }
            0x9 => {
                // Field-scoped one-bit right shift.
                let f = Field::from_ext_code(self.fetch(3));
                let m = self.fetch(4);
                self.cpu.op_shift_right_bit([A, B, C, D][(m & 0x3) as usize], f);
                self.advance(5);
            }
            0xA => self.op81a(),
            0xB => self.op81b(),
            _ => {
                self.cpu
                    .op_shift_right_bit([A, B, C, D][(n - 0xC) as usize], Field::W);
                self.advance(3);
            }
        }
    }

    fn op81a(&mut self) {
        let f = Field::from_ext_code(self.fetch(3));
        let m = self.fetch(4);
        let q = self.fetch(5);
        if q & 0x7 > 4 {
            return self.invalid();
        }
        let (r, rn) = if q < 8 {
            (A, RegId::scratch(q))
        } else {
            (C, RegId::scratch(q - 8))
        };
        match m {
            0x0 => self.cpu.op_copy(rn, r, f),
            0x1 => self.cpu.op_copy(r, rn, f),
            0x2 => self.cpu.op_exchange(r, rn, f),
            _ => return self.invalid(),
        }
        self.advance(6);
    }

    fn op81b(&mut self) {
        let n = self.fetch(3);
        match n {
            0x2 => {
                self.cpu.pc = regs::register_to_address(self.cpu.reg(A), 5);
            }
            0x3 => {
                self.cpu.pc = regs::register_to_address(self.cpu.reg(C), 5);
            }
            0x4 => {
                let next = (self.cpu.pc + 4) & 0xFFFFF;
                let a = regs::address_to_register(next, self.cpu.reg(A), 5);
                self.cpu.set_reg(A, a);
                self.cpu.pc = next;
            }
            0x5 => {
                let next = (self.cpu.pc + 4) & 0xFFFFF;
                let c = regs::address_to_register(next, self.cpu.reg(C), 5);
                self.cpu.set_reg(C, c);
                self.cpu.pc = next;
            }
            0x6 => {
                let next = (self.cpu.pc + 4) & 0xFFFFF;
                let target = regs::register_to_address(self.cpu.reg(A), 5);
                let a = regs::address_to_register(next, self.cpu.reg(A), 5);
                self.cpu.set_reg(A, a);
                self.cpu.pc = target;
            }
            0x7 => {
                let next = (self.cpu.pc + 4) & 0xFFFFF;
                let target = regs::register_to_address(self.cpu.reg(C), 5);
                let c = regs::address_to_register(next, self.cpu.reg(C), 5);
                self.cpu.set_reg(C, c);
                self.cpu.pc = target;
            }
            _ => self.invalid(),
        }
    }

    /// C=ID: the first controller still wanting configuration answers
    /// with its daisy-chain id in C's low three nibbles.
    fn do_c_id(&mut self) {
        const ID_BASE_PENDING: [u32; 6] = [0x19, 0xF4, 0xF6, 0xF8, 0xFA, 0];
        const ID_SIZE_PENDING: [u32; 6] = [0, 0x03, 0x05, 0x07, 0x09, 0];
        let mut id = 0;
        for (i, c) in self.mmu.ctl.iter().enumerate() {
            match c.unconfigured {
                1 => {
                    id = ID_BASE_PENDING[i];
                    break;
                }
                2 => {
                    id = ID_SIZE_PENDING[i];
                    break;
                }
                _ => {}
            }
        }
        let c = regs::address_to_register(id, self.cpu.reg(C), 3);
        self.cpu.set_reg(C, c);
    }

    // ── 9x/Ax/Bx: field-coded tests and arithmetic ────────────

    fn op_test_field(&mut self) {
        let a = self.fetch(1);
        let n = self.fetch(2);
        let f = Field::from_code(a);
        let t = if a < 8 {
            self.test_eq_group(f, n)
        } else {
            self.test_ord_group(f, n)
        };
        self.go_yes(t, 3);
    }

    fn op_arith_field(&mut self) {
        let a = self.fetch(1);
        let n = self.fetch(2);
        let f = Field::from_code(a);
        if a < 8 {
            self.alu_add_group(f, n);
        } else {
            self.alu_move_group(f, n);
        }
        self.advance(3);
    }

    fn op_arith_field_2(&mut self) {
        let b = self.fetch(1);
        let n = self.fetch(2);
        let f = Field::from_code(b);
        if b < 8 {
            self.alu_sub_group(f, n);
        } else {
            self.alu_shift_group(f, n);
        }
        self.advance(3);
    }

    fn test_eq_group(&mut self, f: Field, n: u8) -> bool {
        let p = self.cpu.p;
        let pairs = [(A, B), (B, C), (C, A), (D, C)];
        match n {
            0x0..=0x3 => {
                let (r1, r2) = pairs[n as usize];
                regs::eq(self.cpu.reg(r1), self.cpu.reg(r2), f, p)
            }
            0x4..=0x7 => {
                let (r1, r2) = pairs[(n - 4) as usize];
                regs::ne(self.cpu.reg(r1), self.cpu.reg(r2), f, p)
            }
            0x8..=0xB => regs::is_zero(self.cpu.reg([A, B, C, D][(n - 8) as usize]), f, p),
            _ => !regs::is_zero(self.cpu.reg([A, B, C, D][(n - 0xC) as usize]), f, p),
        }
    }

    fn test_ord_group(&mut self, f: Field, n: u8) -> bool {
        let p = self.cpu.p;
        let pairs = [(A, B), (B, C), (C, A), (D, C)];
        let (r1, r2) = pairs[(n & 0x3) as usize];
        let (a, b) = (self.cpu.reg(r1), self.cpu.reg(r2));
        match n >> 2 {
            0x0 => regs::gt(a, b, f, p),
            0x1 => regs::lt(a, b, f, p),
            0x2 => regs::ge(a, b, f, p),
            _ => regs::le(a, b, f, p),
        }
    }

    fn alu_add_group(&mut self, f: Field, n: u8) {
        match n {
            0x0 => self.cpu.op_add(A, A, B, f),
            0x1 => self.cpu.op_add(B, B, C, f),
            0x2 => self.cpu.op_add(C, C, A, f),
            0x3 => self.cpu.op_add(D, D, C, f),
            0x4 => self.cpu.op_add(A, A, A, f),
            0x5 => self.cpu.op_add(B, B, B, f),
            0x6 => self.cpu.op_add(C, C, C, f),
            0x7 => self.cpu.op_add(D, D, D, f),
            0x8 => self.cpu.op_add(B, B, A, f),
            0x9 => self.cpu.op_add(C, C, B, f),
            0xA => self.cpu.op_add(A, A, C, f),
            0xB => self.cpu.op_add(C, C, D, f),
            0xC => self.cpu.op_dec(A, f),
            0xD => self.cpu.op_dec(B, f),
            0xE => self.cpu.op_dec(C, f),
            _ => self.cpu.op_dec(D, f),
        }
    }

    fn alu_move_group(&mut self, f: Field, n: u8) {
        match n {
            0x0 => self.cpu.op_zero(A, f),
            0x1 => self.cpu.op_zero(B, f),
            0x2 => self.cpu.op_zero(C, f),
            0x3 => self.cpu.op_zero(D, f),
            0x4 => self.cpu.op_copy(A, B, f),
            0x5 => self.cpu.op_copy(B, C, f),
            0x6 => self.cpu.op_copy(C, A, f),
            0x7 => self.cpu.op_copy(D, C, f),
            0x8 => self.cpu.op_copy(B, A, f),
            0x9 => self.cpu.op_copy(C, B, f),
            0xA => self.cpu.op_copy(A, C, f),
            0xB => self.cpu.op_copy(C, D, f),
            0xC => self.cpu.op_exchange(A, B, f),
            0xD => self.cpu.op_exchange(B, C, f),
            0xE => self.cpu.op_exchange(A, C, f),
            _ => self.cpu.op_exchange(C, D, f),
        }
    }

    fn alu_sub_group(&mut self, f: Field, n: u8) {
        match n {
            0x0 => self.cpu.op_sub(A, A, B, f),
            0x1 => self.cpu.op_sub(B, B, C, f),
            0x2 => self.cpu.op_sub(C, C, A, f),
            0x3 => self.cpu.op_sub(D, D, C, f),
            0x4 => self.cpu.op_inc(A, f),
            0x5 => self.cpu.op_inc(B, f),
            0x6 => self.cpu.op_inc(C, f),
            0x7 => self.cpu.op_inc(D, f),
            0x8 => self.cpu.op_sub(B, B, A, f),
            0x9 => self.cpu.op_sub(C, C, B, f),
            0xA => self.cpu.op_sub(A, A, C, f),
            0xB => self.cpu.op_sub(C, C, D, f),
            0xC => self.cpu.op_sub(A, B, A, f),
            0xD => self.cpu.op_sub(B, C, B, f),
            0xE => self.cpu.op_sub(C, A, C, f),
            _ => self.cpu.op_sub(D, C, D, f),
        }
    }

    fn alu_shift_group(&mut self, f: Field, n: u8) {
        match n {
            0x0 => self.cpu.op_shift_left(A, f),
            0x1 => self.cpu.op_shift_left(B, f),
            0x2 => self.cpu.op_shift_left(C, f),
            0x3 => self.cpu.op_shift_left(D, f),
            0x4 => self.cpu.op_shift_right(A, f),
            0x5 => self.cpu.op_shift_right(B, f),
            0x6 => self.cpu.op_shift_right(C, f),
            0x7 => self.cpu.op_shift_right(D, f),
            0x8 => self.cpu.op_complement_2(A, f),
            0x9 => self.cpu.op_complement_2(B, f),
            0xA => self.cpu.op_complement_2(C, f),
            0xB => self.cpu.op_complement_2(D, f),
            0xC => self.cpu.op_complement_1(A, f),
            0xD => self.cpu.op_complement_1(B, f),
            0xE => self.cpu.op_complement_1(C, f),
            _ => self.cpu.op_complement_1(D, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saturn::Variant;

    /// Build a machine whose ROM starts with the given nibble program.
    fn machine_with(program: &[u8]) -> Machine {
        let mut rom = vec![0u8; 0x80000];
        rom[..program.len()].copy_from_slice(program);
        Machine::with_rom(rom, Variant::Sx).unwrap()
    }

    #[test]
    fn call_wraps_a_full_return_stack() {
        // GOSBVL 0xABCDE (8F + five offset nibbles, low first).
        let mut m = machine_with(&[0x8, 0xF, 0xE, 0xD, 0xC, 0xB, 0xA]);
        for v in 10..18u32 {
            m.cpu.push_rstk(v);
        }
        m.step_instruction();
        assert_eq!(m.cpu.pc, 0xABCDE);
        assert_eq!(m.cpu.rstkp, 7);
        assert_eq!(&m.cpu.rstk[..7], &[11, 12, 13, 14, 15, 16, 17]);
        assert_eq!(m.cpu.rstk[7], 7); // saved PC = address after GOSBVL
    }

    #[test]
    fn field_masked_add_leaves_outside_nibbles() {
        // A=A+B X (A20), with B zero.
        let mut m = machine_with(&[0xA, 0x3, 0x0]);
        let a = [1, 2, 3, 4, 5, 6, 7, 8, 9, 0, 1, 2, 3, 4, 5, 6];
        m.cpu.set_reg(A, a);
        m.cpu.p = 3;
        m.step_instruction();
        assert_eq!(m.cpu.reg(A), a);
        assert!(!m.cpu.carry);
        assert_eq!(m.cpu.pc, 3);
    }

    #[test]
    fn decimal_mode_add_carries_at_ten() {
        // SETDEC; A=A+B P (with P=0).
        let mut m = machine_with(&[0x0, 0x5, 0xA, 0x0, 0x0]);
        let mut a = [0u8; 16];
        a[0] = 9;
        let mut b = [0u8; 16];
        b[0] = 1;
        m.cpu.set_reg(A, a);
        m.cpu.set_reg(B, b);
        m.step_instruction(); // SETDEC
        m.step_instruction(); // A=A+B P
        assert_eq!(m.cpu.reg(A)[0], 0);
        assert!(m.cpu.carry);
    }

    #[test]
    fn load_constant_into_c_at_p() {
        // P=2; LC(3) 1 2 3 — nibbles land at C[2..5].
        let mut m = machine_with(&[0x2, 0x2, 0x3, 0x2, 0x1, 0x2, 0x3]);
        m.step_instruction();
        assert_eq!(m.cpu.p, 2);
        m.step_instruction();
        let c = m.cpu.reg(C);
        assert_eq!(&c[2..5], &[1, 2, 3]);
        assert_eq!(m.cpu.pc, 7);
    }

    #[test]
    fn carry_branch_takes_signed_offset() {
        // GOC +4 from the offset nibble.
        let mut m = machine_with(&[0x4, 0x4, 0x0]);
        m.cpu.carry = true;
        m.step_instruction();
        assert_eq!(m.cpu.pc, 5);

        // Not taken: falls through the 3-nibble instruction.
        let mut m = machine_with(&[0x4, 0x4, 0x0]);
        m.cpu.carry = false;
        m.step_instruction();
        assert_eq!(m.cpu.pc, 3);
    }

    #[test]
    fn goto_is_relative_to_offset_field() {
        // GOTO with offset 0x010 jumps to 1 + 0x10.
        let mut m = machine_with(&[0x6, 0x0, 0x1, 0x0]);
        m.step_instruction();
        assert_eq!(m.cpu.pc, 0x11);

        // Negative offset: 0xFFF = -1.
        let mut m = machine_with(&[0x6, 0xF, 0xF, 0xF]);
        m.step_instruction();
        assert_eq!(m.cpu.pc, 0);
    }

    #[test]
    fn gosub_pushes_the_return_address() {
        // GOSUB +2 (offset from the end of the instruction).
        let mut m = machine_with(&[0x7, 0x2, 0x0, 0x0]);
        m.step_instruction();
        assert_eq!(m.cpu.pc, 6);
        assert_eq!(m.cpu.rstkp, 0);
        assert_eq!(m.cpu.rstk[0], 4);

        // RTN at the target brings us home.
        m.write_nibble(0, 0); // scribble is dropped (ROM): the counter sees it
        assert_eq!(m.cpu.rom_writes, 1);
    }

    #[test]
    fn status_test_follows_goyes() {
        // ST=1 5; ?ST=1 5 GOYES +6.
        let mut m = machine_with(&[0x8, 0x5, 0x5, 0x8, 0x7, 0x5, 0x6, 0x0]);
        m.step_instruction();
        assert!(m.cpu.pstat[5]);
        m.step_instruction();
        assert!(m.cpu.carry);
        assert_eq!(m.cpu.pc, 3 + 6 + 3); // offset counted from its own field
    }

    #[test]
    fn rtnyes_pops_when_offset_is_zero() {
        // ?P=0 with zero offset returns.
        let mut m = machine_with(&[0x8, 0x9, 0x0, 0x0, 0x0]);
        m.cpu.push_rstk(0x00BBB);
        m.step_instruction();
        assert_eq!(m.cpu.pc, 0x00BBB);
        assert_eq!(m.cpu.rstkp, -1);
    }

    #[test]
    fn dat_transfers_roundtrip_through_ram() {
        // Map RAM at 0x70000; DAT0=A A; A=0 A; A=DAT0 A.
        let mut m = machine_with(&[
            0x1, 0x4, 0x0, // DAT0=A A
            0xD, 0x0, // A=0 A
            0x1, 0x4, 0x2, // A=DAT0 A
        ]);
        m.mmu.configure(0x00100);
        m.mmu.configure(0xF0000);
        m.mmu.configure(0x70000);
        m.cpu.d0 = 0x70004;
        let mut a = [0u8; 16];
        a[..5].copy_from_slice(&[0xE, 0xD, 0xC, 0xB, 0xA]);
        m.cpu.set_reg(A, a);

        m.step_instruction();
        assert_eq!(&m.mem.ram[4..9], &[0xE, 0xD, 0xC, 0xB, 0xA]);

        m.step_instruction();
        assert!(regs::is_zero(m.cpu.reg(A), Field::A, 0));

        let crc_before = m.cpu.crc;
        m.step_instruction();
        assert_eq!(&m.cpu.reg(A)[..5], &[0xE, 0xD, 0xC, 0xB, 0xA]);
        assert_ne!(m.cpu.crc, crc_before, "recalls feed the self-test CRC");
    }

    #[test]
    fn config_opcode_consumes_c_register() {
        // CONFIG (805) twice: mask then base for controller 1.
        let mut m = machine_with(&[0x8, 0x0, 0x5, 0x8, 0x0, 0x5]);
        m.mmu.configure(0x00100); // controller 0 out of the way
        let c = regs::address_to_register(0xF0000, m.cpu.reg(C), 5);
        m.cpu.set_reg(C, c);
        m.step_instruction();
        let c = regs::address_to_register(0x70000, m.cpu.reg(C), 5);
        m.cpu.set_reg(C, c);
        m.step_instruction();

        assert_eq!(m.mmu.ctl[1].unconfigured, 0);
        assert_eq!(m.mmu.ctl[1].config, [0x70000, 0xF0000]);
    }

    #[test]
    fn c_id_reports_first_pending_controller() {
        // Fresh map: controller 0 wants a base -> id 0x19.
        let mut m = machine_with(&[0x8, 0x0, 0x6, 0x8, 0x0, 0x6]);
        m.step_instruction();
        assert_eq!(regs::register_to_address(m.cpu.reg(C), 3), 0x19);

        // After its base, controller 1 wants a size -> id 0x03.
        m.mmu.configure(0x00100);
        m.step_instruction();
        assert_eq!(regs::register_to_address(m.cpu.reg(C), 3), 0x03);
    }

    #[test]
    fn p_arithmetic_wraps_with_carry() {
        let mut m = machine_with(&[0x0, 0xC, 0x0, 0xD, 0x0, 0xD]);
        m.cpu.p = 0xF;
        m.step_instruction(); // P=P+1
        assert_eq!(m.cpu.p, 0);
        assert!(m.cpu.carry);
        m.step_instruction(); // P=P-1
        assert_eq!(m.cpu.p, 0xF);
        assert!(m.cpu.carry);
        m.step_instruction(); // P=P-1
        assert_eq!(m.cpu.p, 0xE);
        assert!(!m.cpu.carry);
    }

    #[test]
    fn shutdown_and_interrupt_entry() {
        // SHUTDN, then a pending interrupt wakes and vectors.
        let mut m = machine_with(&[0x8, 0x0, 0x7]);
        m.step_instruction();
        assert!(m.cpu.shutdown);

        m.cpu.int_pending = true;
        m.step_instruction();
        assert_eq!(m.cpu.rstk[0], 3, "PC pushed on interrupt entry");
        assert!(!m.cpu.intenable);
        assert!(!m.cpu.shutdown);
    }

    #[test]
    fn rti_reenables_and_clears_pending() {
        let mut m = machine_with(&[0x0, 0xF]);
        m.cpu.intenable = false;
        m.cpu.int_pending = true;
        m.cpu.push_rstk(0x123);
        m.step_instruction();
        assert_eq!(m.cpu.pc, 0x123);
        assert!(m.cpu.intenable);
        assert!(!m.cpu.int_pending);
    }

    #[test]
    fn unassigned_opcode_is_a_counted_nop() {
        // 81B0 is unassigned.
        let mut m = machine_with(&[0x8, 0x1, 0xB, 0x0]);
        m.step_instruction();
        assert_eq!(m.cpu.invalid_ops, 1);
        assert_eq!(m.cpu.pc, 1);
    }

    #[test]
    fn out_in_senses_keyboard_rows() {
        // OUT=C; A=IN with a key held on row 1.
        let mut m = machine_with(&[0x8, 0x0, 0x1, 0x8, 0x0, 0x2]);
        let mut c = [0u8; 16];
        c[0] = 0x2; // drive row 1
        m.cpu.set_reg(C, c);
        m.cpu.keybuf.set_key(1, 0x0081, true);
        m.step_instruction();
        m.step_instruction();
        let a = m.cpu.reg(A);
        assert_eq!(&a[..4], &[0x1, 0x8, 0x0, 0x0]);
    }

    #[test]
    fn data_pointer_loads_replace_low_nibbles() {
        // D0=(2) 0x34 keeps the upper three nibbles.
        let mut m = machine_with(&[0x1, 0x9, 0x4, 0x3]);
        m.cpu.d0 = 0xABCDE;
        m.step_instruction();
        assert_eq!(m.cpu.d0, 0xABC34);
        assert_eq!(m.cpu.pc, 4);
    }

    #[test]
    fn pointer_exchange_short_form() {
        // AD0XS (13A): swap only the low four nibbles.
        let mut m = machine_with(&[0x1, 0x3, 0xA]);
        m.cpu.d0 = 0x12345;
        let a = regs::address_to_register(0xABCDE, [0; 16], 5);
        m.cpu.set_reg(A, a);
        m.step_instruction();
        assert_eq!(m.cpu.d0, 0x1BCDE);
        assert_eq!(regs::register_to_address(m.cpu.reg(A), 5), 0xA2345);
    }
}
