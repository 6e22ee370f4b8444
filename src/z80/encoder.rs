// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Z80/Z80N instruction encoding.
//!
//! The encoder only selects opcodes. Numeric operands, relative jumps and
//! error reports go through an [`EmitHost`], which owns evaluation and the
//! fixup bookkeeping for values that are not known yet.

use crate::core::assembler::error::ErrorCode;
use crate::core::ast::{Expr, Instruction, Operand, UnaryOp};
use crate::z80::{lookup_simple, Condition, Mnemonic, Register};

/// Encoding of a numeric operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberWidth {
    Bit8,
    Bit16,
    /// Big-endian word, used by the Z80N `push nn`.
    Bit16Be,
}

/// Services the encoder needs from the assembler.
pub trait EmitHost {
    fn emit_byte(&mut self, byte: u8);
    /// Emit a numeric operand, recording a fixup when it is not known yet.
    fn emit_number(&mut self, expr: &Expr, width: NumberWidth);
    /// Emit the displacement byte of a relative jump.
    fn emit_relative(&mut self, expr: &Expr);
    /// Evaluate a value that must be known now. Errors are reported by the
    /// host and yield `None`.
    fn eval_immediate(&mut self, expr: &Expr) -> Option<i64>;
    fn report(&mut self, code: ErrorCode, params: Vec<String>);
    fn is_next(&self) -> bool;
}

/// Emit an opcode; the high byte only when it is nonzero.
pub fn emit_opcode(host: &mut dyn EmitHost, opcode: u16) {
    let high = (opcode >> 8) as u8;
    if high != 0 {
        host.emit_byte(high);
    }
    host.emit_byte(opcode as u8);
}

pub fn encode_instruction(instr: &Instruction, host: &mut dyn EmitHost) {
    let ops = instr.operands.as_slice();
    use Mnemonic::*;
    match instr.mnemonic {
        Nextreg => encode_nextreg(ops, host),
        Push | Pop => encode_push_pop(instr.mnemonic == Push, ops, host),
        Call => encode_call(ops, host),
        Jp => encode_jp(ops, host),
        Jr => encode_jr(ops, host),
        Djnz => match ops {
            [Operand::Expr(target)] => {
                host.emit_byte(0x10);
                host.emit_relative(target);
            }
            _ => invalid(host),
        },
        Ret => match ops {
            [] => host.emit_byte(0xC9),
            [cond] => match condition_of(cond) {
                Some(cc) => host.emit_byte(0xC0 + 8 * cc.index()),
                None => invalid(host),
            },
            _ => invalid(host),
        },
        Rst => encode_rst(ops, host),
        Im => encode_im(ops, host),
        Ex => encode_ex(ops, host),
        In => encode_in(ops, host),
        Out => encode_out(ops, host),
        Bit => encode_bit_op(0x40, false, ops, host),
        Res => encode_bit_op(0x80, true, ops, host),
        Set => encode_bit_op(0xC0, true, ops, host),
        Rlc | Rrc | Rl | Rr | Sla | Sra | Sll | Srl => {
            encode_shift(shift_index(instr.mnemonic), ops, host)
        }
        Inc => encode_inc_dec(false, ops, host),
        Dec => encode_inc_dec(true, ops, host),
        Add | Adc | Sbc => encode_alu_first(instr.mnemonic, ops, host),
        Sub | And | Xor | Or | Cp => encode_alu_second(alu_index(instr.mnemonic), ops, host),
        Ld => encode_ld(ops, host),
        Test => match ops {
            [Operand::Expr(value)] => {
                if require_next(host) {
                    emit_opcode(host, 0xED27);
                    host.emit_number(value, NumberWidth::Bit8);
                }
            }
            _ => invalid(host),
        },
        mnemonic => encode_simple(mnemonic, ops, host),
    }
}

fn invalid(host: &mut dyn EmitHost) {
    host.report(ErrorCode::Z0604, Vec::new());
}

fn require_next(host: &mut dyn EmitHost) -> bool {
    if host.is_next() {
        return true;
    }
    host.report(ErrorCode::Z0414, Vec::new());
    false
}

/// `c` is both a register and a condition name.
fn condition_of(op: &Operand) -> Option<Condition> {
    match op {
        Operand::Condition(cc, _) => Some(*cc),
        Operand::Reg(Register::C, _) => Some(Condition::C),
        _ => None,
    }
}

fn std8(op: &Operand) -> Option<u8> {
    op.reg().and_then(Register::reg8_index)
}

fn idx8(op: &Operand) -> Option<Register> {
    op.reg().filter(|reg| reg.is_reg8_idx())
}

fn is_hl_indirect(op: &Operand) -> bool {
    matches!(op, Operand::RegIndirect(Register::Hl, _))
}

fn emit_displacement(host: &mut dyn EmitHost, minus: bool, disp: Option<&Expr>) {
    match disp {
        None => host.emit_byte(0),
        Some(expr) if minus => {
            let negated = Expr::Unary {
                op: UnaryOp::Minus,
                expr: Box::new(expr.clone()),
                span: expr.span(),
            };
            host.emit_number(&negated, NumberWidth::Bit8);
        }
        Some(expr) => host.emit_number(expr, NumberWidth::Bit8),
    }
}

/// `prefix op d` or `prefix 0xCB d op` for an indexed operand.
fn emit_indexed(host: &mut dyn EmitHost, op: &Operand, opcode: u8, cb: bool) -> bool {
    let Operand::Indexed {
        reg, minus, disp, ..
    } = op
    else {
        return false;
    };
    let Some(prefix) = reg.index_prefix() else {
        return false;
    };
    host.emit_byte(prefix);
    if cb {
        host.emit_byte(0xCB);
        emit_displacement(host, *minus, disp.as_ref());
        host.emit_byte(opcode);
    } else {
        host.emit_byte(opcode);
        emit_displacement(host, *minus, disp.as_ref());
    }
    true
}

/// Operands some Z80N instructions may spell out.
fn implied_operands(mnemonic: Mnemonic) -> &'static [Register] {
    match mnemonic {
        Mnemonic::Mul => &[Register::D, Register::E],
        Mnemonic::Bsla | Mnemonic::Bsra | Mnemonic::Bsrl | Mnemonic::Bsrf | Mnemonic::Brlc => {
            &[Register::De, Register::B]
        }
        Mnemonic::Mirror | Mnemonic::Swapnib => &[Register::A],
        _ => &[],
    }
}

fn encode_simple(mnemonic: Mnemonic, ops: &[Operand], host: &mut dyn EmitHost) {
    let Some(entry) = lookup_simple(mnemonic) else {
        host.report(ErrorCode::Z0401, vec![mnemonic.name().to_string()]);
        return;
    };
    let implied = implied_operands(mnemonic);
    let operands_ok = ops.is_empty()
        || (ops.len() == implied.len()
            && ops.iter().zip(implied).all(|(op, reg)| op.is_reg(*reg)));
    if !operands_ok {
        invalid(host);
        return;
    }
    if entry.next_only && !require_next(host) {
        return;
    }
    emit_opcode(host, entry.opcode);
}

fn encode_nextreg(ops: &[Operand], host: &mut dyn EmitHost) {
    if !require_next(host) {
        return;
    }
    match ops {
        [Operand::Expr(reg), Operand::Expr(value)] => {
            emit_opcode(host, 0xED91);
            host.emit_number(reg, NumberWidth::Bit8);
            host.emit_number(value, NumberWidth::Bit8);
        }
        [Operand::Expr(reg), src] if src.is_reg(Register::A) => {
            emit_opcode(host, 0xED92);
            host.emit_number(reg, NumberWidth::Bit8);
        }
        _ => invalid(host),
    }
}

fn encode_push_pop(push: bool, ops: &[Operand], host: &mut dyn EmitHost) {
    let [op] = ops else {
        invalid(host);
        return;
    };
    if let Operand::Expr(value) = op {
        if !push {
            host.report(ErrorCode::Z0412, Vec::new());
        } else if require_next(host) {
            emit_opcode(host, 0xED8A);
            host.emit_number(value, NumberWidth::Bit16Be);
        }
        return;
    }
    let pop_code: u16 = match op.reg() {
        Some(Register::Af) => 0xF1,
        Some(Register::Bc) => 0xC1,
        Some(Register::De) => 0xD1,
        Some(Register::Hl) => 0xE1,
        Some(Register::Ix) => 0xDDE1,
        Some(Register::Iy) => 0xFDE1,
        _ => {
            host.report(ErrorCode::Z0413, Vec::new());
            return;
        }
    };
    emit_opcode(host, if push { pop_code | 0x04 } else { pop_code });
}

fn encode_call(ops: &[Operand], host: &mut dyn EmitHost) {
    match ops {
        [Operand::Expr(target)] => {
            host.emit_byte(0xCD);
            host.emit_number(target, NumberWidth::Bit16);
        }
        [cond, Operand::Expr(target)] => match condition_of(cond) {
            Some(cc) => {
                host.emit_byte(0xC4 + 8 * cc.index());
                host.emit_number(target, NumberWidth::Bit16);
            }
            None => invalid(host),
        },
        _ => invalid(host),
    }
}

fn encode_jp(ops: &[Operand], host: &mut dyn EmitHost) {
    match ops {
        [Operand::CPort(_)] => {
            if require_next(host) {
                emit_opcode(host, 0xED98);
            }
        }
        [Operand::Reg(Register::Hl, _)] | [Operand::RegIndirect(Register::Hl, _)] => {
            host.emit_byte(0xE9)
        }
        [Operand::Reg(reg, _)] | [Operand::Indexed { reg, disp: None, .. }]
            if reg.is_reg16_idx() =>
        {
            if let Some(prefix) = reg.index_prefix() {
                host.emit_byte(prefix);
                host.emit_byte(0xE9);
            }
        }
        [Operand::Expr(target)] => {
            host.emit_byte(0xC3);
            host.emit_number(target, NumberWidth::Bit16);
        }
        [cond, target] => match (condition_of(cond), target) {
            (Some(cc), Operand::Expr(target)) => {
                host.emit_byte(0xC2 + 8 * cc.index());
                host.emit_number(target, NumberWidth::Bit16);
            }
            (Some(_), _) => host.report(ErrorCode::Z0111, Vec::new()),
            (None, _) => invalid(host),
        },
        _ => invalid(host),
    }
}

fn encode_jr(ops: &[Operand], host: &mut dyn EmitHost) {
    match ops {
        [Operand::Expr(target)] => {
            host.emit_byte(0x18);
            host.emit_relative(target);
        }
        [cond, Operand::Expr(target)] => match condition_of(cond) {
            Some(cc) if cc.index() < 4 => {
                host.emit_byte(0x20 + 8 * cc.index());
                host.emit_relative(target);
            }
            Some(_) => host.report(ErrorCode::Z0402, Vec::new()),
            None => invalid(host),
        },
        _ => invalid(host),
    }
}

fn encode_rst(ops: &[Operand], host: &mut dyn EmitHost) {
    let [Operand::Expr(expr)] = ops else {
        invalid(host);
        return;
    };
    let Some(value) = host.eval_immediate(expr) else {
        return;
    };
    if !(0..=0x38).contains(&value) || value % 8 != 0 {
        host.report(ErrorCode::Z0404, vec![format!("{value:X}")]);
        return;
    }
    host.emit_byte(0xC7 + value as u8);
}

fn encode_im(ops: &[Operand], host: &mut dyn EmitHost) {
    let [Operand::Expr(expr)] = ops else {
        invalid(host);
        return;
    };
    let Some(mode) = host.eval_immediate(expr) else {
        return;
    };
    let opcode = match mode {
        0 => 0xED46,
        1 => 0xED56,
        2 => 0xED5E,
        _ => {
            host.report(ErrorCode::Z0405, vec![mode.to_string()]);
            return;
        }
    };
    emit_opcode(host, opcode);
}

fn encode_ex(ops: &[Operand], host: &mut dyn EmitHost) {
    let opcode = match ops {
        [Operand::Reg(Register::Af, _), Operand::Reg(Register::AfAlt, _)] => 0x08,
        [Operand::Reg(Register::De, _), Operand::Reg(Register::Hl, _)] => 0xEB,
        [Operand::RegIndirect(Register::Sp, _), Operand::Reg(Register::Hl, _)] => 0xE3,
        [Operand::RegIndirect(Register::Sp, _), Operand::Reg(Register::Ix, _)] => 0xDDE3,
        [Operand::RegIndirect(Register::Sp, _), Operand::Reg(Register::Iy, _)] => 0xFDE3,
        _ => {
            invalid(host);
            return;
        }
    };
    emit_opcode(host, opcode);
}

fn encode_in(ops: &[Operand], host: &mut dyn EmitHost) {
    match ops {
        [Operand::CPort(_)] => emit_opcode(host, 0xED70),
        [Operand::Reg(Register::A, _), Operand::MemIndirect(port, _)] => {
            host.emit_byte(0xDB);
            host.emit_number(port, NumberWidth::Bit8);
        }
        [dst, Operand::CPort(_)] => match std8(dst) {
            Some(r) => emit_opcode(host, 0xED40 + 8 * u16::from(r)),
            None => invalid(host),
        },
        _ => invalid(host),
    }
}

fn encode_out(ops: &[Operand], host: &mut dyn EmitHost) {
    match ops {
        [Operand::MemIndirect(port, _), Operand::Reg(Register::A, _)] => {
            host.emit_byte(0xD3);
            host.emit_number(port, NumberWidth::Bit8);
        }
        [Operand::CPort(_), Operand::Expr(value)] => {
            let Some(value) = host.eval_immediate(value) else {
                return;
            };
            if value != 0 {
                host.report(ErrorCode::Z0406, Vec::new());
                return;
            }
            emit_opcode(host, 0xED71);
        }
        [Operand::CPort(_), src] => match std8(src) {
            Some(r) => emit_opcode(host, 0xED41 + 8 * u16::from(r)),
            None => invalid(host),
        },
        _ => invalid(host),
    }
}

fn encode_bit_op(base: u8, allow_copy: bool, ops: &[Operand], host: &mut dyn EmitHost) {
    let (bit_expr, target, copy) = match ops {
        [Operand::Expr(bit), target] => (bit, target, None),
        [Operand::Expr(bit), target, copy] if allow_copy => (bit, target, Some(copy)),
        _ => {
            invalid(host);
            return;
        }
    };
    let Some(bit) = host.eval_immediate(bit_expr) else {
        return;
    };
    if !(0..=7).contains(&bit) {
        host.report(ErrorCode::Z0407, vec![bit.to_string()]);
        return;
    }
    let opcode = base + 8 * bit as u8;
    match (target, copy) {
        (Operand::Indexed { .. }, None) => {
            emit_indexed(host, target, opcode | 6, true);
        }
        (Operand::Indexed { .. }, Some(copy)) => match std8(copy) {
            Some(r) => {
                emit_indexed(host, target, opcode | r, true);
            }
            None => invalid(host),
        },
        (_, Some(_)) => invalid(host),
        (target, None) if is_hl_indirect(target) => {
            host.emit_byte(0xCB);
            host.emit_byte(opcode | 6);
        }
        (target, None) => match std8(target) {
            Some(r) => {
                host.emit_byte(0xCB);
                host.emit_byte(opcode | r);
            }
            None => invalid(host),
        },
    }
}

fn shift_index(mnemonic: Mnemonic) -> u8 {
    match mnemonic {
        Mnemonic::Rlc => 0,
        Mnemonic::Rrc => 1,
        Mnemonic::Rl => 2,
        Mnemonic::Rr => 3,
        Mnemonic::Sla => 4,
        Mnemonic::Sra => 5,
        Mnemonic::Sll => 6,
        _ => 7,
    }
}

fn encode_shift(index: u8, ops: &[Operand], host: &mut dyn EmitHost) {
    let opcode = index * 8;
    match ops {
        [target @ Operand::Indexed { .. }] => {
            emit_indexed(host, target, opcode | 6, true);
        }
        [target @ Operand::Indexed { .. }, copy] => match std8(copy) {
            Some(r) => {
                emit_indexed(host, target, opcode | r, true);
            }
            None => invalid(host),
        },
        [target] if is_hl_indirect(target) => {
            host.emit_byte(0xCB);
            host.emit_byte(opcode | 6);
        }
        [target] => match std8(target) {
            Some(r) => {
                host.emit_byte(0xCB);
                host.emit_byte(opcode | r);
            }
            None => invalid(host),
        },
        _ => invalid(host),
    }
}

fn encode_inc_dec(dec: bool, ops: &[Operand], host: &mut dyn EmitHost) {
    let [op] = ops else {
        invalid(host);
        return;
    };
    if let Some(r) = std8(op) {
        let base = if dec { 0x05 } else { 0x04 };
        host.emit_byte(base + 8 * r);
        return;
    }
    if is_hl_indirect(op) {
        host.emit_byte(if dec { 0x35 } else { 0x34 });
        return;
    }
    if matches!(op, Operand::Indexed { .. }) {
        emit_indexed(host, op, if dec { 0x35 } else { 0x34 }, false);
        return;
    }
    let inc_code: u16 = match op.reg() {
        Some(Register::Xl) => 0xDD2C,
        Some(Register::Xh) => 0xDD24,
        Some(Register::Yl) => 0xFD2C,
        Some(Register::Yh) => 0xFD24,
        Some(Register::Bc) => 0x03,
        Some(Register::De) => 0x13,
        Some(Register::Hl) => 0x23,
        Some(Register::Sp) => 0x33,
        Some(Register::Ix) => 0xDD23,
        Some(Register::Iy) => 0xFD23,
        _ => {
            invalid(host);
            return;
        }
    };
    let code = match (dec, op.reg()) {
        (false, _) => inc_code,
        (true, Some(reg)) if reg.is_reg8_idx() => inc_code + 1,
        (true, _) => inc_code + 8,
    };
    emit_opcode(host, code);
}

fn alu_index(mnemonic: Mnemonic) -> u8 {
    match mnemonic {
        Mnemonic::Add => 0,
        Mnemonic::Adc => 1,
        Mnemonic::Sub => 2,
        Mnemonic::Sbc => 3,
        Mnemonic::And => 4,
        Mnemonic::Xor => 5,
        Mnemonic::Or => 6,
        _ => 7,
    }
}

/// `op a,x` for the eight ALU operations.
fn encode_alu8(index: u8, src: &Operand, host: &mut dyn EmitHost) {
    if let Some(r) = std8(src) {
        host.emit_byte(0x80 + 8 * index + r);
    } else if is_hl_indirect(src) {
        host.emit_byte(0x86 + 8 * index);
    } else if let Some(reg) = idx8(src) {
        if let Some(prefix) = reg.index_prefix() {
            host.emit_byte(prefix);
            let opcode = if reg.is_low_half() { 0x85 } else { 0x84 };
            host.emit_byte(opcode + 8 * index);
        }
    } else if matches!(src, Operand::Indexed { .. }) {
        emit_indexed(host, src, 0x86 + 8 * index, false);
    } else if let Operand::Expr(value) = src {
        host.emit_byte(0xC6 + 8 * index);
        host.emit_number(value, NumberWidth::Bit8);
    } else {
        invalid(host);
    }
}

fn encode_alu_first(mnemonic: Mnemonic, ops: &[Operand], host: &mut dyn EmitHost) {
    let index = alu_index(mnemonic);
    let (dst, src) = match ops {
        [src] => {
            encode_alu8(index, src, host);
            return;
        }
        [dst, src] => (dst, src),
        _ => {
            invalid(host);
            return;
        }
    };
    match dst.reg() {
        Some(Register::A) => encode_alu8(index, src, host),
        Some(Register::Hl) if src.reg().is_some_and(Register::is_reg16_std) => {
            let rr = src.reg().and_then(Register::reg16_index).unwrap_or(0);
            let base: u16 = match mnemonic {
                Mnemonic::Add => 0x09,
                Mnemonic::Adc => 0xED4A,
                _ => 0xED42,
            };
            emit_opcode(host, base + 16 * u16::from(rr));
        }
        Some(reg @ (Register::Hl | Register::De | Register::Bc)) if mnemonic == Mnemonic::Add => {
            let offset = match reg {
                Register::Hl => 0,
                Register::De => 1,
                _ => 2,
            };
            match src {
                Operand::Reg(Register::A, _) => {
                    if require_next(host) {
                        emit_opcode(host, 0xED31 + offset);
                    }
                }
                Operand::Expr(value) => {
                    if require_next(host) {
                        emit_opcode(host, 0xED34 + offset);
                        host.emit_number(value, NumberWidth::Bit16);
                    }
                }
                _ => invalid(host),
            }
        }
        Some(reg) if reg.is_reg16_idx() && mnemonic == Mnemonic::Add => {
            let prefix = reg.index_prefix().unwrap_or(0xDD);
            let code = match src.reg() {
                Some(src_reg) if src_reg == reg => 0x29,
                Some(src_reg @ (Register::Bc | Register::De | Register::Sp)) => {
                    0x09 + 16 * src_reg.reg16_index().unwrap_or(0)
                }
                _ => {
                    invalid(host);
                    return;
                }
            };
            host.emit_byte(prefix);
            host.emit_byte(code);
        }
        Some(reg) if reg.is_reg8() => host.report(ErrorCode::Z0409, Vec::new()),
        _ => invalid(host),
    }
}

fn encode_alu_second(index: u8, ops: &[Operand], host: &mut dyn EmitHost) {
    match ops {
        [src] => encode_alu8(index, src, host),
        [dst, src] if dst.is_reg(Register::A) => encode_alu8(index, src, host),
        [_, _] => host.report(ErrorCode::Z0408, Vec::new()),
        _ => invalid(host),
    }
}

fn encode_ld(ops: &[Operand], host: &mut dyn EmitHost) {
    let [dst, src] = ops else {
        invalid(host);
        return;
    };
    let encoded = match dst {
        Operand::Reg(reg, _) if reg.is_reg8_std() => ld_to_reg8(*reg, src, host),
        Operand::Reg(reg, _) if reg.is_reg8_idx() => ld_to_idx8(*reg, src, host),
        Operand::Reg(Register::I, _) if src.is_reg(Register::A) => {
            emit_opcode(host, 0xED47);
            true
        }
        Operand::Reg(Register::R, _) if src.is_reg(Register::A) => {
            emit_opcode(host, 0xED4F);
            true
        }
        Operand::Reg(reg, _) if reg.is_reg16() => ld_to_reg16(*reg, src, host),
        Operand::RegIndirect(reg, _) => ld_to_reg_indirect(*reg, src, host),
        Operand::MemIndirect(addr, _) => ld_to_memory(addr, src, host),
        Operand::Indexed { .. } => match src {
            Operand::Expr(value) => {
                emit_indexed(host, dst, 0x36, false);
                host.emit_number(value, NumberWidth::Bit8);
                true
            }
            _ => match std8(src) {
                Some(r) => emit_indexed(host, dst, 0x70 + r, false),
                None => false,
            },
        },
        _ => false,
    };
    if !encoded {
        invalid(host);
    }
}

fn ld_to_reg8(dst: Register, src: &Operand, host: &mut dyn EmitHost) -> bool {
    let d = dst.reg8_index().unwrap_or(0);
    let is_a = dst == Register::A;
    match src {
        Operand::Reg(reg, _) => {
            if let Some(s) = reg.reg8_index() {
                host.emit_byte(0x40 + 8 * d + s);
            } else if *reg == Register::I && is_a {
                emit_opcode(host, 0xED57);
            } else if *reg == Register::R && is_a {
                emit_opcode(host, 0xED5F);
            } else if reg.is_reg8_idx() && !matches!(dst, Register::H | Register::L) {
                let Some(prefix) = reg.index_prefix() else {
                    return false;
                };
                host.emit_byte(prefix);
                host.emit_byte(0x44 + 8 * d + u8::from(reg.is_low_half()));
            } else {
                return false;
            }
            true
        }
        Operand::RegIndirect(Register::Bc, _) if is_a => {
            host.emit_byte(0x0A);
            true
        }
        Operand::RegIndirect(Register::De, _) if is_a => {
            host.emit_byte(0x1A);
            true
        }
        Operand::RegIndirect(Register::Hl, _) => {
            host.emit_byte(0x46 + 8 * d);
            true
        }
        Operand::Expr(value) => {
            host.emit_byte(0x06 + 8 * d);
            host.emit_number(value, NumberWidth::Bit8);
            true
        }
        Operand::MemIndirect(addr, _) if is_a => {
            host.emit_byte(0x3A);
            host.emit_number(addr, NumberWidth::Bit16);
            true
        }
        Operand::Indexed { .. } => emit_indexed(host, src, 0x46 + 8 * d, false),
        _ => false,
    }
}

fn ld_to_idx8(dst: Register, src: &Operand, host: &mut dyn EmitHost) -> bool {
    let Some(prefix) = dst.index_prefix() else {
        return false;
    };
    let lo = if dst.is_low_half() { 8 } else { 0 };
    match src {
        Operand::Reg(reg, _) if reg.is_reg8_std() && !matches!(reg, Register::H | Register::L) => {
            host.emit_byte(prefix);
            host.emit_byte(0x60 + lo + reg.reg8_index().unwrap_or(0));
            true
        }
        Operand::Reg(reg, _) if reg.is_reg8_idx() && reg.index_prefix() == Some(prefix) => {
            host.emit_byte(prefix);
            host.emit_byte(0x64 + lo + u8::from(reg.is_low_half()));
            true
        }
        Operand::Expr(value) => {
            host.emit_byte(prefix);
            host.emit_byte(0x26 + lo);
            host.emit_number(value, NumberWidth::Bit8);
            true
        }
        _ => false,
    }
}

fn ld_to_reg16(dst: Register, src: &Operand, host: &mut dyn EmitHost) -> bool {
    if dst == Register::Sp {
        let opcode = match src.reg() {
            Some(Register::Hl) => Some(0xF9),
            Some(Register::Ix) => Some(0xDDF9),
            Some(Register::Iy) => Some(0xFDF9),
            _ => None,
        };
        if let Some(opcode) = opcode {
            emit_opcode(host, opcode);
            return true;
        }
    }
    if let Some(prefix) = dst.index_prefix() {
        let (opcode, value) = match src {
            Operand::MemIndirect(addr, _) => (0x2A, addr),
            Operand::Expr(value) => (0x21, value),
            _ => return false,
        };
        host.emit_byte(prefix);
        host.emit_byte(opcode);
        host.emit_number(value, NumberWidth::Bit16);
        return true;
    }
    let Some(rr) = dst.reg16_index() else {
        return false;
    };
    match src {
        Operand::MemIndirect(addr, _) => {
            let opcode = match dst {
                Register::Hl => 0x2A,
                Register::Bc => 0xED4B,
                Register::De => 0xED5B,
                _ => 0xED7B,
            };
            emit_opcode(host, opcode);
            host.emit_number(addr, NumberWidth::Bit16);
            true
        }
        Operand::Expr(value) => {
            host.emit_byte(0x01 + 16 * rr);
            host.emit_number(value, NumberWidth::Bit16);
            true
        }
        _ => false,
    }
}

fn ld_to_reg_indirect(dst: Register, src: &Operand, host: &mut dyn EmitHost) -> bool {
    match (dst, src) {
        (Register::Bc, Operand::Reg(Register::A, _)) => host.emit_byte(0x02),
        (Register::De, Operand::Reg(Register::A, _)) => host.emit_byte(0x12),
        (Register::Hl, Operand::Expr(value)) => {
            host.emit_byte(0x36);
            host.emit_number(value, NumberWidth::Bit8);
        }
        (Register::Hl, src) => match std8(src) {
            Some(r) => host.emit_byte(0x70 + r),
            None => return false,
        },
        _ => return false,
    }
    true
}

fn ld_to_memory(addr: &Expr, src: &Operand, host: &mut dyn EmitHost) -> bool {
    let opcode = match src.reg() {
        Some(Register::A) => 0x32,
        Some(Register::Hl) => 0x22,
        Some(Register::Bc) => 0xED43,
        Some(Register::De) => 0xED53,
        Some(Register::Sp) => 0xED73,
        Some(Register::Ix) => 0xDD22,
        Some(Register::Iy) => 0xFD22,
        _ => return false,
    };
    emit_opcode(host, opcode);
    host.emit_number(addr, NumberWidth::Bit16);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ast::LineKind;
    use crate::core::expr::{eval_expr, EvalContext, ExpressionValue};
    use crate::core::functions::SeededRandom;
    use crate::core::parser::parse_program;

    struct MockHost {
        bytes: Vec<u8>,
        errors: Vec<ErrorCode>,
        fixups: Vec<(usize, NumberWidth)>,
        next: bool,
        rng: SeededRandom,
    }

    impl EvalContext for MockHost {
        fn current_address(&self) -> u16 {
            0x8000
        }

        fn symbol_value(&mut self, name: &str, _from_global: bool) -> Option<ExpressionValue> {
            (name == "target").then_some(ExpressionValue::Integer(0x8010))
        }

        fn is_symbol_resolved(&self, name: &str, _from_global: bool) -> bool {
            name == "target"
        }

        fn loop_counter(&self) -> Option<i64> {
            None
        }

        fn random(&mut self) -> &mut SeededRandom {
            &mut self.rng
        }
    }

    impl MockHost {
        fn value(&mut self, expr: &Expr) -> Option<i64> {
            match eval_expr(expr, self) {
                Ok(value) => value.as_long().ok(),
                Err(_) => None,
            }
        }
    }

    impl EmitHost for MockHost {
        fn emit_byte(&mut self, byte: u8) {
            self.bytes.push(byte);
        }

        fn emit_number(&mut self, expr: &Expr, width: NumberWidth) {
            let value = match self.value(expr) {
                Some(value) => value,
                None => {
                    self.fixups.push((self.bytes.len(), width));
                    0
                }
            };
            match width {
                NumberWidth::Bit8 => self.bytes.push(value as u8),
                NumberWidth::Bit16 => {
                    self.bytes.push(value as u8);
                    self.bytes.push((value >> 8) as u8);
                }
                NumberWidth::Bit16Be => {
                    self.bytes.push((value >> 8) as u8);
                    self.bytes.push(value as u8);
                }
            }
        }

        fn emit_relative(&mut self, expr: &Expr) {
            let target = self.value(expr).unwrap_or(0x8000);
            self.bytes.push((target - 0x8002) as u8);
        }

        fn eval_immediate(&mut self, expr: &Expr) -> Option<i64> {
            self.value(expr)
        }

        fn report(&mut self, code: ErrorCode, _params: Vec<String>) {
            self.errors.push(code);
        }

        fn is_next(&self) -> bool {
            self.next
        }
    }

    fn run(source: &str, next: bool) -> MockHost {
        let (lines, errors) = parse_program(&format!(" {source}"), 0, false);
        assert!(errors.is_empty(), "{source}: {errors:?}");
        let LineKind::Instruction(instr) = &lines[0].kind else {
            panic!("not an instruction: {source}");
        };
        let mut host = MockHost {
            bytes: Vec::new(),
            errors: Vec::new(),
            fixups: Vec::new(),
            next,
            rng: SeededRandom::new(1),
        };
        encode_instruction(instr, &mut host);
        host
    }

    fn bytes(source: &str) -> Vec<u8> {
        let host = run(source, false);
        assert!(host.errors.is_empty(), "{source}: {:?}", host.errors);
        host.bytes
    }

    fn error(source: &str) -> ErrorCode {
        run(source, false).errors[0]
    }

    #[test]
    fn encodes_loads() {
        assert_eq!(bytes("ld b,c"), vec![0x41]);
        assert_eq!(bytes("ld a,(bc)"), vec![0x0A]);
        assert_eq!(bytes("ld (hl),e"), vec![0x73]);
        assert_eq!(bytes("ld a,i"), vec![0xED, 0x57]);
        assert_eq!(bytes("ld a,(#1234)"), vec![0x3A, 0x34, 0x12]);
        assert_eq!(bytes("ld de,(#4000)"), vec![0xED, 0x5B, 0x00, 0x40]);
        assert_eq!(bytes("ld (#4000),ix"), vec![0xDD, 0x22, 0x00, 0x40]);
        assert_eq!(bytes("ld sp,iy"), vec![0xFD, 0xF9]);
        assert_eq!(bytes("ld bc,#1234"), vec![0x01, 0x34, 0x12]);
    }

    #[test]
    fn encodes_index_register_loads() {
        assert_eq!(bytes("ld (ix+3),a"), vec![0xDD, 0x77, 0x03]);
        assert_eq!(bytes("ld (iy-2),#12"), vec![0xFD, 0x36, 0xFE, 0x12]);
        assert_eq!(bytes("ld b,(ix)"), vec![0xDD, 0x46, 0x00]);
        assert_eq!(bytes("ld xh,b"), vec![0xDD, 0x60]);
        assert_eq!(bytes("ld yl,yh"), vec![0xFD, 0x6C]);
        assert_eq!(bytes("ld a,xl"), vec![0xDD, 0x7D]);
        assert_eq!(error("ld h,xl"), ErrorCode::Z0604);
    }

    #[test]
    fn encodes_alu_operations() {
        assert_eq!(bytes("add a,b"), vec![0x80]);
        assert_eq!(bytes("adc (hl)"), vec![0x8E]);
        assert_eq!(bytes("sub #10"), vec![0xD6, 0x10]);
        assert_eq!(bytes("cp a,(ix+1)"), vec![0xDD, 0xBE, 0x01]);
        assert_eq!(bytes("xor yl"), vec![0xFD, 0xAD]);
        assert_eq!(bytes("sbc hl,de"), vec![0xED, 0x52]);
        assert_eq!(bytes("add ix,ix"), vec![0xDD, 0x29]);
        assert_eq!(bytes("add iy,sp"), vec![0xFD, 0x39]);
        assert_eq!(error("add b,c"), ErrorCode::Z0409);
        assert_eq!(error("and b,c"), ErrorCode::Z0408);
    }

    #[test]
    fn encodes_jumps_and_calls() {
        assert_eq!(bytes("jp target"), vec![0xC3, 0x10, 0x80]);
        assert_eq!(bytes("jp nz,target"), vec![0xC2, 0x10, 0x80]);
        assert_eq!(bytes("jp (hl)"), vec![0xE9]);
        assert_eq!(bytes("jp (ix)"), vec![0xDD, 0xE9]);
        assert_eq!(bytes("call c,target"), vec![0xDC, 0x10, 0x80]);
        assert_eq!(bytes("jr target"), vec![0x18, 0x0E]);
        assert_eq!(bytes("jr c,target"), vec![0x38, 0x0E]);
        assert_eq!(bytes("djnz target"), vec![0x10, 0x0E]);
        assert_eq!(bytes("ret pe"), vec![0xE8]);
        assert_eq!(error("jr po,target"), ErrorCode::Z0402);
        assert_eq!(error("jp z,(hl)"), ErrorCode::Z0111);
    }

    #[test]
    fn unresolved_operands_record_fixups() {
        let host = run("ld hl,later", false);
        assert_eq!(host.bytes, vec![0x21, 0x00, 0x00]);
        assert_eq!(host.fixups, vec![(1, NumberWidth::Bit16)]);
    }

    #[test]
    fn encodes_bit_and_shift_operations() {
        assert_eq!(bytes("bit 7,a"), vec![0xCB, 0x7F]);
        assert_eq!(bytes("set 0,(hl)"), vec![0xCB, 0xC6]);
        assert_eq!(bytes("res 1,(iy+4)"), vec![0xFD, 0xCB, 0x04, 0x8E]);
        assert_eq!(bytes("set 2,(ix+1),b"), vec![0xDD, 0xCB, 0x01, 0xD0]);
        assert_eq!(bytes("srl (hl)"), vec![0xCB, 0x3E]);
        assert_eq!(bytes("rlc (ix+2)"), vec![0xDD, 0xCB, 0x02, 0x06]);
        assert_eq!(bytes("sll e"), vec![0xCB, 0x33]);
        assert_eq!(error("bit 8,a"), ErrorCode::Z0407);
    }

    #[test]
    fn encodes_inc_dec_and_stack() {
        assert_eq!(bytes("inc a"), vec![0x3C]);
        assert_eq!(bytes("dec (hl)"), vec![0x35]);
        assert_eq!(bytes("inc (ix+5)"), vec![0xDD, 0x34, 0x05]);
        assert_eq!(bytes("dec xh"), vec![0xDD, 0x25]);
        assert_eq!(bytes("dec sp"), vec![0x3B]);
        assert_eq!(bytes("inc iy"), vec![0xFD, 0x23]);
        assert_eq!(bytes("push af"), vec![0xF5]);
        assert_eq!(bytes("pop ix"), vec![0xDD, 0xE1]);
        assert_eq!(error("pop #1234"), ErrorCode::Z0412);
        assert_eq!(error("push sp"), ErrorCode::Z0413);
    }

    #[test]
    fn encodes_io_and_misc() {
        assert_eq!(bytes("in a,(#fe)"), vec![0xDB, 0xFE]);
        assert_eq!(bytes("in e,(c)"), vec![0xED, 0x58]);
        assert_eq!(bytes("out (c),a"), vec![0xED, 0x79]);
        assert_eq!(bytes("out (c),0"), vec![0xED, 0x71]);
        assert_eq!(bytes("ex af,af'"), vec![0x08]);
        assert_eq!(bytes("ex (sp),ix"), vec![0xDD, 0xE3]);
        assert_eq!(bytes("rst #38"), vec![0xFF]);
        assert_eq!(bytes("im 2"), vec![0xED, 0x5E]);
        assert_eq!(bytes("ldir"), vec![0xED, 0xB0]);
        assert_eq!(error("rst #39"), ErrorCode::Z0404);
        assert_eq!(error("im 3"), ErrorCode::Z0405);
        assert_eq!(error("out (c),1"), ErrorCode::Z0406);
    }

    #[test]
    fn next_instructions_require_next_model() {
        assert_eq!(error("mirror"), ErrorCode::Z0414);
        let host = run("nextreg #07,a", true);
        assert_eq!(host.bytes, vec![0xED, 0x92, 0x07]);
        let host = run("push #1234", true);
        assert_eq!(host.bytes, vec![0xED, 0x8A, 0x12, 0x34]);
        let host = run("add de,#0102", true);
        assert_eq!(host.bytes, vec![0xED, 0x35, 0x02, 0x01]);
        let host = run("mul d,e", true);
        assert_eq!(host.bytes, vec![0xED, 0x30]);
        let host = run("test #55", true);
        assert_eq!(host.bytes, vec![0xED, 0x27, 0x55]);
    }
}
