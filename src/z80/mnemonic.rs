// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Z80 and Z80N (ZX Spectrum Next) mnemonics.

use serde::Serialize;

macro_rules! mnemonics {
    ($($variant:ident => [$($name:literal),+]),+ $(,)?) => {
        /// Instruction mnemonics, including the Z80N extensions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum Mnemonic {
            $($variant),+
        }

        impl Mnemonic {
            /// Resolve a lower-case mnemonic (or one of its aliases).
            pub fn from_name(lower: &str) -> Option<Self> {
                match lower {
                    $($($name)|+ => Some(Self::$variant),)+
                    _ => None,
                }
            }

            /// Canonical lower-case name.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => mnemonics!(@first $($name),+),)+
                }
            }
        }
    };
    (@first $first:literal $(, $rest:literal)*) => { $first };
}

mnemonics! {
    Adc => ["adc"],
    Add => ["add"],
    And => ["and"],
    Bit => ["bit"],
    Call => ["call"],
    Ccf => ["ccf"],
    Cp => ["cp"],
    Cpd => ["cpd"],
    Cpdr => ["cpdr"],
    Cpi => ["cpi"],
    Cpir => ["cpir"],
    Cpl => ["cpl"],
    Daa => ["daa"],
    Dec => ["dec"],
    Di => ["di"],
    Djnz => ["djnz"],
    Ei => ["ei"],
    Ex => ["ex"],
    Exx => ["exx"],
    Halt => ["halt"],
    Im => ["im"],
    In => ["in"],
    Inc => ["inc"],
    Ind => ["ind"],
    Indr => ["indr"],
    Ini => ["ini"],
    Inir => ["inir"],
    Jp => ["jp"],
    Jr => ["jr"],
    Ld => ["ld"],
    Ldd => ["ldd"],
    Lddr => ["lddr"],
    Ldi => ["ldi"],
    Ldir => ["ldir"],
    Neg => ["neg"],
    Nop => ["nop"],
    Or => ["or"],
    Otdr => ["otdr"],
    Otir => ["otir"],
    Out => ["out"],
    Outd => ["outd"],
    Outi => ["outi"],
    Pop => ["pop"],
    Push => ["push"],
    Res => ["res"],
    Ret => ["ret"],
    Reti => ["reti"],
    Retn => ["retn"],
    Rl => ["rl"],
    Rla => ["rla"],
    Rlc => ["rlc"],
    Rlca => ["rlca"],
    Rld => ["rld"],
    Rr => ["rr"],
    Rra => ["rra"],
    Rrc => ["rrc"],
    Rrca => ["rrca"],
    Rrd => ["rrd"],
    Rst => ["rst"],
    Sbc => ["sbc"],
    Scf => ["scf"],
    Set => ["set"],
    Sla => ["sla"],
    Sll => ["sll"],
    Sra => ["sra"],
    Srl => ["srl"],
    Sub => ["sub"],
    Xor => ["xor"],
    Ldix => ["ldix"],
    Ldws => ["ldws"],
    Ldirx => ["ldirx", "lirx"],
    Lddx => ["lddx"],
    Lddrx => ["lddrx", "ldrx"],
    Ldpirx => ["ldpirx", "lprx"],
    Outinb => ["outinb", "otib"],
    Mul => ["mul"],
    Swapnib => ["swapnib", "swap"],
    Mirror => ["mirror"],
    Nextreg => ["nextreg"],
    Pixeldn => ["pixeldn", "pxdn"],
    Pixelad => ["pixelad", "pxad"],
    Setae => ["setae", "stae"],
    Test => ["test"],
    Bsla => ["bsla"],
    Bsra => ["bsra"],
    Bsrl => ["bsrl"],
    Bsrf => ["bsrf"],
    Brlc => ["brlc"],
}

/// Operand-less instruction with a fixed opcode.
#[derive(Debug, Clone, Copy)]
pub struct SimpleEntry {
    pub mnemonic: Mnemonic,
    pub opcode: u16,
    pub next_only: bool,
}

const fn base(mnemonic: Mnemonic, opcode: u16) -> SimpleEntry {
    SimpleEntry {
        mnemonic,
        opcode,
        next_only: false,
    }
}

const fn z80n(mnemonic: Mnemonic, opcode: u16) -> SimpleEntry {
    SimpleEntry {
        mnemonic,
        opcode,
        next_only: true,
    }
}

/// Instructions encoded without operands. Two-byte opcodes carry the `0xED`
/// prefix in their high byte.
pub static SIMPLE_INSTRUCTIONS: &[SimpleEntry] = &[
    base(Mnemonic::Nop, 0x00),
    base(Mnemonic::Rlca, 0x07),
    base(Mnemonic::Rrca, 0x0F),
    base(Mnemonic::Rla, 0x17),
    base(Mnemonic::Rra, 0x1F),
    base(Mnemonic::Daa, 0x27),
    base(Mnemonic::Cpl, 0x2F),
    base(Mnemonic::Scf, 0x37),
    base(Mnemonic::Ccf, 0x3F),
    base(Mnemonic::Halt, 0x76),
    base(Mnemonic::Exx, 0xD9),
    base(Mnemonic::Di, 0xF3),
    base(Mnemonic::Ei, 0xFB),
    base(Mnemonic::Neg, 0xED44),
    base(Mnemonic::Retn, 0xED45),
    base(Mnemonic::Reti, 0xED4D),
    base(Mnemonic::Rrd, 0xED67),
    base(Mnemonic::Rld, 0xED6F),
    base(Mnemonic::Ldi, 0xEDA0),
    base(Mnemonic::Cpi, 0xEDA1),
    base(Mnemonic::Ini, 0xEDA2),
    base(Mnemonic::Outi, 0xEDA3),
    base(Mnemonic::Ldd, 0xEDA8),
    base(Mnemonic::Cpd, 0xEDA9),
    base(Mnemonic::Ind, 0xEDAA),
    base(Mnemonic::Outd, 0xEDAB),
    base(Mnemonic::Ldir, 0xEDB0),
    base(Mnemonic::Cpir, 0xEDB1),
    base(Mnemonic::Inir, 0xEDB2),
    base(Mnemonic::Otir, 0xEDB3),
    base(Mnemonic::Lddr, 0xEDB8),
    base(Mnemonic::Cpdr, 0xEDB9),
    base(Mnemonic::Indr, 0xEDBA),
    base(Mnemonic::Otdr, 0xEDBB),
    z80n(Mnemonic::Ldix, 0xEDA4),
    z80n(Mnemonic::Ldws, 0xEDA5),
    z80n(Mnemonic::Ldirx, 0xEDB4),
    z80n(Mnemonic::Lddx, 0xEDAC),
    z80n(Mnemonic::Lddrx, 0xEDBC),
    z80n(Mnemonic::Ldpirx, 0xEDB7),
    z80n(Mnemonic::Outinb, 0xED90),
    z80n(Mnemonic::Mul, 0xED30),
    z80n(Mnemonic::Swapnib, 0xED23),
    z80n(Mnemonic::Mirror, 0xED24),
    z80n(Mnemonic::Pixeldn, 0xED93),
    z80n(Mnemonic::Pixelad, 0xED94),
    z80n(Mnemonic::Setae, 0xED95),
    z80n(Mnemonic::Bsla, 0xED28),
    z80n(Mnemonic::Bsra, 0xED29),
    z80n(Mnemonic::Bsrl, 0xED2A),
    z80n(Mnemonic::Bsrf, 0xED2B),
    z80n(Mnemonic::Brlc, 0xED2C),
];

/// Look up the fixed encoding of an operand-less instruction.
pub fn lookup_simple(mnemonic: Mnemonic) -> Option<&'static SimpleEntry> {
    SIMPLE_INSTRUCTIONS
        .iter()
        .find(|entry| entry.mnemonic == mnemonic)
}
