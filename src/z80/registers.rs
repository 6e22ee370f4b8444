// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Z80 register and condition-code definitions.

use serde::Serialize;

/// Every register name the Z80/Z80N operand grammar accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Register {
    A,
    B,
    C,
    D,
    E,
    H,
    L,
    I,
    R,
    Xh,
    Xl,
    Yh,
    Yl,
    Bc,
    De,
    Hl,
    Sp,
    Ix,
    Iy,
    Af,
    AfAlt,
}

impl Register {
    /// Resolve a lower-case register name. `ixh`/`xh` style aliases map to
    /// the same register.
    pub fn from_name(lower: &str) -> Option<Self> {
        let reg = match lower {
            "a" => Self::A,
            "b" => Self::B,
            "c" => Self::C,
            "d" => Self::D,
            "e" => Self::E,
            "h" => Self::H,
            "l" => Self::L,
            "i" => Self::I,
            "r" => Self::R,
            "xh" | "ixh" => Self::Xh,
            "xl" | "ixl" => Self::Xl,
            "yh" | "iyh" => Self::Yh,
            "yl" | "iyl" => Self::Yl,
            "bc" => Self::Bc,
            "de" => Self::De,
            "hl" => Self::Hl,
            "sp" => Self::Sp,
            "ix" => Self::Ix,
            "iy" => Self::Iy,
            "af" => Self::Af,
            "af'" => Self::AfAlt,
            _ => return None,
        };
        Some(reg)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
            Self::C => "c",
            Self::D => "d",
            Self::E => "e",
            Self::H => "h",
            Self::L => "l",
            Self::I => "i",
            Self::R => "r",
            Self::Xh => "xh",
            Self::Xl => "xl",
            Self::Yh => "yh",
            Self::Yl => "yl",
            Self::Bc => "bc",
            Self::De => "de",
            Self::Hl => "hl",
            Self::Sp => "sp",
            Self::Ix => "ix",
            Self::Iy => "iy",
            Self::Af => "af",
            Self::AfAlt => "af'",
        }
    }

    /// Position in the `b c d e h l (hl) a` encoding order.
    pub fn reg8_index(self) -> Option<u8> {
        match self {
            Self::B => Some(0),
            Self::C => Some(1),
            Self::D => Some(2),
            Self::E => Some(3),
            Self::H => Some(4),
            Self::L => Some(5),
            Self::A => Some(7),
            _ => None,
        }
    }

    /// Position in the `bc de hl sp` encoding order.
    pub fn reg16_index(self) -> Option<u8> {
        match self {
            Self::Bc => Some(0),
            Self::De => Some(1),
            Self::Hl => Some(2),
            Self::Sp => Some(3),
            _ => None,
        }
    }

    pub fn is_reg8_std(self) -> bool {
        self.reg8_index().is_some()
    }

    pub fn is_reg8_spec(self) -> bool {
        matches!(self, Self::I | Self::R)
    }

    pub fn is_reg8_idx(self) -> bool {
        matches!(self, Self::Xh | Self::Xl | Self::Yh | Self::Yl)
    }

    pub fn is_reg8(self) -> bool {
        self.is_reg8_std() || self.is_reg8_spec() || self.is_reg8_idx()
    }

    pub fn is_reg16_std(self) -> bool {
        self.reg16_index().is_some()
    }

    pub fn is_reg16_idx(self) -> bool {
        matches!(self, Self::Ix | Self::Iy)
    }

    pub fn is_reg16(self) -> bool {
        self.is_reg16_std() || self.is_reg16_idx()
    }

    /// `0xDD` for the IX family, `0xFD` for the IY family.
    pub fn index_prefix(self) -> Option<u8> {
        match self {
            Self::Ix | Self::Xh | Self::Xl => Some(0xDD),
            Self::Iy | Self::Yh | Self::Yl => Some(0xFD),
            _ => None,
        }
    }

    /// True for the low half of an index register.
    pub fn is_low_half(self) -> bool {
        matches!(self, Self::Xl | Self::Yl)
    }

    /// High byte register of a 16-bit pair (`hreg`).
    pub fn high_half(self) -> Option<Self> {
        match self {
            Self::Bc => Some(Self::B),
            Self::De => Some(Self::D),
            Self::Hl => Some(Self::H),
            Self::Ix => Some(Self::Xh),
            Self::Iy => Some(Self::Yh),
            Self::Af => Some(Self::A),
            _ => None,
        }
    }

    /// Low byte register of a 16-bit pair (`lreg`).
    pub fn low_half(self) -> Option<Self> {
        match self {
            Self::Bc => Some(Self::C),
            Self::De => Some(Self::E),
            Self::Hl => Some(Self::L),
            Self::Ix => Some(Self::Xl),
            Self::Iy => Some(Self::Yl),
            _ => None,
        }
    }
}

/// Branch condition codes in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Condition {
    Nz,
    Z,
    Nc,
    C,
    Po,
    Pe,
    P,
    M,
}

impl Condition {
    pub fn from_name(lower: &str) -> Option<Self> {
        let cond = match lower {
            "nz" => Self::Nz,
            "z" => Self::Z,
            "nc" => Self::Nc,
            "c" => Self::C,
            "po" => Self::Po,
            "pe" => Self::Pe,
            "p" => Self::P,
            "m" => Self::M,
            _ => return None,
        };
        Some(cond)
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nz => "nz",
            Self::Z => "z",
            Self::Nc => "nc",
            Self::C => "c",
            Self::Po => "po",
            Self::Pe => "pe",
            Self::P => "p",
            Self::M => "m",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_index_register_aliases() {
        assert_eq!(Register::from_name("ixh"), Some(Register::Xh));
        assert_eq!(Register::from_name("yl"), Some(Register::Yl));
        assert_eq!(Register::from_name("af'"), Some(Register::AfAlt));
        assert_eq!(Register::from_name("ld"), None);
    }

    #[test]
    fn encodes_register_orders() {
        assert_eq!(Register::A.reg8_index(), Some(7));
        assert_eq!(Register::L.reg8_index(), Some(5));
        assert_eq!(Register::Sp.reg16_index(), Some(3));
        assert_eq!(Register::Yh.index_prefix(), Some(0xFD));
        assert_eq!(Condition::Pe.index(), 5);
    }

    #[test]
    fn splits_register_pairs() {
        assert_eq!(Register::Bc.high_half(), Some(Register::B));
        assert_eq!(Register::Iy.low_half(), Some(Register::Yl));
        assert_eq!(Register::Af.low_half(), None);
    }
}
