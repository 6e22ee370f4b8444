// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Zilog Z80 and ZX Spectrum Next (Z80N) support.
//!
//! - [`registers`] - register and condition names with their encoding order
//! - [`mnemonic`] - mnemonics and the fixed-opcode instruction table
//! - [`encoder`] - operand-driven instruction encoding

pub mod encoder;
pub mod mnemonic;
pub mod registers;

use serde::{Deserialize, Serialize};

pub use mnemonic::{lookup_simple, Mnemonic, SimpleEntry};
pub use registers::{Condition, Register};

/// ZX Spectrum model the code is assembled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpectrumModel {
    Spectrum48,
    Spectrum128,
    SpectrumP3,
    Next,
}

impl SpectrumModel {
    /// Resolve a model identifier such as `spectrum128` (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SPECTRUM48" => Some(Self::Spectrum48),
            "SPECTRUM128" => Some(Self::Spectrum128),
            "SPECTRUMP3" => Some(Self::SpectrumP3),
            "NEXT" => Some(Self::Next),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Spectrum48 => "Spectrum48",
            Self::Spectrum128 => "Spectrum128",
            Self::SpectrumP3 => "SpectrumP3",
            Self::Next => "Next",
        }
    }

    /// Models with paged memory banks.
    pub fn has_banks(self) -> bool {
        !matches!(self, Self::Spectrum48)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_model_names() {
        assert_eq!(SpectrumModel::from_name("spectrum128"), Some(SpectrumModel::Spectrum128));
        assert_eq!(SpectrumModel::from_name("NEXT"), Some(SpectrumModel::Next));
        assert_eq!(SpectrumModel::from_name("zx81"), None);
        assert!(!SpectrumModel::Spectrum48.has_banks());
        assert_eq!(SpectrumModel::SpectrumP3.name(), "SpectrumP3");
    }
}
