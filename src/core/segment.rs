// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Binary output segments.

use serde::Serialize;

use crate::core::assembler::error::ErrorCode;

/// Size of the Z80 address space.
pub const ADDRESS_SPACE: usize = 0x1_0000;

/// Size of a ZX Spectrum 128 memory bank.
pub const BANK_SIZE: usize = 0x4000;

/// A contiguous run of emitted bytes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinarySegment {
    pub start_address: u16,
    pub bank: Option<u8>,
    pub bank_offset: u16,
    /// `.disp` value applied to addresses from `disp_offset` on.
    pub displacement: Option<i64>,
    #[serde(skip)]
    pub disp_offset: usize,
    pub xorg_value: Option<u16>,
    pub max_code_length: usize,
    pub emitted_code: Vec<u8>,
    /// Offset of the instruction being emitted.
    #[serde(skip)]
    pub current_instruction_offset: usize,
    #[serde(skip)]
    pub overflow_detected: bool,
}

impl BinarySegment {
    pub fn new(start_address: u16, max_code_length: usize) -> Self {
        Self {
            start_address,
            bank: None,
            bank_offset: 0,
            displacement: None,
            disp_offset: 0,
            xorg_value: None,
            max_code_length,
            emitted_code: Vec::new(),
            current_instruction_offset: 0,
            overflow_detected: false,
        }
    }

    pub fn current_offset(&self) -> usize {
        self.emitted_code.len()
    }

    /// Logical address of the byte at `offset`, honoring `.disp`.
    pub fn address_of(&self, offset: usize) -> u16 {
        let disp = match self.displacement {
            Some(disp) if offset >= self.disp_offset => disp,
            _ => 0,
        };
        (i64::from(self.start_address) + disp + offset as i64).rem_euclid(ADDRESS_SPACE as i64)
            as u16
    }

    /// Address where the next byte lands.
    pub fn current_address(&self) -> u16 {
        self.address_of(self.emitted_code.len())
    }

    /// Append a byte. The first byte that does not fit latches the overflow
    /// flag and returns the matching error; later ones are dropped silently.
    pub fn emit_byte(&mut self, data: u8) -> Option<ErrorCode> {
        let len = self.emitted_code.len();
        if len >= self.max_code_length || usize::from(self.start_address) + len >= ADDRESS_SPACE
        {
            if self.overflow_detected {
                return None;
            }
            self.overflow_detected = true;
            return Some(if len >= self.max_code_length {
                ErrorCode::Z0411
            } else {
                ErrorCode::Z0410
            });
        }
        self.emitted_code.push(data);
        None
    }

    /// Overwrite an already emitted byte.
    pub fn patch(&mut self, offset: usize, data: u8) {
        if let Some(byte) = self.emitted_code.get_mut(offset) {
            *byte = data;
        }
    }
}
