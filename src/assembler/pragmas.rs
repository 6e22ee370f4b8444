// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Pragma processing.

use std::fs;

use super::{spectrum_byte, Assembler, CompareBinInfo, FixupKind, LineRef};
use crate::core::assembler::error::ErrorCode;
use crate::core::ast::{Expr, Pragma};
use crate::core::expr::ExpressionValue;
use crate::core::functions::SeededRandom;
use crate::core::preprocess::resolve_include_path;
use crate::core::segment::{BinarySegment, ADDRESS_SPACE, BANK_SIZE};
use crate::z80::SpectrumModel;

/// Start of the paged bank window.
const BANK_WINDOW: u16 = 0xC000;

/// Highest bank number.
const MAX_BANK: i64 = 7;

impl Assembler<'_> {
    pub(crate) fn apply_pragma(&mut self, pragma: &Pragma, label: Option<&str>) {
        match pragma {
            Pragma::Org(expr) => self.process_org(expr, label),
            Pragma::Bank { bank, offset } => self.process_bank(bank, offset.as_ref(), label),
            Pragma::Xorg(expr) => self.process_xorg(expr),
            Pragma::Ent(expr) => self.process_entry(expr, FixupKind::Ent),
            Pragma::Xent(expr) => self.process_entry(expr, FixupKind::Xent),
            Pragma::Disp(expr) => self.process_disp(expr),
            Pragma::Equ(expr) => self.process_equ(expr, label),
            Pragma::Var(expr) => self.process_var(expr, label),
            Pragma::Skip { target, fill } => self.process_skip(target, fill.as_ref()),
            Pragma::Align(expr) => self.process_align(expr.as_ref()),
            Pragma::Trace { hex, values } => self.process_trace(*hex, values),
            Pragma::RndSeed(expr) => self.process_rndseed(expr.as_ref()),
            Pragma::Error(expr) => self.process_error(expr),
            Pragma::IncludeBin {
                file,
                offset,
                length,
            } => self.process_includebin(file, offset.as_ref(), length.as_ref()),
            Pragma::CompareBin { file, .. } => self.process_comparebin(file),
            Pragma::InjectOpt(names) => {
                for name in names {
                    self.output
                        .inject_options
                        .insert(name.to_ascii_lowercase(), true);
                }
            }
            Pragma::OnSuccess(command) => self.output.on_success_commands.push(command.clone()),
            // consumed by the preprocessor
            Pragma::Model(_) => {}
            Pragma::Extern => {}
            data => self.apply_data_pragma(data),
        }
    }

    /// Pragmas that emit data bytes; the only ones a struct may contain.
    pub(crate) fn apply_data_pragma(&mut self, pragma: &Pragma) {
        match pragma {
            Pragma::DefB(values) => self.process_defb(values),
            Pragma::DefW(values) => self.process_defw(values),
            Pragma::DefM(expr) => self.process_string_data(expr, StringTail::None),
            Pragma::DefN(expr) => self.process_string_data(expr, StringTail::Zero),
            Pragma::DefC(expr) => self.process_string_data(expr, StringTail::Bit7),
            Pragma::DefH(expr) => self.process_defh(expr),
            Pragma::DefS { count, fill } => self.process_defs(count, fill.as_ref()),
            Pragma::FillB { count, fill } => self.process_fill(count, fill, false),
            Pragma::FillW { count, fill } => self.process_fill(count, fill, true),
            Pragma::DefG(pattern) => self.emit_graphics(pattern, false),
            Pragma::DefGx(expr) => {
                let value = self.evaluate_immediate(expr);
                match value {
                    ExpressionValue::Str(pattern) => self.emit_graphics(&pattern, true),
                    value if value.is_valid() => self.report(ErrorCode::Z0324, Vec::new()),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    // --- Layout ---

    fn process_org(&mut self, expr: &Expr, label: Option<&str>) {
        let Some(value) = self.evaluate_number(expr) else {
            return;
        };
        let address = value as u16;
        let segment = self.segment_mut();
        if segment.current_offset() > 0 {
            let max = ADDRESS_SPACE - usize::from(address);
            self.output.segments.push(BinarySegment::new(address, max));
        } else {
            segment.start_address = address;
        }
        if let Some(label) = label {
            self.fixup_temporary_scope();
            self.add_symbol(label, ExpressionValue::Integer(i64::from(address)));
        }
    }

    fn process_bank(&mut self, bank: &Expr, offset: Option<&Expr>, label: Option<&str>) {
        if label.is_some() {
            self.report(ErrorCode::Z0305, Vec::new());
            return;
        }
        let Some(bank) = self.evaluate_number(bank) else {
            return;
        };
        if matches!(self.effective_model(), None | Some(SpectrumModel::Spectrum48)) {
            self.report(ErrorCode::Z0308, Vec::new());
            return;
        }
        if !(0..=MAX_BANK).contains(&bank) {
            self.report(ErrorCode::Z0306, Vec::new());
            return;
        }
        let mut bank_offset = 0;
        if let Some(expr) = offset {
            let Some(value) = self.evaluate_number(expr) else {
                return;
            };
            if !(0..BANK_SIZE as i64).contains(&value) {
                self.report(ErrorCode::Z0307, Vec::new());
                return;
            }
            bank_offset = value as u16;
        }

        let start = BANK_WINDOW + bank_offset;
        let max = BANK_SIZE - usize::from(bank_offset);
        let segment = self.segment_mut();
        if segment.current_offset() != 0 || segment.bank.is_some() {
            self.output.segments.push(BinarySegment::new(start, max));
        }
        let bank = bank as u8;
        let used = self.output.segments[..self.output.segments.len() - 1]
            .iter()
            .any(|segment| segment.bank == Some(bank));
        if used {
            self.report(ErrorCode::Z0309, vec![bank.to_string()]);
            return;
        }
        let segment = self.segment_mut();
        segment.start_address = start;
        segment.bank = Some(bank);
        segment.bank_offset = bank_offset;
        segment.max_code_length = max;
    }

    fn process_xorg(&mut self, expr: &Expr) {
        let Some(value) = self.evaluate_number(expr) else {
            return;
        };
        let segment = self.segment_mut();
        if segment.current_offset() != 0 && segment.xorg_value.is_some() {
            self.report(ErrorCode::Z0314, Vec::new());
        } else {
            segment.xorg_value = Some(value as u16);
        }
    }

    fn process_entry(&mut self, expr: &Expr, kind: FixupKind) {
        if !self.is_in_global_scope() && self.should_report_in_scope(ErrorCode::Z0310) {
            let name = if kind == FixupKind::Ent { ".ent" } else { ".xent" };
            self.report(ErrorCode::Z0310, vec![name.to_string()]);
        }
        let value = self.evaluate(expr);
        if value == ExpressionValue::NonEvaluated {
            self.record_fixup(kind, Some(expr), None);
            return;
        }
        let Some(address) = self.numeric(&value) else {
            return;
        };
        let address = Some(address as u16);
        if kind == FixupKind::Ent {
            self.output.entry_address = address;
        } else {
            self.output.export_entry_address = address;
        }
    }

    fn process_disp(&mut self, expr: &Expr) {
        let Some(value) = self.evaluate_number(expr) else {
            return;
        };
        let segment = self.segment_mut();
        segment.displacement = Some(value);
        segment.disp_offset = segment.current_offset();
    }

    fn process_skip(&mut self, target: &Expr, fill: Option<&Expr>) {
        let Some(target) = self.evaluate_number(target) else {
            return;
        };
        let fill = match fill {
            Some(expr) => match self.evaluate_number(expr) {
                Some(value) => value as u8,
                None => return,
            },
            None => 0xFF,
        };
        let current = i64::from(self.current_address());
        if target < current {
            self.report(ErrorCode::Z0313, vec![target.to_string(), current.to_string()]);
            return;
        }
        for _ in current..target {
            self.emit_data(fill);
        }
    }

    fn process_align(&mut self, expr: Option<&Expr>) {
        let alignment = match expr {
            Some(expr) => match self.evaluate_number(expr) {
                Some(value) => value,
                None => return,
            },
            None => 0x100,
        };
        if !(1..=BANK_SIZE as i64).contains(&alignment) {
            self.report(ErrorCode::Z0318, vec![alignment.to_string()]);
            return;
        }
        let current = i64::from(self.current_address());
        let padding = (alignment - current % alignment) % alignment;
        for _ in 0..padding {
            self.emit_data(0);
        }
    }

    // --- Symbols ---

    fn process_equ(&mut self, expr: &Expr, label: Option<&str>) {
        let Some(label) = label else {
            self.report(ErrorCode::Z0304, Vec::new());
            return;
        };
        self.fixup_temporary_scope();
        if self.symbol_exists(label) {
            self.report(ErrorCode::Z0501, vec![label.to_string()]);
            return;
        }
        let value = self.evaluate(expr);
        match value {
            ExpressionValue::NonEvaluated => {
                let name = self.tree.normalize(label);
                self.record_fixup(FixupKind::Equ, Some(expr), Some(name));
            }
            ExpressionValue::Error => {}
            value => self.add_symbol(label, value),
        }
    }

    fn process_var(&mut self, expr: &Expr, label: Option<&str>) {
        let Some(label) = label else {
            self.report(ErrorCode::Z0311, Vec::new());
            return;
        };
        self.fixup_temporary_scope();
        let value = self.evaluate_immediate(expr);
        if !value.is_valid() {
            return;
        }
        if self.symbol_exists(label) {
            self.report(ErrorCode::Z0312, Vec::new());
            return;
        }
        self.tree.set_variable(self.module, label, value);
    }

    // --- Data ---

    fn process_defb(&mut self, values: &[Expr]) {
        for expr in values {
            match self.evaluate(expr) {
                ExpressionValue::NonEvaluated => {
                    self.record_fixup(FixupKind::Bit8, Some(expr), None);
                    self.emit_data(0);
                }
                ExpressionValue::Str(text) => {
                    if self.options.flexible_def_pragmas {
                        for c in text.chars() {
                            self.emit_data(spectrum_byte(c));
                        }
                    } else {
                        self.report(ErrorCode::Z0601, Vec::new());
                    }
                }
                ExpressionValue::Error => {}
                value => self.emit_data(value.as_long().unwrap_or(0) as u8),
            }
        }
    }

    fn process_defw(&mut self, values: &[Expr]) {
        for expr in values {
            match self.evaluate(expr) {
                ExpressionValue::NonEvaluated => {
                    self.record_fixup(FixupKind::Bit16, Some(expr), None);
                    self.emit_data_word(0);
                }
                ExpressionValue::Str(text) => {
                    if self.options.flexible_def_pragmas {
                        for c in text.chars() {
                            self.emit_data_word(u16::from(spectrum_byte(c)));
                        }
                    } else {
                        self.report(ErrorCode::Z0601, Vec::new());
                    }
                }
                ExpressionValue::Error => {}
                value => self.emit_data_word(value.as_long().unwrap_or(0) as u16),
            }
        }
    }

    fn process_string_data(&mut self, expr: &Expr, tail: StringTail) {
        let value = self.evaluate_immediate(expr);
        let mut bytes: Vec<u8> = match value {
            ExpressionValue::Str(text) => text.chars().map(spectrum_byte).collect(),
            value if !value.is_valid() => return,
            value if self.options.flexible_def_pragmas => {
                vec![value.as_long().unwrap_or(0) as u8]
            }
            _ => {
                self.report(ErrorCode::Z0315, Vec::new());
                return;
            }
        };
        match tail {
            StringTail::None => {}
            StringTail::Zero => bytes.push(0),
            StringTail::Bit7 => {
                if let Some(last) = bytes.last_mut() {
                    *last |= 0x80;
                }
            }
        }
        for byte in bytes {
            self.emit_data(byte);
        }
    }

    fn process_defh(&mut self, expr: &Expr) {
        let value = self.evaluate_immediate(expr);
        let text = match value {
            ExpressionValue::Str(text) => text,
            value if value.is_valid() => {
                self.report(ErrorCode::Z0316, Vec::new());
                return;
            }
            _ => return,
        };
        let Some(bytes) = parse_hex_bytes(&text) else {
            self.report(ErrorCode::Z0317, Vec::new());
            return;
        };
        for byte in bytes {
            self.emit_data(byte);
        }
    }

    fn process_defs(&mut self, count: &Expr, fill: Option<&Expr>) {
        let Some(count) = self.evaluate_number(count) else {
            return;
        };
        let fill = match fill {
            Some(expr) => match self.evaluate_number(expr) {
                Some(value) => value as u8,
                None => return,
            },
            None => 0,
        };
        for _ in 0..count {
            self.emit_data(fill);
        }
    }

    fn process_fill(&mut self, count: &Expr, fill: &Expr, word: bool) {
        let Some(count) = self.evaluate_number(count) else {
            return;
        };
        let Some(fill) = self.evaluate_number(fill) else {
            return;
        };
        for _ in 0..count {
            if word {
                self.emit_data_word(fill as u16);
            } else {
                self.emit_data(fill as u8);
            }
        }
    }

    /// Emit a `.defg`/`.defgx` bit pattern, eight pixels per byte.
    fn emit_graphics(&mut self, pattern: &str, allow_alignment: bool) {
        match graphics_bytes(pattern, allow_alignment) {
            Some(bytes) => {
                for byte in bytes {
                    self.emit_data(byte);
                }
            }
            None => self.report(ErrorCode::Z0325, Vec::new()),
        }
    }

    // --- Diagnostics ---

    fn process_trace(&mut self, hex: bool, values: &[Expr]) {
        let mut message = String::new();
        for expr in values {
            match self.evaluate_immediate(expr) {
                ExpressionValue::Bool(value) => message.push_str(&value.to_string()),
                ExpressionValue::Integer(value) => {
                    if !hex {
                        message.push_str(&value.to_string());
                    } else if value > 0x1_0000 {
                        message.push_str(&format!("{value:08x}"));
                    } else {
                        message.push_str(&format!("{value:04x}"));
                    }
                }
                ExpressionValue::Real(value) => message.push_str(&value.to_string()),
                ExpressionValue::Str(text) => {
                    if hex {
                        for c in text.chars() {
                            message.push_str(&format!("{:02x}", spectrum_byte(c)));
                        }
                    } else {
                        message.push_str(&text);
                    }
                }
                ExpressionValue::NonEvaluated | ExpressionValue::Error => {}
            }
        }
        self.trace_message(message);
    }

    fn process_rndseed(&mut self, expr: Option<&Expr>) {
        self.rng = match expr {
            Some(expr) => match self.evaluate_number(expr) {
                Some(seed) => SeededRandom::new(seed),
                None => return,
            },
            None => SeededRandom::from_time(),
        };
    }

    fn process_error(&mut self, expr: &Expr) {
        let value = self.evaluate_immediate(expr);
        if !value.is_valid() {
            return;
        }
        let text = value.as_string().unwrap_or_default();
        self.report(ErrorCode::Z2000, vec![text]);
    }

    // --- Binary files ---

    fn process_includebin(&mut self, file: &Expr, offset: Option<&Expr>, length: Option<&Expr>) {
        let file_name = match self.evaluate_immediate(file) {
            ExpressionValue::Str(name) => name,
            value if value.is_valid() => {
                self.report(ErrorCode::Z0319, Vec::new());
                return;
            }
            _ => return,
        };
        let Some(offset) = self.optional_position(offset, ErrorCode::Z0320) else {
            return;
        };
        let Some(length) = self.optional_position(length, ErrorCode::Z0321) else {
            return;
        };

        let path = resolve_include_path(&self.current_file_name(), &file_name);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(err) => {
                self.report(ErrorCode::Z0322, vec![err.to_string()]);
                return;
            }
        };
        let start = offset.unwrap_or(0);
        if start >= contents.len() && !(start == 0 && contents.is_empty()) {
            self.report(ErrorCode::Z0320, Vec::new());
            return;
        }
        let length = length.unwrap_or(contents.len() - start);
        if start + length > contents.len() {
            self.report(ErrorCode::Z0321, Vec::new());
            return;
        }

        let segment = self.segment_mut();
        let used = segment.current_offset();
        if used + length > segment.max_code_length {
            self.report(ErrorCode::Z0323, Vec::new());
            return;
        }
        for &byte in &contents[start..start + length] {
            self.emit_data(byte);
        }
    }

    /// An optional non-negative integer argument. The outer `None` means
    /// the pragma must stop.
    fn optional_position(&mut self, expr: Option<&Expr>, negative: ErrorCode) -> Option<Option<usize>> {
        let Some(expr) = expr else {
            return Some(None);
        };
        let value = self.evaluate_immediate(expr);
        match value {
            ExpressionValue::Integer(value) if value < 0 => {
                self.report(negative, Vec::new());
                None
            }
            ExpressionValue::Integer(value) => Some(Some(value as usize)),
            value if value.is_valid() => {
                self.report(ErrorCode::Z0602, Vec::new());
                None
            }
            _ => None,
        }
    }

    fn process_comparebin(&mut self, file: &Expr) {
        let file_name = match self.evaluate_immediate(file) {
            ExpressionValue::Str(name) => name,
            value if value.is_valid() => {
                self.report(ErrorCode::Z0319, Vec::new());
                return;
            }
            _ => return,
        };
        if self.struct_invocation.is_some() || self.in_struct_cloning {
            self.report(ErrorCode::Z0331, Vec::new());
            return;
        }
        let segment_length = self.segment_mut().current_offset();
        self.output.compare_bins.push(CompareBinInfo {
            file_name,
            segment_index: self.output.segments.len() - 1,
            segment_length,
        });
        self.compare_lines.push(self.current_line.clone());
    }

    /// Check every `.comparebin` request against the final segments.
    pub(crate) fn compare_binaries(&mut self) {
        let requests: Vec<(CompareBinInfo, LineRef)> = self
            .output
            .compare_bins
            .iter()
            .cloned()
            .zip(self.compare_lines.iter().cloned())
            .collect();
        for (info, line) in requests {
            self.current_line = line.clone();
            let Some(Pragma::CompareBin { offset, length, .. }) = line
                .get()
                .and_then(|source| match &source.kind {
                    crate::core::ast::LineKind::Pragma(pragma) => Some(pragma),
                    _ => None,
                })
                .cloned()
            else {
                continue;
            };
            self.compare_binary(&info, offset.as_ref(), length.as_ref());
        }
    }

    fn compare_binary(&mut self, info: &CompareBinInfo, offset: Option<&Expr>, length: Option<&Expr>) {
        let Some(offset) = self.optional_position(offset, ErrorCode::Z0327) else {
            return;
        };
        let Some(length) = self.optional_position(length, ErrorCode::Z0328) else {
            return;
        };
        let path = resolve_include_path(&self.current_file_name(), &info.file_name);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(err) => {
                self.report(
                    ErrorCode::Z0329,
                    vec![info.file_name.clone(), err.to_string()],
                );
                return;
            }
        };
        let start = offset.unwrap_or(0);
        if start > contents.len() {
            self.report(ErrorCode::Z0327, Vec::new());
            return;
        }
        let length = length.unwrap_or(contents.len() - start);
        if start + length > contents.len() {
            self.report(ErrorCode::Z0328, Vec::new());
            return;
        }

        let Some(segment) = self.output.segments.get(info.segment_index) else {
            return;
        };
        let code = &segment.emitted_code[..info.segment_length.min(segment.emitted_code.len())];
        let expected = &contents[start..start + length];
        if code.len() > expected.len() {
            let message = format!(
                "Current binary length is {:04X}, but the file segment is only {:04X}",
                code.len(),
                expected.len()
            );
            self.report(ErrorCode::Z0330, vec![message]);
            return;
        }
        let mismatch = code
            .iter()
            .zip(expected)
            .enumerate()
            .find(|(_, (emitted, file))| emitted != file);
        if let Some((index, (emitted, file))) = mismatch {
            let message = format!(
                "Output segment at offset {index} is {emitted:02X}, but in binary it is {file:02X}"
            );
            self.report(ErrorCode::Z0330, vec![message]);
        }
    }

    fn current_file_name(&self) -> String {
        self.current_line
            .get()
            .map(|line| self.file_name(line.file_index))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
enum StringTail {
    None,
    /// `.defn`: a terminating zero byte.
    Zero,
    /// `.defc`: bit 7 set on the last character.
    Bit7,
}

fn parse_hex_bytes(text: &str) -> Option<Vec<u8>> {
    let digits = text.as_bytes();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

/// Bytes of a graphics pattern.
///
/// Text after `;` or `//` is a comment. `defgx` patterns may start with
/// `<` (pad on the right) or `>` (pad on the left) to align a pattern that
/// is not a multiple of eight pixels. `.`, `-` and `_` are clear pixels,
/// anything else is set. Returns `None` for an empty pattern.
fn graphics_bytes(pattern: &str, allow_alignment: bool) -> Option<Vec<u8>> {
    let mut text = pattern;
    if let Some(pos) = text.find(';') {
        text = &text[..pos];
    }
    if let Some(pos) = text.find("//") {
        text = &text[..pos];
    }
    let mut text = text.trim();
    let mut align_right = false;
    if allow_alignment {
        if let Some(rest) = text.strip_prefix('<') {
            text = rest;
        } else if let Some(rest) = text.strip_prefix('>') {
            text = rest;
            align_right = true;
        }
    }
    let mut pixels: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if pixels.is_empty() {
        return None;
    }
    let padding = (8 - pixels.len() % 8) % 8;
    if align_right {
        pixels.splice(0..0, std::iter::repeat('_').take(padding));
    } else {
        pixels.extend(std::iter::repeat('_').take(padding));
    }
    let bytes = pixels
        .chunks(8)
        .map(|chunk| {
            chunk.iter().fold(0u8, |acc, &pixel| {
                let bit = u8::from(!matches!(pixel, '.' | '-' | '_'));
                (acc << 1) | bit
            })
        })
        .collect();
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_strings() {
        assert_eq!(parse_hex_bytes("00A1ff"), Some(vec![0x00, 0xA1, 0xFF]));
        assert_eq!(parse_hex_bytes("123"), None);
        assert_eq!(parse_hex_bytes("zz"), None);
    }

    #[test]
    fn graphics_patterns_fill_whole_bytes() {
        assert_eq!(graphics_bytes("....OOOO", false), Some(vec![0x0F]));
        assert_eq!(graphics_bytes("O O O O ; comment", false), Some(vec![0xF0]));
        assert_eq!(graphics_bytes("OOOOOOOOO", false), Some(vec![0xFF, 0x80]));
        assert_eq!(graphics_bytes("  // nothing", false), None);
    }

    #[test]
    fn defgx_alignment_pads_on_the_chosen_side() {
        assert_eq!(graphics_bytes(">OO", true), Some(vec![0x03]));
        assert_eq!(graphics_bytes("<OO", true), Some(vec![0xC0]));
    }
}
