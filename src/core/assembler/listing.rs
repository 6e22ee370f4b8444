// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Listing file generation.

use std::io::Write;

use serde::Serialize;

use crate::core::expr::ExpressionValue;

/// Bytes shown on a single listing row.
const BYTES_PER_ROW: usize = 8;

/// One emitted source line, as recorded for the listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFileItem {
    pub file_index: usize,
    pub address: u16,
    pub line_number: u32,
    pub segment_index: Option<usize>,
    pub code_start_index: usize,
    pub code_length: usize,
    pub source_text: String,
    pub is_macro_invocation: bool,
}

/// Writer for listing file output.
pub struct ListingWriter<W: Write> {
    out: W,
}

impl<W: Write> ListingWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn header(&mut self, title: &str) -> std::io::Result<()> {
        writeln!(self.out, "{title}")?;
        writeln!(self.out, "ADDR    BYTES                    LINE  SOURCE")?;
        writeln!(self.out, "------  -----------------------  ----  ------")?;
        Ok(())
    }

    /// Write one item; `bytes` are the bytes it emitted. Long runs continue
    /// on extra rows without the source column.
    pub fn write_item(&mut self, item: &ListFileItem, bytes: &[u8]) -> std::io::Result<()> {
        let marker = if item.is_macro_invocation { "+" } else { " " };
        if bytes.is_empty() {
            return writeln!(
                self.out,
                "{:<6}  {:<23}  {:>4}{marker} {}",
                "----", "", item.line_number, item.source_text
            );
        }
        for (row, chunk) in bytes.chunks(BYTES_PER_ROW).enumerate() {
            let addr = item.address.wrapping_add((row * BYTES_PER_ROW) as u16);
            if row == 0 {
                writeln!(
                    self.out,
                    "{:04X}    {:<23}  {:>4}{marker} {}",
                    addr,
                    format_bytes(chunk),
                    item.line_number,
                    item.source_text
                )?;
            } else {
                writeln!(self.out, "{:04X}    {}", addr, format_bytes(chunk))?;
            }
        }
        Ok(())
    }

    pub fn footer<'a, I>(&mut self, errors: usize, warnings: usize, symbols: I) -> std::io::Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a ExpressionValue)>,
    {
        writeln!(self.out, "\nErrors: {errors}  Warnings: {warnings}")?;
        writeln!(self.out, "\nSYMBOL TABLE\n")?;
        for (name, value) in symbols {
            writeln!(self.out, "{:<24} {}", name, format_value(value))?;
        }
        Ok(())
    }
}

/// Format bytes as hex string for listing.
pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_value(value: &ExpressionValue) -> String {
    match value {
        ExpressionValue::Integer(v) if (0..=0xFFFF).contains(v) => format!("${v:04X}"),
        ExpressionValue::Integer(v) => v.to_string(),
        ExpressionValue::Bool(v) => v.to_string(),
        ExpressionValue::Real(v) => v.to_string(),
        ExpressionValue::Str(v) => format!("\"{v}\""),
        ExpressionValue::NonEvaluated | ExpressionValue::Error => "?".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(address: u16, text: &str) -> ListFileItem {
        ListFileItem {
            file_index: 0,
            address,
            line_number: 3,
            segment_index: Some(0),
            code_start_index: 0,
            code_length: 0,
            source_text: text.to_string(),
            is_macro_invocation: false,
        }
    }

    #[test]
    fn writes_rows_for_long_byte_runs() {
        let mut out = Vec::new();
        let mut writer = ListingWriter::new(&mut out);
        writer
            .write_item(&item(0x8000, ".defs 10"), &[0; 10])
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        let rows: Vec<_> = text.lines().collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("8000    00 00 00 00 00 00 00 00"));
        assert!(rows[0].ends_with("3  .defs 10"));
        assert_eq!(rows[1], "8008    00 00");
    }

    #[test]
    fn footer_lists_symbols() {
        let mut out = Vec::new();
        let mut writer = ListingWriter::new(&mut out);
        let value = ExpressionValue::Integer(0x8000);
        writer.footer(0, 1, [("main", &value)]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Errors: 0  Warnings: 1"));
        assert!(text
            .lines()
            .any(|line| line.starts_with("main ") && line.ends_with(" $8000")));
    }
}
