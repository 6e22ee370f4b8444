// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Result of a compilation.

use std::collections::BTreeMap;
use std::io::{self, Write};

use indexmap::IndexMap;
use serde::Serialize;

use super::cli::VERSION;
use crate::core::assembler::error::AssemblerErrorInfo;
use crate::core::assembler::listing::{ListFileItem, ListingWriter};
use crate::core::preprocess::SourceFileItem;
use crate::core::segment::BinarySegment;
use crate::core::symbol_table::SymbolInfo;
use crate::z80::SpectrumModel;

/// Source position of an emitted instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLine {
    pub file_index: usize,
    pub line: u32,
    pub start_column: usize,
    pub end_column: usize,
}

/// A `.comparebin` request waiting for the final binary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareBinInfo {
    pub file_name: String,
    pub segment_index: usize,
    /// Segment length when the pragma was reached.
    pub segment_length: usize,
}

/// Everything a compilation produces.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblerOutput {
    pub source_file_list: Vec<SourceFileItem>,
    pub model_type: Option<SpectrumModel>,
    pub segments: Vec<BinarySegment>,
    pub errors: Vec<AssemblerErrorInfo>,
    /// Symbols of the root module.
    pub symbols: IndexMap<String, SymbolInfo>,
    /// Labels declared with a leading dot.
    pub output_symbols: IndexMap<String, SymbolInfo>,
    pub source_map: BTreeMap<u16, FileLine>,
    /// File index, then line number, to the addresses emitted for it.
    pub address_map: IndexMap<usize, IndexMap<u32, Vec<u16>>>,
    pub list_file_items: Vec<ListFileItem>,
    pub entry_address: Option<u16>,
    pub export_entry_address: Option<u16>,
    pub inject_options: IndexMap<String, bool>,
    pub on_success_commands: Vec<String>,
    pub trace_output: Vec<String>,
    pub compare_bins: Vec<CompareBinInfo>,
}

impl AssemblerOutput {
    pub fn error_count(&self) -> usize {
        self.errors.iter().filter(|err| !err.is_warning).count()
    }

    pub fn warning_count(&self) -> usize {
        self.errors.iter().filter(|err| err.is_warning).count()
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    pub(crate) fn add_to_address_map(&mut self, file_index: usize, line: u32, address: u16) {
        let addresses = self
            .address_map
            .entry(file_index)
            .or_default()
            .entry(line)
            .or_default();
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }

    /// All segments concatenated in emission order.
    pub fn binary(&self) -> Vec<u8> {
        self.segments
            .iter()
            .flat_map(|segment| segment.emitted_code.iter().copied())
            .collect()
    }

    pub fn write_listing<W: Write>(&self, out: W) -> io::Result<()> {
        let mut writer = ListingWriter::new(out);
        writer.header(&format!("zxasm Z80 Assembler v{VERSION}"))?;
        for item in &self.list_file_items {
            let bytes = item
                .segment_index
                .and_then(|idx| self.segments.get(idx))
                .and_then(|segment| {
                    segment
                        .emitted_code
                        .get(item.code_start_index..item.code_start_index + item.code_length)
                })
                .unwrap_or(&[]);
            writer.write_item(item, bytes)?;
        }
        writer.footer(
            self.error_count(),
            self.warning_count(),
            self.symbols
                .iter()
                .map(|(name, symbol)| (name.as_str(), &symbol.value)),
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
