// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Deferred patches for values that are not known when code is emitted.
//!
//! Every fixup is stored once in [`Assembler::fixups`]; local scopes and
//! modules only keep indexes into that list. A scope's fixups are retried
//! when the scope closes and the root module retries whatever is left at
//! the end of the compilation, reporting what still does not resolve.

use indexmap::IndexMap;
use std::collections::HashSet;
use tracing::trace;

use super::{Assembler, AsmEvalContext, LineRef};
use crate::core::assembler::error::ErrorCode;
use crate::core::ast::Expr;
use crate::core::expr::{eval_expr, ready_to_evaluate, ExpressionValue};
use crate::core::symbol_table::{ModuleId, SymbolInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    Jr,
    Bit8,
    Bit16,
    Bit16Be,
    Equ,
    Ent,
    Xent,
    /// Bytes written by field assignments of a struct invocation.
    Struct,
    FieldBit8,
    FieldBit16,
}

#[derive(Debug, Clone)]
pub struct FixupEntry {
    pub kind: FixupKind,
    pub module: ModuleId,
    pub segment: usize,
    pub offset: usize,
    /// Value of `$` where the fixup was recorded.
    pub address: u16,
    pub loop_counter: Option<i64>,
    pub expr: Option<Expr>,
    /// Symbol an `.equ` fixup binds.
    pub label: Option<String>,
    pub struct_bytes: IndexMap<usize, u8>,
    /// Variables visible when the fixup was recorded.
    pub vars: IndexMap<String, ExpressionValue>,
    pub line: LineRef,
    pub resolved: bool,
}

/// State of the struct invocation whose field assignments are collected.
#[derive(Debug, Clone)]
pub(crate) struct StructInvocation {
    pub name: String,
    pub size: usize,
    pub fields: IndexMap<String, usize>,
    /// Segment offset of the first struct byte.
    pub start_offset: usize,
    /// Offset of the next field byte, relative to the struct.
    pub offset: usize,
    pub bytes: IndexMap<usize, u8>,
    /// Struct offsets patched by field fixups instead.
    pub deferred: HashSet<usize>,
    pub line: LineRef,
}

/// Symbol table a fixup pass runs against.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FixupScope {
    Local(ModuleId, usize),
    Module(ModuleId),
}

impl Assembler<'_> {
    pub(crate) fn record_fixup(
        &mut self,
        kind: FixupKind,
        expr: Option<&Expr>,
        label: Option<String>,
    ) {
        self.record_fixup_at(kind, expr, label, IndexMap::new(), None);
    }

    pub(crate) fn record_fixup_at(
        &mut self,
        mut kind: FixupKind,
        expr: Option<&Expr>,
        label: Option<String>,
        struct_bytes: IndexMap<usize, u8>,
        offset: Option<usize>,
    ) {
        let segment = self.output.segments.len().saturating_sub(1);
        let mut fixup_offset = self.segment_mut().current_offset();
        if let Some(invocation) = self.struct_invocation.as_mut() {
            fixup_offset = invocation.start_offset + invocation.offset;
            kind = match kind {
                FixupKind::Bit8 => FixupKind::FieldBit8,
                FixupKind::Bit16 => FixupKind::FieldBit16,
                other => other,
            };
            invocation.deferred.insert(invocation.offset);
            if kind == FixupKind::FieldBit16 {
                invocation.deferred.insert(invocation.offset + 1);
            }
        }
        let module = self.module;
        let entry = FixupEntry {
            kind,
            module,
            segment,
            offset: offset.unwrap_or(fixup_offset),
            address: self.instruction_address(),
            loop_counter: self.tree.loop_counter(module),
            expr: expr.cloned(),
            label,
            struct_bytes,
            vars: self.tree.visible_variables(module),
            line: self.current_line.clone(),
            resolved: false,
        };
        trace!(?kind, offset = entry.offset, "fixup recorded");
        let index = self.fixups.len();
        self.fixups.push(entry);

        for scope in &mut self.tree.module_mut(module).local_scopes {
            scope.fixups.push(index);
        }
        let chain: Vec<ModuleId> = self.tree.ancestors(module).collect();
        for id in chain {
            self.tree.module_mut(id).fixups.push(index);
        }
    }

    /// Evaluate a fixup in the context it was recorded in. `None` means the
    /// value is still unknown or its evaluation failed.
    fn evaluate_fixup(
        &mut self,
        index: usize,
        numeric_only: bool,
        report_unresolved: bool,
    ) -> Option<ExpressionValue> {
        let (result, line) = {
            let fixup = &self.fixups[index];
            let expr = fixup.expr.as_ref()?;
            let mut ctx = AsmEvalContext {
                tree: &mut self.tree,
                module: fixup.module,
                address: fixup.address,
                loop_counter: fixup.loop_counter,
                rng: &mut self.rng,
                vars: Some(&fixup.vars),
            };
            if !report_unresolved && !ready_to_evaluate(expr, &ctx) {
                return None;
            }
            (eval_expr(expr, &mut ctx), fixup.line.clone())
        };
        match result {
            Ok(value) if !value.is_valid() => None,
            Ok(ExpressionValue::Str(_)) if numeric_only => {
                self.report_at(&line, ErrorCode::Z0603, Vec::new());
                None
            }
            Ok(value) => {
                self.fixups[index].resolved = true;
                Some(value)
            }
            Err(err) => {
                self.report_message(&line, err.code, err.message());
                None
            }
        }
    }

    /// Resolve the given scope's fixups. Returns true when all of them
    /// are resolved.
    pub(crate) fn fixup_scope(&mut self, scope: FixupScope, report_unresolved: bool) -> bool {
        let indexes: Vec<usize> = match scope {
            FixupScope::Local(module, idx) => self
                .tree
                .module(module)
                .local_scopes
                .get(idx)
                .map(|s| s.fixups.clone())
                .unwrap_or_default(),
            FixupScope::Module(module) => self.tree.module(module).fixups.clone(),
        };
        if indexes.is_empty() {
            return true;
        }
        trace!(?scope, count = indexes.len(), report_unresolved, "fixup pass");
        let mut success = true;

        // .equ first; the other fixups may depend on the symbols it binds.
        for &idx in &indexes {
            let fixup = &self.fixups[idx];
            if fixup.resolved || fixup.kind != FixupKind::Equ {
                continue;
            }
            let label = fixup.label.clone();
            match (self.evaluate_fixup(idx, false, report_unresolved), label) {
                (Some(value), Some(label)) => self.bind_fixup_symbol(scope, label, value),
                (Some(_), None) => {}
                (None, _) => success = false,
            }
        }

        let numeric = [
            FixupKind::Bit8,
            FixupKind::Bit16,
            FixupKind::Bit16Be,
            FixupKind::Jr,
            FixupKind::Ent,
            FixupKind::Xent,
        ];
        let passes: [&[FixupKind]; 3] = [
            &numeric,
            &[FixupKind::Struct],
            &[FixupKind::FieldBit8, FixupKind::FieldBit16],
        ];
        for kinds in passes {
            for &idx in &indexes {
                let fixup = &self.fixups[idx];
                if fixup.resolved || !kinds.contains(&fixup.kind) {
                    continue;
                }
                if fixup.kind == FixupKind::Struct {
                    self.apply_struct_fixup(idx);
                    continue;
                }
                match self.evaluate_fixup(idx, true, report_unresolved) {
                    Some(value) => {
                        if !self.apply_numeric_fixup(idx, &value) {
                            success = false;
                        }
                    }
                    None => success = false,
                }
            }
        }
        success
    }

    fn bind_fixup_symbol(&mut self, scope: FixupScope, name: String, value: ExpressionValue) {
        let table = match scope {
            FixupScope::Local(module, idx) => {
                match self.tree.module_mut(module).local_scopes.get_mut(idx) {
                    Some(scope) => &mut scope.symbols,
                    None => return,
                }
            }
            FixupScope::Module(module) => &mut self.tree.module_mut(module).symbols,
        };
        match table.get_mut(&name) {
            Some(symbol) => symbol.value = value,
            None => {
                let info = SymbolInfo::label(&name, value);
                table.insert(name, info);
            }
        }
    }

    fn apply_struct_fixup(&mut self, idx: usize) {
        let fixup = &mut self.fixups[idx];
        fixup.resolved = true;
        let (segment, start) = (fixup.segment, fixup.offset);
        let bytes = std::mem::take(&mut fixup.struct_bytes);
        for (offset, byte) in bytes {
            self.patch_byte(segment, start + offset, byte);
        }
    }

    fn apply_numeric_fixup(&mut self, idx: usize, value: &ExpressionValue) -> bool {
        let Ok(word) = value.as_word() else {
            return false;
        };
        let (kind, segment, offset) = {
            let fixup = &self.fixups[idx];
            (fixup.kind, fixup.segment, fixup.offset)
        };
        let [low, high] = word.to_le_bytes();
        match kind {
            FixupKind::Bit8 | FixupKind::FieldBit8 => self.patch_byte(segment, offset, low),
            FixupKind::Bit16 | FixupKind::FieldBit16 => {
                self.patch_byte(segment, offset, low);
                self.patch_byte(segment, offset + 1, high);
            }
            FixupKind::Bit16Be => {
                self.patch_byte(segment, offset, high);
                self.patch_byte(segment, offset + 1, low);
            }
            FixupKind::Jr => {
                let Some(origin) = self
                    .output
                    .segments
                    .get(segment)
                    .map(|s| s.address_of(offset.saturating_sub(1)))
                else {
                    return false;
                };
                let distance = i64::from(word) - (i64::from(origin) + 2);
                if !(-128..=127).contains(&distance) {
                    let line = self.fixups[idx].line.clone();
                    self.report_at(&line, ErrorCode::Z0403, vec![distance.to_string()]);
                    return false;
                }
                self.patch_byte(segment, offset, distance as u8);
            }
            FixupKind::Ent => self.output.entry_address = Some(word),
            FixupKind::Xent => self.output.export_entry_address = Some(word),
            FixupKind::Equ | FixupKind::Struct => {}
        }
        true
    }

    fn patch_byte(&mut self, segment: usize, offset: usize, byte: u8) {
        if let Some(segment) = self.output.segments.get_mut(segment) {
            segment.patch(offset, byte);
        }
    }

    /// Resolve and drop the temporary scope on top of the current module.
    pub(crate) fn fixup_temporary_scope(&mut self) {
        let module = self.module;
        let scopes = &self.tree.module(module).local_scopes;
        if !scopes.last().is_some_and(|scope| scope.is_temporary()) {
            return;
        }
        let idx = scopes.len() - 1;
        self.fixup_scope(FixupScope::Local(module, idx), false);
        self.tree.module_mut(module).local_scopes.pop();
    }

    /// Close the innermost block scope: drop a temporary scope above it,
    /// then resolve what the block scope can and pop it.
    pub(crate) fn close_local_scope(&mut self) {
        self.fixup_temporary_scope();
        let module = self.module;
        if let Some(idx) = self.tree.module(module).local_scopes.len().checked_sub(1) {
            self.fixup_scope(FixupScope::Local(module, idx), false);
            self.tree.module_mut(module).local_scopes.pop();
        }
    }

    /// Final pass at the end of the compilation.
    pub(crate) fn fixup_unresolved_symbols(&mut self) -> bool {
        let module = self.module;
        let count = self.tree.module(module).local_scopes.len();
        for idx in 0..count {
            if self.tree.module(module).local_scopes[idx].fixups.is_empty() {
                continue;
            }
            if self.fixup_scope(FixupScope::Local(module, idx), false) {
                break;
            }
        }
        self.fixup_scope(FixupScope::Module(module), true)
    }

    /// Close the struct invocation in progress, if any. Returns false when
    /// the field assignments overran the struct.
    pub(crate) fn close_struct_invocation(&mut self) -> bool {
        let Some(mut invocation) = self.struct_invocation.take() else {
            return true;
        };
        if invocation.offset > invocation.size {
            self.report_at(
                &invocation.line,
                ErrorCode::Z0801,
                vec![
                    invocation.name.clone(),
                    invocation.size.to_string(),
                    invocation.offset.to_string(),
                ],
            );
            return false;
        }
        for offset in &invocation.deferred {
            invocation.bytes.shift_remove(offset);
        }
        let bytes = std::mem::take(&mut invocation.bytes);
        let previous = std::mem::replace(&mut self.current_line, invocation.line.clone());
        self.record_fixup_at(
            FixupKind::Struct,
            None,
            None,
            bytes,
            Some(invocation.start_offset),
        );
        self.current_line = previous;
        true
    }
}
