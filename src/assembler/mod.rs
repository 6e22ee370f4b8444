// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Multi-pass ZX Spectrum assembler.
//!
//! A compilation runs in three steps:
//!
//! 1. the preprocessor reads the root file, resolves `#include` and the
//!    conditional directives, and parses every line;
//! 2. the emitter walks the lines once, binding labels and emitting code
//!    into segments, recording a fixup for every value that is not known
//!    yet;
//! 3. the remaining fixups are resolved and `.comparebin` requests are
//!    checked against the final binary.
//!
//! All state of a compilation lives in one `Assembler` value created by
//! [`compile_with_observer`] and dropped when it returns.

pub mod cli;
mod fixups;
pub mod output;
mod pragmas;
mod statements;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::assembler::error::{AssemblerErrorInfo, CompileError, Diagnostic, ErrorCode};
use crate::core::assembler::listing::ListFileItem;
use crate::core::ast::{AssemblyLine, Expr, LineKind};
use crate::core::expr::{eval_expr, ready_to_evaluate, EvalContext, ExpressionValue};
use crate::core::functions::SeededRandom;
use crate::core::preprocess::Preprocessor;
use crate::core::segment::BinarySegment;
use crate::core::symbol_table::{
    ModuleId, ModuleTree, ScopeKind, SymbolInfo, SymbolKind, SymbolScope, ROOT_MODULE,
};
use crate::z80::encoder::{encode_instruction, EmitHost, NumberWidth};
use crate::z80::SpectrumModel;

use cli::{Cli, CliError};
pub use fixups::{FixupEntry, FixupKind};
use fixups::StructInvocation;
pub use output::{AssemblerOutput, CompareBinInfo, FileLine};

/// File name used for sources compiled from a string.
pub const DEFAULT_FILE_NAME: &str = "main.asm";

/// Start of the default code segment.
pub const DEFAULT_START_ADDRESS: u16 = 0x8000;

/// Compilation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssemblerOptions {
    /// Symbols defined for both `#ifdef` and expressions.
    pub predefined_symbols: IndexMap<String, i64>,
    pub default_start_address: Option<u16>,
    /// Model used when the source has no `.model` pragma.
    pub current_model: Option<SpectrumModel>,
    pub max_loop_errors_to_report: usize,
    pub use_case_sensitive_symbols: bool,
    /// Let `.defb`/`.defw` take strings and `.defm` take numbers.
    pub flexible_def_pragmas: bool,
    /// Lines processed between two [`CompileObserver::yield_point`] calls.
    pub yield_every_lines: usize,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            predefined_symbols: IndexMap::new(),
            default_start_address: None,
            current_model: None,
            max_loop_errors_to_report: 16,
            use_case_sensitive_symbols: false,
            flexible_def_pragmas: false,
            yield_every_lines: 1000,
        }
    }
}

/// Host callbacks invoked while a compilation runs.
pub trait CompileObserver {
    /// Receives every `.trace` message.
    fn trace(&mut self, _message: &str) {}

    /// Called every `yield_every_lines` processed lines.
    fn yield_point(&mut self, _processed_lines: usize) {}
}

/// Observer that ignores every callback.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl CompileObserver for NoopObserver {}

pub fn compile(source: &str, options: &AssemblerOptions) -> AssemblerOutput {
    compile_with_observer(source, DEFAULT_FILE_NAME, options, &mut NoopObserver)
}

/// Read and compile a source file. Only an unreadable root file is an
/// `Err`; everything else is reported in [`AssemblerOutput::errors`].
pub fn compile_file(path: &Path, options: &AssemblerOptions) -> Result<AssemblerOutput, CompileError> {
    let source = fs::read_to_string(path).map_err(|source| CompileError::ReadSource {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(compile_with_observer(
        &source,
        &path.to_string_lossy(),
        options,
        &mut NoopObserver,
    ))
}

pub fn compile_with_observer(
    source: &str,
    filename: &str,
    options: &AssemblerOptions,
    observer: &mut dyn CompileObserver,
) -> AssemblerOutput {
    let mut assembler = Assembler::new(options, observer);
    assembler.assemble(filename, source);
    assembler.output
}

/// A line inside a shared line arena.
#[derive(Debug, Clone)]
pub struct LineRef {
    lines: Rc<[AssemblyLine]>,
    index: usize,
}

impl LineRef {
    pub(crate) fn new(lines: &Rc<[AssemblyLine]>, index: usize) -> Self {
        Self {
            lines: Rc::clone(lines),
            index,
        }
    }

    pub fn get(&self) -> Option<&AssemblyLine> {
        self.lines.get(self.index)
    }
}

impl Default for LineRef {
    fn default() -> Self {
        Self {
            lines: Rc::from(Vec::new()),
            index: 0,
        }
    }
}

/// Evaluation context bound to one module of the tree.
pub(crate) struct AsmEvalContext<'a> {
    pub(crate) tree: &'a mut ModuleTree,
    pub(crate) module: ModuleId,
    pub(crate) address: u16,
    pub(crate) loop_counter: Option<i64>,
    pub(crate) rng: &'a mut SeededRandom,
    /// Variable values captured when a fixup was recorded.
    pub(crate) vars: Option<&'a IndexMap<String, ExpressionValue>>,
}

impl AsmEvalContext<'_> {
    fn captured(&self, name: &str, from_global: bool) -> Option<&ExpressionValue> {
        if from_global || name.contains('.') {
            return None;
        }
        self.vars?.get(&self.tree.normalize(name))
    }
}

impl EvalContext for AsmEvalContext<'_> {
    fn current_address(&self) -> u16 {
        self.address
    }

    fn symbol_value(&mut self, name: &str, from_global: bool) -> Option<ExpressionValue> {
        if let Some(value) = self.captured(name, from_global) {
            return Some(value.clone());
        }
        self.tree.resolve(self.module, name, from_global)
    }

    fn is_symbol_resolved(&self, name: &str, from_global: bool) -> bool {
        self.captured(name, from_global)
            .is_some_and(ExpressionValue::is_valid)
            || self.tree.is_resolved(self.module, name, from_global)
    }

    fn loop_counter(&self) -> Option<i64> {
        self.loop_counter
    }

    fn random(&mut self) -> &mut SeededRandom {
        &mut *self.rng
    }
}

/// State of a single compilation.
pub(crate) struct Assembler<'a> {
    options: &'a AssemblerOptions,
    output: AssemblerOutput,
    tree: ModuleTree,
    module: ModuleId,
    fixups: Vec<FixupEntry>,
    /// Label-only line waiting for the next line to give it an address.
    overflow_label: Option<LineRef>,
    current_line: LineRef,
    macro_invocations: Vec<LineRef>,
    struct_invocation: Option<StructInvocation>,
    /// Set while the default bytes of a struct are emitted.
    in_struct_cloning: bool,
    /// Counts bytes instead of emitting them while a struct body is sized.
    size_probe: Option<usize>,
    compare_lines: Vec<LineRef>,
    rng: SeededRandom,
    processed_lines: usize,
    observer: &'a mut dyn CompileObserver,
}

impl<'a> Assembler<'a> {
    pub(crate) fn new(options: &'a AssemblerOptions, observer: &'a mut dyn CompileObserver) -> Self {
        let mut tree = ModuleTree::new(options.use_case_sensitive_symbols);
        for (name, value) in &options.predefined_symbols {
            let name = tree.normalize(name);
            let info = SymbolInfo::var(&name, ExpressionValue::Integer(*value));
            tree.module_mut(ROOT_MODULE).symbols.insert(name, info);
        }
        Self {
            options,
            output: AssemblerOutput::default(),
            tree,
            module: ROOT_MODULE,
            fixups: Vec::new(),
            overflow_label: None,
            current_line: LineRef::default(),
            macro_invocations: Vec::new(),
            struct_invocation: None,
            in_struct_cloning: false,
            size_probe: None,
            compare_lines: Vec::new(),
            rng: SeededRandom::default(),
            processed_lines: 0,
            observer,
        }
    }

    fn assemble(&mut self, filename: &str, source: &str) {
        debug!(filename, "preprocessing");
        let mut preprocessor =
            Preprocessor::new(&self.options.predefined_symbols, self.options.current_model);
        let lines = preprocessor.run(filename, source);
        self.output.source_file_list = std::mem::take(&mut preprocessor.source_files);
        self.output.errors.append(&mut preprocessor.errors);
        self.output.model_type = preprocessor.model;
        let Some(lines) = lines else {
            debug!(errors = self.output.errors.len(), "parsing failed");
            return;
        };

        let lines: Rc<[AssemblyLine]> = lines.into();
        debug!(lines = lines.len(), "emitting code");
        if self.emit_code(&lines) {
            debug!(fixups = self.fixups.len(), "resolving fixups");
            if self.fixup_unresolved_symbols() {
                debug!(count = self.compare_lines.len(), "comparing binaries");
                self.compare_binaries();
            }
        }

        self.output.symbols = self.tree.module(ROOT_MODULE).symbols.clone();
        if self.output.has_errors() {
            self.output.segments.clear();
        }
        debug!(
            errors = self.output.error_count(),
            segments = self.output.segments.len(),
            "compilation finished"
        );
    }

    fn emit_code(&mut self, lines: &Rc<[AssemblyLine]>) -> bool {
        self.segment_mut();
        let mut index = 0;
        while index < lines.len() {
            self.emit_single_line(lines, &mut index, false);
            index += 1;
        }
        if let Some(hanging) = self.overflow_label.take() {
            self.create_current_point_label(&hanging);
        }
        self.close_struct_invocation();
        !self.output.has_errors()
    }

    /// Emit the line at `index`. Block statements move `index` to their
    /// closing line.
    pub(crate) fn emit_single_line(
        &mut self,
        lines: &Rc<[AssemblyLine]>,
        index: &mut usize,
        from_macro_emit: bool,
    ) {
        let arena = Rc::clone(lines);
        let Some(line) = arena.get(*index) else {
            return;
        };
        let line_ref = LineRef::new(&arena, *index);
        self.current_line = line_ref.clone();
        self.processed_lines += 1;
        let every = self.options.yield_every_lines;
        if every > 0 && self.processed_lines % every == 0 {
            self.observer.yield_point(self.processed_lines);
        }

        let start_offset = self.segment_mut().current_offset();
        self.segment_mut().current_instruction_offset = start_offset;
        let segment_index = self.output.segments.len() - 1;
        let start_address = self.current_address();

        if matches!(line.kind, LineKind::LabelOnly | LineKind::CommentOnly) {
            let Some(label) = &line.label else {
                return;
            };
            if self.in_struct_cloning {
                return;
            }
            if self.tree.find_struct(self.module, &label.name).is_some() {
                self.report(ErrorCode::Z1013, vec![label.name.clone()]);
                return;
            }
            if self.tree.find_macro(self.module, &label.name).is_some() {
                self.report(ErrorCode::Z1014, vec![label.name.clone()]);
                return;
            }
            if let Some(previous) = self.overflow_label.take() {
                self.create_current_point_label(&previous);
            }
            self.overflow_label = Some(line_ref);
            return;
        }

        let mut current_label = line.label.as_ref().map(|label| label.name.clone());
        if let Some(hanging) = self.overflow_label.take() {
            if current_label.is_none() {
                current_label = hanging
                    .get()
                    .and_then(|l| l.label.as_ref())
                    .map(|label| label.name.clone());
            } else {
                self.create_current_point_label(&hanging);
            }
        }

        let is_field = matches!(line.kind, LineKind::FieldAssignment(_));
        let sets_own_label = match &line.kind {
            LineKind::Pragma(pragma) => pragma.sets_label(),
            LineKind::Statement(stmt) => stmt.sets_label(),
            _ => false,
        };
        if let Some(label) = current_label.as_deref() {
            if !sets_own_label && !self.in_struct_cloning && !is_field {
                if !label.starts_with('`') && !self.tree.module(self.module).local_scopes.is_empty() {
                    self.fixup_temporary_scope();
                }
                let address = self.current_address();
                self.add_symbol(label, ExpressionValue::Integer(i64::from(address)));
            }
        }

        if let Some(param) = line.macro_params.first() {
            if from_macro_emit {
                self.report(ErrorCode::Z1010, vec![param.clone()]);
            } else if self.is_in_global_scope() {
                self.report(ErrorCode::Z1011, Vec::new());
            } else if !self.in_macro_context() && self.should_report_in_scope(ErrorCode::Z1011) {
                self.report(ErrorCode::Z1011, Vec::new());
            }
            return;
        }

        if self.struct_invocation.is_some() {
            if !is_field {
                if !self.close_struct_invocation() {
                    return;
                }
            } else if let Some(label) = &line.label {
                let key = self.tree.normalize(&label.name);
                let missing = match self.struct_invocation.as_mut() {
                    Some(invocation) => match invocation.fields.get(&key) {
                        Some(&offset) => {
                            invocation.offset = offset;
                            None
                        }
                        None => Some(invocation.name.clone()),
                    },
                    None => None,
                };
                if let Some(struct_name) = missing {
                    self.report(ErrorCode::Z0802, vec![struct_name, label.name.clone()]);
                    return;
                }
            }
        } else if is_field {
            self.report(ErrorCode::Z0803, Vec::new());
            return;
        }

        match &line.kind {
            LineKind::Pragma(pragma) | LineKind::FieldAssignment(pragma) => {
                self.apply_pragma(pragma, current_label.as_deref());
                self.push_list_item(line, segment_index, start_offset, start_address);
            }
            LineKind::Statement(stmt) => {
                self.process_statement(&arena, index, stmt, current_label.as_deref());
            }
            LineKind::MacroOrStructInvocation { name, args } => {
                self.process_invocation(&arena, *index, name, args);
            }
            LineKind::Instruction(instr) => {
                let address = self.instruction_address();
                encode_instruction(instr, self);
                self.output.source_map.insert(
                    address,
                    FileLine {
                        file_index: line.file_index,
                        line: line.line,
                        start_column: line.start_column,
                        end_column: line.end_column,
                    },
                );
                self.output
                    .add_to_address_map(line.file_index, line.line, address);
                self.push_list_item(line, segment_index, start_offset, start_address);
            }
            LineKind::Directive(_)
            | LineKind::MacroParam(_)
            | LineKind::LabelOnly
            | LineKind::CommentOnly => {}
        }
    }

    fn push_list_item(
        &mut self,
        line: &AssemblyLine,
        segment_index: usize,
        start_offset: usize,
        address: u16,
    ) {
        if segment_index + 1 != self.output.segments.len() {
            return;
        }
        let length = self.output.segments[segment_index]
            .current_offset()
            .saturating_sub(start_offset);
        if length == 0 {
            return;
        }
        self.output.list_file_items.push(ListFileItem {
            file_index: line.file_index,
            address,
            line_number: line.line,
            segment_index: Some(segment_index),
            code_start_index: start_offset,
            code_length: length,
            source_text: line.source_text.clone(),
            is_macro_invocation: false,
        });
    }

    // --- Segments and emission ---

    pub(crate) fn default_start_address(&self) -> u16 {
        self.options
            .default_start_address
            .unwrap_or(DEFAULT_START_ADDRESS)
    }

    /// The current segment, created on first use.
    pub(crate) fn segment_mut(&mut self) -> &mut BinarySegment {
        if self.output.segments.is_empty() {
            let start = self.default_start_address();
            self.output.segments.push(BinarySegment::new(start, 0xFFFF));
        }
        let last = self.output.segments.len() - 1;
        &mut self.output.segments[last]
    }

    /// Address where the next byte lands.
    pub(crate) fn current_address(&self) -> u16 {
        self.output
            .segments
            .last()
            .map_or(self.default_start_address(), BinarySegment::current_address)
    }

    /// Value of `$`: the address of the line being emitted.
    pub(crate) fn instruction_address(&self) -> u16 {
        self.output
            .segments
            .last()
            .map_or(self.default_start_address(), |segment| {
                segment.address_of(segment.current_instruction_offset)
            })
    }

    pub(crate) fn emit_code_byte(&mut self, byte: u8) {
        if let Some(overflow) = self.segment_mut().emit_byte(byte) {
            self.report(overflow, Vec::new());
        }
    }

    /// Emit a data byte, honoring struct sizing and struct invocations.
    pub(crate) fn emit_data(&mut self, byte: u8) {
        if let Some(size) = self.size_probe.as_mut() {
            *size += 1;
            return;
        }
        if let Some(invocation) = self.struct_invocation.as_mut() {
            invocation.bytes.insert(invocation.offset, byte);
            invocation.offset += 1;
            return;
        }
        self.emit_code_byte(byte);
    }

    pub(crate) fn emit_data_word(&mut self, word: u16) {
        let [low, high] = word.to_le_bytes();
        self.emit_data(low);
        self.emit_data(high);
    }

    pub(crate) fn effective_model(&self) -> Option<SpectrumModel> {
        self.output.model_type.or(self.options.current_model)
    }

    // --- Symbols ---

    /// Bind a label in the scope the naming rules select.
    pub(crate) fn add_symbol(&mut self, name: &str, value: ExpressionValue) {
        let symbol = self.tree.normalize(name);
        if let Some(exported) = symbol.strip_prefix('.') {
            let info = SymbolInfo::label(exported, value);
            self.output.output_symbols.insert(exported.to_string(), info);
            return;
        }

        let module = self.module;
        let is_temporary = symbol.starts_with('`');
        let top_is_temporary = self
            .tree
            .top_scope(module)
            .is_some_and(SymbolScope::is_temporary);
        let mut target = if top_is_temporary {
            if !is_temporary {
                self.fixup_temporary_scope();
            }
            self.symbol_target(module)
        } else {
            let outer = self.symbol_target(module);
            self.tree
                .module_mut(module)
                .local_scopes
                .push(SymbolScope::new(ScopeKind::Temporary));
            if is_temporary {
                self.symbol_target(module)
            } else {
                outer
            }
        };

        if !is_temporary {
            let scopes = &self.tree.module(module).local_scopes;
            let owner = match scopes.last() {
                Some(top) if top.is_temporary() => scopes.len().checked_sub(2),
                Some(_) => Some(scopes.len() - 1),
                None => None,
            };
            if let Some(owner) = owner.map(|idx| &scopes[idx]) {
                if !owner.local_bookings.is_empty() && !owner.local_bookings.contains(&symbol) {
                    target = None;
                }
            }
        }

        let table = match target {
            Some(idx) => &mut self.tree.module_mut(module).local_scopes[idx].symbols,
            None => &mut self.tree.module_mut(module).symbols,
        };
        if table
            .get(&symbol)
            .is_some_and(|existing| existing.kind != SymbolKind::None)
        {
            self.report(ErrorCode::Z0501, vec![name.to_string()]);
            return;
        }
        table.insert(symbol.clone(), SymbolInfo::label(&symbol, value));
    }

    /// Index of the top local scope; `None` stands for the module symbols.
    fn symbol_target(&self, module: ModuleId) -> Option<usize> {
        self.tree.module(module).local_scopes.len().checked_sub(1)
    }

    /// True if the innermost symbol table already has a label `name`.
    pub(crate) fn symbol_exists(&self, name: &str) -> bool {
        let key = self.tree.normalize(name);
        let m = self.tree.module(self.module);
        let table = match m.local_scopes.last() {
            Some(scope) => &scope.symbols,
            None => &m.symbols,
        };
        table
            .get(&key)
            .is_some_and(|symbol| symbol.kind == SymbolKind::Label)
    }

    fn create_current_point_label(&mut self, line: &LineRef) {
        let Some(name) = line
            .get()
            .and_then(|l| l.label.as_ref())
            .map(|label| label.name.clone())
        else {
            return;
        };
        let previous = std::mem::replace(&mut self.current_line, line.clone());
        let address = self.current_address();
        self.add_symbol(&name, ExpressionValue::Integer(i64::from(address)));
        self.current_line = previous;
    }

    /// No block scope is open in the current module.
    pub(crate) fn is_in_global_scope(&self) -> bool {
        self.tree
            .module(self.module)
            .local_scopes
            .iter()
            .all(SymbolScope::is_temporary)
    }

    pub(crate) fn in_macro_context(&self) -> bool {
        self.tree
            .module(self.module)
            .local_scopes
            .iter()
            .any(SymbolScope::is_macro_context)
    }

    pub(crate) fn push_scope(&mut self, kind: ScopeKind) -> usize {
        let scopes = &mut self.tree.module_mut(self.module).local_scopes;
        scopes.push(SymbolScope::new(kind));
        scopes.len() - 1
    }

    pub(crate) fn pop_scope(&mut self) {
        self.tree.module_mut(self.module).local_scopes.pop();
    }

    // --- Evaluation ---

    fn eval_context(&mut self) -> AsmEvalContext<'_> {
        let module = self.module;
        let address = self.instruction_address();
        let loop_counter = self.tree.loop_counter(module);
        AsmEvalContext {
            tree: &mut self.tree,
            module,
            address,
            loop_counter,
            rng: &mut self.rng,
            vars: None,
        }
    }

    /// Evaluate `expr`, or return `NonEvaluated` while a symbol it uses is
    /// still unknown.
    pub(crate) fn evaluate(&mut self, expr: &Expr) -> ExpressionValue {
        let ready = {
            let ctx = self.eval_context();
            ready_to_evaluate(expr, &ctx)
        };
        if !ready {
            return ExpressionValue::NonEvaluated;
        }
        self.evaluate_immediate(expr)
    }

    /// Evaluate a value that must be known now; errors are reported and
    /// yield `Error`.
    pub(crate) fn evaluate_immediate(&mut self, expr: &Expr) -> ExpressionValue {
        let result = {
            let mut ctx = self.eval_context();
            eval_expr(expr, &mut ctx)
        };
        match result {
            Ok(value) => value,
            Err(err) => {
                let line = self.current_line.clone();
                self.report_message(&line, err.code, err.message());
                ExpressionValue::Error
            }
        }
    }

    /// Integer value of an evaluated expression. Strings are reported.
    pub(crate) fn numeric(&mut self, value: &ExpressionValue) -> Option<i64> {
        if !value.is_valid() {
            return None;
        }
        if value.is_string() {
            self.report(ErrorCode::Z0603, Vec::new());
            return None;
        }
        value.as_long().ok()
    }

    pub(crate) fn evaluate_number(&mut self, expr: &Expr) -> Option<i64> {
        let value = self.evaluate_immediate(expr);
        self.numeric(&value)
    }

    // --- Diagnostics ---

    pub(crate) fn report(&mut self, code: ErrorCode, params: Vec<String>) {
        let line = self.current_line.clone();
        self.report_at(&line, code, params);
    }

    pub(crate) fn report_at(&mut self, line: &LineRef, code: ErrorCode, params: Vec<String>) {
        self.report_message(line, code, code.message(&params));
    }

    pub(crate) fn report_message(&mut self, line: &LineRef, code: ErrorCode, message: String) {
        let Some(source) = line.get() else {
            return;
        };
        self.report_invocation_chain();
        let message = self.with_invocation_prefix(message);
        let file_name = self.file_name(source.file_index);
        self.output.errors.push(AssemblerErrorInfo::for_line(
            code, &file_name, source, message, false,
        ));
        self.mark_reported(code);
    }

    /// One `Z1012` entry per active macro invocation, innermost first.
    pub(crate) fn report_invocation_chain(&mut self) {
        let invocations = self.macro_invocations.clone();
        for (level, invocation) in invocations.iter().enumerate().rev() {
            let Some(line) = invocation.get() else {
                continue;
            };
            let suffix = if level > 0 {
                format!(" (level {level})")
            } else {
                String::new()
            };
            let file_name = self.file_name(line.file_index);
            self.output.errors.push(AssemblerErrorInfo::for_line(
                ErrorCode::Z1012,
                &file_name,
                line,
                ErrorCode::Z1012.message(&[suffix]),
                false,
            ));
        }
    }

    pub(crate) fn with_invocation_prefix(&self, message: String) -> String {
        if self.macro_invocations.is_empty() {
            return message;
        }
        let chain = self
            .macro_invocations
            .iter()
            .filter_map(|invocation| invocation.get())
            .map(|line| line.line.to_string())
            .collect::<Vec<_>>()
            .join(" -> ");
        format!("(from macro invocation through line {chain}) {message}")
    }

    pub(crate) fn file_name(&self, file_index: usize) -> String {
        self.output
            .source_file_list
            .get(file_index)
            .map(|file| file.filename.clone())
            .unwrap_or_default()
    }

    /// Scope that remembers reported codes: the loop scope for a loop
    /// iteration, the top scope otherwise.
    fn report_scope_index(&self) -> Option<usize> {
        let scopes = &self.tree.module(self.module).local_scopes;
        let top = scopes.len().checked_sub(1)?;
        if scopes[top].kind == ScopeKind::Iteration && top > 0 {
            return Some(top - 1);
        }
        Some(top)
    }

    fn mark_reported(&mut self, code: ErrorCode) {
        if let Some(idx) = self.report_scope_index() {
            self.tree.module_mut(self.module).local_scopes[idx].mark_reported(code);
        }
    }

    /// False when `code` was already reported in the current block scope.
    pub(crate) fn should_report_in_scope(&mut self, code: ErrorCode) -> bool {
        if self.is_in_global_scope() {
            return true;
        }
        match self.report_scope_index() {
            Some(idx) => self.tree.module_mut(self.module).local_scopes[idx].mark_reported(code),
            None => true,
        }
    }

    pub(crate) fn trace_message(&mut self, message: String) {
        info!(target: "zxasm::trace", "{message}");
        self.observer.trace(&message);
        self.output.trace_output.push(message);
    }
}

impl EmitHost for Assembler<'_> {
    fn emit_byte(&mut self, byte: u8) {
        self.emit_code_byte(byte);
    }

    fn emit_number(&mut self, expr: &Expr, width: NumberWidth) {
        let value = self.evaluate(expr);
        let value = match value {
            ExpressionValue::Error => return,
            ExpressionValue::NonEvaluated => {
                let kind = match width {
                    NumberWidth::Bit8 => FixupKind::Bit8,
                    NumberWidth::Bit16 => FixupKind::Bit16,
                    NumberWidth::Bit16Be => FixupKind::Bit16Be,
                };
                self.record_fixup(kind, Some(expr), None);
                0
            }
            ExpressionValue::Str(_) => {
                self.report(ErrorCode::Z0603, Vec::new());
                0
            }
            other => other.as_word().unwrap_or(0),
        };
        let [low, high] = value.to_le_bytes();
        match width {
            NumberWidth::Bit8 => self.emit_code_byte(low),
            NumberWidth::Bit16 => {
                self.emit_code_byte(low);
                self.emit_code_byte(high);
            }
            NumberWidth::Bit16Be => {
                self.emit_code_byte(high);
                self.emit_code_byte(low);
            }
        }
    }

    fn emit_relative(&mut self, expr: &Expr) {
        let value = self.evaluate(expr);
        let target = match value {
            ExpressionValue::Error => {
                self.emit_code_byte(0);
                return;
            }
            ExpressionValue::NonEvaluated => {
                self.record_fixup(FixupKind::Jr, Some(expr), None);
                self.emit_code_byte(0);
                return;
            }
            ExpressionValue::Str(_) => {
                self.report(ErrorCode::Z0603, Vec::new());
                self.emit_code_byte(0);
                return;
            }
            other => other.as_long().unwrap_or(0),
        };
        let origin = i64::from(self.instruction_address());
        let distance = target - (origin + 2);
        if !(-128..=127).contains(&distance) {
            self.report(ErrorCode::Z0403, vec![distance.to_string()]);
            self.emit_code_byte(0);
            return;
        }
        self.emit_code_byte(distance as u8);
    }

    fn eval_immediate(&mut self, expr: &Expr) -> Option<i64> {
        self.evaluate_number(expr)
    }

    fn report(&mut self, code: ErrorCode, params: Vec<String>) {
        Assembler::report(self, code, params);
    }

    fn is_next(&self) -> bool {
        self.effective_model() == Some(SpectrumModel::Next)
    }
}

// --- Command line driver ---

/// Result of a successful command line run.
#[derive(Debug)]
pub struct RunReport {
    diagnostics: Vec<Diagnostic>,
    source_lines: Vec<String>,
    output: AssemblerOutput,
}

impl RunReport {
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn source_lines(&self) -> &[String] {
        &self.source_lines
    }

    pub fn output(&self) -> &AssemblerOutput {
        &self.output
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Cli(#[from] CliError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("assembly failed with {errors} error(s)")]
    Assembly {
        errors: usize,
        diagnostics: Vec<Diagnostic>,
        source_lines: Vec<String>,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RunError {
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            RunError::Assembly { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }

    pub fn source_lines(&self) -> &[String] {
        match self {
            RunError::Assembly { source_lines, .. } => source_lines,
            _ => &[],
        }
    }
}

/// Echoes `.trace` output on stdout.
struct ConsoleObserver;

impl CompileObserver for ConsoleObserver {
    fn trace(&mut self, message: &str) {
        println!("{message}");
    }
}

pub fn run_with(cli: &Cli) -> Result<RunReport, RunError> {
    let options = cli::build_options(cli)?;
    let source = fs::read_to_string(&cli.source).map_err(|source| CompileError::ReadSource {
        path: cli.source.clone(),
        source,
    })?;
    let filename = cli.source.to_string_lossy();
    let output = compile_with_observer(&source, &filename, &options, &mut ConsoleObserver);

    if let Some(path) = &cli.list {
        let file = fs::File::create(path).map_err(|source| write_error(path, source))?;
        output
            .write_listing(io::BufWriter::new(file))
            .map_err(|source| write_error(path, source))?;
    }
    if let Some(path) = &cli.json {
        let json = output
            .to_json()
            .map_err(|err| write_error(path, io::Error::other(err)))?;
        fs::write(path, json).map_err(|source| write_error(path, source))?;
    }

    let source_lines: Vec<String> = source.lines().map(str::to_string).collect();
    let diagnostics = collect_diagnostics(&output, &filename);
    if output.has_errors() {
        return Err(RunError::Assembly {
            errors: output.error_count(),
            diagnostics,
            source_lines,
        });
    }

    let outfile = cli
        .outfile
        .clone()
        .unwrap_or_else(|| cli.source.with_extension("bin"));
    fs::write(&outfile, output.binary()).map_err(|source| write_error(&outfile, source))?;
    info!(
        path = %outfile.display(),
        bytes = output.binary().len(),
        "binary written"
    );
    for command in &output.on_success_commands {
        info!(command = %command, "on-success command requested");
    }

    Ok(RunReport {
        diagnostics,
        source_lines,
        output,
    })
}

fn write_error(path: &Path, source: io::Error) -> RunError {
    RunError::Write {
        path: path.to_path_buf(),
        source,
    }
}

/// Diagnostics for every reported error, with the offending line attached
/// when it comes from an included file.
fn collect_diagnostics(output: &AssemblerOutput, root_file: &str) -> Vec<Diagnostic> {
    let mut included: HashMap<String, Vec<String>> = HashMap::new();
    output
        .errors
        .iter()
        .map(|err| {
            let diagnostic = err.to_diagnostic();
            if err.file_name == root_file || err.file_name.is_empty() {
                return diagnostic;
            }
            let lines = included.entry(err.file_name.clone()).or_insert_with(|| {
                fs::read_to_string(&err.file_name)
                    .map(|text| text.lines().map(str::to_string).collect())
                    .unwrap_or_default()
            });
            diagnostic.with_source(lines.get((err.line as usize).saturating_sub(1)).cloned())
        })
        .collect()
}

/// Spectrum character set code of `c`.
pub(crate) fn spectrum_byte(c: char) -> u8 {
    match c {
        '£' => 0x60,
        '©' => 0x7F,
        other => other as u32 as u8,
    }
}
