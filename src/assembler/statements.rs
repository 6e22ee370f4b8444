// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Structural statements.
//!
//! Every block statement first locates its terminator, then emits its body
//! lines through [`Assembler::emit_single_line`] inside a scope of its own.
//! Loops push one extra iteration scope per pass so the labels of each pass
//! stay independent.

use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use super::fixups::{FixupScope, StructInvocation};
use super::{Assembler, LineRef};
use crate::core::assembler::error::{AssemblerErrorInfo, ErrorCode};
use crate::core::assembler::listing::ListFileItem;
use crate::core::ast::{AssemblyLine, Expr, LineKind, MacroArg, Operand, Pragma, Statement};
use crate::core::expr::ExpressionValue;
use crate::core::parser::parse_program;
use crate::core::symbol_table::{
    MacroDefinition, ScopeKind, StructDefinition, StructField, SymbolInfo,
};
use crate::core::text_utils::replace_macro_params;

const IF_FAMILY: &str = ".if/.ifused/.ifnused";

/// Iteration cap shared by every loop kind.
const MAX_LOOP_COUNT: i64 = 0xFFFF;

/// Invalid lines reported in a struct body before giving up.
const MAX_STRUCT_ERRORS: usize = 16;

/// Text substituted for an omitted macro argument.
const NONE_ARGUMENT: &str = "$<none>$";

/// Line range of a block and the label its terminator gives.
#[derive(Debug, Clone)]
struct BlockEnd {
    first: usize,
    last: usize,
    label: Option<String>,
}

/// Sections of an `.if` block, each as (opening line, closing line).
#[derive(Debug)]
struct IfDefinition {
    sections: Vec<(usize, usize)>,
    else_section: Option<(usize, usize)>,
    end: BlockEnd,
}

fn label_name(line: &AssemblyLine) -> Option<String> {
    line.label.as_ref().map(|label| label.name.clone())
}

/// True if `stmt` terminates a block opened by `opener`.
fn closes(opener: &Statement, stmt: &Statement) -> bool {
    matches!(
        (opener, stmt),
        (Statement::Macro(_), Statement::EndMacro)
            | (Statement::Loop(_), Statement::EndLoop)
            | (Statement::While(_), Statement::EndWhile)
            | (Statement::Repeat, Statement::Until(_))
            | (Statement::For { .. }, Statement::Next)
            | (Statement::Proc, Statement::EndProc)
            | (
                Statement::If(_) | Statement::IfUsed(_) | Statement::IfNotUsed(_),
                Statement::EndIf
            )
            | (Statement::Module(_), Statement::EndModule)
            | (Statement::Struct, Statement::EndStruct)
    )
}

/// Names used when a terminator shows up without its opener.
fn unmatched_names(stmt: &Statement) -> (&'static str, &'static str) {
    match stmt {
        Statement::EndMacro => (".endm/.mend", ".macro"),
        Statement::EndLoop => (".endl/.lend", ".loop"),
        Statement::EndWhile => (".endw/.wend", ".while"),
        Statement::Until(_) => (".until", ".repeat"),
        Statement::EndProc => (".endp/.pend", ".proc"),
        Statement::Else => (".else", IF_FAMILY),
        Statement::Elif(_) => (".elif", IF_FAMILY),
        Statement::EndIf => (".endif", IF_FAMILY),
        Statement::EndModule => (".endmodule/.moduleend", ".module"),
        Statement::EndStruct => (".ends", ".struct"),
        Statement::Next => (".next", ".for"),
        other => (other.name(), "block"),
    }
}

impl Assembler<'_> {
    pub(crate) fn process_statement(
        &mut self,
        lines: &Rc<[AssemblyLine]>,
        index: &mut usize,
        stmt: &Statement,
        label: Option<&str>,
    ) {
        match stmt {
            Statement::Macro(args) => self.collect_macro(lines, index, args, label),
            Statement::Loop(count) => self.process_loop(lines, index, count),
            Statement::While(condition) => self.process_while(lines, index, condition),
            Statement::Repeat => self.process_repeat(lines, index),
            Statement::For {
                var,
                from,
                to,
                step,
            } => self.process_for(lines, index, var, from, to, step.as_ref()),
            Statement::Proc => self.process_proc(lines, index),
            Statement::If(_) | Statement::IfUsed(_) | Statement::IfNotUsed(_) => {
                self.process_if(lines, index)
            }
            Statement::Break => self.process_loop_flow(true),
            Statement::Continue => self.process_loop_flow(false),
            Statement::Module(name) => self.process_module(lines, index, name.as_deref(), label),
            Statement::Struct => self.collect_struct(lines, index, label),
            Statement::Local(names) => self.process_local(names),
            terminator => {
                let (found, expected) = unmatched_names(terminator);
                self.report(
                    ErrorCode::Z0704,
                    vec![found.to_string(), expected.to_string()],
                );
            }
        }
    }

    /// Find the terminator of the block opened at `*index`, skipping nested
    /// blocks. `*index` ends on the terminator, or past the last line when
    /// there is none.
    fn search_for_end(&mut self, lines: &Rc<[AssemblyLine]>, index: &mut usize) -> Option<BlockEnd> {
        let arena = Rc::clone(lines);
        let first = *index;
        let opener = arena.get(first).and_then(AssemblyLine::statement)?;
        let mut hanging = None;
        *index += 1;
        while let Some(line) = arena.get(*index) {
            match &line.kind {
                LineKind::Statement(stmt) if closes(opener, stmt) => {
                    return Some(BlockEnd {
                        first,
                        last: *index,
                        label: label_name(line).or(hanging),
                    });
                }
                LineKind::LabelOnly | LineKind::CommentOnly => hanging = label_name(line),
                LineKind::Statement(stmt) if stmt.is_block() => {
                    hanging = None;
                    if self.search_for_end(&arena, index).is_none() {
                        break;
                    }
                }
                _ => hanging = None,
            }
            *index += 1;
        }
        self.report_at(
            &LineRef::new(&arena, first),
            ErrorCode::Z0701,
            vec![opener.name().to_string()],
        );
        *index = arena.len();
        None
    }

    /// Emit the lines strictly between `first` and `last`. With an iteration
    /// scope, stop as soon as `.break` or `.continue` marks it.
    fn emit_range(
        &mut self,
        lines: &Rc<[AssemblyLine]>,
        first: usize,
        last: usize,
        iteration: Option<usize>,
    ) {
        let mut index = first + 1;
        while index < last {
            self.emit_single_line(lines, &mut index, false);
            if iteration.is_some_and(|idx| self.iteration_stopped(idx)) {
                break;
            }
            index += 1;
        }
    }

    fn iteration_stopped(&self, idx: usize) -> bool {
        self.tree
            .module(self.module)
            .local_scopes
            .get(idx)
            .is_some_and(|scope| scope.break_reached || scope.continue_reached)
    }

    fn bind_end_label(&mut self, lines: &Rc<[AssemblyLine]>, end: &BlockEnd) {
        let Some(label) = &end.label else {
            return;
        };
        let previous = std::mem::replace(&mut self.current_line, LineRef::new(lines, end.last));
        let address = self.current_address();
        self.add_symbol(label, ExpressionValue::Integer(i64::from(address)));
        self.current_line = previous;
    }

    // --- Loops ---

    fn push_iteration(&mut self, counter: i64) -> usize {
        let idx = self.push_scope(ScopeKind::Iteration);
        self.tree.module_mut(self.module).local_scopes[idx].loop_counter = counter;
        idx
    }

    /// Close the iteration at `iteration`. Returns true when the loop must
    /// stop, either on `.break` or because the body reported too many errors.
    fn end_iteration(
        &mut self,
        lines: &Rc<[AssemblyLine]>,
        end: &BlockEnd,
        iteration: usize,
        loop_line: &LineRef,
        errors_before: usize,
    ) -> bool {
        let broke = self
            .tree
            .module(self.module)
            .local_scopes
            .get(iteration)
            .is_some_and(|scope| scope.break_reached);
        self.bind_end_label(lines, end);
        self.overflow_label = None;
        self.close_local_scope();
        self.loop_errors_capped(loop_line, errors_before) || broke
    }

    fn loop_errors_capped(&mut self, loop_line: &LineRef, errors_before: usize) -> bool {
        let errors = self.output.error_count().saturating_sub(errors_before);
        if errors >= self.options.max_loop_errors_to_report {
            self.report_at(loop_line, ErrorCode::Z0703, Vec::new());
            return true;
        }
        false
    }

    /// A loop bound or condition. Strings are rejected.
    fn loop_value(&mut self, expr: &Expr) -> Option<ExpressionValue> {
        let value = self.evaluate_immediate(expr);
        if !value.is_valid() {
            return None;
        }
        if value.is_string() {
            self.report(ErrorCode::Z0603, Vec::new());
            return None;
        }
        Some(value)
    }

    fn process_loop(&mut self, lines: &Rc<[AssemblyLine]>, index: &mut usize, count: &Expr) {
        let loop_line = self.current_line.clone();
        let Some(end) = self.search_for_end(lines, index) else {
            return;
        };
        let Some(mut count) = self.evaluate_number(count) else {
            return;
        };
        if count > MAX_LOOP_COUNT {
            self.report(ErrorCode::Z0702, Vec::new());
            count = 1;
        }
        debug!(count, "loop");

        self.push_scope(ScopeKind::Loop);
        let errors_before = self.output.error_count();
        for counter in 1..=count {
            let iteration = self.push_iteration(counter);
            self.emit_range(lines, end.first, end.last, Some(iteration));
            if self.end_iteration(lines, &end, iteration, &loop_line, errors_before) {
                break;
            }
        }
        self.pop_scope();
    }

    fn process_while(&mut self, lines: &Rc<[AssemblyLine]>, index: &mut usize, condition: &Expr) {
        let loop_line = self.current_line.clone();
        let Some(end) = self.search_for_end(lines, index) else {
            return;
        };

        self.push_scope(ScopeKind::Loop);
        let errors_before = self.output.error_count();
        let mut counter = 1;
        loop {
            let iteration = self.push_iteration(counter);
            self.current_line = loop_line.clone();
            let proceed = self
                .loop_value(condition)
                .is_some_and(|value| value.as_bool().unwrap_or(false));
            if !proceed {
                self.pop_scope();
                break;
            }
            self.emit_range(lines, end.first, end.last, Some(iteration));
            if self.end_iteration(lines, &end, iteration, &loop_line, errors_before) {
                break;
            }
            counter += 1;
            if counter >= MAX_LOOP_COUNT {
                self.report_at(&loop_line, ErrorCode::Z0702, Vec::new());
                break;
            }
        }
        self.pop_scope();
    }

    fn process_repeat(&mut self, lines: &Rc<[AssemblyLine]>, index: &mut usize) {
        let loop_line = self.current_line.clone();
        let Some(end) = self.search_for_end(lines, index) else {
            return;
        };
        let Some(Statement::Until(until)) = lines.get(end.last).and_then(AssemblyLine::statement)
        else {
            return;
        };
        let until_line = LineRef::new(lines, end.last);

        self.push_scope(ScopeKind::Loop);
        let errors_before = self.output.error_count();
        let mut counter = 1;
        loop {
            let iteration = self.push_iteration(counter);
            self.emit_range(lines, end.first, end.last, Some(iteration));
            let broke = self
                .tree
                .module(self.module)
                .local_scopes
                .get(iteration)
                .is_some_and(|scope| scope.break_reached);
            self.bind_end_label(lines, &end);
            self.overflow_label = None;

            // the condition sees the labels of the pass it closes
            self.fixup_temporary_scope();
            self.current_line = until_line.clone();
            let done = self
                .loop_value(until)
                .map_or(true, |value| value.as_bool().unwrap_or(true));
            self.close_local_scope();

            if self.loop_errors_capped(&loop_line, errors_before) || done || broke {
                break;
            }
            counter += 1;
            if counter >= MAX_LOOP_COUNT {
                self.report_at(&loop_line, ErrorCode::Z0702, Vec::new());
                break;
            }
        }
        self.pop_scope();
    }

    fn process_for(
        &mut self,
        lines: &Rc<[AssemblyLine]>,
        index: &mut usize,
        var: &str,
        from: &Expr,
        to: &Expr,
        step: Option<&Expr>,
    ) {
        let loop_line = self.current_line.clone();
        let Some(end) = self.search_for_end(lines, index) else {
            return;
        };
        let Some(from) = self.loop_value(from) else {
            return;
        };
        let Some(to) = self.loop_value(to) else {
            return;
        };
        let step = match step {
            Some(expr) => {
                let Some(step) = self.loop_value(expr) else {
                    return;
                };
                if step.as_real().unwrap_or(0.0).abs() < f64::EPSILON {
                    self.report(ErrorCode::Z0706, Vec::new());
                    return;
                }
                step
            }
            None => ExpressionValue::Integer(1),
        };

        let key = self.tree.normalize(var);
        if self.tree.find_variable(self.module, &key).is_some() {
            self.report(ErrorCode::Z0502, vec![var.to_string()]);
            return;
        }

        let module = self.module;
        let loop_scope = self.push_scope(ScopeKind::Loop);
        self.tree.module_mut(module).local_scopes[loop_scope]
            .symbols
            .insert(key.clone(), SymbolInfo::var(&key, from.clone()));

        let integral = [&from, &to, &step].iter().all(|value| {
            matches!(value, ExpressionValue::Bool(_) | ExpressionValue::Integer(_))
        });
        let mut int_value = from.as_long().unwrap_or(0);
        let int_end = to.as_long().unwrap_or(0);
        let int_step = step.as_long().unwrap_or(1);
        let mut real_value = from.as_real().unwrap_or(0.0);
        let real_end = to.as_real().unwrap_or(0.0);
        let real_step = step.as_real().unwrap_or(1.0);

        let errors_before = self.output.error_count();
        let mut counter = 0;
        loop {
            let finished = if integral {
                (int_step > 0 && int_value > int_end) || (int_step < 0 && int_value < int_end)
            } else {
                (real_step > 0.0 && real_value > real_end)
                    || (real_step < 0.0 && real_value < real_end)
            };
            if finished {
                break;
            }
            counter += 1;
            if counter >= MAX_LOOP_COUNT {
                self.report_at(&loop_line, ErrorCode::Z0702, Vec::new());
                break;
            }

            let iteration = self.push_iteration(counter);
            self.emit_range(lines, end.first, end.last, Some(iteration));
            if self.end_iteration(lines, &end, iteration, &loop_line, errors_before) {
                break;
            }

            let next = if integral {
                int_value += int_step;
                ExpressionValue::Integer(int_value)
            } else {
                real_value += real_step;
                ExpressionValue::Real(real_value)
            };
            if let Some(symbol) = self
                .tree
                .module_mut(module)
                .local_scopes
                .get_mut(loop_scope)
                .and_then(|scope| scope.symbols.get_mut(&key))
            {
                symbol.value = next;
            }
        }
        self.pop_scope();
    }

    fn process_loop_flow(&mut self, is_break: bool) {
        let module = self.module;
        let Some(idx) = self.tree.iteration_scope(module) else {
            let code = if is_break {
                ErrorCode::Z0707
            } else {
                ErrorCode::Z0708
            };
            self.report(code, Vec::new());
            return;
        };
        let scope = &mut self.tree.module_mut(module).local_scopes[idx];
        if is_break {
            scope.break_reached = true;
        } else {
            scope.continue_reached = true;
        }
    }

    // --- Conditionals ---

    fn get_if_sections(
        &mut self,
        lines: &Rc<[AssemblyLine]>,
        index: &mut usize,
    ) -> Option<IfDefinition> {
        let arena = Rc::clone(lines);
        let first = *index;
        let mut section_start = first;
        let mut sections = Vec::new();
        let mut else_seen = false;
        let mut failed = false;
        let mut hanging: Option<String> = None;
        *index += 1;

        while let Some(line) = arena.get(*index) {
            match &line.kind {
                LineKind::Statement(Statement::EndIf) => {
                    let range = (section_start, *index);
                    let else_section = if else_seen {
                        Some(range)
                    } else {
                        sections.push(range);
                        None
                    };
                    if failed {
                        return None;
                    }
                    return Some(IfDefinition {
                        sections,
                        else_section,
                        end: BlockEnd {
                            first,
                            last: *index,
                            label: label_name(line).or(hanging),
                        },
                    });
                }
                LineKind::Statement(stmt @ (Statement::Elif(_) | Statement::Else)) => {
                    let here = LineRef::new(&arena, *index);
                    if label_name(line).or(hanging.take()).is_some() {
                        self.report_at(&here, ErrorCode::Z0503, vec![stmt.name().to_string()]);
                    }
                    if else_seen {
                        failed = true;
                        self.report_at(&here, ErrorCode::Z0709, vec![stmt.name().to_string()]);
                    } else {
                        sections.push((section_start, *index));
                        section_start = *index;
                    }
                    if matches!(stmt, Statement::Else) {
                        else_seen = true;
                    }
                }
                LineKind::LabelOnly | LineKind::CommentOnly => hanging = label_name(line),
                LineKind::Statement(stmt) if stmt.is_block() => {
                    hanging = None;
                    if self.search_for_end(&arena, index).is_none() {
                        break;
                    }
                }
                _ => hanging = None,
            }
            *index += 1;
        }
        self.report_at(
            &LineRef::new(&arena, first),
            ErrorCode::Z0701,
            vec![IF_FAMILY.to_string()],
        );
        *index = arena.len();
        None
    }

    fn process_if(&mut self, lines: &Rc<[AssemblyLine]>, index: &mut usize) {
        let Some(definition) = self.get_if_sections(lines, index) else {
            return;
        };

        let mut chosen = None;
        for &(first, last) in &definition.sections {
            let Some(stmt) = lines.get(first).and_then(AssemblyLine::statement) else {
                continue;
            };
            self.current_line = LineRef::new(lines, first);
            let value = match stmt {
                Statement::If(expr) | Statement::Elif(expr) => self.evaluate_immediate(expr),
                Statement::IfUsed(expr) => ExpressionValue::Bool(self.symbol_used(expr)),
                Statement::IfNotUsed(expr) => ExpressionValue::Bool(!self.symbol_used(expr)),
                _ => continue,
            };
            if !value.is_valid() {
                continue;
            }
            if value.is_string() {
                self.report(ErrorCode::Z0603, Vec::new());
                continue;
            }
            if value.as_bool().unwrap_or(false) {
                chosen = Some((first, last));
                break;
            }
        }

        if let Some((first, last)) = chosen.or(definition.else_section) {
            let iteration = self.tree.iteration_scope(self.module);
            self.emit_range(lines, first, last, iteration);
        }
        self.bind_end_label(lines, &definition.end);
        self.overflow_label = None;
    }

    fn symbol_used(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Symbol {
                name, from_global, ..
            } => self.tree.is_used(self.module, name, *from_global),
            _ => false,
        }
    }

    // --- Procedures and modules ---

    fn process_proc(&mut self, lines: &Rc<[AssemblyLine]>, index: &mut usize) {
        let Some(end) = self.search_for_end(lines, index) else {
            return;
        };
        self.push_scope(ScopeKind::Proc);
        self.emit_range(lines, end.first, end.last, None);
        self.bind_end_label(lines, &end);
        self.overflow_label = None;
        self.close_local_scope();
    }

    /// `.local` books names in the enclosing proc so they bind there.
    fn process_local(&mut self, names: &[String]) {
        let module = self.module;
        let owner = {
            let scopes = &self.tree.module(module).local_scopes;
            scopes
                .iter()
                .rposition(|scope| !scope.is_temporary())
                .filter(|&idx| scopes[idx].kind == ScopeKind::Proc)
        };
        let Some(owner) = owner else {
            self.report(ErrorCode::Z0504, Vec::new());
            return;
        };
        for name in names {
            if name.starts_with('`') {
                self.report(ErrorCode::Z0505, vec![name.clone()]);
                continue;
            }
            let key = self.tree.normalize(name);
            let booked = self.tree.module_mut(module).local_scopes[owner]
                .local_bookings
                .insert(key);
            if !booked {
                self.report(ErrorCode::Z0506, vec![name.clone()]);
            }
        }
    }

    fn process_module(
        &mut self,
        lines: &Rc<[AssemblyLine]>,
        index: &mut usize,
        name: Option<&str>,
        label: Option<&str>,
    ) {
        let Some(end) = self.search_for_end(lines, index) else {
            return;
        };
        let nested_in_body = self
            .tree
            .module(self.module)
            .local_scopes
            .iter()
            .any(|scope| {
                matches!(
                    scope.kind,
                    ScopeKind::Macro | ScopeKind::Loop | ScopeKind::Iteration
                )
            });
        if nested_in_body {
            self.report(ErrorCode::Z0904, Vec::new());
            return;
        }
        let Some(name) = name.or(label) else {
            self.report(ErrorCode::Z0901, Vec::new());
            return;
        };
        if name.starts_with('`') {
            self.report(ErrorCode::Z0902, vec![name.to_string()]);
            return;
        }
        let key = self.tree.normalize(name);
        if self.tree.module(self.module).nested.contains_key(&key) {
            self.report(ErrorCode::Z0903, vec![name.to_string()]);
            return;
        }

        let parent = self.module;
        let module = self.tree.add_module(parent, &key);
        debug!(module = %key, "entering module");
        self.module = module;
        self.push_scope(ScopeKind::Temporary);
        self.emit_range(lines, end.first, end.last, None);
        self.bind_end_label(lines, &end);
        self.overflow_label = None;
        self.fixup_temporary_scope();
        self.fixup_scope(FixupScope::Module(module), false);
        self.module = parent;
    }

    // --- Macros ---

    fn collect_macro(
        &mut self,
        lines: &Rc<[AssemblyLine]>,
        index: &mut usize,
        args: &[String],
        label: Option<&str>,
    ) {
        let mut failed = false;
        let mut seen = HashSet::new();
        for arg in args {
            if !seen.insert(arg.to_lowercase()) {
                self.report(ErrorCode::Z1001, vec![arg.clone()]);
                failed = true;
            }
        }
        match label {
            None => {
                self.report(ErrorCode::Z1002, Vec::new());
                failed = true;
            }
            Some(name) if name.starts_with('`') => {
                self.report(ErrorCode::Z1003, vec![name.to_string()]);
                failed = true;
            }
            Some(name) => {
                let key = self.tree.normalize(name);
                if self.tree.module(self.module).name_in_use(&key) {
                    self.report(ErrorCode::Z1004, vec![name.to_string()]);
                    failed = true;
                }
            }
        }

        let Some(end) = self.search_for_end(lines, index) else {
            return;
        };

        let arg_keys: Vec<String> = args.iter().map(|arg| self.tree.normalize(arg)).collect();
        for idx in end.first + 1..end.last {
            let Some(line) = lines.get(idx) else {
                continue;
            };
            let here = LineRef::new(lines, idx);
            if matches!(line.statement(), Some(Statement::Macro(_))) {
                self.report_at(&here, ErrorCode::Z1005, Vec::new());
                failed = true;
                continue;
            }
            for param in &line.macro_params {
                if !arg_keys.contains(&self.tree.normalize(param)) {
                    self.report_at(&here, ErrorCode::Z1006, vec![param.clone()]);
                    failed = true;
                }
            }
        }

        let Some(name) = label.filter(|_| !failed) else {
            return;
        };
        let key = self.tree.normalize(name);
        debug!(name, args = args.len(), "macro defined");
        self.tree.module_mut(self.module).macros.insert(
            key,
            MacroDefinition {
                name: name.to_string(),
                arg_names: args.to_vec(),
                end_label: end.label,
                lines: Rc::clone(lines),
                first_line: end.first,
                last_line: end.last,
            },
        );
    }

    pub(crate) fn process_invocation(
        &mut self,
        lines: &Rc<[AssemblyLine]>,
        index: usize,
        name: &str,
        args: &[MacroArg],
    ) {
        if let Some(definition) = self.tree.find_struct(self.module, name).cloned() {
            self.invoke_struct(lines, index, &definition, args);
            return;
        }
        let Some(definition) = self.tree.find_macro(self.module, name).cloned() else {
            self.report(ErrorCode::Z1007, vec![name.to_string()]);
            return;
        };
        self.invoke_macro(lines, index, &definition, args);
    }

    /// Source text standing in for `{{param}}` in the expanded body.
    fn macro_argument_text(&mut self, arg: &MacroArg) -> Option<String> {
        match &arg.operand {
            Operand::Reg(reg, _) => Some(reg.name().to_string()),
            Operand::RegIndirect(reg, _) => Some(format!("({})", reg.name())),
            Operand::CPort(_) => Some("(c)".to_string()),
            Operand::Condition(condition, _) => Some(condition.name().to_string()),
            Operand::None(_) => Some(NONE_ARGUMENT.to_string()),
            Operand::Expr(expr) => match self.evaluate(expr) {
                ExpressionValue::NonEvaluated => Some(arg.text.clone()),
                value => value.as_string().ok(),
            },
            Operand::MemIndirect(expr, _) => self
                .evaluate_immediate(expr)
                .as_string()
                .ok()
                .map(|text| format!("({text})")),
            Operand::Indexed {
                reg, minus, disp, ..
            } => {
                let Some(disp) = disp else {
                    return Some(format!("({})", reg.name()));
                };
                let sign = if *minus { '-' } else { '+' };
                self.evaluate_immediate(disp)
                    .as_string()
                    .ok()
                    .map(|text| format!("({}{sign}{text})", reg.name()))
            }
        }
    }

    fn invoke_macro(
        &mut self,
        lines: &Rc<[AssemblyLine]>,
        index: usize,
        definition: &MacroDefinition,
        args: &[MacroArg],
    ) {
        if args.len() > definition.arg_names.len() {
            self.report(
                ErrorCode::Z1008,
                vec![
                    definition.name.clone(),
                    definition.arg_names.len().to_string(),
                    args.len().to_string(),
                ],
            );
            return;
        }

        let depth = self.macro_invocations.len();
        let invocation = LineRef::new(lines, index);
        self.macro_invocations.push(invocation.clone());

        let mut arguments = IndexMap::new();
        let mut failed = false;
        for (position, arg_name) in definition.arg_names.iter().enumerate() {
            let text = match args.get(position) {
                Some(arg) => self.macro_argument_text(arg),
                None => Some(NONE_ARGUMENT.to_string()),
            };
            match text {
                Some(text) => {
                    arguments.insert(self.tree.normalize(arg_name), text);
                }
                None => failed = true,
            }
        }
        if failed {
            self.macro_invocations.truncate(depth);
            return;
        }

        // expanded text, one body line index per produced text line
        let mut source_info = Vec::new();
        let mut text = String::new();
        for idx in definition.first_line + 1..definition.last_line {
            let Some(body) = definition.lines.get(idx) else {
                continue;
            };
            let expanded = replace_macro_params(&body.source_text, |name| {
                arguments.get(&self.tree.normalize(name)).cloned()
            });
            for _ in expanded.split('\n') {
                source_info.push(idx);
            }
            text.push_str(&expanded);
            text.push('\n');
        }

        let (mut parsed, errors) = parse_program(&text, 0, true);
        if !errors.is_empty() {
            self.report_invocation_chain();
            for err in &errors {
                let origin = source_info
                    .get((err.span.line as usize).saturating_sub(1))
                    .copied()
                    .unwrap_or(definition.first_line);
                let Some(line) = definition.lines.get(origin) else {
                    continue;
                };
                let message = self.with_invocation_prefix(err.message());
                let file_name = self.file_name(line.file_index);
                self.output.errors.push(AssemblerErrorInfo::for_line(
                    err.code, &file_name, line, message, false,
                ));
                self.mark_reported(err.code);
            }
            self.macro_invocations.truncate(depth);
            return;
        }
        for line in &mut parsed {
            let origin = source_info
                .get((line.line as usize).saturating_sub(1))
                .and_then(|&idx| definition.lines.get(idx));
            if let Some(origin) = origin {
                line.file_index = origin.file_index;
                line.line = origin.line;
            }
        }

        let module = self.module;
        let address = self.current_address();
        let code_start = self.segment_mut().current_offset();
        let scope = self.push_scope(ScopeKind::Macro);
        let macro_key = self.tree.normalize(&definition.name);
        {
            let scope = &mut self.tree.module_mut(module).local_scopes[scope];
            scope.macro_arguments = arguments;
            scope.symbols.insert(
                macro_key.clone(),
                SymbolInfo::label(&macro_key, ExpressionValue::Integer(i64::from(address))),
            );
        }
        if let Some(line) = invocation.get() {
            self.output
                .add_to_address_map(line.file_index, line.line, address);
            self.output.list_file_items.push(ListFileItem {
                file_index: line.file_index,
                address,
                line_number: line.line,
                segment_index: Some(self.output.segments.len() - 1),
                code_start_index: code_start,
                code_length: 0,
                source_text: line.source_text.clone(),
                is_macro_invocation: true,
            });
        }
        debug!(name = %definition.name, lines = parsed.len(), "expanding macro");

        let expanded: Rc<[AssemblyLine]> = Rc::from(parsed);
        let mut idx = 0;
        while idx < expanded.len() {
            self.emit_single_line(&expanded, &mut idx, true);
            idx += 1;
        }

        let end = BlockEnd {
            first: definition.first_line,
            last: definition.last_line,
            label: definition.end_label.clone(),
        };
        self.bind_end_label(&definition.lines, &end);
        self.overflow_label = None;
        self.close_local_scope();
        self.macro_invocations.truncate(depth);
    }

    // --- Structs ---

    fn collect_struct(&mut self, lines: &Rc<[AssemblyLine]>, index: &mut usize, label: Option<&str>) {
        let mut failed = false;
        match label {
            None => {
                self.report(ErrorCode::Z0804, Vec::new());
                failed = true;
            }
            Some(name) if name.starts_with('`') => {
                self.report(ErrorCode::Z0805, vec![name.to_string()]);
                failed = true;
            }
            Some(name) => {
                let key = self.tree.normalize(name);
                if self.tree.module(self.module).name_in_use(&key) {
                    self.report(ErrorCode::Z0806, vec![name.to_string()]);
                    failed = true;
                }
            }
        }

        let Some(end) = self.search_for_end(lines, index) else {
            return;
        };
        if end.label.is_some() {
            self.report(ErrorCode::Z0807, Vec::new());
            failed = true;
        }

        let struct_line = self.current_line.clone();
        let mut fields = IndexMap::new();
        let mut size = 0usize;
        let mut invalid_lines = 0;
        for idx in end.first + 1..end.last {
            let Some(line) = lines.get(idx) else {
                continue;
            };
            let here = LineRef::new(lines, idx);
            let pragma = match &line.kind {
                LineKind::Pragma(pragma) if pragma.is_byte_emitting() => Some(pragma),
                LineKind::LabelOnly | LineKind::CommentOnly => None,
                _ => {
                    self.report_at(&here, ErrorCode::Z0808, Vec::new());
                    failed = true;
                    invalid_lines += 1;
                    if invalid_lines > MAX_STRUCT_ERRORS {
                        break;
                    }
                    None
                }
            };

            if let Some(field) = &line.label {
                let key = self.tree.normalize(&field.name);
                if fields.contains_key(&key) {
                    self.report_at(&here, ErrorCode::Z0810, vec![field.name.clone()]);
                    failed = true;
                } else {
                    fields.insert(
                        key,
                        StructField {
                            offset: size,
                            is_used: false,
                        },
                    );
                }
            }

            match pragma {
                Some(Pragma::DefB(values)) => size += values.len(),
                Some(Pragma::DefW(values)) => size += values.len() * 2,
                Some(pragma) => {
                    self.current_line = here;
                    self.size_probe = Some(0);
                    self.apply_data_pragma(pragma);
                    size += self.size_probe.take().unwrap_or(0);
                }
                None => {}
            }
        }
        self.current_line = struct_line;

        let Some(name) = label.filter(|_| !failed) else {
            return;
        };
        let key = self.tree.normalize(name);
        debug!(name, size, "struct defined");
        let module = self.tree.module_mut(self.module);
        module.structs.insert(
            key.clone(),
            StructDefinition {
                name: name.to_string(),
                lines: Rc::clone(lines),
                first_line: end.first,
                last_line: end.last,
                fields,
                size,
            },
        );
        module.symbols.insert(
            key.clone(),
            SymbolInfo::label(&key, ExpressionValue::Integer(size as i64)),
        );
    }

    /// Emit the default bytes of a struct, then open the invocation so the
    /// following field assignments can override them.
    fn invoke_struct(
        &mut self,
        lines: &Rc<[AssemblyLine]>,
        index: usize,
        definition: &StructDefinition,
        args: &[MacroArg],
    ) {
        let invocation = LineRef::new(lines, index);
        if !args.is_empty() {
            self.report(ErrorCode::Z0809, vec![definition.name.clone()]);
        }
        let start_offset = self.segment_mut().current_offset();
        let segment_index = self.output.segments.len() - 1;
        let address = self.current_address();

        self.in_struct_cloning = true;
        let mut idx = definition.first_line + 1;
        while idx < definition.last_line {
            self.emit_single_line(&definition.lines, &mut idx, false);
            idx += 1;
        }
        self.in_struct_cloning = false;
        self.current_line = invocation.clone();
        if let Some(line) = invocation.get() {
            self.push_list_item(line, segment_index, start_offset, address);
        }

        self.struct_invocation = Some(StructInvocation {
            name: definition.name.clone(),
            size: definition.size,
            fields: definition
                .fields
                .iter()
                .map(|(name, field)| (name.clone(), field.offset))
                .collect(),
            start_offset,
            offset: 0,
            bytes: IndexMap::new(),
            deferred: HashSet::new(),
            line: invocation,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tokenizer::Span;

    fn expr() -> Expr {
        Expr::Symbol {
            name: "x".to_string(),
            from_global: false,
            span: Span::default(),
        }
    }

    #[test]
    fn terminators_close_only_their_own_block() {
        assert!(closes(&Statement::Loop(expr()), &Statement::EndLoop));
        assert!(closes(&Statement::IfUsed(expr()), &Statement::EndIf));
        assert!(closes(&Statement::Repeat, &Statement::Until(expr())));
        assert!(!closes(&Statement::Loop(expr()), &Statement::EndWhile));
        assert!(!closes(&Statement::Proc, &Statement::EndIf));
    }

    #[test]
    fn stray_terminators_name_their_opener() {
        assert_eq!(unmatched_names(&Statement::Next), (".next", ".for"));
        assert_eq!(
            unmatched_names(&Statement::Else),
            (".else", ".if/.ifused/.ifnused")
        );
        assert_eq!(
            unmatched_names(&Statement::EndModule),
            (".endmodule/.moduleend", ".module")
        );
    }
}
