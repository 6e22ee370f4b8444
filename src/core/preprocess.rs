// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// Preprocessor for #include, #define/#undef and the #if family, plus the
// one-shot .model pragma.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tracing::debug;

use crate::core::assembler::error::{AssemblerErrorInfo, ErrorCode};
use crate::core::ast::{AssemblyLine, Directive, Expr, LineKind, Pragma};
use crate::core::expr::{eval_expr, EvalContext, ExpressionValue};
use crate::core::functions::SeededRandom;
use crate::core::parser::parse_program;
use crate::z80::SpectrumModel;

/// A source file taking part in the compilation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFileItem {
    pub filename: String,
    pub parent_index: Option<usize>,
    pub includes: Vec<usize>,
}

/// Nesting of `#if`-style directives. `None` marks a block nested in a
/// skipped branch; it stays skipped whatever `#else` says.
#[derive(Debug, Default)]
struct ConditionalStack {
    stack: Vec<Option<bool>>,
}

impl ConditionalStack {
    fn is_active(&self) -> bool {
        self.stack.last().map_or(true, |top| *top == Some(true))
    }

    fn push(&mut self, cond: impl FnOnce() -> bool) {
        let frame = if self.is_active() { Some(cond()) } else { None };
        self.stack.push(frame);
    }

    fn handle_else(&mut self) -> Result<(), ErrorCode> {
        match self.stack.last_mut() {
            None => Err(ErrorCode::Z0206),
            Some(frame) => {
                if let Some(taken) = frame {
                    *taken = !*taken;
                }
                Ok(())
            }
        }
    }

    fn handle_endif(&mut self) -> Result<(), ErrorCode> {
        self.stack.pop().map(|_| ()).ok_or(ErrorCode::Z0207)
    }
}

/// Symbols visible to `#if` expressions: the predefined ones.
struct ConditionContext<'a> {
    symbols: &'a IndexMap<String, ExpressionValue>,
    rng: &'a mut SeededRandom,
}

impl EvalContext for ConditionContext<'_> {
    fn current_address(&self) -> u16 {
        0
    }

    fn symbol_value(&mut self, name: &str, _from_global: bool) -> Option<ExpressionValue> {
        self.symbols.get(&name.to_ascii_lowercase()).cloned()
    }

    fn is_symbol_resolved(&self, name: &str, _from_global: bool) -> bool {
        self.symbols.contains_key(&name.to_ascii_lowercase())
    }

    fn loop_counter(&self) -> Option<i64> {
        None
    }

    fn random(&mut self) -> &mut SeededRandom {
        self.rng
    }
}

/// Parses the main file and everything it includes into a single list of
/// lines, resolving the preprocessor directives on the way.
pub struct Preprocessor {
    pub source_files: Vec<SourceFileItem>,
    pub errors: Vec<AssemblerErrorInfo>,
    /// Names set by `#define` or predefined.
    pub defines: IndexSet<String>,
    /// Model set by `.model`.
    pub model: Option<SpectrumModel>,
    fallback_model: Option<SpectrumModel>,
    symbols: IndexMap<String, ExpressionValue>,
    rng: SeededRandom,
}

impl Preprocessor {
    pub fn new(predefined: &IndexMap<String, i64>, fallback_model: Option<SpectrumModel>) -> Self {
        let symbols = predefined
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), ExpressionValue::Integer(*value)))
            .collect();
        Self {
            source_files: Vec::new(),
            errors: Vec::new(),
            defines: predefined.keys().cloned().collect(),
            model: None,
            fallback_model,
            symbols,
            rng: SeededRandom::default(),
        }
    }

    /// Process the main source. Returns `None` when the main file does not
    /// parse.
    pub fn run(&mut self, filename: &str, source: &str) -> Option<Vec<AssemblyLine>> {
        self.source_files.push(SourceFileItem {
            filename: filename.to_string(),
            parent_index: None,
            includes: Vec::new(),
        });
        let mut lines = Vec::new();
        let parsed = self.process_file(0, source, &mut lines);
        debug!(
            files = self.source_files.len(),
            lines = lines.len(),
            errors = self.errors.len(),
            "preprocessed sources"
        );
        parsed.then_some(lines)
    }

    fn process_file(&mut self, file_index: usize, source: &str, out: &mut Vec<AssemblyLine>) -> bool {
        let (lines, parse_errors) = parse_program(source, file_index, false);
        if !parse_errors.is_empty() {
            let file_name = self.source_files[file_index].filename.clone();
            for err in parse_errors {
                self.errors.push(AssemblerErrorInfo::for_span(
                    err.code,
                    &file_name,
                    err.span,
                    err.message(),
                ));
            }
            return false;
        }

        let mut conditions = ConditionalStack::default();
        for line in &lines {
            match &line.kind {
                LineKind::Directive(directive) => {
                    self.apply_directive(directive, line, &mut conditions, out);
                }
                _ if !conditions.is_active() => {}
                LineKind::Pragma(Pragma::Model(name)) => self.apply_model(name, line),
                _ => out.push(line.clone()),
            }
        }
        if !conditions.stack.is_empty() {
            if let Some(last) = lines.last() {
                self.report(ErrorCode::Z0205, last, Vec::new());
            }
        }
        true
    }

    fn apply_directive(
        &mut self,
        directive: &Directive,
        line: &AssemblyLine,
        conditions: &mut ConditionalStack,
        out: &mut Vec<AssemblyLine>,
    ) {
        match directive {
            Directive::IfDef(name) => conditions.push(|| self.defines.contains(name)),
            Directive::IfNDef(name) => conditions.push(|| !self.defines.contains(name)),
            Directive::IfMod(name) | Directive::IfNMod(name) => {
                let negate = matches!(directive, Directive::IfNMod(_));
                conditions.push(|| match SpectrumModel::from_name(name) {
                    Some(model) => {
                        (self.model.or(self.fallback_model) == Some(model)) != negate
                    }
                    None => {
                        self.report(ErrorCode::Z0303, line, vec![name.clone()]);
                        false
                    }
                });
            }
            Directive::If(expr) => conditions.push(|| self.condition_value(expr, line)),
            Directive::Else => {
                if let Err(code) = conditions.handle_else() {
                    self.report(code, line, Vec::new());
                }
            }
            Directive::EndIf => {
                if let Err(code) = conditions.handle_endif() {
                    self.report(code, line, Vec::new());
                }
            }
            _ if !conditions.is_active() => {}
            Directive::Define(name) => {
                self.defines.insert(name.clone());
            }
            Directive::Undef(name) => {
                self.defines.shift_remove(name);
            }
            Directive::Include(name) => self.include(name, line, out),
            Directive::Line { .. } => {}
        }
    }

    fn apply_model(&mut self, name: &str, line: &AssemblyLine) {
        if self.model.is_some() {
            self.report(ErrorCode::Z0302, line, Vec::new());
            return;
        }
        match SpectrumModel::from_name(name) {
            Some(model) => self.model = Some(model),
            None => self.report(ErrorCode::Z0303, line, vec![name.to_string()]),
        }
    }

    fn condition_value(&mut self, expr: &Expr, line: &AssemblyLine) -> bool {
        let mut ctx = ConditionContext {
            symbols: &self.symbols,
            rng: &mut self.rng,
        };
        match eval_expr(expr, &mut ctx) {
            Ok(value) => value.is_valid() && value.as_bool().unwrap_or(false),
            Err(err) => {
                self.report(err.code, line, err.params);
                false
            }
        }
    }

    fn include(&mut self, name: &str, line: &AssemblyLine, out: &mut Vec<AssemblyLine>) {
        let parent = line.file_index;
        let path = resolve_include_path(&self.source_files[parent].filename, name);
        if !path.is_file() {
            self.report(ErrorCode::Z0201, line, vec![name.to_string()]);
            return;
        }
        let filename = path.to_string_lossy().to_string();
        if self.in_include_chain(parent, &filename) {
            self.report(ErrorCode::Z0202, line, vec![name.to_string()]);
            return;
        }
        if self.source_files.iter().any(|file| same_file(&file.filename, &filename)) {
            self.report(ErrorCode::Z0203, line, vec![name.to_string()]);
            return;
        }
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) => {
                self.report(ErrorCode::Z0204, line, vec![name.to_string(), err.to_string()]);
                return;
            }
        };
        let index = self.source_files.len();
        self.source_files.push(SourceFileItem {
            filename,
            parent_index: Some(parent),
            includes: Vec::new(),
        });
        self.source_files[parent].includes.push(index);
        debug!(file = %path.display(), "including source file");
        self.process_file(index, &source, out);
    }

    fn in_include_chain(&self, from: usize, filename: &str) -> bool {
        std::iter::successors(Some(from), |&idx| self.source_files[idx].parent_index)
            .any(|idx| same_file(&self.source_files[idx].filename, filename))
    }

    fn report(&mut self, code: ErrorCode, line: &AssemblyLine, params: Vec<String>) {
        let file_name = &self.source_files[line.file_index].filename;
        let message = code.message(&params);
        self.errors
            .push(AssemblerErrorInfo::for_line(code, file_name, line, message, false));
    }
}

/// Include paths are relative to the directory of the including file.
pub fn resolve_include_path(parent_file: &str, name: &str) -> PathBuf {
    let name = Path::new(name);
    if name.is_absolute() {
        return name.to_path_buf();
    }
    match Path::new(parent_file).parent() {
        Some(dir) => dir.join(name),
        None => name.to_path_buf(),
    }
}

fn same_file(a: &str, b: &str) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("zxasm-preproc-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn run(source: &str) -> (Vec<AssemblyLine>, Preprocessor) {
        let mut pp = Preprocessor::new(&IndexMap::new(), None);
        let lines = pp.run("main.asm", source).unwrap_or_default();
        (lines, pp)
    }

    fn codes(pp: &Preprocessor) -> Vec<ErrorCode> {
        pp.errors.iter().map(|e| e.code).collect()
    }

    #[test]
    fn ifdef_selects_true_branch() {
        let (lines, pp) = run("#define FOO\n#ifdef FOO\n nop\n#else\n halt\n#endif\n");
        assert!(pp.errors.is_empty());
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].source_text, "nop");
    }

    #[test]
    fn nested_blocks_in_skipped_branch_stay_skipped() {
        let source = "#ifdef NONE\n#ifdef NONE\n nop\n#else\n halt\n#endif\n#endif\n di\n";
        let (lines, pp) = run(source);
        assert!(pp.errors.is_empty());
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].source_text, "di");
    }

    #[test]
    fn if_directive_uses_predefined_symbols() {
        let mut predefined = IndexMap::new();
        predefined.insert("DEBUG".to_string(), 2);
        let mut pp = Preprocessor::new(&predefined, None);
        let lines = pp
            .run("main.asm", "#if debug > 1\n nop\n#endif\n#ifdef DEBUG\n ei\n#endif\n")
            .unwrap();
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn reports_unbalanced_directives() {
        let (_, pp) = run("#else\n#endif\n#ifdef X\n nop\n");
        assert_eq!(
            codes(&pp),
            vec![ErrorCode::Z0206, ErrorCode::Z0207, ErrorCode::Z0205]
        );
    }

    #[test]
    fn model_pragma_drives_ifmod() {
        let source = " .model Spectrum128\n#ifmod SPECTRUM128\n nop\n#endif\n#ifnmod next\n ei\n#endif\n";
        let (lines, pp) = run(source);
        assert!(pp.errors.is_empty());
        assert_eq!(pp.model, Some(SpectrumModel::Spectrum128));
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn model_pragma_is_allowed_once() {
        let (_, pp) = run(" .model next\n .model spectrum48\n .model zx81\n");
        assert_eq!(codes(&pp), vec![ErrorCode::Z0302, ErrorCode::Z0302]);
        let (_, pp) = run(" .model zx81\n");
        assert_eq!(codes(&pp), vec![ErrorCode::Z0303]);
    }

    #[test]
    fn parse_errors_abort_the_file() {
        let mut pp = Preprocessor::new(&IndexMap::new(), None);
        assert!(pp.run("main.asm", " ld a,(ix+\n").is_none());
        assert!(!pp.errors.is_empty());
    }

    #[test]
    fn includes_files_relative_to_parent() {
        let dir = temp_dir();
        fs::write(dir.join("inc.asm"), " halt\n").unwrap();
        let main = dir.join("main.asm");
        fs::write(&main, " nop\n#include \"inc.asm\"\n di\n").unwrap();
        let mut pp = Preprocessor::new(&IndexMap::new(), None);
        let source = fs::read_to_string(&main).unwrap();
        let lines = pp.run(&main.to_string_lossy(), &source).unwrap();
        assert!(pp.errors.is_empty());
        let texts: Vec<_> = lines.iter().map(|l| l.source_text.as_str()).collect();
        assert_eq!(texts, vec!["nop", "halt", "di"]);
        assert_eq!(lines[1].file_index, 1);
        assert_eq!(pp.source_files[0].includes, vec![1]);
    }

    #[test]
    fn reports_missing_and_circular_includes() {
        let dir = temp_dir();
        let main = dir.join("main.asm");
        fs::write(dir.join("self.asm"), "#include \"self.asm\"\n").unwrap();
        let mut pp = Preprocessor::new(&IndexMap::new(), None);
        pp.run(
            &main.to_string_lossy(),
            "#include \"nothere.asm\"\n#include \"self.asm\"\n#include \"self.asm\"\n",
        );
        assert_eq!(
            codes(&pp),
            vec![ErrorCode::Z0201, ErrorCode::Z0202, ErrorCode::Z0203]
        );
    }
}
