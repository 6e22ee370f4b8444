// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Error codes, diagnostics, and reporting for the assembler.

use std::fmt;
use std::path::PathBuf;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::core::ast::AssemblyLine;
use crate::core::tokenizer::Span;

macro_rules! error_codes {
    ($($variant:ident = $code:literal => $template:literal),+ $(,)?) => {
        /// Every diagnostic the assembler can report.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ErrorCode {
            $($variant),+
        }

        impl ErrorCode {
            /// The `Znnnn` identifier.
            pub fn code(self) -> &'static str {
                match self {
                    $(Self::$variant => $code,)+
                }
            }

            /// Message template; `{0}` and `{1}` are parameter slots.
            pub fn template(self) -> &'static str {
                match self {
                    $(Self::$variant => $template,)+
                }
            }

            /// Look up a code by its `Znnnn` identifier.
            pub fn from_code(code: &str) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

error_codes! {
    Z0111 = "Z0111" => "The target of a conditional jump must be an address expression",
    Z0201 = "Z0201" => "Cannot find include file: '{0}'",
    Z0202 = "Z0202" => "Circular file include: '{0}'",
    Z0203 = "Z0203" => "The file '{0}' is already included",
    Z0204 = "Z0204" => "Error reading include file '{0}': {1}",
    Z0205 = "Z0205" => "Missing #endif directive",
    Z0206 = "Z0206" => "Unexpected #else directive",
    Z0207 = "Z0207" => "Unexpected #endif directive",
    Z0208 = "Z0208" => "Invalid #line directive",
    Z0302 = "Z0302" => "The .model pragma can be used only once",
    Z0303 = "Z0303" => "Unknown Spectrum model: '{0}'",
    Z0304 = "Z0304" => "The .equ pragma requires a label",
    Z0305 = "Z0305" => "The .bank pragma cannot have a label",
    Z0306 = "Z0306" => "The .bank pragma value must be between 0 and 7",
    Z0307 = "Z0307" => "The .bank offset must be between 0 and 16383",
    Z0308 = "Z0308" => "The .bank pragma requires a Spectrum 128, +3 or Next model",
    Z0309 = "Z0309" => "Bank {0} is already used",
    Z0310 = "Z0310" => "The {0} pragma can be used only in the global scope",
    Z0311 = "Z0311" => "The .var pragma requires a label",
    Z0312 = "Z0312" => "A label with the same name already exists; it cannot be used as a variable",
    Z0313 = "Z0313" => "The .skip target {0} is less than the current address {1}",
    Z0314 = "Z0314" => "The .xorg pragma can be used only once per segment",
    Z0315 = "Z0315" => "The .defm/.defn/.defc pragma requires a string argument",
    Z0316 = "Z0316" => "The .defh pragma requires a string argument",
    Z0317 = "Z0317" => "The .defh argument must be an even number of hexadecimal digits",
    Z0318 = "Z0318" => "Invalid .align value: {0}; it must be between 1 and 16384",
    Z0319 = "Z0319" => "The file name must be a string",
    Z0320 = "Z0320" => "Invalid .includebin offset",
    Z0321 = "Z0321" => "Invalid .includebin length",
    Z0322 = "Z0322" => "Cannot read the binary file: {0}",
    Z0323 = "Z0323" => "Including the binary file would exceed the maximum segment length",
    Z0324 = "Z0324" => "The .defgx pragma requires a string argument",
    Z0325 = "Z0325" => "The graphics pattern is empty",
    Z0326 = "Z0326" => "The .comparebin file name must be a string",
    Z0327 = "Z0327" => "Invalid .comparebin offset",
    Z0328 = "Z0328" => "Invalid .comparebin length",
    Z0329 = "Z0329" => "Cannot read the binary file '{0}': {1}",
    Z0330 = "Z0330" => "Binary comparison failed: {0}",
    Z0331 = "Z0331" => "The .comparebin pragma cannot be used in a struct",
    Z0401 = "Z0401" => "Unsupported instruction: '{0}'",
    Z0402 = "Z0402" => "The jr instruction accepts only nz, z, nc or c conditions",
    Z0403 = "Z0403" => "Relative jump distance {0} is out of the -128..127 range",
    Z0404 = "Z0404" => "Invalid rst value: #{0}",
    Z0405 = "Z0405" => "Invalid interrupt mode: {0}",
    Z0406 = "Z0406" => "Only 0 can be written to the (c) port",
    Z0407 = "Z0407" => "Invalid bit index: {0}; it must be between 0 and 7",
    Z0408 = "Z0408" => "The first operand must be 'a'",
    Z0409 = "Z0409" => "The first 8-bit operand must be 'a'",
    Z0410 = "Z0410" => "The emitted code exceeds the 64K address space",
    Z0411 = "Z0411" => "The emitted code exceeds the maximum segment length",
    Z0412 = "Z0412" => "The pop instruction cannot take an expression",
    Z0413 = "Z0413" => "Invalid push/pop operand",
    Z0414 = "Z0414" => "This instruction is available only on the ZX Spectrum Next",
    Z0501 = "Z0501" => "Duplicated symbol: '{0}'",
    Z0502 = "Z0502" => "The variable '{0}' already exists",
    Z0503 = "Z0503" => "A {0} statement cannot have a label",
    Z0504 = "Z0504" => "The .local statement can be used only inside a local scope",
    Z0505 = "Z0505" => "Temporary symbol '{0}' cannot be declared with .local",
    Z0506 = "Z0506" => "The local symbol '{0}' is already declared",
    Z0601 = "Z0601" => "The .defb/.defw pragma does not accept a string value",
    Z0602 = "Z0602" => "An integer value is expected",
    Z0603 = "Z0603" => "A string value cannot be used here",
    Z0604 = "Z0604" => "Invalid operand",
    Z0605 = "Z0605" => "Unresolved symbol: '{0}'",
    Z0606 = "Z0606" => "Expression evaluation error: {0}",
    Z0701 = "Z0701" => "Missing end statement for {0}",
    Z0702 = "Z0702" => "A loop cannot run more than 65535 times",
    Z0703 = "Z0703" => "Too many errors in the loop body; the loop is stopped",
    Z0704 = "Z0704" => "The {0} statement has no matching {1}",
    Z0705 = "Z0705" => "The loop counter can be used only inside a loop",
    Z0706 = "Z0706" => "The .for loop step cannot be zero",
    Z0707 = "Z0707" => "The .break statement can be used only inside a loop",
    Z0708 = "Z0708" => "The .continue statement can be used only inside a loop",
    Z0709 = "Z0709" => "There can be only one .else section; {0} follows it",
    Z0801 = "Z0801" => "Struct '{0}' is {1} bytes long, but {2} bytes are emitted",
    Z0802 = "Z0802" => "Struct '{0}' has no field named '{1}'",
    Z0803 = "Z0803" => "A field assignment can be used only in a struct invocation",
    Z0804 = "Z0804" => "The .struct statement requires a label",
    Z0805 = "Z0805" => "A temporary label cannot name a struct: '{0}'",
    Z0806 = "Z0806" => "The name '{0}' is already in use; it cannot name a struct",
    Z0807 = "Z0807" => "The .ends statement cannot have a label",
    Z0808 = "Z0808" => "A struct body can contain only byte-emitting pragmas",
    Z0809 = "Z0809" => "A struct invocation cannot have arguments: '{0}'",
    Z0810 = "Z0810" => "Duplicated struct field: '{0}'",
    Z0901 = "Z0901" => "The .module statement requires a name or a label",
    Z0902 = "Z0902" => "A temporary label cannot name a module: '{0}'",
    Z0903 = "Z0903" => "Module '{0}' already exists",
    Z0904 = "Z0904" => "A module cannot be defined inside a macro or a loop",
    Z1001 = "Z1001" => "Duplicated macro argument: '{0}'",
    Z1002 = "Z1002" => "The .macro statement requires a label",
    Z1003 = "Z1003" => "A temporary label cannot name a macro: '{0}'",
    Z1004 = "Z1004" => "The name '{0}' is already in use; it cannot name a macro",
    Z1005 = "Z1005" => "A macro definition cannot be nested into another one",
    Z1006 = "Z1006" => "Unknown macro parameter: '{0}'",
    Z1007 = "Z1007" => "Unknown macro or struct: '{0}'",
    Z1008 = "Z1008" => "Macro '{0}' accepts {1} arguments, but {2} are passed",
    Z1009 = "Z1009" => "A macro-time function can be applied only to a macro parameter",
    Z1010 = "Z1010" => "Unresolved macro parameter in the expanded line",
    Z1011 = "Z1011" => "A macro parameter can be used only in a macro definition",
    Z1012 = "Z1012" => "Error in macro invocation{0}",
    Z1013 = "Z1013" => "Struct '{0}' is invoked without parentheses",
    Z1014 = "Z1014" => "Macro '{0}' is invoked without parentheses",
    Z1101 = "Z1101" => "Unexpected token: '{0}'",
    Z1102 = "Z1102" => "A comma is expected",
    Z1103 = "Z1103" => "An expression is expected",
    Z1104 = "Z1104" => "An operand is expected",
    Z1105 = "Z1105" => "A closing parenthesis is expected",
    Z1106 = "Z1106" => "A closing bracket is expected",
    Z1107 = "Z1107" => "An identifier is expected",
    Z1108 = "Z1108" => "A string literal is expected",
    Z1109 = "Z1109" => "'}}' is expected",
    Z1110 = "Z1110" => "':' is expected in the conditional expression",
    Z1111 = "Z1111" => "'=' is expected after the loop variable",
    Z1112 = "Z1112" => "'.to' is expected",
    Z1113 = "Z1113" => "Invalid index register expression",
    Z1114 = "Z1114" => "A 16-bit register is expected",
    Z1115 = "Z1115" => "Invalid number literal: '{0}'",
    Z1116 = "Z1116" => "'(' is expected",
    Z1117 = "Z1117" => "The end of the line is expected",
    Z1118 = "Z1118" => "Lexical error: {0}",
    Z1119 = "Z1119" => "Only a byte-emitting pragma can follow '->'",
    Z1120 = "Z1120" => "Invalid argument for textof/ltextof",
    Z1121 = "Z1121" => "A model name is expected",
    Z2000 = "Z2000" => "Error: {0}",
}

impl ErrorCode {
    /// Render the message template with its parameters.
    pub fn message(self, params: &[String]) -> String {
        let mut text = self.template().to_string();
        for (idx, param) in params.iter().enumerate() {
            text = text.replace(&format!("{{{idx}}}"), param);
        }
        text
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

/// One reported assembly diagnostic.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblerErrorInfo {
    pub code: ErrorCode,
    pub file_name: String,
    pub line: u32,
    pub start_position: usize,
    pub end_position: usize,
    pub start_column: usize,
    pub end_column: usize,
    pub message: String,
    pub is_warning: bool,
}

impl AssemblerErrorInfo {
    /// Diagnostic covering the statement part of `line`, up to its comment.
    pub fn for_line(
        code: ErrorCode,
        file_name: &str,
        line: &AssemblyLine,
        message: String,
        is_warning: bool,
    ) -> Self {
        let statement = line.source_text.split(';').next().unwrap_or("").trim();
        let end_column = (line.start_column + statement.len()).saturating_sub(1);
        Self {
            code,
            file_name: file_name.to_string(),
            line: line.line,
            start_position: line.start_position,
            end_position: line.end_position + 1,
            start_column: line.start_column,
            end_column: end_column + 1,
            message,
            is_warning,
        }
    }

    /// Single-character diagnostic at `span`.
    pub fn for_span(code: ErrorCode, file_name: &str, span: Span, message: String) -> Self {
        Self {
            code,
            file_name: file_name.to_string(),
            line: span.line,
            start_position: span.start,
            end_position: span.start + 1,
            start_column: span.col_start,
            end_column: span.col_start + 1,
            message,
            is_warning: false,
        }
    }

    pub fn severity(&self) -> Severity {
        if self.is_warning {
            Severity::Warning
        } else {
            Severity::Error
        }
    }

    /// Terminal diagnostic built from this entry.
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::new(self.line, self.severity(), self.code, &self.message)
            .with_column(Some(self.start_column))
            .with_file(Some(self.file_name.clone()))
    }
}

/// Host-level compilation failures.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("cannot read source file {path}: {source}")]
    ReadSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Severity level for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

/// A diagnostic message with location and context.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub(crate) line: u32,
    pub(crate) column: Option<usize>,
    pub(crate) severity: Severity,
    pub(crate) code: ErrorCode,
    pub(crate) message: String,
    pub(crate) file: Option<String>,
    pub(crate) source: Option<String>,
}

impl Diagnostic {
    pub fn new(line: u32, severity: Severity, code: ErrorCode, message: &str) -> Self {
        Self {
            line,
            column: None,
            severity,
            code,
            message: message.to_string(),
            file: None,
            source: None,
        }
    }

    pub fn with_column(mut self, column: Option<usize>) -> Self {
        self.column = column;
        self
    }

    pub fn with_file(mut self, file: Option<String>) -> Self {
        self.file = file;
        self
    }

    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }

    pub fn format(&self) -> String {
        format!(
            "{}: {} {} - {}",
            self.line,
            self.severity.label(),
            self.code,
            self.message
        )
    }

    pub fn format_with_context(&self, lines: Option<&[String]>, use_color: bool) -> String {
        let sev = self.severity.label();
        let header = match &self.file {
            Some(file) => format!("{file}:{}: {sev}", self.line),
            None => format!("{}: {sev}", self.line),
        };

        let mut out = String::new();
        out.push_str(&header);
        out.push('\n');

        let context = build_context_lines(
            self.line,
            self.column,
            lines,
            self.source.as_deref(),
            use_color,
        );
        for line in context {
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str(&format!("{sev} {}: {}", self.code, self.message));
        out
    }
}

/// Build context lines for error display.
pub fn build_context_lines(
    line_num: u32,
    column: Option<usize>,
    lines: Option<&[String]>,
    source_override: Option<&str>,
    use_color: bool,
) -> Vec<String> {
    let line_idx = line_num.saturating_sub(1) as usize;

    if let Some(source) = source_override {
        return vec![format!(
            "{:>5} | {}",
            line_num,
            highlight_line(source, column, use_color)
        )];
    }

    match lines.and_then(|lines| lines.get(line_idx)) {
        Some(line) => vec![format!(
            "{:>5} | {}",
            line_num,
            highlight_line(line, column, use_color)
        )],
        None => vec![format!("{:>5} | <source unavailable>", line_num)],
    }
}

/// Mark the character at `column` (zero-based) in red.
fn highlight_line(line: &str, column: Option<usize>, use_color: bool) -> String {
    let Some(col) = column else {
        return line.to_string();
    };
    if !use_color || col >= line.len() || !line.is_char_boundary(col) {
        return line.to_string();
    }
    let mut end = col + 1;
    while end < line.len() && !line.is_char_boundary(end) {
        end += 1;
    }
    format!(
        "{}\x1b[1;31m{}\x1b[0m{}",
        &line[..col],
        &line[col..end],
        &line[end..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_format_includes_line_and_severity() {
        let diag = Diagnostic::new(12, Severity::Error, ErrorCode::Z0604, "Invalid operand");
        assert_eq!(diag.format(), "12: ERROR Z0604 - Invalid operand");
    }

    #[test]
    fn message_fills_parameter_slots() {
        let text = ErrorCode::Z0313.message(&["32768".to_string(), "32770".to_string()]);
        assert_eq!(
            text,
            "The .skip target 32768 is less than the current address 32770"
        );
        assert_eq!(ErrorCode::Z0702.to_string(), "Z0702");
        assert_eq!(ErrorCode::from_code("Z1008"), Some(ErrorCode::Z1008));
    }

    #[test]
    fn context_shows_source_excerpt() {
        let lines = vec!["  nop".to_string(), "  ld a,(ix+".to_string()];
        let diag = Diagnostic::new(2, Severity::Error, ErrorCode::Z1105, "bad")
            .with_file(Some("main.asm".to_string()))
            .with_column(Some(2));
        let text = diag.format_with_context(Some(&lines), false);
        assert!(text.starts_with("main.asm:2: ERROR\n"));
        assert!(text.contains("    2 |   ld a,(ix+"));
        assert!(text.ends_with("ERROR Z1105: bad"));
    }

    #[test]
    fn highlight_marks_column_when_colored() {
        assert_eq!(highlight_line("abc", Some(1), false), "abc");
        assert_eq!(highlight_line("abc", Some(1), true), "a\x1b[1;31mb\x1b[0mc");
    }
}
