// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Tokenizer for Z80 assembly source with spans.
//!
//! The tokenizer walks the whole source text and produces one token at a
//! time. Reserved words (mnemonics, registers, pragmas, statements and
//! preprocessor directives) are resolved through [`resolve_word`]; every
//! other word stays an identifier. Comments are skipped, but the most recent
//! one is kept so the parser can attach it to its line.

use crate::core::text_utils::{is_ident_char, is_ident_start, is_space};
use crate::z80::{Mnemonic, Register};

/// Source location of a token. Positions are byte offsets into the source
/// text, columns are zero-based offsets within the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub col_start: usize,
    pub col_end: usize,
    pub start: usize,
    pub end: usize,
}

impl Span {
    /// Span covering `self` through `other`.
    pub fn to(self, other: Span) -> Span {
        Span {
            line: self.line,
            col_start: self.col_start,
            col_end: if other.line == self.line {
                other.col_end
            } else {
                self.col_end
            },
            start: self.start,
            end: other.end.max(self.end),
        }
    }
}

/// Assembler pragmas (`.org`, `.defb`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PragmaKeyword {
    Org,
    Bank,
    Xorg,
    Ent,
    Xent,
    Equ,
    Var,
    Disp,
    DefB,
    DefW,
    DefM,
    DefN,
    DefC,
    DefH,
    DefS,
    FillB,
    FillW,
    Skip,
    Align,
    Trace,
    TraceHex,
    RndSeed,
    DefG,
    DefGx,
    Error,
    IncludeBin,
    CompareBin,
    InjectOpt,
    Model,
    OnSuccess,
    Extern,
}

impl PragmaKeyword {
    pub fn from_name(lower: &str) -> Option<Self> {
        let kw = match lower {
            "org" => Self::Org,
            "bank" => Self::Bank,
            "xorg" => Self::Xorg,
            "ent" => Self::Ent,
            "xent" => Self::Xent,
            "equ" => Self::Equ,
            "var" => Self::Var,
            "disp" => Self::Disp,
            "defb" | "db" => Self::DefB,
            "defw" | "dw" => Self::DefW,
            "defm" | "dm" => Self::DefM,
            "defn" | "dn" => Self::DefN,
            "defc" | "dc" => Self::DefC,
            "defh" | "dh" => Self::DefH,
            "defs" | "ds" => Self::DefS,
            "fillb" => Self::FillB,
            "fillw" => Self::FillW,
            "skip" => Self::Skip,
            "align" => Self::Align,
            "trace" => Self::Trace,
            "tracehex" => Self::TraceHex,
            "rndseed" => Self::RndSeed,
            "defg" | "dg" => Self::DefG,
            "defgx" | "dgx" => Self::DefGx,
            "error" => Self::Error,
            "includebin" | "include_bin" | "incbin" => Self::IncludeBin,
            "comparebin" => Self::CompareBin,
            "injectopt" => Self::InjectOpt,
            "model" => Self::Model,
            "onsuccess" => Self::OnSuccess,
            "extern" => Self::Extern,
            _ => return None,
        };
        Some(kw)
    }
}

/// Structural statement keywords (`.loop`, `.endm`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKeyword {
    Macro,
    EndMacro,
    Proc,
    EndProc,
    Loop,
    EndLoop,
    Repeat,
    Until,
    While,
    EndWhile,
    If,
    IfUsed,
    IfNotUsed,
    Elif,
    Else,
    EndIf,
    Break,
    Continue,
    Module,
    EndModule,
    Struct,
    EndStruct,
    Local,
    For,
    To,
    Step,
    Next,
}

impl StatementKeyword {
    /// Resolve a dotted statement keyword (without the dot).
    pub fn from_name(lower: &str) -> Option<Self> {
        let kw = match lower {
            "macro" => Self::Macro,
            "endm" | "mend" => Self::EndMacro,
            "proc" => Self::Proc,
            "endp" | "pend" => Self::EndProc,
            "loop" => Self::Loop,
            "endl" | "lend" => Self::EndLoop,
            "repeat" => Self::Repeat,
            "until" => Self::Until,
            "while" => Self::While,
            "endw" | "wend" => Self::EndWhile,
            "if" => Self::If,
            "ifused" => Self::IfUsed,
            "ifnused" => Self::IfNotUsed,
            "elif" => Self::Elif,
            "else" => Self::Else,
            "endif" => Self::EndIf,
            "break" => Self::Break,
            "continue" => Self::Continue,
            "module" | "scope" => Self::Module,
            "endmodule" | "moduleend" | "endscope" | "scopeend" => Self::EndModule,
            "struct" => Self::Struct,
            "ends" => Self::EndStruct,
            "local" => Self::Local,
            "for" => Self::For,
            "to" => Self::To,
            "step" => Self::Step,
            "next" => Self::Next,
            _ => return None,
        };
        Some(kw)
    }

    /// Statement keywords that are also reserved without the leading dot.
    pub fn from_bare_name(lower: &str) -> Option<Self> {
        match lower {
            "loop" | "endl" | "lend" | "proc" | "endp" | "pend" | "repeat" | "until" | "while"
            | "endw" | "wend" | "else" | "elif" | "endif" | "next" | "break" | "continue"
            | "ends" | "endm" | "mend" | "local" => Self::from_name(lower),
            _ => None,
        }
    }
}

/// Preprocessor directives (`#include`, `#ifdef`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveKeyword {
    Include,
    Define,
    Undef,
    If,
    IfDef,
    IfNDef,
    IfMod,
    IfNMod,
    Else,
    EndIf,
    Line,
}

impl DirectiveKeyword {
    pub fn from_name(lower: &str) -> Option<Self> {
        let kw = match lower {
            "include" => Self::Include,
            "define" => Self::Define,
            "undef" => Self::Undef,
            "if" => Self::If,
            "ifdef" => Self::IfDef,
            "ifndef" => Self::IfNDef,
            "ifmod" => Self::IfMod,
            "ifnmod" => Self::IfNMod,
            "else" => Self::Else,
            "endif" => Self::EndIf,
            "line" => Self::Line,
            _ => return None,
        };
        Some(kw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Plus,
    Minus,
    Multiply,
    Divide,
    Mod,
    Shl,
    Shr,
    BitNot,
    LogicNot,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    CaseEq,
    Ne,
    CaseNe,
    Ge,
    Gt,
    Le,
    Lt,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Register(Register),
    Mnemonic(Mnemonic),
    Pragma(PragmaKeyword),
    Statement(StatementKeyword),
    Directive(DirectiveKeyword),
    Integer(i64),
    Real(f64),
    Char(String),
    String(String),
    True,
    False,
    /// `$<none>$` placeholder for omitted macro arguments.
    NoneArg,
    /// `$cnt` / `.cnt`
    LoopCounter,
    /// Raw text after `.defg`, up to the end of the line.
    RawText(String),
    Dollar,
    Dot,
    Comma,
    Colon,
    DoubleColon,
    Assign,
    ColonAssign,
    Arrow,
    Question,
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,
    OpenMacroParam,
    CloseMacroParam,
    Operator(OperatorKind),
    NewLine,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn is_line_end(&self) -> bool {
        matches!(self.kind, TokenKind::NewLine | TokenKind::Eof)
    }
}

#[derive(Debug, Clone)]
pub struct TokenizeError {
    pub message: String,
    pub span: Span,
}

/// Resolve a reserved word. `lower` is the lower-cased word as written,
/// including a leading `.` when present.
pub fn resolve_word(lower: &str) -> Option<TokenKind> {
    if let Some(rest) = lower.strip_prefix('.') {
        if rest == "cnt" {
            return Some(TokenKind::LoopCounter);
        }
        if let Some(kw) = PragmaKeyword::from_name(rest) {
            return Some(TokenKind::Pragma(kw));
        }
        return StatementKeyword::from_name(rest).map(TokenKind::Statement);
    }
    if let Some(reg) = Register::from_name(lower) {
        return Some(TokenKind::Register(reg));
    }
    if let Some(m) = Mnemonic::from_name(lower) {
        return Some(TokenKind::Mnemonic(m));
    }
    match lower {
        "true" => return Some(TokenKind::True),
        "false" => return Some(TokenKind::False),
        _ => {}
    }
    if let Some(kw) = PragmaKeyword::from_name(lower) {
        return Some(TokenKind::Pragma(kw));
    }
    StatementKeyword::from_bare_name(lower).map(TokenKind::Statement)
}

/// Lower-cased form of `text` when it may name a reserved word. Keywords
/// are recognized only in all-lowercase or ALL-UPPERCASE spelling; any
/// other mix of cases is an identifier.
pub fn keyword_form(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    if text == lower || text == text.to_ascii_uppercase() {
        Some(lower)
    } else {
        None
    }
}

pub struct Tokenizer<'a> {
    input: &'a [u8],
    cursor: usize,
    line: u32,
    line_start: usize,
    last_comment: Option<String>,
    pending_raw_tail: bool,
}

impl<'a> Tokenizer<'a> {
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        Self {
            input: source.as_bytes(),
            cursor: 0,
            line: 1,
            line_start: 0,
            last_comment: None,
            pending_raw_tail: false,
        }
    }

    /// Take the comment seen most recently, if any.
    pub fn take_comment(&mut self) -> Option<String> {
        self.last_comment.take()
    }

    /// Tokenize the whole input. The returned list always ends with `Eof`.
    pub fn tokenize(mut self) -> (Vec<Token>, Vec<Option<String>>, Vec<TokenizeError>) {
        let mut tokens = Vec::new();
        let mut comments = Vec::new();
        let mut errors = Vec::new();
        loop {
            match self.next_token() {
                Ok(token) => {
                    let is_eof = token.kind == TokenKind::Eof;
                    let comment = if token.is_line_end() {
                        self.take_comment()
                    } else {
                        None
                    };
                    tokens.push(token);
                    comments.push(comment);
                    if is_eof {
                        break;
                    }
                }
                Err(err) => {
                    errors.push(err);
                    self.skip_to_line_end();
                }
            }
        }
        (tokens, comments, errors)
    }

    /// Fetch the next token. After the end of input it keeps returning `Eof`.
    pub fn next_token(&mut self) -> Result<Token, TokenizeError> {
        if self.pending_raw_tail {
            self.pending_raw_tail = false;
            if let Some(token) = self.scan_raw_tail() {
                return Ok(token);
            }
        }
        self.skip_white_and_comments()?;
        let start = self.cursor;
        let c = self.current_byte();
        if self.cursor >= self.input.len() {
            return Ok(self.token(TokenKind::Eof, start));
        }
        match c {
            b'\n' => {
                self.cursor += 1;
                let token = self.token(TokenKind::NewLine, start);
                self.line += 1;
                self.line_start = self.cursor;
                Ok(token)
            }
            b'\r' => {
                self.cursor += 1;
                if self.current_byte() == b'\n' {
                    self.cursor += 1;
                }
                let token = self.token(TokenKind::NewLine, start);
                self.line += 1;
                self.line_start = self.cursor;
                Ok(token)
            }
            _ if is_ident_start(c) => self.scan_word(start),
            _ if c.is_ascii_digit() => self.scan_number(start),
            b'"' => self.scan_string(start),
            b'\'' => self.scan_char(start),
            b'.' => {
                if is_ident_start(self.peek_raw_byte(1)) && self.peek_raw_byte(1) != b'`' {
                    self.scan_word(start)
                } else {
                    self.cursor += 1;
                    Ok(self.token(TokenKind::Dot, start))
                }
            }
            b'$' => self.scan_dollar(start),
            b'#' => self.scan_hash(start),
            b'%' => {
                let next = self.peek_raw_byte(1);
                if (next == b'0' || next == b'1') && self.is_prefix_context(start) {
                    self.cursor += 1;
                    self.scan_digits(start, 2)
                } else {
                    self.cursor += 1;
                    Ok(self.token(TokenKind::Operator(OperatorKind::Mod), start))
                }
            }
            _ => self.scan_operator(start, c),
        }
    }

    fn token(&self, kind: TokenKind, start: usize) -> Token {
        Token {
            kind,
            span: self.span(start),
        }
    }

    fn span(&self, start: usize) -> Span {
        Span {
            line: self.line,
            col_start: start.saturating_sub(self.line_start),
            col_end: self.cursor.saturating_sub(self.line_start),
            start,
            end: self.cursor,
        }
    }

    fn error(&self, message: &str, start: usize) -> TokenizeError {
        TokenizeError {
            message: message.to_string(),
            span: self.span(start),
        }
    }

    fn scan_operator(&mut self, start: usize, c: u8) -> Result<Token, TokenizeError> {
        self.cursor += 1;
        let next = self.current_byte();
        let (kind, extra) = match c {
            b',' => (TokenKind::Comma, 0),
            b':' => match next {
                b':' => (TokenKind::DoubleColon, 1),
                b'=' => (TokenKind::ColonAssign, 1),
                _ => (TokenKind::Colon, 0),
            },
            b'(' => (TokenKind::OpenParen, 0),
            b')' => (TokenKind::CloseParen, 0),
            b'[' => (TokenKind::OpenBracket, 0),
            b']' => (TokenKind::CloseBracket, 0),
            b'?' => (TokenKind::Question, 0),
            b'{' if next == b'{' => (TokenKind::OpenMacroParam, 1),
            b'}' if next == b'}' => (TokenKind::CloseMacroParam, 1),
            b'+' => (TokenKind::Operator(OperatorKind::Plus), 0),
            b'-' if next == b'>' => (TokenKind::Arrow, 1),
            b'-' => (TokenKind::Operator(OperatorKind::Minus), 0),
            b'*' => (TokenKind::Operator(OperatorKind::Multiply), 0),
            b'/' => (TokenKind::Operator(OperatorKind::Divide), 0),
            b'~' => (TokenKind::Operator(OperatorKind::BitNot), 0),
            b'&' => (TokenKind::Operator(OperatorKind::BitAnd), 0),
            b'|' => (TokenKind::Operator(OperatorKind::BitOr), 0),
            b'^' => (TokenKind::Operator(OperatorKind::BitXor), 0),
            b'=' => {
                if next == b'=' {
                    if self.peek_raw_byte(1) == b'=' {
                        (TokenKind::Operator(OperatorKind::CaseEq), 2)
                    } else {
                        (TokenKind::Operator(OperatorKind::Eq), 1)
                    }
                } else {
                    (TokenKind::Assign, 0)
                }
            }
            b'!' => {
                if next == b'=' {
                    if self.peek_raw_byte(1) == b'=' {
                        (TokenKind::Operator(OperatorKind::CaseNe), 2)
                    } else {
                        (TokenKind::Operator(OperatorKind::Ne), 1)
                    }
                } else {
                    (TokenKind::Operator(OperatorKind::LogicNot), 0)
                }
            }
            b'<' => match next {
                b'<' => (TokenKind::Operator(OperatorKind::Shl), 1),
                b'=' => (TokenKind::Operator(OperatorKind::Le), 1),
                b'?' => (TokenKind::Operator(OperatorKind::Min), 1),
                _ => (TokenKind::Operator(OperatorKind::Lt), 0),
            },
            b'>' => match next {
                b'>' => (TokenKind::Operator(OperatorKind::Shr), 1),
                b'=' => (TokenKind::Operator(OperatorKind::Ge), 1),
                b'?' => (TokenKind::Operator(OperatorKind::Max), 1),
                _ => (TokenKind::Operator(OperatorKind::Gt), 0),
            },
            _ => return Err(self.error("Illegal character", start)),
        };
        self.cursor += extra;
        Ok(self.token(kind, start))
    }

    fn scan_word(&mut self, start: usize) -> Result<Token, TokenizeError> {
        self.cursor += 1;
        while is_ident_char(self.current_byte()) {
            self.cursor += 1;
        }
        let mut text = String::from_utf8_lossy(&self.input[start..self.cursor]).to_string();
        let Some(mut lower) = keyword_form(&text) else {
            return Ok(self.token(TokenKind::Identifier(text), start));
        };
        if lower == "af" && self.current_byte() == b'\'' {
            self.cursor += 1;
            text.push('\'');
            lower.push('\'');
        }
        let kind = match resolve_word(&lower) {
            Some(kind) => kind,
            None => TokenKind::Identifier(text),
        };
        if kind == TokenKind::Pragma(PragmaKeyword::DefG) {
            self.pending_raw_tail = true;
        }
        Ok(self.token(kind, start))
    }

    /// Capture the rest of the line after `.defg` verbatim (leading blanks
    /// removed). Returns `None` when nothing but blanks follows.
    fn scan_raw_tail(&mut self) -> Option<Token> {
        while is_space(self.current_byte()) {
            self.cursor += 1;
        }
        let start = self.cursor;
        while !matches!(self.current_byte(), 0 | b'\n' | b'\r') {
            self.cursor += 1;
        }
        if self.cursor == start {
            return None;
        }
        let text = String::from_utf8_lossy(&self.input[start..self.cursor]).to_string();
        Some(self.token(TokenKind::RawText(text), start))
    }

    fn scan_dollar(&mut self, start: usize) -> Result<Token, TokenizeError> {
        let rest = &self.input[self.cursor..];
        if rest.starts_with(b"$<none>$") {
            self.cursor += 8;
            return Ok(self.token(TokenKind::NoneArg, start));
        }
        if rest.len() >= 4
            && (&rest[1..4] == b"cnt" || &rest[1..4] == b"CNT")
            && !is_ident_char(rest.get(4).copied().unwrap_or(0))
        {
            self.cursor += 4;
            return Ok(self.token(TokenKind::LoopCounter, start));
        }
        if self.peek_raw_byte(1).is_ascii_hexdigit() {
            self.cursor += 1;
            return self.scan_digits(start, 16);
        }
        self.cursor += 1;
        Ok(self.token(TokenKind::Dollar, start))
    }

    fn scan_hash(&mut self, start: usize) -> Result<Token, TokenizeError> {
        let mut end = self.cursor + 1;
        while end < self.input.len() && self.input[end].is_ascii_alphabetic() {
            end += 1;
        }
        let word = String::from_utf8_lossy(&self.input[self.cursor + 1..end]).to_string();
        if let Some(kw) = keyword_form(&word).and_then(|w| DirectiveKeyword::from_name(&w)) {
            self.cursor = end;
            return Ok(self.token(TokenKind::Directive(kw), start));
        }
        if self.peek_raw_byte(1).is_ascii_hexdigit() {
            self.cursor += 1;
            return self.scan_digits(start, 16);
        }
        self.cursor += 1;
        Err(self.error("Unexpected character '#'", start))
    }

    /// Scan digits of a prefixed literal; the prefix is already consumed.
    fn scan_digits(&mut self, start: usize, base: u32) -> Result<Token, TokenizeError> {
        let digits_start = self.cursor;
        while self.current_byte().is_ascii_alphanumeric() || self.current_byte() == b'_' {
            self.cursor += 1;
        }
        let text = &self.input[digits_start..self.cursor];
        match parse_radix(text, base) {
            Some(value) => Ok(self.token(TokenKind::Integer(value), start)),
            None => Err(self.error("Invalid numeric literal", start)),
        }
    }

    fn scan_number(&mut self, start: usize) -> Result<Token, TokenizeError> {
        while self.current_byte().is_ascii_alphanumeric() || self.current_byte() == b'_' {
            self.cursor += 1;
        }
        let text = String::from_utf8_lossy(&self.input[start..self.cursor]).to_ascii_lowercase();
        let bytes = text.as_bytes();

        let all_decimal = bytes.iter().all(|c| c.is_ascii_digit());
        if all_decimal {
            if self.current_byte() == b'.' && self.peek_raw_byte(1).is_ascii_digit() {
                self.cursor += 1;
                while self.current_byte().is_ascii_digit() {
                    self.cursor += 1;
                }
                self.scan_exponent();
                return self.real_token(start);
            }
            return match text.parse::<i64>() {
                Ok(value) => Ok(self.token(TokenKind::Integer(value), start)),
                Err(_) => Err(self.error("Invalid numeric literal", start)),
            };
        }

        if let Some(hex) = text.strip_prefix("0x") {
            return self.radix_token(start, hex.as_bytes(), 16);
        }
        if let Some(bin) = text.strip_prefix("0b") {
            if !bin.is_empty() && bin.bytes().all(|c| matches!(c, b'0' | b'1' | b'_')) {
                return self.radix_token(start, bin.as_bytes(), 2);
            }
        }
        if let Some(hex) = text.strip_suffix('h') {
            return self.radix_token(start, hex.as_bytes(), 16);
        }
        if let Some(oct) = text.strip_suffix('q').or_else(|| text.strip_suffix('o')) {
            return self.radix_token(start, oct.as_bytes(), 8);
        }
        // `1e5` style reals without a fraction
        if let Some(pos) = text.find('e') {
            let (mantissa, exp) = text.split_at(pos);
            let exp = &exp[1..];
            if !mantissa.is_empty()
                && mantissa.bytes().all(|c| c.is_ascii_digit())
                && !exp.is_empty()
                && exp.bytes().all(|c| c.is_ascii_digit())
            {
                return self.real_token(start);
            }
            if exp.is_empty()
                && mantissa.bytes().all(|c| c.is_ascii_digit())
                && matches!(self.current_byte(), b'+' | b'-')
                && self.peek_raw_byte(1).is_ascii_digit()
            {
                self.cursor += 1;
                while self.current_byte().is_ascii_digit() {
                    self.cursor += 1;
                }
                return self.real_token(start);
            }
        }
        Err(self.error("Invalid numeric literal", start))
    }

    /// Consume `e[+-]digits` if present; returns whether one was consumed.
    fn scan_exponent(&mut self) -> bool {
        if !matches!(self.current_byte(), b'e' | b'E') {
            return false;
        }
        let mut pos = self.cursor + 1;
        if matches!(self.input.get(pos), Some(b'+') | Some(b'-')) {
            pos += 1;
        }
        if !self.input.get(pos).is_some_and(|c| c.is_ascii_digit()) {
            return false;
        }
        while self.input.get(pos).is_some_and(|c| c.is_ascii_digit()) {
            pos += 1;
        }
        self.cursor = pos;
        true
    }

    fn real_token(&self, start: usize) -> Result<Token, TokenizeError> {
        let text = String::from_utf8_lossy(&self.input[start..self.cursor]).to_string();
        match text.parse::<f64>() {
            Ok(value) => Ok(self.token(TokenKind::Real(value), start)),
            Err(_) => Err(self.error("Invalid real literal", start)),
        }
    }

    fn radix_token(&self, start: usize, digits: &[u8], base: u32) -> Result<Token, TokenizeError> {
        match parse_radix(digits, base) {
            Some(value) => Ok(self.token(TokenKind::Integer(value), start)),
            None => Err(self.error("Invalid numeric literal", start)),
        }
    }

    fn scan_string(&mut self, start: usize) -> Result<Token, TokenizeError> {
        let body = self.scan_quoted(start, b'"')?;
        Ok(self.token(TokenKind::String(body), start))
    }

    fn scan_char(&mut self, start: usize) -> Result<Token, TokenizeError> {
        let body = self.scan_quoted(start, b'\'')?;
        if body.is_empty() {
            return Err(self.error("Empty character literal", start));
        }
        Ok(self.token(TokenKind::Char(body), start))
    }

    /// Scan a quoted literal and return its body with escapes kept verbatim.
    fn scan_quoted(&mut self, start: usize, quote: u8) -> Result<String, TokenizeError> {
        self.cursor += 1;
        let body_start = self.cursor;
        loop {
            if self.cursor >= self.input.len() || matches!(self.current_byte(), b'\n' | b'\r') {
                return Err(self.error("Unterminated string", start));
            }
            match self.current_byte() {
                b'\\' => self.cursor += 2,
                c if c == quote => break,
                _ => self.cursor += 1,
            }
        }
        let body = String::from_utf8_lossy(&self.input[body_start..self.cursor]).to_string();
        self.cursor += 1;
        Ok(body)
    }

    fn skip_white_and_comments(&mut self) -> Result<(), TokenizeError> {
        loop {
            let c = self.current_byte();
            if is_space(c) {
                self.cursor += 1;
                continue;
            }
            if c == b';' || (c == b'/' && self.peek_raw_byte(1) == b'/') {
                let start = self.cursor;
                while !matches!(self.current_byte(), 0 | b'\n' | b'\r') {
                    self.cursor += 1;
                }
                self.last_comment =
                    Some(String::from_utf8_lossy(&self.input[start..self.cursor]).to_string());
                continue;
            }
            if c == b'/' && self.peek_raw_byte(1) == b'*' {
                let start = self.cursor;
                self.cursor += 2;
                loop {
                    if self.cursor >= self.input.len() {
                        return Err(self.error("Unterminated block comment", start));
                    }
                    if self.current_byte() == b'*' && self.peek_raw_byte(1) == b'/' {
                        self.cursor += 2;
                        break;
                    }
                    if self.current_byte() == b'\n' {
                        self.line += 1;
                        self.line_start = self.cursor + 1;
                    }
                    self.cursor += 1;
                }
                self.last_comment =
                    Some(String::from_utf8_lossy(&self.input[start..self.cursor]).to_string());
                continue;
            }
            return Ok(());
        }
    }

    fn skip_to_line_end(&mut self) {
        while !matches!(self.current_byte(), 0 | b'\n' | b'\r') {
            self.cursor += 1;
        }
    }

    fn current_byte(&self) -> u8 {
        self.input.get(self.cursor).copied().unwrap_or(0)
    }

    fn peek_raw_byte(&self, offset: usize) -> u8 {
        self.input.get(self.cursor + offset).copied().unwrap_or(0)
    }

    /// Check if `%` at `start` begins a binary literal rather than the
    /// modulo operator: at line start, after an operator or punctuation, or
    /// after a word followed by whitespace (`.defb %1010`).
    fn is_prefix_context(&self, start: usize) -> bool {
        let has_leading_space = start > 0 && is_space(self.input[start - 1]);
        match self.prev_non_space(start) {
            None | Some(b'\n') | Some(b'\r') => true,
            Some(
                b'(' | b',' | b'+' | b'-' | b'*' | b'/' | b'%' | b'&' | b'|' | b'^' | b'~' | b'!'
                | b'<' | b'>' | b'=' | b'?' | b':' | b'[',
            ) => true,
            Some(ch) if has_leading_space && is_ident_char(ch) => {
                self.previous_word_is_keyword(start)
            }
            _ => false,
        }
    }

    /// True when the word before `start` is a reserved word, so `%` after it
    /// cannot be a binary operator.
    fn previous_word_is_keyword(&self, start: usize) -> bool {
        let mut end = start;
        while end > 0 && is_space(self.input[end - 1]) {
            end -= 1;
        }
        let mut begin = end;
        while begin > 0 && (is_ident_char(self.input[begin - 1]) || self.input[begin - 1] == b'`')
        {
            begin -= 1;
        }
        let word = String::from_utf8_lossy(&self.input[begin..end]).to_string();
        matches!(
            keyword_form(&word).and_then(|w| resolve_word(&w)),
            Some(TokenKind::Mnemonic(_) | TokenKind::Pragma(_) | TokenKind::Statement(_))
        )
    }

    fn prev_non_space(&self, start: usize) -> Option<u8> {
        (0..start)
            .rev()
            .map(|i| self.input[i])
            .find(|&c| !is_space(c))
    }
}

fn parse_radix(digits: &[u8], base: u32) -> Option<i64> {
    let mut value: i64 = 0;
    let mut seen = false;
    for &c in digits {
        if c == b'_' {
            continue;
        }
        let digit = (c as char).to_digit(base)?;
        value = value.checked_mul(base as i64)?.checked_add(digit as i64)?;
        seen = true;
    }
    seen.then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, _, errors) = Tokenizer::new(source).tokenize();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizes_instruction_line() {
        assert_eq!(
            kinds("ld a,(ix+3)"),
            vec![
                TokenKind::Mnemonic(Mnemonic::Ld),
                TokenKind::Register(Register::A),
                TokenKind::Comma,
                TokenKind::OpenParen,
                TokenKind::Register(Register::Ix),
                TokenKind::Operator(OperatorKind::Plus),
                TokenKind::Integer(3),
                TokenKind::CloseParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn tokenizes_numeric_literal_forms() {
        let expected = |v: i64| vec![TokenKind::Integer(v), TokenKind::Eof];
        assert_eq!(kinds("#FF"), expected(255));
        assert_eq!(kinds("$1f"), expected(31));
        assert_eq!(kinds("0x1F"), expected(31));
        assert_eq!(kinds("0FFh"), expected(255));
        assert_eq!(kinds("%1010"), expected(10));
        assert_eq!(kinds("0b1_010"), expected(10));
        assert_eq!(kinds("17q"), expected(15));
        assert_eq!(kinds("1234"), expected(1234));
    }

    #[test]
    fn tokenizes_reals() {
        assert_eq!(kinds("3.14"), vec![TokenKind::Real(3.14), TokenKind::Eof]);
        assert_eq!(kinds("3.14e+2"), vec![TokenKind::Real(314.0), TokenKind::Eof]);
        assert_eq!(kinds("2e8"), vec![TokenKind::Real(2e8), TokenKind::Eof]);
        assert_eq!(kinds("3e-8"), vec![TokenKind::Real(3e-8), TokenKind::Eof]);
    }

    #[test]
    fn distinguishes_modulo_from_binary_literal() {
        assert_eq!(
            kinds("5 % 3"),
            vec![
                TokenKind::Integer(5),
                TokenKind::Operator(OperatorKind::Mod),
                TokenKind::Integer(3),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds(".defb %11"),
            vec![
                TokenKind::Pragma(PragmaKeyword::DefB),
                TokenKind::Integer(3),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn resolves_dotted_keywords_and_exports() {
        assert_eq!(
            kinds(".org .endm .MyLabel .cnt"),
            vec![
                TokenKind::Pragma(PragmaKeyword::Org),
                TokenKind::Statement(StatementKeyword::EndMacro),
                TokenKind::Identifier(".MyLabel".to_string()),
                TokenKind::LoopCounter,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn reserves_only_single_case_spellings() {
        assert_eq!(
            kinds("HALT halt Halt"),
            vec![
                TokenKind::Mnemonic(Mnemonic::Halt),
                TokenKind::Mnemonic(Mnemonic::Halt),
                TokenKind::Identifier("Halt".to_string()),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("LD A,Hl"),
            vec![
                TokenKind::Mnemonic(Mnemonic::Ld),
                TokenKind::Register(Register::A),
                TokenKind::Comma,
                TokenKind::Identifier("Hl".to_string()),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds(".ORG .Org .extern EXTERN"),
            vec![
                TokenKind::Pragma(PragmaKeyword::Org),
                TokenKind::Identifier(".Org".to_string()),
                TokenKind::Pragma(PragmaKeyword::Extern),
                TokenKind::Pragma(PragmaKeyword::Extern),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("$CNT #IFDEF"),
            vec![
                TokenKind::LoopCounter,
                TokenKind::Directive(DirectiveKeyword::IfDef),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn tokenizes_directives_against_hex() {
        assert_eq!(
            kinds("#ifdef #DE"),
            vec![
                TokenKind::Directive(DirectiveKeyword::IfDef),
                TokenKind::Integer(0xDE),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn tokenizes_special_dollar_forms() {
        assert_eq!(
            kinds("$ $cnt $<none>$"),
            vec![
                TokenKind::Dollar,
                TokenKind::LoopCounter,
                TokenKind::NoneArg,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn tokenizes_multi_char_operators() {
        assert_eq!(
            kinds("=== !== <? >? := :: -> {{ }}"),
            vec![
                TokenKind::Operator(OperatorKind::CaseEq),
                TokenKind::Operator(OperatorKind::CaseNe),
                TokenKind::Operator(OperatorKind::Min),
                TokenKind::Operator(OperatorKind::Max),
                TokenKind::ColonAssign,
                TokenKind::DoubleColon,
                TokenKind::Arrow,
                TokenKind::OpenMacroParam,
                TokenKind::CloseMacroParam,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keeps_string_escapes_verbatim() {
        assert_eq!(
            kinds(r#""a\"b" 'c'"#),
            vec![
                TokenKind::String("a\\\"b".to_string()),
                TokenKind::Char("c".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn captures_defg_tail_and_comments() {
        let (tokens, comments, _) = Tokenizer::new(".defg ..XX ; pattern\nnop").tokenize();
        assert_eq!(
            tokens[1].kind,
            TokenKind::RawText("..XX ; pattern".to_string())
        );
        assert_eq!(tokens[2].kind, TokenKind::NewLine);
        assert_eq!(tokens[3].span.line, 2);
        assert!(comments.iter().all(Option::is_none));

        let (_, comments, _) = Tokenizer::new("nop ; hello\n").tokenize();
        assert_eq!(comments[1].as_deref(), Some("; hello"));
    }

    #[test]
    fn tracks_lines_and_columns() {
        let (tokens, _, _) = Tokenizer::new("nop\n  halt").tokenize();
        let halt = &tokens[2];
        assert_eq!(halt.span.line, 2);
        assert_eq!(halt.span.col_start, 2);
        assert_eq!(halt.span.start, 6);
    }

    #[test]
    fn af_prime_is_one_register() {
        assert_eq!(
            kinds("ex af,af'"),
            vec![
                TokenKind::Mnemonic(Mnemonic::Ex),
                TokenKind::Register(Register::Af),
                TokenKind::Comma,
                TokenKind::Register(Register::AfAlt),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn eof_is_stable() {
        let mut tok = Tokenizer::new("");
        assert_eq!(tok.next_token().map(|t| t.kind).ok(), Some(TokenKind::Eof));
        assert_eq!(tok.next_token().map(|t| t.kind).ok(), Some(TokenKind::Eof));
    }
}
