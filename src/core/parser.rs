// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Parser for tokenized Z80 assembly source.
//!
//! [`parse_program`] turns a complete source text into [`AssemblyLine`]s.
//! Parsing is line oriented: when a line fails to parse, the error is
//! recorded, the rest of the line is skipped and parsing resumes with the
//! next line.

use std::collections::HashSet;

use crate::core::assembler::error::ErrorCode;
use crate::core::ast::{
    AssemblyLine, BinaryOp, Directive, Expr, Instruction, Label, LineKind, MacroArg, Operand,
    Pragma, Statement, UnaryOp,
};
use crate::core::functions::is_macro_time_function;
use crate::core::tokenizer::{
    keyword_form, DirectiveKeyword, OperatorKind, PragmaKeyword, Span, StatementKeyword, Token,
    TokenKind, Tokenizer,
};
use crate::z80::{Condition, Mnemonic, Register};

#[derive(Debug, Clone)]
pub struct ParseError {
    pub code: ErrorCode,
    pub params: Vec<String>,
    pub span: Span,
}

impl ParseError {
    fn new(code: ErrorCode, span: Span) -> Self {
        Self {
            code,
            params: Vec::new(),
            span,
        }
    }

    fn with_param(code: ErrorCode, param: impl Into<String>, span: Span) -> Self {
        Self {
            code,
            params: vec![param.into()],
            span,
        }
    }

    pub fn message(&self) -> String {
        self.code.message(&self.params)
    }
}

/// Binary operator levels, from the loosest binding to the tightest.
const BINARY_LEVELS: &[&[(OperatorKind, BinaryOp)]] = &[
    &[(OperatorKind::BitOr, BinaryOp::BitOr)],
    &[(OperatorKind::BitXor, BinaryOp::BitXor)],
    &[(OperatorKind::BitAnd, BinaryOp::BitAnd)],
    &[
        (OperatorKind::Eq, BinaryOp::Eq),
        (OperatorKind::CaseEq, BinaryOp::CaseEq),
        (OperatorKind::Ne, BinaryOp::Ne),
        (OperatorKind::CaseNe, BinaryOp::CaseNe),
    ],
    &[
        (OperatorKind::Lt, BinaryOp::Lt),
        (OperatorKind::Le, BinaryOp::Le),
        (OperatorKind::Gt, BinaryOp::Gt),
        (OperatorKind::Ge, BinaryOp::Ge),
    ],
    &[
        (OperatorKind::Shl, BinaryOp::Shl),
        (OperatorKind::Shr, BinaryOp::Shr),
    ],
    &[
        (OperatorKind::Plus, BinaryOp::Add),
        (OperatorKind::Minus, BinaryOp::Subtract),
    ],
    &[
        (OperatorKind::Multiply, BinaryOp::Multiply),
        (OperatorKind::Divide, BinaryOp::Divide),
        (OperatorKind::Mod, BinaryOp::Mod),
    ],
    &[
        (OperatorKind::Min, BinaryOp::Min),
        (OperatorKind::Max, BinaryOp::Max),
    ],
];

/// Parse a whole source file.
///
/// `macro_emit_phase` is set when the text is a macro body with its
/// arguments already substituted; macro-time functions then accept any
/// operand instead of a `{{param}}` reference only.
pub fn parse_program(
    source: &str,
    file_index: usize,
    macro_emit_phase: bool,
) -> (Vec<AssemblyLine>, Vec<ParseError>) {
    let (tokens, comments, lex_errors) = Tokenizer::new(source).tokenize();
    let mut errors = Vec::new();
    let mut bad_lines = HashSet::new();
    for err in lex_errors {
        bad_lines.insert(err.span.line);
        errors.push(ParseError::with_param(ErrorCode::Z1118, err.message, err.span));
    }

    let mut parser = Parser {
        source,
        tokens,
        comments,
        index: 0,
        file_index,
        macro_emit_phase,
        macro_params: Vec::new(),
    };
    let mut lines = Vec::new();
    loop {
        let at_eof = parser.peek().kind == TokenKind::Eof;
        if bad_lines.contains(&parser.current_span().line) && !at_eof {
            parser.skip_line();
            continue;
        }
        match parser.parse_line() {
            Ok(Some(line)) => lines.push(line),
            Ok(None) => {}
            Err(err) => {
                errors.push(err);
                parser.skip_line();
            }
        }
        if at_eof {
            break;
        }
    }
    (lines, errors)
}

/// Resolve the ZX Spectrum escape sequences of a string or character
/// literal body. Every resulting `char` carries a single byte value.
pub fn convert_escaped_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(esc) = chars.next() else {
            out.push('\\');
            break;
        };
        let code: u32 = match esc {
            'i' => 0x10,
            'p' => 0x11,
            'f' => 0x12,
            'b' => 0x13,
            'I' => 0x14,
            'o' => 0x15,
            'a' => 0x16,
            't' => 0x17,
            'P' => 0x60,
            'C' => 0x7F,
            '0' => 0x00,
            'x' => {
                let mut value = None;
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(16)) {
                        Some(digit) => {
                            chars.next();
                            value = Some(value.unwrap_or(0) * 16 + digit);
                        }
                        None => break,
                    }
                }
                match value {
                    Some(value) => value,
                    None => {
                        out.push('x');
                        continue;
                    }
                }
            }
            other => {
                out.push(other);
                continue;
            }
        };
        out.push(char::from(code as u8));
    }
    out
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    comments: Vec<Option<String>>,
    index: usize,
    file_index: usize,
    macro_emit_phase: bool,
    macro_params: Vec<String>,
}

impl<'a> Parser<'a> {
    fn parse_line(&mut self) -> Result<Option<AssemblyLine>, ParseError> {
        self.macro_params.clear();
        let first = self.peek().clone();
        if first.is_line_end() {
            let comment = self.take_comment();
            self.advance_line_end();
            let Some(comment) = comment else {
                return Ok(None);
            };
            let line_start = Span {
                start: first.span.start - first.span.col_start,
                col_start: 0,
                ..first.span
            };
            return Ok(Some(self.make_line(
                line_start,
                first.span,
                None,
                Some(comment),
                LineKind::CommentOnly,
            )));
        }

        let mut label = None;
        if let TokenKind::Identifier(name) = &first.kind {
            if self.peek_at(1).kind != TokenKind::OpenParen {
                label = Some(Label {
                    name: name.clone(),
                    span: first.span,
                });
                self.index += 1;
                self.consume_kind(&TokenKind::Colon);
            }
        }

        let kind = if self.peek().is_line_end() {
            LineKind::LabelOnly
        } else {
            self.parse_line_body()?
        };

        let end = self.peek().clone();
        if !end.is_line_end() {
            return Err(ParseError::new(ErrorCode::Z1117, end.span));
        }
        let comment = self.take_comment();
        self.advance_line_end();
        Ok(Some(self.make_line(first.span, end.span, label, comment, kind)))
    }

    fn parse_line_body(&mut self) -> Result<LineKind, ParseError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Pragma(kw) => {
                self.index += 1;
                Ok(LineKind::Pragma(self.parse_pragma(kw)?))
            }
            TokenKind::Assign | TokenKind::ColonAssign => {
                self.index += 1;
                Ok(LineKind::Pragma(Pragma::Var(self.parse_expr()?)))
            }
            TokenKind::Mnemonic(mnemonic) => {
                Ok(LineKind::Instruction(self.parse_instruction(mnemonic)?))
            }
            TokenKind::OpenMacroParam => Ok(LineKind::MacroParam(self.parse_macro_param_ref()?)),
            TokenKind::Statement(kw) => {
                self.index += 1;
                Ok(LineKind::Statement(self.parse_statement(kw, token.span)?))
            }
            TokenKind::Identifier(name) => self.parse_invocation(name),
            TokenKind::Arrow => {
                self.index += 1;
                let pragma_token = self.peek().clone();
                let TokenKind::Pragma(kw) = pragma_token.kind else {
                    return Err(ParseError::new(ErrorCode::Z1119, pragma_token.span));
                };
                self.index += 1;
                let pragma = self.parse_pragma(kw)?;
                if !pragma.is_byte_emitting() {
                    return Err(ParseError::new(ErrorCode::Z1119, pragma_token.span));
                }
                Ok(LineKind::FieldAssignment(pragma))
            }
            TokenKind::Directive(kw) => {
                self.index += 1;
                Ok(LineKind::Directive(self.parse_directive(kw)?))
            }
            _ => Err(ParseError::with_param(
                ErrorCode::Z1101,
                self.token_text(token.span),
                token.span,
            )),
        }
    }

    fn parse_pragma(&mut self, kw: PragmaKeyword) -> Result<Pragma, ParseError> {
        use PragmaKeyword as K;
        let pragma = match kw {
            K::Org => Pragma::Org(self.parse_expr()?),
            K::Bank => {
                let bank = self.parse_expr()?;
                let offset = self.parse_optional_comma_expr()?;
                Pragma::Bank { bank, offset }
            }
            K::Xorg => Pragma::Xorg(self.parse_expr()?),
            K::Ent => Pragma::Ent(self.parse_expr()?),
            K::Xent => Pragma::Xent(self.parse_expr()?),
            K::Equ => Pragma::Equ(self.parse_expr()?),
            K::Var => Pragma::Var(self.parse_expr()?),
            K::Disp => Pragma::Disp(self.parse_expr()?),
            K::DefB => Pragma::DefB(self.parse_expr_list()?),
            K::DefW => Pragma::DefW(self.parse_expr_list()?),
            K::DefM => Pragma::DefM(self.parse_expr()?),
            K::DefN => Pragma::DefN(self.parse_expr()?),
            K::DefC => Pragma::DefC(self.parse_expr()?),
            K::DefH => Pragma::DefH(self.parse_expr()?),
            K::DefS => {
                let count = self.parse_expr()?;
                let fill = self.parse_optional_comma_expr()?;
                Pragma::DefS { count, fill }
            }
            K::FillB | K::FillW => {
                let count = self.parse_expr()?;
                self.expect(&TokenKind::Comma, ErrorCode::Z1102)?;
                let fill = self.parse_expr()?;
                if kw == K::FillB {
                    Pragma::FillB { count, fill }
                } else {
                    Pragma::FillW { count, fill }
                }
            }
            K::Skip => {
                let target = self.parse_expr()?;
                let fill = self.parse_optional_comma_expr()?;
                Pragma::Skip { target, fill }
            }
            K::Align => Pragma::Align(self.parse_optional_expr()?),
            K::Trace | K::TraceHex => Pragma::Trace {
                hex: kw == K::TraceHex,
                values: self.parse_expr_list()?,
            },
            K::RndSeed => Pragma::RndSeed(self.parse_optional_expr()?),
            K::DefG => match self.peek().kind.clone() {
                TokenKind::RawText(text) => {
                    self.index += 1;
                    Pragma::DefG(text)
                }
                _ => Pragma::DefG(String::new()),
            },
            K::DefGx => Pragma::DefGx(self.parse_expr()?),
            K::Error => Pragma::Error(self.parse_expr()?),
            K::IncludeBin | K::CompareBin => {
                let file = self.parse_expr()?;
                let offset = self.parse_optional_comma_expr()?;
                let length = if offset.is_some() {
                    self.parse_optional_comma_expr()?
                } else {
                    None
                };
                if kw == K::IncludeBin {
                    Pragma::IncludeBin {
                        file,
                        offset,
                        length,
                    }
                } else {
                    Pragma::CompareBin {
                        file,
                        offset,
                        length,
                    }
                }
            }
            K::InjectOpt => Pragma::InjectOpt(self.parse_name_list()?),
            K::Model => {
                let token = self.peek().clone();
                match token.kind {
                    TokenKind::Identifier(_) | TokenKind::Statement(StatementKeyword::Next) => {
                        self.index += 1;
                        Pragma::Model(self.token_text(token.span))
                    }
                    _ => return Err(ParseError::new(ErrorCode::Z1121, token.span)),
                }
            }
            K::OnSuccess => Pragma::OnSuccess(self.expect_raw_string()?),
            K::Extern => Pragma::Extern,
        };
        Ok(pragma)
    }

    fn parse_statement(
        &mut self,
        kw: StatementKeyword,
        keyword_span: Span,
    ) -> Result<Statement, ParseError> {
        use StatementKeyword as K;
        let stmt = match kw {
            K::Macro => {
                self.expect(&TokenKind::OpenParen, ErrorCode::Z1116)?;
                let mut params = Vec::new();
                if !self.consume_kind(&TokenKind::CloseParen) {
                    loop {
                        params.push(self.expect_word()?);
                        if self.consume_kind(&TokenKind::Comma) {
                            continue;
                        }
                        self.expect(&TokenKind::CloseParen, ErrorCode::Z1105)?;
                        break;
                    }
                }
                Statement::Macro(params)
            }
            K::EndMacro => Statement::EndMacro,
            K::Loop => Statement::Loop(self.parse_expr()?),
            K::EndLoop => Statement::EndLoop,
            K::While => Statement::While(self.parse_expr()?),
            K::EndWhile => Statement::EndWhile,
            K::Repeat => Statement::Repeat,
            K::Until => Statement::Until(self.parse_expr()?),
            K::Proc => Statement::Proc,
            K::EndProc => Statement::EndProc,
            K::If => Statement::If(self.parse_expr()?),
            K::IfUsed => Statement::IfUsed(self.parse_symbol_ref()?),
            K::IfNotUsed => Statement::IfNotUsed(self.parse_symbol_ref()?),
            K::Elif => Statement::Elif(self.parse_expr()?),
            K::Else => Statement::Else,
            K::EndIf => Statement::EndIf,
            K::Break => Statement::Break,
            K::Continue => Statement::Continue,
            K::Module => match self.peek().kind.clone() {
                TokenKind::Identifier(name) => {
                    self.index += 1;
                    Statement::Module(Some(name))
                }
                _ => Statement::Module(None),
            },
            K::EndModule => Statement::EndModule,
            K::Struct => Statement::Struct,
            K::EndStruct => Statement::EndStruct,
            K::Local => Statement::Local(self.parse_name_list()?),
            K::For => self.parse_for()?,
            K::Next => Statement::Next,
            K::To | K::Step => {
                return Err(ParseError::with_param(
                    ErrorCode::Z1101,
                    self.token_text(keyword_span),
                    keyword_span,
                ))
            }
        };
        Ok(stmt)
    }

    fn parse_for(&mut self) -> Result<Statement, ParseError> {
        let var = self.expect_word()?;
        self.expect(&TokenKind::Assign, ErrorCode::Z1111)?;
        let from = self.parse_expr()?;
        if !self.consume_loop_keyword(StatementKeyword::To, "to") {
            return Err(ParseError::new(ErrorCode::Z1112, self.current_span()));
        }
        let to = self.parse_expr()?;
        let step = if self.consume_loop_keyword(StatementKeyword::Step, "step") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Statement::For {
            var,
            from,
            to,
            step,
        })
    }

    /// Accept `.to`/`.step` as well as the bare `to`/`step` words.
    fn consume_loop_keyword(&mut self, kw: StatementKeyword, bare: &str) -> bool {
        let matched = match &self.peek().kind {
            TokenKind::Statement(found) => *found == kw,
            TokenKind::Identifier(name) => name.eq_ignore_ascii_case(bare),
            _ => false,
        };
        if matched {
            self.index += 1;
        }
        matched
    }

    fn parse_directive(&mut self, kw: DirectiveKeyword) -> Result<Directive, ParseError> {
        use DirectiveKeyword as K;
        let directive = match kw {
            K::Include => Directive::Include(self.expect_raw_string()?),
            K::Define => Directive::Define(self.expect_word()?),
            K::Undef => Directive::Undef(self.expect_word()?),
            K::IfDef => Directive::IfDef(self.expect_word()?),
            K::IfNDef => Directive::IfNDef(self.expect_word()?),
            K::IfMod => Directive::IfMod(self.expect_word()?),
            K::IfNMod => Directive::IfNMod(self.expect_word()?),
            K::If => Directive::If(self.parse_expr()?),
            K::Else => Directive::Else,
            K::EndIf => Directive::EndIf,
            K::Line => {
                let line = self.parse_expr()?;
                self.consume_kind(&TokenKind::Comma);
                let file = match self.peek().kind.clone() {
                    TokenKind::String(raw) => {
                        self.index += 1;
                        Some(raw)
                    }
                    _ => None,
                };
                Directive::Line { line, file }
            }
        };
        Ok(directive)
    }

    fn parse_instruction(&mut self, mnemonic: Mnemonic) -> Result<Instruction, ParseError> {
        let start = self.next().span;
        let mut operands = Vec::new();
        if !self.peek().is_line_end() {
            operands.push(self.parse_operand()?);
            while self.consume_kind(&TokenKind::Comma) {
                if self.peek().is_line_end() || self.peek().kind == TokenKind::Comma {
                    return Err(ParseError::new(ErrorCode::Z1104, self.current_span()));
                }
                operands.push(self.parse_operand()?);
            }
        }
        Ok(Instruction {
            mnemonic,
            operands,
            span: start.to(self.prev_span()),
        })
    }

    fn parse_invocation(&mut self, name: String) -> Result<LineKind, ParseError> {
        self.index += 1;
        self.expect(&TokenKind::OpenParen, ErrorCode::Z1116)?;
        let mut args = Vec::new();
        if !self.consume_kind(&TokenKind::CloseParen) {
            loop {
                let start = self.peek().span;
                let start_index = self.index;
                let operand = if matches!(
                    self.peek().kind,
                    TokenKind::Comma | TokenKind::CloseParen
                ) {
                    Operand::None(start)
                } else {
                    self.parse_operand()?
                };
                let text = if self.index > start_index {
                    self.source[start.start..self.prev_span().end].to_string()
                } else {
                    String::new()
                };
                args.push(MacroArg { operand, text });
                if self.consume_kind(&TokenKind::Comma) {
                    continue;
                }
                self.expect(&TokenKind::CloseParen, ErrorCode::Z1105)?;
                break;
            }
        }
        Ok(LineKind::MacroOrStructInvocation { name, args })
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::NoneArg => {
                self.index += 1;
                Ok(Operand::None(token.span))
            }
            TokenKind::Register(reg) => {
                self.index += 1;
                Ok(Operand::Reg(*reg, token.span))
            }
            TokenKind::OpenParen => self.parse_paren_operand(),
            TokenKind::Identifier(name) => {
                let lower = name.to_ascii_lowercase();
                let next_kind = &self.peek_at(1).kind;
                if (lower == "hreg" || lower == "lreg") && *next_kind == TokenKind::OpenParen {
                    return self.parse_register_half(lower == "hreg");
                }
                if let Some(cond) = keyword_form(name).and_then(|w| Condition::from_name(&w)) {
                    if matches!(
                        next_kind,
                        TokenKind::Comma | TokenKind::CloseParen | TokenKind::NewLine | TokenKind::Eof
                    ) {
                        self.index += 1;
                        return Ok(Operand::Condition(cond, token.span));
                    }
                }
                Ok(Operand::Expr(self.parse_expr()?))
            }
            _ => Ok(Operand::Expr(self.parse_expr()?)),
        }
    }

    fn parse_paren_operand(&mut self) -> Result<Operand, ParseError> {
        let open = self.peek().span;
        let restart = self.index;
        self.index += 1;
        if let TokenKind::Register(reg) = self.peek().kind {
            let reg_span = self.next().span;
            match reg {
                Register::C => {
                    self.expect(&TokenKind::CloseParen, ErrorCode::Z1105)?;
                    return Ok(Operand::CPort(open.to(self.prev_span())));
                }
                Register::Bc | Register::De | Register::Hl | Register::Sp => {
                    self.expect(&TokenKind::CloseParen, ErrorCode::Z1105)?;
                    return Ok(Operand::RegIndirect(reg, open.to(self.prev_span())));
                }
                Register::Ix | Register::Iy => {
                    if self.consume_kind(&TokenKind::CloseParen) {
                        return Ok(Operand::Indexed {
                            reg,
                            minus: false,
                            disp: None,
                            span: open.to(self.prev_span()),
                        });
                    }
                    let minus = match self.peek_operator_kind() {
                        Some(OperatorKind::Plus) => false,
                        Some(OperatorKind::Minus) => true,
                        _ => return Err(ParseError::new(ErrorCode::Z1113, self.current_span())),
                    };
                    self.index += 1;
                    let disp = self.parse_expr()?;
                    self.expect(&TokenKind::CloseParen, ErrorCode::Z1105)?;
                    return Ok(Operand::Indexed {
                        reg,
                        minus,
                        disp: Some(disp),
                        span: open.to(self.prev_span()),
                    });
                }
                _ => {
                    return Err(ParseError::with_param(
                        ErrorCode::Z1101,
                        self.token_text(reg_span),
                        reg_span,
                    ))
                }
            }
        }

        // `(expr)` is a memory operand only when the parenthesis closes the
        // operand; otherwise it is the start of a longer expression.
        let inner = self.parse_expr()?;
        if self.consume_kind(&TokenKind::CloseParen) && self.at_operand_end() {
            return Ok(Operand::MemIndirect(inner, open.to(self.prev_span())));
        }
        self.index = restart;
        Ok(Operand::Expr(self.parse_expr()?))
    }

    fn parse_register_half(&mut self, high: bool) -> Result<Operand, ParseError> {
        let start = self.next().span;
        self.expect(&TokenKind::OpenParen, ErrorCode::Z1116)?;
        let token = self.peek().clone();
        let reg = match token.kind {
            TokenKind::Register(reg) => {
                self.index += 1;
                let half = if high {
                    reg.high_half()
                } else {
                    reg.low_half()
                };
                Some(half.ok_or_else(|| ParseError::new(ErrorCode::Z1114, token.span))?)
            }
            TokenKind::OpenMacroParam => {
                self.parse_macro_param_ref()?;
                None
            }
            _ => return Err(ParseError::new(ErrorCode::Z1114, token.span)),
        };
        self.expect(&TokenKind::CloseParen, ErrorCode::Z1105)?;
        let span = start.to(self.prev_span());
        Ok(match reg {
            Some(reg) => Operand::Reg(reg, span),
            None => Operand::None(span),
        })
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_binary(0)?;
        if !self.consume_kind(&TokenKind::Question) {
            return Ok(cond);
        }
        let then_expr = self.parse_expr()?;
        self.expect(&TokenKind::Colon, ErrorCode::Z1110)?;
        let else_expr = self.parse_expr()?;
        let span = cond.span().to(else_expr.span());
        Ok(Expr::Ternary {
            cond: Box::new(cond),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
            span,
        })
    }

    fn parse_binary(&mut self, level: usize) -> Result<Expr, ParseError> {
        let Some(ops) = BINARY_LEVELS.get(level) else {
            return self.parse_unary();
        };
        let mut node = self.parse_binary(level + 1)?;
        loop {
            let Some(op) = self.peek_operator_kind().and_then(|kind| {
                ops.iter()
                    .find(|(candidate, _)| *candidate == kind)
                    .map(|(_, op)| *op)
            }) else {
                break;
            };
            self.index += 1;
            let right = self.parse_binary(level + 1)?;
            let span = node.span().to(right.span());
            node = Expr::Binary {
                op,
                left: Box::new(node),
                right: Box::new(right),
                span,
            };
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek_operator_kind() {
            Some(OperatorKind::Plus) => UnaryOp::Plus,
            Some(OperatorKind::Minus) => UnaryOp::Minus,
            Some(OperatorKind::BitNot) => UnaryOp::BitNot,
            Some(OperatorKind::LogicNot) => UnaryOp::LogicNot,
            _ => return self.parse_primary(),
        };
        let start = self.next().span;
        let expr = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            span: start.to(expr.span()),
            expr: Box::new(expr),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.peek().clone();
        let span = token.span;
        let expr = match token.kind {
            TokenKind::Operator(OperatorKind::Multiply) | TokenKind::Dollar | TokenKind::Dot => {
                Expr::CurrentAddress(span)
            }
            TokenKind::LoopCounter => Expr::LoopCounter(span),
            TokenKind::Integer(value) => Expr::Integer(value, span),
            TokenKind::Real(value) => Expr::Real(value, span),
            TokenKind::True => Expr::Bool(true, span),
            TokenKind::False => Expr::Bool(false, span),
            TokenKind::Char(raw) => {
                let code = convert_escaped_string(&raw)
                    .chars()
                    .next()
                    .map_or(0, |c| c as i64);
                Expr::Integer(code, span)
            }
            TokenKind::String(raw) => Expr::Str(convert_escaped_string(&raw), span),
            TokenKind::OpenParen | TokenKind::OpenBracket => {
                let (close, code) = if token.kind == TokenKind::OpenParen {
                    (TokenKind::CloseParen, ErrorCode::Z1105)
                } else {
                    (TokenKind::CloseBracket, ErrorCode::Z1106)
                };
                self.index += 1;
                let inner = self.parse_expr()?;
                self.expect(&close, code)?;
                return Ok(inner);
            }
            TokenKind::Identifier(name) => {
                self.index += 1;
                if self.peek().kind == TokenKind::OpenParen {
                    return self.parse_call(name, span);
                }
                return Ok(Expr::Symbol {
                    name,
                    from_global: false,
                    span,
                });
            }
            TokenKind::DoubleColon => {
                self.index += 1;
                let name_token = self.peek().clone();
                let TokenKind::Identifier(name) = name_token.kind else {
                    return Err(ParseError::new(ErrorCode::Z1107, name_token.span));
                };
                self.index += 1;
                return Ok(Expr::Symbol {
                    name,
                    from_global: true,
                    span: span.to(name_token.span),
                });
            }
            TokenKind::OpenMacroParam => {
                let name = self.parse_macro_param_ref()?;
                return Ok(Expr::MacroParam(name, span.to(self.prev_span())));
            }
            _ => return Err(ParseError::new(ErrorCode::Z1103, span)),
        };
        self.index += 1;
        Ok(expr)
    }

    fn parse_call(&mut self, name: String, name_span: Span) -> Result<Expr, ParseError> {
        let lower = name.to_ascii_lowercase();
        if lower == "textof" || lower == "ltextof" {
            return self.parse_text_of(lower == "ltextof", name_span);
        }
        if is_macro_time_function(&lower) {
            return self.parse_macro_time_call(lower, name_span);
        }
        self.index += 1;
        let mut args = Vec::new();
        if !self.consume_kind(&TokenKind::CloseParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.consume_kind(&TokenKind::Comma) {
                    continue;
                }
                self.expect(&TokenKind::CloseParen, ErrorCode::Z1105)?;
                break;
            }
        }
        Ok(Expr::Call {
            name: lower,
            args,
            span: name_span.to(self.prev_span()),
        })
    }

    fn parse_macro_time_call(&mut self, name: String, name_span: Span) -> Result<Expr, ParseError> {
        self.index += 1;
        let arg_span = self.current_span();
        let operand = if self.peek().kind == TokenKind::CloseParen {
            Operand::None(arg_span)
        } else {
            self.parse_operand()?
        };
        self.expect(&TokenKind::CloseParen, ErrorCode::Z1105)?;
        if !self.macro_emit_phase
            && !matches!(
                operand,
                Operand::None(_) | Operand::Expr(Expr::MacroParam(..))
            )
        {
            return Err(ParseError::new(ErrorCode::Z1009, arg_span));
        }
        Ok(Expr::MacroTimeCall {
            name,
            operand: Box::new(operand),
            span: name_span.to(self.prev_span()),
        })
    }

    fn parse_text_of(&mut self, lower_case: bool, name_span: Span) -> Result<Expr, ParseError> {
        self.index += 1;
        let token = self.peek().clone();
        let text = match &token.kind {
            TokenKind::Mnemonic(mnemonic) => {
                self.index += 1;
                mnemonic.name().to_string()
            }
            TokenKind::Register(reg) => {
                self.index += 1;
                reg.name().to_string()
            }
            TokenKind::Identifier(name)
                if keyword_form(name).and_then(|w| Condition::from_name(&w)).is_some() =>
            {
                self.index += 1;
                name.to_ascii_lowercase()
            }
            TokenKind::OpenParen => {
                let inner = self.peek_at(1).kind.clone();
                match inner {
                    TokenKind::Register(reg)
                        if reg.is_reg16() && self.peek_at(2).kind == TokenKind::CloseParen =>
                    {
                        self.index += 3;
                        format!("({})", reg.name())
                    }
                    _ => return Err(ParseError::new(ErrorCode::Z1120, token.span)),
                }
            }
            TokenKind::OpenMacroParam if !self.macro_emit_phase => {
                let name = self.parse_macro_param_ref()?;
                self.expect(&TokenKind::CloseParen, ErrorCode::Z1105)?;
                return Ok(Expr::MacroParam(name, name_span.to(self.prev_span())));
            }
            _ => return Err(ParseError::new(ErrorCode::Z1120, token.span)),
        };
        self.expect(&TokenKind::CloseParen, ErrorCode::Z1105)?;
        let span = name_span.to(self.prev_span());
        let text = if lower_case {
            text.to_ascii_lowercase()
        } else {
            text.to_ascii_uppercase()
        };
        Ok(Expr::Str(text, span))
    }

    /// `{{name}}`; the name is recorded for the line.
    fn parse_macro_param_ref(&mut self) -> Result<String, ParseError> {
        self.index += 1;
        let name = self.expect_word()?;
        self.expect(&TokenKind::CloseMacroParam, ErrorCode::Z1109)?;
        self.macro_params.push(name.clone());
        Ok(name)
    }

    fn parse_symbol_ref(&mut self) -> Result<Expr, ParseError> {
        let start = self.current_span();
        let from_global = self.consume_kind(&TokenKind::DoubleColon);
        let token = self.peek().clone();
        let TokenKind::Identifier(name) = token.kind else {
            return Err(ParseError::new(ErrorCode::Z1107, token.span));
        };
        self.index += 1;
        Ok(Expr::Symbol {
            name,
            from_global,
            span: start.to(token.span),
        })
    }

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut exprs = vec![self.parse_expr()?];
        while self.consume_kind(&TokenKind::Comma) {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    fn parse_optional_expr(&mut self) -> Result<Option<Expr>, ParseError> {
        if self.peek().is_line_end() {
            return Ok(None);
        }
        self.parse_expr().map(Some)
    }

    fn parse_optional_comma_expr(&mut self) -> Result<Option<Expr>, ParseError> {
        if self.consume_kind(&TokenKind::Comma) {
            return self.parse_expr().map(Some);
        }
        Ok(None)
    }

    fn parse_name_list(&mut self) -> Result<Vec<String>, ParseError> {
        let mut names = vec![self.expect_word()?];
        while self.consume_kind(&TokenKind::Comma) {
            names.push(self.expect_word()?);
        }
        Ok(names)
    }

    /// Any word-like token, taken as written in the source.
    fn expect_word(&mut self) -> Result<String, ParseError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Identifier(name) => {
                self.index += 1;
                Ok(name)
            }
            TokenKind::Register(_)
            | TokenKind::Mnemonic(_)
            | TokenKind::Pragma(_)
            | TokenKind::Statement(_)
            | TokenKind::True
            | TokenKind::False => {
                self.index += 1;
                Ok(self.token_text(token.span))
            }
            _ => Err(ParseError::new(ErrorCode::Z1107, token.span)),
        }
    }

    /// A string literal with its escapes left untouched.
    fn expect_raw_string(&mut self) -> Result<String, ParseError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::String(raw) => {
                self.index += 1;
                Ok(raw)
            }
            _ => Err(ParseError::new(ErrorCode::Z1108, token.span)),
        }
    }

    fn make_line(
        &mut self,
        start: Span,
        end: Span,
        label: Option<Label>,
        comment: Option<String>,
        kind: LineKind,
    ) -> AssemblyLine {
        let source_text = self
            .source
            .get(start.start..end.start)
            .unwrap_or("")
            .trim_end()
            .to_string();
        let end_column = if end.line == start.line {
            end.col_start
        } else {
            start.col_start + source_text.len()
        };
        AssemblyLine {
            file_index: self.file_index,
            line: start.line,
            start_position: start.start,
            end_position: end.start,
            start_column: start.col_start,
            end_column,
            source_text,
            label,
            comment,
            macro_params: std::mem::take(&mut self.macro_params),
            kind,
        }
    }

    fn at_operand_end(&self) -> bool {
        let token = self.peek();
        token.is_line_end() || matches!(token.kind, TokenKind::Comma | TokenKind::CloseParen)
    }

    fn take_comment(&mut self) -> Option<String> {
        self.comments.get_mut(self.index).and_then(Option::take)
    }

    fn advance_line_end(&mut self) {
        if self.peek().kind == TokenKind::NewLine {
            self.index += 1;
        }
    }

    fn skip_line(&mut self) {
        while !self.peek().is_line_end() {
            self.index += 1;
        }
        self.advance_line_end();
    }

    fn expect(&mut self, kind: &TokenKind, code: ErrorCode) -> Result<Span, ParseError> {
        if self.consume_kind(kind) {
            Ok(self.prev_span())
        } else {
            Err(ParseError::new(code, self.current_span()))
        }
    }

    fn consume_kind(&mut self, kind: &TokenKind) -> bool {
        if self.peek().kind == *kind {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn peek_operator_kind(&self) -> Option<OperatorKind> {
        match self.peek().kind {
            TokenKind::Operator(op) => Some(op),
            _ => None,
        }
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.index += 1;
        }
        token
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.index + offset).min(last)]
    }

    fn prev_span(&self) -> Span {
        if self.index == 0 {
            return self.current_span();
        }
        self.tokens[(self.index - 1).min(self.tokens.len() - 1)].span
    }

    fn current_span(&self) -> Span {
        self.peek().span
    }

    fn token_text(&self, span: Span) -> String {
        self.source
            .get(span.start..span.end)
            .unwrap_or("")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Vec<AssemblyLine> {
        let (lines, errors) = parse_program(source, 0, false);
        assert!(
            errors.is_empty(),
            "unexpected errors: {:?}",
            errors.iter().map(ParseError::message).collect::<Vec<_>>()
        );
        lines
    }

    fn single(source: &str) -> AssemblyLine {
        let mut lines = parse_ok(source);
        assert_eq!(lines.len(), 1);
        lines.remove(0)
    }

    fn first_error(source: &str) -> ErrorCode {
        let (_, errors) = parse_program(source, 0, false);
        errors.first().map(|e| e.code).expect("an error")
    }

    #[test]
    fn parses_label_and_instruction() {
        let line = single("start: ld a,b ; load");
        assert_eq!(line.label.as_ref().map(|l| l.name.as_str()), Some("start"));
        assert_eq!(line.comment.as_deref(), Some("; load"));
        assert_eq!(line.source_text, "start: ld a,b ; load");
        let LineKind::Instruction(instr) = line.kind else {
            panic!("instruction expected");
        };
        assert_eq!(instr.mnemonic, Mnemonic::Ld);
        assert!(instr.operands[0].is_reg(Register::A));
        assert!(instr.operands[1].is_reg(Register::B));
    }

    #[test]
    fn parses_label_without_colon_and_label_only_lines() {
        let lines = parse_ok("loop1 nop\nhere:\n\n; just a comment\n");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].label.as_ref().map(|l| l.name.as_str()), Some("loop1"));
        assert!(matches!(lines[1].kind, LineKind::LabelOnly));
        assert!(matches!(lines[2].kind, LineKind::CommentOnly));
        assert_eq!(lines[2].line, 4);
    }

    #[test]
    fn parses_memory_and_index_operands() {
        let line = single("ld (ix-4),(hl)");
        let LineKind::Instruction(instr) = line.kind else {
            panic!("instruction expected");
        };
        assert!(matches!(
            instr.operands[0],
            Operand::Indexed {
                reg: Register::Ix,
                minus: true,
                disp: Some(Expr::Integer(4, _)),
                ..
            }
        ));
        assert!(matches!(instr.operands[1], Operand::RegIndirect(Register::Hl, _)));

        let line = single("out (c),a");
        let LineKind::Instruction(instr) = line.kind else {
            panic!("instruction expected");
        };
        assert!(matches!(instr.operands[0], Operand::CPort(_)));
    }

    #[test]
    fn distinguishes_memory_operand_from_parenthesized_expression() {
        let line = single("ld hl,(#4000)");
        let LineKind::Instruction(instr) = line.kind else {
            panic!("instruction expected");
        };
        assert!(matches!(instr.operands[1], Operand::MemIndirect(Expr::Integer(0x4000, _), _)));

        let line = single("ld hl,(2+3)*4");
        let LineKind::Instruction(instr) = line.kind else {
            panic!("instruction expected");
        };
        assert!(matches!(
            instr.operands[1],
            Operand::Expr(Expr::Binary {
                op: BinaryOp::Multiply,
                ..
            })
        ));
    }

    #[test]
    fn parses_conditions_and_register_halves() {
        let line = single("jp nz,target");
        let LineKind::Instruction(instr) = line.kind else {
            panic!("instruction expected");
        };
        assert!(matches!(instr.operands[0], Operand::Condition(Condition::Nz, _)));

        let line = single("ld a,hreg(de)");
        let LineKind::Instruction(instr) = line.kind else {
            panic!("instruction expected");
        };
        assert!(instr.operands[1].is_reg(Register::D));
        assert_eq!(first_error("ld a,lreg(sp)"), ErrorCode::Z1114);
    }

    #[test]
    fn honors_operator_precedence() {
        let line = single("value .equ 1 + 2 * 3 << 1");
        let LineKind::Pragma(Pragma::Equ(Expr::Binary { op, left, .. })) = line.kind else {
            panic!("equ expected");
        };
        assert_eq!(op, BinaryOp::Shl);
        assert!(matches!(*left, Expr::Binary { op: BinaryOp::Add, .. }));
    }

    #[test]
    fn unary_minus_binds_tighter_than_multiplication() {
        let line = single(".defb -2 * 3");
        let LineKind::Pragma(Pragma::DefB(values)) = line.kind else {
            panic!("defb expected");
        };
        let Expr::Binary { op, left, .. } = &values[0] else {
            panic!("binary expected");
        };
        assert_eq!(*op, BinaryOp::Multiply);
        assert!(matches!(**left, Expr::Unary { op: UnaryOp::Minus, .. }));
    }

    #[test]
    fn parses_ternary_and_global_symbols() {
        let line = single("x = ::top.y ? $ : 3");
        let LineKind::Pragma(Pragma::Var(Expr::Ternary { cond, then_expr, .. })) = line.kind
        else {
            panic!("var expected");
        };
        assert!(matches!(*cond, Expr::Symbol { from_global: true, .. }));
        assert!(matches!(*then_expr, Expr::CurrentAddress(_)));
        assert_eq!(first_error(".defb 1 ? 2"), ErrorCode::Z1110);
    }

    #[test]
    fn parses_pragmas_with_optional_arguments() {
        let lines = parse_ok(
            ".bank 3, #100\n.includebin \"a.bin\", 2\n.defs 4\n.align\n.model Next\n.injectopt cursork",
        );
        assert!(matches!(
            lines[0].kind,
            LineKind::Pragma(Pragma::Bank { offset: Some(_), .. })
        ));
        assert!(matches!(
            lines[1].kind,
            LineKind::Pragma(Pragma::IncludeBin {
                offset: Some(_),
                length: None,
                ..
            })
        ));
        assert!(matches!(
            lines[2].kind,
            LineKind::Pragma(Pragma::DefS { fill: None, .. })
        ));
        assert!(matches!(lines[3].kind, LineKind::Pragma(Pragma::Align(None))));
        assert!(matches!(&lines[4].kind, LineKind::Pragma(Pragma::Model(name)) if name == "Next"));
        assert!(
            matches!(&lines[5].kind, LineKind::Pragma(Pragma::InjectOpt(opts)) if opts == &["cursork"])
        );
    }

    #[test]
    fn parses_statements() {
        let lines = parse_ok("MyMacro: .macro(first, second)\n.endm\n.for idx = 1 to 10 .step 2\n.next\n.local a1, `b");
        assert!(
            matches!(&lines[0].kind, LineKind::Statement(Statement::Macro(params)) if params == &["first", "second"])
        );
        assert!(matches!(
            lines[2].kind,
            LineKind::Statement(Statement::For { step: Some(_), .. })
        ));
        assert!(matches!(lines[3].kind, LineKind::Statement(Statement::Next)));
        assert!(
            matches!(&lines[4].kind, LineKind::Statement(Statement::Local(names)) if names.len() == 2)
        );
        assert_eq!(first_error(".for i 1 .to 3"), ErrorCode::Z1111);
        assert_eq!(first_error(".for i = 1 3"), ErrorCode::Z1112);
    }

    #[test]
    fn parses_macro_invocation_arguments() {
        let line = single("Fill(hl, , 3+4)");
        let LineKind::MacroOrStructInvocation { name, args } = line.kind else {
            panic!("invocation expected");
        };
        assert_eq!(name, "Fill");
        assert_eq!(args.len(), 3);
        assert!(args[0].operand.is_reg(Register::Hl));
        assert!(matches!(args[1].operand, Operand::None(_)));
        assert_eq!(args[1].text, "");
        assert_eq!(args[2].text, "3+4");
    }

    #[test]
    fn records_macro_parameters() {
        let line = single("ld a,{{value}}+1");
        assert_eq!(line.macro_params, vec!["value"]);
        let line = single("{{body}}");
        assert!(matches!(line.kind, LineKind::MacroParam(ref name) if name == "body"));
    }

    #[test]
    fn checks_macro_time_function_arguments() {
        assert!(matches!(
            single(".if isreg8({{p}})").kind,
            LineKind::Statement(Statement::If(Expr::MacroTimeCall { .. }))
        ));
        assert_eq!(first_error(".if isreg8(b)"), ErrorCode::Z1009);
        let (_, errors) = parse_program(".if isreg8(b)", 0, true);
        assert!(errors.is_empty());
    }

    #[test]
    fn converts_textof_arguments() {
        let line = single(".defm textof(ldir)");
        assert!(matches!(line.kind, LineKind::Pragma(Pragma::DefM(Expr::Str(ref s, _))) if s == "LDIR"));
        let line = single(".defm ltextof((HL))");
        assert!(matches!(line.kind, LineKind::Pragma(Pragma::DefM(Expr::Str(ref s, _))) if s == "(hl)"));
        assert_eq!(first_error(".defm textof(3)"), ErrorCode::Z1120);
    }

    #[test]
    fn parses_field_assignment() {
        let line = single("field -> .defw 3");
        assert!(matches!(line.kind, LineKind::FieldAssignment(Pragma::DefW(_))));
        assert_eq!(first_error("-> .org 3"), ErrorCode::Z1119);
    }

    #[test]
    fn parses_directives() {
        let lines = parse_ok("#include \"lib\\a.asm\"\n#ifmod NEXT\n#ifdef DEBUG\n#line 10 \"x.asm\"");
        assert!(matches!(&lines[0].kind, LineKind::Directive(Directive::Include(p)) if p == "lib\\a.asm"));
        assert!(matches!(&lines[1].kind, LineKind::Directive(Directive::IfMod(m)) if m == "NEXT"));
        assert!(matches!(&lines[2].kind, LineKind::Directive(Directive::IfDef(m)) if m == "DEBUG"));
        assert!(matches!(
            &lines[3].kind,
            LineKind::Directive(Directive::Line { file: Some(_), .. })
        ));
    }

    #[test]
    fn converts_zx_string_escapes() {
        assert_eq!(convert_escaped_string(r"a\ib"), "a\u{10}b");
        assert_eq!(convert_escaped_string(r"\P\C"), "\u{60}\u{7f}");
        assert_eq!(convert_escaped_string(r"\x4142"), "A42");
        assert_eq!(convert_escaped_string(r"\xg"), "xg");
        assert_eq!(convert_escaped_string(r#"\"\\"#), "\"\\");
        let line = single(".defb 'A', '\\i'");
        let LineKind::Pragma(Pragma::DefB(values)) = line.kind else {
            panic!("defb expected");
        };
        assert!(matches!(values[0], Expr::Integer(65, _)));
        assert!(matches!(values[1], Expr::Integer(0x10, _)));
    }

    #[test]
    fn recovers_after_errors() {
        let (lines, errors) = parse_program("ld a,\nnop\n.defb 1 2\n#x\nhalt", 0, false);
        let codes: Vec<_> = errors.iter().map(|e| e.code).collect();
        assert_eq!(codes, vec![ErrorCode::Z1118, ErrorCode::Z1104, ErrorCode::Z1117]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line, 2);
        assert_eq!(lines[1].line, 5);
    }
}
