// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Expression evaluation.
//!
//! Expressions evaluate to an [`ExpressionValue`], which carries booleans,
//! integers, reals and strings. Operators follow the typing rules of the
//! assembler language: arithmetic on a real yields a real (normalized back to
//! an integer when the result is integral), integer division truncates, and
//! strings only combine with strings.
//!
//! Evaluation needs an [`EvalContext`] for the current address, symbol
//! lookup, the loop counter and the seeded random generator.

use std::fmt;

use serde::Serialize;

use crate::core::assembler::error::ErrorCode;
use crate::core::ast::{BinaryOp, Expr, UnaryOp};
use crate::core::functions::{call_function, eval_macro_time, SeededRandom};
use crate::core::tokenizer::Span;

/// Value of an evaluated expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExpressionValue {
    Bool(bool),
    Integer(i64),
    Real(f64),
    Str(String),
    /// The expression references something not yet known.
    NonEvaluated,
    /// Evaluation failed; the failure has already been reported.
    Error,
}

impl ExpressionValue {
    /// A numeric result: integral values become `Integer`.
    pub fn from_f64(value: f64) -> Self {
        if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
            ExpressionValue::Integer(value as i64)
        } else {
            ExpressionValue::Real(value)
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, ExpressionValue::NonEvaluated | ExpressionValue::Error)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, ExpressionValue::Str(_))
    }

    pub fn as_long(&self) -> Result<i64, EvalError> {
        match self {
            ExpressionValue::Bool(v) => Ok(i64::from(*v)),
            ExpressionValue::Integer(v) => Ok(*v),
            ExpressionValue::Real(v) => Ok(v.floor() as i64),
            ExpressionValue::Str(text) => parse_leading_int(text)
                .ok_or_else(|| EvalError::new("Cannot convert string to an integer value.")),
            _ => Err(EvalError::new("The value is not evaluated.")),
        }
    }

    pub fn as_real(&self) -> Result<f64, EvalError> {
        match self {
            ExpressionValue::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            ExpressionValue::Integer(v) => Ok(*v as f64),
            ExpressionValue::Real(v) => Ok(*v),
            ExpressionValue::Str(text) => parse_leading_real(text)
                .ok_or_else(|| EvalError::new("Cannot convert string to a real value.")),
            _ => Err(EvalError::new("The value is not evaluated.")),
        }
    }

    pub fn as_string(&self) -> Result<String, EvalError> {
        match self {
            ExpressionValue::Bool(v) => Ok(if *v { "true" } else { "false" }.to_string()),
            ExpressionValue::Integer(v) => Ok(v.to_string()),
            ExpressionValue::Real(v) => Ok(v.to_string()),
            ExpressionValue::Str(text) => Ok(text.clone()),
            _ => Err(EvalError::new("The value is not evaluated.")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, EvalError> {
        match self {
            ExpressionValue::Bool(v) => Ok(*v),
            ExpressionValue::Integer(v) => Ok(*v != 0),
            ExpressionValue::Real(v) => Ok(*v != 0.0),
            ExpressionValue::Str(text) => Ok(!text.trim().is_empty()),
            _ => Err(EvalError::new("The value is not evaluated.")),
        }
    }

    pub fn as_word(&self) -> Result<u16, EvalError> {
        Ok((self.as_long()? & 0xFFFF) as u16)
    }

    pub fn as_byte(&self) -> Result<u8, EvalError> {
        Ok((self.as_long()? & 0xFF) as u8)
    }
}

fn parse_leading_int(text: &str) -> Option<i64> {
    let trimmed = text.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let value: i64 = digits[..end].parse().ok()?;
    Some(if negative { -value } else { value })
}

fn parse_leading_real(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .or_else(|| parse_leading_int(trimmed).map(|v| v as f64))
}

/// Failure while evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub code: ErrorCode,
    pub params: Vec<String>,
    pub span: Option<Span>,
}

impl EvalError {
    /// A general evaluation failure (Z0606).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Z0606,
            params: vec![message.into()],
            span: None,
        }
    }

    pub fn coded(code: ErrorCode, params: Vec<String>) -> Self {
        Self {
            code,
            params,
            span: None,
        }
    }

    /// Attach a span unless a more specific one is already set.
    pub fn at(mut self, span: Span) -> Self {
        if self.span.is_none() {
            self.span = Some(span);
        }
        self
    }

    pub fn message(&self) -> String {
        if self.code == ErrorCode::Z0606 {
            return self.params.first().cloned().unwrap_or_default();
        }
        self.code.message(&self.params)
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for EvalError {}

/// Context for expression evaluation.
pub trait EvalContext {
    /// Address of the instruction being assembled (`$`).
    fn current_address(&self) -> u16;

    /// Value of a symbol; `None` when the symbol is unknown. Marks the
    /// symbol as used.
    fn symbol_value(&mut self, name: &str, from_global: bool) -> Option<ExpressionValue>;

    fn is_symbol_resolved(&self, name: &str, from_global: bool) -> bool;

    /// Current iteration counter of the innermost loop.
    fn loop_counter(&self) -> Option<i64>;

    fn random(&mut self) -> &mut SeededRandom;
}

/// True when every symbol the expression references has a value.
pub fn ready_to_evaluate(expr: &Expr, ctx: &dyn EvalContext) -> bool {
    first_unresolved(expr, ctx).is_none()
}

/// The first symbol reference that does not resolve yet.
pub fn first_unresolved(expr: &Expr, ctx: &dyn EvalContext) -> Option<String> {
    let mut missing = None;
    expr.for_each_symbol(&mut |name, from_global| {
        if missing.is_none() && !ctx.is_symbol_resolved(name, from_global) {
            missing = Some(name.to_string());
        }
    });
    missing
}

/// Evaluate an expression.
pub fn eval_expr(expr: &Expr, ctx: &mut dyn EvalContext) -> Result<ExpressionValue, EvalError> {
    match expr {
        Expr::Integer(value, _) => Ok(ExpressionValue::Integer(*value)),
        Expr::Real(value, _) => Ok(ExpressionValue::Real(*value)),
        Expr::Bool(value, _) => Ok(ExpressionValue::Bool(*value)),
        Expr::Str(text, _) => Ok(ExpressionValue::Str(text.clone())),
        Expr::CurrentAddress(_) => Ok(ExpressionValue::Integer(i64::from(ctx.current_address()))),
        Expr::LoopCounter(span) => ctx
            .loop_counter()
            .map(ExpressionValue::Integer)
            .ok_or_else(|| EvalError::coded(ErrorCode::Z0705, Vec::new()).at(*span)),
        Expr::Symbol {
            name,
            from_global,
            span,
        } => ctx
            .symbol_value(name, *from_global)
            .ok_or_else(|| EvalError::coded(ErrorCode::Z0605, vec![name.clone()]).at(*span)),
        Expr::MacroParam(name, span) => {
            Err(EvalError::coded(ErrorCode::Z1011, vec![name.clone()]).at(*span))
        }
        Expr::Call { name, args, span } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, ctx)?);
            }
            if values.iter().any(|v| *v == ExpressionValue::Error) {
                return Ok(ExpressionValue::Error);
            }
            if values.iter().any(|v| !v.is_valid()) {
                return Ok(ExpressionValue::NonEvaluated);
            }
            call_function(name, &values, ctx.random()).map_err(|err| err.at(*span))
        }
        Expr::MacroTimeCall {
            name,
            operand,
            span,
        } => eval_macro_time(name, operand)
            .map(ExpressionValue::Bool)
            .ok_or_else(|| EvalError::new(format!("Unknown function '{name}'")).at(*span)),
        Expr::Unary { op, expr, span } => {
            let value = eval_expr(expr, ctx)?;
            apply_unary(*op, value).map_err(|err| err.at(*span))
        }
        Expr::Binary {
            op,
            left,
            right,
            span,
        } => {
            let left = eval_expr(left, ctx)?;
            let right = eval_expr(right, ctx)?;
            apply_binary(*op, left, right).map_err(|err| err.at(*span))
        }
        Expr::Ternary {
            cond,
            then_expr,
            else_expr,
            span,
        } => {
            let cond = eval_expr(cond, ctx)?;
            if !cond.is_valid() {
                return Ok(cond);
            }
            if cond.as_bool().map_err(|err| err.at(*span))? {
                eval_expr(then_expr, ctx)
            } else {
                eval_expr(else_expr, ctx)
            }
        }
    }
}

fn apply_unary(op: UnaryOp, value: ExpressionValue) -> Result<ExpressionValue, EvalError> {
    if !value.is_valid() {
        return Ok(value);
    }
    match op {
        UnaryOp::Plus => Ok(value),
        UnaryOp::Minus => match value {
            ExpressionValue::Integer(v) => Ok(ExpressionValue::Integer(v.wrapping_neg())),
            ExpressionValue::Bool(v) => Ok(ExpressionValue::Integer(-i64::from(v))),
            ExpressionValue::Real(v) => Ok(ExpressionValue::Real(-v)),
            other => Ok(ExpressionValue::from_f64(-other.as_real()?)),
        },
        UnaryOp::LogicNot => match value {
            ExpressionValue::Bool(_) | ExpressionValue::Integer(_) => {
                Ok(ExpressionValue::Bool(value.as_long()? == 0))
            }
            _ => Err(EvalError::new(
                "Unary logical not operation can be applied only on integral types",
            )),
        },
        UnaryOp::BitNot => match value {
            ExpressionValue::Bool(_) | ExpressionValue::Integer(_) => {
                Ok(ExpressionValue::Integer(!value.as_long()?))
            }
            _ => Err(EvalError::new(
                "Unary bitwise not operation can be applied only on integral types",
            )),
        },
    }
}

fn string_operand(side: &str, op: BinaryOp) -> EvalError {
    EvalError::new(format!(
        "The {side} operand of {} cannot be a string.",
        op.symbol()
    ))
}

fn integral_operand(side: &str, op: BinaryOp) -> EvalError {
    EvalError::new(format!(
        "The {side} operand of {} must be an integral type.",
        op.symbol()
    ))
}

fn reject_strings(
    op: BinaryOp,
    left: &ExpressionValue,
    right: &ExpressionValue,
) -> Result<(), EvalError> {
    if left.is_string() {
        return Err(string_operand("left", op));
    }
    if right.is_string() {
        return Err(string_operand("right", op));
    }
    Ok(())
}

/// Operands of the bitwise and shift operators. A real is accepted only
/// when it has no fractional part; the left side is checked first.
fn require_integral(
    op: BinaryOp,
    left: &ExpressionValue,
    right: &ExpressionValue,
) -> Result<(i64, i64), EvalError> {
    for (side, value) in [("left", left), ("right", right)] {
        match value {
            ExpressionValue::Str(_) => return Err(string_operand(side, op)),
            ExpressionValue::Real(v) if v.fract() != 0.0 => {
                return Err(integral_operand(side, op))
            }
            _ => {}
        }
    }
    Ok((left.as_long()?, right.as_long()?))
}

fn any_real(left: &ExpressionValue, right: &ExpressionValue) -> bool {
    matches!(left, ExpressionValue::Real(_)) || matches!(right, ExpressionValue::Real(_))
}

/// Apply `op` to two evaluated operands.
pub fn apply_binary(
    op: BinaryOp,
    left: ExpressionValue,
    right: ExpressionValue,
) -> Result<ExpressionValue, EvalError> {
    if left == ExpressionValue::Error || right == ExpressionValue::Error {
        return Ok(ExpressionValue::Error);
    }
    if !left.is_valid() || !right.is_valid() {
        return Ok(ExpressionValue::NonEvaluated);
    }
    match op {
        BinaryOp::Min | BinaryOp::Max => {
            reject_strings(op, &left, &right)?;
            let left_first = if op == BinaryOp::Min {
                left.as_real()? <= right.as_real()?
            } else {
                left.as_real()? >= right.as_real()?
            };
            Ok(if left_first { left } else { right })
        }
        BinaryOp::Multiply => {
            reject_strings(op, &left, &right)?;
            if any_real(&left, &right) {
                Ok(ExpressionValue::from_f64(left.as_real()? * right.as_real()?))
            } else {
                Ok(ExpressionValue::Integer(
                    left.as_long()?.wrapping_mul(right.as_long()?),
                ))
            }
        }
        BinaryOp::Divide => {
            reject_strings(op, &left, &right)?;
            if right.as_real()? == 0.0 {
                return Err(EvalError::new("Divide by zero error"));
            }
            if any_real(&left, &right) {
                Ok(ExpressionValue::from_f64(left.as_real()? / right.as_real()?))
            } else {
                Ok(ExpressionValue::Integer(
                    left.as_long()?.wrapping_div(right.as_long()?),
                ))
            }
        }
        BinaryOp::Mod => {
            reject_strings(op, &left, &right)?;
            let divisor = right.as_long()?;
            if divisor == 0 {
                return Err(EvalError::new("Divide by zero error"));
            }
            Ok(ExpressionValue::Integer(left.as_long()?.wrapping_rem(divisor)))
        }
        BinaryOp::Add => match (&left, &right) {
            (ExpressionValue::Str(a), ExpressionValue::Str(b)) => {
                Ok(ExpressionValue::Str(format!("{a}{b}")))
            }
            (ExpressionValue::Str(_), _) => {
                Err(EvalError::new("Only a string can be added to a string"))
            }
            (_, ExpressionValue::Str(_)) => {
                Err(EvalError::new("Cannot add an integral value and a string"))
            }
            _ if any_real(&left, &right) => {
                Ok(ExpressionValue::from_f64(left.as_real()? + right.as_real()?))
            }
            _ => Ok(ExpressionValue::Integer(
                left.as_long()?.wrapping_add(right.as_long()?),
            )),
        },
        BinaryOp::Subtract => {
            reject_strings(op, &left, &right)?;
            if any_real(&left, &right) {
                Ok(ExpressionValue::from_f64(left.as_real()? - right.as_real()?))
            } else {
                Ok(ExpressionValue::Integer(
                    left.as_long()?.wrapping_sub(right.as_long()?),
                ))
            }
        }
        BinaryOp::Shl | BinaryOp::Shr => {
            let (value, amount) = require_integral(op, &left, &right)?;
            let amount = (amount & 0x1F) as u32;
            let result = if op == BinaryOp::Shl {
                value.wrapping_shl(amount)
            } else {
                value >> amount
            };
            Ok(ExpressionValue::Integer(result))
        }
        BinaryOp::BitAnd => match (&left, &right) {
            (ExpressionValue::Str(a), ExpressionValue::Str(b)) => {
                Ok(ExpressionValue::Str(format!("{a}\r\n{b}")))
            }
            (ExpressionValue::Str(_), _) => Err(EvalError::new(format!(
                "The right operand of {} must be a string.",
                op.symbol()
            ))),
            _ => {
                let (a, b) = require_integral(op, &left, &right)?;
                Ok(ExpressionValue::Integer(a & b))
            }
        },
        BinaryOp::BitOr => {
            let (a, b) = require_integral(op, &left, &right)?;
            Ok(ExpressionValue::Integer(a | b))
        }
        BinaryOp::BitXor => {
            let (a, b) = require_integral(op, &left, &right)?;
            Ok(ExpressionValue::Integer(a ^ b))
        }
        BinaryOp::Eq
        | BinaryOp::CaseEq
        | BinaryOp::Ne
        | BinaryOp::CaseNe
        | BinaryOp::Lt
        | BinaryOp::Le
        | BinaryOp::Gt
        | BinaryOp::Ge => compare(op, &left, &right).map(ExpressionValue::Bool),
    }
}

fn compare(
    op: BinaryOp,
    left: &ExpressionValue,
    right: &ExpressionValue,
) -> Result<bool, EvalError> {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (ExpressionValue::Str(a), ExpressionValue::Str(b)) => {
            if matches!(op, BinaryOp::CaseEq | BinaryOp::CaseNe) {
                a.to_lowercase().cmp(&b.to_lowercase())
            } else {
                a.cmp(b)
            }
        }
        (ExpressionValue::Str(_), _) => {
            return Err(EvalError::new(
                "String can be compared only to another string",
            ))
        }
        (_, ExpressionValue::Str(_)) => {
            return Err(EvalError::new("Cannot compare a number with a string"))
        }
        _ if any_real(left, right) => left
            .as_real()?
            .partial_cmp(&right.as_real()?)
            .unwrap_or(Ordering::Less),
        _ => left.as_long()?.cmp(&right.as_long()?),
    };
    Ok(match op {
        BinaryOp::Eq | BinaryOp::CaseEq => ordering == Ordering::Equal,
        BinaryOp::Ne | BinaryOp::CaseNe => ordering != Ordering::Equal,
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_program;
    use crate::core::ast::{LineKind, Pragma};
    use std::collections::HashMap;

    struct TestContext {
        symbols: HashMap<String, ExpressionValue>,
        address: u16,
        counter: Option<i64>,
        rng: SeededRandom,
    }

    impl TestContext {
        fn new() -> Self {
            Self {
                symbols: HashMap::new(),
                address: 0x8000,
                counter: None,
                rng: SeededRandom::new(7),
            }
        }
    }

    impl EvalContext for TestContext {
        fn current_address(&self) -> u16 {
            self.address
        }

        fn symbol_value(&mut self, name: &str, _from_global: bool) -> Option<ExpressionValue> {
            self.symbols.get(name).cloned()
        }

        fn is_symbol_resolved(&self, name: &str, _from_global: bool) -> bool {
            self.symbols.contains_key(name)
        }

        fn loop_counter(&self) -> Option<i64> {
            self.counter
        }

        fn random(&mut self) -> &mut SeededRandom {
            &mut self.rng
        }
    }

    fn parse_expr(text: &str) -> Expr {
        let (lines, errors) = parse_program(&format!(" .equ {text}"), 0, false);
        assert!(errors.is_empty(), "parse errors: {errors:?}");
        match &lines[0].kind {
            LineKind::Pragma(Pragma::Equ(expr)) => expr.clone(),
            other => panic!("unexpected line: {other:?}"),
        }
    }

    fn eval(text: &str, ctx: &mut TestContext) -> Result<ExpressionValue, EvalError> {
        eval_expr(&parse_expr(text), ctx)
    }

    fn eval_ok(text: &str) -> ExpressionValue {
        eval(text, &mut TestContext::new()).expect("evaluation")
    }

    #[test]
    fn evaluates_integer_arithmetic() {
        assert_eq!(eval_ok("2 + 3 * 4"), ExpressionValue::Integer(14));
        assert_eq!(eval_ok("7 / 2"), ExpressionValue::Integer(3));
        assert_eq!(eval_ok("-7 % 3"), ExpressionValue::Integer(-1));
        assert_eq!(eval_ok("1 << 4 | 1"), ExpressionValue::Integer(17));
        assert_eq!(eval_ok("3 <? 5"), ExpressionValue::Integer(3));
        assert_eq!(eval_ok("3 >? 5"), ExpressionValue::Integer(5));
    }

    #[test]
    fn normalizes_integral_reals() {
        assert_eq!(eval_ok("2.5 * 2"), ExpressionValue::Integer(5));
        assert_eq!(eval_ok("1.5 + 1"), ExpressionValue::Real(2.5));
    }

    #[test]
    fn handles_strings() {
        assert_eq!(eval_ok("\"ab\" + \"cd\""), ExpressionValue::Str("abcd".to_string()));
        assert_eq!(eval_ok("\"AB\" === \"ab\""), ExpressionValue::Bool(true));
        assert_eq!(eval_ok("\"AB\" == \"ab\""), ExpressionValue::Bool(false));
        let err = eval("1 + \"a\"", &mut TestContext::new()).expect_err("mixed add");
        assert_eq!(err.message(), "Cannot add an integral value and a string");
        let err = eval("\"a\" * 2", &mut TestContext::new()).expect_err("string multiply");
        assert_eq!(err.message(), "The left operand of * cannot be a string.");
        let err = eval("1 & \"abc\"", &mut TestContext::new()).expect_err("mixed and");
        assert_eq!(err.message(), "The right operand of & cannot be a string.");
        assert_eq!(eval_ok("true + 1e1"), ExpressionValue::Integer(11));
        assert_eq!(eval_ok("23 << 12"), ExpressionValue::Integer(94208));
    }

    #[test]
    fn masks_shift_counts_to_five_bits() {
        assert_eq!(eval_ok("#8010 << #1008"), ExpressionValue::Integer(8392704));
        assert_eq!(eval_ok("true << 123"), ExpressionValue::Integer(134217728));
        assert_eq!(eval_ok("#8010 >> #1008"), ExpressionValue::Integer(128));
        assert_eq!(eval_ok("2e1 << 1e1"), ExpressionValue::Integer(20480));
        assert_eq!(eval_ok("1e1 >> true"), ExpressionValue::Integer(5));
    }

    #[test]
    fn modulo_converts_reals() {
        assert_eq!(eval_ok("2e1 % 1e1"), ExpressionValue::Integer(0));
        assert_eq!(eval_ok("20 % 1e1"), ExpressionValue::Integer(0));
        assert_eq!(eval_ok("true % 1e1"), ExpressionValue::Integer(1));
        assert_eq!(eval_ok("#8010 % #1008"), ExpressionValue::Integer(4056));
        let err = eval("1.1 % \"abc\"", &mut TestContext::new()).expect_err("string modulo");
        assert!(err.message().contains("cannot be a string"));
    }

    #[test]
    fn bitwise_operand_errors_name_the_offending_side() {
        for (source, side) in [
            ("1.1 << \"abc\"", "left"),
            ("1.1 >> \"abc\"", "left"),
            ("1.1 & \"abc\"", "left"),
            ("1.1 | \"abc\"", "left"),
            ("1.1 ^ \"abc\"", "left"),
            ("\"abc\" & false", "right"),
            ("\"abc\" | false", "left"),
            ("true << \"abc\"", "right"),
            ("1 ^ \"abc\"", "right"),
        ] {
            let err = eval(source, &mut TestContext::new()).expect_err(source);
            assert!(err.message().contains(side), "{source}: {}", err.message());
        }
        let err = eval("\"abc\" & 1", &mut TestContext::new()).expect_err("string and");
        assert_eq!(err.message(), "The right operand of & must be a string.");
        assert_eq!(eval_ok("2e1 | 1e1"), ExpressionValue::Integer(30));
        assert_eq!(eval_ok("true ^ 1e1"), ExpressionValue::Integer(11));
    }

    #[test]
    fn reports_divide_by_zero() {
        let err = eval("1 / 0", &mut TestContext::new()).expect_err("division");
        assert_eq!(err.code, ErrorCode::Z0606);
        assert_eq!(err.message(), "Divide by zero error");
        assert!(err.span.is_some());
    }

    #[test]
    fn resolves_symbols_and_address() {
        let mut ctx = TestContext::new();
        ctx.symbols
            .insert("start".to_string(), ExpressionValue::Integer(0x100));
        assert_eq!(
            eval("start + $", &mut ctx).expect("value"),
            ExpressionValue::Integer(0x8100)
        );
        let err = eval("missing + 1", &mut ctx).expect_err("unknown symbol");
        assert_eq!(err.code, ErrorCode::Z0605);
        assert_eq!(err.message(), "Unresolved symbol: 'missing'");
        assert!(!ready_to_evaluate(&parse_expr("start + missing"), &ctx));
        assert_eq!(
            first_unresolved(&parse_expr("start + missing"), &ctx),
            Some("missing".to_string())
        );
    }

    #[test]
    fn loop_counter_requires_loop() {
        let mut ctx = TestContext::new();
        let err = eval("$cnt", &mut ctx).expect_err("outside a loop");
        assert_eq!(err.code, ErrorCode::Z0705);
        ctx.counter = Some(3);
        assert_eq!(eval("$cnt * 2", &mut ctx).expect("value"), ExpressionValue::Integer(6));
    }

    #[test]
    fn conditional_selects_branch() {
        assert_eq!(eval_ok("1 > 2 ? 10 : 20"), ExpressionValue::Integer(20));
        assert_eq!(eval_ok("\" \" ? 1 : 2"), ExpressionValue::Integer(2));
    }

    #[test]
    fn calls_builtin_functions() {
        assert_eq!(eval_ok("high(#1234) + low(#1234)"), ExpressionValue::Integer(0x46));
        assert_eq!(eval_ok("len(\"abc\")"), ExpressionValue::Integer(3));
        let err = eval("len(3)", &mut TestContext::new()).expect_err("bad signature");
        assert!(err.message().contains("do not match"));
    }

    #[test]
    fn propagates_non_evaluated_operands() {
        assert_eq!(
            apply_binary(
                BinaryOp::Add,
                ExpressionValue::NonEvaluated,
                ExpressionValue::Integer(1)
            ),
            Ok(ExpressionValue::NonEvaluated)
        );
        assert_eq!(
            apply_binary(
                BinaryOp::Add,
                ExpressionValue::Error,
                ExpressionValue::NonEvaluated
            ),
            Ok(ExpressionValue::Error)
        );
    }

    #[test]
    fn converts_values() {
        assert_eq!(ExpressionValue::Str(" 42abc".to_string()).as_long(), Ok(42));
        assert!(ExpressionValue::Str("abc".to_string()).as_long().is_err());
        assert_eq!(ExpressionValue::Real(-1.5).as_long(), Ok(-2));
        assert_eq!(ExpressionValue::Integer(0x12345).as_word(), Ok(0x2345));
        assert_eq!(ExpressionValue::Bool(true).as_string(), Ok("true".to_string()));
    }
}
