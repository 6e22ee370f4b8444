// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Built-in expression functions, macro-time functions and the seeded
//! random number generator behind `rnd()` and `.rndseed`.

use std::f64::consts::{E, PI};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::ast::Operand;
use crate::core::expr::{EvalError, ExpressionValue};
use crate::z80::Register;

/// Functions evaluated on a macro argument operand rather than on a value.
pub const MACRO_TIME_FUNCTIONS: &[&str] = &[
    "def",
    "isreg8",
    "isreg8std",
    "isreg8spec",
    "isreg8idx",
    "isreg16",
    "isreg16std",
    "isreg16idx",
    "isregindirect",
    "iscport",
    "isindexedaddr",
    "iscondition",
    "isexpr",
    "isrega",
    "isregaf",
    "isregb",
    "isregc",
    "isregbc",
    "isregd",
    "isrege",
    "isregde",
    "isregh",
    "isregl",
    "isreghl",
    "isregi",
    "isregr",
    "isregxh",
    "isregxl",
    "isregix",
    "isregyh",
    "isregyl",
    "isregiy",
    "isregsp",
];

pub fn is_macro_time_function(lower: &str) -> bool {
    MACRO_TIME_FUNCTIONS.contains(&lower)
}

/// Evaluate a macro-time function. Returns `None` for an unknown name.
pub fn eval_macro_time(name: &str, operand: &Operand) -> Option<bool> {
    let reg = operand.reg();
    let is = |expected: Register| reg == Some(expected);
    let result = match name {
        "def" => !matches!(operand, Operand::None(_)),
        "isreg8" => reg.is_some_and(Register::is_reg8),
        "isreg8std" => reg.is_some_and(Register::is_reg8_std),
        "isreg8spec" => reg.is_some_and(Register::is_reg8_spec),
        "isreg8idx" => reg.is_some_and(Register::is_reg8_idx),
        "isreg16" => {
            reg.is_some_and(|r| r.is_reg16() || matches!(r, Register::Af | Register::AfAlt))
        }
        "isreg16std" => reg.is_some_and(Register::is_reg16_std),
        "isreg16idx" => reg.is_some_and(Register::is_reg16_idx),
        "isregindirect" => matches!(operand, Operand::RegIndirect(..)),
        "iscport" => matches!(operand, Operand::CPort(_)),
        "isindexedaddr" => matches!(operand, Operand::Indexed { .. }),
        "iscondition" => matches!(operand, Operand::Condition(..)) || is(Register::C),
        "isexpr" => matches!(operand, Operand::Expr(_)),
        "isrega" => is(Register::A),
        "isregaf" => is(Register::Af),
        "isregb" => is(Register::B),
        "isregc" => is(Register::C),
        "isregbc" => is(Register::Bc),
        "isregd" => is(Register::D),
        "isrege" => is(Register::E),
        "isregde" => is(Register::De),
        "isregh" => is(Register::H),
        "isregl" => is(Register::L),
        "isreghl" => is(Register::Hl),
        "isregi" => is(Register::I),
        "isregr" => is(Register::R),
        "isregxh" => is(Register::Xh),
        "isregxl" => is(Register::Xl),
        "isregix" => is(Register::Ix),
        "isregyh" => is(Register::Yh),
        "isregyl" => is(Register::Yl),
        "isregiy" => is(Register::Iy),
        "isregsp" => is(Register::Sp),
        _ => return None,
    };
    Some(result)
}

/// Park-Miller minimal standard generator.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    seed: i64,
}

const RANDOM_MODULUS: i64 = 2_147_483_647;

impl SeededRandom {
    pub fn new(seed: i64) -> Self {
        let mut seed = seed % RANDOM_MODULUS;
        if seed <= 0 {
            seed += RANDOM_MODULUS - 1;
        }
        Self { seed }
    }

    /// Seed from the wall clock.
    pub fn from_time() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(1);
        Self::new(millis)
    }

    pub fn next(&mut self) -> i64 {
        self.seed = (self.seed * 16807) % RANDOM_MODULUS;
        self.seed
    }

    pub fn next_float(&mut self) -> f64 {
        (self.next() - 1) as f64 / (RANDOM_MODULUS - 1) as f64
    }

    /// Integer in `from..to`.
    pub fn integer(&mut self, from: i64, to: i64) -> i64 {
        (from as f64 + self.next_float() * (to - from) as f64).floor() as i64
    }
}

impl Default for SeededRandom {
    fn default() -> Self {
        Self::from_time()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    Bool,
    Integer,
    Real,
    Str,
}

impl ArgKind {
    fn accepts(self, value: &ExpressionValue) -> bool {
        match self {
            ArgKind::Bool => matches!(value, ExpressionValue::Bool(_)),
            ArgKind::Integer => {
                matches!(value, ExpressionValue::Bool(_) | ExpressionValue::Integer(_))
            }
            ArgKind::Real => matches!(
                value,
                ExpressionValue::Bool(_) | ExpressionValue::Integer(_) | ExpressionValue::Real(_)
            ),
            ArgKind::Str => matches!(value, ExpressionValue::Str(_)),
        }
    }
}

use ArgKind::{Bool as B, Integer as I, Real as R, Str as S};

/// Accepted argument lists of each built-in, tried in order.
fn signatures(name: &str) -> Option<&'static [&'static [ArgKind]]> {
    let sigs: &'static [&'static [ArgKind]] = match name {
        "abs" | "sign" => &[&[I], &[R]],
        "acos" | "asin" | "atan" | "ceiling" | "cos" | "cosh" | "exp" | "floor" | "log10"
        | "round" | "sin" | "sinh" | "sqrt" | "tan" | "tanh" | "truncate" | "int" | "frac" => {
            &[&[R]]
        }
        "atan2" | "pow" => &[&[R, R]],
        "log" => &[&[R], &[R, R]],
        "max" | "min" => &[&[I, I], &[R, R]],
        "pi" | "nat" => &[&[]],
        "low" | "high" | "word" | "ink" | "paper" | "bright" | "flash" => &[&[I]],
        "rnd" => &[&[], &[I, I]],
        "length" | "len" | "lowercase" | "lcase" | "uppercase" | "ucase" => &[&[S]],
        "left" | "right" | "fill" => &[&[S, I]],
        "substr" => &[&[S, I, I]],
        "str" => &[&[B], &[I], &[R], &[S]],
        "scraddr" | "attraddr" => &[&[I, I]],
        "attr" => &[&[I, I, I, I], &[I, I, I], &[I, I]],
        _ => return None,
    };
    Some(sigs)
}

/// Call a built-in function with already evaluated arguments.
pub fn call_function(
    name: &str,
    args: &[ExpressionValue],
    rng: &mut SeededRandom,
) -> Result<ExpressionValue, EvalError> {
    let sigs =
        signatures(name).ok_or_else(|| EvalError::new(format!("Unknown function '{name}'")))?;
    let matched = sigs.iter().any(|sig| {
        sig.len() == args.len() && sig.iter().zip(args).all(|(kind, arg)| kind.accepts(arg))
    });
    if !matched {
        return Err(EvalError::new(format!(
            "The arguments of '{name}' do not match any acceptable signatures"
        )));
    }
    apply(name, args, rng).map_err(|err| {
        EvalError::new(format!(
            "Function value cannot be evaluated: '{name}': {}",
            err.message()
        ))
    })
}

fn apply(
    name: &str,
    args: &[ExpressionValue],
    rng: &mut SeededRandom,
) -> Result<ExpressionValue, EvalError> {
    let real = |idx: usize| args[idx].as_real();
    let long = |idx: usize| args[idx].as_long();
    let number = ExpressionValue::from_f64;
    let value = match name {
        "abs" => match &args[0] {
            ExpressionValue::Real(v) => number(v.abs()),
            _ => ExpressionValue::Integer(long(0)?.wrapping_abs()),
        },
        "sign" => match &args[0] {
            ExpressionValue::Real(v) => number(if *v == 0.0 { 0.0 } else { v.signum() }),
            _ => ExpressionValue::Integer(long(0)?.signum()),
        },
        "acos" => number(real(0)?.acos()),
        "asin" => number(real(0)?.asin()),
        "atan" => number(real(0)?.atan()),
        "atan2" => number(real(0)?.atan2(real(1)?)),
        "ceiling" => number(real(0)?.ceil()),
        "cos" => number(real(0)?.cos()),
        "cosh" => number(real(0)?.cosh()),
        "exp" => number(real(0)?.exp()),
        "floor" => number(real(0)?.floor()),
        "log" if args.len() == 2 => {
            let base = real(1)?;
            let divisor = if base == 0.0 { 1.0 } else { base.ln() };
            number(real(0)?.ln() / divisor)
        }
        "log" => number(real(0)?.ln()),
        "log10" => number(real(0)?.log10()),
        "max" | "min" => {
            let pick_max = name == "max";
            match (&args[0], &args[1]) {
                (ExpressionValue::Real(_), _) | (_, ExpressionValue::Real(_)) => {
                    let (a, b) = (real(0)?, real(1)?);
                    number(if pick_max { a.max(b) } else { a.min(b) })
                }
                _ => {
                    let (a, b) = (long(0)?, long(1)?);
                    ExpressionValue::Integer(if pick_max { a.max(b) } else { a.min(b) })
                }
            }
        }
        "pow" => number(real(0)?.powf(real(1)?)),
        "round" => number((real(0)? + 0.5).floor()),
        "sin" => number(real(0)?.sin()),
        "sinh" => number(real(0)?.sinh()),
        "sqrt" => number(real(0)?.sqrt()),
        "tan" => number(real(0)?.tan()),
        "tanh" => number(real(0)?.tanh()),
        "truncate" => number(real(0)?.trunc()),
        "pi" => ExpressionValue::Real(PI),
        "nat" => ExpressionValue::Real(E),
        "int" => ExpressionValue::Integer(long(0)?),
        "frac" => number(real(0)? - real(0)?.floor()),
        "low" => ExpressionValue::Integer(long(0)? & 0xFF),
        "high" => ExpressionValue::Integer((long(0)? >> 8) & 0xFF),
        "word" => ExpressionValue::Integer(long(0)? & 0xFFFF),
        "rnd" if args.is_empty() => ExpressionValue::Integer(rng.integer(0, 0x10000)),
        "rnd" => ExpressionValue::Integer(rng.integer(long(0)?, long(1)?)),
        "length" | "len" => ExpressionValue::Integer(args[0].as_string()?.chars().count() as i64),
        "left" => {
            let text = args[0].as_string()?;
            let count = clamp_count(long(1)?, text.chars().count());
            ExpressionValue::Str(text.chars().take(count).collect())
        }
        "right" => {
            let text = args[0].as_string()?;
            let total = text.chars().count();
            let count = clamp_count(long(1)?, total);
            ExpressionValue::Str(text.chars().skip(total - count).collect())
        }
        "substr" => {
            let text = args[0].as_string()?;
            let total = text.chars().count();
            let start = clamp_count(long(1)?, total);
            let count = clamp_count(long(2)?, total - start);
            ExpressionValue::Str(text.chars().skip(start).take(count).collect())
        }
        "fill" => {
            let text = args[0].as_string()?;
            let count = long(1)?.max(0) as usize;
            if text.chars().count().saturating_mul(count) > 0x4000 {
                return Err(EvalError::new(
                    "The result of the fill() function would be longer than #4000 bytes.",
                ));
            }
            ExpressionValue::Str(text.repeat(count))
        }
        "lowercase" | "lcase" => ExpressionValue::Str(args[0].as_string()?.to_lowercase()),
        "uppercase" | "ucase" => ExpressionValue::Str(args[0].as_string()?.to_uppercase()),
        "str" => ExpressionValue::Str(args[0].as_string()?),
        "scraddr" => {
            let (line, col) = screen_position(long(0)?, long(1)?)?;
            let da = 0x4000 | (col >> 3) | (line << 5);
            ExpressionValue::Integer(
                ((da & 0xF81F) | ((da & 0x0700) >> 3) | ((da & 0x00E0) << 3)) & 0xFFFF,
            )
        }
        "attraddr" => {
            let (line, col) = screen_position(long(0)?, long(1)?)?;
            ExpressionValue::Integer(0x5800 + (line >> 3) * 32 + (col >> 3))
        }
        "ink" => ExpressionValue::Integer(long(0)? & 0x07),
        "paper" => ExpressionValue::Integer((long(0)? & 0x07) << 3),
        "bright" => ExpressionValue::Integer(if long(0)? == 0 { 0x00 } else { 0x40 }),
        "flash" => ExpressionValue::Integer(if long(0)? == 0 { 0x00 } else { 0x80 }),
        "attr" => {
            let mut value = (long(0)? & 0x07) | ((long(1)? & 0x07) << 3);
            if args.len() > 2 && long(2)? != 0 {
                value |= 0x40;
            }
            if args.len() > 3 && long(3)? != 0 {
                value |= 0x80;
            }
            ExpressionValue::Integer(value & 0xFF)
        }
        _ => return Err(EvalError::new(format!("Unknown function '{name}'"))),
    };
    Ok(value)
}

fn clamp_count(requested: i64, available: usize) -> usize {
    requested.clamp(0, available as i64) as usize
}

fn screen_position(line: i64, col: i64) -> Result<(i64, i64), EvalError> {
    if !(0..=191).contains(&line) {
        return Err(EvalError::new(format!(
            "The 'line' argument must be between 0 and 191. It cannot be {line}."
        )));
    }
    if !(0..=255).contains(&col) {
        return Err(EvalError::new(format!(
            "The 'col' argument must be between 0 and 255. It cannot be {col}."
        )));
    }
    Ok((line, col))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tokenizer::Span;

    fn call(name: &str, args: Vec<ExpressionValue>) -> ExpressionValue {
        let mut rng = SeededRandom::new(1);
        call_function(name, &args, &mut rng).expect("function result")
    }

    fn int(v: i64) -> ExpressionValue {
        ExpressionValue::Integer(v)
    }

    fn text(s: &str) -> ExpressionValue {
        ExpressionValue::Str(s.to_string())
    }

    #[test]
    fn computes_screen_addresses() {
        assert_eq!(call("scraddr", vec![int(0), int(0)]), int(0x4000));
        assert_eq!(call("scraddr", vec![int(1), int(8)]), int(0x4101));
        assert_eq!(call("scraddr", vec![int(8), int(0)]), int(0x4020));
        assert_eq!(call("attraddr", vec![int(8), int(16)]), int(0x5822));
        let mut rng = SeededRandom::new(1);
        assert!(call_function("scraddr", &[int(192), int(0)], &mut rng).is_err());
    }

    #[test]
    fn composes_attributes() {
        assert_eq!(call("attr", vec![int(1), int(2)]), int(0x11));
        assert_eq!(call("attr", vec![int(1), int(2), int(1), int(1)]), int(0xD1));
        assert_eq!(call("paper", vec![int(7)]), int(0x38));
    }

    #[test]
    fn selects_overloads_by_argument_kind() {
        assert_eq!(call("max", vec![int(3), int(5)]), int(5));
        assert_eq!(
            call("max", vec![ExpressionValue::Real(1.5), int(1)]),
            ExpressionValue::Real(1.5)
        );
        assert_eq!(call("abs", vec![int(-4)]), int(4));
        assert_eq!(call("floor", vec![ExpressionValue::Real(2.7)]), int(2));
        let mut rng = SeededRandom::new(1);
        let err = call_function("len", &[int(3)], &mut rng).expect_err("signature mismatch");
        assert!(err.message().contains("do not match"));
    }

    #[test]
    fn handles_string_functions() {
        assert_eq!(call("left", vec![text("hello"), int(2)]), text("he"));
        assert_eq!(call("right", vec![text("hello"), int(9)]), text("hello"));
        assert_eq!(call("substr", vec![text("hello"), int(1), int(3)]), text("ell"));
        assert_eq!(call("fill", vec![text("ab"), int(3)]), text("ababab"));
        assert_eq!(call("ucase", vec![text("ab")]), text("AB"));
        assert_eq!(call("len", vec![text("abc")]), int(3));
        assert_eq!(call("str", vec![ExpressionValue::Bool(true)]), text("true"));
    }

    #[test]
    fn random_sequence_is_reproducible() {
        let mut first = SeededRandom::new(42);
        let mut second = SeededRandom::new(42);
        let a: Vec<_> = (0..4).map(|_| first.integer(0, 100)).collect();
        let b: Vec<_> = (0..4).map(|_| second.integer(0, 100)).collect();
        assert_eq!(a, b);
        assert!(a.iter().all(|v| (0..100).contains(v)));
        assert_eq!(SeededRandom::new(1).next(), 16807);
    }

    #[test]
    fn evaluates_macro_time_functions() {
        let span = Span::default();
        assert_eq!(eval_macro_time("isreg8", &Operand::Reg(Register::Xh, span)), Some(true));
        assert_eq!(eval_macro_time("isreg16std", &Operand::Reg(Register::Ix, span)), Some(false));
        assert_eq!(eval_macro_time("iscondition", &Operand::Reg(Register::C, span)), Some(true));
        assert_eq!(eval_macro_time("def", &Operand::None(span)), Some(false));
        assert_eq!(eval_macro_time("iscport", &Operand::CPort(span)), Some(true));
        assert_eq!(eval_macro_time("nosuch", &Operand::CPort(span)), None);
        assert!(is_macro_time_function("isregaf"));
        assert!(!is_macro_time_function("textof"));
    }
}
