// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Target-independent assembler core.
//!
//! # Components
//!
//! - [`text_utils`] - Text processing utilities (cursor, identifiers, comments)
//! - [`tokenizer`] - Token scanning with spans
//! - [`ast`] - Parsed line model
//! - [`parser`] - Line, operand and expression parsing
//! - [`expr`] - Expression values and evaluation
//! - [`functions`] - Built-in and macro-time functions
//! - [`symbol_table`] - Symbols, local scopes and the module tree
//! - [`segment`] - Binary output segments
//! - [`preprocess`] - Includes and conditional directives
//! - [`assembler`] - Diagnostics and listing output

pub mod assembler;
pub mod ast;
pub mod expr;
pub mod functions;
pub mod parser;
pub mod preprocess;
pub mod segment;
pub mod symbol_table;
pub mod text_utils;
pub mod tokenizer;

pub use expr::{eval_expr, EvalContext, EvalError, ExpressionValue};
pub use parser::{parse_program, ParseError};
pub use tokenizer::{Span, Token, TokenKind, Tokenizer};
