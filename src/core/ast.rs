// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Syntax tree produced by the parser: one [`AssemblyLine`] per source line.

use crate::core::tokenizer::Span;
use crate::z80::{Condition, Mnemonic, Register};

#[derive(Debug, Clone)]
pub struct Label {
    pub name: String,
    pub span: Span,
}

/// A parsed source line with its position information.
#[derive(Debug, Clone)]
pub struct AssemblyLine {
    pub file_index: usize,
    /// One-based line number within its file.
    pub line: u32,
    pub start_position: usize,
    pub end_position: usize,
    pub start_column: usize,
    pub end_column: usize,
    /// Source text from the first token to the end of the line.
    pub source_text: String,
    pub label: Option<Label>,
    pub comment: Option<String>,
    /// `{{name}}` references found anywhere on the line.
    pub macro_params: Vec<String>,
    pub kind: LineKind,
}

impl AssemblyLine {
    pub fn is_statement(&self) -> bool {
        matches!(self.kind, LineKind::Statement(_))
    }

    pub fn statement(&self) -> Option<&Statement> {
        match &self.kind {
            LineKind::Statement(stmt) => Some(stmt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LineKind {
    LabelOnly,
    CommentOnly,
    Pragma(Pragma),
    Directive(Directive),
    Instruction(Instruction),
    Statement(Statement),
    MacroOrStructInvocation {
        name: String,
        args: Vec<MacroArg>,
    },
    /// `-> .defb ...` inside a struct invocation.
    FieldAssignment(Pragma),
    /// A line that consists of a single `{{param}}` reference.
    MacroParam(String),
}

/// One argument of a macro or struct invocation, with its source text.
#[derive(Debug, Clone)]
pub struct MacroArg {
    pub operand: Operand,
    pub text: String,
}

#[derive(Debug, Clone)]
pub enum Pragma {
    Org(Expr),
    Bank {
        bank: Expr,
        offset: Option<Expr>,
    },
    Xorg(Expr),
    Ent(Expr),
    Xent(Expr),
    Equ(Expr),
    Var(Expr),
    Disp(Expr),
    DefB(Vec<Expr>),
    DefW(Vec<Expr>),
    DefM(Expr),
    DefN(Expr),
    DefC(Expr),
    DefH(Expr),
    DefS {
        count: Expr,
        fill: Option<Expr>,
    },
    FillB {
        count: Expr,
        fill: Expr,
    },
    FillW {
        count: Expr,
        fill: Expr,
    },
    Skip {
        target: Expr,
        fill: Option<Expr>,
    },
    Align(Option<Expr>),
    Trace {
        hex: bool,
        values: Vec<Expr>,
    },
    RndSeed(Option<Expr>),
    DefG(String),
    DefGx(Expr),
    Error(Expr),
    IncludeBin {
        file: Expr,
        offset: Option<Expr>,
        length: Option<Expr>,
    },
    CompareBin {
        file: Expr,
        offset: Option<Expr>,
        length: Option<Expr>,
    },
    InjectOpt(Vec<String>),
    Model(String),
    OnSuccess(String),
    /// Accepted for compatibility; has no effect.
    Extern,
}

impl Pragma {
    /// Pragmas that bind the line label themselves.
    pub fn sets_label(&self) -> bool {
        matches!(self, Pragma::Equ(_) | Pragma::Var(_) | Pragma::Org(_))
    }

    /// Pragmas accepted after `->` in a struct invocation.
    pub fn is_byte_emitting(&self) -> bool {
        matches!(
            self,
            Pragma::DefB(_)
                | Pragma::DefW(_)
                | Pragma::DefM(_)
                | Pragma::DefN(_)
                | Pragma::DefC(_)
                | Pragma::DefH(_)
                | Pragma::DefS { .. }
                | Pragma::FillB { .. }
                | Pragma::FillW { .. }
                | Pragma::DefG(_)
                | Pragma::DefGx(_)
        )
    }
}

#[derive(Debug, Clone)]
pub enum Directive {
    Include(String),
    Define(String),
    Undef(String),
    IfDef(String),
    IfNDef(String),
    IfMod(String),
    IfNMod(String),
    If(Expr),
    Else,
    EndIf,
    Line {
        line: Expr,
        file: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    pub operands: Vec<Operand>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Statement {
    Macro(Vec<String>),
    EndMacro,
    Loop(Expr),
    EndLoop,
    While(Expr),
    EndWhile,
    Repeat,
    Until(Expr),
    Proc,
    EndProc,
    If(Expr),
    IfUsed(Expr),
    IfNotUsed(Expr),
    Elif(Expr),
    Else,
    EndIf,
    Break,
    Continue,
    Module(Option<String>),
    EndModule,
    Struct,
    EndStruct,
    For {
        var: String,
        from: Expr,
        to: Expr,
        step: Option<Expr>,
    },
    Next,
    Local(Vec<String>),
}

impl Statement {
    pub fn name(&self) -> &'static str {
        match self {
            Statement::Macro(_) => ".macro",
            Statement::EndMacro => ".endm",
            Statement::Loop(_) => ".loop",
            Statement::EndLoop => ".endl",
            Statement::While(_) => ".while",
            Statement::EndWhile => ".endw",
            Statement::Repeat => ".repeat",
            Statement::Until(_) => ".until",
            Statement::Proc => ".proc",
            Statement::EndProc => ".endp",
            Statement::If(_) => ".if",
            Statement::IfUsed(_) => ".ifused",
            Statement::IfNotUsed(_) => ".ifnused",
            Statement::Elif(_) => ".elif",
            Statement::Else => ".else",
            Statement::EndIf => ".endif",
            Statement::Break => ".break",
            Statement::Continue => ".continue",
            Statement::Module(_) => ".module",
            Statement::EndModule => ".endmodule",
            Statement::Struct => ".struct",
            Statement::EndStruct => ".ends",
            Statement::For { .. } => ".for",
            Statement::Next => ".next",
            Statement::Local(_) => ".local",
        }
    }

    /// Statements that bind the line label themselves.
    pub fn sets_label(&self) -> bool {
        matches!(self, Statement::Macro(_) | Statement::Struct)
    }

    /// Block statements that own a body closed by a terminator.
    pub fn is_block(&self) -> bool {
        matches!(
            self,
            Statement::Macro(_)
                | Statement::Loop(_)
                | Statement::While(_)
                | Statement::Repeat
                | Statement::Proc
                | Statement::If(_)
                | Statement::IfUsed(_)
                | Statement::IfNotUsed(_)
                | Statement::Module(_)
                | Statement::Struct
                | Statement::For { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub enum Operand {
    Reg(Register, Span),
    /// `(bc)`, `(de)`, `(hl)`, `(sp)`
    RegIndirect(Register, Span),
    /// `(c)`
    CPort(Span),
    /// `(ix)`, `(iy+d)`, `(ix-d)`
    Indexed {
        reg: Register,
        minus: bool,
        disp: Option<Expr>,
        span: Span,
    },
    /// `(nn)`
    MemIndirect(Expr, Span),
    Expr(Expr),
    Condition(Condition, Span),
    /// `$<none>$` or an omitted macro argument.
    None(Span),
}

impl Operand {
    pub fn span(&self) -> Span {
        match self {
            Operand::Reg(_, span)
            | Operand::RegIndirect(_, span)
            | Operand::CPort(span)
            | Operand::MemIndirect(_, span)
            | Operand::Condition(_, span)
            | Operand::None(span) => *span,
            Operand::Indexed { span, .. } => *span,
            Operand::Expr(expr) => expr.span(),
        }
    }

    pub fn reg(&self) -> Option<Register> {
        match self {
            Operand::Reg(reg, _) => Some(*reg),
            _ => None,
        }
    }

    pub fn is_reg(&self, reg: Register) -> bool {
        self.reg() == Some(reg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    BitNot,
    LogicNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    CaseEq,
    Ne,
    CaseNe,
    Lt,
    Le,
    Gt,
    Ge,
    Min,
    Max,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Eq => "==",
            BinaryOp::CaseEq => "===",
            BinaryOp::Ne => "!=",
            BinaryOp::CaseNe => "!==",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Min => "<?",
            BinaryOp::Max => ">?",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Integer(i64, Span),
    Real(f64, Span),
    Bool(bool, Span),
    Str(String, Span),
    CurrentAddress(Span),
    LoopCounter(Span),
    Symbol {
        name: String,
        from_global: bool,
        span: Span,
    },
    MacroParam(String, Span),
    Call {
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    /// Macro-time function such as `isreg8({{p}})`, evaluated on an operand.
    MacroTimeCall {
        name: String,
        operand: Box<Operand>,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Integer(_, span)
            | Expr::Real(_, span)
            | Expr::Bool(_, span)
            | Expr::Str(_, span)
            | Expr::CurrentAddress(span)
            | Expr::LoopCounter(span)
            | Expr::MacroParam(_, span) => *span,
            Expr::Symbol { span, .. }
            | Expr::Call { span, .. }
            | Expr::MacroTimeCall { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Ternary { span, .. } => *span,
        }
    }

    /// Visit every symbol reference in the expression.
    pub fn for_each_symbol<'a, F>(&'a self, f: &mut F)
    where
        F: FnMut(&'a str, bool),
    {
        match self {
            Expr::Symbol {
                name, from_global, ..
            } => f(name, *from_global),
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.for_each_symbol(f);
                }
            }
            Expr::Unary { expr, .. } => expr.for_each_symbol(f),
            Expr::Binary { left, right, .. } => {
                left.for_each_symbol(f);
                right.for_each_symbol(f);
            }
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
                ..
            } => {
                cond.for_each_symbol(f);
                then_expr.for_each_symbol(f);
                else_expr.for_each_symbol(f);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Expr {
        Expr::Symbol {
            name: name.to_string(),
            from_global: false,
            span: Span::default(),
        }
    }

    #[test]
    fn collects_symbols_in_order() {
        let expr = Expr::Ternary {
            cond: Box::new(sym("a")),
            then_expr: Box::new(Expr::Binary {
                op: BinaryOp::Add,
                left: Box::new(sym("b")),
                right: Box::new(Expr::Integer(1, Span::default())),
                span: Span::default(),
            }),
            else_expr: Box::new(Expr::Call {
                name: "max".to_string(),
                args: vec![sym("c")],
                span: Span::default(),
            }),
            span: Span::default(),
        };
        let mut names = Vec::new();
        expr.for_each_symbol(&mut |name, _| names.push(name.to_string()));
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn classifies_statements() {
        assert!(Statement::Macro(vec![]).sets_label());
        assert!(Statement::Loop(sym("n")).is_block());
        assert!(!Statement::EndLoop.is_block());
        assert_eq!(Statement::EndStruct.name(), ".ends");
    }
}
