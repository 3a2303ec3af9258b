//! Field Expressions
//!
//! Visibility conditions, derived values and composition-branch predicates
//! are written as small expressions over other fields:
//!
//! ```text
//! ../category === 'movie' && len(#/tags) > 0
//! ```
//!
//! An expression is compiled once, when the schema is resolved. Compilation
//! parses it into an AST and replaces every pointer with an index into an
//! ordered dependency list. At runtime the caller resolves those
//! dependencies to values and evaluates the AST over that tuple, so
//! evaluation is a pure function of the observed values.

mod eval;
mod parser;
mod pointer;

pub use eval::{loose_eq, number as number_value, truthy};
pub use pointer::{
    escape_segment, join_pointer, split_pointer, unescape_segment, Anchor, PathPattern,
    RelativePointer, Segment,
};

use serde_json::Value;

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Functions callable from expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Sum,
    Min,
    Max,
    Includes,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "len" => Some(Self::Len),
            "sum" => Some(Self::Sum),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "includes" => Some(Self::Includes),
            _ => None,
        }
    }
}

/// Expression AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Pointer text as written. Only present before compilation binds it.
    Pointer(String),
    /// Index into the compiled dependency list.
    Dep(usize),
    Array(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
}

/// An expression bound to its dependency list.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    ast: Expr,
    dependencies: Vec<RelativePointer>,
}

impl CompiledExpr {
    /// Parse `source` and bind its pointers.
    pub fn compile(source: &str) -> Result<Self, String> {
        let ast = parser::parse(source)?;
        let mut dependencies = Vec::new();
        let ast = bind(ast, &mut dependencies)?;
        Ok(Self {
            source: source.to_string(),
            ast,
            dependencies,
        })
    }

    /// An expression that always yields `value`.
    pub fn constant(value: Value) -> Self {
        Self {
            source: value.to_string(),
            ast: Expr::Literal(value),
            dependencies: Vec::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Pointers observed by this expression, in tuple order.
    pub fn dependencies(&self) -> &[RelativePointer] {
        &self.dependencies
    }

    /// Evaluate with `observed[i]` holding the value behind dependency `i`.
    pub fn evaluate(&self, observed: &[Value]) -> Value {
        eval::evaluate(&self.ast, observed)
    }
}

fn bind(expr: Expr, dependencies: &mut Vec<RelativePointer>) -> Result<Expr, String> {
    Ok(match expr {
        Expr::Pointer(text) => {
            let pointer = RelativePointer::parse(&text)?;
            let index = match dependencies.iter().position(|p| *p == pointer) {
                Some(index) => index,
                None => {
                    dependencies.push(pointer);
                    dependencies.len() - 1
                }
            };
            Expr::Dep(index)
        }
        Expr::Array(items) => Expr::Array(
            items
                .into_iter()
                .map(|e| bind(e, dependencies))
                .collect::<Result<_, _>>()?,
        ),
        Expr::Unary(op, operand) => Expr::Unary(op, Box::new(bind(*operand, dependencies)?)),
        Expr::Binary(op, lhs, rhs) => Expr::Binary(
            op,
            Box::new(bind(*lhs, dependencies)?),
            Box::new(bind(*rhs, dependencies)?),
        ),
        Expr::Call(builtin, args) => Expr::Call(
            builtin,
            args.into_iter()
                .map(|e| bind(e, dependencies))
                .collect::<Result<_, _>>()?,
        ),
        other => other,
    })
}
