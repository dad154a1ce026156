//! # AST Input Contract
//!
//! The node kinds delivered by the upstream DSL parser. The parser itself is
//! external; this module defines the tree shape the compiler consumes and the
//! builder helpers used to assemble trees in tests.
//!
//! Every node carries a `SourceLocation`; compilation errors must reference
//! it.

pub mod builders;

use std::fmt;

/// Line/column position in the query source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLocation { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Top-level module: a sequence of statements.
#[derive(Debug, Clone, PartialEq)]
pub struct AstModule {
    pub body: Vec<AstStmt>,
}

/// Statements.
#[derive(Debug, Clone, PartialEq)]
pub enum AstStmt {
    /// A bare expression, e.g. `display(df, 'out')`.
    Expression { expr: AstExpr },
    /// `target = value`, where target is a name, subscript, or attribute.
    Assign { target: AstExpr, value: AstExpr, loc: SourceLocation },
    /// `def name(params): body`
    FunctionDef {
        name: String,
        params: Vec<Param>,
        body: Vec<AstStmt>,
        loc: SourceLocation,
    },
    /// `return value`; only legal inside a function body.
    Return { value: Option<AstExpr>, loc: SourceLocation },
}

impl AstStmt {
    pub fn loc(&self) -> SourceLocation {
        match self {
            AstStmt::Expression { expr } => expr.loc,
            AstStmt::Assign { loc, .. }
            | AstStmt::FunctionDef { loc, .. }
            | AstStmt::Return { loc, .. } => *loc,
        }
    }
}

/// A function definition parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    /// Annotation by type name (`"str"`, `"int"`, `"DataFrame"`), checked at
    /// call time.
    pub annotation: Option<String>,
    pub default: Option<AstExpr>,
    /// Keyword-only parameters must be passed by name.
    pub kwonly: bool,
}

/// Expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct AstExpr {
    pub kind: AstExprKind,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AstExprKind {
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    NoneLit,
    List(Vec<AstExpr>),
    Tuple(Vec<AstExpr>),
    Call {
        func: Box<AstExpr>,
        args: Vec<AstExpr>,
        kwargs: Vec<(String, AstExpr)>,
    },
    Attribute {
        value: Box<AstExpr>,
        attr: String,
    },
    Subscript {
        value: Box<AstExpr>,
        index: Box<AstExpr>,
    },
    BinOp {
        op: BinOpKind,
        left: Box<AstExpr>,
        right: Box<AstExpr>,
    },
    UnaryOp {
        op: UnaryOpKind,
        operand: Box<AstExpr>,
    },
    BoolOp {
        op: BoolOpKind,
        values: Vec<AstExpr>,
    },
    /// Chained comparisons: `left ops[0] comparators[0] ops[1] ...`.
    Compare {
        left: Box<AstExpr>,
        ops: Vec<CompareOpKind>,
        comparators: Vec<AstExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOpKind {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOpKind {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOpKind {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[cfg(test)]
mod tests {
    use super::builders::*;
    use super::*;

    #[test]
    fn test_builders_produce_located_nodes() {
        let e = call(name("DataFrame"), vec![str_lit("t")], vec![]);
        assert!(matches!(e.kind, AstExprKind::Call { .. }));

        let m = module(vec![assign(name("df"), e)]);
        assert_eq!(m.body.len(), 1);
    }

    #[test]
    fn test_stmt_loc_accessor() {
        let st = assign(name("a"), int_lit(1));
        assert_eq!(st.loc(), SourceLocation::default());
        let st = expr_stmt(name("a"));
        assert_eq!(st.loc(), SourceLocation::default());
    }
}
