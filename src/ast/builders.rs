//! AST Builder Helpers
//!
//! Shorthand constructors for assembling AST trees by hand. The external
//! parser produces the same shapes; these exist for tests and embedding.

use super::{
    AstExpr, AstExprKind, AstModule, AstStmt, BinOpKind, BoolOpKind, CompareOpKind, Param,
    SourceLocation, UnaryOpKind,
};

fn at_origin(kind: AstExprKind) -> AstExpr {
    AstExpr { kind, loc: SourceLocation::default() }
}

pub fn module(body: Vec<AstStmt>) -> AstModule {
    AstModule { body }
}

pub fn name(id: &str) -> AstExpr {
    at_origin(AstExprKind::Name(id.to_string()))
}

pub fn str_lit(s: &str) -> AstExpr {
    at_origin(AstExprKind::Str(s.to_string()))
}

pub fn int_lit(v: i64) -> AstExpr {
    at_origin(AstExprKind::Int(v))
}

pub fn float_lit(v: f64) -> AstExpr {
    at_origin(AstExprKind::Float(v))
}

pub fn bool_lit(v: bool) -> AstExpr {
    at_origin(AstExprKind::Bool(v))
}

pub fn none_lit() -> AstExpr {
    at_origin(AstExprKind::NoneLit)
}

pub fn list(elems: Vec<AstExpr>) -> AstExpr {
    at_origin(AstExprKind::List(elems))
}

pub fn tuple(elems: Vec<AstExpr>) -> AstExpr {
    at_origin(AstExprKind::Tuple(elems))
}

pub fn call(func: AstExpr, args: Vec<AstExpr>, kwargs: Vec<(&str, AstExpr)>) -> AstExpr {
    at_origin(AstExprKind::Call {
        func: Box::new(func),
        args,
        kwargs: kwargs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    })
}

pub fn attribute(value: AstExpr, attr: &str) -> AstExpr {
    at_origin(AstExprKind::Attribute { value: Box::new(value), attr: attr.to_string() })
}

pub fn subscript(value: AstExpr, index: AstExpr) -> AstExpr {
    at_origin(AstExprKind::Subscript { value: Box::new(value), index: Box::new(index) })
}

pub fn binop(op: BinOpKind, left: AstExpr, right: AstExpr) -> AstExpr {
    at_origin(AstExprKind::BinOp { op, left: Box::new(left), right: Box::new(right) })
}

pub fn unary(op: UnaryOpKind, operand: AstExpr) -> AstExpr {
    at_origin(AstExprKind::UnaryOp { op, operand: Box::new(operand) })
}

pub fn boolop(op: BoolOpKind, values: Vec<AstExpr>) -> AstExpr {
    at_origin(AstExprKind::BoolOp { op, values })
}

pub fn compare(left: AstExpr, ops: Vec<CompareOpKind>, comparators: Vec<AstExpr>) -> AstExpr {
    at_origin(AstExprKind::Compare { left: Box::new(left), ops, comparators })
}

/// `left == right`
pub fn eq(left: AstExpr, right: AstExpr) -> AstExpr {
    compare(left, vec![CompareOpKind::Eq], vec![right])
}

pub fn assign(target: AstExpr, value: AstExpr) -> AstStmt {
    AstStmt::Assign { target, value, loc: SourceLocation::default() }
}

pub fn expr_stmt(expr: AstExpr) -> AstStmt {
    AstStmt::Expression { expr }
}

pub fn func_def(name: &str, params: Vec<Param>, body: Vec<AstStmt>) -> AstStmt {
    AstStmt::FunctionDef {
        name: name.to_string(),
        params,
        body,
        loc: SourceLocation::default(),
    }
}

pub fn ret(value: Option<AstExpr>) -> AstStmt {
    AstStmt::Return { value, loc: SourceLocation::default() }
}

pub fn param(name: &str) -> Param {
    Param { name: name.to_string(), annotation: None, default: None, kwonly: false }
}

pub fn kw_param(name: &str, default: Option<AstExpr>) -> Param {
    Param { name: name.to_string(), annotation: None, default, kwonly: true }
}
