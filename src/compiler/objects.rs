//! QL Objects
//!
//! First-class values produced while walking the AST: IR expressions,
//! dataframes (operators), callables, modules, and collections. These are
//! what the variable table binds names to.

use super::var_table::VarTableRef;
use crate::ast::{AstExpr, AstStmt};
use crate::ir::NodeId;
use crate::udf::UdtfSpec;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// A first-class compilation value.
#[derive(Clone, Debug)]
pub enum QLObject {
    /// An IR expression node.
    Expr(NodeId),
    /// A dataframe, i.e. an IR operator producing rows.
    Dataframe(NodeId),
    /// The metadata context of a dataframe (`df.ctx`).
    Ctx(NodeId),
    /// A callable.
    Func(Rc<FuncObject>),
    /// A namespace of members.
    Module(Rc<ModuleObject>),
    List(Vec<QLObject>),
    TupleObj(Vec<QLObject>),
    None,
}

impl QLObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            QLObject::Expr(_) => "expression",
            QLObject::Dataframe(_) => "DataFrame",
            QLObject::Ctx(_) => "metadata context",
            QLObject::Func(_) => "function",
            QLObject::Module(_) => "module",
            QLObject::List(_) => "list",
            QLObject::TupleObj(_) => "tuple",
            QLObject::None => "None",
        }
    }
}

/// A namespace object.
#[derive(Debug)]
pub struct ModuleObject {
    pub name: String,
    members: HashMap<String, QLObject>,
}

impl ModuleObject {
    pub fn new(name: &str, members: HashMap<String, QLObject>) -> Self {
        ModuleObject { name: name.to_string(), members }
    }

    pub fn member(&self, name: &str) -> Option<QLObject> {
        self.members.get(name).cloned()
    }
}

/// A parameter of a callable.
#[derive(Clone, Debug)]
pub struct FuncParam {
    pub name: String,
    pub annotation: Option<String>,
    pub default: Option<ParamDefault>,
    pub kwonly: bool,
}

impl FuncParam {
    pub fn required(name: &str) -> Self {
        FuncParam { name: name.to_string(), annotation: None, default: None, kwonly: false }
    }

    pub fn optional(name: &str, default: QLObject) -> Self {
        FuncParam {
            name: name.to_string(),
            annotation: None,
            default: Some(ParamDefault::Object(default)),
            kwonly: false,
        }
    }

    pub fn kw_optional(name: &str, default: QLObject) -> Self {
        FuncParam {
            name: name.to_string(),
            annotation: None,
            default: Some(ParamDefault::Object(default)),
            kwonly: true,
        }
    }
}

/// Default values: builtins carry pre-built objects, user functions carry the
/// default expression, evaluated at call time.
#[derive(Clone, Debug)]
pub enum ParamDefault {
    Object(QLObject),
    Ast(AstExpr),
}

/// The builtin callables exposed to queries.
#[derive(Clone, Debug)]
pub enum Builtin {
    /// `DataFrame(table, select=None, start_time=None, end_time=None)`
    DataFrame,
    /// `display(df, name='output')`
    Display,
    /// `df.groupby(by)`
    GroupBy,
    /// `df.agg(out=(col, fn), ...)`
    Agg,
    /// `df.merge(right, how=..., left_on=..., right_on=..., suffixes=...)`
    Merge,
    /// `df.drop(columns)`
    Drop,
    /// `df.head(n)`
    Head,
    /// `df.append(other)`
    Append,
    /// `df.rolling(window, on='time_')`
    Rolling,
    /// Compile-time function (`now`, `seconds`, ...): materializes a Func IR
    /// node folded later by the range rule.
    CompileTimeFn(&'static str),
    /// A reference to a registered aggregate, passed by name into `agg`.
    UdaRef(String),
    /// A table-producing function constructor.
    Udtf(Arc<UdtfSpec>),
}

/// What a `FuncObject` does when called.
#[derive(Clone, Debug)]
pub enum FuncKind {
    Builtin(Builtin),
    UserDefined {
        body: Vec<AstStmt>,
        closure: VarTableRef,
    },
}

/// A callable object: parameter list plus implementation. Dataframe methods
/// carry their receiver.
#[derive(Debug)]
pub struct FuncObject {
    pub name: String,
    pub params: Vec<FuncParam>,
    /// Allow keyword arguments beyond the declared parameters (`agg`).
    pub accepts_arbitrary_kwargs: bool,
    pub receiver: Option<NodeId>,
    pub kind: FuncKind,
}

impl FuncObject {
    pub fn builtin(name: &str, params: Vec<FuncParam>, builtin: Builtin) -> Rc<Self> {
        Rc::new(FuncObject {
            name: name.to_string(),
            params,
            accepts_arbitrary_kwargs: false,
            receiver: None,
            kind: FuncKind::Builtin(builtin),
        })
    }

    pub fn method(name: &str, params: Vec<FuncParam>, builtin: Builtin, receiver: NodeId) -> Rc<Self> {
        Rc::new(FuncObject {
            name: name.to_string(),
            params,
            accepts_arbitrary_kwargs: matches!(builtin, Builtin::Agg),
            receiver: Some(receiver),
            kind: FuncKind::Builtin(builtin),
        })
    }
}
