//! # Function Registry
//!
//! UDF / UDA / UDTF registration and lookup. Functions are resolved by
//! `(name, argument type vector)` during analysis and referred to by a small
//! integer id at execution time.
//!
//! Scalar UDFs carry two execution shapes (see the expression evaluators):
//! a per-row `exec` over `ScalarValue`s and a batch `exec_batch` over arrow
//! arrays. Aggregates carry the `update / merge / finalize` contract plus a
//! serialized partial form so a partial aggregate can cross the network to a
//! finalizing aggregate.

pub mod builtins;

use crate::types::{DataType, Relation, ScalarValue};
use arrow::array::ArrayRef;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UdfError {
    #[error("Wrong number of arguments to '{0}': expected {1}, got {2}")]
    WrongArity(String, usize, usize),

    #[error("Argument type mismatch in '{0}': {1}")]
    ArgTypeMismatch(String, String),

    #[error("Function execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Bad partial aggregate state: {0}")]
    BadPartialState(String),
}

// ============================================================================
// Function context
// ============================================================================

/// Cluster metadata visible to conversion UDFs (`upid_to_service_name` etc).
#[derive(Debug, Default)]
pub struct MetadataState {
    pub upid_to_service: HashMap<u128, String>,
    pub upid_to_pod: HashMap<u128, String>,
}

/// Per-query context handed to every function invocation.
#[derive(Clone, Default)]
pub struct FunctionContext {
    pub metadata: Arc<MetadataState>,
}

impl FunctionContext {
    pub fn new(metadata: Arc<MetadataState>) -> Self {
        FunctionContext { metadata }
    }
}

// ============================================================================
// Scalar UDFs
// ============================================================================

/// A scalar user-defined function instance.
///
/// One instance is created per query per use; `init` runs once with the
/// configured literal arguments before any `exec` call. `exec` must be pure.
pub trait ScalarUdf: Send {
    fn init(&mut self, _ctx: &FunctionContext, _args: &[ScalarValue]) -> Result<(), UdfError> {
        Ok(())
    }

    /// Evaluate one row.
    fn exec(&self, ctx: &FunctionContext, args: &[ScalarValue]) -> Result<ScalarValue, UdfError>;

    /// Evaluate a whole column batch with arrow-native kernels.
    fn exec_batch(
        &self,
        ctx: &FunctionContext,
        args: &[ArrayRef],
        num_rows: usize,
    ) -> Result<ArrayRef, UdfError>;
}

pub type ScalarUdfFactory = Arc<dyn Fn() -> Box<dyn ScalarUdf> + Send + Sync>;

/// Registered definition of a scalar UDF overload.
#[derive(Clone)]
pub struct ScalarUdfDef {
    pub name: String,
    pub arg_types: Vec<DataType>,
    pub return_type: DataType,
    /// Types of the optional one-time `init` arguments (empty when no init).
    pub init_arg_types: Vec<DataType>,
    pub factory: ScalarUdfFactory,
}

impl ScalarUdfDef {
    pub fn make(&self) -> Box<dyn ScalarUdf> {
        (self.factory)()
    }
}

impl fmt::Debug for ScalarUdfDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarUdfDef")
            .field("name", &self.name)
            .field("arg_types", &self.arg_types)
            .field("return_type", &self.return_type)
            .finish()
    }
}

// ============================================================================
// UDAs
// ============================================================================

/// A user-defined aggregate instance. Owns its state; `finalize` moves the
/// state into the output. Instances are never reused across queries.
pub trait Uda: Send {
    fn init(&mut self, _ctx: &FunctionContext, _args: &[ScalarValue]) -> Result<(), UdfError> {
        Ok(())
    }

    /// Fold one row of update arguments into the state.
    fn update(&mut self, ctx: &FunctionContext, args: &[ScalarValue]) -> Result<(), UdfError>;

    /// Merge a serialized partial produced by `partial()` on another instance.
    fn merge_partial(&mut self, partial: &ScalarValue) -> Result<(), UdfError>;

    /// Serialize the current state for a downstream finalizing aggregate.
    fn partial(&self) -> Result<ScalarValue, UdfError>;

    /// Produce the final output value.
    fn finalize(&self) -> Result<ScalarValue, UdfError>;
}

pub type UdaFactory = Arc<dyn Fn() -> Box<dyn Uda> + Send + Sync>;

/// Registered definition of a UDA overload.
#[derive(Clone)]
pub struct UdaDef {
    pub name: String,
    pub update_arg_types: Vec<DataType>,
    /// Type of the serialized partial value crossing the network.
    pub partial_type: DataType,
    pub finalize_type: DataType,
    pub init_arg_types: Vec<DataType>,
    pub factory: UdaFactory,
}

impl UdaDef {
    pub fn make(&self) -> Box<dyn Uda> {
        (self.factory)()
    }
}

impl fmt::Debug for UdaDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdaDef")
            .field("name", &self.name)
            .field("update_arg_types", &self.update_arg_types)
            .field("finalize_type", &self.finalize_type)
            .finish()
    }
}

// ============================================================================
// UDTFs
// ============================================================================

/// Where a UDTF source is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdtfExecutor {
    /// Run on exactly one Kelvin (lowest address wins).
    OneKelvin,
    /// Run only on PEMs whose asid matches the `upid` argument.
    SubsetPem,
    /// Run everywhere, unless pinned by an `agent_uid` argument.
    AllAgents,
}

#[derive(Debug, Clone)]
pub struct UdtfArg {
    pub name: String,
    pub data_type: DataType,
    pub required: bool,
}

pub type UdtfGenerator =
    Arc<dyn Fn(&FunctionContext, &HashMap<String, ScalarValue>) -> Vec<Vec<ScalarValue>> + Send + Sync>;

/// Registered definition of a table-producing function.
#[derive(Clone)]
pub struct UdtfSpec {
    pub name: String,
    pub args: Vec<UdtfArg>,
    pub relation: Relation,
    pub executor: UdtfExecutor,
    pub generator: UdtfGenerator,
}

impl fmt::Debug for UdtfSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdtfSpec")
            .field("name", &self.name)
            .field("executor", &self.executor)
            .field("relation", &self.relation)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Key for overload resolution: a name plus the argument type vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub name: String,
    pub arg_types: Vec<DataType>,
}

impl RegistryKey {
    pub fn new(name: &str, arg_types: Vec<DataType>) -> Self {
        RegistryKey { name: name.to_string(), arg_types }
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.arg_types.iter().map(|t| t.to_string()).collect();
        write!(f, "{}({})", self.name, args.join(","))
    }
}

/// The process-wide function registry. Read-only after startup.
#[derive(Default)]
pub struct Registry {
    udfs: HashMap<RegistryKey, Arc<ScalarUdfDef>>,
    udas: HashMap<RegistryKey, Arc<UdaDef>>,
    udtfs: HashMap<String, Arc<UdtfSpec>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// A registry pre-loaded with the builtin scalar, aggregate, and table
    /// functions.
    pub fn with_builtins() -> Self {
        let mut registry = Registry::new();
        builtins::register_scalar_builtins(&mut registry);
        builtins::register_uda_builtins(&mut registry);
        builtins::register_udtf_builtins(&mut registry);
        registry
    }

    pub fn register_udf(&mut self, def: ScalarUdfDef) {
        let key = RegistryKey::new(&def.name, def.arg_types.clone());
        self.udfs.insert(key, Arc::new(def));
    }

    pub fn register_uda(&mut self, def: UdaDef) {
        let key = RegistryKey::new(&def.name, def.update_arg_types.clone());
        self.udas.insert(key, Arc::new(def));
    }

    pub fn register_udtf(&mut self, spec: UdtfSpec) {
        self.udtfs.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn get_udf(&self, name: &str, arg_types: &[DataType]) -> Option<Arc<ScalarUdfDef>> {
        self.udfs
            .get(&RegistryKey::new(name, arg_types.to_vec()))
            .cloned()
    }

    pub fn get_uda(&self, name: &str, arg_types: &[DataType]) -> Option<Arc<UdaDef>> {
        self.udas
            .get(&RegistryKey::new(name, arg_types.to_vec()))
            .cloned()
    }

    pub fn get_udtf(&self, name: &str) -> Option<Arc<UdtfSpec>> {
        self.udtfs.get(name).cloned()
    }

    pub fn udtf_names(&self) -> Vec<&str> {
        self.udtfs.keys().map(|s| s.as_str()).collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("udfs", &self.udfs.len())
            .field("udas", &self.udas.len())
            .field("udtfs", &self.udtfs.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup_by_signature() {
        let registry = Registry::with_builtins();

        let add_int = registry.get_udf("add", &[DataType::Int64, DataType::Int64]);
        assert!(add_int.is_some());
        assert_eq!(add_int.unwrap().return_type, DataType::Int64);

        let add_float = registry.get_udf("add", &[DataType::Float64, DataType::Float64]);
        assert!(add_float.is_some());
        assert_eq!(add_float.unwrap().return_type, DataType::Float64);

        // No mixed-type overload is registered.
        assert!(registry
            .get_udf("add", &[DataType::Int64, DataType::Float64])
            .is_none());
    }

    #[test]
    fn test_uda_lookup() {
        let registry = Registry::with_builtins();
        let count = registry.get_uda("count", &[DataType::Int64]).unwrap();
        assert_eq!(count.finalize_type, DataType::Int64);
        assert!(registry.get_uda("count", &[]).is_none());
    }

    #[test]
    fn test_udtf_lookup() {
        let registry = Registry::with_builtins();
        let spec = registry.get_udtf("ServiceUpTime").unwrap();
        assert_eq!(spec.executor, UdtfExecutor::OneKelvin);
        assert!(registry.get_udtf("NoSuchUdtf").is_none());
    }

    #[test]
    fn test_registry_key_display() {
        let key = RegistryKey::new("equals", vec![DataType::String, DataType::String]);
        assert_eq!(key.to_string(), "equals(STRING,STRING)");
    }
}
