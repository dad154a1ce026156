//! Compiler State
//!
//! Shared, read-mostly state threaded through compilation and analysis: the
//! table relation map, the function registry, the query's `time_now`, and the
//! per-compilation UDF/UDA id assignment.

use super::metadata::MetadataHandler;
use crate::types::Relation;
use crate::udf::{Registry, RegistryKey};
use std::cell::RefCell;
use std::collections::HashMap;

/// State for one compilation. UDF/UDA ids are assigned on first resolution
/// and stay stable for the lifetime of the compiled plan; they are the only
/// function reference used at execution time.
pub struct CompilerState<'r> {
    relation_map: HashMap<String, Relation>,
    registry: &'r Registry,
    time_now: i64,
    metadata: MetadataHandler,
    udf_ids: RefCell<HashMap<RegistryKey, i64>>,
    uda_ids: RefCell<HashMap<RegistryKey, i64>>,
}

impl<'r> CompilerState<'r> {
    pub fn new(registry: &'r Registry, relation_map: HashMap<String, Relation>, time_now: i64) -> Self {
        CompilerState {
            relation_map,
            registry,
            time_now,
            metadata: MetadataHandler::with_builtin_properties(),
            udf_ids: RefCell::new(HashMap::new()),
            uda_ids: RefCell::new(HashMap::new()),
        }
    }

    pub fn relation_map(&self) -> &HashMap<String, Relation> {
        &self.relation_map
    }

    pub fn registry(&self) -> &Registry {
        self.registry
    }

    pub fn time_now(&self) -> i64 {
        self.time_now
    }

    pub fn metadata(&self) -> &MetadataHandler {
        &self.metadata
    }

    /// The stable id for a scalar UDF signature within this compilation.
    pub fn udf_id(&self, key: RegistryKey) -> i64 {
        let mut ids = self.udf_ids.borrow_mut();
        let next = ids.len() as i64;
        *ids.entry(key).or_insert(next)
    }

    /// The stable id for a UDA signature within this compilation.
    pub fn uda_id(&self, key: RegistryKey) -> i64 {
        let mut ids = self.uda_ids.borrow_mut();
        let next = ids.len() as i64;
        *ids.entry(key).or_insert(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_id_assignment_is_stable() {
        let registry = Registry::with_builtins();
        let state = CompilerState::new(&registry, HashMap::new(), 0);

        let add = RegistryKey::new("add", vec![DataType::Int64, DataType::Int64]);
        let eq = RegistryKey::new("equals", vec![DataType::String, DataType::String]);

        let id_add = state.udf_id(add.clone());
        let id_eq = state.udf_id(eq);
        assert_ne!(id_add, id_eq);
        // Repeat lookups return the same id.
        assert_eq!(state.udf_id(add), id_add);
    }

    #[test]
    fn test_uda_ids_are_separate_space() {
        let registry = Registry::with_builtins();
        let state = CompilerState::new(&registry, HashMap::new(), 0);
        let count = RegistryKey::new("count", vec![DataType::Int64]);
        assert_eq!(state.uda_id(count.clone()), 0);
        assert_eq!(state.uda_id(count), 0);
    }
}
