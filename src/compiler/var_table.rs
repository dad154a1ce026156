//! Variable Table
//!
//! Lexically scoped bindings produced during compilation. A child scope
//! chains to its parent; lookups walk the chain, writes always hit the
//! innermost scope.

use super::objects::QLObject;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub type VarTableRef = Rc<RefCell<VarTable>>;

#[derive(Default, Debug)]
pub struct VarTable {
    parent: Option<VarTableRef>,
    table: HashMap<String, QLObject>,
}

impl VarTable {
    /// A table with no parent scope.
    pub fn create() -> VarTableRef {
        Rc::new(RefCell::new(VarTable::default()))
    }

    /// A child scope chained to `parent`.
    pub fn create_child(parent: &VarTableRef) -> VarTableRef {
        Rc::new(RefCell::new(VarTable {
            parent: Some(Rc::clone(parent)),
            table: HashMap::new(),
        }))
    }

    /// Search this scope, then the parent chain.
    pub fn lookup(&self, name: &str) -> Option<QLObject> {
        if let Some(obj) = self.table.get(name) {
            return Some(obj.clone());
        }
        self.parent.as_ref().and_then(|p| p.borrow().lookup(name))
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Bind in the innermost scope.
    pub fn add(&mut self, name: &str, object: QLObject) {
        self.table.insert(name.to_string(), object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_parent_chain() {
        let root = VarTable::create();
        root.borrow_mut().add("df", QLObject::Dataframe(7));

        let child = VarTable::create_child(&root);
        assert!(matches!(
            child.borrow().lookup("df"),
            Some(QLObject::Dataframe(7))
        ));
        assert!(child.borrow().lookup("missing").is_none());
    }

    #[test]
    fn test_writes_hit_innermost_scope() {
        let root = VarTable::create();
        root.borrow_mut().add("x", QLObject::Dataframe(1));

        let child = VarTable::create_child(&root);
        child.borrow_mut().add("x", QLObject::Dataframe(2));

        assert!(matches!(child.borrow().lookup("x"), Some(QLObject::Dataframe(2))));
        // Parent binding is shadowed, not overwritten.
        assert!(matches!(root.borrow().lookup("x"), Some(QLObject::Dataframe(1))));
    }
}
