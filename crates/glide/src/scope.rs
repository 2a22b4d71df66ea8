use std::{cell::RefCell, rc::Rc};

use ahash::AHashMap;

use crate::node::NodeRef;

/// One level of the symbol environment.
///
/// Lookup walks parent links; definition always lands in the innermost
/// level. Values are shared node handles, so assigning through a binding
/// found in an outer level mutates the node every alias sees.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scope(Rc<RefCell<ScopeData>>);

#[derive(Debug, Default)]
struct ScopeData {
    table: AHashMap<String, NodeRef>,
    parent: Option<Scope>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh inner level whose lookups fall through to `self`.
    pub fn child(&self) -> Self {
        Self(Rc::new(RefCell::new(ScopeData {
            table: AHashMap::new(),
            parent: Some(self.clone()),
        })))
    }

    pub fn get(&self, name: &str) -> Option<NodeRef> {
        let data = self.0.borrow();
        if let Some(found) = data.table.get(name) {
            return Some(found.clone());
        }
        data.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Whether the name resolves anywhere on the chain.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn insert(&self, name: impl Into<String>, value: NodeRef) {
        self.0.borrow_mut().table.insert(name.into(), value);
    }

    /// Removes a binding from the innermost level that has it.
    pub fn remove(&self, name: &str) {
        let mut data = self.0.borrow_mut();
        if data.table.remove(name).is_some() {
            return;
        }
        if let Some(parent) = data.parent.clone() {
            drop(data);
            parent.remove(name);
        }
    }

    /// Clears the innermost table; used between loop iterations.
    pub fn clear_local(&self) {
        self.0.borrow_mut().table.clear();
    }

    /// Snapshot of the innermost table, keyed by name. This is what a
    /// function captures as its closure.
    pub fn snapshot(&self) -> AHashMap<String, NodeRef> {
        self.0.borrow().table.clone()
    }

    /// All names bound at the innermost level.
    pub fn local_names(&self) -> Vec<String> {
        self.0.borrow().table.keys().cloned().collect()
    }

    pub fn extend(&self, bindings: &AHashMap<String, NodeRef>) {
        let mut data = self.0.borrow_mut();
        for (name, value) in bindings {
            data.table.insert(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::make_int;

    #[test]
    fn lookup_walks_parents() {
        let root = Scope::new();
        root.insert("x", make_int(1, true).into_ref());
        let inner = root.child();
        assert_eq!(inner.get("x").unwrap().borrow().as_int(), Some(1));
        inner.insert("x", make_int(2, true).into_ref());
        assert_eq!(inner.get("x").unwrap().borrow().as_int(), Some(2));
        assert_eq!(root.get("x").unwrap().borrow().as_int(), Some(1));
    }

    #[test]
    fn shared_nodes_observe_mutation() {
        let root = Scope::new();
        let value = make_int(1, true).into_ref();
        root.insert("x", value.clone());
        let alias = root.get("x").unwrap();
        *value.borrow_mut() = make_int(9, true);
        assert_eq!(alias.borrow().as_int(), Some(9));
    }

    #[test]
    fn remove_reaches_outer_levels() {
        let root = Scope::new();
        root.insert("x", make_int(1, true).into_ref());
        let inner = root.child();
        inner.remove("x");
        assert!(root.get("x").is_none());
    }
}
