//! Per-thread object cache.
//!
//! Each thread state keeps the values of the objects its functions have
//! loaded, keyed by the scope instance they belong to. Functions read
//! through it without touching the process registry; an absent entry is an
//! explicit `None`, never a sourcing request.

use crate::managed::ObjectValue;
use crate::process::{FunctionKey, ThreadKey};
use crate::registry::ObjectIdx;
use std::collections::HashMap;

/// Which instance of a scope an object belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ScopeInstance {
    Function(FunctionKey),
    Thread(ThreadKey),
    Process,
}

/// Stable identity of one managed object instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ObjectScopeId {
    pub(crate) object: ObjectIdx,
    pub(crate) scope: ScopeInstance,
}

#[derive(Default)]
pub(crate) struct ObjectCache {
    entries: HashMap<ObjectScopeId, ObjectValue>,
}

impl ObjectCache {
    pub(crate) fn get(&self, id: &ObjectScopeId) -> Option<&ObjectValue> {
        self.entries.get(id)
    }

    pub(crate) fn insert(&mut self, id: ObjectScopeId, value: ObjectValue) {
        self.entries.insert(id, value);
    }

    /// Keep only entries whose object is still usable
    pub(crate) fn retain(&mut self, mut usable: impl FnMut(&ObjectScopeId) -> bool) {
        self.entries.retain(|id, _| usable(id));
    }

    /// Drop the entries of a completed function
    pub(crate) fn evict_function(&mut self, function: FunctionKey) {
        self.entries
            .retain(|id, _| id.scope != ScopeInstance::Function(function));
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
