//! Resolved registrations: the static graph an office executes.

use crate::cache::{ObjectScopeId, ScopeInstance};
use crate::escalation::{EscalationHandler, EscalationProcedure};
use crate::function::FunctionLogic;
use crate::governance::GovernanceFactory;
use crate::managed::{
    Capabilities, ManagedObjectPool, ManagedObjectScope, ManagedObjectSource, RecycleFn,
};
use crate::process::{FunctionKey, ThreadKey};
use indexmap::IndexMap;
use kiln_core::EscalationTypes;
use kiln_team::Team;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct FunctionIdx(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ObjectIdx(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TeamIdx(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct GovernanceIdx(pub(crate) usize);

pub(crate) struct FunctionDef {
    pub(crate) name: String,
    pub(crate) logic: FunctionLogic,
    pub(crate) next: Option<FunctionIdx>,
    pub(crate) team: Option<TeamIdx>,
    /// Objects the function declared
    pub(crate) objects: Vec<ObjectIdx>,
    /// Declared objects plus their dependencies, dependencies first
    pub(crate) load: Vec<ObjectIdx>,
    pub(crate) handlers: EscalationProcedure,
    pub(crate) governance: Vec<GovernanceIdx>,
}

pub(crate) struct ObjectDef {
    pub(crate) name: String,
    pub(crate) source: Arc<dyn ManagedObjectSource>,
    pub(crate) scope: ManagedObjectScope,
    pub(crate) capabilities: Capabilities,
    /// Dependency key and the object linked to it
    pub(crate) dependencies: Vec<(String, ObjectIdx)>,
    pub(crate) flows: IndexMap<String, FunctionIdx>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) pool: Option<Arc<dyn ManagedObjectPool>>,
    pub(crate) recycle: Option<RecycleFn>,
}

pub(crate) struct GovernanceDef {
    pub(crate) name: String,
    pub(crate) factory: GovernanceFactory,
    pub(crate) objects: Vec<ObjectIdx>,
}

pub(crate) struct Registry {
    pub(crate) types: EscalationTypes,
    pub(crate) functions: Vec<FunctionDef>,
    pub(crate) function_index: HashMap<String, FunctionIdx>,
    pub(crate) objects: Vec<ObjectDef>,
    pub(crate) object_index: HashMap<String, ObjectIdx>,
    pub(crate) governance: Vec<GovernanceDef>,
    pub(crate) teams: Vec<Arc<dyn Team>>,
    pub(crate) thread_procedure: EscalationProcedure,
    pub(crate) office_procedure: EscalationProcedure,
    pub(crate) host: Option<Arc<dyn EscalationHandler>>,
}

impl Registry {
    pub(crate) fn function(&self, idx: FunctionIdx) -> &FunctionDef {
        &self.functions[idx.0]
    }

    pub(crate) fn object(&self, idx: ObjectIdx) -> &ObjectDef {
        &self.objects[idx.0]
    }

    pub(crate) fn governance(&self, idx: GovernanceIdx) -> &GovernanceDef {
        &self.governance[idx.0]
    }

    pub(crate) fn team(&self, idx: TeamIdx) -> &Arc<dyn Team> {
        &self.teams[idx.0]
    }

    pub(crate) fn find_function(&self, name: &str) -> Option<FunctionIdx> {
        self.function_index.get(name).copied()
    }

    pub(crate) fn find_object(&self, name: &str) -> Option<ObjectIdx> {
        self.object_index.get(name).copied()
    }

    /// Where an object lives when used by `function` on `thread`
    pub(crate) fn scope_id(
        &self,
        object: ObjectIdx,
        function: FunctionKey,
        thread: ThreadKey,
    ) -> ObjectScopeId {
        let scope = match self.object(object).scope {
            ManagedObjectScope::Function => ScopeInstance::Function(function),
            ManagedObjectScope::Thread => ScopeInstance::Thread(thread),
            ManagedObjectScope::Process => ScopeInstance::Process,
        };
        ObjectScopeId { object, scope }
    }
}
