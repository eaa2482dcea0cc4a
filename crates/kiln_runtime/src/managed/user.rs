//! Handles through which sources and managed objects talk back to the office.
//!
//! Every handle holds the process weakly. Once a process has completed its
//! handles go quiet: notifications return `false` and nothing is resumed.

use crate::cache::{ObjectScopeId, ScopeInstance};
use crate::engine;
use crate::function::Parameter;
use crate::managed::{Capability, ManagedObject};
use crate::office::{OfficeInner, ProcessCompletion};
use crate::process::ProcessCell;
use crate::registry::ObjectIdx;
use kiln_core::{Escalation, KernelError, KernelResult, ProcessId};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Receives the outcome of one sourcing request
#[derive(Clone)]
pub struct ManagedObjectUser {
    cell: Weak<ProcessCell>,
    id: ObjectScopeId,
    ticket: u64,
}

impl ManagedObjectUser {
    pub(crate) fn new(cell: Weak<ProcessCell>, id: ObjectScopeId, ticket: u64) -> Self {
        Self { cell, id, ticket }
    }

    /// Supply the sourced object. Returns `false` if the request already
    /// completed, failed, or timed out; the object is then reported lost to
    /// its pool.
    pub fn set_managed_object(&self, managed: Arc<dyn ManagedObject>) -> bool {
        let Some(cell) = self.cell.upgrade() else {
            return false;
        };
        let def = cell.office.registry.object(self.id.object);
        apply_hooks(&cell, self.id, &managed);
        let value = managed.object();
        let coordinating = def.capabilities.contains(Capability::Coordinating);
        let ticket = self.ticket;
        let object = Arc::clone(&managed);
        let accepted = engine::notify(&cell, &self.id, move |container| {
            container.sourced(ticket, object, value, coordinating)
        });
        if !accepted {
            tracing::warn!(
                process = %cell.id,
                object = %def.name,
                "ignoring stale managed object notification"
            );
            if let Some(pool) = &def.pool {
                pool.lost(managed, &Escalation::cleanup("sourced after the request ended"));
            }
        }
        accepted
    }

    /// Fail the sourcing request. Every function waiting on the object
    /// escalates `escalation`.
    pub fn set_failure(&self, escalation: Escalation) -> bool {
        let Some(cell) = self.cell.upgrade() else {
            return false;
        };
        let ticket = self.ticket;
        engine::notify(&cell, &self.id, move |container| container.fail(ticket, escalation))
    }

    /// Managed object name
    #[must_use]
    pub fn name(&self) -> String {
        self.cell
            .upgrade()
            .map(|cell| cell.office.registry.object(self.id.object).name.clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for ManagedObjectUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObjectUser")
            .field("ticket", &self.ticket)
            .finish()
    }
}

/// Give a freshly sourced object the contexts its capabilities ask for
pub(crate) fn apply_hooks(
    cell: &Arc<ProcessCell>,
    id: ObjectScopeId,
    managed: &Arc<dyn ManagedObject>,
) {
    let def = cell.office.registry.object(id.object);
    if def.capabilities.contains(Capability::ContextAware) {
        managed.set_context(ManagedObjectContext {
            cell: Arc::downgrade(cell),
            process: cell.id,
            name: def.name.clone(),
        });
    }
    if def.capabilities.contains(Capability::Asynchronous) {
        managed.set_asynchronous_context(AsynchronousContext {
            cell: Arc::downgrade(cell),
            id,
        });
    }
}

/// Lets an asynchronous object suspend the functions depending on it
#[derive(Clone)]
pub struct AsynchronousContext {
    cell: Weak<ProcessCell>,
    id: ObjectScopeId,
}

impl AsynchronousContext {
    /// Begin an operation. Functions needing the object wait until every
    /// outstanding operation has completed, or one fails or times out.
    /// Starting before the object is sourced, or after it failed, yields an
    /// operation that accepts nothing.
    #[must_use]
    pub fn start(&self) -> AsyncOperation {
        let Some(cell) = self.cell.upgrade() else {
            return AsyncOperation::inert(self.id);
        };
        let timeout = cell.office.timeout_for(self.id.object);
        let ticket = {
            let mut state = cell.lock();
            let ticket = state.next_ticket();
            let deadline = timeout.map(|timeout| Instant::now() + timeout);
            match state.container_mut(&self.id) {
                Some(container) => {
                    if container.start_operation(ticket, deadline) {
                        ticket
                    } else {
                        0
                    }
                }
                None => 0,
            }
        };
        if ticket == 0 {
            tracing::warn!(
                process = %cell.id,
                object = %cell.office.registry.object(self.id.object).name,
                "asynchronous operation started on an object that is not ready"
            );
        }
        AsyncOperation {
            cell: Arc::downgrade(&cell),
            id: self.id,
            ticket,
        }
    }
}

impl std::fmt::Debug for AsynchronousContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsynchronousContext").finish_non_exhaustive()
    }
}

/// One outstanding asynchronous operation
#[derive(Clone)]
pub struct AsyncOperation {
    cell: Weak<ProcessCell>,
    id: ObjectScopeId,
    ticket: u64,
}

impl AsyncOperation {
    fn inert(id: ObjectScopeId) -> Self {
        Self {
            cell: Weak::new(),
            id,
            ticket: 0,
        }
    }

    /// Whether the operation was accepted when started
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.ticket != 0
    }

    /// Operation succeeded. Returns `false` if this operation was already
    /// finished or has expired.
    pub fn complete(&self) -> bool {
        self.finish(Ok(()))
    }

    /// Operation failed; waiting functions escalate `escalation`
    pub fn fail(&self, escalation: Escalation) -> bool {
        self.finish(Err(escalation))
    }

    fn finish(&self, result: Result<(), Escalation>) -> bool {
        if self.ticket == 0 {
            return false;
        }
        let Some(cell) = self.cell.upgrade() else {
            return false;
        };
        let ticket = self.ticket;
        engine::notify(&cell, &self.id, move |container| {
            container.finish_operation(ticket, result)
        })
    }
}

impl std::fmt::Debug for AsyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("ticket", &self.ticket)
            .finish()
    }
}

/// Context for a context-aware object
#[derive(Clone)]
pub struct ManagedObjectContext {
    cell: Weak<ProcessCell>,
    process: ProcessId,
    name: String,
}

impl ManagedObjectContext {
    /// Name the object is bound under
    #[must_use]
    pub fn bound_name(&self) -> &str {
        &self.name
    }

    /// Process the object was sourced for
    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.process
    }

    /// Run `operation` serialised against other process-safe operations of
    /// the same process
    pub fn run<R>(&self, operation: impl FnOnce() -> R) -> R {
        match self.cell.upgrade() {
            Some(cell) => cell.run_safely(operation),
            None => operation(),
        }
    }
}

impl std::fmt::Debug for ManagedObjectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObjectContext")
            .field("process", &self.process)
            .field("name", &self.name)
            .finish()
    }
}

/// Lets a started source invoke processes through its linked flows
#[derive(Clone)]
pub struct ExecuteContext {
    office: Weak<OfficeInner>,
    object: ObjectIdx,
}

impl ExecuteContext {
    pub(crate) fn new(office: Weak<OfficeInner>, object: ObjectIdx) -> Self {
        Self { office, object }
    }

    /// Flow keys linked for this source
    #[must_use]
    pub fn flows(&self) -> Vec<String> {
        self.office
            .upgrade()
            .map(|office| office.registry.object(self.object).flows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Invoke a process through `flow`. A supplied `object` is bound as this
    /// source's managed object for that process.
    ///
    /// # Errors
    ///
    /// Returns error if the office is closed or the flow key is unlinked
    pub fn invoke_process<F>(
        &self,
        flow: &str,
        parameter: Parameter,
        object: Option<Arc<dyn ManagedObject>>,
        completion: F,
    ) -> KernelResult<ProcessId>
    where
        F: FnOnce(ProcessCompletion) + Send + 'static,
    {
        let office = self.office.upgrade().ok_or_else(|| KernelError::OfficeClosed {
            name: String::new(),
        })?;
        let def = office.registry.object(self.object);
        let function = def
            .flows
            .get(flow)
            .copied()
            .ok_or_else(|| KernelError::UnlinkedKey {
                object: def.name.clone(),
                kind: "flow".to_string(),
                key: flow.to_string(),
            })?;
        let bound = object.map(|managed| (self.object, managed));
        office.invoke(function, parameter, bound, Box::new(completion))
    }
}

impl std::fmt::Debug for ExecuteContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteContext")
            .field("object", &self.object)
            .finish()
    }
}

/// Scope identity of a process-scoped binding
pub(crate) fn process_binding(object: ObjectIdx) -> ObjectScopeId {
    ObjectScopeId {
        object,
        scope: ScopeInstance::Process,
    }
}
