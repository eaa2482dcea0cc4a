//! Process, thread, flow, and function states.
//!
//! All states of one process live in arenas behind a single lock and refer
//! to each other by key. User code never runs while the lock is held.

use crate::cache::{ObjectCache, ObjectScopeId, ScopeInstance};
use crate::escalation::EscalationLevel;
use crate::flow::{FlowCallback, FlowOutcome, FlowSeed};
use crate::function::Parameter;
use crate::governance::ActiveGovernance;
use crate::managed::CleanupEscalation;
use crate::managed::container::ObjectContainer;
use crate::office::{OfficeInner, ProcessCompletion};
use crate::registry::{FunctionIdx, ObjectIdx};
use indexmap::IndexSet;
use kiln_core::{Arena, Escalation, ProcessId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

kiln_core::arena_key! {
    /// Key of a thread state
    pub(crate) struct ThreadKey;
}

kiln_core::arena_key! {
    /// Key of a flow
    pub(crate) struct FlowKey;
}

kiln_core::arena_key! {
    /// Key of a function state
    pub(crate) struct FunctionKey;
}

/// Receives the process outcome exactly once
pub(crate) type CompletionFn = Box<dyn FnOnce(ProcessCompletion) + Send>;

/// Unit of work queued on a thread state
#[derive(Debug)]
pub(crate) enum Step {
    Execute(FunctionKey),
    FinishFlow { flow: FlowKey, outcome: FlowOutcome },
    Escalate { escalation: Arc<Escalation>, from: EscalationLevel },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionStatus {
    Pending,
    Executing,
    Suspended,
}

pub(crate) struct FunctionState {
    pub(crate) def: FunctionIdx,
    pub(crate) flow: FlowKey,
    pub(crate) parameter: Parameter,
    /// Escalation handed to a handler function
    pub(crate) escalation: Option<Arc<Escalation>>,
    /// Innermost level a failure of this function is searched from
    pub(crate) floor: EscalationLevel,
    pub(crate) status: FunctionStatus,
    /// Added to the flow's lineage on first entry
    pub(crate) entered: bool,
    pub(crate) objects: HashMap<ObjectIdx, ObjectContainer>,
}

pub(crate) struct FlowState {
    pub(crate) thread: ThreadKey,
    /// Flow waiting on this one as a sequential child
    pub(crate) parent: Option<FlowKey>,
    /// Functions entered so far, oldest first
    pub(crate) lineage: Vec<FunctionIdx>,
    pub(crate) current: Option<FunctionKey>,
    pub(crate) callback: Option<FlowCallback>,
    /// Taken out while governance code runs
    pub(crate) governance: Option<ActiveGovernance>,
    /// Next governance transition is a rollback
    pub(crate) escalating: bool,
    pub(crate) floor: EscalationLevel,
    pub(crate) sequential: VecDeque<FlowSeed>,
    pub(crate) blocked_on: Option<FlowKey>,
    pub(crate) resume: Option<(FunctionIdx, Parameter, EscalationLevel)>,
    pub(crate) finishing: bool,
}

impl FlowState {
    pub(crate) fn new(
        thread: ThreadKey,
        parent: Option<FlowKey>,
        floor: EscalationLevel,
        callback: Option<FlowCallback>,
    ) -> Self {
        Self {
            thread,
            parent,
            lineage: Vec::new(),
            current: None,
            callback,
            governance: Some(ActiveGovernance::default()),
            escalating: false,
            floor,
            sequential: VecDeque::new(),
            blocked_on: None,
            resume: None,
            finishing: false,
        }
    }
}

#[derive(Default)]
pub(crate) struct ThreadState {
    pub(crate) flows: IndexSet<FlowKey>,
    pub(crate) steps: VecDeque<Step>,
    /// A job for this thread is queued or running
    pub(crate) scheduled: bool,
    pub(crate) objects: HashMap<ObjectIdx, ObjectContainer>,
    /// Taken out while a function runs
    pub(crate) cache: Option<ObjectCache>,
    pub(crate) escalations: Vec<Arc<Escalation>>,
}

impl ThreadState {
    pub(crate) fn new() -> Self {
        Self {
            cache: Some(ObjectCache::default()),
            ..Self::default()
        }
    }

    pub(crate) fn has_pending_objects(&self) -> bool {
        self.objects.values().any(ObjectContainer::is_pending)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.flows.is_empty() && self.steps.is_empty() && !self.has_pending_objects()
    }
}

pub(crate) struct ProcessState {
    pub(crate) threads: Arena<ThreadKey, ThreadState>,
    pub(crate) flows: Arena<FlowKey, FlowState>,
    pub(crate) functions: Arena<FunctionKey, FunctionState>,
    pub(crate) objects: HashMap<ObjectIdx, ObjectContainer>,
    /// First escalation no handler recovered
    pub(crate) escalation: Option<Arc<Escalation>>,
    /// Set when the office closes; every thread tears down at its next step
    pub(crate) abandoned: Option<Arc<Escalation>>,
    pub(crate) escalations: Vec<Arc<Escalation>>,
    pub(crate) cleanup: Vec<CleanupEscalation>,
    pub(crate) completion: Option<CompletionFn>,
    /// Recycles in progress outside the lock
    pub(crate) recycling: usize,
    pub(crate) completed: bool,
    last_ticket: u64,
}

impl ProcessState {
    pub(crate) fn new(completion: CompletionFn) -> Self {
        Self {
            threads: Arena::new(),
            flows: Arena::new(),
            functions: Arena::new(),
            objects: HashMap::new(),
            escalation: None,
            abandoned: None,
            escalations: Vec::new(),
            cleanup: Vec::new(),
            completion: Some(completion),
            recycling: 0,
            completed: false,
            last_ticket: 0,
        }
    }

    /// Fresh ticket; never zero
    pub(crate) fn next_ticket(&mut self) -> u64 {
        self.last_ticket += 1;
        self.last_ticket
    }

    pub(crate) fn container(&self, id: &ObjectScopeId) -> Option<&ObjectContainer> {
        match id.scope {
            ScopeInstance::Function(key) => self.functions.get(key)?.objects.get(&id.object),
            ScopeInstance::Thread(key) => self.threads.get(key)?.objects.get(&id.object),
            ScopeInstance::Process => self.objects.get(&id.object),
        }
    }

    pub(crate) fn container_mut(&mut self, id: &ObjectScopeId) -> Option<&mut ObjectContainer> {
        match id.scope {
            ScopeInstance::Function(key) => {
                self.functions.get_mut(key)?.objects.get_mut(&id.object)
            }
            ScopeInstance::Thread(key) => self.threads.get_mut(key)?.objects.get_mut(&id.object),
            ScopeInstance::Process => self.objects.get_mut(&id.object),
        }
    }

    /// Container for `id`, created unsourced if its scope is live
    pub(crate) fn ensure_container(&mut self, id: &ObjectScopeId) -> Option<&mut ObjectContainer> {
        let registry = match id.scope {
            ScopeInstance::Function(key) => &mut self.functions.get_mut(key)?.objects,
            ScopeInstance::Thread(key) => &mut self.threads.get_mut(key)?.objects,
            ScopeInstance::Process => &mut self.objects,
        };
        Some(
            registry
                .entry(id.object)
                .or_insert_with(|| ObjectContainer::new(id.object)),
        )
    }

    /// Every container with its identity
    pub(crate) fn container_ids(&self) -> Vec<ObjectScopeId> {
        let process = self.objects.keys().map(|object| ObjectScopeId {
            object: *object,
            scope: ScopeInstance::Process,
        });
        let threads = self.threads.iter().flat_map(|(key, thread)| {
            thread.objects.keys().map(move |object| ObjectScopeId {
                object: *object,
                scope: ScopeInstance::Thread(key),
            })
        });
        let functions = self.functions.iter().flat_map(|(key, function)| {
            function.objects.keys().map(move |object| ObjectScopeId {
                object: *object,
                scope: ScopeInstance::Function(key),
            })
        });
        process.chain(threads).chain(functions).collect()
    }

    /// Thread a container belongs to, if not process-scoped
    pub(crate) fn owning_thread(&self, id: &ObjectScopeId) -> Option<ThreadKey> {
        match id.scope {
            ScopeInstance::Function(key) => {
                let flow = self.functions.get(key)?.flow;
                Some(self.flows.get(flow)?.thread)
            }
            ScopeInstance::Thread(key) => Some(key),
            ScopeInstance::Process => None,
        }
    }

    pub(crate) fn thread_of(&self, function: FunctionKey) -> Option<ThreadKey> {
        let flow = self.functions.get(function)?.flow;
        Some(self.flows.get(flow)?.thread)
    }

    pub(crate) fn push_step(&mut self, thread: ThreadKey, step: Step) {
        if let Some(state) = self.threads.get_mut(thread) {
            state.steps.push_back(step);
        }
    }

    /// Mark a thread scheduled. Returns it if the caller must dispatch a job.
    pub(crate) fn schedule(&mut self, thread: ThreadKey) -> Option<ThreadKey> {
        let state = self.threads.get_mut(thread)?;
        if state.scheduled {
            return None;
        }
        state.scheduled = true;
        Some(thread)
    }

    /// Re-queue suspended functions. Returns threads needing a job.
    pub(crate) fn wake(&mut self, waiters: Vec<FunctionKey>) -> Vec<ThreadKey> {
        let mut dispatch = Vec::new();
        for key in waiters {
            let Some(function) = self.functions.get_mut(key) else {
                continue;
            };
            if function.status != FunctionStatus::Suspended {
                continue;
            }
            function.status = FunctionStatus::Pending;
            let Some(thread) = self.thread_of(key) else {
                continue;
            };
            self.push_step(thread, Step::Execute(key));
            if let Some(thread) = self.schedule(thread) {
                dispatch.push(thread);
            }
        }
        dispatch
    }

    /// Record an escalation against the thread and process it arose in
    pub(crate) fn record_escalation(&mut self, thread: ThreadKey, escalation: &Arc<Escalation>) {
        if let Some(state) = self.threads.get_mut(thread) {
            state.escalations.push(Arc::clone(escalation));
        }
        self.escalations.push(Arc::clone(escalation));
    }

    pub(crate) fn has_pending_objects(&self) -> bool {
        self.objects.values().any(ObjectContainer::is_pending)
    }

    pub(crate) fn ready_to_complete(&self) -> bool {
        !self.completed
            && self.threads.is_empty()
            && self.recycling == 0
            && !self.has_pending_objects()
    }
}

/// A process and everything needed to drive it
pub(crate) struct ProcessCell {
    pub(crate) id: ProcessId,
    pub(crate) office: Arc<OfficeInner>,
    state: Mutex<ProcessState>,
    safety: Mutex<()>,
}

impl ProcessCell {
    pub(crate) fn new(id: ProcessId, office: Arc<OfficeInner>, state: ProcessState) -> Self {
        Self {
            id,
            office,
            state: Mutex::new(state),
            safety: Mutex::new(()),
        }
    }

    /// Lock process state. Kernel code alone mutates it, so a poisoned lock
    /// still holds consistent state.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `operation` serialised against every other process-safe operation
    /// of this process
    pub(crate) fn run_safely<R>(&self, operation: impl FnOnce() -> R) -> R {
        let _guard = self.safety.lock().unwrap_or_else(PoisonError::into_inner);
        operation()
    }
}
