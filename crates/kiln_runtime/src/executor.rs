//! Executing one function: load its managed objects, move governance, run
//! the body, then hand the result back to the engine.

use crate::cache::{ObjectCache, ObjectScopeId};
use crate::engine;
use crate::function::FunctionContext;
use crate::governance::{self, ActiveGovernance, Transition};
use crate::managed::container::{ObjectContainer, ObjectState};
use crate::managed::recycle::recycle;
use crate::managed::{ManagedObject, ManagedObjectUser, ObjectRegistry, ObjectValue};
use crate::process::{FunctionKey, FunctionStatus, ProcessCell, ProcessState, ThreadKey};
use crate::registry::{GovernanceIdx, ObjectIdx, Registry};
use kiln_core::Escalation;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

enum Prepared {
    Ready,
    /// Suspended on an object, or the function no longer exists
    Waiting,
    Failed(Arc<Escalation>),
    Source(ObjectScopeId, u64),
    Load(LoadRequest),
}

enum Status {
    Unsourced,
    Sourced(Option<Arc<dyn ManagedObject>>),
    Pending,
}

struct LoadRequest {
    id: ObjectScopeId,
    ticket: u64,
    managed: Arc<dyn ManagedObject>,
    dependencies: ObjectRegistry,
}

/// Run a function step
pub(crate) fn execute(cell: &Arc<ProcessCell>, thread: ThreadKey, key: FunctionKey) {
    loop {
        let prepared = prepare(cell, &mut cell.lock(), thread, key);
        match prepared {
            Prepared::Ready => break,
            Prepared::Waiting => return,
            Prepared::Failed(escalation) => {
                engine::escalate_function(cell, key, escalation);
                return;
            }
            Prepared::Source(id, ticket) => source(cell, id, ticket),
            Prepared::Load(request) => load(cell, request),
        }
    }

    if let Err(escalation) = transition_governance(cell, thread, key) {
        engine::escalate_function(cell, key, Arc::new(escalation));
        return;
    }
    run_logic(cell, thread, key);
}

/// Advance the first managed object that is not ready yet
fn prepare(
    cell: &ProcessCell,
    state: &mut ProcessState,
    thread: ThreadKey,
    key: FunctionKey,
) -> Prepared {
    let registry = &cell.office.registry;
    let Some(function) = state.functions.get_mut(key) else {
        return Prepared::Waiting;
    };
    let (def, flow) = (function.def, function.flow);
    if !function.entered {
        function.entered = true;
        if let Some(flow_state) = state.flows.get_mut(flow) {
            flow_state.lineage.push(def);
        }
    }

    for &object in &registry.function(def).load {
        let id = registry.scope_id(object, key, thread);
        let Some(container) = state.ensure_container(&id) else {
            return Prepared::Waiting;
        };
        let status = match &container.state {
            ObjectState::Ready => continue,
            ObjectState::Failed(escalation) => return Prepared::Failed(Arc::clone(escalation)),
            ObjectState::Unsourced => Status::Unsourced,
            ObjectState::Sourced => Status::Sourced(container.managed.clone()),
            ObjectState::Sourcing | ObjectState::Loading | ObjectState::AsyncPending => {
                Status::Pending
            }
        };
        match status {
            Status::Unsourced => {
                let ticket = state.next_ticket();
                let deadline = cell
                    .office
                    .timeout_for(object)
                    .map(|timeout| Instant::now() + timeout);
                if let Some(container) = state.container_mut(&id) {
                    container.begin_sourcing(ticket, deadline);
                }
                return Prepared::Source(id, ticket);
            }
            Status::Sourced(managed) => {
                let dependencies = registry
                    .object(object)
                    .dependencies
                    .iter()
                    .filter_map(|(dependency_key, dependency)| {
                        let dependency_id = registry.scope_id(*dependency, key, thread);
                        let value = state.container(&dependency_id)?.value.clone()?;
                        Some((dependency_key.clone(), value))
                    })
                    .collect();
                let Some(managed) = managed else {
                    return Prepared::Failed(Arc::new(Escalation::defect(format!(
                        "managed object {} sourced without an object",
                        registry.object(object).name
                    ))));
                };
                let ticket = state.next_ticket();
                if let Some(container) = state.container_mut(&id) {
                    container.begin_loading(ticket);
                }
                return Prepared::Load(LoadRequest {
                    id,
                    ticket,
                    managed,
                    dependencies: ObjectRegistry::new(dependencies),
                });
            }
            Status::Pending => {
                if let Some(container) = state.container_mut(&id) {
                    container.add_waiter(key);
                }
                if let Some(function) = state.functions.get_mut(key) {
                    function.status = FunctionStatus::Suspended;
                }
                cell.office.metrics.record_suspension();
                tracing::trace!(
                    process = %cell.id,
                    function = %registry.function(def).name,
                    object = %registry.object(object).name,
                    "suspended on managed object"
                );
                return Prepared::Waiting;
            }
        }
    }
    Prepared::Ready
}

fn source(cell: &Arc<ProcessCell>, id: ObjectScopeId, ticket: u64) {
    let def = cell.office.registry.object(id.object);
    let user = ManagedObjectUser::new(Arc::downgrade(cell), id, ticket);
    tracing::trace!(process = %cell.id, object = %def.name, "sourcing");
    let sourced = catch_unwind(AssertUnwindSafe(|| match &def.pool {
        Some(pool) => pool.source(user, &def.source),
        None => def.source.source(user),
    }));
    if let Err(panic) = sourced {
        let failure = Escalation::defect(format!(
            "source {} panicked: {}",
            def.name,
            crate::panic_message(&*panic)
        ));
        engine::notify(cell, &id, move |container| container.fail(ticket, failure));
    }
}

fn load(cell: &Arc<ProcessCell>, request: LoadRequest) {
    let LoadRequest {
        id,
        ticket,
        managed,
        dependencies,
    } = request;
    let result = catch_unwind(AssertUnwindSafe(|| managed.load_objects(&dependencies)))
        .unwrap_or_else(|panic| {
            Err(Escalation::defect(format!(
                "loading dependencies panicked: {}",
                crate::panic_message(&*panic)
            )))
        });
    engine::notify(cell, &id, move |container| container.loaded(ticket, result));
}

/// Release governance the function does not require and activate what it
/// does. Releases roll back while the flow is routing an escalation.
fn transition_governance(
    cell: &ProcessCell,
    thread: ThreadKey,
    key: FunctionKey,
) -> Result<(), Escalation> {
    let registry = &cell.office.registry;
    let (def, flow, mut active, rollback, governed) = {
        let mut state = cell.lock();
        let Some(function) = state.functions.get(key) else {
            return Ok(());
        };
        let (def, flow) = (function.def, function.flow);
        let required = &registry.function(def).governance;
        let Some(flow_state) = state.flows.get_mut(flow) else {
            return Ok(());
        };
        let rollback = std::mem::take(&mut flow_state.escalating);
        let Some(active) = flow_state.governance.take() else {
            return Ok(());
        };
        let governed: Vec<(GovernanceIdx, Vec<(String, ObjectValue)>)> = required
            .iter()
            .filter(|governance| !active.is_active(**governance))
            .map(|governance| {
                let objects = registry
                    .governance(*governance)
                    .objects
                    .iter()
                    .filter(|object| registry.function(def).load.contains(object))
                    .filter_map(|object| loaded_value(&state, registry, *object, key, thread))
                    .collect();
                (*governance, objects)
            })
            .collect();
        (def, flow, active, rollback, governed)
    };

    let required = &registry.function(def).governance;
    let result = catch_unwind(AssertUnwindSafe(|| {
        apply_governance(cell, &mut active, required, rollback, governed)
    }))
    .unwrap_or_else(|panic| {
        Err(Escalation::defect(format!(
            "governance panicked: {}",
            crate::panic_message(&*panic)
        )))
    });

    if let Some(flow_state) = cell.lock().flows.get_mut(flow) {
        flow_state.governance = Some(active);
    }
    result
}

fn loaded_value(
    state: &ProcessState,
    registry: &Registry,
    object: ObjectIdx,
    key: FunctionKey,
    thread: ThreadKey,
) -> Option<(String, ObjectValue)> {
    let id = registry.scope_id(object, key, thread);
    let value = state.container(&id)?.value.clone()?;
    Some((registry.object(object).name.clone(), value))
}

fn apply_governance(
    cell: &ProcessCell,
    active: &mut ActiveGovernance,
    required: &[GovernanceIdx],
    rollback: bool,
    governed: Vec<(GovernanceIdx, Vec<(String, ObjectValue)>)>,
) -> Result<(), Escalation> {
    let registry = &cell.office.registry;
    let ending = active.release_unrequired(required);
    if !ending.is_empty() {
        let transition = if rollback {
            Transition::Disregard
        } else {
            Transition::Enforce
        };
        tracing::trace!(process = %cell.id, count = ending.len(), ?transition, "ending governance");
        governance::end_all(ending, transition)?;
    }

    for (governance, objects) in governed {
        let mut activation = (registry.governance(governance).factory)();
        let mut outcome = Ok(());
        for (name, value) in &objects {
            outcome = activation.govern(name, value);
            if outcome.is_err() {
                break;
            }
        }
        if let Err(escalation) = outcome {
            if let Err(failure) = activation.disregard() {
                tracing::warn!(escalation = %failure, "governance disregard failed");
            }
            return Err(escalation);
        }
        tracing::trace!(
            process = %cell.id,
            governance = %registry.governance(governance).name,
            "governance active"
        );
        active.activate(governance, activation);
    }
    Ok(())
}

/// Cache entries for every object the function loaded; stale entries drop
fn prime_cache(
    state: &mut ProcessState,
    cell: &ProcessCell,
    thread: ThreadKey,
    key: FunctionKey,
) -> ObjectCache {
    let registry = &cell.office.registry;
    let mut cache = state
        .threads
        .get_mut(thread)
        .and_then(|thread_state| thread_state.cache.take())
        .unwrap_or_default();
    cache.retain(|id| state.container(id).is_some_and(ObjectContainer::is_ready));
    if let Some(function) = state.functions.get(key) {
        for &object in &registry.function(function.def).load {
            let id = registry.scope_id(object, key, thread);
            if let Some(value) = state.container(&id).and_then(|c| c.value.clone()) {
                cache.insert(id, value);
            }
        }
    }
    cache
}

fn restore_cache(
    state: &mut ProcessState,
    thread: ThreadKey,
    key: FunctionKey,
    mut cache: ObjectCache,
) {
    cache.evict_function(key);
    if let Some(thread_state) = state.threads.get_mut(thread) {
        thread_state.cache = Some(cache);
    }
}

fn run_logic(cell: &Arc<ProcessCell>, thread: ThreadKey, key: FunctionKey) {
    let registry = &cell.office.registry;
    let (def, parameter, escalation, cache) = {
        let mut state = cell.lock();
        let Some(function) = state.functions.get_mut(key) else {
            return;
        };
        function.status = FunctionStatus::Executing;
        let (def, parameter, escalation) = (
            function.def,
            function.parameter.clone(),
            function.escalation.clone(),
        );
        let cache = prime_cache(&mut state, cell, thread, key);
        (def, parameter, escalation, cache)
    };

    let function = registry.function(def);
    tracing::debug!(process = %cell.id, function = %function.name, "executing");
    let mut context =
        FunctionContext::new(registry, function, key, thread, &cache, parameter, escalation);
    let result = catch_unwind(AssertUnwindSafe(|| (function.logic)(&mut context)))
        .unwrap_or_else(|panic| {
            Err(Escalation::defect(format!(
                "function {} panicked: {}",
                function.name,
                crate::panic_message(&*panic)
            )))
        });
    let (seeds, next_parameter) = context.into_parts();
    cell.office.metrics.record_function();

    match result {
        Ok(()) => {
            let (containers, dispatch) = {
                let mut state = cell.lock();
                restore_cache(&mut state, thread, key, cache);
                let (containers, dispatch) = engine::complete_function(
                    &mut state,
                    registry,
                    key,
                    seeds,
                    next_parameter.flatten(),
                );
                if !containers.is_empty() {
                    state.recycling += 1;
                }
                (containers, dispatch)
            };
            if !containers.is_empty() {
                let cleanup = recycle(registry, containers, &[]);
                engine::finish_recycle(cell, cleanup);
            }
            engine::dispatch(cell, dispatch);
        }
        Err(escalation) => {
            restore_cache(&mut cell.lock(), thread, key, cache);
            engine::escalate_function(cell, key, Arc::new(escalation));
        }
    }
}
