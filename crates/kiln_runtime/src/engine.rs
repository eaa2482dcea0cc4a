//! The job loop: runs queued steps of a thread state, moves threads between
//! teams, walks escalations outward, and completes threads and processes.
//!
//! Every step takes the process lock to decide what to do, releases it, then
//! runs user code. A thread state has at most one job queued or running,
//! tracked by its `scheduled` flag.

use crate::cache::ObjectScopeId;
use crate::escalation::EscalationLevel;
use crate::executor;
use crate::flow::{FlowCallback, FlowOutcome, FlowSeed, Instigation};
use crate::function::Parameter;
use crate::governance::{self, Transition};
use crate::managed::CleanupEscalation;
use crate::managed::container::ObjectContainer;
use crate::managed::recycle::recycle;
use crate::process::{
    FlowKey, FlowState, FunctionKey, FunctionState, FunctionStatus, ProcessCell, ProcessState,
    Step, ThreadKey, ThreadState,
};
use crate::registry::{FunctionIdx, Registry, TeamIdx};
use kiln_core::{Escalation, EscalationKind, KernelResult};
use kiln_team::Job;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

enum Next {
    Run(Step),
    Handoff(TeamIdx),
    Teardown(Arc<Escalation>),
    Released,
    Completed {
        containers: Vec<ObjectContainer>,
        escalations: Vec<Arc<Escalation>>,
    },
}

/// Drive `thread` until its queue is empty or it must move to another team
pub(crate) fn run_thread(cell: Arc<ProcessCell>, thread: ThreadKey, team: Option<TeamIdx>) {
    loop {
        let next = next_step(&cell.office.registry, &mut cell.lock(), thread, team);
        match next {
            Next::Run(step) => run_step(&cell, thread, step),
            Next::Teardown(escalation) => teardown_thread(&cell, thread, &escalation),
            Next::Handoff(target) => {
                submit(cell, thread, target);
                return;
            }
            Next::Released => return,
            Next::Completed {
                containers,
                escalations,
            } => {
                tracing::debug!(process = %cell.id, thread = %thread, "thread complete");
                let cleanup = recycle(&cell.office.registry, containers, &escalations);
                finish_recycle(&cell, cleanup);
                return;
            }
        }
    }
}

fn next_step(
    registry: &Registry,
    state: &mut ProcessState,
    thread: ThreadKey,
    team: Option<TeamIdx>,
) -> Next {
    let Some(thread_state) = state.threads.get(thread) else {
        return Next::Released;
    };
    if let Some(escalation) = &state.abandoned {
        let live = thread_state
            .flows
            .iter()
            .any(|flow| state.flows.get(*flow).is_some_and(|flow| !flow.finishing));
        if live {
            return Next::Teardown(Arc::clone(escalation));
        }
    }
    if let Some(Step::Execute(key)) = thread_state.steps.front() {
        let required = state
            .functions
            .get(*key)
            .and_then(|function| registry.function(function.def).team);
        if let Some(target) = handoff_target(registry, required, team) {
            return Next::Handoff(target);
        }
    }

    let Some(thread_state) = state.threads.get_mut(thread) else {
        return Next::Released;
    };
    if let Some(step) = thread_state.steps.pop_front() {
        return Next::Run(step);
    }
    thread_state.scheduled = false;
    if !thread_state.is_idle() {
        return Next::Released;
    }
    let Some(finished) = state.threads.remove(thread) else {
        return Next::Released;
    };
    state.recycling += 1;
    Next::Completed {
        containers: finished.objects.into_values().collect(),
        escalations: finished.escalations,
    }
}

fn handoff_target(
    registry: &Registry,
    required: Option<TeamIdx>,
    current: Option<TeamIdx>,
) -> Option<TeamIdx> {
    let team = required?;
    if Some(team) == current || registry.team(team).runs_inline() {
        None
    } else {
        Some(team)
    }
}

fn submit(cell: Arc<ProcessCell>, thread: ThreadKey, team: TeamIdx) {
    let target = Arc::clone(cell.office.registry.team(team));
    cell.office.metrics.record_handoff();
    tracing::trace!(process = %cell.id, thread = %thread, team = target.name(), "handoff");
    let label = format!("{}/{}", cell.id, thread);
    let job = Job::new(label, move || run_thread(cell, thread, Some(team)));
    if let Err(rejected) = target.submit(job) {
        tracing::warn!(
            team = target.name(),
            error = %rejected.error,
            "team rejected job, running inline"
        );
        rejected.job.run();
    }
}

/// Start jobs for threads that were idle when work arrived
pub(crate) fn dispatch(cell: &Arc<ProcessCell>, threads: Vec<ThreadKey>) {
    for thread in threads {
        run_thread(Arc::clone(cell), thread, None);
    }
}

fn run_step(cell: &Arc<ProcessCell>, thread: ThreadKey, step: Step) {
    match step {
        Step::Execute(key) => executor::execute(cell, thread, key),
        Step::FinishFlow { flow, outcome } => finish_flow(cell, flow, outcome),
        Step::Escalate { escalation, from } => escalate_procedures(cell, thread, escalation, from),
    }
}

pub(crate) fn new_flow(
    state: &mut ProcessState,
    thread: ThreadKey,
    parent: Option<FlowKey>,
    floor: EscalationLevel,
    callback: Option<FlowCallback>,
) -> KernelResult<FlowKey> {
    let key = state
        .flows
        .insert(FlowState::new(thread, parent, floor, callback))?;
    if let Some(thread_state) = state.threads.get_mut(thread) {
        thread_state.flows.insert(key);
    }
    Ok(key)
}

fn logged<T>(result: KernelResult<T>) -> Option<T> {
    result
        .inspect_err(|error| tracing::error!(%error, "process state exhausted"))
        .ok()
}

/// Queue `def` as the flow's current function
pub(crate) fn start_function(
    state: &mut ProcessState,
    flow: FlowKey,
    def: FunctionIdx,
    parameter: Parameter,
    floor: EscalationLevel,
    escalation: Option<Arc<Escalation>>,
) -> Option<FunctionKey> {
    let flow_state = state.flows.get(flow)?;
    let thread = flow_state.thread;
    let floor = floor.max(flow_state.floor);
    let key = logged(state.functions.insert(FunctionState {
        def,
        flow,
        parameter,
        escalation,
        floor,
        status: FunctionStatus::Pending,
        entered: false,
        objects: HashMap::new(),
    }))?;
    if let Some(flow_state) = state.flows.get_mut(flow) {
        flow_state.current = Some(key);
    }
    state.push_step(thread, Step::Execute(key));
    Some(key)
}

/// Move a flow on: a queued sequential child, then the next function, then
/// completion
pub(crate) fn advance_flow(state: &mut ProcessState, flow: FlowKey) {
    let Some(flow_state) = state.flows.get_mut(flow) else {
        return;
    };
    let thread = flow_state.thread;
    let seed = flow_state.sequential.pop_front();
    let resume = if seed.is_none() {
        flow_state.resume.take()
    } else {
        None
    };
    if seed.is_none() && resume.is_none() {
        flow_state.finishing = true;
    }

    match (seed, resume) {
        (Some(seed), _) => {
            let floor = EscalationLevel::Function;
            let Some(child) = logged(new_flow(state, thread, Some(flow), floor, seed.callback))
            else {
                return;
            };
            if let Some(flow_state) = state.flows.get_mut(flow) {
                flow_state.blocked_on = Some(child);
            }
            start_function(
                state,
                child,
                seed.function,
                seed.parameter,
                EscalationLevel::Function,
                None,
            );
        }
        (None, Some((function, parameter, floor))) => {
            start_function(state, flow, function, parameter, floor, None);
        }
        (None, None) => state.push_step(
            thread,
            Step::FinishFlow {
                flow,
                outcome: FlowOutcome::Completed,
            },
        ),
    }
}

/// Record a normally completed function: instigate its flows and move its
/// flow on. Returns the function's objects to recycle and threads to
/// dispatch.
pub(crate) fn complete_function(
    state: &mut ProcessState,
    registry: &Registry,
    key: FunctionKey,
    seeds: Vec<FlowSeed>,
    next_parameter: Parameter,
) -> (Vec<ObjectContainer>, Vec<ThreadKey>) {
    let Some(function) = state.functions.remove(key) else {
        return (Vec::new(), Vec::new());
    };
    let flow = function.flow;
    let Some(thread) = state.flows.get(flow).map(|flow_state| flow_state.thread) else {
        return (function.objects.into_values().collect(), Vec::new());
    };

    let mut dispatch = Vec::new();
    for seed in seeds {
        match seed.instigation {
            Instigation::Sequential => {
                if let Some(flow_state) = state.flows.get_mut(flow) {
                    flow_state.sequential.push_back(seed);
                }
            }
            Instigation::Parallel => {
                let floor = EscalationLevel::Function;
                let Some(child) = logged(new_flow(state, thread, None, floor, seed.callback))
                else {
                    continue;
                };
                start_function(
                    state,
                    child,
                    seed.function,
                    seed.parameter,
                    EscalationLevel::Function,
                    None,
                );
            }
            Instigation::Asynchronous => {
                let Some(spawned) = logged(state.threads.insert(ThreadState::new())) else {
                    continue;
                };
                let floor = EscalationLevel::Function;
                let Some(child) = logged(new_flow(state, spawned, None, floor, seed.callback))
                else {
                    state.threads.remove(spawned);
                    continue;
                };
                start_function(
                    state,
                    child,
                    seed.function,
                    seed.parameter,
                    EscalationLevel::Function,
                    None,
                );
                if let Some(spawned) = state.schedule(spawned) {
                    dispatch.push(spawned);
                }
            }
        }
    }

    let next = registry.function(function.def).next;
    if let Some(flow_state) = state.flows.get_mut(flow) {
        flow_state.current = None;
        flow_state.resume = next.map(|next| (next, next_parameter, function.floor));
    }
    advance_flow(state, flow);
    (function.objects.into_values().collect(), dispatch)
}

/// Closest handler among the function's own handlers and then the
/// functions entered before it in the flow, most recent first
fn find_flow_handler(
    registry: &Registry,
    state: &ProcessState,
    function: &FunctionState,
    kind: &EscalationKind,
) -> Option<FunctionIdx> {
    let own = registry.function(function.def).handlers.find(&registry.types, kind);
    if own.is_some() {
        return own;
    }
    let lineage = &state.flows.get(function.flow)?.lineage;
    let ancestors = if function.entered {
        &lineage[..lineage.len().saturating_sub(1)]
    } else {
        &lineage[..]
    };
    ancestors
        .iter()
        .rev()
        .find_map(|ancestor| registry.function(*ancestor).handlers.find(&registry.types, kind))
}

/// A function failed: search its flow for a handler, otherwise end the flow
/// with the escalation
pub(crate) fn escalate_function(
    cell: &Arc<ProcessCell>,
    key: FunctionKey,
    escalation: Arc<Escalation>,
) {
    let registry = &cell.office.registry;
    let containers = {
        let mut state = cell.lock();
        let Some(thread) = state.thread_of(key) else {
            return;
        };
        let Some(function) = state.functions.remove(key) else {
            return;
        };
        cell.office.metrics.record_escalation();
        state.record_escalation(thread, &escalation);
        tracing::debug!(
            process = %cell.id,
            function = %registry.function(function.def).name,
            escalation = %escalation,
            "function escalated"
        );

        let handler = if function.floor <= EscalationLevel::Function {
            find_flow_handler(registry, &state, &function, escalation.kind())
        } else {
            None
        };
        let flow = function.flow;
        if let Some(flow_state) = state.flows.get_mut(flow) {
            flow_state.current = None;
            flow_state.resume = None;
        }

        match handler {
            Some(handler) => {
                cell.office.metrics.record_handled(EscalationLevel::Function);
                tracing::debug!(
                    process = %cell.id,
                    handler = %registry.function(handler).name,
                    "handling escalation in flow"
                );
                if let Some(flow_state) = state.flows.get_mut(flow) {
                    flow_state.escalating = true;
                }
                start_function(
                    &mut state,
                    flow,
                    handler,
                    None,
                    EscalationLevel::Callback,
                    Some(Arc::clone(&escalation)),
                );
            }
            None => {
                if let Some(flow_state) = state.flows.get_mut(flow) {
                    flow_state.finishing = true;
                }
                state.push_step(
                    thread,
                    Step::FinishFlow {
                        flow,
                        outcome: FlowOutcome::Escalated(Arc::clone(&escalation)),
                    },
                );
            }
        }

        let containers: Vec<ObjectContainer> = function.objects.into_values().collect();
        if !containers.is_empty() {
            state.recycling += 1;
        }
        containers
    };
    if !containers.is_empty() {
        let cleanup = recycle(registry, containers, std::slice::from_ref(&escalation));
        finish_recycle(cell, cleanup);
    }
}

fn invoke_callback(
    callback: FlowCallback,
    outcome: Option<Arc<Escalation>>,
) -> Result<(), Escalation> {
    catch_unwind(AssertUnwindSafe(|| callback.invoke(outcome))).unwrap_or_else(|panic| {
        Err(Escalation::defect(format!(
            "flow callback panicked: {}",
            crate::panic_message(&*panic)
        )))
    })
}

fn end_governance(
    governance: Option<crate::governance::ActiveGovernance>,
    outcome: FlowOutcome,
) -> FlowOutcome {
    let Some(mut governance) = governance else {
        return outcome;
    };
    if governance.is_empty() {
        return outcome;
    }
    let activations = governance.release_all();
    match outcome {
        FlowOutcome::Completed => {
            let enforced = catch_unwind(AssertUnwindSafe(|| {
                governance::end_all(activations, Transition::Enforce)
            }))
            .unwrap_or_else(|panic| {
                Err(Escalation::defect(format!(
                    "governance panicked: {}",
                    crate::panic_message(&*panic)
                )))
            });
            match enforced {
                Ok(()) => FlowOutcome::Completed,
                Err(escalation) => FlowOutcome::Escalated(Arc::new(escalation)),
            }
        }
        outcome => {
            match catch_unwind(AssertUnwindSafe(|| {
                governance::end_all(activations, Transition::Disregard)
            })) {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => {
                    tracing::warn!(failure = %failure.report(), "governance disregard failed");
                }
                Err(panic) => tracing::warn!(
                    panic = %crate::panic_message(&*panic),
                    "governance disregard panicked"
                ),
            }
            outcome
        }
    }
}

/// End a flow: settle governance, fire the callback, and release a parent
/// waiting on it
fn finish_flow(cell: &Arc<ProcessCell>, flow: FlowKey, outcome: FlowOutcome) {
    let metrics = &cell.office.metrics;
    let (governance, callback, seeds, floor, thread) = {
        let mut state = cell.lock();
        let Some(flow_state) = state.flows.get_mut(flow) else {
            return;
        };
        let seeds: Vec<FlowSeed> = flow_state.sequential.drain(..).collect();
        (
            flow_state.governance.take(),
            flow_state.callback.take(),
            seeds,
            flow_state.floor,
            flow_state.thread,
        )
    };

    let escalated_before = matches!(outcome, FlowOutcome::Escalated(_));
    let outcome = end_governance(governance, outcome);
    let mut raised = Vec::new();
    if let (false, FlowOutcome::Escalated(escalation)) = (escalated_before, &outcome) {
        raised.push(Arc::clone(escalation));
    }

    let propagate = match &outcome {
        FlowOutcome::Completed => callback
            .and_then(|callback| invoke_callback(callback, None).err())
            .map(|failure| {
                let failure = Arc::new(failure);
                raised.push(Arc::clone(&failure));
                failure
            }),
        FlowOutcome::Escalated(escalation) => match callback {
            Some(callback) if callback.handles_escalation() => {
                match invoke_callback(callback, Some(Arc::clone(escalation))) {
                    Ok(()) => {
                        metrics.record_handled(EscalationLevel::Callback);
                        None
                    }
                    Err(failure) => {
                        let failure = Arc::new(failure);
                        raised.push(Arc::clone(&failure));
                        Some(failure)
                    }
                }
            }
            Some(callback) => {
                if let Err(failure) = invoke_callback(callback, Some(Arc::clone(escalation))) {
                    tracing::warn!(escalation = %failure, "flow observer failed");
                }
                Some(Arc::clone(escalation))
            }
            None => Some(Arc::clone(escalation)),
        },
        FlowOutcome::Abandoned(escalation) => {
            if let Some(callback) = callback {
                if let Err(failure) = invoke_callback(callback, Some(Arc::clone(escalation))) {
                    tracing::warn!(escalation = %failure, "callback of abandoned flow failed");
                }
            }
            None
        }
    };

    // Sequential flows that never started still hear how things ended
    let ended_by = match &outcome {
        FlowOutcome::Completed => propagate.clone(),
        FlowOutcome::Escalated(escalation) | FlowOutcome::Abandoned(escalation) => {
            Some(Arc::clone(escalation))
        }
    };
    for seed in seeds {
        if let Some(callback) = seed.callback {
            if let Err(failure) = invoke_callback(callback, ended_by.clone()) {
                tracing::warn!(escalation = %failure, "callback of unstarted flow failed");
            }
        }
    }

    let mut state = cell.lock();
    let Some(finished) = state.flows.remove(flow) else {
        return;
    };
    if let Some(thread_state) = state.threads.get_mut(thread) {
        thread_state.flows.shift_remove(&flow);
    }
    tracing::trace!(process = %cell.id, flow = %flow, "flow finished");

    if let Some(parent) = finished.parent {
        let waiting = state
            .flows
            .get(parent)
            .is_some_and(|parent| parent.blocked_on == Some(flow) && !parent.finishing);
        if waiting {
            if let Some(parent_state) = state.flows.get_mut(parent) {
                parent_state.blocked_on = None;
            }
            match &propagate {
                None => advance_flow(&mut state, parent),
                Some(escalation) => {
                    if let Some(parent_state) = state.flows.get_mut(parent) {
                        parent_state.finishing = true;
                        parent_state.resume = None;
                    }
                    state.push_step(
                        thread,
                        Step::FinishFlow {
                            flow: parent,
                            outcome: FlowOutcome::Abandoned(Arc::clone(escalation)),
                        },
                    );
                }
            }
        }
    }

    for escalation in &raised {
        metrics.record_escalation();
        state.record_escalation(thread, escalation);
    }
    if let Some(escalation) = propagate {
        state.push_step(
            thread,
            Step::Escalate {
                escalation,
                from: floor.max(EscalationLevel::Thread),
            },
        );
    }
}

/// Search the thread and office procedures, then the host
fn escalate_procedures(
    cell: &Arc<ProcessCell>,
    thread: ThreadKey,
    escalation: Arc<Escalation>,
    from: EscalationLevel,
) {
    if cell.lock().abandoned.is_some() {
        tracing::debug!(
            process = %cell.id,
            escalation = %escalation,
            "dropping escalation of abandoned process"
        );
        return;
    }
    let registry = &cell.office.registry;
    let kind = escalation.kind();
    let procedures = [
        (EscalationLevel::Thread, &registry.thread_procedure),
        (EscalationLevel::Office, &registry.office_procedure),
    ];
    for (level, procedure) in procedures {
        if from > level {
            continue;
        }
        if let Some(handler) = procedure.find(&registry.types, kind) {
            cell.office.metrics.record_handled(level);
            tracing::debug!(
                process = %cell.id,
                level = %level,
                handler = %registry.function(handler).name,
                escalation = %escalation,
                "escalation handled by procedure"
            );
            let mut state = cell.lock();
            let Some(flow) = logged(new_flow(&mut state, thread, None, level.above(), None))
            else {
                return;
            };
            start_function(
                &mut state,
                flow,
                handler,
                None,
                level.above(),
                Some(escalation),
            );
            return;
        }
    }
    escalate_to_host(cell, thread, escalation);
}

fn escalate_to_host(cell: &Arc<ProcessCell>, thread: ThreadKey, escalation: Arc<Escalation>) {
    let handled = match &cell.office.registry.host {
        Some(host) => match catch_unwind(AssertUnwindSafe(|| host.handle_escalation(&escalation))) {
            Ok(Ok(())) => true,
            Ok(Err(failure)) => {
                tracing::error!(
                    process = %cell.id,
                    failure = %failure.report(),
                    "process host handler failed"
                );
                false
            }
            Err(panic) => {
                tracing::error!(
                    process = %cell.id,
                    panic = %crate::panic_message(&*panic),
                    "process host handler panicked"
                );
                false
            }
        },
        None => false,
    };

    if handled {
        cell.office.metrics.record_handled(EscalationLevel::Host);
        tracing::info!(process = %cell.id, escalation = %escalation, "escalation handled by host");
        return;
    }
    cell.lock()
        .escalation
        .get_or_insert_with(|| Arc::clone(&escalation));
    cell.office.metrics.record_unhandled();
    tracing::error!(
        process = %cell.id,
        thread = %thread,
        escalation = %escalation.report(),
        "unhandled escalation, tearing down thread"
    );
    teardown_thread(cell, thread, &escalation);
}

/// Abandon every flow of a thread
fn teardown_thread(cell: &Arc<ProcessCell>, thread: ThreadKey, escalation: &Arc<Escalation>) {
    let containers = {
        let mut state = cell.lock();
        let Some(thread_state) = state.threads.get(thread) else {
            return;
        };
        let flows: Vec<FlowKey> = thread_state.flows.iter().copied().collect();
        let mut containers = Vec::new();
        for flow in flows {
            let Some(flow_state) = state.flows.get_mut(flow) else {
                continue;
            };
            if flow_state.finishing {
                continue;
            }
            flow_state.finishing = true;
            flow_state.resume = None;
            let current = flow_state.current.take();
            if let Some(function) = current.and_then(|key| state.functions.remove(key)) {
                containers.extend(function.objects.into_values());
            }
            state.push_step(
                thread,
                Step::FinishFlow {
                    flow,
                    outcome: FlowOutcome::Abandoned(Arc::clone(escalation)),
                },
            );
        }
        if let Some(thread_state) = state.threads.get_mut(thread) {
            thread_state
                .steps
                .retain(|step| !matches!(step, Step::Execute(_)));
        }
        if !containers.is_empty() {
            state.recycling += 1;
        }
        containers
    };
    if !containers.is_empty() {
        let cleanup = recycle(&cell.office.registry, containers, std::slice::from_ref(escalation));
        finish_recycle(cell, cleanup);
    }
}

/// Tear down a process the office is closing under. Pending objects fail
/// with `escalation`, idle threads are driven here, and busy threads tear
/// down at their next step. The process completes with `escalation`.
pub(crate) fn abandon_process(cell: &Arc<ProcessCell>, escalation: Escalation) {
    let escalation = Arc::new(escalation);
    let (dispatch_to, complete) = {
        let mut state = cell.lock();
        if state.completed {
            return;
        }
        state.abandoned = Some(Arc::clone(&escalation));
        state.escalation.get_or_insert_with(|| Arc::clone(&escalation));
        state.escalations.push(Arc::clone(&escalation));

        for id in state.container_ids() {
            if !state.container(&id).is_some_and(ObjectContainer::is_pending) {
                continue;
            }
            let ticket = state.next_ticket();
            if let Some(container) = state.container_mut(&id) {
                container.expire(ticket, (*escalation).clone());
            }
        }
        let threads: Vec<ThreadKey> = state.threads.keys();
        let dispatch_to: Vec<ThreadKey> = threads
            .into_iter()
            .filter_map(|thread| state.schedule(thread))
            .collect();
        (dispatch_to, state.ready_to_complete())
    };
    tracing::warn!(process = %cell.id, escalation = %escalation, "abandoning process");
    dispatch(cell, dispatch_to);
    if complete {
        complete_process(cell);
    }
}

/// Fold cleanup escalations of one recycle into the process and complete it
/// if that was the last thing outstanding
pub(crate) fn finish_recycle(cell: &Arc<ProcessCell>, cleanup: Vec<CleanupEscalation>) {
    cell.office.metrics.record_cleanup(cleanup.len());
    let complete = {
        let mut state = cell.lock();
        state.cleanup.extend(cleanup);
        state.recycling = state.recycling.saturating_sub(1);
        state.ready_to_complete()
    };
    if complete {
        complete_process(cell);
    }
}

/// Recycle process-scoped objects and deliver the completion once
pub(crate) fn complete_process(cell: &Arc<ProcessCell>) {
    let (containers, escalations) = {
        let mut state = cell.lock();
        if !state.ready_to_complete() {
            return;
        }
        state.completed = true;
        let containers: Vec<ObjectContainer> = state.objects.drain().map(|(_, c)| c).collect();
        (containers, state.escalations.clone())
    };

    let cleanup = recycle(&cell.office.registry, containers, &escalations);
    cell.office.metrics.record_cleanup(cleanup.len());
    let (completion, escalation, cleanup) = {
        let mut state = cell.lock();
        state.cleanup.extend(cleanup);
        (
            state.completion.take(),
            state.escalation.clone(),
            std::mem::take(&mut state.cleanup),
        )
    };

    cell.office.deregister(cell.id);
    cell.office.metrics.record_process_completed();
    tracing::info!(
        process = %cell.id,
        escalated = escalation.is_some(),
        cleanup = cleanup.len(),
        "process complete"
    );
    if let Some(completion) = completion {
        let outcome = crate::office::ProcessCompletion {
            process_id: cell.id,
            escalation,
            cleanup,
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| completion(outcome))) {
            tracing::error!(
                process = %cell.id,
                panic = %crate::panic_message(&*panic),
                "process completion panicked"
            );
        }
    }
}

/// Apply a notification to one container. Wakes its waiters and lets the
/// owning thread or the process notice the object settled. Returns `false`
/// if the notification was stale.
pub(crate) fn notify<F>(cell: &Arc<ProcessCell>, id: &ObjectScopeId, transition: F) -> bool
where
    F: FnOnce(&mut ObjectContainer) -> Option<Vec<FunctionKey>>,
{
    let (dispatch_to, complete) = {
        let mut state = cell.lock();
        let Some(waiters) = state.container_mut(id).and_then(transition) else {
            return false;
        };
        let mut dispatch_to = state.wake(waiters);
        let complete = match state.owning_thread(id) {
            Some(thread) => {
                dispatch_to.extend(state.schedule(thread));
                false
            }
            None => state.ready_to_complete(),
        };
        (dispatch_to, complete)
    };
    dispatch(cell, dispatch_to);
    if complete {
        complete_process(cell);
    }
    true
}

/// Fail every overdue sourcing or asynchronous operation of a process
pub(crate) fn expire_overdue(cell: &Arc<ProcessCell>, now: Instant) -> usize {
    let registry = &cell.office.registry;
    let (expired, dispatch_to, complete) = {
        let mut state = cell.lock();
        let overdue: Vec<ObjectScopeId> = state
            .container_ids()
            .into_iter()
            .filter(|id| state.container(id).is_some_and(|c| c.is_expired(now)))
            .collect();
        let mut dispatch_to = Vec::new();
        for id in &overdue {
            let ticket = state.next_ticket();
            let name = &registry.object(id.object).name;
            let Some(container) = state.container_mut(id) else {
                continue;
            };
            let waiters = container.expire(
                ticket,
                Escalation::timeout(format!("managed object {} timed out", name)),
            );
            cell.office.metrics.record_timeout();
            tracing::warn!(process = %cell.id, object = %name, "managed object timed out");
            dispatch_to.extend(state.wake(waiters));
            if let Some(thread) = state.owning_thread(id) {
                dispatch_to.extend(state.schedule(thread));
            }
        }
        let complete = !overdue.is_empty() && state.ready_to_complete();
        (overdue.len(), dispatch_to, complete)
    };
    dispatch(cell, dispatch_to);
    if complete {
        complete_process(cell);
    }
    expired
}
