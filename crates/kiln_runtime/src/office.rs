//! The office: registration, validation, and process invocation.
//!
//! An [`OfficeBuilder`] collects registrations by name. `build` resolves
//! every name to an index, checks the managed object graph, starts teams and
//! sources, and returns an [`Office`] that invokes processes against the
//! frozen registry.

use crate::config::OfficeConfig;
use crate::engine;
use crate::escalation::{EscalationHandler, EscalationLevel, EscalationProcedure};
use crate::function::{FunctionSpec, Parameter};
use crate::governance::GovernanceSpec;
use crate::managed::container::ObjectContainer;
use crate::managed::user::{ExecuteContext, apply_hooks, process_binding};
use crate::managed::{
    Capability, CleanupEscalation, ManagedObject, ManagedObjectSpec, SourceContext,
};
use crate::monitor::{MetricsSnapshot, OfficeMetrics, TimeoutMonitor};
use crate::process::{CompletionFn, ProcessCell, ProcessState, ThreadState};
use crate::registry::{
    FunctionDef, FunctionIdx, GovernanceDef, GovernanceIdx, ObjectDef, ObjectIdx, Registry,
    TeamIdx,
};
use indexmap::IndexMap;
use kiln_core::{
    Escalation, EscalationTypes, EscalationTypesBuilder, KernelError, KernelResult, ProcessId,
};
use kiln_team::{Team, TeamError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Escalation kind ending processes abandoned by [`Office::close`]
pub const OFFICE_CLOSED: &str = "OfficeClosed";

/// Outcome of a process, delivered exactly once
#[derive(Debug, Clone)]
pub struct ProcessCompletion {
    /// Process that completed
    pub process_id: ProcessId,
    /// First escalation no handler recovered
    pub escalation: Option<Arc<Escalation>>,
    /// Failures raised while recycling managed objects
    pub cleanup: Vec<CleanupEscalation>,
}

impl ProcessCompletion {
    /// Every escalation was recovered by some handler
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.escalation.is_none()
    }
}

pub(crate) struct OfficeInner {
    pub(crate) name: String,
    pub(crate) config: OfficeConfig,
    pub(crate) registry: Registry,
    pub(crate) metrics: OfficeMetrics,
    active: Mutex<HashMap<ProcessId, Arc<ProcessCell>>>,
    closed: AtomicBool,
}

impl OfficeInner {
    fn active(&self) -> MutexGuard<'_, HashMap<ProcessId, Arc<ProcessCell>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timeout for sourcing or operating `object`; zero disables it
    pub(crate) fn timeout_for(&self, object: ObjectIdx) -> Option<Duration> {
        match self.registry.object(object).timeout {
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
            None => self.config.default_timeout(),
        }
    }

    pub(crate) fn deregister(&self, process: ProcessId) {
        self.active().remove(&process);
    }

    /// Create a process starting at `function` and run its first thread on
    /// the calling thread
    pub(crate) fn invoke(
        self: &Arc<Self>,
        function: FunctionIdx,
        parameter: Parameter,
        bound: Option<(ObjectIdx, Arc<dyn ManagedObject>)>,
        completion: CompletionFn,
    ) -> KernelResult<ProcessId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KernelError::OfficeClosed {
                name: self.name.clone(),
            });
        }

        let id = ProcessId::new();
        let mut state = ProcessState::new(completion);
        if let Some((object, managed)) = &bound {
            state
                .objects
                .insert(*object, ObjectContainer::bound(*object, Arc::clone(managed)));
        }
        let thread = state.threads.insert(ThreadState::new())?;
        let flow = engine::new_flow(&mut state, thread, None, EscalationLevel::Function, None)?;
        engine::start_function(
            &mut state,
            flow,
            function,
            parameter,
            EscalationLevel::Function,
            None,
        );
        state.schedule(thread);

        let cell = Arc::new(ProcessCell::new(id, Arc::clone(self), state));
        if let Some((object, managed)) = &bound {
            apply_hooks(&cell, process_binding(*object), managed);
        }
        self.active().insert(id, Arc::clone(&cell));
        self.metrics.record_process_started();
        tracing::info!(
            office = %self.name,
            process = %id,
            function = %self.registry.function(function).name,
            "process started"
        );
        engine::run_thread(cell, thread, None);
        Ok(id)
    }

    /// Expire overdue operations across every active process
    pub(crate) fn check_timeouts(&self, now: Instant) -> usize {
        let cells: Vec<Arc<ProcessCell>> = self.active().values().cloned().collect();
        cells
            .iter()
            .map(|cell| engine::expire_overdue(cell, now))
            .sum()
    }
}

/// A built office
pub struct Office {
    inner: Arc<OfficeInner>,
    monitor: Option<TimeoutMonitor>,
}

impl Office {
    /// Start registering an office
    #[must_use]
    pub fn builder(config: OfficeConfig) -> OfficeBuilder {
        OfficeBuilder::new(config)
    }

    /// Office name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Invoke a process at `function`. The first steps run on the calling
    /// thread until the process suspends, hands off to a team, or completes.
    /// `completion` fires exactly once.
    ///
    /// # Errors
    ///
    /// Returns error if the office is closed or the function is unknown
    pub fn invoke_process<F>(
        &self,
        function: &str,
        parameter: Parameter,
        completion: F,
    ) -> KernelResult<ProcessId>
    where
        F: FnOnce(ProcessCompletion) + Send + 'static,
    {
        let function = self.inner.registry.find_function(function).ok_or_else(|| {
            KernelError::UnknownFunction {
                name: function.to_string(),
            }
        })?;
        self.inner
            .invoke(function, parameter, None, Box::new(completion))
    }

    /// Expire sourcing and asynchronous operations overdue at `now`.
    /// Returns how many expired.
    pub fn check_timeouts(&self, now: Instant) -> usize {
        self.inner.check_timeouts(now)
    }

    /// Current counters
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Processes not yet completed
    #[must_use]
    pub fn active_processes(&self) -> usize {
        self.inner.active().len()
    }

    /// Whether [`Office::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the monitor, sources, and teams. Processes still in flight are
    /// abandoned: their flows end with an `OfficeClosed` escalation and their
    /// completions fire with it. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        let abandoned: Vec<Arc<ProcessCell>> =
            self.inner.active().drain().map(|(_, cell)| cell).collect();
        if !abandoned.is_empty() {
            tracing::warn!(
                office = %self.inner.name,
                processes = abandoned.len(),
                "closing office with processes in flight"
            );
        }
        let closed = KernelError::OfficeClosed {
            name: self.inner.name.clone(),
        };
        for cell in &abandoned {
            engine::abandon_process(cell, Escalation::from_error(OFFICE_CLOSED, &closed));
        }
        for object in &self.inner.registry.objects {
            object.source.stop();
        }
        for team in &self.inner.registry.teams {
            team.stop();
        }
        tracing::info!(office = %self.inner.name, "office closed");
    }
}

impl Drop for Office {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Office {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Office")
            .field("name", &self.inner.name)
            .field("functions", &self.inner.registry.functions.len())
            .field("objects", &self.inner.registry.objects.len())
            .field("teams", &self.inner.registry.teams.len())
            .finish()
    }
}

/// Collects registrations for an [`Office`]
pub struct OfficeBuilder {
    config: OfficeConfig,
    types: EscalationTypesBuilder,
    teams: Vec<(String, Arc<dyn Team>)>,
    functions: Vec<FunctionSpec>,
    objects: Vec<ManagedObjectSpec>,
    governance: Vec<GovernanceSpec>,
    thread_handlers: Vec<(String, String)>,
    office_handlers: Vec<(String, String)>,
    host: Option<Arc<dyn EscalationHandler>>,
    errors: Vec<KernelError>,
}

impl OfficeBuilder {
    /// Create a builder. Teams in `config` are built with the office.
    #[must_use]
    pub fn new(config: OfficeConfig) -> Self {
        Self {
            config,
            types: EscalationTypesBuilder::new(),
            teams: Vec::new(),
            functions: Vec::new(),
            objects: Vec::new(),
            governance: Vec::new(),
            thread_handlers: Vec::new(),
            office_handlers: Vec::new(),
            host: None,
            errors: Vec::new(),
        }
    }

    /// Register a team instance under `name`
    #[must_use]
    pub fn with_team(mut self, name: impl Into<String>, team: Arc<dyn Team>) -> Self {
        self.teams.push((name.into(), team));
        self
    }

    /// Declare escalation kind `name` as a subtype of `parent`
    #[must_use]
    pub fn with_escalation_type(
        mut self,
        name: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        if let Err(error) = self.types.declare(name, parent) {
            self.errors.push(error);
        }
        self
    }

    /// Register a function
    #[must_use]
    pub fn with_function(mut self, function: FunctionSpec) -> Self {
        self.functions.push(function);
        self
    }

    /// Register a managed object
    #[must_use]
    pub fn with_managed_object(mut self, object: ManagedObjectSpec) -> Self {
        self.objects.push(object);
        self
    }

    /// Register a governance
    #[must_use]
    pub fn with_governance(mut self, governance: GovernanceSpec) -> Self {
        self.governance.push(governance);
        self
    }

    /// Handle escalations of `kind` reaching a thread with `function`
    #[must_use]
    pub fn with_thread_handler(
        mut self,
        kind: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        self.thread_handlers.push((kind.into(), function.into()));
        self
    }

    /// Handle escalations of `kind` reaching the office with `function`
    #[must_use]
    pub fn with_office_handler(
        mut self,
        kind: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        self.office_handlers.push((kind.into(), function.into()));
        self
    }

    /// Last handler before a thread is torn down
    #[must_use]
    pub fn with_host_handler(mut self, handler: impl EscalationHandler) -> Self {
        self.host = Some(Arc::new(handler));
        self
    }

    /// Resolve registrations, start teams and sources, and build the office
    ///
    /// # Errors
    ///
    /// Returns the first registration error: unknown or duplicate names,
    /// unlinked source keys, scope violations, dependency cycles, source
    /// initialisation failures, or invalid configuration
    pub fn build(self) -> KernelResult<Office> {
        let Self {
            config,
            types,
            teams: registered_teams,
            functions,
            objects,
            governance,
            thread_handlers,
            office_handlers,
            host,
            errors,
        } = self;
        if let Some(error) = errors.into_iter().next() {
            return Err(error);
        }
        config.validate()?;
        let types = types.build()?;

        let mut teams: Vec<(String, Arc<dyn Team>)> = Vec::new();
        for team in &config.teams {
            teams.push((team.name.clone(), team.build().map_err(team_error)?));
        }
        teams.extend(registered_teams);
        let team_index = index_names("Team", teams.iter().map(|(name, _)| name.as_str()), TeamIdx)?;
        let function_index =
            index_names("Function", functions.iter().map(|f| f.name.as_str()), FunctionIdx)?;
        let object_index =
            index_names("Managed object", objects.iter().map(|o| o.name.as_str()), ObjectIdx)?;
        let governance_index = index_names(
            "Governance",
            governance.iter().map(|g| g.name.as_str()),
            GovernanceIdx,
        )?;

        let object_defs = objects
            .into_iter()
            .map(|spec| resolve_object(spec, &object_index, &function_index))
            .collect::<KernelResult<Vec<_>>>()?;
        check_scopes(&object_defs)?;
        check_cycles(&object_defs)?;

        let governance_defs = governance
            .into_iter()
            .map(|spec| {
                let objects = spec
                    .objects
                    .iter()
                    .map(|name| find_object(&object_index, name))
                    .collect::<KernelResult<Vec<_>>>()?;
                Ok(GovernanceDef {
                    name: spec.name,
                    factory: spec.factory,
                    objects,
                })
            })
            .collect::<KernelResult<Vec<_>>>()?;

        let function_defs = functions
            .into_iter()
            .map(|spec| {
                resolve_function(
                    spec,
                    &types,
                    &function_index,
                    &object_index,
                    &team_index,
                    &governance_index,
                    &object_defs,
                )
            })
            .collect::<KernelResult<Vec<_>>>()?;
        let thread_procedure = resolve_procedure(&types, &thread_handlers, &function_index)?;
        let office_procedure = resolve_procedure(&types, &office_handlers, &function_index)?;

        let registry = Registry {
            types,
            functions: function_defs,
            function_index,
            objects: object_defs,
            object_index,
            governance: governance_defs,
            teams: teams.into_iter().map(|(_, team)| team).collect(),
            thread_procedure,
            office_procedure,
            host,
        };

        for team in &registry.teams {
            if let Err(error) = team.start() {
                registry.teams.iter().for_each(|team| team.stop());
                return Err(team_error(error));
            }
            tracing::info!(team = team.name(), "team started");
        }

        let inner = Arc::new(OfficeInner {
            name: config.name.clone(),
            config,
            registry,
            metrics: OfficeMetrics::new(),
            active: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        for (index, object) in inner.registry.objects.iter().enumerate() {
            let context = ExecuteContext::new(Arc::downgrade(&inner), ObjectIdx(index));
            if let Err(escalation) = object.source.start(context) {
                inner.registry.teams.iter().for_each(|team| team.stop());
                return Err(KernelError::Source {
                    name: object.name.clone(),
                    reason: escalation.to_string(),
                });
            }
        }

        let monitor = match inner.config.monitor_interval() {
            Some(interval) => Some(
                TimeoutMonitor::spawn(Arc::downgrade(&inner), &inner.name, interval).map_err(
                    |err| KernelError::Config {
                        reason: format!("timeout monitor: {}", err),
                    },
                )?,
            ),
            None => None,
        };

        tracing::info!(
            office = %inner.name,
            functions = inner.registry.functions.len(),
            objects = inner.registry.objects.len(),
            teams = inner.registry.teams.len(),
            "office built"
        );
        Ok(Office { inner, monitor })
    }
}

impl std::fmt::Debug for OfficeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfficeBuilder")
            .field("config", &self.config)
            .field("functions", &self.functions.len())
            .field("objects", &self.objects.len())
            .finish_non_exhaustive()
    }
}

fn team_error(error: TeamError) -> KernelError {
    KernelError::Config {
        reason: error.to_string(),
    }
}

fn index_names<'a, I>(
    kind: &str,
    names: impl Iterator<Item = &'a str>,
    make: impl Fn(usize) -> I,
) -> KernelResult<HashMap<String, I>> {
    let mut index = HashMap::new();
    for (position, name) in names.enumerate() {
        if index.insert(name.to_string(), make(position)).is_some() {
            return Err(KernelError::Duplicate {
                kind: kind.to_string(),
                name: name.to_string(),
            });
        }
    }
    Ok(index)
}

fn find_function(index: &HashMap<String, FunctionIdx>, name: &str) -> KernelResult<FunctionIdx> {
    index
        .get(name)
        .copied()
        .ok_or_else(|| KernelError::UnknownFunction {
            name: name.to_string(),
        })
}

fn find_object(index: &HashMap<String, ObjectIdx>, name: &str) -> KernelResult<ObjectIdx> {
    index
        .get(name)
        .copied()
        .ok_or_else(|| KernelError::UnknownManagedObject {
            name: name.to_string(),
        })
}

fn resolve_object(
    spec: ManagedObjectSpec,
    objects: &HashMap<String, ObjectIdx>,
    functions: &HashMap<String, FunctionIdx>,
) -> KernelResult<ObjectDef> {
    let context = SourceContext::new(&spec.name, &spec.properties);
    let metadata = spec
        .source
        .init(&context)
        .map_err(|escalation| KernelError::Source {
            name: spec.name.clone(),
            reason: escalation.to_string(),
        })?;

    let unlinked = |kind: &str, key: &str| KernelError::UnlinkedKey {
        object: spec.name.clone(),
        kind: kind.to_string(),
        key: key.to_string(),
    };
    if let Some(key) = metadata
        .dependencies
        .iter()
        .find(|key| !spec.dependencies.iter().any(|(linked, _)| linked == *key))
    {
        return Err(unlinked("dependency", key));
    }
    if let Some(key) = metadata
        .flows
        .iter()
        .find(|key| !spec.flows.iter().any(|(linked, _)| linked == *key))
    {
        return Err(unlinked("flow", key));
    }

    let dependencies = spec
        .dependencies
        .iter()
        .map(|(key, object)| Ok((key.clone(), find_object(objects, object)?)))
        .collect::<KernelResult<Vec<_>>>()?;
    let flows = spec
        .flows
        .iter()
        .map(|(key, function)| Ok((key.clone(), find_function(functions, function)?)))
        .collect::<KernelResult<IndexMap<_, _>>>()?;
    let mut capabilities = metadata.capabilities;
    if !dependencies.is_empty() {
        capabilities = capabilities.with(Capability::Coordinating);
    }

    Ok(ObjectDef {
        name: spec.name,
        source: spec.source,
        scope: spec.scope,
        capabilities,
        dependencies,
        flows,
        timeout: spec.timeout,
        pool: spec.pool,
        recycle: spec.recycle,
    })
}

/// An object may only depend on objects living at least as long
fn check_scopes(objects: &[ObjectDef]) -> KernelResult<()> {
    for object in objects {
        for (_, dependency) in &object.dependencies {
            let dependency = &objects[dependency.0];
            if dependency.scope < object.scope {
                return Err(KernelError::ScopeViolation {
                    object: object.name.clone(),
                    dependency: dependency.name.clone(),
                });
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

fn check_cycles(objects: &[ObjectDef]) -> KernelResult<()> {
    fn visit(
        objects: &[ObjectDef],
        index: usize,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> KernelResult<()> {
        match marks[index] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = path.iter().position(|p| *p == index).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|p| objects[*p].name.clone()).collect();
                cycle.push(objects[index].name.clone());
                return Err(KernelError::DependencyCycle { path: cycle });
            }
            Mark::Unvisited => {}
        }
        marks[index] = Mark::Visiting;
        path.push(index);
        for (_, dependency) in &objects[index].dependencies {
            visit(objects, dependency.0, marks, path)?;
        }
        path.pop();
        marks[index] = Mark::Done;
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; objects.len()];
    let mut path = Vec::new();
    for index in 0..objects.len() {
        visit(objects, index, &mut marks, &mut path)?;
    }
    Ok(())
}

/// `declared` plus their transitive dependencies, dependencies first
fn load_order(objects: &[ObjectDef], declared: &[ObjectIdx]) -> Vec<ObjectIdx> {
    fn visit(objects: &[ObjectDef], object: ObjectIdx, order: &mut Vec<ObjectIdx>) {
        if order.contains(&object) {
            return;
        }
        for (_, dependency) in &objects[object.0].dependencies {
            visit(objects, *dependency, order);
        }
        order.push(object);
    }

    let mut order = Vec::new();
    for object in declared {
        visit(objects, *object, &mut order);
    }
    order
}

#[allow(clippy::too_many_arguments)]
fn resolve_function(
    spec: FunctionSpec,
    types: &EscalationTypes,
    functions: &HashMap<String, FunctionIdx>,
    objects: &HashMap<String, ObjectIdx>,
    teams: &HashMap<String, TeamIdx>,
    governance: &HashMap<String, GovernanceIdx>,
    object_defs: &[ObjectDef],
) -> KernelResult<FunctionDef> {
    let next = spec
        .next
        .as_deref()
        .map(|name| find_function(functions, name))
        .transpose()?;
    let team = spec
        .team
        .as_deref()
        .map(|name| {
            teams
                .get(name)
                .copied()
                .ok_or_else(|| KernelError::UnknownTeam {
                    name: name.to_string(),
                })
        })
        .transpose()?;
    let declared = spec
        .objects
        .iter()
        .map(|name| find_object(objects, name))
        .collect::<KernelResult<Vec<_>>>()?;
    let load = load_order(object_defs, &declared);
    let handlers = resolve_procedure(types, &spec.handlers, functions)?;
    let required = spec
        .governance
        .iter()
        .map(|name| {
            governance
                .get(name)
                .copied()
                .ok_or_else(|| KernelError::UnknownGovernance { name: name.clone() })
        })
        .collect::<KernelResult<Vec<_>>>()?;

    Ok(FunctionDef {
        name: spec.name,
        logic: spec.logic,
        next,
        team,
        objects: declared,
        load,
        handlers,
        governance: required,
    })
}

fn resolve_procedure(
    types: &EscalationTypes,
    handlers: &[(String, String)],
    functions: &HashMap<String, FunctionIdx>,
) -> KernelResult<EscalationProcedure> {
    let mut procedure = EscalationProcedure::default();
    for (kind, function) in handlers {
        let kind = types
            .id(kind)
            .ok_or_else(|| KernelError::UnknownEscalationType { name: kind.clone() })?;
        procedure.push(kind, find_function(functions, function)?);
    }
    Ok(procedure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowCallback, FlowRequest};
    use crate::function::{FunctionContext, parameter};
    use crate::governance::tests::Recording;
    use crate::managed::{
        AsyncOperation, AsynchronousContext, IdlePool, ManagedObjectScope, ManagedObjectSource,
        ManagedObjectUser, ObjectValue, SourceMetadata, ValueObject,
    };
    use kiln_team::TeamConfig;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    type Log = Arc<Mutex<Vec<String>>>;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn config() -> OfficeConfig {
        OfficeConfig::new("test").with_monitor_interval(Duration::ZERO)
    }

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    /// Function that records its name and succeeds
    fn step(name: &str, log: &Log) -> FunctionSpec {
        let log = Arc::clone(log);
        let entry = name.to_string();
        FunctionSpec::new(name, move |_ctx| {
            log.lock().unwrap().push(entry.clone());
            Ok(())
        })
    }

    /// Function that records its name and escalates `kind`
    fn failing(name: &str, kind: &'static str, log: &Log) -> FunctionSpec {
        let log = Arc::clone(log);
        let entry = name.to_string();
        FunctionSpec::new(name, move |_ctx| {
            log.lock().unwrap().push(entry.clone());
            Err(Escalation::new(kind, format!("{} failed", entry)))
        })
    }

    /// Handler that records the kind of escalation it received
    fn handler(name: &str, log: &Log) -> FunctionSpec {
        let log = Arc::clone(log);
        let entry = name.to_string();
        FunctionSpec::new(name, move |ctx| {
            let kind = ctx
                .escalation()
                .map(|e| e.kind().to_string())
                .unwrap_or_default();
            log.lock().unwrap().push(format!("{}:{}", entry, kind));
            Ok(())
        })
    }

    fn invoke(
        office: &Office,
        function: &str,
        parameter: Parameter,
    ) -> mpsc::Receiver<ProcessCompletion> {
        let (tx, rx) = mpsc::channel();
        office
            .invoke_process(function, parameter, move |completion| {
                let _ = tx.send(completion);
            })
            .unwrap();
        rx
    }

    /// Source that keeps its users so a test can answer later
    #[derive(Default)]
    struct DeferredSource {
        users: Arc<Mutex<Vec<ManagedObjectUser>>>,
    }

    impl ManagedObjectSource for DeferredSource {
        fn source(&self, user: ManagedObjectUser) {
            self.users.lock().unwrap().push(user);
        }
    }

    /// Connection whose asynchronous operations are driven by the test
    #[derive(Default)]
    struct Connection {
        context: Mutex<Option<AsynchronousContext>>,
        operations: Mutex<Vec<AsyncOperation>>,
    }

    impl Connection {
        fn begin(&self) {
            let operation = self.context.lock().unwrap().as_ref().map(AsynchronousContext::start);
            if let Some(operation) = operation {
                self.operations.lock().unwrap().push(operation);
            }
        }

        fn operation(&self) -> AsyncOperation {
            self.operations.lock().unwrap()[0].clone()
        }
    }

    struct ConnectionObject(Arc<Connection>);

    impl ManagedObject for ConnectionObject {
        fn object(&self) -> ObjectValue {
            Arc::clone(&self.0) as ObjectValue
        }

        fn set_asynchronous_context(&self, context: AsynchronousContext) {
            *self.0.context.lock().unwrap() = Some(context);
        }
    }

    struct ConnectionSource {
        connection: Arc<Connection>,
    }

    impl ManagedObjectSource for ConnectionSource {
        fn init(&self, _context: &SourceContext<'_>) -> Result<SourceMetadata, Escalation> {
            Ok(SourceMetadata::new().with_capability(Capability::Asynchronous))
        }

        fn source(&self, user: ManagedObjectUser) {
            user.set_managed_object(Arc::new(ConnectionObject(Arc::clone(&self.connection))));
        }
    }

    /// `begin` starts an operation on `conn`; `use` needs `conn` afterwards
    fn connection_office(
        connection: &Arc<Connection>,
        log: &Log,
        timeout: Option<Duration>,
    ) -> Office {
        let mut object = ManagedObjectSpec::new(
            "conn",
            ManagedObjectScope::Thread,
            ConnectionSource {
                connection: Arc::clone(connection),
            },
        );
        if let Some(timeout) = timeout {
            object = object.with_timeout(timeout);
        }
        OfficeBuilder::new(config())
            .with_managed_object(object)
            .with_function(
                FunctionSpec::new("begin", |ctx| {
                    ctx.object::<Connection>("conn")?.begin();
                    Ok(())
                })
                .with_object("conn")
                .with_next("use"),
            )
            .with_function(step("use", log).with_object("conn"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_linked_functions_run_in_order() {
        init_tracing();
        let log = log();
        let seen = Arc::clone(&log);
        let office = OfficeBuilder::new(config())
            .with_function(
                FunctionSpec::new("a", move |ctx| {
                    let amount = *ctx.parameter::<u32>().unwrap_or(&0);
                    seen.lock().unwrap().push(format!("a:{}", amount));
                    ctx.set_next_parameter(amount * 2);
                    Ok(())
                })
                .with_next("b"),
            )
            .with_function({
                let log = Arc::clone(&log);
                FunctionSpec::new("b", move |ctx| {
                    let amount = *ctx.parameter::<u32>().unwrap_or(&0);
                    log.lock().unwrap().push(format!("b:{}", amount));
                    Ok(())
                })
                .with_next("c")
            })
            .with_function(step("c", &log))
            .build()
            .unwrap();

        let completion = invoke(&office, "a", parameter(21u32)).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert!(completion.cleanup.is_empty());
        assert_eq!(entries(&log), vec!["a:21", "b:42", "c"]);

        let metrics = office.metrics();
        assert_eq!(metrics.functions_executed, 3);
        assert_eq!(metrics.processes_completed, 1);
        assert_eq!(office.active_processes(), 0);
    }

    #[test]
    fn test_ancestor_handler_receives_escalation() {
        init_tracing();
        let log = log();
        let received = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&received);
        let office = OfficeBuilder::new(config())
            .with_escalation_type("IoError", "Failure")
            .with_function(step("a", &log).with_next("b"))
            .with_function(
                step("b", &log)
                    .with_next("c")
                    .with_handler("IoError", "recover"),
            )
            .with_function(
                FunctionSpec::new("c", |_ctx| {
                    Err(Escalation::new("IoError", "disk gone").with_payload(7u32))
                })
                .with_next("d"),
            )
            .with_function(step("d", &log))
            .with_function({
                let log = Arc::clone(&log);
                FunctionSpec::new("recover", move |ctx| {
                    log.lock().unwrap().push("recover".to_string());
                    *slot.lock().unwrap() = ctx.escalation().cloned();
                    Ok(())
                })
                .with_next("after")
            })
            .with_function(step("after", &log))
            .build()
            .unwrap();

        let completion = invoke(&office, "a", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(entries(&log), vec!["a", "b", "recover", "after"]);

        let escalation = received.lock().unwrap().clone().unwrap();
        assert!(escalation.is("IoError"));
        assert_eq!(escalation.message(), "disk gone");
        assert_eq!(escalation.payload::<u32>(), Some(&7));
        assert_eq!(office.metrics().handled_function, 1);
    }

    #[test]
    fn test_exact_handler_beats_supertype() {
        init_tracing();
        let log = log();
        let office = OfficeBuilder::new(config())
            .with_escalation_type("IoError", "Failure")
            .with_function(
                failing("read", "IoError", &log)
                    .with_handler("Failure", "generic")
                    .with_handler("IoError", "specific"),
            )
            .with_function(handler("generic", &log))
            .with_function(handler("specific", &log))
            .build()
            .unwrap();

        invoke(&office, "read", None).recv_timeout(WAIT).unwrap();
        assert_eq!(entries(&log), vec!["read", "specific:IoError"]);
    }

    #[test]
    fn test_escalate_callback_fires_once_and_handles() {
        init_tracing();
        let log = log();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let office = OfficeBuilder::new(config())
            .with_function(FunctionSpec::new("entry", move |ctx| {
                let counted = Arc::clone(&counted);
                ctx.do_flow(FlowRequest::parallel("child").with_callback(FlowCallback::escalate(
                    move |outcome| {
                        counted.fetch_add(1, Ordering::SeqCst);
                        assert!(outcome.is_some_and(|e| e.is("Boom")));
                        Ok(())
                    },
                )))
            }))
            .with_function(failing("child", "Boom", &log).with_next("never"))
            .with_function(step("never", &log))
            .build()
            .unwrap();

        let completion = invoke(&office, "entry", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(entries(&log), vec!["child"]);
        assert_eq!(office.metrics().handled_callback, 1);
    }

    /// Escalate-style callback recording `name:ok` or `name:<kind>`
    fn outcome_callback(name: &'static str, log: &Log) -> FlowCallback {
        let log = Arc::clone(log);
        FlowCallback::escalate(move |outcome| {
            let result = outcome.map_or_else(|| "ok".to_string(), |e| e.kind().to_string());
            log.lock().unwrap().push(format!("{}:{}", name, result));
            Ok(())
        })
    }

    #[test]
    fn test_flow_callback_succeeds_when_ancestor_recovers() {
        init_tracing();
        let callbacks = log();
        let log = log();
        let outcomes = Arc::clone(&callbacks);
        let office = OfficeBuilder::new(config())
            .with_escalation_type("Boom", "Failure")
            .with_function(FunctionSpec::new("entry", move |ctx| {
                ctx.do_flow(
                    FlowRequest::parallel("a").with_callback(outcome_callback("a", &outcomes)),
                )
            }))
            .with_function(
                step("a", &log)
                    .with_handler("Boom", "recover")
                    .with_next("c"),
            )
            .with_function(failing("c", "Boom", &log))
            .with_function(handler("recover", &log))
            .build()
            .unwrap();

        let completion = invoke(&office, "entry", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(entries(&log), vec!["a", "c", "recover:Boom"]);
        assert_eq!(entries(&callbacks), vec!["a:ok"]);
        let metrics = office.metrics();
        assert_eq!(metrics.handled_function, 1);
        assert_eq!(metrics.handled_callback, 0);
    }

    #[test]
    fn test_handler_in_one_flow_leaves_sibling_alone() {
        init_tracing();
        let callbacks = log();
        let log = log();
        let outcomes = Arc::clone(&callbacks);
        let office = OfficeBuilder::new(config())
            .with_escalation_type("Boom", "Failure")
            .with_function(FunctionSpec::new("entry", move |ctx| {
                ctx.do_flow(
                    FlowRequest::parallel("left")
                        .with_callback(outcome_callback("left", &outcomes)),
                )?;
                ctx.do_flow(
                    FlowRequest::parallel("right")
                        .with_callback(outcome_callback("right", &outcomes)),
                )
            }))
            .with_function(failing("left", "Boom", &log).with_handler("Boom", "left_recover"))
            .with_function(handler("left_recover", &log))
            .with_function(
                step("right", &log)
                    .with_handler("Boom", "right_recover")
                    .with_next("right_next"),
            )
            .with_function(step("right_next", &log))
            .with_function(handler("right_recover", &log))
            .build()
            .unwrap();

        let completion = invoke(&office, "entry", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());

        let ran = entries(&log);
        assert_eq!(ran.len(), 4);
        for name in ["left", "left_recover:Boom", "right", "right_next"] {
            assert!(ran.iter().any(|entry| entry == name), "{} missing", name);
        }
        let mut fired = entries(&callbacks);
        fired.sort();
        assert_eq!(fired, vec!["left:ok", "right:ok"]);
        assert_eq!(office.metrics().handled_function, 1);
    }

    #[test]
    fn test_observer_lets_thread_procedure_handle() {
        init_tracing();
        let log = log();
        let observed = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&observed);
        let office = OfficeBuilder::new(config())
            .with_function(FunctionSpec::new("entry", move |ctx| {
                let counted = Arc::clone(&counted);
                ctx.do_flow(
                    FlowRequest::sequential("child").with_callback(FlowCallback::observe(
                        move |_| {
                            counted.fetch_add(1, Ordering::SeqCst);
                        },
                    )),
                )
            }))
            .with_function(failing("child", "Boom", &log))
            .with_function(handler("on_thread", &log))
            .with_thread_handler("Failure", "on_thread")
            .build()
            .unwrap();

        let completion = invoke(&office, "entry", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(entries(&log), vec!["child", "on_thread:Boom"]);
        assert_eq!(office.metrics().handled_thread, 1);
    }

    #[test]
    fn test_failing_handlers_move_outward() {
        init_tracing();
        let log = log();
        let office = OfficeBuilder::new(config())
            .with_escalation_type("Boom", "Failure")
            .with_function(failing("work", "Boom", &log).with_handler("Boom", "recover"))
            .with_function(failing("recover", "Worse", &log))
            .with_function(failing("on_thread", "Worst", &log))
            .with_function(handler("on_office", &log))
            .with_thread_handler("Failure", "on_thread")
            .with_office_handler("Failure", "on_office")
            .build()
            .unwrap();

        let completion = invoke(&office, "work", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(
            entries(&log),
            vec!["work", "recover", "on_thread", "on_office:Worst"]
        );
        let metrics = office.metrics();
        assert_eq!(metrics.handled_function, 1);
        assert_eq!(metrics.handled_thread, 1);
        assert_eq!(metrics.handled_office, 1);
    }

    #[test]
    fn test_host_handler_recovers_escalation() {
        init_tracing();
        let log = log();
        let hosted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&hosted);
        let office = OfficeBuilder::new(config())
            .with_function(FunctionSpec::new("explode", |_ctx| panic!("kaboom")))
            .with_host_handler(move |escalation: &Escalation| {
                sink.lock().unwrap().push(escalation.kind().to_string());
                Ok(())
            })
            .build()
            .unwrap();

        let completion = invoke(&office, "explode", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(*hosted.lock().unwrap(), vec!["Defect"]);
        let metrics = office.metrics();
        assert_eq!(metrics.handled_host, 1);
        assert_eq!(metrics.unhandled, 0);
        assert!(entries(&log).is_empty());
    }

    #[test]
    fn test_failed_host_tears_down_thread() {
        init_tracing();
        let log = log();
        let source = DeferredSource::default();
        let users = Arc::clone(&source.users);
        let abandoned = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&abandoned);
        let office = OfficeBuilder::new(config())
            .with_managed_object(ManagedObjectSpec::new(
                "slow",
                ManagedObjectScope::Thread,
                source,
            ))
            .with_function(
                FunctionSpec::new("entry", move |ctx| {
                    let slot = Arc::clone(&slot);
                    ctx.do_flow(FlowRequest::parallel("waiter").with_callback(
                        FlowCallback::observe(move |outcome| {
                            *slot.lock().unwrap() = outcome.map(|e| e.kind().to_string());
                        }),
                    ))
                })
                .with_next("fail"),
            )
            .with_function(step("waiter", &log).with_object("slow"))
            .with_function(failing("fail", "Boom", &log))
            .with_host_handler(|escalation: &Escalation| {
                Err(Escalation::new("HostDown", "cannot handle").with_cause(escalation.clone()))
            })
            .build()
            .unwrap();

        let rx = invoke(&office, "entry", None);
        // The sourcing request keeps the thread alive
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(abandoned.lock().unwrap().as_deref(), Some("Boom"));

        let user = users.lock().unwrap().pop().unwrap();
        assert!(user.set_managed_object(Arc::new(ValueObject::new(1u8))));
        let completion = rx.recv_timeout(WAIT).unwrap();
        assert!(completion.escalation.unwrap().is("Boom"));
        assert_eq!(entries(&log), vec!["fail"]);
        assert_eq!(office.metrics().unhandled, 1);
    }

    #[test]
    fn test_async_notification_resumes_once() {
        init_tracing();
        let log = log();
        let connection = Arc::new(Connection::default());
        let office = connection_office(&connection, &log, None);

        let rx = invoke(&office, "begin", None);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(entries(&log).is_empty());

        let operation = connection.operation();
        assert!(operation.is_active());
        assert!(operation.complete());
        assert!(!operation.complete());

        let completion = rx.recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(entries(&log), vec!["use"]);
        assert_eq!(office.metrics().suspensions, 1);
    }

    #[test]
    fn test_overlapping_operations_resume_after_last() {
        init_tracing();
        let log = log();
        let connection = Arc::new(Connection::default());
        let office = connection_office(&connection, &log, None);

        let rx = invoke(&office, "begin", None);
        connection.begin();
        let operations = connection.operations.lock().unwrap().clone();
        assert_eq!(operations.len(), 2);
        assert!(operations.iter().all(AsyncOperation::is_active));

        assert!(operations[0].complete());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(entries(&log).is_empty());

        assert!(operations[1].complete());
        let completion = rx.recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(entries(&log), vec!["use"]);
    }

    #[test]
    fn test_timeout_escalates_and_rejects_late_notification() {
        init_tracing();
        let log = log();
        let connection = Arc::new(Connection::default());
        let office = connection_office(&connection, &log, Some(Duration::from_millis(10)));

        let rx = invoke(&office, "begin", None);
        assert_eq!(office.check_timeouts(Instant::now()), 0);
        assert_eq!(office.check_timeouts(Instant::now() + Duration::from_secs(1)), 1);

        let completion = rx.recv_timeout(WAIT).unwrap();
        assert!(completion.escalation.unwrap().is("Timeout"));
        assert!(!connection.operation().complete());
        assert!(entries(&log).is_empty());
        assert_eq!(office.metrics().timeouts, 1);
    }

    #[test]
    fn test_monitor_expires_sourcing() {
        init_tracing();
        let log = log();
        let source = DeferredSource::default();
        let users = Arc::clone(&source.users);
        let office = OfficeBuilder::new(
            OfficeConfig::new("monitored").with_monitor_interval(Duration::from_millis(5)),
        )
        .with_managed_object(
            ManagedObjectSpec::new("slow", ManagedObjectScope::Function, source)
                .with_timeout(Duration::from_millis(20)),
        )
        .with_function(step("entry", &log).with_object("slow"))
        .build()
        .unwrap();

        let completion = invoke(&office, "entry", None).recv_timeout(WAIT).unwrap();
        assert!(completion.escalation.unwrap().is("Timeout"));
        let user = users.lock().unwrap().pop().unwrap();
        assert!(!user.set_managed_object(Arc::new(ValueObject::new(1u8))));
    }

    #[test]
    fn test_thread_object_keeps_process_pending() {
        init_tracing();
        let log = log();
        let source = DeferredSource::default();
        let users = Arc::clone(&source.users);
        let seen = Arc::clone(&log);
        let office = OfficeBuilder::new(config())
            .with_managed_object(ManagedObjectSpec::new(
                "session",
                ManagedObjectScope::Thread,
                source,
            ))
            .with_function(
                FunctionSpec::new("entry", move |ctx| {
                    let request = ctx.parameter::<String>().cloned().unwrap_or_default();
                    let session = ctx.object::<String>("session")?;
                    seen.lock().unwrap().push(format!("{}@{}", request, session));
                    Ok(())
                })
                .with_object("session"),
            )
            .build()
            .unwrap();

        let rx = invoke(&office, "entry", parameter("request".to_string()));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(office.active_processes(), 1);

        let user = users.lock().unwrap().pop().unwrap();
        assert!(user.set_managed_object(Arc::new(ValueObject::new("session-1".to_string()))));
        let completion = rx.recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(entries(&log), vec!["request@session-1"]);
        assert_eq!(office.active_processes(), 0);
    }

    fn governed_office(log: &Log, failing_b: bool) -> Office {
        let tx_log = Arc::clone(log);
        let b = if failing_b {
            failing("b", "Boom", log)
        } else {
            step("b", log).with_next("c")
        };
        OfficeBuilder::new(config())
            .with_managed_object(ManagedObjectSpec::from_fn(
                "conn",
                ManagedObjectScope::Thread,
                || Ok(5u8),
            ))
            .with_governance(
                GovernanceSpec::new("tx", move || Recording {
                    log: Arc::clone(&tx_log),
                    fail_enforce: false,
                })
                .with_object("conn"),
            )
            .with_function(
                step("a", log)
                    .with_object("conn")
                    .with_governance("tx")
                    .with_next("b")
                    .with_handler("Failure", "recover"),
            )
            .with_function(b.with_governance("tx"))
            .with_function(step("c", log))
            .with_function(step("recover", log))
            .build()
            .unwrap()
    }

    #[test]
    fn test_governance_enforced_on_leaving_run() {
        init_tracing();
        let log = log();
        let office = governed_office(&log, false);

        let completion = invoke(&office, "a", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(entries(&log), vec!["govern:conn", "a", "b", "enforce", "c"]);
    }

    #[test]
    fn test_governance_disregarded_on_escalation() {
        init_tracing();
        let log = log();
        let office = governed_office(&log, true);

        let completion = invoke(&office, "a", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(
            entries(&log),
            vec!["govern:conn", "a", "b", "disregard", "recover"]
        );
    }

    #[test]
    fn test_enforce_failure_escalates() {
        init_tracing();
        let log = log();
        let tx_log = Arc::clone(&log);
        let office = OfficeBuilder::new(config())
            .with_governance(GovernanceSpec::new("tx", move || Recording {
                log: Arc::clone(&tx_log),
                fail_enforce: true,
            }))
            .with_function(step("only", &log).with_governance("tx"))
            .build()
            .unwrap();

        let completion = invoke(&office, "only", None).recv_timeout(WAIT).unwrap();
        assert!(completion.escalation.unwrap().is("CommitFailed"));
        assert_eq!(entries(&log), vec!["only", "enforce"]);
    }

    #[test]
    fn test_sequential_flows_run_before_next() {
        init_tracing();
        let log = log();
        let seen = Arc::clone(&log);
        let office = OfficeBuilder::new(config())
            .with_function(
                FunctionSpec::new("a", move |ctx| {
                    seen.lock().unwrap().push("a".to_string());
                    ctx.do_flow(FlowRequest::sequential("s1"))?;
                    ctx.do_flow(FlowRequest::sequential("s2"))
                })
                .with_next("b"),
            )
            .with_function(step("s1", &log).with_next("s1b"))
            .with_function(step("s1b", &log))
            .with_function(step("s2", &log))
            .with_function(step("b", &log))
            .build()
            .unwrap();

        invoke(&office, "a", None).recv_timeout(WAIT).unwrap();
        assert_eq!(entries(&log), vec!["a", "s1", "s1b", "s2", "b"]);
    }

    #[test]
    fn test_unknown_flow_function_escalates() {
        init_tracing();
        let office = OfficeBuilder::new(config())
            .with_function(FunctionSpec::new("a", |ctx| {
                ctx.do_flow(FlowRequest::parallel("missing"))
            }))
            .build()
            .unwrap();

        let completion = invoke(&office, "a", None).recv_timeout(WAIT).unwrap();
        assert!(completion.escalation.unwrap().is("Defect"));
    }

    #[test]
    fn test_asynchronous_flow_gets_own_thread_objects() {
        init_tracing();
        let sourced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sourced);
        let office = OfficeBuilder::new(config())
            .with_managed_object(ManagedObjectSpec::from_fn(
                "scratch",
                ManagedObjectScope::Thread,
                move || Ok(counter.fetch_add(1, Ordering::SeqCst)),
            ))
            .with_function(
                FunctionSpec::new("entry", |ctx| {
                    ctx.object::<usize>("scratch")?;
                    ctx.do_flow(FlowRequest::asynchronous("side"))
                })
                .with_object("scratch")
                .with_next("again"),
            )
            .with_function(FunctionSpec::new("again", |_| Ok(())).with_object("scratch"))
            .with_function(FunctionSpec::new("side", |_| Ok(())).with_object("scratch"))
            .build()
            .unwrap();

        let completion = invoke(&office, "entry", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(sourced.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_team_handoff() {
        init_tracing();
        fn record(
            names: &Arc<Mutex<Vec<String>>>,
        ) -> impl Fn(&mut FunctionContext<'_>) -> Result<(), Escalation> + Send + Sync + 'static
        {
            let names = Arc::clone(names);
            move |_ctx| {
                let name = std::thread::current().name().unwrap_or("").to_string();
                names.lock().unwrap().push(name);
                Ok(())
            }
        }

        let names = Arc::new(Mutex::new(Vec::new()));
        let office = OfficeBuilder::new(config().with_team(TeamConfig::worker("io", 1)))
            .with_function(FunctionSpec::new("entry", record(&names)).with_next("blocking"))
            .with_function(FunctionSpec::new("blocking", record(&names)).with_team("io"))
            .build()
            .unwrap();

        let completion = invoke(&office, "entry", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        let names = names.lock().unwrap().clone();
        assert_eq!(names.len(), 2);
        assert!(names[1].starts_with("io-"));
        assert_ne!(names[0], names[1]);
        assert_eq!(office.metrics().handoffs, 1);
    }

    #[test]
    fn test_cleanup_escalation_reported() {
        init_tracing();
        let office = OfficeBuilder::new(config())
            .with_managed_object(
                ManagedObjectSpec::from_fn("file", ManagedObjectScope::Function, || Ok(3u8))
                    .with_recycle(|_ctx| Err(Escalation::new("CloseFailed", "flush failed"))),
            )
            .with_function(FunctionSpec::new("write", |_| Ok(())).with_object("file"))
            .build()
            .unwrap();

        let completion = invoke(&office, "write", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(completion.cleanup.len(), 1);
        assert_eq!(completion.cleanup[0].object, "file");
        assert!(completion.cleanup[0].escalation.is("Cleanup"));
        assert_eq!(office.metrics().cleanup_escalations, 1);
    }

    #[test]
    fn test_pooled_object_reused_across_processes() {
        init_tracing();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = Arc::new(IdlePool::new(4));
        let office = OfficeBuilder::new(config())
            .with_managed_object(
                ManagedObjectSpec::from_fn("conn", ManagedObjectScope::Process, move || {
                    Ok(counter.fetch_add(1, Ordering::SeqCst))
                })
                .with_pool(Arc::clone(&pool)),
            )
            .with_function(FunctionSpec::new("query", |_| Ok(())).with_object("conn"))
            .build()
            .unwrap();

        for _ in 0..2 {
            let completion = invoke(&office, "query", None).recv_timeout(WAIT).unwrap();
            assert!(completion.is_success());
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.reused(), 1);
    }

    #[test]
    fn test_coordinating_object_loads_dependencies() {
        init_tracing();
        struct Repository {
            dsn: Mutex<Option<String>>,
        }
        struct RepositoryObject(Arc<Repository>);
        impl ManagedObject for RepositoryObject {
            fn object(&self) -> ObjectValue {
                Arc::clone(&self.0) as ObjectValue
            }
            fn load_objects(
                &self,
                registry: &crate::managed::ObjectRegistry,
            ) -> Result<(), Escalation> {
                let dsn = registry
                    .get::<String>("dsn")
                    .ok_or_else(|| Escalation::defect("dsn missing"))?;
                *self.0.dsn.lock().unwrap() = Some(dsn.clone());
                Ok(())
            }
        }
        struct RepositorySource;
        impl ManagedObjectSource for RepositorySource {
            fn init(&self, _context: &SourceContext<'_>) -> Result<SourceMetadata, Escalation> {
                Ok(SourceMetadata::new().with_dependency("dsn"))
            }
            fn source(&self, user: ManagedObjectUser) {
                user.set_managed_object(Arc::new(RepositoryObject(Arc::new(Repository {
                    dsn: Mutex::new(None),
                }))));
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let office = OfficeBuilder::new(config())
            .with_managed_object(ManagedObjectSpec::from_fn(
                "settings",
                ManagedObjectScope::Process,
                || Ok("postgres://kiln".to_string()),
            ))
            .with_managed_object(
                ManagedObjectSpec::new("repo", ManagedObjectScope::Thread, RepositorySource)
                    .with_dependency("dsn", "settings"),
            )
            .with_function(
                FunctionSpec::new("entry", move |ctx| {
                    let repo = ctx.object::<Repository>("repo")?;
                    *slot.lock().unwrap() = repo.dsn.lock().unwrap().clone();
                    Ok(())
                })
                .with_object("repo"),
            )
            .build()
            .unwrap();

        let completion = invoke(&office, "entry", None).recv_timeout(WAIT).unwrap();
        assert!(completion.is_success());
        assert_eq!(seen.lock().unwrap().as_deref(), Some("postgres://kiln"));
    }

    #[test]
    fn test_input_source_invokes_process() {
        init_tracing();
        #[derive(Default)]
        struct Listener {
            context: Arc<Mutex<Option<ExecuteContext>>>,
        }
        impl ManagedObjectSource for Listener {
            fn init(&self, _context: &SourceContext<'_>) -> Result<SourceMetadata, Escalation> {
                Ok(SourceMetadata::new().with_flow("handle"))
            }
            fn start(&self, context: ExecuteContext) -> Result<(), Escalation> {
                *self.context.lock().unwrap() = Some(context);
                Ok(())
            }
            fn source(&self, user: ManagedObjectUser) {
                user.set_failure(Escalation::defect("input objects are bound by invocation"));
            }
        }

        let listener = Listener::default();
        let context = Arc::clone(&listener.context);
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let office = OfficeBuilder::new(config())
            .with_managed_object(
                ManagedObjectSpec::new("request", ManagedObjectScope::Process, listener)
                    .with_flow("handle", "serve"),
            )
            .with_function(
                FunctionSpec::new("serve", move |ctx| {
                    *slot.lock().unwrap() = ctx.object::<String>("request").ok().cloned();
                    Ok(())
                })
                .with_object("request"),
            )
            .build()
            .unwrap();

        let context = context.lock().unwrap().clone().unwrap();
        assert_eq!(context.flows(), vec!["handle"]);
        let (tx, rx) = mpsc::channel();
        context
            .invoke_process(
                "handle",
                None,
                Some(Arc::new(ValueObject::new("GET /".to_string()))),
                move |completion| {
                    let _ = tx.send(completion);
                },
            )
            .unwrap();
        assert!(rx.recv_timeout(WAIT).unwrap().is_success());
        assert_eq!(seen.lock().unwrap().as_deref(), Some("GET /"));

        let err = context
            .invoke_process("other", None, None, |_| {})
            .unwrap_err();
        assert!(matches!(err, KernelError::UnlinkedKey { .. }));
        drop(office);
    }

    #[test]
    fn test_build_rejects_bad_registrations() {
        let noop = || FunctionSpec::new("a", |_| Ok(()));

        let err = OfficeBuilder::new(config())
            .with_function(noop().with_next("missing"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            KernelError::UnknownFunction {
                name: "missing".to_string()
            }
        );

        let err = OfficeBuilder::new(config())
            .with_function(noop())
            .with_function(noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::Duplicate { .. }));

        let err = OfficeBuilder::new(config())
            .with_function(noop().with_handler("Undeclared", "a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::UnknownEscalationType { .. }));

        let err = OfficeBuilder::new(config())
            .with_function(noop().with_team("nowhere"))
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::UnknownTeam { .. }));

        let err = OfficeBuilder::new(config())
            .with_escalation_type("Failure", "Failure")
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::Duplicate { .. }));
    }

    #[test]
    fn test_build_checks_object_graph() {
        let object = |name: &str, scope: ManagedObjectScope| {
            ManagedObjectSpec::from_fn(name, scope, || Ok(()))
        };

        let err = OfficeBuilder::new(config())
            .with_managed_object(object("x", ManagedObjectScope::Thread).with_dependency("y", "y"))
            .with_managed_object(object("y", ManagedObjectScope::Thread).with_dependency("x", "x"))
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::DependencyCycle { ref path } if path.len() == 3));

        let err = OfficeBuilder::new(config())
            .with_managed_object(
                object("shared", ManagedObjectScope::Process).with_dependency("local", "local"),
            )
            .with_managed_object(object("local", ManagedObjectScope::Function))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            KernelError::ScopeViolation {
                object: "shared".to_string(),
                dependency: "local".to_string(),
            }
        );

        struct NeedsDb;
        impl ManagedObjectSource for NeedsDb {
            fn init(&self, _context: &SourceContext<'_>) -> Result<SourceMetadata, Escalation> {
                Ok(SourceMetadata::new().with_dependency("db"))
            }
            fn source(&self, _user: ManagedObjectUser) {}
        }
        let err = OfficeBuilder::new(config())
            .with_managed_object(ManagedObjectSpec::new(
                "repo",
                ManagedObjectScope::Thread,
                NeedsDb,
            ))
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::UnlinkedKey { ref key, .. } if key == "db"));
    }

    #[test]
    fn test_close_abandons_suspended_process() {
        init_tracing();
        let log = log();
        let source = DeferredSource::default();
        let users = Arc::clone(&source.users);
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        let office = OfficeBuilder::new(config())
            .with_managed_object(ManagedObjectSpec::new(
                "session",
                ManagedObjectScope::Thread,
                source,
            ))
            .with_function(FunctionSpec::new("entry", move |ctx| {
                let sink = Arc::clone(&sink);
                ctx.do_flow(FlowRequest::parallel("waiter").with_callback(
                    FlowCallback::observe(move |outcome| {
                        sink.lock().unwrap().push(outcome.map(|e| e.kind().to_string()));
                    }),
                ))
            }))
            .with_function(step("waiter", &log).with_object("session"))
            .build()
            .unwrap();

        let rx = invoke(&office, "entry", None);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(office.active_processes(), 1);

        office.close();
        let completion = rx.recv_timeout(WAIT).unwrap();
        let escalation = completion.escalation.unwrap();
        assert!(escalation.is(OFFICE_CLOSED));
        assert!(escalation.message().contains("test"));
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![Some(OFFICE_CLOSED.to_string())]
        );
        assert!(entries(&log).is_empty());
        assert_eq!(office.active_processes(), 0);

        let user = users.lock().unwrap().pop().unwrap();
        assert!(!user.set_managed_object(Arc::new(ValueObject::new(1u8))));
    }

    #[test]
    fn test_closed_office_rejects_invocations() {
        let office = OfficeBuilder::new(config())
            .with_function(FunctionSpec::new("a", |_| Ok(())))
            .build()
            .unwrap();
        office.close();
        office.close();
        assert!(office.is_closed());
        let err = office.invoke_process("a", None, |_| {}).unwrap_err();
        assert!(matches!(err, KernelError::OfficeClosed { .. }));
        let err = office.invoke_process("b", None, |_| {}).unwrap_err();
        assert!(matches!(err, KernelError::UnknownFunction { .. }));
    }

    fn chain(dependencies: &[Vec<usize>]) -> Vec<ObjectDef> {
        dependencies
            .iter()
            .enumerate()
            .map(|(index, deps)| ObjectDef {
                name: format!("o{}", index),
                source: Arc::new(crate::managed::FnSource::new(|| Ok(()))),
                scope: ManagedObjectScope::Thread,
                capabilities: crate::managed::Capabilities::empty(),
                dependencies: deps
                    .iter()
                    .map(|dep| (format!("k{}", dep), ObjectIdx(*dep)))
                    .collect(),
                flows: IndexMap::new(),
                timeout: None,
                pool: None,
                recycle: None,
            })
            .collect()
    }

    proptest::proptest! {
        #[test]
        fn test_load_order_puts_dependencies_first(
            edges in proptest::collection::vec((0usize..8, 0usize..8), 0..24),
            declared in proptest::collection::vec(0usize..8, 1..4),
        ) {
            // Edges only point at lower indices, so the graph is acyclic
            let mut dependencies = vec![Vec::new(); 8];
            for (from, to) in edges {
                if from > to && !dependencies[from].contains(&to) {
                    dependencies[from].push(to);
                }
            }
            let objects = chain(&dependencies);
            proptest::prop_assert!(check_cycles(&objects).is_ok());

            let declared: Vec<ObjectIdx> = declared.into_iter().map(ObjectIdx).collect();
            let order = load_order(&objects, &declared);
            for object in &declared {
                proptest::prop_assert!(order.contains(object));
            }
            for (position, object) in order.iter().enumerate() {
                for (_, dependency) in &objects[object.0].dependencies {
                    let before = order.iter().position(|o| o == dependency);
                    proptest::prop_assert!(before.is_some_and(|before| before < position));
                }
            }
        }
    }

    #[test]
    fn test_cycle_reports_path() {
        let objects = chain(&[vec![2], vec![0], vec![1]]);
        let err = check_cycles(&objects).unwrap_err();
        assert_eq!(
            err,
            KernelError::DependencyCycle {
                path: vec!["o0".into(), "o2".into(), "o1".into(), "o0".into()],
            }
        );
    }
}
