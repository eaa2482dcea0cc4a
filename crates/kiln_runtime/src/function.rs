//! Function registration and the context a running function sees.

use crate::cache::ObjectCache;
use crate::flow::{FlowRequest, FlowSeed};
use crate::managed::ObjectValue;
use crate::process::{FunctionKey, ThreadKey};
use crate::registry::{FunctionDef, Registry};
use kiln_core::{Escalation, KernelError};
use std::any::Any;
use std::sync::Arc;

/// Value passed into a function
pub type Parameter = Option<ObjectValue>;

/// Wrap a value as a [`Parameter`]
#[must_use]
pub fn parameter<T: Any + Send + Sync>(value: T) -> Parameter {
    Some(Arc::new(value))
}

/// Function body
pub type FunctionLogic =
    Arc<dyn Fn(&mut FunctionContext<'_>) -> Result<(), Escalation> + Send + Sync>;

/// Function registration
pub struct FunctionSpec {
    pub(crate) name: String,
    pub(crate) logic: FunctionLogic,
    pub(crate) next: Option<String>,
    pub(crate) team: Option<String>,
    pub(crate) objects: Vec<String>,
    pub(crate) handlers: Vec<(String, String)>,
    pub(crate) governance: Vec<String>,
}

impl FunctionSpec {
    /// Register `logic` under `name`
    #[must_use]
    pub fn new<F>(name: impl Into<String>, logic: F) -> Self
    where
        F: Fn(&mut FunctionContext<'_>) -> Result<(), Escalation> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            logic: Arc::new(logic),
            next: None,
            team: None,
            objects: Vec::new(),
            handlers: Vec::new(),
            governance: Vec::new(),
        }
    }

    /// Function run after this one completes
    #[must_use]
    pub fn with_next(mut self, function: impl Into<String>) -> Self {
        self.next = Some(function.into());
        self
    }

    /// Team responsible for running this function. Without one, the
    /// function runs on whichever thread reaches it.
    #[must_use]
    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// Managed object loaded before the function runs
    #[must_use]
    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.objects.push(object.into());
        self
    }

    /// Handle escalations of `kind` (or a subtype) with `function`
    #[must_use]
    pub fn with_handler(mut self, kind: impl Into<String>, function: impl Into<String>) -> Self {
        self.handlers.push((kind.into(), function.into()));
        self
    }

    /// Governance required while this function runs
    #[must_use]
    pub fn with_governance(mut self, governance: impl Into<String>) -> Self {
        self.governance.push(governance.into());
        self
    }

    /// Registered name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("name", &self.name)
            .field("next", &self.next)
            .field("team", &self.team)
            .field("objects", &self.objects)
            .field("handlers", &self.handlers)
            .field("governance", &self.governance)
            .finish()
    }
}

/// What a running function can see and request
pub struct FunctionContext<'a> {
    registry: &'a Registry,
    def: &'a FunctionDef,
    function: FunctionKey,
    thread: ThreadKey,
    cache: &'a ObjectCache,
    parameter: Parameter,
    escalation: Option<Arc<Escalation>>,
    flows: Vec<FlowSeed>,
    next_parameter: Option<Parameter>,
}

impl<'a> FunctionContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: &'a Registry,
        def: &'a FunctionDef,
        function: FunctionKey,
        thread: ThreadKey,
        cache: &'a ObjectCache,
        parameter: Parameter,
        escalation: Option<Arc<Escalation>>,
    ) -> Self {
        Self {
            registry,
            def,
            function,
            thread,
            cache,
            parameter,
            escalation,
            flows: Vec::new(),
            next_parameter: None,
        }
    }

    /// Function name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Parameter, downcast
    #[must_use]
    pub fn parameter<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.parameter.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Escalation being handled, when running as a handler
    #[must_use]
    pub fn escalation(&self) -> Option<&Arc<Escalation>> {
        self.escalation.as_ref()
    }

    /// Declared managed object
    ///
    /// # Errors
    ///
    /// Returns a defect if the object was not declared by this function or
    /// is not a `T`
    pub fn object<T: Any + Send + Sync>(&self, name: &str) -> Result<&T, Escalation> {
        let declared = self
            .registry
            .find_object(name)
            .filter(|object| self.def.objects.contains(object))
            .ok_or_else(|| {
                Escalation::defect(format!(
                    "function {} did not declare managed object {}",
                    self.def.name, name
                ))
            })?;
        let id = self.registry.scope_id(declared, self.function, self.thread);
        self.cache
            .get(&id)
            .and_then(|value| value.downcast_ref::<T>())
            .ok_or_else(|| {
                Escalation::defect(format!(
                    "managed object {} is not a {}",
                    name,
                    std::any::type_name::<T>()
                ))
            })
    }

    /// Any managed object this thread already has loaded; never sources
    #[must_use]
    pub fn optional_object<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        let object = self.registry.find_object(name)?;
        let id = self.registry.scope_id(object, self.function, self.thread);
        self.cache.get(&id).and_then(|value| value.downcast_ref::<T>())
    }

    /// Instigate a flow if this function completes normally
    ///
    /// # Errors
    ///
    /// Returns a defect if the flow's function is not registered
    pub fn do_flow(&mut self, request: FlowRequest) -> Result<(), Escalation> {
        let function = self.registry.find_function(&request.function).ok_or_else(|| {
            Escalation::from_error(
                kiln_core::EscalationKind::DEFECT,
                &KernelError::UnknownFunction {
                    name: request.function.clone(),
                },
            )
        })?;
        self.flows.push(FlowSeed {
            function,
            parameter: request.parameter,
            instigation: request.instigation,
            callback: request.callback,
        });
        Ok(())
    }

    /// Parameter for the next function in the flow
    pub fn set_next_parameter<T: Any + Send + Sync>(&mut self, value: T) {
        self.next_parameter = Some(Some(Arc::new(value)));
    }

    pub(crate) fn into_parts(self) -> (Vec<FlowSeed>, Option<Parameter>) {
        (self.flows, self.next_parameter)
    }
}
