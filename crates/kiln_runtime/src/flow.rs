//! Flow instigation requests and completion callbacks.

use crate::function::Parameter;
use crate::registry::FunctionIdx;
use kiln_core::Escalation;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// How an instigated flow relates to its instigator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instigation {
    /// Runs after the instigating function and before its next function
    Sequential,
    /// Runs in the same thread with no ordering against the instigator
    Parallel,
    /// Runs in a new thread of the same process
    Asynchronous,
}

/// Request to instigate a flow once the current function completes
#[derive(Debug)]
pub struct FlowRequest {
    pub(crate) function: String,
    pub(crate) parameter: Parameter,
    pub(crate) instigation: Instigation,
    pub(crate) callback: Option<FlowCallback>,
}

impl FlowRequest {
    /// Request a flow starting at `function`
    #[must_use]
    pub fn new(function: impl Into<String>, instigation: Instigation) -> Self {
        Self {
            function: function.into(),
            parameter: None,
            instigation,
            callback: None,
        }
    }

    /// Sequential flow
    #[must_use]
    pub fn sequential(function: impl Into<String>) -> Self {
        Self::new(function, Instigation::Sequential)
    }

    /// Parallel flow
    #[must_use]
    pub fn parallel(function: impl Into<String>) -> Self {
        Self::new(function, Instigation::Parallel)
    }

    /// Asynchronous flow in a new thread
    #[must_use]
    pub fn asynchronous(function: impl Into<String>) -> Self {
        Self::new(function, Instigation::Asynchronous)
    }

    /// Parameter for the flow's first function
    #[must_use]
    pub fn with_parameter<T: Any + Send + Sync>(mut self, parameter: T) -> Self {
        self.parameter = Some(Arc::new(parameter));
        self
    }

    /// Completion callback
    #[must_use]
    pub fn with_callback(mut self, callback: FlowCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// A request resolved against the registry
#[derive(Debug)]
pub(crate) struct FlowSeed {
    pub(crate) function: FunctionIdx,
    pub(crate) parameter: Parameter,
    pub(crate) instigation: Instigation,
    pub(crate) callback: Option<FlowCallback>,
}

type EscalateFn = Box<dyn FnOnce(Option<Arc<Escalation>>) -> Result<(), Escalation> + Send>;
type ObserveFn = Box<dyn FnOnce(Option<Arc<Escalation>>) + Send>;

enum CallbackKind {
    Escalate(EscalateFn),
    Observe(ObserveFn),
}

/// Invoked exactly once when a flow ends, with `None` on normal completion
/// or the escalation that ended it
pub struct FlowCallback {
    kind: CallbackKind,
}

impl FlowCallback {
    /// Callback that takes part in escalation handling: returning `Ok`
    /// handles the escalation, returning `Err` escalates the returned failure
    #[must_use]
    pub fn escalate<F>(callback: F) -> Self
    where
        F: FnOnce(Option<Arc<Escalation>>) -> Result<(), Escalation> + Send + 'static,
    {
        Self {
            kind: CallbackKind::Escalate(Box::new(callback)),
        }
    }

    /// Callback notified of the outcome; escalations keep propagating
    #[must_use]
    pub fn observe<F>(callback: F) -> Self
    where
        F: FnOnce(Option<Arc<Escalation>>) + Send + 'static,
    {
        Self {
            kind: CallbackKind::Observe(Box::new(callback)),
        }
    }

    /// Whether this callback can handle escalations
    #[must_use]
    pub fn handles_escalation(&self) -> bool {
        matches!(self.kind, CallbackKind::Escalate(_))
    }

    /// Run the callback. Observers always return `Ok`.
    pub(crate) fn invoke(self, outcome: Option<Arc<Escalation>>) -> Result<(), Escalation> {
        match self.kind {
            CallbackKind::Escalate(callback) => callback(outcome),
            CallbackKind::Observe(callback) => {
                callback(outcome);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for FlowCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowCallback")
            .field("escalate", &self.handles_escalation())
            .finish()
    }
}

/// How a flow ended
#[derive(Debug, Clone)]
pub(crate) enum FlowOutcome {
    /// Last function completed
    Completed,
    /// A function escalated and no function-level handler matched
    Escalated(Arc<Escalation>),
    /// Torn down; the escalation is already being handled elsewhere
    Abandoned(Arc<Escalation>),
}
