//! Escalation levels, procedures, and the process-host handler.

use crate::registry::FunctionIdx;
use kiln_core::{Escalation, EscalationKind, EscalationTypeId, EscalationTypes};
use serde::{Deserialize, Serialize};

/// Boundary at which an escalation is searched for a handler.
///
/// Ordered from innermost to outermost; a search never moves inward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    /// The failing function and its ancestors in the flow
    Function,
    /// The flow's completion callback
    Callback,
    /// The thread escalation procedure
    Thread,
    /// The office escalation procedure
    Office,
    /// The process-host handler
    Host,
}

impl EscalationLevel {
    /// Next level outward; `Host` is outermost
    #[must_use]
    pub const fn above(self) -> Self {
        match self {
            Self::Function => Self::Callback,
            Self::Callback => Self::Thread,
            Self::Thread => Self::Office,
            Self::Office | Self::Host => Self::Host,
        }
    }
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Function => "function",
            Self::Callback => "callback",
            Self::Thread => "thread",
            Self::Office => "office",
            Self::Host => "host",
        };
        f.write_str(name)
    }
}

/// Last line of defence for escalations no procedure handled
pub trait EscalationHandler: Send + Sync + 'static {
    /// Handle an escalation
    ///
    /// # Errors
    ///
    /// Returning an error tears down the failing thread
    fn handle_escalation(&self, escalation: &Escalation) -> Result<(), Escalation>;
}

impl<F> EscalationHandler for F
where
    F: Fn(&Escalation) -> Result<(), Escalation> + Send + Sync + 'static,
{
    fn handle_escalation(&self, escalation: &Escalation) -> Result<(), Escalation> {
        self(escalation)
    }
}

/// Ordered escalation type to handler function mapping
#[derive(Debug, Clone, Default)]
pub(crate) struct EscalationProcedure {
    handlers: Vec<(EscalationTypeId, FunctionIdx)>,
}

impl EscalationProcedure {
    pub(crate) fn push(&mut self, kind: EscalationTypeId, handler: FunctionIdx) {
        self.handlers.push((kind, handler));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Closest handler for `kind`; ties go to the first declared
    pub(crate) fn find(
        &self,
        types: &EscalationTypes,
        kind: &EscalationKind,
    ) -> Option<FunctionIdx> {
        self.handlers
            .iter()
            .filter_map(|(handled, function)| {
                types.distance(kind, *handled).map(|distance| (distance, *function))
            })
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, function)| function)
    }
}
