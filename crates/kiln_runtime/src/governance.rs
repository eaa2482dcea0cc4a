//! Governance: activation rules with commit and rollback semantics.
//!
//! A governance becomes active when a function requiring it starts and stays
//! active across the contiguous run of functions in the flow that also
//! require it. It is enforced when control reaches a function that does not
//! require it, or when the flow completes. It is disregarded when an
//! escalation routes control to a handler that does not require it, or when
//! the flow ends with an escalation.

use crate::managed::ObjectValue;
use crate::registry::GovernanceIdx;
use indexmap::IndexMap;
use kiln_core::Escalation;
use std::sync::Arc;

/// One activation of a governance within a flow
pub trait Governance: Send + 'static {
    /// Bring a managed object under this governance
    ///
    /// # Errors
    ///
    /// Escalates from the function that activated the governance
    fn govern(&mut self, name: &str, object: &ObjectValue) -> Result<(), Escalation>;

    /// Commit
    ///
    /// # Errors
    ///
    /// Escalates from the function that ended the governance
    fn enforce(&mut self) -> Result<(), Escalation>;

    /// Roll back
    ///
    /// # Errors
    ///
    /// Failures are logged; the escalation that caused the rollback wins
    fn disregard(&mut self) -> Result<(), Escalation>;
}

/// Creates a fresh governance activation
pub type GovernanceFactory = Arc<dyn Fn() -> Box<dyn Governance> + Send + Sync>;

/// Governance registration
pub struct GovernanceSpec {
    pub(crate) name: String,
    pub(crate) factory: GovernanceFactory,
    pub(crate) objects: Vec<String>,
}

impl GovernanceSpec {
    /// Create a governance registration
    #[must_use]
    pub fn new<F, G>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> G + Send + Sync + 'static,
        G: Governance,
    {
        Self {
            name: name.into(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Governance>),
            objects: Vec::new(),
        }
    }

    /// Govern the named managed object whenever a function requiring this
    /// governance has it loaded
    #[must_use]
    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.objects.push(object.into());
        self
    }

    /// Governance name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for GovernanceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceSpec")
            .field("name", &self.name)
            .field("objects", &self.objects)
            .finish()
    }
}

/// How a flow's active governance ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Enforce,
    Disregard,
}

/// Governance active in one flow, in activation order
#[derive(Default)]
pub(crate) struct ActiveGovernance {
    active: IndexMap<GovernanceIdx, Box<dyn Governance>>,
}

impl ActiveGovernance {
    pub(crate) fn is_active(&self, governance: GovernanceIdx) -> bool {
        self.active.contains_key(&governance)
    }

    pub(crate) fn activate(&mut self, governance: GovernanceIdx, activation: Box<dyn Governance>) {
        self.active.insert(governance, activation);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Remove every activation not in `required`
    pub(crate) fn release_unrequired(
        &mut self,
        required: &[GovernanceIdx],
    ) -> Vec<Box<dyn Governance>> {
        let ending: Vec<GovernanceIdx> = self
            .active
            .keys()
            .filter(|governance| !required.contains(governance))
            .copied()
            .collect();
        ending
            .into_iter()
            .filter_map(|governance| self.active.shift_remove(&governance))
            .collect()
    }

    /// Remove every activation
    pub(crate) fn release_all(&mut self) -> Vec<Box<dyn Governance>> {
        self.active.drain(..).map(|(_, activation)| activation).collect()
    }
}

/// End activations in order. Returns the first failure of an enforce;
/// disregard failures are only logged.
pub(crate) fn end_all(
    activations: Vec<Box<dyn Governance>>,
    transition: Transition,
) -> Result<(), Escalation> {
    let mut first = None;
    for mut activation in activations {
        let result = match transition {
            Transition::Enforce => activation.enforce(),
            Transition::Disregard => activation.disregard(),
        };
        if let Err(escalation) = result {
            match transition {
                Transition::Enforce => {
                    first.get_or_insert(escalation);
                }
                Transition::Disregard => {
                    tracing::warn!(escalation = %escalation, "governance disregard failed");
                }
            }
        }
    }
    first.map_or(Ok(()), Err)
}
