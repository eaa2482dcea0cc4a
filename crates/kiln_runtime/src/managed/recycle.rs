//! Recycling managed objects on scope exit.

use crate::managed::container::{ObjectContainer, ObjectState};
use crate::managed::{ManagedObject, ObjectValue};
use crate::registry::{ObjectDef, Registry};
use kiln_core::Escalation;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Decides whether a managed object is reused or closed
pub type RecycleFn = Arc<dyn Fn(&mut RecycleContext<'_>) -> Result<(), Escalation> + Send + Sync>;

/// Failure raised while recycling; reported with the process completion
/// instead of entering escalation handling
#[derive(Debug, Clone, Serialize)]
pub struct CleanupEscalation {
    /// Managed object being recycled
    pub object: String,
    /// What went wrong
    #[serde(serialize_with = "serialize_report")]
    pub escalation: Arc<Escalation>,
}

fn serialize_report<S: serde::Serializer>(
    escalation: &Arc<Escalation>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&escalation.report())
}

/// Context for a recycle function
pub struct RecycleContext<'a> {
    name: &'a str,
    managed: &'a Arc<dyn ManagedObject>,
    value: Option<&'a ObjectValue>,
    escalations: &'a [Arc<Escalation>],
    reuse: bool,
}

impl RecycleContext<'_> {
    /// Managed object name
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    /// The managed object
    #[must_use]
    pub fn managed_object(&self) -> &Arc<dyn ManagedObject> {
        self.managed
    }

    /// Object value, downcast
    #[must_use]
    pub fn object<T: std::any::Any + Send + Sync>(&self) -> Option<&T> {
        self.value.and_then(|value| value.downcast_ref::<T>())
    }

    /// Escalations raised within the scope being exited
    #[must_use]
    pub fn escalations(&self) -> &[Arc<Escalation>] {
        self.escalations
    }

    /// Return the object to its pool (the default when pooled)
    pub fn reuse(&mut self) {
        self.reuse = true;
    }

    /// Close the object rather than pool it
    pub fn close(&mut self) {
        self.reuse = false;
    }

    /// Whether the object goes back to its pool
    #[must_use]
    pub fn is_reused(&self) -> bool {
        self.reuse
    }
}

/// Recycle containers leaving a scope. User code runs here, so callers must
/// not hold the process lock.
pub(crate) fn recycle(
    registry: &Registry,
    containers: Vec<ObjectContainer>,
    escalations: &[Arc<Escalation>],
) -> Vec<CleanupEscalation> {
    let mut cleanup = Vec::new();
    for container in containers {
        let def = registry.object(container.object);
        let usable = matches!(container.state, ObjectState::Ready);
        let Some(managed) = container.managed else {
            continue;
        };
        if let Err(escalation) =
            recycle_one(def, &managed, container.value.as_ref(), usable, escalations)
        {
            tracing::warn!(
                object = %def.name,
                escalation = %escalation.report(),
                "cleanup escalation"
            );
            cleanup.push(CleanupEscalation {
                object: def.name.clone(),
                escalation: Arc::new(escalation),
            });
        }
    }
    cleanup
}

fn recycle_one(
    def: &ObjectDef,
    managed: &Arc<dyn ManagedObject>,
    value: Option<&ObjectValue>,
    usable: bool,
    escalations: &[Arc<Escalation>],
) -> Result<(), Escalation> {
    let mut context = RecycleContext {
        name: &def.name,
        managed,
        value,
        escalations,
        reuse: usable,
    };

    let outcome = match &def.recycle {
        Some(recycle) => catch_unwind(AssertUnwindSafe(|| recycle(&mut context)))
            .unwrap_or_else(|panic| Err(Escalation::defect(crate::panic_message(&*panic)))),
        None => Ok(()),
    };
    let reuse = context.reuse && usable && outcome.is_ok();

    if let Some(pool) = &def.pool {
        if reuse {
            pool.return_object(Arc::clone(managed));
        } else {
            let cause = match &outcome {
                Err(escalation) => escalation.clone(),
                Ok(()) if usable => Escalation::cleanup("closed by recycle"),
                Ok(()) => Escalation::cleanup("object not usable at scope exit"),
            };
            pool.lost(Arc::clone(managed), &cause);
        }
    }

    outcome.map_err(|escalation| {
        Escalation::cleanup(format!("recycling {} failed", def.name)).with_cause(escalation)
    })
}
