//! KILN Runtime
//!
//! The execution kernel. An office holds registered functions, managed
//! objects, governance and teams; each invocation becomes a process whose
//! threads run function chains on the teams they require.
//! Failures escalate outward from the function to its flow, thread, office
//! and finally the process host.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cache;
pub mod config;
mod engine;
pub mod escalation;
mod executor;
pub mod flow;
pub mod function;
pub mod governance;
pub mod managed;
pub mod monitor;
pub mod office;
mod process;
mod registry;

// Re-exports
pub use config::OfficeConfig;
pub use escalation::{EscalationHandler, EscalationLevel};
pub use flow::{FlowCallback, FlowRequest, Instigation};
pub use function::{FunctionContext, FunctionLogic, FunctionSpec, Parameter, parameter};
pub use governance::{Governance, GovernanceFactory, GovernanceSpec};
pub use managed::{
    AsyncOperation, AsynchronousContext, Capabilities, Capability, CleanupEscalation,
    ExecuteContext, FnSource, IdlePool, ManagedObject, ManagedObjectContext, ManagedObjectPool,
    ManagedObjectScope, ManagedObjectSource, ManagedObjectSpec, ManagedObjectUser, ObjectRegistry,
    ObjectValue, RecycleContext, SourceContext, SourceMetadata, ValueObject,
};
pub use monitor::{MetricsSnapshot, OfficeMetrics};
pub use office::{OFFICE_CLOSED, Office, OfficeBuilder, ProcessCompletion};

pub use kiln_core::{Escalation, EscalationKind, KernelError, KernelResult, ProcessId};
pub use kiln_team::{Team, TeamConfig, TeamKind};

/// Text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
