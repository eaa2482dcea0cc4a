//! KILN Core Types
//!
//! Pure types shared by the team and runtime crates.
//! Nothing in this crate spawns threads or touches I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod error;
pub mod escalation;
pub mod id;

// Re-exports
pub use arena::{Arena, ArenaKey, SlotKey};
pub use error::{KernelError, KernelResult};
pub use escalation::{
    Escalation, EscalationKind, EscalationTypeId, EscalationTypes, EscalationTypesBuilder,
};
pub use id::ProcessId;
