//! KILN Teams
//!
//! A team is where jobs physically run. The runtime hands every job to the
//! team responsible for it and never assumes anything about which OS thread
//! that is. Teams are the only points where execution moves between threads.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod inline;
pub mod team;
pub mod tokio_team;
pub mod worker;

pub use config::{TeamConfig, TeamKind};
pub use inline::InlineTeam;
pub use team::{Job, RejectedJob, Team, TeamError};
pub use tokio_team::TokioTeam;
pub use worker::WorkerTeam;
