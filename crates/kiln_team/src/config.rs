//! Declarative team configuration.

use crate::inline::InlineTeam;
use crate::team::{Team, TeamError};
use crate::tokio_team::TokioTeam;
use crate::worker::WorkerTeam;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn default_threads() -> usize {
    1
}

fn default_blocking_threads() -> usize {
    4
}

/// Which team implementation to build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TeamKind {
    /// Run on the submitting thread
    Inline,
    /// Fixed worker pool
    Worker {
        /// Worker thread count
        #[serde(default = "default_threads")]
        threads: usize,
    },
    /// Tokio blocking pool
    Tokio {
        /// Upper bound on blocking threads
        #[serde(default = "default_blocking_threads")]
        max_blocking_threads: usize,
    },
}

/// Team configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Team name
    pub name: String,
    /// Implementation
    #[serde(flatten)]
    pub kind: TeamKind,
}

impl TeamConfig {
    /// Inline team
    #[must_use]
    pub fn inline(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TeamKind::Inline,
        }
    }

    /// Worker pool with `threads` threads
    #[must_use]
    pub fn worker(name: impl Into<String>, threads: usize) -> Self {
        Self {
            name: name.into(),
            kind: TeamKind::Worker { threads },
        }
    }

    /// Tokio blocking pool
    #[must_use]
    pub fn tokio(name: impl Into<String>, max_blocking_threads: usize) -> Self {
        Self {
            name: name.into(),
            kind: TeamKind::Tokio {
                max_blocking_threads,
            },
        }
    }

    /// Build the configured team
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or workers cannot be
    /// created
    pub fn build(&self) -> Result<Arc<dyn Team>, TeamError> {
        if self.name.is_empty() {
            return Err(TeamError::Config {
                team: self.name.clone(),
                reason: "team name must not be empty".to_string(),
            });
        }
        let team: Arc<dyn Team> = match self.kind {
            TeamKind::Inline => Arc::new(InlineTeam::new(&self.name)),
            TeamKind::Worker { threads } => Arc::new(WorkerTeam::new(&self.name, threads)?),
            TeamKind::Tokio {
                max_blocking_threads,
            } => Arc::new(TokioTeam::new(&self.name, max_blocking_threads)?),
        };
        Ok(team)
    }
}
