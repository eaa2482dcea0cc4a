//! Team that runs jobs on the submitting thread.

use crate::team::{Job, RejectedJob, Team};

/// Runs every job immediately on the caller's thread
#[derive(Debug, Clone)]
pub struct InlineTeam {
    name: String,
}

impl InlineTeam {
    /// Create a new inline team
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Team for InlineTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: Job) -> Result<(), RejectedJob> {
        tracing::trace!(team = %self.name, job = job.label(), "running job inline");
        job.run();
        Ok(())
    }

    fn runs_inline(&self) -> bool {
        true
    }
}
