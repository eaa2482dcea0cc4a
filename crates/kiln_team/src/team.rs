//! The team contract and the job type teams execute.

use std::fmt;

/// Unit of work submitted to a team
pub struct Job {
    /// Label for logging
    label: String,
    /// Work to run
    task: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    /// Create a new job
    #[must_use]
    pub fn new(label: impl Into<String>, task: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label: label.into(),
            task: Box::new(task),
        }
    }

    /// Job label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the job on the current thread
    pub fn run(self) {
        (self.task)();
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("label", &self.label).finish()
    }
}

/// Team errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TeamError {
    /// Team has been stopped
    #[error("Team stopped: {team}")]
    Stopped {
        /// Team name
        team: String,
    },

    /// Worker threads could not be spawned
    #[error("Team {team} failed to spawn workers: {reason}")]
    Spawn {
        /// Team name
        team: String,
        /// Failure reason
        reason: String,
    },

    /// Invalid team configuration
    #[error("Invalid team configuration for {team}: {reason}")]
    Config {
        /// Team name
        team: String,
        /// Failure reason
        reason: String,
    },
}

/// A job handed back because the team would not take it
#[derive(Debug)]
pub struct RejectedJob {
    /// The job, unrun
    pub job: Job,
    /// Why it was rejected
    pub error: TeamError,
}

/// Executor abstraction.
///
/// Implementations decide which thread runs a submitted job. They own the
/// job only until it has run.
pub trait Team: Send + Sync + 'static {
    /// Team name, unique within an office
    fn name(&self) -> &str;

    /// Start worker threads, if any
    ///
    /// # Errors
    ///
    /// Returns error if workers cannot be started
    fn start(&self) -> Result<(), TeamError> {
        Ok(())
    }

    /// Submit a job for execution
    ///
    /// # Errors
    ///
    /// Hands the job back if the team no longer accepts work
    fn submit(&self, job: Job) -> Result<(), RejectedJob>;

    /// Stop accepting jobs and release worker threads
    fn stop(&self) {}

    /// Whether submitted jobs run on the submitting thread
    fn runs_inline(&self) -> bool {
        false
    }
}
