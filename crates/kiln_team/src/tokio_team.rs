//! Team backed by the blocking pool of a tokio runtime.

use crate::team::{Job, RejectedJob, Team, TeamError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::{Builder, Handle, Runtime};

enum TeamRuntime {
    /// Runtime created and owned by the team
    Owned(Runtime),
    /// Runtime owned by the host application
    Shared(Handle),
}

impl TeamRuntime {
    fn handle(&self) -> &Handle {
        match self {
            TeamRuntime::Owned(runtime) => runtime.handle(),
            TeamRuntime::Shared(handle) => handle,
        }
    }
}

/// Jobs submitted but not yet picked up by a blocking thread
type Pending = Arc<Mutex<VecDeque<Job>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, VecDeque<Job>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs jobs on `spawn_blocking` threads.
///
/// Jobs are synchronous and may block, so they go to the blocking pool
/// rather than the async workers. Each blocking task takes the oldest
/// pending job. Jobs the runtime never got to are run by `stop` on the
/// stopping thread.
pub struct TokioTeam {
    name: String,
    runtime: Mutex<Option<TeamRuntime>>,
    pending: Pending,
}

impl TokioTeam {
    /// Create a team with its own runtime
    ///
    /// # Errors
    ///
    /// Returns error if `max_blocking_threads` is zero or the runtime
    /// cannot be built
    pub fn new(name: impl Into<String>, max_blocking_threads: usize) -> Result<Self, TeamError> {
        let name = name.into();
        if max_blocking_threads == 0 {
            return Err(TeamError::Config {
                team: name,
                reason: "tokio team needs at least one blocking thread".to_string(),
            });
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_blocking_threads)
            .thread_name(format!("{}-tokio", name))
            .enable_time()
            .build()
            .map_err(|err| TeamError::Spawn {
                team: name.clone(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            name,
            runtime: Mutex::new(Some(TeamRuntime::Owned(runtime))),
            pending: Pending::default(),
        })
    }

    /// Create a team on a runtime the host already runs
    #[must_use]
    pub fn with_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            name: name.into(),
            runtime: Mutex::new(Some(TeamRuntime::Shared(handle))),
            pending: Pending::default(),
        }
    }
}

impl Team for TokioTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: Job) -> Result<(), RejectedJob> {
        let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(runtime) = runtime.as_ref() else {
            return Err(RejectedJob {
                job,
                error: TeamError::Stopped {
                    team: self.name.clone(),
                },
            });
        };

        lock(&self.pending).push_back(job);
        let pending = Arc::clone(&self.pending);
        let team = self.name.clone();
        let handle = runtime.handle().spawn_blocking(move || {
            let job = lock(&pending).pop_front();
            if let Some(job) = job {
                job.run();
            }
        });
        // Watch for panics so they reach the log instead of a dropped JoinHandle.
        runtime.handle().spawn(async move {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::error!(team = %team, "job panicked");
                }
            }
        });
        Ok(())
    }

    fn stop(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(TeamRuntime::Owned(runtime)) = runtime {
            runtime.shutdown_background();
        }
        let stranded: Vec<Job> = lock(&self.pending).drain(..).collect();
        if !stranded.is_empty() {
            tracing::warn!(
                team = %self.name,
                jobs = stranded.len(),
                "running jobs left queued at stop"
            );
        }
        for job in stranded {
            job.run();
        }
        tracing::info!(team = %self.name, "tokio team stopped");
    }
}

impl Drop for TokioTeam {
    fn drop(&mut self) {
        self.stop();
    }
}
