//! Fixed pool of named worker threads.

use crate::team::{Job, RejectedJob, Team, TeamError};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// Pool lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    /// Jobs queue up until workers start
    Idle,
    /// Workers running
    Running,
    /// No new jobs; workers drain the queue and exit
    Stopping,
}

struct Queue {
    jobs: VecDeque<Job>,
    state: PoolState,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-size pool of worker threads sharing one FIFO queue
pub struct WorkerTeam {
    /// Team name, also the worker thread name prefix
    name: String,
    /// Number of worker threads
    threads: usize,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerTeam {
    /// Create a pool of `threads` workers
    ///
    /// # Errors
    ///
    /// Returns error if `threads` is zero
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self, TeamError> {
        let name = name.into();
        if threads == 0 {
            return Err(TeamError::Config {
                team: name,
                reason: "worker team needs at least one thread".to_string(),
            });
        }
        Ok(Self::with_threads(name, threads))
    }

    /// Create a single-worker team; jobs run strictly in submission order
    #[must_use]
    pub fn single(name: impl Into<String>) -> Self {
        Self::with_threads(name.into(), 1)
    }

    fn with_threads(name: String, threads: usize) -> Self {
        Self {
            name,
            threads,
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    state: PoolState::Idle,
                }),
                available: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Jobs waiting for a worker
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// Undo a partial start: retire the workers already spawned and leave
    /// the team stopped. Jobs no worker took run on the calling thread.
    fn roll_back(&self, started: Vec<JoinHandle<()>>) {
        self.shared.lock().state = PoolState::Stopping;
        self.shared.available.notify_all();
        for handle in started {
            if handle.join().is_err() {
                tracing::warn!(team = %self.name, "worker panicked during rollback");
            }
        }
        let stranded: Vec<Job> = self.shared.lock().jobs.drain(..).collect();
        tracing::warn!(
            team = %self.name,
            stranded = stranded.len(),
            "worker team start failed, team stopped"
        );
        for job in stranded {
            let label = job.label().to_string();
            if catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
                tracing::error!(team = %self.name, job = %label, "job panicked");
            }
        }
    }

    fn work(name: &str, shared: &Shared) {
        loop {
            let job = {
                let mut queue = shared.lock();
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        break Some(job);
                    }
                    if queue.state == PoolState::Stopping {
                        break None;
                    }
                    queue = shared
                        .available
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            let Some(job) = job else {
                tracing::debug!(team = name, "worker exiting");
                return;
            };

            let label = job.label().to_string();
            if catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
                tracing::error!(team = name, job = %label, "job panicked");
            }
        }
    }
}

impl Team for WorkerTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<(), TeamError> {
        {
            let mut queue = self.shared.lock();
            match queue.state {
                PoolState::Running => return Ok(()),
                PoolState::Stopping => {
                    return Err(TeamError::Stopped {
                        team: self.name.clone(),
                    });
                }
                PoolState::Idle => queue.state = PoolState::Running,
            }
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for index in 0..self.threads {
            let shared = Arc::clone(&self.shared);
            let name = self.name.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, index))
                .spawn(move || Self::work(&name, &shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    let started = std::mem::take(&mut *workers);
                    drop(workers);
                    self.roll_back(started);
                    return Err(TeamError::Spawn {
                        team: self.name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        tracing::info!(team = %self.name, threads = self.threads, "worker team started");
        Ok(())
    }

    fn submit(&self, job: Job) -> Result<(), RejectedJob> {
        let idle = {
            let mut queue = self.shared.lock();
            if queue.state == PoolState::Stopping {
                return Err(RejectedJob {
                    job,
                    error: TeamError::Stopped {
                        team: self.name.clone(),
                    },
                });
            }
            queue.jobs.push_back(job);
            queue.state == PoolState::Idle
        };
        self.shared.available.notify_one();

        if idle {
            if let Err(error) = self.start() {
                tracing::warn!(team = %self.name, %error, "lazy start failed");
            }
        }
        Ok(())
    }

    fn stop(&self) {
        {
            let mut queue = self.shared.lock();
            if queue.state == PoolState::Stopping {
                return;
            }
            queue.state = PoolState::Stopping;
        }
        self.shared.available.notify_all();

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let current = std::thread::current().id();
        for handle in handles {
            // A worker stopping its own team cannot join itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!(team = %self.name, "worker panicked");
            }
        }
        tracing::info!(team = %self.name, "worker team stopped");
    }
}

impl Drop for WorkerTeam {
    fn drop(&mut self) {
        self.stop();
    }
}
