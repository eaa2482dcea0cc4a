//! Office metrics and the timeout monitor.

use crate::escalation::EscalationLevel;
use crate::office::OfficeInner;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Live office counters
#[derive(Debug, Default)]
pub struct OfficeMetrics {
    processes_started: AtomicU64,
    processes_completed: AtomicU64,
    functions_executed: AtomicU64,
    suspensions: AtomicU64,
    handoffs: AtomicU64,
    escalations_raised: AtomicU64,
    handled_function: AtomicU64,
    handled_callback: AtomicU64,
    handled_thread: AtomicU64,
    handled_office: AtomicU64,
    handled_host: AtomicU64,
    unhandled: AtomicU64,
    timeouts: AtomicU64,
    cleanup_escalations: AtomicU64,
}

/// Point-in-time copy of [`OfficeMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Processes invoked
    pub processes_started: u64,
    /// Processes whose completion was delivered
    pub processes_completed: u64,
    /// Function bodies run
    pub functions_executed: u64,
    /// Functions suspended on a managed object
    pub suspensions: u64,
    /// Jobs moved to another team
    pub handoffs: u64,
    /// Escalations raised by functions, callbacks, and handlers
    pub escalations_raised: u64,
    /// Handled by the failing function or an ancestor
    pub handled_function: u64,
    /// Handled by a flow callback
    pub handled_callback: u64,
    /// Handled by the thread procedure
    pub handled_thread: u64,
    /// Handled by the office procedure
    pub handled_office: u64,
    /// Handled by the process-host handler
    pub handled_host: u64,
    /// Reached the host boundary and were not handled
    pub unhandled: u64,
    /// Sourcing or asynchronous operations that expired
    pub timeouts: u64,
    /// Failures raised while recycling
    pub cleanup_escalations: u64,
}

impl MetricsSnapshot {
    /// Escalations handled at any level
    #[must_use]
    pub fn handled(&self) -> u64 {
        self.handled_function
            + self.handled_callback
            + self.handled_thread
            + self.handled_office
            + self.handled_host
    }

    /// Processes still running
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.processes_started.saturating_sub(self.processes_completed)
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl OfficeMetrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_process_started(&self) {
        bump(&self.processes_started);
    }

    pub(crate) fn record_process_completed(&self) {
        bump(&self.processes_completed);
    }

    pub(crate) fn record_function(&self) {
        bump(&self.functions_executed);
    }

    pub(crate) fn record_suspension(&self) {
        bump(&self.suspensions);
    }

    pub(crate) fn record_handoff(&self) {
        bump(&self.handoffs);
    }

    pub(crate) fn record_escalation(&self) {
        bump(&self.escalations_raised);
    }

    pub(crate) fn record_handled(&self, level: EscalationLevel) {
        let counter = match level {
            EscalationLevel::Function => &self.handled_function,
            EscalationLevel::Callback => &self.handled_callback,
            EscalationLevel::Thread => &self.handled_thread,
            EscalationLevel::Office => &self.handled_office,
            EscalationLevel::Host => &self.handled_host,
        };
        bump(counter);
    }

    pub(crate) fn record_unhandled(&self) {
        bump(&self.unhandled);
    }

    pub(crate) fn record_timeout(&self) {
        bump(&self.timeouts);
    }

    pub(crate) fn record_cleanup(&self, count: usize) {
        self.cleanup_escalations
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Copy current values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            processes_started: load(&self.processes_started),
            processes_completed: load(&self.processes_completed),
            functions_executed: load(&self.functions_executed),
            suspensions: load(&self.suspensions),
            handoffs: load(&self.handoffs),
            escalations_raised: load(&self.escalations_raised),
            handled_function: load(&self.handled_function),
            handled_callback: load(&self.handled_callback),
            handled_thread: load(&self.handled_thread),
            handled_office: load(&self.handled_office),
            handled_host: load(&self.handled_host),
            unhandled: load(&self.unhandled),
            timeouts: load(&self.timeouts),
            cleanup_escalations: load(&self.cleanup_escalations),
        }
    }
}

struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread expiring overdue sourcing and asynchronous operations
pub(crate) struct TimeoutMonitor {
    signal: Arc<Signal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutMonitor {
    pub(crate) fn spawn(
        office: Weak<OfficeInner>,
        name: &str,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let signal = Arc::new(Signal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name(format!("{}-timeouts", name))
            .spawn(move || Self::run(&office, &thread_signal, interval))?;
        Ok(Self {
            signal,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run(office: &Weak<OfficeInner>, signal: &Signal, interval: Duration) {
        let mut stopped = signal.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let (guard, _) = signal
                .wake
                .wait_timeout(stopped, interval)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
            if *stopped {
                return;
            }
            let Some(office) = office.upgrade() else {
                return;
            };
            drop(stopped);
            let expired = office.check_timeouts(Instant::now());
            if expired > 0 {
                tracing::debug!(office = %office.name, expired, "expired overdue operations");
            }
            drop(office);
            stopped = signal.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn stop(&self) {
        *self.signal.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.signal.wake.notify_all();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::warn!("timeout monitor panicked");
            }
        }
    }
}
