//! Managed object pooling.

use crate::managed::{ManagedObject, ManagedObjectSource, ManagedObjectUser};
use kiln_core::Escalation;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Pool sitting between the office and a managed object source
pub trait ManagedObjectPool: Send + Sync + 'static {
    /// Source an object, reusing a pooled one where possible
    fn source(&self, user: ManagedObjectUser, source: &Arc<dyn ManagedObjectSource>);

    /// Take back an object after recycling
    fn return_object(&self, object: Arc<dyn ManagedObject>);

    /// An object will not come back
    fn lost(&self, object: Arc<dyn ManagedObject>, cause: &Escalation);
}

/// Bounded pool of idle objects
#[derive(Default)]
pub struct IdlePool {
    idle: Mutex<VecDeque<Arc<dyn ManagedObject>>>,
    max_idle: usize,
    reused: AtomicU64,
    lost: AtomicU64,
}

impl IdlePool {
    /// Keep at most `max_idle` objects
    #[must_use]
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            max_idle,
            reused: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        }
    }

    /// Objects waiting for reuse
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Objects handed out again
    #[must_use]
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    /// Objects reported lost
    #[must_use]
    pub fn lost_count(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

impl ManagedObjectPool for IdlePool {
    fn source(&self, user: ManagedObjectUser, source: &Arc<dyn ManagedObjectSource>) {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match pooled {
            Some(object) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                user.set_managed_object(object);
            }
            None => source.source(user),
        }
    }

    fn return_object(&self, object: Arc<dyn ManagedObject>) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push_back(object);
        }
    }

    fn lost(&self, _object: Arc<dyn ManagedObject>, cause: &Escalation) {
        self.lost.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cause = %cause, "pooled object lost");
    }
}

impl<P: ManagedObjectPool> ManagedObjectPool for Arc<P> {
    fn source(&self, user: ManagedObjectUser, source: &Arc<dyn ManagedObjectSource>) {
        (**self).source(user, source);
    }

    fn return_object(&self, object: Arc<dyn ManagedObject>) {
        (**self).return_object(object);
    }

    fn lost(&self, object: Arc<dyn ManagedObject>, cause: &Escalation) {
        (**self).lost(object, cause);
    }
}
