//! Per-scope managed object container and its state machine.
//!
//! `Unsourced -> Sourcing -> [Sourced -> Loading ->] Ready <-> AsyncPending`.
//! Any pending state may fail. Every transition into a pending state takes a
//! fresh ticket; a notification carrying any other ticket is stale. Several
//! asynchronous operations may be outstanding at once, and the object is
//! ready again only when the last of them completes. A container leaves its
//! registry when it is recycled.

use crate::managed::{ManagedObject, ObjectValue};
use crate::process::FunctionKey;
use crate::registry::ObjectIdx;
use kiln_core::Escalation;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub(crate) enum ObjectState {
    Unsourced,
    Sourcing,
    /// Coordinating object sourced, dependencies not yet loaded
    Sourced,
    Loading,
    Ready,
    AsyncPending,
    Failed(Arc<Escalation>),
}

pub(crate) struct ObjectContainer {
    pub(crate) object: ObjectIdx,
    pub(crate) state: ObjectState,
    pub(crate) ticket: u64,
    pub(crate) deadline: Option<Instant>,
    /// Outstanding asynchronous operations and their deadlines
    pub(crate) operations: Vec<(u64, Option<Instant>)>,
    pub(crate) waiters: Vec<FunctionKey>,
    pub(crate) managed: Option<Arc<dyn ManagedObject>>,
    pub(crate) value: Option<ObjectValue>,
}

impl ObjectContainer {
    pub(crate) fn new(object: ObjectIdx) -> Self {
        Self {
            object,
            state: ObjectState::Unsourced,
            ticket: 0,
            deadline: None,
            operations: Vec::new(),
            waiters: Vec::new(),
            managed: None,
            value: None,
        }
    }

    /// Container for an object supplied by the invoker
    pub(crate) fn bound(object: ObjectIdx, managed: Arc<dyn ManagedObject>) -> Self {
        let value = managed.object();
        Self {
            object,
            state: ObjectState::Ready,
            ticket: 0,
            deadline: None,
            operations: Vec::new(),
            waiters: Vec::new(),
            managed: Some(managed),
            value: Some(value),
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(self.state, ObjectState::Ready)
    }

    /// Sourcing or an asynchronous operation is outstanding
    pub(crate) fn is_pending(&self) -> bool {
        matches!(
            self.state,
            ObjectState::Sourcing | ObjectState::Loading | ObjectState::AsyncPending
        )
    }

    pub(crate) fn add_waiter(&mut self, function: FunctionKey) {
        if !self.waiters.contains(&function) {
            self.waiters.push(function);
        }
    }

    pub(crate) fn begin_sourcing(&mut self, ticket: u64, deadline: Option<Instant>) {
        self.state = ObjectState::Sourcing;
        self.ticket = ticket;
        self.deadline = deadline;
    }

    /// Accept a sourced object. `None` if the notification is stale.
    pub(crate) fn sourced(
        &mut self,
        ticket: u64,
        managed: Arc<dyn ManagedObject>,
        value: ObjectValue,
        coordinating: bool,
    ) -> Option<Vec<FunctionKey>> {
        if ticket != self.ticket || !matches!(self.state, ObjectState::Sourcing) {
            return None;
        }
        self.state = if coordinating {
            ObjectState::Sourced
        } else {
            ObjectState::Ready
        };
        self.deadline = None;
        self.managed = Some(managed);
        self.value = Some(value);
        Some(std::mem::take(&mut self.waiters))
    }

    pub(crate) fn begin_loading(&mut self, ticket: u64) {
        self.state = ObjectState::Loading;
        self.ticket = ticket;
    }

    pub(crate) fn loaded(
        &mut self,
        ticket: u64,
        result: Result<(), Escalation>,
    ) -> Option<Vec<FunctionKey>> {
        if ticket != self.ticket || !matches!(self.state, ObjectState::Loading) {
            return None;
        }
        self.state = match result {
            Ok(()) => ObjectState::Ready,
            Err(escalation) => ObjectState::Failed(Arc::new(escalation)),
        };
        Some(std::mem::take(&mut self.waiters))
    }

    /// Start an asynchronous operation on a ready or already busy object
    pub(crate) fn start_operation(&mut self, ticket: u64, deadline: Option<Instant>) -> bool {
        if !matches!(self.state, ObjectState::Ready | ObjectState::AsyncPending) {
            return false;
        }
        self.state = ObjectState::AsyncPending;
        self.operations.push((ticket, deadline));
        self.deadline = earliest(&self.operations);
        true
    }

    /// Finish one operation. A failure fails the object and drops the other
    /// outstanding operations. Waiters are released only once nothing is
    /// outstanding.
    pub(crate) fn finish_operation(
        &mut self,
        ticket: u64,
        result: Result<(), Escalation>,
    ) -> Option<Vec<FunctionKey>> {
        if !matches!(self.state, ObjectState::AsyncPending) {
            return None;
        }
        let position = self
            .operations
            .iter()
            .position(|(outstanding, _)| *outstanding == ticket)?;
        self.operations.remove(position);
        match result {
            Ok(()) if !self.operations.is_empty() => {
                self.deadline = earliest(&self.operations);
                return Some(Vec::new());
            }
            Ok(()) => self.state = ObjectState::Ready,
            Err(escalation) => {
                self.operations.clear();
                self.state = ObjectState::Failed(Arc::new(escalation));
            }
        }
        self.deadline = None;
        Some(std::mem::take(&mut self.waiters))
    }

    /// Fail sourcing. `None` if the notification is stale.
    pub(crate) fn fail(&mut self, ticket: u64, escalation: Escalation) -> Option<Vec<FunctionKey>> {
        if ticket != self.ticket || !matches!(self.state, ObjectState::Sourcing) {
            return None;
        }
        self.deadline = None;
        self.state = ObjectState::Failed(Arc::new(escalation));
        Some(std::mem::take(&mut self.waiters))
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.is_pending() && self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Fail with a timeout and invalidate the outstanding ticket
    pub(crate) fn expire(&mut self, next_ticket: u64, escalation: Escalation) -> Vec<FunctionKey> {
        self.ticket = next_ticket;
        self.deadline = None;
        self.operations.clear();
        self.state = ObjectState::Failed(Arc::new(escalation));
        std::mem::take(&mut self.waiters)
    }
}

fn earliest(operations: &[(u64, Option<Instant>)]) -> Option<Instant> {
    operations.iter().filter_map(|(_, deadline)| *deadline).min()
}
