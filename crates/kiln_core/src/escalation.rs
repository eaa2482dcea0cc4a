//! Escalations and the escalation type hierarchy.
//!
//! An [`Escalation`] is a typed business failure. Its kind is a name in a
//! single-parent hierarchy declared ahead of execution; handlers are matched
//! by the distance from the failure's kind up to the handler's declared kind.
//!
//! Built-in kinds:
//! - `Failure`: root of every hierarchy
//! - `Defect`: unchecked faults such as panics
//! - `Timeout`: sourcing or asynchronous operation expiry
//! - `Cleanup`: failures raised while recycling managed objects

use crate::error::{KernelError, KernelResult};
use indexmap::IndexMap;
use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Name of an escalation type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EscalationKind(Cow<'static, str>);

impl EscalationKind {
    /// Root kind
    pub const FAILURE: Self = Self(Cow::Borrowed("Failure"));
    /// Unchecked fault
    pub const DEFECT: Self = Self(Cow::Borrowed("Defect"));
    /// Sourcing or asynchronous operation expiry
    pub const TIMEOUT: Self = Self(Cow::Borrowed("Timeout"));
    /// Failure while recycling
    pub const CLEANUP: Self = Self(Cow::Borrowed("Cleanup"));

    /// Kind name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for EscalationKind {
    fn from(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl From<String> for EscalationKind {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed failure propagated through escalation handling
#[derive(Clone)]
pub struct Escalation {
    kind: EscalationKind,
    message: String,
    cause: Option<Arc<Escalation>>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl Escalation {
    /// Create an escalation of the given kind
    #[must_use]
    pub fn new(kind: impl Into<EscalationKind>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
            payload: None,
        }
    }

    /// Unchecked fault
    #[must_use]
    pub fn defect(message: impl Into<String>) -> Self {
        Self::new(EscalationKind::DEFECT, message)
    }

    /// Expired sourcing or asynchronous operation
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(EscalationKind::TIMEOUT, message)
    }

    /// Failure raised during recycling
    #[must_use]
    pub fn cleanup(message: impl Into<String>) -> Self {
        Self::new(EscalationKind::CLEANUP, message)
    }

    /// Capture a standard error and its source chain
    #[must_use]
    pub fn from_error(
        kind: impl Into<EscalationKind>,
        err: &(dyn std::error::Error + 'static),
    ) -> Self {
        let mut escalation = Self::new(kind, err.to_string());
        if let Some(source) = err.source() {
            escalation.cause = Some(Arc::new(Self::from_error(EscalationKind::FAILURE, source)));
        }
        escalation
    }

    /// Attach a cause
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<Arc<Escalation>>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Attach a payload for handlers to inspect
    #[must_use]
    pub fn with_payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Escalation kind
    #[must_use]
    pub fn kind(&self) -> &EscalationKind {
        &self.kind
    }

    /// Failure message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Direct cause, if any
    #[must_use]
    pub fn cause(&self) -> Option<&Arc<Escalation>> {
        self.cause.as_ref()
    }

    /// Payload downcast to `T`
    #[must_use]
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Check the kind by name
    #[must_use]
    pub fn is(&self, kind: &str) -> bool {
        self.kind.as_str() == kind
    }

    /// Iterate this escalation and its causes
    #[must_use]
    pub fn chain(&self) -> Chain<'_> {
        Chain {
            next: Some(self),
        }
    }

    /// Multi-line report of the full causal chain
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = String::new();
        for (depth, escalation) in self.chain().enumerate() {
            if depth == 0 {
                out.push_str(&escalation.to_string());
            } else {
                out.push_str("\n  caused by: ");
                out.push_str(&escalation.to_string());
            }
        }
        out
    }
}

impl fmt::Debug for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Escalation")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("cause", &self.cause)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Escalation {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Iterator over an escalation's causal chain
pub struct Chain<'a> {
    next: Option<&'a Escalation>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a Escalation;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.cause.as_deref();
        Some(current)
    }
}

/// Index of a declared escalation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EscalationTypeId(u32);

impl EscalationTypeId {
    /// The `Failure` root
    pub const FAILURE: Self = Self(0);

    /// Raw index
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

const BUILT_IN: [EscalationKind; 4] = [
    EscalationKind::FAILURE,
    EscalationKind::DEFECT,
    EscalationKind::TIMEOUT,
    EscalationKind::CLEANUP,
];

/// Declares the escalation type hierarchy before the office is built
#[derive(Debug, Default)]
pub struct EscalationTypesBuilder {
    declared: IndexMap<String, String>,
}

impl EscalationTypesBuilder {
    /// Create a builder holding only the built-in kinds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `name` as a subtype of `parent`
    ///
    /// # Errors
    ///
    /// Returns error if the name is built-in or already declared
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        parent: impl Into<String>,
    ) -> KernelResult<&mut Self> {
        let name = name.into();
        if BUILT_IN.iter().any(|k| k.as_str() == name) || self.declared.contains_key(&name) {
            return Err(KernelError::Duplicate {
                kind: "Escalation type".to_string(),
                name,
            });
        }
        self.declared.insert(name, parent.into());
        Ok(self)
    }

    /// Build the lookup table
    ///
    /// # Errors
    ///
    /// Returns error on an undeclared parent or a cycle
    pub fn build(self) -> KernelResult<EscalationTypes> {
        let mut names: Vec<EscalationKind> = BUILT_IN.to_vec();
        let mut index: HashMap<String, EscalationTypeId> = HashMap::new();
        for (i, kind) in BUILT_IN.iter().enumerate() {
            index.insert(kind.as_str().to_string(), EscalationTypeId(i as u32));
        }
        for name in self.declared.keys() {
            let id = EscalationTypeId(names.len() as u32);
            names.push(EscalationKind::from(name.clone()));
            index.insert(name.clone(), id);
        }

        let mut parents: Vec<Option<EscalationTypeId>> = vec![
            None,
            Some(EscalationTypeId::FAILURE),
            Some(EscalationTypeId::FAILURE),
            Some(EscalationTypeId::FAILURE),
        ];
        for parent in self.declared.values() {
            let id = index
                .get(parent)
                .copied()
                .ok_or_else(|| KernelError::UnknownEscalationType {
                    name: parent.clone(),
                })?;
            parents.push(Some(id));
        }

        let mut ancestors = Vec::with_capacity(names.len());
        for start in 0..names.len() {
            let mut chain = vec![EscalationTypeId(start as u32)];
            let mut current = parents[start];
            while let Some(parent) = current {
                if chain.len() > names.len() {
                    return Err(KernelError::EscalationTypeCycle {
                        name: names[start].to_string(),
                    });
                }
                chain.push(parent);
                current = parents[parent.0 as usize];
            }
            ancestors.push(chain);
        }

        Ok(EscalationTypes {
            names,
            index,
            ancestors,
        })
    }
}

/// Static type-compatibility table for escalation matching
#[derive(Debug, Clone)]
pub struct EscalationTypes {
    names: Vec<EscalationKind>,
    index: HashMap<String, EscalationTypeId>,
    /// `ancestors[t]` lists `t`, its parent, and so on up to `Failure`
    ancestors: Vec<Vec<EscalationTypeId>>,
}

impl EscalationTypes {
    /// Table of the built-in kinds only
    #[must_use]
    pub fn built_in() -> Self {
        let names = BUILT_IN.to_vec();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, kind)| (kind.as_str().to_string(), EscalationTypeId(i as u32)))
            .collect();
        // Every built-in other than `Failure` sits directly below it
        let ancestors = (0..names.len() as u32)
            .map(|id| match id {
                0 => vec![EscalationTypeId::FAILURE],
                id => vec![EscalationTypeId(id), EscalationTypeId::FAILURE],
            })
            .collect();
        Self {
            names,
            index,
            ancestors,
        }
    }

    /// Look up a declared type
    #[must_use]
    pub fn id(&self, name: &str) -> Option<EscalationTypeId> {
        self.index.get(name).copied()
    }

    /// Name of a declared type
    #[must_use]
    pub fn name(&self, id: EscalationTypeId) -> Option<&EscalationKind> {
        self.names.get(id.0 as usize)
    }

    /// Number of declared types, built-ins included
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false: the built-ins are present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Steps from `kind` up to `handler`, or `None` if `handler` is not an
    /// ancestor. Undeclared kinds sit directly below `Failure`.
    #[must_use]
    pub fn distance(&self, kind: &EscalationKind, handler: EscalationTypeId) -> Option<usize> {
        match self.id(kind.as_str()) {
            Some(id) => self.ancestors[id.0 as usize]
                .iter()
                .position(|ancestor| *ancestor == handler),
            None if handler == EscalationTypeId::FAILURE => Some(1),
            None => None,
        }
    }

    /// Check if `kind` is `handler` or one of its subtypes
    #[must_use]
    pub fn is_a(&self, kind: &EscalationKind, handler: EscalationTypeId) -> bool {
        self.distance(kind, handler).is_some()
    }
}
