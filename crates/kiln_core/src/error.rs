//! Kernel error types.
//!
//! These cover registration, configuration, and invocation. Failures raised
//! by running functions are [`crate::Escalation`]s, not kernel errors.

/// Kernel result type
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// Referenced function is not registered
    #[error("Unknown function: {name}")]
    UnknownFunction {
        /// Function name
        name: String,
    },

    /// Referenced team is not registered
    #[error("Unknown team: {name}")]
    UnknownTeam {
        /// Team name
        name: String,
    },

    /// Referenced managed object is not registered
    #[error("Unknown managed object: {name}")]
    UnknownManagedObject {
        /// Managed object name
        name: String,
    },

    /// Referenced governance is not registered
    #[error("Unknown governance: {name}")]
    UnknownGovernance {
        /// Governance name
        name: String,
    },

    /// Referenced escalation type is not declared
    #[error("Unknown escalation type: {name}")]
    UnknownEscalationType {
        /// Escalation type name
        name: String,
    },

    /// Name registered twice
    #[error("{kind} already registered: {name}")]
    Duplicate {
        /// Kind of registration
        kind: String,
        /// Duplicated name
        name: String,
    },

    /// Managed object dependencies form a cycle
    #[error("Dependency cycle: {}", path.join(" -> "))]
    DependencyCycle {
        /// Names along the cycle
        path: Vec<String>,
    },

    /// Escalation type hierarchy forms a cycle
    #[error("Escalation type cycle at {name}")]
    EscalationTypeCycle {
        /// Type at which the cycle was detected
        name: String,
    },

    /// Dependency lives in a narrower scope than its dependent
    #[error("Managed object {object} cannot depend on narrower-scoped {dependency}")]
    ScopeViolation {
        /// Dependent object
        object: String,
        /// Dependency object
        dependency: String,
    },

    /// Dependency or flow key not linked
    #[error("Managed object {object} has unlinked {kind} key: {key}")]
    UnlinkedKey {
        /// Managed object name
        object: String,
        /// Dependency or flow
        kind: String,
        /// Unlinked key
        key: String,
    },

    /// Managed object source failed to initialise or start
    #[error("Managed object source {name} failed: {reason}")]
    Source {
        /// Managed object name
        name: String,
        /// Failure reason
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Failure reason
        reason: String,
    },

    /// Arena ran out of slot indices
    #[error("Arena exhausted at {capacity} slots")]
    ArenaExhausted {
        /// Slots allocated when insertion failed
        capacity: usize,
    },

    /// Office no longer accepts invocations
    #[error("Office closed: {name}")]
    OfficeClosed {
        /// Office name
        name: String,
    },
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KernelError::UnknownFunction {
            name: "entry".to_string(),
        };
        assert_eq!(format!("{}", err), "Unknown function: entry");

        let err = KernelError::Duplicate {
            kind: "Team".to_string(),
            name: "io".to_string(),
        };
        assert_eq!(format!("{}", err), "Team already registered: io");
    }

    #[test]
    fn test_cycle_display() {
        let err = KernelError::DependencyCycle {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(format!("{}", err), "Dependency cycle: a -> b -> a");
    }

    #[test]
    fn test_arena_exhausted_display() {
        let err = KernelError::ArenaExhausted {
            capacity: 8,
        };
        assert_eq!(format!("{}", err), "Arena exhausted at 8 slots");
    }

    #[test]
    fn test_error_equality() {
        let err1 = KernelError::OfficeClosed {
            name: "office".to_string(),
        };
        let err2 = err1.clone();
        assert_eq!(err1, err2);
        assert_ne!(
            err1,
            KernelError::Config {
                reason: "bad".to_string()
            }
        );
    }
}
