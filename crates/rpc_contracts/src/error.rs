#![forbid(unsafe_code)]

use std::fmt;

use thiserror::Error;

pub type ContractResult<T> = Result<T, ContractError>;

/// Engine-level failures. Registration errors surface to the caller of the
/// registration API; invocation errors are folded into reported violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("malformed condition on {method}: {reason}")]
    Shape { method: String, reason: String },

    #[error("service contracts must be registered before the server interceptor is built")]
    AlreadyServing,

    #[error("duplicate contract registration for {full_method}")]
    DuplicateContract { full_method: String },

    #[error("condition declares {declared} parameter(s) but was invoked with {supplied}")]
    Arity { declared: usize, supplied: usize },

    #[error("condition parameter {position} expects payload `{expected}`")]
    PayloadType {
        position: usize,
        expected: &'static str,
    },

    #[error("condition panicked: {0}")]
    ConditionPanicked(String),

    #[error("request identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("call history lock poisoned")]
    HistoryPoisoned,

    #[error("call history result set is empty")]
    NotFound,
}

/// Non-success outcome of a pre- or postcondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractViolation {
    message: String,
}

impl ContractViolation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ContractViolation {}

impl From<&str> for ContractViolation {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ContractViolation {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<ContractError> for ContractViolation {
    fn from(err: ContractError) -> Self {
        Self::new(err.to_string())
    }
}
