//! Error type shared by every layer of the crate.

use std::fmt;

use crate::rules::Operation;

/// Why a dynamic function could not be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodAccessReason {
    /// No function with that name is registered for the entity type.
    Missing,
    /// The function exists but was not registered as externally callable.
    NotExternal,
}

impl fmt::Display for MethodAccessReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("method does not exist"),
            Self::NotExternal => f.write_str("method exists but is not marked external"),
        }
    }
}

/// Errors produced while composing, authorizing, executing or serializing queries.
///
/// Authorization and method-access failures are policy decisions: they are
/// surfaced unchanged to the caller and must never be retried.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// A mutating operation has no rule granting it, or a deny rule fired.
    #[error("unauthorized {operation} on {entity}")]
    UnauthorizedAccess {
        entity: &'static str,
        operation: Operation,
    },

    /// A dynamic function is missing or not callable from outside.
    #[error("cannot call '{method}' on {entity}: {reason}")]
    MethodAccess {
        entity: &'static str,
        method: String,
        reason: MethodAccessReason,
    },

    /// A member access or include segment names a property the type does not have.
    #[error("unknown property '{property}' on {entity}")]
    UnknownProperty {
        entity: &'static str,
        property: String,
    },

    /// An include path cannot be resolved against the entity model.
    #[error("invalid include path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// A wire parameter could not be decoded into the requested type.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The query expression could not be evaluated.
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// The caller-supplied cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The external query provider failed.
    #[error("provider error: {0}")]
    Provider(#[source] anyhow::Error),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AccessError {
    pub(crate) fn unauthorized(entity: &'static str, operation: Operation) -> Self {
        Self::UnauthorizedAccess { entity, operation }
    }

    /// Returns `true` for failures that denote a policy decision rather than a fault.
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::UnauthorizedAccess { .. } | Self::MethodAccess { .. }
        )
    }
}

impl From<figment::Error> for AccessError {
    fn from(e: figment::Error) -> Self {
        Self::Config(e.to_string())
    }
}
