//! Error types for the Slurm operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Object store outcomes that callers branch on (not found, already exists,
//! conflict) get their own variants so control flow never has to inspect
//! raw API status codes.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Slurm operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error not covered by a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "Pod")
        kind: String,
        /// Object name
        name: String,
    },

    /// The object already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Optimistic concurrency conflict: the object changed since it was read
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
        /// Server-provided detail
        message: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource the invalid configuration belongs to
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.token.secretRef")
        field: Option<String>,
    },

    /// Persistent volume claim could not be brought into shape
    #[error("{message}")]
    Claim {
        /// Name of the claim
        claim: String,
        /// Description of what failed
        message: String,
    },

    /// Slurm REST API error
    #[error("slurm error [{server}]: {message}")]
    Slurm {
        /// Server the request was sent to
        server: String,
        /// Description of what failed
        message: String,
        /// HTTP status code, when the server answered
        status: Option<u16>,
    },

    /// Several independent operations failed
    #[error("{}", join_errors(.errors))]
    Aggregate {
        /// The collected errors, in the order they occurred
        errors: Vec<Error>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "registry")
        context: String,
    },
}

fn join_errors(errors: &[Error]) -> String {
    match errors {
        [single] => single.to_string(),
        _ => {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            format!("[{}]", joined.join(", "))
        }
    }
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a claim error
    pub fn claim(claim: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Claim {
            claim: claim.into(),
            message: msg.into(),
        }
    }

    /// Create a Slurm API error
    pub fn slurm(server: impl Into<String>, msg: impl Into<String>, status: Option<u16>) -> Self {
        Self::Slurm {
            server: server.into(),
            message: msg.into(),
            status,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Collapse a list of errors into one.
    ///
    /// Returns `Ok(())` for an empty list and the error itself for a single
    /// entry, so callers can always funnel partial failures through here.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate { errors }),
        }
    }

    /// Map a kube-rs error for a named object onto the store outcome variants
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, name),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::already_exists(kind, name)
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(kind, name, ae.message),
            other => Self::Kube { source: other },
        }
    }

    /// True if the object did not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True if the object already existed
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// True if the write lost an optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec fix. An aggregate is
    /// retryable if any member is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::NotFound { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::Conflict { .. } => true,
            Error::Validation { .. } => false,
            Error::Claim { .. } => true,
            Error::Slurm { .. } => true,
            Error::Aggregate { errors } => errors.iter().any(Error::is_retryable),
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
