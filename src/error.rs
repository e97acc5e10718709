//! Error types for the template operator

use thiserror::Error;

/// Main error type for template operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Template parse or render error
    #[error("template error: {0}")]
    Template(String),

    /// Schema lookup or coercion error
    #[error("schema error: {0}")]
    Schema(String),

    /// Patch application error, tagged with the patch ordinal for diagnosis
    #[error("patch {index} failed: {message}")]
    Patch {
        /// Position of the patch in the Template's patch list
        index: usize,
        /// Underlying failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Outbound HTTP request error (REST reconciliation)
    #[error("http error: {0}")]
    Http(String),

    /// GitRepository artifact fetch or extraction error
    #[error("git source error: {0}")]
    Git(String),

    /// Optimistic concurrency conflict that survived the retry schedule
    #[error("conflict persisted after retries: {0}")]
    Conflict(String),

    /// A synthesized object depends on objects that are not yet ready.
    ///
    /// Soft condition: reconcilers map this to a requeue hint, not a failure.
    #[error("dependency not ready: {0}")]
    DependencyNotReady(String),
}

impl Error {
    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a schema error with the given message
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a patch error carrying the patch ordinal
    pub fn patch(index: usize, msg: impl Into<String>) -> Self {
        Self::Patch {
            index,
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an http error with the given message
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a git source error with the given message
    pub fn git(msg: impl Into<String>) -> Self {
        Self::Git(msg.into())
    }

    /// True when this error only signals that dependencies need more time
    pub fn is_dependency_not_ready(&self) -> bool {
        matches!(self, Self::DependencyNotReady(_))
    }

    /// True when the underlying cause is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// True when the underlying cause is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(e)) if e.code == 409)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<minijinja::Error> for Error {
    fn from(e: minijinja::Error) -> Self {
        Self::Template(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}
