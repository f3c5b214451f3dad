//! Error types for the AI deployment operator
//!
//! Errors fall into two families that the controllers treat very differently:
//! configuration errors are the user's to fix and end up in the resource
//! status, everything else is an operational failure handed back to the
//! controller runtime for backoff.

use thiserror::Error;

/// Default context value when no specific resource is known
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The resource spec cannot be turned into a workload
    #[error("configuration error for {resource}: {message}")]
    Configuration {
        /// `namespace/name` of the offending resource
        resource: String,
        /// Description of what's invalid
        message: String,
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

impl Error {
    /// Create a configuration error without resource context
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a configuration error for a `namespace/name` resource
    pub fn configuration_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Whether this error means the spec itself is unusable
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Whether the API server answered 404
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Whether the API server rejected a write on a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Message suitable for the resource status (no error-kind prefix)
    pub fn status_message(&self) -> String {
        match self {
            Self::Configuration { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether retrying without a spec change can succeed
    ///
    /// Every API failure is retried with backoff, permission and validation
    /// answers included. Only configuration and serialization errors wait for
    /// a spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { .. } => true,
            Self::Configuration { .. } => false,
            Self::Serialization { .. } => false,
            Self::Internal { .. } => true,
        }
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Self::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} for test"),
        reason: reason.to_string(),
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a spec mistake is never retried blindly
    #[test]
    fn story_configuration_errors_wait_for_user() {
        let err = Error::configuration_for("ml/llama", "unknown engine bogus");
        assert!(err.is_configuration());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "configuration error for ml/llama: unknown engine bogus"
        );
        assert_eq!(err.status_message(), "unknown engine bogus");
    }

    #[test]
    fn conflict_is_detected_and_retryable() {
        let err = api_error(409, "Conflict");
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_is_detected() {
        let err = api_error(404, "NotFound");
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }

    #[test]
    fn every_api_failure_is_retryable() {
        assert!(api_error(403, "Forbidden").is_retryable());
        assert!(api_error(422, "Invalid").is_retryable());
        assert!(api_error(429, "TooManyRequests").is_retryable());
        assert!(api_error(503, "ServiceUnavailable").is_retryable());
    }

    #[test]
    fn internal_errors_keep_context() {
        let err = Error::internal("registry", "engine table poisoned");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[registry]"));
        assert_eq!(err.status_message(), err.to_string());
    }

    #[test]
    fn serde_errors_become_serialization() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("nope");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
    }
}
