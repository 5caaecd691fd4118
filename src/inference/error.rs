//! Inference Error Classification
//!
//! Typed failure classes for the inference pipeline. The router's retry
//! and skip decisions key off these variants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    #[error("network unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected by {provider}")]
    AuthFailed { provider: String },

    #[error("model not found upstream: {model_id}")]
    ModelNotFound { model_id: String },

    #[error("model {model_id} is not in the registry")]
    NotInRegistry { model_id: String },

    #[error("model {model_id} is disabled in the registry")]
    ModelDisabled { model_id: String },

    #[error("model {model_id} requires tier {required} but current tier is {current}")]
    TierTooLow {
        model_id: String,
        required: String,
        current: String,
    },

    #[error("chat completions endpoint not supported by {provider}")]
    ChatEndpointUnsupported { provider: String },

    #[error("{provider} returned {status}: {body}")]
    Upstream {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl InferenceError {
    /// Transient failures are retried with jittered backoff; everything
    /// else is surfaced to the caller immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Timeout { .. } | InferenceError::Unreachable(_) => true,
            InferenceError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(InferenceError::Timeout {
            url: "http://x".to_string(),
            timeout_secs: 30
        }
        .is_transient());
        assert!(InferenceError::Unreachable("refused".to_string()).is_transient());
        assert!(InferenceError::Upstream {
            provider: "openai".to_string(),
            status: 503,
            body: String::new()
        }
        .is_transient());

        assert!(!InferenceError::AuthFailed {
            provider: "openai".to_string()
        }
        .is_transient());
        assert!(!InferenceError::Upstream {
            provider: "openai".to_string(),
            status: 400,
            body: String::new()
        }
        .is_transient());
    }
}
