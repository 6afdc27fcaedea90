use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Gateway-level failure taxonomy.
///
/// The HTTP layer maps each kind to a status code and wire envelope; the
/// dispatch engine only deals in these kinds.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("model does not support {capability}: {model}")]
    CapabilityUnsupported { model: String, capability: String },
    #[error("provider error: {message}")]
    Provider {
        message: String,
        retryable: bool,
        metadata: Option<JsonValue>,
    },
    #[error("provider timed out: {0}")]
    ProviderTimeout(String),
    #[error("provider rate limited: {0}")]
    ProviderRateLimit(String),
    #[error("provider authentication failed: {0}")]
    ProviderAuthentication(String),
    #[error("provider connection failed: {0}")]
    ProviderConnection(String),
    #[error("provider resource not found: {0}")]
    ProviderNotFound(String),
    #[error("no pools configured for model: {0}")]
    NoPoolsConfigured(String),
    #[error("all providers failed in pool {pool}")]
    AllProvidersFailed { pool: String },
    #[error("all pools failed for model {model}; attempted: {}", attempted.join(", "))]
    AllPoolsFailed {
        model: String,
        attempted: Vec<String>,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable `type` discriminator used in the wire envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::CapabilityUnsupported { .. } => "model_capability_unsupported",
            GatewayError::Provider { .. } => "provider",
            GatewayError::ProviderTimeout(_) => "provider_timeout",
            GatewayError::ProviderRateLimit(_) => "provider_rate_limit",
            GatewayError::ProviderAuthentication(_) => "provider_authentication",
            GatewayError::ProviderConnection(_) => "provider_connection",
            GatewayError::ProviderNotFound(_) => "provider_not_found",
            GatewayError::NoPoolsConfigured(_) => "all_providers_failed",
            GatewayError::AllProvidersFailed { .. } => "all_providers_failed",
            GatewayError::AllPoolsFailed { .. } => "all_providers_failed",
            GatewayError::Internal(_) => "internal",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "invalid_request",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::CapabilityUnsupported { .. } => "capability_unsupported",
            GatewayError::Provider { .. } => "provider_error",
            GatewayError::ProviderTimeout(_) => "provider_timeout",
            GatewayError::ProviderRateLimit(_) => "rate_limit_exceeded",
            GatewayError::ProviderAuthentication(_) => "provider_authentication",
            GatewayError::ProviderConnection(_) => "provider_connection",
            GatewayError::ProviderNotFound(_) => "provider_not_found",
            GatewayError::NoPoolsConfigured(_) => "all_providers_failed",
            GatewayError::AllProvidersFailed { .. } => "all_providers_failed",
            GatewayError::AllPoolsFailed { .. } => "all_providers_failed",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn retryable(&self) -> Option<bool> {
        match self {
            GatewayError::Provider { retryable, .. } => Some(*retryable),
            GatewayError::ProviderTimeout(_)
            | GatewayError::ProviderRateLimit(_)
            | GatewayError::ProviderConnection(_)
            | GatewayError::NoPoolsConfigured(_)
            | GatewayError::AllProvidersFailed { .. }
            | GatewayError::AllPoolsFailed { .. } => Some(true),
            GatewayError::ProviderAuthentication(_) | GatewayError::ProviderNotFound(_) => {
                Some(false)
            }
            _ => None,
        }
    }

    pub fn metadata(&self) -> Option<JsonValue> {
        match self {
            GatewayError::Provider { metadata, .. } => metadata.clone(),
            GatewayError::AllPoolsFailed { attempted, .. } => {
                Some(serde_json::json!({ "attemptedPools": attempted }))
            }
            _ => None,
        }
    }

    pub fn into_envelope(self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                kind: self.kind().to_string(),
                code: self.code().to_string(),
                retryable: self.retryable(),
                metadata: self.metadata(),
            },
        }
    }
}

/// Wire shape: `{"error":{"message","type","code","retryable"?,"metadata"?}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_type_and_code() {
        let err = GatewayError::AllPoolsFailed {
            model: "gpt-4o".to_string(),
            attempted: vec!["primary".to_string(), "backup".to_string()],
        };
        let envelope = err.into_envelope();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"]["type"], "all_providers_failed");
        assert_eq!(json["error"]["retryable"], true);
        assert_eq!(json["error"]["metadata"]["attemptedPools"][0], "primary");
    }

    #[test]
    fn validation_has_no_retryable_flag() {
        let json =
            serde_json::to_value(GatewayError::Validation("bad body".to_string()).into_envelope())
                .unwrap();
        assert!(json["error"].get("retryable").is_none());
    }
}
