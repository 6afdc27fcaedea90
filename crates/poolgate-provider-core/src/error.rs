use std::fmt;
use std::time::Duration;

use poolgate_common::GatewayError;
use serde::{Deserialize, Serialize};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Classification of an upstream failure. The circuit breaker keys all of
/// its trip decisions off this value, so the mapping rules here are the
/// contract, not an implementation detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Temporary,
    Permanent,
    RateLimit,
    Authentication,
    NotFound,
    ServerError,
    ClientError,
    NetworkError,
    Timeout,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Temporary => "temporary",
            ErrorClass::Permanent => "permanent",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Authentication => "authentication",
            ErrorClass::NotFound => "not_found",
            ErrorClass::ServerError => "server_error",
            ErrorClass::ClientError => "client_error",
            ErrorClass::NetworkError => "network_error",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Classes worth retrying on another attempt, provider or pool.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Temporary
                | ErrorClass::ServerError
                | ErrorClass::Timeout
                | ErrorClass::NetworkError
                | ErrorClass::RateLimit
                | ErrorClass::ClientError
        )
    }

    /// Classes that open a breaker on a single observation.
    pub fn trips_immediately(&self) -> bool {
        matches!(self, ErrorClass::NotFound | ErrorClass::Authentication)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        400 => ErrorClass::ClientError,
        401 | 403 => ErrorClass::Authentication,
        404 => ErrorClass::NotFound,
        408 => ErrorClass::Timeout,
        429 => ErrorClass::RateLimit,
        500 | 502 | 503 | 505 => ErrorClass::ServerError,
        504 => ErrorClass::Timeout,
        status if (400..500).contains(&status) => ErrorClass::ClientError,
        status if (500..600).contains(&status) => ErrorClass::ServerError,
        _ => ErrorClass::Unknown,
    }
}

/// Classify a non-HTTP error by its message: substring rules first, then a
/// rescan for the first embedded 3-digit status code.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("aborted") {
        return ErrorClass::Timeout;
    }
    if lower.contains("network") || lower.contains("connection") || lower.contains("fetch") {
        return ErrorClass::NetworkError;
    }
    if let Some(status) = first_status_code(&lower) {
        return classify_status(status);
    }
    ErrorClass::Unknown
}

fn first_status_code(message: &str) -> Option<u16> {
    let bytes = message.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 3 {
                if let Ok(code) = message[start..i].parse::<u16>() {
                    if (100..=599).contains(&code) {
                        return Some(code);
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    None
}

pub fn status_code_symbol(status: u16) -> String {
    match status {
        400 => "bad_request".to_string(),
        401 => "unauthorized".to_string(),
        403 => "forbidden".to_string(),
        404 => "not_found".to_string(),
        408 => "request_timeout".to_string(),
        429 => "rate_limit_exceeded".to_string(),
        500 => "internal_server_error".to_string(),
        502 => "bad_gateway".to_string(),
        503 => "service_unavailable".to_string(),
        504 => "gateway_timeout".to_string(),
        other => format!("http_{other}"),
    }
}

/// Upstream failure as observed by an adapter, after its local retries.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub class: ErrorClass,
    pub retryable: bool,
    pub rate_limited: bool,
    pub retry_after: Option<Duration>,
    /// Short error body excerpt for diagnostics; already redacted.
    pub body_excerpt: Option<String>,
}

impl ProviderError {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let class = classify_status(status);
        Self {
            message: message.into(),
            status: Some(status),
            code: Some(status_code_symbol(status)),
            class,
            retryable: class.is_retryable(),
            rate_limited: status == 429,
            retry_after: None,
            body_excerpt: None,
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify_message(&message);
        Self {
            message,
            status: None,
            code: None,
            class,
            retryable: class.is_retryable(),
            rate_limited: class == ErrorClass::RateLimit,
            retry_after: None,
            body_excerpt: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: Some("timeout".to_string()),
            class: ErrorClass::Timeout,
            retryable: true,
            rate_limited: false,
            retry_after: None,
            body_excerpt: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: Some("connection".to_string()),
            class: ErrorClass::NetworkError,
            retryable: true,
            rate_limited: false,
            retry_after: None,
            body_excerpt: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            message: "request cancelled".to_string(),
            status: None,
            code: Some("cancelled".to_string()),
            class: ErrorClass::Timeout,
            retryable: false,
            rate_limited: false,
            retry_after: None,
            body_excerpt: None,
        }
    }

    pub fn unsupported(operation: &str) -> Self {
        Self {
            message: format!("operation not supported by this provider: {operation}"),
            status: None,
            code: Some("unsupported_operation".to_string()),
            class: ErrorClass::Permanent,
            retryable: false,
            rate_limited: false,
            retry_after: None,
            body_excerpt: None,
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: Some("invalid_config".to_string()),
            class: ErrorClass::Permanent,
            retryable: false,
            rate_limited: false,
            retry_after: None,
            body_excerpt: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_body_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.body_excerpt = Some(excerpt.into());
        self
    }

    pub fn to_gateway(&self) -> GatewayError {
        match self.class {
            ErrorClass::Timeout => GatewayError::ProviderTimeout(self.message.clone()),
            ErrorClass::RateLimit => GatewayError::ProviderRateLimit(self.message.clone()),
            ErrorClass::Authentication => {
                GatewayError::ProviderAuthentication(self.message.clone())
            }
            ErrorClass::NetworkError => GatewayError::ProviderConnection(self.message.clone()),
            ErrorClass::NotFound => GatewayError::ProviderNotFound(self.message.clone()),
            _ => GatewayError::Provider {
                message: self.message.clone(),
                retryable: self.retryable,
                metadata: self.body_excerpt.as_ref().map(|excerpt| {
                    serde_json::json!({
                        "status": self.status,
                        "class": self.class.as_str(),
                        "upstreamBody": excerpt,
                    })
                }),
            },
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({}): {}", self.class, status, self.message),
            None => write!(f, "{}: {}", self.class, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table_matches_contract() {
        assert_eq!(classify_status(400), ErrorClass::ClientError);
        assert_eq!(classify_status(401), ErrorClass::Authentication);
        assert_eq!(classify_status(403), ErrorClass::Authentication);
        assert_eq!(classify_status(404), ErrorClass::NotFound);
        assert_eq!(classify_status(408), ErrorClass::Timeout);
        assert_eq!(classify_status(429), ErrorClass::RateLimit);
        for status in [500, 502, 503, 505] {
            assert_eq!(classify_status(status), ErrorClass::ServerError);
        }
        assert_eq!(classify_status(504), ErrorClass::Timeout);
    }

    #[test]
    fn message_substrings_win_over_embedded_codes() {
        assert_eq!(classify_message("Request timeout after 500ms"), ErrorClass::Timeout);
        assert_eq!(classify_message("operation aborted"), ErrorClass::Timeout);
        assert_eq!(classify_message("fetch failed"), ErrorClass::NetworkError);
        assert_eq!(classify_message("Connection refused"), ErrorClass::NetworkError);
    }

    #[test]
    fn embedded_status_code_is_reclassified() {
        assert_eq!(classify_message("upstream said 404: Not found"), ErrorClass::NotFound);
        assert_eq!(classify_message("got 503 from origin"), ErrorClass::ServerError);
        assert_eq!(classify_message("weird 9999 value"), ErrorClass::Unknown);
        assert_eq!(classify_message("nothing to see"), ErrorClass::Unknown);
    }

    #[test]
    fn retryable_and_immediate_sets() {
        for class in [
            ErrorClass::Temporary,
            ErrorClass::ServerError,
            ErrorClass::Timeout,
            ErrorClass::NetworkError,
            ErrorClass::RateLimit,
            ErrorClass::ClientError,
        ] {
            assert!(class.is_retryable(), "{class} should be retryable");
        }
        assert!(!ErrorClass::Authentication.is_retryable());
        assert!(ErrorClass::NotFound.trips_immediately());
        assert!(ErrorClass::Authentication.trips_immediately());
        assert!(!ErrorClass::ServerError.trips_immediately());
    }

    #[test]
    fn rate_limit_flag_follows_429() {
        let err = ProviderError::from_status(429, "slow down");
        assert!(err.rate_limited);
        assert!(err.retryable);
        assert_eq!(err.code.as_deref(), Some("rate_limit_exceeded"));
    }
}
