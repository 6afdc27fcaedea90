use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use poolgate_common::RequestContext;
use poolgate_provider_core::error::ProviderError;
use poolgate_provider_core::{
    CachedStore, Credential, CredentialError, ProviderConfig, SimpleCredential, TimeoutConfig,
};

use crate::client::{parse_retry_after, HttpBody, HttpResponse};

const BODY_EXCERPT_LIMIT: usize = 300;

/// Where an adapter gets its key material: a registry store resolved per
/// request (within the credential budget), or a direct inline key.
#[derive(Clone)]
pub(crate) enum CredentialSource {
    Store(Arc<CachedStore>),
    Direct(Credential),
}

impl CredentialSource {
    pub(crate) fn direct_key(api_key: &str) -> Self {
        CredentialSource::Direct(Credential::Simple(SimpleCredential {
            api_key: api_key.to_string(),
        }))
    }

    pub(crate) async fn resolve(
        &self,
        ctx: &RequestContext,
        budget: Duration,
    ) -> Result<Credential, ProviderError> {
        match self {
            CredentialSource::Direct(credential) => Ok(credential.clone()),
            CredentialSource::Store(store) => {
                let budget = budget.min(ctx.remaining());
                let resolved = tokio::time::timeout(budget, store.resolve())
                    .await
                    .map_err(|_| credential_error(CredentialError::Timeout))?;
                resolved.map_err(credential_error)
            }
        }
    }
}

fn credential_error(err: CredentialError) -> ProviderError {
    match err {
        CredentialError::Timeout => ProviderError::timeout("credential resolution timed out"),
        other => ProviderError::invalid_config(format!("credential resolution failed: {other}")),
    }
}

/// Provider operation budget: `remaining × multiplier` clamped into
/// `[min_timeout, max_timeout]`, never beyond the provider's own cap.
pub(crate) fn provider_op_timeout(
    config: &ProviderConfig,
    timeouts: &TimeoutConfig,
    ctx: &RequestContext,
) -> Duration {
    let scaled = ctx
        .remaining()
        .mul_f64(timeouts.provider_timeout_multiplier.clamp(0.0, 1.0));
    let clamped = scaled
        .max(Duration::from_millis(timeouts.min_timeout_ms))
        .min(Duration::from_millis(timeouts.max_timeout_ms));
    clamped.min(Duration::from_millis(config.timeout_ms))
}

pub(crate) fn build_url(api_base: &str, path: &str) -> String {
    let base = api_base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    // Tolerate bases that already carry the version segment.
    if base.ends_with("/v1") && (path == "v1" || path.starts_with("v1/")) {
        path = path.trim_start_matches("v1/").trim_start_matches("v1");
    }
    format!("{base}/{path}")
}

pub(crate) fn base_headers(config: &ProviderConfig, credential: &Credential) -> Vec<(String, String)> {
    let mut headers = credential.auth_headers();
    headers.push(("Content-Type".to_string(), "application/json".to_string()));
    headers.push(("Accept".to_string(), "application/json".to_string()));
    for (name, value) in &config.headers {
        headers.push((name.clone(), value.clone()));
    }
    headers
}

pub(crate) async fn take_bytes(body: HttpBody) -> Bytes {
    match body {
        HttpBody::Bytes(bytes) => bytes,
        HttpBody::Stream(mut stream) => {
            let mut out = Vec::new();
            while let Some(chunk) = stream.recv().await {
                out.extend_from_slice(&chunk);
            }
            Bytes::from(out)
        }
    }
}

/// Map a non-2xx upstream response to a classified error with a short,
/// redacted body excerpt and any `Retry-After` hint.
pub(crate) async fn error_from_response(provider: &str, response: HttpResponse) -> ProviderError {
    let status = response.status;
    let retry_after = parse_retry_after(&response);
    let body = take_bytes(response.body).await;
    let excerpt = excerpt_of(&body);
    let message = format!("{provider} returned HTTP {status}: {excerpt}");
    ProviderError::from_status(status, message)
        .with_retry_after(retry_after)
        .with_body_excerpt(excerpt)
}

fn excerpt_of(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let redacted = poolgate_common::redact_json(&json);
        return truncate(&redacted.to_string());
    }
    truncate(trimmed)
}

fn truncate(text: &str) -> String {
    if text.len() <= BODY_EXCERPT_LIMIT {
        return text.to_string();
    }
    let mut end = BODY_EXCERPT_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_building_deduplicates_version_segment() {
        assert_eq!(
            build_url("https://api.openai.com/v1", "/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            build_url("https://api.openai.com/v1/", "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            build_url("https://example.com", "/v1/models"),
            "https://example.com/v1/models"
        );
    }

    #[test]
    fn excerpt_redacts_and_truncates() {
        let excerpt = excerpt_of(br#"{"error":{"message":"no","api_key":"sk-leak"}}"#);
        assert!(excerpt.contains("[redacted]"));
        assert!(!excerpt.contains("sk-leak"));

        let long = "x".repeat(1000);
        assert!(truncate(&long).len() < 1000);
    }
}
