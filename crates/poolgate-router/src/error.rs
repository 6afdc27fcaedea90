use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use poolgate_common::GatewayError;

/// Taxonomy → HTTP status. The wire body is the shared error envelope.
pub(crate) fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Validation(_) | GatewayError::CapabilityUnsupported { .. } => {
            StatusCode::BAD_REQUEST
        }
        GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::ProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::ProviderRateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::Provider { .. }
        | GatewayError::ProviderAuthentication(_)
        | GatewayError::ProviderConnection(_)
        | GatewayError::ProviderNotFound(_) => StatusCode::BAD_GATEWAY,
        GatewayError::NoPoolsConfigured(_) | GatewayError::AllProvidersFailed { .. }
        | GatewayError::AllPoolsFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) struct ApiError(pub GatewayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let envelope = self.0.into_envelope();
        (status, Json(envelope)).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_exhaustion_maps_to_503() {
        let err = GatewayError::AllPoolsFailed {
            model: "gpt-4o".to_string(),
            attempted: vec!["a".to_string()],
        };
        assert_eq!(status_for(&err), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn unknown_model_maps_to_404() {
        assert_eq!(
            status_for(&GatewayError::ModelNotFound("x".to_string())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn rate_limit_maps_to_429() {
        assert_eq!(
            status_for(&GatewayError::ProviderRateLimit("slow".to_string())),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
