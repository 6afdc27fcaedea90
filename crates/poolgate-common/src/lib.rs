mod ctx;
mod error;
mod redact;

pub use ctx::RequestContext;
pub use error::{ErrorBody, ErrorEnvelope, GatewayError};
pub use redact::{is_sensitive_key, redact_headers, redact_json};
