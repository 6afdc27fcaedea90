use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-request context: absolute deadline plus a cancellation signal.
///
/// Created once at ingress and attached to every downstream call. Cancelling
/// the context stops upstream IO, the streaming pump and any pending retries
/// for this request only; other requests sharing a pool are unaffected.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    deadline: Instant,
    cancel: CancellationToken,
    tags: Vec<(String, String)>,
}

impl RequestContext {
    pub fn new(timeout: Duration) -> Self {
        Self::with_request_id(uuid::Uuid::now_v7().to_string(), timeout)
    }

    pub fn with_request_id(request_id: String, timeout: Duration) -> Self {
        Self {
            request_id,
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
            tags: Vec::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline; zero once the deadline has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the context is cancelled (client disconnect or deadline
    /// enforcement upstream of this call).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.push((key.into(), value.into()));
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// Derive a context sharing this request's cancellation but with a
    /// tighter deadline (e.g. a credential-resolution budget).
    pub fn with_budget(&self, budget: Duration) -> Self {
        let deadline = (Instant::now() + budget).min(self.deadline);
        Self {
            request_id: self.request_id.clone(),
            deadline,
            cancel: self.cancel.clone(),
            tags: self.tags.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn budget_never_extends_the_deadline() {
        let ctx = RequestContext::new(Duration::from_millis(50));
        let child = ctx.with_budget(Duration::from_secs(10));
        assert!(child.remaining() <= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn cancel_propagates_to_children() {
        let ctx = RequestContext::new(Duration::from_secs(1));
        let child = ctx.with_budget(Duration::from_millis(100));
        ctx.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn remaining_hits_zero_after_deadline() {
        let ctx = RequestContext::new(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }
}
