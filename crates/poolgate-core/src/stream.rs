use std::time::Duration;

use bytes::Bytes;

use poolgate_common::RequestContext;
use poolgate_provider_core::ByteStream;

/// Reason attached when the upstream reader is cancelled mid-stream.
pub const CLIENT_DISCONNECT_REASON: &str = "Client disconnected or stream aborted";

const OUTBOUND_BUFFER: usize = 16;

/// Forwards upstream SSE bytes to the client verbatim, honoring the request
/// context. On cancellation the upstream receiver is dropped (which stops
/// the transport task) and the outbound stream closes; a deadline derived
/// from the context bounds the whole stream.
pub struct StreamingProxy {
    default_timeout: Duration,
}

impl StreamingProxy {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn pump(&self, mut upstream: ByteStream, ctx: RequestContext) -> ByteStream {
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(OUTBOUND_BUFFER);
        let deadline = if ctx.remaining().is_zero() {
            tokio::time::Instant::now() + self.default_timeout
        } else {
            ctx.deadline()
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        tracing::debug!(
                            request_id = %ctx.request_id(),
                            reason = CLIENT_DISCONNECT_REASON,
                            "cancelling upstream stream"
                        );
                        break;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        tracing::warn!(
                            request_id = %ctx.request_id(),
                            "streaming timeout reached, closing stream"
                        );
                        break;
                    }
                    chunk = upstream.recv() => {
                        let Some(chunk) = chunk else {
                            // Upstream EOF.
                            break;
                        };
                        if tx.send(chunk).await.is_err() {
                            // Outbound side went away without a cancel signal.
                            tracing::debug!(
                                request_id = %ctx.request_id(),
                                reason = CLIENT_DISCONNECT_REASON,
                                "outbound stream dropped"
                            );
                            break;
                        }
                    }
                }
            }
            // Dropping `upstream` here releases the transport reader.
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> StreamingProxy {
        StreamingProxy::new(Duration::from_secs(600))
    }

    #[tokio::test]
    async fn bytes_flow_through_until_eof() {
        let (tx, upstream) = tokio::sync::mpsc::channel::<Bytes>(4);
        let ctx = RequestContext::new(Duration::from_secs(5));
        let mut outbound = proxy().pump(upstream, ctx);

        tx.send(Bytes::from_static(b"data: {\"x\":1}\n\n")).await.unwrap();
        tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await.unwrap();
        drop(tx);

        assert_eq!(
            outbound.recv().await.unwrap(),
            Bytes::from_static(b"data: {\"x\":1}\n\n")
        );
        assert_eq!(
            outbound.recv().await.unwrap(),
            Bytes::from_static(b"data: [DONE]\n\n")
        );
        assert!(outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_stops_the_pump_and_releases_upstream() {
        let (tx, upstream) = tokio::sync::mpsc::channel::<Bytes>(4);
        let ctx = RequestContext::new(Duration::from_secs(5));
        let mut outbound = proxy().pump(upstream, ctx.clone());

        tx.send(Bytes::from_static(b"data: first\n\n")).await.unwrap();
        assert!(outbound.recv().await.is_some());

        ctx.cancel();
        // Outbound closes without further bytes.
        assert!(outbound.recv().await.is_none());

        // The upstream receiver was dropped: the sender observes closure.
        tx.closed().await;
        assert!(tx.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_closes_the_stream() {
        let (_tx, upstream) = tokio::sync::mpsc::channel::<Bytes>(4);
        let ctx = RequestContext::new(Duration::from_millis(100));
        let mut outbound = proxy().pump(upstream, ctx);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(outbound.recv().await.is_none());
    }
}
