use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Method, Proxy};

use poolgate_common::{redact_headers, RequestContext};
use poolgate_provider_core::error::ProviderError;
use poolgate_provider_core::ByteStream;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug)]
pub enum HttpBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: HttpBody,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Upstream HTTP transport. One instance is shared by every adapter; all
/// calls honor the request context's deadline and cancellation signal.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    stream_idle_timeout: Duration,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, ProviderError> {
        let mut builder = Client::builder().connect_timeout(config.connect_timeout);
        if let Some(proxy) = config.proxy.as_deref().filter(|value| !value.is_empty()) {
            builder = builder.proxy(
                Proxy::all(proxy)
                    .map_err(|err| ProviderError::invalid_config(err.to_string()))?,
            );
        }
        let client = builder
            .build()
            .map_err(|err| ProviderError::invalid_config(err.to_string()))?;
        Ok(Self {
            client,
            stream_idle_timeout: config.stream_idle_timeout,
        })
    }

    /// Send a request bounded by `op_timeout` and the context deadline,
    /// whichever fires first. Cancellation aborts the in-flight call.
    pub async fn send(
        &self,
        request: HttpRequest,
        ctx: &RequestContext,
        op_timeout: Duration,
    ) -> Result<HttpResponse, ProviderError> {
        if ctx.is_cancelled() {
            return Err(ProviderError::cancelled());
        }
        let budget = op_timeout.min(ctx.remaining());
        if budget.is_zero() {
            return Err(ProviderError::timeout("request deadline already passed"));
        }

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            headers = ?redact_headers(&request.headers),
            "sending upstream request"
        );

        let send = self.dispatch(request);
        tokio::select! {
            _ = ctx.cancelled() => Err(ProviderError::cancelled()),
            result = tokio::time::timeout(budget, send) => match result {
                Err(_) => Err(ProviderError::timeout(format!(
                    "upstream call exceeded {}ms",
                    budget.as_millis()
                ))),
                Ok(inner) => inner,
            },
        }
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status().as_u16();
        let headers = headers_to_vec(response.headers());

        let is_success = (200..300).contains(&status);
        if !is_success || !request.is_stream {
            let body = response.bytes().await.map_err(map_transport_error)?;
            return Ok(HttpResponse {
                status,
                headers,
                body: HttpBody::Bytes(body),
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        let idle = self.stream_idle_timeout;
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle, stream.next()).await;
                let Ok(item) = next else {
                    break;
                };
                let Some(item) = item else {
                    break;
                };
                let Ok(chunk) = item else {
                    break;
                };
                if tx.send(chunk).await.is_err() {
                    // Receiver dropped: the request was cancelled downstream.
                    break;
                }
            }
        });

        Ok(HttpResponse {
            status,
            headers,
            body: HttpBody::Stream(rx),
        })
    }
}

fn headers_to_vec(map: &wreq::header::HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(text) = value.to_str() {
            out.push((name.as_str().to_string(), text.to_string()));
        }
    }
    out
}

fn map_transport_error(err: wreq::Error) -> ProviderError {
    let message = err.to_string();
    if err.is_timeout() {
        return ProviderError::timeout(message);
    }
    if err.is_connect() || err.is_connection_reset() {
        return ProviderError::connection(message);
    }
    let lower = message.to_ascii_lowercase();
    if lower.contains("dns") || lower.contains("resolve") || lower.contains("tls") {
        return ProviderError::connection(message);
    }
    ProviderError::from_message(message)
}

/// Parse a `Retry-After` header in seconds form.
pub(crate) fn parse_retry_after(response: &HttpResponse) -> Option<Duration> {
    let value = response.header("retry-after")?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}
