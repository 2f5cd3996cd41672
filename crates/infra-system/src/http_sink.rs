// HTTP event sink
// Forwards each lifecycle event to the external socket service as one JSON POST

use async_trait::async_trait;
use cmdexec_core::domain::ExecutionEvent;
use cmdexec_core::port::{EventSink, SinkError};
use std::time::Duration;
use tracing::debug;

/// Path appended to the configured base URL
pub const EVENTS_PATH: &str = "/api/execution-events";

/// Per-request timeout; a slow sink only stalls its own delivery lane
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpEventSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEventSink {
    /// # Arguments
    /// * `base_url` - e.g. `http://localhost:3002`; a trailing slash is tolerated
    pub fn new(base_url: &str) -> Result<Self, SinkError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Unavailable(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), EVENTS_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn deliver(&self, event: &ExecutionEvent) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(event)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Rejected(format!("HTTP {}", status)));
        }

        debug!(
            execution_id = %event.execution_id(),
            endpoint = %self.endpoint,
            "Event forwarded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// One-shot HTTP server: captures the request text, answers with `status_line`
    async fn serve_once(status_line: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!("{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status_line);
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).to_string());
        });

        (format!("http://{}/", addr), rx)
    }

    fn event() -> ExecutionEvent {
        ExecutionEvent::truncated("exec-1", 3, 0)
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let sink = HttpEventSink::new("http://localhost:3002/").unwrap();
        assert_eq!(sink.endpoint(), "http://localhost:3002/api/execution-events");
    }

    #[tokio::test]
    async fn test_posts_event_json() {
        let (url, request) = serve_once("HTTP/1.1 200 OK").await;
        let sink = HttpEventSink::new(&url).unwrap();

        sink.deliver(&event()).await.unwrap();

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /api/execution-events HTTP/1.1"));
        assert!(request.contains(r#""executionId":"exec-1""#));
        assert!(request.contains(r#""type":"truncated""#));
        assert!(request.contains(r#""droppedChunks":3"#));
    }

    #[tokio::test]
    async fn test_non_success_status_is_rejected() {
        let (url, _request) = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let sink = HttpEventSink::new(&url).unwrap();

        let err = sink.deliver(&event()).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_unreachable_sink_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = HttpEventSink::with_timeout(&format!("http://{}", addr), Duration::from_secs(1))
            .unwrap();
        let err = sink.deliver(&event()).await.unwrap_err();
        assert!(matches!(err, SinkError::Unavailable(_)));
    }
}
