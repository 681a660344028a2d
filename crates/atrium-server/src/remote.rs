//! HTTP clients for the completion capability and the external task launcher.
//!
//! Both speak plain JSON. The completion endpoint answers with newline-delimited
//! JSON events:
//!
//! ```text
//! {"type":"text_delta","delta":"Hel"}
//! {"type":"tool_call","tool_call":{...}}
//! {"type":"done","message":{...}}
//! {"type":"error","status":503,"message":"overloaded"}
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use atrium_core::errors::CompletionError;
use atrium_core::launcher::{LaunchAck, LaunchError, TaskDescriptor, TaskLauncher};
use atrium_core::messages::{AssistantMessage, ToolCallBlock};
use atrium_core::provider::{CompletionProvider, CompletionRequest, CompletionStream};
use atrium_core::stream::StreamEvent;
use futures::Stream;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    TextDelta {
        delta: String,
    },
    ToolCall {
        tool_call: ToolCallBlock,
    },
    Done {
        message: AssistantMessage,
    },
    Error {
        #[serde(default)]
        status: Option<u16>,
        message: String,
    },
}

impl From<WireEvent> for StreamEvent {
    fn from(event: WireEvent) -> Self {
        match event {
            WireEvent::TextDelta { delta } => StreamEvent::TextDelta { delta },
            WireEvent::ToolCall { tool_call } => StreamEvent::ToolCall { tool_call },
            WireEvent::Done { message } => StreamEvent::Done { message },
            WireEvent::Error { status, message } => StreamEvent::Error {
                error: match status {
                    Some(status) => CompletionError::from_status(status, message),
                    None => CompletionError::StreamInterrupted(message),
                },
            },
        }
    }
}

pub struct HttpCompletionProvider {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpCompletionProvider {
    /// `timeout` bounds connecting and the wait for response headers; the
    /// body is bounded by an idle timeout instead.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CompletionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| CompletionError::NetworkError(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(url = %self.url, history = request.history.len()))]
    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, CompletionError> {
        let send = self.client.post(&self.url).json(request).send();
        let resp = match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) if e.is_timeout() => return Err(CompletionError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(CompletionError::NetworkError(e.to_string())),
            Err(_) => return Err(CompletionError::Timeout(self.timeout)),
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            warn!(status, "completion endpoint returned an error");
            return Err(CompletionError::from_status(status, body));
        }

        Ok(Box::pin(NdjsonStream::new(resp.bytes_stream(), STREAM_IDLE_TIMEOUT)))
    }
}

/// Turns a byte stream of newline-delimited JSON into stream events.
struct NdjsonStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    pending: Vec<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl NdjsonStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_duration: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: String::new(),
            pending: Vec::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_duration)),
            idle_duration,
            finished: false,
        }
    }

    fn parse_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<WireEvent>(line) {
            Ok(event) => self.pending.push(event.into()),
            Err(e) => {
                debug!(line, "malformed completion event");
                self.pending.push(StreamEvent::Error {
                    error: CompletionError::StreamInterrupted(format!("malformed event: {e}")),
                });
            }
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.parse_line(&line);
        }
    }
}

impl Stream for NdjsonStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if !self.pending.is_empty() {
                return Poll::Ready(Some(self.pending.remove(0)));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    self.buffer.push_str(&text);
                    self.drain_lines();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(StreamEvent::Error {
                        error: CompletionError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    let rest = std::mem::take(&mut self.buffer);
                    self.parse_line(&rest);
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(StreamEvent::Error {
                            error: CompletionError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Posts task descriptors to the launcher endpoint.
pub struct HttpTaskLauncher {
    client: reqwest::Client,
    url: String,
}

impl HttpTaskLauncher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, LaunchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LaunchError::Unreachable(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl TaskLauncher for HttpTaskLauncher {
    #[instrument(skip(self, descriptor), fields(correlation_id = %descriptor.correlation_id, task_type = %descriptor.task_type))]
    async fn launch(&self, descriptor: &TaskDescriptor) -> Result<LaunchAck, LaunchError> {
        let resp = self
            .client
            .post(&self.url)
            .json(descriptor)
            .send()
            .await
            .map_err(|e| LaunchError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            // An empty or non-JSON 2xx still means the task was taken.
            let body = resp.text().await.unwrap_or_default();
            return Ok(serde_json::from_str(&body).unwrap_or(LaunchAck {
                accepted: true,
                message: None,
            }));
        }

        let body = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(LaunchError::Rejected(format!("{}: {body}", status.as_u16())))
        } else {
            Err(LaunchError::Unreachable(format!("{}: {body}", status.as_u16())))
        }
    }
}

/// Stands in when no launcher endpoint is configured. Every launch fails as unreachable.
pub struct UnconfiguredLauncher;

#[async_trait]
impl TaskLauncher for UnconfiguredLauncher {
    async fn launch(&self, descriptor: &TaskDescriptor) -> Result<LaunchAck, LaunchError> {
        warn!(task_type = %descriptor.task_type, "no launcher configured");
        Err(LaunchError::Unreachable("no launcher endpoint configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_core::{CorrelationId, TenantId, ThreadId, UserId};
    use futures::StreamExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ndjson(lines: &[serde_json::Value]) -> String {
        lines.iter().map(|l| format!("{l}\n")).collect()
    }

    #[tokio::test]
    async fn streams_text_events() {
        let server = MockServer::start().await;
        let body = ndjson(&[
            serde_json::json!({"type": "text_delta", "delta": "Hel"}),
            serde_json::json!({"type": "text_delta", "delta": "lo"}),
            serde_json::json!({"type": "done", "message": AssistantMessage::text("Hello")}),
        ]);
        Mock::given(method("POST"))
            .and(path("/complete"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let provider =
            HttpCompletionProvider::new(format!("{}/complete", server.uri()), Duration::from_secs(5)).unwrap();
        let events: Vec<StreamEvent> = provider
            .stream(&CompletionRequest::empty())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::TextDelta { delta } if delta == "Hel"));
        assert!(matches!(&events[2], StreamEvent::Done { message } if message.text_content() == "Hello"));
    }

    #[tokio::test]
    async fn complete_drains_the_stream() {
        let server = MockServer::start().await;
        let body = ndjson(&[serde_json::json!({"type": "done", "message": AssistantMessage::text("ok")})]);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let provider = HttpCompletionProvider::new(server.uri(), Duration::from_secs(5)).unwrap();
        let completion = provider.complete(&CompletionRequest::empty()).await.unwrap();
        assert_eq!(completion.usage(), Default::default());
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let provider = HttpCompletionProvider::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = provider.stream(&CompletionRequest::empty()).await.err().unwrap();
        assert!(matches!(err, CompletionError::RateLimited { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_line_becomes_error_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json}\n"))
            .mount(&server)
            .await;

        let provider = HttpCompletionProvider::new(server.uri(), Duration::from_secs(5)).unwrap();
        let events: Vec<StreamEvent> = provider
            .stream(&CompletionRequest::empty())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(
            &events[0],
            StreamEvent::Error {
                error: CompletionError::StreamInterrupted(_)
            }
        ));
    }

    #[tokio::test]
    async fn error_event_keeps_status_classification() {
        let server = MockServer::start().await;
        let body = ndjson(&[serde_json::json!({"type": "error", "status": 503, "message": "overloaded"})]);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let provider = HttpCompletionProvider::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = provider.complete(&CompletionRequest::empty()).await.unwrap_err();
        assert!(matches!(err, CompletionError::ServerError { status: 503, .. }));
    }

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor {
            correlation_id: CorrelationId::new(),
            task_type: "export".into(),
            user_id: UserId::from_raw("alice"),
            tenant_id: TenantId::from_raw("acme"),
            thread_id: ThreadId::from_raw("ops"),
            payload: serde_json::json!({"format": "csv"}),
        }
    }

    #[tokio::test]
    async fn launcher_accepts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({"accepted": true})))
            .expect(1)
            .mount(&server)
            .await;

        let launcher = HttpTaskLauncher::new(format!("{}/tasks", server.uri()), Duration::from_secs(5)).unwrap();
        let ack = launcher.launch(&descriptor()).await.unwrap();
        assert!(ack.accepted);
    }

    #[tokio::test]
    async fn launcher_client_error_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("unknown task type"))
            .mount(&server)
            .await;

        let launcher = HttpTaskLauncher::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = launcher.launch(&descriptor()).await.unwrap_err();
        assert!(matches!(err, LaunchError::Rejected(msg) if msg.contains("unknown task type")));
    }

    #[tokio::test]
    async fn launcher_server_error_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let launcher = HttpTaskLauncher::new(server.uri(), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            launcher.launch(&descriptor()).await,
            Err(LaunchError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_launcher() {
        let launcher = HttpTaskLauncher::new("http://127.0.0.1:1/tasks", Duration::from_secs(2)).unwrap();
        assert!(matches!(
            launcher.launch(&descriptor()).await,
            Err(LaunchError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn unconfigured_launcher_is_unreachable() {
        assert!(matches!(
            UnconfiguredLauncher.launch(&descriptor()).await,
            Err(LaunchError::Unreachable(_))
        ));
    }
}
