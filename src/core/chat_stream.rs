//! Streaming transport: one spawned worker per generation, publishing
//! typed events tagged with the request id on a single channel.
//!
//! The worker owns the HTTP/SSE call; the session core only hands it a
//! cancellation token and drops whatever events arrive under a stale
//! id. Failures are reported as structured [`ErrorReport`]s for the
//! classifier, never thrown across the channel.

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ChatResponse, StreamRequest};
use crate::core::classify::ErrorReport;
use crate::utils::url::construct_api_url;

/// One typed event channel instead of three separately-ordered
/// callbacks: delta, completion, and failure dispatch on one receiver.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Delta(String),
    Completed { full_text: String },
    Errored(ErrorReport),
}

/// Correlation scope for one generation, established at open time.
pub struct StreamScope {
    pub group_key: String,
    pub cancel_token: CancellationToken,
    pub stream_id: u64,
}

/// Handle returned by [`StreamTransport::start_streaming`].
pub struct StreamHandle {
    pub op_token: u64,
    pub group_key: String,
    pub cancel: CancellationToken,
}

impl StreamHandle {
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

/// The transport boundary as the session core sees it: start one
/// stream under a correlation scope, or abort everything. The HTTP/SSE
/// implementation lives behind this seam so the panel can be exercised
/// without network access.
pub trait StreamTransport {
    fn start_streaming(&self, request: StreamRequest, scope: StreamScope) -> StreamHandle;
    fn abort_streaming(&self, reason: &str);
}

#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamEvent, u64)>,
    client: reqwest::Client,
    live_tokens: Arc<Mutex<Vec<CancellationToken>>>,
}

impl ChatStreamService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(StreamEvent, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                client: reqwest::Client::new(),
                live_tokens: Arc::new(Mutex::new(Vec::new())),
            },
            rx,
        )
    }
}

impl StreamTransport for ChatStreamService {
    /// Spawn the stream worker for one generation. Events arrive on the
    /// receiver as `(event, stream_id)`; the worker stops on
    /// completion, failure, or cancellation of the scope's token.
    fn start_streaming(&self, request: StreamRequest, scope: StreamScope) -> StreamHandle {
        let StreamScope {
            group_key,
            cancel_token,
            stream_id,
        } = scope;

        if let Ok(mut live) = self.live_tokens.lock() {
            live.retain(|token| !token.is_cancelled());
            live.push(cancel_token.clone());
        }

        let tx = self.tx.clone();
        let client = self.client.clone();
        let worker_token = cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = run_stream(client, request, tx.clone(), stream_id) => {}
                _ = worker_token.cancelled() => {
                    let report = ErrorReport::aborted("abort_error");
                    let _ = tx.send((StreamEvent::Errored(report), stream_id));
                }
            }
        });

        StreamHandle {
            op_token: stream_id,
            group_key,
            cancel: cancel_token,
        }
    }

    /// Panel-wide cancel affordance, independent of the session's own
    /// cancel: aborts every stream this service has handed out that is
    /// still live.
    fn abort_streaming(&self, reason: &str) {
        tracing::debug!(reason, "aborting all live streams");
        if let Ok(mut live) = self.live_tokens.lock() {
            for token in live.drain(..) {
                token.cancel();
            }
        }
    }
}

async fn run_stream(
    client: reqwest::Client,
    request: StreamRequest,
    tx: mpsc::UnboundedSender<(StreamEvent, u64)>,
    stream_id: u64,
) {
    let url = construct_api_url(&request.base_url, "chat/completions");
    let mut http_request = client.post(url).header("Content-Type", "application/json");
    if let Some(api_key) = &request.api_key {
        http_request = if request.provider.uses_anthropic_auth() {
            http_request
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01")
        } else {
            http_request.header("Authorization", format!("Bearer {api_key}"))
        };
    }

    let response = match http_request.json(&request.to_chat_request()).send().await {
        Ok(response) => response,
        Err(e) => {
            let code = if e.is_timeout() { "timeout" } else { "network" };
            let report = ErrorReport::from_code(code).with_message(e.to_string());
            let _ = tx.send((StreamEvent::Errored(report), stream_id));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let report = report_from_http_error(status.as_u16(), &body);
        let _ = tx.send((StreamEvent::Errored(report), stream_id));
        return;
    }

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut full_text = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk_bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let report = ErrorReport::from_code("network").with_message(e.to_string());
                let _ = tx.send((StreamEvent::Errored(report), stream_id));
                return;
            }
        };
        buffer.extend_from_slice(&chunk_bytes);

        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let outcome = match std::str::from_utf8(&buffer[..newline_pos]) {
                Ok(line) => process_sse_line(line.trim(), &mut full_text, &tx, stream_id),
                Err(e) => {
                    tracing::debug!(%e, "skipping non-utf8 stream line");
                    LineOutcome::Continue
                }
            };
            buffer.drain(..=newline_pos);
            match outcome {
                LineOutcome::Continue => {}
                LineOutcome::Finished => {
                    let _ = tx.send((StreamEvent::Completed { full_text }, stream_id));
                    return;
                }
                LineOutcome::Failed => return,
            }
        }
    }

    // Stream closed without an explicit [DONE]; treat as complete.
    let _ = tx.send((StreamEvent::Completed { full_text }, stream_id));
}

enum LineOutcome {
    Continue,
    Finished,
    Failed,
}

fn process_sse_line(
    line: &str,
    full_text: &mut String,
    tx: &mpsc::UnboundedSender<(StreamEvent, u64)>,
    stream_id: u64,
) -> LineOutcome {
    let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
        return LineOutcome::Continue;
    };

    if payload == "[DONE]" {
        return LineOutcome::Finished;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            if let Some(content) = response
                .choices
                .first()
                .and_then(|choice| choice.delta.content.as_ref())
            {
                full_text.push_str(content);
                let _ = tx.send((StreamEvent::Delta(content.clone()), stream_id));
            }
            LineOutcome::Continue
        }
        Err(_) => {
            if payload.trim().is_empty() {
                return LineOutcome::Continue;
            }
            let report = report_from_error_payload(payload);
            let _ = tx.send((StreamEvent::Errored(report), stream_id));
            LineOutcome::Failed
        }
    }
}

/// Build a report from a non-2xx response body, pulling out the error
/// code and message when the provider sent structured JSON.
fn report_from_http_error(status: u16, body: &str) -> ErrorReport {
    let mut report = report_from_error_payload(body);
    report.status = Some(status);
    report
}

fn report_from_error_payload(payload: &str) -> ErrorReport {
    let mut report = ErrorReport::default();
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return report;
    }

    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        report.user_message = Some(collapse_whitespace(trimmed));
        return report;
    };

    report.code = value
        .pointer("/error/code")
        .or_else(|| value.pointer("/error/type"))
        .and_then(|v| v.as_str())
        .map(str::to_owned);

    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    report.user_message = summary.map(|text| collapse_whitespace(&text));
    report
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
