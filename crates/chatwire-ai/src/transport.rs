use std::future::Future;
use std::sync::{Arc, OnceLock};

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use crate::error::InferenceError;
use crate::event_stream::CompletionEventStream;
use crate::request::{build_request_body, RequestBody};
use crate::sse::{reassemble, ReassemblerConfig, StreamReader, StreamSummary};
use crate::types::{CompletionEvent, GenerationOptions, Message};

const UNPARSEABLE_ERROR_DETAILS: &str = "unable to parse error details";

/// Where completions are sent. `endpoint` is the full chat-completions URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub default_model: String,
}

impl InferenceConfig {
    pub fn new(endpoint: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            default_model: default_model.into(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[derive(Clone)]
pub struct InferenceClient {
    config: Arc<InferenceConfig>,
    http: Client,
    reassembler: ReassemblerConfig,
}

impl InferenceClient {
    pub fn new(config: InferenceConfig) -> Self {
        let http = shared_http_client(&config.endpoint).clone();
        Self {
            config: Arc::new(config),
            http,
            reassembler: ReassemblerConfig::default(),
        }
    }

    pub fn with_reassembler_config(mut self, reassembler: ReassemblerConfig) -> Self {
        self.reassembler = reassembler;
        self
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Non-streaming completion. Returns the first choice's message content,
    /// or an empty string when the response carries none.
    pub async fn send_completion(
        &self,
        model_id: &str,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<String, InferenceError> {
        let body = self.request_body(model_id, messages, options, false);
        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|error| InferenceError::transport(format!("completion request failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(http_error(status, &text));
        }

        let text = response.text().await.map_err(|error| {
            InferenceError::transport(format!("completion body read failed: {error}"))
        })?;
        let payload: Value = serde_json::from_str(&text).map_err(|error| {
            InferenceError::protocol(format!("completion body is not JSON: {error}"))
        })?;
        Ok(completion_text(&payload))
    }

    /// Streaming completion. `on_delta` is awaited for every text delta, in
    /// arrival order, before the next chunk is read. The response body is
    /// released on every exit path, including the returned future being
    /// dropped.
    pub async fn send_streaming_completion<F, Fut>(
        &self,
        model_id: &str,
        messages: &[Message],
        options: &GenerationOptions,
        on_delta: F,
    ) -> Result<StreamSummary, InferenceError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let body = self.request_body(model_id, messages, options, true);
        let response = self
            .post(&body)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|error| InferenceError::transport(format!("stream request failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let mut reader = StreamReader::new(Box::pin(response.bytes_stream()));
            let error = match reader.next_chunk().await {
                Some(Ok(chunk)) => streaming_http_error(status, &chunk),
                _ => InferenceError::http(status.as_u16(), format!("HTTP {status}")),
            };
            return Err(error);
        }

        reassemble(Box::pin(response.bytes_stream()), self.reassembler, on_delta).await
    }

    /// Runs a streaming completion in the background and publishes its deltas
    /// and terminal outcome on the returned stream.
    pub fn stream_completion(
        &self,
        model_id: &str,
        messages: Vec<Message>,
        options: GenerationOptions,
    ) -> CompletionEventStream {
        let stream = CompletionEventStream::new();
        let writer = stream.clone();
        let client = self.clone();
        let model_id = model_id.to_string();

        let task_writer = writer.clone();
        spawn_completion_task(writer, async move {
            let writer = task_writer;
            let mut text = String::new();
            let result = client
                .send_streaming_completion(&model_id, &messages, &options, |content| {
                    text.push_str(&content);
                    writer.push(CompletionEvent::Delta { content });
                    async {}
                })
                .await;
            match result {
                Ok(_) => writer.push(CompletionEvent::Done { text }),
                Err(error) => writer.push(CompletionEvent::Error { error }),
            }
        });
        stream
    }

    fn request_body(
        &self,
        model_id: &str,
        messages: &[Message],
        options: &GenerationOptions,
        streaming: bool,
    ) -> RequestBody {
        let model_id = if model_id.trim().is_empty() {
            self.config.default_model.as_str()
        } else {
            model_id
        };
        let body = build_request_body(model_id, messages, options, streaming);
        debug!(
            endpoint = %self.config.endpoint,
            model = %body.model,
            messages = body.messages.len(),
            max_tokens = body.max_tokens,
            temperature = body.temperature,
            top_p = body.top_p,
            stream = streaming,
            "sending completion request"
        );
        body
    }

    fn post(&self, body: &RequestBody) -> RequestBuilder {
        let mut request = self
            .http
            .post(self.config.endpoint.as_str())
            .header("Content-Type", "application/json");
        if let Some(api_key) = self.config.api_key.as_deref().filter(|key| !key.is_empty()) {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }
        request.json(body)
    }
}

fn completion_text(payload: &Value) -> String {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn http_error(status: StatusCode, body: &str) -> InferenceError {
    let message = describe_error_body(status.as_u16(), body);
    let error = InferenceError::http(status.as_u16(), message);
    match serde_json::from_str::<Value>(body.trim()) {
        Ok(details) => error.with_details(details),
        Err(_) => error,
    }
}

fn streaming_http_error(status: StatusCode, first_chunk: &[u8]) -> InferenceError {
    match serde_json::from_slice::<Value>(first_chunk) {
        Ok(details) => {
            InferenceError::http(status.as_u16(), describe_error_value(&details)).with_details(details)
        }
        Err(_) => InferenceError::http(status.as_u16(), format!("HTTP {status}")),
    }
}

/// Best human-readable message for a non-success response body.
///
/// JSON bodies are read as a bare string, `{"error": "..."}`,
/// `{"error": {"message": ...}}` or `{"error": {"code": ..., "message": ...}}`;
/// any other JSON is rendered compactly. Non-JSON bodies are returned as-is.
pub fn describe_error_body(status: u16, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return format!("HTTP {status}");
    }
    match serde_json::from_str::<Value>(body) {
        Ok(value) => describe_error_value(&value),
        Err(_) => body.to_string(),
    }
}

fn describe_error_value(value: &Value) -> String {
    match value {
        Value::String(message) => message.clone(),
        Value::Object(object) => match object.get("error") {
            Some(Value::String(message)) => message.clone(),
            Some(Value::Object(error)) => {
                match (error.get("message").and_then(Value::as_str), error.get("code")) {
                    (Some(message), Some(code)) if !code.is_null() => {
                        format!("{message} (code: {})", code_text(code))
                    }
                    (Some(message), _) => message.to_string(),
                    (None, _) => compact_json(value),
                }
            }
            _ => compact_json(value),
        },
        other => compact_json(other),
    }
}

fn code_text(code: &Value) -> String {
    code.as_str()
        .map(str::to_string)
        .unwrap_or_else(|| code.to_string())
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| UNPARSEABLE_ERROR_DETAILS.to_string())
}

fn shared_http_client(endpoint: &str) -> &'static Client {
    static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();
    static LOOPBACK_CLIENT: OnceLock<Client> = OnceLock::new();

    if is_loopback_endpoint(endpoint) {
        LOOPBACK_CLIENT.get_or_init(|| {
            Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new())
        })
    } else {
        DEFAULT_CLIENT.get_or_init(Client::new)
    }
}

fn is_loopback_endpoint(endpoint: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(endpoint) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "[::1]" || host == "::1"
}

/// Runs `task` on the ambient runtime, or on a dedicated thread with its own
/// runtime when called from outside one. Failing to start either publishes an
/// error on `writer` so readers of the stream are not left waiting.
fn spawn_completion_task<F>(writer: CompletionEventStream, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(task);
        return;
    }

    let thread_writer = writer.clone();
    let spawned = std::thread::Builder::new()
        .name("chatwire-completion".to_string())
        .spawn(move || {
            run_on_fresh_runtime(&thread_writer, task, || {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
            })
        });
    if let Err(error) = spawned {
        warn!(%error, "failed to spawn completion thread");
        writer.push(CompletionEvent::Error {
            error: InferenceError::transport(format!("failed to start completion thread: {error}")),
        });
    }
}

fn run_on_fresh_runtime<F, B>(writer: &CompletionEventStream, task: F, build: B)
where
    F: Future<Output = ()>,
    B: FnOnce() -> std::io::Result<Runtime>,
{
    match build() {
        Ok(runtime) => runtime.block_on(task),
        Err(error) => {
            warn!(%error, "failed to build completion runtime");
            writer.push(CompletionEvent::Error {
                error: InferenceError::transport(format!(
                    "failed to start completion runtime: {error}"
                )),
            });
        }
    }
}
