use std::future::Future;

use chatwire_ai::{GenerationOptions, InferenceClient, InferenceError, Message};
use tracing::{info, warn};

pub const INFERENCE_FAILURE_NOTICE: &str =
    "inference failed, check the endpoint, API key and model in your configuration";

/// One conversation against the inference endpoint.
///
/// The system prompt is prepended to every request; the history only grows
/// when a turn succeeds, so a failed request can simply be retried.
pub struct ChatSession {
    client: InferenceClient,
    model: String,
    system_prompt: Option<String>,
    options: GenerationOptions,
    history: Vec<Message>,
}

impl ChatSession {
    pub fn new(
        client: InferenceClient,
        model: impl Into<String>,
        system_prompt: Option<String>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            system_prompt,
            options,
            history: Vec::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Messages for the next request: system prompt, prior turns, then the
    /// new user input.
    pub fn request_messages(&self, user_input: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if let Some(prompt) = self.system_prompt.as_deref() {
            messages.push(Message::system(prompt));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(Message::user(user_input));
        messages
    }

    pub async fn send(&mut self, user_input: &str) -> Result<String, InferenceError> {
        let messages = self.request_messages(user_input);
        let reply = self
            .client
            .send_completion(&self.model, &messages, &self.options)
            .await;
        self.record_turn(user_input, reply)
    }

    /// Streams the reply, handing each delta to `on_delta` as it arrives.
    pub async fn send_streaming<F, Fut>(
        &mut self,
        user_input: &str,
        mut on_delta: F,
    ) -> Result<String, InferenceError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let messages = self.request_messages(user_input);
        let mut reply = String::new();
        let outcome = self
            .client
            .send_streaming_completion(&self.model, &messages, &self.options, |content| {
                reply.push_str(&content);
                on_delta(content)
            })
            .await;
        self.record_turn(user_input, outcome.map(|_| reply))
    }

    fn record_turn(
        &mut self,
        user_input: &str,
        reply: Result<String, InferenceError>,
    ) -> Result<String, InferenceError> {
        match reply {
            Ok(reply) => {
                self.history.push(Message::user(user_input));
                self.history.push(Message::assistant(reply.clone()));
                info!(
                    model = %self.model,
                    turns = self.history.len() / 2,
                    reply_chars = reply.chars().count(),
                    "chat turn completed"
                );
                Ok(reply)
            }
            Err(error) => {
                warn!(model = %self.model, error = %error.as_compact_json(), "chat turn failed");
                Err(error)
            }
        }
    }
}

/// The single line shown in the conversation when a turn fails.
pub fn failure_line(error: &InferenceError) -> String {
    format!("[chatwire] {INFERENCE_FAILURE_NOTICE} ({error})")
}
