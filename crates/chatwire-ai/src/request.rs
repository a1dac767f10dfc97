use std::collections::BTreeMap;

use serde::Serialize;

use crate::model_registry::lookup_model;
use crate::types::{GenerationOptions, Message, ModelDescriptor};
use crate::validation::validate_for_descriptor;

/// Chat-completions request body, ready to be serialized onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestBody {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<BTreeMap<String, f64>>,
    pub stream: bool,
}

pub fn build_request_body(
    model_id: &str,
    messages: &[Message],
    options: &GenerationOptions,
    streaming: bool,
) -> RequestBody {
    build_request_for_descriptor(&lookup_model(model_id), messages, options, streaming)
}

pub fn build_request_for_descriptor(
    descriptor: &ModelDescriptor,
    messages: &[Message],
    options: &GenerationOptions,
    streaming: bool,
) -> RequestBody {
    let validated = validate_for_descriptor(descriptor, options);
    let capabilities = &descriptor.capabilities;

    let stop = options
        .stop
        .as_ref()
        .filter(|stop| capabilities.stop_sequences && !stop.is_empty())
        .cloned();
    let logit_bias = options
        .logit_bias
        .as_ref()
        .filter(|bias| capabilities.logit_bias && !bias.is_empty())
        .cloned();

    RequestBody {
        model: descriptor.id.clone(),
        messages: messages.to_vec(),
        max_tokens: validated.max_tokens,
        temperature: validated.temperature,
        top_p: validated.top_p,
        frequency_penalty: validated.frequency_penalty,
        presence_penalty: validated.presence_penalty,
        stop,
        logit_bias,
        stream: streaming,
    }
}
