use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::InferenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Inclusive numeric range with the value used when the caller gives none.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericLimit {
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

impl NumericLimit {
    pub const fn new(min: f64, max: f64, default: f64) -> Self {
        Self { min, max, default }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimit {
    pub output: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterLimits {
    #[serde(rename = "maxTokens")]
    pub max_tokens: TokenLimit,
    pub temperature: NumericLimit,
    #[serde(rename = "topP")]
    pub top_p: NumericLimit,
    #[serde(rename = "frequencyPenalty")]
    pub frequency_penalty: NumericLimit,
    #[serde(rename = "presencePenalty")]
    pub presence_penalty: NumericLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub vision: bool,
    #[serde(rename = "codeGeneration", default)]
    pub code_generation: bool,
    #[serde(rename = "jsonMode", default)]
    pub json_mode: bool,
    #[serde(rename = "functionCalling", default)]
    pub function_calling: bool,
    #[serde(default)]
    pub streaming: bool,
    #[serde(rename = "stopSequences", default)]
    pub stop_sequences: bool,
    #[serde(rename = "logitBias", default)]
    pub logit_bias: bool,
    #[serde(rename = "frequencyPenalty", default)]
    pub frequency_penalty: bool,
    #[serde(rename = "presencePenalty", default)]
    pub presence_penalty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecommendedParams {
    #[serde(rename = "maxTokens")]
    pub max_tokens: u32,
    pub temperature: f64,
    #[serde(rename = "topP")]
    pub top_p: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub provider: String,
    #[serde(rename = "contextLength")]
    pub context_length: u32,
    pub limits: ParameterLimits,
    pub capabilities: ModelCapabilities,
    #[serde(rename = "recommendedParams")]
    pub recommended_params: RecommendedParams,
}

/// Caller-supplied generation options. Absent fields fall back to the
/// model's defaults during validation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(rename = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(rename = "frequencyPenalty", skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(rename = "presencePenalty", skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(rename = "logitBias", skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedParameters {
    #[serde(rename = "maxTokens")]
    pub max_tokens: u32,
    pub temperature: f64,
    #[serde(rename = "topP")]
    pub top_p: f64,
    #[serde(rename = "frequencyPenalty", skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(rename = "presencePenalty", skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
}

/// One decoded server-sent event of a streaming completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta { content: String },
    Done,
}

/// Events published on a [`crate::CompletionEventStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    Delta { content: String },
    Done { text: String },
    Error { error: InferenceError },
}
