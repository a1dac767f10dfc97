use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::types::{
    ModelCapabilities, ModelDescriptor, NumericLimit, ParameterLimits, RecommendedParams,
    TokenLimit,
};

pub const FALLBACK_PROVIDER: &str = "unknown";
pub const FALLBACK_CONTEXT_LENGTH: u32 = 16_384;
pub const FALLBACK_MAX_OUTPUT_TOKENS: u32 = 4_096;

/// Catalog of model descriptors.
///
/// Lookups never fail: an id that matches neither exactly nor
/// case-insensitively resolves to [`fallback_descriptor`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRegistry {
    descriptors: Vec<ModelDescriptor>,
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        Self {
            descriptors: builtin_catalog(),
        }
    }

    pub fn empty() -> Self {
        Self {
            descriptors: Vec::new(),
        }
    }

    /// Adds descriptors to the catalog. A descriptor whose id is already
    /// present (exact match) replaces the existing entry in place.
    pub fn with_descriptors(mut self, extra: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        for descriptor in extra {
            match self
                .descriptors
                .iter_mut()
                .find(|existing| existing.id == descriptor.id)
            {
                Some(existing) => *existing = descriptor,
                None => self.descriptors.push(descriptor),
            }
        }
        self
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.descriptors
    }

    pub fn find(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.id == model_id)
            .or_else(|| {
                self.descriptors
                    .iter()
                    .find(|descriptor| descriptor.id.eq_ignore_ascii_case(model_id))
            })
    }

    pub fn lookup(&self, model_id: &str) -> ModelDescriptor {
        if let Some(descriptor) = self.find(model_id) {
            return descriptor.clone();
        }
        warn!(model_id, "unknown model id, using conservative fallback descriptor");
        fallback_descriptor(model_id)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Conservative descriptor used for ids missing from the catalog. The
/// requested id is kept so requests still name the caller's model.
pub fn fallback_descriptor(model_id: &str) -> ModelDescriptor {
    ModelDescriptor {
        id: model_id.to_string(),
        provider: FALLBACK_PROVIDER.to_string(),
        context_length: FALLBACK_CONTEXT_LENGTH,
        limits: ParameterLimits {
            max_tokens: TokenLimit {
                output: FALLBACK_MAX_OUTPUT_TOKENS,
            },
            temperature: NumericLimit::new(0.0, 1.0, 0.7),
            top_p: NumericLimit::new(0.1, 1.0, 0.9),
            frequency_penalty: NumericLimit::new(0.0, 0.0, 0.0),
            presence_penalty: NumericLimit::new(0.0, 0.0, 0.0),
        },
        capabilities: ModelCapabilities::default(),
        recommended_params: RecommendedParams {
            max_tokens: 2_048,
            temperature: 0.7,
            top_p: 0.9,
        },
    }
}

fn process_registry() -> &'static OnceLock<ModelRegistry> {
    static REGISTRY: OnceLock<ModelRegistry> = OnceLock::new();
    &REGISTRY
}

/// Installs the process-wide registry. Only the first install (or the first
/// lookup, which installs the built-in catalog) takes effect; a rejected
/// registry is handed back to the caller.
pub fn install_model_registry(registry: ModelRegistry) -> Result<(), ModelRegistry> {
    let count = registry.models().len();
    process_registry().set(registry)?;
    debug!(models = count, "installed model registry");
    Ok(())
}

pub fn model_registry() -> &'static ModelRegistry {
    process_registry().get_or_init(ModelRegistry::builtin)
}

pub fn lookup_model(model_id: &str) -> ModelDescriptor {
    model_registry().lookup(model_id)
}

const OPENAI_TEMPERATURE: NumericLimit = NumericLimit::new(0.0, 2.0, 1.0);
const OPENAI_TOP_P: NumericLimit = NumericLimit::new(0.01, 1.0, 1.0);
const OPENAI_PENALTY: NumericLimit = NumericLimit::new(-2.0, 2.0, 0.0);
const NO_PENALTY: NumericLimit = NumericLimit::new(0.0, 0.0, 0.0);

fn openai_capabilities(vision: bool) -> ModelCapabilities {
    ModelCapabilities {
        vision,
        code_generation: true,
        json_mode: true,
        function_calling: true,
        streaming: true,
        stop_sequences: true,
        logit_bias: true,
        frequency_penalty: true,
        presence_penalty: true,
    }
}

fn openai_model(id: &str, context_length: u32, max_output: u32, vision: bool) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        provider: "openai".to_string(),
        context_length,
        limits: ParameterLimits {
            max_tokens: TokenLimit { output: max_output },
            temperature: OPENAI_TEMPERATURE,
            top_p: OPENAI_TOP_P,
            frequency_penalty: OPENAI_PENALTY,
            presence_penalty: OPENAI_PENALTY,
        },
        capabilities: openai_capabilities(vision),
        recommended_params: RecommendedParams {
            max_tokens: 4_096.min(max_output),
            temperature: 0.7,
            top_p: 1.0,
        },
    }
}

fn anthropic_model(id: &str, vision: bool) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        provider: "anthropic".to_string(),
        context_length: 200_000,
        limits: ParameterLimits {
            max_tokens: TokenLimit { output: 8_192 },
            temperature: NumericLimit::new(0.0, 1.0, 1.0),
            top_p: NumericLimit::new(0.01, 1.0, 1.0),
            frequency_penalty: NO_PENALTY,
            presence_penalty: NO_PENALTY,
        },
        capabilities: ModelCapabilities {
            vision,
            code_generation: true,
            json_mode: false,
            function_calling: true,
            streaming: true,
            stop_sequences: true,
            logit_bias: false,
            frequency_penalty: false,
            presence_penalty: false,
        },
        recommended_params: RecommendedParams {
            max_tokens: 4_096,
            temperature: 0.7,
            top_p: 1.0,
        },
    }
}

fn builtin_catalog() -> Vec<ModelDescriptor> {
    vec![
        openai_model("gpt-4o", 128_000, 16_384, true),
        openai_model("gpt-4o-mini", 128_000, 16_384, true),
        openai_model("gpt-4-turbo", 128_000, 4_096, true),
        openai_model("gpt-3.5-turbo", 16_385, 4_096, false),
        anthropic_model("claude-3-5-sonnet-20241022", true),
        anthropic_model("claude-3-5-haiku-20241022", false),
        ModelDescriptor {
            id: "llama-3.1-70b-instruct".to_string(),
            provider: "meta".to_string(),
            context_length: 131_072,
            limits: ParameterLimits {
                max_tokens: TokenLimit { output: 4_096 },
                temperature: NumericLimit::new(0.0, 2.0, 0.7),
                top_p: NumericLimit::new(0.01, 1.0, 0.9),
                frequency_penalty: OPENAI_PENALTY,
                presence_penalty: OPENAI_PENALTY,
            },
            capabilities: ModelCapabilities {
                vision: false,
                code_generation: true,
                json_mode: false,
                function_calling: false,
                streaming: true,
                stop_sequences: true,
                logit_bias: false,
                frequency_penalty: true,
                presence_penalty: true,
            },
            recommended_params: RecommendedParams {
                max_tokens: 2_048,
                temperature: 0.6,
                top_p: 0.9,
            },
        },
        ModelDescriptor {
            id: "mistral-large-latest".to_string(),
            provider: "mistral".to_string(),
            context_length: 128_000,
            limits: ParameterLimits {
                max_tokens: TokenLimit { output: 8_192 },
                temperature: NumericLimit::new(0.0, 1.5, 0.7),
                top_p: NumericLimit::new(0.01, 1.0, 1.0),
                frequency_penalty: OPENAI_PENALTY,
                presence_penalty: OPENAI_PENALTY,
            },
            capabilities: ModelCapabilities {
                vision: false,
                code_generation: true,
                json_mode: true,
                function_calling: true,
                streaming: true,
                stop_sequences: true,
                logit_bias: false,
                frequency_penalty: true,
                presence_penalty: true,
            },
            recommended_params: RecommendedParams {
                max_tokens: 4_096,
                temperature: 0.7,
                top_p: 1.0,
            },
        },
        ModelDescriptor {
            id: "deepseek-chat".to_string(),
            provider: "deepseek".to_string(),
            context_length: 65_536,
            limits: ParameterLimits {
                max_tokens: TokenLimit { output: 8_192 },
                temperature: OPENAI_TEMPERATURE,
                top_p: OPENAI_TOP_P,
                frequency_penalty: OPENAI_PENALTY,
                presence_penalty: OPENAI_PENALTY,
            },
            capabilities: ModelCapabilities {
                vision: false,
                code_generation: true,
                json_mode: true,
                function_calling: true,
                streaming: true,
                stop_sequences: true,
                logit_bias: false,
                frequency_penalty: true,
                presence_penalty: true,
            },
            recommended_params: RecommendedParams {
                max_tokens: 4_096,
                temperature: 1.0,
                top_p: 1.0,
            },
        },
    ]
}
