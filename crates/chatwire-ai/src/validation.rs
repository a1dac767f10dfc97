use tracing::trace;

use crate::model_registry::lookup_model;
use crate::types::{GenerationOptions, ModelDescriptor, NumericLimit, ValidatedParameters};

/// Clamps and defaults `options` against the descriptor registered for
/// `model_id`. Always produces a legal parameter set.
pub fn validate_parameters(model_id: &str, options: &GenerationOptions) -> ValidatedParameters {
    validate_for_descriptor(&lookup_model(model_id), options)
}

pub fn validate_for_descriptor(
    descriptor: &ModelDescriptor,
    options: &GenerationOptions,
) -> ValidatedParameters {
    let limits = &descriptor.limits;
    let capabilities = &descriptor.capabilities;

    let max_output = limits.max_tokens.output.max(1);
    let max_tokens = options
        .max_tokens
        .unwrap_or(descriptor.recommended_params.max_tokens)
        .clamp(1, max_output);

    let temperature = resolve_numeric(options.temperature, &limits.temperature);
    let mut top_p = resolve_numeric(options.top_p, &limits.top_p);
    if temperature == 0.0 {
        // Greedy sampling: providers reject temperature 0 paired with top_p < 1.
        trace!(
            model_id = %descriptor.id,
            clamped_top_p = top_p,
            "temperature is 0, forcing top_p to 1"
        );
        top_p = 1.0;
    }

    let frequency_penalty = if capabilities.frequency_penalty {
        finite(options.frequency_penalty).map(|value| limits.frequency_penalty.clamp(value))
    } else {
        None
    };
    let presence_penalty = if capabilities.presence_penalty {
        finite(options.presence_penalty).map(|value| limits.presence_penalty.clamp(value))
    } else {
        None
    };

    ValidatedParameters {
        max_tokens,
        temperature,
        top_p,
        frequency_penalty,
        presence_penalty,
    }
}

fn resolve_numeric(requested: Option<f64>, limit: &NumericLimit) -> f64 {
    limit.clamp(finite(requested).unwrap_or(limit.default))
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|value| value.is_finite())
}
