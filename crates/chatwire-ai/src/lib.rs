//! Protocol layer between a chat application and an OpenAI-compatible
//! chat-completions endpoint: per-model parameter validation, request
//! building, SSE stream reassembly and recovery of JSON from model output.

mod error;
mod event_stream;
mod extract;
mod model_registry;
mod request;
mod sse;
mod transport;
mod types;
mod validation;

pub use error::{InferenceError, InferenceErrorCode};
pub use event_stream::CompletionEventStream;
pub use extract::{
    extract_as, extract_structured, extract_structured_with_keys, extract_structured_with_schema,
    normalize_arrays, quote_bare_keys, quote_bare_values, sanitize, single_to_double_quotes,
    strip_trailing_commas, unquote_numeric_values,
};
pub use model_registry::{
    fallback_descriptor, install_model_registry, lookup_model, model_registry, ModelRegistry,
    FALLBACK_CONTEXT_LENGTH, FALLBACK_MAX_OUTPUT_TOKENS, FALLBACK_PROVIDER,
};
pub use request::{build_request_body, build_request_for_descriptor, RequestBody};
pub use sse::{
    delta_contents, reassemble, ReassemblerConfig, ReassemblerState, StreamReassembler,
    StreamSummary, Utf8Decoder, DATA_PREFIX, DONE_SENTINEL,
};
pub use transport::{describe_error_body, InferenceClient, InferenceConfig};
pub use types::{
    CompletionEvent, GenerationOptions, Message, ModelCapabilities, ModelDescriptor,
    NumericLimit, ParameterLimits, RecommendedParams, Role, StreamEvent, TokenLimit,
    ValidatedParameters,
};
pub use validation::{validate_for_descriptor, validate_parameters};
