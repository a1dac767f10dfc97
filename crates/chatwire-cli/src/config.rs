use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chatwire_ai::{fallback_descriptor, InferenceConfig, ModelDescriptor, NumericLimit};
use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = "chatwire.toml";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const ENDPOINT_ENV: &str = "CHATWIRE_ENDPOINT";
pub const API_KEY_ENV: &str = "CHATWIRE_API_KEY";
pub const MODEL_ENV: &str = "CHATWIRE_MODEL";

const DEFAULT_CONF_DIR_NAME: &str = ".chatwire";
static CONF_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Resolved configuration for one CLI invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatwireConfig {
    pub inference: InferenceConfig,
    pub system_prompt: Option<String>,
    pub models: Vec<ModelDescriptor>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct ChatwireTomlFile {
    #[serde(default)]
    inference: ChatwireTomlInference,
    #[serde(default)]
    pub(crate) log: ChatwireTomlLog,
    #[serde(default)]
    pub(crate) env: HashMap<String, String>,
    #[serde(default)]
    models: Vec<ChatwireTomlModel>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatwireTomlInference {
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct ChatwireTomlLog {
    #[serde(default)]
    pub(crate) path: Option<String>,
    #[serde(default)]
    pub(crate) level: Option<String>,
    #[serde(default)]
    pub(crate) stderr: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatwireTomlModel {
    id: String,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    context_length: Option<u32>,
    #[serde(default)]
    max_output_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<NumericLimit>,
    #[serde(default)]
    top_p: Option<NumericLimit>,
    #[serde(default)]
    frequency_penalty: Option<NumericLimit>,
    #[serde(default)]
    presence_penalty: Option<NumericLimit>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    recommended_max_tokens: Option<u32>,
}

pub fn init_conf_dir(conf_dir: Option<PathBuf>) {
    let resolved = conf_dir
        .as_deref()
        .map(resolve_conf_dir_arg)
        .unwrap_or_else(default_conf_dir);
    let _ = CONF_DIR.set(resolved);
}

pub fn current_conf_dir() -> PathBuf {
    CONF_DIR.get().cloned().unwrap_or_else(default_conf_dir)
}

pub fn default_config_path() -> PathBuf {
    current_conf_dir().join(CONFIG_FILE_NAME)
}

fn default_conf_dir() -> PathBuf {
    home_dir().join(DEFAULT_CONF_DIR_NAME)
}

fn resolve_conf_dir_arg(path: &Path) -> PathBuf {
    let expanded = expand_home_path(&path.to_string_lossy());
    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    }
}

pub(crate) fn expand_home_path(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed == "~" {
        return home_dir();
    }
    if let Some(suffix) = trimmed.strip_prefix("~/") {
        return home_dir().join(suffix);
    }
    PathBuf::from(trimmed)
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Reads the config file if present. A missing file is not an error: the
/// endpoint may still come from the environment.
pub(crate) fn read_toml_file(path: &Path) -> Result<ChatwireTomlFile, String> {
    if !path.exists() {
        return Ok(ChatwireTomlFile::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|error| format!("read {} failed: {error}", path.display()))?;
    toml::from_str(&content).map_err(|error| format!("parse {} failed: {error}", path.display()))
}

pub fn load_config(path: &Path) -> Result<ChatwireConfig, String> {
    let file = read_toml_file(path)?;
    resolve_config(file, |key| std::env::var(key).ok())
        .map_err(|error| format!("{error} (config file: {})", path.display()))
}

pub fn parse_config<F>(content: &str, process_env: F) -> Result<ChatwireConfig, String>
where
    F: Fn(&str) -> Option<String>,
{
    let file = toml::from_str::<ChatwireTomlFile>(content)
        .map_err(|error| format!("parse config failed: {error}"))?;
    resolve_config(file, process_env)
}

fn resolve_config<F>(file: ChatwireTomlFile, process_env: F) -> Result<ChatwireConfig, String>
where
    F: Fn(&str) -> Option<String>,
{
    let env_map = &file.env;
    let lookup = |value: &Option<String>| {
        value
            .as_deref()
            .and_then(|value| resolve_config_value(value, env_map, &process_env))
    };
    let override_from = |key: &str| process_env(key).filter(|value| !value.trim().is_empty());

    let endpoint = override_from(ENDPOINT_ENV)
        .or_else(|| lookup(&file.inference.endpoint))
        .ok_or_else(|| {
            format!("missing inference endpoint: set [inference].endpoint or {ENDPOINT_ENV}")
        })?;
    let endpoint = endpoint.trim().to_string();
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(format!(
            "inference endpoint must be an http(s) URL, got {endpoint}"
        ));
    }

    let api_key = override_from(API_KEY_ENV).or_else(|| lookup(&file.inference.api_key));
    let default_model = override_from(MODEL_ENV)
        .or_else(|| lookup(&file.inference.model))
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let system_prompt = match file.inference.system_prompt.as_deref() {
        Some(prompt) if prompt.trim().is_empty() => None,
        Some(prompt) => Some(prompt.to_string()),
        None => Some(DEFAULT_SYSTEM_PROMPT.to_string()),
    };

    let models = file
        .models
        .into_iter()
        .map(build_model_descriptor)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ChatwireConfig {
        inference: InferenceConfig {
            endpoint,
            api_key,
            default_model: default_model.trim().to_string(),
        },
        system_prompt,
        models,
    })
}

/// Only the `[[models]]` section, for commands that never contact the
/// endpoint.
pub(crate) fn resolve_models_only(file: ChatwireTomlFile) -> Result<Vec<ModelDescriptor>, String> {
    file.models.into_iter().map(build_model_descriptor).collect()
}

/// `"$NAME"` resolves from the `[env]` table first, then the process
/// environment; anything else is taken literally. Blank values count as unset.
pub(crate) fn resolve_config_value<F>(
    value: &str,
    env_map: &HashMap<String, String>,
    process_env: F,
) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(env_key) = trimmed.strip_prefix('$') {
        return env_map
            .get(env_key)
            .cloned()
            .or_else(|| process_env(env_key))
            .filter(|resolved| !resolved.trim().is_empty());
    }
    Some(trimmed.to_string())
}

fn build_model_descriptor(model: ChatwireTomlModel) -> Result<ModelDescriptor, String> {
    let id = model.id.trim().to_string();
    if id.is_empty() {
        return Err("[[models]] entry is missing an id".to_string());
    }

    let mut descriptor = fallback_descriptor(&id);
    if let Some(provider) = model.provider.filter(|value| !value.trim().is_empty()) {
        descriptor.provider = provider;
    }
    if let Some(context_length) = model.context_length {
        descriptor.context_length = context_length;
    }
    if let Some(output) = model.max_output_tokens {
        if output == 0 {
            return Err(format!("model {id}: max_output_tokens must be at least 1"));
        }
        descriptor.limits.max_tokens.output = output;
    }

    let limits = &mut descriptor.limits;
    for (name, source, target) in [
        ("temperature", model.temperature, &mut limits.temperature),
        ("top_p", model.top_p, &mut limits.top_p),
        ("frequency_penalty", model.frequency_penalty, &mut limits.frequency_penalty),
        ("presence_penalty", model.presence_penalty, &mut limits.presence_penalty),
    ] {
        if let Some(limit) = source {
            check_limit(&id, name, &limit)?;
            *target = limit;
        }
    }

    for capability in &model.capabilities {
        let flags = &mut descriptor.capabilities;
        let flag = match capability.trim() {
            "vision" => &mut flags.vision,
            "code_generation" => &mut flags.code_generation,
            "json_mode" => &mut flags.json_mode,
            "function_calling" => &mut flags.function_calling,
            "streaming" => &mut flags.streaming,
            "stop_sequences" => &mut flags.stop_sequences,
            "logit_bias" => &mut flags.logit_bias,
            "frequency_penalty" => &mut flags.frequency_penalty,
            "presence_penalty" => &mut flags.presence_penalty,
            other => return Err(format!("model {id}: unknown capability {other}")),
        };
        *flag = true;
    }

    let output = descriptor.limits.max_tokens.output;
    descriptor.recommended_params.max_tokens = model
        .recommended_max_tokens
        .unwrap_or(descriptor.recommended_params.max_tokens)
        .clamp(1, output);
    descriptor.recommended_params.temperature = descriptor.limits.temperature.default;
    descriptor.recommended_params.top_p = descriptor.limits.top_p.default;

    Ok(descriptor)
}

fn check_limit(id: &str, name: &str, limit: &NumericLimit) -> Result<(), String> {
    let finite = limit.min.is_finite() && limit.max.is_finite() && limit.default.is_finite();
    if !finite || limit.min > limit.max || !limit.contains(limit.default) {
        return Err(format!(
            "model {id}: {name} needs min <= default <= max, got {} <= {} <= {}",
            limit.min, limit.default, limit.max
        ));
    }
    Ok(())
}
