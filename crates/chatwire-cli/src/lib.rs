use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chatwire_ai::{
    extract_structured, extract_structured_with_keys, install_model_registry, model_registry,
    validate_parameters, GenerationOptions, InferenceClient, ModelDescriptor,
    ModelRegistry,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod session;

use config::{ChatwireConfig, ChatwireTomlLog};
use session::{failure_line, ChatSession};

pub const LOG_FILE_NAME: &str = "chatwire.log";
pub const CONFIG_SAMPLE: &str = include_str!("../../../chatwire.toml.sample");
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub generation: GenerationOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AskOptions {
    pub prompt: String,
    pub model: Option<String>,
    pub stream: bool,
    pub generation: GenerationOptions,
}

#[derive(Debug, Clone)]
struct RuntimeLogConfig {
    log_dir: PathBuf,
    level: String,
    stderr: bool,
}

pub fn init_conf_dir(conf_dir: Option<PathBuf>) {
    config::init_conf_dir(conf_dir);
}

/// Routes `tracing` output to `<log dir>/chatwire.log`, and to stderr as well
/// when configured or when `force_stderr` is set. `RUST_LOG` wins over the
/// configured level.
pub fn init_tracing(force_stderr: bool) {
    static TRACE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    let config = load_runtime_log_config();
    if let Err(error) = fs::create_dir_all(&config.log_dir) {
        eprintln!(
            "warning: failed to create log dir {}: {error}",
            config.log_dir.display()
        );
        return;
    }

    let appender = tracing_appender::rolling::never(&config.log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = TRACE_GUARD.set(guard);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking);
    let init_result = if config.stderr || force_stderr {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(io::stderr);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stderr_layer)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .try_init()
    };
    if let Err(error) = init_result {
        eprintln!(
            "warning: failed to initialize tracing subscriber for {}: {error}",
            config.log_dir.display()
        );
    }
}

fn load_runtime_log_config() -> RuntimeLogConfig {
    let parsed = config::read_toml_file(&config::default_config_path()).unwrap_or_default();
    build_runtime_log_config(&parsed.log, &parsed.env)
}

fn build_runtime_log_config(
    log: &ChatwireTomlLog,
    env_map: &HashMap<String, String>,
) -> RuntimeLogConfig {
    let process_env = |key: &str| std::env::var(key).ok();
    let log_dir = log
        .path
        .as_deref()
        .and_then(|value| config::resolve_config_value(value, env_map, process_env))
        .map(|value| config::expand_home_path(&value))
        .unwrap_or_else(default_log_dir);
    let level = log
        .level
        .as_deref()
        .and_then(|value| config::resolve_config_value(value, env_map, process_env))
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

    RuntimeLogConfig {
        log_dir,
        level,
        stderr: log.stderr.unwrap_or(false),
    }
}

fn default_log_dir() -> PathBuf {
    config::current_conf_dir().join("logs")
}

/// Loads the configuration and installs the model catalog it describes.
pub fn load_runtime() -> Result<(ChatwireConfig, InferenceClient), String> {
    let path = config::default_config_path();
    let config = config::load_config(&path)?;
    install_registry(&config.models);
    let client = InferenceClient::new(config.inference.clone());
    info!(
        endpoint = %config.inference.endpoint,
        model = %config.inference.default_model,
        extra_models = config.models.len(),
        "configuration loaded"
    );
    Ok((config, client))
}

fn install_registry(models: &[ModelDescriptor]) {
    let registry = ModelRegistry::builtin().with_descriptors(models.iter().cloned());
    if install_model_registry(registry).is_err() {
        warn!("model registry was already initialised; configured models are ignored");
    }
}

/// Model catalog including descriptors from the config file, when it loads.
fn catalog_registry() -> &'static ModelRegistry {
    if let Ok(file) = config::read_toml_file(&config::default_config_path()) {
        if let Ok(config) = config::resolve_models_only(file) {
            install_registry(&config);
        }
    }
    model_registry()
}

pub async fn run_chat(options: ChatOptions) -> Result<(), String> {
    let (config, client) = load_runtime()?;
    let model = options
        .model
        .unwrap_or_else(|| config.inference.default_model.clone());
    let mut session = ChatSession::new(client, model, config.system_prompt, options.generation);

    println!(
        "chatwire: chatting with {} (/reset clears history, /exit quits)",
        session.model()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let Some(line) = lines
            .next_line()
            .await
            .map_err(|error| format!("read stdin failed: {error}"))?
        else {
            println!();
            return Ok(());
        };

        match line.trim() {
            "" => continue,
            "/exit" | "/quit" => return Ok(()),
            "/reset" => {
                session.reset();
                println!("[chatwire] history cleared");
                continue;
            }
            _ => {}
        }

        let outcome = session
            .send_streaming(line.trim(), |content| {
                print!("{content}");
                let _ = io::stdout().flush();
                async {}
            })
            .await;
        match outcome {
            Ok(_) => println!(),
            Err(error) => println!("{}", failure_line(&error)),
        }
    }
}

pub async fn run_ask(options: AskOptions) -> Result<(), String> {
    let (config, client) = load_runtime()?;
    let model = options
        .model
        .unwrap_or_else(|| config.inference.default_model.clone());
    let mut session = ChatSession::new(client, model, config.system_prompt, options.generation);

    if options.stream {
        session
            .send_streaming(&options.prompt, |content| {
                print!("{content}");
                let _ = io::stdout().flush();
                async {}
            })
            .await
            .map_err(|error| failure_line(&error))?;
        println!();
    } else {
        let reply = session
            .send(&options.prompt)
            .await
            .map_err(|error| failure_line(&error))?;
        println!("{reply}");
    }
    Ok(())
}

pub fn run_extract(keys: &[String]) -> Result<(), String> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(|error| format!("read stdin failed: {error}"))?;
    println!("{}", render_extraction(&input, keys));
    Ok(())
}

fn render_extraction(input: &str, keys: &[String]) -> String {
    let recovered = if keys.is_empty() {
        extract_structured(input)
    } else {
        let keys = keys.iter().map(String::as_str).collect::<Vec<_>>();
        extract_structured_with_keys(input, &keys)
    };
    match recovered {
        Some(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
        None => "null".to_string(),
    }
}

pub fn run_models() -> Result<(), String> {
    print!("{}", render_models(catalog_registry().models()));
    Ok(())
}

fn render_models(models: &[ModelDescriptor]) -> String {
    let mut out = format!(
        "{:<30} {:<10} {:>8} {:>8}  {}\n",
        "MODEL", "PROVIDER", "CONTEXT", "OUTPUT", "CAPABILITIES"
    );
    for descriptor in models {
        out.push_str(&format!(
            "{:<30} {:<10} {:>8} {:>8}  {}\n",
            descriptor.id,
            descriptor.provider,
            descriptor.context_length,
            descriptor.limits.max_tokens.output,
            capability_names(descriptor).join(",")
        ));
    }
    out
}

fn capability_names(descriptor: &ModelDescriptor) -> Vec<&'static str> {
    let capabilities = &descriptor.capabilities;
    [
        ("vision", capabilities.vision),
        ("code_generation", capabilities.code_generation),
        ("json_mode", capabilities.json_mode),
        ("function_calling", capabilities.function_calling),
        ("streaming", capabilities.streaming),
        ("stop_sequences", capabilities.stop_sequences),
        ("logit_bias", capabilities.logit_bias),
        ("frequency_penalty", capabilities.frequency_penalty),
        ("presence_penalty", capabilities.presence_penalty),
    ]
    .into_iter()
    .filter_map(|(name, enabled)| enabled.then_some(name))
    .collect()
}

pub fn run_validate(model: &str, options: &GenerationOptions) -> Result<(), String> {
    catalog_registry();
    let validated = validate_parameters(model, options);
    let rendered = serde_json::to_string_pretty(&validated)
        .map_err(|error| format!("render validated parameters failed: {error}"))?;
    println!("{rendered}");
    Ok(())
}

/// Writes the sample configuration into the conf dir unless a config file
/// already exists, and creates the log directory.
pub fn run_config_init() -> Result<(), String> {
    let conf_dir = config::current_conf_dir();
    init_conf_tree(&conf_dir)
}

fn init_conf_tree(conf_dir: &Path) -> Result<(), String> {
    let logs = conf_dir.join("logs");
    fs::create_dir_all(&logs)
        .map_err(|error| format!("create {} failed: {error}", logs.display()))?;

    let config_path = conf_dir.join(config::CONFIG_FILE_NAME);
    if config_path.exists() {
        println!("[chatwire] keeping existing {}", config_path.display());
        return Ok(());
    }
    fs::write(&config_path, CONFIG_SAMPLE)
        .map_err(|error| format!("write {} failed: {error}", config_path.display()))?;
    println!("[chatwire] wrote {}", config_path.display());
    Ok(())
}
