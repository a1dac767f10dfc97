use chatwire_ai::GenerationOptions;
use chatwire_cli::{AskOptions, ChatOptions};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chatwire", version, about = "chat-completions client")]
struct Cli {
    #[arg(long, global = true)]
    conf_dir: Option<std::path::PathBuf>,
    /// Mirror log output to stderr.
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: ChatwireSubcommand,
}

#[derive(Subcommand, Debug, Clone)]
enum ChatwireSubcommand {
    /// Interactive streaming chat.
    Chat(ChatArgs),
    /// One-shot completion.
    Ask(AskArgs),
    /// Recover a JSON object from text on stdin.
    Extract(ExtractArgs),
    /// List the model catalog.
    Models,
    /// Show the parameters a request would carry for a model.
    Validate(ValidateArgs),
    #[command(subcommand)]
    Config(ConfigSubcommand),
}

#[derive(Subcommand, Debug, Clone)]
enum ConfigSubcommand {
    /// Write a sample chatwire.toml into the conf dir.
    Init,
}

#[derive(Args, Debug, Clone, Default)]
struct GenerationArgs {
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long, allow_negative_numbers = true)]
    temperature: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    top_p: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    frequency_penalty: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    presence_penalty: Option<f64>,
    #[arg(long = "stop")]
    stop: Vec<String>,
}

impl GenerationArgs {
    fn into_options(self) -> GenerationOptions {
        GenerationOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            stop: (!self.stop.is_empty()).then_some(self.stop),
            logit_bias: None,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct ChatArgs {
    #[arg(long)]
    model: Option<String>,
    #[command(flatten)]
    generation: GenerationArgs,
}

#[derive(Args, Debug, Clone)]
struct AskArgs {
    prompt: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value_t = false)]
    stream: bool,
    #[command(flatten)]
    generation: GenerationArgs,
}

#[derive(Args, Debug, Clone)]
struct ExtractArgs {
    /// Accept only objects carrying at least one of these top-level keys.
    #[arg(long, value_delimiter = ',')]
    keys: Vec<String>,
}

#[derive(Args, Debug, Clone)]
struct ValidateArgs {
    #[arg(long)]
    model: String,
    #[command(flatten)]
    generation: GenerationArgs,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    chatwire_cli::init_conf_dir(cli.conf_dir.clone());
    chatwire_cli::init_tracing(cli.verbose);
    let result = match cli.command {
        ChatwireSubcommand::Chat(args) => {
            chatwire_cli::run_chat(ChatOptions {
                model: args.model,
                generation: args.generation.into_options(),
            })
            .await
        }
        ChatwireSubcommand::Ask(args) => {
            chatwire_cli::run_ask(AskOptions {
                prompt: args.prompt,
                model: args.model,
                stream: args.stream,
                generation: args.generation.into_options(),
            })
            .await
        }
        ChatwireSubcommand::Extract(args) => chatwire_cli::run_extract(&args.keys),
        ChatwireSubcommand::Models => chatwire_cli::run_models(),
        ChatwireSubcommand::Validate(args) => {
            chatwire_cli::run_validate(&args.model, &args.generation.into_options())
        }
        ChatwireSubcommand::Config(ConfigSubcommand::Init) => chatwire_cli::run_config_init(),
    };
    if let Err(error) = result {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
