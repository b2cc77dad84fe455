use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::catalog::DEFAULT_CATALOG_URL;

/// GPT4All CLI - chat with a local LLM in the terminal or in a multi-room web chat
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print version and exit
    Version,

    /// List the models of the public GPT4All catalogue
    ListModels {
        /// URL of the GPT4All model catalogue
        #[arg(long, env = "GPT4ALL_CATALOG_URL", default_value = DEFAULT_CATALOG_URL)]
        catalog_url: String,
    },

    /// Chat with GPT4All
    ///
    /// The words of PROMPT are joined and asked first, then the chat continues
    /// interactively until an empty line is entered.
    Chat(ChatArgs),

    /// Start the multi-user web chat
    Web(WebArgs),
}

/// Where models come from. Shared by `chat` and `web`.
#[derive(ClapArgs, Debug, Clone)]
pub struct ModelSource {
    /// Directory holding (and receiving downloaded) GGUF model files
    #[arg(short = 'd', long, env = "GPT4ALL_MODEL_DIR", default_value_os_t = default_model_dir())]
    pub model_dir: PathBuf,

    /// Never download the model catalogue or model weights
    #[arg(long)]
    pub no_download: bool,

    /// URL of the GPT4All model catalogue
    #[arg(long, env = "GPT4ALL_CATALOG_URL", default_value = DEFAULT_CATALOG_URL)]
    pub catalog_url: String,
}

impl ModelSource {
    pub fn allow_download(&self) -> bool {
        !self.no_download
    }
}

#[derive(ClapArgs, Debug)]
pub struct ChatArgs {
    /// Initial prompt, asked before the interactive loop starts
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub prompt: Vec<String>,

    /// Model file name from the catalogue, or path to a local GGUF file
    #[arg(long, default_value = "mistral-7b-openorca.Q4_0.gguf")]
    pub model: String,

    /// Maximum number of tokens generated per answer
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..=9999))]
    pub max_tokens: u32,

    /// Number of CPU threads used for inference
    #[arg(long, default_value_t = default_cpu_count(), value_parser = clap::value_parser!(u32).range(1..=9999))]
    pub cpu_count: u32,

    /// Sampling temperature (0 = greedy)
    #[arg(long, default_value_t = 0.0, value_parser = parse_temperature)]
    pub temperature: f32,

    /// Context window size in tokens
    #[arg(short, long, default_value_t = 2048)]
    pub context_size: u32,

    #[command(flatten)]
    pub source: ModelSource,

    /// Increase log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl ChatArgs {
    pub fn initial_prompt(&self) -> String {
        self.prompt.join(" ")
    }
}

#[derive(ClapArgs, Debug)]
pub struct WebArgs {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Number of CPU threads used for inference in each room
    #[arg(long, default_value_t = default_cpu_count(), value_parser = clap::value_parser!(u32).range(1..=9999))]
    pub cpu_count: u32,

    /// Context window size in tokens
    #[arg(short, long, default_value_t = 2048)]
    pub context_size: u32,

    #[command(flatten)]
    pub source: ModelSource,

    /// Increase log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl Args {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

fn default_model_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gpt4all")
}

fn default_cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

fn parse_temperature(s: &str) -> Result<f32, String> {
    let value: f32 = s.parse().map_err(|_| format!("`{s}` is not a number"))?;
    if !(0.0..=2.0).contains(&value) {
        return Err(format!("{value} is not in 0..=2"));
    }
    Ok(value)
}
