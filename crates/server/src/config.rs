//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "platewise-server", version, about = "Platewise nutrition assistant server")]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "PLATEWISE_BIND", default_value = "127.0.0.1:4000")]
    pub bind: SocketAddr,

    /// Data directory (database, logs). Defaults to ~/.platewise
    #[arg(long, env = "PLATEWISE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Deliver conversational replies as stream_start/stream_chunk/stream_end frames
    #[arg(long, env = "PLATEWISE_STREAM_RESPONSES")]
    pub stream_responses: bool,

    /// Chat model used for conversational replies
    #[arg(long, env = "PLATEWISE_MODEL", default_value = "gpt-4.1-mini")]
    pub model: String,

    /// Base URL of an OpenAI-compatible API
    #[arg(
        long,
        env = "PLATEWISE_LLM_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    pub llm_base_url: String,

    /// Seconds an unused session actor stays resident before it is evicted
    #[arg(long, env = "PLATEWISE_ACTOR_IDLE_SECS", default_value_t = 600)]
    pub actor_idle_secs: u64,
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Cli {
    pub fn generation(&self) -> GenerationConfig {
        GenerationConfig {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            model: self.model.clone(),
            base_url: self.llm_base_url.clone(),
        }
    }
}
