use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "poolgate", about = "OpenAI-compatible LLM gateway with provider pools")]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long, env = "POOLGATE_CONFIG", default_value = "poolgate.json")]
    pub config: PathBuf,

    /// Override the configured bind host.
    #[arg(long, env = "POOLGATE_HOST")]
    pub host: Option<String>,

    /// Override the configured bind port.
    #[arg(long, env = "POOLGATE_PORT")]
    pub port: Option<u16>,

    /// Log filter; falls back to RUST_LOG, then the config's log level.
    #[arg(long, env = "POOLGATE_LOG")]
    pub log: Option<String>,

    /// Skip background health probing (useful for one-shot smoke tests).
    #[arg(long)]
    pub no_health_checks: bool,
}
