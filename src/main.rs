use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use syncore::config::{EngineConfig, EngineConfigOverrides};

#[derive(Parser, Debug)]
#[command(name = "syncore", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// State store root override (takes precedence over env/config)
    #[arg(long = "state-store-root")]
    state_store_root: Option<PathBuf>,

    /// Max retry count override
    #[arg(long = "max-retries")]
    max_retries: Option<u32>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the resolved config file path
    ConfigPath,

    /// Print the fully-resolved, validated configuration as JSON
    ShowConfig,

    /// Validate the on-disk config and state-store layout, then exit
    Check,

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        state_store_root,
        max_retries,
        command,
    } = Cli::parse();
    let resolved_config = EngineConfig::resolve_config_path(config.as_deref());

    match command.unwrap_or(Commands::Check) {
        Commands::ConfigPath => {
            println!("{}", resolved_config.display());
            Ok(())
        }
        Commands::Version => {
            println!("{}", detailed_version());
            Ok(())
        }
        Commands::ShowConfig => {
            let cfg = load_config(&resolved_config, state_store_root, max_retries)?;
            println!("{}", serde_json::to_string_pretty(&ShowConfig::from(&cfg))?);
            Ok(())
        }
        Commands::Check => {
            let cfg = load_config(&resolved_config, state_store_root, max_retries)?;
            let log_path = syncore::logging::init_log_file(&cfg.log_path)
                .map(|_| cfg.log_path.clone())
                .unwrap_or_else(|_| cfg.log_path.clone());
            syncore::logging::info(format!(
                "config ok version={} config={} state_store={}",
                env!("CARGO_PKG_VERSION"),
                resolved_config.display(),
                cfg.state_store_root.display(),
            ));
            println!("config ok: {}", log_path.display());
            println!(
                "this binary hosts the engine's core; the block store, directory-manifest codec, \
                 and crypto collaborators described in this crate's docs must be supplied by an \
                 embedder before a session can actually be started"
            );
            Ok(())
        }
    }
}

fn load_config(resolved_config: &std::path::Path, state_store_root: Option<PathBuf>, max_retries: Option<u32>) -> Result<EngineConfig> {
    let overrides = EngineConfigOverrides {
        state_store_root,
        max_retries,
        ..Default::default()
    };
    Ok(EngineConfig::load_with_overrides(resolved_config, overrides)?)
}

#[derive(serde::Serialize)]
struct ShowConfig {
    state_store_root: PathBuf,
    log_path: PathBuf,
    include_patterns: Vec<String>,
    exclude_patterns: Vec<String>,
    poll_interval_secs: u64,
    max_retries: u32,
    watch_mode: bool,
}

impl From<&EngineConfig> for ShowConfig {
    fn from(cfg: &EngineConfig) -> Self {
        ShowConfig {
            state_store_root: cfg.state_store_root.clone(),
            log_path: cfg.log_path.clone(),
            include_patterns: cfg.include_patterns.clone(),
            exclude_patterns: cfg.exclude_patterns.clone(),
            poll_interval_secs: cfg.poll_interval.as_secs(),
            max_retries: cfg.max_retries,
            watch_mode: cfg.watch_mode,
        }
    }
}

fn detailed_version() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{} (rust; {}/{})", version, std::env::consts::OS, std::env::consts::ARCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cli_allows_no_subcommand() {
        let cli = Cli::try_parse_from(["syncore"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn config_path_subcommand_parses() {
        let cli = Cli::try_parse_from(["syncore", "-c", "config.json", "config-path"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::ConfigPath)));
    }
}
