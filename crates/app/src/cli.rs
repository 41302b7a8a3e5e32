use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use vision::pipeline::telemetry::TelemetryOptions;

use crate::store::SettingsStore;

#[derive(Debug, Parser)]
#[command(name = "rearview", version, about = "Live camera stream with guide-line overlays")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the effective settings as JSON and exit.
    Settings {
        /// Settings file (defaults to $RCAM_CONFIG or the standard locations).
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

/// Flags for the default streaming mode.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Settings file (defaults to $RCAM_CONFIG or the standard locations).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Capture source: a V4L device, a stream URI, `synthetic[:label]` or `opencv:<uri>`.
    #[arg(long, value_name = "URI", default_value = "/dev/video0")]
    pub source: String,
    /// HTTP listen address.
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:8080")]
    pub bind: String,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

/// Validated runtime configuration for [`crate::service::serve`].
#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub store: PathBuf,
    pub source: String,
    pub bind: SocketAddr,
    pub telemetry: TelemetryOptions,
}

impl TryFrom<ServeArgs> for ServeConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        let source = args.source.trim().to_string();
        if source.is_empty() {
            bail!("--source must not be empty");
        }
        let bind = args
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("--bind {:?} is not a socket address", args.bind))?;

        Ok(Self {
            store: SettingsStore::resolve(args.config).path().to_path_buf(),
            source,
            bind,
            telemetry: TelemetryOptions {
                verbose: args.verbose,
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

pub fn print_settings(config: Option<PathBuf>) -> Result<()> {
    let store = SettingsStore::resolve(config);
    let settings = store.load()?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_into_serve_config() {
        let cli = Cli::try_parse_from(["rearview", "--config", "/tmp/cam.json"]).unwrap();
        assert!(cli.command.is_none());
        let config = ServeConfig::try_from(cli.serve).unwrap();
        assert_eq!(config.source, "/dev/video0");
        assert_eq!(config.bind, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.store, PathBuf::from("/tmp/cam.json"));
        assert!(!config.telemetry.verbose);
    }

    #[test]
    fn invalid_bind_is_rejected() {
        let cli = Cli::try_parse_from(["rearview", "--bind", "not-an-address"]).unwrap();
        assert!(ServeConfig::try_from(cli.serve).is_err());
    }

    #[test]
    fn settings_subcommand_parses() {
        let cli = Cli::try_parse_from(["rearview", "settings", "--config", "x.json"]).unwrap();
        match cli.command {
            Some(Command::Settings { config }) => assert_eq!(config, Some(PathBuf::from("x.json"))),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
