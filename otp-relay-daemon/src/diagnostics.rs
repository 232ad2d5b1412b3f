//! Command line and logging
//!
//! Command-line interface of the daemon and tracing subscriber setup.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// OTP relay daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "otp-relay-daemon")]
#[command(about = "Pairs with a phone and relays one-time passwords over the LAN", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value = "true")]
    pub timestamps: bool,

    /// Use this config file instead of the default location
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the relay server until interrupted (default)
    Serve,

    /// Print this device's pairing code
    PairCode,

    /// Accept a pairing code from another device
    Pair {
        /// Code scanned from the other device
        code: String,
    },

    /// Remove a paired device
    Unpair {
        /// Device ID
        device_id: String,
    },

    /// List paired devices
    Devices,

    /// Scan the subnet for relay endpoints
    Scan {
        /// Subnet prefix such as 192.168.1, defaults to the local interface
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Deliver a message to the first device that confirms it
    Send {
        /// Message body
        text: String,
    },

    /// Deliver each line read from stdin, retrying in the background
    Forward,

    /// Generate new signing keys and forget every pairing
    ResetKeys,
}

/// Initialize logging based on CLI configuration
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_none() {
        let cli = Cli::parse_from(["otp-relay-daemon"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::parse_from(["otp-relay-daemon", "scan", "--prefix", "192.168.1"]);
        assert!(matches!(cli.command, Some(Command::Scan { prefix: Some(ref p) }) if p == "192.168.1"));

        let cli = Cli::parse_from(["otp-relay-daemon", "--json-logs", "send", "482913"]);
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Some(Command::Send { ref text }) if text == "482913"));

        let cli = Cli::parse_from(["otp-relay-daemon", "unpair", "abc123"]);
        assert!(matches!(cli.command, Some(Command::Unpair { ref device_id }) if device_id == "abc123"));

        let cli = Cli::parse_from(["otp-relay-daemon", "forward"]);
        assert!(matches!(cli.command, Some(Command::Forward)));
    }
}
