// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! CLI argument parsing and command definitions.
//!
//! - `run`: Watch a machine over a live OPC UA endpoint
//! - `validate`: Validate a configuration file
//! - `simulate`: Run the monitor against the simulated machine (default)
//! - `version`: Show version information

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

// =============================================================================
// Main CLI Structure
// =============================================================================

/// machwatch - machine-state monitor with video triggers
///
/// Watches the MachineryItemState of a machine over an OPC UA subscription
/// and emits trigger events when the machine stops.
#[derive(Parser, Debug)]
#[command(
    name = "machwatch",
    author = "Sylvex <contact@sylvex.io>",
    version = machwatch_opcua::VERSION,
    about = "Machine-state monitor with equipment stop triggers",
    long_about = None,
    propagate_version = true
)]
pub struct Cli {
    /// Configuration file path (YAML or TOML)
    #[arg(
        short,
        long,
        default_value = "machwatch.yaml",
        env = "MACHWATCH_CONFIG",
        global = true
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        default_value = "info",
        env = "MACHWATCH_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json, compact)
    #[arg(long, default_value = "text", env = "MACHWATCH_LOG_FORMAT", global = true)]
    pub log_format: LogFormat,

    /// Enable quiet mode (warnings and errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

// =============================================================================
// Subcommands
// =============================================================================

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Watch the configured machine over OPC UA
    ///
    /// Connects to the endpoint from the configuration file and prints every
    /// trigger event as a JSON line until interrupted. Requires a build with
    /// the `opcua` feature.
    Run(RunArgs),

    /// Validate the configuration file
    ///
    /// Parses and validates the configuration file without connecting.
    Validate(ValidateArgs),

    /// Run the monitor against a simulated machine
    ///
    /// Cycles the simulated machine through its states and prints every
    /// trigger event as a JSON line until interrupted.
    /// This is the default command when no subcommand is specified.
    Simulate(SimulateArgs),

    /// Show version information
    Version,
}

// =============================================================================
// Command Arguments
// =============================================================================

/// Arguments for the `run` command.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Seconds between status log lines (0 disables them)
    #[arg(long, default_value = "60")]
    pub status_interval_secs: u64,
}

/// Arguments for the `validate` command.
#[derive(Args, Debug, Clone, Default)]
pub struct ValidateArgs {
    /// Show parsed configuration after validation
    #[arg(short, long)]
    pub show_config: bool,

    /// Output format for validation results
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,

    /// Strict mode: treat warnings as errors
    #[arg(long)]
    pub strict: bool,
}

/// Arguments for the `simulate` command.
#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Milliseconds between simulated state changes
    #[arg(short, long, default_value = "2000")]
    pub interval_ms: u64,

    /// Stop after this many state changes (runs until Ctrl+C if absent)
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Drop the simulated connection every N state changes
    #[arg(long)]
    pub drop_every: Option<u64>,

    /// Machine identifier reported by the simulated machine
    #[arg(long, default_value = "sim-machine-01")]
    pub machine_id: String,

    /// Use built-in defaults when the configuration file is missing
    #[arg(long)]
    pub allow_defaults: bool,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            cycles: None,
            drop_every: None,
            machine_id: "sim-machine-01".to_string(),
            allow_defaults: true,
        }
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format for structured logging
    Json,
    /// Compact format for minimal output
    Compact,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format for programmatic parsing
    Json,
}

// =============================================================================
// Helper Methods
// =============================================================================

impl Cli {
    /// Parse CLI arguments from the command line.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the effective command, defaulting to `Simulate` if none specified.
    pub fn effective_command(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or_else(|| Commands::Simulate(SimulateArgs::default()))
    }

    /// Get the effective log level based on flags.
    pub fn effective_log_level(&self) -> &str {
        if self.quiet {
            "warn"
        } else if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command() {
        let cli = Cli::parse_from(["machwatch"]);
        assert!(cli.command.is_none());
        assert!(matches!(cli.effective_command(), Commands::Simulate(_)));
    }

    #[test]
    fn test_validate_command() {
        let cli = Cli::parse_from(["machwatch", "validate", "--show-config", "-f", "json"]);
        let Some(Commands::Validate(args)) = cli.command else {
            panic!("Expected Validate command");
        };
        assert!(args.show_config);
        assert_eq!(args.format, OutputFormat::Json);
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::parse_from(["machwatch", "run", "--status-interval-secs", "0"]);
        let Some(Commands::Run(args)) = cli.command else {
            panic!("Expected Run command");
        };
        assert_eq!(args.status_interval_secs, 0);

        let cli = Cli::parse_from(["machwatch", "-c", "press.toml", "run"]);
        let Some(Commands::Run(args)) = cli.command else {
            panic!("Expected Run command");
        };
        assert_eq!(args.status_interval_secs, 60);
        assert_eq!(cli.config, PathBuf::from("press.toml"));
    }

    #[test]
    fn test_simulate_command() {
        let cli = Cli::parse_from([
            "machwatch",
            "simulate",
            "--interval-ms",
            "250",
            "--cycles",
            "8",
            "--drop-every",
            "3",
        ]);
        let Some(Commands::Simulate(args)) = cli.command else {
            panic!("Expected Simulate command");
        };
        assert_eq!(args.interval_ms, 250);
        assert_eq!(args.cycles, Some(8));
        assert_eq!(args.drop_every, Some(3));
        assert!(!args.allow_defaults);
    }

    #[test]
    fn test_config_path_is_global() {
        let cli = Cli::parse_from(["machwatch", "validate", "-c", "/etc/machwatch/press.toml"]);
        assert_eq!(cli.config, PathBuf::from("/etc/machwatch/press.toml"));
    }

    #[test]
    fn test_quiet_and_verbose() {
        let cli = Cli::parse_from(["machwatch", "-q"]);
        assert_eq!(cli.effective_log_level(), "warn");

        let cli = Cli::parse_from(["machwatch", "-v"]);
        assert_eq!(cli.effective_log_level(), "debug");

        let cli = Cli::parse_from(["machwatch", "-l", "trace"]);
        assert_eq!(cli.effective_log_level(), "trace");
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        assert!(Cli::try_parse_from(["machwatch", "--log-format", "xml"]).is_err());
    }
}
