// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `convergent`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "convergent",
    version,
    about = "Converge a stack of interdependent resources to a declarative template.",
    long_about = None
)]
pub struct CliArgs {
    /// Template to create the stack from (TOML).
    #[arg(long, value_name = "PATH")]
    pub template: String,

    /// Environment file with parameters and type aliases (TOML).
    #[arg(long, value_name = "PATH")]
    pub environment: Option<String>,

    /// Engine config file (TOML).
    ///
    /// Default: `Convergent.toml` in the current working directory, if present.
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Stack name.
    #[arg(long, value_name = "NAME", default_value = "convergent")]
    pub stack: String,

    /// After the create completes, update the stack to this template.
    #[arg(long, value_name = "PATH")]
    pub update_template: Option<String>,

    /// Delete the stack at the end.
    #[arg(long)]
    pub delete: bool,

    /// Roll back to the last known-good template if an action fails.
    #[arg(long)]
    pub rollback: bool,

    /// Parse + validate, print the graph and diff, but don't converge.
    #[arg(long)]
    pub dry_run: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CONVERGENT_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
