//! # Command-Line Interface Module
//!
//! Argument parsing for the gateway demo binary (spec §11). The engine
//! itself takes no CLI arguments — `GatewayConfig` is loaded from a file —
//! so this surface stays deliberately thin compared to a front-end's real
//! provisioning UI.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Bifrost Gateway demo binary.
///
/// Boots a gateway core with a handful of demonstration devices registered
/// against each protocol adapter, drives a few reads and writes through the
/// full pool/breaker/scheduler stack, and prints per-device diagnostics.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to a JSON gateway configuration file. Falls back to
    /// `GatewayConfig::default()` when omitted.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Increase diagnostic log verbosity on stderr.
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: info
    ///  -vv: debug
    ///  -vvv: trace
    /// By default, only WARNING and ERROR messages are shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Silence user-facing informational output on stdout.
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Write detailed logs to this file instead of stderr.
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_satisfy_clap_invariants() {
        Args::command().debug_assert();
    }
}
