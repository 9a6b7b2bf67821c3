//! snail - task lists with optimistic sync
//!
//! Tasks, projects and tags in a local SQLite database, with manual
//! ordering, tag scopes, activity history, backups and check-in streaks.

use clap::Parser;
use snail::cli::Cli;
use snail::output::{emit_error, infer_command_name_from_args};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Longest `RUST_LOG` value we try to parse.
const MAX_FILTER_LEN: usize = 4096;

/// `RUST_LOG` directives, or `off` when unset, empty, oversized or invalid.
fn log_filter(raw: Option<&str>) -> EnvFilter {
    raw.map(str::trim)
        .filter(|raw| !raw.is_empty() && raw.len() <= MAX_FILTER_LEN)
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new("off"))
}

/// Diagnostics go to stderr; stdout carries only command output.
fn init_logging() {
    let raw = std::env::var("RUST_LOG").ok();
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(log_filter(raw.as_deref()))
        .init();
}

fn main() {
    init_logging();

    let command = infer_command_name_from_args();
    let cli = Cli::parse();
    let json = cli.json;
    if let Err(err) = cli.run() {
        let _ = emit_error(&command, &err, json);
        std::process::exit(err.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unusable_filters_turn_logging_off() {
        let off = EnvFilter::new("off").to_string();
        for raw in [None, Some("  "), Some("snail=loud")] {
            assert_eq!(log_filter(raw).to_string(), off, "{raw:?}");
        }
        let huge = "snail=debug,".repeat(MAX_FILTER_LEN);
        assert_eq!(log_filter(Some(&huge)).to_string(), off);
    }

    #[test]
    fn valid_filters_pass_through() {
        let filter = log_filter(Some(" snail=debug "));
        assert_eq!(filter.to_string(), EnvFilter::new("snail=debug").to_string());
    }
}
