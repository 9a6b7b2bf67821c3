//! Shared output formatting for snail CLI commands.

use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

pub const SCHEMA_VERSION: &str = "snail.v1";

#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub json: bool,
    pub quiet: bool,
}

#[derive(Debug, Clone)]
pub struct HumanOutput {
    header: String,
    summary: Vec<(String, String)>,
    details: Vec<String>,
    warnings: Vec<String>,
    next_steps: Vec<String>,
}

impl HumanOutput {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            summary: Vec::new(),
            details: Vec::new(),
            warnings: Vec::new(),
            next_steps: Vec::new(),
        }
    }

    pub fn push_summary(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.summary.push((key.into(), value.into()));
    }

    pub fn push_detail(&mut self, value: impl Into<String>) {
        self.details.push(value.into());
    }

    pub fn push_warning(&mut self, value: impl Into<String>) {
        self.warnings.push(value.into());
    }

    pub fn push_next_step(&mut self, value: impl Into<String>) {
        self.next_steps.push(value.into());
    }
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Outcome<'a, T: Serialize> {
    Success { data: &'a T },
    Error { error: ErrorBody },
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    code: i32,
    kind: ErrorKind,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

/// Machine-readable result of one command.
#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    schema_version: &'static str,
    command: &'a str,
    #[serde(flatten)]
    outcome: Outcome<'a, T>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    warnings: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    next_steps: &'a [String],
}

fn print_envelope<T: Serialize>(envelope: &Envelope<'_, T>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(envelope)?);
    Ok(())
}

pub fn emit_success<T: Serialize>(
    options: OutputOptions,
    command: &str,
    data: &T,
    human: Option<&HumanOutput>,
) -> Result<()> {
    if options.json {
        return print_envelope(&Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            outcome: Outcome::Success { data },
            warnings: human.map(|h| h.warnings.as_slice()).unwrap_or_default(),
            next_steps: human.map(|h| h.next_steps.as_slice()).unwrap_or_default(),
        });
    }
    match human {
        Some(human) if !options.quiet => println!("{}", format_human(human)),
        _ => {}
    }
    Ok(())
}

pub fn emit_error(command: &str, err: &Error, json: bool) -> Result<()> {
    let next_steps = error_next_steps(err);
    if json {
        return print_envelope::<()>(&Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            outcome: Outcome::Error {
                error: ErrorBody {
                    message: err.to_string(),
                    code: err.exit_code(),
                    kind: err.kind(),
                    retryable: err.is_retryable(),
                    details: err.details(),
                },
            },
            warnings: &[],
            next_steps: &next_steps,
        });
    }

    eprintln!("error: {err}");
    if let Some(hint) = next_steps.first() {
        eprintln!("hint: {hint}");
    }
    Ok(())
}

/// Header, an aligned summary block, then the non-empty sections.
pub fn format_human(output: &HumanOutput) -> String {
    let mut lines = vec![output.header.clone()];

    if !output.summary.is_empty() {
        let width = output
            .summary
            .iter()
            .map(|(key, _)| key.len())
            .max()
            .unwrap_or(0);
        lines.push(String::new());
        for (key, value) in &output.summary {
            if value.is_empty() {
                lines.push(format!("  {key}"));
            } else {
                lines.push(format!("  {key:<width$}  {value}"));
            }
        }
    }

    for (title, items) in [
        ("Details", &output.details),
        ("Warnings", &output.warnings),
        ("Next steps", &output.next_steps),
    ] {
        if items.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("{title}:"));
        lines.extend(items.iter().map(|item| format!("  {item}")));
    }

    lines.join("\n")
}

/// Best-effort command name for error envelopes, read before clap parses.
pub fn infer_command_name_from_args() -> String {
    infer_command_name(std::env::args().skip(1))
}

fn infer_command_name(args: impl IntoIterator<Item = String>) -> String {
    let mut args = args.into_iter();
    let mut words = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--config" {
            args.next();
            continue;
        }
        if arg.starts_with('-') {
            continue;
        }
        let nested = words.is_empty()
            && matches!(arg.as_str(), "task" | "tag" | "project" | "backup");
        words.push(arg);
        if !nested {
            break;
        }
    }

    if words.is_empty() {
        "snail".to_string()
    } else {
        words.join(" ")
    }
}

fn error_next_steps(err: &Error) -> Vec<String> {
    match err {
        Error::InvalidConfig(_) => vec!["fix config.toml then retry".to_string()],
        Error::InvalidBackup(_) => {
            vec!["re-export the backup with `snail backup export`".to_string()]
        }
        Error::LockFailed(_) => vec!["retry once the other snail process exits".to_string()],
        Error::SortNotSaved(_) => vec!["snail task list".to_string()],
        _ if err.is_retryable() => vec!["retry the command".to_string()],
        _ => Vec::new(),
    }
}
