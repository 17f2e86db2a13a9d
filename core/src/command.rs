use std::time::Duration;

use serde::Serialize;

use crate::timeout::TerminationReason;

/// Synthetic exit code reported when a command was terminated by the engine
/// rather than finishing on its own.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

const PREVIEW_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A piece of raw output forwarded to streaming subscribers as it arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}

/// Final outcome of one executed command. `termination` is `Some` when the
/// engine stopped the command (timeout, error pattern, cancellation); in that
/// case `exit_code` is [`TIMEOUT_EXIT_CODE`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub termination: Option<TerminationReason>,
}

impl CommandResult {
    pub fn timed_out(&self) -> bool {
        self.termination.is_some()
    }
}

/// Short single-line rendition of a command for logs and diagnostics.
pub(crate) fn preview_command(text: &str) -> String {
    let condensed = match shlex::split(text) {
        Some(tokens) => shlex::try_join(tokens.iter().map(String::as_str))
            .unwrap_or_else(|_| text.to_string()),
        None => text.to_string(),
    };
    clamp_chars(&condensed, PREVIEW_MAX_CHARS)
}

pub(crate) fn clamp_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max_chars).collect();
    format!("{prefix}…")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn preview_condenses_whitespace() {
        assert_eq!(
            preview_command("cargo   build\n  --release"),
            "cargo build --release"
        );
    }

    #[test]
    fn preview_clamps_long_commands() {
        let long = "x".repeat(200);
        let preview = preview_command(&long);
        assert_eq!(preview.chars().count(), PREVIEW_MAX_CHARS + 1);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn preview_keeps_unparsable_text() {
        assert_eq!(preview_command("echo 'unclosed"), "echo 'unclosed");
    }
}
