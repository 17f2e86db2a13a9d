use std::io;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Child;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    Posix,
    Windows,
}

/// Everything platform-specific about driving a shell: how to spawn it, how
/// to mark command completion, and how to stop it. Queueing and timeout logic
/// never branch on platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformStrategy {
    kind: ShellKind,
    program: String,
}

impl PlatformStrategy {
    pub fn native() -> Self {
        if cfg!(windows) {
            Self {
                kind: ShellKind::Windows,
                program: "cmd.exe".to_string(),
            }
        } else {
            Self {
                kind: ShellKind::Posix,
                program: "/bin/bash".to_string(),
            }
        }
    }

    /// A POSIX shell at a non-default path, e.g. `/bin/sh` or a test stub.
    pub fn posix(program: impl Into<String>) -> Self {
        Self {
            kind: ShellKind::Posix,
            program: program.into(),
        }
    }

    pub fn kind(&self) -> ShellKind {
        self.kind
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        match self.kind {
            // -s: read commands from stdin even if stdin is a pipe.
            ShellKind::Posix => {
                cmd.arg("-s");
            }
            ShellKind::Windows => {
                cmd.args(["/Q", "/K"]);
            }
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so stopping the shell also stops whatever it is
        // currently running.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Renders the command followed by the completion sentinels: the marker
    /// plus exit status on stdout, the bare marker on stderr. The marker is
    /// single-quoted so the shell never expands anything inside it.
    pub(crate) fn completion_block(&self, command: &str, marker: &str) -> String {
        match self.kind {
            ShellKind::Posix => format!(
                "{command}\nprintf '%s %s\\n' '{marker}' \"$?\"\nprintf '%s\\n' '{marker}' 1>&2\n"
            ),
            ShellKind::Windows => {
                // The redirection comes first: `echo {marker} 1>&2` would make
                // the space before `1>&2` part of echo's argument and the
                // marker line would arrive with a trailing blank.
                format!("{command}\r\necho {marker} %errorlevel%\r\n1>&2 echo {marker}\r\n")
            }
        }
    }

    /// Stops the shell process: graceful interrupt first, forceful kill after
    /// the escalation window. An error means the process would not die.
    pub(crate) async fn stop(&self, child: &mut Child, escalation: Duration) -> io::Result<()> {
        #[cfg(unix)]
        if self.kind == ShellKind::Posix {
            if let Some(pid) = child.id() {
                let group = -(pid as libc::pid_t);
                let _ = unsafe { libc::kill(group, libc::SIGINT) };
                if let Ok(waited) = tokio::time::timeout(escalation, child.wait()).await {
                    waited?;
                    return Ok(());
                }
                let _ = unsafe { libc::kill(group, libc::SIGKILL) };
            }
        }
        child.start_kill()?;
        match tokio::time::timeout(escalation, child.wait()).await {
            Ok(waited) => waited.map(|_| ()),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "shell process survived forceful kill",
            )),
        }
    }
}
