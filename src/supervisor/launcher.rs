//! Remote worker start
//!
//! The administrative channel (ssh or similar) is outside this crate; a
//! [`CommandLauncher`] just runs a configured local command line, detached,
//! and does not wait for it.

use std::process::Stdio;

use crate::error::LaunchError;

/// Something that can ask the worker host to start its workers
pub trait RemoteLauncher: Send + Sync {
    /// Issue the start request without waiting for the workers
    fn launch(&self) -> Result<(), LaunchError>;

    /// Human-readable form of the launch, used in manual-recovery logs
    fn describe(&self) -> String;
}

/// Launcher that spawns an external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line on whitespace, honoring double quotes
    ///
    /// Returns `None` for an empty line.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut words = split_command_line(line).into_iter();
        let program = words.next()?;
        Some(Self::new(program, words.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl RemoteLauncher for CommandLauncher {
    fn launch(&self) -> Result<(), LaunchError> {
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                command: self.describe(),
                reason: e.to_string(),
            })?;

        tracing::info!(command = %self.describe(), pid = ?child.id(), "Remote launch command sent");
        // Dropping the handle detaches the child; tokio reaps it in the background
        drop(child);
        Ok(())
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|word| {
                if word.contains(char::is_whitespace) {
                    format!("\"{}\"", word)
                } else {
                    word.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn split_command_line(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_word = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_word = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if has_word {
        words.push(current);
    }

    words
}
