//! Control-channel envelope
//!
//! One request and one reply per TCP connection:
//!
//! ```text
//! client -> {"cmd":"set_prompt","text":"a person, a car"}
//! server -> OK | UNKNOWN | <error text>
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Raw envelope as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Commands understood by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Replace the active detection labels with a comma-separated list
    SetPrompt { text: Option<String> },
    /// Any command name the worker does not implement
    Unrecognized { name: String },
}

impl Command {
    /// Wire name of the command
    pub fn name(&self) -> &str {
        match self {
            Command::SetPrompt { .. } => "set_prompt",
            Command::Unrecognized { name } => name,
        }
    }

    /// Build a `set_prompt` command
    pub fn set_prompt(text: impl Into<String>) -> Self {
        Command::SetPrompt {
            text: Some(text.into()),
        }
    }

    /// Parse one request body
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: CommandEnvelope = serde_json::from_slice(data)
            .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;
        Ok(envelope.into())
    }

    /// Serialize as a request body
    pub fn to_bytes(&self) -> Vec<u8> {
        let envelope = CommandEnvelope::from(self.clone());
        // Two string fields cannot fail to serialize
        serde_json::to_vec(&envelope).unwrap_or_default()
    }
}

impl From<CommandEnvelope> for Command {
    fn from(envelope: CommandEnvelope) -> Self {
        match envelope.cmd.as_str() {
            "set_prompt" => Command::SetPrompt {
                text: envelope.text,
            },
            _ => Command::Unrecognized { name: envelope.cmd },
        }
    }
}

impl From<Command> for CommandEnvelope {
    fn from(command: Command) -> Self {
        match command {
            Command::SetPrompt { text } => CommandEnvelope {
                cmd: "set_prompt".into(),
                text,
            },
            Command::Unrecognized { name } => CommandEnvelope {
                cmd: name,
                text: None,
            },
        }
    }
}

/// Terminal reply to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Ok,
    Unknown,
    Error(String),
}

impl CommandReply {
    /// Wire bytes of the reply
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            CommandReply::Ok => b"OK",
            CommandReply::Unknown => b"UNKNOWN",
            CommandReply::Error(text) => text.as_bytes(),
        }
    }

    /// Interpret a raw reply
    ///
    /// Leading/trailing whitespace is ignored and `OK` is matched
    /// case-insensitively, as older workers may append a newline.
    pub fn from_bytes(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("OK") {
            CommandReply::Ok
        } else if trimmed == "UNKNOWN" {
            CommandReply::Unknown
        } else {
            CommandReply::Error(trimmed.to_string())
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, CommandReply::Ok)
    }
}

impl std::fmt::Display for CommandReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_prompt() {
        let cmd = Command::parse(br#"{"cmd":"set_prompt","text":"a box, a person"}"#).unwrap();
        assert_eq!(cmd, Command::set_prompt("a box, a person"));
        assert_eq!(cmd.name(), "set_prompt");
    }

    #[test]
    fn test_parse_unrecognized() {
        let cmd = Command::parse(br#"{"cmd":"bogus"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Unrecognized {
                name: "bogus".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects_non_envelope() {
        assert!(matches!(
            Command::parse(b"not json"),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            Command::parse(br#"{"text":"missing cmd"}"#),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            Command::parse(br#"{"cmd":42}"#),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_request_bytes() {
        let body = Command::set_prompt("a cup").to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["cmd"], "set_prompt");
        assert_eq!(value["text"], "a cup");
    }

    #[test]
    fn test_reply_wire_format() {
        assert_eq!(CommandReply::Ok.as_bytes(), b"OK");
        assert_eq!(CommandReply::Unknown.as_bytes(), b"UNKNOWN");
        assert_eq!(CommandReply::from_bytes(b"ok\n"), CommandReply::Ok);
        assert_eq!(CommandReply::from_bytes(b"UNKNOWN"), CommandReply::Unknown);
        assert_eq!(
            CommandReply::from_bytes(b"expected value at line 1"),
            CommandReply::Error("expected value at line 1".into())
        );
    }
}
