//! Line codec for the driver protocol.
//!
//! One command per line, whitespace-separated tokens, each token
//! percent-encoded. Responses use the same encoding and start with a status
//! marker.

use std::{fmt, str::FromStr};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::{ControlError, ControlResult, PROTOCOL_ERROR_MARKER, RESPONSE_OK_MARKER};

/// Characters left as-is when encoding a token.
const TOKEN_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

pub fn encode_token(token: &str) -> String {
    utf8_percent_encode(token, TOKEN_ENCODE_SET).to_string()
}

pub fn decode_token(token: &str) -> ControlResult<String> {
    percent_decode_str(token)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| ControlError::protocol(format!("token `{token}' is not valid UTF-8")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Capabilities,
    Open,
    Close,
    Revert,
    Reboot,
    PrintExecuteCommand,
    Copydown,
    Copyup,
    Shell,
    Quit,
}

impl Verb {
    pub const ALL: [Verb; 10] = [
        Verb::Capabilities,
        Verb::Open,
        Verb::Close,
        Verb::Revert,
        Verb::Reboot,
        Verb::PrintExecuteCommand,
        Verb::Copydown,
        Verb::Copyup,
        Verb::Shell,
        Verb::Quit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Capabilities => "capabilities",
            Verb::Open => "open",
            Verb::Close => "close",
            Verb::Revert => "revert",
            Verb::Reboot => "reboot",
            Verb::PrintExecuteCommand => "print-execute-command",
            Verb::Copydown => "copydown",
            Verb::Copyup => "copyup",
            Verb::Shell => "shell",
            Verb::Quit => "quit",
        }
    }

    pub fn required_args(&self) -> usize {
        match self {
            Verb::Copydown | Verb::Copyup => 2,
            Verb::Shell => 1,
            Verb::Capabilities
            | Verb::Open
            | Verb::Close
            | Verb::Revert
            | Verb::Reboot
            | Verb::PrintExecuteCommand
            | Verb::Quit => 0,
        }
    }

    /// Extra arguments accepted after the required ones; `None` is unbounded.
    pub fn optional_args(&self) -> Option<usize> {
        match self {
            Verb::Shell => None,
            Verb::Capabilities
            | Verb::Open
            | Verb::Close
            | Verb::Revert
            | Verb::Reboot
            | Verb::PrintExecuteCommand
            | Verb::Copydown
            | Verb::Copyup
            | Verb::Quit => Some(0),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = ControlError;

    /// Underscores are accepted in place of hyphens.
    fn from_str(value: &str) -> ControlResult<Self> {
        let normalized = value.replace('_', "-");
        Verb::ALL
            .into_iter()
            .find(|verb| verb.as_str() == normalized)
            .ok_or_else(|| ControlError::protocol(format!("unknown command `{value}'")))
    }
}

/// One decoded driver command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub verb: Verb,
    /// Tokens as received, verb included.
    pub raw: Vec<String>,
    /// Percent-decoded tokens, verb included.
    pub args: Vec<String>,
}

impl CommandLine {
    /// Decoded arguments after the verb.
    pub fn operands(&self) -> &[String] {
        &self.args[1..]
    }
}

pub fn parse_command_line(line: &str) -> ControlResult<CommandLine> {
    let raw = line
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let args = raw
        .iter()
        .map(|token| decode_token(token))
        .collect::<ControlResult<Vec<_>>>()?;
    let Some(first) = args.first() else {
        return Err(ControlError::protocol("empty commands are not permitted"));
    };
    let verb = first.parse::<Verb>().map_err(|_| {
        ControlError::protocol(format!("unknown command `{}'", raw[0]))
    })?;
    check_arg_count(verb, &raw, args.len() - 1)?;
    Ok(CommandLine { verb, raw, args })
}

fn check_arg_count(verb: Verb, raw: &[String], given: usize) -> ControlResult<()> {
    if given < verb.required_args() {
        return Err(ControlError::protocol(format!(
            "too few arguments to command `{}'",
            raw[0]
        )));
    }
    if let Some(optional) = verb.optional_args() {
        if given > verb.required_args() + optional {
            return Err(ControlError::protocol(format!(
                "too many arguments to command `{}'",
                raw[0]
            )));
        }
    }
    Ok(())
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(Vec<String>),
    Failed {
        marker: String,
        diagnostics: Vec<String>,
    },
    ProtocolError(String),
}

impl Response {
    /// Encoded line without the trailing newline.
    pub fn to_line(&self) -> String {
        let tokens: Vec<&str> = match self {
            Self::Ok(results) => std::iter::once(RESPONSE_OK_MARKER)
                .chain(results.iter().map(String::as_str))
                .collect(),
            Self::Failed {
                marker,
                diagnostics,
            } => std::iter::once(marker.as_str())
                .chain(diagnostics.iter().map(String::as_str))
                .collect(),
            Self::ProtocolError(message) => vec![PROTOCOL_ERROR_MARKER, message.as_str()],
        };
        tokens
            .into_iter()
            .map(encode_token)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}
