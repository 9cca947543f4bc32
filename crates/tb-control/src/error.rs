use thiserror::Error;

pub const EXIT_QUIT: i32 = 0;
pub const EXIT_FAILURE: i32 = 12;
pub const EXIT_INTERNAL: i32 = 16;

pub const RESPONSE_OK_MARKER: &str = "ok";
pub const PROTOCOL_ERROR_MARKER: &str = "error";
pub const TIMEOUT_MARKER: &str = "timeout";

/// Error kinds surfaced by engine operations.
///
/// `Protocol` and `FailedCommand` are answered on the response stream and
/// leave the session usable. `Quit`, `Interrupted` and `Internal` unwind to
/// the dispatch loop, which tears the testbed down and exits.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0}")]
    Protocol(String),
    #[error("{marker} {}", .diagnostics.join(" "))]
    FailedCommand {
        marker: String,
        diagnostics: Vec<String>,
    },
    #[error("{message}")]
    Quit { code: i32, message: String },
    #[error("operation timed out")]
    Timeout,
    #[error("interrupted by signal {signal}")]
    Interrupted { signal: i32 },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Structured failure that ends the session with [`EXIT_FAILURE`].
    pub fn fatal(message: impl AsRef<str>) -> Self {
        Self::Quit {
            code: EXIT_FAILURE,
            message: format!("failure: {}", message.as_ref()),
        }
    }

    pub fn quit() -> Self {
        Self::Quit {
            code: EXIT_QUIT,
            message: String::new(),
        }
    }

    pub fn timed_out_command() -> Self {
        Self::FailedCommand {
            marker: TIMEOUT_MARKER.to_string(),
            diagnostics: Vec::new(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Quit { code, .. } => *code,
            Self::Internal(_) => EXIT_INTERNAL,
            _ => EXIT_FAILURE,
        }
    }
}

impl From<std::io::Error> for ControlError {
    fn from(error: std::io::Error) -> Self {
        Self::Internal(anyhow::Error::new(error))
    }
}
