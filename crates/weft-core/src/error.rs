//! Status-coded errors that can cross the wire.
//!
//! Every failure in the fabric is carried as an [`Error`]: a message, an
//! HTTP-ish status code, and the call sites it passed through. Errors
//! travel between connectors as JSON in the body of an `Op-Code: Err`
//! response and are re-materialized on the caller with the status
//! preserved.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::Location;

/// A traced, status-coded error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Error {
    /// Human-readable description.
    pub message: String,

    /// HTTP-ish status code. 500 unless a constructor says otherwise.
    pub status_code: u16,

    /// Call sites this error passed through, innermost first.
    /// Entries are `file:line` strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// New internal error (status 500) recorded at the caller's location.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self::newc(500, message)
    }

    /// New error with an explicit status code.
    #[track_caller]
    pub fn newc(status_code: u16, message: impl Into<String>) -> Self {
        let loc = Location::caller();
        Self {
            message: message.into(),
            status_code,
            stack: vec![format!("{}:{}", loc.file(), loc.line())],
        }
    }

    /// Append the caller's location to the stack.
    #[track_caller]
    pub fn trace(mut self) -> Self {
        let loc = Location::caller();
        self.stack.push(format!("{}:{}", loc.file(), loc.line()));
        self
    }

    /// Prefix the message with additional context.
    #[track_caller]
    pub fn context(mut self, note: impl fmt::Display) -> Self {
        self.message = format!("{}: {}", note, self.message);
        self.trace()
    }

    // ── Canonical failures ───────────────────────────────────────────────

    /// Request deadline or time budget elapsed (408).
    #[track_caller]
    pub fn timeout() -> Self {
        Self::newc(408, "timed out")
    }

    /// No broker link and no local subscriber (503).
    #[track_caller]
    pub fn no_transport() -> Self {
        Self::newc(503, "no transport")
    }

    /// Call-depth cap exceeded, likely a request cycle (508).
    #[track_caller]
    pub fn cycle(depth: u32) -> Self {
        Self::newc(508, format!("call depth {depth} exceeds cap"))
    }

    /// Actor-claims predicate rejected the caller (403).
    #[track_caller]
    pub fn forbidden() -> Self {
        Self::newc(403, "forbidden by actor predicate")
    }

    /// Invalid input from the caller (400).
    #[track_caller]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::newc(400, message)
    }

    /// Serialize for the body of an `Op-Code: Err` response.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| self.message.clone().into_bytes())
    }

    /// Re-materialize an error that crossed the wire. Falls back to
    /// treating the body as a plain message when it is not our JSON.
    pub fn from_json(body: &[u8], fallback_status: u16) -> Self {
        match serde_json::from_slice::<Error>(body) {
            Ok(e) => e,
            Err(_) => Self {
                message: String::from_utf8_lossy(body).into_owned(),
                status_code: fallback_status,
                stack: Vec::new(),
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::bad_request(e.to_string())
    }
}
