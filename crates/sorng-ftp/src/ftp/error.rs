//! FTP-specific error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    /// Remote path the failing operation was working on.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FtpErrorKind {
    /// A control-channel line could not be framed or classified.
    MalformedReply,
    /// A command was issued while another one was still awaiting its reply.
    ProtocolViolation,
    /// No terminal reply arrived before the command deadline.
    CommandTimeout,
    /// Server returned a 4xx/5xx for a command.
    Rejected,
    /// I/O failure (or idle timeout) on the data channel.
    DataChannel,
    /// PASV reply did not carry a usable `(h1,h2,h3,h4,p1,p2)` tuple.
    MalformedPassiveReply,
    /// TCP / DNS resolution failure on the control connection.
    ConnectionFailed,
    /// Control connection closed or failed.
    Disconnected,
    /// Wrong username/password.
    AuthFailed,
    /// An I/O error on the local side (file read/write).
    IoError,
    /// Config / parameter validation error.
    InvalidConfig,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            path: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach path context unless a more specific path is already set.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn malformed_reply(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::MalformedReply, msg)
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolViolation, msg)
    }

    /// `command` must already be masked.
    pub fn command_timeout(command: &str) -> Self {
        Self::new(
            FtpErrorKind::CommandTimeout,
            format!("No reply to '{}' before the deadline", command),
        )
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannel, msg)
    }

    pub fn malformed_passive(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::MalformedPassiveReply, msg)
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IoError, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// Server-reported failure; keeps the original code and text.
    pub fn from_reply(code: u16, text: &str) -> Self {
        Self::new(FtpErrorKind::Rejected, text).with_code(code)
    }

    // ── Predicates ───────────────────────────────────────────────

    pub fn is_rejected(&self) -> bool {
        self.kind == FtpErrorKind::Rejected
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FtpErrorKind::CommandTimeout
    }

    /// Transient 4xx rejection (the caller may decide to retry).
    pub fn is_transient(&self) -> bool {
        matches!(self.code, Some(400..=499))
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)?,
            None => write!(f, "[FTP {:?}] {}", self.kind, self.message)?,
        }
        if let Some(ref path) = self.path {
            write!(f, " ({})", path)?;
        }
        Ok(())
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_error_keeps_code_and_text() {
        let err = FtpError::from_reply(550, "No such file");
        assert_eq!(err.kind, FtpErrorKind::Rejected);
        assert_eq!(err.code, Some(550));
        assert_eq!(err.message, "No such file");
        assert!(!err.is_transient());
    }

    #[test]
    fn display_includes_code_and_path() {
        let err = FtpError::from_reply(450, "Busy").with_path("/pub/a.txt");
        assert_eq!(err.to_string(), "[FTP Rejected 450] Busy (/pub/a.txt)");
        assert!(err.is_transient());
    }

    #[test]
    fn first_path_wins() {
        let err = FtpError::from_reply(550, "x")
            .with_path("/inner")
            .with_path("/outer");
        assert_eq!(err.path.as_deref(), Some("/inner"));
    }

    #[test]
    fn io_errors_map_to_local_io() {
        let err: FtpError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert_eq!(err.kind, FtpErrorKind::IoError);
        assert!(err.code.is_none());
    }
}
