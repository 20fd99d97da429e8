//! Low-level control-channel codec (RFC 959 §4.2).
//!
//! Handles:
//! - Framing a chunked byte stream into CRLF-terminated lines
//! - Classifying a line into code / separator / message
//! - Assembling multi-line replies (`NNN-` … `NNN `)
//! - Masking credentials before a command is logged

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpResponse;

/// Longest reply line accepted before the framer gives up on it.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Stateful line framer.
///
/// Feed raw chunks via [`ReplyFramer::push`]; any trailing partial line is
/// carried over to the next call, so the terminator may be split across
/// chunk boundaries. A line longer than [`MAX_LINE_LEN`] yields one
/// `MalformedReply` and is skipped up to its terminator.
#[derive(Debug, Default)]
pub struct ReplyFramer {
    carry: Vec<u8>,
    discarding: bool,
}

impl ReplyFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed (terminator
    /// stripped, in arrival order).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FtpResult<String>> {
        self.carry.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.carry[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            let mut line = &self.carry[start..end];
            if let Some((&b'\r', rest)) = line.split_last() {
                line = rest;
            }
            if self.discarding {
                self.discarding = false;
            } else if line.len() > MAX_LINE_LEN {
                lines.push(Err(overlong_line()));
            } else {
                lines.push(Ok(String::from_utf8_lossy(line).into_owned()));
            }
            start = end + 1;
        }
        self.carry.drain(..start);

        if self.carry.len() > MAX_LINE_LEN {
            if !self.discarding {
                lines.push(Err(overlong_line()));
                self.discarding = true;
            }
            self.carry.clear();
        }
        lines
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

fn overlong_line() -> FtpError {
    FtpError::malformed_reply(format!("Reply line longer than {} bytes", MAX_LINE_LEN))
}

/// One classified reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,
    /// `true` for `NNN text` (or bare `NNN`), `false` for `NNN-text`.
    pub terminal: bool,
    pub message: String,
}

impl ReplyLine {
    /// Classify a complete line (terminator already stripped).
    pub fn parse(line: &str) -> FtpResult<Self> {
        let bytes = line.as_bytes();
        if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
            return Err(FtpError::malformed_reply(format!(
                "Reply does not start with a status code: '{}'",
                line
            )));
        }
        let code: u16 = line[..3]
            .parse()
            .map_err(|_| FtpError::malformed_reply(format!("Invalid reply code in: '{}'", line)))?;
        if !(100..600).contains(&code) {
            return Err(FtpError::malformed_reply(format!(
                "Reply code {} outside 100-599",
                code
            )));
        }

        let terminal = match bytes.get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(_) => {
                return Err(FtpError::malformed_reply(format!(
                    "Unexpected separator after code in: '{}'",
                    line
                )))
            }
        };
        let message = line.get(4..).unwrap_or("").to_string();

        Ok(Self {
            code,
            terminal,
            message,
        })
    }

    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }
}

/// Collects lines into complete replies.
///
/// Multi-line replies look like:
/// ```text
/// 211-Features:
///  SIZE
///  MDTM
/// 211 End
/// ```
/// Inner lines need not carry a code; only `NNN ` with the opening code
/// closes the reply.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    open: Option<(u16, Vec<String>)>,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns the reply it completed, if any.
    ///
    /// A malformed line outside a multi-line reply is an error; the
    /// assembler stays usable for the next line.
    pub fn push(&mut self, line: &str) -> FtpResult<Option<FtpResponse>> {
        if let Some((code, mut lines)) = self.open.take() {
            lines.push(line.to_string());
            return Ok(match ReplyLine::parse(line) {
                Ok(rl) if rl.terminal && rl.code == code => Some(FtpResponse {
                    code,
                    message: rl.message,
                    lines,
                }),
                _ => {
                    self.open = Some((code, lines));
                    None
                }
            });
        }

        let rl = ReplyLine::parse(line)?;
        if rl.terminal {
            Ok(Some(FtpResponse {
                code: rl.code,
                message: rl.message,
                lines: vec![line.to_string()],
            }))
        } else {
            self.open = Some((rl.code, vec![line.to_string()]));
            Ok(None)
        }
    }

    /// Whether a multi-line reply is still open.
    pub fn in_progress(&self) -> bool {
        self.open.is_some()
    }
}

/// Replace the argument of a `PASS` command so it never reaches a log.
pub fn mask_command(command: &str) -> String {
    let verb = command.split_whitespace().next().unwrap_or("");
    if verb.eq_ignore_ascii_case("PASS") {
        "PASS ********".to_string()
    } else {
        command.to_string()
    }
}
