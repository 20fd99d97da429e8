//! # sorng-ftp — FTP protocol engine
//!
//! Implements the RFC 959 control/data-channel model in passive mode:
//! reply framing, command/reply correlation, PASV data channels and the
//! join between a data channel closing and the control channel's
//! completion reply.
//!
//! Architecture:
//! - `types` — config, replies, listing entries, session info
//! - `error` — FTP-specific error type
//! - `protocol` — reply framer, line classifier, multi-line assembler
//! - `connection` — control channel: read loop + single-slot correlator
//! - `transfer` — PASV negotiation and data-channel connectors
//! - `file_ops` — transfer orchestrator (store/append/retrieve/list)
//! - `client` — stateful session (login, thin command wrappers)
//! - `directory` — directory wrappers, ensure-exists, subtree removal
//! - `parser` — Unix/Windows LIST parsing, MDTM timestamps

pub mod types;
pub mod error;
pub mod protocol;
pub mod connection;
pub mod transfer;
pub mod file_ops;
pub mod client;
pub mod directory;
pub mod parser;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use client::FtpClient;
pub use connection::{ControlChannel, ControlEvent, PendingReply, TransferLease};
pub use file_ops::{
    run_transfer, TransferIo, TransferKind, TransferOutcome, TransferPhase, TransferSettings,
};
pub use transfer::{DataConnector, DataStream, TcpDataConnector};
