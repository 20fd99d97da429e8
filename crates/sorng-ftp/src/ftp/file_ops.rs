//! Transfer orchestration — STOR, APPE, RETR and LIST over a PASV data channel.
//!
//! A transfer joins three events: the 1xx notice on the control channel,
//! the data channel reaching EOF, and the terminal reply. Replies may come
//! in any order relative to the data, so the terminal reply is awaited
//! concurrently with the byte pump. Once the data channel has closed the
//! configured [`CompletionPolicy`] decides how long the reply may lag.

use crate::ftp::client::FtpClient;
use crate::ftp::connection::{ControlChannel, TransferLease};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::transfer::{negotiate_passive, DataConnector, DataStream};
use crate::ftp::types::*;
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// Chunk size for streaming transfers (64 KiB).
const DEFAULT_CHUNK: usize = 65_536;

/// Which transfer command to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Store,
    Append,
    Retrieve,
    List,
}

impl TransferKind {
    pub fn verb(self) -> &'static str {
        match self {
            TransferKind::Store => "STOR",
            TransferKind::Append => "APPE",
            TransferKind::Retrieve => "RETR",
            TransferKind::List => "LIST",
        }
    }

    pub fn direction(self) -> TransferDirection {
        match self {
            TransferKind::Store | TransferKind::Append => TransferDirection::Upload,
            TransferKind::Retrieve | TransferKind::List => TransferDirection::Download,
        }
    }

    pub fn command(self, argument: Option<&str>) -> String {
        match argument {
            Some(arg) if !arg.is_empty() => format!("{} {}", self.verb(), arg),
            _ => self.verb().to_string(),
        }
    }
}

/// Per-transfer state, logged at trace level as the transfer advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Idle,
    PassiveNegotiated,
    DataChannelOpen,
    CommandIssued,
    DataInFlight,
    DataChannelClosed,
    ControlReplyReceived,
    SecondaryTimeout,
    Resolved,
    Failed,
}

/// Local side of a transfer.
pub enum TransferIo<'a> {
    /// Bytes to send (STOR / APPE).
    Upload(&'a mut (dyn AsyncRead + Send + Unpin)),
    /// Where received bytes go (RETR / LIST).
    Download(&'a mut (dyn AsyncWrite + Send + Unpin)),
}

impl TransferIo<'_> {
    fn direction(&self) -> TransferDirection {
        match self {
            TransferIo::Upload(_) => TransferDirection::Upload,
            TransferIo::Download(_) => TransferDirection::Download,
        }
    }
}

/// Deadlines and completion policy for one transfer.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Deadline for each control reply (PASV, the 1xx notice, and the
    /// terminal reply under [`CompletionPolicy::Strict`]).
    pub command_timeout: Duration,
    /// Longest the data channel may sit idle.
    pub data_timeout: Duration,
    pub completion: CompletionPolicy,
    /// Connect here instead of the PASV-advertised host.
    pub nat_host: Option<String>,
}

impl TransferSettings {
    pub fn from_config(config: &FtpConnectionConfig) -> Self {
        Self {
            command_timeout: config.command_timeout(),
            data_timeout: config.data_timeout(),
            completion: config.completion,
            nat_host: config
                .passive_nat_workaround
                .then(|| config.host.clone()),
        }
    }

    /// The secondary deadline: how long an orphaned reply is drained after
    /// a data-channel failure. Under `Bounded` it is also the completion grace.
    fn secondary_deadline(&self) -> Duration {
        match self.completion {
            CompletionPolicy::Strict => Duration::from_millis(DEFAULT_GRACE_MS),
            CompletionPolicy::Bounded { grace_ms } => Duration::from_millis(grace_ms),
        }
    }
}

/// Result of a finished transfer.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub bytes: u64,
    /// The terminal reply; `None` when the bounded grace period elapsed
    /// after the data channel closed.
    pub reply: Option<FtpResponse>,
}

struct PhaseLog<'a> {
    session: &'a str,
    command: &'a str,
    phase: TransferPhase,
}

impl PhaseLog<'_> {
    fn advance(&mut self, next: TransferPhase) {
        log::trace!(
            "[ftp:{}] {} {:?} -> {:?}",
            self.session,
            self.command,
            self.phase,
            next
        );
        self.phase = next;
    }
}

/// Drive one complete transfer cycle on `control`.
///
/// The channel is leased for the whole cycle, so other callers get
/// `ProtocolViolation` until it returns. Failure replies surface with their
/// server code and text and the `argument` as path context. The control
/// channel is free for the next command once this returns, whatever the
/// outcome.
pub async fn run_transfer(
    control: &ControlChannel,
    connector: &dyn DataConnector,
    settings: &TransferSettings,
    kind: TransferKind,
    argument: Option<&str>,
    io: TransferIo<'_>,
) -> FtpResult<TransferOutcome> {
    if io.direction() != kind.direction() {
        return Err(FtpError::invalid_config(format!(
            "{} needs {:?} I/O",
            kind.verb(),
            kind.direction()
        )));
    }

    let lease = control.begin_transfer()?;
    let command = kind.command(argument);
    let mut phase = PhaseLog {
        session: control.session(),
        command: &command,
        phase: TransferPhase::Idle,
    };

    let result = drive(&lease, connector, settings, &command, io, &mut phase).await;
    drop(lease);
    match &result {
        Ok(outcome) => {
            phase.advance(TransferPhase::Resolved);
            log::debug!(
                "[ftp:{}] {} finished, {} bytes",
                control.session(),
                command,
                outcome.bytes
            );
        }
        Err(e) => {
            phase.advance(TransferPhase::Failed);
            log::debug!("[ftp:{}] {} failed: {}", control.session(), command, e);
        }
    }

    result.map_err(|e| match argument {
        Some(path) => e.with_path(path),
        None => e,
    })
}

async fn drive(
    lease: &TransferLease<'_>,
    connector: &dyn DataConnector,
    settings: &TransferSettings,
    command: &str,
    io: TransferIo<'_>,
    phase: &mut PhaseLog<'_>,
) -> FtpResult<TransferOutcome> {
    let endpoint = negotiate_passive(lease, settings.nat_host.as_deref()).await?;
    phase.advance(TransferPhase::PassiveNegotiated);

    let mut data = connector.connect(&endpoint).await?;
    phase.advance(TransferPhase::DataChannelOpen);

    let mut pending = lease.issue(command, true).await?;
    phase.advance(TransferPhase::CommandIssued);

    // Some servers skip the 1xx notice and send 226 straight away; the
    // data still has to be read in that case.
    let mut reply = pending.opening().await?;
    if reply.is_some() {
        phase.advance(TransferPhase::ControlReplyReceived);
    }
    phase.advance(TransferPhase::DataInFlight);

    let pumped = {
        let pump = pump(&mut data, io, settings.data_timeout);
        tokio::pin!(pump);
        loop {
            tokio::select! {
                res = &mut pump => break res,
                res = pending.reply(), if !pending.is_settled() => {
                    // An error reply mid-transfer means the server aborted it.
                    reply = Some(res?);
                    phase.advance(TransferPhase::ControlReplyReceived);
                }
            }
        }
    };
    drop(data);

    let bytes = match pumped {
        Ok(bytes) => bytes,
        Err(e) => {
            if !pending.is_settled() {
                if let Some(reply) = pending.drain(settings.secondary_deadline()).await {
                    log::debug!(
                        "[ftp:{}] '{}' data channel failed; server replied {:?}",
                        lease.channel().session(),
                        command,
                        reply.map(|r| r.code).map_err(|err| err.to_string())
                    );
                }
            }
            return Err(e);
        }
    };
    phase.advance(TransferPhase::DataChannelClosed);

    if reply.is_some() {
        return Ok(TransferOutcome { bytes, reply });
    }

    let reply = match settings.completion {
        CompletionPolicy::Strict => Some(pending.wait_within(settings.command_timeout).await?),
        CompletionPolicy::Bounded { grace_ms } => {
            match timeout(Duration::from_millis(grace_ms), pending.reply()).await {
                Ok(res) => Some(res?),
                Err(_) => {
                    pending.abandon();
                    phase.advance(TransferPhase::SecondaryTimeout);
                    log::warn!(
                        "[ftp:{}] no completion reply for '{}' within {} ms of the data channel closing; assuming success",
                        lease.channel().session(),
                        command,
                        grace_ms
                    );
                    None
                }
            }
        }
    };
    if reply.is_some() {
        phase.advance(TransferPhase::ControlReplyReceived);
    }

    Ok(TransferOutcome { bytes, reply })
}

/// Shuttle bytes between the data channel and the local side.
async fn pump(data: &mut DataStream, io: TransferIo<'_>, idle: Duration) -> FtpResult<u64> {
    let mut buf = vec![0u8; DEFAULT_CHUNK];
    let mut total = 0u64;

    match io {
        TransferIo::Download(sink) => loop {
            let n = timeout(idle, data.read(&mut buf))
                .await
                .map_err(|_| idle_error(idle))?
                .map_err(|e| FtpError::data_channel(format!("Data channel read: {}", e)))?;
            if n == 0 {
                sink.flush().await?;
                return Ok(total);
            }
            sink.write_all(&buf[..n]).await?;
            total += n as u64;
        },
        TransferIo::Upload(source) => {
            loop {
                let n = source.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                timeout(idle, data.write_all(&buf[..n]))
                    .await
                    .map_err(|_| idle_error(idle))?
                    .map_err(|e| FtpError::data_channel(format!("Data channel write: {}", e)))?;
                total += n as u64;
            }
            timeout(idle, data.shutdown())
                .await
                .map_err(|_| idle_error(idle))?
                .map_err(|e| FtpError::data_channel(format!("Data channel close: {}", e)))?;
            Ok(total)
        }
    }
}

fn idle_error(idle: Duration) -> FtpError {
    FtpError::data_channel(format!("Data channel idle for {:?}", idle))
}

// ─── Session-level transfers ─────────────────────────────────────────

impl FtpClient {
    async fn transfer(
        &mut self,
        kind: TransferKind,
        argument: Option<&str>,
        io: TransferIo<'_>,
    ) -> FtpResult<TransferOutcome> {
        let settings = TransferSettings::from_config(&self.config);
        let outcome = run_transfer(
            &self.control,
            self.connector.as_ref(),
            &settings,
            kind,
            argument,
            io,
        )
        .await?;

        match kind.direction() {
            TransferDirection::Upload => self.info.bytes_uploaded += outcome.bytes,
            TransferDirection::Download => self.info.bytes_downloaded += outcome.bytes,
        }
        self.touch();
        Ok(outcome)
    }

    /// Upload everything `source` yields to `remote_path` (STOR).
    pub async fn store<R>(&mut self, remote_path: &str, source: &mut R) -> FtpResult<u64>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.transfer(TransferKind::Store, Some(remote_path), TransferIo::Upload(source))
            .await
            .map(|o| o.bytes)
    }

    /// Append to `remote_path` (APPE).
    pub async fn append<R>(&mut self, remote_path: &str, source: &mut R) -> FtpResult<u64>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.transfer(TransferKind::Append, Some(remote_path), TransferIo::Upload(source))
            .await
            .map(|o| o.bytes)
    }

    /// Stream `remote_path` into `sink` (RETR).
    pub async fn retrieve_to<W>(&mut self, remote_path: &str, sink: &mut W) -> FtpResult<u64>
    where
        W: AsyncWrite + Send + Unpin,
    {
        self.transfer(TransferKind::Retrieve, Some(remote_path), TransferIo::Download(sink))
            .await
            .map(|o| o.bytes)
    }

    /// Download `remote_path` into memory.
    pub async fn retrieve(&mut self, remote_path: &str) -> FtpResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.retrieve_to(remote_path, &mut buf).await?;
        Ok(buf)
    }

    /// Raw `LIST` output for `path` (or the working directory).
    pub async fn list_raw(&mut self, path: Option<&str>) -> FtpResult<String> {
        let mut buf = Vec::new();
        self.transfer(TransferKind::List, path, TransferIo::Download(&mut buf))
            .await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Upload a local file.
    pub async fn upload_file(&mut self, local_path: &str, remote_path: &str) -> FtpResult<u64> {
        let mut file = fs::File::open(local_path)
            .await
            .map_err(|e| FtpError::io_error(format!("Open {}: {}", local_path, e)))?;
        self.store(remote_path, &mut file).await
    }

    /// Download to a local file, creating parent directories as needed.
    pub async fn download_file(&mut self, remote_path: &str, local_path: &str) -> FtpResult<u64> {
        if let Some(parent) = Path::new(local_path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = fs::File::create(local_path)
            .await
            .map_err(|e| FtpError::io_error(format!("Create {}: {}", local_path, e)))?;
        let bytes = self.retrieve_to(remote_path, &mut file).await?;
        file.flush().await?;
        Ok(bytes)
    }
}
