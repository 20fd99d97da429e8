//! Control connection — read loop plus single-flight command correlation.
//!
//! FTP replies carry no request id, so they are matched to commands purely
//! by order. The channel therefore keeps exactly one "awaited reply" slot:
//! `issue()` fills it (or fails with `ProtocolViolation` when it is taken),
//! the read loop resolves it exactly once through a oneshot, and a
//! `PendingReply` that times out or is dropped empties it again. Replies that
//! arrive while the slot is empty are logged and dropped.
//!
//! A transfer spans several commands (PASV, then the transfer command), so it
//! holds a [`TransferLease`] for its whole run; while the lease is out, only
//! commands issued through it reach the slot.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::{mask_command, ReplyAssembler, ReplyFramer};
use crate::ftp::types::{FtpConnectionConfig, FtpResponse};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const READ_CHUNK: usize = 4096;
const EVENT_CAPACITY: usize = 256;
const GREETING: &str = "<greeting>";

/// Diagnostic events emitted by a control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// A command written to the server (`PASS` argument masked).
    Sent(String),
    /// A raw reply line received from the server.
    Received(String),
    /// The control connection is gone.
    Closed(String),
}

type Resolution = FtpResult<FtpResponse>;

/// The command currently awaiting its terminal reply.
struct PendingCommand {
    seq: u64,
    command: String,
    tolerant: bool,
    opening: Option<oneshot::Sender<FtpResponse>>,
    resolve: oneshot::Sender<Resolution>,
}

/// Single-slot register shared between the channel and its read loop.
#[derive(Default)]
struct ReplySlot {
    pending: StdMutex<Option<PendingCommand>>,
    closed: AtomicBool,
    leased: AtomicBool,
}

impl ReplySlot {
    fn lock(&self) -> MutexGuard<'_, Option<PendingCommand>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, pending: PendingCommand, via_lease: bool) -> FtpResult<()> {
        let mut guard = self.lock();
        if self.is_closed() {
            return Err(FtpError::disconnected("Control connection is closed"));
        }
        if !via_lease && self.leased.load(Ordering::SeqCst) {
            return Err(FtpError::protocol_violation(format!(
                "Cannot send '{}' while a transfer is running",
                pending.command
            )));
        }
        if let Some(current) = guard.as_ref() {
            return Err(FtpError::protocol_violation(format!(
                "Cannot send '{}' while '{}' is still awaiting its reply",
                pending.command, current.command
            )));
        }
        *guard = Some(pending);
        Ok(())
    }

    fn lease(&self) -> FtpResult<()> {
        let guard = self.lock();
        if let Some(current) = guard.as_ref() {
            return Err(FtpError::protocol_violation(format!(
                "Cannot start a transfer while '{}' is still awaiting its reply",
                current.command
            )));
        }
        if self.leased.swap(true, Ordering::SeqCst) {
            return Err(FtpError::protocol_violation(
                "Another transfer is already running on this session",
            ));
        }
        Ok(())
    }

    fn end_lease(&self) {
        self.leased.store(false, Ordering::SeqCst);
    }

    /// Empty the slot if it still belongs to `seq`.
    fn release(&self, seq: u64) -> bool {
        let mut guard = self.lock();
        if guard.as_ref().map(|p| p.seq) == Some(seq) {
            *guard = None;
            true
        } else {
            false
        }
    }

    fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }

    fn dispatch(&self, session: &str, response: FtpResponse) {
        let mut guard = self.lock();
        let mut pending = match guard.take() {
            Some(p) => p,
            None => {
                log::debug!(
                    "[ftp:{}] dropping unsolicited reply {} {}",
                    session,
                    response.code,
                    response.message
                );
                return;
            }
        };

        if pending.tolerant && response.is_preliminary() {
            log::trace!(
                "[ftp:{}] preliminary {} for '{}'",
                session,
                response.code,
                pending.command
            );
            if let Some(tx) = pending.opening.take() {
                let _ = tx.send(response);
            }
            *guard = Some(pending);
            return;
        }

        let result = if response.code >= 400 {
            Err(FtpError::from_reply(response.code, &response.message))
        } else {
            Ok(response)
        };
        if pending.resolve.send(result).is_err() {
            log::debug!(
                "[ftp:{}] reply to '{}' arrived after its waiter left",
                session,
                pending.command
            );
        }
    }

    /// Fail the current command (if any) without touching the channel.
    fn fail(&self, error: FtpError) {
        if let Some(pending) = self.lock().take() {
            let _ = pending.resolve.send(Err(error));
        }
    }

    fn close(&self, error: FtpError) {
        let mut guard = self.lock();
        self.closed.store(true, Ordering::SeqCst);
        if let Some(pending) = guard.take() {
            let _ = pending.resolve.send(Err(error));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The FTP control channel.
///
/// Methods take `&self`; the reply slot, not the borrow checker, enforces
/// that only one command is in flight.
pub struct ControlChannel {
    session: String,
    slot: Arc<ReplySlot>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    events: broadcast::Sender<ControlEvent>,
    reader: JoinHandle<()>,
    sequence: AtomicU64,
    sent: AtomicU64,
    authenticated: AtomicBool,
    command_timeout: Duration,
}

impl ControlChannel {
    /// Open the TCP control connection and wait for the server greeting.
    pub async fn connect(
        config: &FtpConnectionConfig,
        session: &str,
    ) -> FtpResult<(Self, FtpResponse)> {
        let addr = format!("{}:{}", config.host, config.port);
        let dur = Duration::from_secs(config.connect_timeout_sec);

        let tcp = timeout(dur, TcpStream::connect(&addr))
            .await
            .map_err(|_| FtpError::connection_failed(format!("TCP connect to {} timed out", addr)))?
            .map_err(|e| FtpError::connection_failed(format!("TCP connect to {}: {}", addr, e)))?;

        tcp.set_nodelay(true).ok();
        log::info!("[ftp:{}] TCP connected to {}", session, addr);

        Self::open(tcp, session, config.command_timeout()).await
    }

    /// Take over an already-connected byte stream, start the read loop and
    /// wait for the greeting (a `120` notice is tolerated before `220`).
    pub async fn open<S>(
        stream: S,
        session: &str,
        command_timeout: Duration,
    ) -> FtpResult<(Self, FtpResponse)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(stream);
        let slot = Arc::new(ReplySlot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        // The greeting slot must exist before the read loop can see a byte.
        let (resolve_tx, resolve_rx) = oneshot::channel();
        slot.register(
            PendingCommand {
                seq: 0,
                command: GREETING.to_string(),
                tolerant: true,
                opening: None,
                resolve: resolve_tx,
            },
            false,
        )?;

        let reader = tokio::spawn(read_loop(
            rd,
            slot.clone(),
            events.clone(),
            session.to_string(),
        ));

        let channel = Self {
            session: session.to_string(),
            slot,
            writer: Mutex::new(Box::new(wr)),
            events,
            reader,
            sequence: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            authenticated: AtomicBool::new(false),
            command_timeout,
        };

        let greeting = PendingReply {
            channel: &channel,
            seq: 0,
            command: GREETING.to_string(),
            opening: None,
            resolve: Some(resolve_rx),
        }
        .wait()
        .await?;

        Ok((channel, greeting))
    }

    /// Send one command and wait for its terminal reply.
    ///
    /// With `tolerant` set, 1xx replies are treated as notices and the call
    /// keeps waiting for the reply that follows them.
    pub async fn send(&self, command: &str, tolerant: bool) -> FtpResult<FtpResponse> {
        self.issue(command, tolerant).await?.wait().await
    }

    /// Write a command and hand back the registration for its reply.
    ///
    /// Fails with `ProtocolViolation` while another command is awaiting its
    /// reply or a transfer holds the channel.
    pub async fn issue(&self, command: &str, tolerant: bool) -> FtpResult<PendingReply<'_>> {
        self.issue_as(command, tolerant, false).await
    }

    /// Reserve the channel for one multi-command transfer.
    pub fn begin_transfer(&self) -> FtpResult<TransferLease<'_>> {
        if self.slot.is_closed() {
            return Err(FtpError::disconnected("Control connection is closed"));
        }
        self.slot.lease()?;
        Ok(TransferLease { channel: self })
    }

    async fn issue_as(
        &self,
        command: &str,
        tolerant: bool,
        via_lease: bool,
    ) -> FtpResult<PendingReply<'_>> {
        if command.contains('\r') || command.contains('\n') {
            return Err(FtpError::invalid_config("Commands must be a single line"));
        }

        let display = mask_command(command);
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let (resolve_tx, resolve_rx) = oneshot::channel();
        let (opening_tx, opening_rx) = if tolerant {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.slot.register(
            PendingCommand {
                seq,
                command: display.clone(),
                tolerant,
                opening: opening_tx,
                resolve: resolve_tx,
            },
            via_lease,
        )?;

        // From here on, dropping `pending` releases the slot.
        let pending = PendingReply {
            channel: self,
            seq,
            command: display.clone(),
            opening: opening_rx,
            resolve: Some(resolve_rx),
        };

        log::debug!("[ftp:{}] >>> {}", self.session, display);
        let _ = self.events.send(ControlEvent::Sent(display.clone()));

        let line = format!("{}\r\n", command);
        let written = {
            let mut w = self.writer.lock().await;
            match w.write_all(line.as_bytes()).await {
                Ok(()) => w.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.slot.close(FtpError::disconnected("Control connection write failed"));
            return Err(FtpError::disconnected(format!(
                "Writing '{}' failed: {}",
                display, e
            )));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);

        Ok(pending)
    }

    /// Diagnostic stream of sent commands and received lines.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Whether a command is currently awaiting its reply.
    pub fn is_busy(&self) -> bool {
        self.slot.is_occupied()
    }

    /// Whether a transfer currently holds the channel.
    pub fn is_transferring(&self) -> bool {
        self.slot.leased.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    /// Commands written to the server so far.
    pub fn commands_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub(crate) fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::SeqCst);
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Close our write side; the read loop ends when the server hangs up.
    pub async fn shutdown(&self) -> FtpResult<()> {
        let mut w = self.writer.lock().await;
        w.shutdown().await?;
        Ok(())
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Exclusive use of the channel for the duration of one transfer.
///
/// Commands from anyone else fail with `ProtocolViolation` until it drops.
pub struct TransferLease<'a> {
    channel: &'a ControlChannel,
}

impl<'a> TransferLease<'a> {
    pub fn channel(&self) -> &'a ControlChannel {
        self.channel
    }

    pub async fn issue(&self, command: &str, tolerant: bool) -> FtpResult<PendingReply<'a>> {
        self.channel.issue_as(command, tolerant, true).await
    }

    pub async fn send(&self, command: &str, tolerant: bool) -> FtpResult<FtpResponse> {
        self.issue(command, tolerant).await?.wait().await
    }
}

impl Drop for TransferLease<'_> {
    fn drop(&mut self) {
        self.channel.slot.end_lease();
    }
}

/// Registration of an issued command's reply.
///
/// Dropping it before the reply arrives empties the channel's slot, so a
/// cancelled or timed-out command never wedges the channel.
pub struct PendingReply<'a> {
    channel: &'a ControlChannel,
    seq: u64,
    command: String,
    opening: Option<oneshot::Receiver<FtpResponse>>,
    resolve: Option<oneshot::Receiver<Resolution>>,
}

impl<'a> PendingReply<'a> {
    /// The command as it was logged (credentials masked).
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for the terminal reply within the channel's command timeout.
    pub async fn wait(self) -> FtpResult<FtpResponse> {
        let limit = self.channel.command_timeout;
        self.wait_within(limit).await
    }

    /// Wait for the terminal reply for at most `limit`; on expiry the slot
    /// is released and `CommandTimeout` returned.
    pub async fn wait_within(mut self, limit: Duration) -> FtpResult<FtpResponse> {
        match timeout(limit, self.reply()).await {
            Ok(res) => res,
            Err(_) => {
                self.abandon();
                log::warn!(
                    "[ftp:{}] no reply to '{}' within {:?}",
                    self.channel.session,
                    self.command,
                    limit
                );
                Err(FtpError::command_timeout(&self.command))
            }
        }
    }

    /// Wait for the terminal reply without a deadline.
    ///
    /// Cancel-safe: dropping the future keeps the registration intact.
    pub async fn reply(&mut self) -> FtpResult<FtpResponse> {
        let rx = match self.resolve.as_mut() {
            Some(rx) => rx,
            None => {
                return Err(FtpError::protocol_violation(format!(
                    "Reply to '{}' was already consumed",
                    self.command
                )))
            }
        };
        let res = rx.await;
        self.resolve = None;
        res.unwrap_or_else(|_| {
            Err(FtpError::disconnected(
                "Control connection closed while awaiting a reply",
            ))
        })
    }

    /// Wait (within the command timeout) until the server accepts a
    /// transfer command.
    ///
    /// Returns `Ok(None)` on a 1xx notice and `Ok(Some(reply))` when the
    /// terminal reply came first. Rejections surface as errors.
    pub async fn opening(&mut self) -> FtpResult<Option<FtpResponse>> {
        let limit = self.channel.command_timeout;
        let outcome = timeout(limit, async {
            let mut notice = match self.opening.take() {
                Some(rx) => rx,
                None => return self.reply().await.map(Some),
            };
            tokio::select! {
                biased;
                res = self.reply() => res.map(Some),
                got = &mut notice => match got {
                    Ok(_) => Ok(None),
                    // Sender dropped: the slot was resolved without a notice.
                    Err(_) => self.reply().await.map(Some),
                },
            }
        })
        .await;

        match outcome {
            Ok(res) => res,
            Err(_) => {
                self.abandon();
                Err(FtpError::command_timeout(&self.command))
            }
        }
    }

    /// Give the reply up to `limit` to arrive, then let it go.
    ///
    /// Returns the resolution if it arrived in time.
    pub async fn drain(mut self, limit: Duration) -> Option<FtpResult<FtpResponse>> {
        match timeout(limit, self.reply()).await {
            Ok(res) => {
                log::debug!(
                    "[ftp:{}] drained reply to '{}': {:?}",
                    self.channel.session,
                    self.command,
                    res.as_ref().map(|r| r.code)
                );
                Some(res)
            }
            Err(_) => {
                self.abandon();
                log::debug!(
                    "[ftp:{}] abandoned reply to '{}'",
                    self.channel.session,
                    self.command
                );
                None
            }
        }
    }

    /// Stop waiting; a reply arriving later is dropped by the read loop.
    pub fn abandon(&mut self) {
        if self.resolve.take().is_some() {
            self.channel.slot.release(self.seq);
        }
    }

    pub fn is_settled(&self) -> bool {
        self.resolve.is_none()
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Frame, assemble and dispatch everything the server sends.
async fn read_loop<R>(
    mut reader: R,
    slot: Arc<ReplySlot>,
    events: broadcast::Sender<ControlEvent>,
    session: String,
) where
    R: AsyncRead + Unpin,
{
    let mut framer = ReplyFramer::new();
    let mut assembler = ReplyAssembler::new();
    let mut buf = vec![0u8; READ_CHUNK];

    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break "Server closed the control connection".to_string(),
            Ok(n) => n,
            Err(e) => break format!("Control connection read failed: {}", e),
        };

        for framed in framer.push(&buf[..n]) {
            let line = match framed {
                Ok(line) => line,
                Err(e) => {
                    log::warn!("[ftp:{}] {}", session, e);
                    slot.fail(e);
                    continue;
                }
            };
            log::trace!("[ftp:{}] <<< {}", session, line);
            let _ = events.send(ControlEvent::Received(line.clone()));
            match assembler.push(&line) {
                Ok(Some(response)) => slot.dispatch(&session, response),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("[ftp:{}] {}", session, e);
                    slot.fail(e);
                }
            }
        }
    };

    log::info!("[ftp:{}] {}", session, reason);
    let _ = events.send(ControlEvent::Closed(reason.clone()));
    slot.close(FtpError::disconnected(reason));
}
