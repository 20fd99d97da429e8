//! Stateful FTP client — owns the control channel and issues commands.
//!
//! Lifecycle: `connect()` → greeting → USER/PASS → TYPE → PWD →
//! optionally CWD into the initial directory.
//!
//! Every method takes `&mut self`, so one session never has two commands
//! in flight from safe code; the control channel enforces the same rule at
//! runtime for anything holding it by shared reference.

use crate::ftp::connection::{ControlChannel, ControlEvent};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::parser;
use crate::ftp::transfer::{DataConnector, TcpDataConnector};
use crate::ftp::types::*;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A connected FTP client session.
pub struct FtpClient {
    pub id: String,
    pub config: FtpConnectionConfig,
    pub info: FtpSessionInfo,
    pub(crate) control: ControlChannel,
    pub(crate) connector: Arc<dyn DataConnector>,
}

impl FtpClient {
    /// Establish a new FTP session over TCP.
    pub async fn connect(config: FtpConnectionConfig) -> FtpResult<Self> {
        config.validate()?;

        let session_id = Uuid::new_v4().to_string();
        let (control, greeting) = ControlChannel::connect(&config, short_id(&session_id)).await?;
        let connector: Arc<dyn DataConnector> = Arc::new(TcpDataConnector::new(Duration::from_secs(
            config.connect_timeout_sec,
        )));

        Self::establish(config, session_id, control, greeting, connector).await
    }

    /// Establish a session over an already-connected control stream, using
    /// `connector` for data channels.
    pub async fn with_stream<S>(
        config: FtpConnectionConfig,
        stream: S,
        connector: Arc<dyn DataConnector>,
    ) -> FtpResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let session_id = Uuid::new_v4().to_string();
        let (control, greeting) =
            ControlChannel::open(stream, short_id(&session_id), config.command_timeout()).await?;

        Self::establish(config, session_id, control, greeting, connector).await
    }

    async fn establish(
        config: FtpConnectionConfig,
        session_id: String,
        control: ControlChannel,
        greeting: FtpResponse,
        connector: Arc<dyn DataConnector>,
    ) -> FtpResult<Self> {
        // ── Authenticate ─────────────────────────────────────────
        Self::login(&control, &config).await?;
        control.set_authenticated(true);
        log::info!(
            "FTP session {} logged in to {}:{} as {}",
            session_id,
            config.host,
            config.port,
            config.username
        );

        // ── TYPE ─────────────────────────────────────────────────
        control.send(config.transfer_type.command(), false).await?;

        // ── PWD ──────────────────────────────────────────────────
        let mut cwd = Self::query_pwd(&control).await.unwrap_or_else(|_| "/".into());

        // ── Initial CWD ──────────────────────────────────────────
        if let Some(ref dir) = config.initial_directory {
            match control.send(&format!("CWD {}", dir), false).await {
                Ok(_) => cwd = Self::query_pwd(&control).await.unwrap_or_else(|_| dir.clone()),
                Err(e) => log::warn!("FTP initial directory {} unavailable: {}", dir, e),
            }
        }

        let info = FtpSessionInfo {
            id: session_id.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            connected: true,
            current_directory: cwd,
            server_banner: Some(greeting.text()),
            connected_at: Utc::now(),
            last_activity: Utc::now(),
            transfer_type: config.transfer_type,
            label: config.label.clone(),
            bytes_uploaded: 0,
            bytes_downloaded: 0,
        };

        Ok(Self {
            id: session_id,
            config,
            info,
            control,
            connector,
        })
    }

    /// USER, then PASS when the server asks for it (331).
    async fn login(control: &ControlChannel, config: &FtpConnectionConfig) -> FtpResult<()> {
        let user = control
            .send(&format!("USER {}", config.username), false)
            .await
            .map_err(auth_error)?;

        match user.code {
            230 => Ok(()),
            331 => {
                control
                    .send(&format!("PASS {}", config.password), false)
                    .await
                    .map_err(auth_error)?;
                Ok(())
            }
            code => Err(FtpError::auth_failed(format!(
                "Unsupported login step: {}",
                user.text()
            ))
            .with_code(code)),
        }
    }

    // ─── Raw commands ────────────────────────────────────────────

    /// Send an arbitrary single-line command and return its terminal reply.
    pub async fn send_command(&mut self, command: &str, tolerant: bool) -> FtpResult<FtpResponse> {
        let resp = self.control.send(command, tolerant).await?;
        self.touch();
        Ok(resp)
    }

    /// Diagnostic stream of sent commands (passwords masked) and reply lines.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.control.subscribe()
    }

    // ─── Keepalive ───────────────────────────────────────────────

    /// Send a NOOP to keep the control connection alive.
    pub async fn noop(&mut self) -> FtpResult<()> {
        self.control.send("NOOP", false).await?;
        self.touch();
        Ok(())
    }

    /// NOOP if the session has been idle for the configured interval.
    ///
    /// Returns whether a NOOP was sent. An interval of 0 disables it.
    pub async fn keepalive(&mut self) -> FtpResult<bool> {
        let interval = self.config.keepalive_interval_sec;
        if interval == 0 {
            return Ok(false);
        }
        let idle = Utc::now() - self.info.last_activity;
        if idle.num_seconds() < interval as i64 {
            return Ok(false);
        }
        log::trace!("FTP session {} idle for {}s, sending NOOP", self.id, idle.num_seconds());
        self.noop().await?;
        Ok(true)
    }

    // ─── PWD / CWD / CDUP ───────────────────────────────────────

    async fn query_pwd(control: &ControlChannel) -> FtpResult<String> {
        let resp = control.send("PWD", false).await?;
        parse_pwd(&resp.message)
    }

    /// Ask the server for the working directory.
    pub async fn pwd(&mut self) -> FtpResult<String> {
        let pwd = Self::query_pwd(&self.control).await?;
        self.info.current_directory = pwd.clone();
        self.touch();
        Ok(pwd)
    }

    /// Change into `path` and update `current_directory`.
    pub async fn cwd(&mut self, path: &str) -> FtpResult<String> {
        self.control
            .send(&format!("CWD {}", path), false)
            .await
            .map_err(|e| e.with_path(path))?;
        self.pwd().await
    }

    /// Move to the parent directory.
    pub async fn cdup(&mut self) -> FtpResult<String> {
        self.control.send("CDUP", false).await?;
        self.pwd().await
    }

    // ─── TYPE command ────────────────────────────────────────────

    /// Switch transfer type.
    pub async fn set_type(&mut self, tt: TransferType) -> FtpResult<()> {
        self.control.send(tt.command(), false).await?;
        self.info.transfer_type = tt;
        self.touch();
        Ok(())
    }

    // ─── Listing ─────────────────────────────────────────────────

    /// List `path` (or the working directory) and parse the entries.
    pub async fn list(&mut self, path: Option<&str>) -> FtpResult<Vec<FtpEntry>> {
        let raw = self.list_raw(path).await?;
        Ok(parser::parse_listing(&raw))
    }

    /// List with filtering and sorting applied.
    pub async fn list_with(
        &mut self,
        path: Option<&str>,
        options: &ListOptions,
    ) -> FtpResult<Vec<FtpEntry>> {
        let entries = self.list(path).await?;
        parser::apply_list_options(entries, options)
    }

    // ─── SIZE / MDTM ────────────────────────────────────────────

    /// Size of a remote file in bytes (`213 <n>`).
    pub async fn size(&mut self, path: &str) -> FtpResult<u64> {
        let resp = self
            .control
            .send(&format!("SIZE {}", path), false)
            .await
            .map_err(|e| e.with_path(path))?;
        self.touch();
        resp.message
            .trim()
            .parse::<u64>()
            .map_err(|_| FtpError::malformed_reply(format!("Cannot parse SIZE: {}", resp.text())))
    }

    /// Modification time of a remote file (`213 YYYYMMDDhhmmss`).
    pub async fn modified_time(&mut self, path: &str) -> FtpResult<chrono::DateTime<Utc>> {
        let resp = self
            .control
            .send(&format!("MDTM {}", path), false)
            .await
            .map_err(|e| e.with_path(path))?;
        self.touch();
        parser::parse_mdtm(&resp.message).map_err(|e| e.with_path(path))
    }

    // ─── SITE ────────────────────────────────────────────────────

    pub async fn site(&mut self, args: &str) -> FtpResult<FtpResponse> {
        self.send_command(&format!("SITE {}", args), false).await
    }

    // ─── QUIT ────────────────────────────────────────────────────

    /// Gracefully close the session.
    pub async fn quit(&mut self) -> FtpResult<()> {
        if let Err(e) = self.control.send("QUIT", false).await {
            log::debug!("FTP session {} QUIT: {}", self.id, e);
        }
        let _ = self.control.shutdown().await;
        self.control.set_authenticated(false);
        self.info.connected = false;
        log::info!("FTP session {} closed", self.id);
        Ok(())
    }

    // ─── Utility ─────────────────────────────────────────────────

    pub(crate) fn touch(&mut self) {
        self.info.last_activity = Utc::now();
    }

    pub fn is_connected(&self) -> bool {
        self.info.connected && !self.control.is_closed()
    }

    pub fn session_info(&self) -> FtpSessionInfo {
        let mut info = self.info.clone();
        info.connected = self.is_connected();
        info
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn auth_error(e: FtpError) -> FtpError {
    match e.code {
        Some(code) => FtpError::auth_failed(format!("Login failed: {}", e.message)).with_code(code),
        None => e,
    }
}

/// Parse `257 "/some/path"` into the path string (`""` escapes a quote).
fn parse_pwd(text: &str) -> FtpResult<String> {
    let start = text
        .find('"')
        .ok_or_else(|| FtpError::malformed_reply(format!("Cannot parse PWD: {}", text)))?;
    let mut path = String::new();
    let mut chars = text[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                path.push('"');
            } else {
                return Ok(path);
            }
        } else {
            path.push(c);
        }
    }
    Err(FtpError::malformed_reply(format!("Cannot parse PWD: {}", text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;
    use crate::ftp::test_support::{serve_data, test_config, ScriptedServer};

    #[test]
    fn pwd_parsing() {
        assert_eq!(parse_pwd("\"/home/user\" is current").unwrap(), "/home/user");
        assert_eq!(parse_pwd("\"/odd\"\"name\" ok").unwrap(), "/odd\"name");
        assert!(parse_pwd("no quotes").is_err());
        assert!(parse_pwd("\"/unterminated").is_err());
    }

    #[tokio::test]
    async fn login_populates_session_info() {
        let (client, _server) = ScriptedServer::logged_in_client().await;
        assert!(client.is_connected());
        assert!(client.control.is_authenticated());
        let info = client.session_info();
        assert_eq!(info.current_directory, "/");
        assert_eq!(info.server_banner.as_deref(), Some("220 Test server ready"));
        assert_eq!(info.transfer_type, TransferType::Binary);
    }

    #[tokio::test]
    async fn bad_password_is_auth_failure() {
        let (stream, mut server) = ScriptedServer::pair();
        let connector: Arc<dyn DataConnector> = server.connector.clone();
        let (res, ()) = tokio::join!(
            FtpClient::with_stream(test_config(), stream, connector),
            async {
                server.reply("220 Ready").await;
                server.expect("USER anonymous").await;
                server.reply("331 Password required").await;
                server.expect("PASS anonymous@").await;
                server.reply("530 Login incorrect").await;
            }
        );
        let err = res.err().unwrap();
        assert_eq!(err.kind, FtpErrorKind::AuthFailed);
        assert_eq!(err.code, Some(530));
    }

    #[tokio::test]
    async fn user_only_login_and_initial_directory() {
        let config = FtpConnectionConfig {
            initial_directory: Some("/pub".into()),
            transfer_type: TransferType::Ascii,
            ..test_config()
        };
        let (stream, mut server) = ScriptedServer::pair();
        let connector: Arc<dyn DataConnector> = server.connector.clone();
        let (res, ()) = tokio::join!(FtpClient::with_stream(config, stream, connector), async {
            server.reply("220 Ready").await;
            server.expect("USER anonymous").await;
            server.reply("230 Welcome").await;
            server.expect("TYPE A").await;
            server.reply("200 Type set to A").await;
            server.expect("PWD").await;
            server.reply("257 \"/\"").await;
            server.expect("CWD /pub").await;
            server.reply("250 OK").await;
            server.expect("PWD").await;
            server.reply("257 \"/pub\"").await;
        });
        let client = res.unwrap();
        assert_eq!(client.info.current_directory, "/pub");
    }

    #[tokio::test]
    async fn cwd_size_and_mdtm() {
        let (mut client, mut server) = ScriptedServer::logged_in_client().await;

        let (res, ()) = tokio::join!(client.cwd("docs"), async {
            server.expect("CWD docs").await;
            server.reply("250 Directory changed").await;
            server.expect("PWD").await;
            server.reply("257 \"/docs\"").await;
        });
        assert_eq!(res.unwrap(), "/docs");
        assert_eq!(client.info.current_directory, "/docs");

        let (res, ()) = tokio::join!(client.size("a.bin"), async {
            server.expect("SIZE a.bin").await;
            server.reply("213 4096").await;
        });
        assert_eq!(res.unwrap(), 4096);

        let (res, ()) = tokio::join!(client.modified_time("a.bin"), async {
            server.expect("MDTM a.bin").await;
            server.reply("213 20260101120000").await;
        });
        assert_eq!(res.unwrap().to_rfc3339(), "2026-01-01T12:00:00+00:00");

        let (res, ()) = tokio::join!(client.size("gone"), async {
            server.expect("SIZE gone").await;
            server.reply("550 gone: No such file").await;
        });
        let err = res.unwrap_err();
        assert_eq!(err.code, Some(550));
        assert_eq!(err.path.as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn list_with_options_and_byte_counters() {
        let (mut client, mut server) = ScriptedServer::logged_in_client().await;
        let opts = ListOptions {
            sort_by: Some(FtpSortField::Name),
            ..Default::default()
        };

        let (res, ()) = tokio::join!(client.list_with(Some("/pub"), &opts), async {
            let data = server.open_passive().await;
            server.expect("LIST /pub").await;
            server.reply("150 Here comes the listing").await;
            serve_data(
                data,
                b"total 2\r\n-rw-r--r-- 1 u g 5 Jan 1 2024 b.txt\r\ndrwxr-xr-x 2 u g 4096 Jan 1 2024 a\r\n",
            )
            .await;
            server.reply("226 Directory send OK").await;
        });

        let entries = res.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b.txt"]);
        assert!(entries[0].is_dir());
        assert!(client.info.bytes_downloaded > 0);
    }

    #[tokio::test]
    async fn retrieve_and_store_through_session() {
        let (mut client, mut server) = ScriptedServer::logged_in_client().await;

        let (res, ()) = tokio::join!(client.retrieve("motd"), async {
            let data = server.open_passive().await;
            server.expect("RETR motd").await;
            server.reply("150 Opening").await;
            serve_data(data, b"hi there").await;
            server.reply("226 Done").await;
        });
        assert_eq!(res.unwrap(), b"hi there");

        let mut source: &[u8] = b"log line\n";
        let (res, received) = tokio::join!(client.append("app.log", &mut source), async {
            let data = server.open_passive().await;
            server.expect("APPE app.log").await;
            server.reply("150 Ok to send data").await;
            let received = crate::ftp::test_support::collect_data(data).await;
            server.reply("226 Done").await;
            received
        });
        assert_eq!(res.unwrap(), 9);
        assert_eq!(received, b"log line\n");
        assert_eq!(client.info.bytes_downloaded, 8);
        assert_eq!(client.info.bytes_uploaded, 9);
    }

    #[tokio::test]
    async fn keepalive_only_when_idle() {
        let (mut client, mut server) = ScriptedServer::logged_in_client().await;

        assert!(!client.keepalive().await.unwrap());

        client.info.last_activity = Utc::now() - chrono::Duration::seconds(120);
        let (res, ()) = tokio::join!(client.keepalive(), async {
            server.expect("NOOP").await;
            server.reply("200 NOOP ok").await;
        });
        assert!(res.unwrap());

        client.config.keepalive_interval_sec = 0;
        client.info.last_activity = Utc::now() - chrono::Duration::seconds(120);
        assert!(!client.keepalive().await.unwrap());
    }

    #[tokio::test]
    async fn quit_closes_session() {
        let (mut client, mut server) = ScriptedServer::logged_in_client().await;
        let (res, ()) = tokio::join!(client.quit(), async {
            server.expect("QUIT").await;
            server.reply("221 Goodbye").await;
        });
        res.unwrap();
        assert!(!client.is_connected());
        assert_eq!(server.read_command().await, None);
    }
}
