//! In-memory FTP server scaffolding for unit tests.
//!
//! The control connection runs over `tokio::io::duplex`; data channels are
//! handed to the client through [`MockConnector`] when the script answers
//! `PASV` via [`ScriptedServer::open_passive`].

use crate::ftp::client::FtpClient;
use crate::ftp::connection::ControlChannel;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::transfer::{DataConnector, DataStream};
use crate::ftp::types::{FtpConnectionConfig, PassiveEndpoint};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    duplex, split, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::sync::oneshot;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Data connector fed by the scripted server.
#[derive(Default)]
pub(crate) struct MockConnector {
    ready: Mutex<VecDeque<DataStream>>,
    pub endpoints: Mutex<Vec<PassiveEndpoint>>,
}

#[async_trait]
impl DataConnector for MockConnector {
    async fn connect(&self, endpoint: &PassiveEndpoint) -> FtpResult<DataStream> {
        self.endpoints.lock().unwrap().push(endpoint.clone());
        match self.ready.lock().unwrap().pop_front() {
            Some(stream) => Ok(stream),
            None => Err(FtpError::data_channel(format!(
                "Connection refused by {}",
                endpoint.address()
            ))),
        }
    }
}

pub(crate) struct ScriptedServer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    pub connector: Arc<MockConnector>,
}

impl ScriptedServer {
    /// Client end of the control connection plus the server script.
    pub fn pair() -> (DuplexStream, Self) {
        let (client, server) = duplex(PIPE_CAPACITY);
        let (rd, wr) = split(server);
        (
            client,
            Self {
                reader: BufReader::new(rd),
                writer: wr,
                connector: Arc::new(MockConnector::default()),
            },
        )
    }

    /// A greeted control channel with a 30 s command timeout.
    pub async fn open_channel() -> (ControlChannel, Self) {
        let (stream, mut server) = Self::pair();
        let (opened, ()) = tokio::join!(
            ControlChannel::open(stream, "test", Duration::from_secs(30)),
            server.reply("220 Test server ready")
        );
        (opened.unwrap().0, server)
    }

    /// A logged-in client using [`test_config`].
    pub async fn logged_in_client() -> (FtpClient, Self) {
        Self::client_with(test_config()).await
    }

    pub async fn client_with(config: FtpConnectionConfig) -> (FtpClient, Self) {
        let (stream, mut server) = Self::pair();
        let connector: Arc<dyn DataConnector> = server.connector.clone();
        let (client, ()) = tokio::join!(
            FtpClient::with_stream(config, stream, connector),
            server.accept_login()
        );
        (client.unwrap(), server)
    }

    /// Greeting, anonymous login, `TYPE I` and the initial `PWD`.
    pub async fn accept_login(&mut self) {
        self.reply("220 Test server ready").await;
        self.expect("USER anonymous").await;
        self.reply("331 Password required").await;
        self.expect("PASS anonymous@").await;
        self.reply("230 Logged in").await;
        self.expect("TYPE I").await;
        self.reply("200 Type set to I").await;
        self.expect("PWD").await;
        self.reply("257 \"/\" is the current directory").await;
    }

    pub async fn reply(&mut self, line: &str) {
        self.send_raw(format!("{}\r\n", line).as_bytes()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next command line, or `None` once the client hung up.
    pub async fn read_command(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()),
        }
    }

    pub async fn expect(&mut self, command: &str) {
        assert_eq!(self.read_command().await.as_deref(), Some(command));
    }

    /// Answer `PASV` and return the server end of the new data channel.
    pub async fn open_passive(&mut self) -> DuplexStream {
        let (client, server) = duplex(PIPE_CAPACITY);
        self.open_passive_with(Box::new(client)).await;
        server
    }

    /// Answer `PASV`, handing `stream` to the client as its data channel.
    pub async fn open_passive_with(&mut self, stream: DataStream) {
        self.expect("PASV").await;
        self.connector.ready.lock().unwrap().push_back(stream);
        self.reply("227 Entering Passive Mode (127,0,0,1,195,80)").await;
    }

    /// Close the control connection from the server side.
    pub async fn hang_up(&mut self) {
        self.writer.shutdown().await.unwrap();
    }
}

/// Data connector that takes `delay` before each connection.
pub(crate) struct SlowConnector {
    pub inner: Arc<MockConnector>,
    pub delay: Duration,
}

#[async_trait]
impl DataConnector for SlowConnector {
    async fn connect(&self, endpoint: &PassiveEndpoint) -> FtpResult<DataStream> {
        tokio::time::sleep(self.delay).await;
        self.inner.connect(endpoint).await
    }
}

/// Data channel whose every read and write fails with a reset.
///
/// The paired receiver fires on the first failure.
pub(crate) struct BrokenData {
    failed: Option<oneshot::Sender<()>>,
}

impl BrokenData {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { failed: Some(tx) }, rx)
    }

    fn fail(&mut self) -> io::Error {
        if let Some(tx) = self.failed.take() {
            let _ = tx.send(());
        }
        io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")
    }
}

impl AsyncRead for BrokenData {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(self.get_mut().fail()))
    }
}

impl AsyncWrite for BrokenData {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(self.get_mut().fail()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Write `payload` and close the data channel.
pub(crate) async fn serve_data(mut data: DuplexStream, payload: &[u8]) {
    data.write_all(payload).await.unwrap();
    data.shutdown().await.unwrap();
}

/// Read the data channel until the client closes it.
pub(crate) async fn collect_data(mut data: DuplexStream) -> Vec<u8> {
    let mut buf = Vec::new();
    data.read_to_end(&mut buf).await.unwrap();
    buf
}

pub(crate) fn test_config() -> FtpConnectionConfig {
    FtpConnectionConfig {
        host: "127.0.0.1".into(),
        ..Default::default()
    }
}
