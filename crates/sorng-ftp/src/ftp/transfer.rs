//! Passive-mode negotiation and data-channel connectors.
//!
//! `PASV` replies advertise `(h1,h2,h3,h4,p1,p2)`; the data connection is a
//! raw byte pipe to `h1.h2.h3.h4:(p1*256+p2)` with no framing of its own.
//! Opening it goes through the [`DataConnector`] seam so sessions can run
//! over any byte stream.

use crate::ftp::connection::TransferLease;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::PassiveEndpoint;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

lazy_static! {
    static ref PASV_TUPLE: Regex =
        Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").unwrap();
}

/// Anything usable as a data channel.
pub trait DataIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DataIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An open data channel, owned by exactly one transfer.
pub type DataStream = Box<dyn DataIo>;

/// Opens the data connection for a negotiated endpoint.
#[async_trait]
pub trait DataConnector: Send + Sync {
    async fn connect(&self, endpoint: &PassiveEndpoint) -> FtpResult<DataStream>;
}

/// Plain TCP data connections.
#[derive(Debug, Clone)]
pub struct TcpDataConnector {
    pub connect_timeout: Duration,
}

impl TcpDataConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl DataConnector for TcpDataConnector {
    async fn connect(&self, endpoint: &PassiveEndpoint) -> FtpResult<DataStream> {
        let addr = endpoint.address();
        let tcp = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| FtpError::data_channel(format!("Data connect to {} timed out", addr)))?
            .map_err(|e| FtpError::data_channel(format!("Data connect to {}: {}", addr, e)))?;
        tcp.set_nodelay(true).ok();
        log::trace!("FTP data channel connected to {}", addr);
        Ok(Box::new(tcp))
    }
}

/// Extract the endpoint from a `227` reply message.
///
/// ```text
/// 227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)
/// ```
pub fn parse_pasv_reply(message: &str) -> FtpResult<PassiveEndpoint> {
    let caps = PASV_TUPLE.captures(message).ok_or_else(|| {
        FtpError::malformed_passive(format!("No address tuple in PASV reply: {}", message))
    })?;

    let mut octets = [0u8; 6];
    for (i, slot) in octets.iter_mut().enumerate() {
        *slot = caps[i + 1].parse().map_err(|_| {
            FtpError::malformed_passive(format!(
                "PASV value '{}' is not a byte in: {}",
                &caps[i + 1],
                message
            ))
        })?;
    }

    Ok(PassiveEndpoint {
        host: format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]),
        port: u16::from(octets[4]) * 256 + u16::from(octets[5]),
    })
}

/// Send `PASV` under a transfer lease and decode the advertised endpoint.
///
/// With `nat_host` set, the advertised host is replaced by it (servers
/// behind NAT often advertise their private address).
pub async fn negotiate_passive(
    lease: &TransferLease<'_>,
    nat_host: Option<&str>,
) -> FtpResult<PassiveEndpoint> {
    let resp = lease.send("PASV", false).await?;
    if resp.code != 227 {
        return Err(FtpError::malformed_passive(format!(
            "Expected 227 for PASV, got {} {}",
            resp.code, resp.message
        ))
        .with_code(resp.code));
    }

    let mut endpoint = parse_pasv_reply(&resp.message)?;
    if let Some(host) = nat_host {
        if host != endpoint.host {
            log::debug!(
                "FTP PASV advertised {}, connecting to {} instead",
                endpoint.host,
                host
            );
            endpoint.host = host.to_string();
        }
    }
    log::trace!("FTP PASV → {}", endpoint.address());
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;
    use crate::ftp::test_support::ScriptedServer;

    #[test]
    fn decodes_standard_pasv_reply() {
        let ep = parse_pasv_reply("Entering Passive Mode (10,0,0,5,78,23)").unwrap();
        assert_eq!(ep.host, "10.0.0.5");
        assert_eq!(ep.port, 19991);
        assert_eq!(ep.address(), "10.0.0.5:19991");
    }

    #[test]
    fn tolerates_surrounding_text() {
        let ep = parse_pasv_reply("=(192,168,1,2,0,21). ok").unwrap();
        assert_eq!(ep.host, "192.168.1.2");
        assert_eq!(ep.port, 21);
    }

    #[test]
    fn missing_tuple_is_malformed() {
        for msg in ["Entering Passive Mode", "(1,2,3,4,5)", "(a,b,c,d,e,f)"] {
            let err = parse_pasv_reply(msg).unwrap_err();
            assert_eq!(err.kind, FtpErrorKind::MalformedPassiveReply, "{}", msg);
        }
    }

    #[test]
    fn values_above_a_byte_are_rejected() {
        let err = parse_pasv_reply("(10,0,0,256,1,1)").unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::MalformedPassiveReply);
        let err = parse_pasv_reply("(10,0,0,5,300,1)").unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::MalformedPassiveReply);
    }

    #[tokio::test]
    async fn negotiate_sends_pasv_and_applies_nat_host() {
        let (channel, mut server) = ScriptedServer::open_channel().await;
        let lease = channel.begin_transfer().unwrap();

        let (res, ()) = tokio::join!(negotiate_passive(&lease, None), async {
            server.expect("PASV").await;
            server.reply("227 Entering Passive Mode (10,0,0,5,78,23)").await;
        });
        assert_eq!(res.unwrap().address(), "10.0.0.5:19991");

        let (res, ()) = tokio::join!(negotiate_passive(&lease, Some("ftp.example.com")), async {
            server.expect("PASV").await;
            server.reply("227 Entering Passive Mode (10,0,0,5,78,23)").await;
        });
        assert_eq!(res.unwrap().address(), "ftp.example.com:19991");
    }

    #[tokio::test]
    async fn negotiate_propagates_rejection() {
        let (channel, mut server) = ScriptedServer::open_channel().await;
        let lease = channel.begin_transfer().unwrap();
        let (res, ()) = tokio::join!(negotiate_passive(&lease, None), async {
            server.expect("PASV").await;
            server.reply("502 PASV not implemented").await;
        });
        let err = res.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Rejected);
        assert_eq!(err.code, Some(502));
    }

    #[tokio::test]
    async fn tcp_connector_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let connector = TcpDataConnector::new(Duration::from_secs(5));
        let ep = PassiveEndpoint {
            host: "127.0.0.1".into(),
            port,
        };
        assert!(connector.connect(&ep).await.is_ok());
        assert!(accept.await.unwrap().is_ok());
    }
}
