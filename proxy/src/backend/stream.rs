//! Connection to a database, plain or TLS

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{ProxyError, Result};

/// Byte stream to a database
#[derive(Debug)]
pub enum BackendStream {
    /// Plain TCP
    Plain(TcpStream),

    /// TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
}

impl BackendStream {
    /// Open a TCP connection
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(BackendStream::Plain(stream))
    }

    /// Open a TCP connection and complete a TLS handshake on it
    pub async fn connect_tls(addr: &str, config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        match Self::connect(addr).await? {
            BackendStream::Plain(tcp) => Self::upgrade(tcp, config, server_name).await,
            tls => Ok(tls),
        }
    }

    /// Upgrade a TCP connection to TLS
    pub async fn upgrade(tcp: TcpStream, config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ProxyError::Tls(format!("invalid server name {:?}", server_name)))?;
        let stream = TlsConnector::from(config)
            .connect(name, tcp)
            .await
            .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", server_name, e)))?;
        Ok(BackendStream::Tls(Box::new(stream)))
    }

    /// Whether traffic on this stream is encrypted
    pub fn is_tls(&self) -> bool {
        matches!(self, BackendStream::Tls(_))
    }

    /// Address of the database
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            BackendStream::Plain(s) => s.peer_addr(),
            BackendStream::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
