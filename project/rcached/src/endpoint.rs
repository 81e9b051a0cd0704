//! Endpoint binding: locator parsing plus the unix/tcp listener and stream
//! the server multiplexes over.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    #[error("unknown endpoint in locator: {0}")]
    UnknownScheme(String),

    #[error("invalid locator: {0}")]
    Invalid(String),
}

/// Endpoint descriptor: `unix=<path>` or `tcp=<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Unix(PathBuf),
    Tcp(String, u16),
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(locator: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = locator
            .split_once('=')
            .ok_or_else(|| LocatorError::Invalid(locator.to_string()))?;
        match scheme {
            "unix" => {
                if rest.is_empty() {
                    return Err(LocatorError::Invalid(locator.to_string()));
                }
                Ok(Locator::Unix(PathBuf::from(rest)))
            }
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| LocatorError::Invalid(locator.to_string()))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| LocatorError::Invalid(locator.to_string()))?;
                if host.is_empty() {
                    return Err(LocatorError::Invalid(locator.to_string()));
                }
                Ok(Locator::Tcp(host.to_string(), port))
            }
            other => Err(LocatorError::UnknownScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Unix(path) => write!(f, "unix={}", path.display()),
            Locator::Tcp(host, port) => write!(f, "tcp={host}:{port}"),
        }
    }
}

impl Locator {
    /// Bind a listening endpoint. Unix sockets replace a stale socket file
    /// and are restricted to mode 0600.
    pub async fn bind(&self) -> io::Result<CacheListener> {
        match self {
            Locator::Unix(path) => {
                match std::fs::remove_file(path) {
                    Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
                    _ => {}
                }
                let listener = UnixListener::bind(path)?;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                Ok(CacheListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            Locator::Tcp(host, port) => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(CacheListener::Tcp(listener))
            }
        }
    }
}

/// A bound listening endpoint. Unix sockets unlink their path when the
/// listener goes away.
pub enum CacheListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl CacheListener {
    pub async fn accept(&self) -> io::Result<(CacheStream, String)> {
        match self {
            CacheListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok((CacheStream::Unix(stream), "unix client".to_string()))
            }
            CacheListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((CacheStream::Tcp(stream), addr.to_string()))
            }
        }
    }

    /// Local address of a TCP endpoint; `None` for unix sockets. Useful
    /// with `tcp=<host>:0`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            CacheListener::Unix { .. } => None,
            CacheListener::Tcp(listener) => listener.local_addr().ok(),
        }
    }
}

impl Drop for CacheListener {
    fn drop(&mut self) {
        if let CacheListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// One accepted client connection, unix or tcp.
pub enum CacheStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl CacheStream {
    /// Wait until the stream has input to read.
    pub async fn readable(&self) -> io::Result<()> {
        match self {
            CacheStream::Unix(stream) => stream.readable().await,
            CacheStream::Tcp(stream) => stream.readable().await,
        }
    }

    /// Non-blocking best-effort write, for one-shot notifications.
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CacheStream::Unix(stream) => stream.try_write(buf),
            CacheStream::Tcp(stream) => stream.try_write(buf),
        }
    }
}

impl AsyncRead for CacheStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            CacheStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            CacheStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for CacheStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            CacheStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            CacheStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            CacheStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            CacheStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            CacheStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            CacheStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
