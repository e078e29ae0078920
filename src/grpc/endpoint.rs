//! CSI Endpoints
//!
//! Endpoints are given as `unix:///path/to/csi.sock` or `tcp://host:port`.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tracing::debug;

/// Parsed endpoint address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::Configuration(format!("endpoint {:?} has no path", s)));
            }
            Ok(Endpoint::Unix(PathBuf::from(path)))
        } else if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(Error::Configuration(format!("endpoint {:?} has no address", s)));
            }
            Ok(Endpoint::Tcp(addr.to_string()))
        } else {
            Err(Error::Configuration(format!(
                "invalid endpoint {:?}, expected unix:// or tcp://",
                s
            )))
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

impl Endpoint {
    /// Bind the endpoint. A stale Unix socket left by an earlier instance is removed first.
    pub async fn listen(&self) -> Result<Listener> {
        match self {
            Endpoint::Unix(path) => {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                let listener = UnixListener::bind(path).map_err(|source| Error::Listen {
                    addr: self.to_string(),
                    source,
                })?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|source| Error::Listen {
                        addr: addr.clone(),
                        source,
                    })?;
                Ok(Listener::Tcp(listener))
            }
        }
    }
}

/// A byte stream a connection is served over
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Bound endpoint
pub enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    /// Accept one connection, returning it with a printable peer address
    pub async fn accept(&self) -> std::io::Result<(Box<dyn Connection>, String)> {
        match self {
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
        }
    }

    /// Release the endpoint. Removes the socket file of a Unix endpoint.
    pub fn close(self) {
        if let Listener::Unix { listener, path } = self {
            drop(listener);
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "Could not remove socket");
            }
        }
    }
}
