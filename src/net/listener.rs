//! Listening sockets.
//!
//! # Responsibilities
//! - Bind TCP and Unix domain sockets from a [`ListenAddress`]
//! - Keep a process-level handle ([`BoundSocket`]) that can be duplicated and handed to a
//!   replacement process
//! - Expose the async accept side ([`Listener`]) used by servers

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use super::addr::{ListenAddress, ListenAddressError, Network};

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The address could not be resolved.
    #[error(transparent)]
    Address(#[from] ListenAddressError),

    /// Failed to bind to the address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: ListenAddress,
        source: io::Error,
    },

    /// Failed to hand the socket to the async runtime.
    #[error("failed to register {address} with the runtime: {source}")]
    Register {
        address: ListenAddress,
        source: io::Error,
    },

    /// Failed to accept a connection.
    #[error("failed to accept on {address}: {source}")]
    Accept { address: String, source: io::Error },

    /// Unix domain sockets are not available on this platform.
    #[error("unix domain sockets are not supported on this platform")]
    UnixUnsupported,
}

/// How an accept loop should react to a failed accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptFailure {
    /// Only the pending connection failed; keep accepting.
    Connection,
    /// The process ran out of descriptors or memory; back off, then keep accepting.
    Exhausted,
    /// The listening socket itself is unusable.
    Fatal,
}

impl AcceptFailure {
    /// Classify the OS error behind a failed accept.
    pub fn classify(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => return Self::Connection,
            io::ErrorKind::OutOfMemory => return Self::Exhausted,
            _ => {}
        }
        if is_exhaustion(error) {
            Self::Exhausted
        } else {
            Self::Fatal
        }
    }
}

#[cfg(unix)]
fn is_exhaustion(error: &io::Error) -> bool {
    use nix::errno::Errno;

    error.raw_os_error().is_some_and(|code| {
        [Errno::EMFILE, Errno::ENFILE, Errno::ENOBUFS, Errno::ENOMEM]
            .iter()
            .any(|errno| *errno as i32 == code)
    })
}

#[cfg(not(unix))]
fn is_exhaustion(_error: &io::Error) -> bool {
    false
}

impl ListenerError {
    /// Whether the accept loop can survive this error.
    pub fn accept_failure(&self) -> AcceptFailure {
        match self {
            Self::Accept { source, .. } => AcceptFailure::classify(source),
            _ => AcceptFailure::Fatal,
        }
    }
}

/// A bound, listening socket at the process level.
///
/// This is what the socket reloader tracks: it can be cloned into additional handles to the
/// same kernel socket, and on unix its descriptor can be inherited by a child process.
#[derive(Debug)]
pub enum BoundSocket {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

impl BoundSocket {
    /// Bind a fresh socket for `address`.
    pub fn bind(address: &ListenAddress) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind {
            address: address.clone(),
            source,
        };

        match address.network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let addr = address.resolve_tcp()?;
                std::net::TcpListener::bind(addr).map(Self::Tcp).map_err(bind_err)
            }
            #[cfg(unix)]
            Network::Unix => {
                let path = std::path::PathBuf::from(&address.address);
                remove_stale_socket(&path).map_err(bind_err)?;
                std::os::unix::net::UnixListener::bind(&path)
                    .map(Self::Unix)
                    .map_err(bind_err)
            }
            #[cfg(not(unix))]
            Network::Unix => Err(ListenerError::UnixUnsupported),
        }
    }

    /// Another handle to the same kernel socket.
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(l) => l.try_clone().map(Self::Tcp),
            #[cfg(unix)]
            Self::Unix(l) => l.try_clone().map(Self::Unix),
        }
    }

    /// Human readable local address.
    pub fn local_addr(&self) -> String {
        match self {
            Self::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string()),
            #[cfg(unix)]
            Self::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "<unnamed>".to_string()),
        }
    }

    /// Whether the socket's family matches `network`.
    pub fn matches(&self, network: Network) -> bool {
        match self {
            Self::Tcp(_) => network.is_tcp(),
            #[cfg(unix)]
            Self::Unix(_) => network == Network::Unix,
        }
    }

    /// Convert into an async listener. Must be called inside a tokio runtime.
    pub fn into_listener(self, address: &ListenAddress) -> Result<Listener, ListenerError> {
        let register_err = |source| ListenerError::Register {
            address: address.clone(),
            source,
        };

        let inner = match self {
            Self::Tcp(l) => {
                l.set_nonblocking(true).map_err(register_err)?;
                ListenerInner::Tcp(TcpListener::from_std(l).map_err(register_err)?)
            }
            #[cfg(unix)]
            Self::Unix(l) => {
                l.set_nonblocking(true).map_err(register_err)?;
                ListenerInner::Unix(tokio::net::UnixListener::from_std(l).map_err(register_err)?)
            }
        };

        Ok(Listener {
            address: address.clone(),
            inner,
        })
    }
}

#[cfg(unix)]
impl std::os::fd::AsFd for BoundSocket {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        match self {
            Self::Tcp(l) => l.as_fd(),
            Self::Unix(l) => l.as_fd(),
        }
    }
}

/// Removes a leftover Unix socket file so the path can be bound again.
///
/// Anything at the path that is not a socket is left alone and reported.
#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path already exists and is not a Unix domain socket",
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug)]
enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// The accept side of a listening socket.
#[derive(Debug)]
pub struct Listener {
    address: ListenAddress,
    inner: ListenerInner,
}

/// An accepted connection.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream, SocketAddr),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Connection {
    /// Peer description for logs.
    pub fn peer(&self) -> String {
        match self {
            Self::Tcp(_, addr) => addr.to_string(),
            #[cfg(unix)]
            Self::Unix(_) => "unix".to_string(),
        }
    }
}

impl Listener {
    /// Bind a fresh listener without going through a reloader.
    pub fn bind(address: &ListenAddress) -> Result<Self, ListenerError> {
        BoundSocket::bind(address)?.into_listener(address)
    }

    /// Accept a new connection.
    pub async fn accept(&self) -> Result<Connection, ListenerError> {
        let accept_err = |source| ListenerError::Accept {
            address: self.address.to_string(),
            source,
        };

        match &self.inner {
            ListenerInner::Tcp(l) => {
                let (stream, peer) = l.accept().await.map_err(accept_err)?;
                let _ = stream.set_nodelay(true);
                Ok(Connection::Tcp(stream, peer))
            }
            #[cfg(unix)]
            ListenerInner::Unix(l) => {
                let (stream, _) = l.accept().await.map_err(accept_err)?;
                Ok(Connection::Unix(stream))
            }
        }
    }

    /// The configured address this listener serves.
    pub fn address(&self) -> &ListenAddress {
        &self.address
    }

    /// The bound local address, useful when binding port 0.
    pub fn local_addr(&self) -> String {
        match &self.inner {
            ListenerInner::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string()),
            #[cfg(unix)]
            ListenerInner::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "<unnamed>".to_string()),
        }
    }

    /// The bound TCP socket address, if this is a TCP listener.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            ListenerInner::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            ListenerInner::Unix(_) => None,
        }
    }
}
