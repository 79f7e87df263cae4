//! Descriptor-passing handoff for unix.
//!
//! The replacement is the current executable started with the same arguments. It inherits
//! duplicated listening descriptors plus one end of a socket pair. Two environment variables
//! describe them:
//!
//! - [`LISTENERS_ENV`]: JSON array of `{ "network", "address", "fd" }`
//! - [`READY_FD_ENV`]: descriptor the child writes a single byte to once ready
//!
//! The parent reads that byte. End of file means the child died first.
//!
//! The executable path is resolved when the handoff is created, so a binary replaced on
//! disk by a deploy is the one the replacement runs.

use std::collections::HashSet;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{getsockname, AddressFamily, SockaddrLike, SockaddrStorage};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::handoff::{Handoff, Replacement};
use super::ReloadError;
use crate::net::{BoundSocket, ListenAddress, Network};

/// Environment variable listing inherited listeners.
pub const LISTENERS_ENV: &str = "BATON_INHERITED_LISTENERS";

/// Environment variable naming the readiness descriptor.
pub const READY_FD_ENV: &str = "BATON_READY_FD";

#[derive(Debug, Serialize, Deserialize)]
struct InheritedListener {
    network: Network,
    address: String,
    fd: RawFd,
}

/// Handoff through inherited file descriptors.
#[derive(Debug)]
pub struct FdHandoff {
    inherited: Mutex<Vec<(ListenAddress, BoundSocket)>>,
    parent: Mutex<Option<UnixStream>>,
    has_parent: bool,
    executable: Option<PathBuf>,
}

impl FdHandoff {
    /// A process with no parent to inherit from.
    pub fn fresh() -> Self {
        Self {
            inherited: Mutex::new(Vec::new()),
            parent: Mutex::new(None),
            has_parent: false,
            executable: executable_path().ok(),
        }
    }

    /// Pick up inherited state from the environment, if any.
    ///
    /// The variables are removed so they do not leak into unrelated child processes. Changing
    /// the environment races with other threads reading it: call this before spawning any.
    pub fn from_env() -> Result<Self, ReloadError> {
        let listeners = std::env::var(LISTENERS_ENV).ok();
        let ready_fd = std::env::var(READY_FD_ENV).ok();
        std::env::remove_var(LISTENERS_ENV);
        std::env::remove_var(READY_FD_ENV);

        match (listeners, ready_fd) {
            (None, None) => Ok(Self::fresh()),
            (Some(listeners), Some(ready_fd)) => Self::inherit(&listeners, &ready_fd),
            _ => Err(ReloadError::InvalidInheritance(format!(
                "both {LISTENERS_ENV} and {READY_FD_ENV} must be set"
            ))),
        }
    }

    fn inherit(listeners: &str, ready_fd: &str) -> Result<Self, ReloadError> {
        let records: Vec<InheritedListener> = serde_json::from_str(listeners)
            .map_err(|e| ReloadError::InvalidInheritance(format!("{LISTENERS_ENV}: {e}")))?;
        let ready_fd: RawFd = ready_fd
            .trim()
            .parse()
            .map_err(|e| ReloadError::InvalidInheritance(format!("{READY_FD_ENV}: {e}")))?;

        let mut seen = HashSet::new();
        for fd in records.iter().map(|r| r.fd).chain(std::iter::once(ready_fd)) {
            if !seen.insert(fd) {
                return Err(ReloadError::InvalidInheritance(format!("descriptor {fd} listed twice")));
            }
        }

        let parent = UnixStream::from(adopt(ready_fd)?);
        let mut inherited = Vec::with_capacity(records.len());
        for record in records {
            let socket = listening_socket(adopt(record.fd)?)?;
            let key = ListenAddress {
                network: record.network,
                address: record.address,
            };
            debug!(address = %key, fd = record.fd, "Found inherited listener");
            inherited.push((key, socket));
        }

        Ok(Self {
            inherited: Mutex::new(inherited),
            parent: Mutex::new(Some(parent)),
            has_parent: true,
            executable: executable_path().ok(),
        })
    }
}

impl Handoff for FdHandoff {
    fn is_supported(&self) -> bool {
        true
    }

    fn has_parent(&self) -> bool {
        self.has_parent
    }

    fn take_inherited(&self, address: &ListenAddress) -> Result<Option<BoundSocket>, ReloadError> {
        let mut inherited = self.inherited.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(position) = inherited.iter().position(|(key, _)| key == address) else {
            return Ok(None);
        };
        let (key, socket) = inherited.remove(position);

        if !socket.matches(key.network) || !bound_where_configured(&key, &socket) {
            return Err(ReloadError::InheritanceMismatch(key));
        }
        Ok(Some(socket))
    }

    fn close_unclaimed(&self) -> Vec<ListenAddress> {
        self.inherited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .map(|(key, _)| key)
            .collect()
    }

    fn spawn_replacement(&self, sockets: &[(&ListenAddress, &BoundSocket)]) -> Result<Replacement, ReloadError> {
        let exe = match &self.executable {
            Some(path) => path.clone(),
            None => executable_path().map_err(ReloadError::Spawn)?,
        };
        let (parent_end, child_end) = UnixStream::pair().map_err(ReloadError::Spawn)?;
        let child_ready = inheritable(child_end.as_fd())?;

        let mut records = Vec::with_capacity(sockets.len());
        let mut passed = Vec::with_capacity(sockets.len());
        for (key, socket) in sockets {
            let fd = inheritable(socket.as_fd())?;
            records.push(InheritedListener {
                network: key.network,
                address: key.address.clone(),
                fd: fd.as_raw_fd(),
            });
            passed.push(fd);
        }
        let listeners = serde_json::to_string(&records)
            .map_err(|e| ReloadError::Spawn(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let child = tokio::process::Command::new(&exe)
            .args(std::env::args_os().skip(1))
            .env(LISTENERS_ENV, listeners)
            .env(READY_FD_ENV, child_ready.as_raw_fd().to_string())
            .kill_on_drop(false)
            .spawn()
            .map_err(ReloadError::Spawn)?;

        // The child holds its own copies now.
        drop(passed);
        drop(child_ready);
        drop(child_end);

        let pid = child.id().unwrap_or_default();
        parent_end.set_nonblocking(true).map_err(ReloadError::Spawn)?;
        let mut parent_end = tokio::net::UnixStream::from_std(parent_end).map_err(ReloadError::Spawn)?;

        let ready = async move {
            let mut byte = [0u8; 1];
            match parent_end.read(&mut byte).await? {
                0 => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "replacement exited before signalling readiness",
                )),
                _ => Ok(()),
            }
        };
        let abort = move || {
            let mut child = child;
            if let Err(e) = child.start_kill() {
                debug!(pid, error = %e, "Replacement process already gone");
            }
        };

        Ok(Replacement::new(pid, ready, abort))
    }

    fn notify_parent(&self) -> Result<(), ReloadError> {
        let mut parent = self.parent.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut stream) = parent.take() {
            stream.write_all(&[1]).map_err(ReloadError::Notify)?;
        }
        Ok(())
    }
}

/// Path of the running binary.
fn executable_path() -> io::Result<PathBuf> {
    std::env::current_exe().map(strip_deleted_suffix)
}

/// Linux reports `<path> (deleted)` for a binary whose file was replaced after it started.
fn strip_deleted_suffix(path: PathBuf) -> PathBuf {
    match path.to_str().and_then(|p| p.strip_suffix(" (deleted)")) {
        Some(original) => PathBuf::from(original),
        None => path,
    }
}

/// Duplicate `fd` without close-on-exec so a spawned child inherits it.
fn inheritable(fd: BorrowedFd<'_>) -> Result<OwnedFd, ReloadError> {
    let dup = fd.try_clone_to_owned().map_err(ReloadError::Socket)?;
    fcntl(dup.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))
        .map_err(|e| ReloadError::Socket(io::Error::from(e)))?;
    Ok(dup)
}

/// Take ownership of a descriptor passed by the parent, re-marking it close-on-exec.
fn adopt(fd: RawFd) -> Result<OwnedFd, ReloadError> {
    if fd < 3 {
        return Err(ReloadError::InvalidInheritance(format!("descriptor {fd} is reserved for stdio")));
    }
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| ReloadError::InvalidInheritance(format!("descriptor {fd}: {e}")))?;
    // SAFETY: the parent duplicated this descriptor for this process alone, the fcntl call
    // above proved it is open, and the duplicate check in `inherit` guarantees it is
    // adopted once.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Wrap an adopted descriptor according to the family it is actually bound in.
fn listening_socket(fd: OwnedFd) -> Result<BoundSocket, ReloadError> {
    let raw = fd.as_raw_fd();
    let local: SockaddrStorage = getsockname(raw)
        .map_err(|e| ReloadError::InvalidInheritance(format!("descriptor {raw} is not a socket: {e}")))?;
    match local.family() {
        Some(AddressFamily::Unix) => Ok(BoundSocket::Unix(std::os::unix::net::UnixListener::from(fd))),
        Some(AddressFamily::Inet | AddressFamily::Inet6) => Ok(BoundSocket::Tcp(std::net::TcpListener::from(fd))),
        family => Err(ReloadError::InvalidInheritance(format!(
            "descriptor {raw} has unsupported address family {family:?}"
        ))),
    }
}

/// A TCP socket with a concrete port must still be bound to that port.
fn bound_where_configured(key: &ListenAddress, socket: &BoundSocket) -> bool {
    let BoundSocket::Tcp(listener) = socket else {
        return true;
    };
    let Ok(expected) = key.resolve_tcp() else {
        return true;
    };
    if expected.port() == 0 {
        return true;
    }
    listener
        .local_addr()
        .map(|actual| actual.port() == expected.port())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn fresh_process_has_no_parent() {
        let handoff = FdHandoff::fresh();
        assert!(handoff.is_supported());
        assert!(!handoff.has_parent());
        assert!(handoff.take_inherited(&ListenAddress::tcp("127.0.0.1:0")).unwrap().is_none());
        handoff.notify_parent().unwrap();
    }

    #[test]
    fn inherits_listeners_and_notifies_once() {
        let key = ListenAddress::tcp("127.0.0.1:0");
        let socket = BoundSocket::bind(&key).unwrap();
        let local = socket.local_addr();
        let listener_fd = inheritable(socket.as_fd()).unwrap();
        let (mut parent_end, child_end) = UnixStream::pair().unwrap();
        let ready_fd = inheritable(child_end.as_fd()).unwrap();

        let records = serde_json::to_string(&[InheritedListener {
            network: Network::Tcp,
            address: key.address.clone(),
            fd: listener_fd.as_raw_fd(),
        }])
        .unwrap();
        let ready = ready_fd.as_raw_fd().to_string();

        // Ownership moves into the handoff.
        std::mem::forget(listener_fd);
        std::mem::forget(ready_fd);
        let handoff = FdHandoff::inherit(&records, &ready).unwrap();

        assert!(handoff.has_parent());
        let adopted = handoff.take_inherited(&key).unwrap().unwrap();
        assert_eq!(adopted.local_addr(), local);
        assert!(handoff.close_unclaimed().is_empty());

        handoff.notify_parent().unwrap();
        handoff.notify_parent().unwrap();
        drop(handoff);
        drop(child_end);

        let mut received = Vec::new();
        parent_end.read_to_end(&mut received).unwrap();
        assert_eq!(received, vec![1]);
    }

    #[test]
    fn inherits_unix_sockets_and_rejects_family_mismatch() {
        let path = std::env::temp_dir().join(format!("baton-inherit-{}.sock", std::process::id()));
        let unix_key = ListenAddress::unix(path.display().to_string());
        let unix_socket = BoundSocket::bind(&unix_key).unwrap();
        let unix_fd = inheritable(unix_socket.as_fd()).unwrap();

        // Recorded as a unix socket, but the descriptor is a TCP listener.
        let liar_key = ListenAddress::unix(format!("{}.other", path.display()));
        let tcp_socket = BoundSocket::bind(&ListenAddress::tcp("127.0.0.1:0")).unwrap();
        let liar_fd = inheritable(tcp_socket.as_fd()).unwrap();

        let (_parent_end, child_end) = UnixStream::pair().unwrap();
        let ready_fd = inheritable(child_end.as_fd()).unwrap();

        let records = serde_json::to_string(&[
            InheritedListener {
                network: Network::Unix,
                address: unix_key.address.clone(),
                fd: unix_fd.as_raw_fd(),
            },
            InheritedListener {
                network: Network::Unix,
                address: liar_key.address.clone(),
                fd: liar_fd.as_raw_fd(),
            },
        ])
        .unwrap();
        let ready = ready_fd.as_raw_fd().to_string();

        std::mem::forget(unix_fd);
        std::mem::forget(liar_fd);
        std::mem::forget(ready_fd);
        let handoff = FdHandoff::inherit(&records, &ready).unwrap();

        let adopted = handoff.take_inherited(&unix_key).unwrap().unwrap();
        assert!(matches!(adopted, BoundSocket::Unix(_)));
        assert_eq!(adopted.local_addr(), path.display().to_string());

        match handoff.take_inherited(&liar_key) {
            Err(ReloadError::InheritanceMismatch(key)) => assert_eq!(key, liar_key),
            other => panic!("expected a mismatch, got {other:?}"),
        }

        drop(adopted);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn replaced_binary_resolves_to_its_path() {
        assert_eq!(
            strip_deleted_suffix(PathBuf::from("/srv/baton (deleted)")),
            PathBuf::from("/srv/baton")
        );
        assert_eq!(strip_deleted_suffix(PathBuf::from("/srv/baton")), PathBuf::from("/srv/baton"));
        assert!(FdHandoff::fresh().executable.is_some());
    }

    #[test]
    fn non_socket_descriptors_are_rejected() {
        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();
        let fd = OwnedFd::from(file);
        assert!(matches!(listening_socket(fd), Err(ReloadError::InvalidInheritance(_))));
    }

    #[test]
    fn duplicate_descriptors_are_rejected() {
        let err = FdHandoff::inherit(r#"[{"network":"tcp","address":":80","fd":7}]"#, "7").unwrap_err();
        assert!(matches!(err, ReloadError::InvalidInheritance(_)));
    }

    #[test]
    fn malformed_environment_is_rejected() {
        assert!(matches!(
            FdHandoff::inherit("not json", "9"),
            Err(ReloadError::InvalidInheritance(_))
        ));
        assert!(matches!(
            FdHandoff::inherit("[]", "stdin"),
            Err(ReloadError::InvalidInheritance(_))
        ));
        assert!(matches!(FdHandoff::inherit("[]", "1"), Err(ReloadError::InvalidInheritance(_))));
    }

    #[test]
    fn moved_port_is_a_mismatch() {
        let socket = BoundSocket::bind(&ListenAddress::tcp("127.0.0.1:0")).unwrap();
        let port = socket.local_addr().rsplit(':').next().unwrap().parse::<u16>().unwrap();
        let elsewhere = ListenAddress::tcp(format!("127.0.0.1:{}", port.wrapping_add(1).max(1)));
        assert!(!bound_where_configured(&elsewhere, &socket));
        let here = ListenAddress::tcp(format!("127.0.0.1:{port}"));
        assert!(bound_where_configured(&here, &socket));
    }
}
