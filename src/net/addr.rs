//! Listen addresses keyed by network family.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors raised while parsing or resolving a listen address.
#[derive(Debug, thiserror::Error)]
pub enum ListenAddressError {
    /// The network family is not one of `tcp`, `tcp4`, `tcp6` or `unix`.
    #[error("unknown network '{0}' (expected tcp, tcp4, tcp6 or unix)")]
    UnknownNetwork(String),

    /// The address part is empty.
    #[error("empty address for network '{0}'")]
    EmptyAddress(Network),

    /// The address could not be resolved to a socket address of the right family.
    #[error("cannot resolve '{address}' for network '{network}': {reason}")]
    Unresolvable {
        network: Network,
        address: String,
        reason: String,
    },

    /// A `network:address` string has no separator.
    #[error("missing network prefix in '{0}' (expected e.g. tcp:127.0.0.1:8080)")]
    MissingNetwork(String),
}

/// Network family of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    #[serde(alias = "unixsocket")]
    Unix,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Unix => "unix",
        }
    }

    pub fn is_tcp(&self) -> bool {
        !matches!(self, Self::Unix)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ListenAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "unix" | "unixsocket" => Ok(Self::Unix),
            _ => Err(ListenAddressError::UnknownNetwork(s.to_string())),
        }
    }
}

/// Where a listener binds: a network family and an address within it.
///
/// The pair, exactly as configured, is also the key under which a socket is handed to a
/// replacement process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenAddress {
    pub network: Network,
    pub address: String,
}

impl ListenAddress {
    /// Build an address from configuration strings.
    pub fn new(network: &str, address: impl Into<String>) -> Result<Self, ListenAddressError> {
        let network = network.parse::<Network>()?;
        let address = address.into();
        if address.trim().is_empty() {
            return Err(ListenAddressError::EmptyAddress(network));
        }
        Ok(Self { network, address })
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network: Network::Tcp,
            address: address.into(),
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            network: Network::Unix,
            address: path.into(),
        }
    }

    /// Resolve a TCP address to the first socket address matching the family.
    ///
    /// An empty host (`:8080`) binds every interface of the family.
    pub fn resolve_tcp(&self) -> Result<SocketAddr, ListenAddressError> {
        let unresolvable = |reason: String| ListenAddressError::Unresolvable {
            network: self.network,
            address: self.address.clone(),
            reason,
        };

        if !self.network.is_tcp() {
            return Err(unresolvable("not a TCP network".to_string()));
        }

        let address = match self.address.strip_prefix(':') {
            Some(port) if self.network == Network::Tcp6 => format!("[::]:{port}"),
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.address.clone(),
        };

        let candidates = address
            .to_socket_addrs()
            .map_err(|e| unresolvable(e.to_string()))?;

        let mut candidates = candidates.filter(|addr| match self.network {
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
            _ => true,
        });

        candidates
            .next()
            .ok_or_else(|| unresolvable("no address of the requested family".to_string()))
    }

    /// Filesystem path of a Unix domain socket address.
    pub fn unix_path(&self) -> Option<PathBuf> {
        match self.network {
            Network::Unix => Some(PathBuf::from(&self.address)),
            _ => None,
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

impl FromStr for ListenAddress {
    type Err = ListenAddressError;

    /// Parse the `network:address` form, e.g. `tcp:127.0.0.1:9001` or `unix:/run/app.sock`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (network, address) = s
            .split_once(':')
            .ok_or_else(|| ListenAddressError::MissingNetwork(s.to_string()))?;
        Self::new(network, address)
    }
}
