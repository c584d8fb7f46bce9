//! Node configuration.
//!
//! A [`NodeConfig`] selects the architecture and caching mode that drive the
//! node's routing decisions, plus the timeouts used for network waits. It can
//! be built in code or loaded from TOML:
//!
//! ```toml
//! architecture = "server-client"
//! caching = "push-on-change"
//! is_server = true
//! request_timeout_ms = 5000
//! ```

use crate::error::{TetherError, TetherResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default bound for a remote request (milliseconds).
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default bound for a broadcast fetch (milliseconds).
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 2_000;

/// Default bound for the connect ping/pong handshake (milliseconds).
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// How nodes relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum Architecture {
    /// All nodes are equal; each owns what it stores.
    PeerToPeer,
    /// One authoritative server, restricted clients.
    ServerClient,
}

/// How non-owners see values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum Caching {
    /// Readers ask the owner on every access.
    PullOnDemand,
    /// The owner broadcasts changes; readers use their local copy.
    PushOnChange,
}

impl FromStr for Architecture {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "peer-to-peer" | "peertopeer" | "p2p" => Ok(Architecture::PeerToPeer),
            "server-client" | "serverclient" => Ok(Architecture::ServerClient),
            _ => Err(TetherError::UnsupportedArchitecture(s.to_string())),
        }
    }
}

impl FromStr for Caching {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pull-on-demand" | "pullondemand" => Ok(Caching::PullOnDemand),
            "push-on-change" | "pushonchange" => Ok(Caching::PushOnChange),
            _ => Err(TetherError::UnsupportedCaching(s.to_string())),
        }
    }
}

impl TryFrom<String> for Architecture {
    type Error = TetherError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<String> for Caching {
    type Error = TetherError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Architecture::PeerToPeer => "peer-to-peer",
            Architecture::ServerClient => "server-client",
        })
    }
}

impl fmt::Display for Caching {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Caching::PullOnDemand => "pull-on-demand",
            Caching::PushOnChange => "push-on-change",
        })
    }
}

/// Configuration for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub architecture: Architecture,
    pub caching: Caching,
    /// Whether this node is the server. Ignored for peer-to-peer.
    pub is_server: bool,
    /// Bound for a remote get/set/invoke reply.
    pub request_timeout_ms: u64,
    /// Bound for collecting fetch replies from every contact.
    pub fetch_timeout_ms: u64,
    /// Bound for the ping/pong handshake when connecting.
    pub connect_timeout_ms: u64,
    /// How many times a remote request is sent before giving up.
    pub retries: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::PeerToPeer,
            caching: Caching::PullOnDemand,
            is_server: false,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            retries: 1,
        }
    }
}

impl NodeConfig {
    /// Peer-to-peer configuration with default timeouts.
    pub fn peer_to_peer() -> Self {
        Self::default()
    }

    /// Server configuration for the server/client architecture.
    pub fn server(caching: Caching) -> Self {
        Self {
            architecture: Architecture::ServerClient,
            caching,
            is_server: true,
            ..Self::default()
        }
    }

    /// Client configuration for the server/client architecture.
    pub fn client(caching: Caching) -> Self {
        Self {
            architecture: Architecture::ServerClient,
            caching,
            is_server: false,
            ..Self::default()
        }
    }

    /// Whether this node acts as a restricted client.
    pub fn is_client(&self) -> bool {
        self.architecture == Architecture::ServerClient && !self.is_server
    }

    /// Whether this node is the server of a server/client setup.
    pub fn acts_as_server(&self) -> bool {
        self.architecture == Architecture::ServerClient && self.is_server
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(contents: &str) -> TetherResult<Self> {
        toml::from_str(contents).map_err(|e| TetherError::Config(e.to_string()))
    }

    /// Load a TOML file.
    pub fn load(path: &Path) -> TetherResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
