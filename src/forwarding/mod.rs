// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Port forwarding rules and the machinery that serves them.
//!
//! A [`ForwardingRule`] pairs a local bind endpoint (TCP or UNIX socket)
//! with a remote target reachable from the gateway. The
//! [`forwarder::TunnelForwarder`] owns one listener per rule; each accepted
//! connection gets a direct-tcpip channel and a bidirectional byte shuttle.

pub mod forwarder;
pub mod handler;
pub mod listener;

pub use forwarder::{ForwarderGuard, ForwarderState, TunnelForwarder};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Per-socket read slice. Blocking reads observe cancellation at this
/// granularity, which bounds how long a forced stop can take.
pub const SSH_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on a graceful stop before it escalates to forced close.
pub const TUNNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed buffer size for the byte shuttles.
pub const SHUTTLE_BUFFER_SIZE: usize = 16 * 1024;

/// Local endpoint a rule listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalBind {
    /// TCP bind. An empty host means loopback; port 0 means OS-assigned.
    Tcp { host: String, port: u16 },
    /// UNIX domain socket bind (absolute path). Rejected on non-POSIX.
    Unix(PathBuf),
}

impl LocalBind {
    /// Effective host to bind: loopback when unset.
    pub fn effective_host(&self) -> &str {
        match self {
            LocalBind::Tcp { host, .. } if host.is_empty() => "127.0.0.1",
            LocalBind::Tcp { host, .. } => host,
            LocalBind::Unix(_) => "",
        }
    }
}

impl fmt::Display for LocalBind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalBind::Tcp { port, .. } => write!(f, "{}:{port}", self.effective_host()),
            LocalBind::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Remote target address, interpreted on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One forwarding rule. Immutable once the forwarder has started.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardingRule {
    pub local: LocalBind,
    pub remote: RemoteTarget,
}

impl ForwardingRule {
    pub fn new(local: LocalBind, remote: RemoteTarget) -> Self {
        Self { local, remote }
    }

    /// Parse a local bind specification from the CLI.
    ///
    /// Accepted forms: `port`, `host:port`, or an absolute socket path.
    pub fn parse_local(spec: &str) -> Result<LocalBind> {
        if spec.starts_with('/') {
            return Ok(LocalBind::Unix(PathBuf::from(spec)));
        }

        if let Ok(port) = spec.parse::<u16>() {
            return Ok(LocalBind::Tcp {
                host: String::new(),
                port,
            });
        }

        let (host, port) = split_host_port(spec)?;
        Ok(LocalBind::Tcp { host, port })
    }

    /// Parse a remote target specification from the CLI: `host:port`.
    pub fn parse_remote(spec: &str) -> Result<RemoteTarget> {
        let (host, port) = split_host_port(spec)?;
        if host.is_empty() {
            return Err(Error::Config(format!(
                "remote target '{spec}' is missing a host"
            )));
        }
        if port == 0 {
            return Err(Error::Config(format!(
                "remote target '{spec}' must use a nonzero port"
            )));
        }
        Ok(RemoteTarget { host, port })
    }

    /// Validate this rule's addresses and ports.
    pub fn validate(&self) -> Result<()> {
        crate::validation::check_address(&self.local)?;
        crate::validation::check_host(&self.remote.host)?;
        if self.remote.port == 0 {
            return Err(Error::Config(format!(
                "remote target {} must use a nonzero port",
                self.remote
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ForwardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Split `host:port`, handling bracketed IPv6 literals (`[::1]:8080`).
fn split_host_port(spec: &str) -> Result<(String, u16)> {
    let (host, port_str) = if let Some(rest) = spec.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(|| {
            Error::Config(format!("'{spec}' has an unterminated IPv6 bracket"))
        })?;
        let port_str = rest.strip_prefix(':').ok_or_else(|| {
            Error::Config(format!("'{spec}' is missing a port after the IPv6 host"))
        })?;
        (host.to_string(), port_str)
    } else {
        let (host, port_str) = spec.rsplit_once(':').ok_or_else(|| {
            Error::Config(format!("'{spec}' is not of the form host:port"))
        })?;
        (host.to_string(), port_str)
    };

    let port = port_str
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("'{port_str}' is not a valid port in '{spec}'")))?;
    Ok((host, port))
}

/// State of a single rule's listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Created but not yet started.
    Pending,
    /// Bound and accepting.
    Active,
    /// Bind or accept-loop start failed.
    Failed(String),
    /// Stopped by the forwarder.
    Stopped,
}

impl ListenerState {
    pub fn is_up(&self) -> bool {
        matches!(self, ListenerState::Active)
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Pending => write!(f, "pending"),
            ListenerState::Active => write!(f, "active"),
            ListenerState::Failed(err) => write!(f, "failed: {err}"),
            ListenerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Transfer counters for one rule, aggregated over its connections.
#[derive(Debug, Default, Clone)]
pub struct RuleStats {
    pub connections_accepted: u64,
    pub connections_failed: u64,
    pub bytes_local_to_remote: u64,
    pub bytes_remote_to_local: u64,
}

impl RuleStats {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_local_to_remote + self.bytes_remote_to_local
    }
}
