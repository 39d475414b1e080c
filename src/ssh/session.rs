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

//! SSH session management.
//!
//! A [`Session`] wraps one authenticated russh transport to a gateway.
//! Credentials are tried strictly in the order the resolver produced them;
//! the first one the gateway accepts wins and later ones are never offered.
//! Channel opens are per-call fallible and do not poison the session.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{Config, Handle, Handler, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::Credential;
use crate::error::{Error, Result};
use crate::ssh::host_key::HostKeyPolicy;

/// Transport-level knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Protocol keepalive probe interval. `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,
    /// Prefer zlib compression when the server offers it.
    pub compression: bool,
    /// Bound on TCP connect plus SSH handshake per hop.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(Duration::from_secs(5)),
            compression: false,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    pub(crate) fn to_russh_config(&self) -> Config {
        let mut config = Config {
            keepalive_interval: self.keepalive_interval,
            keepalive_max: 3,
            ..Default::default()
        };
        config.preferred.compression = if self.compression {
            std::borrow::Cow::Owned(vec![
                russh::compression::ZLIB,
                russh::compression::ZLIB_LEGACY,
                russh::compression::NONE,
            ])
        } else {
            std::borrow::Cow::Owned(vec![
                russh::compression::NONE,
                russh::compression::ZLIB,
                russh::compression::ZLIB_LEGACY,
            ])
        };
        config
    }
}

/// Client handler verifying the gateway's host key against the policy.
#[derive(Debug, Clone)]
pub struct GatewayHandler {
    hostname: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl GatewayHandler {
    pub fn new(hostname: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self {
            hostname,
            port,
            policy,
        }
    }
}

impl Handler for GatewayHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        self.policy
            .verify(&self.hostname, self.port, server_public_key)?;
        Ok(true)
    }
}

/// One authenticated SSH transport to a gateway.
///
/// Cloneable and cheap to share: channel opens only need `&self`, and
/// `close` is idempotent.
#[derive(Clone)]
pub struct Session {
    handle: Arc<Handle<GatewayHandler>>,
    host: String,
    port: u16,
    username: String,
}

impl Session {
    /// Open a transport directly over TCP, verify the host key, and
    /// authenticate with the first accepted credential.
    pub async fn open(
        host: &str,
        port: u16,
        username: &str,
        credentials: &[Credential],
        policy: &HostKeyPolicy,
        config: &SessionConfig,
    ) -> Result<Self> {
        let russh_config = Arc::new(config.to_russh_config());

        let addrs: Vec<std::net::SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::Session(format!("cannot resolve {host}:{port}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::Session(format!(
                "{host}:{port} resolved to no addresses"
            )));
        }

        let mut last_err = Error::Session(format!("no connection attempt made to {host}:{port}"));
        for addr in addrs {
            let handler = GatewayHandler::new(host.to_string(), port, policy.clone());
            match timeout(
                config.connect_timeout,
                russh::client::connect(russh_config.clone(), addr, handler),
            )
            .await
            {
                Ok(Ok(handle)) => {
                    return Self::finish_open(handle, host, port, username, credentials).await;
                }
                Ok(Err(e)) => last_err = e,
                Err(_) => {
                    last_err = Error::Session(format!(
                        "connection to {addr} timed out after {:?}",
                        config.connect_timeout
                    ));
                }
            }
        }
        Err(last_err)
    }

    /// Open a transport over an already-established byte stream: a
    /// direct-tcpip channel of an outer session, or a proxy command's stdio.
    pub async fn open_over_stream<S>(
        stream: S,
        host: &str,
        port: u16,
        username: &str,
        credentials: &[Credential],
        policy: &HostKeyPolicy,
        config: &SessionConfig,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let russh_config = Arc::new(config.to_russh_config());
        let handler = GatewayHandler::new(host.to_string(), port, policy.clone());

        let handle = timeout(
            config.connect_timeout,
            russh::client::connect_stream(russh_config, stream, handler),
        )
        .await
        .map_err(|_| {
            Error::Session(format!(
                "handshake with {host}:{port} over tunnel stream timed out after {:?}",
                config.connect_timeout
            ))
        })??;

        Self::finish_open(handle, host, port, username, credentials).await
    }

    async fn finish_open(
        mut handle: Handle<GatewayHandler>,
        host: &str,
        port: u16,
        username: &str,
        credentials: &[Credential],
    ) -> Result<Self> {
        authenticate(&mut handle, username, credentials).await?;
        info!("session ready: {username}@{host}:{port}");
        Ok(Self {
            handle: Arc::new(handle),
            host: host.to_string(),
            port,
            username: username.to_string(),
        })
    }

    /// Open a `direct-tcpip` channel to `target_host:target_port`.
    ///
    /// Failure is returned to the caller; the session stays usable.
    pub async fn open_direct_tcpip(
        &self,
        target_host: &str,
        target_port: u16,
        origin: Option<(String, u16)>,
    ) -> Result<Channel<Msg>> {
        let (origin_host, origin_port) =
            origin.unwrap_or_else(|| ("127.0.0.1".to_string(), 0));
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                target_host,
                u32::from(target_port),
                origin_host,
                u32::from(origin_port),
            )
            .await?;
        Ok(channel)
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Close the transport. Idempotent; a closed session is left closed.
    /// Any task blocked on a channel of this session is unblocked.
    pub async fn close(&self) {
        if self.handle.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
        {
            debug!(
                "disconnect from {}:{} returned: {e}",
                self.host, self.port
            );
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}

/// Try credentials in order; the first success wins and later credentials
/// are never offered. If all fail the last wire error is surfaced.
async fn authenticate(
    handle: &mut Handle<GatewayHandler>,
    username: &str,
    credentials: &[Credential],
) -> Result<()> {
    if credentials.is_empty() {
        return Err(Error::NoAuthMethods);
    }

    let mut last_err = String::from("no credential attempted");

    for credential in credentials {
        let label = credential.describe();
        match try_credential(handle, username, credential).await {
            Ok(true) => {
                debug!("authenticated as {username} with {label}");
                return Ok(());
            }
            Ok(false) => {
                debug!("{label} rejected for {username}");
                last_err = format!("{label} rejected by server");
            }
            Err(e) => {
                warn!("{label} failed: {e}");
                last_err = e;
            }
        }
    }

    Err(Error::Authentication(last_err))
}

/// Offer one credential. `Ok(false)` means the server said no;
/// `Err` means the attempt itself failed (wire error, agent gone, ...).
async fn try_credential(
    handle: &mut Handle<GatewayHandler>,
    username: &str,
    credential: &Credential,
) -> std::result::Result<bool, String> {
    match credential {
        Credential::Password(password) => handle
            .authenticate_password(username, password.as_str())
            .await
            .map(|res| res.success())
            .map_err(|e| e.to_string()),
        Credential::Key(key) => {
            let hash = handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| e.to_string())?
                .flatten();
            handle
                .authenticate_publickey(username, PrivateKeyWithHashAlg::new(key.clone(), hash))
                .await
                .map(|res| res.success())
                .map_err(|e| e.to_string())
        }
        #[allow(unused_variables)]
        Credential::AgentIdentity(identity) => {
            #[cfg(target_os = "windows")]
            {
                Err("SSH agent authentication is not supported on Windows".to_string())
            }
            #[cfg(not(target_os = "windows"))]
            {
                let mut agent = russh::keys::agent::client::AgentClient::connect_env()
                    .await
                    .map_err(|e| format!("SSH agent unreachable: {e}"))?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| e.to_string())?
                    .flatten();
                handle
                    .authenticate_publickey_with(username, identity.clone(), hash, &mut agent)
                    .await
                    .map(|res| res.success())
                    .map_err(|e| e.to_string())
            }
        }
    }
}
