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

//! Multi-hop gateway chains.
//!
//! For gateways `G₁ … Gₙ` the client connects to `G₁` directly; each
//! further session runs over a direct-tcpip channel of the previous one.
//! Forwarding rules attach to the innermost session only. A failure while
//! building the chain unwinds every session opened so far; teardown closes
//! the innermost session first and works back out.

use tracing::{debug, info};

use crate::auth::Credential;
use crate::error::{Error, Result};
use crate::ssh::host_key::HostKeyPolicy;
use crate::ssh::proxy::ProxyCommand;
use crate::ssh::session::{Session, SessionConfig};

/// One hop in the chain, fully resolved (no aliases, no default ports).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hop {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl std::fmt::Display for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// An open chain of sessions, outermost first.
#[derive(Debug)]
pub(crate) struct GatewayChain {
    sessions: Vec<Session>,
}

impl GatewayChain {
    /// Open sessions hop by hop. The same credential list and host-key
    /// policy apply to every hop; the optional outer proxy applies to the
    /// first hop only.
    pub async fn open(
        hops: &[Hop],
        credentials: &[Credential],
        policy: &HostKeyPolicy,
        config: &SessionConfig,
        proxy: Option<&ProxyCommand>,
    ) -> Result<Self> {
        if hops.is_empty() {
            return Err(Error::Config("gateway chain is empty".to_string()));
        }

        let mut sessions: Vec<Session> = Vec::with_capacity(hops.len());

        for (i, hop) in hops.iter().enumerate() {
            let attempt = if let Some(previous) = sessions.last() {
                debug!("opening hop {} of {}: {hop} via previous session", i + 1, hops.len());
                open_via(previous, hop, credentials, policy, config).await
            } else if let Some(proxy) = proxy {
                debug!("opening first hop {hop} via proxy");
                open_via_proxy(proxy, hop, credentials, policy, config).await
            } else {
                debug!("opening first hop {hop} directly");
                Session::open(
                    &hop.host,
                    hop.port,
                    &hop.username,
                    credentials,
                    policy,
                    config,
                )
                .await
            };

            match attempt {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    // Unwind everything opened so far, innermost first.
                    for session in sessions.iter().rev() {
                        session.close().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(
            "gateway chain up through {} hop(s), rules attach to {}",
            sessions.len(),
            hops.last().expect("chain checked non-empty")
        );
        Ok(Self { sessions })
    }

    /// The innermost session; forwarding rules attach here.
    pub fn session(&self) -> &Session {
        self.sessions.last().expect("chain is never empty")
    }

    /// Close the chain, innermost session first.
    pub async fn close(&self) {
        for session in self.sessions.iter().rev() {
            session.close().await;
        }
    }
}

async fn open_via(
    previous: &Session,
    hop: &Hop,
    credentials: &[Credential],
    policy: &HostKeyPolicy,
    config: &SessionConfig,
) -> Result<Session> {
    let channel = previous
        .open_direct_tcpip(&hop.host, hop.port, None)
        .await
        .map_err(|e| {
            Error::Session(format!(
                "cannot tunnel to {hop} through {}:{}: {e}",
                previous.host(),
                previous.port()
            ))
        })?;

    Session::open_over_stream(
        channel.into_stream(),
        &hop.host,
        hop.port,
        &hop.username,
        credentials,
        policy,
        config,
    )
    .await
}

async fn open_via_proxy(
    proxy: &ProxyCommand,
    hop: &Hop,
    credentials: &[Credential],
    policy: &HostKeyPolicy,
    config: &SessionConfig,
) -> Result<Session> {
    let stream = proxy.connect(&hop.host, hop.port).await?;
    Session::open_over_stream(
        stream,
        &hop.host,
        hop.port,
        &hop.username,
        credentials,
        policy,
        config,
    )
    .await
}
