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

//! Per-connection forward handler.
//!
//! For every accepted local connection the handler requests a direct-tcpip
//! channel and pumps bytes both ways until either side reports EOF, an I/O
//! error occurs, or the forwarder's shutdown token fires. Failures here are
//! logged against the rule and close only this connection; the listener and
//! its sibling connections keep running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use russh::client::Msg;
use russh::Channel;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::forwarding::{ForwardingRule, SHUTTLE_BUFFER_SIZE};
use crate::ssh::session::Session;

/// Shared per-rule transfer counters, updated by every handler.
#[derive(Debug, Default)]
pub struct RuleCounters {
    pub connections_accepted: AtomicU64,
    pub connections_failed: AtomicU64,
    pub bytes_local_to_remote: AtomicU64,
    pub bytes_remote_to_local: AtomicU64,
}

impl RuleCounters {
    pub fn snapshot(&self) -> crate::forwarding::RuleStats {
        crate::forwarding::RuleStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            bytes_local_to_remote: self.bytes_local_to_remote.load(Ordering::Relaxed),
            bytes_remote_to_local: self.bytes_remote_to_local.load(Ordering::Relaxed),
        }
    }
}

/// Handle one accepted connection end to end.
///
/// Opens the channel, runs the shuttle, and makes sure the local side is
/// closed whatever happens. Errors are recorded, never propagated: a single
/// connection's failure must not take down its rule.
pub(crate) async fn handle_connection<S>(
    mut stream: S,
    peer: String,
    rule: ForwardingRule,
    session: Session,
    cancel: CancellationToken,
    counters: Arc<RuleCounters>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let channel = tokio::select! {
        result = session.open_direct_tcpip(&rule.remote.host, rule.remote.port, Some((peer.clone(), 0))) => {
            match result {
                Ok(channel) => channel,
                Err(e) => {
                    let err = Error::Handler(format!(
                        "channel to {} for {peer} failed: {e}",
                        rule.remote
                    ));
                    warn!("{err}");
                    counters.connections_failed.fetch_add(1, Ordering::Relaxed);
                    let _ = stream.shutdown().await;
                    return;
                }
            }
        }
        _ = cancel.cancelled() => {
            trace!("shutdown while opening channel for {peer}");
            let _ = stream.shutdown().await;
            return;
        }
    };

    trace!("channel open for {peer} -> {}", rule.remote);

    match run_shuttle(stream, channel, cancel, &counters).await {
        Ok(()) => {
            debug!("connection from {peer} finished");
        }
        Err(e) => {
            warn!("connection from {peer} failed: {e}");
            counters.connections_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Pump bytes both ways between a local stream and an SSH channel.
///
/// Terminates on local EOF, channel EOF/close, socket error, or
/// cancellation. Both sides are closed before returning so the peer always
/// observes EOF.
pub(crate) async fn run_shuttle<S>(
    mut stream: S,
    mut channel: Channel<Msg>,
    cancel: CancellationToken,
    counters: &RuleCounters,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; SHUTTLE_BUFFER_SIZE];
    let mut result = Ok(());

    loop {
        tokio::select! {
            // Local socket -> SSH channel.
            read = stream.read(&mut buffer) => {
                match read {
                    Ok(0) => {
                        trace!("local side closed");
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = channel.data(&buffer[..n]).await {
                            result = Err(Error::Handler(format!("channel write failed: {e}")));
                            break;
                        }
                        counters
                            .bytes_local_to_remote
                            .fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) if is_disconnect(&e) => {
                        trace!("local connection closed: {e}");
                        break;
                    }
                    Err(e) => {
                        result = Err(Error::Handler(format!("local read failed: {e}")));
                        break;
                    }
                }
            }
            // SSH channel -> local socket.
            msg = channel.wait() => {
                match msg {
                    Some(russh::ChannelMsg::Data { data }) => {
                        match stream.write_all(&data).await {
                            Ok(()) => {
                                counters
                                    .bytes_remote_to_local
                                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                            }
                            Err(e) if is_disconnect(&e) => {
                                trace!("local connection closed during write: {e}");
                                break;
                            }
                            Err(e) => {
                                result = Err(Error::Handler(format!("local write failed: {e}")));
                                break;
                            }
                        }
                    }
                    Some(russh::ChannelMsg::Eof) | Some(russh::ChannelMsg::Close) => {
                        trace!("channel ended");
                        break;
                    }
                    Some(other) => {
                        trace!("ignoring channel message: {other:?}");
                    }
                    None => {
                        trace!("channel stream ended");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                trace!("shuttle cancelled");
                break;
            }
        }
    }

    // Close both sides; in-flight bytes past this point are dropped.
    if let Err(e) = channel.eof().await {
        trace!("channel eof failed: {e}");
    }
    if let Err(e) = channel.close().await {
        trace!("channel close failed: {e}");
    }
    let _ = stream.shutdown().await;

    result
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    )
}
