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

//! Per-rule local listener.
//!
//! Binds the rule's local endpoint, runs an accept loop in its own task,
//! and dispatches each accepted connection to a forward handler. After
//! `start` returns the listener is `Active` or `Failed`, never `Pending`;
//! port 0 binds record the OS-assigned port before `start` returns.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::handler::{handle_connection, RuleCounters};
use super::{ForwardingRule, ListenerState, LocalBind, RuleStats};
use crate::ssh::session::Session;

/// Address a listener actually bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundAddr::Tcp(addr) => write!(f, "{addr}"),
            BoundAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug)]
enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// One rule's listener and its accept loop.
pub(crate) struct Listener {
    rule: ForwardingRule,
    state: Arc<Mutex<ListenerState>>,
    bound: Option<BoundAddr>,
    counters: Arc<RuleCounters>,
    cancel: CancellationToken,
    force: Arc<AtomicBool>,
    accept_task: Option<JoinHandle<()>>,
    tunnel_timeout: Duration,
}

impl Listener {
    pub fn new(
        rule: ForwardingRule,
        parent_cancel: &CancellationToken,
        tunnel_timeout: Duration,
    ) -> Self {
        Self {
            rule,
            state: Arc::new(Mutex::new(ListenerState::Pending)),
            bound: None,
            counters: Arc::new(RuleCounters::default()),
            cancel: parent_cancel.child_token(),
            force: Arc::new(AtomicBool::new(false)),
            accept_task: None,
            tunnel_timeout,
        }
    }

    pub fn rule(&self) -> &ForwardingRule {
        &self.rule
    }

    pub fn state(&self) -> ListenerState {
        self.state.lock().expect("listener state lock poisoned").clone()
    }

    pub fn bound(&self) -> Option<&BoundAddr> {
        self.bound.as_ref()
    }

    /// OS-assigned port after a port-0 bind, once active.
    pub fn local_port(&self) -> Option<u16> {
        match &self.bound {
            Some(BoundAddr::Tcp(addr)) => Some(addr.port()),
            _ => None,
        }
    }

    pub fn stats(&self) -> RuleStats {
        self.counters.snapshot()
    }

    /// Bind the endpoint and start the accept loop.
    ///
    /// Returns `true` when the listener came up. On failure the state
    /// carries the bind error and `false` is returned; the caller decides
    /// whether that is fatal (readiness policy).
    pub async fn start(&mut self, session: Session, threaded: bool) -> bool {
        let acceptor = match self.bind().await {
            Ok((acceptor, bound)) => {
                info!("listening on {bound} for {}", self.rule);
                self.bound = Some(bound);
                acceptor
            }
            Err(reason) => {
                error!("bind failed for {}: {reason}", self.rule);
                self.set_state(ListenerState::Failed(reason));
                return false;
            }
        };

        let rule = self.rule.clone();
        let counters = Arc::clone(&self.counters);
        let cancel = self.cancel.clone();
        let force = Arc::clone(&self.force);
        let tunnel_timeout = self.tunnel_timeout;

        self.accept_task = Some(tokio::spawn(accept_loop(
            acceptor,
            rule,
            session,
            threaded,
            counters,
            cancel,
            force,
            tunnel_timeout,
        )));

        self.set_state(ListenerState::Active);
        true
    }

    async fn bind(&self) -> Result<(Acceptor, BoundAddr), String> {
        match &self.rule.local {
            LocalBind::Tcp { port, .. } => {
                let host = self.rule.local.effective_host();
                let listener = TcpListener::bind((host, *port))
                    .await
                    .map_err(|e| format!("cannot bind {host}:{port}: {e}"))?;
                let addr = listener
                    .local_addr()
                    .map_err(|e| format!("cannot read bound address: {e}"))?;
                Ok((Acceptor::Tcp(listener), BoundAddr::Tcp(addr)))
            }
            #[cfg(unix)]
            LocalBind::Unix(path) => {
                let listener = UnixListener::bind(path)
                    .map_err(|e| format!("cannot bind {}: {e}", path.display()))?;
                Ok((Acceptor::Unix(listener), BoundAddr::Unix(path.clone())))
            }
            #[cfg(not(unix))]
            LocalBind::Unix(path) => Err(format!(
                "UNIX socket binds are not supported on this platform: {}",
                path.display()
            )),
        }
    }

    /// Stop the accept loop and drain handlers.
    ///
    /// `force` aborts in-flight handlers instead of letting them flush.
    /// Returns `false` when the drain exceeded the tunnel timeout and had
    /// to be abandoned.
    pub async fn stop(&mut self, force: bool) -> bool {
        if force {
            self.force.store(true, Ordering::SeqCst);
        }
        self.cancel.cancel();

        let mut clean = true;
        if let Some(task) = self.accept_task.take() {
            // The loop itself drains within tunnel_timeout; the extra slice
            // covers scheduling.
            let budget = self.tunnel_timeout + Duration::from_secs(1);
            match timeout(budget, task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("accept loop for {} did not stop in {budget:?}", self.rule);
                    clean = false;
                }
            }
        }

        // Leave a Failed state visible; it is part of the start report.
        if self.state().is_up() || self.state() == ListenerState::Pending {
            self.set_state(ListenerState::Stopped);
        }

        #[cfg(unix)]
        if let Some(BoundAddr::Unix(path)) = &self.bound {
            let _ = std::fs::remove_file(path);
        }
        self.bound = None;

        clean
    }

    /// Probe the bound endpoint with a connect-and-close. Diagnostics only.
    pub async fn probe(&self) -> bool {
        match &self.bound {
            Some(BoundAddr::Tcp(addr)) => TcpStream::connect(addr).await.is_ok(),
            #[cfg(unix)]
            Some(BoundAddr::Unix(path)) => UnixStream::connect(path).await.is_ok(),
            #[cfg(not(unix))]
            Some(BoundAddr::Unix(_)) => false,
            None => false,
        }
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.lock().expect("listener state lock poisoned") = state;
    }
}

/// The accept loop: one per rule, runs until cancellation.
///
/// Dispatch is concurrent by default so one connection cannot block the
/// next; with `threaded == false` connections are served one at a time.
#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    acceptor: Acceptor,
    rule: ForwardingRule,
    session: Session,
    threaded: bool,
    counters: Arc<RuleCounters>,
    cancel: CancellationToken,
    force: Arc<AtomicBool>,
    tunnel_timeout: Duration,
) {
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = accept_one(&acceptor) => {
                match accepted {
                    Ok((stream, peer)) => {
                        trace!("accepted {peer} on {rule}");
                        counters.connections_accepted.fetch_add(1, Ordering::Relaxed);

                        let conn = handle_connection(
                            stream,
                            peer,
                            rule.clone(),
                            session.clone(),
                            cancel.clone(),
                            Arc::clone(&counters),
                        );
                        if threaded {
                            handlers.spawn(conn);
                        } else {
                            conn.await;
                        }
                    }
                    Err(e) => {
                        error!("accept failed on {rule}: {e}");
                        counters.connections_failed.fetch_add(1, Ordering::Relaxed);
                        // Avoid a hot loop on persistent accept errors.
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = cancel.cancelled() => {
                debug!("accept loop for {rule} stopping");
                break;
            }
        }
    }

    // Unbind before draining so no connection sneaks in during teardown.
    drop(acceptor);

    if force.load(Ordering::SeqCst) {
        handlers.abort_all();
    }

    let deadline = tokio::time::Instant::now() + tunnel_timeout;
    loop {
        match tokio::time::timeout_at(deadline, handlers.join_next()).await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                warn!("handlers for {rule} exceeded drain budget, aborting");
                handlers.abort_all();
                while handlers.join_next().await.is_some() {}
                break;
            }
        }
    }

    debug!("accept loop for {rule} stopped");
}

/// Accept a single connection, erasing the TCP/UNIX difference behind a
/// boxed duplex stream.
async fn accept_one(
    acceptor: &Acceptor,
) -> std::io::Result<(Box<dyn DuplexStream>, String)> {
    match acceptor {
        Acceptor::Tcp(listener) => {
            let (stream, peer) = listener.accept().await?;
            Ok((Box::new(stream), peer.to_string()))
        }
        #[cfg(unix)]
        Acceptor::Unix(listener) => {
            let (stream, _) = listener.accept().await?;
            Ok((Box::new(stream), "unix-client".to_string()))
        }
    }
}

/// Object-safe alias for the stream types handlers shuttle on. Tokio's
/// blanket impls make `Box<dyn DuplexStream>` itself readable/writable.
pub(crate) trait DuplexStream:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send
{
}

impl DuplexStream for TcpStream {}
#[cfg(unix)]
impl DuplexStream for UnixStream {}
