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

//! The tunnel forwarder orchestrator.
//!
//! Owns the credential resolver output, the gateway chain, and one listener
//! per forwarding rule. `start` brings everything up and applies the
//! readiness policy; `stop` tears everything down within a bounded time and
//! never raises. The control path is serialized: at most one `start` or
//! `stop` runs at a time, and a `stop` arriving during `start` cancels the
//! in-flight startup, which unwinds before `stop` proceeds.
//!
//! Lock discipline: the state mutex is only ever held for short,
//! non-blocking sections. Listener and session teardown happen with the
//! mutex released, which is what keeps `stop` deadlock-free even when
//! called while handlers are mid-transfer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::{BoundAddr, Listener};
use super::{ListenerState, LocalBind, RuleStats};
use crate::auth::CredentialResolver;
use crate::chain::{GatewayChain, Hop};
use crate::error::{Error, ListenerFailure, Result};
use crate::options::{ForwarderOptions, GatewayAddress};
use crate::ssh::proxy::ProxyCommand;
use crate::ssh::session::SessionConfig;
use crate::ssh_config::{HostConfig, SshConfig};

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ForwarderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ForwarderState::Created => "created",
            ForwarderState::Starting => "starting",
            ForwarderState::Running => "running",
            ForwarderState::Stopping => "stopping",
            ForwarderState::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

struct Inner {
    state: ForwarderState,
    cancel: CancellationToken,
    listeners: Vec<Listener>,
    chain: Option<GatewayChain>,
    tunnel_is_up: HashMap<LocalBind, bool>,
}

/// A set of forwarding rules served over one SSH session (possibly reached
/// through a gateway chain).
///
/// Restart after `Stopped` is permitted; `start` on a running forwarder is
/// a no-op with a warning.
pub struct TunnelForwarder {
    opts: ForwarderOptions,
    control: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

impl TunnelForwarder {
    /// Validate the options and create a forwarder in `Created` state.
    /// No sockets are touched until [`start`](Self::start).
    pub fn new(opts: ForwarderOptions) -> Result<Self> {
        let binds: Vec<LocalBind> = opts.rules.iter().map(|r| r.local.clone()).collect();
        crate::validation::check_addresses(&binds)?;
        for rule in &opts.rules {
            rule.validate()?;
        }

        let mut seen = std::collections::HashSet::new();
        for bind in &binds {
            if !seen.insert(bind.clone()) {
                return Err(Error::Config(format!(
                    "duplicate local bind address: {bind}"
                )));
            }
        }

        let tunnel_is_up = binds.into_iter().map(|b| (b, false)).collect();

        Ok(Self {
            opts,
            control: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner {
                state: ForwarderState::Created,
                cancel: CancellationToken::new(),
                listeners: Vec::new(),
                chain: None,
                tunnel_is_up,
            }),
        })
    }

    pub fn state(&self) -> ForwarderState {
        self.lock_inner().state
    }

    /// Listener health per local bind, as of the last start/stop/probe.
    pub fn tunnel_is_up(&self) -> HashMap<LocalBind, bool> {
        self.lock_inner().tunnel_is_up.clone()
    }

    /// Addresses actually bound, in rule order. Empty unless running.
    pub fn local_bind_addresses(&self) -> Vec<BoundAddr> {
        self.lock_inner()
            .listeners
            .iter()
            .filter_map(|l| l.bound().cloned())
            .collect()
    }

    /// TCP ports actually bound, in rule order. Port-0 rules report the
    /// OS-assigned port here once `start` has returned.
    pub fn local_bind_ports(&self) -> Vec<u16> {
        self.lock_inner()
            .listeners
            .iter()
            .filter_map(|l| l.local_port())
            .collect()
    }

    /// Transfer counters per rule.
    pub fn rule_stats(&self) -> HashMap<LocalBind, RuleStats> {
        self.lock_inner()
            .listeners
            .iter()
            .map(|l| (l.rule().local.clone(), l.stats()))
            .collect()
    }

    /// Bring the forwarder up: validate, resolve credentials, open the
    /// gateway chain, start every listener in parallel, then apply the
    /// readiness policy.
    pub async fn start(&self) -> Result<()> {
        let _ctl = self.control.lock().await;

        let cancel = {
            let mut inner = self.lock_inner();
            match inner.state {
                ForwarderState::Running | ForwarderState::Starting => {
                    warn!("start called on a {} forwarder, ignoring", inner.state);
                    return Ok(());
                }
                ForwarderState::Stopping => {
                    warn!("start called while stopping, ignoring");
                    return Ok(());
                }
                ForwarderState::Created | ForwarderState::Stopped => {
                    inner.state = ForwarderState::Starting;
                    inner.cancel = CancellationToken::new();
                    inner.cancel.clone()
                }
            }
        };

        match self.start_impl(&cancel).await {
            Ok((chain, listeners)) => {
                let mut inner = self.lock_inner();
                if inner.state != ForwarderState::Starting {
                    // A concurrent stop hijacked the state machine; undo.
                    drop(inner);
                    let mut listeners = listeners;
                    for listener in &mut listeners {
                        listener.stop(true).await;
                    }
                    chain.close().await;
                    return Err(Error::Session(
                        "start cancelled by concurrent stop".to_string(),
                    ));
                }
                for listener in &listeners {
                    inner
                        .tunnel_is_up
                        .insert(listener.rule().local.clone(), listener.state().is_up());
                }
                self.spawn_session_watchdog(&chain, &cancel);
                inner.chain = Some(chain);
                inner.listeners = listeners;
                inner.state = ForwarderState::Running;
                info!("forwarder running with {} rule(s)", self.opts.rules.len());
                Ok(())
            }
            Err(e) => {
                let mut inner = self.lock_inner();
                if inner.state == ForwarderState::Starting {
                    inner.state = ForwarderState::Stopped;
                }
                for up in inner.tunnel_is_up.values_mut() {
                    *up = false;
                }
                Err(e)
            }
        }
    }

    async fn start_impl(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(GatewayChain, Vec<Listener>)> {
        // Rules are immutable, but start is the contract point for raising
        // configuration errors, so they are checked here as well.
        let binds: Vec<LocalBind> = self.opts.rules.iter().map(|r| r.local.clone()).collect();
        crate::validation::check_addresses(&binds)?;
        for rule in &self.opts.rules {
            rule.validate()?;
        }

        let ssh_config = self.load_ssh_config()?;
        let (hops, proxy, compression, identity_files) = self.resolve_gateways(&ssh_config)?;

        let resolver = CredentialResolver::from_options(&self.opts, &identity_files);
        let credentials = resolver.resolve().await?;

        let session_config = SessionConfig {
            keepalive_interval: if self.opts.set_keepalive > 0.0 {
                Some(std::time::Duration::from_secs_f64(self.opts.set_keepalive))
            } else {
                None
            },
            compression,
            connect_timeout: self.opts.connect_timeout,
        };

        let chain = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Session("start cancelled by stop".to_string()));
            }
            result = GatewayChain::open(
                &hops,
                &credentials,
                &self.opts.host_key_policy,
                &session_config,
                proxy.as_ref(),
            ) => result?,
        };

        if cancel.is_cancelled() {
            chain.close().await;
            return Err(Error::Session("start cancelled by stop".to_string()));
        }

        // Start one listener per rule, in parallel; every listener reaches a
        // terminal state before we evaluate readiness.
        let mut starting: JoinSet<Listener> = JoinSet::new();
        for rule in &self.opts.rules {
            let mut listener =
                Listener::new(rule.clone(), cancel, self.opts.tunnel_timeout);
            let session = chain.session().clone();
            let threaded = self.opts.threaded;
            starting.spawn(async move {
                listener.start(session, threaded).await;
                listener
            });
        }

        let mut listeners = Vec::with_capacity(self.opts.rules.len());
        while let Some(joined) = starting.join_next().await {
            listeners.push(joined.expect("listener start task panicked"));
        }
        // JoinSet yields in completion order; keep rule order for reporting.
        listeners.sort_by_key(|l| {
            self.opts
                .rules
                .iter()
                .position(|r| r == l.rule())
                .unwrap_or(usize::MAX)
        });

        let failures: Vec<ListenerFailure> = listeners
            .iter()
            .filter_map(|l| match l.state() {
                ListenerState::Failed(reason) => Some(ListenerFailure {
                    local_bind: l.rule().local.to_string(),
                    reason,
                }),
                _ => None,
            })
            .collect();

        if !failures.is_empty() {
            if self.opts.mute_exceptions {
                warn!(
                    "{} rule(s) failed to bind, continuing (mute_exceptions)",
                    failures.len()
                );
            } else {
                for listener in &mut listeners {
                    listener.stop(false).await;
                }
                chain.close().await;
                return Err(Error::Listener(failures));
            }
        }

        if cancel.is_cancelled() {
            for listener in &mut listeners {
                listener.stop(true).await;
            }
            chain.close().await;
            return Err(Error::Session("start cancelled by stop".to_string()));
        }

        Ok((chain, listeners))
    }

    /// Graceful stop: listeners drain within the tunnel timeout, then the
    /// session chain closes. Idempotent; never raises.
    pub async fn stop(&self) {
        self.stop_with(false).await;
    }

    /// Forced stop: in-flight handlers are aborted instead of drained.
    pub async fn stop_force(&self) {
        self.stop_with(true).await;
    }

    async fn stop_with(&self, force: bool) {
        {
            let mut inner = self.lock_inner();
            match inner.state {
                ForwarderState::Running | ForwarderState::Starting => {
                    inner.state = ForwarderState::Stopping;
                }
                _ => {
                    debug!("stop called on a {} forwarder, no-op", inner.state);
                    return;
                }
            }
            // Cancel before taking the control lock so an in-flight start
            // observes it and unwinds instead of deadlocking against us.
            inner.cancel.cancel();
        }

        let _ctl = self.control.lock().await;

        let (mut listeners, chain) = {
            let mut inner = self.lock_inner();
            (std::mem::take(&mut inner.listeners), inner.chain.take())
        };

        let mut timed_out = false;
        for listener in &mut listeners {
            if !listener.stop(force).await {
                timed_out = true;
            }
        }
        if timed_out {
            warn!("{}", Error::ShutdownTimeout(self.opts.tunnel_timeout));
        }

        if let Some(chain) = chain {
            chain.close().await;
        }

        let mut inner = self.lock_inner();
        inner.state = ForwarderState::Stopped;
        for up in inner.tunnel_is_up.values_mut() {
            *up = false;
        }
        info!("forwarder stopped");
    }

    /// `stop` followed by `start`.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    /// Probe every listener with a connect-and-close and refresh
    /// `tunnel_is_up`. Diagnostics only; never attempts recovery.
    pub async fn check_tunnels(&self) -> HashMap<LocalBind, bool> {
        let targets: Vec<(LocalBind, Option<BoundAddr>)> = {
            let inner = self.lock_inner();
            inner
                .listeners
                .iter()
                .map(|l| (l.rule().local.clone(), l.bound().cloned()))
                .collect()
        };

        let mut results = HashMap::new();
        for (bind, bound) in targets {
            let up = match bound {
                Some(BoundAddr::Tcp(addr)) => {
                    tokio::net::TcpStream::connect(addr).await.is_ok()
                }
                #[cfg(unix)]
                Some(BoundAddr::Unix(path)) => {
                    tokio::net::UnixStream::connect(&path).await.is_ok()
                }
                #[cfg(not(unix))]
                Some(BoundAddr::Unix(_)) => false,
                None => false,
            };
            results.insert(bind, up);
        }

        {
            let mut inner = self.lock_inner();
            for (bind, up) in &results {
                inner.tunnel_is_up.insert(bind.clone(), *up);
            }
        }
        results
    }

    /// Start and return a guard that force-stops on every exit path,
    /// including early returns, errors, and unwinding.
    pub async fn scoped(self: Arc<Self>) -> Result<ForwarderGuard> {
        self.start().await?;
        Ok(ForwarderGuard {
            forwarder: self,
            disarmed: false,
        })
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("forwarder state lock poisoned")
    }

    /// Watch the innermost session and cancel every worker once it dies,
    /// so a lost gateway ends the tunnels within one poll slice of the
    /// keepalive declaring the peer dead.
    fn spawn_session_watchdog(&self, chain: &GatewayChain, cancel: &CancellationToken) {
        let session = chain.session().clone();
        let cancel = cancel.clone();
        let poll = self.opts.ssh_timeout;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(poll) => {
                        if session.is_closed() {
                            warn!("SSH session lost, cancelling tunnels");
                            cancel.cancel();
                            return;
                        }
                    }
                }
            }
        });
    }

    fn load_ssh_config(&self) -> Result<SshConfig> {
        match &self.opts.ssh_config_file {
            Some(path) if path.exists() => SshConfig::load(path),
            _ => Ok(SshConfig::default()),
        }
    }

    /// Resolve the gateway chain against the SSH config: aliases, ports,
    /// usernames, the outer proxy, compression, and IdentityFile entries
    /// contributed by the final gateway's block.
    #[allow(clippy::type_complexity)]
    fn resolve_gateways(
        &self,
        ssh_config: &SshConfig,
    ) -> Result<(Vec<Hop>, Option<ProxyCommand>, bool, Vec<std::path::PathBuf>)> {
        let addresses = self.opts.gateway_chain();
        let mut hops = Vec::with_capacity(addresses.len());
        let mut proxy = self.opts.ssh_proxy.clone();
        let mut compression = self.opts.compression;
        let mut identity_files = Vec::new();

        for (i, address) in addresses.iter().enumerate() {
            let resolved = ssh_config.lookup(&address.host);
            let is_final = i == addresses.len() - 1;

            let hop = resolve_hop(address, &resolved, self.opts.ssh_username.as_deref())?;

            if is_final {
                identity_files = resolved.identity_files.clone();
                if let Some(cfg_compression) = resolved.compression {
                    compression = compression || cfg_compression;
                }
            }
            // A ProxyCommand only makes sense for the first hop; later hops
            // ride inside the previous session.
            if i == 0 && proxy.is_none() && self.opts.ssh_proxy_enabled {
                if let Some(command) = &resolved.proxy_command {
                    proxy = Some(ProxyCommand::Command(command.clone()));
                }
            }

            hops.push(hop);
        }

        if !self.opts.ssh_proxy_enabled {
            proxy = None;
        }

        Ok((hops, proxy, compression, identity_files))
    }
}

impl std::fmt::Debug for TunnelForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelForwarder")
            .field("gateway", &self.opts.ssh_address_or_host)
            .field("rules", &self.opts.rules.len())
            .field("state", &self.state())
            .finish()
    }
}

fn resolve_hop(
    address: &GatewayAddress,
    resolved: &HostConfig,
    default_username: Option<&str>,
) -> Result<Hop> {
    let host = resolved
        .hostname
        .clone()
        .unwrap_or_else(|| address.host.clone());
    let port = address.port.or(resolved.port).unwrap_or(22);
    let username = address
        .username
        .clone()
        .or_else(|| default_username.map(str::to_string))
        .or_else(|| resolved.user.clone())
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .ok_or_else(|| {
            Error::Config(format!("no username for gateway {}", address.host))
        })?;

    Ok(Hop {
        host,
        port,
        username,
    })
}

/// Scope guard for a started forwarder.
///
/// Dropping the guard cancels every worker synchronously and finishes the
/// forced stop on the runtime, so a panic or early `?` inside the scope
/// still tears the tunnels down. Prefer [`ForwarderGuard::stop`] on the
/// clean path to wait for the teardown to complete.
pub struct ForwarderGuard {
    forwarder: Arc<TunnelForwarder>,
    disarmed: bool,
}

impl ForwarderGuard {
    /// Explicit forced stop; consumes the guard and waits for teardown.
    pub async fn stop(mut self) {
        self.disarmed = true;
        self.forwarder.stop_force().await;
    }

    pub fn forwarder(&self) -> &TunnelForwarder {
        &self.forwarder
    }
}

impl std::ops::Deref for ForwarderGuard {
    type Target = TunnelForwarder;

    fn deref(&self) -> &Self::Target {
        &self.forwarder
    }
}

impl Drop for ForwarderGuard {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        // Unblock every worker right now, even without a runtime.
        self.forwarder.lock_inner().cancel.cancel();

        let forwarder = Arc::clone(&self.forwarder);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                forwarder.stop_force().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::{ForwardingRule, RemoteTarget};

    fn options_for(rules: Vec<ForwardingRule>) -> ForwarderOptions {
        let mut builder = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gw.example.com"))
            .ssh_password("pw")
            .allow_agent(false)
            // Keep tests hermetic: never read the developer's own config.
            .ssh_config_file("/nonexistent/ssh_config")
            .host_pkey_directories(Vec::new());
        for rule in rules {
            builder = builder.rule(rule);
        }
        builder.build().unwrap()
    }

    fn loopback_rule(port: u16) -> ForwardingRule {
        ForwardingRule::new(
            LocalBind::Tcp {
                host: String::new(),
                port,
            },
            RemoteTarget {
                host: "127.0.0.1".to_string(),
                port: 9000,
            },
        )
    }

    #[test]
    fn test_new_starts_created_with_tunnels_down() {
        let forwarder = TunnelForwarder::new(options_for(vec![loopback_rule(0)])).unwrap();
        assert_eq!(forwarder.state(), ForwarderState::Created);

        let up = forwarder.tunnel_is_up();
        assert_eq!(up.len(), 1);
        assert!(up.values().all(|v| !v));
        assert!(forwarder.local_bind_ports().is_empty());
    }

    #[test]
    fn test_new_rejects_duplicate_binds() {
        let err =
            TunnelForwarder::new(options_for(vec![loopback_rule(18080), loopback_rule(18080)]))
                .unwrap_err();
        assert!(err.to_string().contains("duplicate local bind"));
    }

    #[test]
    fn test_new_rejects_invalid_remote() {
        let rule = ForwardingRule::new(
            LocalBind::Tcp {
                host: String::new(),
                port: 0,
            },
            RemoteTarget {
                host: String::new(),
                port: 80,
            },
        );
        let opts = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gw"))
            .ssh_password("pw")
            .rule(rule)
            .build()
            .unwrap();
        assert!(matches!(TunnelForwarder::new(opts), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let forwarder = TunnelForwarder::new(options_for(vec![loopback_rule(0)])).unwrap();
        forwarder.stop().await;
        forwarder.stop_force().await;
        assert_eq!(forwarder.state(), ForwarderState::Created);
    }

    #[tokio::test]
    async fn test_start_with_unresolvable_gateway_leaves_stopped() {
        // ".invalid" is reserved and never resolves (RFC 2606).
        let opts = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gateway.invalid"))
            .ssh_password("pw")
            .allow_agent(false)
            .ssh_config_file("/nonexistent/ssh_config")
            .host_pkey_directories(Vec::new())
            .rule(loopback_rule(0))
            .connect_timeout(std::time::Duration::from_secs(2))
            .build()
            .unwrap();
        let forwarder = TunnelForwarder::new(opts).unwrap();

        let err = forwarder.start().await.unwrap_err();
        assert!(matches!(err, Error::Session(_)));
        assert_eq!(forwarder.state(), ForwarderState::Stopped);
        assert!(forwarder.tunnel_is_up().values().all(|v| !v));

        // Stop after a failed start stays a no-op.
        forwarder.stop().await;
        assert_eq!(forwarder.state(), ForwarderState::Stopped);
    }

    #[tokio::test]
    async fn test_start_without_credentials_is_no_auth_methods() {
        let opts = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gateway.invalid"))
            .allow_agent(false)
            .ssh_config_file("/nonexistent/ssh_config")
            .host_pkey_directories(Vec::new())
            .rule(loopback_rule(0))
            .build()
            .unwrap();
        let forwarder = TunnelForwarder::new(opts).unwrap();

        let err = forwarder.start().await.unwrap_err();
        assert!(matches!(err, Error::NoAuthMethods));
        assert_eq!(forwarder.state(), ForwarderState::Stopped);
    }

    #[tokio::test]
    async fn test_check_tunnels_before_start_reports_down() {
        let forwarder = TunnelForwarder::new(options_for(vec![loopback_rule(0)])).unwrap();
        let probed = forwarder.check_tunnels().await;
        assert!(probed.is_empty() || probed.values().all(|v| !v));
    }

    #[test]
    fn test_resolve_hop_precedence() {
        let address = GatewayAddress::parse("admin@alias:2200").unwrap();
        let resolved = HostConfig {
            hostname: Some("real.example.com".to_string()),
            user: Some("config-user".to_string()),
            port: Some(2022),
            ..Default::default()
        };

        // Explicit username and port beat the config.
        let hop = resolve_hop(&address, &resolved, None).unwrap();
        assert_eq!(hop.host, "real.example.com");
        assert_eq!(hop.port, 2200);
        assert_eq!(hop.username, "admin");

        // Without an explicit port, the config port applies.
        let address = GatewayAddress::new("alias");
        let hop = resolve_hop(&address, &resolved, None).unwrap();
        assert_eq!(hop.port, 2022);
        assert_eq!(hop.username, "config-user");

        // Caller-level default username outranks the config user.
        let hop = resolve_hop(&address, &resolved, Some("cli-user")).unwrap();
        assert_eq!(hop.username, "cli-user");
    }
}
