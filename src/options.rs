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

//! Forwarder configuration.
//!
//! [`ForwarderOptions`] is an explicit record with enumerated fields; the
//! historical permissive keyword bag survives only as a small deprecation
//! layer on the builder. Each deprecated name warns once and loses to its
//! current counterpart when both are given.

use std::path::PathBuf;
use std::time::Duration;

use russh::keys::PrivateKey;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::forwarding::{ForwardingRule, LocalBind, RemoteTarget, SSH_TIMEOUT, TUNNEL_TIMEOUT};
use crate::ssh::host_key::HostKeyPolicy;
use crate::ssh::proxy::ProxyCommand;

/// Default keepalive interval in seconds.
pub const DEFAULT_KEEPALIVE: f64 = 5.0;

/// Default timeout for TCP connect + SSH handshake per hop.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A gateway endpoint: `[user@]host[:port]`, or a `Host` alias to be
/// resolved through the SSH config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAddress {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
}

impl GatewayAddress {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            username: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Parse `[user@]host[:port]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (username, rest) = match spec.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some((_, rest)) => (None, rest),
            None => (None, spec),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            // "[v6]" or "[v6]:port"
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| Error::Config(format!("'{spec}' has an unterminated IPv6 bracket")))?;
            match tail.strip_prefix(':') {
                Some(port_str) => {
                    let port = port_str.parse::<u16>().map_err(|_| {
                        Error::Config(format!("'{port_str}' is not a valid port in '{spec}'"))
                    })?;
                    (host.to_string(), Some(port))
                }
                None => (host.to_string(), None),
            }
        } else if !rest.contains(':') || rest.parse::<std::net::IpAddr>().is_ok() {
            // Plain name, v4 literal, or bare (unbracketed) v6 literal.
            (rest.to_string(), None)
        } else {
            let (host, port_str) = rest
                .rsplit_once(':')
                .ok_or_else(|| Error::Config(format!("'{spec}' is not a valid gateway")))?;
            let port = port_str
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("'{port_str}' is not a valid port in '{spec}'")))?;
            (host.to_string(), Some(port))
        };

        crate::validation::check_host(&host)?;
        Ok(Self {
            host,
            port,
            username,
        })
    }

    /// Port to use when neither the caller nor the SSH config set one.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(22)
    }
}

impl std::fmt::Display for GatewayAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.username {
            write!(f, "{user}@")?;
        }
        write!(f, "{}:{}", self.host, self.effective_port())
    }
}

/// Complete, validated forwarder configuration.
///
/// The timeout constants are fields with documented defaults rather than
/// ambient process-wide state, so two forwarders in one process can disagree.
#[derive(Debug)]
pub struct ForwarderOptions {
    /// Final gateway the rules attach to.
    pub ssh_address_or_host: GatewayAddress,
    /// Intermediate hops, outermost first. Empty for a single-hop tunnel.
    pub jump_hosts: Vec<GatewayAddress>,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<Zeroizing<String>>,
    /// In-memory private key, tried before any key files.
    pub ssh_pkey: Option<PrivateKey>,
    pub ssh_pkey_files: Vec<PathBuf>,
    pub ssh_pkey_password: Option<Zeroizing<String>>,
    pub host_key_policy: HostKeyPolicy,
    /// `None` disables SSH config lookup entirely.
    pub ssh_config_file: Option<PathBuf>,
    pub ssh_proxy: Option<ProxyCommand>,
    pub ssh_proxy_enabled: bool,
    pub host_pkey_directories: Vec<PathBuf>,
    pub allow_agent: bool,
    pub compression: bool,
    pub mute_exceptions: bool,
    /// Keepalive interval in seconds; 0 disables keepalive probes.
    pub set_keepalive: f64,
    /// One worker per accepted connection; `false` serializes per rule.
    pub threaded: bool,
    pub rules: Vec<ForwardingRule>,
    /// Per-socket read slice; tunes stop latency.
    pub ssh_timeout: Duration,
    /// Upper bound on graceful stop.
    pub tunnel_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ForwarderOptions {
    pub fn builder() -> ForwarderOptionsBuilder {
        ForwarderOptionsBuilder::default()
    }

    /// The full gateway chain, outermost hop first, final gateway last.
    pub fn gateway_chain(&self) -> Vec<GatewayAddress> {
        let mut chain = self.jump_hosts.clone();
        chain.push(self.ssh_address_or_host.clone());
        chain
    }
}

/// Builder for [`ForwarderOptions`].
#[derive(Debug, Default)]
pub struct ForwarderOptionsBuilder {
    ssh_address_or_host: Option<GatewayAddress>,
    jump_hosts: Vec<GatewayAddress>,
    ssh_username: Option<String>,
    ssh_password: Option<Zeroizing<String>>,
    ssh_pkey: Option<PrivateKey>,
    ssh_pkey_files: Vec<PathBuf>,
    ssh_pkey_password: Option<Zeroizing<String>>,
    ssh_host_key: Option<String>,
    host_key_policy: Option<HostKeyPolicy>,
    ssh_config_file: Option<PathBuf>,
    ssh_proxy: Option<ProxyCommand>,
    ssh_proxy_enabled: Option<bool>,
    host_pkey_directories: Option<Vec<PathBuf>>,
    allow_agent: Option<bool>,
    compression: Option<bool>,
    mute_exceptions: Option<bool>,
    set_keepalive: Option<f64>,
    threaded: Option<bool>,
    local_binds: Vec<LocalBind>,
    remote_targets: Vec<RemoteTarget>,
    ssh_timeout: Option<Duration>,
    tunnel_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,

    // Deprecated-alias storage. Canonical names win at build time.
    deprecated_address: Option<GatewayAddress>,
    deprecated_pkey: Option<PrivateKey>,
    deprecated_mute: Option<bool>,
    warned_address: bool,
    warned_host: bool,
    warned_private_key: bool,
    warned_raise_exception: bool,
}

impl ForwarderOptionsBuilder {
    pub fn ssh_address_or_host(mut self, gateway: GatewayAddress) -> Self {
        self.ssh_address_or_host = Some(gateway);
        self
    }

    /// Intermediate jump gateways, outermost first. The client connects to
    /// the first entry directly and reaches the final gateway through it.
    pub fn jump_hosts(mut self, hops: Vec<GatewayAddress>) -> Self {
        self.jump_hosts = hops;
        self
    }

    pub fn ssh_username(mut self, username: impl Into<String>) -> Self {
        self.ssh_username = Some(username.into());
        self
    }

    pub fn ssh_password(mut self, password: impl Into<String>) -> Self {
        self.ssh_password = Some(Zeroizing::new(password.into()));
        self
    }

    pub fn ssh_pkey(mut self, key: PrivateKey) -> Self {
        self.ssh_pkey = Some(key);
        self
    }

    pub fn ssh_pkey_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_pkey_files.push(path.into());
        self
    }

    pub fn ssh_pkey_password(mut self, passphrase: impl Into<String>) -> Self {
        self.ssh_pkey_password = Some(Zeroizing::new(passphrase.into()));
        self
    }

    /// Alias for [`ssh_pkey_password`](Self::ssh_pkey_password).
    pub fn ssh_private_key_password(self, passphrase: impl Into<String>) -> Self {
        if self.ssh_pkey_password.is_some() {
            return self;
        }
        self.ssh_pkey_password(passphrase)
    }

    /// Pin the gateway host key; implies the `require-specific` policy.
    pub fn ssh_host_key(mut self, fingerprint: impl Into<String>) -> Self {
        self.ssh_host_key = Some(fingerprint.into());
        self
    }

    pub fn host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = Some(policy);
        self
    }

    pub fn ssh_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_config_file = Some(path.into());
        self
    }

    pub fn ssh_proxy(mut self, proxy: ProxyCommand) -> Self {
        self.ssh_proxy = Some(proxy);
        self
    }

    pub fn ssh_proxy_enabled(mut self, enabled: bool) -> Self {
        self.ssh_proxy_enabled = Some(enabled);
        self
    }

    pub fn host_pkey_directories(mut self, dirs: Vec<PathBuf>) -> Self {
        self.host_pkey_directories = Some(dirs);
        self
    }

    pub fn allow_agent(mut self, allow: bool) -> Self {
        self.allow_agent = Some(allow);
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = Some(enabled);
        self
    }

    pub fn mute_exceptions(mut self, mute: bool) -> Self {
        self.mute_exceptions = Some(mute);
        self
    }

    pub fn set_keepalive(mut self, interval_secs: f64) -> Self {
        self.set_keepalive = Some(interval_secs);
        self
    }

    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = Some(threaded);
        self
    }

    pub fn rule(mut self, rule: ForwardingRule) -> Self {
        self.local_binds.push(rule.local);
        self.remote_targets.push(rule.remote);
        self
    }

    pub fn local_bind_address(mut self, bind: LocalBind) -> Self {
        self.local_binds.push(bind);
        self
    }

    pub fn local_bind_addresses(mut self, binds: Vec<LocalBind>) -> Self {
        self.local_binds = binds;
        self
    }

    pub fn remote_bind_address(mut self, target: RemoteTarget) -> Self {
        self.remote_targets.push(target);
        self
    }

    pub fn remote_bind_addresses(mut self, targets: Vec<RemoteTarget>) -> Self {
        self.remote_targets = targets;
        self
    }

    pub fn ssh_timeout(mut self, timeout: Duration) -> Self {
        self.ssh_timeout = Some(timeout);
        self
    }

    pub fn tunnel_timeout(mut self, timeout: Duration) -> Self {
        self.tunnel_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Deprecated alias for [`ssh_address_or_host`](Self::ssh_address_or_host).
    pub fn ssh_address(mut self, gateway: GatewayAddress) -> Self {
        if !self.warned_address {
            warn!("option 'ssh_address' is deprecated, use 'ssh_address_or_host'");
            self.warned_address = true;
        }
        self.deprecated_address.get_or_insert(gateway);
        self
    }

    /// Deprecated alias for [`ssh_address_or_host`](Self::ssh_address_or_host).
    pub fn ssh_host(mut self, gateway: GatewayAddress) -> Self {
        if !self.warned_host {
            warn!("option 'ssh_host' is deprecated, use 'ssh_address_or_host'");
            self.warned_host = true;
        }
        self.deprecated_address.get_or_insert(gateway);
        self
    }

    /// Deprecated alias for [`ssh_pkey`](Self::ssh_pkey).
    pub fn ssh_private_key(mut self, key: PrivateKey) -> Self {
        if !self.warned_private_key {
            warn!("option 'ssh_private_key' is deprecated, use 'ssh_pkey'");
            self.warned_private_key = true;
        }
        self.deprecated_pkey.get_or_insert(key);
        self
    }

    /// Deprecated inverted alias for [`mute_exceptions`](Self::mute_exceptions).
    pub fn raise_exception_if_any_forwarder_have_a_problem(mut self, raise: bool) -> Self {
        if !self.warned_raise_exception {
            warn!(
                "option 'raise_exception_if_any_forwarder_have_a_problem' is deprecated, \
                 use 'mute_exceptions' (inverted)"
            );
            self.warned_raise_exception = true;
        }
        self.deprecated_mute.get_or_insert(!raise);
        self
    }

    /// Finalize the options, pairing local binds with remote targets and
    /// applying defaults. Current option names take precedence over any
    /// deprecated alias supplied alongside them.
    pub fn build(self) -> Result<ForwarderOptions> {
        let ssh_address_or_host = self
            .ssh_address_or_host
            .or(self.deprecated_address)
            .ok_or_else(|| Error::Config("no gateway address given".to_string()))?;

        if self.local_binds.len() != self.remote_targets.len() {
            return Err(Error::Config(format!(
                "{} local bind address(es) paired with {} remote target(s)",
                self.local_binds.len(),
                self.remote_targets.len()
            )));
        }
        if self.local_binds.is_empty() {
            return Err(Error::Config("no forwarding rules given".to_string()));
        }

        let rules: Vec<ForwardingRule> = self
            .local_binds
            .into_iter()
            .zip(self.remote_targets)
            .map(|(local, remote)| ForwardingRule::new(local, remote))
            .collect();

        let host_key_policy = match (self.host_key_policy, self.ssh_host_key) {
            (Some(policy), _) => policy,
            (None, Some(fingerprint)) => HostKeyPolicy::RequireSpecific(fingerprint),
            (None, None) => HostKeyPolicy::AcceptAny,
        };

        let ssh_config_file = self.ssh_config_file.or_else(|| {
            dirs::home_dir()
                .map(|home| home.join(".ssh").join("config"))
                .filter(|path| path.exists())
        });

        let host_pkey_directories = self.host_pkey_directories.unwrap_or_else(|| {
            dirs::home_dir()
                .map(|home| vec![home.join(".ssh")])
                .unwrap_or_default()
        });

        Ok(ForwarderOptions {
            ssh_address_or_host,
            jump_hosts: self.jump_hosts,
            ssh_username: self.ssh_username,
            ssh_password: self.ssh_password,
            ssh_pkey: self.ssh_pkey.or(self.deprecated_pkey),
            ssh_pkey_files: self.ssh_pkey_files,
            ssh_pkey_password: self.ssh_pkey_password,
            host_key_policy,
            ssh_config_file,
            ssh_proxy: self.ssh_proxy,
            ssh_proxy_enabled: self.ssh_proxy_enabled.unwrap_or(true),
            host_pkey_directories,
            allow_agent: self.allow_agent.unwrap_or(true),
            compression: self.compression.unwrap_or(false),
            mute_exceptions: self.mute_exceptions.or(self.deprecated_mute).unwrap_or(false),
            set_keepalive: self.set_keepalive.unwrap_or(DEFAULT_KEEPALIVE),
            threaded: self.threaded.unwrap_or(true),
            rules,
            ssh_timeout: self.ssh_timeout.unwrap_or(SSH_TIMEOUT),
            tunnel_timeout: self.tunnel_timeout.unwrap_or(TUNNEL_TIMEOUT),
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule() -> ForwardingRule {
        ForwardingRule::new(
            LocalBind::Tcp {
                host: String::new(),
                port: 0,
            },
            RemoteTarget {
                host: "127.0.0.1".to_string(),
                port: 9000,
            },
        )
    }

    #[test]
    fn test_gateway_address_parse_forms() {
        let gw = GatewayAddress::parse("gateway.example.com").unwrap();
        assert_eq!(gw.host, "gateway.example.com");
        assert_eq!(gw.port, None);
        assert_eq!(gw.effective_port(), 22);
        assert_eq!(gw.username, None);

        let gw = GatewayAddress::parse("admin@10.0.0.1:2222").unwrap();
        assert_eq!(gw.host, "10.0.0.1");
        assert_eq!(gw.port, Some(2222));
        assert_eq!(gw.username.as_deref(), Some("admin"));

        let gw = GatewayAddress::parse("[2001:db8::1]:22").unwrap();
        assert_eq!(gw.host, "2001:db8::1");
        assert_eq!(gw.port, Some(22));

        assert!(GatewayAddress::parse("user@host:notaport").is_err());
        assert!(GatewayAddress::parse("").is_err());
    }

    #[test]
    fn test_build_defaults() {
        let opts = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gw"))
            .rule(sample_rule())
            .build()
            .unwrap();

        assert!(opts.allow_agent);
        assert!(!opts.compression);
        assert!(!opts.mute_exceptions);
        assert!(opts.threaded);
        assert!(opts.ssh_proxy_enabled);
        assert_eq!(opts.set_keepalive, DEFAULT_KEEPALIVE);
        assert_eq!(opts.ssh_timeout, SSH_TIMEOUT);
        assert_eq!(opts.tunnel_timeout, TUNNEL_TIMEOUT);
        assert_eq!(opts.host_key_policy, HostKeyPolicy::AcceptAny);
    }

    #[test]
    fn test_build_requires_gateway_and_rules() {
        let err = ForwarderOptions::builder().build().unwrap_err();
        assert!(err.to_string().contains("gateway"));

        let err = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gw"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no forwarding rules"));
    }

    #[test]
    fn test_build_rejects_unpaired_rules() {
        let err = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gw"))
            .local_bind_address(LocalBind::Tcp {
                host: String::new(),
                port: 0,
            })
            .local_bind_address(LocalBind::Tcp {
                host: String::new(),
                port: 0,
            })
            .remote_bind_address(RemoteTarget {
                host: "db".to_string(),
                port: 5432,
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("2 local bind address(es)"));
    }

    #[test]
    fn test_deprecated_address_aliases_resolve() {
        let opts = ForwarderOptions::builder()
            .ssh_address(GatewayAddress::new("old-name"))
            .rule(sample_rule())
            .build()
            .unwrap();
        assert_eq!(opts.ssh_address_or_host.host, "old-name");

        let opts = ForwarderOptions::builder()
            .ssh_host(GatewayAddress::new("older-name"))
            .rule(sample_rule())
            .build()
            .unwrap();
        assert_eq!(opts.ssh_address_or_host.host, "older-name");
    }

    #[test]
    fn test_current_name_overrides_deprecated() {
        let opts = ForwarderOptions::builder()
            .ssh_address(GatewayAddress::new("deprecated"))
            .ssh_address_or_host(GatewayAddress::new("current"))
            .rule(sample_rule())
            .build()
            .unwrap();
        assert_eq!(opts.ssh_address_or_host.host, "current");

        // Order of the calls does not matter.
        let opts = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("current"))
            .ssh_address(GatewayAddress::new("deprecated"))
            .rule(sample_rule())
            .build()
            .unwrap();
        assert_eq!(opts.ssh_address_or_host.host, "current");
    }

    #[test]
    fn test_raise_exception_alias_inverts() {
        let opts = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gw"))
            .rule(sample_rule())
            .raise_exception_if_any_forwarder_have_a_problem(false)
            .build()
            .unwrap();
        assert!(opts.mute_exceptions);

        let opts = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gw"))
            .rule(sample_rule())
            .raise_exception_if_any_forwarder_have_a_problem(true)
            .build()
            .unwrap();
        assert!(!opts.mute_exceptions);

        // Current name wins over the inverted alias.
        let opts = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gw"))
            .rule(sample_rule())
            .raise_exception_if_any_forwarder_have_a_problem(true)
            .mute_exceptions(true)
            .build()
            .unwrap();
        assert!(opts.mute_exceptions);
    }

    #[test]
    fn test_pinned_host_key_selects_policy() {
        let opts = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gw"))
            .rule(sample_rule())
            .ssh_host_key("aa:bb:cc")
            .build()
            .unwrap();
        assert_eq!(
            opts.host_key_policy,
            HostKeyPolicy::RequireSpecific("aa:bb:cc".to_string())
        );
    }

    #[test]
    fn test_private_key_password_alias_is_silent() {
        let opts = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gw"))
            .rule(sample_rule())
            .ssh_private_key_password("secret")
            .build()
            .unwrap();
        assert!(opts.ssh_pkey_password.is_some());

        // The current name is kept when both are given.
        let opts = ForwarderOptions::builder()
            .ssh_address_or_host(GatewayAddress::new("gw"))
            .rule(sample_rule())
            .ssh_pkey_password("current")
            .ssh_private_key_password("alias")
            .build()
            .unwrap();
        assert_eq!(opts.ssh_pkey_password.unwrap().as_str(), "current");
    }
}
