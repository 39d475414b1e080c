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

//! Command-line interface.
//!
//! A thin shell over [`ForwarderOptions`]: flags map one-to-one onto the
//! library options, `-L`/`-R` pairs form the rule set positionally, and the
//! `-v` count selects the log level.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::error::{Error, Result};
use crate::forwarding::ForwardingRule;
use crate::options::{ForwarderOptions, GatewayAddress};
use crate::ssh::proxy::ProxyCommand;

#[derive(Debug, Parser)]
#[command(
    name = "btun",
    version,
    about = "SSH tunnel forwarder: local TCP/UNIX port forwarding over SSH",
    long_about = "Accepts connections on local endpoints and forwards them to remote \
                  targets through an authenticated SSH session, optionally chained \
                  through jump gateways."
)]
pub struct Cli {
    /// Gateway to tunnel through: [user@]host[:port] or an SSH config alias
    pub gateway: String,

    /// Username to authenticate as on the gateway
    #[arg(short = 'U', long = "username")]
    pub username: Option<String>,

    /// Gateway SSH port (overridden by an explicit port in the gateway spec)
    #[arg(short = 'p', long = "server-port")]
    pub server_port: Option<u16>,

    /// Password for the gateway (also used as a key passphrase fallback)
    #[arg(short = 'P', long = "password")]
    pub password: Option<String>,

    /// Pinned gateway host key fingerprint (SHA256:... or hex)
    #[arg(short = 'k', long = "host-key")]
    pub host_key: Option<String>,

    /// Private key file; repeatable
    #[arg(short = 'K', long = "private-key-file")]
    pub key_files: Vec<PathBuf>,

    /// Passphrase for encrypted private keys
    #[arg(short = 'S', long = "private-key-password")]
    pub key_password: Option<String>,

    /// One worker per accepted connection instead of serialized per rule
    #[arg(short = 't', long = "threaded")]
    pub threaded: bool,

    /// Increase verbosity (-v error, -vv warning, -vvv info, -vvvv debug)
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Outer TCP proxy fronting the gateway, as host:port
    #[arg(short = 'x', long = "proxy")]
    pub proxy: Option<String>,

    /// SSH configuration file to resolve the gateway against
    #[arg(short = 'c', long = "config")]
    pub ssh_config_file: Option<PathBuf>,

    /// Request transport compression
    #[arg(short = 'z', long = "compress")]
    pub compress: bool,

    /// Disable the SSH agent
    #[arg(short = 'n', long = "noagent")]
    pub no_agent: bool,

    /// Directory scanned for private keys; repeatable
    #[arg(short = 'd', long = "host-pkey-directories")]
    pub host_pkey_directories: Vec<PathBuf>,

    /// Local bind endpoint: port, host:port, or socket path; repeatable
    #[arg(short = 'L', long = "local", required = true)]
    pub local: Vec<String>,

    /// Remote target as host:port; pairs up with -L positionally
    #[arg(short = 'R', long = "remote", required = true)]
    pub remote: Vec<String>,

    /// Intermediate jump gateway, outermost first; repeatable
    #[arg(short = 'j', long = "jump")]
    pub jump: Vec<String>,
}

impl Cli {
    /// Convert parsed flags into forwarder options.
    pub fn into_options(self) -> Result<ForwarderOptions> {
        if self.local.len() != self.remote.len() {
            return Err(Error::Config(format!(
                "{} -L option(s) paired with {} -R option(s)",
                self.local.len(),
                self.remote.len()
            )));
        }

        let mut gateway = GatewayAddress::parse(&self.gateway)?;
        if gateway.port.is_none() {
            gateway.port = self.server_port;
        }

        let mut jump_hosts = Vec::with_capacity(self.jump.len());
        for spec in &self.jump {
            jump_hosts.push(GatewayAddress::parse(spec)?);
        }

        let mut builder = ForwarderOptions::builder()
            .ssh_address_or_host(gateway)
            .jump_hosts(jump_hosts)
            .threaded(self.threaded)
            .compression(self.compress)
            .allow_agent(!self.no_agent);

        if let Some(username) = self.username {
            builder = builder.ssh_username(username);
        }
        if let Some(password) = self.password {
            builder = builder.ssh_password(password);
        }
        if let Some(host_key) = self.host_key {
            builder = builder.ssh_host_key(host_key);
        }
        for key_file in self.key_files {
            builder = builder.ssh_pkey_file(key_file);
        }
        if let Some(passphrase) = self.key_password {
            builder = builder.ssh_pkey_password(passphrase);
        }
        if let Some(config) = self.ssh_config_file {
            builder = builder.ssh_config_file(config);
        }
        if let Some(proxy) = &self.proxy {
            builder = builder.ssh_proxy(ProxyCommand::parse_tcp(proxy)?);
        }
        if !self.host_pkey_directories.is_empty() {
            builder = builder.host_pkey_directories(self.host_pkey_directories);
        }

        for (local, remote) in self.local.iter().zip(&self.remote) {
            let local = ForwardingRule::parse_local(local)?;
            let remote = ForwardingRule::parse_remote(remote)?;
            builder = builder.rule(ForwardingRule::new(local, remote));
        }

        builder.build()
    }
}

/// Map the `-v` count onto a tracing filter directive.
pub fn log_filter(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    };
    format!("btun={level}")
}
