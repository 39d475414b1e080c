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

//! btun: SSH tunnel forwarder.
//!
//! Forwards local TCP (or UNIX socket) endpoints to remote targets through
//! an authenticated SSH session, optionally chained through jump gateways.
//!
//! ```no_run
//! use btun::{ForwarderOptions, GatewayAddress, TunnelForwarder};
//! use btun::forwarding::{ForwardingRule, LocalBind, RemoteTarget};
//!
//! # async fn example() -> btun::Result<()> {
//! let opts = ForwarderOptions::builder()
//!     .ssh_address_or_host(GatewayAddress::parse("deploy@gw.example.com")?)
//!     .ssh_pkey_file("/home/deploy/.ssh/id_ed25519")
//!     .rule(ForwardingRule::new(
//!         LocalBind::Tcp { host: String::new(), port: 0 },
//!         RemoteTarget { host: "db.internal".into(), port: 5432 },
//!     ))
//!     .build()?;
//!
//! let forwarder = TunnelForwarder::new(opts)?;
//! forwarder.start().await?;
//! println!("bound ports: {:?}", forwarder.local_bind_ports());
//! forwarder.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod chain;
pub mod cli;
pub mod error;
pub mod forwarding;
pub mod options;
pub mod ssh;
pub mod ssh_config;
pub mod validation;

pub use cli::Cli;
pub use error::{Error, Result};
pub use forwarding::{ForwarderGuard, ForwarderState, TunnelForwarder};
pub use options::{ForwarderOptions, GatewayAddress};
pub use ssh::{HostKeyPolicy, ProxyCommand, Session, SessionConfig};
