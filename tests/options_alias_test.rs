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

//! Tests for the options record and its deprecation-alias layer.
//!
//! Deprecated names must resolve to their current counterparts, and the
//! current name must win whenever both are supplied, regardless of call
//! order.

use btun::forwarding::{ForwardingRule, LocalBind, RemoteTarget};
use btun::{ForwarderOptions, GatewayAddress};

fn rule() -> ForwardingRule {
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
fn deprecated_ssh_address_resolves_to_current_name() {
    let opts = ForwarderOptions::builder()
        .ssh_address(GatewayAddress::new("legacy-gw"))
        .rule(rule())
        .build()
        .expect("alias alone should be enough");

    assert_eq!(opts.ssh_address_or_host.host, "legacy-gw");
}

#[test]
fn current_name_wins_in_both_call_orders() {
    let alias_first = ForwarderOptions::builder()
        .ssh_host(GatewayAddress::new("alias"))
        .ssh_address_or_host(GatewayAddress::new("current"))
        .rule(rule())
        .build()
        .unwrap();
    assert_eq!(alias_first.ssh_address_or_host.host, "current");

    let current_first = ForwarderOptions::builder()
        .ssh_address_or_host(GatewayAddress::new("current"))
        .ssh_host(GatewayAddress::new("alias"))
        .rule(rule())
        .build()
        .unwrap();
    assert_eq!(current_first.ssh_address_or_host.host, "current");
}

#[test]
fn inverted_mute_alias() {
    // raise=false means "do not raise", i.e. mute.
    let opts = ForwarderOptions::builder()
        .ssh_address_or_host(GatewayAddress::new("gw"))
        .rule(rule())
        .raise_exception_if_any_forwarder_have_a_problem(false)
        .build()
        .unwrap();
    assert!(opts.mute_exceptions);

    let opts = ForwarderOptions::builder()
        .ssh_address_or_host(GatewayAddress::new("gw"))
        .rule(rule())
        .raise_exception_if_any_forwarder_have_a_problem(true)
        .mute_exceptions(false)
        .build()
        .unwrap();
    assert!(!opts.mute_exceptions);
}

#[test]
fn pkey_password_alias_accepted_silently() {
    let opts = ForwarderOptions::builder()
        .ssh_address_or_host(GatewayAddress::new("gw"))
        .rule(rule())
        .ssh_private_key_password("via-alias")
        .build()
        .unwrap();
    assert_eq!(opts.ssh_pkey_password.unwrap().as_str(), "via-alias");
}

#[test]
fn documented_defaults() {
    let opts = ForwarderOptions::builder()
        .ssh_address_or_host(GatewayAddress::new("gw"))
        .rule(rule())
        .build()
        .unwrap();

    assert!(opts.allow_agent, "allow_agent defaults to true");
    assert!(!opts.compression, "compression defaults to false");
    assert!(!opts.mute_exceptions, "mute_exceptions defaults to false");
    assert!(opts.threaded, "threaded defaults to true");
    assert_eq!(opts.set_keepalive, 5.0, "keepalive defaults to 5 seconds");
    assert_eq!(
        opts.ssh_timeout,
        std::time::Duration::from_millis(100),
        "read slice defaults to 100ms"
    );
    assert_eq!(
        opts.tunnel_timeout,
        std::time::Duration::from_secs(10),
        "graceful stop bound defaults to 10s"
    );
}

#[test]
fn gateway_chain_orders_jump_hosts_before_final() {
    let opts = ForwarderOptions::builder()
        .ssh_address_or_host(GatewayAddress::new("final"))
        .jump_hosts(vec![
            GatewayAddress::new("outer"),
            GatewayAddress::new("middle"),
        ])
        .rule(rule())
        .build()
        .unwrap();

    let chain = opts.gateway_chain();
    let hosts: Vec<&str> = chain.iter().map(|g| g.host.as_str()).collect();
    assert_eq!(hosts, vec!["outer", "middle", "final"]);
}
