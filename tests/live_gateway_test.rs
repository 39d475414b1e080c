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

//! End-to-end scenarios against a live sshd, kept out of the default run.
//!
//! Run with a reachable gateway:
//!
//! ```bash
//! BTUN_TEST_GATEWAY=user:password@host:port \
//!     cargo test --test live_gateway_test -- --ignored
//! ```
//!
//! The gateway must allow password auth and loopback direct-tcpip channels.

use std::sync::Arc;
use std::time::Duration;

use btun::forwarding::{ForwardingRule, LocalBind, RemoteTarget};
use btun::{ForwarderOptions, ForwarderState, GatewayAddress, TunnelForwarder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct LiveGateway {
    host: String,
    port: u16,
    username: String,
    password: String,
}

fn live_gateway() -> LiveGateway {
    let spec = std::env::var("BTUN_TEST_GATEWAY")
        .expect("set BTUN_TEST_GATEWAY=user:password@host:port for live tests");
    let (creds, addr) = spec.rsplit_once('@').expect("user:password@host:port");
    let (username, password) = creds.split_once(':').expect("user:password@host:port");
    let (host, port) = addr.rsplit_once(':').expect("user:password@host:port");
    LiveGateway {
        host: host.to_string(),
        port: port.parse().expect("numeric gateway port"),
        username: username.to_string(),
        password: password.to_string(),
    }
}

/// An echo server on loopback standing in for the remote target; the
/// gateway reaches it back over its own loopback.
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

fn options(gw: &LiveGateway, rules: Vec<ForwardingRule>) -> ForwarderOptions {
    let mut builder = ForwarderOptions::builder()
        .ssh_address_or_host(
            GatewayAddress::new(gw.host.clone())
                .with_port(gw.port)
                .with_username(gw.username.clone()),
        )
        .ssh_password(gw.password.clone())
        .allow_agent(false)
        .ssh_config_file("/nonexistent/ssh_config")
        .host_pkey_directories(Vec::new())
        .connect_timeout(Duration::from_secs(10));
    for rule in rules {
        builder = builder.rule(rule);
    }
    builder.build().unwrap()
}

fn ephemeral_rule(remote_port: u16) -> ForwardingRule {
    ForwardingRule::new(
        LocalBind::Tcp {
            host: String::new(),
            port: 0,
        },
        RemoteTarget {
            host: "127.0.0.1".to_string(),
            port: remote_port,
        },
    )
}

/// Password auth on an ephemeral port; bytes echo back intact.
#[tokio::test]
#[ignore = "needs BTUN_TEST_GATEWAY"]
async fn password_auth_ephemeral_port_echo() {
    let gw = live_gateway();
    let echo_port = spawn_echo_server().await;

    let forwarder = TunnelForwarder::new(options(&gw, vec![ephemeral_rule(echo_port)])).unwrap();
    forwarder.start().await.unwrap();

    let ports = forwarder.local_bind_ports();
    assert_eq!(ports.len(), 1);
    assert!(ports[0] >= 1024, "ephemeral port must be assigned");
    assert!(forwarder.tunnel_is_up().values().all(|up| *up));

    let mut client = TcpStream::connect(("127.0.0.1", ports[0])).await.unwrap();
    client.write_all(b"ping\n").await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping\n");

    forwarder.stop().await;
    assert_eq!(forwarder.state(), ForwarderState::Stopped);
    assert!(
        TcpStream::connect(("127.0.0.1", ports[0])).await.is_err(),
        "endpoint must refuse connections after stop"
    );
}

/// Partial failure: one rule's port is already taken. The readiness policy
/// decides whether start fails or limps on.
#[tokio::test]
#[ignore = "needs BTUN_TEST_GATEWAY"]
async fn partial_listener_failure_respects_readiness_policy() {
    let gw = live_gateway();
    let echo_port = spawn_echo_server().await;

    // Occupy a port to force one bind failure.
    let occupied = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let taken_port = occupied.local_addr().unwrap().port();

    let conflicted = ForwardingRule::new(
        LocalBind::Tcp {
            host: String::new(),
            port: taken_port,
        },
        RemoteTarget {
            host: "127.0.0.1".to_string(),
            port: echo_port,
        },
    );

    // Default policy: aggregate failure, everything torn down.
    let forwarder = TunnelForwarder::new(options(
        &gw,
        vec![ephemeral_rule(echo_port), conflicted.clone()],
    ))
    .unwrap();
    let err = forwarder.start().await.unwrap_err();
    assert!(matches!(err, btun::Error::Listener(_)));
    assert_eq!(forwarder.state(), ForwarderState::Stopped);

    // Muted policy: the healthy rule stays up and is reflected in the map.
    let opts = {
        let mut builder = ForwarderOptions::builder()
            .ssh_address_or_host(
                GatewayAddress::new(gw.host.clone())
                    .with_port(gw.port)
                    .with_username(gw.username.clone()),
            )
            .ssh_password(gw.password.clone())
            .allow_agent(false)
            .ssh_config_file("/nonexistent/ssh_config")
            .host_pkey_directories(Vec::new())
            .mute_exceptions(true);
        for rule in [ephemeral_rule(echo_port), conflicted] {
            builder = builder.rule(rule);
        }
        builder.build().unwrap()
    };
    let forwarder = TunnelForwarder::new(opts).unwrap();
    forwarder.start().await.unwrap();
    assert_eq!(forwarder.state(), ForwarderState::Running);

    let up = forwarder.tunnel_is_up();
    assert_eq!(up.values().filter(|v| **v).count(), 1);
    assert_eq!(up.values().filter(|v| !**v).count(), 1);

    forwarder.stop_force().await;
}

/// Forced stop under load returns within the tunnel timeout and every
/// client observes EOF.
#[tokio::test]
#[ignore = "needs BTUN_TEST_GATEWAY"]
async fn forced_stop_under_load_is_bounded() {
    let gw = live_gateway();
    let echo_port = spawn_echo_server().await;

    let forwarder =
        Arc::new(TunnelForwarder::new(options(&gw, vec![ephemeral_rule(echo_port)])).unwrap());
    forwarder.start().await.unwrap();
    let port = forwarder.local_bind_ports()[0];

    let mut clients = Vec::new();
    for _ in 0..50 {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"hold\n").await.unwrap();
        clients.push(stream);
    }

    let begun = std::time::Instant::now();
    forwarder.stop_force().await;
    assert!(
        begun.elapsed() <= Duration::from_secs(10),
        "forced stop exceeded the tunnel timeout"
    );

    for mut client in clients {
        let mut sink = Vec::new();
        // Drain whatever was in flight; the connection must end with EOF
        // rather than hanging.
        let read = tokio::time::timeout(
            Duration::from_secs(5),
            client.read_to_end(&mut sink),
        )
        .await;
        assert!(read.is_ok(), "client socket did not observe EOF");
    }
}

/// Scoped acquisition leaves no endpoint behind once the guard is gone.
#[tokio::test]
#[ignore = "needs BTUN_TEST_GATEWAY"]
async fn scoped_guard_tears_down_endpoints() {
    let gw = live_gateway();
    let echo_port = spawn_echo_server().await;

    let forwarder =
        Arc::new(TunnelForwarder::new(options(&gw, vec![ephemeral_rule(echo_port)])).unwrap());

    let port = {
        let guard = Arc::clone(&forwarder).scoped().await.unwrap();
        let port = guard.local_bind_ports()[0];
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());
        guard.stop().await;
        port
    };

    assert_eq!(forwarder.state(), ForwarderState::Stopped);
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}
