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

//! Outer proxy transports for reaching the first gateway.
//!
//! Two forms: an OpenSSH-style `ProxyCommand` (a subprocess whose stdio
//! carries the SSH transport, with `%h`/`%p` substituted) and a plain TCP
//! relay endpoint. Either yields a stream the SSH handshake runs over.

use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::error::{Error, Result};

/// Specification of the outer proxy used to reach the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyCommand {
    /// Subprocess command line; `%h` and `%p` expand to the gateway
    /// host and port before the command is run through the shell.
    Command(String),
    /// TCP relay endpoint fronting the gateway's sshd.
    Tcp { host: String, port: u16 },
}

impl ProxyCommand {
    /// Parse the CLI form `host:port` into a TCP relay proxy.
    pub fn parse_tcp(spec: &str) -> Result<Self> {
        let (host, port_str) = spec
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("proxy '{spec}' is not of the form host:port")))?;
        let port = port_str
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("proxy '{spec}' has an invalid port")))?;
        crate::validation::check_host(host)?;
        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// Open the proxy transport toward `gateway_host:gateway_port`.
    pub(crate) async fn connect(
        &self,
        gateway_host: &str,
        gateway_port: u16,
    ) -> Result<ProxyStream> {
        match self {
            ProxyCommand::Tcp { host, port } => {
                debug!("connecting to gateway via TCP proxy {host}:{port}");
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| Error::Config(format!("proxy {host}:{port} unreachable: {e}")))?;
                Ok(ProxyStream::Tcp(stream))
            }
            ProxyCommand::Command(template) => {
                let command = template
                    .replace("%h", gateway_host)
                    .replace("%p", &gateway_port.to_string());
                debug!("spawning proxy command: {command}");

                #[cfg(not(target_os = "windows"))]
                let mut child = Command::new("sh")
                    .arg("-c")
                    .arg(&command)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| Error::Config(format!("proxy command failed to start: {e}")))?;
                #[cfg(target_os = "windows")]
                let mut child = Command::new("cmd")
                    .arg("/C")
                    .arg(&command)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| Error::Config(format!("proxy command failed to start: {e}")))?;

                let stdin = child.stdin.take().ok_or_else(|| {
                    Error::Config("proxy command has no stdin handle".to_string())
                })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    Error::Config("proxy command has no stdout handle".to_string())
                })?;

                Ok(ProxyStream::Command {
                    stdout,
                    stdin,
                    _child: child,
                })
            }
        }
    }
}

/// A live proxy transport. Reads and writes go to the TCP relay or to the
/// subprocess's stdio; the child is killed when the stream drops.
pub(crate) enum ProxyStream {
    Tcp(TcpStream),
    Command {
        stdout: ChildStdout,
        stdin: ChildStdin,
        _child: Child,
    },
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ProxyStream::Command { stdout, .. } => Pin::new(stdout).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ProxyStream::Command { stdin, .. } => Pin::new(stdin).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ProxyStream::Command { stdin, .. } => Pin::new(stdin).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ProxyStream::Command { stdin, .. } => Pin::new(stdin).poll_shutdown(cx),
        }
    }
}
