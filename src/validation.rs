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

//! Address and configuration validators.
//!
//! Pure functions that check hosts, ports, and bind endpoints before any
//! socket or SSH work starts. Failures carry the offending value in an
//! [`Error::Config`]; there is no partial acceptance.

use std::net::IpAddr;
use std::path::Path;

use crate::error::{Error, Result};
use crate::forwarding::LocalBind;

/// Validate a host string.
///
/// A non-empty string that parses as an IP literal must be a valid v4/v6
/// address; anything else is treated as a DNS name without performing a
/// lookup here.
pub fn check_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(Error::Config("host cannot be an empty string".to_string()));
    }

    // Bracketed IPv6 literals ("[::1]") are accepted in address positions;
    // strip the brackets before parsing.
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if bare.contains(':') && bare.parse::<IpAddr>().is_err() {
        return Err(Error::Config(format!(
            "'{host}' looks like an IP literal but is not a valid address"
        )));
    }

    Ok(())
}

/// Validate a port number taken from untyped input (CLI, config file).
///
/// Accepts `[0, 65535]`; port 0 means "let the OS assign" for local binds.
pub fn check_port(port: i64) -> Result<u16> {
    u16::try_from(port)
        .map_err(|_| Error::Config(format!("port {port} is outside [0, 65535]")))
}

/// Validate a single bind endpoint: `(host, port)` tuple or absolute path.
pub fn check_address(bind: &LocalBind) -> Result<()> {
    match bind {
        LocalBind::Tcp { host, .. } => {
            // An empty host means loopback by default; only validate when set.
            if !host.is_empty() {
                check_host(host)?;
            }
            Ok(())
        }
        LocalBind::Unix(path) => check_socket_path(path),
    }
}

/// Validate a UNIX socket path: absolute, and only on platforms with UNIX
/// domain socket support.
pub fn check_socket_path(path: &Path) -> Result<()> {
    if !cfg!(unix) {
        return Err(Error::Config(format!(
            "UNIX socket binds are not supported on this platform: {}",
            path.display()
        )));
    }
    if !path.is_absolute() {
        return Err(Error::Config(format!(
            "socket path must be absolute: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Validate a list of bind endpoints.
///
/// All entries must pass [`check_address`] and be homogeneous in family:
/// either all `(host, port)` tuples or all socket paths.
pub fn check_addresses(binds: &[LocalBind]) -> Result<()> {
    for bind in binds {
        check_address(bind)?;
    }

    let tuples = binds.iter().filter(|b| matches!(b, LocalBind::Tcp { .. })).count();
    if tuples != 0 && tuples != binds.len() {
        return Err(Error::Config(
            "local bind addresses mix (host, port) tuples and socket paths".to_string(),
        ));
    }

    Ok(())
}
