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

//! Gateway host key verification policies.
//!
//! Three policies: require the key to be present in known_hosts, accept any
//! key, or require a specific pinned fingerprint. Pinned fingerprints are
//! accepted as `SHA256:<base64>` (the OpenSSH display form) or as a bare hex
//! digest, case-insensitive, with or without colons.

use std::path::PathBuf;

use russh::keys::{HashAlg, PublicKey};
use tracing::debug;

use crate::error::{Error, Result};

/// System-wide known hosts file consulted after the user's own.
const SYSTEM_KNOWN_HOSTS: &str = "/etc/ssh/ssh_known_hosts";

/// How the gateway's presented host key is judged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// The key must match an entry in the known-hosts store.
    RequireKnown,
    /// Never reject. Useful for test rigs and pinned-network setups.
    AcceptAny,
    /// The key's SHA-256 fingerprint must equal the pinned value.
    RequireSpecific(String),
}

impl HostKeyPolicy {
    /// Verify a server key against this policy.
    ///
    /// Returns `Ok(())` on acceptance; rejection is always an
    /// [`Error::HostKey`] carrying the reason, never a silent `false`.
    pub fn verify(&self, hostname: &str, port: u16, key: &PublicKey) -> Result<()> {
        match self {
            HostKeyPolicy::AcceptAny => Ok(()),
            HostKeyPolicy::RequireSpecific(pinned) => {
                if fingerprint_matches(pinned, key) {
                    Ok(())
                } else {
                    Err(Error::HostKey(format!(
                        "host key fingerprint {} for {hostname}:{port} does not match pinned {pinned}",
                        key.fingerprint(HashAlg::Sha256)
                    )))
                }
            }
            HostKeyPolicy::RequireKnown => {
                match russh::keys::check_known_hosts(hostname, port, key) {
                    Ok(true) => return Ok(()),
                    Ok(false) => {
                        debug!("{hostname}:{port} not found in user known_hosts");
                    }
                    Err(e) => {
                        return Err(Error::HostKey(format!(
                            "known_hosts check failed for {hostname}:{port}: {e}"
                        )));
                    }
                }

                let system = PathBuf::from(SYSTEM_KNOWN_HOSTS);
                if system.exists() {
                    match russh::keys::check_known_hosts_path(hostname, port, key, &system) {
                        Ok(true) => return Ok(()),
                        Ok(false) => {}
                        Err(e) => {
                            return Err(Error::HostKey(format!(
                                "system known_hosts check failed for {hostname}:{port}: {e}"
                            )));
                        }
                    }
                }

                Err(Error::HostKey(format!(
                    "no known_hosts entry for {hostname}:{port} (key {})",
                    key.fingerprint(HashAlg::Sha256)
                )))
            }
        }
    }
}

/// Compare a pinned fingerprint string against a server key.
///
/// `SHA256:<base64>` compares against the OpenSSH display form; anything
/// else is treated as a hex digest with optional colons, case-insensitive.
pub fn fingerprint_matches(pinned: &str, key: &PublicKey) -> bool {
    let fp = key.fingerprint(HashAlg::Sha256);

    if let Some(b64) = pinned.strip_prefix("SHA256:") {
        let shown = fp.to_string();
        return shown.strip_prefix("SHA256:") == Some(b64.trim_end_matches('='));
    }

    let normalized: String = pinned
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase();
    normalized == to_hex(fp.as_bytes())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
