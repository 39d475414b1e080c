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

//! Credential resolution.
//!
//! Turns the caller's inputs (password, in-memory key, key files, agent,
//! key directories) into a deterministic ordered credential list:
//! explicit keys, then agent identities, then scanned directory keys, then
//! the password. Duplicate keys are collapsed by SHA-256 fingerprint,
//! keeping the first occurrence. A passphrase-protected key that cannot be
//! decrypted is skipped with a warning, not an error.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::{HashAlg, PrivateKey, PublicKey};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::options::ForwarderOptions;

/// Default key basenames probed in scan directories, in preference order.
const DEFAULT_KEY_NAMES: [&str; 4] = ["id_ed25519", "id_rsa", "id_ecdsa", "id_dsa"];

/// One candidate credential, in the order the session will try them.
#[derive(Debug, Clone)]
pub enum Credential {
    /// A private key, explicit or loaded from disk.
    Key(Arc<PrivateKey>),
    /// An identity held by the SSH agent; signing is delegated to the agent.
    AgentIdentity(PublicKey),
    /// Password authentication, always last.
    Password(Zeroizing<String>),
}

impl Credential {
    /// SHA-256 fingerprint used for deduplication; passwords have none.
    pub fn fingerprint(&self) -> Option<String> {
        match self {
            Credential::Key(key) => {
                Some(key.public_key().fingerprint(HashAlg::Sha256).to_string())
            }
            Credential::AgentIdentity(key) => {
                Some(key.fingerprint(HashAlg::Sha256).to_string())
            }
            Credential::Password(_) => None,
        }
    }

    /// Short label for logs. Never includes secret material.
    pub fn describe(&self) -> String {
        match self {
            Credential::Key(key) => format!(
                "key {}",
                key.public_key().fingerprint(HashAlg::Sha256)
            ),
            Credential::AgentIdentity(key) => {
                format!("agent identity {}", key.fingerprint(HashAlg::Sha256))
            }
            Credential::Password(_) => "password".to_string(),
        }
    }
}

/// Inputs to credential resolution.
#[derive(Debug, Default)]
pub struct CredentialResolver {
    /// In-memory key, first in line.
    pub explicit_key: Option<PrivateKey>,
    /// Key files given by the caller plus IdentityFile entries from the
    /// SSH config, in that order.
    pub key_files: Vec<PathBuf>,
    /// Passphrase tried for every encrypted key file.
    pub key_passphrase: Option<Zeroizing<String>>,
    pub allow_agent: bool,
    /// Directories scanned for keys not explicitly provided.
    pub scan_directories: Vec<PathBuf>,
    pub password: Option<Zeroizing<String>>,
}

impl CredentialResolver {
    /// Build a resolver from forwarder options plus any IdentityFile paths
    /// the SSH config lookup contributed.
    pub fn from_options(opts: &ForwarderOptions, config_identity_files: &[PathBuf]) -> Self {
        let mut key_files = opts.ssh_pkey_files.clone();
        for path in config_identity_files {
            if !key_files.contains(path) {
                key_files.push(path.clone());
            }
        }

        Self {
            explicit_key: opts.ssh_pkey.clone(),
            key_files,
            key_passphrase: opts.ssh_pkey_password.clone(),
            allow_agent: opts.allow_agent,
            scan_directories: opts.host_pkey_directories.clone(),
            password: opts.ssh_password.clone(),
        }
    }

    /// Produce the ordered, deduplicated credential list.
    ///
    /// An empty result is a hard error: the session would have nothing to
    /// offer the gateway.
    pub async fn resolve(&self) -> Result<Vec<Credential>> {
        let mut credentials = Vec::new();
        let mut seen = HashSet::new();

        if let Some(key) = &self.explicit_key {
            push_unique(
                &mut credentials,
                &mut seen,
                Credential::Key(Arc::new(key.clone())),
            );
        }

        for path in &self.key_files {
            if let Some(key) = self.load_key_file(path) {
                push_unique(&mut credentials, &mut seen, Credential::Key(Arc::new(key)));
            }
        }

        #[cfg(not(target_os = "windows"))]
        if self.allow_agent {
            for identity in enumerate_agent_identities().await {
                push_unique(
                    &mut credentials,
                    &mut seen,
                    Credential::AgentIdentity(identity),
                );
            }
        }

        for dir in &self.scan_directories {
            for path in scan_key_candidates(dir) {
                if let Some(key) = self.load_key_file(&path) {
                    push_unique(&mut credentials, &mut seen, Credential::Key(Arc::new(key)));
                }
            }
        }

        if let Some(password) = &self.password {
            credentials.push(Credential::Password(password.clone()));
        }

        if credentials.is_empty() {
            return Err(Error::NoAuthMethods);
        }

        debug!(
            "resolved {} credential(s): {}",
            credentials.len(),
            credentials
                .iter()
                .map(Credential::describe)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(credentials)
    }

    /// Load one key file, trying the configured passphrase. Undecodable or
    /// wrongly-encrypted keys are dropped with a warning.
    fn load_key_file(&self, path: &Path) -> Option<PrivateKey> {
        let passphrase = self.key_passphrase.as_ref().map(|p| p.as_str());
        match russh::keys::load_secret_key(path, passphrase) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("skipping key file {}: {e}", path.display());
                None
            }
        }
    }
}

fn push_unique(
    credentials: &mut Vec<Credential>,
    seen: &mut HashSet<String>,
    credential: Credential,
) {
    match credential.fingerprint() {
        Some(fp) => {
            if seen.insert(fp) {
                credentials.push(credential);
            } else {
                debug!("dropping duplicate credential: {}", credential.describe());
            }
        }
        None => credentials.push(credential),
    }
}

/// List identities held by the SSH agent, if one is reachable through
/// `SSH_AUTH_SOCK`. Absence of an agent is not an error.
#[cfg(not(target_os = "windows"))]
async fn enumerate_agent_identities() -> Vec<PublicKey> {
    if std::env::var("SSH_AUTH_SOCK").is_err() {
        debug!("SSH_AUTH_SOCK not set, skipping agent");
        return Vec::new();
    }

    let mut agent = match russh::keys::agent::client::AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(e) => {
            warn!("SSH agent unreachable: {e}");
            return Vec::new();
        }
    };

    match agent.request_identities().await {
        Ok(identities) => {
            debug!("agent holds {} identit(ies)", identities.len());
            identities
        }
        Err(e) => {
            warn!("SSH agent refused identity listing: {e}");
            Vec::new()
        }
    }
}

/// Candidate key files inside a scan directory: the well-known basenames in
/// preference order, then any other `id_*` private keys sorted by name.
fn scan_key_candidates(dir: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    for name in DEFAULT_KEY_NAMES {
        let path = dir.join(name);
        if path.is_file() {
            candidates.push(path);
        }
    }

    let mut extra = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with("id_")
                && !name.ends_with(".pub")
                && !DEFAULT_KEY_NAMES.contains(&name)
                && path.is_file()
            {
                extra.push(path);
            }
        }
    }
    extra.sort();
    candidates.extend(extra);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::Algorithm;
    use ssh_key::LineEnding;
    use tempfile::TempDir;

    fn generate_key() -> PrivateKey {
        PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap()
    }

    fn write_key(dir: &Path, name: &str, key: &PrivateKey) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_resolve_order_explicit_then_password() {
        let key = generate_key();
        let resolver = CredentialResolver {
            explicit_key: Some(key),
            password: Some(Zeroizing::new("hunter2".to_string())),
            allow_agent: false,
            ..Default::default()
        };

        let credentials = resolver.resolve().await.unwrap();
        assert_eq!(credentials.len(), 2);
        assert!(matches!(credentials[0], Credential::Key(_)));
        assert!(matches!(credentials[1], Credential::Password(_)));
    }

    #[tokio::test]
    async fn test_resolve_empty_is_hard_error() {
        let resolver = CredentialResolver {
            allow_agent: false,
            ..Default::default()
        };
        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, Error::NoAuthMethods));
    }

    #[tokio::test]
    async fn test_duplicate_keys_collapse_keeping_first() {
        let tmp = TempDir::new().unwrap();
        let key = generate_key();
        let first = write_key(tmp.path(), "deploy_key", &key);
        let second = write_key(tmp.path(), "same_key_again", &key);

        let resolver = CredentialResolver {
            key_files: vec![first, second],
            allow_agent: false,
            password: Some(Zeroizing::new("pw".to_string())),
            ..Default::default()
        };

        let credentials = resolver.resolve().await.unwrap();
        // One key (deduplicated) plus the password.
        assert_eq!(credentials.len(), 2);
        assert!(matches!(credentials[0], Credential::Key(_)));
    }

    #[tokio::test]
    async fn test_unreadable_key_is_skipped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let bogus = tmp.path().join("not_a_key");
        std::fs::write(&bogus, b"this is not PEM").unwrap();

        let resolver = CredentialResolver {
            key_files: vec![bogus],
            allow_agent: false,
            password: Some(Zeroizing::new("pw".to_string())),
            ..Default::default()
        };

        let credentials = resolver.resolve().await.unwrap();
        assert_eq!(credentials.len(), 1);
        assert!(matches!(credentials[0], Credential::Password(_)));
    }

    #[tokio::test]
    async fn test_scanned_directory_keys_come_before_password() {
        let tmp = TempDir::new().unwrap();
        let key = generate_key();
        write_key(tmp.path(), "id_ed25519", &key);

        let resolver = CredentialResolver {
            scan_directories: vec![tmp.path().to_path_buf()],
            allow_agent: false,
            password: Some(Zeroizing::new("pw".to_string())),
            ..Default::default()
        };

        let credentials = resolver.resolve().await.unwrap();
        assert_eq!(credentials.len(), 2);
        assert!(matches!(credentials[0], Credential::Key(_)));
        assert!(matches!(credentials[1], Credential::Password(_)));
    }

    #[test]
    fn test_scan_candidates_prefer_known_names() {
        let tmp = TempDir::new().unwrap();
        let key = generate_key();
        write_key(tmp.path(), "id_zzz_custom", &key);
        write_key(tmp.path(), "id_rsa", &key);
        // Public halves are never candidates.
        std::fs::write(tmp.path().join("id_rsa.pub"), b"ssh-rsa AAAA").unwrap();

        let candidates = scan_key_candidates(tmp.path());
        let names: Vec<_> = candidates
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["id_rsa", "id_zzz_custom"]);
    }

    #[test]
    fn test_describe_never_leaks_password() {
        let credential = Credential::Password(Zeroizing::new("s3cret".to_string()));
        assert_eq!(credential.describe(), "password");
    }
}
