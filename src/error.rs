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

//! Error types for the tunnel forwarder.
//!
//! Every failure class the forwarder can surface has its own variant, so
//! callers (and the CLI exit-code mapping) can react per kind without string
//! matching. Handler-level failures never propagate past the connection they
//! belong to; they appear here only because listeners record them.

use std::fmt;

/// A single listener's failure to come up, recorded against its rule.
#[derive(Debug, Clone)]
pub struct ListenerFailure {
    /// The local bind endpoint of the failed rule, in display form.
    pub local_bind: String,
    /// Why the bind (or accept-loop start) failed.
    pub reason: String,
}

impl fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.local_bind, self.reason)
    }
}

/// Errors raised by the tunnel forwarder and its components.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid address, port, or path in the configuration.
    #[error("ConfigError: {0}")]
    Config(String),

    /// The credential resolver produced an empty list.
    #[error("NoAuthMethodsError: no authentication methods available")]
    NoAuthMethods,

    /// Every credential was rejected by the gateway.
    #[error("AuthenticationError: all credentials rejected (last error: {0})")]
    Authentication(String),

    /// The gateway's host key violated the configured policy.
    #[error("HostKeyError: {0}")]
    HostKey(String),

    /// The SSH transport failed to open or died underneath us.
    #[error("SessionError: {0}")]
    Session(String),

    /// One or more local listeners failed to bind, aggregated per rule.
    #[error("ListenerError: {} rule(s) failed: {}", .0.len(), format_failures(.0))]
    Listener(Vec<ListenerFailure>),

    /// A channel open or byte shuttle failed for a single connection.
    #[error("HandlerError: {0}")]
    Handler(String),

    /// Graceful stop exceeded the tunnel timeout and was escalated.
    #[error("ShutdownTimeout: graceful stop exceeded {0:?}, forced close")]
    ShutdownTimeout(std::time::Duration),
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Session(err.to_string())
    }
}

fn format_failures(failures: &[ListenerFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Exit code used by the CLI for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::NoAuthMethods | Error::Authentication(_) | Error::HostKey(_) => 2,
            Error::Listener(_) => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_error_aggregates_failures() {
        let err = Error::Listener(vec![
            ListenerFailure {
                local_bind: "127.0.0.1:8080".to_string(),
                reason: "address in use".to_string(),
            },
            ListenerFailure {
                local_bind: "127.0.0.1:8081".to_string(),
                reason: "permission denied".to_string(),
            },
        ]);

        let msg = err.to_string();
        assert!(msg.contains("2 rule(s) failed"));
        assert!(msg.contains("127.0.0.1:8080: address in use"));
        assert!(msg.contains("127.0.0.1:8081: permission denied"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Config("bad port".to_string()).exit_code(), 1);
        assert_eq!(Error::NoAuthMethods.exit_code(), 2);
        assert_eq!(Error::Authentication("denied".to_string()).exit_code(), 2);
        assert_eq!(Error::HostKey("mismatch".to_string()).exit_code(), 2);
        assert_eq!(Error::Listener(Vec::new()).exit_code(), 3);
        assert_eq!(
            Error::Handler("channel refused".to_string()).exit_code(),
            1
        );
    }

    #[test]
    fn test_error_kind_prefixes() {
        assert!(Error::Config("x".to_string()).to_string().starts_with("ConfigError"));
        assert!(Error::NoAuthMethods.to_string().starts_with("NoAuthMethodsError"));
        assert!(Error::HostKey("x".to_string()).to_string().starts_with("HostKeyError"));
    }
}
