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

//! OpenSSH client configuration lookup.
//!
//! Parses the handful of options the forwarder consumes: `HostName`, `User`,
//! `Port`, `IdentityFile`, `ProxyCommand`, `Compression`. Matching follows
//! OpenSSH semantics: blocks apply in file order, the first value seen for
//! an option wins, `*`/`?` glob patterns, `!` negation.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Options resolved for one host alias.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_files: Vec<PathBuf>,
    pub proxy_command: Option<String>,
    pub compression: Option<bool>,
}

#[derive(Debug, Clone)]
struct HostBlock {
    patterns: Vec<String>,
    options: HostConfig,
}

/// A parsed SSH config file.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

impl SshConfig {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read SSH config {}: {e}", path.display()))
        })?;
        Ok(Self::parse(&content))
    }

    /// Parse config text. Unknown options are ignored.
    pub fn parse(content: &str) -> Self {
        let mut blocks = Vec::new();
        let mut current: Option<HostBlock> = None;

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((keyword, value)) = split_keyword(line) else {
                continue;
            };

            if keyword.eq_ignore_ascii_case("host") {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
                current = Some(HostBlock {
                    patterns: value.split_whitespace().map(str::to_string).collect(),
                    options: HostConfig::default(),
                });
                continue;
            }

            // Options before the first Host block apply globally.
            let block = current.get_or_insert_with(|| HostBlock {
                patterns: vec!["*".to_string()],
                options: HostConfig::default(),
            });

            let opts = &mut block.options;
            if keyword.eq_ignore_ascii_case("hostname") {
                opts.hostname.get_or_insert_with(|| unquote(value));
            } else if keyword.eq_ignore_ascii_case("user") {
                opts.user.get_or_insert_with(|| unquote(value));
            } else if keyword.eq_ignore_ascii_case("port") {
                if opts.port.is_none() {
                    opts.port = value.parse::<u16>().ok();
                }
            } else if keyword.eq_ignore_ascii_case("identityfile") {
                opts.identity_files.push(expand_tilde(&unquote(value)));
            } else if keyword.eq_ignore_ascii_case("proxycommand") {
                opts.proxy_command.get_or_insert_with(|| value.to_string());
            } else if keyword.eq_ignore_ascii_case("compression") {
                if opts.compression.is_none() {
                    opts.compression = parse_yes_no(value);
                }
            }
        }

        if let Some(block) = current.take() {
            blocks.push(block);
        }

        Self { blocks }
    }

    /// Resolve the effective options for `alias`. Blocks are consulted in
    /// file order; the first value seen for each option wins, and identity
    /// files accumulate across all matching blocks.
    pub fn lookup(&self, alias: &str) -> HostConfig {
        let mut resolved = HostConfig::default();

        for block in &self.blocks {
            if !block_matches(&block.patterns, alias) {
                continue;
            }
            let opts = &block.options;
            if resolved.hostname.is_none() {
                resolved.hostname = opts.hostname.clone();
            }
            if resolved.user.is_none() {
                resolved.user = opts.user.clone();
            }
            if resolved.port.is_none() {
                resolved.port = opts.port;
            }
            if resolved.proxy_command.is_none() {
                resolved.proxy_command = opts.proxy_command.clone();
            }
            if resolved.compression.is_none() {
                resolved.compression = opts.compression;
            }
            for file in &opts.identity_files {
                if !resolved.identity_files.contains(file) {
                    resolved.identity_files.push(file.clone());
                }
            }
        }

        if resolved != HostConfig::default() {
            debug!("SSH config matched for '{alias}'");
        }
        resolved
    }
}

fn split_keyword(line: &str) -> Option<(&str, &str)> {
    // "Keyword value" or "Keyword=value".
    let idx = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (keyword, rest) = line.split_at(idx);
    let value = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '=');
    Some((keyword, value))
}

fn unquote(value: &str) -> String {
    value.trim_matches('"').to_string()
}

fn parse_yes_no(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn block_matches(patterns: &[String], host: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if glob_matches(negated, host) {
                return false;
            }
        } else if glob_matches(pattern, host) {
            matched = true;
        }
    }
    matched
}

/// Shell-style glob with `*` and `?`, as used by OpenSSH Host patterns.
fn glob_matches(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();

    // Iterative matcher with single-star backtracking.
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut star_t) = (None::<usize>, 0usize);

    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }

    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
