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

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use btun::cli::log_filter;
use btun::{Cli, Error, TunnelForwarder};

/// Exit code for a stop caused by an interrupt signal.
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            let code = e.downcast_ref::<Error>().map_or(1, Error::exit_code);
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let opts = cli.into_options()?;
    let forwarder = Arc::new(TunnelForwarder::new(opts)?);

    // An interrupt during startup must still run the forced teardown
    // before the exit code reflects the signal.
    let started = tokio::select! {
        result = forwarder.start() => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted during startup");
            forwarder.stop_force().await;
            return Ok(EXIT_INTERRUPTED);
        }
    };
    if let Err(e) = started {
        forwarder.stop_force().await;
        return Err(e.into());
    }

    for addr in forwarder.local_bind_addresses() {
        println!("forwarding {addr}");
    }

    let signal = tokio::signal::ctrl_c().await;
    forwarder.stop_force().await;
    signal.context("cannot listen for interrupt signals")?;
    Ok(EXIT_INTERRUPTED)
}

fn init_logging(verbosity: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_filter(verbosity)))
        .with_target(false)
        .init();
}
