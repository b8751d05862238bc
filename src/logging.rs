// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! tracing subscriber setup for the CLI.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Level used when `RUST_LOG` is unset: warn, info, debug, then trace.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "bgfetch=info",
        2 => "bgfetch=debug",
        _ => "bgfetch=trace",
    }
}

/// Install a stderr fmt subscriber. `RUST_LOG` takes precedence over
/// `verbosity`. Fails if a global subscriber is already set.
pub fn init_logging(verbosity: u8) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbosity >= 2)
        .try_init()
        .map_err(|e| anyhow!("failed to initialise logging: {}", e))
}
