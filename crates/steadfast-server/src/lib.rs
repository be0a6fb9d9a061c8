// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steadfast Server
//!
//! HTTP front end and command line for the steadfast engine. The `serve`
//! subcommand runs the engine with its background loops behind the axum API;
//! the other subcommands talk to a running server through [`client::ApiClient`].

pub mod api;
pub mod cli;
pub mod client;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "steadfast_core=info,steadfast_server=info,tower_http=info";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. `STEADFAST_LOG_FORMAT=json`
/// switches to JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var("STEADFAST_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // A second init (tests) is not an error worth reporting.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
