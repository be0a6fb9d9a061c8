// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command line.
//!
//! Exit codes: 0 on success, 1 for errors caused by the caller's input
//! (bad arguments, 4xx responses), 2 for everything else.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use steadfast_core::runtime::SteadfastRuntimeBuilder;
use steadfast_core::{Config, CoreError};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::api::{self, AppState};
use crate::client::{ApiClient, ClientError};

#[derive(Debug, Parser)]
#[command(name = "steadfast", version, about = "Durable function engine")]
pub struct Cli {
    /// Base URL of a running server
    #[arg(long, env = "STEADFAST_API_URL", default_value = "http://127.0.0.1:8288", global = true)]
    pub api_url: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the engine and its HTTP API
    Serve,
    /// Send an event
    Enqueue {
        /// Event name
        #[arg(long)]
        name: String,
        /// Event data as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,
        /// Source key of the ingest endpoint
        #[arg(long, default_value = "cli")]
        key: String,
    },
    /// Print a run with its stack and trigger events
    InspectRun { run_id: String },
    /// Cancel a run
    CancelRun { run_id: String },
    /// Dead-letter every pending item of a function's partition
    Drain { function_id: String },
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve => serve().await,
        Command::Enqueue { name, data, key } => {
            let data: Value = serde_json::from_str(&data).context("--data is not valid JSON")?;
            let event = json!({ "name": name, "data": data });
            print(ApiClient::new(&cli.api_url)?.send_event(&key, &event).await?)
        }
        Command::InspectRun { run_id } => print(ApiClient::new(&cli.api_url)?.get_run(&run_id).await?),
        Command::CancelRun { run_id } => print(ApiClient::new(&cli.api_url)?.cancel_run(&run_id).await?),
        Command::Drain { function_id } => print(ApiClient::new(&cli.api_url)?.drain(&function_id).await?),
    }
}

fn print(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn serve() -> Result<()> {
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    info!(
        http_addr = %config.http_addr,
        database_url = %config.database_url,
        workers = config.workers.workers,
        "Starting steadfast"
    );

    let runtime = SteadfastRuntimeBuilder::from_config(&config)
        .build()?
        .start()
        .await?;

    let state = AppState {
        lifecycle: runtime.lifecycle().clone(),
        env_id: config.env_id,
    };
    let listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    info!(addr = %config.http_addr, "HTTP API listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Received shutdown signal");
        })
        .await
        .context("HTTP server failed")?;

    runtime.shutdown().await?;
    info!("steadfast stopped");
    Ok(())
}

/// Exit code for a failed command.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ClientError>() {
            return if e.is_user_error() { 1 } else { 2 };
        }
        if let Some(e) = cause.downcast_ref::<CoreError>() {
            return if e.is_user_error() { 1 } else { 2 };
        }
        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return 1;
        }
    }
    2
}
