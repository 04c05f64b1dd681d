// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use anyhow::{Context, Result};
use clap::Parser;
use echowave::{Node, Protocol, RetryPolicy, Settings, Topology};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "echowave",
    about = "Run one node of an echo / election wave",
    version
)]
struct Cli {
    /// Topology file: this node first, then one neighbour per line.
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = Protocol::Echo)]
    protocol: Protocol,

    #[arg(
        long = "poll-interval-ms",
        env = "ECHOWAVE_POLL_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 1000
    )]
    poll_interval_ms: u64,

    /// Delay between connection attempts.
    #[arg(long = "backoff-ms", value_name = "MS", default_value_t = 1000)]
    backoff_ms: u64,

    /// Give up on a neighbour after this many attempts (default: never).
    #[arg(long = "max-dial-attempts", value_name = "N")]
    max_dial_attempts: Option<u32>,

    /// Keep accepting connections this long after terminating.
    #[arg(long = "linger-ms", value_name = "MS", default_value_t = 3000)]
    linger_ms: u64,

    /// Seed for random leader draws.
    #[arg(long, env = "ECHOWAVE_SEED")]
    seed: Option<u64>,
}

impl Cli {
    fn settings(&self) -> Settings {
        let backoff = Duration::from_millis(self.backoff_ms);
        let dial = match self.max_dial_attempts {
            Some(n) => RetryPolicy::bounded(backoff, n),
            None => RetryPolicy::forever(backoff),
        };
        Settings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            dial,
            linger: Duration::from_millis(self.linger_ms),
            seed: self.seed,
            ..Settings::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let topology = Topology::load(&cli.config, cli.protocol)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let node = Node::bind(topology, cli.settings())
        .await
        .context("binding listen address")?;

    let report = node.run().await?;
    info!("leader is {} (round {})", report.leader, report.round);
    if report.is_leader {
        info!("I was elected leader");
    }
    info!("detected network size is {}", report.detected_size);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}
