//! # Rill Worker - Stream Engine Node Runner
//!
//! Loads a YAML pipeline specification, assembles a node engine and runs
//! the query until it drains or Ctrl-C requests a graceful stop.
//!
//! ## Usage
//!
//! ```bash
//! # Run a pipeline from a YAML spec
//! rill-worker --pipeline pipelines/sensor-feed.yml
//!
//! # Accept inter-worker channels on a fixed port
//! rill-worker --pipeline feed.yml --listen 0.0.0.0:7070
//!
//! # Enable debug logging
//! RUST_LOG=debug rill-worker --pipeline feed.yml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rill_core::config::PipelineSpec;
use rill_core::reconfig::TerminationKind;
use rill_net::NodeLocation;
use rill_runtime::{NodeEngine, QueryStatus};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rill-worker")]
#[command(about = "Rill stream-processing worker node")]
struct Args {
    /// Pipeline YAML specification file
    #[arg(short, long)]
    pipeline: PathBuf,

    /// Query id assigned to the deployed pipeline
    #[arg(long, default_value_t = 1)]
    query_id: u64,

    /// Listen address for inter-worker channels, e.g. 0.0.0.0:7070.
    /// Without it the worker runs standalone.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let spec: PipelineSpec = {
        let yaml = std::fs::read_to_string(&args.pipeline)
            .with_context(|| format!("read {}", args.pipeline.display()))?;
        serde_yaml::from_str(&yaml).context("parse pipeline spec")?
    };

    let engine = match &args.listen {
        Some(listen) => {
            let (host, port) = listen
                .rsplit_once(':')
                .context("listen address must be host:port")?;
            let location = NodeLocation::new(host, port.parse().context("bad listen port")?);
            NodeEngine::with_network(&spec.runtime, location).await?
        }
        None => NodeEngine::new(&spec.runtime),
    };

    info!(pipeline = %spec.name, query = args.query_id, "deploying query");
    let query = engine.deploy(args.query_id, &spec).await?;

    let source_handles = query.source_handles().to_vec();
    let join = query.join();
    tokio::pin!(join);
    let status = tokio::select! {
        status = &mut join => status,
        _ = signal::ctrl_c() => {
            println!("\nReceived Ctrl-C, shutting down...");
            for handle in &source_handles {
                handle.stop(TerminationKind::Graceful);
            }
            join.await
        }
    };

    match status {
        QueryStatus::Completed => {
            info!(query = args.query_id, "query completed");
            Ok(())
        }
        QueryStatus::Stopped => {
            info!(query = args.query_id, "query stopped");
            Ok(())
        }
        QueryStatus::Failed(reason) => {
            error!(query = args.query_id, reason = %reason, "query failed");
            anyhow::bail!("query {} failed: {reason}", args.query_id)
        }
        QueryStatus::Running => Ok(()),
    }
}
