//! cadence controller entry point.
//!
//! Loads configuration, initializes logging, and waits for the worker and
//! client transports to attach. Transports are deployment-specific; they
//! deliver the bootstrap `ClusterState` and per-worker connections to
//! `Controller::start`.

use std::path::Path;

use cadence::{config, telemetry, util};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    util::init_epoch();

    let mut cfg = config::load();
    if let Some(path) = std::env::args().nth(1) {
        cfg = config::overlay_file(cfg, Path::new(&path))?;
    }
    telemetry::init_logging(&cfg.log)?;

    tracing::info!(
        config = %serde_json::to_string(&cfg.effective_config())?,
        "cadence controller starting"
    );

    // Transport binding goes here: connect workers, receive the bootstrap
    // state, call Controller::start, then serve clients.
    tokio::signal::ctrl_c().await?;
    tracing::info!("cadence controller exiting");
    Ok(())
}
