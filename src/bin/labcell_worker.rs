//! labcell-worker: device worker / workflow service
//!
//! Serves one inbox directory (and optionally an HTTP endpoint) with the
//! handler selected by `worker.kind`:
//! - `arm`: arm commands against the simulated controller
//! - `serial`: serial commands against the loopback link
//! - `workflow`: runs workflow definitions against the configured targets
//!
//! ## Configuration
//! - LABCELL_CONFIG: YAML config file (default: ./labcell.yaml if present)
//! - LABCELL_WORKER__KIND, LABCELL_WORKER__INBOX, ...: per-field overrides
//! - LABCELL_LOG: log filter (default: info)

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::info;

use labcell::config::{Config, WorkerKind};
use labcell::devices::arm::{ArmHandler, SimulatedArm};
use labcell::devices::serial::{loopback_opener, SerialHandler};
use labcell::dispatch::CorrelatedDispatcher;
use labcell::message::Target;
use labcell::utils::bootstrap::{connect_with_retry, init_tracing};
use labcell::worker::{CommandHandler, QueueWorker};
use labcell::workflow::{WorkflowCommandHandler, WorkflowEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    info!(kind = ?config.worker.kind, target = %config.worker.target, "Starting worker");

    match config.worker.kind {
        WorkerKind::Arm => {
            let simulation = config.arm.simulation.clone();
            let link = connect_with_retry("arm", || SimulatedArm::connect(&simulation))
                .await?
                .with_aux_bits(config.arm.tracker.aux);
            let handler = ArmHandler::new(link, config.arm.clone(), &config.worker.base_dir);
            serve(&config, handler).await
        }
        WorkerKind::Serial => {
            let handler = SerialHandler::new(loopback_opener(), config.serial.clone());
            serve(&config, handler).await
        }
        WorkerKind::Workflow => {
            let dispatcher = CorrelatedDispatcher::from_config(&config).await?;
            let engine = WorkflowEngine::new(dispatcher, config.dispatch.default_step_timeout());
            serve(&config, WorkflowCommandHandler::new(engine)).await
        }
    }
}

/// Run the queue loop (and HTTP endpoint, if configured) until Ctrl-C.
async fn serve<H: CommandHandler + 'static>(
    config: &Config,
    handler: H,
) -> Result<(), Box<dyn std::error::Error>> {
    let handler = Arc::new(Mutex::new(handler));
    let target = Target::new(&config.worker.target);
    let worker = QueueWorker::from_config(&config.worker, handler.clone())
        .await?
        .spawn();

    let (stop_tx, stop_rx) = watch::channel(false);
    let endpoint = match &config.worker.listen {
        #[cfg(feature = "http")]
        Some(listen) => {
            let listener = tokio::net::TcpListener::bind(listen).await?;
            let app = labcell::server::router(target.clone(), handler.clone());
            Some(tokio::spawn(labcell::server::serve(listener, app, stop_rx)))
        }
        #[cfg(not(feature = "http"))]
        Some(listen) => {
            tracing::warn!(%listen, "HTTP support not compiled in, serving the queue only");
            drop(stop_rx);
            None
        }
        None => {
            drop(stop_rx);
            None
        }
    };

    tokio::signal::ctrl_c().await?;
    info!(target = %target, "Shutdown requested");

    let _ = stop_tx.send(true);
    worker.shutdown().await;
    if let Some(endpoint) = endpoint {
        endpoint.await??;
    }

    info!(target = %target, "Worker exited");
    Ok(())
}
