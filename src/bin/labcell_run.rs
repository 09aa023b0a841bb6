//! labcell-run: run one workflow definition
//!
//! Usage: `labcell-run <workflow.json> [config.yaml]`
//!
//! Dispatches each step to the targets configured under `targets`, prints
//! the workflow result as JSON and exits non-zero if a step failed.

use tracing::{error, info};

use labcell::config::Config;
use labcell::dispatch::CorrelatedDispatcher;
use labcell::utils::bootstrap::init_tracing;
use labcell::workflow::{WorkflowDefinition, WorkflowEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let workflow_path = args
        .next()
        .ok_or("usage: labcell-run <workflow.json> [config.yaml]")?;
    let config_path = args.next();

    let config = Config::load(config_path.as_deref())?;
    let bytes = tokio::fs::read(&workflow_path).await?;
    let definition = WorkflowDefinition::from_json(&bytes)?;

    let dispatcher = CorrelatedDispatcher::from_config(&config).await?;
    info!(
        workflow = %definition.id,
        targets = dispatcher.targets().count(),
        "Running workflow from {}",
        workflow_path
    );

    let engine = WorkflowEngine::new(dispatcher, config.dispatch.default_step_timeout());
    let result = engine.run(&definition).await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.ok {
        error!(workflow = %result.id, failed_at = ?result.failed_at, "Workflow failed");
        std::process::exit(1);
    }
    Ok(())
}
