use anyhow::Result;
use std::sync::Arc;
use sunward::controller::{self, ChargeController, ControllerCommand};
use sunward::{Config, web};
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config: {}", e))?;
    sunward::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Sunward solar charging controller starting up");

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ControllerCommand>();
    let (host, port) = (config.web.host.clone(), config.web.port);

    let (charge_controller, ai_rx) = ChargeController::new(config)
        .map_err(|e| anyhow::anyhow!("Failed to create controller: {}", e))?;
    let controller_arc = Arc::new(Mutex::new(charge_controller));

    // Spawn web server alongside the control loop
    let web_controller = controller_arc.clone();
    let web_commands = cmd_tx.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(web_controller, web_commands, &host, port).await {
            error!("Web server error: {}", e);
        }
    });

    // Forward Ctrl-C into a clean loop shutdown
    let shutdown_tx = cmd_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(ControllerCommand::Shutdown);
        }
    });

    controller::run(controller_arc, cmd_rx, ai_rx).await;

    info!("Controller shutdown complete");
    web_task.abort();
    Ok(())
}
