mod bootstrap;
mod catalog;
mod health;

use anyhow::Result;
use blueprint_core::config::{AppConfig, LoadOptions};
use tokio::task::JoinHandle;

fn init_logging(config: &AppConfig) {
    use blueprint_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config)?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        health::HealthState::from_app(&app),
    )
    .await?;

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    if let Some(parts) = &app.realtime {
        let client = parts.client.clone();
        tasks.push(tokio::spawn(async move {
            let status = client.run().await;
            tracing::info!(
                event_name = "system.realtime.finished",
                correlation_id = "realtime",
                state = status.state.as_str(),
                error = status.error.as_deref().unwrap_or("none"),
                "realtime connection loop finished"
            );
        }));

        let tabs = parts.tabs.clone();
        let store = parts.store.clone();
        let client = parts.client.clone();
        tasks.push(tokio::spawn(async move {
            let forwarded = tabs.forward_into(&store, Some(client.listeners())).await;
            tracing::debug!(
                event_name = "system.tabs.finished",
                correlation_id = "realtime",
                forwarded,
                "tab forwarding finished"
            );
        }));
    }

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        realtime_enabled = app.realtime.is_some(),
        tools = app.agent_runtime.tools().len(),
        "blueprint-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        audit_events = app.audit.events().len(),
        "blueprint-server stopping"
    );

    if let Some(parts) = &app.realtime {
        parts.client.stop();
        parts.tabs.close().await;
    }
    for task in tasks {
        if let Err(error) = task.await {
            tracing::warn!(
                event_name = "system.server.task_failed",
                correlation_id = "shutdown",
                error = %error,
                "background task ended abnormally"
            );
        }
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
