//! hookrelay Pump - forwards queued GitHub webhooks to the CI server.
//!
//! Runs `PUMP_INSTANCES` polling loops over one queue handle and one HTTP
//! client. Each loop receives a batch, POSTs every payload to the CI
//! endpoint, deletes what was delivered, and sleeps before polling again.

use anyhow::{Context, Result};
use tokio::{signal, sync::watch};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hookrelay::{queue, Forwarder, Pump, PumpConfig, PumpSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("pump_starting");

    // Load configuration from environment
    let config = PumpConfig::from_env().context("Invalid pump configuration")?;
    info!(
        ci_endpoint = %config.ci_endpoint,
        queue_backend = config.queue.backend_name(),
        poll_interval_secs = config.poll_interval.as_secs(),
        receive_wait_secs = config.receive_wait.as_secs(),
        receive_max_messages = config.receive_max_messages,
        forward_timeout_secs = config.forward_timeout.as_secs(),
        max_receive_count = ?config.max_receive_count,
        retain_on_http_error = config.retain_on_http_error,
        instances = config.instances,
        "config_loaded"
    );

    let queue = queue::connect(&config.queue)
        .await
        .context("Failed to connect to queue")?;
    info!("queue_connected");

    let forwarder = Forwarder::from_config(&config).context("Failed to create HTTP client")?;
    let pump = Pump::new(queue.clone(), forwarder, PumpSettings::from_config(&config));

    let (stop_tx, stop_rx) = watch::channel(false);

    let loops: Vec<_> = (0..config.instances)
        .map(|instance| {
            let pump = pump.clone().with_instance(instance);
            let mut stop_rx = stop_rx.clone();
            tokio::spawn(async move {
                pump.run_until(async move {
                    let _ = stop_rx.wait_for(|stop| *stop).await;
                })
                .await;
            })
        })
        .collect();

    info!("pump_ready");

    shutdown_signal().await;
    let _ = stop_tx.send(true);

    for result in futures::future::join_all(loops).await {
        result.context("Pump task failed")?;
    }

    queue.close().await;

    info!("pump_shutdown_complete");
    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("pump_shutting_down");
}
