// Dispatcher service main entry point.
mod observability;

use anyhow::Result;
use dispatcher::config::ServiceConfig;
use dispatcher::workload::Workload;
use std::future::Future;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("felix-dispatcher")?;
    let config = ServiceConfig::from_env_or_yaml()?;

    let metrics_bind = config.metrics_bind;
    let metrics_task = tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, addr = %metrics_bind, "metrics listener exited");
        }
    });

    let workload = Workload::start(&config)?;
    tracing::info!(
        subscription = %config.subscription,
        max_read_batch = config.dispatch.max_read_batch_size,
        delayed_delivery = config.dispatch.delayed_delivery_enabled,
        "dispatcher service started"
    );

    shutdown.await;
    workload.shutdown().await;
    metrics_task.abort();
    tracing::info!("dispatcher service stopped");
    Ok(())
}
