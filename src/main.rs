use anyhow::Context as _;
use kehto::config::Settings;
use kehto::context::Context;
use kehto::controller::ClusterRegistry;
use kehto::events::{ClusterEvent, EventBus, EventReceiver};
use kehto::server::{create_metrics, run_health_server, shutdown_channel, ReadinessState};
use kehto::telemetry::init_logging;
use std::sync::Arc;
use tracing::{info, warn};

/// Log every event until the bus closes
async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            ClusterEvent::Created(name) => info!(cluster = %name, "Cluster created"),
            ClusterEvent::Destroyed(name) => info!(cluster = %name, "Cluster destroyed"),
            ClusterEvent::ClustersChanged(count) => info!(count, "Cluster list changed"),
            ClusterEvent::ActiveChanged(Some(name)) => info!(cluster = %name, "Active cluster changed"),
            ClusterEvent::ActiveChanged(None) => info!("No active cluster"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    info!("Starting kehto k3d cluster controller");

    let settings = Settings::from_env().context("Invalid configuration")?;
    info!(
        kubeconfig = %settings.kubeconfig.display(),
        k3d = %settings.tools.k3d.display(),
        kubectl = %settings.tools.kubectl.display(),
        docker = %settings.tools.docker.display(),
        "Configuration loaded"
    );
    let refresh_interval = settings.refresh_interval;
    let health_port = settings.health_port;

    let (bus, events) = EventBus::new();
    let event_logger = tokio::spawn(log_events(events));

    let ctx = Arc::new(Context::new(settings, bus).context("Could not build HTTP client")?);
    let metrics = create_metrics().context("Could not register metrics")?;
    let registry = Arc::new(ClusterRegistry::new(ctx, Some(metrics.clone())));

    // Create readiness state (initially not ready)
    let readiness = ReadinessState::new();
    let server = tokio::spawn({
        let readiness = readiness.clone();
        let registry = registry.clone();
        async move {
            if let Err(e) = run_health_server(health_port, readiness, metrics, registry).await {
                warn!(error = %e, "Status server failed");
            }
        }
    });

    registry.refresh(true, None).await;
    readiness.set_ready();
    info!(
        clusters = registry.clusters().len(),
        active = ?registry.active().map(|c| c.name().to_string()),
        "Initial reconciliation done"
    );

    let (trigger, signal) = shutdown_channel();
    let reconciler = registry.spawn_periodic(refresh_interval, signal);

    tokio::signal::ctrl_c()
        .await
        .context("Could not listen for Ctrl-C")?;
    info!("Shutting down");

    trigger.trigger();
    if let Err(e) = reconciler.await {
        warn!(error = %e, "Reconciler task failed");
    }
    server.abort();
    drop(registry);
    event_logger.abort();

    Ok(())
}
