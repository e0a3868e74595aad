use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{oneshot, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use simbridge_lifecycle::{Bridge, Collaborators};
use simbridge_scheduler::TracingAlerter;
use simbridge_server::{AppState, StepLoopSummary, cli::Cli, router};
use simbridge_types::{BridgeConfig, SimulationConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = cli.bridge_config()?;
    let simulation_path = PathBuf::from(&config.simulation_config);
    let simulation = SimulationConfig::load(&simulation_path)
        .with_context(|| format!("failed to load simulation config {}", simulation_path.display()))?;
    info!(
        label = %simulation.label,
        books = simulation.book_count,
        state_dir = %config.resolved_state_dir().display(),
        "starting simbridge"
    );

    let bridge = Bridge::new(config.clone(), simulation, Collaborators::default(), Arc::new(TracingAlerter))
        .context("failed to open checkpoint store")?;
    let bridge = Arc::new(bridge);
    bridge.restore(cli.reset).await.context("failed to restore checkpoint")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind notification endpoint on {addr}"))?;
    info!(%addr, "notification endpoint listening");
    let mut http_shutdown = shutdown_rx.clone();
    let app = router(AppState::new(Arc::clone(&bridge)));
    let http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    let mut steps = spawn_step_listener(&config, Arc::clone(&bridge), shutdown_rx)?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        summary = &mut steps => match summary {
            Ok(summary) => info!(handled = summary.handled, failed = summary.failed, "step listener finished"),
            Err(_) => error!("step listener exited unexpectedly"),
        },
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = bridge.save_now().await {
        error!(error = %e, "final checkpoint failed");
    }
    http.await.context("notification endpoint task failed")??;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

/// Run the step loop on its own thread; receiving blocks on the request queue.
#[cfg(target_os = "linux")]
fn spawn_step_listener(
    config: &BridgeConfig,
    bridge: Arc<Bridge>,
    shutdown: watch::Receiver<bool>,
) -> Result<oneshot::Receiver<StepLoopSummary>> {
    use simbridge_transport::FramedTransport;

    let transport = FramedTransport::open(&config.transport).context("failed to open step transport")?;
    info!(
        request_queue = %config.transport.request_queue,
        response_queue = %config.transport.response_queue,
        "step transport open"
    );
    let runtime = tokio::runtime::Handle::current();
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("step-listener".into())
        .spawn(move || {
            let summary = simbridge_server::serve_steps(transport, bridge, runtime, shutdown);
            let _ = done_tx.send(summary);
        })
        .context("failed to start step listener thread")?;
    Ok(done_rx)
}

#[cfg(not(target_os = "linux"))]
fn spawn_step_listener(
    _config: &BridgeConfig,
    _bridge: Arc<Bridge>,
    _shutdown: watch::Receiver<bool>,
) -> Result<oneshot::Receiver<StepLoopSummary>> {
    anyhow::bail!("the step transport needs POSIX message queues and is only available on Linux")
}
