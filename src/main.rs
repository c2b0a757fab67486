use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loqa_wearable_sync::device::SystemHealthProbe;
use loqa_wearable_sync::{
    create_router, spawn_device, AppState, Config, DeviceEvent, DeviceRole, NatsLinkConfig,
    NatsPeerLink,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loqa-sync", version, about = "Wearable-to-host recording sync")]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(short, long, default_value = "config/loqa-sync")]
    config: String,

    /// Role to run; defaults to `device.role` from the configuration
    #[command(subcommand)]
    role: Option<RoleCommand>,
}

#[derive(Subcommand)]
enum RoleCommand {
    /// Capture audio and stream it to the host
    Wearable {
        /// Record a synthetic tone for this many seconds, then stop
        #[arg(long)]
        record_secs: Option<u64>,
    },
    /// Receive live chunks and finalized recordings
    Host,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    let (role, record_secs) = match cli.role {
        Some(RoleCommand::Wearable { record_secs }) => (DeviceRole::Wearable, record_secs),
        Some(RoleCommand::Host) => (DeviceRole::Host, None),
        None => (cfg.device.role, None),
    };

    info!(
        "{} v{} starting as {}",
        cfg.service.name,
        env!("CARGO_PKG_VERSION"),
        role
    );

    let recordings = cfg.recordings_dir();
    std::fs::create_dir_all(&recordings)
        .with_context(|| format!("Failed to create {}", recordings.display()))?;

    let (link, link_events) = NatsPeerLink::new(NatsLinkConfig {
        url: cfg.link.nats_url.clone(),
        subject_prefix: cfg.link.subject_prefix.clone(),
        context_bucket: cfg.link.context_bucket.clone(),
        role,
        inbox_dir: recordings.join("inbox"),
        segment_timeout: Duration::from_millis(cfg.link.segment_timeout_ms),
    });
    info!("Peer link over NATS at {}", cfg.link.nats_url);

    let (device, actor) = spawn_device(
        cfg.device_config(role),
        Arc::new(link),
        link_events,
        Arc::new(SystemHealthProbe),
    );

    let mut events = device.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => warn!("Event log skipped {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;
    info!("HTTP control API listening on {}", addr);
    let app = create_router(AppState::new(device.clone()));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server stopped: {}", e);
        }
    });

    if let Some(secs) = record_secs {
        device
            .start_recording()
            .await
            .context("Failed to start demo recording")?;
        info!("Recording a {}s tone", secs);
        tokio::time::sleep(Duration::from_secs(secs)).await;
        device
            .stop_recording()
            .await
            .context("Failed to stop demo recording")?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    device.shutdown().await;
    if let Err(e) = actor.await {
        error!("Device task ended abnormally: {}", e);
    }

    Ok(())
}

fn log_event(event: &DeviceEvent) {
    match event {
        DeviceEvent::StateChanged(state) => info!("State: {}", state),
        DeviceEvent::RecordingReceived {
            envelope, location, ..
        } => info!(
            "Recording {} stored at {}",
            envelope.filename,
            location.display()
        ),
        DeviceEvent::StreamProgress(progress) if progress.complete => info!(
            "Live stream {} complete ({} chunks)",
            progress.session_id, progress.received
        ),
        DeviceEvent::PeerError(report) => {
            if let Some(hint) = &report.recovery_suggestion {
                info!("Peer suggests: {}", hint);
            }
        }
        _ => {}
    }
}
