//! Replay Buffer Service
//!
//! Buffers a continuous frame feed in RAM with disk overflow and serves
//! Smart Pause requests against it.
//!
//! # Architecture
//!
//! ```text
//! SyntheticSource -> FrameBuffer (RAM ring -> disk segments -> recovery index)
//!                         ^
//!                         |
//! SIGUSR1 -> SmartPauseCoordinator -> PlaybackEngine
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with REPLAY_)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::{Context, Result};
use replay_buffer::config::{LoggingConfig, ReplayConfig};
use replay_buffer::{
    FrameBuffer, FrameWindowSource, LoggingPlaybackEngine, PlaybackEngine, RecoveryOutcome,
    SmartPauseCoordinator, SmartPauseDiagnostics, SmartPauseListener, SmartPauseOutcome,
    StatsReporter, SyntheticSource, Ticker,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logs every Smart Pause run.
struct DiagnosticsLogger;

impl SmartPauseListener for DiagnosticsLogger {
    fn on_diagnostics(&self, diagnostics: &SmartPauseDiagnostics) {
        let selected = diagnostics.selection.as_ref();
        info!(
            run_id = %diagnostics.run_id,
            success = diagnostics.is_success(),
            failure = diagnostics.failure.as_ref().map(|f| f.to_string()),
            frames = diagnostics.frames_after_recovery,
            backfill = diagnostics.backfill_attempted,
            attempts = diagnostics.scoring_attempts,
            cached = diagnostics.cached_scores_used,
            sequence = selected.map(|s| s.sequence),
            score = selected.map(|s| s.score),
            frame_age_ms = selected.map(|s| s.frame_age_ms),
            "Smart Pause diagnostics"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        stream_id = %config.stream.id,
        "Starting replay buffer service"
    );

    // Validate configuration
    config.validate()?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let result = run_service(config).await;
    if let Err(e) = &result {
        error!(error = %e, "Replay buffer service failed");
    }
    result
}

/// Load configuration, falling back to the environment alone.
fn load_config() -> Result<ReplayConfig> {
    let config = ReplayConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        ReplayConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("replay_buffer={}", level).parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

async fn run_service(config: ReplayConfig) -> Result<()> {
    let options = config.buffer_options();
    let (buffer, outcome) = tokio::task::spawn_blocking(move || FrameBuffer::open(options))
        .await
        .context("Buffer open task panicked")?
        .context("Failed to open frame buffer")?;

    match &outcome {
        RecoveryOutcome::Reattached(index) => info!(
            segments = index.segments.len(),
            next_sequence = buffer.next_sequence(),
            "Reattached to previous buffer window"
        ),
        RecoveryOutcome::Fresh { reason } => {
            info!(reason = %reason, "Starting with an empty buffer")
        }
    }

    let engine: Arc<dyn PlaybackEngine> =
        Arc::new(LoggingPlaybackEngine::new(config.source.seek_mode));
    let coordinator = Arc::new(SmartPauseCoordinator::new(
        buffer.clone() as Arc<dyn FrameWindowSource>,
        buffer.scorer().clone(),
        engine,
        config.smart_pause_settings(),
    ));
    coordinator.add_listener(Arc::new(DiagnosticsLogger));

    let reporter = Arc::new(StatsReporter::new(buffer.clone()));

    // Periodic upkeep
    let ticker = Ticker::new();
    ticker.every("index_snapshot", config.recovery.snapshot_interval(), {
        let buffer = buffer.clone();
        move || {
            if let Err(e) = buffer.persist_index() {
                warn!(error = %e, "Failed to write recovery index");
            }
        }
    });
    ticker.every("stats", config.stats.interval(), {
        let reporter = reporter.clone();
        move || {
            reporter.refresh();
        }
    });
    if let Some(period) = config.scoring.background_interval() {
        ticker.every("background_scoring", period, {
            let buffer = buffer.clone();
            move || {
                buffer.score_latest();
            }
        });
    }

    // Frame source
    let source_token = CancellationToken::new();
    let source_handle = tokio::task::spawn_blocking({
        let buffer = buffer.clone();
        let token = source_token.clone();
        let (width, height) = (config.source.width, config.source.height);
        let mut source = SyntheticSource::new(width, height, buffer.next_sequence());
        let interval = frame_interval(config.stream.nominal_fps);

        move || {
            info!(
                width,
                height,
                first_sequence = source.next_sequence(),
                "Synthetic source started"
            );
            while !token.is_cancelled() {
                if let Err(e) = buffer.ingest(source.next_frame()) {
                    warn!(error = %e, "Frame rejected");
                }
                std::thread::sleep(interval);
            }
        }
    });

    let trigger_handle = tokio::spawn(run_smart_pause_trigger(
        coordinator.clone(),
        ticker.token(),
    ));

    info!("Replay buffer service started");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Initiating graceful shutdown...");

    ticker.shutdown().await;
    trigger_handle.abort();

    source_token.cancel();
    if let Err(e) = source_handle.await {
        warn!(error = %e, "Source task ended abnormally");
    }

    let final_index = tokio::task::spawn_blocking({
        let buffer = buffer.clone();
        move || buffer.shutdown()
    })
    .await
    .context("Buffer shutdown task panicked")?
    .context("Failed to persist recovery index on shutdown")?;

    info!(segments = final_index.segments.len(), "Recovery index written");

    log_final_stats(&reporter, &coordinator);

    info!("Shutdown complete");
    Ok(())
}

/// Run Smart Pause on SIGUSR1. Each signal supersedes the run in flight.
async fn run_smart_pause_trigger(coordinator: Arc<SmartPauseCoordinator>, token: CancellationToken) {
    #[cfg(unix)]
    {
        let mut requests = signal::unix::signal(signal::unix::SignalKind::user_defined1())
            .expect("Failed to install SIGUSR1 handler");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = requests.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Smart Pause requested via SIGUSR1");
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        if let SmartPauseOutcome::Superseded = coordinator.request().await {
                            info!("Smart Pause run superseded");
                        }
                    });
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = coordinator;
        token.cancelled().await;
    }
}

fn frame_interval(fps: f64) -> Duration {
    if fps > 0.0 && fps.is_finite() {
        Duration::from_secs_f64(1.0 / fps)
    } else {
        Duration::from_millis(33)
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(reporter: &StatsReporter, coordinator: &SmartPauseCoordinator) {
    info!("=== Final Statistics ===");

    let stats = reporter.refresh();
    info!(
        frames_ingested = stats.frames_ingested,
        frames_rejected = stats.frames_rejected,
        disk_segments = stats.disk_segments,
        disk_bytes = stats.disk_bytes,
        disk_writes_dropped = stats.disk_writes_dropped,
        buffer_secs = format!("{:.1}", stats.buffer_duration_secs),
        "Buffer final stats"
    );

    if let Some(diagnostics) = coordinator.last_diagnostics() {
        info!(
            run_id = %diagnostics.run_id,
            success = diagnostics.is_success(),
            state = ?coordinator.state(),
            "Last Smart Pause run"
        );
    }
}
