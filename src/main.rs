//! framecast: capture a camera, serve snapshots and MJPEG, push frames upstream

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framecast::capture::build_source;
use framecast::pipeline::{frame_slot, CaptureLoop, CaptureStatus};
use framecast::serve::{self, AppState, SnapshotProvider, StreamDistributor};
use framecast::shutdown::{Shutdown, ShutdownSignal};
use framecast::upload::{Credentials, HttpPush, PeriodicUploader};
use framecast::{Config, AUTO_DEVICE};

const DEFAULT_CONFIG_PATH: &str = "framecast.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framecast=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("framecast {} launching...", env!("CARGO_PKG_VERSION"));

    let config_path = config_path();
    let mut config = Config::load(&config_path)?;
    info!("Loaded configuration from {}", config_path.display());

    resolve_device(&mut config)?;
    info!("Using capture device: {}", config.capture.device);

    let shutdown = Shutdown::new();
    let (publisher, slot) = frame_slot();
    let status = CaptureStatus::new();

    // Capture runs on its own thread and owns the source
    let source = build_source(&config.capture)?;
    let capture = CaptureLoop::new(
        source,
        publisher,
        status.clone(),
        config.capture.clone(),
        shutdown.signal(),
    )
    .spawn()?;

    let snapshots = SnapshotProvider::new(slot.clone());
    let (interval_tx, interval_rx) = watch::channel(config.push.interval());
    let uploader = if config.push.is_enabled() {
        let push = HttpPush::new(&config.push.url, config.push.timeout())?;
        info!("Pushing frames to {}", push.url());
        let credentials = Credentials {
            token: config.push.token.clone(),
            fingerprint: config.push.fingerprint.clone(),
        };
        let uploader = PeriodicUploader::new(push, snapshots.clone(), credentials, interval_rx);
        Some(tokio::spawn(uploader.run(shutdown.signal())))
    } else {
        info!("No push token configured, uploads disabled");
        None
    };

    let server_shutdown = shutdown.signal();
    tokio::spawn(reload_on_hangup(config_path, interval_tx, shutdown.signal()));
    tokio::spawn(trigger_on_signal(shutdown));

    let state = AppState {
        snapshots,
        distributor: StreamDistributor::new(slot, &config.stream),
        status,
        shutdown: server_shutdown,
        snapshot_wait: Duration::from_millis(config.server.snapshot_wait_ms),
    };
    serve::serve(config.server.bind_addr()?, state).await?;

    if let Some(uploader) = uploader {
        uploader.await?;
    }
    tokio::task::spawn_blocking(move || capture.join())
        .await?
        .map_err(|_| eyre!("capture thread panicked"))?;

    info!("framecast shutting down");
    Ok(())
}

/// First CLI argument, then `FRAMECAST_CONFIG`, then `framecast.toml`
fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("FRAMECAST_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(feature = "v4l2")]
fn resolve_device(config: &mut Config) -> Result<()> {
    if config.capture.device != AUTO_DEVICE {
        return Ok(());
    }
    let found = framecast::utils::auto_detect_device()
        .ok_or_else(|| eyre!("No suitable capture device found"))?;
    config.capture.device = found.path;
    config.capture.format = found.format;
    Ok(())
}

#[cfg(not(feature = "v4l2"))]
fn resolve_device(config: &mut Config) -> Result<()> {
    if config.capture.device == AUTO_DEVICE {
        return Err(eyre!(
            "capture.device = \"auto\" needs the v4l2 feature; name the device explicitly"
        ));
    }
    Ok(())
}

/// SIGHUP re-reads the configuration and applies the push interval
async fn reload_on_hangup(
    path: PathBuf,
    interval: watch::Sender<Duration>,
    shutdown: ShutdownSignal,
) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Cannot listen for SIGHUP, reload disabled: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.triggered() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
            }
        }

        match Config::load(&path) {
            Ok(config) => {
                info!("Reloaded {}", path.display());
                interval.send_replace(config.push.interval());
            }
            Err(e) => warn!("Keeping current settings, reload failed: {}", e),
        }
    }
}

/// Ctrl-C or SIGTERM starts a graceful shutdown
async fn trigger_on_signal(shutdown: Shutdown) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = terminate => info!("Terminated"),
    }
    shutdown.trigger();
}
