//! Frame source runner: drives the capture thread and stands in for the consumer.

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use framesource::capture::{CaptureStateMachine, DeviceConnector, ResolutionNormalizer};
use framesource::{AppConfig, CancellationSignal, HandoffQueue, RequestToken, SourceHandle};

const DEFAULT_CONFIG: &str = "framesource.toml";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| DEFAULT_CONFIG.to_string()),
    );
    let config = AppConfig::load(Some(config_path.as_path()))?;

    // RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    info!("Frame source launching...");

    if let Some(nice) = config.capture.nice {
        framesource::utils::set_process_nice(nice);
    }

    let source = SourceHandle::new(config.source_config());
    match source.load() {
        Some(snapshot) => info!(source = %snapshot.source, backend = ?snapshot.backend, "capture source configured"),
        None => info!("no capture source configured yet; waiting"),
    }

    let (queue, consumer) = HandoffQueue::channel();
    let request = RequestToken::new();
    let cancel = CancellationSignal::new();

    let machine = CaptureStateMachine::new(
        DeviceConnector,
        source.clone(),
        queue,
        request.clone(),
        cancel.clone(),
    )
    .with_timing(config.pipeline.timing())
    .with_normalizer(ResolutionNormalizer::new(config.pipeline.max_resolution));
    let mut status = machine.status();
    let capture_handle = machine.spawn(config.capture.pin_to_core)?;

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(config_path, source.clone()));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut report = tokio::time::interval(Duration::from_secs(5));
    let mut received: u64 = 0;

    loop {
        request.request();
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                info!(state = ?*status.borrow_and_update(), "camera status");
            }
            frame = consumer.recv_async() => match frame {
                Some(frame) => {
                    received += 1;
                    let (width, height) = frame.image.dimensions();
                    debug!(sequence = ?frame.sequence, fps = frame.fps, width, height, "frame received");
                }
                None => break,
            },
            _ = report.tick() => {
                let stats = consumer.stats();
                info!(
                    received,
                    pushed = stats.frames_pushed,
                    backpressure = stats.backpressure_warnings,
                    "capture stats"
                );
            }
        }
    }

    cancel.fire();
    drop(consumer);
    match tokio::task::spawn_blocking(move || capture_handle.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => warn!("capture thread panicked"),
        Err(e) => warn!("failed to join capture thread: {}", e),
    }

    info!("Frame source shutting down");
    Ok(())
}

/// Re-read the config file on SIGHUP and hot-swap the capture source.
#[cfg(unix)]
async fn reload_on_hangup(path: PathBuf, source: SourceHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("SIGHUP handler unavailable: {}", e);
            return;
        }
    };
    while hangup.recv().await.is_some() {
        match AppConfig::load(Some(path.as_path())) {
            Ok(config) => {
                let next = config.source_config();
                info!(source = ?next.as_ref().map(|c| &c.source), "configuration reloaded");
                source.set(next);
            }
            Err(e) => warn!("configuration reload failed: {}", e),
        }
    }
}
