//! Dashgrab Binary
//!
//! Companion to the camera: pulses the capture line on demand and saves the
//! stills peers upload over TCP.
//!
//! ## Usage
//!
//! ```bash
//! # Press c to fire a capture, q to quit
//! dashgrab
//!
//! # Also pulse the line every 10 seconds
//! DASHGRAB_HEARTBEAT_MS=10000 dashgrab
//! ```

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use dashcam::grab::{run_heartbeat, send_pulse, PulseConfig, ReceiverConfig, UploadReceiver};
use dashcam::trigger::{OutputLine, SysfsLine};

struct Config {
    /// Upload listen address
    bind: SocketAddr,
    /// Directory uploads are saved into
    dir: PathBuf,
    /// GPIO pin wired to the camera's trigger input
    pin: u32,
    /// Automatic pulse period (None = manual only)
    heartbeat: Option<Duration>,
}

impl Config {
    fn from_env() -> Self {
        let defaults = ReceiverConfig::default();

        let bind = std::env::var("DASHGRAB_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.bind);

        let dir = std::env::var("DASHGRAB_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.dir);

        let pin: u32 = std::env::var("DASHGRAB_PIN")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(20);

        let heartbeat = std::env::var("DASHGRAB_HEARTBEAT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Self {
            bind,
            dir,
            pin,
            heartbeat,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dashgrab=info".parse()?)
                .add_directive("dashcam=info".parse()?),
        )
        .init();

    let config = Config::from_env();

    info!("Dashgrab starting");
    info!("  Listening on: {}", config.bind);
    info!("  Upload dir: {:?}", config.dir);
    info!("  Trigger pin: GPIO {}", config.pin);

    let line: Arc<dyn OutputLine> = Arc::new(
        SysfsLine::output(config.pin)
            .with_context(|| format!("Failed to open GPIO {}", config.pin))?,
    );

    let receiver = UploadReceiver::bind(ReceiverConfig {
        bind: config.bind,
        dir: config.dir.clone(),
    })
    .await?;

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let receiver_cancel = cancel.clone();
    tracker.spawn(async move {
        match receiver.run(receiver_cancel).await {
            Ok(uploads) => info!("Upload receiver stopped after {} uploads", uploads),
            Err(e) => error!("Upload receiver failed: {:#}", e),
        }
    });

    if let Some(period) = config.heartbeat {
        let line = line.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = run_heartbeat(line, PulseConfig::default(), period, cancel).await {
                error!("Heartbeat failed: {:#}", e);
            }
        });
    }
    tracker.close();

    let result = run_keyboard(line).await;

    info!("Shutting down...");
    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s, some tasks may not have finished");
    }

    result
}

/// Raw-mode keyboard loop: `c` fires a capture pulse, `q` quits.
async fn run_keyboard(line: Arc<dyn OutputLine>) -> Result<()> {
    use crossterm::{
        event::{self, Event, KeyCode, KeyEventKind},
        terminal::{disable_raw_mode, enable_raw_mode},
    };

    info!("Press c to capture, q to quit");
    enable_raw_mode()?;

    let tick_rate = Duration::from_millis(250);
    let pulse = PulseConfig::default();

    let result: Result<()> = loop {
        let ready = match event::poll(tick_rate) {
            Ok(ready) => ready,
            Err(e) => break Err(e.into()),
        };
        if !ready {
            tokio::task::yield_now().await;
            continue;
        }

        let key = match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => key,
            Ok(_) => continue,
            Err(e) => break Err(e.into()),
        };

        match key.code {
            KeyCode::Char('q') | KeyCode::Char('Q') => break Ok(()),
            KeyCode::Char('c') | KeyCode::Char('C') => {
                if let Err(e) = send_pulse(line.as_ref(), &pulse).await {
                    warn!("Capture pulse failed: {:#}", e);
                }
            }
            _ => {}
        }
    };

    // Restore terminal
    disable_raw_mode()?;
    result
}
