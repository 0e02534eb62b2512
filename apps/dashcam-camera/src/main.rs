//! Dashcam Camera Binary
//!
//! Takes stills from the Pi camera whenever the configured trigger fires and
//! writes them to disk for the companion process to serve or upload.
//!
//! ## Usage
//!
//! ```bash
//! # One still on each rising edge of GPIO 21
//! DASHCAM_MODE=gpio dashcam
//!
//! # One still every 2 seconds for a minute, numbered files
//! DASHCAM_MODE=timelapse DASHCAM_TIMELAPSE_MS=2000 DASHCAM_TIMEOUT_MS=60000 \
//!     DASHCAM_OUTPUT=/data/still-{seq}.jpg dashcam
//!
//! # Run with test source (development, no camera or GPIO)
//! DASHCAM_MODE=gpio dashcam --test-source
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dashcam::{
    AdvanceMode, AdvanceTiming, CapturePipeline, CaptureStage, Encoding, LibcameraConfig,
    LibcameraStage, OutputPath, PipelineConfig, Recorder, RunSummary, StageFormat, TriggerMode,
};
use dashcam::trigger::KeypressTrigger;

/// Exit status after a terminating signal
const SIGNAL_EXIT_CODE: i32 = 130;

/// Camera configuration from environment/args
struct Config {
    mode: AdvanceMode,
    /// Output path template
    output: OutputPath,
    /// Symlink to the newest still
    latest_link: Option<PathBuf>,
    /// Overall run limit (0 = none)
    timeout: Duration,
    /// Delay before the single still, and heartbeat period with the test source
    delay: Duration,
    timelapse: Duration,
    gpio_pin: u32,
    format: StageFormat,
    pool_size: usize,
    slot_size: usize,
    frame_start: u64,
    burst: bool,
    /// Use simulated stage and trigger line instead of real hardware
    test_source: bool,
}

impl Config {
    fn from_env() -> Result<Self> {
        let mode: AdvanceMode = std::env::var("DASHCAM_MODE")
            .unwrap_or_else(|_| "single".to_string())
            .parse()
            .context("Invalid DASHCAM_MODE")?;

        let output = std::env::var("DASHCAM_OUTPUT")
            .map(OutputPath::new)
            .unwrap_or_default();

        let latest_link = std::env::var("DASHCAM_LINK").ok().map(PathBuf::from);

        let timeout_ms: u64 = env_or("DASHCAM_TIMEOUT_MS", 0);
        let delay_ms: u64 = env_or("DASHCAM_DELAY_MS", 5000);
        let timelapse_ms: u64 = env_or("DASHCAM_TIMELAPSE_MS", 0);

        let encoding: Encoding = std::env::var("DASHCAM_ENCODING")
            .unwrap_or_else(|_| "jpg".to_string())
            .parse()
            .context("Invalid DASHCAM_ENCODING")?;

        let defaults = StageFormat::default();
        let format = StageFormat {
            width: env_or("DASHCAM_WIDTH", defaults.width),
            height: env_or("DASHCAM_HEIGHT", defaults.height),
            encoding,
            quality: env_or("DASHCAM_QUALITY", defaults.quality),
        };

        let pipeline_defaults = PipelineConfig::default();

        // Burst on by default, disable with DASHCAM_BURST=0
        let burst = std::env::var("DASHCAM_BURST")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(pipeline_defaults.burst);

        let args: Vec<String> = std::env::args().collect();
        let test_source = args.iter().any(|arg| arg == "--test-source");

        Ok(Self {
            mode,
            output,
            latest_link,
            timeout: Duration::from_millis(timeout_ms),
            delay: Duration::from_millis(delay_ms),
            timelapse: Duration::from_millis(timelapse_ms),
            gpio_pin: env_or("DASHCAM_GPIO_PIN", 21),
            format,
            pool_size: env_or("DASHCAM_POOL_SIZE", pipeline_defaults.pool_size),
            slot_size: env_or("DASHCAM_SLOT_SIZE", pipeline_defaults.slot_size),
            frame_start: env_or("DASHCAM_FRAME_START", 0),
            burst,
            test_source,
        })
    }

    fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            pool_size: self.pool_size,
            slot_size: self.slot_size,
            format: self.format.clone(),
            output: self.output.clone(),
            latest_link: self.latest_link.clone(),
            burst: self.burst,
        }
    }

    fn timing(&self) -> AdvanceTiming {
        AdvanceTiming::with_timeout(self.timeout)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dashcam=info".parse()?),
        )
        .init();

    let config = Config::from_env()?;

    info!("Dashcam starting");
    info!("  Mode: {}", config.mode);
    info!("  Output: {}", config.output);
    info!(
        "  Still: {}x{} {} q{}",
        config.format.width, config.format.height, config.format.encoding, config.format.quality
    );
    info!("  Pool: {} x {} bytes", config.pool_size, config.slot_size);
    if !config.timeout.is_zero() {
        info!("  Timeout: {:?}", config.timeout);
    }
    info!("  Test source: {}", config.test_source);

    // A stray SIGUSR1 would otherwise kill the process.
    #[cfg(unix)]
    if config.mode != AdvanceMode::Signal {
        unsafe {
            libc::signal(libc::SIGUSR1, libc::SIG_IGN);
        }
    }

    let cancel = CancellationToken::new();
    let interrupted = CancellationToken::new();
    tokio::spawn(watch_shutdown(cancel.clone(), interrupted.clone()));

    let summary = if config.test_source {
        #[cfg(feature = "test-source")]
        {
            info!("Starting simulated capture stage");
            let stage = dashcam::SimulatedStage::default();
            run_test_source(stage, &config, cancel.clone()).await?
        }
        #[cfg(not(feature = "test-source"))]
        {
            anyhow::bail!("Test source not enabled. Rebuild with --features test-source");
        }
    } else {
        info!("Starting libcamera capture stage");
        let stage = LibcameraStage::new(LibcameraConfig::default());
        let mode = trigger_mode(&config)?;
        run(stage, mode, &config, cancel.clone()).await?
    };

    info!(
        "Captured {} stills ({} bytes, {} with errors), next frame {}",
        summary.sessions, summary.bytes_written, summary.soft_errors, summary.next_frame
    );

    if interrupted.is_cancelled() {
        std::process::exit(SIGNAL_EXIT_CODE);
    }
    Ok(())
}

/// Build the pipeline and drive it until the run ends.
async fn run<S: CaptureStage>(
    stage: S,
    mode: TriggerMode,
    config: &Config,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let pipeline =
        CapturePipeline::new(stage, config.pipeline()).context("Failed to set up capture")?;
    Recorder::new(pipeline, mode, config.timing(), cancel)
        .with_frame_start(config.frame_start)
        .run()
        .await
}

/// Trigger mode backed by real hardware.
fn trigger_mode(config: &Config) -> Result<TriggerMode> {
    Ok(match config.mode {
        AdvanceMode::Single => TriggerMode::Single {
            delay: config.delay,
        },
        AdvanceMode::Forever => TriggerMode::Forever,
        AdvanceMode::Immediate => TriggerMode::Immediate,
        AdvanceMode::Timelapse => TriggerMode::Timelapse {
            interval: config.timelapse,
        },
        AdvanceMode::Keypress => TriggerMode::Keypress(KeypressTrigger::stdin()),
        #[cfg(unix)]
        AdvanceMode::Gpio => {
            let line = dashcam::trigger::SysfsLine::input(config.gpio_pin)
                .with_context(|| format!("Failed to open GPIO {}", config.gpio_pin))?;
            info!("Waiting for edges on GPIO {}", config.gpio_pin);
            TriggerMode::gpio(Arc::new(line))
        }
        #[cfg(unix)]
        AdvanceMode::Signal => {
            info!("Waiting for SIGUSR1 (pid {})", std::process::id());
            TriggerMode::user_signal()?
        }
        #[cfg(not(unix))]
        other => anyhow::bail!("{other} mode needs a unix host"),
    })
}

/// Same run with the simulated stage. In GPIO mode a heartbeat pulses a
/// simulated line every `delay`.
#[cfg(feature = "test-source")]
async fn run_test_source(
    stage: dashcam::SimulatedStage,
    config: &Config,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    if config.mode != AdvanceMode::Gpio {
        let mode = trigger_mode(config)?;
        return run(stage, mode, config, cancel).await;
    }

    let line = dashcam::SimulatedLine::default();
    let heartbeat = tokio::spawn(dashcam::grab::run_heartbeat(
        Arc::new(line.clone()),
        dashcam::grab::PulseConfig::default(),
        config.delay,
        cancel.child_token(),
    ));

    let result = run(stage, TriggerMode::gpio(Arc::new(line)), config, cancel.clone()).await;

    cancel.cancel();
    match heartbeat.await {
        Ok(Ok(pulses)) => info!("Heartbeat sent {} pulses", pulses),
        Ok(Err(e)) => warn!("Heartbeat failed: {:#}", e),
        Err(e) => warn!("Heartbeat task panicked: {}", e),
    }
    result
}

/// Cancel the run on SIGINT or SIGTERM.
async fn watch_shutdown(cancel: CancellationToken, interrupted: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }

    info!("Received shutdown signal, stopping capture...");
    interrupted.cancel();
    cancel.cancel();
}
