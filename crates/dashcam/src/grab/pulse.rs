//! Trigger pulse generator
//!
//! Drives an output line high then low to fire the capture process on the
//! other end of the wire. A heartbeat repeats the pulse on a fixed period.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::trigger::{Level, OutputLine};

/// Pulse shape
#[derive(Debug, Clone)]
pub struct PulseConfig {
    /// Time the line is held high
    pub high: Duration,
    /// Time the line is held low afterwards
    pub low: Duration,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            high: Duration::from_millis(500),
            low: Duration::from_millis(500),
        }
    }
}

/// Send one pulse on `line`.
pub async fn send_pulse(line: &dyn OutputLine, config: &PulseConfig) -> Result<()> {
    line.set_level(Level::High)?;
    tokio::time::sleep(config.high).await;
    line.set_level(Level::Low)?;
    tokio::time::sleep(config.low).await;
    debug!("Capture pulse sent");
    Ok(())
}

/// Pulse `line` every `period` until cancelled. Returns the pulses sent.
pub async fn run_heartbeat(
    line: Arc<dyn OutputLine>,
    config: PulseConfig,
    period: Duration,
    cancel: CancellationToken,
) -> Result<u64> {
    info!("Heartbeat started: pulse every {:?}", period);

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pulses = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                send_pulse(line.as_ref(), &config).await?;
                pulses += 1;
            }
        }
    }

    line.set_level(Level::Low)?;
    info!("Heartbeat stopped after {} pulses", pulses);
    Ok(pulses)
}

#[cfg(all(test, feature = "test-source"))]
mod tests {
    use super::*;
    use crate::trigger::{SimulatedLine, TriggerLine};

    #[tokio::test(start_paused = true)]
    async fn pulse_goes_high_then_low() {
        let line = SimulatedLine::default();
        let driver = line.clone();
        let pulse = tokio::spawn(async move {
            send_pulse(&driver, &PulseConfig::default()).await
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(line.level().unwrap(), Level::High);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(line.level().unwrap(), Level::Low);

        pulse.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_repeats_until_cancelled() {
        let line = SimulatedLine::default();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            Arc::new(line.clone()),
            PulseConfig::default(),
            Duration::from_secs(2),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(5500)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap().unwrap(), 3);
        assert_eq!(line.level().unwrap(), Level::Low);
    }
}
