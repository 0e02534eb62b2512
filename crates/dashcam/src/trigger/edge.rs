//! Rising-edge trigger on a digital line
//!
//! Fires when the line reads high. After firing it first waits for the
//! line to drop back low, so one held pulse triggers one capture. A line
//! that is already high on the very first wait fires at once.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::line::{Level, TriggerLine};
use super::{TriggerEvent, TriggerSource};

/// Default bound on each individual level wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct EdgeTrigger {
    line: Arc<dyn TriggerLine>,
    cancel: CancellationToken,
    poll_interval: Duration,
    need_release: bool,
    edges: u64,
}

impl EdgeTrigger {
    pub fn new(line: Arc<dyn TriggerLine>, cancel: CancellationToken) -> Self {
        Self {
            line,
            cancel,
            poll_interval: DEFAULT_POLL_INTERVAL,
            need_release: false,
            edges: 0,
        }
    }

    /// Bound each wait by `interval`; shutdown is noticed at that granularity.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Edges seen so far
    pub fn edges(&self) -> u64 {
        self.edges
    }

    /// Wait for `level`; `false` if cancelled first.
    async fn wait_level(&self, level: Level) -> Result<bool> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            if self.line.wait_for_level(level, self.poll_interval).await? {
                return Ok(true);
            }
        }
    }
}

#[async_trait::async_trait]
impl TriggerSource for EdgeTrigger {
    async fn wait_for_trigger(&mut self) -> Result<TriggerEvent> {
        if self.need_release {
            if !self.wait_level(Level::Low).await? {
                return Ok(TriggerEvent::Shutdown);
            }
            self.need_release = false;
        }

        if !self.wait_level(Level::High).await? {
            return Ok(TriggerEvent::Shutdown);
        }

        self.need_release = true;
        self.edges += 1;
        debug!(edges = self.edges, "Trigger line went high");
        Ok(TriggerEvent::Edge)
    }
}
