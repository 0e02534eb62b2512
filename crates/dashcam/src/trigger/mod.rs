//! Trigger sources
//!
//! Everything that can start a capture (a rising edge on a GPIO line, a
//! keypress, a timer, a POSIX signal) sits behind one async
//! [`TriggerSource::wait_for_trigger`] call. Waits run until satisfied; the
//! edge trigger also watches a cancellation token so shutdown is noticed
//! between bounded polls.

use anyhow::Result;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub mod edge;
pub mod keypress;
pub mod line;
#[cfg(unix)]
pub mod signal;
#[cfg(unix)]
pub mod sysfs;

pub use edge::EdgeTrigger;
pub use keypress::KeypressTrigger;
pub use line::{Level, OutputLine, TriggerLine};
#[cfg(feature = "test-source")]
pub use line::SimulatedLine;
#[cfg(unix)]
pub use signal::SignalTrigger;
#[cfg(unix)]
pub use sysfs::{Direction, SysfsLine};

/// What satisfied a trigger wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    /// Low-to-high transition on a trigger line
    Edge,
    /// One character read from the keyboard
    Key(char),
    /// The keyboard stream closed
    EndOfInput,
    /// The designated signal arrived
    Signal(i32),
    /// A timer delay elapsed
    Timer,
    /// No wait at all
    Immediate,
    /// Shutdown was requested while waiting
    Shutdown,
}

impl TriggerEvent {
    /// True for events that should end the run rather than start a capture
    pub fn is_terminal(&self) -> bool {
        matches!(self, TriggerEvent::EndOfInput | TriggerEvent::Shutdown)
    }
}

/// A source of capture triggers.
#[async_trait::async_trait]
pub trait TriggerSource: Send {
    /// Wait until the next trigger fires.
    async fn wait_for_trigger(&mut self) -> Result<TriggerEvent>;
}

#[async_trait::async_trait]
impl<T: TriggerSource + ?Sized> TriggerSource for Box<T> {
    async fn wait_for_trigger(&mut self) -> Result<TriggerEvent> {
        (**self).wait_for_trigger().await
    }
}

/// Fires at once, every time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateTrigger;

#[async_trait::async_trait]
impl TriggerSource for ImmediateTrigger {
    async fn wait_for_trigger(&mut self) -> Result<TriggerEvent> {
        Ok(TriggerEvent::Immediate)
    }
}

/// Fires `delay` after it was created, then every `delay` after that.
#[derive(Debug)]
pub struct TimerTrigger {
    delay: Duration,
    deadline: Instant,
}

impl TimerTrigger {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: Instant::now() + delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[async_trait::async_trait]
impl TriggerSource for TimerTrigger {
    async fn wait_for_trigger(&mut self) -> Result<TriggerEvent> {
        debug!(
            remaining_ms = self
                .deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u64,
            "Waiting for timer"
        );
        tokio::time::sleep_until(self.deadline).await;
        self.deadline += self.delay;
        Ok(TriggerEvent::Timer)
    }
}
