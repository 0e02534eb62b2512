//! POSIX signal trigger
//!
//! Listening starts when the trigger is created, so a signal that arrives
//! between captures is not lost.

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::debug;

use super::{TriggerEvent, TriggerSource};

pub struct SignalTrigger {
    signal: Signal,
    number: i32,
}

impl SignalTrigger {
    pub fn new(kind: SignalKind) -> Result<Self> {
        let number = kind.as_raw_value();
        let signal = signal(kind)
            .with_context(|| format!("Failed to install handler for signal {number}"))?;
        Ok(Self { signal, number })
    }

    /// Trigger on SIGUSR1
    pub fn user1() -> Result<Self> {
        Self::new(SignalKind::user_defined1())
    }

    pub fn number(&self) -> i32 {
        self.number
    }
}

#[async_trait::async_trait]
impl TriggerSource for SignalTrigger {
    async fn wait_for_trigger(&mut self) -> Result<TriggerEvent> {
        debug!(signal = self.number, "Waiting for signal");
        match self.signal.recv().await {
            Some(()) => Ok(TriggerEvent::Signal(self.number)),
            None => Ok(TriggerEvent::Shutdown),
        }
    }
}
