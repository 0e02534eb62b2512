//! Digital lines used for triggering
//!
//! A [`TriggerLine`] is read by level. Waits are bounded so callers can
//! re-check for shutdown between them; a pulse is a wait for high followed
//! by a wait for low.

use anyhow::Result;
use std::fmt;
use std::time::Duration;

/// Logic level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, "low"),
            Level::High => write!(f, "high"),
        }
    }
}

/// An input line that can be read and waited on.
#[async_trait::async_trait]
pub trait TriggerLine: Send + Sync {
    /// Current level of the line.
    fn level(&self) -> Result<Level>;

    /// Wait up to `timeout` for the line to read `level`.
    ///
    /// Returns `true` as soon as it does (immediately if it already does),
    /// `false` if the timeout passed first.
    async fn wait_for_level(&self, level: Level, timeout: Duration) -> Result<bool>;
}

/// A line this process drives.
pub trait OutputLine: Send + Sync {
    fn set_level(&self, level: Level) -> Result<()>;
}

#[cfg(feature = "test-source")]
pub use simulated::SimulatedLine;

#[cfg(feature = "test-source")]
mod simulated {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::watch;

    /// In-memory line for tests and hardware-free runs.
    ///
    /// Clones share the same level, so one clone can drive the line while
    /// another is waited on.
    #[derive(Debug, Clone)]
    pub struct SimulatedLine {
        level: Arc<watch::Sender<Level>>,
    }

    impl Default for SimulatedLine {
        fn default() -> Self {
            Self::new(Level::Low)
        }
    }

    impl SimulatedLine {
        pub fn new(initial: Level) -> Self {
            let (tx, _rx) = watch::channel(initial);
            Self {
                level: Arc::new(tx),
            }
        }

        pub fn set(&self, level: Level) {
            self.level.send_replace(level);
        }
    }

    #[async_trait::async_trait]
    impl TriggerLine for SimulatedLine {
        fn level(&self) -> Result<Level> {
            Ok(*self.level.borrow())
        }

        async fn wait_for_level(&self, level: Level, timeout: Duration) -> Result<bool> {
            let mut rx = self.level.subscribe();
            let reached = async {
                loop {
                    if *rx.borrow_and_update() == level {
                        return true;
                    }
                    if rx.changed().await.is_err() {
                        return false;
                    }
                }
            };
            Ok(tokio::time::timeout(timeout, reached).await.unwrap_or(false))
        }
    }

    impl OutputLine for SimulatedLine {
        fn set_level(&self, level: Level) -> Result<()> {
            self.set(level);
            Ok(())
        }
    }
}
