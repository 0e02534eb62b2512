//! Recorder loop
//!
//! Ties a trigger source and a frame advance policy to a capture pipeline:
//! wait for the trigger, capture one still, let the policy decide what
//! comes next. Every session report is broadcast to subscribers. The loop
//! ends when the policy says stop, the trigger source runs dry, the run
//! timeout passes or the cancellation token fires; the pipeline is then
//! shut down and a summary returned.

use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::advance::{Advance, AdvanceMode, AdvanceTiming, FrameAdvance};
use crate::capture::{CapturePipeline, CaptureStage, DeliveryStats, PoolStats, SessionReport};
use crate::trigger::{
    EdgeTrigger, ImmediateTrigger, KeypressTrigger, TimerTrigger, TriggerLine, TriggerSource,
};

/// Session reports kept for slow subscribers
const REPORT_BUFFER: usize = 16;

/// Pause before waiting on a trigger source again after it failed
const TRIGGER_RETRY: Duration = Duration::from_millis(100);

/// How captures are triggered and paced.
pub enum TriggerMode {
    /// One capture after `delay`
    Single { delay: Duration },
    /// Capture, pause, repeat
    Forever,
    /// Capture back to back after a settle delay
    Immediate,
    /// Capture every `interval`, skipping frames when late
    Timelapse { interval: Duration },
    /// Capture on each rising edge of `line`
    Gpio {
        line: Arc<dyn TriggerLine>,
        poll_interval: Duration,
    },
    /// Capture on each key read; the exit key stops
    Keypress(KeypressTrigger),
    /// Capture each time the signal arrives
    Signal(Box<dyn TriggerSource>),
}

impl TriggerMode {
    /// Edge-triggered capture on `line` with the default poll interval
    pub fn gpio(line: Arc<dyn TriggerLine>) -> Self {
        TriggerMode::Gpio {
            line,
            poll_interval: crate::trigger::edge::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Capture on SIGUSR1
    #[cfg(unix)]
    pub fn user_signal() -> Result<Self> {
        Ok(TriggerMode::Signal(Box::new(
            crate::trigger::SignalTrigger::user1()?,
        )))
    }

    pub fn mode(&self) -> AdvanceMode {
        match self {
            TriggerMode::Single { .. } => AdvanceMode::Single,
            TriggerMode::Forever => AdvanceMode::Forever,
            TriggerMode::Immediate => AdvanceMode::Immediate,
            TriggerMode::Timelapse { .. } => AdvanceMode::Timelapse,
            TriggerMode::Gpio { .. } => AdvanceMode::Gpio,
            TriggerMode::Keypress(_) => AdvanceMode::Keypress,
            TriggerMode::Signal(_) => AdvanceMode::Signal,
        }
    }

    /// Split into the pre-capture trigger and the advance policy.
    fn build(
        self,
        timing: AdvanceTiming,
        cancel: &CancellationToken,
    ) -> (Box<dyn TriggerSource>, FrameAdvance) {
        match self {
            TriggerMode::Single { delay } => (
                Box::new(TimerTrigger::new(delay)),
                FrameAdvance::single(timing),
            ),
            TriggerMode::Forever => (Box::new(ImmediateTrigger), FrameAdvance::forever(timing)),
            TriggerMode::Immediate => {
                (Box::new(ImmediateTrigger), FrameAdvance::immediate(timing))
            }
            TriggerMode::Timelapse { interval } => (
                Box::new(ImmediateTrigger),
                FrameAdvance::timelapse(interval, timing),
            ),
            TriggerMode::Gpio {
                line,
                poll_interval,
            } => (
                Box::new(
                    EdgeTrigger::new(line, cancel.clone()).with_poll_interval(poll_interval),
                ),
                FrameAdvance::gpio(timing),
            ),
            TriggerMode::Keypress(keys) => (
                Box::new(ImmediateTrigger),
                FrameAdvance::keypress(keys, timing),
            ),
            TriggerMode::Signal(signal) => (
                Box::new(ImmediateTrigger),
                FrameAdvance::signal(signal, timing),
            ),
        }
    }
}

impl fmt::Debug for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TriggerMode({})", self.mode())
    }
}

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The advance policy said stop
    Policy,
    /// The trigger source ended (end of input, shutdown)
    Trigger,
    /// The overall run timeout passed
    Timeout,
    /// The cancellation token fired
    Cancelled,
}

/// What a run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub sessions: u64,
    pub bytes_written: u64,
    /// Sessions whose report carried a soft error
    pub soft_errors: u64,
    /// Frame number the next capture would have used
    pub next_frame: u64,
    pub stop: StopReason,
    pub delivery: DeliveryStats,
    /// Pool state after shutdown
    pub pool: PoolStats,
}

impl RunSummary {
    fn record(&mut self, report: &SessionReport) {
        self.sessions += 1;
        self.bytes_written += report.bytes_written;
        if report.status.is_soft_error() {
            self.soft_errors += 1;
        }
    }
}

/// Trigger-driven capture loop.
pub struct Recorder<S: CaptureStage> {
    pipeline: CapturePipeline<S>,
    trigger: Box<dyn TriggerSource>,
    policy: FrameAdvance,
    cancel: CancellationToken,
    reports: broadcast::Sender<SessionReport>,
}

impl<S: CaptureStage> Recorder<S> {
    pub fn new(
        pipeline: CapturePipeline<S>,
        mode: TriggerMode,
        timing: AdvanceTiming,
        cancel: CancellationToken,
    ) -> Self {
        let (trigger, policy) = mode.build(timing, &cancel);
        let (reports, _) = broadcast::channel(REPORT_BUFFER);
        Self {
            pipeline,
            trigger,
            policy,
            cancel,
            reports,
        }
    }

    /// Number the first capture `start`.
    pub fn with_frame_start(mut self, start: u64) -> Self {
        self.policy = self.policy.with_frame_start(start);
        self
    }

    /// Receive every session report from here on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionReport> {
        self.reports.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn mode(&self) -> AdvanceMode {
        self.policy.mode()
    }

    pub fn pipeline(&self) -> &CapturePipeline<S> {
        &self.pipeline
    }

    /// Run until stopped, then shut the pipeline down.
    pub async fn run(mut self) -> Result<RunSummary> {
        info!(mode = %self.policy.mode(), frame = self.policy.frame(), "Recorder started");

        let mut summary = RunSummary {
            sessions: 0,
            bytes_written: 0,
            soft_errors: 0,
            next_frame: 0,
            stop: StopReason::Policy,
            delivery: DeliveryStats::default(),
            pool: PoolStats::default(),
        };

        // The pipeline is shut down even when the loop failed.
        let stopped = self.capture_loop(&mut summary).await;
        summary.next_frame = self.policy.frame();

        let pool = self.pipeline.pool().clone();
        let delivery = self.pipeline.shutdown().await;
        summary.stop = stopped?;
        summary.delivery = delivery?;
        summary.pool = pool.stats();

        info!(
            sessions = summary.sessions,
            bytes = summary.bytes_written,
            soft_errors = summary.soft_errors,
            stop = ?summary.stop,
            "Recorder stopped"
        );
        Ok(summary)
    }

    async fn capture_loop(&mut self, summary: &mut RunSummary) -> Result<StopReason> {
        let deadline = self.policy.deadline();

        let started = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(StopReason::Cancelled),
            _ = expire(deadline) => return Ok(StopReason::Timeout),
            advance = self.policy.start() => advance?,
        };
        if started == Advance::Stop {
            return Ok(StopReason::Policy);
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(StopReason::Cancelled),
                _ = expire(deadline) => return Ok(StopReason::Timeout),
                event = self.trigger.wait_for_trigger() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!("Trigger wait failed, retrying: {:#}", e);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(StopReason::Cancelled),
                        _ = tokio::time::sleep(TRIGGER_RETRY) => continue,
                    }
                }
            };
            if event.is_terminal() {
                debug!(?event, "Trigger source ended");
                return Ok(StopReason::Trigger);
            }

            let report = self.pipeline.capture(self.policy.frame()).await?;
            summary.record(&report);
            // Nobody listening is fine.
            let _ = self.reports.send(report);

            if self.policy.counts_externally() {
                self.policy.count_capture();
            }

            let advance = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(StopReason::Cancelled),
                advance = self.policy.next() => advance?,
            };
            if advance == Advance::Stop {
                return Ok(if self.policy.deadline_passed() {
                    StopReason::Timeout
                } else {
                    StopReason::Policy
                });
            }
        }
    }
}

/// Resolves at `deadline`, or never.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
