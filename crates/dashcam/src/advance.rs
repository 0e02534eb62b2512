//! Frame advance policy
//!
//! Called once after every completed capture to decide whether the run
//! goes on and how long to wait before the next one. Each policy kind
//! carries its own state; an overall run timeout stops every kind.
//!
//! Timelapse pacing keeps a target time for the next frame. A frame that is
//! less than half an interval late is taken anyway; anything later skips
//! ahead whole intervals so a slow pipeline never accumulates drift.

use anyhow::Result;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::trigger::{TriggerEvent, TriggerSource};

/// Policy kinds, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceMode {
    Single,
    Forever,
    Timelapse,
    Keypress,
    Gpio,
    Signal,
    Immediate,
}

impl FromStr for AdvanceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(AdvanceMode::Single),
            "forever" => Ok(AdvanceMode::Forever),
            "timelapse" => Ok(AdvanceMode::Timelapse),
            "keypress" => Ok(AdvanceMode::Keypress),
            "gpio" => Ok(AdvanceMode::Gpio),
            "signal" => Ok(AdvanceMode::Signal),
            "immediate" => Ok(AdvanceMode::Immediate),
            other => anyhow::bail!("unknown capture mode '{other}'"),
        }
    }
}

impl fmt::Display for AdvanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdvanceMode::Single => "single",
            AdvanceMode::Forever => "forever",
            AdvanceMode::Timelapse => "timelapse",
            AdvanceMode::Keypress => "keypress",
            AdvanceMode::Gpio => "gpio",
            AdvanceMode::Signal => "signal",
            AdvanceMode::Immediate => "immediate",
        };
        f.write_str(name)
    }
}

/// Whether the run goes on after a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Continue,
    Stop,
}

/// Delays and limits shared by all policies.
#[derive(Debug, Clone)]
pub struct AdvanceTiming {
    /// Overall run time limit (zero = no limit)
    pub timeout: Duration,
    /// Pause between captures in forever mode
    pub forever_delay: Duration,
    /// Settle time before the first capture in immediate mode
    pub settle_delay: Duration,
    /// Pause between captures in immediate mode
    pub immediate_delay: Duration,
    /// Key that ends a keypress run (either case)
    pub exit_key: char,
}

impl Default for AdvanceTiming {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            forever_delay: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
            immediate_delay: Duration::from_millis(30),
            exit_key: 'x',
        }
    }
}

impl AdvanceTiming {
    /// Default delays with an overall run limit
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// One timelapse scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelapseStep {
    /// How long to wait before the next capture
    pub sleep: Duration,
    /// Frame numbers skipped to catch up
    pub skipped: u64,
    /// How far behind the target this tick was
    pub late: Duration,
}

/// Timelapse scheduler. Pure: the caller supplies the current time.
#[derive(Debug, Clone)]
pub struct Timelapse {
    interval: Duration,
    next: Option<Instant>,
}

impl Timelapse {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Target time of the next frame, once the first tick has run
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next
    }

    /// Decide the wait after a capture that finished at `now`.
    pub fn schedule(&mut self, now: Instant) -> TimelapseStep {
        let interval = self.interval;
        let on_time = |sleep| TimelapseStep {
            sleep,
            skipped: 0,
            late: Duration::ZERO,
        };

        if interval.is_zero() {
            return on_time(Duration::ZERO);
        }

        let Some(next) = self.next else {
            // The target is measured from the end of the first full sleep.
            self.next = Some(now + interval * 2);
            return on_time(interval);
        };

        if next >= now {
            self.next = Some(next + interval);
            return on_time(next - now);
        }

        let late = now - next;
        if late < interval / 2 {
            self.next = Some(next + interval);
            return TimelapseStep {
                sleep: Duration::ZERO,
                skipped: 0,
                late,
            };
        }

        let interval_ns = interval.as_nanos();
        let late_ns = late.as_nanos();
        let skip = 1 + late_ns / interval_ns;
        let sleep = nanos(skip * interval_ns - late_ns);
        self.next = Some(next + nanos((skip + 1) * interval_ns));

        TimelapseStep {
            sleep,
            skipped: skip as u64,
            late,
        }
    }
}

fn nanos(ns: u128) -> Duration {
    Duration::from_nanos(u64::try_from(ns).unwrap_or(u64::MAX))
}

enum Policy {
    Single,
    Forever,
    Gpio,
    Immediate,
    Timelapse(Timelapse),
    Keypress(Box<dyn TriggerSource>),
    Signal(Box<dyn TriggerSource>),
}

/// Frame advance state for one run.
pub struct FrameAdvance {
    policy: Policy,
    timing: AdvanceTiming,
    frame: u64,
    deadline: Option<Instant>,
    started: bool,
}

impl FrameAdvance {
    fn with_policy(policy: Policy, timing: AdvanceTiming) -> Self {
        let deadline = (!timing.timeout.is_zero()).then(|| Instant::now() + timing.timeout);
        Self {
            policy,
            timing,
            frame: 0,
            deadline,
            started: false,
        }
    }

    /// One capture, then stop.
    pub fn single(timing: AdvanceTiming) -> Self {
        Self::with_policy(Policy::Single, timing)
    }

    /// Capture over and over with a fixed pause.
    pub fn forever(timing: AdvanceTiming) -> Self {
        Self::with_policy(Policy::Forever, timing)
    }

    /// Keep going; the trigger line paces the run.
    pub fn gpio(timing: AdvanceTiming) -> Self {
        Self::with_policy(Policy::Gpio, timing)
    }

    /// Capture back to back after an initial settle.
    pub fn immediate(timing: AdvanceTiming) -> Self {
        Self::with_policy(Policy::Immediate, timing)
    }

    /// Capture every `interval`. A zero interval means back to back.
    pub fn timelapse(interval: Duration, timing: AdvanceTiming) -> Self {
        if interval.is_zero() {
            return Self::immediate(timing);
        }
        Self::with_policy(Policy::Timelapse(Timelapse::new(interval)), timing)
    }

    /// Capture after each key read from `keys`; the exit key stops.
    pub fn keypress(keys: impl TriggerSource + 'static, timing: AdvanceTiming) -> Self {
        Self::with_policy(Policy::Keypress(Box::new(keys)), timing)
    }

    /// Capture each time `signal` fires.
    pub fn signal(signal: impl TriggerSource + 'static, timing: AdvanceTiming) -> Self {
        Self::with_policy(Policy::Signal(Box::new(signal)), timing)
    }

    /// Number the first capture `start` instead of 0.
    pub fn with_frame_start(mut self, start: u64) -> Self {
        self.frame = start;
        self
    }

    pub fn mode(&self) -> AdvanceMode {
        match self.policy {
            Policy::Single => AdvanceMode::Single,
            Policy::Forever => AdvanceMode::Forever,
            Policy::Gpio => AdvanceMode::Gpio,
            Policy::Immediate => AdvanceMode::Immediate,
            Policy::Timelapse(_) => AdvanceMode::Timelapse,
            Policy::Keypress(_) => AdvanceMode::Keypress,
            Policy::Signal(_) => AdvanceMode::Signal,
        }
    }

    /// Frame number of the next capture
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn timing(&self) -> &AdvanceTiming {
        &self.timing
    }

    /// When the overall run timeout expires, if there is one
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// True if the caller, not [`next`](Self::next), counts frames.
    pub fn counts_externally(&self) -> bool {
        matches!(self.policy, Policy::Single | Policy::Gpio)
    }

    /// Count one completed capture for policies that count externally.
    pub fn count_capture(&mut self) {
        self.frame += 1;
    }

    /// Wait before the first capture.
    ///
    /// Immediate mode sleeps its settle time; keypress and signal modes wait
    /// for their first key or signal. Runs once; later calls continue at once.
    pub async fn start(&mut self) -> Result<Advance> {
        if self.started {
            return Ok(Advance::Continue);
        }
        self.started = true;

        match &mut self.policy {
            Policy::Immediate => {
                debug!(
                    delay_ms = self.timing.settle_delay.as_millis() as u64,
                    "Settling exposure"
                );
                tokio::time::sleep(self.timing.settle_delay).await;
                Ok(Advance::Continue)
            }
            Policy::Keypress(keys) => {
                info!("Press Enter to capture, {} then Enter to exit", self.timing.exit_key);
                let event = keys.wait_for_trigger().await?;
                Ok(key_advance(event, self.timing.exit_key))
            }
            Policy::Signal(signal) => {
                let event = signal.wait_for_trigger().await?;
                Ok(signal_advance(event))
            }
            _ => Ok(Advance::Continue),
        }
    }

    /// Decide what happens after a completed capture, waiting as the
    /// policy requires.
    pub async fn next(&mut self) -> Result<Advance> {
        if self.deadline_passed() {
            info!(frame = self.frame, "Run timeout reached");
            return Ok(Advance::Stop);
        }

        match &mut self.policy {
            Policy::Single => Ok(Advance::Stop),

            Policy::Gpio => Ok(Advance::Continue),

            Policy::Forever => {
                self.frame += 1;
                tokio::time::sleep(self.timing.forever_delay).await;
                Ok(Advance::Continue)
            }

            Policy::Immediate => {
                self.frame += 1;
                tokio::time::sleep(self.timing.immediate_delay).await;
                Ok(Advance::Continue)
            }

            Policy::Timelapse(timelapse) => {
                self.frame += 1;
                let step = timelapse.schedule(Instant::now());
                if step.skipped > 0 {
                    warn!(
                        late_ms = step.late.as_millis() as u64,
                        "Skipping frame {} to restart at frame {}",
                        self.frame,
                        self.frame + step.skipped
                    );
                    self.frame += step.skipped;
                } else if !step.late.is_zero() {
                    warn!("Frame {} is {} ms late", self.frame, step.late.as_millis());
                }
                tokio::time::sleep(step.sleep).await;
                Ok(Advance::Continue)
            }

            Policy::Keypress(keys) => {
                let event = keys.wait_for_trigger().await?;
                self.frame += 1;
                Ok(key_advance(event, self.timing.exit_key))
            }

            Policy::Signal(signal) => {
                let event = signal.wait_for_trigger().await?;
                self.frame += 1;
                Ok(signal_advance(event))
            }
        }
    }
}

fn key_advance(event: TriggerEvent, exit_key: char) -> Advance {
    match event {
        TriggerEvent::Key(key) if key.eq_ignore_ascii_case(&exit_key) => {
            info!("Exit key pressed");
            Advance::Stop
        }
        event if event.is_terminal() => Advance::Stop,
        _ => Advance::Continue,
    }
}

fn signal_advance(event: TriggerEvent) -> Advance {
    if event.is_terminal() {
        Advance::Stop
    } else {
        Advance::Continue
    }
}

impl fmt::Debug for FrameAdvance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAdvance")
            .field("mode", &self.mode())
            .field("frame", &self.frame)
            .field("deadline", &self.deadline)
            .finish()
    }
}
