//! Capture stage abstraction
//!
//! A capture stage is the hardware side of the pipeline: a camera source
//! feeding a still encoder. The pipeline only sees its buffer interface:
//! buffers are submitted to the stage, the stage fills them on its own
//! thread and hands them to the delivery worker, marking the last buffer of
//! each still with an end-of-frame (or transmission-failed) flag.
//!
//! [`StageCore`] holds the state every stage needs (the queue of submitted
//! slots, the enable flag, the delivery handle) and the routine that
//! streams one still into those slots.

use std::collections::VecDeque;
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::delivery::DeliverySender;
use crate::error::{Rejected, StageError};
use crate::slot::BufferSlot;

/// How long a producer waits for a submitted slot before re-checking the
/// enable flag.
const SLOT_WAIT: Duration = Duration::from_millis(50);

/// Still image encodings supported by the encoder stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Jpeg,
    Bmp,
    Gif,
    Png,
}

impl Encoding {
    /// File extension conventionally used for this encoding
    pub fn extension(self) -> &'static str {
        match self {
            Encoding::Jpeg => "jpg",
            Encoding::Bmp => "bmp",
            Encoding::Gif => "gif",
            Encoding::Png => "png",
        }
    }
}

impl FromStr for Encoding {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(Encoding::Jpeg),
            "bmp" => Ok(Encoding::Bmp),
            "gif" => Ok(Encoding::Gif),
            "png" => Ok(Encoding::Png),
            other => Err(StageError::Format(format!("unknown encoding '{other}'"))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Output format negotiated with the stage before the first capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFormat {
    /// Still width in pixels
    pub width: u32,
    /// Still height in pixels
    pub height: u32,
    pub encoding: Encoding,
    /// Encoder quality (1-100, JPEG only)
    pub quality: u8,
}

impl Default for StageFormat {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            encoding: Encoding::Jpeg,
            quality: 85,
        }
    }
}

impl StageFormat {
    /// Reject formats no encoder can produce.
    pub fn validate(&self) -> Result<(), StageError> {
        if self.width == 0 || self.height == 0 {
            return Err(StageError::Format(format!(
                "invalid still size {}x{}",
                self.width, self.height
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(StageError::Format(format!(
                "quality {} out of range 1-100",
                self.quality
            )));
        }
        Ok(())
    }
}

/// The pipeline's view of the camera + encoder.
///
/// Implementors embed a [`StageCore`]; the buffer-handling methods default
/// to it. `configure` and `request_capture` are stage-specific.
pub trait CaptureStage: Send + Sync + 'static {
    fn core(&self) -> &StageCore;

    /// Negotiate the still format. Failure here is fatal for the pipeline.
    fn configure(&self, format: &StageFormat) -> Result<(), StageError>;

    /// Start a capture of one still into the submitted slots.
    fn request_capture(&self) -> Result<(), StageError>;

    /// Enable buffer delivery to `deliveries`.
    fn enable(&self, deliveries: DeliverySender) -> Result<(), StageError> {
        self.core().enable(deliveries)
    }

    /// Disable delivery, handing back every slot the stage still holds.
    fn disable(&self) -> Vec<BufferSlot> {
        self.core().disable()
    }

    fn is_enabled(&self) -> bool {
        self.core().is_enabled()
    }

    /// Queue an empty slot for the stage to fill.
    fn submit(&self, slot: BufferSlot) -> Result<(), Rejected> {
        self.core().submit(slot)
    }

    /// Skip per-shot refocus and re-metering between captures.
    fn set_burst_mode(&self, enabled: bool) -> Result<(), StageError> {
        self.core().set_burst(enabled);
        Ok(())
    }
}

/// Result of streaming one still into slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The final slot carried END_OF_FRAME.
    Delivered { bytes: u64, chunks: u64 },
    /// The final slot carried TRANSMISSION_FAILED.
    Failed { bytes: u64, chunks: u64 },
    /// The stage was disabled or the worker went away mid-still.
    Aborted,
}

struct CoreState {
    enabled: bool,
    capturing: bool,
    burst: bool,
    deliveries: Option<DeliverySender>,
    queued: VecDeque<BufferSlot>,
    /// Slots the delivery worker was gone for; handed back by `disable`
    undelivered: Vec<BufferSlot>,
}

/// Shared buffer handling for capture stages.
pub struct StageCore {
    name: &'static str,
    state: Mutex<CoreState>,
    slot_ready: Condvar,
}

impl StageCore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(CoreState {
                enabled: false,
                capturing: false,
                burst: false,
                deliveries: None,
                queued: VecDeque::new(),
                undelivered: Vec::new(),
            }),
            slot_ready: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enable(&self, deliveries: DeliverySender) -> Result<(), StageError> {
        let mut state = self.lock();
        if state.enabled {
            return Err(StageError::AlreadyEnabled);
        }
        state.enabled = true;
        state.deliveries = Some(deliveries);
        debug!(stage = self.name, "Delivery enabled");
        Ok(())
    }

    pub fn disable(&self) -> Vec<BufferSlot> {
        let mut state = self.lock();
        state.enabled = false;
        state.deliveries = None;
        let mut returned: Vec<BufferSlot> = state.queued.drain(..).collect();
        returned.append(&mut state.undelivered);
        drop(state);
        self.slot_ready.notify_all();

        debug!(
            stage = self.name,
            returned = returned.len(),
            "Delivery disabled"
        );
        returned
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn submit(&self, slot: BufferSlot) -> Result<(), Rejected> {
        let mut state = self.lock();
        if !state.enabled {
            return Err(Rejected {
                slot,
                reason: StageError::Disabled,
            });
        }
        state.queued.push_back(slot);
        drop(state);
        self.slot_ready.notify_one();
        Ok(())
    }

    /// Number of submitted slots waiting to be filled
    pub fn queued(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn set_burst(&self, enabled: bool) {
        self.lock().burst = enabled;
    }

    pub fn burst(&self) -> bool {
        self.lock().burst
    }

    /// Claim the stage for one still.
    ///
    /// Returns the delivery handle the producer thread sends slots through.
    pub fn begin_capture(&self) -> Result<DeliverySender, StageError> {
        let mut state = self.lock();
        if !state.enabled {
            return Err(StageError::Disabled);
        }
        if state.capturing {
            return Err(StageError::Busy);
        }
        let deliveries = state.deliveries.clone().ok_or(StageError::Disabled)?;
        state.capturing = true;
        Ok(deliveries)
    }

    /// Drop the claim taken by [`begin_capture`](Self::begin_capture).
    ///
    /// `stream_still` does this itself; stages call it directly only when
    /// the capture never got as far as streaming.
    pub fn end_capture(&self) {
        self.lock().capturing = false;
    }

    /// Block until a submitted slot is available. `None` once disabled.
    ///
    /// With no slot submitted the producer stalls here until one is
    /// released and resubmitted.
    fn next_slot(&self) -> Option<BufferSlot> {
        let mut state = self.lock();
        loop {
            if !state.enabled {
                return None;
            }
            if let Some(slot) = state.queued.pop_front() {
                return Some(slot);
            }
            state = match self.slot_ready.wait_timeout(state, SLOT_WAIT) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Stream one still from `reader` into submitted slots.
    ///
    /// Each slot is filled to capacity and delivered; the slot that sees EOF
    /// is marked END_OF_FRAME (it may be empty). `finish` runs once the
    /// reader is drained and before the final slot goes out; returning
    /// `false`, or a read error, marks the final slot TRANSMISSION_FAILED.
    pub fn stream_still<R, F>(
        &self,
        deliveries: &DeliverySender,
        mut reader: R,
        finish: F,
    ) -> StreamOutcome
    where
        R: Read,
        F: FnOnce() -> bool,
    {
        let mut finish = Some(finish);
        let mut bytes = 0u64;
        let mut chunks = 0u64;

        loop {
            let Some(mut slot) = self.next_slot() else {
                warn!(stage = self.name, "Stage disabled mid-capture");
                self.end_capture();
                return StreamOutcome::Aborted;
            };

            let (eof, mut failed) = match slot.fill_from(&mut reader) {
                Ok(eof) => (eof, false),
                Err(e) => {
                    warn!(stage = self.name, error = %e, "Still read failed");
                    (true, true)
                }
            };

            bytes += slot.len() as u64;
            chunks += 1;

            if eof {
                if let Some(finish) = finish.take() {
                    failed |= !finish();
                }
                if failed {
                    slot.flags_mut().set_transmission_failed();
                } else {
                    slot.flags_mut().set_end_of_frame();
                }
                // Cleared before the terminal slot goes out so the next
                // capture request never sees a stale busy flag.
                self.end_capture();
            }

            if let Err(slot) = deliveries.deliver(slot) {
                warn!(stage = self.name, "Delivery worker gone, holding slot");
                self.lock().undelivered.push(slot);
                if !eof {
                    self.end_capture();
                }
                return StreamOutcome::Aborted;
            }

            if eof {
                debug!(stage = self.name, bytes, chunks, failed, "Still streamed");
                return if failed {
                    StreamOutcome::Failed { bytes, chunks }
                } else {
                    StreamOutcome::Delivered { bytes, chunks }
                };
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::delivery::{channel, Delivery};
    use crate::capture::pool::BufferPool;
    use std::io::{self, Cursor};

    fn buffer(msg: Delivery) -> BufferSlot {
        match msg {
            Delivery::Buffer(slot) => slot,
            _ => panic!("expected a buffer"),
        }
    }

    #[test]
    fn encoding_parses_extensions() {
        assert_eq!("JPG".parse::<Encoding>().unwrap(), Encoding::Jpeg);
        assert_eq!("jpeg".parse::<Encoding>().unwrap(), Encoding::Jpeg);
        assert_eq!("png".parse::<Encoding>().unwrap(), Encoding::Png);
        assert!("tiff".parse::<Encoding>().is_err());
    }

    #[test]
    fn format_validation() {
        assert!(StageFormat::default().validate().is_ok());
        let bad = StageFormat {
            width: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = StageFormat {
            quality: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn submit_rejected_while_disabled() {
        let pool = BufferPool::new(1, 8).unwrap();
        let core = StageCore::new("test");
        let err = core.submit(pool.acquire().unwrap()).unwrap_err();
        assert!(matches!(err.reason, StageError::Disabled));
        pool.release(err.slot);
        assert!(pool.stats().is_idle());
    }

    #[test]
    fn disable_returns_queued_slots() {
        let pool = BufferPool::new(3, 8).unwrap();
        let core = StageCore::new("test");
        let (tx, _rx) = channel(4);
        core.enable(tx).unwrap();
        for _ in 0..3 {
            core.submit(pool.acquire().unwrap()).unwrap();
        }
        assert_eq!(core.queued(), 3);

        let returned = core.disable();
        assert_eq!(returned.len(), 3);
        assert!(!core.is_enabled());
        for slot in returned {
            pool.release(slot);
        }
        assert!(pool.stats().is_idle());
    }

    #[test]
    fn begin_capture_requires_enabled_and_idle() {
        let core = StageCore::new("test");
        assert!(matches!(core.begin_capture(), Err(StageError::Disabled)));

        let (tx, _rx) = channel(4);
        core.enable(tx).unwrap();
        let _deliveries = core.begin_capture().unwrap();
        assert!(matches!(core.begin_capture(), Err(StageError::Busy)));
    }

    #[test]
    fn stream_splits_still_across_slots() {
        let pool = BufferPool::new(3, 4).unwrap();
        let core = StageCore::new("test");
        let (tx, mut rx) = channel(8);
        core.enable(tx).unwrap();
        for _ in 0..3 {
            core.submit(pool.acquire().unwrap()).unwrap();
        }

        let deliveries = core.begin_capture().unwrap();
        let outcome = core.stream_still(&deliveries, Cursor::new(b"0123456789".to_vec()), || true);
        assert_eq!(
            outcome,
            StreamOutcome::Delivered {
                bytes: 10,
                chunks: 3
            }
        );

        let first = buffer(rx.try_recv().unwrap());
        let second = buffer(rx.try_recv().unwrap());
        let last = buffer(rx.try_recv().unwrap());
        assert_eq!(first.payload(), b"0123");
        assert!(!first.flags().is_terminal());
        assert_eq!(second.payload(), b"4567");
        assert_eq!(last.payload(), b"89");
        assert!(last.flags().is_end_of_frame());

        // The busy flag is clear again for the next still.
        assert!(core.begin_capture().is_ok());
    }

    #[test]
    fn failed_finish_marks_transmission_failed() {
        let pool = BufferPool::new(1, 16).unwrap();
        let core = StageCore::new("test");
        let (tx, mut rx) = channel(4);
        core.enable(tx).unwrap();
        core.submit(pool.acquire().unwrap()).unwrap();

        let deliveries = core.begin_capture().unwrap();
        let outcome = core.stream_still(&deliveries, io::empty(), || false);
        assert_eq!(outcome, StreamOutcome::Failed { bytes: 0, chunks: 1 });

        let slot = buffer(rx.try_recv().unwrap());
        assert!(slot.flags().is_transmission_failed());
        assert!(slot.is_empty());
    }

    #[test]
    fn disabled_mid_capture_aborts() {
        let core = StageCore::new("test");
        let (tx, _rx) = channel(4);
        core.enable(tx).unwrap();
        let deliveries = core.begin_capture().unwrap();
        core.disable();

        let outcome = core.stream_still(&deliveries, io::empty(), || true);
        assert_eq!(outcome, StreamOutcome::Aborted);
    }

    #[test]
    fn undelivered_slot_is_returned_by_disable() {
        let pool = BufferPool::new(2, 8).unwrap();
        let core = StageCore::new("test");
        let (tx, rx) = channel(4);
        drop(rx);
        core.enable(tx).unwrap();
        core.submit(pool.acquire().unwrap()).unwrap();

        let deliveries = core.begin_capture().unwrap();
        let outcome = core.stream_still(&deliveries, Cursor::new(b"data".to_vec()), || true);
        assert_eq!(outcome, StreamOutcome::Aborted);

        let returned = core.disable();
        assert_eq!(returned.len(), 1);
        for slot in returned {
            pool.release(slot);
        }
        assert!(pool.stats().is_idle());
    }

    /// Reader that disables the stage and stops the worker on first read,
    /// as a shutdown racing the producer would.
    struct ShutdownMidRead<'a> {
        core: &'a StageCore,
        rx: Option<tokio::sync::mpsc::Receiver<Delivery>>,
        data: Cursor<Vec<u8>>,
    }

    impl Read for ShutdownMidRead<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(rx) = self.rx.take() {
                assert!(self.core.disable().is_empty());
                drop(rx);
            }
            self.data.read(buf)
        }
    }

    #[test]
    fn slot_undelivered_after_disable_is_not_lost() {
        let pool = BufferPool::new(2, 8).unwrap();
        let core = StageCore::new("test");
        let (tx, rx) = channel(4);
        core.enable(tx).unwrap();
        core.submit(pool.acquire().unwrap()).unwrap();

        let deliveries = core.begin_capture().unwrap();
        let reader = ShutdownMidRead {
            core: &core,
            rx: Some(rx),
            data: Cursor::new(b"late".to_vec()),
        };
        let outcome = core.stream_still(&deliveries, reader, || true);
        assert_eq!(outcome, StreamOutcome::Aborted);

        let returned = core.disable();
        assert_eq!(returned.len(), 1);
        for slot in returned {
            pool.release(slot);
        }
        assert!(pool.stats().is_idle());
    }
}
