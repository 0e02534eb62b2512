//! Simulated capture stage for development without a camera
//!
//! Produces a synthetic JPEG (SOI, a JFIF-style header, filler, EOI) per
//! capture request on a stage-owned thread, exactly the way a hardware
//! stage would stream it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use super::stage::{CaptureStage, StageCore, StageFormat};
use crate::error::StageError;

/// Configuration for the simulated stage
#[derive(Debug, Clone)]
pub struct SimulatedStageConfig {
    /// Size of each synthetic still in bytes (0 = zero-payload stills)
    pub still_size: usize,
    /// Time between the capture request and the first byte
    pub capture_delay: Duration,
}

impl Default for SimulatedStageConfig {
    fn default() -> Self {
        Self {
            still_size: 50_000, // ~50KB per still
            capture_delay: Duration::from_millis(5),
        }
    }
}

impl SimulatedStageConfig {
    /// Stills that produce no payload at all
    pub fn empty() -> Self {
        Self {
            still_size: 0,
            ..Default::default()
        }
    }
}

/// Build a synthetic still of `size` bytes numbered `frame`.
///
/// Anything of four bytes or more starts with SOI and ends with EOI; smaller
/// sizes get a truncated SOI/EOI pair.
pub fn synthetic_still(frame: u64, size: usize) -> Bytes {
    const MARKERS: [u8; 4] = [0xff, 0xd8, 0xff, 0xd9];
    if size < MARKERS.len() {
        return Bytes::copy_from_slice(&MARKERS[..size]);
    }

    let mut data = BytesMut::with_capacity(size);
    data.put_slice(&[0xff, 0xd8]);
    data.put_slice(&[0xff, 0xe0, 0x00, 0x10]);
    data.put_slice(b"JFIF\0");
    data.put_u64(frame);
    while data.len() + 2 < size {
        data.put_u8((frame & 0xff) as u8);
    }
    data.truncate(size - 2);
    data.put_slice(&[0xff, 0xd9]);
    data.freeze()
}

/// Capture stage that fabricates stills.
pub struct SimulatedStage {
    core: Arc<StageCore>,
    config: SimulatedStageConfig,
    format: Mutex<Option<StageFormat>>,
    fail_next: Arc<AtomicBool>,
    reject_next: AtomicBool,
    captures: AtomicU64,
    burst_toggles: AtomicU64,
}

impl SimulatedStage {
    pub fn new(config: SimulatedStageConfig) -> Self {
        info!(
            "Simulated stage: {}B stills after {:?}",
            config.still_size, config.capture_delay
        );
        Self {
            core: Arc::new(StageCore::new("simulated")),
            config,
            format: Mutex::new(None),
            fail_next: Arc::new(AtomicBool::new(false)),
            reject_next: AtomicBool::new(false),
            captures: AtomicU64::new(0),
            burst_toggles: AtomicU64::new(0),
        }
    }

    /// Mark the next still's final buffer as a transmission failure.
    pub fn fail_next_capture(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Refuse the next capture request outright.
    pub fn reject_next_capture(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    /// Capture requests accepted so far
    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::SeqCst)
    }

    /// Times burst mode was switched
    pub fn burst_toggles(&self) -> u64 {
        self.burst_toggles.load(Ordering::SeqCst)
    }

    pub fn format(&self) -> Option<StageFormat> {
        self.format.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new(SimulatedStageConfig::default())
    }
}

impl CaptureStage for SimulatedStage {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn configure(&self, format: &StageFormat) -> Result<(), StageError> {
        format.validate()?;
        *self.format.lock().unwrap_or_else(|p| p.into_inner()) = Some(format.clone());
        Ok(())
    }

    fn request_capture(&self) -> Result<(), StageError> {
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(StageError::CaptureRejected("simulated rejection".into()));
        }
        if self.format().is_none() {
            return Err(StageError::CaptureRejected("stage not configured".into()));
        }

        let deliveries = self.core.begin_capture()?;
        let frame = self.captures.fetch_add(1, Ordering::SeqCst);
        let still = synthetic_still(frame, self.config.still_size);
        let delay = self.config.capture_delay;
        let fail = self.fail_next.clone();
        let core = self.core.clone();

        let spawned = thread::Builder::new()
            .name("simulated-stage".into())
            .spawn(move || {
                thread::sleep(delay);
                let outcome = core.stream_still(&deliveries, still.reader(), || {
                    !fail.swap(false, Ordering::SeqCst)
                });
                debug!(frame, ?outcome, "Simulated still finished");
            });

        spawned.map(|_| ()).map_err(|e| {
            self.core.end_capture();
            StageError::CaptureRejected(format!("failed to start stage thread: {e}"))
        })
    }

    fn set_burst_mode(&self, enabled: bool) -> Result<(), StageError> {
        self.core.set_burst(enabled);
        self.burst_toggles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
