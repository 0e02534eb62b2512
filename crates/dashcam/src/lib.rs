//! Dashcam - trigger-driven still capture for unattended camera recorders
//!
//! One capture session per trigger: a GPIO edge, a keypress, a signal, a
//! timer. Each session streams one encoded still from the camera stage
//! through a small pool of reusable buffers into an output file.
//!
//! - **`capture`**: buffer pool, capture stages, delivery worker, completion
//!   handshake, pipeline orchestrator
//! - **`trigger`**: trigger sources and GPIO lines
//! - **`advance`**: frame advance policy (single, forever, timelapse, ...)
//! - **`recorder`**: the trigger, capture, advance loop
//! - **`storage`**: output path templates and the per-session sink
//! - **`grab`**: companion helpers (upload receiver, pulse generator)
//! - **`test-source`**: simulated stage and trigger line, no hardware needed

pub mod advance;
pub mod capture;
pub mod error;
pub mod grab;
pub mod recorder;
pub mod slot;
pub mod storage;
pub mod trigger;

pub use advance::{Advance, AdvanceMode, AdvanceTiming, FrameAdvance, Timelapse};
pub use capture::{
    BufferPool, CapturePipeline, CaptureStage, Encoding, LibcameraConfig, LibcameraStage,
    PipelineConfig, PoolStats, SessionReport, SessionStatus, StageFormat,
};
#[cfg(feature = "test-source")]
pub use capture::{SimulatedStage, SimulatedStageConfig};
pub use error::{PoolError, Rejected, StageError};
pub use recorder::{Recorder, RunSummary, StopReason, TriggerMode};
pub use slot::{BufferSlot, SlotFlags};
pub use storage::OutputPath;
pub use trigger::{Level, OutputLine, TriggerEvent, TriggerLine, TriggerSource};
#[cfg(feature = "test-source")]
pub use trigger::SimulatedLine;
