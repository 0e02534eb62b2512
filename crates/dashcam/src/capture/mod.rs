//! Still capture pipeline
//!
//! - Buffer pool shared between the stage and the delivery worker
//! - Capture stage seam, with a libcamera-still stage and a simulated one
//! - Delivery worker writing buffers to the session's output
//! - Per-session completion handshake
//! - Orchestrator running one trigger-to-file session at a time

pub mod completion;
pub mod delivery;
pub mod libcamera;
pub mod pipeline;
pub mod pool;
pub mod session;
#[cfg(feature = "test-source")]
pub mod simulated;
pub mod stage;

pub use completion::{completion, CompletionPost, CompletionWait};
pub use delivery::{DeliverySender, DeliveryStats};
pub use libcamera::{LibcameraConfig, LibcameraStage};
pub use pipeline::{CapturePipeline, PipelineConfig};
pub use pool::{BufferPool, PoolStats};
pub use session::{CaptureSession, SessionReport, SessionStatus};
#[cfg(feature = "test-source")]
pub use simulated::{synthetic_still, SimulatedStage, SimulatedStageConfig};
pub use stage::{CaptureStage, Encoding, StageCore, StageFormat, StreamOutcome};
