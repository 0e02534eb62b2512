//! Error types for the capture pipeline.
//!
//! Setup and I/O paths use `anyhow`; the types here cover the cases where a
//! caller has to branch on what went wrong (backpressure, a rejected buffer
//! that must still be recycled, a stage that refused a request).

use thiserror::Error;

use crate::slot::BufferSlot;

/// Errors from the buffer pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every slot is currently in flight or in delivery. Callers treat this
    /// as backpressure, not as a failure.
    #[error("buffer pool exhausted: all {capacity} slots are in use")]
    Exhausted { capacity: usize },

    #[error("buffer pool needs at least one slot of non-zero size (got {count} x {size} bytes)")]
    InvalidLayout { count: usize, size: usize },
}

/// Errors raised by a capture stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("capture stage is disabled")]
    Disabled,

    #[error("capture stage is already enabled")]
    AlreadyEnabled,

    #[error("a capture is already in progress")]
    Busy,

    #[error("capture request rejected: {0}")]
    CaptureRejected(String),

    #[error("format negotiation failed: {0}")]
    Format(String),

    #[error("failed to create capture component: {0}")]
    Component(String),

    #[error("parameter not supported by stage: {0}")]
    Unsupported(&'static str),
}

/// A buffer the stage refused to take.
///
/// The slot is handed back so the caller can return it to the pool; a
/// rejected submit must never leak a slot.
#[derive(Debug, Error)]
#[error("stage rejected buffer slot {}: {reason}", .slot.index())]
pub struct Rejected {
    pub slot: BufferSlot,
    pub reason: StageError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausted_display() {
        let err = PoolError::Exhausted { capacity: 4 };
        assert!(err.to_string().contains('4'));
    }

    #[test]
    fn rejected_mentions_slot_and_reason() {
        let err = Rejected {
            slot: BufferSlot::new(2, 16),
            reason: StageError::Disabled,
        };
        let msg = err.to_string();
        assert!(msg.contains("slot 2"));
        assert!(msg.contains("disabled"));
    }
}
