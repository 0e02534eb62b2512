//! Capture sessions and their reports

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One trigger-to-file cycle.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    sequence: u64,
    started: Instant,
    path: PathBuf,
}

impl CaptureSession {
    pub fn new(sequence: u64, path: PathBuf) -> Self {
        Self {
            sequence,
            started: Instant::now(),
            path,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// How a session ended.
///
/// Everything except `Complete` and `Empty` is a soft error: the session
/// still completed (one completion post, sink closed) but the output may be
/// unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Payload written in full.
    Complete,
    /// End-of-frame arrived without any payload; nothing was written.
    Empty,
    /// The sink accepted fewer bytes than were delivered.
    ShortWrite { expected: usize, written: usize },
    /// The sink could not be opened, written or closed.
    WriteFailed,
    /// The stage flagged the still as failed.
    TransmissionFailed,
    /// The capture request was rejected or the session was abandoned.
    CaptureFailed,
}

impl SessionStatus {
    pub fn is_soft_error(&self) -> bool {
        !matches!(self, SessionStatus::Complete | SessionStatus::Empty)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Complete => write!(f, "complete"),
            SessionStatus::Empty => write!(f, "empty"),
            SessionStatus::ShortWrite { expected, written } => {
                write!(f, "short write ({written}/{expected} bytes)")
            }
            SessionStatus::WriteFailed => write!(f, "write failed"),
            SessionStatus::TransmissionFailed => write!(f, "transmission failed"),
            SessionStatus::CaptureFailed => write!(f, "capture failed"),
        }
    }
}

/// Outcome of one session, posted through the completion handshake.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub sequence: u64,
    pub path: PathBuf,
    pub bytes_written: u64,
    /// Payload-carrying buffers received
    pub chunks: u64,
    pub status: SessionStatus,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_errors() {
        assert!(!SessionStatus::Complete.is_soft_error());
        assert!(!SessionStatus::Empty.is_soft_error());
        assert!(SessionStatus::TransmissionFailed.is_soft_error());
        assert!(SessionStatus::ShortWrite {
            expected: 10,
            written: 4
        }
        .is_soft_error());
    }

    #[test]
    fn short_write_display() {
        let status = SessionStatus::ShortWrite {
            expected: 10,
            written: 4,
        };
        assert_eq!(status.to_string(), "short write (4/10 bytes)");
    }
}
