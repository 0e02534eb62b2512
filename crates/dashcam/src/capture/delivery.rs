//! Delivery worker
//!
//! Stages hand filled buffers to a bounded channel; a single worker on a
//! blocking thread drains it. For each buffer the worker writes the payload
//! to the open session's sink, returns the buffer to the pool, resubmits a
//! free buffer while the stage is enabled, and on the session's terminal
//! buffer closes the sink and posts the session's completion.
//!
//! The orchestrator sends `Open` on the same channel before it requests a
//! capture, so a session's context always arrives ahead of its buffers.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tracing::{debug, error, info, warn};

use super::completion::CompletionPost;
use super::pool::BufferPool;
use super::session::{CaptureSession, SessionReport, SessionStatus};
use super::stage::CaptureStage;
use crate::slot::BufferSlot;
use crate::storage::OutputSink;

/// Messages consumed by the delivery worker.
pub(crate) enum Delivery {
    /// A new session; carries the sink and the completion handle.
    Open(SessionContext),
    /// A buffer produced by the stage.
    Buffer(BufferSlot),
    /// The capture request failed: finish the open session now.
    Cancel,
}

/// Create the delivery channel.
pub(crate) fn channel(capacity: usize) -> (DeliverySender, mpsc::Receiver<Delivery>) {
    let (tx, rx) = mpsc::channel(capacity);
    (DeliverySender { tx }, rx)
}

/// Handle through which a stage delivers buffers.
#[derive(Clone)]
pub struct DeliverySender {
    tx: mpsc::Sender<Delivery>,
}

impl DeliverySender {
    /// Hand a produced buffer to the delivery worker.
    ///
    /// Blocks while the channel is full. Call from a stage-owned thread,
    /// never from async code. If the worker is gone the slot comes back.
    pub fn deliver(&self, slot: BufferSlot) -> Result<(), BufferSlot> {
        match self.tx.blocking_send(Delivery::Buffer(slot)) {
            Err(SendError(Delivery::Buffer(slot))) => Err(slot),
            _ => Ok(()),
        }
    }

    pub(crate) async fn open(&self, ctx: SessionContext) -> bool {
        self.tx.send(Delivery::Open(ctx)).await.is_ok()
    }

    pub(crate) async fn cancel(&self) -> bool {
        self.tx.send(Delivery::Cancel).await.is_ok()
    }
}

/// Per-session state owned by the worker while the session is open.
pub(crate) struct SessionContext {
    session: CaptureSession,
    sink: OutputSink,
    post: CompletionPost,
    chunks: u64,
    soft_error: Option<SessionStatus>,
}

impl SessionContext {
    pub(crate) fn new(session: CaptureSession, post: CompletionPost) -> Self {
        let sink = OutputSink::new(session.path().to_path_buf());
        Self {
            session,
            sink,
            post,
            chunks: 0,
            soft_error: None,
        }
    }

    fn write(&mut self, payload: &[u8]) {
        self.chunks += 1;
        if self.soft_error.is_some() {
            // Output is already damaged; appending more would only misplace bytes.
            debug!(
                sequence = self.session.sequence(),
                len = payload.len(),
                "Dropping chunk after earlier write error"
            );
            return;
        }

        let expected = payload.len();
        match self.sink.append(payload) {
            Ok(written) if written == expected => {}
            Ok(written) => {
                warn!(
                    sequence = self.session.sequence(),
                    expected,
                    written,
                    "Short write to output"
                );
                self.soft_error = Some(SessionStatus::ShortWrite { expected, written });
            }
            Err(e) => {
                warn!(
                    sequence = self.session.sequence(),
                    path = ?self.sink.path(),
                    error = %e,
                    "Write to output failed"
                );
                self.soft_error = Some(SessionStatus::WriteFailed);
            }
        }
    }

    /// Close the sink and post the session's completion.
    fn finish(self, terminal: Option<SessionStatus>) {
        let sequence = self.session.sequence();
        let elapsed = self.session.elapsed();
        let chunks = self.chunks;
        let mut soft_error = self.soft_error;

        let (path, bytes_written) = match self.sink.close() {
            Ok(summary) => (summary.path, summary.bytes_written),
            Err(e) => {
                warn!(sequence, error = %e, "Closing output failed");
                soft_error.get_or_insert(SessionStatus::WriteFailed);
                (PathBuf::from(self.session.path()), 0)
            }
        };

        let status = match (terminal, soft_error) {
            (Some(status), _) => status,
            (None, Some(status)) => status,
            (None, None) if bytes_written == 0 => SessionStatus::Empty,
            (None, None) => SessionStatus::Complete,
        };

        self.post.post(SessionReport {
            sequence,
            path,
            bytes_written,
            chunks,
            status,
            elapsed,
        });
    }
}

/// Counters kept by the delivery worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Buffers received from the stage
    pub buffers: u64,
    /// Payload bytes received from the stage
    pub bytes: u64,
    /// Completion posts (one per session)
    pub completions: u64,
    /// Buffers that arrived with no session open
    pub protocol_violations: u64,
    /// Free buffers the stage refused on resubmit
    pub resubmit_failures: u64,
}

pub(crate) struct DeliveryWorker<S: CaptureStage> {
    rx: mpsc::Receiver<Delivery>,
    pool: Arc<BufferPool>,
    stage: Arc<S>,
    session: Option<SessionContext>,
    stats: DeliveryStats,
}

impl<S: CaptureStage> DeliveryWorker<S> {
    pub(crate) fn new(rx: mpsc::Receiver<Delivery>, pool: Arc<BufferPool>, stage: Arc<S>) -> Self {
        Self {
            rx,
            pool,
            stage,
            session: None,
            stats: DeliveryStats::default(),
        }
    }

    /// Drain the channel until every sender is gone.
    pub(crate) fn run(mut self) -> DeliveryStats {
        debug!("Delivery worker started");

        while let Some(msg) = self.rx.blocking_recv() {
            match msg {
                Delivery::Open(ctx) => self.open(ctx),
                Delivery::Buffer(slot) => self.on_buffer(slot),
                Delivery::Cancel => {
                    if let Some(ctx) = self.session.take() {
                        self.complete(ctx, Some(SessionStatus::CaptureFailed));
                    }
                }
            }
        }

        if let Some(ctx) = self.session.take() {
            warn!(
                sequence = ctx.session.sequence(),
                "Delivery channel closed with a session still open"
            );
            self.complete(ctx, Some(SessionStatus::CaptureFailed));
        }

        info!(
            "Delivery worker finished: {} buffers, {} bytes, {} sessions",
            self.stats.buffers, self.stats.bytes, self.stats.completions
        );
        self.stats
    }

    fn open(&mut self, ctx: SessionContext) {
        if let Some(stale) = self.session.replace(ctx) {
            error!(
                sequence = stale.session.sequence(),
                "Session opened while the previous one was still pending"
            );
            self.complete(stale, Some(SessionStatus::CaptureFailed));
        }
    }

    fn on_buffer(&mut self, mut slot: BufferSlot) {
        self.pool.mark_delivered(&mut slot);
        self.stats.buffers += 1;
        self.stats.bytes += slot.len() as u64;

        let flags = slot.flags();
        match self.session.as_mut() {
            Some(ctx) => {
                if !slot.is_empty() {
                    ctx.write(slot.payload());
                }
            }
            None if !slot.is_empty() || flags.is_terminal() => {
                error!(
                    slot = slot.index(),
                    len = slot.len(),
                    terminal = flags.is_terminal(),
                    "Buffer delivered with no session open"
                );
                self.stats.protocol_violations += 1;
            }
            // An empty buffer handed back by a stage that is flushing.
            None => {}
        }

        // Recycle before anything else so no path can leak the slot.
        self.pool.release(slot);
        self.resubmit();

        if flags.is_terminal() {
            if let Some(ctx) = self.session.take() {
                let terminal = flags
                    .is_transmission_failed()
                    .then_some(SessionStatus::TransmissionFailed);
                self.complete(ctx, terminal);
            }
        }
    }

    /// Keep one free buffer in flight while the stage is streaming.
    fn resubmit(&mut self) {
        if !self.stage.is_enabled() {
            return;
        }
        let Ok(next) = self.pool.acquire() else {
            debug!("No free buffer to resubmit");
            return;
        };
        if let Err(rejected) = self.stage.submit(next) {
            debug!(error = %rejected.reason, "Stage refused resubmitted buffer");
            self.stats.resubmit_failures += 1;
            self.pool.release(rejected.slot);
        }
    }

    fn complete(&mut self, ctx: SessionContext, terminal: Option<SessionStatus>) {
        self.stats.completions += 1;
        ctx.finish(terminal);
    }
}
