//! Capture pipeline orchestrator
//!
//! Owns the stage, the buffer pool and the delivery worker. One call to
//! [`CapturePipeline::capture`] runs one session: enable the stage, prime it
//! with every free slot, open the session on the delivery channel, request
//! the capture, wait for the completion post, then disable the stage and
//! recycle whatever it still holds.

use anyhow::{bail, Context, Result};
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::completion::completion;
use super::delivery::{self, DeliverySender, DeliveryStats, DeliveryWorker, SessionContext};
use super::pool::{BufferPool, PoolStats};
use super::session::{CaptureSession, SessionReport};
use super::stage::{CaptureStage, StageFormat};
use crate::storage::{update_latest_link, OutputPath};

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of buffer slots shared by the stage and the delivery worker
    pub pool_size: usize,
    /// Bytes per slot
    pub slot_size: usize,
    pub format: StageFormat,
    pub output: OutputPath,
    /// Symlink repointed at the newest non-empty still
    pub latest_link: Option<PathBuf>,
    /// Enable burst capture once before the first session
    pub burst: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            slot_size: 64 * 1024,
            format: StageFormat::default(),
            output: OutputPath::default(),
            latest_link: None,
            burst: true,
        }
    }
}

impl PipelineConfig {
    /// Write every still to `output` with otherwise default settings
    pub fn with_output(output: impl Into<OutputPath>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }
}

/// Trigger-driven still pipeline.
pub struct CapturePipeline<S: CaptureStage> {
    stage: Arc<S>,
    pool: Arc<BufferPool>,
    config: PipelineConfig,
    deliveries: Option<DeliverySender>,
    worker: Option<JoinHandle<DeliveryStats>>,
}

impl<S: CaptureStage> CapturePipeline<S> {
    /// Configure the stage, allocate the pool and start the delivery worker.
    ///
    /// Must be called from within a tokio runtime. Any failure here is
    /// fatal; nothing is left running.
    pub fn new(stage: S, config: PipelineConfig) -> Result<Self> {
        stage
            .configure(&config.format)
            .context("Stage format negotiation failed")?;

        let pool = Arc::new(
            BufferPool::new(config.pool_size, config.slot_size)
                .context("Failed to create buffer pool")?,
        );

        if config.burst {
            stage
                .set_burst_mode(true)
                .context("Failed to enable burst capture")?;
        }

        let stage = Arc::new(stage);

        // Every slot plus an open and a cancel fit without blocking.
        let (deliveries, rx) = delivery::channel(config.pool_size + 2);
        let worker = DeliveryWorker::new(rx, pool.clone(), stage.clone());
        let worker = tokio::task::spawn_blocking(move || worker.run());

        info!(
            "Capture pipeline ready: {} x {}B slots, output {}",
            config.pool_size, config.slot_size, config.output
        );

        Ok(Self {
            stage,
            pool,
            config,
            deliveries: Some(deliveries),
            worker: Some(worker),
        })
    }

    pub fn stage(&self) -> &Arc<S> {
        &self.stage
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one capture session numbered `sequence`.
    ///
    /// Soft errors (short writes, failed transmissions, a rejected capture
    /// request) come back in the report; `Err` means the pipeline itself is
    /// broken.
    pub async fn capture(&mut self, sequence: u64) -> Result<SessionReport> {
        let Some(deliveries) = self.deliveries.clone() else {
            bail!("Capture pipeline is shut down");
        };

        self.stage
            .enable(deliveries.clone())
            .context("Failed to enable stage delivery")?;

        let primed = self.prime();
        if primed == 0 {
            warn!(sequence, "No buffers primed; capture will stall until one is released");
        }

        let path = self.config.output.resolve(sequence, Local::now());
        let (post, wait) = completion();
        let session = CaptureSession::new(sequence, path);
        if !deliveries.open(SessionContext::new(session, post)).await {
            self.recycle_stage_slots();
            bail!("Delivery worker stopped");
        }

        debug!(sequence, primed, "Starting capture");
        if let Err(e) = self.stage.request_capture() {
            warn!(sequence, error = %e, "Capture request rejected");
            deliveries.cancel().await;
        }

        let report = wait.wait().await;
        self.recycle_stage_slots();
        let report = report?;

        if report.status.is_soft_error() {
            warn!(
                sequence,
                bytes = report.bytes_written,
                status = %report.status,
                "Session finished with errors"
            );
        } else {
            info!(
                sequence,
                bytes = report.bytes_written,
                chunks = report.chunks,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Still saved to {}",
                report.path.display()
            );
        }

        if let Some(link) = &self.config.latest_link {
            if report.bytes_written > 0 {
                if let Err(e) = update_latest_link(link, &report.path) {
                    warn!(link = ?link, error = %e, "Could not update latest link");
                }
            }
        }

        Ok(report)
    }

    /// Submit every free slot to the stage. Returns how many went in.
    fn prime(&self) -> usize {
        let mut primed = 0;
        for _ in 0..self.pool.free_count() {
            let slot = match self.pool.acquire() {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(error = %e, "Skipping buffer while priming");
                    break;
                }
            };
            match self.stage.submit(slot) {
                Ok(()) => primed += 1,
                Err(rejected) => {
                    warn!(
                        slot = rejected.slot.index(),
                        error = %rejected.reason,
                        "Stage refused primed buffer"
                    );
                    self.pool.release(rejected.slot);
                }
            }
        }
        primed
    }

    /// Disable the stage and return the slots it still holds to the pool.
    fn recycle_stage_slots(&self) {
        for slot in self.stage.disable() {
            self.pool.release(slot);
        }
    }

    /// Disable the stage and wait for the delivery worker to drain.
    pub async fn shutdown(mut self) -> Result<DeliveryStats> {
        self.recycle_stage_slots();
        self.deliveries = None;

        let stats = match self.worker.take() {
            Some(worker) => worker.await.context("Delivery worker panicked")?,
            None => DeliveryStats::default(),
        };
        // Picks up slots a producer could not deliver while the worker wound down.
        self.recycle_stage_slots();

        let pool = self.pool.stats();
        if !pool.is_idle() {
            warn!(?pool, "Buffers still outstanding at shutdown");
        }
        info!(
            "Capture pipeline stopped: {} sessions, {} bytes",
            stats.completions, stats.bytes
        );
        Ok(stats)
    }
}
