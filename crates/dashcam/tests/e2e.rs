//! E2E regression test suite for the capture pipeline
//!
//! Drives the full recorder (trigger → pipeline → delivery worker → sink →
//! advance policy) with the simulated stage and an in-memory trigger line,
//! so no camera or GPIO hardware is needed.
//!
//! Run: `cargo test -p dashcam --test e2e`

#![cfg(feature = "test-source")]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use dashcam::grab::{send_pulse, PulseConfig};
use dashcam::{
    AdvanceTiming, CapturePipeline, Level, OutputPath, PipelineConfig, Recorder, SessionReport,
    SessionStatus, SimulatedLine, SimulatedStage, SimulatedStageConfig, StopReason, TriggerMode,
};

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

// ── Shared helpers ───────────────────────────────────────────────────

fn pipeline(
    dir: &Path,
    pool_size: usize,
    stage: SimulatedStageConfig,
) -> CapturePipeline<SimulatedStage> {
    let config = PipelineConfig {
        pool_size,
        slot_size: 4096,
        output: OutputPath::new(dir.join("still-{seq}.jpg").to_string_lossy()),
        ..Default::default()
    };
    CapturePipeline::new(SimulatedStage::new(stage), config).unwrap()
}

fn gpio_mode(line: &SimulatedLine) -> TriggerMode {
    TriggerMode::Gpio {
        line: Arc::new(line.clone()),
        poll_interval: Duration::from_millis(10),
    }
}

async fn next_report(rx: &mut broadcast::Receiver<SessionReport>) -> SessionReport {
    tokio::time::timeout(REPORT_TIMEOUT, rx.recv())
        .await
        .expect("capture session hung")
        .unwrap()
}

fn quick_pulse() -> PulseConfig {
    PulseConfig {
        high: Duration::from_millis(20),
        low: Duration::from_millis(40),
    }
}

// ── GPIO-triggered runs ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn five_pulses_five_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let line = SimulatedLine::default();
    // Each still spans several slots of a 4-slot pool.
    let stage = SimulatedStageConfig {
        still_size: 15_000,
        ..Default::default()
    };

    let recorder = Recorder::new(
        pipeline(dir.path(), 4, stage),
        gpio_mode(&line),
        AdvanceTiming::default(),
        CancellationToken::new(),
    )
    .with_frame_start(1);
    let cancel = recorder.cancel_token();
    let mut reports = recorder.subscribe();
    let handle = tokio::spawn(recorder.run());

    for expected in 1..=5u64 {
        line.set(Level::High);
        let report = next_report(&mut reports).await;
        assert_eq!(report.sequence, expected);
        assert_eq!(report.status, SessionStatus::Complete);
        assert_eq!(report.bytes_written, 15_000);

        // Release the line and give the trigger time to see it low.
        line.set(Level::Low);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel();
    let summary = tokio::time::timeout(REPORT_TIMEOUT, handle)
        .await
        .expect("recorder did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(summary.sessions, 5);
    assert_eq!(summary.soft_errors, 0);
    assert_eq!(summary.next_frame, 6);
    assert!(matches!(
        summary.stop,
        StopReason::Cancelled | StopReason::Trigger
    ));

    // Exactly one completion per session.
    assert_eq!(summary.delivery.completions, 5);
    assert_eq!(summary.delivery.protocol_violations, 0);

    // Every slot is back in the free queue.
    assert_eq!(summary.pool.capacity, 4);
    assert_eq!(summary.pool.free, 4);
    assert!(summary.pool.is_balanced());

    for seq in 1..=5 {
        let data = std::fs::read(dir.path().join(format!("still-{seq:04}.jpg"))).unwrap();
        assert_eq!(data.len(), 15_000);
        assert_eq!(&data[..2], &[0xff, 0xd8]);
        assert_eq!(&data[data.len() - 2..], &[0xff, 0xd9]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn held_line_captures_once() {
    let dir = tempfile::tempdir().unwrap();
    let line = SimulatedLine::default();

    let recorder = Recorder::new(
        pipeline(dir.path(), 3, SimulatedStageConfig::default()),
        gpio_mode(&line),
        AdvanceTiming::default(),
        CancellationToken::new(),
    );
    let cancel = recorder.cancel_token();
    let mut reports = recorder.subscribe();
    let handle = tokio::spawn(recorder.run());

    line.set(Level::High);
    next_report(&mut reports).await;

    // Still high: no second session.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(reports.try_recv().is_err());

    cancel.cancel();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.sessions, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn pulse_generator_drives_recorder() {
    let dir = tempfile::tempdir().unwrap();
    let line = SimulatedLine::default();

    let recorder = Recorder::new(
        pipeline(dir.path(), 3, SimulatedStageConfig::default()),
        gpio_mode(&line),
        AdvanceTiming::default(),
        CancellationToken::new(),
    );
    let cancel = recorder.cancel_token();
    let mut reports = recorder.subscribe();
    let handle = tokio::spawn(recorder.run());

    for _ in 0..3 {
        send_pulse(&line, &quick_pulse()).await.unwrap();
        next_report(&mut reports).await;
    }

    cancel.cancel();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.sessions, 3);
    assert!(summary.pool.is_idle());
}

// ── Edge cases ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn zero_payload_session_completes() {
    let dir = tempfile::tempdir().unwrap();

    let recorder = Recorder::new(
        pipeline(dir.path(), 4, SimulatedStageConfig::empty()),
        TriggerMode::Single {
            delay: Duration::ZERO,
        },
        AdvanceTiming::default(),
        CancellationToken::new(),
    );
    let mut reports = recorder.subscribe();

    let summary = tokio::time::timeout(REPORT_TIMEOUT, recorder.run())
        .await
        .expect("zero-payload session hung")
        .unwrap();

    let report = reports.recv().await.unwrap();
    assert_eq!(report.status, SessionStatus::Empty);
    assert_eq!(report.bytes_written, 0);
    assert!(!report.status.is_soft_error());

    // Sink closed without ever creating the file.
    assert!(!dir.path().join("still-0000.jpg").exists());

    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.delivery.completions, 1);
    assert!(summary.pool.is_idle());
}

#[tokio::test(flavor = "multi_thread")]
async fn transmission_failure_is_soft_error() {
    let dir = tempfile::tempdir().unwrap();
    let line = SimulatedLine::default();

    let pipeline = pipeline(dir.path(), 3, SimulatedStageConfig::default());
    pipeline.stage().fail_next_capture();

    let recorder = Recorder::new(
        pipeline,
        gpio_mode(&line),
        AdvanceTiming::default(),
        CancellationToken::new(),
    );
    let cancel = recorder.cancel_token();
    let mut reports = recorder.subscribe();
    let handle = tokio::spawn(recorder.run());

    line.set(Level::High);
    let failed = next_report(&mut reports).await;
    assert_eq!(failed.status, SessionStatus::TransmissionFailed);
    line.set(Level::Low);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The next trigger cycle is unaffected.
    line.set(Level::High);
    let ok = next_report(&mut reports).await;
    assert_eq!(ok.status, SessionStatus::Complete);

    cancel.cancel();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.sessions, 2);
    assert_eq!(summary.soft_errors, 1);
    assert_eq!(summary.delivery.completions, 2);
    assert!(summary.pool.is_idle());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_capture_does_not_hang() {
    let dir = tempfile::tempdir().unwrap();

    let pipeline = pipeline(dir.path(), 3, SimulatedStageConfig::default());
    pipeline.stage().reject_next_capture();

    let recorder = Recorder::new(
        pipeline,
        TriggerMode::Single {
            delay: Duration::ZERO,
        },
        AdvanceTiming::default(),
        CancellationToken::new(),
    );
    let mut reports = recorder.subscribe();

    let summary = tokio::time::timeout(REPORT_TIMEOUT, recorder.run())
        .await
        .expect("rejected capture hung")
        .unwrap();

    assert_eq!(
        reports.recv().await.unwrap().status,
        SessionStatus::CaptureFailed
    );
    assert_eq!(summary.soft_errors, 1);
    assert!(summary.pool.is_idle());
}

// ── Paced runs ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn timelapse_runs_until_timeout() {
    let dir = tempfile::tempdir().unwrap();

    let recorder = Recorder::new(
        pipeline(dir.path(), 3, SimulatedStageConfig::default()),
        TriggerMode::Timelapse {
            interval: Duration::from_millis(100),
        },
        AdvanceTiming::with_timeout(Duration::from_millis(550)),
        CancellationToken::new(),
    );

    let summary = tokio::time::timeout(REPORT_TIMEOUT, recorder.run())
        .await
        .expect("timelapse did not honour its timeout")
        .unwrap();

    assert_eq!(summary.stop, StopReason::Timeout);
    // One capture at start, then one per interval after the first full sleep.
    assert!(
        (3..=6).contains(&summary.sessions),
        "unexpected session count {}",
        summary.sessions
    );
    assert_eq!(summary.delivery.completions, summary.sessions);
    assert!(summary.pool.is_idle());
}
