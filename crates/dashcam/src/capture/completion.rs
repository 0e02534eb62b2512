//! Completion handshake between the delivery worker and the orchestrator
//!
//! Each session gets one single-use rendezvous. The worker owns the post
//! half (inside the session context) and consumes it when it sees the
//! session's terminal buffer; the orchestrator awaits the wait half. Posting
//! consumes the handle, so a session can never be posted twice.

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::warn;

use super::session::SessionReport;

/// Create the two halves of a session's completion handshake.
pub fn completion() -> (CompletionPost, CompletionWait) {
    let (tx, rx) = oneshot::channel();
    (CompletionPost { tx }, CompletionWait { rx })
}

/// Posting half, held by the delivery worker.
#[derive(Debug)]
pub struct CompletionPost {
    tx: oneshot::Sender<SessionReport>,
}

impl CompletionPost {
    /// Wake the waiting orchestrator.
    ///
    /// Returns `false` if nobody is waiting any more.
    pub fn post(self, report: SessionReport) -> bool {
        let sequence = report.sequence;
        if self.tx.send(report).is_err() {
            warn!(sequence, "Completion posted with no waiter");
            return false;
        }
        true
    }
}

/// Waiting half, held by the orchestrator.
#[derive(Debug)]
pub struct CompletionWait {
    rx: oneshot::Receiver<SessionReport>,
}

impl CompletionWait {
    /// Block until the session's terminal buffer has been handled.
    ///
    /// Fails only if the post half was dropped unposted, which means the
    /// delivery worker is gone.
    pub async fn wait(self) -> Result<SessionReport> {
        self.rx
            .await
            .context("delivery worker dropped the session without completing it")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::session::SessionStatus;
    use std::path::PathBuf;
    use std::time::Duration;

    fn report(sequence: u64) -> SessionReport {
        SessionReport {
            sequence,
            path: PathBuf::from("/tmp/out.jpg"),
            bytes_written: 0,
            chunks: 0,
            status: SessionStatus::Empty,
            elapsed: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn post_wakes_waiter() {
        let (post, wait) = completion();
        let handle = tokio::spawn(wait.wait());
        assert!(post.post(report(7)));
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.sequence, 7);
    }

    #[tokio::test]
    async fn post_from_blocking_thread() {
        let (post, wait) = completion();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            post.post(report(1));
        });
        assert_eq!(wait.wait().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn dropped_post_is_an_error() {
        let (post, wait) = completion();
        drop(post);
        assert!(wait.wait().await.is_err());
    }

    #[test]
    fn post_without_waiter_reports_false() {
        let (post, wait) = completion();
        drop(wait);
        assert!(!post.post(report(3)));
    }
}
