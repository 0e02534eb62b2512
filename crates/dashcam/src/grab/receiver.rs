//! Upload receiver
//!
//! Accepts TCP connections and writes everything each peer sends, verbatim,
//! to `<dir>/grab<peer-ip>.jpeg`. One task per connection; a connection
//! ends when the peer closes its side. On shutdown, uploads in progress get
//! up to [`DRAIN_TIMEOUT`] to finish.

use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Grace period for in-progress uploads after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Address to listen on
    pub bind: SocketAddr,
    /// Directory uploads are written into
    pub dir: PathBuf,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3333)),
            dir: PathBuf::from("/var/www/html"),
        }
    }
}

/// File an upload from `peer` is written to.
pub fn upload_path(dir: &Path, peer: IpAddr) -> PathBuf {
    dir.join(format!("grab{peer}.jpeg"))
}

pub struct UploadReceiver {
    listener: TcpListener,
    dir: PathBuf,
}

impl UploadReceiver {
    pub async fn bind(config: ReceiverConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("Failed to bind upload receiver on {}", config.bind))?;
        info!("Upload receiver listening on {}", config.bind);
        Ok(Self {
            listener,
            dir: config.dir,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Upload receiver has no local address")
    }

    /// Accept uploads until cancelled. Returns the number of connections
    /// accepted.
    pub async fn run(self, cancel: CancellationToken) -> Result<u64> {
        let tracker = TaskTracker::new();
        let mut accepted = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Upload receiver: shutting down");
                    break;
                }
                conn = self.listener.accept() => {
                    let (stream, peer) = match conn {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    accepted += 1;
                    info!(peer = %peer, "Upload connection opened");

                    // Uploads run to peer close; shutdown only stops accepting.
                    let path = upload_path(&self.dir, peer.ip());
                    tracker.spawn(async move {
                        match receive(stream, &path).await {
                            Ok(bytes) => info!(peer = %peer, bytes, "Upload saved to {}", path.display()),
                            Err(e) => warn!(peer = %peer, error = %e, "Upload failed"),
                        }
                    });
                }
            }
        }

        tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
            warn!("Upload receiver: uploads still running after {:?}", DRAIN_TIMEOUT);
        }
        Ok(accepted)
    }
}

/// Copy the whole stream into `path`. Returns the bytes written.
async fn receive(mut stream: TcpStream, path: &Path) -> Result<u64> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let mut file = File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::Permissions::from_mode(crate::storage::PUBLIC_READ_MODE);
        if let Err(e) = file.set_permissions(mode).await {
            warn!(path = ?path, error = %e, "Could not make upload world-readable");
        }
    }

    let bytes = tokio::io::copy(&mut stream, &mut file)
        .await
        .context("Upload stream failed")?;
    file.flush().await?;
    Ok(bytes)
}
