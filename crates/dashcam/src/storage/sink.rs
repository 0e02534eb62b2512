//! Per-session output file
//!
//! The sink opens its file lazily on the first payload byte, so a session
//! that never produces data never touches the filesystem. Chunks are
//! appended in arrival order; there is no temp-file-and-rename step, so a
//! fixed output path is simply overwritten by the next session.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Permission bits applied to every output file (world-readable)
pub const PUBLIC_READ_MODE: u32 = 0o644;

/// What a closed sink wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSummary {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub chunks: u64,
    /// False if no payload ever arrived and the file was never created
    pub opened: bool,
}

/// Output destination for one session.
pub struct OutputSink {
    path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
    chunks: u64,
}

impl OutputSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            bytes_written: 0,
            chunks: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append one delivered chunk.
    ///
    /// Returns how many bytes reached the file. A count below `data.len()`
    /// is a short write; the caller decides how to report it.
    pub fn append(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let file = match &mut self.file {
            Some(file) => file,
            unopened @ None => unopened.insert(open_public(&self.path)?),
        };

        let mut written = 0;
        while written < data.len() {
            match file.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if written == 0 => return Err(e),
                Err(e) => {
                    warn!(path = ?self.path, error = %e, "Write failed part-way through chunk");
                    break;
                }
            }
        }

        self.bytes_written += written as u64;
        self.chunks += 1;
        Ok(written)
    }

    /// Flush and close the file (if it was ever opened).
    pub fn close(mut self) -> io::Result<SinkSummary> {
        let opened = self.file.is_some();
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_data()?;
        }

        debug!(
            path = ?self.path,
            bytes = self.bytes_written,
            chunks = self.chunks,
            "Output closed"
        );

        Ok(SinkSummary {
            path: self.path,
            bytes_written: self.bytes_written,
            chunks: self.chunks,
            opened,
        })
    }
}

/// Create (or truncate) `path` and make it world-readable.
fn open_public(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(PUBLIC_READ_MODE)) {
            warn!(path = ?path, error = %e, "Could not make output world-readable");
        }
    }

    Ok(file)
}

/// Point `link` at `target`, replacing any previous link.
///
/// The new link is created beside the old one and renamed over it so
/// readers never see the link missing.
#[cfg(unix)]
pub fn update_latest_link(link: &Path, target: &Path) -> io::Result<()> {
    let mut staging = link.as_os_str().to_owned();
    staging.push(".new");
    let staging = PathBuf::from(staging);

    match fs::remove_file(&staging) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(target, &staging)?;
    fs::rename(&staging, link)
}

#[cfg(not(unix))]
pub fn update_latest_link(_link: &Path, _target: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "latest-frame links need a unix filesystem",
    ))
}
