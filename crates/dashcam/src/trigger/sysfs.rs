//! Linux sysfs GPIO lines
//!
//! The pin is exported under `/sys/class/gpio` if needed. Input lines are
//! configured for interrupts on both edges and waited on with `poll(2)`
//! (`POLLPRI` fires on each edge); where that cannot be set up the wait
//! falls back to short sleeps between level reads.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::line::{Level, OutputLine, TriggerLine};

/// Default sysfs GPIO root
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Longest single poll or sleep inside a wait.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// How long to wait for the kernel to create the pin directory after export.
const EXPORT_RETRIES: u32 = 20;
const EXPORT_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// A GPIO line driven through sysfs.
#[derive(Debug)]
pub struct SysfsLine {
    pin: u32,
    value: PathBuf,
    interrupts: bool,
}

impl SysfsLine {
    /// Open `pin` as an input under the default sysfs root.
    pub fn input(pin: u32) -> Result<Self> {
        Self::open_at(SYSFS_GPIO_ROOT, pin, Direction::In)
    }

    /// Open `pin` as an output under the default sysfs root.
    pub fn output(pin: u32) -> Result<Self> {
        Self::open_at(SYSFS_GPIO_ROOT, pin, Direction::Out)
    }

    /// Open `pin` under an arbitrary sysfs-like root.
    pub fn open_at(root: impl AsRef<Path>, pin: u32, direction: Direction) -> Result<Self> {
        let root = root.as_ref();
        let dir = root.join(format!("gpio{pin}"));

        if !dir.exists() {
            debug!(pin, "Exporting GPIO");
            fs::write(root.join("export"), pin.to_string())
                .with_context(|| format!("Failed to export GPIO {pin}"))?;

            let mut retries = 0;
            while !dir.exists() {
                if retries == EXPORT_RETRIES {
                    bail!("GPIO {pin} did not appear at {}", dir.display());
                }
                std::thread::sleep(EXPORT_RETRY_DELAY);
                retries += 1;
            }
        }

        fs::write(dir.join("direction"), direction.as_str())
            .with_context(|| format!("Failed to set GPIO {pin} direction"))?;

        let interrupts = match direction {
            Direction::In => match fs::write(dir.join("edge"), "both") {
                Ok(()) => true,
                Err(e) => {
                    warn!(pin, error = %e, "No edge interrupts, falling back to polling");
                    false
                }
            },
            Direction::Out => false,
        };

        info!(pin, direction = direction.as_str(), interrupts, "GPIO line ready");

        Ok(Self {
            pin,
            value: dir.join("value"),
            interrupts,
        })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }
}

/// Block for up to `timeout` waiting for an edge on the value file.
fn poll_edge(value: &Path, timeout: Duration) -> io::Result<()> {
    let mut file = File::open(value)?;
    // Reading clears any edge already pending.
    let mut buf = [0u8; 4];
    let _ = file.read(&mut buf)?;

    let mut fds = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLPRI | libc::POLLERR,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: `fds` is a valid pollfd for the lifetime of the call and
    // `file` keeps the descriptor open.
    let ret = unsafe { libc::poll(&mut fds, 1, millis) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl TriggerLine for SysfsLine {
    fn level(&self) -> Result<Level> {
        let raw = fs::read_to_string(&self.value)
            .with_context(|| format!("Failed to read GPIO {}", self.pin))?;
        match raw.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => bail!("GPIO {} read unexpected value {other:?}", self.pin),
        }
    }

    async fn wait_for_level(&self, level: Level, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.level()? == level {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let slice = remaining.min(POLL_SLICE);

            if self.interrupts {
                let value = self.value.clone();
                tokio::task::spawn_blocking(move || poll_edge(&value, slice))
                    .await
                    .context("GPIO poll task failed")?
                    .with_context(|| format!("Failed to poll GPIO {}", self.pin))?;
            } else {
                tokio::time::sleep(slice).await;
            }
        }
    }
}

impl OutputLine for SysfsLine {
    fn set_level(&self, level: Level) -> Result<()> {
        let raw = if level.is_high() { "1" } else { "0" };
        fs::write(&self.value, raw)
            .with_context(|| format!("Failed to drive GPIO {} {level}", self.pin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_pin(root: &Path, pin: u32, value: &str) {
        let dir = root.join(format!("gpio{pin}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("value"), value).unwrap();
    }

    #[test]
    fn reads_level() {
        let root = tempdir().unwrap();
        fake_pin(root.path(), 21, "1\n");

        let line = SysfsLine::open_at(root.path(), 21, Direction::In).unwrap();
        assert_eq!(line.level().unwrap(), Level::High);
        assert_eq!(
            fs::read_to_string(root.path().join("gpio21/direction")).unwrap(),
            "in"
        );
        assert_eq!(
            fs::read_to_string(root.path().join("gpio21/edge")).unwrap(),
            "both"
        );
    }

    #[test]
    fn drives_output() {
        let root = tempdir().unwrap();
        fake_pin(root.path(), 21, "0");

        let line = SysfsLine::open_at(root.path(), 21, Direction::Out).unwrap();
        line.set_level(Level::High).unwrap();
        assert_eq!(line.level().unwrap(), Level::High);
        line.set_level(Level::Low).unwrap();
        assert_eq!(line.level().unwrap(), Level::Low);
    }

    #[test]
    fn missing_pin_after_export_fails() {
        let root = tempdir().unwrap();
        let err = SysfsLine::open_at(root.path(), 4, Direction::In).unwrap_err();
        assert!(err.to_string().contains("GPIO 4"));
        assert_eq!(fs::read_to_string(root.path().join("export")).unwrap(), "4");
    }

    #[test]
    fn garbage_value_is_an_error() {
        let root = tempdir().unwrap();
        fake_pin(root.path(), 5, "x");
        let line = SysfsLine::open_at(root.path(), 5, Direction::In).unwrap();
        assert!(line.level().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_sees_level_change() {
        let root = tempdir().unwrap();
        fake_pin(root.path(), 21, "0");
        let line = SysfsLine::open_at(root.path(), 21, Direction::In).unwrap();

        assert!(!line
            .wait_for_level(Level::High, Duration::from_millis(30))
            .await
            .unwrap());

        let value = root.path().join("gpio21/value");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::write(value, "1").unwrap();
        });
        assert!(line
            .wait_for_level(Level::High, Duration::from_secs(2))
            .await
            .unwrap());
    }
}
