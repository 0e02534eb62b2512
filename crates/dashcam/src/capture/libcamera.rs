//! Pi camera stage using libcamera-still
//!
//! Each capture request spawns one `libcamera-still` process writing the
//! encoded still to stdout; a stage-owned thread streams that output into
//! the submitted slots. A non-zero exit marks the final slot as failed.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

use super::stage::{CaptureStage, Encoding, StageCore, StageFormat};
use crate::error::StageError;

/// libcamera-still configuration
#[derive(Debug, Clone)]
pub struct LibcameraConfig {
    /// Binary to run (looked up on `PATH` unless absolute)
    pub binary: PathBuf,
    /// Time the camera runs before taking the still, in milliseconds
    pub shot_timeout_ms: u32,
    /// Camera index for multi-camera boards
    pub camera: Option<u32>,
}

impl Default for LibcameraConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("libcamera-still"),
            shot_timeout_ms: 1,
            camera: None,
        }
    }
}

impl LibcameraConfig {
    /// Use the newer `rpicam-still` name for the same tool
    pub fn rpicam() -> Self {
        Self {
            binary: PathBuf::from("rpicam-still"),
            ..Default::default()
        }
    }
}

/// Capture stage backed by the libcamera still tool.
pub struct LibcameraStage {
    core: Arc<StageCore>,
    config: LibcameraConfig,
    format: Mutex<Option<StageFormat>>,
}

impl LibcameraStage {
    pub fn new(config: LibcameraConfig) -> Self {
        Self {
            core: Arc::new(StageCore::new("libcamera-still")),
            config,
            format: Mutex::new(None),
        }
    }

    fn args(&self, format: &StageFormat) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(), // No preview window
            "-t".to_string(),
            self.config.shot_timeout_ms.to_string(),
            "--width".to_string(),
            format.width.to_string(),
            "--height".to_string(),
            format.height.to_string(),
            "-e".to_string(),
            format.encoding.extension().to_string(),
            "-o".to_string(),
            "-".to_string(), // Output to stdout
        ];

        if format.encoding == Encoding::Jpeg {
            args.push("-q".to_string());
            args.push(format.quality.to_string());
        }

        if let Some(camera) = self.config.camera {
            args.push("--camera".to_string());
            args.push(camera.to_string());
        }

        if self.core.burst() {
            args.push("--immediate".to_string());
        }

        args
    }
}

impl CaptureStage for LibcameraStage {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn configure(&self, format: &StageFormat) -> Result<(), StageError> {
        format.validate()?;
        if format.encoding == Encoding::Gif {
            return Err(StageError::Unsupported("gif encoding"));
        }

        let version = Command::new(&self.config.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| {
                StageError::Component(format!(
                    "cannot run {}: {e}. Is it installed?",
                    self.config.binary.display()
                ))
            })?;

        if !version.success() {
            return Err(StageError::Component(format!(
                "{} --version exited with {version}",
                self.config.binary.display()
            )));
        }

        info!(
            "Configured {}: {}x{} {} q{}",
            self.config.binary.display(),
            format.width,
            format.height,
            format.encoding,
            format.quality
        );

        *self.format.lock().unwrap_or_else(|p| p.into_inner()) = Some(format.clone());
        Ok(())
    }

    fn request_capture(&self) -> Result<(), StageError> {
        let format = self
            .format
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| StageError::CaptureRejected("stage not configured".into()))?;

        let deliveries = self.core.begin_capture()?;
        let args = self.args(&format);
        debug!("libcamera-still args: {:?}", args);

        let mut child = match Command::new(&self.config.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.core.end_capture();
                return Err(StageError::CaptureRejected(format!(
                    "failed to spawn {}: {e}",
                    self.config.binary.display()
                )));
            }
        };

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            self.core.end_capture();
            return Err(StageError::CaptureRejected(
                "no stdout from libcamera-still".into(),
            ));
        };

        let core = self.core.clone();
        let spawned = thread::Builder::new()
            .name("libcamera-still".into())
            .spawn(move || {
                let outcome = core.stream_still(&deliveries, stdout, || match child.wait() {
                    Ok(status) if status.success() => true,
                    Ok(status) => {
                        warn!(%status, "libcamera-still failed");
                        false
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not reap libcamera-still");
                        false
                    }
                });
                debug!(?outcome, "libcamera-still capture finished");

                // Aborted streams leave the process running.
                let _ = child.kill();
                let _ = child.wait();
            });

        spawned.map(|_| ()).map_err(|e| {
            self.core.end_capture();
            StageError::CaptureRejected(format!("failed to start reader thread: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_follow_format() {
        let stage = LibcameraStage::new(LibcameraConfig::default());
        let format = StageFormat {
            width: 640,
            height: 480,
            encoding: Encoding::Jpeg,
            quality: 70,
        };

        let args = stage.args(&format);
        let joined = args.join(" ");
        assert!(joined.contains("--width 640"));
        assert!(joined.contains("--height 480"));
        assert!(joined.contains("-e jpg"));
        assert!(joined.contains("-q 70"));
        assert!(joined.ends_with("-o - -q 70"));
        assert!(!joined.contains("--immediate"));

        stage.set_burst_mode(true).unwrap();
        assert!(stage.args(&format).contains(&"--immediate".to_string()));
    }

    #[test]
    fn png_has_no_quality() {
        let stage = LibcameraStage::new(LibcameraConfig::default());
        let format = StageFormat {
            encoding: Encoding::Png,
            ..Default::default()
        };
        assert!(!stage.args(&format).contains(&"-q".to_string()));
    }

    #[test]
    fn missing_binary_is_fatal() {
        let stage = LibcameraStage::new(LibcameraConfig {
            binary: PathBuf::from("/nonexistent/libcamera-still"),
            ..Default::default()
        });
        let err = stage.configure(&StageFormat::default()).unwrap_err();
        assert!(matches!(err, StageError::Component(_)));
    }

    #[test]
    fn gif_is_unsupported() {
        let stage = LibcameraStage::new(LibcameraConfig::default());
        let format = StageFormat {
            encoding: Encoding::Gif,
            ..Default::default()
        };
        assert!(matches!(
            stage.configure(&format),
            Err(StageError::Unsupported(_))
        ));
    }

    #[test]
    fn capture_before_configure_is_rejected() {
        let stage = LibcameraStage::new(LibcameraConfig::default());
        assert!(matches!(
            stage.request_capture(),
            Err(StageError::CaptureRejected(_))
        ));
    }
}
