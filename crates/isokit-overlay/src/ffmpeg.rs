//! [`OverlayEngine`] backed by a local `ffmpeg` binary.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use isokit_common::with_timeout;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{OverlayEngine, OverlayError, OverlayJob};

const INPUT_FILE: &str = "input.mp4";
const FONT_FILE: &str = "font.ttf";
const OUTPUT_FILE: &str = "output.mp4";

/// Lines of ffmpeg's stderr kept in [`OverlayError::Failed`].
const STDERR_TAIL_LINES: usize = 20;

/// Runs `ffmpeg -y -i input.mp4 -vf <drawtext> output.mp4` in a scratch
/// directory.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            timeout: None,
        }
    }
}

impl FfmpegEngine {
    /// Engine using `ffmpeg` from `PATH` with no timeout.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Kill ffmpeg if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn run(&self, command: &mut Command) -> Result<Output, OverlayError> {
        let spawn_error = |source| OverlayError::Spawn {
            program: self.program.display().to_string(),
            source,
        };

        match self.timeout {
            Some(timeout) => {
                let output = command.output();
                with_timeout(timeout, move || output)
                    .await
                    .map_err(|_| OverlayError::Timeout(timeout))?
                    .map_err(spawn_error)
            }
            None => command.output().await.map_err(spawn_error),
        }
    }
}

#[async_trait]
impl OverlayEngine for FfmpegEngine {
    async fn overlay(&self, job: OverlayJob) -> Result<Bytes, OverlayError> {
        job.validate()?;

        let workdir = tempfile::tempdir()?;
        tokio::fs::write(workdir.path().join(INPUT_FILE), &job.video).await?;
        tokio::fs::write(workdir.path().join(FONT_FILE), &job.font).await?;

        let filter = job.spec.drawtext_filter(FONT_FILE);
        debug!(program = %self.program.display(), filter = %filter, "Running ffmpeg");

        let mut command = Command::new(&self.program);
        command
            .current_dir(workdir.path())
            .args(["-y", "-i", INPUT_FILE, "-vf"])
            .arg(&filter)
            .arg(OUTPUT_FILE)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = self.run(&mut command).await?;

        if !output.status.success() {
            let stderr = stderr_tail(&output.stderr);
            warn!(status = %output.status, "ffmpeg failed");
            return Err(OverlayError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }

        let encoded = tokio::fs::read(workdir.path().join(OUTPUT_FILE)).await?;
        info!(
            input_bytes = job.video.len(),
            output_bytes = encoded.len(),
            "Overlay complete"
        );
        Ok(Bytes::from(encoded))
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
