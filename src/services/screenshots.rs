//! Screenshot capture via ffmpeg
//!
//! Grabs evenly-spaced frames for the release presentation. The tool is
//! optional: when ffmpeg is absent the Prepare stage simply skips
//! screenshots instead of failing the pipeline.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

pub struct ScreenshotGenerator {
    ffmpeg_path: String,
}

impl Default for ScreenshotGenerator {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl ScreenshotGenerator {
    pub fn with_tool_path(ffmpeg_path: String) -> Self {
        Self { ffmpeg_path }
    }

    pub async fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg_path)
            .arg("-version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Capture `count` frames spread across the runtime, skipping the
    /// first and last slots so credits and studio cards are avoided.
    pub async fn capture(
        &self,
        media_path: &Path,
        output_dir: &Path,
        count: u32,
        duration_secs: f64,
    ) -> Result<Vec<PathBuf>> {
        if count == 0 || duration_secs <= 0.0 {
            return Ok(Vec::new());
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("failed to create {}", output_dir.display()))?;

        let stem = media_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "frame".to_string());

        let mut captured = Vec::with_capacity(count as usize);
        let step = duration_secs / (count as f64 + 1.0);

        for i in 1..=count {
            let timestamp = step * i as f64;
            let out_path = output_dir.join(format!("{stem}_{i:02}.png"));

            debug!(
                timestamp = timestamp,
                out = %out_path.display(),
                "Capturing screenshot"
            );

            let output = Command::new(&self.ffmpeg_path)
                .args(["-y", "-ss", &format!("{timestamp:.2}")])
                .arg("-i")
                .arg(media_path)
                .args(["-frames:v", "1", "-q:v", "2"])
                .arg(&out_path)
                .output()
                .await
                .with_context(|| format!("failed to execute ffmpeg for '{}'", media_path.display()))?;

            if !output.status.success() {
                bail!(
                    "ffmpeg screenshot failed at {:.0}s: {}",
                    timestamp,
                    String::from_utf8_lossy(&output.stderr)
                );
            }

            captured.push(out_path);
        }

        info!(
            path = %media_path.display(),
            count = captured.len(),
            "Screenshots captured"
        );
        Ok(captured)
    }
}
