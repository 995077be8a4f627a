//! MediaInfo-based media analysis service
//!
//! Uses the `mediainfo` command-line tool to extract stream details from
//! media files. Its JSON output is stable across versions and parsing it
//! is far more robust than binding the library directly.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

/// Media analysis result consumed by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub path: String,
    pub size_bytes: i64,
    pub duration_secs: Option<f64>,
    pub container: Option<String>,

    /// Normalized label such as "1080p"
    pub resolution: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_codec: Option<String>,
    pub is_hdr: bool,
    pub hdr_type: Option<String>,

    pub audio_tracks: Vec<AudioTrack>,
    pub subtitles: Vec<SubtitleTrack>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioTrack {
    pub codec: Option<String>,
    pub channels: Option<u32>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleTrack {
    pub language: Option<String>,
    pub forced: bool,
}

impl MediaInfo {
    /// Lower-cased language names of the audio tracks, for option mapping.
    pub fn audio_languages(&self) -> Vec<String> {
        self.audio_tracks
            .iter()
            .filter_map(|t| t.language.as_ref())
            .map(|l| normalize_language(l))
            .collect()
    }
}

/// Map ISO codes and native names onto the tokens option mappings use.
fn normalize_language(raw: &str) -> String {
    match raw.to_lowercase().as_str() {
        "fr" | "fra" | "fre" | "français" | "francais" => "french".to_string(),
        "en" | "eng" => "english".to_string(),
        "de" | "deu" | "ger" => "german".to_string(),
        "es" | "spa" => "spanish".to_string(),
        "it" | "ita" => "italian".to_string(),
        "ja" | "jpn" => "japanese".to_string(),
        other => other.to_string(),
    }
}

/// Resolution label from pixel dimensions.
pub fn detect_resolution(width: u32, height: u32) -> &'static str {
    if width >= 3800 || height >= 2000 {
        "2160p"
    } else if width >= 1900 || height >= 1000 {
        "1080p"
    } else if width >= 1260 || height >= 700 {
        "720p"
    } else {
        "480p"
    }
}

/// Media analysis via the mediainfo CLI.
pub struct MediaAnalyzer {
    mediainfo_path: String,
}

impl Default for MediaAnalyzer {
    fn default() -> Self {
        Self {
            mediainfo_path: "mediainfo".to_string(),
        }
    }
}

impl MediaAnalyzer {
    pub fn with_tool_path(mediainfo_path: String) -> Self {
        Self { mediainfo_path }
    }

    /// Check if the mediainfo binary is on PATH and runnable.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.mediainfo_path)
            .arg("--Version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Analyze a media file.
    pub async fn analyze(&self, path: &Path) -> Result<MediaInfo> {
        debug!(path = %path.display(), "Analyzing media file");

        if !path.exists() {
            bail!("media analysis failed for '{}': file does not exist", path.display());
        }

        let output = Command::new(&self.mediainfo_path)
            .arg("--Output=JSON")
            .arg(path)
            .output()
            .await
            .with_context(|| format!("failed to execute mediainfo for '{}'", path.display()))?;

        if !output.status.success() {
            bail!(
                "mediainfo failed for '{}' (exit code {:?}): {}",
                path.display(),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let root: Value = serde_json::from_slice(&output.stdout)
            .context("failed to parse mediainfo JSON output")?;

        let info = Self::parse_output(path, &root)?;
        info!(
            path = %path.display(),
            resolution = ?info.resolution,
            video_codec = ?info.video_codec,
            audio_tracks = info.audio_tracks.len(),
            subtitles = info.subtitles.len(),
            "Media analysis complete"
        );
        Ok(info)
    }

    /// mediainfo JSON is all strings; pull values out defensively.
    fn parse_output(path: &Path, root: &Value) -> Result<MediaInfo> {
        let tracks = root
            .pointer("/media/track")
            .and_then(Value::as_array)
            .context("mediainfo output missing track list")?;

        let str_field = |track: &Value, key: &str| -> Option<String> {
            track.get(key).and_then(Value::as_str).map(str::to_string)
        };
        let num_field = |track: &Value, key: &str| -> Option<f64> {
            track
                .get(key)
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
        };

        let mut info = MediaInfo {
            path: path.to_string_lossy().to_string(),
            size_bytes: 0,
            duration_secs: None,
            container: None,
            resolution: None,
            width: None,
            height: None,
            video_codec: None,
            is_hdr: false,
            hdr_type: None,
            audio_tracks: Vec::new(),
            subtitles: Vec::new(),
        };

        for track in tracks {
            match track.get("@type").and_then(Value::as_str) {
                Some("General") => {
                    info.container = str_field(track, "Format");
                    info.duration_secs = num_field(track, "Duration");
                    info.size_bytes = num_field(track, "FileSize").unwrap_or(0.0) as i64;
                }
                Some("Video") if info.video_codec.is_none() => {
                    info.video_codec = str_field(track, "Format");
                    info.width = num_field(track, "Width").map(|w| w as u32);
                    info.height = num_field(track, "Height").map(|h| h as u32);
                    if let (Some(w), Some(h)) = (info.width, info.height) {
                        info.resolution = Some(detect_resolution(w, h).to_string());
                    }
                    let hdr = str_field(track, "HDR_Format")
                        .or_else(|| str_field(track, "HDR_Format_Compatibility"));
                    if let Some(hdr) = hdr {
                        info.is_hdr = true;
                        info.hdr_type = Some(hdr);
                    }
                }
                Some("Audio") => {
                    info.audio_tracks.push(AudioTrack {
                        codec: str_field(track, "Format"),
                        channels: num_field(track, "Channels").map(|c| c as u32),
                        language: str_field(track, "Language"),
                    });
                }
                Some("Text") => {
                    info.subtitles.push(SubtitleTrack {
                        language: str_field(track, "Language"),
                        forced: str_field(track, "Forced").as_deref() == Some("Yes"),
                    });
                }
                _ => {}
            }
        }

        if info.size_bytes == 0 {
            if let Ok(meta) = std::fs::metadata(path) {
                info.size_bytes = meta.len() as i64;
            }
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolution_detection() {
        assert_eq!(detect_resolution(3840, 2160), "2160p");
        assert_eq!(detect_resolution(1920, 1080), "1080p");
        // Scope/anamorphic heights still map by width
        assert_eq!(detect_resolution(1920, 800), "1080p");
        assert_eq!(detect_resolution(1280, 720), "720p");
        assert_eq!(detect_resolution(720, 480), "480p");
    }

    #[test]
    fn test_language_normalization() {
        assert_eq!(normalize_language("fra"), "french");
        assert_eq!(normalize_language("EN"), "english");
        assert_eq!(normalize_language("Korean"), "korean");
    }

    #[test]
    fn test_parse_mediainfo_output() {
        let root = json!({
            "media": {
                "track": [
                    {"@type": "General", "Format": "Matroska", "Duration": "7268.032", "FileSize": "15032385536"},
                    {"@type": "Video", "Format": "AVC", "Width": "1920", "Height": "804"},
                    {"@type": "Audio", "Format": "E-AC-3", "Channels": "6", "Language": "fr"},
                    {"@type": "Audio", "Format": "AAC", "Channels": "2", "Language": "en"},
                    {"@type": "Text", "Language": "fr", "Forced": "Yes"}
                ]
            }
        });

        let info = MediaAnalyzer::parse_output(Path::new("/in/movie.mkv"), &root).unwrap();
        assert_eq!(info.resolution.as_deref(), Some("1080p"));
        assert_eq!(info.video_codec.as_deref(), Some("AVC"));
        assert_eq!(info.audio_tracks.len(), 2);
        assert_eq!(info.audio_languages(), vec!["french", "english"]);
        assert_eq!(info.subtitles.len(), 1);
        assert!(info.subtitles[0].forced);
        assert_eq!(info.size_bytes, 15_032_385_536);
    }
}
