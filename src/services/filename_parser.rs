//! Filename parser for scene-style release names
//!
//! Parses movie filenames like:
//! - "The.Movie.2021.1080p.WEB-DL.H264-X.mkv"
//! - "Another Film (2019) 2160p BluRay x265-GRP.mkv"
//! - "Old.Classic.1974.720p.BluRay.x264-KiNGDOM.mkv"

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tokens extracted from a release filename.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedRelease {
    /// Best-effort title guess (dots and underscores collapsed to spaces)
    pub title: Option<String>,
    pub year: Option<i32>,
    pub resolution: Option<String>,
    pub source: Option<String>,
    pub codec: Option<String>,
    pub hdr: Option<String>,
    pub audio: Option<String>,
    pub release_group: Option<String>,
    pub is_proper: bool,
    pub is_repack: bool,
    pub original_name: String,
}

/// Parse a movie filename into its scene tokens.
pub fn parse_release(filename: &str) -> ParsedRelease {
    let stem = strip_extension(filename);
    let mut result = ParsedRelease {
        original_name: filename.to_string(),
        ..Default::default()
    };

    let cleaned = stem.replace(['.', '_'], " ");

    // Year is the strongest anchor; the title is everything before it
    let year_re = Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap();
    if let Some(m) = year_re.find(&cleaned) {
        result.year = m.as_str().parse().ok();
        let title_part = cleaned[..m.start()].trim();
        if !title_part.is_empty() {
            result.title = Some(clean_title(title_part));
        }
    }

    // Without a year, take everything before the first quality token
    if result.title.is_none() {
        let quality_re =
            Regex::new(r"(?i)\b(2160p|1080p|720p|480p|4K|UHD|WEB|BluRay|HDTV|REMUX)\b").unwrap();
        let title_part = match quality_re.find(&cleaned) {
            Some(m) if m.start() > 0 => &cleaned[..m.start()],
            _ => cleaned.as_str(),
        };
        let title_part = title_part.trim();
        if !title_part.is_empty() {
            result.title = Some(clean_title(title_part));
        }
    }

    let quality = parse_quality(&stem);
    result.resolution = quality.resolution;
    result.source = quality.source;
    result.codec = quality.codec;
    result.hdr = quality.hdr;
    result.audio = quality.audio;

    // Release group sits after the last dash
    let group_re = Regex::new(r"-([A-Za-z0-9]+)$").unwrap();
    if let Some(caps) = group_re.captures(&stem) {
        result.release_group = Some(caps.get(1).unwrap().as_str().to_string());
    }

    result.is_proper = stem.to_uppercase().contains("PROPER");
    result.is_repack = stem.to_uppercase().contains("REPACK");

    debug!(
        filename = filename,
        title = ?result.title,
        year = ?result.year,
        resolution = ?result.resolution,
        group = ?result.release_group,
        "Parsed filename"
    );

    result
}

/// Quality tokens extracted from a filename.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedQuality {
    pub resolution: Option<String>,
    pub source: Option<String>,
    pub codec: Option<String>,
    pub hdr: Option<String>,
    pub audio: Option<String>,
}

pub fn parse_quality(filename: &str) -> ParsedQuality {
    let upper = filename.to_uppercase();
    let mut quality = ParsedQuality::default();

    let res_re = Regex::new(r"(?i)(2160p|1080p|720p|480p|4K|UHD)").unwrap();
    if let Some(caps) = res_re.captures(filename) {
        let res = caps.get(1).unwrap().as_str().to_uppercase();
        quality.resolution = Some(match res.as_str() {
            "4K" | "UHD" => "2160p".to_string(),
            other => other.to_lowercase(),
        });
    }

    if upper.contains("REMUX") {
        quality.source = Some("Remux".to_string());
    } else if upper.contains("BLURAY") || upper.contains("BLU-RAY") || upper.contains("BDRIP") {
        quality.source = Some("BluRay".to_string());
    } else if upper.contains("WEB-DL") || upper.contains("WEBDL") {
        quality.source = Some("WEB-DL".to_string());
    } else if upper.contains("WEBRIP") {
        quality.source = Some("WEBRip".to_string());
    } else if upper.contains("HDTV") {
        quality.source = Some("HDTV".to_string());
    } else if upper.contains("HDRIP") {
        quality.source = Some("HDRip".to_string());
    }

    // Preserve the token style the release used
    if upper.contains("X265") {
        quality.codec = Some("x265".to_string());
    } else if upper.contains("H265") || upper.contains("H.265") || upper.contains("HEVC") {
        quality.codec = Some("H265".to_string());
    } else if upper.contains("X264") {
        quality.codec = Some("x264".to_string());
    } else if upper.contains("H264") || upper.contains("H.264") {
        quality.codec = Some("H264".to_string());
    } else if upper.contains("AV1") {
        quality.codec = Some("AV1".to_string());
    } else if upper.contains("XVID") {
        quality.codec = Some("XviD".to_string());
    }

    if upper.contains("DV") && (upper.contains("DOVI") || upper.contains("DOLBY")) {
        quality.hdr = Some("DV".to_string());
    } else if upper.contains("HDR10+") {
        quality.hdr = Some("HDR10+".to_string());
    } else if upper.contains("HDR") {
        quality.hdr = Some("HDR".to_string());
    }

    if upper.contains("ATMOS") {
        quality.audio = Some("Atmos".to_string());
    } else if upper.contains("TRUEHD") {
        quality.audio = Some("TrueHD".to_string());
    } else if upper.contains("DTS-HD") {
        quality.audio = Some("DTS-HD".to_string());
    } else if upper.contains("DDP") || upper.contains("EAC3") || upper.contains("E-AC-3") {
        quality.audio = Some("DDP".to_string());
    } else if upper.contains("AC3") {
        quality.audio = Some("AC3".to_string());
    } else if upper.contains("AAC") {
        quality.audio = Some("AAC".to_string());
    }

    quality
}

fn strip_extension(filename: &str) -> String {
    let known = [
        ".mkv", ".mp4", ".avi", ".wmv", ".mov", ".m4v", ".ts", ".webm", ".m2ts",
    ];
    let lower = filename.to_lowercase();
    for ext in known {
        if lower.ends_with(ext) {
            return filename[..filename.len() - ext.len()].to_string();
        }
    }
    filename.to_string()
}

fn clean_title(raw: &str) -> String {
    let cleaned = raw
        .trim_matches(|c: char| c.is_whitespace() || c == '(' || c == '[' || c == '-')
        .trim();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_release() {
        let parsed = parse_release("The.Movie.2021.1080p.WEB-DL.H264-X.mkv");
        assert_eq!(parsed.title.as_deref(), Some("The Movie"));
        assert_eq!(parsed.year, Some(2021));
        assert_eq!(parsed.resolution.as_deref(), Some("1080p"));
        assert_eq!(parsed.source.as_deref(), Some("WEB-DL"));
        assert_eq!(parsed.codec.as_deref(), Some("H264"));
        assert_eq!(parsed.release_group.as_deref(), Some("X"));
    }

    #[test]
    fn test_parse_spaced_release_with_parens() {
        let parsed = parse_release("Another Film (2019) 2160p BluRay x265-GRP.mkv");
        assert_eq!(parsed.title.as_deref(), Some("Another Film"));
        assert_eq!(parsed.year, Some(2019));
        assert_eq!(parsed.resolution.as_deref(), Some("2160p"));
        assert_eq!(parsed.source.as_deref(), Some("BluRay"));
        assert_eq!(parsed.codec.as_deref(), Some("x265"));
        assert_eq!(parsed.release_group.as_deref(), Some("GRP"));
    }

    #[test]
    fn test_parse_without_year() {
        let parsed = parse_release("Some.Documentary.1080p.WEBRip.x264-TEAM.mkv");
        assert_eq!(parsed.title.as_deref(), Some("Some Documentary"));
        assert_eq!(parsed.year, None);
        assert_eq!(parsed.source.as_deref(), Some("WEBRip"));
    }

    #[test]
    fn test_remux_beats_bluray() {
        let quality = parse_quality("Film.2020.2160p.BluRay.REMUX.HDR.HEVC-GRP");
        assert_eq!(quality.source.as_deref(), Some("Remux"));
        assert_eq!(quality.hdr.as_deref(), Some("HDR"));
    }

    #[test]
    fn test_proper_and_repack_flags() {
        let parsed = parse_release("Film.2020.PROPER.1080p.WEB-DL.H264-GRP.mkv");
        assert!(parsed.is_proper);
        assert!(!parsed.is_repack);
    }
}
