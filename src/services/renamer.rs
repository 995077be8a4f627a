//! Release naming and file relocation
//!
//! Composes the canonical `Title.Year.Resolution.Source.Codec-GROUP`
//! release name and moves the media file into the output directory under
//! that name. Both roots are fixed at construction; any path escaping
//! them is rejected before the filesystem is touched.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::services::filename_parser::ParsedRelease;
use crate::services::media_analyzer::MediaInfo;
use crate::services::tmdb::MovieMetadata;

pub struct Renamer {
    input_root: PathBuf,
    output_dir: PathBuf,
}

impl Renamer {
    pub fn new(input_root: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            input_root,
            output_dir,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Compose the release name from TMDB metadata, the analyzed media
    /// and the parsed filename tokens, preferring the most reliable
    /// source for each part.
    pub fn compose_release_name(
        &self,
        parsed: &ParsedRelease,
        media: Option<&MediaInfo>,
        metadata: Option<&MovieMetadata>,
    ) -> String {
        let title = metadata
            .map(|m| m.title.clone())
            .or_else(|| parsed.title.clone())
            .unwrap_or_else(|| "Unknown".to_string());
        let title = dotify(&title);

        let year = metadata
            .and_then(|m| m.year)
            .or(parsed.year)
            .map(|y| y.to_string());

        let resolution = media
            .and_then(|m| m.resolution.clone())
            .or_else(|| parsed.resolution.clone());

        let source = parsed.source.clone();
        let codec = parsed.codec.clone().or_else(|| {
            media.and_then(|m| {
                m.video_codec.as_deref().map(|c| match c {
                    "AVC" => "H264".to_string(),
                    "HEVC" => "H265".to_string(),
                    other => other.to_string(),
                })
            })
        });

        let group = parsed
            .release_group
            .clone()
            .unwrap_or_else(|| "NOGRP".to_string());

        let mut parts = vec![title];
        parts.extend(year);
        parts.extend(resolution);
        parts.extend(source);
        parts.extend(codec);

        format!("{}-{}", parts.join("."), group)
    }

    /// Verify a path sits inside one of the configured roots. Parent
    /// components are rejected outright since `starts_with` is lexical.
    pub fn ensure_within_roots(&self, path: &Path) -> Result<(), PipelineError> {
        let has_parent_component = path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if !has_parent_component
            && (path.starts_with(&self.input_root) || path.starts_with(&self.output_dir))
        {
            Ok(())
        } else {
            Err(PipelineError::Validation(format!(
                "path '{}' escapes the configured roots",
                path.display()
            )))
        }
    }

    /// Move the media file into the output directory under the release
    /// name. Idempotent: if the target already holds the file (a crashed
    /// earlier run got that far), the move is considered done.
    pub async fn move_into_output(
        &self,
        source: &Path,
        release_name: &str,
    ) -> Result<PathBuf, PipelineError> {
        self.ensure_within_roots(source)?;

        let extension = source
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "mkv".to_string());
        let target = self.output_dir.join(format!("{release_name}.{extension}"));

        if tokio::fs::metadata(&target).await.is_ok() {
            debug!(target = %target.display(), "Target already present, move considered done");
            return Ok(target);
        }

        if tokio::fs::metadata(source).await.is_err() {
            return Err(PipelineError::Validation(format!(
                "source file '{}' is missing and target '{}' does not exist",
                source.display(),
                target.display()
            )));
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| {
                PipelineError::Validation(format!("cannot create output directory: {e}"))
            })?;

        // rename fails across filesystems; fall back to copy + remove
        match tokio::fs::rename(source, &target).await {
            Ok(()) => {}
            Err(_) => {
                tokio::fs::copy(source, &target).await.map_err(|e| {
                    PipelineError::Validation(format!("failed to copy media file: {e}"))
                })?;
                tokio::fs::remove_file(source).await.ok();
            }
        }

        info!(
            from = %source.display(),
            to = %target.display(),
            "Media file moved into output directory"
        );
        Ok(target)
    }
}

/// Collapse a display title into scene dotted form.
fn dotify(title: &str) -> String {
    let cleaned = Regex::new(r"[^\w\s-]")
        .unwrap()
        .replace_all(title, "")
        .to_string();
    let collapsed = Regex::new(r"\s+")
        .unwrap()
        .replace_all(cleaned.trim(), ".")
        .to_string();
    collapsed.trim_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::filename_parser::parse_release;

    fn renamer() -> Renamer {
        Renamer::new(PathBuf::from("/in"), PathBuf::from("/out"))
    }

    #[test]
    fn test_release_name_round_trips_scene_input() {
        let parsed = parse_release("The.Movie.2021.1080p.WEB-DL.H264-X.mkv");
        let name = renamer().compose_release_name(&parsed, None, None);
        assert_eq!(name, "The.Movie.2021.1080p.WEB-DL.H264-X");
    }

    #[test]
    fn test_release_name_prefers_tmdb_title_and_year() {
        let parsed = parse_release("the movie 1080p WEB-DL H264-GRP.mkv");
        let metadata = MovieMetadata {
            tmdb_id: 1,
            title: "The Movie: Redux".into(),
            original_title: None,
            year: Some(2021),
            overview: None,
            tagline: None,
            genres: vec![],
            cast: vec![],
            director: None,
            country: None,
            runtime: None,
            vote_average: None,
            vote_count: None,
            poster_url: None,
            backdrop_url: None,
            imdb_id: None,
            release_date: None,
        };
        let name = renamer().compose_release_name(&parsed, None, Some(&metadata));
        assert_eq!(name, "The.Movie.Redux.2021.1080p.WEB-DL.H264-GRP");
    }

    #[test]
    fn test_missing_group_gets_placeholder() {
        let parsed = parse_release("Film.2020.720p.HDTV.x264.mkv");
        let name = renamer().compose_release_name(&parsed, None, None);
        assert!(name.ends_with("-NOGRP"), "got {name}");
    }

    #[test]
    fn test_path_containment() {
        let r = renamer();
        assert!(r.ensure_within_roots(Path::new("/in/movie.mkv")).is_ok());
        assert!(r.ensure_within_roots(Path::new("/out/movie.mkv")).is_ok());
        assert!(r
            .ensure_within_roots(Path::new("/etc/passwd"))
            .is_err());
        assert!(r
            .ensure_within_roots(Path::new("/in/../etc/passwd"))
            .is_err());
    }

    #[test]
    fn test_dotify_strips_punctuation() {
        assert_eq!(dotify("The Movie: Redux"), "The.Movie.Redux");
        assert_eq!(dotify("  Spaced   Out  "), "Spaced.Out");
    }
}
