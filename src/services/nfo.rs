//! Release presentation rendering
//!
//! The NFO and BBCode description shipped with an upload. Fancy
//! templating lives in the embedding program; the pipeline only needs
//! the `PresentationRenderer` contract and ships a plain built-in
//! renderer as the default.

use crate::services::media_analyzer::MediaInfo;
use crate::services::tmdb::MovieMetadata;

/// Everything a renderer may draw on.
pub struct PresentationContext<'a> {
    pub release_name: &'a str,
    pub metadata: Option<&'a MovieMetadata>,
    pub media: Option<&'a MediaInfo>,
    pub screenshot_urls: &'a [String],
}

pub trait PresentationRenderer: Send + Sync {
    /// Plain-text NFO content.
    fn render_nfo(&self, ctx: &PresentationContext) -> String;

    /// BBCode description for the tracker's description field.
    fn render_description(&self, ctx: &PresentationContext) -> String;
}

/// Minimal renderer used when no template engine is plugged in.
pub struct PlainTextRenderer;

impl PresentationRenderer for PlainTextRenderer {
    fn render_nfo(&self, ctx: &PresentationContext) -> String {
        let mut lines = vec![ctx.release_name.to_string(), String::new()];

        if let Some(meta) = ctx.metadata {
            lines.push(format!(
                "Title....: {}{}",
                meta.title,
                meta.year.map(|y| format!(" ({y})")).unwrap_or_default()
            ));
            if let Some(director) = &meta.director {
                lines.push(format!("Director.: {director}"));
            }
            if !meta.genres.is_empty() {
                let genres: Vec<&str> = meta.genres.iter().map(|g| g.name.as_str()).collect();
                lines.push(format!("Genres...: {}", genres.join(", ")));
            }
            if let Some(runtime) = meta.runtime {
                lines.push(format!("Runtime..: {runtime} min"));
            }
            if let Some(rating) = meta.vote_average {
                lines.push(format!("Rating...: {rating:.1}/10"));
            }
            if let Some(overview) = &meta.overview {
                lines.push(String::new());
                lines.push(overview.clone());
            }
        }

        if let Some(media) = ctx.media {
            lines.push(String::new());
            if let (Some(res), Some(codec)) = (&media.resolution, &media.video_codec) {
                lines.push(format!("Video....: {res} {codec}"));
            }
            for track in &media.audio_tracks {
                lines.push(format!(
                    "Audio....: {} {}ch {}",
                    track.codec.as_deref().unwrap_or("?"),
                    track.channels.unwrap_or(0),
                    track.language.as_deref().unwrap_or("und")
                ));
            }
        }

        lines.join("\n")
    }

    fn render_description(&self, ctx: &PresentationContext) -> String {
        let mut out = String::new();

        if let Some(meta) = ctx.metadata {
            out.push_str(&format!("[b]{}[/b]", meta.title));
            if let Some(year) = meta.year {
                out.push_str(&format!(" ({year})"));
            }
            out.push_str("\n\n");
            if let Some(poster) = &meta.poster_url {
                out.push_str(&format!("[img]{poster}[/img]\n\n"));
            }
            if let Some(overview) = &meta.overview {
                out.push_str(overview);
                out.push_str("\n\n");
            }
        }

        if !ctx.screenshot_urls.is_empty() {
            out.push_str("[b]Screenshots[/b]\n");
            for url in ctx.screenshot_urls {
                out.push_str(&format!("[img]{url}[/img]\n"));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_renderer_includes_screenshots() {
        let urls = vec!["https://img.example/a.png".to_string()];
        let ctx = PresentationContext {
            release_name: "Film.2020.1080p.WEB-DL.H264-GRP",
            metadata: None,
            media: None,
            screenshot_urls: &urls,
        };

        let renderer = PlainTextRenderer;
        let nfo = renderer.render_nfo(&ctx);
        assert!(nfo.starts_with("Film.2020.1080p.WEB-DL.H264-GRP"));

        let description = renderer.render_description(&ctx);
        assert!(description.contains("[img]https://img.example/a.png[/img]"));
    }
}
