//! Facet-to-option mapping
//!
//! Converts release metadata (languages, quality, genres, season and
//! episode) into the numeric option ids a tracker's upload API expects,
//! driven entirely by the schema's `options` section. Resolution order
//! per facet: tmdb_mappings, then name_mappings, then the quality
//! resolution fallback, then the declared default.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use super::schema::OptionSpec;
use crate::services::tmdb::Genre;

/// A resolved option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    One(i64),
    Many(Vec<i64>),
}

/// Inputs the mapper draws on.
#[derive(Debug, Default)]
pub struct OptionInputs<'a> {
    pub resolution: Option<&'a str>,
    pub source: Option<&'a str>,
    /// Normalized lower-case language tokens (from audio tracks)
    pub languages: Vec<String>,
    pub genres: &'a [Genre],
    pub season: Option<i64>,
    pub episode: Option<i64>,
    pub release_name: Option<&'a str>,
}

pub struct OptionsMapper<'a> {
    config: &'a HashMap<String, OptionSpec>,
}

impl<'a> OptionsMapper<'a> {
    pub fn new(config: &'a HashMap<String, OptionSpec>) -> Self {
        Self { config }
    }

    fn normalize_key(value: &str) -> String {
        value
            .to_lowercase()
            .trim()
            .replace('-', "_")
            .replace(' ', "_")
    }

    /// Map audio languages to option ids, applying the auto-multi rule:
    /// when both french and english audio are present and the facet opts
    /// in, the multi value is added.
    pub fn map_language(&self, languages: &[String]) -> Vec<i64> {
        let Some(spec) = self.config.get("language") else {
            return Vec::new();
        };

        let mut ids = Vec::new();
        for lang in languages {
            let key = Self::normalize_key(lang);
            let direct = spec.mappings.get(&key).copied();
            let partial = || {
                spec.mappings
                    .iter()
                    .find(|(k, _)| key.contains(k.as_str()) || k.contains(&key))
                    .map(|(_, v)| *v)
            };
            if let Some(id) = direct.or_else(partial) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }

        if spec.auto_multi {
            let has = |needle: &str| {
                languages
                    .iter()
                    .any(|l| Self::normalize_key(l).contains(needle))
            };
            if has("french") && has("english") {
                if let Some(multi) = spec.auto_multi_value {
                    if !ids.contains(&multi) {
                        ids.push(multi);
                    }
                }
            }
        }

        if ids.is_empty() {
            ids = default_ids(spec);
        }
        ids
    }

    /// Map resolution + source to a quality option id. Combined keys
    /// like `1080p_web` are tried first, then source-only keys, then the
    /// resolution fallback, then the default.
    pub fn map_quality(
        &self,
        resolution: Option<&str>,
        source: Option<&str>,
        release_name: Option<&str>,
    ) -> Option<i64> {
        let spec = self.config.get("quality")?;

        let resolution_norm = normalize_resolution(resolution.unwrap_or(""));
        let source_norm = normalize_source(
            source.unwrap_or(""),
            release_name.unwrap_or(""),
        );

        let combined = format!("{resolution_norm}_{source_norm}");
        if let Some(id) = spec.mappings.get(&combined) {
            return Some(*id);
        }

        // Any mapping key naming both parts
        if !resolution_norm.is_empty() && !source_norm.is_empty() {
            if let Some((_, id)) = spec
                .mappings
                .iter()
                .find(|(k, _)| k.contains(&resolution_norm) && k.contains(&source_norm))
            {
                return Some(*id);
            }
        }

        if let Some(id) = spec.mappings.get(&source_norm) {
            return Some(*id);
        }

        if let Some(id) = spec.resolution_fallback.get(&resolution_norm) {
            return Some(*id);
        }

        default_scalar(spec)
    }

    /// Map TMDB genres: id mapping first, name mapping as fallback.
    pub fn map_genres(&self, genres: &[Genre]) -> Vec<i64> {
        let Some(spec) = self.config.get("genre") else {
            return Vec::new();
        };

        let mut ids = Vec::new();
        for genre in genres {
            let mapped = spec.tmdb_mappings.get(&genre.id).copied().or_else(|| {
                let key = Self::normalize_key(&genre.name);
                spec.name_mappings.get(&key).copied().or_else(|| {
                    spec.name_mappings
                        .iter()
                        .find(|(k, _)| key.contains(k.as_str()) || k.contains(&key))
                        .map(|(_, v)| *v)
                })
            });
            if let Some(id) = mapped {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Season id: `base_value + season`, clamped at `max_value`;
    /// None/zero means the complete-series value.
    pub fn map_season(&self, season: Option<i64>) -> Option<i64> {
        let spec = self.config.get("season")?;
        Self::map_counter(spec, season)
    }

    /// Episode id with the same arithmetic as seasons.
    pub fn map_episode(&self, episode: Option<i64>) -> Option<i64> {
        let spec = self.config.get("episode")?;
        Self::map_counter(spec, episode)
    }

    fn map_counter(spec: &OptionSpec, number: Option<i64>) -> Option<i64> {
        match number {
            None | Some(0) => spec.complete_value,
            Some(n) => {
                let calculated = spec.base_value.unwrap_or(0) + n;
                match spec.max_value {
                    Some(max) if calculated > max => Some(max),
                    _ => Some(calculated),
                }
            }
        }
    }

    /// Resolve every configured facet into `type_id -> value`.
    pub fn build_options(&self, inputs: &OptionInputs) -> HashMap<String, OptionValue> {
        let mut options = HashMap::new();

        for (facet, spec) in self.config {
            let Some(type_id) = spec.type_id.clone() else {
                continue;
            };

            let value = match facet.as_str() {
                "language" => {
                    let ids = self.map_language(&inputs.languages);
                    (!ids.is_empty()).then(|| many_or_one(ids, spec.multi_select))
                }
                "quality" => self
                    .map_quality(inputs.resolution, inputs.source, inputs.release_name)
                    .map(OptionValue::One),
                "genre" => {
                    let ids = self.map_genres(inputs.genres);
                    (!ids.is_empty()).then(|| many_or_one(ids, spec.multi_select))
                }
                "season" if inputs.season.is_some() => {
                    self.map_season(inputs.season).map(OptionValue::One)
                }
                "episode" if inputs.season.is_some() || inputs.episode.is_some() => {
                    self.map_episode(inputs.episode).map(OptionValue::One)
                }
                _ => None,
            };

            if let Some(value) = value {
                options.insert(type_id, value);
            }
        }

        debug!(options = ?options, "Built tracker options");
        options
    }
}

fn many_or_one(mut ids: Vec<i64>, multi_select: bool) -> OptionValue {
    if multi_select {
        OptionValue::Many(ids)
    } else {
        OptionValue::One(ids.remove(0))
    }
}

fn default_ids(spec: &OptionSpec) -> Vec<i64> {
    match &spec.default {
        Some(serde_json::Value::Array(values)) => {
            values.iter().filter_map(|v| v.as_i64()).collect()
        }
        Some(value) => value.as_i64().into_iter().collect(),
        None => Vec::new(),
    }
}

fn default_scalar(spec: &OptionSpec) -> Option<i64> {
    spec.default.as_ref().and_then(|v| v.as_i64())
}

fn normalize_resolution(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.contains("2160") || lower.contains("4k") || lower.contains("uhd") {
        "2160p".to_string()
    } else if lower.contains("1080") {
        "1080p".to_string()
    } else if lower.contains("720") {
        "720p".to_string()
    } else if lower.contains("480") {
        "480p".to_string()
    } else {
        lower
    }
}

fn normalize_source(raw: &str, release_name: &str) -> String {
    let lower = raw.to_lowercase();
    let release_lower = release_name.to_lowercase();
    if lower.contains("remux") || release_lower.contains("remux") {
        "remux".to_string()
    } else if lower.contains("web") {
        "web".to_string()
    } else if lower.contains("blu") {
        "bluray".to_string()
    } else if lower.contains("hdtv") {
        "hdtv".to_string()
    } else if lower.contains("hdrip") || lower.contains("bdrip") {
        "hdrip".to_string()
    } else {
        lower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn language_spec() -> HashMap<String, OptionSpec> {
        let mut config = HashMap::new();
        config.insert(
            "language".to_string(),
            OptionSpec {
                type_id: Some("1".into()),
                multi_select: true,
                auto_multi: true,
                auto_multi_value: Some(4),
                mappings: [
                    ("english".to_string(), 1),
                    ("french".to_string(), 2),
                    ("multi".to_string(), 4),
                ]
                .into_iter()
                .collect(),
                default: Some(serde_json::json!([4])),
                ..Default::default()
            },
        );
        config
    }

    #[test]
    fn test_auto_multi_added_for_dual_audio() {
        let config = language_spec();
        let mapper = OptionsMapper::new(&config);
        let ids = mapper.map_language(&["french".into(), "english".into()]);
        assert!(ids.contains(&1));
        assert!(ids.contains(&2));
        assert!(ids.contains(&4));
    }

    #[test]
    fn test_single_language_no_auto_multi() {
        let config = language_spec();
        let mapper = OptionsMapper::new(&config);
        let ids = mapper.map_language(&["french".into()]);
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_language_default_when_unmapped() {
        let config = language_spec();
        let mapper = OptionsMapper::new(&config);
        let ids = mapper.map_language(&["klingon".into()]);
        assert_eq!(ids, vec![4]);
    }

    fn quality_spec() -> HashMap<String, OptionSpec> {
        let mut config = HashMap::new();
        config.insert(
            "quality".to_string(),
            OptionSpec {
                type_id: Some("2".into()),
                mappings: [
                    ("2160p_web".to_string(), 26),
                    ("1080p_web".to_string(), 25),
                    ("remux".to_string(), 30),
                ]
                .into_iter()
                .collect(),
                resolution_fallback: [("1080p".to_string(), 25), ("720p".to_string(), 24)]
                    .into_iter()
                    .collect(),
                default: Some(serde_json::json!(20)),
                ..Default::default()
            },
        );
        config
    }

    #[test]
    fn test_quality_combined_key() {
        let config = quality_spec();
        let mapper = OptionsMapper::new(&config);
        assert_eq!(
            mapper.map_quality(Some("1080p"), Some("WEB-DL"), None),
            Some(25)
        );
    }

    #[test]
    fn test_quality_remux_from_release_name() {
        let config = quality_spec();
        let mapper = OptionsMapper::new(&config);
        assert_eq!(
            mapper.map_quality(Some("2160p"), Some("BluRay"), Some("Film.2160p.REMUX-GRP")),
            Some(30)
        );
    }

    #[test]
    fn test_quality_resolution_fallback_then_default() {
        let config = quality_spec();
        let mapper = OptionsMapper::new(&config);
        assert_eq!(mapper.map_quality(Some("720p"), Some("HDTV"), None), Some(24));
        assert_eq!(mapper.map_quality(Some("480p"), Some("HDTV"), None), Some(20));
    }

    #[test]
    fn test_genre_tmdb_before_name() {
        let mut config = HashMap::new();
        config.insert(
            "genre".to_string(),
            OptionSpec {
                type_id: Some("5".into()),
                multi_select: true,
                tmdb_mappings: [(28i64, 39i64)].into_iter().collect(),
                name_mappings: [("comedy".to_string(), 49)].into_iter().collect(),
                ..Default::default()
            },
        );
        let mapper = OptionsMapper::new(&config);
        let genres = vec![
            Genre {
                id: 28,
                name: "Action".into(),
            },
            Genre {
                id: 35,
                name: "Comedy".into(),
            },
        ];
        assert_eq!(mapper.map_genres(&genres), vec![39, 49]);
    }

    fn counter_spec(complete: i64, base: i64, max: i64) -> OptionSpec {
        OptionSpec {
            type_id: Some("7".into()),
            complete_value: Some(complete),
            base_value: Some(base),
            max_value: Some(max),
            ..Default::default()
        }
    }

    #[test]
    fn test_season_arithmetic() {
        let mut config = HashMap::new();
        config.insert("season".to_string(), counter_spec(118, 120, 150));
        let mapper = OptionsMapper::new(&config);

        assert_eq!(mapper.map_season(Some(1)), Some(121));
        assert_eq!(mapper.map_season(Some(99)), Some(150));
        assert_eq!(mapper.map_season(None), Some(118));
        assert_eq!(mapper.map_season(Some(0)), Some(118));
    }

    #[test]
    fn test_build_options_collects_facets() {
        let mut config = language_spec();
        config.extend(quality_spec());

        let mapper = OptionsMapper::new(&config);
        let inputs = OptionInputs {
            resolution: Some("1080p"),
            source: Some("WEB-DL"),
            languages: vec!["french".into(), "english".into()],
            ..Default::default()
        };

        let options = mapper.build_options(&inputs);
        assert_eq!(options.get("2"), Some(&OptionValue::One(25)));
        match options.get("1") {
            Some(OptionValue::Many(ids)) => assert!(ids.contains(&4)),
            other => panic!("unexpected language value: {other:?}"),
        }
    }
}
