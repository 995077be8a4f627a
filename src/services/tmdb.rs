//! TMDB (The Movie Database) API client for movie metadata
//!
//! Cache-then-network: lookups check the local cache table first and only
//! go upstream on a miss or expiry, through the shared rate limiter and
//! the retry wrapper. TMDB allows roughly 40 requests per 10 seconds;
//! the default bucket paces well under that.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::TmdbCacheRepository;
use crate::error::PipelineError;
use crate::services::rate_limiter::{retry_with_backoff, RetryConfig};
use crate::services::registry::ServiceRegistry;

/// Movie metadata as consumed by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieMetadata {
    pub tmdb_id: i64,
    pub title: String,
    pub original_title: Option<String>,
    pub year: Option<i32>,
    pub overview: Option<String>,
    pub tagline: Option<String>,
    pub genres: Vec<Genre>,
    /// Ordered by billing
    pub cast: Vec<CastMember>,
    pub director: Option<String>,
    pub country: Option<String>,
    pub runtime: Option<i32>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<i64>,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    pub imdb_id: Option<String>,
    pub release_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Genre {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastMember {
    pub name: String,
    pub character: Option<String>,
    pub order: Option<i32>,
}

/// A search hit used to resolve a title/year guess to a TMDB id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieSearchHit {
    pub tmdb_id: i64,
    pub title: String,
    pub year: Option<i32>,
    pub popularity: Option<f64>,
}

// Wire DTOs

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: i64,
    title: String,
    release_date: Option<String>,
    popularity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MovieDetails {
    id: i64,
    title: String,
    original_title: Option<String>,
    overview: Option<String>,
    tagline: Option<String>,
    release_date: Option<String>,
    runtime: Option<i32>,
    poster_path: Option<String>,
    backdrop_path: Option<String>,
    vote_average: Option<f64>,
    vote_count: Option<i64>,
    imdb_id: Option<String>,
    #[serde(default)]
    genres: Vec<GenreDto>,
    #[serde(default)]
    production_countries: Vec<CountryDto>,
    credits: Option<CreditsDto>,
}

#[derive(Debug, Deserialize)]
struct GenreDto {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CountryDto {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CreditsDto {
    #[serde(default)]
    cast: Vec<CastDto>,
    #[serde(default)]
    crew: Vec<CrewDto>,
}

#[derive(Debug, Deserialize)]
struct CastDto {
    name: String,
    character: Option<String>,
    order: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct CrewDto {
    name: String,
    job: String,
}

/// TMDB client with caching, rate limiting and retry.
pub struct TmdbClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    cache: TmdbCacheRepository,
    registry: Arc<ServiceRegistry>,
    cache_ttl_days: i64,
    retry: RetryConfig,
}

impl TmdbClient {
    pub fn new(
        api_key: String,
        cache: TmdbCacheRepository,
        registry: Arc<ServiceRegistry>,
        cache_ttl_days: i64,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            base_url: "https://api.themoviedb.org/3".to_string(),
            api_key,
            cache,
            registry,
            cache_ttl_days,
            retry: RetryConfig::default(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn image_url(path: &Option<String>, size: &str) -> Option<String> {
        path.as_ref()
            .map(|p| format!("https://image.tmdb.org/t/p/{size}{p}"))
    }

    fn year_of(date: &Option<String>) -> Option<i32> {
        date.as_deref()
            .and_then(|d| d.get(0..4))
            .and_then(|y| y.parse().ok())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<T, PipelineError> {
        retry_with_backoff("tmdb_request", &self.retry, cancel, || async {
            self.registry.rate_limiter().acquire("tmdb", "request").await;
            debug!(url = url, "TMDB request");

            let response = self
                .client
                .get(url)
                .query(&[("api_key", self.api_key.as_str())])
                .query(query)
                .send()
                .await
                .map_err(PipelineError::from_reqwest)?;

            let status = response.status();
            if !status.is_success() {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                let body = response.text().await.unwrap_or_default();
                return Err(PipelineError::from_response(
                    status.as_u16(),
                    retry_after,
                    body.chars().take(200).collect(),
                ));
            }

            response
                .json::<T>()
                .await
                .map_err(PipelineError::from_reqwest)
        })
        .await
    }

    /// Search for a movie by title (and year when known).
    pub async fn search_movie(
        &self,
        title: &str,
        year: Option<i32>,
        cancel: &CancellationToken,
    ) -> Result<Vec<MovieSearchHit>, PipelineError> {
        let url = format!("{}/search/movie", self.base_url);
        let mut query = vec![("query", title.to_string())];
        if let Some(y) = year {
            query.push(("year", y.to_string()));
        }

        let response: SearchResponse = self.get_json(&url, &query, cancel).await?;
        Ok(response
            .results
            .into_iter()
            .map(|r| MovieSearchHit {
                tmdb_id: r.id,
                year: Self::year_of(&r.release_date),
                title: r.title,
                popularity: r.popularity,
            })
            .collect())
    }

    /// Fetch movie metadata, cache first.
    pub async fn get_movie(
        &self,
        tmdb_id: i64,
        cancel: &CancellationToken,
    ) -> Result<MovieMetadata, PipelineError> {
        match self.cache.get_valid(tmdb_id).await {
            Ok(Some(payload)) => {
                if let Ok(metadata) = serde_json::from_value::<MovieMetadata>(payload) {
                    debug!(tmdb_id = tmdb_id, "TMDB cache hit");
                    return Ok(metadata);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(tmdb_id = tmdb_id, error = %e, "TMDB cache read failed"),
        }

        let url = format!("{}/movie/{}", self.base_url, tmdb_id);
        let query = [("append_to_response", "credits".to_string())];
        let details: MovieDetails = self.get_json(&url, &query, cancel).await?;
        let metadata = Self::map_details(details);

        match serde_json::to_value(&metadata) {
            Ok(payload) => {
                if let Err(e) = self
                    .cache
                    .upsert(tmdb_id, &payload, self.cache_ttl_days)
                    .await
                {
                    warn!(tmdb_id = tmdb_id, error = %e, "TMDB cache write failed");
                }
            }
            Err(e) => warn!(tmdb_id = tmdb_id, error = %e, "TMDB payload serialization failed"),
        }

        info!(tmdb_id = tmdb_id, title = %metadata.title, "Fetched movie metadata");
        Ok(metadata)
    }

    fn map_details(details: MovieDetails) -> MovieMetadata {
        let year = Self::year_of(&details.release_date);
        let (cast, director) = match &details.credits {
            Some(credits) => {
                let mut cast: Vec<CastMember> = credits
                    .cast
                    .iter()
                    .map(|c| CastMember {
                        name: c.name.clone(),
                        character: c.character.clone(),
                        order: c.order,
                    })
                    .collect();
                cast.sort_by_key(|c| c.order.unwrap_or(i32::MAX));
                let director = credits
                    .crew
                    .iter()
                    .find(|c| c.job == "Director")
                    .map(|c| c.name.clone());
                (cast, director)
            }
            None => (Vec::new(), None),
        };

        MovieMetadata {
            tmdb_id: details.id,
            year,
            overview: details.overview,
            tagline: details.tagline,
            genres: details
                .genres
                .into_iter()
                .map(|g| Genre {
                    id: g.id,
                    name: g.name,
                })
                .collect(),
            cast,
            director,
            country: details.production_countries.first().map(|c| c.name.clone()),
            runtime: details.runtime,
            vote_average: details.vote_average,
            vote_count: details.vote_count,
            poster_url: Self::image_url(&details.poster_path, "w500"),
            backdrop_url: Self::image_url(&details.backdrop_path, "w1280"),
            imdb_id: details.imdb_id,
            release_date: details.release_date,
            original_title: details.original_title,
            title: details.title,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_extraction() {
        assert_eq!(TmdbClient::year_of(&Some("2021-09-30".into())), Some(2021));
        assert_eq!(TmdbClient::year_of(&Some("".into())), None);
        assert_eq!(TmdbClient::year_of(&None), None);
    }

    #[test]
    fn test_cast_ordering_and_director() {
        let details = MovieDetails {
            id: 550,
            title: "Fight Club".into(),
            original_title: None,
            overview: None,
            tagline: None,
            release_date: Some("1999-10-15".into()),
            runtime: Some(139),
            poster_path: Some("/poster.jpg".into()),
            backdrop_path: None,
            vote_average: Some(8.4),
            vote_count: Some(25000),
            imdb_id: Some("tt0137523".into()),
            genres: vec![GenreDto {
                id: 18,
                name: "Drama".into(),
            }],
            production_countries: vec![CountryDto {
                name: "United States of America".into(),
            }],
            credits: Some(CreditsDto {
                cast: vec![
                    CastDto {
                        name: "Second".into(),
                        character: None,
                        order: Some(1),
                    },
                    CastDto {
                        name: "First".into(),
                        character: None,
                        order: Some(0),
                    },
                ],
                crew: vec![CrewDto {
                    name: "David Fincher".into(),
                    job: "Director".into(),
                }],
            }),
        };

        let metadata = TmdbClient::map_details(details);
        assert_eq!(metadata.year, Some(1999));
        assert_eq!(metadata.cast[0].name, "First");
        assert_eq!(metadata.director.as_deref(), Some("David Fincher"));
        assert!(metadata
            .poster_url
            .as_deref()
            .unwrap()
            .starts_with("https://image.tmdb.org/t/p/w500"));
    }
}
