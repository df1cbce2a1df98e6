//! Nominatim search client for city-center coordinates.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;
use url::Url;

use super::Geocoder;
use crate::config::GeocoderConfig;
use crate::error::LookupError;
use crate::models::Coordinates;

/// Geocodes free-form place names against a Nominatim `/search` endpoint.
///
/// Requests are spaced at least `request_delay` apart. Failures are reported
/// once; there is no retry.
pub struct NominatimGeocoder {
    client: Client,
    endpoint: Url,
    country: Option<String>,
    request_delay: Duration,
    next_slot: Mutex<Instant>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocoderConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .with_context(|| format!("Invalid geocoder endpoint: {}", config.endpoint))?;
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            country: config.country.clone(),
            request_delay: config.request_delay(),
            next_slot: Mutex::new(Instant::now()),
        })
    }

    fn search_url(&self, query: &str) -> Url {
        let q = match &self.country {
            Some(country) => format!("{}, {}", query, country),
            None => query.to_string(),
        };
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("q", &q)
            .append_pair("format", "json")
            .append_pair("limit", "1")
            .append_pair("addressdetails", "0");
        url
    }

    async fn wait_for_slot(&self) {
        let mut next = self.next_slot.lock().await;
        sleep_until(*next).await;
        *next = Instant::now() + self.request_delay;
    }
}

impl Geocoder for NominatimGeocoder {
    async fn resolve(&self, query: &str) -> std::result::Result<Coordinates, LookupError> {
        self.wait_for_slot().await;

        let url = self.search_url(query);
        debug!("Nominatim lookup: {}", url);

        let request_error = |e: reqwest::Error| LookupError::Request {
            query: query.to_string(),
            message: e.to_string(),
        };
        let hits: Vec<SearchHit> = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(request_error)?
            .json()
            .await
            .map_err(|e| LookupError::Malformed {
                query: query.to_string(),
                message: e.to_string(),
            })?;

        let hit = hits
            .into_iter()
            .next()
            .ok_or_else(|| LookupError::NotFound(query.to_string()))?;
        parse_hit(query, &hit)
    }
}

fn parse_hit(query: &str, hit: &SearchHit) -> std::result::Result<Coordinates, LookupError> {
    let malformed = |message: String| LookupError::Malformed {
        query: query.to_string(),
        message,
    };
    let lat: f64 = hit
        .lat
        .parse()
        .map_err(|_| malformed(format!("latitude '{}'", hit.lat)))?;
    let lon: f64 = hit
        .lon
        .parse()
        .map_err(|_| malformed(format!("longitude '{}'", hit.lon)))?;
    Coordinates::try_new(lat, lon).ok_or_else(|| malformed(format!("out of range ({}, {})", lat, lon)))
}
