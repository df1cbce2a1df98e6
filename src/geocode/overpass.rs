//! Overpass API client for landmarks inside a US city boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;
use url::{form_urlencoded, Url};

use super::{Landmark, LandmarkSource};
use crate::config::OverpassConfig;
use crate::error::LookupError;

/// Queries nodes carrying any of the configured tag keys within the city's
/// administrative area. Endpoints are used round-robin, requests spaced at
/// least `request_delay` apart. No retry.
pub struct OverpassClient {
    client: Client,
    endpoints: Vec<Url>,
    tags: Vec<String>,
    request_delay: Duration,
    next_slot: Mutex<Instant>,
    turn: AtomicUsize,
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<Element>,
}

#[derive(Debug, Deserialize)]
struct Element {
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

impl OverpassClient {
    pub fn new(config: &OverpassConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            bail!("No Overpass endpoints configured");
        }
        let endpoints = config
            .endpoints
            .iter()
            .map(|e| Url::parse(e).with_context(|| format!("Invalid Overpass endpoint: {}", e)))
            .collect::<Result<Vec<_>>>()?;
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoints,
            tags: config.tags.clone(),
            request_delay: config.request_delay(),
            next_slot: Mutex::new(Instant::now()),
            turn: AtomicUsize::new(0),
        })
    }

    fn build_query(&self, city: &str, state: &str) -> String {
        let city = city.replace('\\', "\\\\").replace('"', "\\\"");
        let state = state.trim().to_uppercase();
        let selectors: String = self
            .tags
            .iter()
            .map(|tag| format!("  node[\"{}\"](area.cityArea);\n", tag))
            .collect();
        format!(
            "[out:json][timeout:25];\n\
             area[\"ISO3166-2\"=\"US-{state}\"]->.stateArea;\n\
             area[\"name\"=\"{city}\"][\"boundary\"=\"administrative\"](area.stateArea)->.cityArea;\n\
             (\n{selectors});\n\
             out center;\n"
        )
    }

    fn next_endpoint(&self) -> &Url {
        let turn = self.turn.fetch_add(1, Ordering::Relaxed);
        &self.endpoints[turn % self.endpoints.len()]
    }

    async fn wait_for_slot(&self) {
        let mut next = self.next_slot.lock().await;
        sleep_until(*next).await;
        *next = Instant::now() + self.request_delay;
    }
}

impl LandmarkSource for OverpassClient {
    async fn landmarks(&self, city: &str, state: &str) -> std::result::Result<Vec<Landmark>, LookupError> {
        self.wait_for_slot().await;

        let key = format!("{}, {}", city, state);
        let endpoint = self.next_endpoint().clone();
        debug!("Overpass lookup for {} via {}", key, endpoint);

        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("data", &self.build_query(city, state))
            .finish();
        let response: OverpassResponse = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LookupError::Request {
                query: key.clone(),
                message: e.to_string(),
            })?
            .json()
            .await
            .map_err(|e| LookupError::Malformed {
                query: key.clone(),
                message: e.to_string(),
            })?;

        Ok(parse_elements(response))
    }
}

/// Elements without both coordinates are skipped.
fn parse_elements(response: OverpassResponse) -> Vec<Landmark> {
    response
        .elements
        .into_iter()
        .filter_map(|mut el| {
            Some(Landmark {
                name: el.tags.remove("name"),
                lat: el.lat?,
                lon: el.lon?,
            })
        })
        .collect()
}
