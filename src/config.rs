use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::balltree::{BuildParams, EARTH_RADIUS_MILES};

/// Settings consumed by the enrichment core.
///
/// Passed explicitly into constructors; nothing reads ambient state except
/// [`Config::apply_env`].
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Index cache root; caching is disabled when unset
    #[serde(alias = "BALLTREE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,
    /// Outlier filter applied downstream of enrichment
    #[serde(alias = "MAX_MILE_RANGE")]
    pub max_mile_range: Option<f64>,
    #[serde(alias = "EARTH_RADIUS_MILES")]
    pub earth_radius_miles: f64,
    pub leaf_size: usize,
    /// JSON file persisting resolved city-center coordinates
    #[serde(alias = "CITY_CENTER_CACHE_FILE")]
    pub coordinate_cache: Option<PathBuf>,
    /// JSON file persisting fetched landmarks per city
    #[serde(alias = "LANDMARKS_CACHE_FILE")]
    pub landmark_cache: Option<PathBuf>,
    pub geocoder: GeocoderConfig,
    pub overpass: OverpassConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeocoderConfig {
    pub endpoint: String,
    pub user_agent: String,
    /// Appended to every lookup, e.g. "USA"
    pub country: Option<String>,
    pub request_delay_ms: u64,
    pub timeout_secs: u64,
}

/// Overpass API settings for landmark lookups.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OverpassConfig {
    /// Interpreter URLs, used in turn
    pub endpoints: Vec<String>,
    pub user_agent: String,
    /// OSM tag keys whose nodes count as landmarks
    pub tags: Vec<String>,
    pub request_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_mile_range: None,
            earth_radius_miles: EARTH_RADIUS_MILES,
            leaf_size: BuildParams::default().leaf_size,
            coordinate_cache: Some(PathBuf::from("cache/city_centers_cache.json")),
            landmark_cache: Some(PathBuf::from("cache/landmarks_cache.json")),
            geocoder: GeocoderConfig::default(),
            overpass: OverpassConfig::default(),
        }
    }
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://nominatim.openstreetmap.org/search".to_string(),
            user_agent: "landmark-distance/0.1".to_string(),
            country: Some("USA".to_string()),
            request_delay_ms: 1000,
            timeout_secs: 30,
        }
    }
}

impl Default for OverpassConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["https://overpass-api.de/api/interpreter".to_string()],
            user_agent: "landmark-distance/0.1".to_string(),
            tags: ["tourism", "amenity", "historic", "leisure"]
                .into_iter()
                .map(String::from)
                .collect(),
            request_delay_ms: 1100,
            timeout_secs: 40,
        }
    }
}

impl OverpassConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GeocoderConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Override settings from `BALLTREE_CACHE_DIR` and `MAX_MILE_RANGE`.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(
            std::env::var("BALLTREE_CACHE_DIR").ok(),
            std::env::var("MAX_MILE_RANGE").ok(),
        )
    }

    fn apply_overrides(&mut self, cache_dir: Option<String>, max_range: Option<String>) -> Result<()> {
        if let Some(dir) = cache_dir.filter(|d| !d.trim().is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = max_range.filter(|r| !r.trim().is_empty()) {
            let value: f64 = raw
                .trim()
                .parse()
                .with_context(|| format!("MAX_MILE_RANGE is not a number: {}", raw))?;
            self.max_mile_range = Some(value);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.earth_radius_miles.is_finite() && self.earth_radius_miles > 0.0) {
            bail!("earth_radius_miles must be positive");
        }
        if self.leaf_size == 0 {
            bail!("leaf_size must be at least 1");
        }
        if self.overpass.endpoints.is_empty() {
            bail!("overpass.endpoints must list at least one URL");
        }
        if let Some(range) = self.max_mile_range {
            if !(range.is_finite() && range >= 0.0) {
                bail!("max_mile_range must be a non-negative number");
            }
        }
        Ok(())
    }

    pub fn build_params(&self) -> BuildParams {
        BuildParams {
            leaf_size: self.leaf_size,
            earth_radius_miles: self.earth_radius_miles,
        }
    }
}
