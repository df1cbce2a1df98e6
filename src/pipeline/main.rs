//! Listing enrichment pipeline.
//!
//! Reads apartment listings, resolves city centers and landmarks, and writes
//! the dataset back out with nearest city-center and landmark distances.

mod dataset;

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use landmark_distance::enrich::{CancelToken, References};
use landmark_distance::geocode::{CoordinateStore, LandmarkStore, NominatimGeocoder, OverpassClient};
use landmark_distance::{Config, Enricher, Scope};

use crate::dataset::{read_listings, write_enriched};

#[derive(Parser, Debug)]
#[command(name = "enrich")]
#[command(about = "Add nearest city-center and landmark distances to listings")]
struct Args {
    /// TOML config file (optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listings CSV
    #[arg(short, long)]
    input: PathBuf,

    /// Landmark cache JSON keyed by "City, ST" (overrides the config)
    #[arg(long)]
    landmarks: Option<PathBuf>,

    /// Output CSV
    #[arg(short, long)]
    output: PathBuf,

    /// Use cached city centers and landmarks only
    #[arg(long)]
    offline: bool,

    /// Retry cities whose lookups failed on a previous run
    #[arg(long)]
    retry_failed: bool,

    /// Remove cache entries not used by this run
    #[arg(long)]
    prune_cache: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    config.apply_env()?;

    let dataset = read_listings(&args.input)?;

    let cities: BTreeSet<(String, String)> = dataset
        .listings
        .iter()
        .map(|l| (l.cityname.clone(), l.state.clone()))
        .collect();
    let city_keys: BTreeSet<String> = dataset.listings.iter().map(|l| l.city_key()).collect();
    info!("{} distinct cities in dataset", city_keys.len());

    // City centers
    let mut store = match &config.coordinate_cache {
        Some(path) => CoordinateStore::load(path).context("Failed to load coordinate cache")?,
        None => CoordinateStore::new(),
    };
    if args.retry_failed {
        let forgotten = store.forget_failures();
        info!("Retrying {} previously failed lookups", forgotten);
    }
    if args.offline {
        info!("Offline mode: using {} cached coordinates", store.len());
    } else {
        let geocoder = NominatimGeocoder::new(&config.geocoder)?;
        let resolved = store.resolve_all(&geocoder, city_keys.iter().cloned()).await;
        info!(
            "Geocoding: {} resolved, {} cached, {} failed",
            resolved.resolved,
            resolved.cached,
            resolved.failures.len()
        );
        if let Some(path) = &config.coordinate_cache {
            store.save(path).context("Failed to save coordinate cache")?;
        }
    }

    // Landmarks
    let landmark_cache = args.landmarks.clone().or_else(|| config.landmark_cache.clone());
    let mut landmark_store = match &landmark_cache {
        Some(path) => LandmarkStore::load(path).context("Failed to load landmark cache")?,
        None => LandmarkStore::new(),
    };
    if args.retry_failed {
        let forgotten = landmark_store.forget_empty();
        info!("Refetching landmarks for {} cities", forgotten);
    }
    if !args.offline {
        let overpass = OverpassClient::new(&config.overpass)?;
        let fetched = landmark_store.fetch_all(&overpass, cities.iter().cloned()).await;
        info!(
            "Landmarks: {} fetched, {} cached, {} failed",
            fetched.fetched,
            fetched.cached,
            fetched.failures.len()
        );
        if let Some(path) = &landmark_cache {
            landmark_store.save(path).context("Failed to save landmark cache")?;
        }
    }
    let landmarks = landmark_store.reference_sets();

    let (city_centers, unresolved) = store
        .reference_set(Scope::Global, city_keys.iter().map(String::as_str))
        .context("No city centers could be resolved")?;
    if !unresolved.is_empty() {
        warn!("{} cities have no center coordinates", unresolved.len());
    }
    let unresolved: HashSet<String> = unresolved.into_iter().collect();

    // Enrichment
    let enricher = Arc::new(Enricher::new(&config)?);
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing current cities");
                cancel.cancel();
            }
        });
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.set_message(format!("Enriching {} listings", dataset.listings.len()));
    pb.enable_steady_tick(Duration::from_millis(120));

    let listings = dataset.listings.clone();
    let landmark_fingerprints: Vec<_> = landmarks.values().map(|set| set.fingerprint()).collect();
    let city_center_fingerprint = city_centers.fingerprint();
    let enrichment = {
        let enricher = Arc::clone(&enricher);
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let refs = References {
                city_centers: &city_centers,
                landmarks_by_city: &landmarks,
                unresolved_cities: &unresolved,
            };
            enricher.enrich_with(&listings, &refs, &cancel)
        })
        .await
        .context("Enrichment task panicked")?
    };
    pb.finish_with_message("Enrichment done");

    enrichment.report.log_summary();

    if args.prune_cache {
        if enrichment.report.was_cancelled() {
            warn!("Skipping cache prune after interrupted run");
        } else {
            let keep: HashSet<_> = std::iter::once(city_center_fingerprint)
                .chain(landmark_fingerprints)
                .collect();
            let removed = enricher.cache().prune(&keep)?;
            info!("Pruned {} cache entries", removed);
        }
    }

    let written = match config.max_mile_range {
        Some(max) => write_enriched(&args.output, &dataset, &enrichment.rows, |row| row.within_range(max))?,
        None => write_enriched(&args.output, &dataset, &enrichment.rows, |_| true)?,
    };
    if let Some(max) = config.max_mile_range {
        info!(
            "Kept {} of {} rows within {} miles",
            written,
            enrichment.rows.len(),
            max
        );
    }

    Ok(())
}
