//! CSV adapter for listings.

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::fs::File;
use std::path::Path;
use tracing::info;

use landmark_distance::models::{EnrichedListing, Listing};

/// Raw CSV rows with the parsed listings alongside, same order.
pub struct Dataset {
    pub headers: StringRecord,
    pub records: Vec<StringRecord>,
    pub listings: Vec<Listing>,
}

struct Columns {
    id: Option<usize>,
    cityname: usize,
    state: usize,
    latitude: usize,
    longitude: usize,
    price: Option<usize>,
    date: Option<usize>,
}

impl Columns {
    fn locate(headers: &StringRecord) -> Result<Self> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        let require = |name: &str| find(name).with_context(|| format!("Column '{}' not found", name));
        Ok(Self {
            id: find("id"),
            cityname: require("cityname")?,
            state: require("state")?,
            latitude: require("latitude")?,
            longitude: require("longitude")?,
            price: find("price"),
            date: find("date"),
        })
    }
}

fn parse_number(record: &StringRecord, idx: usize) -> Option<f64> {
    record.get(idx).and_then(|v| v.trim().parse::<f64>().ok())
}

pub fn read_listings(path: &Path) -> Result<Dataset> {
    info!("Loading listings from {}", path.display());
    let file = File::open(path).context("Failed to open input dataset")?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

    let headers = reader.headers()?.clone();
    let columns = Columns::locate(&headers)?;

    let mut records = Vec::new();
    let mut listings = Vec::new();
    for (row, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Malformed CSV row {}", row + 1))?;
        let field = |idx: usize| record.get(idx).unwrap_or("").trim().to_string();

        let listing = Listing {
            id: columns.id.map(field).unwrap_or_else(|| row.to_string()),
            cityname: field(columns.cityname),
            state: field(columns.state),
            latitude: parse_number(&record, columns.latitude),
            longitude: parse_number(&record, columns.longitude),
            price: columns.price.and_then(|idx| parse_number(&record, idx)),
            date: columns.date.map(field).filter(|d| !d.is_empty()),
        };
        listings.push(listing);
        records.push(record);
    }

    info!("Loaded {} listings", listings.len());
    Ok(Dataset {
        headers,
        records,
        listings,
    })
}

/// Write the input columns plus the distance columns for rows passing `keep`.
pub fn write_enriched<F>(path: &Path, dataset: &Dataset, rows: &[EnrichedListing], keep: F) -> Result<usize>
where
    F: Fn(&EnrichedListing) -> bool,
{
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut headers = dataset.headers.clone();
    headers.push_field("dist_to_city_center");
    headers.push_field("dist_to_landmark");
    headers.push_field("nearest_landmark");
    writer.write_record(&headers)?;

    let format_distance = |d: Option<f64>| d.map(|v| format!("{:.6}", v)).unwrap_or_default();

    let mut written = 0;
    for (record, row) in dataset.records.iter().zip(rows) {
        if !keep(row) {
            continue;
        }
        let mut out = record.clone();
        out.push_field(&format_distance(row.dist_to_city_center));
        out.push_field(&format_distance(row.dist_to_landmark));
        out.push_field(row.nearest_landmark.as_deref().unwrap_or(""));
        writer.write_record(&out)?;
        written += 1;
    }
    writer.flush()?;

    info!("Wrote {} rows to {}", written, path.display());
    Ok(written)
}
