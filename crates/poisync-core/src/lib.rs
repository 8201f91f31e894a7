//! Core domain model for POI snapshot reconciliation.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "poisync-core";

/// Name stored when a record carries neither a usable name nor a brand.
pub const UNNAMED: &str = "Unnamed";

/// Calendar date layout used by both the snapshot metadata and per-row dates.
pub const CALENDAR_DATE_FORMAT: &str = "%Y-%m-%d";

/// One row of a snapshot, exactly as read. Empty cells are `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceRecord {
    pub identity: Option<String>,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub category_tags: Option<String>,
    pub address_line: Option<String>,
    pub city: Option<String>,
    pub opening_hours: Option<String>,
    pub last_modified: Option<String>,
}

impl SourceRecord {
    /// `(longitude, latitude)` when both components are present and finite.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.longitude, self.latitude) {
            (Some(lon), Some(lat)) if lon.is_finite() && lat.is_finite() => Some((lon, lat)),
            _ => None,
        }
    }

    pub fn last_modified_date(&self) -> Option<NaiveDate> {
        self.last_modified.as_deref().and_then(parse_calendar_date)
    }

    /// Display name: `name`, else `brand`, ignoring whitespace-only values.
    pub fn display_name(&self) -> Option<String> {
        text_or_none(self.name.as_deref()).or_else(|| text_or_none(self.brand.as_deref()))
    }

    pub fn external_id(&self) -> Option<String> {
        text_or_none(self.identity.as_deref())
    }

    pub fn categories(&self) -> BTreeSet<String> {
        normalize_tags(self.category_tags.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
}

/// GeoJSON point; coordinates are `[longitude, latitude]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(rename = "type")]
    pub geometry_type: String,
    pub coordinates: [f64; 2],
}

impl GeoPoint {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            geometry_type: "Point".to_string(),
            coordinates: [longitude, latitude],
        }
    }

    pub fn longitude(&self) -> f64 {
        self.coordinates[0]
    }

    pub fn latitude(&self) -> f64 {
        self.coordinates[1]
    }
}

/// Persisted document fields that are replaced wholesale on every accepted write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBody {
    pub name: String,
    pub address: Address,
    pub location: GeoPoint,
    pub categories: BTreeSet<String>,
    pub opening_hours: String,
}

/// A document as held by the destination collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDocument {
    pub identity_key: String,
    #[serde(flatten)]
    pub body: DocumentBody,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Keyed "set these fields, create if absent" write intent.
///
/// `created_at` is only carried for keys with no stored document; stores must
/// never overwrite an existing `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpsert {
    pub identity_key: String,
    #[serde(flatten)]
    pub body: DocumentBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentUpsert {
    /// Applies this intent on top of the currently stored document, if any.
    pub fn apply_to(&self, existing: Option<&TargetDocument>) -> TargetDocument {
        let created_at = existing
            .map(|doc| doc.created_at)
            .or(self.created_at)
            .unwrap_or(self.updated_at);
        TargetDocument {
            identity_key: self.identity_key.clone(),
            body: self.body.clone(),
            created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Skip,
    FullImport,
    IncrementalImport,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Skip => "skip",
            SyncMode::FullImport => "full_import",
            SyncMode::IncrementalImport => "incremental_import",
        }
    }
}

/// How the identity key of a record is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityStrategy {
    /// External identifier when present, otherwise the coordinate + name composite.
    #[default]
    ExternalId,
    /// Always the coordinate + name composite.
    Composite,
}

impl IdentityStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "external-id" | "external_id" | "id" => Some(Self::ExternalId),
            "composite" | "name-coordinates" => Some(Self::Composite),
            _ => None,
        }
    }
}

/// Stable destination key for a record, or `None` when it cannot be determined.
pub fn identity_key(record: &SourceRecord, strategy: IdentityStrategy) -> Option<String> {
    if strategy == IdentityStrategy::ExternalId {
        if let Some(id) = record.external_id() {
            return Some(id);
        }
    }
    let (lon, lat) = record.coordinates()?;
    let name = record.display_name()?;
    Some(composite_key(&name, lon, lat))
}

/// Coordinates are rounded to six decimals (about 10cm) so that re-exports
/// with jittered float formatting still collapse to one key.
pub fn composite_key(name: &str, longitude: f64, latitude: f64) -> String {
    format!(
        "geo:{:.6},{:.6}:{}",
        round_coordinate(longitude),
        round_coordinate(latitude),
        normalize_name(name)
    )
}

/// Rounded to six decimals with negative zero folded into zero, so points
/// on either side of the meridian or equator share one key.
fn round_coordinate(value: f64) -> f64 {
    let rounded = (value * 1e6).round() / 1e6;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

pub fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trimmed text, with whitespace-only input treated as absent.
pub fn text_or_none(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Lower-cased, trimmed, `;`-split tag set. Absent or blank input yields an empty set.
pub fn normalize_tags(raw: Option<&str>) -> BTreeSet<String> {
    raw.unwrap_or_default()
        .to_lowercase()
        .split(';')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn parse_calendar_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), CALENDAR_DATE_FORMAT).ok()
}

/// Midnight UTC of a calendar date; source dates carry no time of day.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))
}

/// Source of "current processing time" for timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
