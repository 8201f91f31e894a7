//! Snapshot readers: locate the data and metadata tables of an export and
//! turn `;`-delimited rows into [`SourceRecord`]s.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use poisync_core::{text_or_none, SourceRecord};
use poisync_storage::{ArchiveStore, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;
use zip::ZipArchive;

pub const CRATE_NAME: &str = "poisync-adapters";

pub const DEFAULT_SOURCE_ID: &str = "banco";

/// Latest WGS84 CSV export of the Base Nationale des Commerces Ouverte.
pub const DEFAULT_SNAPSHOT_URL: &str =
    "https://www.data.gouv.fr/fr/datasets/r/3d612ad7-f726-4fe5-a353-bdf76c5a44c2";

const DATA_TABLE_SUFFIX: &str = "data.csv";
const METADATA_TABLE_SUFFIX: &str = "metadata.csv";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("snapshot has no {0} table")]
    MissingTable(&'static str),
    #[error("snapshot is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{table} is not valid UTF-8: {source}")]
    Encoding {
        table: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
    #[error("malformed delimited text: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid snapshot archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("snapshot download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Whole-dataset metadata. The declared date stays raw text: deciding whether
/// it is usable belongs to the staleness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub declared_update: Option<String>,
}

/// A snapshot whose metadata can be inspected without reading the data table.
pub trait SnapshotReader: Send + Sync {
    fn label(&self) -> &str;
    fn metadata(&self) -> Result<SnapshotMetadata, AdapterError>;
    fn records(&self) -> Result<Vec<SourceRecord>, AdapterError>;
}

/// Source column names for each [`SourceRecord`] field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub identity: String,
    pub name: String,
    pub brand: String,
    pub longitude: String,
    pub latitude: String,
    pub category_tags: String,
    pub address_line: String,
    pub city: String,
    pub opening_hours: String,
    pub last_modified: String,
    pub metadata_update_date: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            identity: "osm_id".into(),
            name: "name".into(),
            brand: "brand".into(),
            longitude: "X".into(),
            latitude: "Y".into(),
            category_tags: "type".into(),
            address_line: "address".into(),
            city: "com_nom".into(),
            opening_hours: "opening_hours".into(),
            last_modified: "last_update".into(),
            metadata_update_date: "DATE_MAJ".into(),
        }
    }
}

impl ColumnMap {
    fn required(&self) -> [&str; 5] {
        [
            &self.name,
            &self.longitude,
            &self.latitude,
            &self.category_tags,
            &self.last_modified,
        ]
    }
}

/// Column positions resolved against one header row.
struct HeaderIndex {
    identity: Option<usize>,
    name: usize,
    brand: Option<usize>,
    longitude: usize,
    latitude: usize,
    category_tags: usize,
    address_line: Option<usize>,
    city: Option<usize>,
    opening_hours: Option<usize>,
    last_modified: usize,
}

impl HeaderIndex {
    fn resolve(headers: &StringRecord, columns: &ColumnMap) -> Result<Self, AdapterError> {
        let missing = columns
            .required()
            .into_iter()
            .filter(|name| column_position(headers, name).is_none())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(AdapterError::MissingColumns(missing));
        }

        let required = |name: &String| {
            column_position(headers, name)
                .ok_or_else(|| AdapterError::MissingColumns(vec![name.clone()]))
        };
        Ok(Self {
            identity: column_position(headers, &columns.identity),
            name: required(&columns.name)?,
            brand: column_position(headers, &columns.brand),
            longitude: required(&columns.longitude)?,
            latitude: required(&columns.latitude)?,
            category_tags: required(&columns.category_tags)?,
            address_line: column_position(headers, &columns.address_line),
            city: column_position(headers, &columns.city),
            opening_hours: column_position(headers, &columns.opening_hours),
            last_modified: required(&columns.last_modified)?,
        })
    }

    fn record(&self, row: &StringRecord) -> SourceRecord {
        let cell = |idx: Option<usize>| {
            idx.and_then(|i| row.get(i))
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
        };
        SourceRecord {
            identity: cell(self.identity),
            name: cell(Some(self.name)),
            brand: cell(self.brand),
            longitude: parse_coordinate(row.get(self.longitude)),
            latitude: parse_coordinate(row.get(self.latitude)),
            category_tags: cell(Some(self.category_tags)),
            address_line: cell(self.address_line),
            city: cell(self.city),
            opening_hours: cell(self.opening_hours),
            last_modified: cell(Some(self.last_modified)),
        }
    }
}

fn column_position(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

/// Unparsable cells become `None`; non-finite values are kept for the
/// resolver to reject.
fn parse_coordinate(cell: Option<&str>) -> Option<f64> {
    cell.map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<f64>().ok())
}

fn delimited_reader(text: &str) -> csv::Reader<&[u8]> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_reader(text.as_bytes())
}

pub fn parse_metadata(text: &str, columns: &ColumnMap) -> Result<SnapshotMetadata, AdapterError> {
    let mut reader = delimited_reader(text);
    let headers = reader.headers()?.clone();
    let Some(idx) = column_position(&headers, &columns.metadata_update_date) else {
        return Ok(SnapshotMetadata {
            declared_update: None,
        });
    };
    let first = reader.records().next().transpose()?;
    Ok(SnapshotMetadata {
        declared_update: first.and_then(|row| text_or_none(row.get(idx))),
    })
}

pub fn parse_records(text: &str, columns: &ColumnMap) -> Result<Vec<SourceRecord>, AdapterError> {
    let mut reader = delimited_reader(text);
    let headers = reader.headers()?.clone();
    let index = HeaderIndex::resolve(&headers, columns)?;
    reader
        .records()
        .map(|row| -> Result<SourceRecord, AdapterError> { Ok(index.record(&row?)) })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Data,
    Metadata,
}

fn classify_table(name: &str) -> Option<Table> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(METADATA_TABLE_SUFFIX) {
        Some(Table::Metadata)
    } else if lower.ends_with(DATA_TABLE_SUFFIX) {
        Some(Table::Data)
    } else {
        None
    }
}

/// A snapshot held as raw text; data rows are parsed only on [`SnapshotReader::records`].
#[derive(Debug, Clone)]
pub struct CsvSnapshot {
    label: String,
    metadata_text: String,
    data_text: String,
    columns: ColumnMap,
}

impl CsvSnapshot {
    pub fn from_parts(
        label: impl Into<String>,
        metadata_text: impl Into<String>,
        data_text: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            metadata_text: metadata_text.into(),
            data_text: data_text.into(),
            columns: ColumnMap::default(),
        }
    }

    pub fn with_columns(mut self, columns: ColumnMap) -> Self {
        self.columns = columns;
        self
    }

    /// Reads an already extracted export: one file ending in `metadata.csv`
    /// and one ending in `data.csv`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|source| AdapterError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| AdapterError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            paths.push(entry.path());
        }
        // read_dir order is unspecified; the first name in sorted order wins
        paths.sort();

        let mut metadata = None;
        let mut data = None;
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match classify_table(&name) {
                Some(Table::Metadata) if metadata.is_none() => {
                    metadata = Some(read_text_file(&path)?)
                }
                Some(Table::Data) if data.is_none() => data = Some(read_text_file(&path)?),
                _ => {}
            }
        }

        Ok(Self::from_parts(
            dir.display().to_string(),
            metadata.ok_or(AdapterError::MissingTable("metadata"))?,
            data.ok_or(AdapterError::MissingTable("data"))?,
        ))
    }

    pub fn from_archive_file(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| AdapterError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_zip_bytes(&bytes)?.with_label(path.display().to_string()))
    }

    pub fn from_zip_bytes(bytes: &[u8]) -> Result<Self, AdapterError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut metadata = None;
        let mut data = None;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().to_string();
            let table = match classify_table(&name) {
                Some(Table::Metadata) if metadata.is_none() => Table::Metadata,
                Some(Table::Data) if data.is_none() => Table::Data,
                _ => continue,
            };
            let mut raw = Vec::new();
            entry
                .read_to_end(&mut raw)
                .map_err(|source| AdapterError::Io {
                    path: name.clone(),
                    source,
                })?;
            let text = decode_table(name, raw)?;
            match table {
                Table::Metadata => metadata = Some(text),
                Table::Data => data = Some(text),
            }
        }

        Ok(Self::from_parts(
            "archive",
            metadata.ok_or(AdapterError::MissingTable("metadata"))?,
            data.ok_or(AdapterError::MissingTable("data"))?,
        ))
    }

    fn with_label(mut self, label: String) -> Self {
        self.label = label;
        self
    }
}

fn read_text_file(path: &PathBuf) -> Result<String, AdapterError> {
    let raw = fs::read(path).map_err(|source| AdapterError::Io {
        path: path.display().to_string(),
        source,
    })?;
    decode_table(path.display().to_string(), raw)
}

/// Exports are UTF-8; anything else is rejected rather than patched with
/// replacement characters that would leak into names and identity keys.
fn decode_table(table: String, raw: Vec<u8>) -> Result<String, AdapterError> {
    String::from_utf8(raw).map_err(|source| AdapterError::Encoding { table, source })
}

impl SnapshotReader for CsvSnapshot {
    fn label(&self) -> &str {
        &self.label
    }

    fn metadata(&self) -> Result<SnapshotMetadata, AdapterError> {
        parse_metadata(&self.metadata_text, &self.columns)
    }

    fn records(&self) -> Result<Vec<SourceRecord>, AdapterError> {
        parse_records(&self.data_text, &self.columns)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub source_id: String,
}

/// Downloads the export archive, keeps an immutable copy and opens it.
pub async fn download_snapshot(
    http: &HttpFetcher,
    archives: &ArchiveStore,
    ctx: &FetchContext,
    url: &str,
) -> Result<CsvSnapshot, AdapterError> {
    let response = http.fetch_bytes(ctx.run_id, url).await?;
    let stored = archives
        .store_bytes(ctx.fetched_at, &ctx.source_id, "zip", &response.body)
        .await?;
    info!(
        run_id = %ctx.run_id,
        bytes = stored.byte_size,
        sha256 = %stored.content_hash,
        already_seen = stored.deduplicated,
        path = %stored.absolute_path.display(),
        "snapshot archive stored"
    );
    Ok(CsvSnapshot::from_zip_bytes(&response.body)?
        .with_label(stored.absolute_path.display().to_string()))
}
