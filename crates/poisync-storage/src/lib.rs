//! Destination document store, snapshot archive storage and HTTP fetch utilities.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poisync_core::{DocumentBody, DocumentUpsert, TargetDocument};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "poisync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("destination connection failed: {0}")]
    Connection(String),
    #[error("destination query failed: {0}")]
    Query(String),
    #[error("stored document {key} is unreadable: {message}")]
    Corrupt { key: String, message: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

/// A single rejected operation inside an unordered batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteFailure {
    pub identity_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchWriteReport {
    pub attempted: usize,
    pub applied: usize,
    pub failures: Vec<WriteFailure>,
}

impl BatchWriteReport {
    pub fn is_partial_failure(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Destination collection keyed uniquely by identity key.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Maximum `updated_at` across the collection; `None` when empty.
    async fn latest_updated_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn find_by_key(&self, identity_key: &str) -> Result<Option<TargetDocument>, StoreError>;

    /// Fetches every existing document for `keys` in one round trip.
    async fn find_by_keys(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, TargetDocument>, StoreError>;

    /// Applies each upsert independently; one rejected operation never blocks
    /// the others. `Err` is reserved for failures of the batch as a whole.
    async fn upsert_unordered(&self, ops: &[DocumentUpsert]) -> Result<BatchWriteReport, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

/// In-process collection; honours the same write-once and recency rules as Postgres.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<BTreeMap<String, TargetDocument>>,
    rejected: Mutex<HashMap<String, String>>,
    lookups: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(docs: impl IntoIterator<Item = TargetDocument>) -> Self {
        let docs = docs
            .into_iter()
            .map(|doc| (doc.identity_key.clone(), doc))
            .collect();
        Self {
            docs: Mutex::new(docs),
            ..Self::default()
        }
    }

    /// Makes every future write for `identity_key` fail with `reason`.
    pub async fn reject_key(&self, identity_key: impl Into<String>, reason: impl Into<String>) {
        self.rejected
            .lock()
            .await
            .insert(identity_key.into(), reason.into());
    }

    pub async fn get(&self, identity_key: &str) -> Option<TargetDocument> {
        self.docs.lock().await.get(identity_key).cloned()
    }

    pub async fn documents(&self) -> Vec<TargetDocument> {
        self.docs.lock().await.values().cloned().collect()
    }

    /// Number of key lookups served (single or batched calls count once).
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of operations that reached the collection.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn latest_updated_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.docs.lock().await.values().map(|d| d.updated_at).max())
    }

    async fn find_by_key(&self, identity_key: &str) -> Result<Option<TargetDocument>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.docs.lock().await.get(identity_key).cloned())
    }

    async fn find_by_keys(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, TargetDocument>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let docs = self.docs.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| docs.get(key).map(|doc| (key.clone(), doc.clone())))
            .collect())
    }

    async fn upsert_unordered(&self, ops: &[DocumentUpsert]) -> Result<BatchWriteReport, StoreError> {
        let rejected = self.rejected.lock().await.clone();
        let mut docs = self.docs.lock().await;
        let mut report = BatchWriteReport {
            attempted: ops.len(),
            ..Default::default()
        };

        for op in ops {
            if let Some(reason) = rejected.get(&op.identity_key) {
                report.failures.push(WriteFailure {
                    identity_key: op.identity_key.clone(),
                    reason: reason.clone(),
                });
                continue;
            }
            let existing = docs.get(&op.identity_key);
            // updated_at never moves backwards for a key
            if existing.is_some_and(|doc| doc.updated_at > op.updated_at) {
                report.applied += 1;
                continue;
            }
            let merged = op.apply_to(existing);
            docs.insert(op.identity_key.clone(), merged);
            self.writes.fetch_add(1, Ordering::SeqCst);
            report.applied += 1;
        }

        Ok(report)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.docs.lock().await.len() as u64)
    }
}

const UPSERT_SQL: &str = r#"
    INSERT INTO stores (identity_key, document, created_at, updated_at)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (identity_key) DO UPDATE
       SET document = EXCLUDED.document,
           updated_at = EXCLUDED.updated_at
     WHERE stores.updated_at <= EXCLUDED.updated_at
"#;

/// PostgreSQL-backed collection: one JSONB document per identity key.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Connection(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `stores` table, its unique key and the recency index.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Query(format!("running migrations: {err}")))
    }
}

fn row_to_document(row: &PgRow) -> Result<TargetDocument, StoreError> {
    let identity_key: String = row.try_get("identity_key")?;
    let body: Json<DocumentBody> = row.try_get("document").map_err(|err| StoreError::Corrupt {
        key: identity_key.clone(),
        message: err.to_string(),
    })?;
    Ok(TargetDocument {
        identity_key,
        body: body.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn latest_updated_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT MAX(updated_at) AS latest FROM stores")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("latest")?)
    }

    async fn find_by_key(&self, identity_key: &str) -> Result<Option<TargetDocument>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT identity_key, document, created_at, updated_at
              FROM stores
             WHERE identity_key = $1
            "#,
        )
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_by_keys(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, TargetDocument>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT identity_key, document, created_at, updated_at
              FROM stores
             WHERE identity_key = ANY($1)
            "#,
        )
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let doc = row_to_document(row)?;
            out.insert(doc.identity_key.clone(), doc);
        }
        Ok(out)
    }

    async fn upsert_unordered(&self, ops: &[DocumentUpsert]) -> Result<BatchWriteReport, StoreError> {
        let mut report = BatchWriteReport {
            attempted: ops.len(),
            ..Default::default()
        };

        for op in ops {
            let result = sqlx::query(UPSERT_SQL)
                .bind(&op.identity_key)
                .bind(Json(&op.body))
                .bind(op.created_at.unwrap_or(op.updated_at))
                .bind(op.updated_at)
                .execute(&self.pool)
                .await;

            match result {
                Ok(done) => {
                    if done.rows_affected() == 0 {
                        debug!(identity_key = %op.identity_key, "upsert skipped by recency guard");
                    }
                    report.applied += 1;
                }
                // a dead pool fails the whole batch rather than every op in turn
                Err(err @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed)) => {
                    return Err(StoreError::Connection(err.to_string()));
                }
                Err(err) => report.failures.push(WriteFailure {
                    identity_key: op.identity_key.clone(),
                    reason: err.to_string(),
                }),
            }
        }

        Ok(report)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM stores")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct StoredArchive {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed storage for downloaded snapshot archives.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn archive_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim_start_matches('.').trim() {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Writes through a temp file and rename so a crashed run never leaves a
    /// truncated archive under its final name.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArchive> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.archive_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let stored = |deduplicated| StoredArchive {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// Whether a failed snapshot download attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadRetry {
    Retry,
    GiveUp,
}

/// A missing or forbidden export will not appear by asking again; overload
/// and gateway errors from the open-data portal usually clear up.
pub fn retry_for_status(status: StatusCode) -> DownloadRetry {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => DownloadRetry::Retry,
        s if s.is_server_error() => DownloadRetry::Retry,
        _ => DownloadRetry::GiveUp,
    }
}

/// Connection drops and timeouts are retried, including a body cut short
/// halfway through a large archive.
pub fn retry_for_transport(err: &reqwest::Error) -> DownloadRetry {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        DownloadRetry::Retry
    } else {
        DownloadRetry::GiveUp
    }
}

/// `Retry-After` given in seconds; HTTP-date values are ignored.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Doubling delay per attempt; a server-provided hint replaces it. Both
    /// are capped by `max_delay`.
    pub fn delay_before_retry(&self, attempt: usize, hint: Option<Duration>) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX));
        hint.unwrap_or(doubled).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    /// Number of requests it took, including the successful one.
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempt(s): {source}")]
    Request {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
}

/// Downloads snapshot archives with retry on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_with_retry(url)
            .instrument(info_span!("snapshot_fetch", %run_id, url))
            .await
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let attempts = attempt + 1;
            let can_retry = attempt < self.backoff.max_retries;
            let hint = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    match resp.bytes().await {
                        Ok(body) => {
                            debug!(attempts, bytes = body.len(), "snapshot downloaded");
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body: body.to_vec(),
                                attempts,
                            });
                        }
                        Err(source) => {
                            if !(can_retry && retry_for_transport(&source) == DownloadRetry::Retry) {
                                return Err(FetchError::Request { attempts, source });
                            }
                            warn!(attempt, error = %source, "snapshot body interrupted, retrying");
                            None
                        }
                    }
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !(can_retry && retry_for_status(status) == DownloadRetry::Retry) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                            attempts,
                        });
                    }
                    warn!(attempt, status = status.as_u16(), "snapshot download refused, retrying");
                    retry_after(resp.headers())
                }
                Err(source) => {
                    if !(can_retry && retry_for_transport(&source) == DownloadRetry::Retry) {
                        return Err(FetchError::Request { attempts, source });
                    }
                    warn!(attempt, error = %source, "snapshot download failed, retrying");
                    None
                }
            };
            tokio::time::sleep(self.backoff.delay_before_retry(attempt, hint)).await;
            attempt += 1;
        }
    }
}
