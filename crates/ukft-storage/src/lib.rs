//! Aggregate database persistence, individual record files and the rate-limited fetch client.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use ukft_core::{is_valid, record_key, FundingDatabase, FundingOpportunity};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ukft-storage";

pub const DATABASE_FILE_NAME: &str = "funding_database.json";
pub const INDIVIDUAL_RECORDS_DIR: &str = "individual_fundings";

/// Kept below the common 255-byte file name limit.
pub const MAX_RECORD_FILE_NAME_BYTES: usize = 240;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} has no file name", path.display())]
    NoFileName { path: PathBuf },
}

impl PersistenceError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == ErrorKind::NotFound)
    }
}

/// Serialize `value` as pretty JSON into a sibling temp file, then rename it over `path`.
/// On failure the temp file is removed and whatever was at `path` is left as it was.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), PersistenceError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)
        .map_err(|e| PersistenceError::io("creating directory", &parent, e))?;

    let bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;

    if path.file_name().is_none() {
        return Err(PersistenceError::NoFileName {
            path: path.to_path_buf(),
        });
    }
    // Independent of the target name so long record names still fit.
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let written = File::options()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .map_err(|e| PersistenceError::io("opening temp file", &temp_path, e))
        .and_then(|mut file| {
            file.write_all(&bytes)
                .and_then(|()| file.sync_all())
                .map_err(|e| PersistenceError::io("writing temp file", &temp_path, e))
        });
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(PersistenceError::io("renaming temp file onto", path, err));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub added: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

/// Appends valid records whose id is not yet stored, in input order.
///
/// Stored records are never replaced: a record whose id is already present (or
/// appeared earlier in the same batch) is skipped.
pub fn merge_records(
    mut database: FundingDatabase,
    records: &[JsonValue],
    now: DateTime<Utc>,
) -> (FundingDatabase, MergeStats) {
    let mut ids = database.ids();
    let mut stats = MergeStats::default();

    for record in records {
        if !is_valid(record) {
            stats.invalid += 1;
            continue;
        }
        let Some(id) = record_key(record) else {
            warn!("skipping funding record with null id");
            stats.invalid += 1;
            continue;
        };
        if ids.contains(&id) {
            debug!(record_id = %id, "already stored, skipping");
            stats.duplicates += 1;
            continue;
        }
        ids.insert(id);
        database.fundings.push(record.clone());
        stats.added += 1;
    }

    database.last_updated = now;
    database.total_fundings = database.fundings.len();
    (database, stats)
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub database: FundingDatabase,
    pub stats: MergeStats,
    pub persist_error: Option<PersistenceError>,
}

impl MergeOutcome {
    pub fn succeeded(&self) -> bool {
        self.persist_error.is_none()
    }
}

/// The aggregate funding database file.
#[derive(Debug, Clone)]
pub struct DatabaseStore {
    path: PathBuf,
}

impl DatabaseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(DATABASE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Strict read; used by validation where a missing or corrupt store is a failure.
    pub fn read(&self) -> Result<FundingDatabase, PersistenceError> {
        let text = fs::read_to_string(&self.path)
            .map_err(|e| PersistenceError::io("reading", &self.path, e))?;
        serde_json::from_str(&text).map_err(|source| PersistenceError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Tolerant read: a missing or unreadable store is an empty database.
    pub fn load(&self, now: DateTime<Utc>) -> FundingDatabase {
        match self.read() {
            Ok(database) => database,
            Err(err) if err.is_not_found() => {
                info!(path = %self.path.display(), "no funding database yet, starting empty");
                FundingDatabase::empty(now)
            }
            Err(err) => {
                warn!(error = %err, "funding database unreadable, starting empty");
                FundingDatabase::empty(now)
            }
        }
    }

    pub fn persist(&self, database: &FundingDatabase) -> Result<(), PersistenceError> {
        write_json_atomic(&self.path, database)
    }

    /// Load, merge and persist. Never fails outright; check [`MergeOutcome::succeeded`].
    pub fn update(&self, records: &[JsonValue], now: DateTime<Utc>) -> MergeOutcome {
        let existing = self.load(now);
        let previous_total = existing.fundings.len();
        let (database, stats) = merge_records(existing, records, now);
        let persist_error = self.persist(&database).err();

        match &persist_error {
            None => info!(
                path = %self.path.display(),
                previous_total,
                added = stats.added,
                duplicates = stats.duplicates,
                invalid = stats.invalid,
                total = database.total_fundings,
                "funding database updated"
            ),
            Some(err) => error!(error = %err, "failed to persist funding database"),
        }

        MergeOutcome {
            database,
            stats,
            persist_error,
        }
    }
}

/// One JSON file per canonical record, named `{category}_{subcategory}_{id}.json`.
#[derive(Debug, Clone)]
pub struct RecordWriter {
    dir: PathBuf,
}

impl RecordWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(INDIVIDUAL_RECORDS_DIR))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capped at [`MAX_RECORD_FILE_NAME_BYTES`]; an over-long id loses slug bytes, never its hash.
    pub fn file_name_for(record: &FundingOpportunity) -> String {
        let sanitize = |part: &str| part.replace(['/', '\\'], "_");
        let prefix = format!(
            "{}_{}_",
            record.category.as_str(),
            sanitize(&record.subcategory)
        );
        let budget = MAX_RECORD_FILE_NAME_BYTES.saturating_sub(prefix.len() + ".json".len());
        format!("{prefix}{}.json", shorten_id(&sanitize(&record.id), budget))
    }

    pub fn write(&self, record: &FundingOpportunity) -> Result<PathBuf, PersistenceError> {
        let path = self.dir.join(Self::file_name_for(record));
        write_json_atomic(&path, record)?;
        Ok(path)
    }

    /// Removes record files last modified more than `days` before `now`.
    pub fn clean_older_than(&self, days: u64, now: SystemTime) -> Result<usize, PersistenceError> {
        let cutoff = now
            .checked_sub(Duration::from_secs(days.saturating_mul(24 * 60 * 60)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(PersistenceError::io("listing", &self.dir, err)),
        };

        let mut removed = 0usize;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified());
            match modified {
                Ok(modified) if modified < cutoff => match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => error!(path = %path.display(), error = %err, "failed to delete old record"),
                },
                Ok(_) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "no modification time"),
            }
        }
        info!(dir = %self.dir.display(), days, removed, "cleaned old record files");
        Ok(removed)
    }
}

fn shorten_id(id: &str, budget: usize) -> String {
    if id.len() <= budget {
        return id.to_string();
    }
    match id.rsplit_once('_') {
        Some((slug, hash)) if hash.len() + 1 < budget => {
            let keep = char_floor(slug, budget - hash.len() - 1);
            format!("{}_{hash}", slug[..keep].trim_end_matches('_'))
        }
        _ => id[..char_floor(id, budget)].to_string(),
    }
}

fn char_floor(s: &str, max: usize) -> usize {
    (0..=max.min(s.len()))
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Throttling, request timeouts and server errors are worth another attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RetryDisposition::Retryable,
        other if other.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Transport failures (connect, timeout, interrupted body) are retried; redirect and decode errors are not.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    let transport = err.is_timeout() || err.is_connect() || err.is_request() || err.is_body();
    if transport {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
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
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Sustained `requests` per minute with bursts of the same size.
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            capacity: requests,
            refill_every: Duration::from_secs(60) / requests,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig::per_minute(10)),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn available(&self) -> u32 {
        self.state.lock().await.tokens
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis().max(1)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every.saturating_mul(refills);
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed.min(self.refill_every));
            drop(state);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(10))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }
}

/// Fetch client scoped to one update cycle and handed explicitly to source adapters.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<SimpleTokenBucket>,
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
            token_bucket: config.token_bucket.map(SimpleTokenBucket::new),
            backoff: config.backoff,
        })
    }

    #[instrument(level = "info", name = "http_fetch", skip(self, run_id), fields(%run_id))]
    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedPage, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }
            debug!(attempt, "fetching");

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable request error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::HttpStatus {
                status: 0,
                url: url.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;
    use ukft_core::{build_record_at, Category, RawAmount, RawScheme, SchemeSource};

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).single().expect("ts")
    }

    fn doc(id: &str) -> JsonValue {
        json!({
            "id": id,
            "title": format!("Scheme {id}"),
            "organization": "Test Org",
            "category": "foundations",
            "description": "desc",
            "eligibility": {"career_stage": "All Stages"},
            "funding_details": {"amount": {"min": 1, "max": 2}},
            "application": {"deadline": "2024-05-01"}
        })
    }

    fn ids(database: &FundingDatabase) -> Vec<String> {
        database.fundings.iter().filter_map(record_key).collect()
    }

    fn seeded_store(dir: &Path, records: &[JsonValue]) -> DatabaseStore {
        let store = DatabaseStore::in_data_dir(dir);
        let (database, _) = merge_records(FundingDatabase::empty(ts(1)), records, ts(1));
        store.persist(&database).expect("seed");
        store
    }

    #[test]
    fn merge_skips_duplicates_and_invalid_records() {
        let existing = merge_records(FundingDatabase::empty(ts(1)), &[doc("A"), doc("B")], ts(1)).0;
        let mut invalid = doc("D");
        invalid.as_object_mut().unwrap().remove("description");

        let mut changed_a = doc("A");
        changed_a["title"] = json!("A, but retitled");

        let (merged, stats) = merge_records(existing, &[changed_a, doc("C"), invalid], ts(2));
        assert_eq!(ids(&merged), vec!["A", "B", "C"]);
        assert_eq!(merged.total_fundings, 3);
        assert_eq!(merged.fundings[0]["title"], "Scheme A");
        assert_eq!(merged.last_updated, ts(2));
        assert_eq!(
            stats,
            MergeStats {
                added: 1,
                duplicates: 1,
                invalid: 1
            }
        );
    }

    #[test]
    fn merge_drops_repeats_within_one_batch() {
        let (merged, stats) =
            merge_records(FundingDatabase::empty(ts(1)), &[doc("A"), doc("A"), doc("B")], ts(1));
        assert_eq!(ids(&merged), vec!["A", "B"]);
        assert_eq!(merged.total_fundings, merged.fundings.len());
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn merging_the_same_batch_twice_is_idempotent() {
        let batch = vec![doc("A"), doc("B"), doc("C")];
        let once = merge_records(FundingDatabase::empty(ts(1)), &batch, ts(1)).0;
        let (twice, stats) = merge_records(once.clone(), &batch, ts(1));
        assert_eq!(once, twice);
        assert_eq!(stats.added, 0);
        assert_eq!(stats.duplicates, 3);
    }

    #[test]
    fn update_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let store = seeded_store(dir.path(), &[doc("A"), doc("B")]);

        let outcome = store.update(&[doc("A"), doc("C")], ts(3));
        assert!(outcome.succeeded());
        assert_eq!(outcome.stats.added, 1);

        let reread = store.read().expect("reread");
        assert_eq!(ids(&reread), vec!["A", "B", "C"]);
        assert_eq!(reread.total_fundings, 3);
        assert_eq!(reread.last_updated, ts(3));

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_or_corrupt_store_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = DatabaseStore::in_data_dir(dir.path());
        let loaded = store.load(ts(4));
        assert_eq!(loaded, FundingDatabase::empty(ts(4)));
        assert!(store.read().unwrap_err().is_not_found());

        fs::write(store.path(), b"{ this is not json").unwrap();
        assert!(matches!(store.read(), Err(PersistenceError::Corrupt { .. })));
        assert_eq!(store.load(ts(4)).total_fundings, 0);

        let outcome = store.update(&[doc("Z")], ts(5));
        assert!(outcome.succeeded());
        assert_eq!(ids(&store.read().unwrap()), vec!["Z"]);
    }

    #[test]
    fn failed_write_reports_failure_and_keeps_prior_state() {
        let dir = tempdir().expect("tempdir");
        // A non-empty directory where the store file should be cannot be replaced by rename.
        let blocked = dir.path().join(DATABASE_FILE_NAME);
        fs::create_dir_all(&blocked).unwrap();
        fs::write(blocked.join("keep.txt"), b"prior").unwrap();

        let store = DatabaseStore::new(&blocked);
        let outcome = store.update(&[doc("A")], ts(6));
        assert!(!outcome.succeeded());
        assert_eq!(outcome.database.total_fundings, 1);
        assert_eq!(fs::read(blocked.join("keep.txt")).unwrap(), b"prior");

        let temp_files = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(temp_files, 0);
    }

    fn sample_raw() -> RawScheme {
        RawScheme {
            title: "Discovery Awards".into(),
            description: "Curiosity-driven research".into(),
            career_stage: "All Stages".into(),
            amount: RawAmount {
                min: 300_000,
                max: 3_000_000,
                duration_years: 5,
            },
            deadline: "2024-04-30".into(),
            frequency: "Bi-annual".into(),
            tags: vec!["discovery".into()],
            success_rate: Some("12%".into()),
            requirements: vec![],
            source: SchemeSource {
                organization: "The Wellcome Trust".into(),
                category: Category::Foundations,
                subcategory: "wellcome_trust".into(),
                disciplines: vec![],
                source_url: "https://wellcome.org".into(),
                application_url: "https://wellcome.org".into(),
                guidelines_url: "https://wellcome.org".into(),
                contact_email: "grantsenquiries@wellcome.org".into(),
                contact_phone: String::new(),
            },
        }
    }

    fn sample_record() -> FundingOpportunity {
        build_record_at(&sample_raw(), ts(7))
    }

    #[test]
    fn record_files_are_named_by_category_subcategory_and_id() {
        let dir = tempdir().expect("tempdir");
        let writer = RecordWriter::in_data_dir(dir.path());
        let record = sample_record();

        let path = writer.write(&record).expect("write");
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("foundations_wellcome_trust_{}.json", record.id)
        );
        let stored: FundingOpportunity =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored, record);

        // rewritten unconditionally
        writer.write(&record).expect("rewrite");
        assert_eq!(fs::read_dir(writer.dir()).unwrap().count(), 1);
    }

    fn ukri_record_titled(title: String) -> FundingOpportunity {
        let mut raw = RawScheme {
            title,
            frequency: "Annual".into(),
            success_rate: None,
            ..sample_raw()
        };
        raw.source.organization = "Engineering and Physical Sciences Research Council".into();
        raw.source.category = Category::Ukri;
        raw.source.subcategory = "epsrc".into();
        build_record_at(&raw, ts(7))
    }

    #[test]
    fn long_titles_still_produce_writable_record_files() {
        let dir = tempdir().expect("tempdir");
        let writer = RecordWriter::in_data_dir(dir.path());

        let medium = ukri_record_titled(
            "Programme grant for interdisciplinary quantum materials research spanning synthesis characterisation theory and device prototyping"
                .into(),
        );
        assert!(medium.title.len() >= 120);
        let medium_name = RecordWriter::file_name_for(&medium);
        assert_eq!(medium_name, format!("ukri_epsrc_{}.json", medium.id));
        assert!(writer.write(&medium).is_ok());

        let long = ukri_record_titled("very long scheme title ".repeat(12));
        let long_name = RecordWriter::file_name_for(&long);
        assert!(long.id.len() > MAX_RECORD_FILE_NAME_BYTES);
        assert!(long_name.len() <= MAX_RECORD_FILE_NAME_BYTES);
        let (_, hash) = long.id.rsplit_once('_').unwrap();
        assert!(long_name.starts_with("ukri_epsrc_engineering_and_physical"));
        assert!(long_name.ends_with(&format!("_{hash}.json")));
        assert!(!long_name.contains("__"));
        let path = writer.write(&long).expect("write long");
        assert_eq!(path.file_name().unwrap().to_string_lossy(), long_name);

        let names: Vec<String> = fs::read_dir(writer.dir())
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }

    #[test]
    fn clean_removes_only_files_past_the_cutoff() {
        let dir = tempdir().expect("tempdir");
        let writer = RecordWriter::in_data_dir(dir.path());
        writer.write(&sample_record()).expect("write");
        fs::write(writer.dir().join("notes.txt"), b"keep").unwrap();

        let now = SystemTime::now();
        assert_eq!(writer.clean_older_than(30, now).unwrap(), 0);

        let later = now + Duration::from_secs(31 * 24 * 60 * 60);
        assert_eq!(writer.clean_older_than(30, later).unwrap(), 1);
        assert!(writer.dir().join("notes.txt").exists());

        let missing = RecordWriter::new(dir.path().join("nowhere"));
        assert_eq!(missing.clean_older_than(1, now).unwrap(), 0);
    }

    #[test]
    fn default_backoff_doubles_from_half_a_second_up_to_ten() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 3);
        let delays: Vec<_> = (0..7).map(|i| policy.delay_for_attempt(i)).collect();
        assert_eq!(
            delays,
            [500, 1_000, 2_000, 4_000, 8_000, 10_000, 10_000].map(Duration::from_millis)
        );
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(10));
    }

    #[test]
    fn throttling_timeouts_and_server_errors_are_retried() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(classify_status(status), RetryDisposition::Retryable, "{status}");
        }
        for status in [StatusCode::NOT_FOUND, StatusCode::FORBIDDEN, StatusCode::GONE] {
            assert_eq!(classify_status(status), RetryDisposition::NonRetryable, "{status}");
        }
    }

    #[tokio::test]
    async fn token_bucket_spends_burst_capacity() {
        let config = TokenBucketConfig::per_minute(10);
        assert_eq!(config.refill_every, Duration::from_secs(6));

        let bucket = SimpleTokenBucket::new(TokenBucketConfig {
            capacity: 3,
            refill_every: Duration::from_secs(60),
        });
        for _ in 0..3 {
            bucket.take().await;
        }
        assert_eq!(bucket.available().await, 0);
    }
}
