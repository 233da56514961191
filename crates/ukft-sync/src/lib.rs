//! Update-cycle orchestration: collect, build, write, merge, summarize.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{error, info, info_span, warn, Instrument};
use ukft_adapters::{
    adapter_for_source, known_source_ids, AdapterContext, Crawlability, SourceAdapter,
};
use ukft_core::{build_record, record_key, validate_document, FundingOpportunity};
use ukft_storage::{
    write_json_atomic, BackoffPolicy, DatabaseStore, HttpClientConfig, HttpFetcher, MergeStats,
    RecordWriter, TokenBucketConfig,
};
use uuid::Uuid;

mod summary;

pub use summary::{log_summary, summarize, FundingTotals, SummaryReport};

pub const CRATE_NAME: &str = "ukft-sync";

pub const SUMMARY_FILE_NAME: &str = "update_summary.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub crawlability: Crawlability,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// The registry file when present, otherwise every built-in source enabled.
    pub fn load_or_builtin(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        info!(path = %path.display(), "no source registry file, using built-in sources");
        Ok(Self::builtin())
    }

    pub fn builtin() -> Self {
        let sources = known_source_ids()
            .into_iter()
            .filter_map(adapter_for_source)
            .map(|adapter| SourceConfig {
                source_id: adapter.source_id().to_string(),
                display_name: adapter.source_id().to_string(),
                enabled: true,
                crawlability: adapter.crawlability(),
                notes: None,
            })
            .collect();
        Self { sources }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub sources_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub requests_per_minute: u32,
    pub ukri_max_pages: u32,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("UKFT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            reports_dir: std::env::var("UKFT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            sources_file: std::env::var("UKFT_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            user_agent: std::env::var("UKFT_USER_AGENT")
                .unwrap_or_else(|_| "ukft-bot/0.1".to_string()),
            http_timeout_secs: env_number("UKFT_HTTP_TIMEOUT_SECS", 30),
            requests_per_minute: env_number("UKFT_REQUESTS_PER_MINUTE", 10),
            ukri_max_pages: env_number("UKFT_UKRI_MAX_PAGES", 15),
        }
    }

    pub fn store(&self) -> DatabaseStore {
        DatabaseStore::in_data_dir(&self.data_dir)
    }

    pub fn record_writer(&self) -> RecordWriter {
        RecordWriter::in_data_dir(&self.data_dir)
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig::per_minute(self.requests_per_minute)),
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_attempted: Vec<String>,
    pub sources_failed: Vec<String>,
    pub collected_schemes: usize,
    pub individual_files_written: usize,
    pub merge: MergeStats,
    pub total_fundings: usize,
    pub persisted: bool,
    pub summary: SummaryReport,
    pub report_path: Option<PathBuf>,
}

impl SyncRunSummary {
    /// A cycle fails when it collected nothing or could not persist the store.
    pub fn succeeded(&self) -> bool {
        self.persisted && self.collected_schemes > 0
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: DatabaseStore,
    records: RecordWriter,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        let store = config.store();
        let records = config.record_writer();
        Self {
            config,
            store,
            records,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs one update cycle over `only` (every enabled source when empty).
    pub async fn run_once(&self, only: &[String]) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("update_cycle", %run_id);
        self.run_cycle(run_id, only).instrument(span).await
    }

    fn selected_sources(&self, only: &[String]) -> Result<Vec<SourceConfig>> {
        let registry = SourceRegistry::load_or_builtin(&self.config.sources_file)?;
        if only.is_empty() {
            return Ok(registry.sources.into_iter().filter(|s| s.enabled).collect());
        }

        let mut selected = Vec::new();
        for wanted in only {
            match registry.sources.iter().find(|s| &s.source_id == wanted) {
                Some(source) => selected.push(source.clone()),
                None => warn!(source_id = %wanted, "source not in registry, skipping"),
            }
        }
        Ok(selected)
    }

    async fn collect_records(
        &self,
        sources: &[SourceConfig],
        http: &HttpFetcher,
        ctx: &AdapterContext,
        failed: &mut Vec<String>,
    ) -> (usize, Vec<FundingOpportunity>) {
        let mut collected = 0usize;
        let mut records = Vec::new();

        for source in sources {
            let Some(adapter) = adapter_for_source(&source.source_id) else {
                warn!(source_id = %source.source_id, "no adapter registered, skipping");
                failed.push(source.source_id.clone());
                continue;
            };
            match collect_source(adapter.as_ref(), http, ctx).await {
                Ok(batch) => {
                    collected += batch.len();
                    records.extend(batch);
                }
                Err(err) => {
                    error!(source_id = %source.source_id, error = %err, "source collection failed");
                    failed.push(source.source_id.clone());
                }
            }
        }
        (collected, records)
    }

    fn write_individual_records(&self, records: &[FundingOpportunity]) -> usize {
        records
            .iter()
            .filter(|record| match self.records.write(record) {
                Ok(_) => true,
                Err(err) => {
                    warn!(record_id = %record.id, error = %err, "individual record not written");
                    false
                }
            })
            .count()
    }

    fn write_summary(&self, run_id: Uuid, report: &SummaryReport) -> Option<PathBuf> {
        let latest = self.config.data_dir.join(SUMMARY_FILE_NAME);
        let history = self
            .config
            .reports_dir
            .join(run_id.to_string())
            .join(SUMMARY_FILE_NAME);

        let mut written = None;
        for path in [latest, history] {
            match write_json_atomic(&path, report) {
                Ok(()) => written = Some(path),
                Err(err) => error!(error = %err, "summary report not written"),
            }
        }
        written
    }

    async fn run_cycle(&self, run_id: Uuid, only: &[String]) -> Result<SyncRunSummary> {
        let started_at = Utc::now();

        let sources = self.selected_sources(only)?;
        let sources_attempted: Vec<String> = sources.iter().map(|s| s.source_id.clone()).collect();
        info!(sources = ?sources_attempted, "update cycle started");

        let http = HttpFetcher::new(self.config.http_client_config())?;
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
            ukri_max_pages: self.config.ukri_max_pages,
        };

        let mut sources_failed = Vec::new();
        let (collected_schemes, records) = self
            .collect_records(&sources, &http, &ctx, &mut sources_failed)
            .await;
        if records.is_empty() {
            warn!("no funding opportunities collected");
        }

        let individual_files_written = self.write_individual_records(&records);
        let documents: Vec<JsonValue> = records
            .iter()
            .filter_map(|record| match record.to_document() {
                Ok(doc) => Some(doc),
                Err(err) => {
                    warn!(record_id = %record.id, error = %err, "record not serializable");
                    None
                }
            })
            .collect();

        let outcome = self.store.update(&documents, Utc::now());
        let report = summarize(&documents, Utc::now());
        log_summary(&report);
        let report_path = if outcome.succeeded() && collected_schemes > 0 {
            self.write_summary(run_id, &report)
        } else {
            warn!("update cycle failed, previous summary report kept");
            None
        };

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources_attempted,
            sources_failed,
            collected_schemes,
            individual_files_written,
            merge: outcome.stats,
            total_fundings: outcome.database.total_fundings,
            persisted: outcome.succeeded(),
            summary: report,
            report_path,
        };
        info!(
            collected = summary.collected_schemes,
            added = summary.merge.added,
            total = summary.total_fundings,
            persisted = summary.persisted,
            "update cycle finished"
        );
        Ok(summary)
    }
}

async fn collect_source(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    ctx: &AdapterContext,
) -> Result<Vec<FundingOpportunity>> {
    let raws = adapter
        .collect(http, ctx)
        .await
        .with_context(|| format!("collecting {}", adapter.source_id()))?;
    let records: Vec<FundingOpportunity> = raws.iter().map(build_record).collect();
    info!(
        source_id = adapter.source_id(),
        records = records.len(),
        "source collected"
    );
    Ok(records)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub total_records: usize,
    pub valid_records: usize,
    pub invalid: Vec<InvalidRecord>,
    pub declared_total: usize,
    pub duplicate_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidRecord {
    pub id: Option<String>,
    pub reason: String,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.invalid.is_empty()
            && self.duplicate_ids.is_empty()
            && self.declared_total == self.total_records
    }
}

/// Checks every stored record structurally, plus the store's count and id uniqueness.
pub fn validate_database(store: &DatabaseStore) -> Result<ValidationReport> {
    let database = store
        .read()
        .with_context(|| format!("loading {}", store.path().display()))?;

    let mut report = ValidationReport {
        total_records: database.fundings.len(),
        declared_total: database.total_fundings,
        ..Default::default()
    };
    if database.fundings.is_empty() {
        warn!("no fundings in database");
    }

    let mut seen = HashSet::new();
    for record in &database.fundings {
        let id = record_key(record);
        match validate_document(record) {
            Ok(()) => report.valid_records += 1,
            Err(failure) => {
                warn!(record_id = id.as_deref().unwrap_or("<none>"), %failure, "invalid funding record");
                report.invalid.push(InvalidRecord {
                    id: id.clone(),
                    reason: failure.to_string(),
                });
            }
        }
        if let Some(id) = id {
            if !seen.insert(id.clone()) && !report.duplicate_ids.contains(&id) {
                report.duplicate_ids.push(id);
            }
        }
    }

    if report.declared_total != report.total_records {
        warn!(
            declared = report.declared_total,
            actual = report.total_records,
            "total_fundings does not match stored records"
        );
    }
    info!(
        valid = report.valid_records,
        total = report.total_records,
        "validation complete"
    );
    Ok(report)
}

pub fn clean_records(config: &SyncConfig, days: u64) -> Result<usize> {
    config
        .record_writer()
        .clean_older_than(days, SystemTime::now())
        .with_context(|| format!("cleaning records older than {days} days"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use ukft_storage::{DATABASE_FILE_NAME, INDIVIDUAL_RECORDS_DIR};

    fn config_in(root: &Path) -> SyncConfig {
        SyncConfig {
            data_dir: root.join("data"),
            reports_dir: root.join("reports"),
            sources_file: root.join("sources.yaml"),
            user_agent: "ukft-test/0.1".into(),
            http_timeout_secs: 5,
            requests_per_minute: 60,
            ukri_max_pages: 1,
        }
    }

    const CATALOGUE_SOURCES: &str = r#"
sources:
  - source_id: academies
    display_name: National Academies
    enabled: true
    crawlability: StaticCatalogue
  - source_id: foundations
    display_name: Charitable Foundations
    enabled: true
    crawlability: StaticCatalogue
  - source_id: ukri
    display_name: UK Research and Innovation
    enabled: false
    crawlability: PublicHtml
    notes: disabled in tests
"#;

    fn pipeline_in(root: &Path) -> SyncPipeline {
        let config = config_in(root);
        fs::write(&config.sources_file, CATALOGUE_SOURCES).unwrap();
        SyncPipeline::new(config)
    }

    fn json_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn registry_parses_and_falls_back_to_builtin() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        fs::write(&path, CATALOGUE_SOURCES).unwrap();
        let registry = SourceRegistry::load(&path).unwrap();
        assert_eq!(registry.sources.len(), 3);
        assert_eq!(registry.sources[2].notes.as_deref(), Some("disabled in tests"));
        assert_eq!(registry.sources[0].crawlability, Crawlability::StaticCatalogue);

        let builtin = SourceRegistry::load_or_builtin(&dir.path().join("missing.yaml")).unwrap();
        assert_eq!(builtin.sources.len(), 3);
        assert!(builtin.sources.iter().all(|s| s.enabled));

        fs::write(&path, "sources: [ {source_id: 1").unwrap();
        assert!(SourceRegistry::load(&path).is_err());
    }

    #[test]
    fn selection_skips_disabled_and_unknown_sources() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_in(dir.path());

        let enabled: Vec<_> = pipeline
            .selected_sources(&[])
            .unwrap()
            .into_iter()
            .map(|s| s.source_id)
            .collect();
        assert_eq!(enabled, vec!["academies", "foundations"]);

        let named: Vec<_> = pipeline
            .selected_sources(&["foundations".into(), "nowhere".into()])
            .unwrap()
            .into_iter()
            .map(|s| s.source_id)
            .collect();
        assert_eq!(named, vec!["foundations"]);
    }

    #[tokio::test]
    async fn update_cycle_is_idempotent() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_in(dir.path());

        let first = pipeline.run_once(&[]).await.unwrap();
        assert!(first.succeeded());
        assert_eq!(first.sources_attempted, vec!["academies", "foundations"]);
        assert!(first.sources_failed.is_empty());
        assert_eq!(first.collected_schemes, 23);
        assert_eq!(first.merge.added, 23);
        assert_eq!(first.total_fundings, 23);
        assert_eq!(first.summary.category_breakdown["academies"], 9);
        assert_eq!(first.summary.category_breakdown["foundations"], 14);
        assert_eq!(json_files(&pipeline.config().data_dir.join(INDIVIDUAL_RECORDS_DIR)), 23);

        let stored_before = fs::read(pipeline.config().data_dir.join(DATABASE_FILE_NAME)).unwrap();
        let stored_first: JsonValue = serde_json::from_slice(&stored_before).unwrap();

        let second = pipeline.run_once(&[]).await.unwrap();
        assert!(second.succeeded());
        assert_eq!(second.merge.added, 0);
        assert_eq!(second.merge.duplicates, 23);
        assert_eq!(second.total_fundings, 23);
        assert_eq!(json_files(&pipeline.config().data_dir.join(INDIVIDUAL_RECORDS_DIR)), 23);

        let stored_second: JsonValue = serde_json::from_slice(
            &fs::read(pipeline.config().data_dir.join(DATABASE_FILE_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(stored_first["fundings"], stored_second["fundings"]);

        assert!(pipeline.config().data_dir.join(SUMMARY_FILE_NAME).exists());
        for run in [first.run_id, second.run_id] {
            assert!(pipeline
                .config()
                .reports_dir
                .join(run.to_string())
                .join(SUMMARY_FILE_NAME)
                .exists());
        }

        let report = validate_database(&pipeline.config().store()).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.valid_records, 23);
    }

    #[tokio::test]
    async fn cycle_with_nothing_collected_fails() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_in(dir.path());
        let latest = pipeline.config().data_dir.join(SUMMARY_FILE_NAME);

        let good = pipeline.run_once(&["academies".into()]).await.unwrap();
        assert!(good.succeeded());
        let history = pipeline
            .config()
            .reports_dir
            .join(good.run_id.to_string())
            .join(SUMMARY_FILE_NAME);
        assert_eq!(good.report_path, Some(history));
        let before = fs::read(&latest).unwrap();

        let summary = pipeline.run_once(&["nowhere".into()]).await.unwrap();
        assert!(!summary.succeeded());
        assert_eq!(summary.collected_schemes, 0);
        assert_eq!(summary.total_fundings, 9);
        assert!(summary.report_path.is_none());
        assert_eq!(fs::read(&latest).unwrap(), before);
        assert!(!pipeline
            .config()
            .reports_dir
            .join(summary.run_id.to_string())
            .exists());

        let kept: SummaryReport = serde_json::from_slice(&before).unwrap();
        assert_eq!(kept.total_opportunities, 9);
    }

    #[tokio::test]
    async fn unpersisted_cycle_keeps_previous_summary() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_in(dir.path());
        let latest = pipeline.config().data_dir.join(SUMMARY_FILE_NAME);
        fs::create_dir_all(&pipeline.config().data_dir).unwrap();
        fs::write(&latest, b"{}").unwrap();

        // A non-empty directory in place of the store cannot be replaced.
        let blocked = pipeline.config().data_dir.join(DATABASE_FILE_NAME);
        fs::create_dir_all(&blocked).unwrap();
        fs::write(blocked.join("keep.txt"), b"prior").unwrap();

        let summary = pipeline.run_once(&["foundations".into()]).await.unwrap();
        assert_eq!(summary.collected_schemes, 14);
        assert!(!summary.persisted);
        assert!(!summary.succeeded());
        assert!(summary.report_path.is_none());
        assert_eq!(fs::read(&latest).unwrap(), b"{}");
    }

    #[test]
    fn validation_flags_bad_counts_duplicates_and_missing_fields() {
        let dir = tempdir().unwrap();
        let store = DatabaseStore::new(dir.path().join(DATABASE_FILE_NAME));
        let record = serde_json::json!({
            "id": "a", "title": "t", "organization": "o", "category": "ukri",
            "description": "d", "eligibility": {}, "funding_details": {"amount": {}},
            "application": {"deadline": "N/A"}
        });
        let mut broken = record.clone();
        broken.as_object_mut().unwrap().remove("application");
        broken["id"] = "b".into();
        fs::write(
            store.path(),
            serde_json::to_vec(&serde_json::json!({
                "last_updated": "2024-01-01T00:00:00",
                "total_fundings": 5,
                "fundings": [record.clone(), record, broken]
            }))
            .unwrap(),
        )
        .unwrap();

        let report = validate_database(&store).unwrap();
        assert!(!report.is_ok());
        assert_eq!(report.total_records, 3);
        assert_eq!(report.valid_records, 2);
        assert_eq!(report.duplicate_ids, vec!["a"]);
        assert_eq!(report.invalid[0].id.as_deref(), Some("b"));
        assert_eq!(report.invalid[0].reason, "missing required field: application");
    }

    #[test]
    fn validating_a_missing_store_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(validate_database(&DatabaseStore::in_data_dir(dir.path())).is_err());
    }

    #[test]
    fn clean_on_fresh_directory_removes_nothing() {
        let dir = tempdir().unwrap();
        assert_eq!(clean_records(&config_in(dir.path()), 30).unwrap(), 0);
    }
}
