//! Canonical funding-opportunity model, derivation rules, record builder and validator.

use std::collections::HashSet;

use chrono::{DateTime, Days, Months, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ukft-core";

pub const CURRENCY_GBP: &str = "GBP";
pub const DEADLINE_FORMAT: &str = "%Y-%m-%d";
/// Placeholder for unknown success rates and deadlines.
pub const NOT_AVAILABLE: &str = "N/A";

/// Required top-level keys of a stored funding document.
pub const REQUIRED_FIELDS: [&str; 8] = [
    "id",
    "title",
    "organization",
    "category",
    "description",
    "eligibility",
    "funding_details",
    "application",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Ukri,
    Academies,
    Foundations,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Ukri, Category::Academies, Category::Foundations];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Ukri => "ukri",
            Category::Academies => "academies",
            Category::Foundations => "foundations",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(input))
    }

    /// Minimum max-amount per tier, highest tier first. Anything below the last row is `Low`.
    pub fn priority_thresholds(self) -> &'static [(u64, PriorityLevel)] {
        match self {
            Category::Academies => &ACADEMY_PRIORITY_THRESHOLDS,
            Category::Ukri | Category::Foundations => &FOUNDATION_PRIORITY_THRESHOLDS,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CareerStage {
    #[serde(rename = "Early Career")]
    EarlyCareer,
    #[serde(rename = "Mid Career")]
    MidCareer,
    #[serde(rename = "Senior")]
    Senior,
    #[serde(rename = "All Stages")]
    AllStages,
}

impl CareerStage {
    pub const ALL: [CareerStage; 4] = [
        CareerStage::EarlyCareer,
        CareerStage::MidCareer,
        CareerStage::Senior,
        CareerStage::AllStages,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CareerStage::EarlyCareer => "Early Career",
            CareerStage::MidCareer => "Mid Career",
            CareerStage::Senior => "Senior",
            CareerStage::AllStages => "All Stages",
        }
    }

    /// Accepts the display label in any case, with `-` or `_` in place of spaces.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input.trim().replace(['-', '_'], " ");
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(&normalized))
    }

    /// Like [`CareerStage::parse`] but unrecognized labels fall back to `All Stages`.
    pub fn from_label(input: &str) -> Self {
        Self::parse(input).unwrap_or_else(|| {
            debug!(career_stage = input, "unrecognized career stage, using All Stages");
            CareerStage::AllStages
        })
    }
}

impl std::fmt::Display for CareerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityLevel {
    Low,
    Medium,
    High,
    #[serde(rename = "Very High")]
    VeryHigh,
}

impl PriorityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PriorityLevel::Low => "Low",
            PriorityLevel::Medium => "Medium",
            PriorityLevel::High => "High",
            PriorityLevel::VeryHigh => "Very High",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompetitionLevel {
    ExtremelyCompetitive,
    VeryCompetitive,
    Competitive,
    ModeratelyCompetitive,
}

impl CompetitionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            CompetitionLevel::ExtremelyCompetitive => "Extremely Competitive",
            CompetitionLevel::VeryCompetitive => "Very Competitive",
            CompetitionLevel::Competitive => "Competitive",
            CompetitionLevel::ModeratelyCompetitive => "Moderately Competitive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
}

const ACADEMY_PRIORITY_THRESHOLDS: [(u64, PriorityLevel); 3] = [
    (500_000, PriorityLevel::VeryHigh),
    (200_000, PriorityLevel::High),
    (50_000, PriorityLevel::Medium),
];

const FOUNDATION_PRIORITY_THRESHOLDS: [(u64, PriorityLevel); 3] = [
    (1_000_000, PriorityLevel::VeryHigh),
    (500_000, PriorityLevel::High),
    (200_000, PriorityLevel::Medium),
];

/// Inclusive upper success-rate bound (percent) per band, tightest first.
const COMPETITION_BANDS: [(f64, CompetitionLevel); 3] = [
    (10.0, CompetitionLevel::ExtremelyCompetitive),
    (20.0, CompetitionLevel::VeryCompetitive),
    (30.0, CompetitionLevel::Competitive),
];

const ACADEMY_REQUIREMENTS: [(CareerStage, &[&str]); 4] = [
    (
        CareerStage::EarlyCareer,
        &[
            "PhD completed within 8 years",
            "Demonstrated research excellence",
            "UK-based position or offer",
        ],
    ),
    (
        CareerStage::MidCareer,
        &[
            "Established research track record",
            "Independent research experience",
            "UK-based position",
        ],
    ),
    (
        CareerStage::Senior,
        &[
            "Senior academic position",
            "Significant research achievements",
            "Leadership experience",
        ],
    ),
    (
        CareerStage::AllStages,
        &[
            "Employed at eligible UK institution",
            "Research proposal in scope",
        ],
    ),
];

const FOUNDATION_REQUIREMENTS: [(CareerStage, &[&str]); 4] = [
    (
        CareerStage::EarlyCareer,
        &[
            "PhD or equivalent qualification",
            "Within 8 years of PhD completion",
            "Demonstrated research potential",
        ],
    ),
    (
        CareerStage::MidCareer,
        &[
            "Established research track record",
            "Independent research experience",
            "Institutional affiliation",
        ],
    ),
    (
        CareerStage::Senior,
        &[
            "Senior academic position",
            "Significant research achievements",
            "Leadership in field",
        ],
    ),
    (
        CareerStage::AllStages,
        &[
            "Employed at eligible institution",
            "Research proposal within scope",
            "Demonstrated research capability",
        ],
    ),
];

const ACADEMY_SUCCESS_RATE_ESTIMATES: [(CareerStage, &str); 4] = [
    (CareerStage::EarlyCareer, "15%"),
    (CareerStage::MidCareer, "20%"),
    (CareerStage::Senior, "25%"),
    (CareerStage::AllStages, "18%"),
];

const COVERS_BY_TITLE_KEYWORD: [(&str, &[&str]); 3] = [
    (
        "fellowship",
        &["Salary", "Research expenses", "Equipment", "Travel", "Training"],
    ),
    (
        "training",
        &["Stipend", "Training costs", "Travel", "Accommodation"],
    ),
    (
        "equipment",
        &["Equipment", "Installation", "Maintenance", "Training"],
    ),
];

const DEFAULT_COVERS: &[&str] = &["Research costs", "Equipment", "Travel", "Consumables"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountRange {
    pub min: u64,
    pub max: u64,
    pub currency: String,
    pub duration_years: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub career_stage: CareerStage,
    pub disciplines: Vec<String>,
    pub requirements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingDetails {
    pub amount: AmountRange,
    pub covers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// `YYYY-MM-DD` or a sentinel such as `N/A`, `Closed`, `Rolling`.
    pub deadline: String,
    pub next_deadline: String,
    pub frequency: String,
    pub application_url: String,
    pub guidelines_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub priority_level: PriorityLevel,
    pub competition_level: String,
    pub success_rate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Contact {
    pub email: String,
    pub phone: String,
}

/// Canonical record, the unit of persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingOpportunity {
    pub id: String,
    pub title: String,
    pub organization: String,
    pub category: Category,
    pub subcategory: String,
    pub description: String,
    pub eligibility: Eligibility,
    pub funding_details: FundingDetails,
    pub application: Application,
    pub key_info: KeyInfo,
    pub contact: Contact,
    pub tags: Vec<String>,
    pub last_updated: DateTime<Utc>,
    pub scraped_from: String,
    pub status: Status,
}

impl FundingOpportunity {
    /// Structured document form, as stored in the aggregate database.
    pub fn to_document(&self) -> serde_json::Result<JsonValue> {
        serde_json::to_value(self)
    }
}

/// Aggregate store persisted as a single JSON document.
///
/// Records are kept as documents so that stored opportunities are written back
/// exactly as they were loaded. Unknown top-level keys survive a rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingDatabase {
    #[serde(deserialize_with = "deserialize_lenient_timestamp")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub total_fundings: usize,
    #[serde(default)]
    pub fundings: Vec<JsonValue>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl FundingDatabase {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            last_updated: now,
            total_fundings: 0,
            fundings: Vec::new(),
            extra: JsonMap::new(),
        }
    }

    pub fn ids(&self) -> HashSet<String> {
        self.fundings.iter().filter_map(record_key).collect()
    }
}

/// Source-side context an extractor attaches to every scheme it yields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemeSource {
    pub organization: String,
    pub category: Category,
    pub subcategory: String,
    #[serde(default)]
    pub disciplines: Vec<String>,
    pub source_url: String,
    #[serde(default)]
    pub application_url: String,
    #[serde(default)]
    pub guidelines_url: String,
    #[serde(default)]
    pub contact_email: String,
    #[serde(default)]
    pub contact_phone: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawAmount {
    pub min: u64,
    pub max: u64,
    pub duration_years: u32,
}

/// Loosely-normalized handoff contract from extractors into the record builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawScheme {
    pub title: String,
    pub description: String,
    pub career_stage: String,
    pub amount: RawAmount,
    pub deadline: String,
    pub frequency: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub success_rate: Option<String>,
    /// Requirements found on the source page; empty means use the standard table.
    #[serde(default)]
    pub requirements: Vec<String>,
    pub source: SchemeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerivationError {
    #[error("not a percentage: {0:?}")]
    InvalidPercentage(String),
    #[error("not a YYYY-MM-DD date: {0:?}")]
    InvalidDate(String),
    #[error("date out of range projecting from {0}")]
    DateOutOfRange(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("record is not a structured object")]
    NotAnObject,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("missing funding amount")]
    MissingAmount,
    #[error("missing application deadline")]
    MissingDeadline,
}

/// Stable, human-readable identifier derived from organization and title.
pub fn generate_id(title: &str, organization: &str) -> String {
    let combined = format!("{}_{}", organization.trim(), title.trim());
    let digest = Sha256::digest(combined.as_bytes());
    format!("{}_{}", slugify(&combined), hex::encode(&digest[..16]))
}

/// Lowercase ASCII alphanumerics; every other run collapses to a single `_`.
pub fn slugify(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Collapse whitespace runs and decode the handful of entities extractors leave behind.
pub fn clean_text(input: &str) -> String {
    input
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn priority_level(category: Category, max_amount: u64) -> PriorityLevel {
    category
        .priority_thresholds()
        .iter()
        .find(|(threshold, _)| max_amount >= *threshold)
        .map(|(_, level)| *level)
        .unwrap_or(PriorityLevel::Low)
}

pub fn parse_success_rate(success_rate: &str) -> Result<f64, DerivationError> {
    let trimmed = success_rate.trim();
    trimmed
        .strip_suffix('%')
        .unwrap_or(trimmed)
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|rate| rate.is_finite())
        .ok_or_else(|| DerivationError::InvalidPercentage(success_rate.to_string()))
}

pub fn competition_level(success_rate: &str) -> Result<CompetitionLevel, DerivationError> {
    let rate = parse_success_rate(success_rate)?;
    Ok(COMPETITION_BANDS
        .iter()
        .find(|(upper, _)| rate <= *upper)
        .map(|(_, level)| *level)
        .unwrap_or(CompetitionLevel::ModeratelyCompetitive))
}

pub fn parse_deadline(deadline: &str) -> Result<NaiveDate, DerivationError> {
    NaiveDate::parse_from_str(deadline.trim(), DEADLINE_FORMAT)
        .map_err(|_| DerivationError::InvalidDate(deadline.to_string()))
}

/// Projects the following deadline. `Annual` rolls the calendar year (Feb 29 becomes
/// Feb 28), `Bi-annual` adds 180 days, anything else adds 365 days.
pub fn next_deadline(deadline: &str, frequency: &str) -> Result<NaiveDate, DerivationError> {
    let current = parse_deadline(deadline)?;
    let next = if frequency.contains("Annual") {
        current.checked_add_months(Months::new(12))
    } else if frequency.contains("Bi-annual") {
        current.checked_add_days(Days::new(180))
    } else {
        current.checked_add_days(Days::new(365))
    };
    next.ok_or(DerivationError::DateOutOfRange(current))
}

/// [`next_deadline`] formatted for storage; unparseable deadlines are passed through.
pub fn project_next_deadline(deadline: &str, frequency: &str) -> String {
    match next_deadline(deadline, frequency) {
        Ok(date) => date.format(DEADLINE_FORMAT).to_string(),
        Err(err) => {
            debug!(deadline, frequency, error = %err, "next deadline not projected");
            deadline.to_string()
        }
    }
}

pub fn standard_requirements(category: Category, stage: CareerStage) -> &'static [&'static str] {
    let table = match category {
        Category::Foundations => &FOUNDATION_REQUIREMENTS,
        Category::Ukri | Category::Academies => &ACADEMY_REQUIREMENTS,
    };
    table
        .iter()
        .find(|(s, _)| *s == stage)
        .map(|(_, reqs)| *reqs)
        .unwrap_or(&[])
}

pub fn estimated_success_rate(category: Category, stage: CareerStage) -> Option<&'static str> {
    match category {
        Category::Academies => ACADEMY_SUCCESS_RATE_ESTIMATES
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, rate)| *rate),
        Category::Ukri | Category::Foundations => None,
    }
}

pub fn funding_covers(title: &str) -> &'static [&'static str] {
    let lower = title.to_lowercase();
    COVERS_BY_TITLE_KEYWORD
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, covers)| *covers)
        .unwrap_or(DEFAULT_COVERS)
}

/// Builds a canonical record stamped with the current time.
pub fn build_record(raw: &RawScheme) -> FundingOpportunity {
    build_record_at(raw, Utc::now())
}

pub fn build_record_at(raw: &RawScheme, now: DateTime<Utc>) -> FundingOpportunity {
    let source = &raw.source;
    let category = source.category;
    let title = clean_text(&raw.title);
    let career_stage = CareerStage::from_label(&raw.career_stage);

    let requirements = if raw.requirements.is_empty() {
        standard_requirements(category, career_stage)
            .iter()
            .map(|r| r.to_string())
            .collect()
    } else {
        unique_non_empty(raw.requirements.iter().map(|r| clean_text(r)))
    };

    let success_rate = raw
        .success_rate
        .as_deref()
        .map(str::trim)
        .filter(|rate| !rate.is_empty())
        .or_else(|| estimated_success_rate(category, career_stage))
        .unwrap_or(NOT_AVAILABLE)
        .to_string();

    let competition = match competition_level(&success_rate) {
        Ok(level) => level.as_str().to_string(),
        Err(err) => {
            if success_rate == NOT_AVAILABLE {
                debug!(title = %title, "no success rate, competition level left as N/A");
            } else {
                warn!(title = %title, error = %err, "competition level not derived");
            }
            success_rate.clone()
        }
    };

    let deadline = raw.deadline.trim().to_string();

    FundingOpportunity {
        id: generate_id(&title, &source.organization),
        organization: source.organization.clone(),
        category,
        subcategory: source.subcategory.clone(),
        description: clean_text(&raw.description),
        eligibility: Eligibility {
            career_stage,
            disciplines: unique_non_empty(source.disciplines.iter().cloned()),
            requirements,
        },
        funding_details: FundingDetails {
            amount: AmountRange {
                min: raw.amount.min,
                max: raw.amount.max,
                currency: CURRENCY_GBP.to_string(),
                duration_years: raw.amount.duration_years,
            },
            covers: funding_covers(&title).iter().map(|c| c.to_string()).collect(),
        },
        application: Application {
            next_deadline: project_next_deadline(&deadline, &raw.frequency),
            deadline,
            frequency: raw.frequency.clone(),
            application_url: source.application_url.clone(),
            guidelines_url: source.guidelines_url.clone(),
        },
        key_info: KeyInfo {
            priority_level: priority_level(category, raw.amount.max),
            competition_level: competition,
            success_rate,
        },
        contact: Contact {
            email: source.contact_email.clone(),
            phone: source.contact_phone.clone(),
        },
        tags: unique_non_empty(raw.tags.iter().cloned()),
        last_updated: now,
        scraped_from: source.source_url.clone(),
        status: Status::Active,
        title,
    }
}

/// Identity key of a stored document: its `id`, stringified when not a string.
pub fn record_key(record: &JsonValue) -> Option<String> {
    match record.get("id")? {
        JsonValue::Null => None,
        JsonValue::String(id) => Some(id.clone()),
        other => Some(other.to_string()),
    }
}

/// Structural presence check; value types and ranges are not inspected.
pub fn validate_document(record: &JsonValue) -> Result<(), ValidationFailure> {
    let object = record.as_object().ok_or(ValidationFailure::NotAnObject)?;
    if let Some(missing) = REQUIRED_FIELDS
        .into_iter()
        .find(|field| !object.contains_key(*field))
    {
        return Err(ValidationFailure::MissingField(missing));
    }
    if !has_key(&object["funding_details"], "amount") {
        return Err(ValidationFailure::MissingAmount);
    }
    if !has_key(&object["application"], "deadline") {
        return Err(ValidationFailure::MissingDeadline);
    }
    Ok(())
}

pub fn is_valid(record: &JsonValue) -> bool {
    match validate_document(record) {
        Ok(()) => true,
        Err(failure) => {
            let record_id = record_key(record);
            warn!(
                record_id = record_id.as_deref().unwrap_or("<none>"),
                %failure,
                "invalid funding record"
            );
            false
        }
    }
}

/// Parses RFC 3339, or a naive ISO timestamp taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| raw.parse::<NaiveDateTime>().ok().map(|ts| ts.and_utc()))
}

fn deserialize_lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {raw:?}")))
}

fn has_key(value: &JsonValue, key: &str) -> bool {
    value.as_object().is_some_and(|object| object.contains_key(key))
}

fn unique_non_empty(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty() && seen.insert(item.clone()))
        .collect()
}
