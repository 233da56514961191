use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;
use ukft_core::parse_deadline;

const UNKNOWN: &str = "unknown";
const UPCOMING_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingTotals {
    pub min_total_gbp: u64,
    pub max_total_gbp: u64,
}

/// Aggregate view of one update cycle's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub update_timestamp: DateTime<Utc>,
    pub total_opportunities: usize,
    pub category_breakdown: BTreeMap<String, usize>,
    pub career_stage_breakdown: BTreeMap<String, usize>,
    pub funding_totals: FundingTotals,
    pub upcoming_deadlines_30_days: usize,
    /// Categories seen, in first-seen order.
    pub data_sources: Vec<String>,
}

/// Never fails: missing or malformed fields count as `unknown`, zero, or not upcoming.
pub fn summarize(records: &[JsonValue], now: DateTime<Utc>) -> SummaryReport {
    let today = now.date_naive();
    let mut category_breakdown = BTreeMap::new();
    let mut career_stage_breakdown = BTreeMap::new();
    let mut funding_totals = FundingTotals::default();
    let mut upcoming = 0usize;
    let mut data_sources: Vec<String> = Vec::new();

    for record in records {
        let category = string_at(record, &["category"]).unwrap_or(UNKNOWN);
        *category_breakdown.entry(category.to_string()).or_insert(0) += 1;
        if !data_sources.iter().any(|seen| seen == category) {
            data_sources.push(category.to_string());
        }

        let stage = string_at(record, &["eligibility", "career_stage"]).unwrap_or(UNKNOWN);
        *career_stage_breakdown.entry(stage.to_string()).or_insert(0) += 1;

        let amount = &record["funding_details"]["amount"];
        funding_totals.min_total_gbp = funding_totals
            .min_total_gbp
            .saturating_add(whole_pounds(&amount["min"]));
        funding_totals.max_total_gbp = funding_totals
            .max_total_gbp
            .saturating_add(whole_pounds(&amount["max"]));

        let days_left = string_at(record, &["application", "deadline"])
            .and_then(|raw| parse_deadline(raw).ok())
            .map(|deadline| (deadline - today).num_days());
        if days_left.is_some_and(|days| (0..=UPCOMING_WINDOW_DAYS).contains(&days)) {
            upcoming += 1;
        }
    }

    SummaryReport {
        update_timestamp: now,
        total_opportunities: records.len(),
        category_breakdown,
        career_stage_breakdown,
        funding_totals,
        upcoming_deadlines_30_days: upcoming,
        data_sources,
    }
}

pub fn log_summary(report: &SummaryReport) {
    info!(
        total = report.total_opportunities,
        by_category = ?report.category_breakdown,
        by_career_stage = ?report.career_stage_breakdown,
        upcoming_deadlines_30_days = report.upcoming_deadlines_30_days,
        min_total_gbp = report.funding_totals.min_total_gbp,
        max_total_gbp = report.funding_totals.max_total_gbp,
        "update summary"
    );
}

fn string_at<'a>(record: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(record, |value, key| value.get(key))?
        .as_str()
}

fn whole_pounds(value: &JsonValue) -> u64 {
    if let Some(pounds) = value.as_u64() {
        return pounds;
    }
    match value.as_f64() {
        Some(pounds) if pounds.is_finite() && pounds > 0.0 => pounds as u64,
        _ => 0,
    }
}
