//! Source adapter contracts and the three funding-body extractors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ukft_core::{Category, RawScheme};
use ukft_storage::{FetchError, HttpFetcher};
use uuid::Uuid;

mod catalogue;
mod ukri;

pub use catalogue::{
    academies_adapter, foundations_adapter, CatalogueBody, CatalogueScheme, StaticCatalogueAdapter,
    ACADEMIES, FOUNDATIONS,
};
pub use ukri::{
    career_stage_from_text, council_from_text, extract_amount, extract_contact_email,
    extract_deadline, extract_duration_years, extract_opportunity_links, generate_tags,
    parse_opportunity_detail, ukri_adapter, Council, UkriAdapter, COUNCILS, GENERIC_COUNCIL,
    UKRI_BASE_URL,
};

pub const CRATE_NAME: &str = "ukft-adapters";

pub const UKRI_SOURCE_ID: &str = "ukri";
pub const ACADEMIES_SOURCE_ID: &str = "academies";
pub const FOUNDATIONS_SOURCE_ID: &str = "foundations";

pub const DEFAULT_UKRI_MAX_PAGES: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crawlability {
    PublicHtml,
    StaticCatalogue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub ukri_max_pages: u32,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, fetched_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            fetched_at,
            ukri_max_pages: DEFAULT_UKRI_MAX_PAGES,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn category(&self) -> Category;
    fn crawlability(&self) -> Crawlability;

    /// Collects every scheme the source currently advertises, ready for the record builder.
    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawScheme>, AdapterError>;
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        UKRI_SOURCE_ID => Some(Box::new(ukri_adapter())),
        ACADEMIES_SOURCE_ID => Some(Box::new(academies_adapter())),
        FOUNDATIONS_SOURCE_ID => Some(Box::new(foundations_adapter())),
        _ => None,
    }
}

pub fn known_source_ids() -> [&'static str; 3] {
    [UKRI_SOURCE_ID, ACADEMIES_SOURCE_ID, FOUNDATIONS_SOURCE_ID]
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let cleaned = ukft_core::clean_text(&value);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_all_texts(document: &Html, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_every_source() {
        for id in known_source_ids() {
            let adapter = adapter_for_source(id).expect("adapter");
            assert_eq!(adapter.source_id(), id);
        }
        assert!(adapter_for_source("research-council-x").is_none());

        let ukri = adapter_for_source(UKRI_SOURCE_ID).unwrap();
        assert_eq!(ukri.category(), Category::Ukri);
        assert_eq!(ukri.crawlability(), Crawlability::PublicHtml);
        let academies = adapter_for_source(ACADEMIES_SOURCE_ID).unwrap();
        assert_eq!(academies.crawlability(), Crawlability::StaticCatalogue);
    }

    #[test]
    fn selector_helpers_clean_text() {
        let html = Html::parse_document(
            "<ul><li> first&nbsp;item </li><li>   </li><li>second\n  item</li></ul><h1>T</h1>",
        );
        assert_eq!(
            select_all_texts(&html, "li").unwrap(),
            vec!["first item", "second item"]
        );
        assert_eq!(select_first_text(&html, "h1").unwrap().as_deref(), Some("T"));
        assert!(matches!(
            select_first_text(&html, "h1[").unwrap_err(),
            AdapterError::Message(_)
        ));
    }
}
