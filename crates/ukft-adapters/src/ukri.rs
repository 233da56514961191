use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::{Captures, Regex};
use scraper::{ElementRef, Html};
use tracing::{debug, info, warn};
use ukft_core::{
    clean_text, Category, CareerStage, RawAmount, RawScheme, SchemeSource, DEADLINE_FORMAT,
    NOT_AVAILABLE,
};
use ukft_storage::{FetchError, HttpFetcher};
use url::Url;

use crate::{
    select_all_texts, select_first_text, selector, AdapterContext, AdapterError, Crawlability,
    SourceAdapter, UKRI_SOURCE_ID,
};

pub const UKRI_BASE_URL: &str = "https://www.ukri.org";

const LISTING_PATH: &str = "/opportunity/";
const DEFAULT_FREQUENCY: &str = "Annual";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Council {
    pub id: &'static str,
    pub name: &'static str,
    /// Value of the listing's `filter_council` query parameter.
    pub filter: &'static str,
    pub keywords: &'static [&'static str],
}

pub static COUNCILS: [Council; 9] = [
    Council {
        id: "ahrc",
        name: "Arts and Humanities Research Council",
        filter: "ahrc",
        keywords: &["arts", "humanities", "ahrc"],
    },
    Council {
        id: "bbsrc",
        name: "Biotechnology and Biological Sciences Research Council",
        filter: "bbsrc",
        keywords: &["biotechnology", "biological", "bbsrc"],
    },
    Council {
        id: "esrc",
        name: "Economic and Social Research Council",
        filter: "esrc",
        keywords: &["economic", "social", "esrc"],
    },
    Council {
        id: "epsrc",
        name: "Engineering and Physical Sciences Research Council",
        filter: "epsrc",
        keywords: &["engineering", "physical", "epsrc"],
    },
    Council {
        id: "mrc",
        name: "Medical Research Council",
        filter: "mrc",
        keywords: &["medical", "health", "mrc"],
    },
    Council {
        id: "nerc",
        name: "Natural Environment Research Council",
        filter: "nerc",
        keywords: &["environment", "natural", "nerc"],
    },
    Council {
        id: "stfc",
        name: "Science and Technology Facilities Council",
        filter: "stfc",
        keywords: &["science", "technology", "facilities", "stfc"],
    },
    Council {
        id: "innovate_uk",
        name: "Innovate UK",
        filter: "innovate-uk",
        keywords: &["innovation", "business", "innovate"],
    },
    Council {
        id: "research_england",
        name: "Research England",
        filter: "research-england",
        keywords: &["research-england"],
    },
];

/// Used when neither the listing nor the page identifies a council.
pub static GENERIC_COUNCIL: Council = Council {
    id: "ukri",
    name: "UK Research and Innovation",
    filter: "",
    keywords: &[],
};

const TAG_KEYWORDS: [(&str, &str); 10] = [
    ("fellowship", "fellowship"),
    ("grant", "grant"),
    ("early career", "early-career"),
    ("postdoc", "postdoctoral"),
    ("innovation", "innovation"),
    ("collaboration", "collaboration"),
    ("international", "international"),
    ("equipment", "equipment"),
    ("training", "training"),
    ("network", "networking"),
];

const TITLE_SELECTORS: [&str; 4] = ["h1.page-title", "h1", ".opportunity-title", ".page-header h1"];
const SUMMARY_SELECTORS: [&str; 4] = [".opportunity-summary", ".page-summary", ".lead", ".intro-text"];
const DEADLINE_LABELS: [&str; 3] = ["closing date", "closes", "deadline"];
/// How far past a deadline label a date may appear and still belong to it.
const LABEL_WINDOW: usize = 160;

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

static OPPORTUNITY_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/opportunity/[^/?#]+/?$").expect("opportunity path regex"));

static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)£\s*(\d[\d,]*(?:\.\d+)?)\s*(thousand|million|k|m)?\b(?:\s*(?:-|–|to)\s*£?\s*(\d[\d,]*(?:\.\d+)?)\s*(thousand|million|k|m)?\b)?",
    )
    .expect("amount regex")
});

/// Unprefixed figures only count with a magnitude suffix on the last number, e.g. `50-200 thousand`.
static BARE_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d[\d,]*(?:\.\d+)?)\s*(thousand|million|k|m)?\s*(?:-|–|to)\s*(\d[\d,]*(?:\.\d+)?)\s*(thousand|million|k|m)\b",
    )
    .expect("bare range regex")
});

static BARE_AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d[\d,]*(?:\.\d+)?)\s*(thousand|million|k|m)\b").expect("bare amount regex")
});

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})\s*-?\s*years?\b").expect("duration regex"));

static MONTH_NAME_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2})\s+(january|february|march|april|may|june|july|august|september|october|november|december)\s+(\d{4})\b",
    )
    .expect("month name date regex")
});

static SLASH_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("slash date regex"));

static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b").expect("iso date regex"));

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("email regex")
});

/// Scrapes the UKRI opportunity finder: the paginated listing first, then each council's view.
#[derive(Debug, Clone)]
pub struct UkriAdapter {
    base_url: String,
}

impl UkriAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    async fn collect_detail(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        link: &Url,
        council: Option<&'static Council>,
    ) -> Option<RawScheme> {
        let page = match http.fetch_text(ctx.run_id, UKRI_SOURCE_ID, link.as_str()).await {
            Ok(page) => page,
            Err(err) => {
                warn!(url = %link, error = %err, "opportunity page fetch failed");
                return None;
            }
        };
        match parse_opportunity_detail(&page.body, link, council) {
            Ok(Some(scheme)) => Some(scheme),
            Ok(None) => {
                info!(url = %link, "not an opportunity page, skipping");
                None
            }
            Err(err) => {
                warn!(url = %link, error = %err, "opportunity page parse failed");
                None
            }
        }
    }

    async fn collect_links(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        links: Vec<Url>,
        council: Option<&'static Council>,
        out: &mut Vec<RawScheme>,
    ) {
        for link in &links {
            if let Some(scheme) = self.collect_detail(http, ctx, link, council).await {
                out.push(scheme);
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for UkriAdapter {
    fn source_id(&self) -> &'static str {
        UKRI_SOURCE_ID
    }

    fn category(&self) -> Category {
        Category::Ukri
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::PublicHtml
    }

    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawScheme>, AdapterError> {
        let listing = Url::parse(&self.base_url)?.join(LISTING_PATH)?;
        let mut seen: HashSet<Url> = HashSet::new();
        let mut schemes = Vec::new();
        let mut listing_error: Option<FetchError> = None;

        for page in 1..=ctx.ukri_max_pages.max(1) {
            let url = if page == 1 {
                listing.clone()
            } else {
                listing.join(&format!("page/{page}/"))?
            };
            let body = match http.fetch_text(ctx.run_id, UKRI_SOURCE_ID, url.as_str()).await {
                Ok(fetched) => fetched.body,
                Err(err) if err.is_not_found() => {
                    info!(page, "listing page not found, stopping pagination");
                    break;
                }
                Err(err) => {
                    warn!(page, error = %err, "listing page failed, stopping pagination");
                    listing_error = Some(err);
                    break;
                }
            };

            let fresh: Vec<Url> = extract_opportunity_links(&body, &url)?
                .into_iter()
                .filter(|link| seen.insert(link.clone()))
                .collect();
            if fresh.is_empty() {
                info!(page, "no new opportunities, stopping pagination");
                break;
            }
            let new_links = fresh.len();
            self.collect_links(http, ctx, fresh, None, &mut schemes).await;
            info!(page, new_links, total = schemes.len(), "listing page processed");
        }

        for council in COUNCILS.iter() {
            let mut url = listing.clone();
            url.query_pairs_mut()
                .append_pair("filter_council", council.filter);
            let body = match http.fetch_text(ctx.run_id, UKRI_SOURCE_ID, url.as_str()).await {
                Ok(fetched) => fetched.body,
                Err(err) => {
                    warn!(council = council.id, error = %err, "council listing failed");
                    listing_error = Some(err);
                    continue;
                }
            };
            let fresh: Vec<Url> = extract_opportunity_links(&body, &url)?
                .into_iter()
                .filter(|link| seen.insert(link.clone()))
                .collect();
            let new_links = fresh.len();
            self.collect_links(http, ctx, fresh, Some(council), &mut schemes)
                .await;
            info!(council = council.id, new_links, "council listing processed");
        }

        match listing_error {
            Some(err) if schemes.is_empty() => Err(err.into()),
            _ => Ok(schemes),
        }
    }
}

pub fn ukri_adapter() -> UkriAdapter {
    UkriAdapter::new(UKRI_BASE_URL)
}

/// Opportunity detail links on a listing page, absolute and in page order without repeats.
pub fn extract_opportunity_links(html: &str, page_url: &Url) -> Result<Vec<Url>, AdapterError> {
    let document = Html::parse_document(html);
    let anchors = selector("a[href]")?;
    let mut links = Vec::new();
    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if ["filter_", "sort_", "page=", "?"]
            .iter()
            .any(|marker| href.contains(marker))
            || !OPPORTUNITY_PATH_RE.is_match(href)
        {
            continue;
        }
        match page_url.join(href) {
            Ok(link) if !links.contains(&link) => links.push(link),
            Ok(_) => {}
            Err(err) => debug!(href, error = %err, "unjoinable opportunity link"),
        }
    }
    Ok(links)
}

/// Reads one opportunity page. `Ok(None)` means the page is not an opportunity.
pub fn parse_opportunity_detail(
    html: &str,
    page_url: &Url,
    council: Option<&'static Council>,
) -> Result<Option<RawScheme>, AdapterError> {
    let document = Html::parse_document(html);

    let mut title = None;
    for css in TITLE_SELECTORS {
        if let Some(found) = select_first_text(&document, css)? {
            title = Some(found);
            break;
        }
    }
    let Some(title) = title else {
        return Ok(None);
    };
    if title.eq_ignore_ascii_case("funding finder") {
        return Ok(None);
    }

    let page_text = match select_first_text(&document, "main")? {
        Some(main) => main,
        None => clean_text(&document.root_element().text().collect::<Vec<_>>().join(" ")),
    };

    let mut description = None;
    for css in SUMMARY_SELECTORS {
        if let Some(found) = select_first_text(&document, css)? {
            description = Some(found);
            break;
        }
    }
    let description = match description {
        Some(found) => found,
        None => select_all_texts(&document, "p")?
            .into_iter()
            .take(3)
            .collect::<Vec<_>>()
            .join(" "),
    };

    let council = council
        .or_else(|| council_from_text(page_url.path()))
        .or_else(|| council_from_text(&page_text))
        .unwrap_or(&GENERIC_COUNCIL);

    let (min, max) = extract_amount(&page_text).unwrap_or((0, 0));
    let deadline = extract_deadline(&page_text)
        .map(|date| date.format(DEADLINE_FORMAT).to_string())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());

    Ok(Some(RawScheme {
        tags: generate_tags(&title, &description, council.id),
        career_stage: career_stage_from_text(&page_text).as_str().to_string(),
        amount: RawAmount {
            min,
            max,
            duration_years: extract_duration_years(&page_text).unwrap_or(1),
        },
        deadline,
        frequency: DEFAULT_FREQUENCY.to_string(),
        success_rate: None,
        requirements: eligibility_requirements(&document)?,
        source: SchemeSource {
            organization: council.name.to_string(),
            category: Category::Ukri,
            subcategory: council.id.to_string(),
            disciplines: Vec::new(),
            source_url: page_url.to_string(),
            application_url: apply_link(&document, page_url)?.unwrap_or_default(),
            guidelines_url: String::new(),
            contact_email: extract_contact_email(&page_text).unwrap_or_default(),
            contact_phone: String::new(),
        },
        title,
        description,
    }))
}

/// List items following an eligibility heading, up to the next heading.
fn eligibility_requirements(document: &Html) -> Result<Vec<String>, AdapterError> {
    let headings = selector("h2, h3, h4")?;
    let items = selector("li")?;
    let mut requirements = Vec::new();

    for heading in document.select(&headings) {
        let text = heading.text().collect::<String>().to_lowercase();
        if !text.contains("eligib") {
            continue;
        }
        for sibling in heading.next_siblings().filter_map(ElementRef::wrap) {
            match sibling.value().name() {
                "h1" | "h2" | "h3" | "h4" => break,
                "ul" | "ol" => requirements.extend(
                    sibling
                        .select(&items)
                        .map(|li| clean_text(&li.text().collect::<String>()))
                        .filter(|req| !req.is_empty()),
                ),
                _ => {}
            }
        }
    }
    Ok(requirements)
}

fn apply_link(document: &Html, page_url: &Url) -> Result<Option<String>, AdapterError> {
    let anchors = selector("a[href]")?;
    Ok(document
        .select(&anchors)
        .find(|a| {
            let text = a.text().collect::<String>().to_lowercase();
            text.contains("apply") || text.contains("application")
        })
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| page_url.join(href).ok())
        .map(String::from))
}

/// First council whose keywords appear in `text`, in council table order.
pub fn council_from_text(text: &str) -> Option<&'static Council> {
    let lower = text.to_lowercase();
    COUNCILS
        .iter()
        .find(|council| council.keywords.iter().any(|k| lower.contains(k)))
}

pub fn career_stage_from_text(text: &str) -> CareerStage {
    let lower = text.to_lowercase();
    if lower.contains("early career") || lower.contains("postdoc") {
        CareerStage::EarlyCareer
    } else if lower.contains("senior") || lower.contains("professor") {
        CareerStage::Senior
    } else if lower.contains("fellowship") {
        CareerStage::MidCareer
    } else {
        CareerStage::AllStages
    }
}

pub fn generate_tags(title: &str, description: &str, council_id: &str) -> Vec<String> {
    let text = format!("{title} {description}").to_lowercase();
    let mut tags = vec![council_id.to_string()];
    for (keyword, tag) in TAG_KEYWORDS {
        if text.contains(keyword) && !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

/// First `£` figure or range in whole pounds, else the first unprefixed one carrying a
/// `k`/`thousand`/`m`/`million` suffix. A bare lower bound borrows the upper bound's suffix
/// when it is the smaller number, so `£1 to £5 million` reads as millions.
pub fn extract_amount(text: &str) -> Option<(u64, u64)> {
    AMOUNT_RE
        .captures(text)
        .or_else(|| BARE_RANGE_RE.captures(text))
        .or_else(|| BARE_AMOUNT_RE.captures(text))
        .and_then(|caps| amount_from(&caps))
}

fn amount_from(caps: &Captures<'_>) -> Option<(u64, u64)> {
    let low = parse_figure(caps.get(1)?.as_str())?;
    let low_suffix = caps.get(2).map(|m| m.as_str());

    let (min, max) = match caps.get(3).and_then(|m| parse_figure(m.as_str())) {
        Some(high) => {
            let high_suffix = caps.get(4).map(|m| m.as_str());
            let low_suffix = match low_suffix {
                None if low < high => high_suffix,
                other => other,
            };
            (scale(low, low_suffix), scale(high, high_suffix))
        }
        None => {
            let single = scale(low, low_suffix);
            (single, single)
        }
    };
    Some((min.min(max), min.max(max)))
}

fn parse_figure(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok()
}

fn scale(value: f64, suffix: Option<&str>) -> u64 {
    let factor = match suffix.map(str::to_ascii_lowercase).as_deref() {
        Some("k") | Some("thousand") => 1_000.0,
        Some("m") | Some("million") => 1_000_000.0,
        _ => 1.0,
    };
    (value * factor).round() as u64
}

pub fn extract_duration_years(text: &str) -> Option<u32> {
    DURATION_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        .find(|years| (1..=20).contains(years))
}

/// The date following a closing-date label when there is one, otherwise the first date on the page.
pub fn extract_deadline(text: &str) -> Option<NaiveDate> {
    let dates = dates_in(text);
    let lower = text.to_ascii_lowercase();
    let labelled = DEADLINE_LABELS
        .iter()
        .filter_map(|label| lower.find(label))
        .min()
        .and_then(|label_at| {
            dates
                .iter()
                .find(|(at, _)| *at >= label_at && *at - label_at <= LABEL_WINDOW)
        });

    labelled.or_else(|| dates.first()).map(|(_, date)| *date)
}

/// Every valid date in `text` with its byte offset, in reading order.
fn dates_in(text: &str) -> Vec<(usize, NaiveDate)> {
    let mut found = Vec::new();
    for caps in MONTH_NAME_DATE_RE.captures_iter(text) {
        let month = MONTHS
            .iter()
            .position(|m| m.eq_ignore_ascii_case(&caps[2]))
            .map(|i| i as u32 + 1);
        if let (Some(month), Ok(day), Ok(year)) = (month, caps[1].parse(), caps[3].parse()) {
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                found.push((caps.get(0).map_or(0, |m| m.start()), date));
            }
        }
    }
    for caps in SLASH_DATE_RE.captures_iter(text) {
        if let (Ok(day), Ok(month), Ok(year)) = (caps[1].parse(), caps[2].parse(), caps[3].parse()) {
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                found.push((caps.get(0).map_or(0, |m| m.start()), date));
            }
        }
    }
    for caps in ISO_DATE_RE.captures_iter(text) {
        if let (Ok(year), Ok(month), Ok(day)) = (caps[1].parse(), caps[2].parse(), caps[3].parse()) {
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                found.push((caps.get(0).map_or(0, |m| m.start()), date));
            }
        }
    }
    found.sort_by_key(|(at, _)| *at);
    found
}

pub fn extract_contact_email(text: &str) -> Option<String> {
    EMAIL_RE.find(text).map(|m| m.as_str().to_string())
}
