//! Source descriptors, extraction profiles, and page collectors.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use gdt_core::{Opportunity, SourceType};
use gdt_storage::HttpFetcher;
use regex::{Regex, RegexBuilder};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::warn;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gdt-sources";

const UNKNOWN_TITLE: &str = "Unknown Title";

/// Network sources consumed at pipeline start, usually from `sources.yaml`.
/// The static catalog is compiled in and does not appear here.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceDescriptor {
    /// Agency or foundation display name; becomes the record's `agency`.
    pub name: String,
    pub source_type: SourceType,
    pub url: String,
    /// Href filter for index-page links; required for agency-style sources.
    #[serde(default)]
    pub link_pattern: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

pub fn load_source_registry(path: impl AsRef<Path>) -> anyhow::Result<SourceRegistry> {
    use anyhow::Context;
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Ordered lead patterns and validity bounds for one source type. The table
/// below is the single place extraction behavior varies by origin.
#[derive(Debug)]
pub struct ExtractionProfile {
    pub deadline_patterns: Vec<Regex>,
    pub amount_patterns: Vec<Regex>,
    /// Inclusive plausible award range; values outside are discarded.
    pub amount_bounds: (u64, u64),
    pub description_limit: usize,
    /// Cap on candidate links (or sections) inspected per source.
    pub max_links: usize,
    /// Fixed politeness delay between successive fetches to this origin.
    pub fetch_delay: Duration,
    /// Substrings a resolved link must contain to count as a grant page.
    pub page_indicators: &'static [&'static str],
}

const DATE_TOKEN: &str = r"(\w+\s+\d{1,2},?\s+\d{4})";

fn lead_patterns(leads: &[&str]) -> Vec<Regex> {
    leads
        .iter()
        .map(|lead| {
            RegexBuilder::new(&format!("{lead}{DATE_TOKEN}"))
                .case_insensitive(true)
                .build()
                .expect("valid pattern literal")
        })
        .collect()
}

fn amount_patterns(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .expect("valid pattern literal")
        })
        .collect()
}

pub fn extraction_profile(source_type: SourceType) -> ExtractionProfile {
    match source_type {
        SourceType::Nih => ExtractionProfile {
            deadline_patterns: lead_patterns(&[
                r"application.*due.*?",
                r"deadline.*?",
                r"submit.*by.*?",
                r"due\s+date.*?",
            ]),
            amount_patterns: amount_patterns(&[
                r"\$([0-9,]+(?:\.[0-9]{2})?)",
                r"award.*?([0-9,]+)",
                r"budget.*?([0-9,]+)",
            ]),
            amount_bounds: (1_000, 10_000_000),
            description_limit: 500,
            max_links: 20,
            fetch_delay: Duration::from_secs(1),
            page_indicators: &[],
        },
        SourceType::Nsf => ExtractionProfile {
            deadline_patterns: lead_patterns(&[
                r"proposal.*due.*?",
                r"deadline.*?",
                r"submit.*by.*?",
                r"full\s+proposal.*?",
            ]),
            amount_patterns: amount_patterns(&[
                r"\$([0-9,]+(?:\.[0-9]{2})?)",
                r"award.*?([0-9,]+)",
                r"maximum.*?([0-9,]+)",
            ]),
            amount_bounds: (5_000, 5_000_000),
            description_limit: 500,
            max_links: 15,
            fetch_delay: Duration::from_secs(1),
            page_indicators: &["solicitation", "funding", "pubs", "nsf.gov"],
        },
        SourceType::Foundation => ExtractionProfile {
            deadline_patterns: lead_patterns(&[
                r"deadline.*?",
                r"due.*?",
                r"apply.*by.*?",
                r"submission.*?",
            ]),
            amount_patterns: amount_patterns(&[r"\$([0-9,]+)"]),
            amount_bounds: (1_000, 10_000_000),
            description_limit: 300,
            max_links: 5,
            fetch_delay: Duration::from_secs(2),
            page_indicators: &[],
        },
        SourceType::Static => ExtractionProfile {
            deadline_patterns: Vec::new(),
            amount_patterns: Vec::new(),
            amount_bounds: (1_000, 10_000_000),
            description_limit: 500,
            max_links: 0,
            fetch_delay: Duration::ZERO,
            page_indicators: &[],
        },
    }
}

/// Parse a captured date token against the two accepted formats. Absence is
/// the normal outcome for a token that merely looks date-like.
pub fn parse_date_token(token: &str) -> Option<NaiveDate> {
    let token = token.trim();
    for format in ["%B %d, %Y", "%B %d %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(token, format) {
            return Some(date);
        }
    }
    None
}

fn to_deadline(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Union of matches over the profile's ordered deadline patterns. Only dates
/// strictly after `now` are retained; unparsable tokens are skipped.
pub fn extract_deadlines(
    text: &str,
    profile: &ExtractionProfile,
    now: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let mut deadlines = Vec::new();
    for pattern in &profile.deadline_patterns {
        for caps in pattern.captures_iter(text) {
            let Some(token) = caps.get(1) else { continue };
            let Some(date) = parse_date_token(token.as_str()) else {
                continue;
            };
            let deadline = to_deadline(date);
            if deadline > now && !deadlines.contains(&deadline) {
                deadlines.push(deadline);
            }
        }
    }
    deadlines
}

/// Captured tokens have separators and currency sigils stripped and must
/// parse as integers inside the profile's plausible range.
pub fn extract_amounts(text: &str, profile: &ExtractionProfile) -> Vec<u64> {
    let (low, high) = profile.amount_bounds;
    let mut amounts = Vec::new();
    for pattern in &profile.amount_patterns {
        for caps in pattern.captures_iter(text) {
            let Some(token) = caps.get(1) else { continue };
            let cleaned = token.as_str().replace([',', '$'], "");
            let Ok(value) = cleaned.parse::<u64>() else {
                continue;
            };
            if value >= low && value <= high && !amounts.contains(&value) {
                amounts.push(value);
            }
        }
    }
    amounts
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .map(|n| n.text().collect::<String>())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn select_first_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// First heading, else the page title, else the sentinel.
pub fn extract_title(document: &Html) -> String {
    select_first_text(document, "h1")
        .or_else(|| select_first_text(document, "title"))
        .unwrap_or_else(|| UNKNOWN_TITLE.to_string())
}

/// Page-level meta description, else the first paragraph of substance.
pub fn extract_description(document: &Html, limit: usize) -> String {
    if let Some(content) = select_first_attr(document, r#"meta[name="description"]"#, "content") {
        return truncate_chars(&content, limit);
    }
    let Ok(sel) = Selector::parse("p") else {
        return String::new();
    };
    for paragraph in document.select(&sel).take(5) {
        let text = paragraph.text().collect::<String>();
        let text = text.trim();
        if text.len() > 100 {
            return truncate_chars(text, limit);
        }
    }
    String::new()
}

/// One candidate emitted by a collector: raw material for field extraction.
#[derive(Debug, Clone)]
pub struct RawCandidate {
    pub title: String,
    pub url: String,
    pub text: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CollectContext {
    pub run_id: Uuid,
    pub now: DateTime<Utc>,
}

/// A network source. Fetch failures are logged and yield zero candidates; a
/// collector never aborts the run.
#[async_trait]
pub trait SourceCollector: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    async fn collect(&self, http: &HttpFetcher, ctx: &CollectContext) -> Vec<RawCandidate>;
}

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("source {0} requires a link_pattern")]
    MissingLinkPattern(String),
    #[error("source {0}: invalid link_pattern: {1}")]
    InvalidLinkPattern(String, regex::Error),
    #[error("the static catalog is compiled in, not fetched")]
    StaticNotFetchable,
}

pub fn collector_for(
    descriptor: &SourceDescriptor,
) -> Result<Box<dyn SourceCollector>, CollectorError> {
    match descriptor.source_type {
        SourceType::Nih | SourceType::Nsf => Ok(Box::new(AgencyPageCollector::new(
            descriptor.clone(),
        )?)),
        SourceType::Foundation => {
            Ok(Box::new(FoundationPageCollector::new(descriptor.clone())))
        }
        SourceType::Static => Err(CollectorError::StaticNotFetchable),
    }
}

/// Index page of announcement links, one detail fetch per link.
pub struct AgencyPageCollector {
    descriptor: SourceDescriptor,
    profile: ExtractionProfile,
    link_pattern: Regex,
}

impl AgencyPageCollector {
    pub fn new(descriptor: SourceDescriptor) -> Result<Self, CollectorError> {
        let raw = descriptor
            .link_pattern
            .as_deref()
            .ok_or_else(|| CollectorError::MissingLinkPattern(descriptor.name.clone()))?;
        let link_pattern = RegexBuilder::new(raw)
            .case_insensitive(true)
            .build()
            .map_err(|e| CollectorError::InvalidLinkPattern(descriptor.name.clone(), e))?;
        let profile = extraction_profile(descriptor.source_type);
        Ok(Self {
            descriptor,
            profile,
            link_pattern,
        })
    }
}

fn extract_links(
    html: &str,
    base: &str,
    pattern: &Regex,
    indicators: &[&str],
    max_links: usize,
) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let Ok(base) = Url::parse(base) else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for anchor in document.select(&sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !pattern.is_match(href) {
            continue;
        }
        let Ok(resolved) = base.join(href) else { continue };
        let resolved = resolved.to_string();
        let lowered = resolved.to_lowercase();
        if !indicators.is_empty() && !indicators.iter().any(|i| lowered.contains(i)) {
            continue;
        }
        if !links.contains(&resolved) {
            links.push(resolved);
        }
        if links.len() == max_links {
            break;
        }
    }
    links
}

fn page_candidate(html: &str, url: &str, description_limit: usize) -> RawCandidate {
    let document = Html::parse_document(html);
    let title = extract_title(&document);
    let description = extract_description(&document, description_limit);
    let text = document.root_element().text().collect::<String>();
    RawCandidate {
        title,
        url: url.to_string(),
        text,
        description,
    }
}

#[async_trait]
impl SourceCollector for AgencyPageCollector {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn collect(&self, http: &HttpFetcher, ctx: &CollectContext) -> Vec<RawCandidate> {
        let name = self.descriptor.name.as_str();
        let index = match http.fetch_text(ctx.run_id, name, &self.descriptor.url).await {
            Ok(body) => body,
            Err(err) => {
                warn!(source = name, error = %err, "index fetch failed");
                return Vec::new();
            }
        };

        let targets = extract_links(
            &index,
            &self.descriptor.url,
            &self.link_pattern,
            self.profile.page_indicators,
            self.profile.max_links,
        );

        let mut candidates = Vec::new();
        for (i, target) in targets.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.profile.fetch_delay).await;
            }
            match http.fetch_text(ctx.run_id, name, target).await {
                Ok(body) => {
                    candidates.push(page_candidate(&body, target, self.profile.description_limit));
                }
                Err(err) => {
                    warn!(source = name, url = target.as_str(), error = %err, "detail fetch failed");
                }
            }
        }
        candidates
    }
}

/// One foundation page; each grant-ish section becomes a candidate.
pub struct FoundationPageCollector {
    descriptor: SourceDescriptor,
    profile: ExtractionProfile,
}

impl FoundationPageCollector {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        let profile = extraction_profile(descriptor.source_type);
        Self {
            descriptor,
            profile,
        }
    }
}

const SECTION_CLASS_HINTS: [&str; 3] = ["grant", "funding", "opportunity"];

fn heading_text(element: ElementRef<'_>) -> Option<String> {
    let sel = Selector::parse("h1, h2, h3, h4").ok()?;
    element
        .select(&sel)
        .next()
        .map(|n| n.text().collect::<String>())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn section_candidates(html: &str, url: &str, description_limit: usize, max_sections: usize) -> Vec<RawCandidate> {
    let document = Html::parse_document(html);
    let Ok(sel) = Selector::parse("div, section") else {
        return Vec::new();
    };

    let mut candidates = Vec::new();
    for element in document.select(&sel) {
        let Some(class) = element.value().attr("class") else {
            continue;
        };
        let class = class.to_lowercase();
        if !SECTION_CLASS_HINTS.iter().any(|hint| class.contains(hint)) {
            continue;
        }
        let Some(title) = heading_text(element) else {
            continue;
        };
        let text = element.text().collect::<String>();
        let description = truncate_chars(text.trim(), description_limit);
        candidates.push(RawCandidate {
            title,
            url: url.to_string(),
            text,
            description,
        });
        if candidates.len() == max_sections {
            break;
        }
    }
    candidates
}

#[async_trait]
impl SourceCollector for FoundationPageCollector {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn collect(&self, http: &HttpFetcher, ctx: &CollectContext) -> Vec<RawCandidate> {
        let name = self.descriptor.name.as_str();
        match http.fetch_text(ctx.run_id, name, &self.descriptor.url).await {
            Ok(body) => section_candidates(
                &body,
                &self.descriptor.url,
                self.profile.description_limit,
                self.profile.max_links,
            ),
            Err(err) => {
                warn!(source = name, error = %err, "page fetch failed");
                Vec::new()
            }
        }
    }
}

/// Run extraction over a collected candidate and assemble a record. `None`
/// when the source's keep-rule rejects the candidate: foundation sections
/// must carry a deadline or mention a grant in the title.
pub fn candidate_to_record(
    candidate: &RawCandidate,
    source: &SourceDescriptor,
    now: DateTime<Utc>,
) -> Option<Opportunity> {
    if candidate.title.trim().is_empty() {
        return None;
    }
    let profile = extraction_profile(source.source_type);
    let deadlines = extract_deadlines(&candidate.text, &profile, now);
    let amounts = extract_amounts(&candidate.text, &profile);

    if source.source_type == SourceType::Foundation
        && deadlines.is_empty()
        && !candidate.title.to_lowercase().contains("grant")
    {
        return None;
    }

    let mut record = Opportunity::new(
        candidate.title.clone(),
        source.name.clone(),
        candidate.url.clone(),
        source.source_type,
        now,
    );
    record.deadlines = deadlines;
    record.amounts = amounts;
    record.description = candidate.description.clone();
    Some(record)
}

/// Next future occurrence of each `"Month Day"` entry, one per parsable
/// input; an entry whose date this year has passed rolls to next year.
pub fn recurring_deadlines(month_days: &[&str], now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    month_days
        .iter()
        .filter_map(|entry| next_occurrence(entry, now))
        .collect()
}

fn next_occurrence(month_day: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let year = now.year();
    let this_year = NaiveDate::parse_from_str(&format!("{month_day} {year}"), "%B %d %Y").ok()?;
    let candidate = to_deadline(this_year);
    if candidate > now {
        return Some(candidate);
    }
    let next_year = year + 1;
    NaiveDate::parse_from_str(&format!("{month_day} {next_year}"), "%B %d %Y")
        .ok()
        .map(to_deadline)
}

struct CatalogEntry {
    title: &'static str,
    agency: &'static str,
    url: &'static str,
    recurring: &'static [&'static str],
    amounts: &'static [u64],
    description: &'static str,
    eligibility: &'static [&'static str],
}

const CATALOG: [CatalogEntry; 6] = [
    CatalogEntry {
        title: "NIH F31 Predoctoral Fellowship",
        agency: "NIH",
        url: "https://grants.nih.gov/grants/guide/pa-files/PA-23-271.html",
        recurring: &["April 8", "August 8", "December 8"],
        amounts: &[25_000, 30_000],
        description: "Predoctoral fellowships for graduate students conducting dissertation research.",
        eligibility: &["graduate student", "phd"],
    },
    CatalogEntry {
        title: "NIH F32 Postdoctoral Fellowship",
        agency: "NIH",
        url: "https://grants.nih.gov/grants/guide/pa-files/PA-23-272.html",
        recurring: &["April 8", "August 8", "December 8"],
        amounts: &[50_000, 60_000],
        description: "Postdoctoral fellowships for recent PhD recipients.",
        eligibility: &["postdoc", "recent phd"],
    },
    CatalogEntry {
        title: "NIH K01 Career Development Award",
        agency: "NIH",
        url: "https://grants.nih.gov/grants/guide/pa-files/PA-23-273.html",
        recurring: &["February 12", "June 12", "October 12"],
        amounts: &[100_000, 150_000],
        description: "Career development awards for early-career investigators.",
        eligibility: &["assistant professor", "early career"],
    },
    CatalogEntry {
        title: "NSF Graduate Research Fellowship",
        agency: "NSF",
        url: "https://www.nsfgrfp.org/",
        recurring: &["October 15"],
        amounts: &[37_000, 46_000],
        description: "Fellowship for outstanding graduate students in STEM fields.",
        eligibility: &["graduate student", "early graduate"],
    },
    CatalogEntry {
        title: "Brain & Behavior Research Foundation Young Investigator Grant",
        agency: "Brain & Behavior Research Foundation",
        url: "https://www.bbrfoundation.org/grants-prizes/young-investigator-grants",
        recurring: &["September 15"],
        amounts: &[70_000],
        description: "Grants for early-career investigators in brain and behavior research.",
        eligibility: &["postdoc", "assistant professor"],
    },
    CatalogEntry {
        title: "Simons Foundation Autism Research Initiative (SFARI)",
        agency: "Simons Foundation",
        url: "https://www.sfari.org/grant-opportunities/",
        recurring: &["January 15", "July 15"],
        amounts: &[100_000, 300_000],
        description: "Research grants focused on autism spectrum disorders.",
        eligibility: &["assistant professor", "associate professor", "professor"],
    },
];

/// Known recurring programs; no network. Deadlines are computed fresh each
/// run so they are always in the future.
pub fn static_catalog(now: DateTime<Utc>) -> Vec<Opportunity> {
    CATALOG
        .iter()
        .map(|entry| {
            let mut record = Opportunity::new(
                entry.title,
                entry.agency,
                entry.url,
                SourceType::Static,
                now,
            );
            record.deadlines = recurring_deadlines(entry.recurring, now);
            record.amounts = entry.amounts.to_vec();
            record.description = entry.description.to_string();
            record.eligibility = entry.eligibility.iter().map(|s| s.to_string()).collect();
            record
        })
        .collect()
}
