//! The batch pipeline: relevance filtering, state merge, urgency ranking,
//! and run orchestration.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as TimeDelta, Utc};
use gdt_core::{IdentityKey, Opportunity, ResearchProfile};
use gdt_sources::{
    candidate_to_record, collector_for, extraction_profile, load_source_registry, static_catalog,
    CollectContext, SourceCollector,
};
use gdt_storage::{HttpClientConfig, HttpFetcher, SnapshotStore};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gdt-pipeline";

pub const DEFAULT_STALENESS_DAYS: i64 = 7;

/// Closed broad-domain vocabulary; any hit counts as topical relevance even
/// when no configured research area matches.
pub const DOMAIN_KEYWORDS: [&str; 11] = [
    "brain",
    "neural",
    "neuroscience",
    "cognitive",
    "behavior",
    "fmri",
    "eeg",
    "imaging",
    "psychology",
    "psychiatry",
    "mental health",
];

/// Substring relevance test: a topical hit (configured area or broad domain
/// vocabulary) gated by career eligibility. Records without eligibility tags
/// are open to all stages; tagged records need a bidirectional substring
/// overlap with the configured stage.
pub fn is_relevant(record: &Opportunity, profile: &ResearchProfile) -> bool {
    let haystack = format!("{} {}", record.title, record.description).to_lowercase();

    let area_match = profile
        .research_areas
        .iter()
        .filter(|area| !area.is_empty())
        .any(|area| haystack.contains(&area.to_lowercase()));
    let domain_match = DOMAIN_KEYWORDS.iter().any(|kw| haystack.contains(kw));

    let career_match = if record.eligibility.is_empty() {
        true
    } else {
        let stage = profile.career_stage.to_lowercase();
        record.eligibility.iter().any(|tag| {
            let tag = tag.to_lowercase();
            tag.contains(&stage) || stage.contains(&tag)
        })
    };

    (area_match || domain_match) && career_match
}

/// Baseline records still strictly within the trailing staleness window;
/// a record exactly `window_days` old is pruned.
pub fn within_staleness_window(
    records: Vec<Opportunity>,
    now: DateTime<Utc>,
    window_days: i64,
) -> Vec<Opportunity> {
    let cutoff = now - TimeDelta::days(window_days);
    records
        .into_iter()
        .filter(|r| r.last_updated > cutoff)
        .collect()
}

/// Group baseline ∪ fresh by identity key; the greatest `last_updated` wins
/// each group, ties keep the first-seen record. Output preserves first-seen
/// order (the ranker re-sorts afterwards).
pub fn merge_records(baseline: Vec<Opportunity>, fresh: Vec<Opportunity>) -> Vec<Opportunity> {
    let mut order: Vec<IdentityKey> = Vec::new();
    let mut by_key: HashMap<IdentityKey, Opportunity> = HashMap::new();

    for record in baseline.into_iter().chain(fresh) {
        match by_key.entry(record.identity_key()) {
            Entry::Vacant(slot) => {
                order.push(slot.key().clone());
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if record.last_updated > slot.get().last_updated {
                    slot.insert(record);
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

/// Tier 0-5 from the nearest future deadline; boundaries are inclusive on
/// the lower tier (exactly 30 days out is tier 5).
pub fn urgency_tier(record: &Opportunity, now: DateTime<Utc>) -> u8 {
    let Some(nearest) = record.nearest_future_deadline(now) else {
        return 0;
    };
    let days_until = (nearest - now).num_days();
    match days_until {
        d if d <= 30 => 5,
        d if d <= 90 => 4,
        d if d <= 180 => 3,
        d if d <= 365 => 2,
        _ => 1,
    }
}

/// The ranked output handed to the presentation layer. Records are sorted by
/// (urgency descending, nearest future deadline ascending, deadline-less
/// last), so the urgency buckets are contiguous slices.
#[derive(Debug, Clone, Serialize)]
pub struct RankedSnapshot {
    pub generated_at: DateTime<Utc>,
    pub records: Vec<Opportunity>,
}

impl RankedSnapshot {
    fn split_at_tier(&self, tier: u8) -> usize {
        self.records.partition_point(|r| r.urgency >= tier)
    }

    /// Tier 4-5: deadline within 90 days.
    pub fn urgent(&self) -> &[Opportunity] {
        &self.records[..self.split_at_tier(4)]
    }

    /// Tier 2-3: deadline within a year.
    pub fn upcoming(&self) -> &[Opportunity] {
        &self.records[self.split_at_tier(4)..self.split_at_tier(2)]
    }

    /// Tier 0-1: far out or no deadline at all.
    pub fn future(&self) -> &[Opportunity] {
        &self.records[self.split_at_tier(2)..]
    }
}

pub fn rank_records(mut records: Vec<Opportunity>, now: DateTime<Utc>) -> RankedSnapshot {
    for record in &mut records {
        record.urgency = urgency_tier(record, now);
    }
    records.sort_by(|a, b| {
        b.urgency.cmp(&a.urgency).then_with(|| {
            match (a.nearest_future_deadline(now), b.nearest_future_deadline(now)) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        })
    });
    RankedSnapshot {
        generated_at: now,
        records,
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub profile: ResearchProfile,
    pub force_refresh: bool,
    pub snapshot_path: PathBuf,
    pub registry_path: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub staleness_days: i64,
}

impl RunConfig {
    pub fn from_env() -> Self {
        let research_areas = std::env::var("RESEARCH_AREAS")
            .unwrap_or_else(|_| "neuroscience,cognitive science,brain imaging".to_string())
            .split(',')
            .map(|area| area.trim().to_lowercase())
            .filter(|area| !area.is_empty())
            .collect();

        Self {
            profile: ResearchProfile {
                research_areas,
                career_stage: std::env::var("CAREER_STAGE")
                    .unwrap_or_else(|_| "postdoc".to_string())
                    .to_lowercase(),
                institution_type: std::env::var("INSTITUTION_TYPE")
                    .unwrap_or_else(|_| "university".to_string())
                    .to_lowercase(),
            },
            force_refresh: std::env::var("FORCE_REFRESH")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            snapshot_path: std::env::var("GRANTS_SNAPSHOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("grant_docs/grants.json")),
            registry_path: std::env::var("GRANT_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            http_timeout_secs: std::env::var("GDT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("GDT_USER_AGENT")
                .unwrap_or_else(|_| "gdt-bot/0.1".to_string()),
            staleness_days: DEFAULT_STALENESS_DAYS,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub baseline_records: usize,
    pub collected_records: usize,
    pub merged_records: usize,
    pub urgent: usize,
    pub upcoming: usize,
    pub future: usize,
    pub snapshot_path: String,
}

#[derive(Debug)]
pub struct RunOutput {
    pub summary: RunSummary,
    pub ranked: RankedSnapshot,
}

pub struct TrackerPipeline {
    config: RunConfig,
    store: SnapshotStore,
    http: HttpFetcher,
}

impl TrackerPipeline {
    pub fn new(config: RunConfig) -> Result<Self> {
        let store = SnapshotStore::new(config.snapshot_path.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            http,
        })
    }

    /// One full batch run. Sequential throughout; the snapshot write at the
    /// end is the run's only durable side effect and a failure there is
    /// fatal.
    pub async fn run_once(&self) -> Result<RunOutput> {
        let started_at = Utc::now();
        let now = started_at;
        let run_id = Uuid::new_v4();
        let ctx = CollectContext { run_id, now };

        let persisted = self
            .store
            .load()
            .await
            .context("loading snapshot baseline")?;
        let persisted_count = persisted.len();
        let baseline = if self.config.force_refresh {
            Vec::new()
        } else {
            within_staleness_window(persisted, now, self.config.staleness_days)
        };
        info!(
            %run_id,
            persisted = persisted_count,
            baseline = baseline.len(),
            force_refresh = self.config.force_refresh,
            "baseline loaded"
        );

        let mut fresh: Vec<Opportunity> = static_catalog(now)
            .into_iter()
            .filter(|record| is_relevant(record, &self.config.profile))
            .collect();

        let registry = load_source_registry(&self.config.registry_path)?;
        for descriptor in registry.sources.iter().filter(|s| s.enabled) {
            let collector = match collector_for(descriptor) {
                Ok(collector) => collector,
                Err(err) => {
                    warn!(source = descriptor.name.as_str(), error = %err, "skipping source");
                    continue;
                }
            };

            let candidates = collector.collect(&self.http, &ctx).await;
            let mut kept = 0usize;
            for candidate in &candidates {
                let Some(record) = candidate_to_record(candidate, descriptor, now) else {
                    continue;
                };
                if is_relevant(&record, &self.config.profile) {
                    fresh.push(record);
                    kept += 1;
                }
            }
            info!(
                source = descriptor.name.as_str(),
                candidates = candidates.len(),
                kept,
                "source collected"
            );

            tokio::time::sleep(extraction_profile(descriptor.source_type).fetch_delay).await;
        }

        let baseline_records = baseline.len();
        let collected_records = fresh.len();
        let merged = merge_records(baseline, fresh);
        let merged_records = merged.len();
        let ranked = rank_records(merged, now);

        self.store
            .save(&ranked.records)
            .await
            .context("writing snapshot")?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            baseline_records,
            collected_records,
            merged_records,
            urgent: ranked.urgent().len(),
            upcoming: ranked.upcoming().len(),
            future: ranked.future().len(),
            snapshot_path: self.store.path().display().to_string(),
        };
        Ok(RunOutput { summary, ranked })
    }
}

pub async fn run_track_once_from_env() -> Result<RunOutput> {
    let pipeline = TrackerPipeline::new(RunConfig::from_env())?;
    pipeline.run_once().await
}

/// Markdown brief over the current snapshot, for quick terminal review.
pub async fn report_from_env() -> Result<String> {
    let config = RunConfig::from_env();
    let store = SnapshotStore::new(config.snapshot_path);
    let records = store.load().await.context("loading snapshot")?;
    let ranked = rank_records(records, Utc::now());
    Ok(render_brief(&ranked))
}

fn amount_range(amounts: &[u64]) -> Option<(u64, u64)> {
    let min = amounts.iter().min()?;
    let max = amounts.iter().max()?;
    Some((*min, *max))
}

fn brief_line(record: &Opportunity, now: DateTime<Utc>) -> String {
    let mut line = format!("- **{}** ({})", record.title, record.agency);
    if let Some(deadline) = record.nearest_future_deadline(now) {
        line.push_str(&format!(", next deadline {}", deadline.format("%B %d, %Y")));
    }
    match amount_range(&record.amounts) {
        Some((min, max)) if min == max => line.push_str(&format!(", ${min}")),
        Some((min, max)) => line.push_str(&format!(", ${min}-${max}")),
        None => {}
    }
    line
}

pub fn render_brief(ranked: &RankedSnapshot) -> String {
    let now = ranked.generated_at;
    let mut lines = vec![
        "# Grant Deadline Brief".to_string(),
        String::new(),
        format!("- Generated: {}", now.format("%Y-%m-%d %H:%M UTC")),
        format!(
            "- Opportunities: {} ({} urgent / {} upcoming / {} future)",
            ranked.records.len(),
            ranked.urgent().len(),
            ranked.upcoming().len(),
            ranked.future().len()
        ),
    ];

    let sections: [(&str, &[Opportunity]); 3] = [
        ("Urgent (within 90 days)", ranked.urgent()),
        ("Upcoming (3-12 months)", ranked.upcoming()),
        ("Future", ranked.future()),
    ];
    for (heading, records) in sections {
        if records.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("## {heading}"));
        for record in records {
            lines.push(brief_line(record, now));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gdt_core::SourceType;

    fn ts(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    fn record(title: &str, agency: &str, last_updated: DateTime<Utc>) -> Opportunity {
        Opportunity::new(title, agency, "https://example.org", SourceType::Nih, last_updated)
    }

    fn profile(areas: &[&str], stage: &str) -> ResearchProfile {
        ResearchProfile {
            research_areas: areas.iter().map(|a| a.to_string()).collect(),
            career_stage: stage.to_string(),
            institution_type: "university".to_string(),
        }
    }

    #[test]
    fn untagged_record_with_area_match_is_relevant_for_any_stage() {
        let mut rec = record("Vision Science Award", "NSF", ts(2026, 1, 1));
        rec.description = "Supports research in cognitive science methods.".to_string();
        assert!(is_relevant(&rec, &profile(&["cognitive science"], "medieval falconer")));
    }

    #[test]
    fn domain_keyword_alone_satisfies_the_topic_test() {
        let mut rec = record("Brain Circuits Initiative", "NIH", ts(2026, 1, 1));
        rec.description = String::new();
        assert!(is_relevant(&rec, &profile(&["volcanology"], "postdoc")));
    }

    #[test]
    fn eligibility_tags_must_overlap_the_career_stage() {
        let mut rec = record("Dissertation Award in Neuroscience", "NIH", ts(2026, 1, 1));
        rec.eligibility = vec!["postdoc".to_string()];
        assert!(!is_relevant(&rec, &profile(&["neuroscience"], "graduate student")));

        rec.eligibility = vec!["graduate student".to_string()];
        assert!(is_relevant(&rec, &profile(&["neuroscience"], "graduate student")));

        // Bidirectional: a broader configured stage still overlaps a tag.
        rec.eligibility = vec!["student".to_string()];
        assert!(is_relevant(&rec, &profile(&["neuroscience"], "graduate student")));
    }

    #[test]
    fn topically_irrelevant_records_are_dropped() {
        let mut rec = record("Bridge Engineering Grant", "DOT", ts(2026, 1, 1));
        rec.description = "Concrete fatigue research.".to_string();
        assert!(!is_relevant(&rec, &profile(&["neuroscience"], "postdoc")));
    }

    #[test]
    fn staleness_window_is_strictly_within() {
        let now = ts(2026, 6, 10);
        let records = vec![
            record("fresh", "a", now - TimeDelta::days(6)),
            record("edge", "a", now - TimeDelta::days(7)),
            record("stale", "a", now - TimeDelta::days(8)),
        ];
        let kept = within_staleness_window(records, now, 7);
        let titles: Vec<_> = kept.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["fresh"]);
    }

    #[test]
    fn merge_keeps_the_newer_record_per_identity_key() {
        let mut old = record("NIH F32 Postdoctoral Fellowship", "NIH", ts(2026, 6, 1));
        old.amounts = vec![50_000];
        let mut new = record("nih f32 postdoctoral fellowship ", "nih", ts(2026, 6, 5));
        new.amounts = vec![60_000];

        let merged = merge_records(vec![old], vec![new.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].amounts, vec![60_000]);
        assert_eq!(merged[0].last_updated, new.last_updated);
    }

    #[test]
    fn merge_ties_keep_the_first_seen_record() {
        let when = ts(2026, 6, 1);
        let mut first = record("Award", "NIH", when);
        first.description = "baseline copy".to_string();
        let mut second = record("Award", "NIH", when);
        second.description = "fresh copy".to_string();

        let merged = merge_records(vec![first], vec![second]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].description, "baseline copy");
    }

    #[test]
    fn merge_output_has_unique_identity_keys() {
        let when = ts(2026, 6, 1);
        let baseline = vec![record("A", "NIH", when), record("B", "NSF", when)];
        let fresh = vec![
            record("a ", "nih", when + TimeDelta::days(1)),
            record("C", "NIH", when),
        ];
        let merged = merge_records(baseline, fresh);
        assert_eq!(merged.len(), 3);
        let keys: std::collections::HashSet<_> =
            merged.iter().map(|r| r.identity_key()).collect();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn urgency_boundaries_are_inclusive_on_the_lower_tier() {
        let now = ts(2026, 1, 1);
        let expectations = [
            (30, 5),
            (31, 4),
            (90, 4),
            (91, 3),
            (180, 3),
            (181, 2),
            (365, 2),
            (366, 1),
        ];
        for (days, tier) in expectations {
            let mut rec = record("t", "a", now);
            rec.deadlines = vec![now + TimeDelta::days(days)];
            assert_eq!(urgency_tier(&rec, now), tier, "{days} days out");
        }

        let rec = record("no deadlines", "a", now);
        assert_eq!(urgency_tier(&rec, now), 0);
    }

    #[test]
    fn records_with_only_past_deadlines_classify_as_tier_zero() {
        let now = ts(2026, 6, 1);
        let mut rec = record("expired", "a", now);
        rec.deadlines = vec![ts(2026, 5, 1)];
        assert_eq!(urgency_tier(&rec, now), 0);
    }

    #[test]
    fn ranking_orders_by_tier_then_nearest_deadline_with_deadline_less_last() {
        let now = ts(2026, 1, 1);
        let mut soon = record("soon", "a", now);
        soon.deadlines = vec![now + TimeDelta::days(20)];
        let mut sooner = record("sooner", "b", now);
        sooner.deadlines = vec![now + TimeDelta::days(10)];
        let mut mid = record("mid", "c", now);
        mid.deadlines = vec![now + TimeDelta::days(120)];
        let mut far = record("far", "d", now);
        far.deadlines = vec![now + TimeDelta::days(400)];
        let none = record("none", "e", now);

        let ranked = rank_records(vec![far, soon, none, mid, sooner], now);
        let titles: Vec<_> = ranked.records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["sooner", "soon", "mid", "far", "none"]);

        let urgent: Vec<_> = ranked.urgent().iter().map(|r| r.title.as_str()).collect();
        assert_eq!(urgent, vec!["sooner", "soon"]);
        let upcoming: Vec<_> = ranked.upcoming().iter().map(|r| r.title.as_str()).collect();
        assert_eq!(upcoming, vec!["mid"]);
        let future: Vec<_> = ranked.future().iter().map(|r| r.title.as_str()).collect();
        assert_eq!(future, vec!["far", "none"]);
    }

    #[test]
    fn brief_lists_every_bucket_with_deadline_and_amounts() {
        let now = ts(2026, 1, 1);
        let mut rec = record("SFARI Pilot Award", "Simons Foundation", now);
        rec.deadlines = vec![now + TimeDelta::days(25)];
        rec.amounts = vec![100_000, 300_000];
        let ranked = rank_records(vec![rec], now);

        let brief = render_brief(&ranked);
        assert!(brief.contains("## Urgent"));
        assert!(brief.contains("SFARI Pilot Award"));
        assert!(brief.contains("January 26, 2026"));
        assert!(brief.contains("$100000-$300000"));
    }

    #[tokio::test]
    async fn stale_uncollected_baseline_records_drop_out_of_the_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshot_path = dir.path().join("grants.json");
        let registry_path = dir.path().join("sources.yaml");
        std::fs::write(&registry_path, "sources: []\n").expect("write registry");

        // Seed a baseline record 8 days old.
        let store = SnapshotStore::new(&snapshot_path);
        let old = record("Old Award", "NIH", Utc::now() - TimeDelta::days(8));
        store.save(&[old]).await.expect("seed snapshot");

        // A profile nothing in the static catalog matches, so the run
        // collects zero fresh records.
        let config = RunConfig {
            profile: profile(&["xyzzyology"], "medieval falconer"),
            force_refresh: false,
            snapshot_path: snapshot_path.clone(),
            registry_path,
            http_timeout_secs: 5,
            user_agent: "gdt-test".to_string(),
            staleness_days: 7,
        };
        let pipeline = TrackerPipeline::new(config).expect("pipeline");
        let output = pipeline.run_once().await.expect("run");

        assert_eq!(output.summary.baseline_records, 0);
        assert_eq!(output.summary.collected_records, 0);
        assert!(output.ranked.records.is_empty());

        let persisted = store.load().await.expect("reload");
        assert!(persisted.is_empty());
    }
}
