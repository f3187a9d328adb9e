//! Core domain model for the grant deadline tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gdt-core";

/// Origin class of a record; selects the extraction profile applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Static,
    Nih,
    Nsf,
    Foundation,
}

/// Deduplication key: lowercased/trimmed title paired with lowercased agency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    title: String,
    agency: String,
}

impl IdentityKey {
    pub fn new(title: &str, agency: &str) -> Self {
        Self {
            title: title.trim().to_lowercase(),
            agency: agency.to_lowercase(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn agency(&self) -> &str {
        &self.agency
    }
}

/// Deterministic record id derived from the identity key; stable across runs
/// and processes.
pub fn stable_record_id(key: &IdentityKey) -> Uuid {
    let source = format!("{}:{}", key.agency, key.title);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
}

/// A funding opportunity as collected, extracted, and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub title: String,
    pub agency: String,
    pub source_url: String,
    pub source_type: SourceType,
    /// Only dates strictly after collection time survive extraction.
    #[serde(default)]
    pub deadlines: Vec<DateTime<Utc>>,
    /// Plausible award figures, bounded per source type at extraction.
    #[serde(default)]
    pub amounts: Vec<u64>,
    #[serde(default)]
    pub description: String,
    /// Empty means open to all career stages.
    #[serde(default)]
    pub eligibility: Vec<String>,
    pub last_updated: DateTime<Utc>,
    /// Derived tier 0-5, recomputed every run; persisted for the
    /// presentation layer but never authoritative.
    #[serde(default)]
    pub urgency: u8,
}

impl Opportunity {
    pub fn new(
        title: impl Into<String>,
        agency: impl Into<String>,
        source_url: impl Into<String>,
        source_type: SourceType,
        last_updated: DateTime<Utc>,
    ) -> Self {
        let title = title.into();
        let agency = agency.into();
        let id = stable_record_id(&IdentityKey::new(&title, &agency));
        Self {
            id,
            title,
            agency,
            source_url: source_url.into(),
            source_type,
            deadlines: Vec::new(),
            amounts: Vec::new(),
            description: String::new(),
            eligibility: Vec::new(),
            last_updated,
            urgency: 0,
        }
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(&self.title, &self.agency)
    }

    /// Earliest deadline still strictly ahead of `now`. Persisted records can
    /// carry deadlines that have since passed; those never count.
    pub fn nearest_future_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.deadlines.iter().filter(|d| **d > now).min().copied()
    }
}

/// The configured researcher profile the relevance filter matches against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchProfile {
    pub research_areas: Vec<String>,
    pub career_stage: String,
    pub institution_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn identity_key_normalizes_title_and_agency() {
        let a = IdentityKey::new("  NIH F32 Postdoctoral Fellowship ", "NIH");
        let b = IdentityKey::new("nih f32 postdoctoral fellowship", "nih");
        assert_eq!(a, b);
        assert_eq!(a.title(), "nih f32 postdoctoral fellowship");
        assert_eq!(a.agency(), "nih");
    }

    #[test]
    fn record_ids_are_stable_and_key_derived() {
        let first = Opportunity::new(
            "Young Investigator Grant",
            "BBRF",
            "https://x",
            SourceType::Foundation,
            ts(2026, 3, 1),
        );
        let second = Opportunity::new(
            "  young investigator grant ",
            "bbrf",
            "https://y",
            SourceType::Static,
            ts(2026, 5, 1),
        );
        assert_eq!(first.id, second.id);

        let other_agency = Opportunity::new(
            "Young Investigator Grant",
            "Simons Foundation",
            "https://x",
            SourceType::Foundation,
            ts(2026, 3, 1),
        );
        assert_ne!(first.id, other_agency.id);
    }

    #[test]
    fn nearest_future_deadline_skips_past_dates() {
        let now = ts(2026, 6, 1);
        let mut record = Opportunity::new("t", "a", "u", SourceType::Nih, now);
        record.deadlines = vec![ts(2026, 1, 15), ts(2026, 9, 1), ts(2026, 7, 1)];
        assert_eq!(record.nearest_future_deadline(now), Some(ts(2026, 7, 1)));

        record.deadlines = vec![ts(2026, 1, 15)];
        assert_eq!(record.nearest_future_deadline(now), None);
    }
}
