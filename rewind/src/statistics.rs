//! Cache statistics, computed on demand from the persisted entries.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::persistence::StoredEntry;
use crate::token::CacheStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub response_type: String,
    pub status: CacheStatus,
    pub is_encrypted: bool,
    pub is_compressed: bool,
    pub cache_date: DateTime<Utc>,
    pub expiry_date: DateTime<Utc>,
}

/// Per-type aggregate. Only built for types with at least one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntrySummary {
    pub response_type: String,
    pub fresh_count: usize,
    pub stale_count: usize,
    pub oldest_cache_date: DateTime<Utc>,
    pub latest_cache_date: DateTime<Utc>,
    pub entries: Vec<CacheEntry>,
}

impl CacheEntrySummary {
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    fn from_entries(response_type: String, mut entries: Vec<CacheEntry>) -> Option<Self> {
        entries.sort_by_key(|entry| entry.cache_date);
        let oldest_cache_date = entries.first()?.cache_date;
        let latest_cache_date = entries.last()?.cache_date;
        let fresh_count = entries
            .iter()
            .filter(|entry| entry.status == CacheStatus::Fresh)
            .count();

        Some(Self {
            response_type,
            fresh_count,
            stale_count: entries.len() - fresh_count,
            oldest_cache_date,
            latest_cache_date,
            entries,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatistics {
    pub backend: String,
    pub entry_summaries: Vec<CacheEntrySummary>,
}

impl CacheStatistics {
    pub fn total_entries(&self) -> usize {
        self.entry_summaries.iter().map(|s| s.total()).sum()
    }

    pub fn total_fresh(&self) -> usize {
        self.entry_summaries.iter().map(|s| s.fresh_count).sum()
    }

    pub fn total_stale(&self) -> usize {
        self.entry_summaries.iter().map(|s| s.stale_count).sum()
    }

    pub fn summary_for(&self, response_type: &str) -> Option<&CacheEntrySummary> {
        self.entry_summaries
            .iter()
            .find(|s| s.response_type == response_type)
    }
}

impl fmt::Display for CacheStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Backend: {}", self.backend)?;
        if self.entry_summaries.is_empty() {
            return writeln!(f, "No cached entries.");
        }

        writeln!(
            f,
            "{:<40} {:>7} {:>7} {:>20} {:>20}",
            "TYPE", "FRESH", "STALE", "OLDEST", "LATEST"
        )?;
        writeln!(f, "{}", "-".repeat(98))?;
        for summary in &self.entry_summaries {
            writeln!(
                f,
                "{:<40} {:>7} {:>7} {:>20} {:>20}",
                summary.response_type,
                summary.fresh_count,
                summary.stale_count,
                summary.oldest_cache_date.format("%Y-%m-%d %H:%M:%S"),
                summary.latest_cache_date.format("%Y-%m-%d %H:%M:%S"),
            )?;
        }
        writeln!(f, "{}", "-".repeat(98))?;
        writeln!(
            f,
            "{:<40} {:>7} {:>7}",
            format!("{} entries", self.total_entries()),
            self.total_fresh(),
            self.total_stale()
        )
    }
}

pub struct StatisticsCompiler;

impl StatisticsCompiler {
    /// Group entries by response type (sorted by name) and classify each as
    /// fresh or stale at `now`.
    pub fn compile(backend: &str, entries: Vec<StoredEntry>, now: DateTime<Utc>) -> CacheStatistics {
        let mut groups: BTreeMap<String, Vec<CacheEntry>> = BTreeMap::new();
        for stored in entries {
            let entry = CacheEntry {
                status: CacheStatus::from_expiry(now, stored.key.expiry_date),
                is_encrypted: stored.key.is_encrypted,
                is_compressed: stored.key.is_compressed,
                cache_date: stored.key.cache_date,
                expiry_date: stored.key.expiry_date,
                response_type: stored.type_name.clone(),
            };
            groups.entry(stored.type_name).or_default().push(entry);
        }

        CacheStatistics {
            backend: backend.to_string(),
            entry_summaries: groups
                .into_iter()
                .filter_map(|(name, entries)| CacheEntrySummary::from_entries(name, entries))
                .collect(),
        }
    }
}
