//! Relevance ranking and prompt context assembly
//!
//! An entry's score is the plain sum of four terms:
//!
//! - importance: `metadata.importance * IMPORTANCE_WEIGHT`
//! - recency: `max(0, 1 - age_hours / (24 * retention_days))`
//! - keywords: `KEYWORD_WEIGHT` per query word found as a word in the content
//! - topics: `TOPIC_WEIGHT` per topic tag contained in the query
//!
//! The terms are not normalized against each other. The weights are constants
//! so they can be tuned.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::{MemoryEntry, MemoryTier};
use crate::retention::RetentionPolicy;

pub const IMPORTANCE_WEIGHT: f64 = 2.0;
pub const KEYWORD_WEIGHT: f64 = 0.5;
pub const TOPIC_WEIGHT: f64 = 1.0;

/// Header line of an assembled context block
pub const CONTEXT_HEADER: &str = "Previous interactions:";

/// Filters and limits for a ranking query
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RankOptions {
    pub max_results: usize,
    pub include_short_term: bool,
    pub include_long_term: bool,
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            max_results: 5,
            include_short_term: true,
            include_long_term: true,
            user_id: None,
            channel_id: None,
        }
    }
}

impl RankOptions {
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    fn admits(&self, entry: &MemoryEntry) -> bool {
        let tier_ok = match entry.tier {
            MemoryTier::ShortTerm => self.include_short_term,
            MemoryTier::LongTerm => self.include_long_term,
        };
        tier_ok
            && matches_filter(self.user_id.as_deref(), entry.metadata.user_id.as_deref())
            && matches_filter(
                self.channel_id.as_deref(),
                entry.metadata.channel_id.as_deref(),
            )
    }
}

fn matches_filter(wanted: Option<&str>, actual: Option<&str>) -> bool {
    wanted.map_or(true, |w| actual == Some(w))
}

/// A memory with its relevance score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredMemory {
    pub entry: MemoryEntry,
    pub score: f64,
}

/// Ranked memories plus the context text built from them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedQueryResult {
    pub entries: Vec<ScoredMemory>,
    pub context_text: String,
}

impl RankedQueryResult {
    /// Build a result, rendering relative times against `now`
    pub fn new(entries: Vec<ScoredMemory>, now: DateTime<Utc>) -> Self {
        let context_text = assemble_context(entries.iter().map(|s| &s.entry), now);
        Self {
            entries,
            context_text,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The ranked entries without scores
    pub fn memories(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter().map(|s| &s.entry)
    }
}

/// Recency term: decays linearly from 1 to 0 over the retention window
pub fn recency_score(entry: &MemoryEntry, policy: &RetentionPolicy, now: DateTime<Utc>) -> f64 {
    if policy.retention_days <= 0 {
        return 0.0;
    }
    let age_hours = ((now - entry.timestamp).num_milliseconds() as f64 / 3_600_000.0).max(0.0);
    let window_hours = 24.0 * policy.retention_days as f64;
    (1.0 - age_hours / window_hours).max(0.0)
}

/// Number of query words that also appear as words in the content
pub fn keyword_overlap(query_words: &[String], content: &str) -> usize {
    let content_lower = content.to_lowercase();
    let content_words: HashSet<&str> = content_lower.split_whitespace().collect();
    query_words
        .iter()
        .filter(|w| content_words.contains(w.as_str()))
        .count()
}

/// Number of topic tags contained in the lowercased query
pub fn topic_matches(entry: &MemoryEntry, query_lower: &str) -> usize {
    entry
        .metadata
        .topics
        .iter()
        .filter(|t| query_lower.contains(&t.to_lowercase()))
        .count()
}

/// Composite relevance of one entry
pub fn score_entry(
    entry: &MemoryEntry,
    query_lower: &str,
    query_words: &[String],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> f64 {
    entry.metadata.importance * IMPORTANCE_WEIGHT
        + recency_score(entry, policy, now)
        + keyword_overlap(query_words, &entry.content) as f64 * KEYWORD_WEIGHT
        + topic_matches(entry, query_lower) as f64 * TOPIC_WEIGHT
}

/// Score, sort and truncate the entries of one ledger.
///
/// Highest score first; equal scores put the newer entry first.
pub fn rank(
    entries: &[MemoryEntry],
    query: &str,
    options: &RankOptions,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<ScoredMemory> {
    let query_lower = query.to_lowercase();
    let query_words: Vec<String> = query_lower.split_whitespace().map(str::to_string).collect();

    let mut scored: Vec<ScoredMemory> = entries
        .iter()
        .filter(|e| options.admits(e))
        .map(|e| ScoredMemory {
            score: score_entry(e, &query_lower, &query_words, policy, now),
            entry: e.clone(),
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.entry.timestamp.cmp(&a.entry.timestamp))
    });
    scored.truncate(options.max_results);
    scored
}

/// Coarse "time ago" label: days, else hours, else minutes, else "Just now"
pub fn relative_time_label(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now - timestamp;
    if age.num_days() >= 1 {
        format!("{} ago", plural(age.num_days(), "day"))
    } else if age.num_hours() >= 1 {
        format!("{} ago", plural(age.num_hours(), "hour"))
    } else if age.num_minutes() >= 1 {
        format!("{} ago", plural(age.num_minutes(), "minute"))
    } else {
        "Just now".to_string()
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

/// Format entries for injection into a prompt. No entries gives an empty
/// string.
pub fn assemble_context<'a>(
    entries: impl IntoIterator<Item = &'a MemoryEntry>,
    now: DateTime<Utc>,
) -> String {
    let lines: Vec<String> = entries
        .into_iter()
        .map(|e| format!("{}: {}", relative_time_label(e.timestamp, now), e.content))
        .collect();

    if lines.is_empty() {
        return String::new();
    }
    format!("{}\n{}", CONTEXT_HEADER, lines.join("\n"))
}
