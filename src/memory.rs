//! Memory entries and the per-personality ledger store

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::retention::RetentionPolicy;
use crate::retrieval::{self, RankOptions, RankedQueryResult, ScoredMemory};
use crate::storage::SqliteStorage;

/// Tier of a memory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Recent, size-bounded conversation memory
    ShortTerm,

    /// Durable memory, reached by promotion
    LongTerm,
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryTier::ShortTerm => write!(f, "short_term"),
            MemoryTier::LongTerm => write!(f, "long_term"),
        }
    }
}

impl std::str::FromStr for MemoryTier {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "short_term" => Ok(MemoryTier::ShortTerm),
            "long_term" => Ok(MemoryTier::LongTerm),
            other => Err(crate::error::Error::invalid_input(format!(
                "Unknown memory tier: {}",
                other
            ))),
        }
    }
}

/// Optional facts attached to a memory. Every field has a default so the
/// scorer never has to deal with a missing key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryMetadata {
    /// Discord user the utterance came from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Discord channel the utterance was seen in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,

    /// Weight added to the relevance score (doubled)
    pub importance: f64,

    /// Free-form sentiment tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,

    /// Topic tags matched against queries
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub topics: BTreeSet<String>,
}

impl MemoryMetadata {
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_sentiment(mut self, sentiment: impl Into<String>) -> Self {
        self.sentiment = Some(sentiment.into());
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }
}

/// A single remembered utterance or response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique entry ID
    pub id: Uuid,

    /// What was said
    pub content: String,

    /// When the entry was written
    pub timestamp: DateTime<Utc>,

    /// Current tier
    pub tier: MemoryTier,

    #[serde(default)]
    pub metadata: MemoryMetadata,
}

impl MemoryEntry {
    pub fn new(
        content: impl Into<String>,
        tier: MemoryTier,
        metadata: MemoryMetadata,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            timestamp,
            tier,
            metadata,
        }
    }
}

/// Entry counts and time span for one ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerStats {
    pub short_term: usize,
    pub long_term: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// In-process memory for every personality.
///
/// Each personality owns a ledger: its entries in insertion order. One
/// instance is built at startup and shared behind an `Arc`. All mutation goes
/// through the writer-side methods (`add_memory`, `promote`, `clear`,
/// `sweep_expired`, `restore`); everything else only reads.
///
/// Recency scoring reads the injected clock, so query results change as time
/// passes even when the ledger does not.
pub struct MemoryStore {
    policy: RetentionPolicy,
    clock: Arc<dyn Clock>,
    ledgers: RwLock<HashMap<String, Vec<MemoryEntry>>>,
}

impl MemoryStore {
    /// Create a store using the wall clock
    pub fn new(config: &Config) -> Self {
        Self::with_clock(RetentionPolicy::from(config), Arc::new(SystemClock))
    }

    /// Create a store with an explicit policy and clock
    pub fn with_clock(policy: RetentionPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the retention policy
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Current time according to the store clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<MemoryEntry>>> {
        self.ledgers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<MemoryEntry>>> {
        self.ledgers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a memory to a personality's ledger, creating the ledger if
    /// needed, then enforce the tier limits.
    pub fn add_memory(
        &self,
        personality_id: &str,
        content: impl Into<String>,
        tier: MemoryTier,
        metadata: MemoryMetadata,
    ) -> MemoryEntry {
        let entry = MemoryEntry::new(content, tier, metadata, self.clock.now());

        let mut ledgers = self.write();
        let ledger = ledgers.entry(personality_id.to_string()).or_default();
        ledger.push(entry.clone());
        let evicted = self.policy.enforce_limits(ledger);
        if evicted > 0 {
            tracing::debug!(personality_id, evicted, "Evicted memories over tier limit");
        }

        entry
    }

    /// Remember a user message and the bot's reply, in that order
    pub fn record_exchange(
        &self,
        personality_id: &str,
        user_message: impl Into<String>,
        bot_reply: impl Into<String>,
        metadata: MemoryMetadata,
    ) -> (MemoryEntry, MemoryEntry) {
        let user = self.add_memory(
            personality_id,
            user_message,
            MemoryTier::ShortTerm,
            metadata.clone(),
        );
        let reply = self.add_memory(personality_id, bot_reply, MemoryTier::ShortTerm, metadata);
        (user, reply)
    }

    /// Flip the most recent short-term entry whose content equals
    /// `content_match` to long-term. Returns whether anything changed.
    pub fn promote(&self, personality_id: &str, content_match: &str) -> bool {
        let mut ledgers = self.write();
        let Some(ledger) = ledgers.get_mut(personality_id) else {
            return false;
        };

        let Some(entry) = ledger
            .iter_mut()
            .rev()
            .find(|e| e.tier == MemoryTier::ShortTerm && e.content == content_match)
        else {
            return false;
        };
        entry.tier = MemoryTier::LongTerm;

        let evicted = self.policy.enforce_limits(ledger);
        tracing::debug!(personality_id, evicted, "Promoted memory to long-term");
        true
    }

    /// Remove one tier from a ledger, or the whole ledger when `tier` is
    /// `None`. Returns the number of entries removed.
    pub fn clear(&self, personality_id: &str, tier: Option<MemoryTier>) -> usize {
        let mut ledgers = self.write();
        let removed = match tier {
            None => ledgers.remove(personality_id).map_or(0, |l| l.len()),
            Some(tier) => match ledgers.get_mut(personality_id) {
                Some(ledger) => {
                    let before = ledger.len();
                    ledger.retain(|e| e.tier != tier);
                    before - ledger.len()
                }
                None => 0,
            },
        };
        tracing::info!(personality_id, ?tier, removed, "Cleared memories");
        removed
    }

    /// Drop a personality's ledger entirely
    pub fn reset(&self, personality_id: &str) -> usize {
        self.clear(personality_id, None)
    }

    /// Remove entries older than the retention window from every ledger.
    /// Ledgers left empty are dropped. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut ledgers = self.write();
        let mut removed = 0;
        for ledger in ledgers.values_mut() {
            removed += self.policy.sweep_expired(ledger, now);
        }
        ledgers.retain(|_, ledger| !ledger.is_empty());
        removed
    }

    /// Snapshot of a personality's ledger in insertion order
    pub fn entries(&self, personality_id: &str) -> Vec<MemoryEntry> {
        self.read().get(personality_id).cloned().unwrap_or_default()
    }

    /// Personalities that currently have a ledger, sorted
    pub fn personalities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Entry counts per tier and the time span of a ledger
    pub fn stats(&self, personality_id: &str) -> LedgerStats {
        let ledgers = self.read();
        let Some(ledger) = ledgers.get(personality_id) else {
            return LedgerStats::default();
        };

        LedgerStats {
            short_term: ledger
                .iter()
                .filter(|e| e.tier == MemoryTier::ShortTerm)
                .count(),
            long_term: ledger
                .iter()
                .filter(|e| e.tier == MemoryTier::LongTerm)
                .count(),
            oldest: ledger.iter().map(|e| e.timestamp).min(),
            newest: ledger.iter().map(|e| e.timestamp).max(),
        }
    }

    /// Rank a personality's memories against a query
    pub fn rank(
        &self,
        personality_id: &str,
        query: &str,
        options: &RankOptions,
    ) -> Vec<ScoredMemory> {
        let now = self.clock.now();
        let ledgers = self.read();
        match ledgers.get(personality_id) {
            Some(ledger) => retrieval::rank(ledger, query, options, &self.policy, now),
            None => Vec::new(),
        }
    }

    /// Render entries as a prompt context block relative to the store clock
    pub fn assemble(&self, entries: &[MemoryEntry]) -> String {
        retrieval::assemble_context(entries, self.clock.now())
    }

    /// Rank and assemble in one step, using a single reading of the clock
    pub fn query(
        &self,
        personality_id: &str,
        query: &str,
        options: &RankOptions,
    ) -> RankedQueryResult {
        let now = self.clock.now();
        let entries = {
            let ledgers = self.read();
            match ledgers.get(personality_id) {
                Some(ledger) => retrieval::rank(ledger, query, options, &self.policy, now),
                None => Vec::new(),
            }
        };
        RankedQueryResult::new(entries, now)
    }

    /// Write a personality's ledger to the snapshot store
    pub fn persist(&self, storage: &SqliteStorage, personality_id: &str) -> Result<usize> {
        let entries = self.entries(personality_id);
        storage.save_ledger(personality_id, &entries)?;
        Ok(entries.len())
    }

    /// Make the snapshot store match memory exactly. Ledgers that were reset
    /// or swept away since the last snapshot are removed from storage too.
    pub fn persist_all(&self, storage: &SqliteStorage) -> Result<usize> {
        let snapshot: Vec<(String, Vec<MemoryEntry>)> = {
            let ledgers = self.read();
            let mut snapshot: Vec<_> = ledgers
                .iter()
                .map(|(id, entries)| (id.clone(), entries.clone()))
                .collect();
            snapshot.sort_by(|a, b| a.0.cmp(&b.0));
            snapshot
        };
        storage.replace_all(&snapshot)
    }

    /// Replace a personality's in-memory ledger with its stored snapshot.
    /// Tier limits are re-applied, since the configuration may have shrunk.
    pub fn restore(&self, storage: &SqliteStorage, personality_id: &str) -> Result<usize> {
        let mut entries = storage.load_ledger(personality_id)?;
        self.policy.enforce_limits(&mut entries);
        let count = entries.len();

        let mut ledgers = self.write();
        if entries.is_empty() {
            ledgers.remove(personality_id);
        } else {
            ledgers.insert(personality_id.to_string(), entries);
        }
        Ok(count)
    }

    /// Restore every personality found in the snapshot store
    pub fn restore_all(&self, storage: &SqliteStorage) -> Result<usize> {
        let mut total = 0;
        for personality_id in storage.list_personalities()? {
            total += self.restore(storage, &personality_id)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn store(short: i64, long: i64) -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        let policy = RetentionPolicy {
            short_term_limit: short,
            long_term_limit: long,
            retention_days: 30,
        };
        (MemoryStore::with_clock(policy, clock.clone()), clock)
    }

    fn contents(entries: &[MemoryEntry]) -> Vec<String> {
        entries.iter().map(|e| e.content.clone()).collect()
    }

    #[test]
    fn test_add_memory_stamps_with_clock() {
        let (store, clock) = store(10, 10);
        let entry = store.add_memory("p1", "hello", MemoryTier::ShortTerm, MemoryMetadata::default());
        assert_eq!(entry.timestamp, clock.now());
        assert_eq!(store.entries("p1"), vec![entry]);
    }

    #[test]
    fn test_ledgers_are_isolated() {
        let (store, _) = store(10, 10);
        store.add_memory("p1", "one", MemoryTier::ShortTerm, MemoryMetadata::default());
        store.add_memory("p2", "two", MemoryTier::ShortTerm, MemoryMetadata::default());

        assert_eq!(contents(&store.entries("p1")), vec!["one"]);
        assert_eq!(contents(&store.entries("p2")), vec!["two"]);
        assert_eq!(store.personalities(), vec!["p1", "p2"]);
        assert!(store.entries("p3").is_empty());
    }

    #[test]
    fn test_record_exchange_writes_both_sides_in_order() {
        let (store, _) = store(10, 10);
        let meta = MemoryMetadata::default().with_user("u1");
        store.record_exchange("p1", "hi bot", "hi human", meta);

        let entries = store.entries("p1");
        assert_eq!(contents(&entries), vec!["hi bot", "hi human"]);
        assert!(entries.iter().all(|e| e.metadata.user_id.as_deref() == Some("u1")));
    }

    #[test]
    fn test_promote_picks_most_recent_short_term_match() {
        let (store, clock) = store(10, 10);
        let first = store.add_memory("p1", "same", MemoryTier::ShortTerm, MemoryMetadata::default());
        clock.advance(Duration::minutes(5));
        let second = store.add_memory("p1", "same", MemoryTier::ShortTerm, MemoryMetadata::default());

        assert!(store.promote("p1", "same"));
        let entries = store.entries("p1");
        let tier_of = |id| entries.iter().find(|e| e.id == id).map(|e| e.tier);
        assert_eq!(tier_of(first.id), Some(MemoryTier::ShortTerm));
        assert_eq!(tier_of(second.id), Some(MemoryTier::LongTerm));
    }

    #[test]
    fn test_promote_without_match_is_noop() {
        let (store, _) = store(10, 10);
        assert!(!store.promote("ghost", "anything"));
        store.add_memory("p1", "kept", MemoryTier::ShortTerm, MemoryMetadata::default());
        assert!(!store.promote("p1", "Kept"));
        assert_eq!(store.stats("p1").short_term, 1);
    }

    #[test]
    fn test_promote_enforces_long_term_limit() {
        let (store, clock) = store(10, 1);
        store.add_memory("p1", "old fact", MemoryTier::LongTerm, MemoryMetadata::default());
        clock.advance(Duration::minutes(1));
        store.add_memory("p1", "new fact", MemoryTier::ShortTerm, MemoryMetadata::default());

        assert!(store.promote("p1", "new fact"));
        let entries = store.entries("p1");
        assert_eq!(contents(&entries), vec!["new fact"]);
        assert_eq!(entries[0].tier, MemoryTier::LongTerm);
    }

    #[test]
    fn test_reset_drops_ledger() {
        let (store, _) = store(10, 10);
        store.add_memory("p1", "a", MemoryTier::ShortTerm, MemoryMetadata::default());
        store.add_memory("p1", "b", MemoryTier::LongTerm, MemoryMetadata::default());

        assert_eq!(store.reset("p1"), 2);
        assert!(store.personalities().is_empty());
        assert_eq!(store.reset("p1"), 0);
    }

    #[test]
    fn test_sweep_expired_drops_emptied_ledgers() {
        let (store, clock) = store(10, 10);
        store.add_memory("old", "ancient", MemoryTier::LongTerm, MemoryMetadata::default());
        clock.advance(Duration::days(29));
        store.add_memory("mixed", "recent", MemoryTier::ShortTerm, MemoryMetadata::default());
        clock.advance(Duration::days(2));

        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.personalities(), vec!["mixed"]);
    }

    #[test]
    fn test_stats() {
        let (store, clock) = store(10, 10);
        let start = clock.now();
        store.add_memory("p1", "a", MemoryTier::ShortTerm, MemoryMetadata::default());
        clock.advance(Duration::hours(2));
        store.add_memory("p1", "b", MemoryTier::LongTerm, MemoryMetadata::default());
        store.add_memory("p1", "c", MemoryTier::ShortTerm, MemoryMetadata::default());

        let stats = store.stats("p1");
        assert_eq!(stats.short_term, 2);
        assert_eq!(stats.long_term, 1);
        assert_eq!(stats.oldest, Some(start));
        assert_eq!(stats.newest, Some(start + Duration::hours(2)));
        assert_eq!(store.stats("nobody"), LedgerStats::default());
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("short_term".parse::<MemoryTier>().unwrap(), MemoryTier::ShortTerm);
        assert_eq!("long_term".parse::<MemoryTier>().unwrap(), MemoryTier::LongTerm);
        assert!("medium".parse::<MemoryTier>().is_err());
        assert_eq!(MemoryTier::LongTerm.to_string(), "long_term");
    }

    #[test]
    fn test_metadata_defaults_when_absent() {
        let json = r#"{"id":"7f3c8a5e-0d1b-4c1a-9a57-3f0f6d2b8e11","content":"x","timestamp":"2024-03-01T09:00:00Z","tier":"long_term"}"#;
        let entry: MemoryEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.tier, MemoryTier::LongTerm);
        assert_eq!(entry.metadata, MemoryMetadata::default());
        assert_eq!(entry.metadata.importance, 0.0);
    }
}
