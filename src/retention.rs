//! Retention: per-tier size limits and the age-based sweep
//!
//! Size limits are enforced synchronously after every write. The age sweep
//! only runs periodically, either through [`MemoryStore::sweep_expired`] or
//! the background task started by [`spawn_sweeper`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::memory::{MemoryEntry, MemoryStore, MemoryTier};

/// Limits applied to every personality ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub short_term_limit: i64,
    pub long_term_limit: i64,
    pub retention_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RetentionPolicy {
    fn from(config: &Config) -> Self {
        Self {
            short_term_limit: config.short_term_limit,
            long_term_limit: config.long_term_limit,
            retention_days: config.retention_days,
        }
    }
}

impl RetentionPolicy {
    /// Number of entries a tier may hold. Non-positive limits keep nothing.
    pub fn limit_for(&self, tier: MemoryTier) -> usize {
        let limit = match tier {
            MemoryTier::ShortTerm => self.short_term_limit,
            MemoryTier::LongTerm => self.long_term_limit,
        };
        usize::try_from(limit).unwrap_or(0)
    }

    /// Length of the retention window, zero when `retention_days <= 0`.
    /// Saturates at the largest representable duration.
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.retention_days.max(0)).unwrap_or(chrono::Duration::MAX)
    }

    /// Evict the oldest entries of each tier until both tiers fit their
    /// limits. Returns the number of entries removed.
    pub fn enforce_limits(&self, entries: &mut Vec<MemoryEntry>) -> usize {
        self.enforce_tier(entries, MemoryTier::ShortTerm)
            + self.enforce_tier(entries, MemoryTier::LongTerm)
    }

    fn enforce_tier(&self, entries: &mut Vec<MemoryEntry>, tier: MemoryTier) -> usize {
        let limit = self.limit_for(tier);
        let mut in_tier: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.tier == tier)
            .map(|(i, _)| i)
            .collect();
        if in_tier.len() <= limit {
            return 0;
        }

        // Stable: equal timestamps keep insertion order, so the earliest
        // inserted goes first.
        in_tier.sort_by_key(|&i| entries[i].timestamp);
        let excess = in_tier.len() - limit;
        let mut doomed = vec![false; entries.len()];
        for &i in &in_tier[..excess] {
            doomed[i] = true;
        }

        let mut index = 0;
        entries.retain(|_| {
            let keep = !doomed[index];
            index += 1;
            keep
        });
        excess
    }

    /// Whether an entry has outlived the retention window at `now`
    pub fn is_expired(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> bool {
        if self.retention_days <= 0 {
            return true;
        }
        now - entry.timestamp > self.window()
    }

    /// Remove every entry older than the retention window, regardless of
    /// tier. Returns the number removed.
    pub fn sweep_expired(&self, entries: &mut Vec<MemoryEntry>, now: DateTime<Utc>) -> usize {
        let before = entries.len();
        entries.retain(|e| !self.is_expired(e, now));
        before - entries.len()
    }
}

/// Run [`MemoryStore::sweep_expired`] every `interval` until `cancel` fires.
///
/// The first sweep happens one full interval after spawning.
pub fn spawn_sweeper(
    store: Arc<MemoryStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Retention sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = store.sweep_expired();
                    if removed > 0 {
                        tracing::info!(removed, "Retention sweep evicted expired memories");
                    }
                }
            }
        }
    })
}
