//! # Shapes Memory
//!
//! Conversational memory for Shapes personalities.
//!
//! ## Architecture
//!
//! Every personality owns a ledger of memory entries in two tiers:
//! - **Short-term** - recent utterances and replies, bounded by a size limit
//! - **Long-term** - entries promoted out of short-term, with their own limit
//!
//! Size limits are enforced on every write. Entries older than the retention
//! window are removed by a periodic sweep. Queries rank entries by importance,
//! recency, keyword overlap and topic tags, and render the winners as a
//! context block for the prompt.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shapes_memory::{Config, MemoryMetadata, MemoryStore, MemoryTier, RankOptions};
//!
//! let store = MemoryStore::new(&Config::default());
//!
//! // Remember what the user said
//! store.add_memory("shape-1", "I love cats", MemoryTier::ShortTerm, MemoryMetadata::default());
//!
//! // Build prompt context for the next message
//! let result = store.query("shape-1", "tell me about cats", &RankOptions::default());
//! println!("{}", result.context_text);
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod memory;
pub mod retention;
pub mod retrieval;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use memory::{LedgerStats, MemoryEntry, MemoryMetadata, MemoryStore, MemoryTier};
pub use retention::{spawn_sweeper, RetentionPolicy};
pub use retrieval::{RankOptions, RankedQueryResult, ScoredMemory};
pub use storage::SqliteStorage;
