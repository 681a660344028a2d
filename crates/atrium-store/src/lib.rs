//! State externalization for Atrium.
//!
//! Everything that must survive an instance restart or be visible to another
//! instance goes through a [`StateStore`]: session presence, thread history,
//! workflow runs, callback bookkeeping and lock entries. [`CachedRecord`] puts
//! an in-process cache in front of the store with a uniform fallback policy.

pub mod database;
pub mod error;
pub mod faulty;
pub mod history;
pub mod lock;
pub mod memory;
pub mod record;
pub mod schema;
pub mod session_state;
pub mod sqlite;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use faulty::FaultyStore;
pub use history::{ChatHistoryManager, ThreadHistory};
pub use lock::{DistributedLock, ExclusiveRun};
pub use memory::MemoryStore;
pub use record::CachedRecord;
pub use session_state::{SessionRecord, SessionStateManager};
pub use sqlite::SqliteStore;
pub use store::{namespace, StateStore};
