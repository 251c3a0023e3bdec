//! Durable queue of mutations issued while offline.
//!
//! Tasks are persisted before `enqueue` returns and replayed in enqueue order
//! by `drain`. Delivered tasks are removed; tasks that exhaust their attempts
//! stay in storage as `Failed` until the user retries or dismisses them.

mod queue;
mod storage;
mod types;

pub use queue::{DrainReport, SyncQueue};
pub use storage::{Claim, QueueStorage, SqliteQueueStore};
pub use types::{SyncEvent, SyncKind, SyncTask, TaskStatus};
