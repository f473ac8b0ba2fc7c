//! Bounded-concurrency, resumable HTTP download queue.
//!
//! A [`DownloadScheduler`](scheduler::DownloadScheduler) drains a list of
//! [`DownloadItem`](models::DownloadItem)s, keeping at most `thread_count`
//! transfers in flight. Each transfer can resume a partial file via HTTP
//! byte ranges, and existing destination files are handled by a configurable
//! [`FileExistsPolicy`](fetcher::FileExistsPolicy).
//!
//! ```no_run
//! use downpool::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let scheduler = DownloadScheduler::builder()
//!     .thread_count(3)
//!     .default_policy(FileExistsPolicy::Resume)
//!     .build()?;
//!
//! let item = Arc::new(DownloadItem::new("https://example.com/big.iso", "/tmp")?);
//! scheduler.add_items([item.clone()])?;
//!
//! // The item's state and progress are observable at any time:
//! let _ = (item.state(), item.percentage());
//! # Ok(())
//! # }
//! ```

pub mod fetcher;
pub mod headers;
pub mod hooks;
pub mod integrity;
pub mod limiter;
pub mod models;
pub mod scheduler;

/// Convenient re-exports of the commonly used types.
pub mod prelude {
    pub use crate::fetcher::{FetchError, FetchOutcome, Fetcher, FileExistsPolicy};
    pub use crate::hooks::Hooks;
    pub use crate::limiter::SpeedLimiter;
    pub use crate::models::{DownloadItem, ItemError, ItemSnapshot, ItemState};
    pub use crate::scheduler::{DownloadScheduler, SchedulerBuilder, SchedulerError};
}
