//! RANK SCRAPER
//! Harvests a paginated leaderboard into rank buckets on disk, resumable after a crash.

mod backoff;
pub mod bucket;
pub mod checkpoint;
pub mod config;
mod error;
mod macros;
mod parse;
pub mod persist;
pub mod process;
pub mod request;
pub mod shutdown;

pub use backoff::BackoffPolicy;
pub use error::{Error, FetchError, Result};
pub use parse::{normalize_id, Entry, PageResult, ID_FIELDS};

/// The API refuses to return more than this many entries per request.
const MAX_PAGE_SIZE: u32 = 400;
const ENDPOINT: &str = "api/leaderboard/top/";
const DATA_DIR: &str = "Data";
const BUCKET_SIZE: u32 = 1000;
const WORKERS: usize = 4;
/// How many pages may be fetched ahead of the last safe page.
const PREFETCH_WINDOW: u32 = 32;
const REQUEST_TIMEOUT_SECS: u64 = 10;
const MAX_ATTEMPTS: u32 = 5;
const FLUSH_INTERVAL_SECS: u64 = 30;
const DRAIN_GRACE_SECS: u64 = 10;
const PROGRESS_INTERVAL_SECS: u64 = 5;
