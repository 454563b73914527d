use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

use crate::{persist, Result};

const CHECKPOINT_FILE: &str = "last.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPage {
    pub page: u32,
    pub reason: String,
}

/// On-disk form of `last.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub last_safe_page: u32,
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedPage>,
}

/// Accepts the older `{"page": next_page}` layout as well.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCheckpoint {
    last_safe_page: Option<u32>,
    page: Option<u32>,
    #[serde(default)]
    complete: bool,
    #[serde(default)]
    skipped: Vec<SkippedPage>,
}

impl From<StoredCheckpoint> for Checkpoint {
    fn from(stored: StoredCheckpoint) -> Self {
        let last_safe_page = stored
            .last_safe_page
            .or_else(|| stored.page.map(|next| next.saturating_sub(1)))
            .unwrap_or(0);
        Self {
            last_safe_page,
            complete: stored.complete,
            skipped: stored.skipped,
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    /// Every page up to here has completed.
    contiguous: u32,
    /// Completed pages above `contiguous`.
    completed: BTreeSet<u32>,
    /// Value last written to disk.
    persisted: u32,
    skipped: BTreeMap<u32, String>,
    complete: bool,
}

impl LedgerState {
    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            last_safe_page: self.persisted,
            complete: self.complete,
            skipped: self
                .skipped
                .iter()
                .map(|(&page, reason)| SkippedPage {
                    page,
                    reason: reason.clone(),
                })
                .collect(),
        }
    }
}

/// Per realm record of which pages are done.
///
/// Workers finish pages out of order, so the ledger keeps every completed page
/// and only ever reports the contiguous prefix. Re-fetching from
/// `last_safe_page + 1` after a crash therefore never skips a page.
#[derive(Debug)]
pub struct CheckpointLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl CheckpointLedger {
    /// Loads `last.json` from the realm directory, starting from zero when absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CHECKPOINT_FILE);
        let stored: Checkpoint = persist::read_json::<StoredCheckpoint>(&path)?
            .map(Into::into)
            .unwrap_or_default();
        let state = LedgerState {
            contiguous: stored.last_safe_page,
            persisted: stored.last_safe_page,
            skipped: stored
                .skipped
                .into_iter()
                .map(|s| (s.page, s.reason))
                .collect(),
            ..Default::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// First page that still has to be fetched.
    pub fn resume_page(&self) -> u32 {
        self.state.lock().persisted + 1
    }

    /// Records a fully merged page and returns the new contiguous prefix.
    pub fn advance(&self, page: u32) -> u32 {
        let mut state = self.state.lock();
        if page > state.contiguous {
            state.completed.insert(page);
            while let Some(next) = state.contiguous.checked_add(1) {
                if !state.completed.remove(&next) {
                    break;
                }
                state.contiguous = next;
            }
        }
        state.contiguous
    }

    /// Gives up on a page: it is remembered for manual reprocessing and no
    /// longer holds the checkpoint back.
    pub fn skip(&self, page: u32, reason: impl Into<String>) -> u32 {
        self.state.lock().skipped.insert(page, reason.into());
        self.advance(page)
    }

    /// Highest page below which everything has completed. Not necessarily flushed.
    pub fn contiguous(&self) -> u32 {
        self.state.lock().contiguous
    }

    /// Highest page known to be durable.
    pub fn last_safe_page(&self) -> u32 {
        self.state.lock().persisted
    }

    /// Pages completed out of order and waiting for a gap to close.
    pub fn pending(&self) -> usize {
        self.state.lock().completed.len()
    }

    pub fn mark_complete(&self) {
        self.state.lock().complete = true;
    }

    pub fn snapshot(&self) -> Checkpoint {
        self.state.lock().checkpoint()
    }

    /// Writes `candidate` as the last safe page.
    ///
    /// The caller must have flushed every bucket touched by pages up to
    /// `candidate` first. The stored value never goes down and never passes
    /// the contiguous prefix.
    pub fn persist(&self, candidate: u32) -> Result<u32> {
        let checkpoint = {
            let state = self.state.lock();
            let mut checkpoint = state.checkpoint();
            checkpoint.last_safe_page = candidate.min(state.contiguous).max(state.persisted);
            checkpoint
        };
        persist::write_json(&self.path, &checkpoint)?;

        let mut state = self.state.lock();
        state.persisted = state.persisted.max(checkpoint.last_safe_page);
        Ok(state.persisted)
    }

    /// `persist` on the blocking pool.
    pub async fn persist_async(self: &Arc<Self>, candidate: u32) -> Result<u32> {
        let ledger = self.clone();
        spawn_blocking(move || ledger.persist(candidate)).await?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
