use std::sync::Arc;

use chrono::Local;
use tokio::{
    task::{spawn_blocking, JoinSet},
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    bucket::BucketStore,
    checkpoint::CheckpointLedger,
    config::{FailurePolicy, Realm, RunContext},
    info_time,
    request::{HttpTransport, PageClient, Transport},
    shutdown::ShutdownSignal,
    Error, FetchError, Result,
};

/// Summary of one realm's run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealmReport {
    pub realm: String,
    pub pages_merged: u32,
    pub pages_skipped: u32,
    pub entries: usize,
    pub last_safe_page: u32,
    pub total: Option<u64>,
    /// The end of the leaderboard was reached and everything before it is safe.
    pub complete: bool,
    pub interrupted: bool,
}

enum Outcome {
    Merged { total: Option<u64>, changed: usize },
    Empty,
    Failed(FetchError),
    Cancelled,
}

/// Collects every configured realm concurrently over HTTP, each in its own pipeline.
pub async fn process_site(
    contexts: Vec<RunContext>,
    shutdown: ShutdownSignal,
) -> Vec<(String, Result<RealmReport>)> {
    let mut realms = JoinSet::new();
    for ctx in contexts {
        let shutdown = shutdown.clone();
        realms.spawn(async move {
            let name = ctx.realm.name.clone();
            let res = match HttpTransport::new(ctx.request_timeout) {
                Ok(transport) => process_realm(ctx, transport, shutdown).await,
                Err(e) => Err(e),
            };
            (name, res)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = realms.join_next().await {
        match joined {
            Ok(res) => results.push(res),
            Err(e) => results.push(("?".to_owned(), Err(e.into()))),
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}

/// Runs one realm from its checkpoint to the end of the leaderboard, or until shutdown.
///
/// Pages are fetched by at most `workers` tasks and never more than
/// `prefetch_window` pages past the contiguous prefix. Each worker merges its
/// page into the bucket store itself. Every `flush_interval`, and once more
/// at the end, dirty buckets are written and then the checkpoint.
pub async fn process_realm<T: Transport>(
    ctx: RunContext,
    transport: T,
    shutdown: ShutdownSignal,
) -> Result<RealmReport> {
    let ctx = ctx.validate()?;
    let start_time = Local::now();
    let realm = Arc::new(ctx.realm.clone());

    let (store, ledger) = spawn_blocking({
        let dir = ctx.realm_dir();
        let bucket_size = ctx.bucket_size;
        move || -> Result<(BucketStore, CheckpointLedger)> {
            Ok((
                BucketStore::open(&dir, bucket_size)?,
                CheckpointLedger::load(&dir)?,
            ))
        }
    })
    .await??;
    let store = Arc::new(store);
    let ledger = Arc::new(ledger);
    let client = Arc::new(PageClient::new(transport, &ctx, shutdown.clone()));

    let mut report = RealmReport {
        realm: realm.name.clone(),
        ..Default::default()
    };
    info_time!(
        "Started {}: resuming at page {}, {} accounts on disk",
        realm.name,
        ledger.resume_page(),
        store.len()
    );

    let mut next = ledger.resume_page();
    // Estimated from the reported total.
    let mut last_page: Option<u32> = None;
    // First empty page minus one.
    let mut end: Option<u32> = None;
    let mut draining = false;
    let mut fatal: Option<Error> = None;
    let mut in_flight: JoinSet<(u32, Outcome)> = JoinSet::new();

    let mut flush_tick = interval_at(Instant::now() + ctx.flush_interval, ctx.flush_interval);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut progress_tick =
        interval_at(Instant::now() + ctx.progress_interval, ctx.progress_interval);
    progress_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let grace = sleep(ctx.drain_grace);
    tokio::pin!(grace);
    let mut grace_over = false;

    loop {
        if !draining && !shutdown.is_draining() {
            // One past the estimate, so an empty page confirms the end.
            let limit = end.unwrap_or_else(|| last_page.map_or(u32::MAX, |l| l.saturating_add(1)));
            let window = ledger.contiguous().saturating_add(ctx.prefetch_window);
            while in_flight.len() < ctx.workers && next <= limit && next <= window {
                let page = next;
                in_flight.spawn({
                    let client = client.clone();
                    let store = store.clone();
                    let realm = realm.clone();
                    async move { (page, fetch_and_merge(&client, &store, &realm, page).await) }
                });
                next += 1;
            }
        }
        if in_flight.is_empty() {
            break;
        }

        tokio::select! {
            Some(joined) = in_flight.join_next() => {
                let (page, outcome) = match joined {
                    Ok(done) => done,
                    Err(e) if e.is_cancelled() => continue,
                    Err(e) => {
                        fatal = Some(e.into());
                        break;
                    }
                };
                match outcome {
                    Outcome::Merged { total, changed } => {
                        let contiguous = ledger.advance(page);
                        report.pages_merged += 1;
                        if let Some(total) = total {
                            last_page = Some(ctx.last_page_for(total));
                            report.total = Some(total);
                        }
                        debug!(realm = %realm.name, page, changed, contiguous, "merged page");
                    }
                    Outcome::Empty => {
                        let before = page.saturating_sub(1);
                        end = Some(end.map_or(before, |e| e.min(before)));
                        debug!(realm = %realm.name, page, "empty page, end of leaderboard");
                    }
                    Outcome::Failed(err) => match ctx.failure_policy {
                        FailurePolicy::Skip => {
                            warn!(
                                realm = %realm.name,
                                page,
                                error = %err,
                                "skipping page, recorded for reprocessing"
                            );
                            ledger.skip(page, err.to_string());
                            report.pages_skipped += 1;
                        }
                        FailurePolicy::Abort => {
                            error!(
                                realm = %realm.name,
                                page,
                                error = %err,
                                "page failed, aborting"
                            );
                            fatal = Some(Error::PageFailed {
                                realm: realm.name.clone(),
                                page,
                                source: err,
                            });
                            break;
                        }
                    },
                    Outcome::Cancelled => {}
                }
            }
            _ = flush_tick.tick() => {
                if let Err(e) = flush_realm(&store, &ledger).await {
                    fatal = Some(e);
                    break;
                }
            }
            _ = progress_tick.tick() => log_progress(&realm, &store, &ledger, report.total),
            _ = shutdown.draining(), if !draining => {
                draining = true;
                grace.as_mut().reset(Instant::now() + ctx.drain_grace);
                info!(realm = %realm.name, in_flight = in_flight.len(), "draining");
            }
            _ = &mut grace, if draining && !grace_over => {
                grace_over = true;
                warn!(
                    realm = %realm.name,
                    in_flight = in_flight.len(),
                    "grace period over, cancelling fetches"
                );
                in_flight.abort_all();
            }
        }
    }
    in_flight.abort_all();
    report.interrupted = shutdown.is_draining();

    let contiguous = ledger.contiguous();
    if fatal.is_none() && end.is_some_and(|e| contiguous >= e) {
        ledger.mark_complete();
        report.complete = true;
    }

    // Best effort even after a fault, so a resume loses as little as possible.
    let flushed = flush_realm(&store, &ledger).await;
    report.entries = store.len();
    report.last_safe_page = ledger.last_safe_page();

    match (fatal, flushed) {
        (Some(fault), flushed) => {
            if let Err(e) = flushed {
                error!(realm = %realm.name, error = %e, "final flush failed");
            }
            Err(fault)
        }
        (None, Err(e)) => Err(e),
        (None, Ok(_)) => {
            info_time!(
                start_time,
                "Finished {}: {} pages, {} skipped, {} accounts, safe through page {}",
                realm.name,
                report.pages_merged,
                report.pages_skipped,
                report.entries,
                report.last_safe_page
            );
            Ok(report)
        }
    }
}

async fn fetch_and_merge<T: Transport>(
    client: &PageClient<T>,
    store: &BucketStore,
    realm: &Realm,
    page: u32,
) -> Outcome {
    match client.fetch(realm, page).await {
        Ok(result) if result.is_empty() => Outcome::Empty,
        Ok(result) => Outcome::Merged {
            total: result.total,
            changed: store.upsert(&result.entries, page),
        },
        Err(FetchError::Cancelled) => Outcome::Cancelled,
        Err(e) => Outcome::Failed(e),
    }
}

/// Writes dirty buckets, then the checkpoint captured before them.
async fn flush_realm(store: &Arc<BucketStore>, ledger: &Arc<CheckpointLedger>) -> Result<u32> {
    let candidate = ledger.contiguous();
    let written = store.flush_dirty_async().await?;
    let safe = ledger.persist_async(candidate).await?;
    debug!(buckets = written, last_safe_page = safe, "flushed");
    Ok(safe)
}

fn log_progress(
    realm: &Realm,
    store: &BucketStore,
    ledger: &CheckpointLedger,
    total: Option<u64>,
) {
    let collected = store.len();
    let page = ledger.contiguous();
    match total {
        Some(total) if total > 0 => {
            let pct = collected as f64 * 100.0 / total as f64;
            info_time!(
                "{} {:.6}% page={} collected={} total={}",
                realm.name,
                pct,
                page,
                collected,
                total
            );
        }
        _ => info_time!("{} page={} collected={}", realm.name, page, collected),
    }
}
