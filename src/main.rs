use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};

use chrono::Local;
use clap::Parser;
use rankscrap::{
    config::{realm_names, FailurePolicy, Realm, RunContext},
    info_time,
    process::process_site,
    shutdown::{watch_signals, ShutdownCoordinator, FORCED_EXIT_CODE},
    Result,
};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Harvests the ranked leaderboard into resumable rank buckets.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Servers to scrape: `www`, `br`, `friends`, a comma separated list or `all`.
    /// Asked for interactively when missing.
    #[arg(short, long)]
    realm: Option<String>,

    /// Root directory of the dataset.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Ranks per bucket file.
    #[arg(long)]
    bucket_size: Option<u32>,

    /// Concurrent page fetches per server.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Pages that may be fetched ahead of the last safe page.
    #[arg(long)]
    prefetch_window: Option<u32>,

    /// Seconds between periodic flushes.
    #[arg(long)]
    flush_interval: Option<u64>,

    /// Seconds in-flight fetches get to finish after an interruption.
    #[arg(long)]
    drain_grace: Option<u64>,

    /// Stop the server's run on the first page that can't be fetched instead of skipping it.
    #[arg(long)]
    abort_on_failure: bool,
}

impl Args {
    fn contexts(&self, realms: Vec<Realm>) -> Vec<RunContext> {
        realms
            .into_iter()
            .map(|realm| {
                let mut ctx = RunContext::new(realm);
                if let Some(dir) = &self.data_dir {
                    ctx.data_dir = dir.clone();
                }
                if let Some(size) = self.bucket_size {
                    ctx.bucket_size = size;
                }
                if let Some(workers) = self.workers {
                    ctx.workers = workers;
                }
                if let Some(window) = self.prefetch_window {
                    ctx.prefetch_window = window;
                }
                if let Some(secs) = self.flush_interval {
                    ctx.flush_interval = Duration::from_secs(secs);
                }
                if let Some(secs) = self.drain_grace {
                    ctx.drain_grace = Duration::from_secs(secs);
                }
                if self.abort_on_failure {
                    ctx.failure_policy = FailurePolicy::Abort;
                }
                ctx
            })
            .collect()
    }
}

fn prompt_realm() -> Result<String> {
    print!("Enter server [{}]: ", realm_names().join(","));
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

/// Resolves the selected servers and checks every context before any work starts.
fn configure(args: &Args) -> Result<Vec<RunContext>> {
    let selector = match &args.realm {
        Some(selector) => selector.clone(),
        None => prompt_realm()?,
    };
    let realms = Realm::parse_selector(&selector)?;
    args.contexts(realms)
        .into_iter()
        .map(RunContext::validate)
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rankscrap=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let start_time = Local::now();
    let coordinator = ShutdownCoordinator::new();

    let contexts = match configure(&args) {
        Ok(contexts) => contexts,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            coordinator.flushed(true);
            return coordinator.terminate();
        }
    };

    let results = tokio::select! {
        results = process_site(contexts, coordinator.signal()) => results,
        () = watch_signals(&coordinator) => {
            // State on disk is whatever the last flush left, which is consistent.
            std::process::exit(FORCED_EXIT_CODE);
        }
    };

    let mut failed = false;
    for (realm, res) in results {
        match res {
            Ok(report) => info_time!(
                "{}: {} pages, {} skipped, {} accounts, safe through page {}{}",
                realm,
                report.pages_merged,
                report.pages_skipped,
                report.entries,
                report.last_safe_page,
                if report.complete { ", complete" } else { "" }
            ),
            Err(e) => {
                failed = true;
                if e.is_fatal() {
                    error!(%realm, error = %e, "fatal error");
                } else {
                    error!(%realm, error = %e, "stopped on a failed page");
                }
            }
        }
    }

    coordinator.flushed(failed);
    info_time!(start_time, "Full program time:");
    coordinator.terminate()
}
