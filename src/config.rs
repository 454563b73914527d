use std::{path::PathBuf, time::Duration};

use tracing::warn;

use crate::{
    BackoffPolicy, Error, Result, BUCKET_SIZE, DATA_DIR, DRAIN_GRACE_SECS, ENDPOINT,
    FLUSH_INTERVAL_SECS, MAX_ATTEMPTS, MAX_PAGE_SIZE, PREFETCH_WINDOW, PROGRESS_INTERVAL_SECS,
    REQUEST_TIMEOUT_SECS, WORKERS,
};

/// Known servers: selector and base URL.
pub const REALMS: [(&str, &str); 3] = [
    ("www", "https://www.kogama.com/"),
    ("br", "https://www.kogama.com.br/"),
    ("friends", "https://friends.kogama.com/"),
];

/// One independently scraped server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realm {
    pub name: String,
    pub base_url: String,
}

impl Realm {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
        }
    }

    pub fn lookup(name: &str) -> Result<Self> {
        let name = name.trim().to_lowercase();
        REALMS
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(name, url)| Realm::new(*name, *url))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "unknown server `{name}`, expected one of [{}]",
                    realm_names().join(",")
                ))
            })
    }

    /// Parses `www`, `www,br`, `all` or a custom `name=https://host/`.
    pub fn parse_selector(selector: &str) -> Result<Vec<Self>> {
        let mut realms: Vec<Realm> = Vec::new();
        for part in selector.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let found = if part.eq_ignore_ascii_case("all") {
                REALMS.iter().map(|(n, u)| Realm::new(*n, *u)).collect()
            } else if let Some((name, url)) = part.split_once('=') {
                vec![Realm::custom(name, url)?]
            } else {
                vec![Realm::lookup(part)?]
            };
            for realm in found {
                if !realms.iter().any(|r| r.name == realm.name) {
                    realms.push(realm);
                }
            }
        }
        if realms.is_empty() {
            return Err(Error::Configuration("no server selected".into()));
        }
        Ok(realms)
    }

    fn custom(name: &str, url: &str) -> Result<Self> {
        let name = name.trim();
        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_name {
            return Err(Error::Configuration(format!("invalid server name `{name}`")));
        }
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Configuration(format!("invalid server url `{url}`")));
        }
        Ok(Realm::new(name, url))
    }

    pub fn page_url(&self, page: u32, count: u32) -> String {
        format!(
            "{}/{ENDPOINT}?count={count}&page={page}",
            self.base_url.trim_end_matches('/')
        )
    }
}

pub fn realm_names() -> Vec<&'static str> {
    REALMS.iter().map(|(name, _)| *name).collect()
}

/// What to do with a page that can't be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Record it for manual reprocessing and keep going.
    #[default]
    Skip,
    /// Flush and stop the realm with an error.
    Abort,
}

/// Everything one realm's collection run needs. Passed explicitly, no globals.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub realm: Realm,
    pub data_dir: PathBuf,
    pub bucket_size: u32,
    pub page_size: u32,
    pub workers: usize,
    pub prefetch_window: u32,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub flush_interval: Duration,
    pub drain_grace: Duration,
    pub progress_interval: Duration,
    pub failure_policy: FailurePolicy,
}

impl RunContext {
    pub fn new(realm: Realm) -> Self {
        Self {
            realm,
            data_dir: PathBuf::from(DATA_DIR),
            bucket_size: BUCKET_SIZE,
            page_size: MAX_PAGE_SIZE,
            workers: WORKERS,
            prefetch_window: PREFETCH_WINDOW,
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            max_attempts: MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            flush_interval: Duration::from_secs(FLUSH_INTERVAL_SECS),
            drain_grace: Duration::from_secs(DRAIN_GRACE_SECS),
            progress_interval: Duration::from_secs(PROGRESS_INTERVAL_SECS),
            failure_policy: FailurePolicy::default(),
        }
    }

    /// `<data_dir>/<realm>`
    pub fn realm_dir(&self) -> PathBuf {
        self.data_dir.join(&self.realm.name)
    }

    /// Checks the values and clamps the page size to what the API serves.
    pub fn validate(mut self) -> Result<Self> {
        let zero = [
            ("bucket size", self.bucket_size == 0),
            ("page size", self.page_size == 0),
            ("workers", self.workers == 0),
            ("prefetch window", self.prefetch_window == 0),
            ("max attempts", self.max_attempts == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(Error::Configuration(format!("{name} must be positive")));
        }
        if self.page_size > MAX_PAGE_SIZE {
            warn!(
                requested = self.page_size,
                max = MAX_PAGE_SIZE,
                "page size above the API limit, clamping"
            );
            self.page_size = MAX_PAGE_SIZE;
        }
        Ok(self)
    }

    /// Last page according to a reported leaderboard size.
    pub fn last_page_for(&self, total: u64) -> u32 {
        let pages = total.div_ceil(u64::from(self.page_size.max(1)));
        u32::try_from(pages).unwrap_or(u32::MAX)
    }
}
