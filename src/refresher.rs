use crate::rules::{decode_blocklist, parse_custom_list, RuleStore};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("blocklist is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("cache file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the raw blocklist blob comes from.
#[async_trait]
pub trait BlocklistSource: Send + Sync {
    async fn fetch(&self) -> Result<Bytes, FetchError>;

    fn describe(&self) -> String;
}

/// Plain GET of a URL with a caller-supplied client. In production the client
/// is the SOCKS5-bound one, since the list host sits behind the same block.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl BlocklistSource for HttpSource {
    async fn fetch(&self) -> Result<Bytes, FetchError> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status()));
        }
        Ok(resp.bytes().await?)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub cache_path: PathBuf,
    pub custom_path: PathBuf,
    pub interval: Duration,
}

/// What bootstrap ended up doing with the blocklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Fresh cache decoded, no network.
    Cached,
    /// Cache missing, stale or unreadable; fetched and published.
    Fetched,
    /// Fetch attempted and failed; previous rules (if any) stay.
    FetchFailed,
}

/// Bootstraps the rule store and keeps the blocklist fresh.
pub struct ListRefresher<S> {
    store: Arc<RuleStore>,
    source: S,
    settings: RefreshSettings,
    last_success: Mutex<Option<SystemTime>>,
}

impl<S: BlocklistSource + 'static> ListRefresher<S> {
    pub fn new(store: Arc<RuleStore>, source: S, settings: RefreshSettings) -> Self {
        Self {
            store,
            source,
            settings,
            last_success: Mutex::new(None),
        }
    }

    /// When the published blocklist was last fetched. For a list loaded
    /// from cache that is the cache file's modification time.
    pub fn last_success(&self) -> Option<SystemTime> {
        *self.last_success.lock()
    }

    /// Bootstrap, then refresh every interval, forever.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.bootstrap().await;
            self.run_scheduled().await;
        })
    }

    pub async fn bootstrap(&self) -> BootstrapOutcome {
        self.load_custom_list().await;

        let path = &self.settings.cache_path;
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let mtime = meta.modified().ok();
                let age = mtime
                    .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                    .unwrap_or_default();

                if age > self.settings.interval {
                    info!("Cached blocklist {:?} is {}h old, updating", path, age.as_secs() / 3600);
                } else {
                    match self.load_cached(path, mtime).await {
                        Ok(count) => {
                            info!("Blocklist loaded from {:?}. Total rules: {}", path, count);
                            return BootstrapOutcome::Cached;
                        }
                        Err(e) => warn!("Failed to load cached blocklist: {}", e),
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No cached blocklist at {:?}, downloading for the first time", path);
            }
            Err(e) => {
                warn!("Failed to stat cached blocklist {:?}: {}", path, e);
            }
        }

        match self.fetch_and_publish().await {
            Ok(_) => BootstrapOutcome::Fetched,
            Err(e) => {
                warn!("Blocklist update failed: {}", e);
                BootstrapOutcome::FetchFailed
            }
        }
    }

    /// Downloads, decodes, caches and publishes the blocklist. On any error
    /// the published rules are left as they were.
    pub async fn fetch_and_publish(&self) -> Result<usize, RefreshError> {
        info!("Downloading blocklist from {}", self.source.describe());

        let raw = self.source.fetch().await?;
        let set = decode_blocklist(&raw)?;

        let path = &self.settings.cache_path;
        tokio::fs::write(path, &raw)
            .await
            .map_err(|source| RefreshError::Io {
                path: path.clone(),
                source,
            })?;

        let count = set.len();
        self.store.replace_blocklist(set);
        *self.last_success.lock() = Some(SystemTime::now());

        info!("Blocklist updated. Total rules: {}", count);
        Ok(count)
    }

    async fn run_scheduled(&self) {
        let period = self.settings.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            debug!("Scheduled blocklist refresh");
            if let Err(e) = self.fetch_and_publish().await {
                warn!("Scheduled blocklist update failed, keeping current rules: {}", e);
            }
        }
    }

    async fn load_cached(&self, path: &Path, fetched_at: Option<SystemTime>) -> Result<usize, RefreshError> {
        let raw = tokio::fs::read(path).await.map_err(|source| RefreshError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let set = decode_blocklist(&raw)?;
        let count = set.len();
        self.store.replace_blocklist(set);
        *self.last_success.lock() = fetched_at;
        Ok(count)
    }

    async fn load_custom_list(&self) {
        let path = &self.settings.custom_path;
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                let set = parse_custom_list(&text);
                info!("Loaded {} custom domains from {:?}", set.len(), path);
                self.store.replace_custom_list(set);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("{:?} not found, skipping custom domains", path);
            }
            Err(e) => {
                warn!("Failed to read custom domains {:?}: {}", path, e);
            }
        }
    }
}
