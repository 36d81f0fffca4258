//! Single-flight snapshot cache in front of the spreadsheet provider.
//!
//! A [`RefreshCache`] keeps one [`Snapshot`] (tab list plus one payload per
//! tab) and refreshes it as a whole once it is older than the configured TTL.
//! Concurrent readers that find the snapshot missing or stale all await the
//! same refresh, so the provider never sees two refreshes of one cache at the
//! same time.
//!
//! The refresh runs on its own tokio task and always completes, even if every
//! request waiting on it goes away. When a refresh fails the previous snapshot
//! keeps being served; only a cache that has never been populated reports the
//! failure to its readers.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared, join_all};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{CacheError, UpstreamError};

/// Default time-to-live of a snapshot.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// One page of a spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TabDescriptor<Id> {
    pub name: String,
    pub id: Id,
    /// Where the tab's own content lives, for sources that need it.
    #[serde(skip)]
    pub page_url: Option<String>,
}

impl<Id> TabDescriptor<Id> {
    pub fn new(name: impl Into<String>, id: Id) -> Self {
        TabDescriptor {
            name: name.into(),
            id,
            page_url: None,
        }
    }

    pub fn with_page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }
}

/// Upstream from which a cache builds its snapshots.
#[async_trait]
pub trait TabSource: Send + Sync + 'static {
    /// Stable tab identifier.
    type Id: Clone + Eq + Hash + Display + Send + Sync + 'static;
    /// Cached content of one tab. `Default` stands in for a tab that failed to load.
    type Payload: Clone + Default + Send + Sync + 'static;

    async fn list_tabs(&self) -> Result<Vec<TabDescriptor<Self::Id>>, UpstreamError>;

    async fn fetch_tab(
        &self,
        tab: &TabDescriptor<Self::Id>,
    ) -> Result<Self::Payload, UpstreamError>;
}

/// The unit of cached state, published all at once.
#[derive(Debug)]
pub struct Snapshot<Id, P> {
    pub tabs: Vec<TabDescriptor<Id>>,
    /// Keyed by every id in `tabs`; failed tabs hold `P::default()`.
    pub payloads: HashMap<Id, P>,
    pub fetched_at: Instant,
    pub fetched_at_utc: DateTime<Utc>,
}

impl<Id: Eq + Hash, P> Snapshot<Id, P> {
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn tab(&self, id: &Id) -> Option<&TabDescriptor<Id>> {
        self.tabs.iter().find(|tab| &tab.id == id)
    }
}

type SnapshotOf<S> = Snapshot<<S as TabSource>::Id, <S as TabSource>::Payload>;
type RefreshResult<S> = Result<Arc<SnapshotOf<S>>, CacheError>;
type SharedRefresh<S> = Shared<BoxFuture<'static, RefreshResult<S>>>;

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Snapshots older than this are refreshed on the next read.
    pub ttl: Duration,
    /// When set, a snapshot older than this is no longer served after a
    /// failed refresh and the failure reaches the reader instead.
    pub max_staleness: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_staleness: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Option<Duration>) -> Self {
        self.max_staleness = max_staleness;
        self
    }
}

/// Result of a list read.
#[derive(Debug, Clone)]
pub struct TabListing<Id> {
    pub tabs: Vec<TabDescriptor<Id>>,
    pub age: Duration,
    pub fetched_at: DateTime<Utc>,
    /// Served straight from the snapshot, without starting or joining a refresh.
    pub hit: bool,
}

/// Result of a keyed read.
#[derive(Debug, Clone)]
pub struct TabContent<Id, P> {
    pub tab: TabDescriptor<Id>,
    pub payload: P,
    pub age: Duration,
    pub fetched_at: DateTime<Utc>,
    pub hit: bool,
}

struct CacheState<S: TabSource> {
    snapshot: Option<Arc<SnapshotOf<S>>>,
    in_flight: Option<SharedRefresh<S>>,
}

/// Snapshot cache over a [`TabSource`].
///
/// Cloning gives another handle to the same cache.
pub struct RefreshCache<S: TabSource> {
    source: Arc<S>,
    config: CacheConfig,
    state: Arc<Mutex<CacheState<S>>>,
}

impl<S: TabSource> Clone for RefreshCache<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: TabSource> RefreshCache<S> {
    pub fn new(source: S, config: CacheConfig) -> Self {
        Self::from_arc(Arc::new(source), config)
    }

    pub fn from_arc(source: Arc<S>, config: CacheConfig) -> Self {
        Self {
            source,
            config,
            state: Arc::new(Mutex::new(CacheState {
                snapshot: None,
                in_flight: None,
            })),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Age of the current snapshot, if any, without triggering a refresh.
    pub fn cached_age(&self) -> Option<Duration> {
        lock(&self.state).snapshot.as_ref().map(|s| s.age())
    }

    /// Whether a refresh is currently running.
    pub fn is_refreshing(&self) -> bool {
        lock(&self.state).in_flight.is_some()
    }

    /// List the tabs of a fresh (or last known good) snapshot.
    pub async fn list(&self) -> Result<TabListing<S::Id>, CacheError> {
        let (snapshot, hit) = self.snapshot().await?;
        Ok(TabListing {
            tabs: snapshot.tabs.clone(),
            age: snapshot.age(),
            fetched_at: snapshot.fetched_at_utc,
            hit,
        })
    }

    /// Fetch one tab's payload.
    ///
    /// Only ids listed in the snapshot's tabs are found; a payload entry alone
    /// does not count.
    pub async fn get(&self, id: &S::Id) -> Result<TabContent<S::Id, S::Payload>, CacheError> {
        let (snapshot, hit) = self.snapshot().await?;
        let tab = snapshot
            .tab(id)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        let payload = snapshot.payloads.get(id).cloned().unwrap_or_default();
        Ok(TabContent {
            tab,
            payload,
            age: snapshot.age(),
            fetched_at: snapshot.fetched_at_utc,
            hit,
        })
    }

    /// Current snapshot, refreshing first when it is missing or stale.
    ///
    /// The flag is true when no refresh was started or joined.
    pub async fn snapshot(&self) -> Result<(Arc<SnapshotOf<S>>, bool), CacheError> {
        let refresh = {
            let mut state = lock(&self.state);
            if let Some(snapshot) = &state.snapshot {
                if snapshot.age() <= self.config.ttl {
                    return Ok((Arc::clone(snapshot), true));
                }
            }
            match &state.in_flight {
                Some(refresh) => refresh.clone(),
                None => {
                    let refresh = self.spawn_refresh();
                    state.in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await.map(|snapshot| (snapshot, false))
    }

    /// Start a refresh task. Must be called with the state lock held so the
    /// in-flight slot is set before the task can clear it.
    fn spawn_refresh(&self) -> SharedRefresh<S> {
        let source = Arc::clone(&self.source);
        let state = Arc::clone(&self.state);
        let max_staleness = self.config.max_staleness;

        let task = tokio::spawn(async move {
            let _guard = ClearOnPanic {
                state: Arc::clone(&state),
            };
            let outcome = load_snapshot(source.as_ref()).await;

            let mut state = lock(&state);
            state.in_flight = None;
            match outcome {
                Ok(snapshot) => {
                    log::info!(
                        "published snapshot with {} tab(s)",
                        snapshot.tabs.len()
                    );
                    let snapshot = Arc::new(snapshot);
                    state.snapshot = Some(Arc::clone(&snapshot));
                    Ok(snapshot)
                }
                Err(err) => match &state.snapshot {
                    Some(previous)
                        if max_staleness.is_none_or(|ceiling| previous.age() <= ceiling) =>
                    {
                        log::warn!(
                            "refresh failed, serving snapshot from {}s ago: {}",
                            previous.age().as_secs(),
                            err
                        );
                        Ok(Arc::clone(previous))
                    }
                    Some(previous) => {
                        log::error!(
                            "refresh failed and snapshot is {}s old: {}",
                            previous.age().as_secs(),
                            err
                        );
                        Err(CacheError::Refresh(err))
                    }
                    None => {
                        log::error!("refresh failed with nothing cached: {}", err);
                        Err(CacheError::Refresh(err))
                    }
                },
            }
        });

        async move {
            task.await.unwrap_or_else(|err| {
                log::error!("refresh task did not finish: {}", err);
                Err(CacheError::Aborted)
            })
        }
        .boxed()
        .shared()
    }
}

/// Frees the in-flight slot if the refresh task unwinds, so later reads can
/// start a new one.
struct ClearOnPanic<S: TabSource> {
    state: Arc<Mutex<CacheState<S>>>,
}

impl<S: TabSource> Drop for ClearOnPanic<S> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            lock(&self.state).in_flight = None;
        }
    }
}

/// List the tabs, then fetch all of them concurrently.
async fn load_snapshot<S: TabSource>(source: &S) -> Result<SnapshotOf<S>, UpstreamError> {
    let tabs = source.list_tabs().await?;

    let fetches = tabs.iter().map(|tab| async move {
        match source.fetch_tab(tab).await {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("failed to fetch tab {:?} ({}): {}", tab.name, tab.id, err);
                S::Payload::default()
            }
        }
    });
    let fetched = join_all(fetches).await;

    let payloads = tabs
        .iter()
        .map(|tab| tab.id.clone())
        .zip(fetched)
        .collect();

    Ok(Snapshot {
        tabs,
        payloads,
        fetched_at: Instant::now(),
        fetched_at_utc: Utc::now(),
    })
}
