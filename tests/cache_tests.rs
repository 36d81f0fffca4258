use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use rollcall::cache::{CacheConfig, RefreshCache, TabDescriptor, TabSource};
use rollcall::error::{CacheError, UpstreamError};

const TAB_NAMES: [&str; 3] = ["one", "two", "three"];
const TTL: Duration = Duration::from_secs(300);

/// Upstream double with call counters and switchable failures.
struct FakeSource {
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    generation: AtomicUsize,
    tab_count: AtomicUsize,
    fail_list: AtomicBool,
    failing_tab: Option<u32>,
    delay: Duration,
}

impl FakeSource {
    fn new() -> Self {
        FakeSource {
            list_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
            tab_count: AtomicUsize::new(TAB_NAMES.len()),
            fail_list: AtomicBool::new(false),
            failing_tab: None,
            delay: Duration::from_millis(50),
        }
    }

    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TabSource for FakeSource {
    type Id = u32;
    type Payload = String;

    async fn list_tabs(&self) -> Result<Vec<TabDescriptor<u32>>, UpstreamError> {
        let call = self.list_calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(UpstreamError::Status {
                url: "fake://tabs".to_string(),
                status: 503,
            });
        }
        self.generation.store(call, Ordering::SeqCst);
        let count = self.tab_count.load(Ordering::SeqCst);
        Ok(TAB_NAMES
            .iter()
            .take(count)
            .enumerate()
            .map(|(i, name)| TabDescriptor::new(*name, i as u32 + 1))
            .collect())
    }

    async fn fetch_tab(&self, tab: &TabDescriptor<u32>) -> Result<String, UpstreamError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.failing_tab == Some(tab.id) {
            return Err(UpstreamError::Parse(format!("tab {} is broken", tab.id)));
        }
        Ok(format!("{}-v{}", tab.name, self.generation.load(Ordering::SeqCst)))
    }
}

fn cache_over(source: &Arc<FakeSource>, config: CacheConfig) -> RefreshCache<FakeSource> {
    RefreshCache::from_arc(Arc::clone(source), config)
}

fn default_config() -> CacheConfig {
    CacheConfig::new().with_ttl(TTL)
}

#[tokio::test(start_paused = true)]
async fn concurrent_reads_share_one_refresh() {
    let source = Arc::new(FakeSource::new());
    let cache = cache_over(&source, default_config());

    let reads = join_all((0..50).map(|_| cache.get(&1))).await;

    assert_eq!(source.list_calls(), 1);
    assert_eq!(source.fetch_calls.load(Ordering::SeqCst), TAB_NAMES.len());
    for read in reads {
        let content = read.unwrap();
        assert_eq!(content.payload, "one-v1");
        assert!(!content.hit);
    }
    assert!(!cache.is_refreshing());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reads_across_threads_share_one_refresh() {
    let source = Arc::new(FakeSource::new());
    let cache = cache_over(&source, default_config());

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.list().await })
        })
        .collect();

    for handle in handles {
        let listing = handle.await.unwrap().unwrap();
        assert_eq!(listing.tabs.len(), TAB_NAMES.len());
    }
    assert_eq!(source.list_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn reads_within_ttl_are_identical() {
    let source = Arc::new(FakeSource::new());
    let cache = cache_over(&source, default_config());

    let first = cache.list().await.unwrap();
    let first_tab = cache.get(&2).await.unwrap();
    tokio::time::advance(Duration::from_secs(120)).await;
    let second = cache.list().await.unwrap();
    let second_tab = cache.get(&2).await.unwrap();

    assert_eq!(first.tabs, second.tabs);
    assert_eq!(first_tab.payload, second_tab.payload);
    assert!(!first.hit);
    assert!(second.hit && second_tab.hit);
    assert!(second.age >= Duration::from_secs(120));
    assert_eq!(source.list_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_snapshot_is_refreshed() {
    let source = Arc::new(FakeSource::new());
    let cache = cache_over(&source, default_config());

    assert_eq!(cache.get(&1).await.unwrap().payload, "one-v1");
    tokio::time::advance(TTL + Duration::from_secs(1)).await;

    let content = cache.get(&1).await.unwrap();
    assert_eq!(content.payload, "one-v2");
    assert!(!content.hit);
    assert_eq!(source.list_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn every_listed_tab_is_found() {
    let source = Arc::new(FakeSource::new());
    let cache = cache_over(&source, default_config());

    let listing = cache.list().await.unwrap();
    for tab in &listing.tabs {
        let content = cache.get(&tab.id).await.unwrap();
        assert_eq!(content.tab.name, tab.name);
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_tab_is_not_found() {
    let source = Arc::new(FakeSource::new());
    let cache = cache_over(&source, default_config());

    assert_eq!(cache.get(&99).await.unwrap_err(), CacheError::NotFound("99".to_string()));
    assert_eq!(cache.get(&3).await.unwrap().payload, "three-v1");

    // Tab 3 disappears upstream; the replaced snapshot no longer knows it.
    source.tab_count.store(2, Ordering::SeqCst);
    tokio::time::advance(TTL + Duration::from_secs(1)).await;
    assert_eq!(cache.list().await.unwrap().tabs.len(), 2);
    assert!(matches!(cache.get(&3).await, Err(CacheError::NotFound(_))));
}

#[test]
fn snapshot_lookup_ignores_payloads_without_a_tab() {
    use std::collections::HashMap;

    let snapshot = rollcall::Snapshot {
        tabs: vec![TabDescriptor::new("one", 1u32)],
        payloads: HashMap::from([(1u32, "a".to_string()), (7u32, "stray".to_string())]),
        fetched_at: tokio::time::Instant::now(),
        fetched_at_utc: chrono::Utc::now(),
    };
    assert!(snapshot.tab(&1).is_some());
    assert!(snapshot.tab(&7).is_none());
}

#[tokio::test(start_paused = true)]
async fn failure_without_snapshot_reaches_every_waiter() {
    let source = Arc::new(FakeSource::new());
    source.fail_list.store(true, Ordering::SeqCst);
    let cache = cache_over(&source, default_config());

    let reads = join_all((0..5).map(|_| cache.list())).await;
    for read in reads {
        assert!(matches!(read, Err(CacheError::Refresh(UpstreamError::Status { status: 503, .. }))));
    }
    assert_eq!(source.list_calls(), 1);
    assert!(cache.cached_age().is_none());
    assert!(!cache.is_refreshing());

    // The next request retries.
    source.fail_list.store(false, Ordering::SeqCst);
    assert_eq!(cache.get(&1).await.unwrap().payload, "one-v2");
    assert_eq!(source.list_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn failure_with_snapshot_keeps_serving_it() {
    let source = Arc::new(FakeSource::new());
    let cache = cache_over(&source, default_config());

    cache.list().await.unwrap();
    source.fail_list.store(true, Ordering::SeqCst);
    tokio::time::advance(TTL + Duration::from_secs(1)).await;

    let content = cache.get(&1).await.unwrap();
    assert_eq!(content.payload, "one-v1");
    assert_eq!(source.list_calls(), 2);

    // Still stale, so every read tries again.
    tokio::time::advance(Duration::from_secs(600)).await;
    assert_eq!(cache.get(&1).await.unwrap().payload, "one-v1");
    assert_eq!(source.list_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn staleness_ceiling_stops_the_fallback() {
    let source = Arc::new(FakeSource::new());
    let config = default_config().with_max_staleness(Some(Duration::from_secs(600)));
    let cache = cache_over(&source, config);

    cache.list().await.unwrap();
    source.fail_list.store(true, Ordering::SeqCst);

    tokio::time::advance(Duration::from_secs(360)).await;
    assert!(cache.list().await.is_ok());

    tokio::time::advance(Duration::from_secs(300)).await;
    assert!(matches!(cache.list().await, Err(CacheError::Refresh(_))));

    // The old snapshot is kept and comes back once upstream recovers.
    source.fail_list.store(false, Ordering::SeqCst);
    assert_eq!(cache.get(&2).await.unwrap().payload, "two-v4");
}

#[tokio::test(start_paused = true)]
async fn failing_tab_degrades_only_itself() {
    let source = Arc::new(FakeSource {
        failing_tab: Some(2),
        ..FakeSource::new()
    });
    let cache = cache_over(&source, default_config());

    let listing = cache.list().await.unwrap();
    assert_eq!(listing.tabs.len(), 3);
    assert_eq!(cache.get(&1).await.unwrap().payload, "one-v1");
    assert_eq!(cache.get(&2).await.unwrap().payload, "");
    assert_eq!(cache.get(&3).await.unwrap().payload, "three-v1");
}

#[tokio::test(start_paused = true)]
async fn refresh_finishes_after_callers_give_up() {
    let source = Arc::new(FakeSource::new());
    let cache = cache_over(&source, default_config());

    let gave_up = tokio::time::timeout(Duration::from_millis(10), cache.get(&1)).await;
    assert!(gave_up.is_err());
    assert!(cache.is_refreshing());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!cache.is_refreshing());
    assert!(cache.cached_age().is_some());

    let content = cache.get(&1).await.unwrap();
    assert!(content.hit);
    assert_eq!(source.list_calls(), 1);
}
