//! End-to-end behavior of the release engine over the in-memory store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::broadcast;

use vesta_common::error::DATA_CONFLICT;
use vesta_common::md5_hex;
use vesta_config::cache::CacheMetricsSink;
use vesta_config::gray::labels;
use vesta_config::model::{
    ClientConfigFileRequest, ClientWatchFile, ConfigFilePublishInfo, ReleaseQuery,
    WatchConfigFileRequest,
};
use vesta_config::service::{CacheRefreshSink, ReleaseEventSink, ReleaseNotice};
use vesta_config::{
    CacheManager, ConfigCenter, ReleaseCacheConfig, ReleaseService, ReleaseServiceConfig,
    WatchCenter, WatchCenterConfig,
};
use vesta_persistence::{
    ClientLabel, ConfigFileKey, ConfigFileReleaseKey, MemoryContentStore, MemoryReleaseStore,
    ReleaseStore, ReleaseType,
};

struct NoopMetrics;

impl CacheMetricsSink for NoopMetrics {
    fn group_release_count(&self, _: &str, _: &str, _: usize) {}
}

struct NoopEvents;

impl ReleaseEventSink for NoopEvents {
    fn release_changed(&self, _: ReleaseNotice) {}
}

struct Engine {
    store: Arc<MemoryReleaseStore>,
    center: ConfigCenter,
    _shutdown: broadcast::Sender<()>,
}

impl Engine {
    /// Writes are followed by an explicit `refresh`
    fn manual() -> Self {
        Self::build(false)
    }

    /// Writes refresh the cache and wake watchers on their own
    fn live() -> Self {
        Self::build(true)
    }

    fn build(live: bool) -> Self {
        let store = Arc::new(MemoryReleaseStore::new());
        let cache = Arc::new(CacheManager::new(
            ReleaseCacheConfig::default(),
            store.clone(),
            Arc::new(MemoryContentStore::new()),
            Arc::new(NoopMetrics),
        ));
        let events: Arc<dyn ReleaseEventSink> = if live {
            Arc::new(CacheRefreshSink::spawn(cache.clone()).0)
        } else {
            Arc::new(NoopEvents)
        };
        let releases = ReleaseService::new(ReleaseServiceConfig::default(), store.clone(), events);
        let watch = WatchCenter::new(WatchCenterConfig::default(), cache.clone());
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        watch.start(cache.releases().subscribe(), shutdown_rx);

        Engine {
            center: ConfigCenter::new(store.clone(), cache, releases, watch),
            store,
            _shutdown: shutdown,
        }
    }

    async fn refresh(&self) {
        self.center.cache().update().await.unwrap();
    }

    async fn publish(&self, file_name: &str, name: &str, content: &str) {
        let info = info(file_name, name, content);
        let response = self.center.upsert_and_release_config_file(&info).await;
        assert!(response.is_success(), "publish failed: {}", response.message);
    }

    async fn publish_gray(&self, file_name: &str, name: &str, content: &str, ip: &str) {
        let mut info = info(file_name, name, content);
        info.release_type = ReleaseType::Gray;
        info.beta_labels = vec![ClientLabel::exact(labels::CLIENT_IP, ip)];
        let response = self.center.upsert_and_release_config_file(&info).await;
        assert!(response.is_success(), "gray publish failed: {}", response.message);
    }

    fn read(&self, file_name: &str, ip: &str) -> Option<(String, ReleaseType, u64)> {
        self.center
            .get_config_file_with_cache(&ClientConfigFileRequest {
                client_ip: ip.to_string(),
                namespace: "ns".to_string(),
                group: "g".to_string(),
                file_name: file_name.to_string(),
                ..Default::default()
            })
            .data
            .map(|f| (f.content, f.release_type, f.version))
    }

    async fn active_releases(&self, release_type: ReleaseType) -> Vec<String> {
        let page = self
            .center
            .get_config_file_releases(&ReleaseQuery {
                namespace: "ns".to_string(),
                only_active: true,
                ..Default::default()
            })
            .await
            .data
            .unwrap();
        page.page_items
            .into_iter()
            .filter(|r| r.release_type == release_type)
            .map(|r| r.name)
            .collect()
    }
}

fn info(file_name: &str, name: &str, content: &str) -> ConfigFilePublishInfo {
    ConfigFilePublishInfo {
        namespace: "ns".to_string(),
        group: "g".to_string(),
        file_name: file_name.to_string(),
        release_name: name.to_string(),
        content: content.to_string(),
        ..Default::default()
    }
}

fn release_key(name: &str, release_type: ReleaseType) -> ConfigFileReleaseKey {
    ConfigFileReleaseKey::new(&ConfigFileKey::new("ns", "g", "app.yaml"), name, release_type)
}

fn app_file() -> ConfigFileKey {
    ConfigFileKey::new("ns", "g", "app.yaml")
}

#[tokio::test]
async fn test_stale_md5_never_mutates_content() {
    let engine = Engine::manual();
    engine.publish("app.yaml", "r1", "x").await;

    let mut stale = info("app.yaml", "r2", "y");
    stale.md5 = md5_hex("not what is stored");
    let rejected = engine.center.upsert_and_release_config_file(&stale).await;
    assert_eq!(rejected.code, DATA_CONFLICT.code);
    let stored = engine.store.get_config_file(&app_file()).await.unwrap().unwrap();
    assert_eq!(stored.content, "x");

    let mut current = info("app.yaml", "r2", "y");
    current.md5 = md5_hex("x");
    assert!(engine.center.upsert_and_release_config_file(&current).await.is_success());

    // no md5 means no comparison
    assert!(
        engine
            .center
            .upsert_and_release_config_file(&info("app.yaml", "r3", "z"))
            .await
            .is_success()
    );
    let stored = engine.store.get_config_file(&app_file()).await.unwrap().unwrap();
    assert_eq!(stored.content, "z");
}

#[tokio::test]
async fn test_visible_version_only_grows() {
    let engine = Engine::manual();
    let mut seen = Vec::new();

    engine.publish("app.yaml", "a", "x").await;
    engine.refresh().await;
    seen.push(engine.read("app.yaml", "").unwrap().2);

    engine.publish("app.yaml", "b", "y").await;
    engine.refresh().await;
    seen.push(engine.read("app.yaml", "").unwrap().2);

    let rolled = engine
        .center
        .rollback_config_file_releases(vec![release_key("a", ReleaseType::Normal)])
        .await;
    assert!(rolled.is_success());
    engine.refresh().await;
    seen.push(engine.read("app.yaml", "").unwrap().2);

    assert!(seen.windows(2).all(|w| w[0] < w[1]), "versions went backwards: {:?}", seen);
}

#[tokio::test]
async fn test_gray_precedence_until_stopped() {
    let engine = Engine::manual();
    engine.publish("app.yaml", "base", "normal").await;
    engine
        .publish_gray("app.yaml", "canary", "gray", "1.1.1.1")
        .await;
    engine.refresh().await;

    let (content, release_type, _) = engine.read("app.yaml", "1.1.1.1").unwrap();
    assert_eq!(content, "gray");
    assert_eq!(release_type, ReleaseType::Gray);
    assert_eq!(engine.read("app.yaml", "2.2.2.2").unwrap().0, "normal");
    assert_eq!(engine.read("app.yaml", "").unwrap().0, "normal");

    let stopped = engine
        .center
        .stop_gray_config_file_releases(vec![app_file()])
        .await;
    assert!(stopped.is_success());
    engine.refresh().await;

    assert_eq!(engine.read("app.yaml", "1.1.1.1").unwrap().0, "normal");
    assert_eq!(engine.read("app.yaml", "2.2.2.2").unwrap().0, "normal");
    assert!(engine.active_releases(ReleaseType::Gray).await.is_empty());
}

#[tokio::test]
async fn test_rollback_round_trip() {
    let engine = Engine::manual();
    engine.publish("app.yaml", "A", "x").await;
    engine.publish("app.yaml", "B", "y").await;
    engine.refresh().await;
    assert_eq!(engine.read("app.yaml", "").unwrap().0, "y");

    let rolled = engine
        .center
        .rollback_config_file_releases(vec![release_key("A", ReleaseType::Normal)])
        .await;
    assert!(rolled.is_success());
    engine.refresh().await;

    assert_eq!(engine.read("app.yaml", "").unwrap().0, "x");
    let versions = engine
        .center
        .get_config_file_release_versions(&app_file())
        .await
        .data
        .unwrap();
    let active: HashMap<String, bool> = versions.into_iter().map(|v| (v.name, v.active)).collect();
    assert_eq!(active.get("A"), Some(&true));
    assert_eq!(active.get("B"), Some(&false));
}

#[tokio::test]
async fn test_republish_after_delete_serves_new_content() {
    let engine = Engine::manual();
    engine.publish("app.yaml", "R", "first").await;
    engine.refresh().await;

    let deleted = engine
        .center
        .delete_config_file_releases(vec![release_key("R", ReleaseType::Normal)])
        .await;
    assert!(deleted.is_success());
    engine.refresh().await;
    assert!(engine.read("app.yaml", "").is_none());

    engine.publish("app.yaml", "R", "second").await;
    engine.refresh().await;
    assert_eq!(engine.read("app.yaml", "").unwrap().0, "second");
}

#[tokio::test]
async fn test_normal_publish_blocked_by_active_gray() {
    let engine = Engine::manual();
    engine.publish("app.yaml", "base", "normal").await;
    engine
        .publish_gray("app.yaml", "canary", "gray", "1.1.1.1")
        .await;

    let blocked = engine
        .center
        .upsert_and_release_config_file(&info("app.yaml", "next", "other"))
        .await;
    assert_eq!(blocked.code, DATA_CONFLICT.code);

    assert_eq!(engine.active_releases(ReleaseType::Normal).await, vec!["base"]);
    assert_eq!(engine.active_releases(ReleaseType::Gray).await, vec!["canary"]);
    // the rejected upsert rolled back its file write too
    let stored = engine.store.get_config_file(&app_file()).await.unwrap().unwrap();
    assert_eq!(stored.content, "gray");
}

#[tokio::test(start_paused = true)]
async fn test_watch_wakes_on_publish() {
    let engine = Engine::live();
    for (name, content) in [("v1", "a"), ("v2", "b"), ("v3", "c")] {
        engine.publish("app.yaml", name, content).await;
    }
    engine.refresh().await;
    assert_eq!(engine.read("app.yaml", "").unwrap().2, 3);
    engine.publish("other.yaml", "o1", "o").await;
    engine.refresh().await;

    let watch = |client_id: &str, file_name: &str, version: u64| WatchConfigFileRequest {
        client_id: client_id.to_string(),
        watch_files: vec![ClientWatchFile {
            namespace: "ns".to_string(),
            group: "g".to_string(),
            file_name: file_name.to_string(),
            version,
        }],
        timeout_ms: Some(30_000),
        ..Default::default()
    };

    let started = tokio::time::Instant::now();
    let interested = {
        let center = engine.center.clone();
        let req = watch("c1", "app.yaml", 3);
        tokio::spawn(async move { center.long_pull_watch_file(&req).await })
    };
    let bystander = {
        let center = engine.center.clone();
        let req = watch("c2", "other.yaml", 1);
        tokio::spawn(async move { center.long_pull_watch_file(&req).await })
    };

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(engine.center.get_config_subscribers(&app_file()).data.unwrap().len(), 1);
    engine.publish("app.yaml", "v4", "d").await;

    let response = interested.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(30));
    let changed = response.data.unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].version, 4);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!bystander.is_finished());
    assert!(bystander.await.unwrap().is_no_change());
}

#[derive(Clone, Debug)]
enum Op {
    Publish(usize, u8),
    PublishGray(usize),
    Rollback(usize, bool),
    Delete(usize, bool),
    StopGray,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..3usize, any::<u8>()).prop_map(|(n, c)| Op::Publish(n, c)),
        (0..2usize).prop_map(Op::PublishGray),
        (0..3usize, any::<bool>()).prop_map(|(n, g)| Op::Rollback(n, g)),
        (0..3usize, any::<bool>()).prop_map(|(n, g)| Op::Delete(n, g)),
        Just(Op::StopGray),
    ]
}

async fn apply(engine: &Engine, op: &Op) {
    let center = &engine.center;
    match op {
        Op::Publish(n, c) => {
            let normal = info("app.yaml", &format!("n{}", n), &c.to_string());
            center.upsert_and_release_config_file(&normal).await;
        }
        Op::PublishGray(n) => {
            let mut gray = info("app.yaml", &format!("g{}", n), "gray");
            gray.release_type = ReleaseType::Gray;
            gray.beta_labels = vec![ClientLabel::exact(labels::CLIENT_IP, "1.1.1.1")];
            center.upsert_and_release_config_file(&gray).await;
        }
        Op::Rollback(n, gray) => {
            let key = if *gray {
                release_key(&format!("g{}", n % 2), ReleaseType::Gray)
            } else {
                release_key(&format!("n{}", n), ReleaseType::Normal)
            };
            center.rollback_config_file_releases(vec![key]).await;
        }
        Op::Delete(n, gray) => {
            let key = if *gray {
                release_key(&format!("g{}", n % 2), ReleaseType::Gray)
            } else {
                release_key(&format!("n{}", n), ReleaseType::Normal)
            };
            center.delete_config_file_releases(vec![key]).await;
        }
        Op::StopGray => {
            center.stop_gray_config_file_releases(vec![app_file()]).await;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_at_most_one_active_per_type(ops in prop::collection::vec(op(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let engine = Engine::manual();
            for op in &ops {
                apply(&engine, op).await;
                let normal = engine.active_releases(ReleaseType::Normal).await;
                let gray = engine.active_releases(ReleaseType::Gray).await;
                assert!(normal.len() <= 1, "after {:?}: {:?}", op, normal);
                assert!(gray.len() <= 1, "after {:?}: {:?}", op, gray);
            }
        });
    }
}
