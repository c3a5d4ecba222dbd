//! Provider integration tests against a scriptable adapter.
//!
//! Covers causal deferral and replay, late results after disconnect,
//! updates for documents that are not set up yet, status transitions and
//! sub-document lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use refine_sync::adapter::{AdapterSubscription, DocAdapter, DocState, UpdateCallback, UpdateListeners};
use refine_sync::error::{SyncError, SyncResult};
use refine_sync::provider::{DocLifecycle, LazyProvider, ProviderOptions};
use refine_sync::status::Status;
use refine_sync::storage::MemoryStorage;
use refine_sync::update;
use tokio::time::{timeout, Duration};
use yrs::{Doc, GetString, Map, ReadTxn, Text, Transact, WriteTxn};

/// Memory storage plus knobs: a query delay, failing sends and a way to
/// push updates that never went through storage.
#[derive(Default)]
struct ScriptedAdapter {
    storage: MemoryStorage,
    listeners: UpdateListeners,
    query_delay: Mutex<Option<Duration>>,
    fail_sends: AtomicBool,
}

impl ScriptedAdapter {
    fn push(&self, guid: &str, update: &[u8]) {
        self.listeners.emit(guid, update);
    }
}

#[async_trait]
impl DocAdapter for ScriptedAdapter {
    async fn query_doc_state(&self, guid: &str, state_vector: Option<&[u8]>) -> SyncResult<DocState> {
        let delay = *self.query_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.storage.query_doc_state(guid, state_vector).await
    }

    async fn send_doc_update(&self, guid: &str, update: &[u8], origin: &str) -> SyncResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::StorageIo("disk full".into()));
        }
        self.storage.send_doc_update(guid, update, origin).await
    }

    fn on_doc_update(&self, callback: UpdateCallback) -> Option<AdapterSubscription> {
        Some(self.listeners.subscribe(callback))
    }
}

fn make_delta(doc: &Doc, insert: &str) -> Vec<u8> {
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, insert);
    }
    doc.transact().encode_state_as_update_v1(&before)
}

fn text_of(doc: &Doc) -> String {
    let mut txn = doc.transact_mut();
    txn.get_or_insert_text("content").get_string(&txn)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn setup(root: &Doc) -> (Arc<ScriptedAdapter>, LazyProvider) {
    let _ = env_logger::builder().is_test(true).try_init();
    let adapter = Arc::new(ScriptedAdapter::default());
    let provider = LazyProvider::new(root.clone(), adapter.clone(), ProviderOptions::new("local"));
    (adapter, provider)
}

#[tokio::test]
async fn test_gapped_update_is_deferred_then_replayed() {
    let root = update::new_doc("root");
    let (adapter, provider) = setup(&root);
    provider.connect().await.unwrap();

    let remote = Doc::new();
    let first = make_delta(&remote, "abc");
    let second = make_delta(&remote, "def");

    // Second arrives first: it depends on clocks the local doc lacks
    adapter.push("root", &second);
    assert!(eventually(|| provider.deferred_len("root") == 1).await);
    assert_eq!(text_of(&root), "");

    adapter.push("root", &first);
    assert!(eventually(|| text_of(&root) == "abcdef").await);
    assert_eq!(provider.deferred_len("root"), 0);

    let stats = provider.checker_stats();
    assert!(stats.gaps_detected >= 1);
}

#[tokio::test]
async fn test_late_query_result_is_discarded_after_disconnect() {
    let root = update::new_doc("root");
    let (adapter, provider) = setup(&root);

    let seed = Doc::new();
    adapter
        .send_doc_update("root", &make_delta(&seed, "late"), "seed")
        .await
        .unwrap();
    *adapter.query_delay.lock() = Some(Duration::from_millis(200));

    let provider = Arc::new(provider);
    let connecting = {
        let provider = provider.clone();
        tokio::spawn(async move { provider.connect().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    provider.disconnect();

    connecting.await.unwrap().unwrap();
    assert_eq!(text_of(&root), "");
    assert!(!provider.is_connected());
    assert_eq!(provider.status(), Status::Idle);
}

#[tokio::test]
async fn test_update_for_unknown_guid_waits_for_setup() {
    let root = update::new_doc("root");
    let (adapter, provider) = setup(&root);
    provider.connect().await.unwrap();

    let page_remote = Doc::new();
    adapter.push("page-1", &make_delta(&page_remote, "early"));
    assert!(eventually(|| provider.pending_len("page-1") == 1).await);

    {
        let mut txn = root.transact_mut();
        let pages = txn.get_or_insert_map("pages");
        pages.insert(&mut txn, "page-1", update::new_doc("page-1"));
    }
    assert!(eventually(|| provider.is_doc_connected("page-1")).await);
    assert!(
        eventually(|| provider
            .doc("page-1")
            .is_some_and(|doc| text_of(&doc) == "early"))
        .await
    );
    assert_eq!(provider.pending_len("page-1"), 0);
}

#[tokio::test]
async fn test_send_failure_sets_error_and_recovers() {
    let root = update::new_doc("root");
    make_delta(&root, "unsaved");
    let (adapter, provider) = setup(&root);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let seen = seen.clone();
        provider.on_status_change(move |s| seen.lock().push(s.clone()))
    };

    adapter.fail_sends.store(true, Ordering::SeqCst);
    let err = provider.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::StorageIo(_)));
    assert!(provider.status().is_error());

    adapter.fail_sends.store(false, Ordering::SeqCst);
    provider.sync(true).await.unwrap();
    assert_eq!(provider.status(), Status::Synced);
    assert!(seen.lock().iter().any(|s| *s == Status::Syncing));
}

#[tokio::test]
async fn test_local_edit_from_own_origin_is_not_sent() {
    let root = update::new_doc("root");
    let (adapter, provider) = setup(&root);
    provider.connect().await.unwrap();

    {
        let mut txn = root.transact_mut_with("local");
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, "echo");
    }
    make_delta(&root, "!");

    assert!(eventually(|| adapter.storage.stats("root").is_some_and(|s| s.record_count >= 1)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = adapter.storage.query_doc_state("root", None).await.unwrap();
    let replica = Doc::new();
    refine_sync::checker::apply(&replica, &state.missing_update, "test").unwrap();
    // Only the "!" edit left the provider
    assert!(!text_of(&replica).contains("echo"));
}

#[tokio::test]
async fn test_subdoc_lifecycle() {
    let root = update::new_doc("root");
    let (_adapter, provider) = setup(&root);
    let mut lifecycle = provider.subscribe_lifecycle();
    provider.connect().await.unwrap();

    {
        let mut txn = root.transact_mut();
        let pages = txn.get_or_insert_map("pages");
        pages.insert(&mut txn, "page-1", update::new_doc("page-1"));
    }
    let added = timeout(Duration::from_secs(2), lifecycle.recv()).await.unwrap().unwrap();
    assert_eq!(added, DocLifecycle::Added("page-1".into()));
    provider.when_synced("page-1").await.unwrap();

    {
        let mut txn = root.transact_mut();
        let pages = txn.get_or_insert_map("pages");
        pages.remove(&mut txn, "page-1");
    }
    let removed = timeout(Duration::from_secs(2), lifecycle.recv()).await.unwrap().unwrap();
    assert_eq!(removed, DocLifecycle::Removed("page-1".into()));
    assert!(!provider.is_doc_connected("page-1"));
    assert!(provider.doc("page-1").is_none());
    assert!(provider.is_doc_connected("root"));
}

#[tokio::test]
async fn test_sync_whole_tree_without_connect() {
    let root = update::new_doc("root");
    let page = {
        let mut txn = root.transact_mut();
        let pages = txn.get_or_insert_map("pages");
        pages.insert(&mut txn, "page-1", update::new_doc("page-1"))
    };
    make_delta(&page, "body");
    let (adapter, provider) = setup(&root);

    provider.sync(false).await.unwrap();
    assert!(!provider.is_connected());
    let guids = {
        let mut g = adapter.storage.guids();
        g.sort();
        g
    };
    assert_eq!(guids, vec!["page-1".to_string(), "root".to_string()]);
}

#[tokio::test]
async fn test_connect_reports_syncing_before_synced() {
    let root = update::new_doc("root");
    make_delta(&root, "draft");
    let (_adapter, provider) = setup(&root);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let seen = seen.clone();
        provider.on_status_change(move |s| seen.lock().push(s.clone()))
    };

    provider.connect().await.unwrap();
    let seen = seen.lock().clone();
    assert_eq!(seen.first(), Some(&Status::Syncing));
    assert_eq!(seen.last(), Some(&Status::Synced));
    assert_eq!(provider.status(), Status::Synced);
}

#[tokio::test]
async fn test_sync_while_disconnected_passes_through_synced() {
    let root = update::new_doc("root");
    make_delta(&root, "x");
    let (_adapter, provider) = setup(&root);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let seen = seen.clone();
        provider.on_status_change(move |s| seen.lock().push(s.clone()))
    };

    provider.sync(true).await.unwrap();
    assert!(seen.lock().contains(&Status::Synced));
    assert!(!provider.is_connected());
    assert_eq!(provider.status(), Status::Idle);
}

#[tokio::test]
async fn test_lazy_subdoc_connects_only_once_loaded() {
    let root = update::new_doc("root");
    let lazy = {
        let mut txn = root.transact_mut();
        let pages = txn.get_or_insert_map("pages");
        pages.insert(&mut txn, "eager", update::new_doc("eager"));
        pages.insert(
            &mut txn,
            "lazy",
            Doc::with_options(yrs::Options {
                guid: "lazy".into(),
                should_load: false,
                ..yrs::Options::default()
            }),
        )
    };
    let (adapter, provider) = setup(&root);

    provider.connect().await.unwrap();
    assert!(provider.is_doc_connected("eager"));
    assert!(!provider.is_doc_connected("lazy"));
    assert!(adapter.storage.stats("lazy").is_none());

    {
        let mut txn = root.transact_mut();
        lazy.load(&mut txn);
    }
    assert!(eventually(|| provider.is_doc_connected("lazy")).await);
    provider.when_synced("lazy").await.unwrap();
}

#[tokio::test]
async fn test_destroyed_subdoc_stops_forwarding() {
    let root = update::new_doc("root");
    let (adapter, provider) = setup(&root);
    let mut lifecycle = provider.subscribe_lifecycle();
    provider.connect().await.unwrap();

    let page = {
        let mut txn = root.transact_mut();
        let pages = txn.get_or_insert_map("pages");
        pages.insert(&mut txn, "page-1", update::new_doc("page-1"))
    };
    provider.when_synced("page-1").await.unwrap();
    make_delta(&page, "before");
    let records = || adapter.storage.stats("page-1").map_or(0, |s| s.record_count);
    assert!(eventually(|| records() >= 1).await);
    let forwarded = records();

    {
        let mut txn = root.transact_mut();
        page.destroy(&mut txn);
    }
    assert!(eventually(|| !provider.is_doc_connected("page-1")).await);
    let removed = timeout(Duration::from_secs(2), async {
        loop {
            match lifecycle.recv().await {
                Ok(DocLifecycle::Removed(guid)) => break guid,
                Ok(_) => continue,
                Err(e) => panic!("lifecycle closed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(removed, "page-1");

    make_delta(&page, "after");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(records(), forwarded);
    assert!(provider.doc("page-1").is_none());
}
