//! Lazy sync provider: keeps a root document and every sub-document it
//! discovers in step with a [`DocAdapter`].
//!
//! Architecture:
//! ```text
//!  yrs observers (sync, never transact)          adapter push channel
//!        │ update / subdocs / destroy                    │ (guid, update)
//!        ▼                                               ▼
//!  ┌────────────────────── mpsc<DocEvent> ─────────────────────┐
//!  └───────────────────────────┬───────────────────────────────┘
//!                              ▼
//!                        pump task (one per connect epoch)
//!            ┌─────────────────┼──────────────────┐
//!            ▼                 ▼                  ▼
//!      send local         checker.reconcile   connect / dispose
//!      update             apply or defer      sub-documents
//! ```
//!
//! Every `connect()` starts a new epoch. Async work captures the epoch it
//! started in and re-checks it after each await, so results that land after
//! `disconnect()` are dropped instead of applied.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use yrs::{Doc, ReadTxn, Subscription, Transact};

use crate::adapter::{AdapterSubscription, DocAdapter};
use crate::checker::{self, CausalChecker, CheckerStats, Reconciled};
use crate::error::{SyncError, SyncResult};
use crate::pending::PendingCache;
use crate::registry::DocRegistry;
use crate::status::{Status, StatusSubscription, StatusTracker};
use crate::update;

/// Origin reported for local transactions that carry none.
pub const UNKNOWN_ORIGIN: &str = "unknown-origin";

const LIFECYCLE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Transaction origin used for remote applies. Local updates carrying
    /// this origin are never sent back out.
    pub author: String,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            author: "unknown-provider".to_string(),
        }
    }
}

impl ProviderOptions {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            author: author.into(),
        }
    }
}

/// Sub-document lifecycle, for collaborators that list pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocLifecycle {
    Added(String),
    Removed(String),
}

enum DocEvent {
    Local {
        guid: String,
        update: Vec<u8>,
        origin: Option<String>,
        live: Arc<AtomicBool>,
    },
    Remote {
        guid: String,
        update: Vec<u8>,
    },
    Subdocs {
        added: Vec<Doc>,
        removed: Vec<Doc>,
        loaded: Vec<Doc>,
    },
    Destroyed {
        guid: String,
    },
}

struct DocListeners {
    _subs: Vec<Subscription>,
    /// Cleared before the subscriptions drop, so an observer already running
    /// on another thread forwards nothing.
    live: Arc<AtomicBool>,
}

#[derive(Default)]
struct SharedState {
    connected: bool,
    epoch: u64,
    registry: DocRegistry,
    connected_docs: HashSet<String>,
    listeners: HashMap<String, DocListeners>,
    pending: PendingCache,
    events: Option<mpsc::UnboundedSender<DocEvent>>,
    cancel: Option<watch::Sender<bool>>,
    adapter_sub: Option<AdapterSubscription>,
}

struct Inner {
    root: Doc,
    root_guid: String,
    adapter: Arc<dyn DocAdapter>,
    options: ProviderOptions,
    checker: CausalChecker,
    status: StatusTracker,
    shared: Mutex<SharedState>,
    synced: watch::Sender<HashSet<String>>,
    lifecycle: broadcast::Sender<DocLifecycle>,
}

/// Provider for one root document. Dropping it disconnects.
pub struct LazyProvider {
    inner: Arc<Inner>,
}

impl LazyProvider {
    pub fn new(root: Doc, adapter: Arc<dyn DocAdapter>, options: ProviderOptions) -> Self {
        let root_guid = root.guid().to_string();
        let (synced, _) = watch::channel(HashSet::new());
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                root,
                root_guid,
                adapter,
                options,
                checker: CausalChecker::new(),
                status: StatusTracker::new(),
                shared: Mutex::new(SharedState::default()),
                synced,
                lifecycle,
            }),
        }
    }

    /// Start syncing the root and every loaded sub-document.
    ///
    /// Sub-documents are connected even when a sibling fails; the first
    /// failure is returned and reflected in [`status`](Self::status).
    pub async fn connect(&self) -> SyncResult<()> {
        let epoch = {
            let mut shared = self.inner.shared.lock();
            if shared.connected {
                return Ok(());
            }
            shared.connected = true;
            shared.epoch += 1;

            let (tx, rx) = mpsc::unbounded_channel();
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let push_tx = tx.clone();
            shared.adapter_sub = self.inner.adapter.on_doc_update(Arc::new(
                move |guid: &str, update: &[u8]| {
                    let _ = push_tx.send(DocEvent::Remote {
                        guid: guid.to_string(),
                        update: update.to_vec(),
                    });
                },
            ));
            shared.events = Some(tx);
            shared.cancel = Some(cancel_tx);

            tokio::spawn(pump(self.inner.clone(), rx, cancel_rx, shared.epoch));
            shared.epoch
        };
        log::info!("Connecting {} (epoch {epoch})", self.inner.root_guid);
        // Held across the whole tree so the first transition is Syncing.
        let ticket = self.inner.status.begin();
        self.inner.status.set_connected(true);

        let result = self.inner.clone().connect_doc(self.inner.root.clone(), epoch).await;
        self.inner.status.finish(ticket, result.as_ref().map(|_| ()));
        result
    }

    /// Detach every listener and forget all documents. Idempotent.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// One round-trip for the root, or for the whole tree, without
    /// installing listeners.
    ///
    /// A disconnected provider counts as connected for the duration of the
    /// call, so its status passes through `Synced` before settling `Idle`.
    pub async fn sync(&self, only_root: bool) -> SyncResult<()> {
        let (was_connected, epoch) = {
            let mut shared = self.inner.shared.lock();
            let was = shared.connected;
            shared.connected = true;
            (was, shared.epoch)
        };
        if !was_connected {
            self.inner.status.set_connected(true);
        }

        let result = if only_root {
            self.inner.sync_doc(&self.inner.root, epoch).await
        } else {
            self.inner.sync_tree(epoch).await
        };

        let restore = {
            let mut shared = self.inner.shared.lock();
            let current = shared.epoch == epoch;
            if current {
                shared.connected = was_connected;
            }
            current && !was_connected
        };
        if restore {
            self.inner.status.set_connected(false);
        }
        result
    }

    pub fn status(&self) -> Status {
        self.inner.status.status()
    }

    pub fn on_status_change(
        &self,
        callback: impl Fn(&Status) + Send + Sync + 'static,
    ) -> StatusSubscription {
        self.inner.status.on_change(callback)
    }

    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.inner.status.watch()
    }

    pub fn root(&self) -> &Doc {
        &self.inner.root
    }

    /// Live document registered under `guid`.
    pub fn doc(&self, guid: &str) -> Option<Doc> {
        self.inner.shared.lock().registry.get(guid)
    }

    /// Snapshot of a registered document and its sub-documents.
    pub fn dump(&self, guid: &str) -> SyncResult<HashMap<String, Vec<u8>>> {
        let doc = self
            .doc(guid)
            .ok_or_else(|| SyncError::DocumentNotFound(guid.to_string()))?;
        Ok(update::dump_doc(&doc))
    }

    /// Resolves once `guid` has completed its first round-trip.
    pub async fn when_synced(&self, guid: &str) -> SyncResult<()> {
        let mut rx = self.inner.synced.subscribe();
        rx.wait_for(|synced| synced.contains(guid))
            .await
            .map(|_| ())
            .map_err(|_| SyncError::ConnectionClosed)
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<DocLifecycle> {
        self.inner.lifecycle.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.lock().connected
    }

    pub fn is_doc_connected(&self, guid: &str) -> bool {
        self.inner.shared.lock().connected_docs.contains(guid)
    }

    pub fn connected_guids(&self) -> Vec<String> {
        self.inner.shared.lock().connected_docs.iter().cloned().collect()
    }

    /// Updates held for a guid whose document isn't set up yet.
    pub fn pending_len(&self, guid: &str) -> usize {
        self.inner.shared.lock().pending.pending_len(guid)
    }

    /// Updates held back by a causal gap.
    pub fn deferred_len(&self, guid: &str) -> usize {
        self.inner.shared.lock().pending.deferred_len(guid)
    }

    pub fn checker_stats(&self) -> CheckerStats {
        self.inner.checker.stats()
    }
}

impl Drop for LazyProvider {
    fn drop(&mut self) {
        self.inner.disconnect();
    }
}

async fn pump(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<DocEvent>,
    mut cancel: watch::Receiver<bool>,
    epoch: u64,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.changed() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if !inner.is_current(epoch) {
            break;
        }
        inner.clone().handle_event(event, epoch).await;
    }
    log::debug!("Event pump for epoch {epoch} stopped");
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        let shared = self.shared.lock();
        shared.connected && shared.epoch == epoch
    }

    async fn handle_event(self: Arc<Self>, event: DocEvent, epoch: u64) {
        match event {
            DocEvent::Local {
                guid,
                update,
                origin,
                live,
            } => {
                if !live.load(Ordering::Acquire) {
                    return;
                }
                if origin.as_deref() == Some(self.options.author.as_str()) {
                    return;
                }
                let origin = origin.unwrap_or_else(|| UNKNOWN_ORIGIN.to_string());
                let ticket = self.status.begin();
                let result = self.adapter.send_doc_update(&guid, &update, &origin).await;
                if let Err(e) = &result {
                    log::warn!("Failed to send update for {guid}: {e}");
                }
                self.status.finish(ticket, result.as_ref().map(|_| ()));
            }
            DocEvent::Remote { guid, update } => self.apply_remote(&guid, update),
            DocEvent::Subdocs {
                added,
                removed,
                loaded,
            } => {
                for doc in removed {
                    self.dispose_doc(&doc.guid().to_string());
                }
                // Added docs that want loading also show up in `loaded`;
                // the rest wait until someone loads them.
                for doc in added.iter().filter(|doc| !should_load(doc)) {
                    log::trace!("Sub-document {} added but not loaded", doc.guid());
                }
                let mut seen = HashSet::new();
                let to_connect: Vec<Doc> = loaded
                    .into_iter()
                    .filter(|doc| seen.insert(doc.guid().to_string()))
                    .collect();
                let results = join_all(
                    to_connect
                        .into_iter()
                        .map(|doc| self.clone().connect_doc(doc, epoch)),
                )
                .await;
                for e in results.into_iter().filter_map(Result::err) {
                    log::warn!("Sub-document connect failed: {e}");
                }
            }
            DocEvent::Destroyed { guid } => self.dispose_doc(&guid),
        }
    }

    /// Install listeners on `doc`, sync it, drain its pending cache and
    /// recurse into its sub-documents.
    fn connect_doc(self: Arc<Self>, doc: Doc, epoch: u64) -> BoxFuture<'static, SyncResult<()>> {
        async move {
            let guid = doc.guid().to_string();
            if !self.install(&doc, &guid, epoch)? {
                return Ok(());
            }

            let mut first_err = self.sync_doc(&doc, epoch).await.err();
            self.drain_pending(&doc, &guid, epoch);

            let subdocs = loaded_subdocs_of(&doc);
            let results = join_all(
                subdocs
                    .into_iter()
                    .map(|sub| self.clone().connect_doc(sub, epoch)),
            )
            .await;
            for result in results {
                if let Err(e) = result {
                    first_err.get_or_insert(e);
                }
            }
            match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        .boxed()
    }

    /// Returns `false` when the guid is already connected or the epoch ended.
    fn install(&self, doc: &Doc, guid: &str, epoch: u64) -> SyncResult<bool> {
        let mut shared = self.shared.lock();
        if !shared.connected || shared.epoch != epoch || shared.connected_docs.contains(guid) {
            return Ok(false);
        }
        let Some(tx) = shared.events.clone() else {
            return Ok(false);
        };

        let live = Arc::new(AtomicBool::new(true));
        let subs = observe(doc, guid, tx, live.clone())?;
        shared.registry.insert(doc.clone())?;
        shared.connected_docs.insert(guid.to_string());
        shared.listeners.insert(guid.to_string(), DocListeners { _subs: subs, live });
        drop(shared);

        log::debug!("Connected {guid}");
        if guid != self.root_guid {
            let _ = self.lifecycle.send(DocLifecycle::Added(guid.to_string()));
        }
        Ok(true)
    }

    /// One query/apply/send round-trip, bracketed in the status tracker.
    async fn sync_doc(&self, doc: &Doc, epoch: u64) -> SyncResult<()> {
        let guid = doc.guid().to_string();
        let ticket = self.status.begin();
        let result = self.round_trip(doc, &guid, epoch).await;
        match &result {
            Err(e) if e.is_external() => log::warn!("Sync of {guid} failed: {e}"),
            Err(e) => log::error!("Sync of {guid} failed: {e}"),
            Ok(()) => {}
        }
        self.status.finish(ticket, result.as_ref().map(|_| ()));
        result
    }

    async fn round_trip(&self, doc: &Doc, guid: &str, epoch: u64) -> SyncResult<()> {
        let local_sv = update::encode_state_vector(doc);
        let remote = self.adapter.query_doc_state(guid, Some(&local_sv)).await?;
        if !self.is_current(epoch) {
            log::debug!("Discarding late state for {guid}");
            return Ok(());
        }

        // Query results are applied as-is; only pushed updates are checked.
        if !update::is_empty(&remote.missing_update) {
            checker::apply(doc, &remote.missing_update, &self.options.author)?;
            self.retry_deferred(doc, guid)?;
        }

        let local_missing = match &remote.state_vector {
            Some(sv) => {
                let sv = update::decode_state_vector(sv)?;
                let txn = doc.transact();
                txn.encode_state_as_update_v1(&sv)
            }
            None => update::encode_full_state(doc),
        };
        if !update::is_empty(&local_missing) {
            self.adapter
                .send_doc_update(guid, &local_missing, &self.options.author)
                .await?;
        }

        if self.is_current(epoch) {
            self.synced.send_modify(|synced| {
                synced.insert(guid.to_string());
            });
        }
        Ok(())
    }

    async fn sync_tree(&self, epoch: u64) -> SyncResult<()> {
        let mut visited = HashSet::new();
        let mut queue = vec![self.root.clone()];
        let mut first_err = None;
        while let Some(doc) = queue.pop() {
            if !visited.insert(doc.guid().to_string()) {
                continue;
            }
            if let Err(e) = self.sync_doc(&doc, epoch).await {
                first_err.get_or_insert(e);
            }
            queue.extend(loaded_subdocs_of(&doc));
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn apply_remote(&self, guid: &str, update: Vec<u8>) {
        let doc = {
            let mut shared = self.shared.lock();
            match shared.registry.get(guid) {
                Some(doc) => doc,
                None => {
                    log::trace!("Caching update for {guid} until it is set up");
                    shared.pending.push(guid, update);
                    return;
                }
            }
        };
        if let Err(e) = self.reconcile(&doc, guid, update) {
            log::warn!("Dropping remote update for {guid}: {e}");
        }
    }

    /// Checker-gated apply. A gapped update is deferred; every successful
    /// apply retries what was deferred before.
    fn reconcile(&self, doc: &Doc, guid: &str, incoming: Vec<u8>) -> SyncResult<()> {
        match self.checker.reconcile(doc, &incoming, &self.options.author)? {
            Reconciled::Applied => self.retry_deferred(doc, guid),
            Reconciled::Deferred(missing) => {
                let gap = SyncError::CausalGap {
                    guid: guid.to_string(),
                    missing,
                };
                log::debug!("Deferring update: {gap}");
                self.shared.lock().pending.defer(guid, incoming);
                Ok(())
            }
        }
    }

    fn retry_deferred(&self, doc: &Doc, guid: &str) -> SyncResult<()> {
        loop {
            let deferred = self.shared.lock().pending.take_deferred(guid);
            if deferred.is_empty() {
                return Ok(());
            }
            let mut progressed = false;
            let mut still_gapped = Vec::new();
            for update in deferred {
                match self.checker.reconcile(doc, &update, &self.options.author) {
                    Ok(Reconciled::Applied) => progressed = true,
                    Ok(Reconciled::Deferred(_)) => still_gapped.push(update),
                    Err(e) => log::warn!("Dropping deferred update for {guid}: {e}"),
                }
            }
            {
                let mut shared = self.shared.lock();
                for update in still_gapped {
                    shared.pending.defer(guid, update);
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn drain_pending(&self, doc: &Doc, guid: &str, epoch: u64) {
        let cached = {
            let mut shared = self.shared.lock();
            if !shared.connected || shared.epoch != epoch {
                return;
            }
            shared.pending.take(guid)
        };
        if !cached.is_empty() {
            log::debug!("Applying {} cached updates to {guid}", cached.len());
        }
        for update in cached {
            if let Err(e) = self.reconcile(doc, guid, update) {
                log::warn!("Dropping cached update for {guid}: {e}");
            }
        }
    }

    /// Detach `guid` and everything below it.
    fn dispose_doc(&self, guid: &str) {
        let mut visited = HashSet::new();
        self.dispose_recursive(guid, &mut visited);
    }

    fn dispose_recursive(&self, guid: &str, visited: &mut HashSet<String>) {
        if !visited.insert(guid.to_string()) {
            return;
        }
        let (doc, listeners) = {
            let mut shared = self.shared.lock();
            shared.connected_docs.remove(guid);
            shared.pending.remove(guid);
            let listeners = shared.listeners.remove(guid);
            (shared.registry.remove(guid).ok(), listeners)
        };
        if let Some(listeners) = listeners {
            listeners.live.store(false, Ordering::Release);
        }
        let Some(doc) = doc else {
            return;
        };

        log::debug!("Disposed {guid}");
        self.synced.send_modify(|synced| {
            synced.remove(guid);
        });
        if guid != self.root_guid {
            let _ = self.lifecycle.send(DocLifecycle::Removed(guid.to_string()));
        }
        for sub in subdocs_of(&doc) {
            self.dispose_recursive(&sub.guid().to_string(), visited);
        }
    }

    fn disconnect(&self) {
        let (listeners, cancel, adapter_sub) = {
            let mut shared = self.shared.lock();
            if !shared.connected && shared.listeners.is_empty() && shared.cancel.is_none() {
                return;
            }
            shared.connected = false;
            shared.epoch += 1;
            shared.connected_docs.clear();
            shared.registry.clear();
            shared.pending.clear();
            shared.events = None;
            (
                std::mem::take(&mut shared.listeners),
                shared.cancel.take(),
                shared.adapter_sub.take(),
            )
        };
        for l in listeners.values() {
            l.live.store(false, Ordering::Release);
        }
        drop(listeners);
        if let Some(cancel) = cancel {
            let _ = cancel.send(true);
        }
        drop(adapter_sub);

        self.synced.send_modify(HashSet::clear);
        self.status.set_connected(false);
        log::info!("Disconnected {}", self.root_guid);
    }
}

fn subdocs_of(doc: &Doc) -> Vec<Doc> {
    let txn = doc.transact();
    txn.subdocs().cloned().collect()
}

fn should_load(doc: &Doc) -> bool {
    doc.should_load()
}

/// Sub-documents that asked to be loaded. Lazy ones stay untouched until
/// `Doc::load` fires a `loaded` event for them.
fn loaded_subdocs_of(doc: &Doc) -> Vec<Doc> {
    subdocs_of(doc).into_iter().filter(should_load).collect()
}

/// Register the update, subdocs and destroy observers for one document.
fn observe(
    doc: &Doc,
    guid: &str,
    tx: mpsc::UnboundedSender<DocEvent>,
    live: Arc<AtomicBool>,
) -> SyncResult<Vec<Subscription>> {
    let on_update = {
        let (tx, guid, live) = (tx.clone(), guid.to_string(), live.clone());
        doc.observe_update_v1(move |txn, event| {
            if !live.load(Ordering::Acquire) {
                return;
            }
            let origin = txn
                .origin()
                .map(|o| String::from_utf8_lossy(o.as_ref()).into_owned());
            let _ = tx.send(DocEvent::Local {
                guid: guid.clone(),
                update: event.update.clone(),
                origin,
                live: live.clone(),
            });
        })
        .map_err(|e| SyncError::Observer(format!("update: {e:?}")))?
    };

    let on_subdocs = {
        let (tx, live) = (tx.clone(), live.clone());
        doc.observe_subdocs(move |_, event| {
            if !live.load(Ordering::Acquire) {
                return;
            }
            let _ = tx.send(DocEvent::Subdocs {
                added: event.added().cloned().collect(),
                removed: event.removed().cloned().collect(),
                loaded: event.loaded().cloned().collect(),
            });
        })
        .map_err(|e| SyncError::Observer(format!("subdocs: {e:?}")))?
    };

    let on_destroy = {
        let guid = guid.to_string();
        doc.observe_destroy(move |_, _| {
            // Stop forwarding right away; the pump disposes the rest later.
            if !live.swap(false, Ordering::AcqRel) {
                return;
            }
            let _ = tx.send(DocEvent::Destroyed { guid: guid.clone() });
        })
        .map_err(|e| SyncError::Observer(format!("destroy: {e:?}")))?
    };

    Ok(vec![on_update, on_subdocs, on_destroy])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;
    use yrs::{GetString, Text, WriteTxn};

    fn insert_text(doc: &Doc, s: &str) {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, s);
    }

    fn text_of(doc: &Doc) -> String {
        let mut txn = doc.transact_mut();
        txn.get_or_insert_text("content").get_string(&txn)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[test]
    fn test_options_default() {
        assert_eq!(ProviderOptions::default().author, "unknown-provider");
    }

    #[tokio::test]
    async fn test_connect_pushes_local_state() {
        let adapter = Arc::new(MemoryStorage::new());
        let root = update::new_doc("root");
        insert_text(&root, "offline edit");

        let provider = LazyProvider::new(root, adapter.clone(), ProviderOptions::new("a"));
        provider.connect().await.unwrap();
        assert!(provider.is_connected());
        assert!(provider.is_doc_connected("root"));
        assert_eq!(provider.status(), Status::Synced);

        let stored = adapter.query_doc_state("root", None).await.unwrap();
        let replica = Doc::new();
        crate::checker::apply(&replica, &stored.missing_update, "test").unwrap();
        assert_eq!(text_of(&replica), "offline edit");
    }

    #[tokio::test]
    async fn test_local_edits_are_forwarded() {
        let adapter = Arc::new(MemoryStorage::new());
        let root = update::new_doc("root");
        let provider = LazyProvider::new(root.clone(), adapter.clone(), ProviderOptions::new("a"));
        provider.connect().await.unwrap();

        insert_text(&root, "typed");
        let forwarded = eventually(|| {
            adapter.stats("root").is_some_and(|s| s.record_count > 0)
        })
        .await;
        assert!(forwarded);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_and_disconnect_resets() {
        let adapter = Arc::new(MemoryStorage::new());
        let provider = LazyProvider::new(update::new_doc("root"), adapter.clone(), ProviderOptions::new("a"));

        provider.connect().await.unwrap();
        provider.connect().await.unwrap();
        assert_eq!(adapter.subscriber_count(), 1);

        provider.disconnect();
        provider.disconnect();
        assert!(!provider.is_connected());
        assert!(provider.connected_guids().is_empty());
        assert!(provider.doc("root").is_none());
        assert_eq!(adapter.subscriber_count(), 0);
        assert_eq!(provider.status(), Status::Idle);
    }

    #[tokio::test]
    async fn test_sync_restores_connected_flag() {
        let adapter = Arc::new(MemoryStorage::new());
        let root = update::new_doc("root");
        insert_text(&root, "x");
        let provider = LazyProvider::new(root, adapter.clone(), ProviderOptions::new("a"));

        provider.sync(true).await.unwrap();
        assert!(!provider.is_connected());
        assert!(adapter.stats("root").is_some());
    }

    #[tokio::test]
    async fn test_dump_unknown_guid() {
        let provider = LazyProvider::new(
            update::new_doc("root"),
            Arc::new(MemoryStorage::new()),
            ProviderOptions::default(),
        );
        assert!(matches!(provider.dump("root"), Err(SyncError::DocumentNotFound(_))));
        provider.connect().await.unwrap();
        assert!(provider.dump("root").unwrap().contains_key("root"));
    }
}
