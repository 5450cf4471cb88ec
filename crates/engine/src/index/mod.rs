// Workspace index: parent→children map plus flat item table.
//
// Built by one full crawl per cache generation, kept consistent by
// in-place patches from the mutation engine, and persisted as an
// advisory warm-start snapshot. At most one crawl runs at a time;
// callers arriving during a crawl either share its outcome or — when
// stale reads are permitted — get the previous generation immediately.
//
// Every patch is a single synchronous sequence of in-memory updates
// under the write lock, so concurrent readers never observe a
// half-patched bucket.

pub mod snapshot;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use atlas_common::error::{Error, Result};
use atlas_common::types::{Item, ParentKind, ROOT_PARENT_KEY};

use crate::api::paginate::{self, DEFAULT_PAGE_SIZE, MAX_PAGES};
use crate::api::{wire, ApiClient, ApiTransport, Method};
use crate::config::EngineConfig;
use crate::ratelimit::Priority;
use snapshot::SnapshotStore;

const SEARCH_PATH: &str = "/search";

pub(crate) fn children_path(parent_id: &str) -> String {
    format!("/items/{parent_id}/children")
}

// ── Index data ──────────────────────────────────────────────────────

/// One generation of the in-memory index.
#[derive(Debug, Clone)]
pub struct WorkspaceIndex {
    /// Parent key (`"root"` or an item id) → ordered children.
    pub children_by_parent: HashMap<String, Vec<Item>>,
    /// Flat table of every indexed item.
    pub item_by_id: HashMap<String, Item>,
    pub built_at: DateTime<Utc>,
}

impl WorkspaceIndex {
    /// Build a generation from crawl output: dedup by id (first
    /// occurrence wins — the crawl has unstable ordering and can repeat
    /// items across pages), bucket by parent, derive `has_children`.
    pub fn from_items(items: Vec<Item>, built_at: DateTime<Utc>) -> Self {
        let mut seen = HashSet::new();
        let mut deduped: Vec<Item> = Vec::with_capacity(items.len());
        for item in items {
            if seen.insert(item.id.clone()) {
                deduped.push(item);
            }
        }

        let parents_with_children: HashSet<String> =
            deduped.iter().filter_map(|item| item.parent_id.clone()).collect();
        for item in &mut deduped {
            item.has_children = parents_with_children.contains(&item.id);
        }

        let mut children_by_parent: HashMap<String, Vec<Item>> = HashMap::new();
        let mut item_by_id = HashMap::with_capacity(deduped.len());
        for item in deduped {
            children_by_parent.entry(item.parent_key()).or_default().push(item.clone());
            item_by_id.insert(item.id.clone(), item);
        }

        Self { children_by_parent, item_by_id, built_at }
    }

    pub fn children(&self, parent_key: &str) -> Option<Vec<Item>> {
        self.children_by_parent.get(parent_key).cloned()
    }

    pub fn has_children(&self, id: &str) -> bool {
        self.item_by_id.get(id).is_some_and(|item| item.has_children)
    }

    /// Flat item list in bucket order, suitable for `from_items`.
    pub fn ordered_items(&self) -> Vec<Item> {
        let mut out = Vec::with_capacity(self.item_by_id.len());
        for bucket in self.children_by_parent.values() {
            out.extend(bucket.iter().cloned());
        }
        out
    }

    /// Add an item to its parent's bucket and the flat table.
    pub fn insert(&mut self, mut item: Item) {
        self.remove(&item.id);
        item.has_children =
            self.children_by_parent.get(&item.id).is_some_and(|bucket| !bucket.is_empty());
        let key = item.parent_key();
        self.item_by_id.insert(item.id.clone(), item.clone());
        self.children_by_parent.entry(key.clone()).or_default().push(item);
        if key != ROOT_PARENT_KEY {
            self.set_has_children(&key, true);
        }
    }

    /// Drop an item from the flat table and its parent's bucket,
    /// re-deriving the parent's `has_children`.
    pub fn remove(&mut self, id: &str) -> Option<Item> {
        let item = self.item_by_id.remove(id)?;
        let key = item.parent_key();
        if let Some(bucket) = self.children_by_parent.get_mut(&key) {
            bucket.retain(|entry| entry.id != id);
            if bucket.is_empty() {
                self.children_by_parent.remove(&key);
            }
        }
        if key != ROOT_PARENT_KEY {
            self.refresh_has_children(&key);
        }
        Some(item)
    }

    /// Update the title wherever the item is referenced.
    pub fn rename(&mut self, id: &str, new_title: &str) -> bool {
        let key = match self.item_by_id.get_mut(id) {
            Some(item) => {
                item.title = new_title.to_string();
                item.parent_key()
            }
            None => return false,
        };
        if let Some(bucket) = self.children_by_parent.get_mut(&key) {
            if let Some(entry) = bucket.iter_mut().find(|entry| entry.id == id) {
                entry.title = new_title.to_string();
            }
        }
        true
    }

    /// Re-parent an item: out of the old bucket, into the new one, with
    /// `has_children` re-derived on both sides.
    pub fn apply_move(&mut self, id: &str, new_parent_id: Option<&str>) -> bool {
        let Some(mut item) = self.remove(id) else {
            return false;
        };
        item.parent_id = new_parent_id.map(ToOwned::to_owned);
        item.parent_kind = if new_parent_id.is_some() { ParentKind::Item } else { ParentKind::Root };
        self.insert(item);
        true
    }

    fn set_has_children(&mut self, id: &str, value: bool) {
        let key = match self.item_by_id.get_mut(id) {
            Some(item) => {
                item.has_children = value;
                item.parent_key()
            }
            None => return,
        };
        if let Some(bucket) = self.children_by_parent.get_mut(&key) {
            if let Some(entry) = bucket.iter_mut().find(|entry| entry.id == id) {
                entry.has_children = value;
            }
        }
    }

    fn refresh_has_children(&mut self, id: &str) {
        let value = self.children_by_parent.get(id).is_some_and(|bucket| !bucket.is_empty());
        self.set_has_children(id, value);
    }
}

// ── Indexer ─────────────────────────────────────────────────────────

/// Outcome broadcast to everyone awaiting the in-flight build.
type BuildStatus = Option<std::result::Result<(), Error>>;

struct ChildCacheEntry {
    fetched_at: Instant,
    items: Vec<Item>,
}

struct IndexerInner<T> {
    api: ApiClient<T>,
    state: RwLock<Option<WorkspaceIndex>>,
    /// `Some` while a build is in flight; joiners clone the receiver.
    build: AsyncMutex<Option<watch::Receiver<BuildStatus>>>,
    snapshot: SnapshotStore,
    /// Short-TTL cache for direct children fetches of parents the index
    /// does not cover.
    child_cache: Mutex<HashMap<String, ChildCacheEntry>>,
    root_ttl: Duration,
    child_ttl: Duration,
}

/// Owns the index, the crawl, the snapshot, and the single-flight guard.
///
/// Cheap to clone: clones share one inner state, like the rate limiter.
pub struct WorkspaceIndexer<T> {
    inner: Arc<IndexerInner<T>>,
}

impl<T> Clone for WorkspaceIndexer<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: ApiTransport + Send + Sync + 'static> WorkspaceIndexer<T> {
    pub fn new(api: ApiClient<T>, config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(IndexerInner {
                snapshot: SnapshotStore::new(&config.cache_dir)?,
                api,
                state: RwLock::new(None),
                build: AsyncMutex::new(None),
                child_cache: Mutex::new(HashMap::new()),
                root_ttl: config.root_ttl,
                child_ttl: config.child_ttl,
            }),
        })
    }

    /// Return once the index is usable.
    ///
    /// Fresh index → immediate. Build in flight → serve stale if the
    /// caller tolerates it and has data, else await the same build. No
    /// index at all → warm-start from the snapshot (revalidating in the
    /// background) or crawl synchronously.
    pub async fn ensure_fresh(&self, priority: Priority, allow_stale: bool) -> Result<()> {
        let (have_index, fresh) = {
            let state = self.inner.state.read().expect("index lock poisoned");
            match state.as_ref() {
                Some(index) => (true, self.is_fresh(index.built_at)),
                None => (false, false),
            }
        };
        if fresh {
            return Ok(());
        }

        let build_in_flight = self.inner.build.lock().await.is_some();
        if build_in_flight {
            if allow_stale && have_index {
                // Non-blocking read-through of the previous generation.
                return Ok(());
            }
            return self.build_full(priority).await;
        }

        if !have_index {
            if let Some((built_at, items)) = self.inner.snapshot.load() {
                let index = WorkspaceIndex::from_items(items, built_at);
                info!(items = index.item_by_id.len(), "warm start from snapshot");
                *self.inner.state.write().expect("index lock poisoned") = Some(index);
                self.spawn_background_build();
                return Ok(());
            }
            return self.build_full(priority).await;
        }

        // Stale in-memory index with no build running.
        if allow_stale {
            self.spawn_background_build();
            return Ok(());
        }
        self.build_full(priority).await
    }

    /// Crawl the whole workspace and atomically replace the index.
    ///
    /// Single-flight: a second caller arriving mid-build awaits the same
    /// build instead of starting another crawl. The guard is released on
    /// success and failure alike, and a failed crawl leaves any previous
    /// generation untouched.
    pub async fn build_full(&self, priority: Priority) -> Result<()> {
        enum Role {
            Builder(watch::Sender<BuildStatus>),
            Joiner(watch::Receiver<BuildStatus>),
        }

        let role = {
            let mut slot = self.inner.build.lock().await;
            match slot.as_ref() {
                Some(rx) => Role::Joiner(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Role::Builder(tx)
                }
            }
        };

        match role {
            Role::Joiner(mut rx) => loop {
                if let Some(outcome) = rx.borrow_and_update().clone() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    // The builder was dropped without publishing (task
                    // cancelled). Release the guard so the next call can
                    // retry instead of joining a dead build.
                    let mut slot = self.inner.build.lock().await;
                    if slot.as_ref().is_some_and(|r| r.has_changed().is_err()) {
                        *slot = None;
                    }
                    return Err(Error::Transport("index build aborted".to_string()));
                }
            },
            Role::Builder(tx) => {
                let outcome = self.crawl_and_replace(priority).await;
                {
                    let mut slot = self.inner.build.lock().await;
                    *slot = None;
                }
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
        }
    }

    async fn crawl_and_replace(&self, priority: Priority) -> std::result::Result<(), Error> {
        let started = Instant::now();
        let raw = paginate::fetch_all(
            &self.inner.api,
            SEARCH_PATH,
            Method::Post,
            Some(json!({"query": ""})),
            priority,
            DEFAULT_PAGE_SIZE,
            MAX_PAGES,
        )
        .await?;

        let total = raw.len();
        let mut items = Vec::with_capacity(total);
        for value in &raw {
            if wire::is_discarded(value) {
                continue;
            }
            if let Some(item) = wire::parse_item(value) {
                items.push(item);
            }
        }

        let index = WorkspaceIndex::from_items(items, Utc::now());
        info!(
            items = index.item_by_id.len(),
            crawled = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "workspace index rebuilt"
        );

        let built_at = index.built_at;
        let snapshot_items = index.ordered_items();
        *self.inner.state.write().expect("index lock poisoned") = Some(index);

        let store = self.inner.snapshot.clone();
        match tokio::task::spawn_blocking(move || store.save(built_at, &snapshot_items)).await {
            Ok(Ok(path)) => debug!(path = %path.display(), "index snapshot persisted"),
            Ok(Err(error)) => warn!(error = %error, "index snapshot persist failed"),
            Err(error) => warn!(error = %error, "index snapshot task panicked"),
        }
        Ok(())
    }

    fn spawn_background_build(&self) {
        let indexer = self.clone();
        tokio::spawn(async move {
            if let Err(error) = indexer.build_full(Priority::Background).await {
                warn!(error = %error, "background index revalidation failed");
            }
        });
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_root_items(&self, priority: Priority, allow_stale: bool) -> Result<Vec<Item>> {
        self.ensure_fresh(priority, allow_stale).await?;
        let state = self.inner.state.read().expect("index lock poisoned");
        Ok(state.as_ref().and_then(|index| index.children(ROOT_PARENT_KEY)).unwrap_or_default())
    }

    /// Children of `parent_id`, from the index when covered, otherwise a
    /// direct remote fetch cached for a short TTL (freshly-created leaf
    /// nodes, children below what the crawl materializes).
    pub async fn get_children(&self, parent_id: &str, priority: Priority) -> Result<Vec<Item>> {
        self.ensure_fresh(priority, true).await?;

        let indexed = {
            let state = self.inner.state.read().expect("index lock poisoned");
            state.as_ref().and_then(|index| index.children(parent_id))
        };
        if let Some(items) = indexed {
            return Ok(items);
        }

        if let Some(items) = self.cached_children(parent_id) {
            return Ok(items);
        }

        debug!(parent = parent_id, "children not covered by index, fetching directly");
        let raw = paginate::fetch_all(
            &self.inner.api,
            &children_path(parent_id),
            Method::Get,
            None,
            priority,
            DEFAULT_PAGE_SIZE,
            MAX_PAGES,
        )
        .await?;
        let items: Vec<Item> = raw
            .iter()
            .filter(|value| !wire::is_discarded(value))
            .filter_map(wire::parse_item)
            .collect();
        self.inner.child_cache.lock().expect("child cache lock poisoned").insert(
            parent_id.to_string(),
            ChildCacheEntry { fetched_at: Instant::now(), items: items.clone() },
        );
        Ok(items)
    }

    pub fn item(&self, id: &str) -> Option<Item> {
        let state = self.inner.state.read().expect("index lock poisoned");
        state.as_ref().and_then(|index| index.item_by_id.get(id).cloned())
    }

    /// id → parent_id over the current generation, empty when no index
    /// exists yet. Never awaits an in-flight build: move validation is
    /// best-effort against possibly stale data by design.
    pub fn parent_map(&self) -> HashMap<String, Option<String>> {
        let state = self.inner.state.read().expect("index lock poisoned");
        state
            .as_ref()
            .map(|index| {
                index
                    .item_by_id
                    .iter()
                    .map(|(id, item)| (id.clone(), item.parent_id.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run `f` against the current generation, if any.
    pub fn with_index<R>(&self, f: impl FnOnce(&WorkspaceIndex) -> R) -> Option<R> {
        let state = self.inner.state.read().expect("index lock poisoned");
        state.as_ref().map(f)
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        let state = self.inner.state.read().expect("index lock poisoned");
        state.as_ref().map(|index| index.built_at)
    }

    // ── In-place patches ────────────────────────────────────────────

    pub fn patch_add(&self, item: Item) {
        {
            let mut state = self.inner.state.write().expect("index lock poisoned");
            if let Some(index) = state.as_mut() {
                index.insert(item);
            }
        }
        self.schedule_persist();
    }

    pub fn patch_rename(&self, id: &str, new_title: &str) {
        {
            let mut state = self.inner.state.write().expect("index lock poisoned");
            if let Some(index) = state.as_mut() {
                index.rename(id, new_title);
            }
        }
        self.schedule_persist();
    }

    /// Returns the removed item so callers can invalidate its parent.
    pub fn patch_remove(&self, id: &str) -> Option<Item> {
        let removed = {
            let mut state = self.inner.state.write().expect("index lock poisoned");
            state.as_mut().and_then(|index| index.remove(id))
        };
        self.schedule_persist();
        removed
    }

    pub fn patch_move(&self, id: &str, new_parent_id: Option<&str>) -> bool {
        let moved = {
            let mut state = self.inner.state.write().expect("index lock poisoned");
            state.as_mut().is_some_and(|index| index.apply_move(id, new_parent_id))
        };
        self.schedule_persist();
        moved
    }

    /// Drop the short-TTL children-cache entry for a parent whose
    /// children just changed remotely.
    pub fn invalidate_children(&self, parent_id: &str) {
        self.inner.child_cache.lock().expect("child cache lock poisoned").remove(parent_id);
    }

    // ── Internals ───────────────────────────────────────────────────

    fn is_fresh(&self, built_at: DateTime<Utc>) -> bool {
        Utc::now()
            .signed_duration_since(built_at)
            .to_std()
            .map(|age| age < self.inner.root_ttl)
            // A build timestamp in the future means it was built "just
            // now" under clock skew; treat it as fresh.
            .unwrap_or(true)
    }

    fn cached_children(&self, parent_id: &str) -> Option<Vec<Item>> {
        let mut cache = self.inner.child_cache.lock().expect("child cache lock poisoned");
        match cache.get(parent_id) {
            Some(entry) if entry.fetched_at.elapsed() < self.inner.child_ttl => {
                Some(entry.items.clone())
            }
            Some(_) => {
                cache.remove(parent_id);
                None
            }
            None => None,
        }
    }

    /// Persist the current generation without blocking the caller.
    fn schedule_persist(&self) {
        let (built_at, items) = {
            let state = self.inner.state.read().expect("index lock poisoned");
            let Some(index) = state.as_ref() else {
                return;
            };
            (index.built_at, index.ordered_items())
        };
        let store = self.inner.snapshot.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || store.save(built_at, &items)).await {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => warn!(error = %error, "index snapshot persist failed"),
                Err(error) => warn!(error = %error, "index snapshot task panicked"),
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn api(&self) -> &ApiClient<T> {
        &self.inner.api
    }
}
