// Mutation engine: remote writes with in-place index patching.
//
// The index is only patched after the remote call succeeds — the remote
// API is the authority. A move is validated against the current
// (possibly stale) parent map first; validation never blocks on a
// rebuild, and the remote side rejects whatever the local check misses.

use std::collections::{HashMap, HashSet};

use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use atlas_common::error::{Error, Result};
use atlas_common::types::{
    ArchiveFailure, BatchArchiveResult, BatchMoveOptions, BatchMoveResult, Item, MoveOutcome,
    MoveRequest, MoveStatus, TreeNode,
};

use crate::api::paginate::{self, DEFAULT_PAGE_SIZE};
use crate::api::{wire, ApiClient, ApiTransport, Method};
use crate::index::WorkspaceIndexer;
use crate::ratelimit::Priority;

/// Upper bound on remote lookups in one ancestry walk.
pub const MAX_ANCESTRY_DEPTH: usize = 50;

pub const DEFAULT_TREE_DEPTH: usize = 2;
pub const MAX_TREE_DEPTH: usize = 10;

pub struct MutationEngine<T> {
    api: ApiClient<T>,
    indexer: WorkspaceIndexer<T>,
}

impl<T: ApiTransport + Send + Sync + 'static> MutationEngine<T> {
    pub fn new(api: ApiClient<T>, indexer: WorkspaceIndexer<T>) -> Self {
        Self { api, indexer }
    }

    pub async fn create_page(&self, parent_id: &str, title: &str) -> Result<Item> {
        let body = json!({
            "parent": {"type": "item", "id": parent_id},
            "title": title,
        });
        let response =
            self.api.call("/items", Method::Post, Some(body), Priority::Interactive).await?;
        let item = wire::parse_item(&response).ok_or_else(|| Error::RemoteApi {
            status: 200,
            code: "malformed_response".to_string(),
            message: "create response was not an item".to_string(),
        })?;

        self.indexer.patch_add(item.clone());
        self.indexer.invalidate_children(parent_id);
        info!(id = %item.id, parent = parent_id, "page created");
        Ok(item)
    }

    pub async fn rename_page(&self, id: &str, new_title: &str) -> Result<()> {
        self.api
            .call(
                &format!("/items/{id}"),
                Method::Patch,
                Some(json!({"title": new_title})),
                Priority::Interactive,
            )
            .await?;
        self.indexer.patch_rename(id, new_title);
        Ok(())
    }

    pub async fn archive_page(&self, id: &str) -> Result<()> {
        self.archive_with_priority(id, Priority::Interactive).await
    }

    async fn archive_with_priority(&self, id: &str, priority: Priority) -> Result<()> {
        self.api
            .call(&format!("/items/{id}"), Method::Patch, Some(json!({"archived": true})), priority)
            .await?;
        if let Some(removed) = self.indexer.patch_remove(id) {
            if let Some(parent_id) = removed.parent_id.as_deref() {
                self.indexer.invalidate_children(parent_id);
            }
        }
        Ok(())
    }

    /// Re-parent `id` under `new_parent_id`.
    ///
    /// `None` means the workspace root, which the remote API cannot
    /// express through its item-update surface; that asymmetry is a
    /// backend capability gap, surfaced as `Unsupported`.
    pub async fn move_page(&self, id: &str, new_parent_id: Option<&str>) -> Result<()> {
        let Some(new_parent) = new_parent_id else {
            return Err(Error::Unsupported(
                "this backend cannot move items to the workspace root".to_string(),
            ));
        };

        let parents = self.indexer.parent_map();
        detect_cycle(&parents, id, Some(new_parent))?;

        self.api
            .call(
                &format!("/items/{id}/move"),
                Method::Post,
                Some(json!({"new_parent_id": new_parent})),
                Priority::Interactive,
            )
            .await?;

        let old_parent = self.indexer.item(id).and_then(|item| item.parent_id);
        self.indexer.patch_move(id, Some(new_parent));
        if let Some(old_parent) = old_parent.as_deref() {
            self.indexer.invalidate_children(old_parent);
        }
        self.indexer.invalidate_children(new_parent);
        info!(id, new_parent, "page moved");
        Ok(())
    }

    /// Apply moves strictly in input order. Each entry's cycle check runs
    /// against a running copy of the parent map that already reflects the
    /// earlier entries of the same batch.
    pub async fn batch_move(
        &self,
        moves: &[MoveRequest],
        options: BatchMoveOptions,
    ) -> Result<BatchMoveResult> {
        let started = Instant::now();
        let mut parents = self.indexer.parent_map();
        let mut outcomes: Vec<MoveOutcome> = Vec::with_capacity(moves.len());
        let mut stopped = false;

        for request in moves {
            if stopped {
                outcomes.push(outcome(request, MoveStatus::Skipped, Some("skipped: an earlier move failed")));
                continue;
            }

            if request.new_parent_id.is_none() {
                outcomes.push(outcome(
                    request,
                    MoveStatus::Failed,
                    Some("this backend cannot move items to the workspace root"),
                ));
                stopped = options.stop_on_error;
                continue;
            }

            // Cycle detection runs in dry-run mode too; validating only
            // remote existence while ignoring an obvious cycle would
            // green-light a move that can never be applied.
            if let Err(error) = detect_cycle(&parents, &request.id, request.new_parent_id.as_deref())
            {
                warn!(id = %request.id, error = %error, "batch move entry rejected");
                outcomes.push(outcome(request, MoveStatus::Failed, Some(&error.to_string())));
                stopped = options.stop_on_error;
                continue;
            }

            let remote = if options.dry_run {
                // Existence check only; nothing moves.
                self.api
                    .call(&format!("/items/{}", request.id), Method::Get, None, Priority::Background)
                    .await
                    .map(|_| ())
            } else {
                self.api
                    .call(
                        &format!("/items/{}/move", request.id),
                        Method::Post,
                        Some(json!({"new_parent_id": request.new_parent_id})),
                        Priority::Background,
                    )
                    .await
                    .map(|_| ())
            };

            match remote {
                Ok(()) => {
                    // Later entries must see this move applied.
                    parents.insert(request.id.clone(), request.new_parent_id.clone());
                    if options.dry_run {
                        outcomes.push(outcome(request, MoveStatus::DryRunOk, None));
                    } else {
                        let old_parent =
                            self.indexer.item(&request.id).and_then(|item| item.parent_id);
                        self.indexer.patch_move(&request.id, request.new_parent_id.as_deref());
                        if let Some(old_parent) = old_parent.as_deref() {
                            self.indexer.invalidate_children(old_parent);
                        }
                        if let Some(new_parent) = request.new_parent_id.as_deref() {
                            self.indexer.invalidate_children(new_parent);
                        }
                        outcomes.push(outcome(request, MoveStatus::Moved, None));
                    }
                }
                Err(error) => {
                    outcomes.push(outcome(request, MoveStatus::Failed, Some(&error.to_string())));
                    stopped = options.stop_on_error;
                }
            }
        }

        let succeeded = outcomes
            .iter()
            .filter(|o| matches!(o.status, MoveStatus::Moved | MoveStatus::DryRunOk))
            .count();
        let failed = outcomes.iter().filter(|o| o.status == MoveStatus::Failed).count();
        let skipped = outcomes.iter().filter(|o| o.status == MoveStatus::Skipped).count();
        let result = BatchMoveResult {
            total: moves.len(),
            succeeded,
            failed,
            skipped,
            outcomes,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            dry_run = options.dry_run,
            "batch move finished"
        );
        Ok(result)
    }

    /// Archive sequentially, collecting per-item failures without
    /// aborting the batch.
    pub async fn batch_archive(&self, ids: &[String]) -> Result<BatchArchiveResult> {
        let mut result = BatchArchiveResult::default();
        for id in ids {
            match self.archive_with_priority(id, Priority::Background).await {
                Ok(()) => result.succeeded.push(id.clone()),
                Err(error) => {
                    warn!(id, error = %error, "batch archive entry failed");
                    result.failed.push(ArchiveFailure { id: id.clone(), error: error.to_string() });
                }
            }
        }
        Ok(result)
    }

    /// Walk parent pointers upward, one remote lookup at a time. The
    /// index may be stale or absent, so the remote side is authoritative
    /// here; the walk is bounded by depth and a visited set because the
    /// remote has returned malformed parent chains before.
    pub async fn get_ancestry(&self, id: &str) -> Result<Vec<Item>> {
        let mut chain = Vec::new();
        let mut cursor = id.to_string();
        let mut visited = HashSet::new();

        for _ in 0..MAX_ANCESTRY_DEPTH {
            if !visited.insert(cursor.clone()) {
                warn!(id, at = %cursor, "ancestry walk found a cycle in remote data, stopping");
                break;
            }
            let value = self
                .api
                .call(&format!("/items/{cursor}"), Method::Get, None, Priority::Interactive)
                .await?;
            let item = wire::parse_item(&value).ok_or_else(|| Error::RemoteApi {
                status: 200,
                code: "malformed_response".to_string(),
                message: format!("item `{cursor}` response was not an item"),
            })?;
            let parent = item.parent_id.clone();
            chain.push(item);
            match parent {
                Some(parent) => cursor = parent,
                None => break,
            }
        }

        Ok(chain)
    }

    /// Render the index as a tree from `root_id` (or the workspace roots)
    /// down to a bounded depth.
    pub async fn get_tree(
        &self,
        root_id: Option<&str>,
        max_depth: Option<i64>,
        ids_only: bool,
    ) -> Result<Vec<TreeNode>> {
        let depth = clamp_tree_depth(max_depth);
        self.indexer.ensure_fresh(Priority::Interactive, true).await?;

        let rendered = self.indexer.with_index(|index| match root_id {
            Some(id) => match index.item_by_id.get(id) {
                Some(item) => Ok(vec![TreeNode {
                    id: item.id.clone(),
                    title: (!ids_only).then(|| item.title.clone()),
                    kind: (!ids_only).then_some(item.kind),
                    children: render_children(index, id, depth, ids_only),
                }]),
                None => Err(Error::NotFound(format!("item `{id}` is not in the index"))),
            },
            None => Ok(render_children(index, atlas_common::types::ROOT_PARENT_KEY, depth, ids_only)),
        });

        rendered.unwrap_or_else(|| Ok(Vec::new()))
    }

    /// Remote full-text search, bounded by `max_results`.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Item>> {
        let max_results = max_results.max(1);
        let page_size = (max_results as u32).min(DEFAULT_PAGE_SIZE);
        let max_pages = (max_results as u32).div_ceil(page_size);

        let raw = paginate::fetch_all(
            &self.api,
            "/search",
            Method::Post,
            Some(json!({"query": query})),
            Priority::Interactive,
            page_size,
            max_pages,
        )
        .await?;

        Ok(raw
            .iter()
            .filter(|value| !wire::is_discarded(value))
            .filter_map(wire::parse_item)
            .take(max_results)
            .collect())
    }
}

fn outcome(request: &MoveRequest, status: MoveStatus, error: Option<&str>) -> MoveOutcome {
    MoveOutcome {
        id: request.id.clone(),
        new_parent_id: request.new_parent_id.clone(),
        status,
        error: error.map(ToOwned::to_owned),
    }
}

/// Walk the candidate parent's ancestor chain; if the moved item shows
/// up, the move would create a cycle. A visited set stops the walk
/// (without error) when the chain itself is already cyclic in
/// pre-existing data. Moving to the root is acyclic by definition.
pub fn detect_cycle(
    parents: &HashMap<String, Option<String>>,
    id: &str,
    new_parent_id: Option<&str>,
) -> Result<()> {
    let Some(target) = new_parent_id else {
        return Ok(());
    };

    let mut cursor = target.to_string();
    let mut visited: HashSet<String> = HashSet::new();
    loop {
        if cursor == id {
            return Err(Error::CycleDetected {
                id: id.to_string(),
                new_parent_id: target.to_string(),
            });
        }
        if !visited.insert(cursor.clone()) {
            // Pre-existing cycle elsewhere in the data; not this move's fault.
            return Ok(());
        }
        match parents.get(&cursor).and_then(Clone::clone) {
            Some(parent) => cursor = parent,
            None => return Ok(()),
        }
    }
}

/// Clamp a requested tree depth into the safe range, falling back to the
/// default for anything non-positive, oversized, or absent. An invalid
/// bound must degrade to the default depth, never to an empty tree.
pub fn clamp_tree_depth(requested: Option<i64>) -> usize {
    match requested {
        Some(depth) if depth >= 1 && depth <= MAX_TREE_DEPTH as i64 => depth as usize,
        _ => DEFAULT_TREE_DEPTH,
    }
}

fn render_children(
    index: &crate::index::WorkspaceIndex,
    parent_key: &str,
    depth: usize,
    ids_only: bool,
) -> Vec<TreeNode> {
    if depth == 0 {
        return Vec::new();
    }
    let Some(bucket) = index.children_by_parent.get(parent_key) else {
        return Vec::new();
    };
    bucket
        .iter()
        .map(|item| TreeNode {
            id: item.id.clone(),
            title: (!ids_only).then(|| item.title.clone()),
            kind: (!ids_only).then_some(item.kind),
            children: render_children(index, &item.id, depth - 1, ids_only),
        })
        .collect()
}
