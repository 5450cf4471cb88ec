// Backend contract: the narrow surface every content backend satisfies.
//
// The surrounding system (UI, HTTP routes, CLI) only ever talks to a
// `dyn ContentBackend`, so backends for other content systems can slot in
// without touching callers. Methods return boxed futures to keep the
// trait object-safe; implementations own their caching strategy.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::types::{
    BatchArchiveResult, BatchMoveOptions, BatchMoveResult, Item, MoveRequest,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a given backend can and cannot do beyond the shared contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Whether `move_page(id, None)` can re-parent an item to the
    /// workspace root. The primary remote API has no such operation.
    pub supports_root_moves: bool,
}

pub trait ContentBackend: Send + Sync {
    /// Short stable backend name for logs and config.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> BackendCapabilities;

    fn get_root_items(&self) -> BoxFuture<'_, Result<Vec<Item>>>;

    fn get_children<'a>(&'a self, parent_id: &'a str) -> BoxFuture<'a, Result<Vec<Item>>>;

    fn create_page<'a>(&'a self, parent_id: &'a str, title: &'a str)
        -> BoxFuture<'a, Result<Item>>;

    fn rename_page<'a>(&'a self, id: &'a str, new_title: &'a str) -> BoxFuture<'a, Result<()>>;

    fn archive_page<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Re-parent `id` under `new_parent_id` (`None` = workspace root).
    /// Fails with a `CycleDetected` kind on structural violation and with
    /// `Unsupported` when the backend lacks root moves.
    fn move_page<'a>(
        &'a self,
        id: &'a str,
        new_parent_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>>;

    fn batch_move<'a>(
        &'a self,
        moves: &'a [MoveRequest],
        options: BatchMoveOptions,
    ) -> BoxFuture<'a, Result<BatchMoveResult>>;

    fn batch_archive<'a>(&'a self, ids: &'a [String])
        -> BoxFuture<'a, Result<BatchArchiveResult>>;

    fn search<'a>(&'a self, query: &'a str, max_results: usize)
        -> BoxFuture<'a, Result<Vec<Item>>>;
}
