// Backend wiring: the remote-API backend behind the shared contract.
//
// `resolve` is the factory the surrounding system calls once at startup;
// everything past that point goes through `dyn ContentBackend`, so other
// content systems can ship their own implementations without touching
// callers.

use std::time::Duration;

use tracing::info;

use atlas_common::backend::{BackendCapabilities, BoxFuture, ContentBackend};
use atlas_common::error::Result;
use atlas_common::types::{
    BatchArchiveResult, BatchMoveOptions, BatchMoveResult, Item, MoveRequest,
};

use crate::api::{ApiClient, ApiTransport, ReqwestTransport};
use crate::config::{BackendKind, EngineConfig};
use crate::index::WorkspaceIndexer;
use crate::mutation::MutationEngine;
use crate::ratelimit::{Priority, RateLimiter};

/// The primary backend: a remote workspace API fronted by the local index.
pub struct RemoteBackend<T> {
    indexer: WorkspaceIndexer<T>,
    mutations: MutationEngine<T>,
}

impl<T: ApiTransport + Send + Sync + 'static> RemoteBackend<T> {
    pub fn new(config: &EngineConfig, transport: T) -> Result<Self> {
        let limiter =
            RateLimiter::new(config.rate.max_tokens, Duration::from_millis(config.rate.window_ms));
        let api = ApiClient::new(config, limiter, transport);
        let indexer = WorkspaceIndexer::new(api.clone(), config)?;
        let mutations = MutationEngine::new(api, indexer.clone());
        Ok(Self { indexer, mutations })
    }
}

impl<T: ApiTransport + Send + Sync + 'static> ContentBackend for RemoteBackend<T> {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn capabilities(&self) -> BackendCapabilities {
        // The remote API has no way to re-parent an item to the
        // workspace root through its stable surface.
        BackendCapabilities { supports_root_moves: false }
    }

    fn get_root_items(&self) -> BoxFuture<'_, Result<Vec<Item>>> {
        Box::pin(self.indexer.get_root_items(Priority::Interactive, true))
    }

    fn get_children<'a>(&'a self, parent_id: &'a str) -> BoxFuture<'a, Result<Vec<Item>>> {
        Box::pin(self.indexer.get_children(parent_id, Priority::Interactive))
    }

    fn create_page<'a>(
        &'a self,
        parent_id: &'a str,
        title: &'a str,
    ) -> BoxFuture<'a, Result<Item>> {
        Box::pin(self.mutations.create_page(parent_id, title))
    }

    fn rename_page<'a>(&'a self, id: &'a str, new_title: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.mutations.rename_page(id, new_title))
    }

    fn archive_page<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.mutations.archive_page(id))
    }

    fn move_page<'a>(
        &'a self,
        id: &'a str,
        new_parent_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.mutations.move_page(id, new_parent_id))
    }

    fn batch_move<'a>(
        &'a self,
        moves: &'a [MoveRequest],
        options: BatchMoveOptions,
    ) -> BoxFuture<'a, Result<BatchMoveResult>> {
        Box::pin(self.mutations.batch_move(moves, options))
    }

    fn batch_archive<'a>(
        &'a self,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<BatchArchiveResult>> {
        Box::pin(self.mutations.batch_archive(ids))
    }

    fn search<'a>(
        &'a self,
        query: &'a str,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<Item>>> {
        Box::pin(self.mutations.search(query, max_results))
    }
}

/// Construct the configured backend. Unknown kinds never get here: they
/// already fail when the config file is parsed.
pub fn resolve(config: &EngineConfig) -> Result<Box<dyn ContentBackend>> {
    match config.backend {
        BackendKind::Remote => {
            info!(backend = "remote", api_url = %config.api_url, "resolving content backend");
            Ok(Box::new(RemoteBackend::new(config, ReqwestTransport::new())?))
        }
    }
}
