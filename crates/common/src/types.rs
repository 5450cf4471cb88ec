// Core domain types shared across all Atlas crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parent key used for top-level items in the children map.
pub const ROOT_PARENT_KEY: &str = "root";

/// One navigable node in the workspace tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    /// Opaque stable identifier assigned by the remote API.
    pub id: String,
    pub title: String,
    pub kind: ItemKind,
    pub icon: Option<Icon>,
    /// Derived from the index's children map, never trusted from the remote API.
    pub has_children: bool,
    pub created_at: DateTime<Utc>,
    pub last_edited_at: DateTime<Utc>,
    pub parent_kind: ParentKind,
    /// `None` means the item sits at the workspace root.
    pub parent_id: Option<String>,
    pub url: String,
}

impl Item {
    /// Key of the children-map bucket this item belongs to.
    pub fn parent_key(&self) -> String {
        parent_key_for(self.parent_id.as_deref())
    }
}

/// Children-map key for an optional parent id.
pub fn parent_key_for(parent_id: Option<&str>) -> String {
    parent_id.unwrap_or(ROOT_PARENT_KEY).to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Page,
    Collection,
}

/// Item icon as rendered by clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Icon {
    /// A unicode emoji, e.g. "📄".
    Emoji(String),
    /// A named symbolic icon from the client's icon set.
    Symbolic(String),
}

/// What kind of container the remote API reports as an item's parent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParentKind {
    Root,
    Item,
    CollectionRow,
    Block,
}

// ── Batch operations ────────────────────────────────────────────────

/// One requested re-parenting within a batch move.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MoveRequest {
    pub id: String,
    /// `None` requests a move to the workspace root.
    pub new_parent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BatchMoveOptions {
    /// Validate without performing the remote move.
    pub dry_run: bool,
    /// Mark all not-yet-attempted moves as skipped after the first failure.
    pub stop_on_error: bool,
}

/// Terminal status of one entry in a batch move.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MoveStatus {
    Moved,
    DryRunOk,
    Failed,
    /// Not attempted because an earlier entry failed with `stop_on_error`.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MoveOutcome {
    pub id: String,
    pub new_parent_id: Option<String>,
    pub status: MoveStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchMoveResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub outcomes: Vec<MoveOutcome>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BatchArchiveResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<ArchiveFailure>,
}

// ── Tree rendering ──────────────────────────────────────────────────

/// One node of a rendered index subtree.
///
/// `title`/`kind` are omitted when the caller asked for ids only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeNode {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ItemKind>,
    pub children: Vec<TreeNode>,
}
