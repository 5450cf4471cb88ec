// Decoding of remote API payloads into domain items.
//
// The remote envelope for an item looks like:
//
//   {
//     "id": "...", "kind": "page" | "collection", "title": "...",
//     "icon": {"type": "emoji", "emoji": "📄"} | {"type": "icon", "name": "folder"},
//     "created_time": "...", "last_edited_time": "...",
//     "archived": false, "in_trash": false,
//     "parent": {"type": "root"} | {"type": "item" | "collection_row" | "block", "id": "..."},
//     "url": "https://..."
//   }

use chrono::{DateTime, Utc};
use serde_json::Value;

use atlas_common::types::{Icon, Item, ItemKind, ParentKind};

/// Whether the remote marked this entry archived or trashed; such entries
/// never enter the index.
pub fn is_discarded(value: &Value) -> bool {
    value.get("archived").and_then(Value::as_bool).unwrap_or(false)
        || value.get("in_trash").and_then(Value::as_bool).unwrap_or(false)
}

/// Decode one remote item envelope. Returns `None` for payloads missing
/// the id — anything else degrades to defaults rather than failing the
/// whole page.
pub fn parse_item(value: &Value) -> Option<Item> {
    let id = value.get("id")?.as_str()?.to_string();
    let kind = match value.get("kind").and_then(Value::as_str) {
        Some("collection") => ItemKind::Collection,
        _ => ItemKind::Page,
    };
    let title = value
        .get("title")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or("Untitled")
        .to_string();
    let (parent_kind, parent_id) = parse_parent(value.get("parent"));

    Some(Item {
        id,
        title,
        kind,
        icon: value.get("icon").and_then(parse_icon),
        // Derived from the children map after the crawl, never trusted
        // from the remote payload.
        has_children: false,
        created_at: parse_time(value.get("created_time")),
        last_edited_at: parse_time(value.get("last_edited_time")),
        parent_kind,
        parent_id,
        url: value.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
    })
}

fn parse_icon(value: &Value) -> Option<Icon> {
    match value.get("type").and_then(Value::as_str)? {
        "emoji" => value.get("emoji").and_then(Value::as_str).map(|e| Icon::Emoji(e.to_string())),
        "icon" => value.get("name").and_then(Value::as_str).map(|n| Icon::Symbolic(n.to_string())),
        _ => None,
    }
}

fn parse_parent(value: Option<&Value>) -> (ParentKind, Option<String>) {
    let Some(parent) = value else {
        return (ParentKind::Root, None);
    };
    let id = parent.get("id").and_then(Value::as_str).map(ToOwned::to_owned);
    match parent.get("type").and_then(Value::as_str) {
        Some("item") if id.is_some() => (ParentKind::Item, id),
        Some("collection_row") if id.is_some() => (ParentKind::CollectionRow, id),
        Some("block") if id.is_some() => (ParentKind::Block, id),
        _ => (ParentKind::Root, None),
    }
}

fn parse_time(value: Option<&Value>) -> DateTime<Utc> {
    value
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
        .unwrap_or_else(Utc::now)
}
