// Cursor pagination with a hard page-count valve.
//
// The remote API has been observed to hand out unstable cursor sequences
// that keep claiming more data; the valve caps remote calls per logical
// read no matter what the server says, so no caller can loop unboundedly.

use serde_json::{json, Value};
use tracing::warn;

use atlas_common::error::Result;

use super::{ApiClient, ApiTransport, Method};
use crate::ratelimit::Priority;

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGES: u32 = 100;

/// Exhaust a cursor-paginated endpoint into one ordered collection.
///
/// Stops when the server reports no further pages or after `max_pages`
/// requests, whichever comes first.
pub async fn fetch_all<T: ApiTransport>(
    client: &ApiClient<T>,
    path: &str,
    method: Method,
    base_body: Option<Value>,
    priority: Priority,
    page_size: u32,
    max_pages: u32,
) -> Result<Vec<Value>> {
    let max_pages = max_pages.max(1);
    let mut results = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0u32;

    loop {
        let (request_path, body) = match method {
            Method::Get => (with_query(path, page_size, cursor.as_deref()), base_body.clone()),
            _ => (
                path.to_string(),
                Some(with_body_cursor(base_body.clone(), page_size, cursor.as_deref())),
            ),
        };

        let page = client.call(&request_path, method, body, priority).await?;
        pages += 1;

        if let Some(items) = page.get("results").and_then(Value::as_array) {
            results.extend(items.iter().cloned());
        }

        let has_more = page.get("has_more").and_then(Value::as_bool).unwrap_or(false);
        cursor = page.get("next_cursor").and_then(Value::as_str).map(ToOwned::to_owned);

        if !has_more || cursor.is_none() {
            break;
        }
        if pages >= max_pages {
            warn!(path, pages, collected = results.len(), "pagination valve tripped, truncating");
            break;
        }
    }

    Ok(results)
}

fn with_query(path: &str, page_size: u32, cursor: Option<&str>) -> String {
    let separator = if path.contains('?') { '&' } else { '?' };
    match cursor {
        Some(cursor) => format!("{path}{separator}page_size={page_size}&start_cursor={cursor}"),
        None => format!("{path}{separator}page_size={page_size}"),
    }
}

fn with_body_cursor(base_body: Option<Value>, page_size: u32, cursor: Option<&str>) -> Value {
    let mut body = match base_body {
        Some(Value::Object(map)) => Value::Object(map),
        Some(other) => other,
        None => json!({}),
    };
    if let Some(map) = body.as_object_mut() {
        map.insert("page_size".to_string(), json!(page_size));
        if let Some(cursor) = cursor {
            map.insert("start_cursor".to_string(), json!(cursor));
        }
    }
    body
}
