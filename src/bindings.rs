//! Chat binding lookup: map a chat id to the directory record that owns it.
//!
//! Records come from an external directory (for example the teachers list of a REST API) and are
//! cached in the [`StateStore`] so each chat is looked up remotely at most once.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SourceError;
use crate::state::{BindingRecord, StateStore};

/// Numeric chat identifier of a notification destination.
pub type ChatId = i64;

/// Record fields that may hold a chat id, in lookup order.
pub const CHAT_FIELDS: [&str; 5] =
    ["telegram_chat_id", "tg_chat_id", "chat_id", "telegram_id", "tg_id"];

/// Source of bindable records.
#[async_trait]
pub trait BindingDirectory: Send + Sync {
    async fn list_records(&self) -> Result<Vec<BindingRecord>, SourceError>;
}

/// Cached record for `chat_id`, or the first directory record naming it. Directory failures
/// resolve to `None` and are retried on the next call.
pub async fn resolve_binding<D>(
    state: &StateStore,
    directory: &D,
    chat_id: ChatId,
) -> Option<BindingRecord>
where
    D: BindingDirectory + ?Sized,
{
    let key = chat_id.to_string();
    if let Some(record) = state.cached_binding(&key) {
        return Some(record);
    }

    let records = match directory.list_records().await {
        Ok(records) => records,
        Err(err) => {
            tracing::warn!(chat_id, error = %err, "binding directory unavailable");
            return None;
        }
    };

    let found = records.into_iter().find(|record| record_mentions(record, &key))?;
    tracing::info!(chat_id, "chat binding cached");
    state.cache_binding(key, found.clone()).await;
    Some(found)
}

fn record_mentions(record: &BindingRecord, key: &str) -> bool {
    CHAT_FIELDS
        .iter()
        .filter_map(|field| record.get(*field))
        .filter_map(value_text)
        .any(|text| text == key)
}

/// First candidate field that parses as an integer chat id.
pub fn chat_id_from_record(record: &BindingRecord) -> Option<ChatId> {
    CHAT_FIELDS
        .iter()
        .filter_map(|field| record.get(*field))
        .filter_map(value_text)
        .find_map(|text| text.trim().parse().ok())
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
