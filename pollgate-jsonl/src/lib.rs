//! JSONL notifier for `pollgate`. Writes one dispatched item per line.
//! Always appends; bring your own path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use pollgate::poller::{Destination, Notifier, WorkItem};
use pollgate::SourceError;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct JsonlNotifier {
    path: PathBuf,
    // Held for the whole append; lines never interleave.
    lock: Arc<Mutex<()>>,
}

impl JsonlNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Arc::new(Mutex::new(())) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Notifier for JsonlNotifier {
    async fn dispatch(
        &self,
        destination: &Destination,
        item: &WorkItem,
        related: Option<&Value>,
    ) -> Result<(), SourceError> {
        let line = record_line(destination, item, related);
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(SourceError::transport)?;
        file.write_all(line.as_bytes()).await.map_err(SourceError::transport)?;
        file.flush().await.map_err(SourceError::transport)?;
        tracing::debug!(item = %item.id, %destination, path = %self.path.display(), "appended");
        Ok(())
    }
}

fn record_line(destination: &Destination, item: &WorkItem, related: Option<&Value>) -> String {
    json!({
        "destination": destination.chat_id,
        "item_id": item.id,
        "status": item.status,
        "payload": item.payload,
        "related": related,
    })
    .to_string()
        + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_is_single_json_object() {
        let item = WorkItem::new("7", "Новая").with_payload(json!({"title": "a\nb"}));
        let line = record_line(&Destination::chat(5), &item, None);
        assert_eq!(line.matches('\n').count(), 1);
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["destination"], 5);
        assert_eq!(parsed["payload"]["title"], "a\nb");
        assert!(parsed["related"].is_null());
    }
}
