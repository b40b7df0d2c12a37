//! Durable shared state: sent item ids, chat binding cache, and authorized subjects.
//!
//! The in-memory aggregate sits behind one mutex. [`StateStore::with_state`] is the only way to
//! change it; the lock is never held across an `.await`. [`StateStore::persist`] writes the whole
//! aggregate to a sibling temp file, fsyncs it, and renames it over the canonical path, so a reader
//! after a crash sees either the previous snapshot or the new one.
//!
//! Loading never fails: a missing file yields empty state and an unreadable or corrupt one is
//! logged and replaced by empty state.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{LoadError, PersistError};
use crate::rate_limit::SubjectId;

/// A previously resolved destination record, stored verbatim.
pub type BindingRecord = Map<String, Value>;

/// The complete serializable aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Items already handled; never shrinks.
    #[serde(default, deserialize_with = "string_ids")]
    pub sent_ids: BTreeSet<String>,
    /// Chat id (as string) to resolved record.
    #[serde(default, deserialize_with = "object_entries")]
    pub chat_cache: BTreeMap<String, BindingRecord>,
    #[serde(default, deserialize_with = "subject_ids")]
    pub admin_ids: BTreeSet<SubjectId>,
}

/// Ids written by older producers may be numbers; keep them as their decimal text.
fn string_ids<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeSet<String>, D::Error> {
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect())
}

/// Subject ids may be stored as numeric strings; anything that is not an integer is dropped.
fn subject_ids<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeSet<SubjectId>, D::Error> {
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .collect())
}

/// Drop cache entries that are not JSON objects instead of rejecting the whole snapshot.
fn object_entries<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, BindingRecord>, D::Error> {
    let raw = Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| match v {
            Value::Object(record) => Some((k, record)),
            _ => None,
        })
        .collect())
}

/// Mutex-guarded [`PersistedState`] bound to one snapshot file.
pub struct StateStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
    // Serializes snapshot writes so an older snapshot never lands after a newer one.
    write_order: tokio::sync::Mutex<()>,
    temp_path: fn(&Path) -> PathBuf,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("path", &self.path).field("state", &self.state).finish()
    }
}

impl StateStore {
    /// Load the snapshot at `path`, falling back to empty state on any failure.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match Self::read_snapshot(&path).await {
            Ok(state) => {
                tracing::info!(
                    path = %path.display(),
                    sent = state.sent_ids.len(),
                    cached = state.chat_cache.len(),
                    admins = state.admin_ids.len(),
                    "state loaded"
                );
                state
            }
            Err(err) => {
                tracing::warn!(error = %err, "state load failed; starting empty");
                PersistedState::default()
            }
        };
        Self::with_initial(path, state)
    }

    /// Read a snapshot without installing it. A missing file is not an error.
    pub async fn read_snapshot(path: &Path) -> Result<PersistedState, LoadError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PersistedState::default()),
            Err(source) => return Err(LoadError::Io { path: path.to_path_buf(), source }),
        };
        serde_json::from_slice(&bytes)
            .map_err(|source| LoadError::Corrupt { path: path.to_path_buf(), source })
    }

    /// Build a store around existing state without touching the filesystem.
    pub fn with_initial(path: impl Into<PathBuf>, state: PersistedState) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(state),
            write_order: tokio::sync::Mutex::new(()),
            temp_path: unique_temp_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared read access under the state lock.
    pub fn read<R>(&self, f: impl FnOnce(&PersistedState) -> R) -> R {
        f(&self.lock())
    }

    /// Exclusive access under the state lock. The sole mutation path.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> R {
        f(&mut self.lock())
    }

    /// Mutate, then persist before returning. Persist failures are logged, not returned.
    pub async fn commit<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> R {
        let out = self.with_state(f);
        let _ = self.persist().await;
        out
    }

    pub fn snapshot(&self) -> PersistedState {
        self.lock().clone()
    }

    /// Write the current aggregate atomically to the canonical path.
    pub async fn persist(&self) -> Result<(), PersistError> {
        let _order = self.write_order.lock().await;
        let result = match self.encode() {
            Ok(bytes) => atomic_write(&self.path, &(self.temp_path)(&self.path), &bytes).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            tracing::error!(path = %self.path.display(), error = %err, "state persist failed");
        }
        result
    }

    fn encode(&self) -> Result<Vec<u8>, PersistError> {
        let guard = self.lock();
        Ok(serde_json::to_vec_pretty(&*guard)?)
    }

    pub fn is_sent(&self, item_id: &str) -> bool {
        self.read(|s| s.sent_ids.contains(item_id))
    }

    /// Copy of the sent set, taken under the lock.
    pub fn sent_snapshot(&self) -> BTreeSet<String> {
        self.read(|s| s.sent_ids.clone())
    }

    /// Record an item as handled and persist. Returns false if it was already recorded.
    pub async fn mark_sent(&self, item_id: &str) -> bool {
        let inserted = self.with_state(|s| s.sent_ids.insert(item_id.to_owned()));
        if inserted {
            let _ = self.persist().await;
        }
        inserted
    }

    pub fn is_admin(&self, subject: SubjectId) -> bool {
        self.read(|s| s.admin_ids.contains(&subject))
    }

    /// Grant elevated capability and persist. Returns false if already granted.
    pub async fn grant_admin(&self, subject: SubjectId) -> bool {
        let inserted = self.with_state(|s| s.admin_ids.insert(subject));
        if inserted {
            tracing::info!(subject, "admin granted");
            let _ = self.persist().await;
        }
        inserted
    }

    pub fn cached_binding(&self, key: &str) -> Option<BindingRecord> {
        self.read(|s| s.chat_cache.get(key).cloned())
    }

    /// Cache a resolved record and persist.
    pub async fn cache_binding(&self, key: impl Into<String>, record: BindingRecord) {
        self.commit(|s| {
            s.chat_cache.insert(key.into(), record);
        })
        .await
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Uniquely named sibling of `final_path`.
fn unique_temp_path(final_path: &Path) -> PathBuf {
    let file_name = final_path.file_name().and_then(|n| n.to_str()).unwrap_or("state.json");
    final_path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()))
}

/// Write to `temp_path`, fsync, then rename over `final_path`.
async fn atomic_write(
    final_path: &Path,
    temp_path: &Path,
    data: &[u8],
) -> Result<(), PersistError> {
    let written = async {
        let mut file =
            fs::File::create(temp_path).await.map_err(|e| PersistError::io(temp_path, e))?;
        file.write_all(data).await.map_err(|e| PersistError::io(temp_path, e))?;
        file.sync_all().await.map_err(|e| PersistError::io(temp_path, e))?;
        fs::rename(temp_path, final_path).await.map_err(|e| PersistError::io(final_path, e))
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(temp_path).await;
    }
    written
}
