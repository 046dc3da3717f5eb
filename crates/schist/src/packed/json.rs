//! Json-packed layout
//!
//! Containers hold a JSON object mapping logical key to payload, bounded
//! by entry count. Deleting the last entry of a container deletes the
//! physical container itself. A container body that exists but does not
//! parse is repaired to an empty object with a log, so one corrupt
//! container never wedges the whole layer.

use super::{join_root, new_container_key, JsonMasterRecord, MASTER_ENCRYPTED};
use async_trait::async_trait;
use parking_lot::Mutex;
use schist_core::{BlobStore, JsonPackedConfig, ListOptions, Result, SchistError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone)]
struct Container {
    key: String,
    count: usize,
    encrypted: bool,
}

#[derive(Debug, Clone)]
struct EntryRef {
    container: String,
    encrypted: bool,
}

#[derive(Debug, Default)]
struct JsonState {
    containers: Vec<Container>,
    entries: HashMap<String, EntryRef>,
    order: Vec<String>,
}

impl JsonState {
    fn track(&mut self, key: &str, entry: EntryRef) {
        if !self.entries.contains_key(key) && !self.order.iter().any(|k| k == key) {
            self.order.push(key.to_string());
        }
        self.entries.insert(key.to_string(), entry);
    }

    fn untrack(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }

    fn set_container_count(&mut self, key: &str, count: usize) {
        if let Some(container) = self.containers.iter_mut().find(|c| c.key == key) {
            container.count = count;
        }
    }

    fn drop_container(&mut self, key: &str) {
        self.containers.retain(|c| c.key != key);
    }
}

/// Packs blobs as values of a JSON object per container, bounded by
/// entry count, with a persisted master index.
pub struct JsonPackedBlobStore<S> {
    inner: S,
    config: JsonPackedConfig,
    master_key: String,
    state: Mutex<Option<JsonState>>,
}

impl<S: BlobStore> JsonPackedBlobStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_config(inner, JsonPackedConfig::default())
    }

    pub fn with_config(inner: S, config: JsonPackedConfig) -> Self {
        let master_key = join_root(&config.root, &config.master_name);
        Self {
            inner,
            config,
            master_key,
            state: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The reserved key the master index is persisted under.
    pub fn master_key(&self) -> &str {
        &self.master_key
    }

    /// Load the master index. Every operation loads on demand, so
    /// calling this explicitly is optional.
    pub async fn load(&self) -> Result<()> {
        if self.state.lock().is_some() {
            return Ok(());
        }
        let body = self.inner.get(&self.master_key, MASTER_ENCRYPTED).await?;
        let loaded = match body {
            Some(text) => self.parse_master(&text)?,
            None => JsonState::default(),
        };
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(loaded);
        }
        Ok(())
    }

    fn corrupt(&self, reason: impl Into<String>) -> SchistError {
        SchistError::MasterCorrupt {
            key: self.master_key.clone(),
            reason: reason.into(),
        }
    }

    fn parse_master(&self, text: &str) -> Result<JsonState> {
        let records: Vec<JsonMasterRecord> =
            serde_json::from_str(text).map_err(|e| self.corrupt(e.to_string()))?;

        let mut state = JsonState::default();
        for record in records {
            if state.entries.contains_key(&record.path) {
                return Err(self.corrupt(format!("duplicate entry '{}'", record.path)));
            }
            let found = state
                .containers
                .iter()
                .position(|c| c.key == record.parent_path);
            match found {
                Some(index) => {
                    if state.containers[index].encrypted != record.encrypted {
                        return Err(self.corrupt(format!(
                            "container '{}' mixes encrypted flags",
                            record.parent_path
                        )));
                    }
                    state.containers[index].count += 1;
                }
                None => state.containers.push(Container {
                    key: record.parent_path.clone(),
                    count: 1,
                    encrypted: record.encrypted,
                }),
            }
            state.order.push(record.path.clone());
            state.entries.insert(
                record.path,
                EntryRef {
                    container: record.parent_path,
                    encrypted: record.encrypted,
                },
            );
        }
        Ok(state)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut JsonState) -> R) -> Result<R> {
        let mut state = self.state.lock();
        let state = state.as_mut().ok_or(SchistError::NotLoaded)?;
        Ok(f(state))
    }

    async fn save_master(&self) -> Result<()> {
        let records = self.with_state(|state| {
            state
                .order
                .iter()
                .filter_map(|key| {
                    state.entries.get(key).map(|entry| JsonMasterRecord {
                        parent_path: entry.container.clone(),
                        path: key.clone(),
                        encrypted: entry.encrypted,
                    })
                })
                .collect::<Vec<_>>()
        })?;
        let payload = serde_json::to_string(&records)
            .map_err(|e| SchistError::Serialization(e.to_string()))?;
        self.inner
            .put(&self.master_key, &payload, MASTER_ENCRYPTED)
            .await
    }

    /// Read a container body as a JSON object. Absent or unparseable
    /// bodies repair to empty so a single bad container stays readable
    /// around.
    async fn read_container(&self, key: &str, encrypted: bool) -> Result<Map<String, Value>> {
        match self.inner.get(key, encrypted).await? {
            None => Ok(Map::new()),
            Some(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(object)) => Ok(object),
                Ok(_) | Err(_) => {
                    warn!(container = key, "unparseable container body, repairing as empty");
                    Ok(Map::new())
                }
            },
        }
    }

    async fn write_container(
        &self,
        key: &str,
        object: &Map<String, Value>,
        encrypted: bool,
    ) -> Result<()> {
        let payload = serde_json::to_string(&Value::Object(object.clone()))
            .map_err(|e| SchistError::Serialization(e.to_string()))?;
        self.inner.put(key, &payload, encrypted).await
    }

    /// Place a new entry: first container with a matching encrypted flag
    /// and a free slot, else a fresh one.
    async fn insert_entry(&self, key: &str, value: &str, encrypted: bool) -> Result<()> {
        let max = self.config.max_entries_per_container;
        let (container_key, is_new) = self.with_state(|state| {
            let found = state
                .containers
                .iter()
                .position(|c| c.encrypted == encrypted && c.count < max);
            match found {
                Some(index) => (state.containers[index].key.clone(), false),
                None => {
                    let fresh = new_container_key(&self.config.root);
                    state.containers.push(Container {
                        key: fresh.clone(),
                        count: 0,
                        encrypted,
                    });
                    (fresh, true)
                }
            }
        })?;

        let mut object = if is_new {
            Map::new()
        } else {
            self.read_container(&container_key, encrypted).await?
        };
        object.insert(key.to_string(), Value::String(value.to_string()));
        self.write_container(&container_key, &object, encrypted).await?;

        self.with_state(|state| {
            state.set_container_count(&container_key, object.len());
            state.track(
                key,
                EntryRef {
                    container: container_key.clone(),
                    encrypted,
                },
            );
        })
    }

    /// Drop an entry from its container, deleting the container once its
    /// object is empty.
    async fn remove_entry(&self, key: &str, entry: &EntryRef) -> Result<()> {
        let mut object = self.read_container(&entry.container, entry.encrypted).await?;
        object.remove(key);

        if object.is_empty() {
            self.inner.delete(&entry.container).await?;
            self.with_state(|state| {
                state.drop_container(&entry.container);
                state.untrack(key);
            })
        } else {
            self.write_container(&entry.container, &object, entry.encrypted)
                .await?;
            self.with_state(|state| {
                state.set_container_count(&entry.container, object.len());
                state.untrack(key);
            })
        }
    }

    /// The URL of the physical container blob holding `key`.
    pub async fn container_url(&self, key: &str) -> Result<Option<String>> {
        self.load().await?;
        let container = self.with_state(|state| {
            state.entries.get(key).map(|entry| entry.container.clone())
        })?;
        match container {
            Some(container) => self.inner.url(&container).await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for JsonPackedBlobStore<S> {
    async fn get(&self, key: &str, _encrypted: bool) -> Result<Option<String>> {
        self.load().await?;
        let located = self.with_state(|state| state.entries.get(key).cloned())?;
        let Some(entry) = located else {
            return Ok(None);
        };

        let object = self.read_container(&entry.container, entry.encrypted).await?;
        match object.get(key) {
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => {
                warn!(container = %entry.container, key, "non-string payload in container");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, encrypted: bool) -> Result<()> {
        self.load().await?;
        let existing = self.with_state(|state| state.entries.get(key).cloned())?;
        match existing {
            Some(entry) if entry.encrypted == encrypted => {
                let mut object = self.read_container(&entry.container, encrypted).await?;
                object.insert(key.to_string(), Value::String(value.to_string()));
                self.write_container(&entry.container, &object, encrypted)
                    .await?;
                self.with_state(|state| {
                    state.set_container_count(&entry.container, object.len());
                    state.track(key, entry.clone());
                })?;
            }
            Some(entry) => {
                // The encrypted flag changed; the entry migrates to a
                // container with the matching flag.
                self.remove_entry(key, &entry).await?;
                self.insert_entry(key, value, encrypted).await?;
            }
            None => self.insert_entry(key, value, encrypted).await?,
        }
        self.save_master().await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.load().await?;
        let existing = self.with_state(|state| state.entries.get(key).cloned())?;
        let Some(entry) = existing else {
            return Ok(());
        };
        self.remove_entry(key, &entry).await?;
        self.save_master().await
    }

    async fn list(&self, options: ListOptions) -> Result<Vec<String>> {
        self.load().await?;
        let names = self.with_state(|state| state.order.clone())?;
        Ok(options.apply(names))
    }

    async fn url(&self, key: &str) -> Result<Option<String>> {
        Err(SchistError::UrlUnavailable { key: key.into() })
    }
}
