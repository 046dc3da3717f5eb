//! Append-packed layout
//!
//! Containers hold concatenated payloads; every entry records its
//! container, byte offset and byte length. Updates excise the old block,
//! shift later entries down, and append the new content, relocating
//! the entry when the container can no longer hold it. Deletes excise
//! and shift the same way but keep the emptied container around for
//! reuse.

use super::{join_root, new_container_key, AppendMasterRecord, MASTER_ENCRYPTED};
use async_trait::async_trait;
use parking_lot::Mutex;
use schist_core::{AppendPackedConfig, BlobStore, ListOptions, Result, SchistError};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone)]
struct Container {
    key: String,
    size: usize,
    encrypted: bool,
}

#[derive(Debug, Clone)]
struct EntryRef {
    container: String,
    position: usize,
    length: usize,
    encrypted: bool,
}

#[derive(Debug, Default)]
struct AppendState {
    containers: Vec<Container>,
    entries: HashMap<String, EntryRef>,
    // Logical keys in master order; listings replay it.
    order: Vec<String>,
}

impl AppendState {
    /// Shift down every other entry in `container` placed after an
    /// excised block.
    fn shift_after(&mut self, container: &str, position: usize, removed: usize) {
        for entry in self.entries.values_mut() {
            if entry.container == container && entry.position > position {
                entry.position = entry.position.saturating_sub(removed);
            }
        }
    }

    fn set_container_size(&mut self, key: &str, size: usize) {
        if let Some(container) = self.containers.iter_mut().find(|c| c.key == key) {
            container.size = size;
        }
    }

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
}

/// Remove `[position, position + length)` from `body`, returning the
/// excised body and the number of bytes actually removed. A block that
/// no longer lines up with the body is left in place and logged.
fn excise(body: &str, position: usize, length: usize) -> (String, usize) {
    let end = position + length;
    match (body.get(..position), body.get(end..)) {
        (Some(head), Some(tail)) => {
            let mut excised = String::with_capacity(body.len() - length);
            excised.push_str(head);
            excised.push_str(tail);
            (excised, length)
        }
        _ => {
            warn!(position, length, body_len = body.len(), "entry block out of range, leaving container body untouched");
            (body.to_string(), 0)
        }
    }
}

/// Packs arbitrary string blobs into shared containers bounded by body
/// size, with a persisted master index.
pub struct AppendPackedBlobStore<S> {
    inner: S,
    config: AppendPackedConfig,
    master_key: String,
    state: Mutex<Option<AppendState>>,
}

impl<S: BlobStore> AppendPackedBlobStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_config(inner, AppendPackedConfig::default())
    }

    pub fn with_config(inner: S, config: AppendPackedConfig) -> Self {
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
            None => AppendState::default(),
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

    fn parse_master(&self, text: &str) -> Result<AppendState> {
        let records: Vec<AppendMasterRecord> =
            serde_json::from_str(text).map_err(|e| self.corrupt(e.to_string()))?;

        let mut state = AppendState::default();
        for record in records {
            if state.entries.contains_key(&record.path) {
                return Err(self.corrupt(format!("duplicate entry '{}'", record.path)));
            }
            let index = match state
                .containers
                .iter()
                .position(|c| c.key == record.parent_path)
            {
                Some(index) => {
                    if state.containers[index].encrypted != record.encrypted {
                        return Err(self.corrupt(format!(
                            "container '{}' mixes encrypted flags",
                            record.parent_path
                        )));
                    }
                    index
                }
                None => {
                    state.containers.push(Container {
                        key: record.parent_path.clone(),
                        size: 0,
                        encrypted: record.encrypted,
                    });
                    state.containers.len() - 1
                }
            };
            let end = record
                .position
                .checked_add(record.length)
                .ok_or_else(|| self.corrupt(format!("entry '{}' overflows", record.path)))?;
            let container = &mut state.containers[index];
            container.size = container.size.max(end);

            state.order.push(record.path.clone());
            state.entries.insert(
                record.path,
                EntryRef {
                    container: record.parent_path,
                    position: record.position,
                    length: record.length,
                    encrypted: record.encrypted,
                },
            );
        }

        // Blocks within one container must not overlap.
        for container in &state.containers {
            let mut blocks: Vec<(usize, usize)> = state
                .entries
                .values()
                .filter(|e| e.container == container.key)
                .map(|e| (e.position, e.position + e.length))
                .collect();
            blocks.sort_unstable();
            for pair in blocks.windows(2) {
                if pair[1].0 < pair[0].1 {
                    return Err(
                        self.corrupt(format!("overlapping blocks in container '{}'", container.key))
                    );
                }
            }
        }
        Ok(state)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut AppendState) -> R) -> Result<R> {
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
                    state.entries.get(key).map(|entry| AppendMasterRecord {
                        parent_path: entry.container.clone(),
                        path: key.clone(),
                        position: entry.position,
                        length: entry.length,
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

    /// Place a new entry: first container with a matching encrypted flag
    /// and room for the payload, else a fresh one.
    async fn insert_entry(&self, key: &str, value: &str, encrypted: bool) -> Result<()> {
        let max = self.config.max_container_size;
        let (container_key, is_new) = self.with_state(|state| {
            let found = state
                .containers
                .iter()
                .position(|c| c.encrypted == encrypted && c.size + value.len() <= max);
            match found {
                Some(index) => (state.containers[index].key.clone(), false),
                None => {
                    let fresh = new_container_key(&self.config.root);
                    state.containers.push(Container {
                        key: fresh.clone(),
                        size: 0,
                        encrypted,
                    });
                    (fresh, true)
                }
            }
        })?;

        let mut body = if is_new {
            String::new()
        } else {
            self.inner
                .get(&container_key, encrypted)
                .await?
                .unwrap_or_default()
        };
        let position = body.len();
        body.push_str(value);
        self.inner.put(&container_key, &body, encrypted).await?;

        self.with_state(|state| {
            state.set_container_size(&container_key, body.len());
            state.track(
                key,
                EntryRef {
                    container: container_key.clone(),
                    position,
                    length: value.len(),
                    encrypted,
                },
            );
        })
    }

    /// Rewrite an existing entry, in place when the container can still
    /// hold it, relocated otherwise.
    async fn update_entry(
        &self,
        key: &str,
        entry: &EntryRef,
        value: &str,
        encrypted: bool,
    ) -> Result<()> {
        let body = self
            .inner
            .get(&entry.container, entry.encrypted)
            .await?
            .unwrap_or_default();
        let (mut excised, removed) = excise(&body, entry.position, entry.length);

        if excised.len() + value.len() <= self.config.max_container_size {
            let position = excised.len();
            excised.push_str(value);
            self.inner
                .put(&entry.container, &excised, entry.encrypted)
                .await?;
            self.with_state(|state| {
                state.shift_after(&entry.container, entry.position, removed);
                state.set_container_size(&entry.container, excised.len());
                state.track(
                    key,
                    EntryRef {
                        container: entry.container.clone(),
                        position,
                        length: value.len(),
                        encrypted,
                    },
                );
            })
        } else {
            self.inner
                .put(&entry.container, &excised, entry.encrypted)
                .await?;
            self.with_state(|state| {
                state.shift_after(&entry.container, entry.position, removed);
                state.set_container_size(&entry.container, excised.len());
                state.entries.remove(key);
            })?;
            self.insert_entry(key, value, encrypted).await
        }
    }

    /// Excise an entry's block and drop the entry. The emptied container
    /// is retained for reuse.
    async fn remove_entry(&self, key: &str, entry: &EntryRef) -> Result<()> {
        let body = self
            .inner
            .get(&entry.container, entry.encrypted)
            .await?
            .unwrap_or_default();
        let (excised, removed) = excise(&body, entry.position, entry.length);
        self.inner
            .put(&entry.container, &excised, entry.encrypted)
            .await?;
        self.with_state(|state| {
            state.shift_after(&entry.container, entry.position, removed);
            state.set_container_size(&entry.container, excised.len());
            state.untrack(key);
        })
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for AppendPackedBlobStore<S> {
    async fn get(&self, key: &str, _encrypted: bool) -> Result<Option<String>> {
        self.load().await?;
        let located = self.with_state(|state| state.entries.get(key).cloned())?;
        let Some(entry) = located else {
            return Ok(None);
        };

        let Some(body) = self.inner.get(&entry.container, entry.encrypted).await? else {
            warn!(container = %entry.container, key, "container missing for packed entry");
            return Ok(None);
        };
        match body.get(entry.position..entry.position + entry.length) {
            Some(block) => Ok(Some(block.to_string())),
            None => {
                warn!(container = %entry.container, key, "entry block out of range");
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: &str, encrypted: bool) -> Result<()> {
        self.load().await?;
        let existing = self.with_state(|state| state.entries.get(key).cloned())?;
        match existing {
            Some(entry) if entry.encrypted == encrypted => {
                self.update_entry(key, &entry, value, encrypted).await?;
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
