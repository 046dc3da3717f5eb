use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Early-stop predicate for listings.
///
/// Iteration over the (prefix-)filtered names stops the first time the
/// predicate returns `false`; the returned sequence contains only names
/// for which it returned `true` up to that point. This is
/// early-terminate, not filter.
pub type EarlyStop = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Options for `BlobStore::list`.
#[derive(Clone, Default)]
pub struct ListOptions {
    /// Keep only names starting with this prefix.
    pub prefix: Option<String>,
    /// Stop iteration at the first name this predicate rejects.
    pub early_stop: Option<EarlyStop>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_early_stop<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.early_stop = Some(Arc::new(predicate));
        self
    }

    /// Apply prefix filtering and early termination to `names`,
    /// preserving their order.
    pub fn apply<I>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut selected = Vec::new();
        for name in names {
            if let Some(prefix) = &self.prefix {
                if !name.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if let Some(stop) = &self.early_stop {
                if !stop(&name) {
                    break;
                }
            }
            selected.push(name);
        }
        selected
    }
}

impl fmt::Debug for ListOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListOptions")
            .field("prefix", &self.prefix)
            .field("early_stop", &self.early_stop.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// The uniform blob-storage contract every schist layer implements.
///
/// A blob is an opaque string payload plus an `encrypted` tag. The tag is
/// carried verbatim to and from the backend; no layer inspects it beyond
/// handing it back on retrieval. Absent blobs are `Ok(None)`, never
/// errors.
///
/// Every method is a suspension point; all other layer bookkeeping is
/// synchronous between backend calls.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the blob stored under `key`, or `None` if absent.
    async fn get(&self, key: &str, encrypted: bool) -> Result<Option<String>>;

    /// Store `value` under `key`.
    async fn put(&self, key: &str, value: &str, encrypted: bool) -> Result<()>;

    /// Remove the blob under `key`. Deleting an absent key is not an
    /// error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Enumerate stored keys, honoring `options`.
    async fn list(&self, options: ListOptions) -> Result<Vec<String>>;

    /// A direct URL for the blob under `key`, when the layer can provide
    /// one.
    async fn url(&self, key: &str) -> Result<Option<String>>;
}

#[async_trait]
impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    async fn get(&self, key: &str, encrypted: bool) -> Result<Option<String>> {
        (**self).get(key, encrypted).await
    }

    async fn put(&self, key: &str, value: &str, encrypted: bool) -> Result<()> {
        (**self).put(key, value, encrypted).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn list(&self, options: ListOptions) -> Result<Vec<String>> {
        (**self).list(options).await
    }

    async fn url(&self, key: &str) -> Result<Option<String>> {
        (**self).url(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn prefix_filters_without_reordering() {
        let options = ListOptions::new().with_prefix("a/");
        let out = options.apply(names(&["a/2", "b/1", "a/1"]));
        assert_eq!(out, names(&["a/2", "a/1"]));
    }

    #[test]
    fn early_stop_terminates_rather_than_filters() {
        let options = ListOptions::new().with_early_stop(|name| name.starts_with("a/"));
        let out = options.apply(names(&["a/1", "a/2", "b/1", "a/3"]));
        // "a/3" comes after the first rejection, so it is not visited.
        assert_eq!(out, names(&["a/1", "a/2"]));
    }

    #[test]
    fn early_stop_applies_to_the_filtered_sequence() {
        let options = ListOptions::new()
            .with_prefix("x/")
            .with_early_stop(|name| name != "x/stop");
        let out = options.apply(names(&["x/1", "y/ignored", "x/stop", "x/2"]));
        assert_eq!(out, names(&["x/1"]));
    }
}
