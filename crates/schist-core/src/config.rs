use serde::{Deserialize, Serialize};

/// Configuration for the caching layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether URL lookups are cached alongside blob values (default: true)
    #[serde(default = "default_true")]
    pub cache_file_urls: bool,

    /// Whether every mutation flushes its key to the backend immediately
    /// (write-through, default) or mutations are deferred until an
    /// explicit flush.
    ///
    /// The transactional layer always runs its cache deferred so commit
    /// and abort can decide the fate of pending modifications.
    #[serde(default = "default_true")]
    pub auto_flushing: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_file_urls: default_true(),
            auto_flushing: default_true(),
        }
    }
}

impl CacheConfig {
    /// Write-through configuration: mutations reach the backend as they
    /// happen.
    pub fn write_through() -> Self {
        Self::default()
    }

    /// Deferred configuration: mutations stay in memory until an explicit
    /// flush.
    pub fn deferred() -> Self {
        Self {
            auto_flushing: false,
            ..Self::default()
        }
    }

    pub fn with_cache_file_urls(mut self, cache_file_urls: bool) -> Self {
        self.cache_file_urls = cache_file_urls;
        self
    }

    pub fn with_auto_flushing(mut self, auto_flushing: bool) -> Self {
        self.auto_flushing = auto_flushing;
        self
    }
}

/// Configuration for the append-packed layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendPackedConfig {
    /// Maximum container body size in bytes (default: 64 KiB)
    #[serde(default = "default_max_container_size")]
    pub max_container_size: usize,

    /// Path prefix prepended to the master key and every container key
    /// (default: empty)
    #[serde(default)]
    pub root: String,

    /// Name of the reserved master-index blob under `root`
    #[serde(default = "default_append_master_name")]
    pub master_name: String,
}

impl Default for AppendPackedConfig {
    fn default() -> Self {
        Self {
            max_container_size: default_max_container_size(),
            root: String::new(),
            master_name: default_append_master_name(),
        }
    }
}

impl AppendPackedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_container_size(mut self, max_container_size: usize) -> Self {
        self.max_container_size = max_container_size;
        self
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_master_name(mut self, master_name: impl Into<String>) -> Self {
        self.master_name = master_name.into();
        self
    }
}

/// Configuration for the json-packed layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonPackedConfig {
    /// Maximum number of entries per container object (default: 128)
    #[serde(default = "default_max_entries")]
    pub max_entries_per_container: usize,

    /// Path prefix prepended to the master key and every container key
    /// (default: empty)
    #[serde(default)]
    pub root: String,

    /// Name of the reserved master-index blob under `root`
    #[serde(default = "default_json_master_name")]
    pub master_name: String,
}

impl Default for JsonPackedConfig {
    fn default() -> Self {
        Self {
            max_entries_per_container: default_max_entries(),
            root: String::new(),
            master_name: default_json_master_name(),
        }
    }
}

impl JsonPackedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries_per_container(mut self, max_entries: usize) -> Self {
        self.max_entries_per_container = max_entries;
        self
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_master_name(mut self, master_name: impl Into<String>) -> Self {
        self.master_name = master_name.into();
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_max_container_size() -> usize {
    64 * 1024
}

fn default_append_master_name() -> String {
    "ra-master.json".to_string()
}

fn default_max_entries() -> usize {
    128
}

fn default_json_master_name() -> String {
    "jm-master.json".to_string()
}
