//! Namespaced key-value persistence for the boot record

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use errors::{NodeError, NodeResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Scalar storage that survives power loss, scoped to one namespace
pub trait KvStore {
    fn namespace(&self) -> &str;

    /// Stored value, or `default` when the key was never written
    fn get_int(&self, key: &str, default: i32) -> i32;

    fn put_int(&mut self, key: &str, value: i32) -> NodeResult<()>;

    fn get_ulong(&self, key: &str, default: u64) -> u64;

    fn put_ulong(&mut self, key: &str, value: u64) -> NodeResult<()>;
}

/// In-memory store for tests
///
/// Writes can be made to fail to simulate flash errors or a power cut
/// between a read and the following write.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    namespace: String,
    ints: HashMap<String, i32>,
    ulongs: HashMap<String, u64>,
    fail_writes: bool,
    writes: u64,
}

impl MemoryKvStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Successful writes so far
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn contains(&self, key: &str) -> bool {
        self.ints.contains_key(key) || self.ulongs.contains_key(key)
    }

    fn check_write(&self, key: &str) -> NodeResult<()> {
        if self.fail_writes {
            return Err(NodeError::storage(
                &self.namespace,
                key,
                "simulated write failure",
            ));
        }
        Ok(())
    }
}

impl KvStore for MemoryKvStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get_int(&self, key: &str, default: i32) -> i32 {
        self.ints.get(key).copied().unwrap_or(default)
    }

    fn put_int(&mut self, key: &str, value: i32) -> NodeResult<()> {
        self.check_write(key)?;
        self.ints.insert(key.to_string(), value);
        self.writes += 1;
        Ok(())
    }

    fn get_ulong(&self, key: &str, default: u64) -> u64 {
        self.ulongs.get(key).copied().unwrap_or(default)
    }

    fn put_ulong(&mut self, key: &str, value: u64) -> NodeResult<()> {
        self.check_write(key)?;
        self.ulongs.insert(key.to_string(), value);
        self.writes += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NamespaceData {
    #[serde(default)]
    ints: BTreeMap<String, i32>,
    #[serde(default)]
    ulongs: BTreeMap<String, u64>,
}

/// File-backed store: one JSON document per namespace under a state directory
///
/// Every write replaces the document through a temp file and a rename, so an
/// interrupted write leaves the previous values in place.
#[derive(Debug)]
pub struct FileKvStore {
    namespace: String,
    path: PathBuf,
    data: NamespaceData,
}

impl FileKvStore {
    pub fn open(state_dir: impl AsRef<Path>, namespace: &str) -> NodeResult<Self> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(format!("{}.json", namespace));

        let data = if path.exists() {
            let content = fs::read(&path)?;
            match serde_json::from_slice::<NamespaceData>(&content) {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        "Store {} unreadable ({}), starting from defaults",
                        path.display(),
                        e
                    );
                    NamespaceData::default()
                },
            }
        } else {
            NamespaceData::default()
        };

        debug!("Opened store {} at {}", namespace, path.display());
        Ok(Self {
            namespace: namespace.to_string(),
            path,
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, key: &str) -> NodeResult<()> {
        let content = serde_json::to_vec_pretty(&self.data)
            .map_err(|e| NodeError::storage(&self.namespace, key, e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| NodeError::storage(&self.namespace, key, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| NodeError::storage(&self.namespace, key, e))
    }
}

impl KvStore for FileKvStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get_int(&self, key: &str, default: i32) -> i32 {
        self.data.ints.get(key).copied().unwrap_or(default)
    }

    fn put_int(&mut self, key: &str, value: i32) -> NodeResult<()> {
        let previous = self.data.ints.insert(key.to_string(), value);
        if let Err(e) = self.flush(key) {
            // Keep memory consistent with what is on disk
            match previous {
                Some(old) => self.data.ints.insert(key.to_string(), old),
                None => self.data.ints.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn get_ulong(&self, key: &str, default: u64) -> u64 {
        self.data.ulongs.get(key).copied().unwrap_or(default)
    }

    fn put_ulong(&mut self, key: &str, value: u64) -> NodeResult<()> {
        let previous = self.data.ulongs.insert(key.to_string(), value);
        if let Err(e) = self.flush(key) {
            match previous {
                Some(old) => self.data.ulongs.insert(key.to_string(), old),
                None => self.data.ulongs.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}
