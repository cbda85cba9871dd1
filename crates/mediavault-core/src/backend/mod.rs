//! Storage backends. Each location kind maps to one implementation of
//! [`StorageBackend`]; callers hold a [`Backend`] and never branch on kind.

pub mod local;
pub mod object_store;

use crate::error::{Error, Result};
use crate::scanner::walk::IgnoreSet;
use crate::storage::models::{Location, LocationKind};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

pub use local::LocalBackend;
pub use object_store::{
    ListPage, MemoryObjectClient, ObjectClient, ObjectMeta, ObjectStoreBackend,
};

/// One file as enumerated by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Location-relative path, `/`-separated.
    pub path: String,
    pub size: u64,
    /// Seconds since the unix epoch.
    pub mtime: i64,
}

/// A transferred file that is not yet visible at its final path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub temp_path: String,
    pub final_path: String,
}

pub type EntryIter<'a> = Box<dyn Iterator<Item = Result<FileEntry>> + Send + 'a>;

pub trait StorageBackend: Send + Sync {
    /// Lazily enumerate every file under the location. Per-entry failures are
    /// yielded as `Err` items; the iterator keeps going where it can.
    fn scan(&self) -> Result<EntryIter<'_>>;

    /// `Ok(None)` when nothing exists at `path`.
    fn stat(&self, path: &str) -> Result<Option<FileEntry>>;

    fn transfer_out(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Write `reader` to a temporary name next to `path`, stamping `mtime`.
    fn transfer_in(&self, path: &str, reader: &mut dyn Read, mtime: i64) -> Result<StagedFile>;

    /// Atomically make a staged file visible at its final path.
    fn promote(&self, staged: &StagedFile) -> Result<()>;

    /// Remove a staged file. Missing temp files are not an error.
    fn discard(&self, staged: &StagedFile) -> Result<()>;

    /// Delete a file. Deleting something already gone succeeds.
    fn delete(&self, path: &str) -> Result<()>;
}

pub enum Backend {
    Local(LocalBackend),
    ObjectStore(ObjectStoreBackend),
}

impl Backend {
    fn inner(&self) -> &dyn StorageBackend {
        match self {
            Backend::Local(b) => b,
            Backend::ObjectStore(b) => b,
        }
    }
}

impl StorageBackend for Backend {
    fn scan(&self) -> Result<EntryIter<'_>> {
        self.inner().scan()
    }

    fn stat(&self, path: &str) -> Result<Option<FileEntry>> {
        self.inner().stat(path)
    }

    fn transfer_out(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.inner().transfer_out(path)
    }

    fn transfer_in(&self, path: &str, reader: &mut dyn Read, mtime: i64) -> Result<StagedFile> {
        self.inner().transfer_in(path, reader, mtime)
    }

    fn promote(&self, staged: &StagedFile) -> Result<()> {
        self.inner().promote(staged)
    }

    fn discard(&self, staged: &StagedFile) -> Result<()> {
        self.inner().discard(staged)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.inner().delete(path)
    }
}

/// Builds backends for registered locations.
///
/// Local and network locations are filesystem paths. Object-store locations
/// need a client registered under the location's name; the concrete cloud
/// SDK lives outside this crate.
#[derive(Clone)]
pub struct Backends {
    ignore: IgnoreSet,
    remote_timeout: Duration,
    clients: HashMap<String, Arc<dyn ObjectClient>>,
}

impl Default for Backends {
    fn default() -> Self {
        Self::new(IgnoreSet::default(), Duration::from_secs(30))
    }
}

impl Backends {
    pub fn new(ignore: IgnoreSet, remote_timeout: Duration) -> Self {
        Self {
            ignore,
            remote_timeout,
            clients: HashMap::new(),
        }
    }

    pub fn with_client(mut self, location: &str, client: Arc<dyn ObjectClient>) -> Self {
        self.clients.insert(location.to_string(), client);
        self
    }

    pub fn ignore(&self) -> &IgnoreSet {
        &self.ignore
    }

    pub fn for_location(&self, location: &Location) -> Result<Backend> {
        match location.kind {
            LocationKind::Local | LocationKind::Network => Ok(Backend::Local(LocalBackend::new(
                &location.root,
                self.ignore.clone(),
            ))),
            LocationKind::ObjectStore => {
                let client = self.clients.get(&location.name).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "no object-store client configured for location '{}'",
                        location.name
                    ))
                })?;
                Ok(Backend::ObjectStore(ObjectStoreBackend::new(
                    &location.root,
                    Arc::clone(client),
                    self.remote_timeout,
                )))
            }
        }
    }
}
