use bytes::Bytes;
use std::time::SystemTime;

// The filesystem Backend is the reference implementation, and defines the
// durable on-disk format.
mod filesystem;
pub use filesystem::Filesystem;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no value for key")]
    NotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Value is one version of a stored entry. Concurrent writers may leave
/// several versions of a key; readers reconcile them through a MergePolicy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub data: Bytes,
    /// Caller-supplied type string, stored alongside the payload.
    pub kind: String,
    /// Lifetime in seconds, counted from `creation`. Zero means never
    /// expire.
    pub expiration: u32,
    /// Wall-clock time of the set.
    pub creation: SystemTime,
}

impl Value {
    pub fn new(data: impl Into<Bytes>, kind: impl Into<String>, expiration: u32) -> Self {
        Self {
            data: data.into(),
            kind: kind.into(),
            expiration,
            creation: SystemTime::now(),
        }
    }
}

/// Backend is a pluggable store of raw key → versions mappings. Backends do
/// not reconcile concurrent writers; `get` surfaces every live version and
/// the Store applies a MergePolicy on top.
pub trait Backend: Send + Sync {
    fn connect(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Every live (non-expired) version of the key. A key with no versions
    /// at all is `Error::NotFound`.
    fn get(&self, key: &str) -> Result<Vec<Value>, Error>;

    /// Write one new version. Merge policies are never consulted on write;
    /// concurrent writers coexist and are reconciled on read.
    fn set(&self, key: &str, value: &Value) -> Result<(), Error>;

    fn remove(&self, key: &str) -> Result<(), Error>;
}

/// MergePolicy reconciles the concurrent versions of a key into at most one
/// value.
pub trait MergePolicy: Send + Sync {
    fn merge(&self, versions: Vec<Value>) -> Option<Value>;
}

/// First keeps the first version the backend produced. This is the default
/// policy; it promises no particular winner under concurrency, only that no
/// blending occurs.
#[derive(Debug, Clone, Copy, Default)]
pub struct First;

impl MergePolicy for First {
    fn merge(&self, mut versions: Vec<Value>) -> Option<Value> {
        if versions.is_empty() {
            None
        } else {
            Some(versions.remove(0))
        }
    }
}

/// Newest keeps the version with the greatest creation timestamp, making a
/// strictly ordered single writer read its own last write.
#[derive(Debug, Clone, Copy, Default)]
pub struct Newest;

impl MergePolicy for Newest {
    fn merge(&self, versions: Vec<Value>) -> Option<Value> {
        versions.into_iter().max_by_key(|v| v.creation)
    }
}

/// Store is the engine-facing front-end: a Backend plus the MergePolicy
/// applied to every read.
pub struct Store {
    backend: Box<dyn Backend>,
    merge: Box<dyn MergePolicy>,
}

impl Store {
    /// Build a Store with the default `First` merge policy.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::with_merge_policy(backend, First)
    }

    pub fn with_merge_policy(
        backend: impl Backend + 'static,
        merge: impl MergePolicy + 'static,
    ) -> Self {
        Self {
            backend: Box::new(backend),
            merge: Box::new(merge),
        }
    }

    pub fn connect(&mut self) -> Result<(), Error> {
        self.backend.connect()
    }

    pub fn disconnect(&mut self) -> Result<(), Error> {
        self.backend.disconnect()
    }

    /// Read the key's versions and reconcile them to one value.
    pub fn get(&self, key: &str) -> Result<Value, Error> {
        let versions = self.backend.get(key)?;
        self.merge.merge(versions).ok_or(Error::NotFound)
    }

    pub fn set(&self, key: &str, value: &Value) -> Result<(), Error> {
        self.backend.set(key, value)
    }

    pub fn remove(&self, key: &str) -> Result<(), Error> {
        self.backend.remove(key)
    }
}
