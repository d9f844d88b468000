use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, TableDefinition};
use tracing::info;

use crate::error::StoreError;

/// Canonical object bytes: content hash → encoded object.
pub(crate) const OBJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");
/// Reverse index and bookkeeping: content hash → JSON [`ObjectMeta`].
pub(crate) const OBJECT_META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("object_meta");
/// Version chains: id hash → JSON list of version records.
pub(crate) const VERSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("versions");
/// Corrupt blobs awaiting repair: content hash → original bytes.
pub(crate) const QUARANTINE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("quarantine");

/// Handle to the single database file backing all store tables.
#[derive(Clone)]
pub struct StoreDb {
    db: Arc<Database>,
    path: PathBuf,
}

impl StoreDb {
    /// Open or create the database at `path` and make sure all tables
    /// exist, so later read transactions never hit a missing table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| StoreError::Backend(error.to_string()))?;
        }
        let db = Database::create(&path)?;
        {
            let tx = db.begin_write()?;
            tx.open_table(OBJECTS)?;
            tx.open_table(OBJECT_META)?;
            tx.open_table(VERSIONS)?;
            tx.open_table(QUARANTINE)?;
            tx.commit()?;
        }
        info!(path = %path.display(), "object store opened");
        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn raw(&self) -> &Database {
        &self.db
    }
}
