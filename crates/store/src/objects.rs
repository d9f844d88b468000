use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use lore_object::{
    canonical_decode, canonical_encode, ContentHash, ObjectData, RecipeRegistry, Storable,
};

use crate::db::{OBJECTS, OBJECT_META, QUARANTINE, StoreDb};
use crate::error::StoreError;

/// Bookkeeping kept beside every blob: its recipe name (the reverse index
/// content-hash → type), write time, and size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub kind: String,
    pub created_ms: i64,
    pub size: u64,
}

/// Transient read failures are retried this many times before surfacing.
const READ_RETRIES: usize = 2;

/// Flat content-addressed blob store. Writes are idempotent: equal content
/// maps to one hash, and concurrent equal writes both succeed.
#[derive(Clone)]
pub struct ObjectStore {
    db: StoreDb,
    registry: Arc<RecipeRegistry>,
}

impl ObjectStore {
    pub fn new(db: StoreDb, registry: Arc<RecipeRegistry>) -> Self {
        Self { db, registry }
    }

    pub fn registry(&self) -> &Arc<RecipeRegistry> {
        &self.registry
    }

    pub(crate) fn db(&self) -> &StoreDb {
        &self.db
    }

    /// Validate, canonically encode, and persist. Returns the content hash
    /// whether or not the bytes were already present.
    pub fn put(&self, data: &ObjectData) -> Result<ContentHash, StoreError> {
        self.registry.validate(data)?;
        let tx = self.db.raw().begin_write()?;
        let hash = self.put_in_txn(&tx, data)?;
        tx.commit()?;
        Ok(hash)
    }

    /// Write-if-absent inside a caller-owned transaction. Used by the
    /// versioned layer to persist a revision and its chain atomically.
    pub(crate) fn put_in_txn(
        &self,
        tx: &WriteTransaction,
        data: &ObjectData,
    ) -> Result<ContentHash, StoreError> {
        let bytes = canonical_encode(&self.registry, data)?;
        let hash = ContentHash::of(&bytes);
        let mut objects = tx.open_table(OBJECTS)?;
        if objects.get(hash.as_bytes().as_slice())?.is_none() {
            objects.insert(hash.as_bytes().as_slice(), bytes.as_slice())?;
            let meta = ObjectMeta {
                kind: data.kind().to_string(),
                created_ms: now_ms(),
                size: bytes.len() as u64,
            };
            let meta_bytes = serde_json::to_vec(&meta)
                .map_err(|error| StoreError::Backend(error.to_string()))?;
            let mut metas = tx.open_table(OBJECT_META)?;
            metas.insert(hash.as_bytes().as_slice(), meta_bytes.as_slice())?;
        }
        Ok(hash)
    }

    pub fn get(&self, hash: &ContentHash) -> Result<ObjectData, StoreError> {
        self.try_get(hash)?
            .ok_or_else(|| StoreError::not_found(hash))
    }

    pub fn try_get(&self, hash: &ContentHash) -> Result<Option<ObjectData>, StoreError> {
        let Some(bytes) = self.read_bytes(hash)? else {
            return Ok(None);
        };
        // A mismatched digest or undecodable payload means on-disk
        // corruption; quarantine the blob for repair instead of discarding.
        if ContentHash::of(&bytes) != *hash {
            self.quarantine(hash, &bytes)?;
            return Err(StoreError::Corrupt { hash: *hash });
        }
        match canonical_decode(&self.registry, &bytes) {
            Ok(data) => Ok(Some(data)),
            Err(cause) => {
                error!(%hash, %cause, "stored object failed canonical decoding");
                self.quarantine(hash, &bytes)?;
                Err(StoreError::Corrupt { hash: *hash })
            }
        }
    }

    pub fn get_typed<T: Storable>(&self, hash: &ContentHash) -> Result<T, StoreError> {
        Ok(T::from_data(&self.get(hash)?)?)
    }

    pub fn contains(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        Ok(self.read_bytes(hash)?.is_some())
    }

    /// Reverse index lookup: the recipe name stored beside the blob.
    pub fn kind_of(&self, hash: &ContentHash) -> Result<Option<String>, StoreError> {
        Ok(self.meta_of(hash)?.map(|meta| meta.kind))
    }

    pub fn meta_of(&self, hash: &ContentHash) -> Result<Option<ObjectMeta>, StoreError> {
        let tx = self.db.raw().begin_read()?;
        let metas = tx.open_table(OBJECT_META)?;
        let Some(guard) = metas.get(hash.as_bytes().as_slice())? else {
            return Ok(None);
        };
        let meta = serde_json::from_slice(guard.value())
            .map_err(|error| StoreError::Backend(error.to_string()))?;
        Ok(Some(meta))
    }

    pub fn all_hashes(&self) -> Result<Vec<ContentHash>, StoreError> {
        let tx = self.db.raw().begin_read()?;
        let objects = tx.open_table(OBJECTS)?;
        let mut hashes = Vec::new();
        for row in objects.iter()? {
            let (key, _) = row?;
            hashes.push(hash_from_key(key.value())?);
        }
        Ok(hashes)
    }

    pub fn hashes_by_kind(&self, kind: &str) -> Result<Vec<ContentHash>, StoreError> {
        let tx = self.db.raw().begin_read()?;
        let metas = tx.open_table(OBJECT_META)?;
        let mut hashes = Vec::new();
        for row in metas.iter()? {
            let (key, value) = row?;
            let meta: ObjectMeta = serde_json::from_slice(value.value())
                .map_err(|error| StoreError::Backend(error.to_string()))?;
            if meta.kind == kind {
                hashes.push(hash_from_key(key.value())?);
            }
        }
        Ok(hashes)
    }

    /// Lazy sequence of every stored object of one type: the hash list is
    /// snapshotted, decoding happens per element as the caller advances.
    pub fn iter_by_type(
        &self,
        kind: &str,
    ) -> Result<impl Iterator<Item = Result<ObjectData, StoreError>> + '_, StoreError> {
        let hashes = self.hashes_by_kind(kind)?;
        Ok(hashes.into_iter().map(move |hash| self.get(&hash)))
    }

    /// Remove a blob. Maintenance only — never reachable from replication
    /// or the public engine surface.
    pub fn delete(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        let tx = self.db.raw().begin_write()?;
        let removed = {
            let mut objects = tx.open_table(OBJECTS)?;
            let removed = objects.remove(hash.as_bytes().as_slice())?.is_some();
            let mut metas = tx.open_table(OBJECT_META)?;
            metas.remove(hash.as_bytes().as_slice())?;
            removed
        };
        tx.commit()?;
        Ok(removed)
    }

    pub fn quarantined(&self) -> Result<Vec<ContentHash>, StoreError> {
        let tx = self.db.raw().begin_read()?;
        let quarantine = tx.open_table(QUARANTINE)?;
        let mut hashes = Vec::new();
        for row in quarantine.iter()? {
            let (key, _) = row?;
            hashes.push(hash_from_key(key.value())?);
        }
        Ok(hashes)
    }

    fn quarantine(&self, hash: &ContentHash, bytes: &[u8]) -> Result<(), StoreError> {
        let tx = self.db.raw().begin_write()?;
        {
            let mut quarantine = tx.open_table(QUARANTINE)?;
            quarantine.insert(hash.as_bytes().as_slice(), bytes)?;
            let mut objects = tx.open_table(OBJECTS)?;
            objects.remove(hash.as_bytes().as_slice())?;
        }
        tx.commit()?;
        error!(%hash, "blob moved to quarantine; repair required");
        Ok(())
    }

    fn read_bytes(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError> {
        let mut attempt = 0;
        loop {
            match self.read_bytes_once(hash) {
                Ok(result) => return Ok(result),
                Err(error) if attempt < READ_RETRIES => {
                    attempt += 1;
                    warn!(%hash, %error, attempt, "transient read failure, retrying");
                    std::thread::sleep(retry_backoff(attempt));
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn read_bytes_once(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError> {
        let tx = self.db.raw().begin_read()?;
        let objects = tx.open_table(OBJECTS)?;
        Ok(objects
            .get(hash.as_bytes().as_slice())?
            .map(|guard| guard.value().to_vec()))
    }
}

pub(crate) fn hash_from_key(key: &[u8]) -> Result<ContentHash, StoreError> {
    let bytes: [u8; 32] = key
        .try_into()
        .map_err(|_| StoreError::Backend(format!("malformed {}-byte table key", key.len())))?;
    Ok(ContentHash::from_bytes(bytes))
}

/// Current wall clock in unix milliseconds; the timestamp unit used
/// throughout the store.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn retry_backoff(attempt: usize) -> Duration {
    // Fixed base plus a cheap time-derived jitter.
    let jitter_ms = u64::from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.subsec_nanos())
            .unwrap_or(0),
    ) % 7;
    Duration::from_millis(10 * attempt as u64 + jitter_ms)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use tempfile::TempDir;

    use lore_object::{ObjectData, RecipeRegistry, Storable, Topic, Value, recipes};

    use super::ObjectStore;
    use crate::db::StoreDb;
    use crate::error::StoreError;

    fn store() -> Result<(TempDir, ObjectStore)> {
        let dir = TempDir::new()?;
        let db = StoreDb::open(dir.path().join("store.redb"))?;
        let registry = Arc::new(RecipeRegistry::with_builtins());
        Ok((dir, ObjectStore::new(db, registry)))
    }

    fn topic(id: &str) -> ObjectData {
        Topic::new(id, 1_700_000_000_000).to_data()
    }

    #[test]
    fn put_get_round_trips() -> Result<()> {
        let (_dir, store) = store()?;
        let data = topic("a<->b");
        let hash = store.put(&data)?;
        assert_eq!(store.get(&hash)?, data);
        assert_eq!(store.kind_of(&hash)?.as_deref(), Some(recipes::TOPIC));
        Ok(())
    }

    #[test]
    fn put_is_idempotent() -> Result<()> {
        let (_dir, store) = store()?;
        let data = topic("a<->b");
        let first = store.put(&data)?;
        let second = store.put(&data)?;
        assert_eq!(first, second);
        assert_eq!(store.hashes_by_kind(recipes::TOPIC)?.len(), 1);
        Ok(())
    }

    #[test]
    fn get_typed_recovers_the_entity() -> Result<()> {
        let (_dir, store) = store()?;
        let original = Topic::new("a<->b", 5);
        let hash = store.put(&original.to_data())?;
        let loaded: Topic = store.get_typed(&hash)?;
        assert_eq!(loaded, original);
        Ok(())
    }

    #[test]
    fn missing_hash_is_not_found() -> Result<()> {
        let (_dir, store) = store()?;
        let absent = lore_object::ContentHash::of(b"nothing here");
        assert!(matches!(store.get(&absent), Err(StoreError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn invalid_object_is_rejected_before_hashing() -> Result<()> {
        let (_dir, store) = store()?;
        let bad = ObjectData::new(recipes::TOPIC).with("topicId", Value::Int(7));
        assert!(matches!(
            store.put(&bad),
            Err(StoreError::Object(lore_object::ObjectError::Validation { .. }))
        ));
        Ok(())
    }

    #[test]
    fn iter_by_type_sees_only_that_type() -> Result<()> {
        let (_dir, store) = store()?;
        store.put(&topic("t1"))?;
        store.put(&topic("t2"))?;
        store.put(&lore_object::Person::new("a@x").to_data())?;
        let topics: Vec<_> = store
            .iter_by_type(recipes::TOPIC)?
            .collect::<Result<_, _>>()?;
        assert_eq!(topics.len(), 2);
        Ok(())
    }

    #[test]
    fn delete_removes_blob_and_meta() -> Result<()> {
        let (_dir, store) = store()?;
        let hash = store.put(&topic("t1"))?;
        assert!(store.delete(&hash)?);
        assert!(!store.contains(&hash)?);
        assert_eq!(store.kind_of(&hash)?, None);
        assert!(!store.delete(&hash)?);
        Ok(())
    }

    /// Overwrite a stored blob's payload in place, simulating on-disk
    /// corruption under an unchanged key.
    fn corrupt_blob(store: &ObjectStore, hash: &lore_object::ContentHash, bytes: &[u8]) -> Result<()> {
        let tx = store.db().raw().begin_write()?;
        {
            let mut objects = tx.open_table(crate::db::OBJECTS)?;
            objects.insert(hash.as_bytes().as_slice(), bytes)?;
        }
        tx.commit()?;
        Ok(())
    }

    #[test]
    fn corrupt_blobs_are_quarantined_never_discarded() -> Result<()> {
        let (_dir, store) = store()?;
        let hash = store.put(&topic("a<->b"))?;
        corrupt_blob(&store, &hash, b"garbage payload")?;

        // The digest no longer matches the key: crash-class corruption.
        assert!(matches!(
            store.get(&hash),
            Err(StoreError::Corrupt { hash: bad }) if bad == hash
        ));

        // The blob moved to the quarantine table for repair; it is gone
        // from the live store but never silently dropped.
        assert_eq!(store.quarantined()?, vec![hash]);
        assert!(!store.contains(&hash)?);

        // A later plain read keeps failing instead of resurrecting it,
        // and the quarantined copy stays put.
        assert!(matches!(store.get(&hash), Err(StoreError::NotFound(_))));
        assert_eq!(store.quarantined()?, vec![hash]);
        Ok(())
    }

    #[test]
    fn undecodable_blobs_with_matching_digest_are_quarantined() -> Result<()> {
        let (_dir, store) = store()?;
        // Bytes stored under their own digest, so only canonical decoding
        // can reject them.
        let junk = b"not a canonical object".as_slice();
        let hash = lore_object::ContentHash::of(junk);
        {
            let tx = store.db().raw().begin_write()?;
            {
                let mut objects = tx.open_table(crate::db::OBJECTS)?;
                objects.insert(hash.as_bytes().as_slice(), junk)?;
            }
            tx.commit()?;
        }

        assert!(matches!(
            store.try_get(&hash),
            Err(StoreError::Corrupt { hash: bad }) if bad == hash
        ));
        assert_eq!(store.quarantined()?, vec![hash]);
        Ok(())
    }
}
