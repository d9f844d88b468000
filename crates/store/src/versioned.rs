use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use lore_object::{
    content_hash, id_hash, ContentHash, IdHash, ObjectData, PREVIOUS_VERSION, Storable, Value,
};

use crate::db::VERSIONS;
use crate::error::StoreError;
use crate::objects::{hash_from_key, now_ms, ObjectStore};

/// One link in a version chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub content: ContentHash,
    pub timestamp_ms: i64,
}

/// Outcome of a versioned write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PutVersioned {
    pub id: IdHash,
    pub version: ContentHash,
    pub unchanged: bool,
}

/// Bounded CAS retry, per the store's write policy. Nothing else in the
/// engine retries silently.
const CAS_RETRIES: usize = 3;

/// Maps each logical object (id hash) to its append-only chain of
/// revisions. Chain advances are serialized per id by an in-process lock;
/// the commit transaction re-checks the observed head so a lost race
/// surfaces as [`StoreError::StaleWrite`] instead of a fork.
#[derive(Clone)]
pub struct VersionedStore {
    objects: ObjectStore,
    locks: Arc<Mutex<HashMap<IdHash, Arc<Mutex<()>>>>>,
}

impl VersionedStore {
    pub fn new(objects: ObjectStore) -> Self {
        Self {
            objects,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// Versioned write with the bounded retry policy applied.
    pub fn put_versioned(&self, data: &ObjectData) -> Result<PutVersioned, StoreError> {
        let mut attempt = 0;
        loop {
            match self.put_versioned_once(data) {
                Err(StoreError::StaleWrite { id }) if attempt + 1 < CAS_RETRIES => {
                    attempt += 1;
                    warn!(%id, attempt, "version chain advanced under us, retrying");
                }
                other => return other,
            }
        }
    }

    /// Single CAS attempt; callers that must recompute their write on a
    /// lost race (e.g. channel appends) run their own retry loop.
    pub fn put_versioned_once(&self, data: &ObjectData) -> Result<PutVersioned, StoreError> {
        let registry = self.objects.registry();
        registry.validate(data)?;
        let id = id_hash(registry, data)?;

        let chain_lock = self.chain_lock(id);
        let _guard = chain_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let chain = self.chain(&id)?;
        let current = chain.last().map(|record| record.content);

        // The chain link lives in the object itself: previousVersion points
        // at the revision being superseded, absent for v1.
        let mut candidate = data.clone();
        if registry.get(candidate.kind())?.is_versioned() {
            match current {
                Some(previous) => candidate.set(PREVIOUS_VERSION, Value::Reference(previous)),
                None => candidate.clear_field(PREVIOUS_VERSION),
            }
        }
        let content = content_hash(registry, &candidate)?;
        if current == Some(content) {
            return Ok(PutVersioned {
                id,
                version: content,
                unchanged: true,
            });
        }

        let tx = self.objects.db().raw().begin_write()?;
        {
            let mut versions = tx.open_table(VERSIONS)?;
            let mut stored: Vec<VersionRecord> = match versions.get(id.as_bytes().as_slice())? {
                Some(guard) => serde_json::from_slice(guard.value())
                    .map_err(|error| StoreError::Backend(error.to_string()))?,
                None => Vec::new(),
            };
            if stored.last().map(|record| record.content) != current {
                return Err(StoreError::StaleWrite { id });
            }
            self.objects.put_in_txn(&tx, &candidate)?;
            stored.push(VersionRecord {
                content,
                timestamp_ms: now_ms(),
            });
            let bytes = serde_json::to_vec(&stored)
                .map_err(|error| StoreError::Backend(error.to_string()))?;
            versions.insert(id.as_bytes().as_slice(), bytes.as_slice())?;
        }
        tx.commit()?;

        debug!(%id, version = %content, "version chain advanced");
        Ok(PutVersioned {
            id,
            version: content,
            unchanged: false,
        })
    }

    pub fn put_typed<T: Storable>(&self, entity: &T) -> Result<PutVersioned, StoreError> {
        self.put_versioned(&entity.to_data())
    }

    /// The chain for an id, oldest first. Empty when the id is unknown.
    pub fn chain(&self, id: &IdHash) -> Result<Vec<VersionRecord>, StoreError> {
        let tx = self.objects.db().raw().begin_read()?;
        let versions = tx.open_table(VERSIONS)?;
        match versions.get(id.as_bytes().as_slice())? {
            Some(guard) => serde_json::from_slice(guard.value())
                .map_err(|error| StoreError::Backend(error.to_string())),
            None => Ok(Vec::new()),
        }
    }

    pub fn current_hash(&self, id: &IdHash) -> Result<Option<ContentHash>, StoreError> {
        Ok(self.chain(id)?.last().map(|record| record.content))
    }

    pub fn get_current(&self, id: &IdHash) -> Result<ObjectData, StoreError> {
        let hash = self
            .current_hash(id)?
            .ok_or_else(|| StoreError::not_found(id))?;
        self.objects.get(&hash)
    }

    pub fn get_current_typed<T: Storable>(&self, id: &IdHash) -> Result<T, StoreError> {
        Ok(T::from_data(&self.get_current(id)?)?)
    }

    pub fn try_get_current(&self, id: &IdHash) -> Result<Option<ObjectData>, StoreError> {
        match self.current_hash(id)? {
            Some(hash) => Ok(Some(self.objects.get(&hash)?)),
            None => Ok(None),
        }
    }

    pub fn try_get_current_typed<T: Storable>(
        &self,
        id: &IdHash,
    ) -> Result<Option<T>, StoreError> {
        Ok(self
            .try_get_current(id)?
            .as_ref()
            .map(T::from_data)
            .transpose()?)
    }

    /// Fetch revision `n` (1-based, v1 is the oldest).
    pub fn get_version(&self, id: &IdHash, n: usize) -> Result<ObjectData, StoreError> {
        let chain = self.chain(id)?;
        let record = n
            .checked_sub(1)
            .and_then(|index| chain.get(index))
            .ok_or_else(|| StoreError::not_found(format!("{id} v{n}")))?;
        self.objects.get(&record.content)
    }

    /// Every revision, oldest first; the last element is the current one.
    pub fn history(&self, id: &IdHash) -> Result<Vec<ObjectData>, StoreError> {
        self.chain(id)?
            .iter()
            .map(|record| self.objects.get(&record.content))
            .collect()
    }

    /// Current revision of every chain whose object kind matches.
    pub fn iter_current(&self, kind: &str) -> Result<Vec<(IdHash, ObjectData)>, StoreError> {
        let chains: Vec<(IdHash, ContentHash)> = {
            let tx = self.objects.db().raw().begin_read()?;
            let versions = tx.open_table(VERSIONS)?;
            let mut out = Vec::new();
            for row in versions.iter()? {
                let (key, value) = row?;
                let records: Vec<VersionRecord> = serde_json::from_slice(value.value())
                    .map_err(|error| StoreError::Backend(error.to_string()))?;
                if let Some(last) = records.last() {
                    let id = IdHash::from_bytes(*hash_from_key(key.value())?.as_bytes());
                    out.push((id, last.content));
                }
            }
            out
        };
        let mut result = Vec::new();
        for (id, content) in chains {
            if self.objects.kind_of(&content)?.as_deref() == Some(kind) {
                result.push((id, self.objects.get(&content)?));
            }
        }
        Ok(result)
    }

    pub fn iter_current_typed<T: Storable>(&self) -> Result<Vec<(IdHash, T)>, StoreError> {
        self.iter_current(T::RECIPE)?
            .into_iter()
            .map(|(id, data)| Ok((id, T::from_data(&data)?)))
            .collect()
    }

    /// Drop the named revisions from a chain and delete their blobs. The
    /// head is never removed; requests naming it are ignored. Returns the
    /// hashes actually removed.
    pub fn remove_versions(
        &self,
        id: &IdHash,
        doomed: &[ContentHash],
    ) -> Result<Vec<ContentHash>, StoreError> {
        let chain_lock = self.chain_lock(*id);
        let _guard = chain_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let chain = self.chain(id)?;
        let Some(head) = chain.last().map(|record| record.content) else {
            return Ok(Vec::new());
        };
        let removable: Vec<ContentHash> = chain
            .iter()
            .map(|record| record.content)
            .filter(|content| *content != head && doomed.contains(content))
            .collect();
        if removable.is_empty() {
            return Ok(Vec::new());
        }

        let kept: Vec<VersionRecord> = chain
            .into_iter()
            .filter(|record| !removable.contains(&record.content))
            .collect();
        let tx = self.objects.db().raw().begin_write()?;
        {
            let mut versions = tx.open_table(VERSIONS)?;
            let bytes = serde_json::to_vec(&kept)
                .map_err(|error| StoreError::Backend(error.to_string()))?;
            versions.insert(id.as_bytes().as_slice(), bytes.as_slice())?;
        }
        tx.commit()?;
        for content in &removable {
            self.objects.delete(content)?;
        }
        Ok(removable)
    }

    /// Remove an entire chain and every blob it references. Maintenance
    /// only; nothing on the public engine surface reaches this.
    pub fn drop_chain(&self, id: &IdHash) -> Result<usize, StoreError> {
        let chain_lock = self.chain_lock(*id);
        let _guard = chain_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let chain = self.chain(id)?;
        if chain.is_empty() {
            return Ok(0);
        }
        let tx = self.objects.db().raw().begin_write()?;
        {
            let mut versions = tx.open_table(VERSIONS)?;
            versions.remove(id.as_bytes().as_slice())?;
        }
        tx.commit()?;
        for record in &chain {
            self.objects.delete(&record.content)?;
        }
        Ok(chain.len())
    }

    /// Average chain length across all logical objects.
    pub fn average_versions(&self) -> Result<f64, StoreError> {
        let tx = self.objects.db().raw().begin_read()?;
        let versions = tx.open_table(VERSIONS)?;
        let mut chains = 0usize;
        let mut records = 0usize;
        for row in versions.iter()? {
            let (_, value) = row?;
            let parsed: Vec<VersionRecord> = serde_json::from_slice(value.value())
                .map_err(|error| StoreError::Backend(error.to_string()))?;
            chains += 1;
            records += parsed.len();
        }
        if chains == 0 {
            Ok(0.0)
        } else {
            Ok(records as f64 / chains as f64)
        }
    }

    /// Every content hash referenced by any version chain.
    pub(crate) fn chained_hashes(&self) -> Result<Vec<ContentHash>, StoreError> {
        let tx = self.objects.db().raw().begin_read()?;
        let versions = tx.open_table(VERSIONS)?;
        let mut out = Vec::new();
        for row in versions.iter()? {
            let (_, value) = row?;
            let parsed: Vec<VersionRecord> = serde_json::from_slice(value.value())
                .map_err(|error| StoreError::Backend(error.to_string()))?;
            out.extend(parsed.into_iter().map(|record| record.content));
        }
        Ok(out)
    }

    fn chain_lock(&self, id: IdHash) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id).or_default().clone()
    }
}
