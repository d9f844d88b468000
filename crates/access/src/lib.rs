//! Access and visibility: per-object allow-sets consulted by the
//! replication filter.
//!
//! A grant names persons and groups allowed to see one logical object.
//! `ADD` grants accumulate; a `REPLACE` grant supersedes everything
//! written before it (later `ADD`s extend it again). The engine also
//! enumerates an object's transitive dependency closure so writers can
//! grant the whole graph they expose — a dependency missing from the
//! store surfaces as an unresolved reference, reported, never retried.

use std::collections::{BTreeSet, VecDeque};

use thiserror::Error;
use tracing::info;

use lore_object::{
    id_hash, AccessGrant, ContentHash, GrantMode, Group, IdHash, ObjectData, ObjectError,
    Value, recipes, text,
};
use lore_store::{PutVersioned, StoreError, VersionedStore};

#[derive(Error, Debug)]
pub enum AccessError {
    /// A referenced object is absent from the local store.
    #[error("unresolved reference {hash}")]
    UnresolvedReference { hash: ContentHash },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Object(#[from] ObjectError),
}

/// What a writer wants to allow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrantRequest {
    pub persons: BTreeSet<String>,
    pub groups: BTreeSet<String>,
}

#[derive(Clone)]
pub struct AccessControl {
    store: VersionedStore,
}

impl AccessControl {
    pub fn new(store: VersionedStore) -> Self {
        Self { store }
    }

    fn grant_id(&self, object_id: &IdHash, mode: GrantMode) -> Result<IdHash, ObjectError> {
        id_hash(
            self.store.objects().registry(),
            &ObjectData::new(recipes::ACCESS_GRANT)
                .with("objectId", Value::IdReference(*object_id))
                .with("mode", text(mode.as_str())),
        )
    }

    /// Record a grant for an object. `ADD` merges into the existing
    /// additive grant; `REPLACE` rewrites the replacement grant, which
    /// supersedes everything granted before it.
    pub fn grant_access(
        &self,
        object_id: &IdHash,
        request: &GrantRequest,
        mode: GrantMode,
    ) -> Result<PutVersioned, AccessError> {
        let mut grant = match mode {
            GrantMode::Add => {
                let id = self.grant_id(object_id, GrantMode::Add)?;
                self.store
                    .try_get_current_typed::<AccessGrant>(&id)?
                    .unwrap_or_else(|| AccessGrant::new(*object_id, GrantMode::Add))
            }
            GrantMode::Replace => AccessGrant::new(*object_id, GrantMode::Replace),
        };
        match mode {
            GrantMode::Add => {
                grant.persons.extend(request.persons.iter().cloned());
                grant.groups.extend(request.groups.iter().cloned());
            }
            GrantMode::Replace => {
                grant.persons = request.persons.clone();
                grant.groups = request.groups.clone();
            }
        }
        let put = self.store.put_typed(&grant)?;
        info!(object = %object_id, mode = mode.as_str(), "access grant written");
        Ok(put)
    }

    /// The allow-sets currently effective for an object: the newest
    /// `REPLACE` grant as baseline, plus any `ADD` grant written after it.
    pub fn effective_grant(
        &self,
        object_id: &IdHash,
    ) -> Result<(BTreeSet<String>, BTreeSet<String>), AccessError> {
        let add_id = self.grant_id(object_id, GrantMode::Add)?;
        let replace_id = self.grant_id(object_id, GrantMode::Replace)?;

        let replace_time = self
            .store
            .chain(&replace_id)?
            .last()
            .map(|record| record.timestamp_ms);
        let add_time = self
            .store
            .chain(&add_id)?
            .last()
            .map(|record| record.timestamp_ms);

        let mut persons = BTreeSet::new();
        let mut groups = BTreeSet::new();
        if let Some(replace) = self
            .store
            .try_get_current_typed::<AccessGrant>(&replace_id)?
        {
            persons.extend(replace.persons);
            groups.extend(replace.groups);
            // An additive grant older than the replacement was superseded.
            if add_time > replace_time {
                if let Some(add) = self.store.try_get_current_typed::<AccessGrant>(&add_id)? {
                    persons.extend(add.persons);
                    groups.extend(add.groups);
                }
            }
        } else if let Some(add) = self.store.try_get_current_typed::<AccessGrant>(&add_id)? {
            persons.extend(add.persons);
            groups.extend(add.groups);
        }
        Ok((persons, groups))
    }

    /// Whether a person may see the object, directly or through a group.
    /// Group membership is expanded here, at filter time.
    pub fn is_visible_to(&self, object_id: &IdHash, person: &str) -> Result<bool, AccessError> {
        let (persons, groups) = self.effective_grant(object_id)?;
        if persons.contains(person) {
            return Ok(true);
        }
        for group_id in groups {
            let id = id_hash(
                self.store.objects().registry(),
                &ObjectData::new(recipes::GROUP).with("groupId", text(&group_id)),
            )?;
            if let Some(group) = self.store.try_get_current_typed::<Group>(&id)? {
                if group.members.contains(person) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// The transitive dependency closure of a stored object: itself plus
    /// everything reachable through content references, with id references
    /// resolved to their current revision. Writers grant this whole set
    /// before exposing an object.
    pub fn closure(&self, root: &ContentHash) -> Result<BTreeSet<ContentHash>, AccessError> {
        let mut seen: BTreeSet<ContentHash> = BTreeSet::new();
        let mut queue: VecDeque<ContentHash> = VecDeque::from([*root]);
        while let Some(hash) = queue.pop_front() {
            if !seen.insert(hash) {
                continue;
            }
            let data = match self.store.objects().try_get(&hash)? {
                Some(data) => data,
                None => return Err(AccessError::UnresolvedReference { hash }),
            };
            let mut refs = Vec::new();
            collect_refs(&data, &mut refs);
            for reference in refs {
                match reference {
                    Ref::Content(next) => queue.push_back(next),
                    Ref::Id(id) => match self.store.current_hash(&id)? {
                        Some(next) => queue.push_back(next),
                        None => continue,
                    },
                }
            }
        }
        Ok(seen)
    }
}

enum Ref {
    Content(ContentHash),
    Id(IdHash),
}

fn collect_refs(data: &ObjectData, out: &mut Vec<Ref>) {
    for (_, value) in data.fields() {
        collect_value(value, out);
    }
}

fn collect_value(value: &Value, out: &mut Vec<Ref>) {
    match value {
        Value::Reference(hash) => out.push(Ref::Content(*hash)),
        Value::IdReference(id) => out.push(Ref::Id(*id)),
        Value::Array(elements) | Value::Set(elements) => {
            for element in elements {
                collect_value(element, out);
            }
        }
        Value::Object(nested) => collect_refs(nested, out),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use anyhow::Result;
    use tempfile::TempDir;

    use lore_object::{id_hash, GrantMode, Group, Message, RecipeRegistry, Storable};
    use lore_store::{ChannelLog, ObjectStore, StoreDb, VersionedStore};

    use super::{AccessControl, AccessError, GrantRequest};

    fn setup() -> Result<(TempDir, VersionedStore, AccessControl)> {
        let dir = TempDir::new()?;
        let db = StoreDb::open(dir.path().join("store.redb"))?;
        let registry = Arc::new(RecipeRegistry::with_builtins());
        let store = VersionedStore::new(ObjectStore::new(db, registry));
        let access = AccessControl::new(store.clone());
        Ok((dir, store, access))
    }

    fn persons(emails: &[&str]) -> GrantRequest {
        GrantRequest {
            persons: emails.iter().map(|e| e.to_string()).collect(),
            groups: BTreeSet::new(),
        }
    }

    #[test]
    fn add_grants_accumulate() -> Result<()> {
        let (_dir, _store, access) = setup()?;
        let object = lore_object::IdHash::from_bytes([1; 32]);

        access.grant_access(&object, &persons(&["alice@x"]), GrantMode::Add)?;
        access.grant_access(&object, &persons(&["bob@x"]), GrantMode::Add)?;

        assert!(access.is_visible_to(&object, "alice@x")?);
        assert!(access.is_visible_to(&object, "bob@x")?);
        assert!(!access.is_visible_to(&object, "eve@x")?);
        Ok(())
    }

    #[test]
    fn replace_supersedes_prior_grants() -> Result<()> {
        let (_dir, _store, access) = setup()?;
        let object = lore_object::IdHash::from_bytes([2; 32]);

        access.grant_access(&object, &persons(&["alice@x", "bob@x"]), GrantMode::Add)?;
        access.grant_access(&object, &persons(&["carol@x"]), GrantMode::Replace)?;

        assert!(!access.is_visible_to(&object, "alice@x")?);
        assert!(!access.is_visible_to(&object, "bob@x")?);
        assert!(access.is_visible_to(&object, "carol@x")?);

        // A later ADD extends the replacement.
        access.grant_access(&object, &persons(&["dave@x"]), GrantMode::Add)?;
        assert!(access.is_visible_to(&object, "carol@x")?);
        assert!(access.is_visible_to(&object, "dave@x")?);
        Ok(())
    }

    #[test]
    fn group_membership_grants_visibility() -> Result<()> {
        let (_dir, store, access) = setup()?;
        let object = lore_object::IdHash::from_bytes([3; 32]);

        let group = Group {
            group_id: "bakers".into(),
            members: ["alice@x".to_string(), "bob@x".to_string()].into(),
            previous_version: None,
        };
        store.put_typed(&group)?;

        let request = GrantRequest {
            persons: BTreeSet::new(),
            groups: BTreeSet::from(["bakers".to_string()]),
        };
        access.grant_access(&object, &request, GrantMode::Add)?;

        assert!(access.is_visible_to(&object, "alice@x")?);
        assert!(!access.is_visible_to(&object, "mallory@x")?);
        Ok(())
    }

    #[test]
    fn closure_walks_entries_to_their_payloads() -> Result<()> {
        let (_dir, store, access) = setup()?;
        let log = ChannelLog::new(store.clone());

        let message = Message::new(None, 7, "alice@x", "closure me");
        let data_hash = store.objects().put(&message.to_data())?;
        let entry_hash = log.append("a<->b", None, data_hash, 7)?;

        let closure = access.closure(&entry_hash)?;
        assert!(closure.contains(&entry_hash));
        assert!(closure.contains(&data_hash));
        assert_eq!(closure.len(), 2);
        Ok(())
    }

    #[test]
    fn dangling_reference_is_reported() -> Result<()> {
        let (_dir, store, access) = setup()?;
        let log = ChannelLog::new(store.clone());

        let message = Message::new(None, 7, "alice@x", "vanishing");
        let data_hash = store.objects().put(&message.to_data())?;
        let entry_hash = log.append("a<->b", None, data_hash, 7)?;
        store.objects().delete(&data_hash)?;

        let result = access.closure(&entry_hash);
        assert!(matches!(
            result,
            Err(AccessError::UnresolvedReference { hash }) if hash == data_hash
        ));
        Ok(())
    }

    #[test]
    fn closure_includes_id_reference_targets() -> Result<()> {
        let (_dir, store, access) = setup()?;

        // A keyword referencing a subject by id: the closure resolves the
        // subject's current revision.
        let subject = lore_object::Subject::new(
            "t1",
            ["pizza".to_string()].into_iter().collect(),
            1,
        );
        let put = store.put_typed(&subject)?;
        let mut keyword = lore_object::Keyword::new("pizza", 1);
        keyword.subjects.insert(put.id);
        let keyword_put = store.put_typed(&keyword)?;

        let closure = access.closure(&keyword_put.version)?;
        assert!(closure.contains(&keyword_put.version));
        assert!(closure.contains(&put.version));
        Ok(())
    }

    #[test]
    fn grant_identity_distinguishes_modes() -> Result<()> {
        let (_dir, store, access) = setup()?;
        let object = lore_object::IdHash::from_bytes([4; 32]);
        access.grant_access(&object, &persons(&["alice@x"]), GrantMode::Add)?;
        access.grant_access(&object, &persons(&["bob@x"]), GrantMode::Replace)?;

        let grants = store.iter_current_typed::<lore_object::AccessGrant>()?;
        assert_eq!(grants.len(), 2);

        let registry = store.objects().registry();
        let add = id_hash(
            registry,
            &lore_object::AccessGrant::new(object, GrantMode::Add).to_data(),
        )?;
        let replace = id_hash(
            registry,
            &lore_object::AccessGrant::new(object, GrantMode::Replace).to_data(),
        )?;
        assert_ne!(add, replace);
        Ok(())
    }
}
