//! Per-user proposal configuration, stored as a versioned object.

use lore_object::{
    id_hash, ContentHash, IdHash, ObjectData, ObjectError, ProposalConfig, RecipeRegistry,
    recipes, text,
};
use lore_store::{now_ms, StoreError, VersionedStore};

/// Sparse update applied over the stored (or default) configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialProposalConfig {
    pub match_weight: Option<f64>,
    pub recency_weight: Option<f64>,
    pub recency_window_days: Option<i64>,
    pub min_jaccard: Option<f64>,
    pub max_proposals: Option<i64>,
}

pub fn config_id(registry: &RecipeRegistry, user_email: &str) -> Result<IdHash, ObjectError> {
    id_hash(
        registry,
        &ObjectData::new(recipes::PROPOSAL_CONFIG).with("userEmail", text(user_email)),
    )
}

/// The stored configuration, or synthesized defaults when absent. The
/// boolean reports which one the caller got.
pub fn load_config(
    store: &VersionedStore,
    user_email: &str,
) -> Result<(ProposalConfig, bool), StoreError> {
    let id = config_id(store.objects().registry(), user_email)?;
    match store.try_get_current_typed::<ProposalConfig>(&id)? {
        Some(config) => Ok((config, false)),
        None => Ok((ProposalConfig::defaults_for(user_email), true)),
    }
}

/// Merge a sparse update into the effective configuration, validate, and
/// persist a new version. Returns the stored config and its version hash.
pub fn update_config(
    store: &VersionedStore,
    user_email: &str,
    partial: &PartialProposalConfig,
) -> Result<(ProposalConfig, ContentHash), StoreError> {
    let (mut config, _) = load_config(store, user_email)?;
    if let Some(value) = partial.match_weight {
        config.match_weight = value;
    }
    if let Some(value) = partial.recency_weight {
        config.recency_weight = value;
    }
    if let Some(value) = partial.recency_window_days {
        config.recency_window_days = value;
    }
    if let Some(value) = partial.min_jaccard {
        config.min_jaccard = value;
    }
    if let Some(value) = partial.max_proposals {
        config.max_proposals = value;
    }
    validate(&config)?;
    config.updated = now_ms();
    let put = store.put_typed(&config)?;
    Ok((config, put.version))
}

fn validate(config: &ProposalConfig) -> Result<(), ObjectError> {
    if config.match_weight < 0.0 || config.recency_weight < 0.0 {
        return Err(ObjectError::validation(
            "matchWeight",
            "weights must be non-negative",
        ));
    }
    if config.match_weight + config.recency_weight <= 0.0 {
        return Err(ObjectError::validation(
            "matchWeight",
            "at least one weight must be positive",
        ));
    }
    if !(0.0..=1.0).contains(&config.min_jaccard) {
        return Err(ObjectError::validation(
            "minJaccard",
            "must lie within [0, 1]",
        ));
    }
    if config.recency_window_days < 1 {
        return Err(ObjectError::validation(
            "recencyWindowDays",
            "window must span at least one day",
        ));
    }
    if config.max_proposals < 0 {
        return Err(ObjectError::validation(
            "maxProposals",
            "cannot be negative",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use tempfile::TempDir;

    use lore_object::RecipeRegistry;
    use lore_store::{ObjectStore, StoreDb, VersionedStore};

    use super::{load_config, update_config, PartialProposalConfig};

    fn store() -> Result<(TempDir, VersionedStore)> {
        let dir = TempDir::new()?;
        let db = StoreDb::open(dir.path().join("store.redb"))?;
        let registry = Arc::new(RecipeRegistry::with_builtins());
        Ok((dir, VersionedStore::new(ObjectStore::new(db, registry))))
    }

    #[test]
    fn defaults_are_synthesized_until_first_write() -> Result<()> {
        let (_dir, store) = store()?;
        let (config, is_default) = load_config(&store, "a@x")?;
        assert!(is_default);
        assert!((config.match_weight - 0.7).abs() < 1e-9);
        assert!((config.recency_weight - 0.3).abs() < 1e-9);
        assert_eq!(config.recency_window_days, 30);
        assert!((config.min_jaccard - 0.2).abs() < 1e-9);
        assert_eq!(config.max_proposals, 10);
        Ok(())
    }

    #[test]
    fn partial_updates_version_the_config() -> Result<()> {
        let (_dir, store) = store()?;
        let partial = PartialProposalConfig {
            min_jaccard: Some(0.9),
            ..Default::default()
        };
        update_config(&store, "a@x", &partial)?;

        let (config, is_default) = load_config(&store, "a@x")?;
        assert!(!is_default);
        assert!((config.min_jaccard - 0.9).abs() < 1e-9);
        // Untouched fields keep their defaults.
        assert!((config.match_weight - 0.7).abs() < 1e-9);

        update_config(
            &store,
            "a@x",
            &PartialProposalConfig {
                max_proposals: Some(3),
                ..Default::default()
            },
        )?;
        let (config, _) = load_config(&store, "a@x")?;
        assert_eq!(config.max_proposals, 3);
        assert!((config.min_jaccard - 0.9).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() -> Result<()> {
        let (_dir, store) = store()?;
        for partial in [
            PartialProposalConfig {
                min_jaccard: Some(1.5),
                ..Default::default()
            },
            PartialProposalConfig {
                match_weight: Some(-0.1),
                ..Default::default()
            },
            PartialProposalConfig {
                recency_window_days: Some(0),
                ..Default::default()
            },
            PartialProposalConfig {
                max_proposals: Some(-1),
                ..Default::default()
            },
        ] {
            assert!(update_config(&store, "a@x", &partial).is_err());
        }
        Ok(())
    }

    #[test]
    fn configs_are_scoped_per_user() -> Result<()> {
        let (_dir, store) = store()?;
        update_config(
            &store,
            "a@x",
            &PartialProposalConfig {
                max_proposals: Some(1),
                ..Default::default()
            },
        )?;
        let (other, is_default) = load_config(&store, "b@x")?;
        assert!(is_default);
        assert_eq!(other.max_proposals, 10);
        Ok(())
    }
}
