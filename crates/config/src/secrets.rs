//! Recipe-validated per-user settings with sealed secrets.
//!
//! Sensitive fields pass through a host-provided [`SecretSealer`] before
//! they reach hashing or disk — the stored object carries ciphertext
//! only, and reads expose presence flags, never plaintext. Without a
//! sealer every secret operation fails closed.

use std::sync::Arc;

use tracing::info;

use lore_object::{id_hash, IdHash, ObjectData, RecipeRegistry, UserSettings, recipes, text};
use lore_store::{now_ms, VersionedStore};

use crate::ConfigError;

/// Platform key-wrapping seam. The host supplies an implementation backed
/// by its OS keychain or equivalent.
pub trait SecretSealer: Send + Sync {
    fn seal(&self, plaintext: &str) -> Vec<u8>;
    fn unseal(&self, ciphertext: &[u8]) -> Result<String, String>;
}

/// Typed read view; secrets appear only as presence flags.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsView {
    pub user_email: String,
    pub llm_endpoint: Option<String>,
    pub llm_model: Option<String>,
    pub has_api_token: bool,
    pub updated: i64,
}

#[derive(Clone)]
pub struct SecretStore {
    store: VersionedStore,
    sealer: Option<Arc<dyn SecretSealer>>,
}

impl SecretStore {
    pub fn new(store: VersionedStore, sealer: Option<Arc<dyn SecretSealer>>) -> Self {
        Self { store, sealer }
    }

    fn settings_id(
        registry: &RecipeRegistry,
        user_email: &str,
    ) -> Result<IdHash, ConfigError> {
        Ok(id_hash(
            registry,
            &ObjectData::new(recipes::USER_SETTINGS).with("userEmail", text(user_email)),
        )?)
    }

    fn load(&self, user_email: &str) -> Result<UserSettings, ConfigError> {
        let id = Self::settings_id(self.store.objects().registry(), user_email)?;
        Ok(self
            .store
            .try_get_current_typed::<UserSettings>(&id)?
            .unwrap_or_else(|| UserSettings::new(user_email, 0)))
    }

    pub fn get(&self, user_email: &str) -> Result<SettingsView, ConfigError> {
        let settings = self.load(user_email)?;
        Ok(SettingsView {
            user_email: settings.user_email,
            llm_endpoint: settings.llm_endpoint,
            llm_model: settings.llm_model,
            has_api_token: settings.api_token_cipher.is_some(),
            updated: settings.updated,
        })
    }

    pub fn set_llm(
        &self,
        user_email: &str,
        endpoint: Option<String>,
        model: Option<String>,
    ) -> Result<SettingsView, ConfigError> {
        let mut settings = self.load(user_email)?;
        settings.llm_endpoint = endpoint;
        settings.llm_model = model;
        settings.updated = now_ms();
        self.store.put_typed(&settings)?;
        self.get(user_email)
    }

    /// Seal and store an API token. Fails closed without a sealing key.
    pub fn set_api_token(
        &self,
        user_email: &str,
        plaintext: &str,
    ) -> Result<SettingsView, ConfigError> {
        let sealer = self.sealer.as_ref().ok_or(ConfigError::SecretUnavailable)?;
        let ciphertext = sealer.seal(plaintext);
        let mut settings = self.load(user_email)?;
        settings.api_token_cipher = Some(encode_hex(&ciphertext));
        settings.updated = now_ms();
        self.store.put_typed(&settings)?;
        info!(user = user_email, "api token sealed and stored");
        self.get(user_email)
    }

    pub fn clear_api_token(&self, user_email: &str) -> Result<SettingsView, ConfigError> {
        let mut settings = self.load(user_email)?;
        settings.api_token_cipher = None;
        settings.updated = now_ms();
        self.store.put_typed(&settings)?;
        self.get(user_email)
    }

    /// On-demand plaintext access; the only path that ever reveals the
    /// secret.
    pub fn unseal_api_token(&self, user_email: &str) -> Result<Option<String>, ConfigError> {
        let sealer = self.sealer.as_ref().ok_or(ConfigError::SecretUnavailable)?;
        let settings = self.load(user_email)?;
        let Some(cipher_hex) = settings.api_token_cipher else {
            return Ok(None);
        };
        let ciphertext = decode_hex(&cipher_hex)?;
        sealer
            .unseal(&ciphertext)
            .map(Some)
            .map_err(|_| ConfigError::SecretUnavailable)
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn decode_hex(input: &str) -> Result<Vec<u8>, ConfigError> {
    if input.len() % 2 != 0 {
        return Err(ConfigError::SecretUnavailable);
    }
    (0..input.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&input[i..i + 2], 16).map_err(|_| ConfigError::SecretUnavailable)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use tempfile::TempDir;

    use lore_object::RecipeRegistry;
    use lore_store::{ObjectStore, StoreDb, VersionedStore};

    use super::{SecretSealer, SecretStore};
    use crate::ConfigError;

    /// Reversible toy sealer; real hosts wrap an OS keychain.
    struct XorSealer(u8);

    impl SecretSealer for XorSealer {
        fn seal(&self, plaintext: &str) -> Vec<u8> {
            plaintext.bytes().map(|b| b ^ self.0).collect()
        }

        fn unseal(&self, ciphertext: &[u8]) -> Result<String, String> {
            String::from_utf8(ciphertext.iter().map(|b| b ^ self.0).collect())
                .map_err(|e| e.to_string())
        }
    }

    fn store() -> Result<(TempDir, VersionedStore)> {
        let dir = TempDir::new()?;
        let db = StoreDb::open(dir.path().join("store.redb"))?;
        let registry = Arc::new(RecipeRegistry::with_builtins());
        Ok((dir, VersionedStore::new(ObjectStore::new(db, registry))))
    }

    #[test]
    fn token_round_trips_through_sealing() -> Result<()> {
        let (_dir, versioned) = store()?;
        let secrets = SecretStore::new(versioned, Some(Arc::new(XorSealer(0x5a))));

        let view = secrets.set_api_token("me@x", "sk-secret-token")?;
        assert!(view.has_api_token);
        assert_eq!(
            secrets.unseal_api_token("me@x")?,
            Some("sk-secret-token".to_string())
        );
        Ok(())
    }

    #[test]
    fn stored_object_never_carries_plaintext() -> Result<()> {
        let (_dir, versioned) = store()?;
        let secrets = SecretStore::new(versioned.clone(), Some(Arc::new(XorSealer(0x5a))));
        secrets.set_api_token("me@x", "hunter2")?;

        let stored = versioned.iter_current_typed::<lore_object::UserSettings>()?;
        let cipher = stored[0].1.api_token_cipher.as_deref().unwrap();
        assert!(!cipher.contains("hunter2"));
        Ok(())
    }

    #[test]
    fn missing_sealer_fails_closed() -> Result<()> {
        let (_dir, versioned) = store()?;
        let secrets = SecretStore::new(versioned, None);
        assert!(matches!(
            secrets.set_api_token("me@x", "nope"),
            Err(ConfigError::SecretUnavailable)
        ));
        assert!(matches!(
            secrets.unseal_api_token("me@x"),
            Err(ConfigError::SecretUnavailable)
        ));
        // Non-secret reads still work.
        assert!(!secrets.get("me@x")?.has_api_token);
        Ok(())
    }

    #[test]
    fn clearing_removes_the_flag() -> Result<()> {
        let (_dir, versioned) = store()?;
        let secrets = SecretStore::new(versioned, Some(Arc::new(XorSealer(1))));
        secrets.set_api_token("me@x", "tok")?;
        let view = secrets.clear_api_token("me@x")?;
        assert!(!view.has_api_token);
        assert_eq!(secrets.unseal_api_token("me@x")?, None);
        Ok(())
    }
}
