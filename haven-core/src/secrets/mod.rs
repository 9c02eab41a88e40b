//! Secret provisioning.
//!
//! Each stack owns a bag of named secrets. A value is generated once,
//! sealed with the data key and stored; later calls return the stored
//! value. Only [`SecretProvisioner::rotate`] replaces a value.
//!
//! Apply uses the two-phase [`SecretProvisioner::prepare`] /
//! [`SecretProvisioner::commit`] pair so that secrets generated for an
//! apply that fails or is cancelled are never stored.

pub mod crypto;
pub mod keys;

pub use keys::{KeyFile, KeyProvider, StaticKeyProvider};

use crate::error::{HavenError, Result};
use crate::state::{StateManager, StoredSecret};
use crate::types::StackId;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Minimum length of generated passwords.
pub const MIN_PASSWORD_LENGTH: usize = 20;

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
// Characters that survive shell, YAML and connection-string quoting
const SYMBOLS: &[u8] = b"!#%+-.:=@^_~";

/// A decrypted secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub stack_id: StackId,
    pub name: String,
    pub value: String,
}

impl std::fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRecord")
            .field("stack_id", &self.stack_id)
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Secrets resolved for one apply: stored values plus sealed values that
/// are not yet stored.
pub struct SecretBundle {
    stack_id: StackId,
    values: BTreeMap<String, String>,
    pending: Vec<StoredSecret>,
}

impl SecretBundle {
    /// Plaintext values by name, for the provisioner declaration.
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Names generated by this bundle that are not yet stored.
    pub fn pending_names(&self) -> Vec<&str> {
        self.pending.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn stack_id(&self) -> &StackId {
        &self.stack_id
    }
}

/// Generate a password of at least [`MIN_PASSWORD_LENGTH`] characters
/// containing upper case, lower case, digits and symbols.
pub fn generate_password(length: usize) -> String {
    let length = length.max(MIN_PASSWORD_LENGTH);
    let mut rng = OsRng;
    let all: Vec<u8> = [UPPER, LOWER, DIGITS, SYMBOLS].concat();

    let mut chars: Vec<u8> = [UPPER, LOWER, DIGITS, SYMBOLS]
        .iter()
        .filter_map(|class| class.choose(&mut rng).copied())
        .collect();
    while chars.len() < length {
        if let Some(c) = all.choose(&mut rng) {
            chars.push(*c);
        }
    }
    chars.shuffle(&mut rng);

    chars.into_iter().map(char::from).collect()
}

/// Default generator used by apply.
pub fn default_generator() -> String {
    generate_password(MIN_PASSWORD_LENGTH)
}

/// Generates, stores and returns per-stack secrets.
#[derive(Clone)]
pub struct SecretProvisioner {
    state: StateManager,
    keys: Arc<dyn KeyProvider>,
}

impl SecretProvisioner {
    pub fn new(state: StateManager, keys: Arc<dyn KeyProvider>) -> Self {
        Self { state, keys }
    }

    /// Return the stored secret, or generate, store and return a new one.
    ///
    /// The value is durably stored before this returns.
    #[instrument(skip(self, generator), fields(stack_id = %stack_id))]
    pub async fn get_or_create(
        &self,
        stack_id: &StackId,
        name: &str,
        generator: impl Fn() -> String,
    ) -> Result<SecretRecord> {
        let key = self.keys.data_key().await?;

        if let Some(stored) = self.state.get_secret(stack_id, name).await? {
            return Ok(self.record(stack_id, name, crypto::open(&key, &stored)?));
        }

        let value = generator();
        let sealed = crypto::seal(&key, name, &value)?;
        let written = self.state.insert_secrets(stack_id, &[sealed]).await?;

        if written == 0 {
            // Lost a race with another writer; theirs is authoritative
            debug!(name, "Secret created concurrently, using stored value");
            let stored = self.state.get_secret(stack_id, name).await?.ok_or_else(|| {
                HavenError::Internal(format!("secret '{}' vanished after insert", name))
            })?;
            return Ok(self.record(stack_id, name, crypto::open(&key, &stored)?));
        }

        metrics::counter!("haven_secrets_created_total").increment(1);
        info!(name, "Created secret");
        Ok(self.record(stack_id, name, value))
    }

    /// Generate and store a new value, replacing any existing one.
    #[instrument(skip(self, generator), fields(stack_id = %stack_id))]
    pub async fn rotate(
        &self,
        stack_id: &StackId,
        name: &str,
        generator: impl Fn() -> String,
    ) -> Result<SecretRecord> {
        let key = self.keys.data_key().await?;
        let value = generator();
        let sealed = crypto::seal(&key, name, &value)?;
        self.state.replace_secret(stack_id, &sealed).await?;

        info!(name, "Rotated secret");
        Ok(self.record(stack_id, name, value))
    }

    /// Resolve every named secret for an apply without storing new ones.
    #[instrument(skip(self, names, generator), fields(stack_id = %stack_id))]
    pub async fn prepare(
        &self,
        stack_id: &StackId,
        names: &[&str],
        generator: impl Fn() -> String,
    ) -> Result<SecretBundle> {
        let key = self.keys.data_key().await?;
        let mut values = BTreeMap::new();
        let mut pending = Vec::new();

        for name in names {
            match self.state.get_secret(stack_id, name).await? {
                Some(stored) => {
                    values.insert(name.to_string(), crypto::open(&key, &stored)?);
                }
                None => {
                    let value = generator();
                    pending.push(crypto::seal(&key, name, &value)?);
                    values.insert(name.to_string(), value);
                }
            }
        }

        debug!(existing = values.len() - pending.len(), pending = pending.len(), "Prepared secrets");
        Ok(SecretBundle { stack_id: stack_id.clone(), values, pending })
    }

    /// Store the values a bundle generated. Returns how many were written.
    #[instrument(skip(self, bundle), fields(stack_id = %bundle.stack_id))]
    pub async fn commit(&self, bundle: &SecretBundle) -> Result<u64> {
        if bundle.pending.is_empty() {
            return Ok(0);
        }
        let written = self.state.insert_secrets(&bundle.stack_id, &bundle.pending).await?;
        metrics::counter!("haven_secrets_created_total").increment(written);
        info!(written, "Stored new secrets");
        Ok(written)
    }

    /// Names of every stored secret for a stack.
    pub async fn list(&self, stack_id: &StackId) -> Result<Vec<String>> {
        self.state.list_secret_names(stack_id).await
    }

    fn record(&self, stack_id: &StackId, name: &str, value: String) -> SecretRecord {
        SecretRecord { stack_id: stack_id.clone(), name: name.to_string(), value }
    }
}
