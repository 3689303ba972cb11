//! Secret storage. Credentials issued for provisioned resources live here
//! and are referenced from transfer processes by key only.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::VaultError;

#[async_trait]
pub trait Vault: Send + Sync {
    /// Fails with [`VaultError::NotFound`] for an unknown key.
    async fn resolve_secret(&self, key: &str) -> Result<String, VaultError>;

    async fn store_secret(&self, key: &str, value: &str) -> Result<(), VaultError>;

    /// Removing an unknown key is not an error.
    async fn delete_secret(&self, key: &str) -> Result<(), VaultError>;
}

#[derive(Debug, Default)]
pub struct InMemoryVault {
    secrets: RwLock<HashMap<String, String>>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Vault for InMemoryVault {
    async fn resolve_secret(&self, key: &str) -> Result<String, VaultError> {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(key.to_string()))
    }

    async fn store_secret(&self, key: &str, value: &str) -> Result<(), VaultError> {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_secret(&self, key: &str) -> Result<(), VaultError> {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}
