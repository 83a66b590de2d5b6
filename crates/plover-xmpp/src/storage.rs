//! Storage providers for per-account application state.
//!
//! Values are opaque strings stored under (bare entity, key). Extension
//! modules choose their own keys and serialization.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::entity::Entity;
use crate::XmppError;

/// Key-by-address storage.
///
/// Implementations normalise `owner` to its bare form, so all resources of
/// an account share one namespace of keys.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    /// Fetch the value stored under `key`.
    async fn get(&self, owner: &Entity, key: &str) -> Result<Option<String>, XmppError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, owner: &Entity, key: &str, value: String) -> Result<(), XmppError>;

    /// Remove `key`. Returns whether something was removed.
    async fn delete(&self, owner: &Entity, key: &str) -> Result<bool, XmppError>;
}

/// In-process storage, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<(Entity, String), String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn get(&self, owner: &Entity, key: &str) -> Result<Option<String>, XmppError> {
        Ok(self
            .entries
            .get(&(owner.bare(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn put(&self, owner: &Entity, key: &str, value: String) -> Result<(), XmppError> {
        debug!(owner = %owner.bare(), key = %key, bytes = value.len(), "Storing value");
        self.entries.insert((owner.bare(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, owner: &Entity, key: &str) -> Result<bool, XmppError> {
        Ok(self
            .entries
            .remove(&(owner.bare(), key.to_string()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let storage = MemoryStorage::new();
        let alice = Entity::parse("alice@example.com").unwrap();

        assert_eq!(storage.get(&alice, "k").await.unwrap(), None);
        storage.put(&alice, "k", "v1".into()).await.unwrap();
        storage.put(&alice, "k", "v2".into()).await.unwrap();
        assert_eq!(storage.get(&alice, "k").await.unwrap().as_deref(), Some("v2"));

        assert!(storage.delete(&alice, "k").await.unwrap());
        assert!(!storage.delete(&alice, "k").await.unwrap());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_resources_share_account_storage() {
        let storage = MemoryStorage::new();
        let phone = Entity::parse("alice@example.com/phone").unwrap();
        let laptop = Entity::parse("alice@example.com/laptop").unwrap();
        let bob = Entity::parse("bob@example.com/phone").unwrap();

        storage.put(&phone, "k", "v".into()).await.unwrap();
        assert_eq!(storage.get(&laptop, "k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(storage.get(&bob, "k").await.unwrap(), None);
    }
}
