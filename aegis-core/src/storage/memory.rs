//! In-memory credential repository
//!
//! Development fallback and test double. Enforces the same uniqueness rules
//! as the PostgreSQL schema: credential IDs are unique per RPID, descriptions
//! are unique per user and RPID.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CredentialRepository, StorageError};
use crate::credential::{UserHandle, WebAuthnCredential, WebAuthnUser};

/// DashMap backed [`CredentialRepository`].
#[derive(Default)]
pub struct MemoryCredentialRepository {
    /// (rp_id, username) -> user
    users: DashMap<(String, String), WebAuthnUser>,
    /// storage id -> credential
    credentials: DashMap<i64, WebAuthnCredential>,
    next_id: AtomicI64,
    /// Serializes inserts so uniqueness checks and writes are atomic
    write_lock: Mutex<()>,
    unavailable: AtomicBool,
}

impl MemoryCredentialRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage: every call fails with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Get number of stored credentials
    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    /// Get number of stored users
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Connection(
                "credential store unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StorageError> {
        self.write_lock
            .lock()
            .map_err(|_| StorageError::Query("write lock poisoned".to_string()))
    }

    fn collect(&self, filter: impl Fn(&WebAuthnCredential) -> bool) -> Vec<WebAuthnCredential> {
        let mut found: Vec<WebAuthnCredential> = self
            .credentials
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|c| c.id);
        found
    }

    fn username_for_handle(&self, rp_id: &str, handle: &UserHandle) -> Option<String> {
        self.users
            .iter()
            .find(|entry| entry.value().rp_id == rp_id && &entry.value().user_handle == handle)
            .map(|entry| entry.value().username.clone())
    }
}

impl std::fmt::Debug for MemoryCredentialRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCredentialRepository")
            .field("users", &self.users.len())
            .field("credentials", &self.credentials.len())
            .finish()
    }
}

#[async_trait]
impl CredentialRepository for MemoryCredentialRepository {
    async fn load_user(
        &self,
        rp_id: &str,
        username: &str,
    ) -> Result<Option<WebAuthnUser>, StorageError> {
        self.available()?;
        Ok(self
            .users
            .get(&(rp_id.to_string(), username.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn load_user_by_handle(
        &self,
        rp_id: &str,
        handle: &UserHandle,
    ) -> Result<Option<WebAuthnUser>, StorageError> {
        self.available()?;
        Ok(self
            .users
            .iter()
            .find(|entry| entry.value().rp_id == rp_id && &entry.value().user_handle == handle)
            .map(|entry| entry.value().clone()))
    }

    async fn save_user(&self, mut user: WebAuthnUser) -> Result<WebAuthnUser, StorageError> {
        self.available()?;
        let _guard = self.lock()?;

        let key = (user.rp_id.clone(), user.username.clone());
        if self.users.contains_key(&key) {
            return Err(StorageError::Duplicate(format!(
                "user {} already exists",
                user.username
            )));
        }

        user.id = Some(self.allocate_id());
        self.users.insert(key, user.clone());
        Ok(user)
    }

    async fn load_credentials_by_username(
        &self,
        rp_id: &str,
        username: &str,
    ) -> Result<Vec<WebAuthnCredential>, StorageError> {
        self.available()?;
        Ok(self.collect(|c| c.rp_id == rp_id && c.username == username))
    }

    async fn load_credentials_by_user_handle(
        &self,
        rp_id: &str,
        handle: &UserHandle,
    ) -> Result<Vec<WebAuthnCredential>, StorageError> {
        self.available()?;
        Ok(match self.username_for_handle(rp_id, handle) {
            Some(username) => self.collect(|c| c.rp_id == rp_id && c.username == username),
            None => Vec::new(),
        })
    }

    async fn load_discoverable_credentials_by_user_handle(
        &self,
        rp_id: &str,
        handle: &UserHandle,
    ) -> Result<Vec<WebAuthnCredential>, StorageError> {
        self.available()?;
        Ok(match self.username_for_handle(rp_id, handle) {
            Some(username) => {
                self.collect(|c| c.rp_id == rp_id && c.username == username && c.discoverable)
            }
            None => Vec::new(),
        })
    }

    async fn load_credential_by_id(
        &self,
        id: i64,
    ) -> Result<Option<WebAuthnCredential>, StorageError> {
        self.available()?;
        Ok(self.credentials.get(&id).map(|entry| entry.value().clone()))
    }

    async fn save_credential(
        &self,
        mut credential: WebAuthnCredential,
    ) -> Result<WebAuthnCredential, StorageError> {
        self.available()?;
        let _guard = self.lock()?;

        for entry in self.credentials.iter() {
            let existing = entry.value();
            if existing.rp_id != credential.rp_id {
                continue;
            }
            if existing.credential_id == credential.credential_id {
                return Err(StorageError::Duplicate(format!(
                    "credential {} already registered",
                    credential.encoded_id()
                )));
            }
            if existing.username == credential.username
                && existing.description == credential.description
            {
                return Err(StorageError::Duplicate(format!(
                    "description '{}' already in use",
                    credential.description
                )));
            }
        }

        credential.id = self.allocate_id();
        self.credentials.insert(credential.id, credential.clone());
        Ok(credential)
    }

    async fn update_credential_sign_in(
        &self,
        credential: &WebAuthnCredential,
    ) -> Result<(), StorageError> {
        self.available()?;
        let mut stored = self
            .credentials
            .get_mut(&credential.id)
            .ok_or_else(|| StorageError::NotFound(format!("credential {}", credential.id)))?;

        stored.public_key = credential.public_key.clone();
        stored.sign_count = credential.sign_count;
        stored.flags = credential.flags;
        stored.clone_warning = credential.clone_warning;
        stored.last_used_at = credential.last_used_at;
        Ok(())
    }

    async fn update_credential_description(
        &self,
        rp_id: &str,
        username: &str,
        id: i64,
        description: &str,
    ) -> Result<(), StorageError> {
        self.available()?;
        let _guard = self.lock()?;

        let taken = self.credentials.iter().any(|entry| {
            let c = entry.value();
            c.id != id && c.rp_id == rp_id && c.username == username && c.description == description
        });
        if taken {
            return Err(StorageError::Duplicate(format!(
                "description '{}' already in use",
                description
            )));
        }

        match self.credentials.get_mut(&id) {
            Some(mut stored) if stored.rp_id == rp_id && stored.username == username => {
                stored.description = description.to_string();
                Ok(())
            }
            _ => Err(StorageError::NotFound(format!("credential {}", id))),
        }
    }

    async fn delete_credential(&self, id: i64) -> Result<(), StorageError> {
        self.available()?;
        self.credentials
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("credential {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::tests::credential;

    #[tokio::test]
    async fn test_user_lookup_by_name_and_handle() {
        let repo = MemoryCredentialRepository::new();
        let user = repo
            .save_user(WebAuthnUser::new("login.example.com", "john", "John"))
            .await
            .unwrap();
        assert!(user.id.is_some());

        let by_name = repo.load_user("login.example.com", "john").await.unwrap();
        assert_eq!(by_name, Some(user.clone()));

        let by_handle = repo
            .load_user_by_handle("login.example.com", &user.user_handle)
            .await
            .unwrap();
        assert_eq!(by_handle, Some(user.clone()));

        let other_rp = repo
            .load_user_by_handle("other.example.com", &user.user_handle)
            .await
            .unwrap();
        assert!(other_rp.is_none());

        let dup = repo
            .save_user(WebAuthnUser::new("login.example.com", "john", "John"))
            .await;
        assert!(matches!(dup, Err(StorageError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_credential_uniqueness() {
        let repo = MemoryCredentialRepository::new();
        let saved = repo.save_credential(credential(0, "test", 0)).await.unwrap();
        assert!(saved.id > 0);

        let mut same_id = credential(0, "other", 0);
        same_id.credential_id = saved.credential_id.clone();
        assert!(matches!(
            repo.save_credential(same_id).await,
            Err(StorageError::Duplicate(_))
        ));

        let mut same_desc = credential(0, "test", 0);
        same_desc.credential_id = vec![9; 16];
        assert!(matches!(
            repo.save_credential(same_desc).await,
            Err(StorageError::Duplicate(_))
        ));

        assert_eq!(repo.credential_count(), 1);
    }

    #[tokio::test]
    async fn test_discoverable_filter() {
        let repo = MemoryCredentialRepository::new();
        let user = repo
            .save_user(WebAuthnUser::new("login.example.com", "john", "John"))
            .await
            .unwrap();

        let mut resident = credential(0, "passkey", 0);
        resident.credential_id = vec![1; 16];
        resident.discoverable = true;
        repo.save_credential(resident).await.unwrap();

        let mut classic = credential(0, "yubikey", 0);
        classic.credential_id = vec![2; 16];
        repo.save_credential(classic).await.unwrap();

        let all = repo
            .load_credentials_by_user_handle("login.example.com", &user.user_handle)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let discoverable = repo
            .load_discoverable_credentials_by_user_handle("login.example.com", &user.user_handle)
            .await
            .unwrap();
        assert_eq!(discoverable.len(), 1);
        assert_eq!(discoverable[0].description, "passkey");
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let repo = MemoryCredentialRepository::new();
        let first = repo.save_credential(credential(0, "one", 0)).await.unwrap();
        let mut second = credential(0, "two", 0);
        second.credential_id = vec![7; 16];
        let second = repo.save_credential(second).await.unwrap();

        let err = repo
            .update_credential_description("login.example.com", "john", second.id, "one")
            .await;
        assert!(matches!(err, Err(StorageError::Duplicate(_))));

        repo.update_credential_description("login.example.com", "john", second.id, "three")
            .await
            .unwrap();

        let err = repo
            .update_credential_description("login.example.com", "jane", first.id, "four")
            .await;
        assert!(matches!(err, Err(StorageError::NotFound(_))));

        repo.delete_credential(first.id).await.unwrap();
        assert!(repo.load_credential_by_id(first.id).await.unwrap().is_none());
        assert!(matches!(
            repo.delete_credential(first.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let repo = MemoryCredentialRepository::new();
        repo.set_unavailable(true);
        assert!(matches!(
            repo.load_user("login.example.com", "john").await,
            Err(StorageError::Connection(_))
        ));
    }
}
