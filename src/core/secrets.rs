use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::error::SecretError;

/// Credential storage keyed by `(account, host)`.
pub trait SecretStore: Send + Sync {
    fn save(&self, account: &str, host: &str, secret: &str) -> Result<(), SecretError>;
    fn retrieve(&self, account: &str, host: &str) -> Result<String, SecretError>;
    fn delete(&self, account: &str, host: &str) -> Result<(), SecretError>;
    /// Stored entries formatted as `account@host`.
    fn list(&self) -> Result<Vec<String>, SecretError>;
}

/// Process-lifetime store.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn save(&self, account: &str, host: &str, secret: &str) -> Result<(), SecretError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((account.to_string(), host.to_string()), secret.to_string());
        Ok(())
    }

    fn retrieve(&self, account: &str, host: &str) -> Result<String, SecretError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(account.to_string(), host.to_string()))
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                account: account.to_string(),
                host: host.to_string(),
            })
    }

    fn delete(&self, account: &str, host: &str) -> Result<(), SecretError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(account.to_string(), host.to_string()));
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, SecretError> {
        let mut accounts: Vec<String> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|(account, host)| format!("{}@{}", account, host))
            .collect();
        accounts.sort();
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_retrieve_delete() {
        let store = MemorySecretStore::new();
        store.save("alice", "nas", "pw").unwrap();
        assert_eq!(store.retrieve("alice", "nas").unwrap(), "pw");
        assert_eq!(store.list().unwrap(), vec!["alice@nas"]);

        store.delete("alice", "nas").unwrap();
        assert!(matches!(
            store.retrieve("alice", "nas"),
            Err(SecretError::NotFound { .. })
        ));
    }
}
