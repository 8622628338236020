//! User identity and the directory collaborator resolving logins.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// A resolved user: login plus the realm and resolver it came from.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    pub realm: String,
    pub resolver: String,
}

impl User {
    #[must_use]
    pub fn new(login: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            realm: realm.into(),
            resolver: String::new(),
        }
    }

    /// Token-ownership identity: login and realm, ignoring the resolver.
    #[must_use]
    pub fn same_identity(&self, other: &User) -> bool {
        self.login == other.login && self.realm == other.realm
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.login, self.realm)
    }
}

/// Resolves login names to users. Backends (LDAP, SQL, …) live outside the
/// engine; this is the seam they plug into.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve a login, optionally restricted to a realm. `Ok(None)` means
    /// the user does not exist in any resolver.
    async fn resolve(&self, login: &str, realm: Option<&str>) -> Result<Option<User>>;
}

/// A fixed in-memory directory, for tests and single-tenant embeddings.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: Mutex<Vec<User>>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, user: User) {
        self.users.lock().await.push(user);
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn resolve(&self, login: &str, realm: Option<&str>) -> Result<Option<User>> {
        let users = self.users.lock().await;
        Ok(users
            .iter()
            .find(|u| u.login == login && realm.map_or(true, |r| u.realm == r))
            .cloned())
    }
}

/// Convenience used by the orchestrator: resolve a login that the caller
/// declared present, mapping "not found" to a parameter error.
pub(crate) async fn resolve_required(
    directory: &dyn UserDirectory,
    login: &str,
    realm: Option<&str>,
) -> Result<User> {
    directory.resolve(login, realm).await?.ok_or_else(|| {
        Error::param("The user can not be found in any resolver in this realm!")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_by_login_and_realm() {
        let directory = StaticDirectory::new();
        directory.add(User::new("alice", "realm1")).await;
        directory.add(User::new("alice", "realm2")).await;

        let hit = directory.resolve("alice", Some("realm2")).await.unwrap();
        assert_eq!(hit.map(|u| u.realm), Some("realm2".to_string()));

        let miss = directory.resolve("bob", None).await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn missing_user_is_a_parameter_error() {
        let directory = StaticDirectory::new();
        let err = resolve_required(&directory, "ghost", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parameter(_)));
    }
}
