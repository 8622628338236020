//! Token persistence seam.
//!
//! The engine never holds token state between calls; every check loads the
//! affected tokens through a [`TokenStore`] and writes mutations back under
//! [`TokenStore::update_token`], which runs the closure against the current
//! row so concurrent checks cannot lose counter updates.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::token::TokenData;
use crate::users::User;

/// Filter for token lookups. Unset fields do not constrain the result.
#[derive(Clone, Debug, Default)]
pub struct TokenQuery {
    pub serial: Option<String>,
    pub user: Option<User>,
    pub active_only: bool,
}

impl TokenQuery {
    #[must_use]
    pub fn by_serial(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn by_user(user: User) -> Self {
        Self {
            user: Some(user),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn active_only(mut self) -> Self {
        self.active_only = true;
        self
    }

    fn matches(&self, token: &TokenData) -> bool {
        if let Some(serial) = &self.serial {
            if token.serial() != serial {
                return false;
            }
        }
        if let Some(user) = &self.user {
            match &token.owner {
                Some(owner) if owner.same_identity(user) => {}
                _ => return false,
            }
        }
        if self.active_only && !token.active {
            return false;
        }
        true
    }
}

/// Persistence seam for tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Tokens matching the query, in stable (serial) order.
    async fn find(&self, query: &TokenQuery) -> Result<Vec<TokenData>>;

    /// Insert or replace a token row.
    async fn save(&self, token: TokenData) -> Result<()>;

    /// Load the token, apply the mutation and persist the result in one
    /// step. Returns `false` when no such serial exists.
    async fn update_token(
        &self,
        serial: &str,
        apply: &mut (dyn for<'a> FnMut(&'a mut TokenData) + Send),
    ) -> Result<bool>;

    /// Delete a token row; `true` when it existed.
    async fn delete(&self, serial: &str) -> Result<bool>;
}

/// In-memory store backed by a serial-ordered map.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<BTreeMap<String, TokenData>>,
}

impl InMemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn find(&self, query: &TokenQuery) -> Result<Vec<TokenData>> {
        let tokens = self.tokens.lock().await;
        Ok(tokens
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect())
    }

    async fn save(&self, token: TokenData) -> Result<()> {
        let mut tokens = self.tokens.lock().await;
        tokens.insert(token.serial().to_string(), token);
        Ok(())
    }

    async fn update_token(
        &self,
        serial: &str,
        apply: &mut (dyn for<'a> FnMut(&'a mut TokenData) + Send),
    ) -> Result<bool> {
        let mut tokens = self.tokens.lock().await;
        match tokens.get_mut(serial) {
            Some(token) => {
                apply(token);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, serial: &str) -> Result<bool> {
        let mut tokens = self.tokens.lock().await;
        Ok(tokens.remove(serial).is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn token(serial: &str, owner: Option<User>) -> TokenData {
        TokenData::new(serial, "hotp", owner, b"12345678901234567890".to_vec())
    }

    fn user(login: &str) -> User {
        User {
            login: login.to_string(),
            realm: "defrealm".to_string(),
            resolver: String::new(),
        }
    }

    #[tokio::test]
    async fn find_filters_by_serial_and_user() {
        let store = InMemoryTokenStore::new();
        store.save(token("TOK1", Some(user("alice")))).await.unwrap();
        store.save(token("TOK2", Some(user("bob")))).await.unwrap();
        store.save(token("TOK3", None)).await.unwrap();

        let by_serial = store.find(&TokenQuery::by_serial("TOK2")).await.unwrap();
        assert_eq!(by_serial.len(), 1);
        assert_eq!(by_serial[0].serial(), "TOK2");

        let by_user = store.find(&TokenQuery::by_user(user("alice"))).await.unwrap();
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].serial(), "TOK1");

        let all = store.find(&TokenQuery::default()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn active_only_hides_disabled_tokens() {
        let store = InMemoryTokenStore::new();
        let mut disabled = token("TOK1", None);
        disabled.active = false;
        store.save(disabled).await.unwrap();
        store.save(token("TOK2", None)).await.unwrap();

        let active = store.find(&TokenQuery::default().active_only()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].serial(), "TOK2");
    }

    #[tokio::test]
    async fn update_token_applies_in_place() {
        let store = InMemoryTokenStore::new();
        store.save(token("TOK1", None)).await.unwrap();

        let mut seen_counter = None;
        let found = store
            .update_token("TOK1", &mut |t| {
                t.counter += 5;
                seen_counter = Some(t.counter);
            })
            .await
            .unwrap();
        assert!(found);
        assert_eq!(seen_counter, Some(5));

        let rows = store.find(&TokenQuery::by_serial("TOK1")).await.unwrap();
        assert_eq!(rows[0].counter, 5);

        let missing = store.update_token("NOPE", &mut |_| {}).await.unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = InMemoryTokenStore::new();
        store.save(token("TOK1", None)).await.unwrap();
        assert!(store.delete("TOK1").await.unwrap());
        assert!(!store.delete("TOK1").await.unwrap());
    }
}
