//! Challenge-response bookkeeping.
//!
//! A challenge is the pending half of a two-step authentication: the PIN
//! opened it, the OTP answer closes it. Challenges are grouped under one
//! transaction ID so a user with several challenge tokens answers any of
//! them with a single response. Expiry is wall-clock based; expired rows
//! are skipped on lookup and reaped by [`ChallengeStore::purge_expired`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::error::Result;

/// One pending challenge for one token.
#[derive(Clone, Debug)]
pub struct Challenge {
    pub transaction_id: String,
    pub serial: String,
    pub message: String,
    pub data: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub answered: bool,
    /// Response payload, set when the challenge is answered.
    pub answer: Option<String>,
}

impl Challenge {
    #[must_use]
    pub fn new(
        transaction_id: impl Into<String>,
        serial: impl Into<String>,
        message: impl Into<String>,
        data: Option<String>,
        validity_seconds: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            transaction_id: transaction_id.into(),
            serial: serial.into(),
            message: message.into(),
            data,
            created_at: now,
            expires_at: now + Duration::seconds(validity_seconds),
            answered: false,
            answer: None,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

/// Generate a fresh transaction ID.
#[must_use]
pub fn new_transaction_id() -> String {
    Ulid::new().to_string()
}

/// The answered, still-valid subset of a challenge list. Pure filter; an
/// expired-but-answered challenge does not count.
#[must_use]
pub fn extract_answered(challenges: &[Challenge]) -> Vec<&Challenge> {
    challenges
        .iter()
        .filter(|c| c.answered && c.is_valid())
        .collect()
}

/// Challenge description handed back to the authenticating client.
#[derive(Clone, Debug, Serialize)]
pub struct ChallengeInfo {
    pub serial: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub transaction_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<String>,
}

/// Persistence seam for pending challenges.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn insert(&self, challenge: Challenge) -> Result<()>;

    /// Unexpired challenges of a transaction, in insertion order.
    async fn by_transaction(&self, transaction_id: &str) -> Result<Vec<Challenge>>;

    /// Mark one challenge of the transaction answered, recording the
    /// response payload.
    async fn set_answered(
        &self,
        transaction_id: &str,
        serial: &str,
        answer: Option<String>,
    ) -> Result<()>;

    /// Drop every challenge of the transaction (after it was answered).
    async fn delete_transaction(&self, transaction_id: &str) -> Result<()>;

    /// Reap expired challenges; returns how many were removed.
    async fn purge_expired(&self) -> Result<usize>;
}

/// In-memory store keyed by transaction ID.
#[derive(Debug, Default)]
pub struct InMemoryChallengeStore {
    challenges: Mutex<BTreeMap<String, Vec<Challenge>>>,
}

impl InMemoryChallengeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChallengeStore for InMemoryChallengeStore {
    async fn insert(&self, challenge: Challenge) -> Result<()> {
        let mut challenges = self.challenges.lock().await;
        challenges
            .entry(challenge.transaction_id.clone())
            .or_default()
            .push(challenge);
        Ok(())
    }

    async fn by_transaction(&self, transaction_id: &str) -> Result<Vec<Challenge>> {
        let challenges = self.challenges.lock().await;
        Ok(challenges
            .get(transaction_id)
            .map(|rows| rows.iter().filter(|c| c.is_valid()).cloned().collect())
            .unwrap_or_default())
    }

    async fn set_answered(
        &self,
        transaction_id: &str,
        serial: &str,
        answer: Option<String>,
    ) -> Result<()> {
        let mut challenges = self.challenges.lock().await;
        if let Some(rows) = challenges.get_mut(transaction_id) {
            for row in rows.iter_mut().filter(|c| c.serial == serial) {
                row.answered = true;
                row.answer.clone_from(&answer);
            }
        }
        Ok(())
    }

    async fn delete_transaction(&self, transaction_id: &str) -> Result<()> {
        let mut challenges = self.challenges.lock().await;
        challenges.remove(transaction_id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut challenges = self.challenges.lock().await;
        let mut removed = 0;
        challenges.retain(|_, rows| {
            let before = rows.len();
            rows.retain(Challenge::is_valid);
            removed += before - rows.len();
            !rows.is_empty()
        });
        Ok(removed)
    }
}
