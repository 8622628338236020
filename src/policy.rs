//! Policy evaluation seam.
//!
//! The engine never stores or parses policy rules; it only consumes the
//! evaluation results (sets of action values) that a policy layer produces
//! for a scope, action and user.

use std::collections::{BTreeSet, HashMap};

use crate::users::User;

/// Scope a policy action is evaluated in.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Scope {
    Admin,
    User,
    Enroll,
}

impl Scope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Enroll => "enroll",
        }
    }
}

/// Action name resolving the trusted attestation CA directories for
/// certificate enrollment.
pub const ACTION_TRUSTED_CA_PATH: &str = "certificate_trusted_attestation_ca_path";
/// Action name requiring an attestation certificate on enrollment.
pub const ACTION_REQUIRE_ATTESTATION: &str = "certificate_require_attestation";

/// Evaluates policy actions. Implementations return every configured value
/// for the action that matches scope and user; an empty set means "no policy
/// set".
pub trait PolicyEvaluator: Send + Sync {
    fn action_values(&self, scope: Scope, action: &str, user: Option<&User>) -> BTreeSet<String>;
}

/// Fixed policy table keyed by scope and action. The reference
/// implementation for tests and static deployments; user matching is left
/// to richer backends.
#[derive(Debug, Default)]
pub struct StaticPolicy {
    values: HashMap<(Scope, String), BTreeSet<String>>,
}

impl StaticPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_action(mut self, scope: Scope, action: &str, value: &str) -> Self {
        self.values
            .entry((scope, action.to_string()))
            .or_default()
            .insert(value.to_string());
        self
    }
}

impl PolicyEvaluator for StaticPolicy {
    fn action_values(&self, scope: Scope, action: &str, _user: Option<&User>) -> BTreeSet<String> {
        self.values
            .get(&(scope, action.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}
