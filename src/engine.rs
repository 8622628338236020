//! Authentication decision engine.
//!
//! The engine owns no token state. Every operation loads the affected
//! tokens through the [`TokenStore`], runs the variant logic and persists
//! mutations under the store's per-token update, so two concurrent checks
//! against the same token cannot lose a counter increment.
//!
//! `check_credential` flow:
//! 1. resolve the user (when a login is given) and collect the candidate
//!    tokens by serial or by owner,
//! 2. if the request answers a challenge transaction, match the response
//!    against the pending challenges,
//! 3. otherwise run the synchronous check on every usable candidate;
//!    tokens whose PIN opens a challenge are collected and answered with
//!    one shared transaction ID instead.

use rand::RngCore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::audit::{AuditRecord, AuditSink, TracingAuditSink};
use crate::ca::CaConnector;
use crate::certs;
use crate::challenge::{
    extract_answered, new_transaction_id, Challenge, ChallengeInfo, ChallengeStore,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::policy::{
    PolicyEvaluator, Scope, StaticPolicy, ACTION_REQUIRE_ATTESTATION, ACTION_TRUSTED_CA_PATH,
};
use crate::store::{TokenQuery, TokenStore};
use crate::token::certificate::CertificateToken;
use crate::token::{
    generate_otp_key, generate_serial, AuthMode, AuthOutcome, CheckContext, CheckOptions,
    InitParams, TokenData, TokenRegistry,
};
use crate::users::{resolve_required, User, UserDirectory};

/// One credential check request.
#[derive(Clone, Debug, Default)]
pub struct CheckRequest {
    pub user: Option<String>,
    pub realm: Option<String>,
    pub serial: Option<String>,
    pub pass: String,
    /// Skip the PIN part and treat `pass` as the bare OTP value. Only
    /// honored together with `serial`.
    pub otp_only: bool,
    pub options: CheckOptions,
}

/// Details accompanying a check verdict.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CheckDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub multi_challenge: Vec<ChallengeInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub messages: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub transaction_ids: Vec<String>,
}

/// Verdict of a credential check. `authenticated` is the decision; the
/// details explain it (and carry issued challenges).
#[derive(Clone, Debug, Serialize)]
pub struct CheckResult {
    pub authenticated: bool,
    pub details: CheckDetails,
}

impl CheckResult {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            details: CheckDetails {
                message: Some(message.into()),
                ..CheckDetails::default()
            },
        }
    }
}

/// Challenges opened by [`Engine::trigger_challenges`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct TriggerResult {
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub multi_challenge: Vec<ChallengeInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub messages: Vec<String>,
}

/// One batch of offline OTP values plus the refill token authorizing the
/// next batch.
#[derive(Clone, Debug, Serialize)]
pub struct OfflineRefill {
    pub serial: String,
    pub refilltoken: String,
    /// OTP values keyed by counter.
    pub response: BTreeMap<u64, String>,
}

/// The multi-factor authentication decision engine.
pub struct Engine {
    config: EngineConfig,
    registry: TokenRegistry,
    store: Arc<dyn TokenStore>,
    challenges: Arc<dyn ChallengeStore>,
    users: Arc<dyn UserDirectory>,
    policy: Arc<dyn PolicyEvaluator>,
    audit: Arc<dyn AuditSink>,
    ca: Option<Arc<dyn CaConnector>>,
}

impl Engine {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TokenStore>,
        challenges: Arc<dyn ChallengeStore>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            config,
            registry: TokenRegistry::standard(),
            store,
            challenges,
            users,
            policy: Arc::new(StaticPolicy::new()),
            audit: Arc::new(TracingAuditSink),
            ca: None,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn PolicyEvaluator>) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_ca(mut self, ca: Arc<dyn CaConnector>) -> Self {
        self.ca = Some(ca);
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: TokenRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check a credential against the user's (or the serial's) tokens.
    ///
    /// # Errors
    /// `Error::Parameter` for an unknown user or serial, a serial that does
    /// not belong to the given user, or a request naming neither. A wrong
    /// credential is not an error but an unauthenticated verdict.
    pub async fn check_credential(&self, request: &CheckRequest) -> Result<CheckResult> {
        let ctx = CheckContext {
            config: &self.config,
            options: &request.options,
        };
        let user = match &request.user {
            Some(login) => Some(
                resolve_required(self.users.as_ref(), login, request.realm.as_deref()).await?,
            ),
            None => None,
        };

        let tokens = self.candidate_tokens(request, user.as_ref()).await?;
        let result = if tokens.is_empty() {
            CheckResult::failure("The user has no tokens assigned")
        } else if let Some(transaction_id) = request.options.requested_transaction() {
            self.check_challenge_response(&tokens, transaction_id, &request.pass, &ctx)
                .await?
        } else {
            self.check_tokens(&tokens, request, &ctx).await?
        };

        self.audit.log(AuditRecord {
            action: "validate_check".into(),
            user: user.as_ref().map(|u| u.login.clone()),
            realm: user.as_ref().map(|u| u.realm.clone()),
            serial: result.details.serial.clone(),
            token_type: result.details.token_type.clone(),
            client: request.options.client_ip.clone(),
            success: result.authenticated,
            info: result.details.message.clone(),
        });
        Ok(result)
    }

    async fn candidate_tokens(
        &self,
        request: &CheckRequest,
        user: Option<&User>,
    ) -> Result<Vec<TokenData>> {
        if let Some(serial) = &request.serial {
            let rows = self.store.find(&TokenQuery::by_serial(serial)).await?;
            let Some(token) = rows.into_iter().next() else {
                return Err(Error::param("The token does not exist"));
            };
            if let Some(user) = user {
                match &token.owner {
                    Some(owner) if owner.same_identity(user) => {}
                    _ => return Err(Error::param("Given serial does not belong to given user!")),
                }
            }
            Ok(vec![token])
        } else if let Some(user) = user {
            self.store.find(&TokenQuery::by_user(user.clone())).await
        } else {
            Err(Error::param("Missing parameter: user or serial"))
        }
    }

    async fn check_tokens(
        &self,
        tokens: &[TokenData],
        request: &CheckRequest,
        ctx: &CheckContext<'_>,
    ) -> Result<CheckResult> {
        let mut challenge_serials = Vec::new();
        let mut matching: Vec<(String, String)> = Vec::new();
        let mut pin_matched = false;
        // otp_only is a serial-mode switch; a user-resolved list keeps its PINs
        let otp_only = request.otp_only && request.serial.is_some();

        for token in tokens {
            let variant = match self.registry.for_token(token) {
                Ok(variant) => variant,
                Err(err) => {
                    debug!(serial = token.serial(), "skipping token: {err}");
                    continue;
                }
            };
            if !token.usable() {
                debug!(serial = token.serial(), "token is disabled, revoked or locked");
                continue;
            }
            if !otp_only && variant.is_challenge_request(token, &request.pass, ctx) {
                challenge_serials.push(token.serial().to_string());
                continue;
            }
            let outcome = self
                .with_token(token.serial(), |data| {
                    if otp_only {
                        AuthOutcome {
                            pin_matched: true,
                            matched_counter: variant.check_otp(data, &request.pass, None, ctx),
                        }
                    } else {
                        variant.authenticate(data, &request.pass, ctx)
                    }
                })
                .await?;
            if outcome.success() {
                matching.push((token.serial().to_string(), token.token_type.clone()));
                self.with_token(token.serial(), |data| data.failcount = 0)
                    .await?;
            } else {
                pin_matched |= outcome.pin_matched;
                self.with_token(token.serial(), |data| data.failcount += 1)
                    .await?;
            }
        }

        if let Some((serial, token_type)) = matching.first().cloned() {
            return Ok(CheckResult {
                authenticated: true,
                details: CheckDetails {
                    message: Some(format!("matching {} tokens", matching.len())),
                    serial: Some(serial),
                    token_type: Some(token_type),
                    ..CheckDetails::default()
                },
            });
        }
        if !challenge_serials.is_empty() {
            return self.open_challenges(&challenge_serials, ctx).await;
        }
        Ok(CheckResult::failure(if pin_matched {
            "wrong otp value"
        } else {
            "wrong otp pin"
        }))
    }

    async fn open_challenges(
        &self,
        serials: &[String],
        ctx: &CheckContext<'_>,
    ) -> Result<CheckResult> {
        let transaction_id = new_transaction_id();
        let mut details = CheckDetails::default();

        for serial in serials {
            let rows = self.store.find(&TokenQuery::by_serial(serial)).await?;
            let Some(token) = rows.first() else { continue };
            let variant = self.registry.for_token(token)?;

            let issued = self
                .with_token(serial, |data| {
                    variant.create_challenge(data, &transaction_id, ctx)
                })
                .await?;
            let issued = match issued {
                Ok(issued) => issued,
                Err(err) => {
                    debug!(serial = serial.as_str(), "can not create challenge: {err}");
                    continue;
                }
            };

            self.challenges
                .insert(Challenge::new(
                    &transaction_id,
                    serial,
                    issued.message.clone(),
                    issued.data.clone(),
                    self.config.challenge_validity_seconds(),
                ))
                .await?;
            details.multi_challenge.push(ChallengeInfo {
                serial: serial.clone(),
                token_type: token.token_type.clone(),
                transaction_id: transaction_id.clone(),
                message: issued.message.clone(),
                attributes: issued.data.clone(),
            });
            details.messages.push(issued.message);
            details.transaction_ids.push(transaction_id.clone());
        }

        if details.multi_challenge.is_empty() {
            return Ok(CheckResult::failure("wrong otp pin"));
        }
        details.message = Some(details.messages.join(", "));
        details.transaction_id = Some(transaction_id);
        Ok(CheckResult {
            authenticated: false,
            details,
        })
    }

    async fn check_challenge_response(
        &self,
        tokens: &[TokenData],
        transaction_id: &str,
        pass: &str,
        ctx: &CheckContext<'_>,
    ) -> Result<CheckResult> {
        let pending = self.challenges.by_transaction(transaction_id).await?;

        for challenge in pending.iter().filter(|c| !c.answered) {
            let Some(token) = tokens.iter().find(|t| t.serial() == challenge.serial) else {
                continue;
            };
            if !token.usable() {
                continue;
            }
            let variant = self.registry.for_token(token)?;
            let matched = self
                .with_token(&challenge.serial, |data| {
                    variant.check_otp(data, pass, None, ctx)
                })
                .await?;
            if matched.is_some() {
                self.challenges
                    .set_answered(transaction_id, &challenge.serial, Some(pass.to_string()))
                    .await?;
                self.challenges.delete_transaction(transaction_id).await?;
                self.with_token(&challenge.serial, |data| data.failcount = 0)
                    .await?;
                return Ok(CheckResult {
                    authenticated: true,
                    details: CheckDetails {
                        message: Some("Found matching challenge".into()),
                        serial: Some(challenge.serial.clone()),
                        token_type: Some(token.token_type.clone()),
                        ..CheckDetails::default()
                    },
                });
            }
        }

        for challenge in &pending {
            if tokens.iter().any(|t| t.serial() == challenge.serial) {
                self.with_token(&challenge.serial, |data| data.failcount += 1)
                    .await?;
            }
        }
        Ok(CheckResult::failure("Response did not match the challenge."))
    }

    /// Open challenges for every challenge-capable token of the user (or
    /// for the one token named by serial), without checking any credential.
    /// No matching challenge token yields a count of zero, not an error.
    ///
    /// # Errors
    /// `Error::Parameter` when the user cannot be resolved, the serial is
    /// unknown, or neither user nor serial is given.
    pub async fn trigger_challenges(
        &self,
        login: Option<&str>,
        realm: Option<&str>,
        serial: Option<&str>,
        options: &CheckOptions,
    ) -> Result<TriggerResult> {
        let user = match login {
            Some(login) => Some(resolve_required(self.users.as_ref(), login, realm).await?),
            None => None,
        };
        let tokens = match (serial, &user) {
            (Some(serial), _) => {
                let rows = self.store.find(&TokenQuery::by_serial(serial)).await?;
                if rows.is_empty() {
                    return Err(Error::param("The token does not exist"));
                }
                rows
            }
            (None, Some(user)) => {
                self.store
                    .find(&TokenQuery::by_user(user.clone()).active_only())
                    .await?
            }
            (None, None) => return Err(Error::param("Missing parameter: user or serial")),
        };
        let ctx = CheckContext {
            config: &self.config,
            options,
        };

        let serials: Vec<String> = tokens
            .iter()
            .filter(|t| t.usable())
            .filter(|t| {
                self.registry
                    .for_token(t)
                    .map(|v| v.modes().contains(&AuthMode::Challenge))
                    .unwrap_or(false)
            })
            .map(|t| t.serial().to_string())
            .collect();

        let result = if serials.is_empty() {
            TriggerResult::default()
        } else {
            let opened = self.open_challenges(&serials, &ctx).await?;
            TriggerResult {
                count: opened.details.multi_challenge.len(),
                transaction_id: opened.details.transaction_id,
                multi_challenge: opened.details.multi_challenge,
                messages: opened.details.messages,
            }
        };

        self.audit.log(AuditRecord {
            action: "triggerchallenge".into(),
            user: user.as_ref().map(|u| u.login.clone()),
            realm: user.as_ref().map(|u| u.realm.clone()),
            serial: serial.map(str::to_string),
            client: options.client_ip.clone(),
            success: true,
            info: Some(format!("triggered {} challenges", result.count)),
            ..AuditRecord::default()
        });
        Ok(result)
    }

    /// Whether any challenge of the transaction has been answered
    /// out-of-band. Unknown or expired transactions are simply `false`.
    ///
    /// # Errors
    /// Only store failures surface here.
    pub async fn poll_transaction(&self, transaction_id: &str) -> Result<bool> {
        let pending = self.challenges.by_transaction(transaction_id).await?;
        Ok(!extract_answered(&pending).is_empty())
    }

    /// Verify a device attestation certificate against the trusted anchor
    /// directories, policy-resolved with the configuration as fallback.
    #[must_use]
    pub fn verify_attestation_chain(&self, attestation_pem: &str, user: Option<&User>) -> bool {
        certs::verify_certificate_path(attestation_pem, &self.trusted_ca_paths(user))
    }

    /// Put a token into offline mode: hand out the first OTP batch and the
    /// refill token authorizing the next one.
    ///
    /// # Errors
    /// `Error::Parameter` for an unknown serial or a token type that cannot
    /// be used offline.
    pub async fn enable_offline(&self, serial: &str) -> Result<OfflineRefill> {
        let refilltoken = new_refill_token();
        let count = self.config.offline_otp_count() as u64;

        let response = self
            .with_token(serial, |data| {
                if data.token_type != "hotp" {
                    return Err(Error::param("Only hotp tokens can be used offline"));
                }
                data.set_info("offline", "true");
                data.set_info("refilltoken", refilltoken.clone());
                // counter stays put: the batch is a forecast, consumption
                // is only reported back on refill
                let start = data.counter;
                let response: BTreeMap<u64, String> = {
                    let hmac = data.hmac_otp();
                    (start..start + count).map(|c| (c, hmac.generate(c))).collect()
                };
                Ok(response)
            })
            .await??;

        info!(serial, count, "enabled offline use");
        Ok(OfflineRefill {
            serial: serial.to_string(),
            refilltoken,
            response,
        })
    }

    /// Refill the offline OTP batch of a token. The caller proves
    /// possession with the previous refill token and the last consumed OTP
    /// value; both the batch and the refill token rotate.
    ///
    /// # Errors
    /// `Error::Parameter` when the serial is unknown, the token is not
    /// offline, the refill token does not match or the OTP value is wrong.
    pub async fn refill_offline(
        &self,
        serial: &str,
        refilltoken: &str,
        pass: &str,
        options: &CheckOptions,
    ) -> Result<OfflineRefill> {
        let count = self.config.offline_otp_count() as u64;
        let next_refilltoken = new_refill_token();

        let response = self
            .with_token(serial, |data| {
                if data.info_value("offline") != Some("true")
                    || data.info_value("refilltoken") != Some(refilltoken)
                {
                    return Err(Error::param(
                        "Token is not an offline token or refill token is incorrect",
                    ));
                }
                // the last consumed OTP sits somewhere inside the handed-out
                // batch, so the scan window is the batch size
                let matched = {
                    let hmac = data.hmac_otp();
                    hmac.check(pass, data.counter, count.max(1), false)
                }
                .ok_or_else(|| Error::param("You provided a wrong OTP value"))?;
                data.counter = matched + 1;
                let start = data.counter;
                let response: BTreeMap<u64, String> = {
                    let hmac = data.hmac_otp();
                    (start..start + count).map(|c| (c, hmac.generate(c))).collect()
                };
                data.set_info("refilltoken", next_refilltoken.clone());
                Ok(response)
            })
            .await??;

        self.audit.log(AuditRecord {
            action: "offlinerefill".into(),
            serial: Some(serial.to_string()),
            client: options.client_ip.clone(),
            success: true,
            ..AuditRecord::default()
        });
        Ok(OfflineRefill {
            serial: serial.to_string(),
            refilltoken: next_refilltoken,
            response,
        })
    }

    /// Enroll a new token. Returns the serial (generated with the
    /// variant's prefix when none is given).
    ///
    /// # Errors
    /// `Error::Parameter` for an unknown type or a duplicate serial;
    /// certificate enrollment additionally fails on attestation or CA
    /// errors, in which case nothing is stored.
    pub async fn init_token(
        &self,
        params: &InitParams,
        owner: Option<User>,
        options: &CheckOptions,
    ) -> Result<String> {
        let variant = self.registry.get(&params.token_type).ok_or_else(|| {
            Error::param(format!("The type of the token is unknown: {}", params.token_type))
        })?;
        let serial = params
            .serial
            .clone()
            .unwrap_or_else(|| generate_serial(variant.serial_prefix()));
        if !self
            .store
            .find(&TokenQuery::by_serial(&serial))
            .await?
            .is_empty()
        {
            return Err(Error::param(format!(
                "Token with serial {serial} already exists"
            )));
        }

        let secret = params.otp_key.clone().unwrap_or_else(generate_otp_key);
        let mut data = TokenData::new(&serial, &params.token_type, owner.clone(), secret);
        data.otp_len = self.config.default_otp_length();
        let ctx = CheckContext {
            config: &self.config,
            options,
        };

        if params.token_type == "certificate" {
            if self.attestation_required(owner.as_ref()) && params.attestation.is_none() {
                return Err(Error::param("You need to provide an attestation certificate"));
            }
            CertificateToken
                .enroll(
                    &mut data,
                    params,
                    self.ca.as_deref(),
                    &self.trusted_ca_paths(owner.as_ref()),
                    &ctx,
                )
                .await?;
        } else {
            variant.update(&mut data, params, &ctx)?;
        }
        self.store.save(data).await?;

        self.audit.log(AuditRecord {
            action: "init".into(),
            user: owner.as_ref().map(|u| u.login.clone()),
            realm: owner.as_ref().map(|u| u.realm.clone()),
            serial: Some(serial.clone()),
            token_type: Some(params.token_type.clone()),
            client: options.client_ip.clone(),
            success: true,
            info: None,
        });
        info!(%serial, token_type = %params.token_type, "enrolled token");
        Ok(serial)
    }

    /// Revoke a token. Certificate tokens are revoked at the CA first; a
    /// CA failure leaves the token untouched.
    ///
    /// # Errors
    /// `Error::Parameter` for an unknown serial, CA connector errors for
    /// certificate tokens.
    pub async fn revoke_token(&self, serial: &str) -> Result<()> {
        let rows = self.store.find(&TokenQuery::by_serial(serial)).await?;
        let Some(mut token) = rows.into_iter().next() else {
            return Err(Error::param("The token does not exist"));
        };

        if token.token_type == "certificate" && token.info.contains_key("certificate") {
            if let Some(ca) = &self.ca {
                CertificateToken.revoke_via_ca(&mut token, ca.as_ref()).await?;
                self.store.save(token).await?;
                self.audit_revoke(serial, "certificate");
                return Ok(());
            }
        }

        let variant = self.registry.for_token(&token)?;
        self.with_token(serial, |data| variant.revoke(data)).await?;
        self.audit_revoke(serial, &token.token_type);
        Ok(())
    }

    fn audit_revoke(&self, serial: &str, token_type: &str) {
        self.audit.log(AuditRecord {
            action: "revoke".into(),
            serial: Some(serial.to_string()),
            token_type: Some(token_type.to_string()),
            success: true,
            ..AuditRecord::default()
        });
    }

    fn trusted_ca_paths(&self, user: Option<&User>) -> Vec<PathBuf> {
        let mut values = self
            .policy
            .action_values(Scope::Admin, ACTION_TRUSTED_CA_PATH, user);
        values.extend(
            self.policy
                .action_values(Scope::User, ACTION_TRUSTED_CA_PATH, user),
        );
        if values.is_empty() {
            self.config.trusted_ca_paths().to_vec()
        } else {
            values.into_iter().map(PathBuf::from).collect()
        }
    }

    fn attestation_required(&self, user: Option<&User>) -> bool {
        self.policy
            .action_values(Scope::Enroll, ACTION_REQUIRE_ATTESTATION, user)
            .iter()
            .any(|v| v != "ignore")
    }

    /// Run a mutation on one stored token, mapping a missing serial to a
    /// parameter error.
    async fn with_token<T: Send>(
        &self,
        serial: &str,
        mut apply: impl FnMut(&mut TokenData) -> T + Send,
    ) -> Result<T> {
        let mut out = None;
        let found = self
            .store
            .update_token(serial, &mut |data| {
                out = Some(apply(data));
            })
            .await?;
        if !found {
            return Err(Error::param("The token does not exist"));
        }
        out.ok_or_else(|| Error::param("The token does not exist"))
    }
}

fn new_refill_token() -> String {
    let mut bytes = [0u8; 20];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn refill_tokens_are_40_hex_chars() {
        let token = new_refill_token();
        assert_eq!(token.len(), 40);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, new_refill_token());
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x0a]), "00ff0a");
    }
}
