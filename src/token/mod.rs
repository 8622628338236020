//! Token abstraction.
//!
//! A token is one enrolled credential instrument. Its persistent state lives
//! in [`TokenData`]; its behavior lives in a stateless [`TokenVariant`]
//! implementation selected purely by the type tag stored on the data. The
//! [`TokenRegistry`] is the lookup table the orchestrator dispatches
//! through — no reflection, no downcasting.
//!
//! Registered variants:
//! - `spass` — static password, PIN only
//! - `hotp` — counter-based OTP (RFC 4226)
//! - `daypassword` — time-based OTP with a configurable (multi-hour/day)
//!   step, reusable within a step, auto-resync capable
//! - `email` — challenge-response token delivering a one-time code
//!   out-of-band
//! - `certificate` — X.509 certificate with attestation-verified enrollment

pub mod certificate;
pub mod daypassword;
pub mod email;
pub mod hotp;
pub mod spass;

use chrono::{DateTime, Utc};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::otp::{HashAlgorithm, HmacOtp};
use crate::users::User;

/// How a token can take part in authentication.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthMode {
    /// Verified synchronously from the submitted credential.
    Authenticate,
    /// Requires an out-of-band challenge-response round trip.
    Challenge,
}

/// A token-info value. `Password` values are flagged for encryption at
/// rest; the storage layer decides how.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum InfoValue {
    Plain(String),
    Password(String),
}

impl InfoValue {
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::Plain(v) | Self::Password(v) => v,
        }
    }

    #[must_use]
    pub fn is_password(&self) -> bool {
        matches!(self, Self::Password(_))
    }
}

/// Persistent state of one token.
///
/// The serial is globally unique and immutable after creation, which is why
/// it is the only private field here.
#[derive(Debug)]
pub struct TokenData {
    serial: String,
    pub token_type: String,
    pub owner: Option<User>,
    secret: SecretSlice<u8>,
    pub otp_len: usize,
    pub counter: u64,
    pin: Option<SecretString>,
    pin_encrypted: bool,
    pub info: BTreeMap<String, InfoValue>,
    pub active: bool,
    pub revoked: bool,
    pub locked: bool,
    pub failcount: u32,
    pub created_at: DateTime<Utc>,
}

impl TokenData {
    #[must_use]
    pub fn new(
        serial: impl Into<String>,
        token_type: impl Into<String>,
        owner: Option<User>,
        secret: Vec<u8>,
    ) -> Self {
        Self {
            serial: serial.into(),
            token_type: token_type.into(),
            owner,
            secret: SecretSlice::from(secret),
            otp_len: 6,
            counter: 0,
            pin: None,
            pin_encrypted: false,
            info: BTreeMap::new(),
            active: true,
            revoked: false,
            locked: false,
            failcount: 0,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    #[must_use]
    pub fn secret(&self) -> &[u8] {
        self.secret.expose_secret()
    }

    pub fn set_secret(&mut self, secret: Vec<u8>) {
        self.secret = SecretSlice::from(secret);
    }

    pub fn set_pin(&mut self, pin: &str, encrypted: bool) {
        self.pin = Some(SecretString::from(pin.to_string()));
        self.pin_encrypted = encrypted;
    }

    /// An unset PIN only matches the empty string.
    #[must_use]
    pub fn check_pin(&self, pin: &str) -> bool {
        match &self.pin {
            None => pin.is_empty(),
            Some(stored) => stored.expose_secret() == pin,
        }
    }

    #[must_use]
    pub fn pin_encrypted(&self) -> bool {
        self.pin_encrypted
    }

    #[must_use]
    pub fn info_value(&self, key: &str) -> Option<&str> {
        self.info.get(key).map(InfoValue::value)
    }

    pub fn set_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.info.insert(key.into(), InfoValue::Plain(value.into()));
    }

    pub fn set_info_password(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.info
            .insert(key.into(), InfoValue::Password(value.into()));
    }

    pub fn remove_info(&mut self, key: &str) -> Option<InfoValue> {
        self.info.remove(key)
    }

    #[must_use]
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.info_value("hashlib")
            .map_or(HashAlgorithm::Sha1, HashAlgorithm::from_name)
    }

    /// HMAC-OTP calculator over this token's secret.
    #[must_use]
    pub fn hmac_otp(&self) -> HmacOtp<'_> {
        HmacOtp::new(self.secret(), self.otp_len, self.hash_algorithm())
    }

    /// Persistent clock correction in seconds, from the `timeShift` info.
    #[must_use]
    pub fn time_shift(&self) -> f64 {
        self.info_value("timeShift")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    pub fn set_time_shift(&mut self, seconds: f64) {
        self.set_info("timeShift", format!("{seconds}"));
    }

    /// Eligible for authentication and challenge issuance.
    #[must_use]
    pub fn usable(&self) -> bool {
        self.active && !self.revoked && !self.locked
    }
}

impl Clone for TokenData {
    fn clone(&self) -> Self {
        Self {
            serial: self.serial.clone(),
            token_type: self.token_type.clone(),
            owner: self.owner.clone(),
            secret: SecretSlice::from(self.secret.expose_secret().to_vec()),
            otp_len: self.otp_len,
            counter: self.counter,
            pin: self
                .pin
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret().to_string())),
            pin_encrypted: self.pin_encrypted,
            info: self.info.clone(),
            active: self.active,
            revoked: self.revoked,
            locked: self.locked,
            failcount: self.failcount,
            created_at: self.created_at,
        }
    }
}

/// Ephemeral per-request context: never persisted, passed by reference down
/// the orchestration call chain.
#[derive(Clone, Debug, Default)]
pub struct CheckOptions {
    pub client_ip: Option<String>,
    /// Overrides the server time (unix seconds) for deterministic checks.
    pub init_time: Option<f64>,
    /// Transaction ID of a challenge-response round trip.
    pub transaction_id: Option<String>,
    /// Alias some callers use for the transaction ID.
    pub state: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl CheckOptions {
    /// The transaction this request responds to, if any.
    #[must_use]
    pub fn requested_transaction(&self) -> Option<&str> {
        self.transaction_id.as_deref().or(self.state.as_deref())
    }
}

/// Engine configuration plus request options, bundled for variant calls.
#[derive(Clone, Copy, Debug)]
pub struct CheckContext<'a> {
    pub config: &'a EngineConfig,
    pub options: &'a CheckOptions,
}

impl CheckContext<'_> {
    /// Server time in unix seconds, honoring the `init_time` override.
    #[must_use]
    pub fn server_time(&self) -> f64 {
        self.options.init_time.unwrap_or_else(|| {
            let now = Utc::now();
            now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
        })
    }
}

/// Parameters of a token enrollment or edit.
#[derive(Clone, Debug, Default)]
pub struct InitParams {
    pub serial: Option<String>,
    pub token_type: String,
    pub otp_key: Option<Vec<u8>>,
    /// Generate the key material server-side.
    pub gen_key: bool,
    pub otp_len: Option<usize>,
    pub pin: Option<String>,
    pub hashlib: Option<String>,
    /// Time step for time-based variants, e.g. `"60"`, `"8h"`, `"1d"`.
    pub time_step: Option<String>,
    pub time_shift: Option<f64>,
    /// Name of the CA connector (certificate tokens).
    pub ca: Option<String>,
    /// PEM-encoded certificate signing request.
    pub request: Option<String>,
    /// PEM-encoded device attestation certificate.
    pub attestation: Option<String>,
    /// PEM-encoded certificate to upload as-is.
    pub certificate: Option<String>,
    pub template: Option<String>,
    pub key_size: Option<u32>,
    pub email: Option<String>,
}

/// Result of a synchronous credential check against one token.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AuthOutcome {
    pub pin_matched: bool,
    pub matched_counter: Option<u64>,
}

impl AuthOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.pin_matched && self.matched_counter.is_some()
    }
}

/// A challenge produced by a token, before the coordinator stamps it with
/// expiry and stores it.
#[derive(Clone, Debug)]
pub struct IssuedChallenge {
    /// Prompt shown to the user.
    pub message: String,
    /// Variant-specific payload carried on the stored challenge.
    pub data: Option<String>,
}

/// Static description of a token variant, including the policy actions it
/// declares.
#[derive(Clone, Copy, Debug)]
pub struct ClassInfo {
    pub token_type: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub policy_actions: &'static [&'static str],
}

/// Behavior contract every token variant implements. Implementations are
/// stateless; all mutation happens on the passed [`TokenData`] and is
/// persisted by the caller under the store's per-token update transaction.
pub trait TokenVariant: Send + Sync {
    fn token_type(&self) -> &'static str;

    /// Prefix for generated serial numbers.
    fn serial_prefix(&self) -> &'static str;

    fn class_info(&self) -> ClassInfo;

    fn modes(&self) -> &'static [AuthMode] {
        &[AuthMode::Authenticate]
    }

    /// Apply enrollment/edit parameters.
    ///
    /// # Errors
    /// Returns `Error::Parameter` for invalid parameters.
    fn update(
        &self,
        data: &mut TokenData,
        params: &InitParams,
        ctx: &CheckContext<'_>,
    ) -> Result<()> {
        base_update(data, params, ctx.config)
    }

    /// Check the OTP part of a credential. `counter` overrides the token's
    /// own counter state when given. Returns the matched counter, `None`
    /// for no match — a mismatch is not an error.
    fn check_otp(
        &self,
        data: &mut TokenData,
        otp: &str,
        counter: Option<u64>,
        ctx: &CheckContext<'_>,
    ) -> Option<u64>;

    fn check_pin(&self, data: &TokenData, pin: &str, _ctx: &CheckContext<'_>) -> bool {
        data.check_pin(pin)
    }

    /// Full synchronous check of `pass` (PIN + OTP split per
    /// configuration).
    fn authenticate(&self, data: &mut TokenData, pass: &str, ctx: &CheckContext<'_>) -> AuthOutcome {
        let (pin, otp) = split_pin_pass(pass, data.otp_len, ctx.config.prepend_pin());
        if !self.check_pin(data, pin, ctx) {
            return AuthOutcome::default();
        }
        AuthOutcome {
            pin_matched: true,
            matched_counter: self.check_otp(data, otp, None, ctx),
        }
    }

    /// Whether the submitted credential asks this token to open a
    /// challenge instead of authenticating directly.
    fn is_challenge_request(&self, data: &TokenData, pass: &str, ctx: &CheckContext<'_>) -> bool {
        self.modes().contains(&AuthMode::Challenge) && self.check_pin(data, pass, ctx)
    }

    /// Produce the challenge content for a new transaction.
    ///
    /// # Errors
    /// Returns `Error::Parameter` when the variant cannot issue challenges.
    fn create_challenge(
        &self,
        _data: &mut TokenData,
        _transaction_id: &str,
        _ctx: &CheckContext<'_>,
    ) -> Result<IssuedChallenge> {
        Err(Error::param(format!(
            "Token type {} does not support challenge-response",
            self.token_type()
        )))
    }

    /// Forecast the next OTP value without advancing state.
    ///
    /// # Errors
    /// Returns `Error::Parameter` when the variant has no OTP values.
    fn get_otp(&self, data: &TokenData, _current_time: Option<f64>) -> Result<String> {
        Ok(data.hmac_otp().generate(data.counter))
    }

    /// Forecast multiple future OTP values, keyed by counter.
    ///
    /// # Errors
    /// Returns `Error::Parameter` when the variant has no OTP values.
    fn get_multi_otp(
        &self,
        data: &TokenData,
        count: usize,
        _current_time: Option<f64>,
    ) -> Result<BTreeMap<u64, String>> {
        let hmac = data.hmac_otp();
        Ok((data.counter..data.counter + count as u64)
            .map(|c| (c, hmac.generate(c)))
            .collect())
    }

    /// Mark the token revoked. Variants with external lifecycle (CA-issued
    /// certificates) do their connector calls in the orchestrator.
    fn revoke(&self, data: &mut TokenData) {
        data.revoked = true;
        data.active = false;
    }
}

/// Shared part of `update` for the OTP-carrying variants.
pub(crate) fn base_update(
    data: &mut TokenData,
    params: &InitParams,
    config: &EngineConfig,
) -> Result<()> {
    if let Some(otp_len) = params.otp_len {
        if otp_len == 0 || otp_len > 10 {
            return Err(Error::param("otp length must be between 1 and 10"));
        }
        data.otp_len = otp_len;
    } else if data.otp_len == 0 {
        data.otp_len = config.default_otp_length();
    }
    if let Some(hashlib) = &params.hashlib {
        data.set_info("hashlib", HashAlgorithm::from_name(hashlib).as_str());
    }
    if let Some(pin) = &params.pin {
        data.set_pin(pin, false);
    }
    Ok(())
}

/// Split a credential into PIN and OTP parts. The OTP length decides the
/// cut; `prepend_pin` places the PIN in front of the OTP.
#[must_use]
pub fn split_pin_pass(pass: &str, otp_len: usize, prepend_pin: bool) -> (&str, &str) {
    if otp_len == 0 {
        return (pass, "");
    }
    let chars = pass.chars().count();
    if chars <= otp_len {
        return ("", pass);
    }
    if prepend_pin {
        let cut = chars - otp_len;
        let idx = pass
            .char_indices()
            .nth(cut)
            .map_or(pass.len(), |(i, _)| i);
        let (pin, otp) = pass.split_at(idx);
        (pin, otp)
    } else {
        let idx = pass
            .char_indices()
            .nth(otp_len)
            .map_or(pass.len(), |(i, _)| i);
        let (otp, pin) = pass.split_at(idx);
        (pin, otp)
    }
}

/// Generate a fresh serial with the variant's prefix.
#[must_use]
pub fn generate_serial(prefix: &str) -> String {
    format!("{prefix}{:08X}", rand::random::<u32>())
}

/// Generate random OTP key material.
#[must_use]
pub fn generate_otp_key() -> Vec<u8> {
    let mut key = vec![0u8; 20];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Lookup table from type tag to variant implementation.
pub struct TokenRegistry {
    variants: BTreeMap<&'static str, Arc<dyn TokenVariant>>,
}

impl TokenRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            variants: BTreeMap::new(),
        }
    }

    /// Registry with all built-in variants.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(spass::StaticPassToken));
        registry.register(Arc::new(hotp::HotpToken));
        registry.register(Arc::new(daypassword::DayPasswordToken));
        registry.register(Arc::new(email::EmailToken));
        registry.register(Arc::new(certificate::CertificateToken));
        registry
    }

    pub fn register(&mut self, variant: Arc<dyn TokenVariant>) {
        self.variants.insert(variant.token_type(), variant);
    }

    #[must_use]
    pub fn get(&self, token_type: &str) -> Option<&dyn TokenVariant> {
        self.variants.get(token_type).map(AsRef::as_ref)
    }

    /// Variant for a token's stored type tag.
    ///
    /// # Errors
    /// `Error::Parameter` for an unknown type tag.
    pub fn for_token(&self, data: &TokenData) -> Result<&dyn TokenVariant> {
        self.get(&data.token_type)
            .ok_or_else(|| Error::param(format!("Unknown token type {}", data.token_type)))
    }

    pub fn types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.variants.keys().copied()
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
