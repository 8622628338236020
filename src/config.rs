//! Engine configuration.
//!
//! All tunables are carried in an explicit [`EngineConfig`] threaded through
//! engine construction; there is no ambient global state.

use std::path::PathBuf;

const DEFAULT_COUNT_WINDOW: u64 = 10;
const DEFAULT_SYNC_WINDOW: u64 = 1000;
const DEFAULT_CHALLENGE_VALIDITY_SECONDS: i64 = 120;
const DEFAULT_OFFLINE_OTP_COUNT: usize = 100;
const DEFAULT_OTP_LENGTH: usize = 6;
const DEFAULT_TRUSTED_CA_PATH: &str = "/etc/validi/trusted_attestation_ca";

/// Configuration for the authentication decision engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    prepend_pin: bool,
    auto_resync: bool,
    count_window: u64,
    sync_window: u64,
    challenge_validity_seconds: i64,
    offline_otp_count: usize,
    default_otp_length: usize,
    verify_attestation_chain: bool,
    trusted_ca_paths: Vec<PathBuf>,
}

impl EngineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            prepend_pin: true,
            auto_resync: false,
            count_window: DEFAULT_COUNT_WINDOW,
            sync_window: DEFAULT_SYNC_WINDOW,
            challenge_validity_seconds: DEFAULT_CHALLENGE_VALIDITY_SECONDS,
            offline_otp_count: DEFAULT_OFFLINE_OTP_COUNT,
            default_otp_length: DEFAULT_OTP_LENGTH,
            verify_attestation_chain: true,
            trusted_ca_paths: vec![PathBuf::from(DEFAULT_TRUSTED_CA_PATH)],
        }
    }

    /// PIN is expected in front of the OTP part of the credential.
    #[must_use]
    pub fn with_prepend_pin(mut self, prepend: bool) -> Self {
        self.prepend_pin = prepend;
        self
    }

    /// Enable automatic counter/time resynchronization from two consecutive
    /// OTP values.
    #[must_use]
    pub fn with_auto_resync(mut self, enabled: bool) -> Self {
        self.auto_resync = enabled;
        self
    }

    /// Look-ahead window for counter-based OTP checks.
    #[must_use]
    pub fn with_count_window(mut self, window: u64) -> Self {
        self.count_window = window;
        self
    }

    /// Extended window scanned during auto-resync.
    #[must_use]
    pub fn with_sync_window(mut self, window: u64) -> Self {
        self.sync_window = window;
        self
    }

    /// Validity of an issued challenge before it expires.
    #[must_use]
    pub fn with_challenge_validity_seconds(mut self, seconds: i64) -> Self {
        self.challenge_validity_seconds = seconds;
        self
    }

    /// How many OTP values an offline refill hands out.
    #[must_use]
    pub fn with_offline_otp_count(mut self, count: usize) -> Self {
        self.offline_otp_count = count;
        self
    }

    #[must_use]
    pub fn with_default_otp_length(mut self, length: usize) -> Self {
        self.default_otp_length = length;
        self
    }

    /// Whether certificate enrollment with an attestation certificate must
    /// verify the attestation trust chain.
    #[must_use]
    pub fn with_verify_attestation_chain(mut self, verify: bool) -> Self {
        self.verify_attestation_chain = verify;
        self
    }

    /// Directories holding trusted attestation CA chain files, used when no
    /// policy overrides them.
    #[must_use]
    pub fn with_trusted_ca_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.trusted_ca_paths = paths;
        self
    }

    #[must_use]
    pub fn prepend_pin(&self) -> bool {
        self.prepend_pin
    }

    #[must_use]
    pub fn auto_resync(&self) -> bool {
        self.auto_resync
    }

    #[must_use]
    pub fn count_window(&self) -> u64 {
        self.count_window
    }

    #[must_use]
    pub fn sync_window(&self) -> u64 {
        self.sync_window
    }

    #[must_use]
    pub fn challenge_validity_seconds(&self) -> i64 {
        self.challenge_validity_seconds
    }

    #[must_use]
    pub fn offline_otp_count(&self) -> usize {
        self.offline_otp_count
    }

    #[must_use]
    pub fn default_otp_length(&self) -> usize {
        self.default_otp_length
    }

    #[must_use]
    pub fn verify_attestation_chain(&self) -> bool {
        self.verify_attestation_chain
    }

    #[must_use]
    pub fn trusted_ca_paths(&self) -> &[PathBuf] {
        &self.trusted_ca_paths
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
