//! HMAC one-time-password primitives.
//!
//! RFC 4226 generation with dynamic truncation, windowed verification that
//! reports the matched counter, and the round-half-up time-to-counter
//! mapping shared by the time-based token variants.
//!
//! A mismatch is never an error here: [`HmacOtp::check`] returns the matched
//! counter or `None`, so the common "wrong password" path stays cheap.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

/// Hash algorithm backing the HMAC computation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HashAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Parse the persisted `hashlib` token-info value. Unknown values fall
    /// back to SHA-1, the interoperable default of deployed OTP hardware.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha256" => Self::Sha256,
            "sha512" => Self::Sha512,
            _ => Self::Sha1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

/// An HMAC-OTP calculator bound to one secret key.
pub struct HmacOtp<'a> {
    key: &'a [u8],
    digits: usize,
    algorithm: HashAlgorithm,
}

impl<'a> HmacOtp<'a> {
    #[must_use]
    pub fn new(key: &'a [u8], digits: usize, algorithm: HashAlgorithm) -> Self {
        Self {
            key,
            digits,
            algorithm,
        }
    }

    fn hmac(&self, counter: u64) -> Vec<u8> {
        let message = counter.to_be_bytes();
        match self.algorithm {
            HashAlgorithm::Sha1 => {
                let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(self.key)
                    .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
                mac.update(&message);
                mac.finalize().into_bytes().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(self.key)
                    .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
                mac.update(&message);
                mac.finalize().into_bytes().to_vec()
            }
            HashAlgorithm::Sha512 => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(self.key)
                    .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
                mac.update(&message);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Compute the OTP value for `counter`, zero-padded to the configured
    /// number of digits (RFC 4226 dynamic truncation).
    #[must_use]
    pub fn generate(&self, counter: u64) -> String {
        let digest = self.hmac(counter);
        let offset = usize::from(digest[digest.len() - 1] & 0x0f);
        let binary = (u64::from(digest[offset]) & 0x7f) << 24
            | u64::from(digest[offset + 1]) << 16
            | u64::from(digest[offset + 2]) << 8
            | u64::from(digest[offset + 3]);
        let otp = binary % 10u64.pow(self.digits as u32);
        format!("{otp:0width$}", width = self.digits)
    }

    /// Scan a bounded window for `otp`, starting at `counter`.
    ///
    /// The forward scan covers `counter..counter + window`; with `symmetric`
    /// the range `counter - window..counter` is additionally searched.
    /// Returns the first matching counter, or `None` when the value is not
    /// in range.
    #[must_use]
    pub fn check(&self, otp: &str, counter: u64, window: u64, symmetric: bool) -> Option<u64> {
        if otp.len() != self.digits {
            return None;
        }
        let start = if symmetric {
            counter.saturating_sub(window)
        } else {
            counter
        };
        let end = counter.saturating_add(window);
        (start..end).find(|&candidate| self.generate(candidate) == otp)
    }
}

/// Map a point in time (seconds, fractional allowed) to an OTP counter for
/// the given time step.
///
/// The `+ 0.5` before truncation rounds half-up, so a token does not drift
/// systematically early or late across step boundaries.
#[must_use]
pub fn time_to_counter(seconds: f64, time_step: u64) -> u64 {
    if time_step == 0 {
        return 0;
    }
    let counter = seconds / time_step as f64 + 0.5;
    if counter <= 0.0 {
        0
    } else {
        counter as u64
    }
}

/// Inverse of [`time_to_counter`]: the nominal timestamp of a counter value.
#[must_use]
pub fn counter_to_time(counter: u64, time_step: u64) -> u64 {
    counter.saturating_mul(time_step)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // RFC 4226 appendix D test secret and values.
    const RFC_SECRET: &[u8] = b"12345678901234567890";
    const RFC_VALUES: [&str; 10] = [
        "755224", "287082", "359152", "969429", "338314", "254676", "287922", "162583", "399871",
        "520489",
    ];

    #[test]
    fn generate_matches_rfc4226_vectors() {
        let hotp = HmacOtp::new(RFC_SECRET, 6, HashAlgorithm::Sha1);
        for (counter, expected) in RFC_VALUES.iter().enumerate() {
            assert_eq!(hotp.generate(counter as u64), *expected);
        }
    }

    #[test]
    fn generate_then_check_round_trips() {
        let hotp = HmacOtp::new(b"another-secret-key", 8, HashAlgorithm::Sha256);
        let otp = hotp.generate(42);
        assert_eq!(hotp.check(&otp, 42, 1, false), Some(42));
    }

    #[test]
    fn check_scans_forward_window() {
        let hotp = HmacOtp::new(RFC_SECRET, 6, HashAlgorithm::Sha1);
        assert_eq!(hotp.check("520489", 0, 10, false), Some(9));
        assert_eq!(hotp.check("520489", 0, 9, false), None);
    }

    #[test]
    fn check_symmetric_scans_backwards() {
        let hotp = HmacOtp::new(RFC_SECRET, 6, HashAlgorithm::Sha1);
        assert_eq!(hotp.check("755224", 5, 5, false), None);
        assert_eq!(hotp.check("755224", 5, 5, true), Some(0));
    }

    #[test]
    fn mismatch_is_none_not_error() {
        let hotp = HmacOtp::new(RFC_SECRET, 6, HashAlgorithm::Sha1);
        assert_eq!(hotp.check("000000", 0, 10, false), None);
        // wrong length short-circuits
        assert_eq!(hotp.check("75522", 0, 10, false), None);
    }

    #[test]
    fn sha512_differs_from_sha1() {
        let sha1 = HmacOtp::new(RFC_SECRET, 6, HashAlgorithm::Sha1);
        let sha512 = HmacOtp::new(RFC_SECRET, 6, HashAlgorithm::Sha512);
        assert_ne!(sha1.generate(0), sha512.generate(0));
    }

    #[test]
    fn time_counter_rounds_half_up() {
        // 29 s into a 60 s step rounds down, 30 s rounds up.
        assert_eq!(time_to_counter(29.0, 60), 0);
        assert_eq!(time_to_counter(30.0, 60), 1);
        assert_eq!(time_to_counter(89.0, 60), 1);
        assert_eq!(time_to_counter(90.0, 60), 2);
        assert_eq!(time_to_counter(0.0, 60), 0);
        assert_eq!(time_to_counter(-5.0, 60), 0);
    }

    #[test]
    fn hash_algorithm_parsing() {
        assert_eq!(HashAlgorithm::from_name("SHA256"), HashAlgorithm::Sha256);
        assert_eq!(HashAlgorithm::from_name("sha512"), HashAlgorithm::Sha512);
        assert_eq!(HashAlgorithm::from_name("bogus"), HashAlgorithm::Sha1);
    }
}
