//! Counter-based OTP token (RFC 4226).

use crate::token::{CheckContext, ClassInfo, TokenData, TokenVariant};

pub struct HotpToken;

impl TokenVariant for HotpToken {
    fn token_type(&self) -> &'static str {
        "hotp"
    }

    fn serial_prefix(&self) -> &'static str {
        "OATH"
    }

    fn class_info(&self) -> ClassInfo {
        ClassInfo {
            token_type: "hotp",
            title: "HOTP Event Token",
            description: "Event-based one-time passwords following RFC 4226.",
            policy_actions: &["hotp_hashlib", "hotp_otplen"],
        }
    }

    /// Scan the look-ahead window starting at the token counter (or the
    /// explicit `counter` override). A match moves the counter past the
    /// matched value, so every OTP authenticates at most once.
    fn check_otp(
        &self,
        data: &mut TokenData,
        otp: &str,
        counter: Option<u64>,
        ctx: &CheckContext<'_>,
    ) -> Option<u64> {
        let start = counter.unwrap_or(data.counter);
        let window = ctx.config.count_window().max(1);
        let matched = data.hmac_otp().check(otp, start, window, false)?;
        data.counter = matched + 1;
        Some(matched)
    }
}
