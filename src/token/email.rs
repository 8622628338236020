//! Email token: challenge-response delivery of an event-based OTP.
//!
//! The PIN part of the credential opens a challenge; the OTP for the
//! current counter is handed to an out-of-band delivery channel and the
//! user answers the challenge with it. Message transport is not this
//! crate's concern, so the challenge carries the recipient address as its
//! data for the caller's gateway.

use crate::error::{Error, Result};
use crate::token::{
    base_update, AuthMode, CheckContext, ClassInfo, InitParams, IssuedChallenge, TokenData,
    TokenVariant,
};

const CHALLENGE_MESSAGE: &str = "Enter the OTP from your email:";

pub struct EmailToken;

impl TokenVariant for EmailToken {
    fn token_type(&self) -> &'static str {
        "email"
    }

    fn serial_prefix(&self) -> &'static str {
        "PIEM"
    }

    fn class_info(&self) -> ClassInfo {
        ClassInfo {
            token_type: "email",
            title: "EMail Token",
            description: "Sends a one-time password to the user's email address.",
            policy_actions: &["email_challenge_text"],
        }
    }

    fn modes(&self) -> &'static [AuthMode] {
        &[AuthMode::Challenge]
    }

    fn update(
        &self,
        data: &mut TokenData,
        params: &InitParams,
        ctx: &CheckContext<'_>,
    ) -> Result<()> {
        if let Some(email) = &params.email {
            data.set_info("email", email);
        }
        if data.info_value("email").is_none() {
            return Err(Error::param("Missing email address for email token"));
        }
        base_update(data, params, ctx.config)
    }

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

    fn create_challenge(
        &self,
        data: &mut TokenData,
        _transaction_id: &str,
        _ctx: &CheckContext<'_>,
    ) -> Result<IssuedChallenge> {
        let recipient = data
            .info_value("email")
            .ok_or_else(|| Error::param("Missing email address for email token"))?
            .to_string();
        Ok(IssuedChallenge {
            message: CHALLENGE_MESSAGE.to_string(),
            data: Some(recipient),
        })
    }
}
