//! Static-password token: the PIN is the whole credential.

use crate::error::Result;
use crate::token::{
    AuthOutcome, CheckContext, ClassInfo, InitParams, TokenData, TokenVariant,
};

pub struct StaticPassToken;

impl TokenVariant for StaticPassToken {
    fn token_type(&self) -> &'static str {
        "spass"
    }

    fn serial_prefix(&self) -> &'static str {
        "PISP"
    }

    fn class_info(&self) -> ClassInfo {
        ClassInfo {
            token_type: "spass",
            title: "Simple Pass Token",
            description: "A token that authenticates with the PIN alone.",
            policy_actions: &[],
        }
    }

    fn update(
        &self,
        data: &mut TokenData,
        params: &InitParams,
        _ctx: &CheckContext<'_>,
    ) -> Result<()> {
        // No OTP part: the credential split must hand the whole input to
        // the PIN check.
        data.otp_len = 0;
        if let Some(pin) = &params.pin {
            data.set_pin(pin, false);
        }
        Ok(())
    }

    /// The OTP part is empty by construction and always accepted; the PIN
    /// check carries the whole decision.
    fn check_otp(
        &self,
        _data: &mut TokenData,
        _otp: &str,
        _counter: Option<u64>,
        _ctx: &CheckContext<'_>,
    ) -> Option<u64> {
        Some(0)
    }

    fn authenticate(
        &self,
        data: &mut TokenData,
        pass: &str,
        ctx: &CheckContext<'_>,
    ) -> AuthOutcome {
        if !self.check_pin(data, pass, ctx) {
            return AuthOutcome::default();
        }
        AuthOutcome {
            pin_matched: true,
            matched_counter: Some(0),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::token::CheckOptions;

    fn ctx<'a>(config: &'a EngineConfig, options: &'a CheckOptions) -> CheckContext<'a> {
        CheckContext { config, options }
    }

    #[test]
    fn pin_is_the_credential() {
        let config = EngineConfig::new();
        let options = CheckOptions::default();
        let ctx = ctx(&config, &options);

        let mut data = TokenData::new("PISP0001", "spass", None, vec![]);
        let variant = StaticPassToken;
        variant
            .update(
                &mut data,
                &InitParams {
                    pin: Some("geheim".into()),
                    ..InitParams::default()
                },
                &ctx,
            )
            .unwrap();

        assert!(variant.authenticate(&mut data, "geheim", &ctx).success());
        assert!(!variant.authenticate(&mut data, "wrong", &ctx).success());
        assert!(!variant.authenticate(&mut data, "", &ctx).success());
    }

    #[test]
    fn empty_pin_matches_empty_credential() {
        let config = EngineConfig::new();
        let options = CheckOptions::default();
        let ctx = ctx(&config, &options);

        let mut data = TokenData::new("PISP0002", "spass", None, vec![]);
        data.otp_len = 0;
        let variant = StaticPassToken;
        assert!(variant.authenticate(&mut data, "", &ctx).success());
    }
}
