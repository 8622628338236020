//! Time-based password token with a long, configurable step.
//!
//! Unlike a classic 30-second TOTP, the step is typically hours or a full
//! day and the value stays valid (and reusable) for the whole step. The
//! counter is derived from the clock on every check; the stored counter only
//! records the last accepted step.
//!
//! With auto-resync enabled, two consecutive step values presented one after
//! the other re-anchor a drifted device clock: the first match inside the
//! sync window is remembered as a probe, the second must be its direct
//! successor and the resulting clock offset is persisted as `timeShift`.

use crate::error::{Error, Result};
use crate::otp::time_to_counter;
use crate::token::{
    base_update, CheckContext, ClassInfo, InitParams, TokenData, TokenVariant,
};

const DEFAULT_TIME_STEP: u64 = 86_400;

/// Parse a time step like `"60"`, `"30m"`, `"8h"` or `"1d"` into seconds.
///
/// # Errors
/// `Error::Parameter` for an empty, non-numeric or zero step.
pub fn parse_time_step(value: &str) -> Result<u64> {
    let value = value.trim();
    let (number, unit) = match value.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&value[..value.len() - 1], c.to_ascii_lowercase()),
        _ => (value, 's'),
    };
    let number: u64 = number
        .trim()
        .parse()
        .map_err(|_| Error::param(format!("Invalid timeStep: {value}")))?;
    let seconds = match unit {
        's' => number,
        'm' => number * 60,
        'h' => number * 3600,
        'd' => number * 86_400,
        _ => return Err(Error::param(format!("Invalid timeStep unit: {value}"))),
    };
    if seconds == 0 {
        return Err(Error::param("timeStep must not be zero"));
    }
    Ok(seconds)
}

pub struct DayPasswordToken;

impl DayPasswordToken {
    fn time_step(data: &TokenData) -> u64 {
        data.info_value("timeStep")
            .and_then(|v| parse_time_step(v).ok())
            .unwrap_or(DEFAULT_TIME_STEP)
    }

    /// Second stage of a failed direct check: scan the sync window and
    /// pair the hit with a previously remembered probe.
    fn autosync(
        &self,
        data: &mut TokenData,
        otp: &str,
        now: f64,
        step: u64,
        ctx: &CheckContext<'_>,
    ) -> Option<u64> {
        let sync_window = ctx.config.sync_window();
        let anchor = time_to_counter(now + data.time_shift(), step);
        let probe = data
            .info_value("otp1c")
            .and_then(|v| v.parse::<u64>().ok());

        let Some(matched) = data.hmac_otp().check(otp, anchor, sync_window, false) else {
            data.remove_info("otp1c");
            return None;
        };
        if matched <= data.counter {
            data.remove_info("otp1c");
            return None;
        }
        match probe {
            Some(otp1c) if matched == otp1c + 1 => {
                data.remove_info("otp1c");
                data.counter = matched;
                // Persist the device clock offset in seconds.
                let drift = (matched as f64 - time_to_counter(now, step) as f64) * step as f64;
                data.set_time_shift(drift);
                Some(matched)
            }
            Some(_) => {
                // Non-consecutive pair: the probe is burned, resync starts over.
                data.remove_info("otp1c");
                None
            }
            None => {
                data.set_info("otp1c", matched.to_string());
                None
            }
        }
    }
}

impl TokenVariant for DayPasswordToken {
    fn token_type(&self) -> &'static str {
        "daypassword"
    }

    fn serial_prefix(&self) -> &'static str {
        "DYPW"
    }

    fn class_info(&self) -> ClassInfo {
        ClassInfo {
            token_type: "daypassword",
            title: "Day Password Token",
            description: "Time-based passwords with a multi-hour step, reusable within the step.",
            policy_actions: &["daypassword_timestep", "daypassword_hashlib"],
        }
    }

    fn update(
        &self,
        data: &mut TokenData,
        params: &InitParams,
        ctx: &CheckContext<'_>,
    ) -> Result<()> {
        if let Some(step) = &params.time_step {
            let seconds = parse_time_step(step)?;
            data.set_info("timeStep", seconds.to_string());
        } else if data.info_value("timeStep").is_none() {
            data.set_info("timeStep", DEFAULT_TIME_STEP.to_string());
        }
        if let Some(shift) = params.time_shift {
            data.set_time_shift(shift);
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
        let step = Self::time_step(data);
        let now = ctx.server_time();
        let anchor = counter.unwrap_or_else(|| time_to_counter(now + data.time_shift(), step));
        if let Some(matched) = data.hmac_otp().check(otp, anchor, 1, false) {
            data.remove_info("otp1c");
            // Reusable within the step: the counter records the step, it
            // does not advance past it.
            data.counter = matched;
            return Some(matched);
        }
        if ctx.config.auto_resync() {
            return self.autosync(data, otp, now, step, ctx);
        }
        None
    }

    fn get_otp(&self, data: &TokenData, current_time: Option<f64>) -> Result<String> {
        let step = Self::time_step(data);
        let now = current_time.unwrap_or_else(|| chrono::Utc::now().timestamp() as f64);
        let counter = time_to_counter(now + data.time_shift(), step);
        Ok(data.hmac_otp().generate(counter))
    }

    fn get_multi_otp(
        &self,
        data: &TokenData,
        count: usize,
        current_time: Option<f64>,
    ) -> Result<std::collections::BTreeMap<u64, String>> {
        let step = Self::time_step(data);
        let now = current_time.unwrap_or_else(|| chrono::Utc::now().timestamp() as f64);
        let start = time_to_counter(now + data.time_shift(), step);
        let hmac = data.hmac_otp();
        Ok((start..start + count as u64)
            .map(|c| (c, hmac.generate(c)))
            .collect())
    }
}
