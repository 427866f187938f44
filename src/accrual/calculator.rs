//! Pure yield computation
//!
//! `yield = principal * daily_rate * (elapsed / 86400)`, evaluated in
//! 128-bit integer arithmetic and truncated toward zero. Truncation (never
//! rounding up) guarantees the sum of all historical accruals stays at or
//! below the theoretical continuous-yield curve.

use crate::types::{Amount, Rate};

pub const SECONDS_PER_DAY: u64 = 86_400;

/// Yield earned by `principal` at `daily_rate` over `elapsed_secs`.
///
/// Callers are responsible for clamping elapsed time at zero; a negative
/// elapsed window is a clock-skew incident handled before this point.
pub fn accrued_yield(principal: Amount, daily_rate: Rate, elapsed_secs: u64) -> Amount {
    if principal <= Amount::ZERO || daily_rate.is_zero() || elapsed_secs == 0 {
        return Amount::ZERO;
    }

    let numerator =
        (principal.nanos() as u128) * (daily_rate.ppm() as u128) * (elapsed_secs as u128);
    let denominator = 1_000_000u128 * (SECONDS_PER_DAY as u128);
    let nanos = numerator / denominator;

    Amount::from_nanos(nanos.min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_minute_window_on_one_percent_daily() {
        // principal 1000, 1%/day, 300s elapsed:
        // 1000 * 0.01 * (300/86400) = 0.034722222...
        let y = accrued_yield(
            Amount::from_units(1000),
            Rate::from_ppm(10_000),
            300,
        );
        assert_eq!(y.nanos(), 34_722_222);
        assert_eq!(y.to_string(), "0.034722222");
    }

    #[test]
    fn full_day_yields_exact_rate() {
        let y = accrued_yield(
            Amount::from_units(1000),
            Rate::from_ppm(10_000),
            SECONDS_PER_DAY,
        );
        assert_eq!(y, Amount::from_units(10));
    }

    #[test]
    fn zero_inputs_yield_zero() {
        assert!(accrued_yield(Amount::ZERO, Rate::from_ppm(10_000), 300).is_zero());
        assert!(accrued_yield(Amount::from_units(10), Rate::from_ppm(0), 300).is_zero());
        assert!(accrued_yield(Amount::from_units(10), Rate::from_ppm(10_000), 0).is_zero());
    }

    #[test]
    fn tiny_position_rounds_down_to_zero() {
        // 1 nano of principal for 1 second cannot earn a representable amount
        let y = accrued_yield(Amount::from_nanos(1), Rate::from_ppm(10_000), 1);
        assert!(y.is_zero());
    }

    #[test]
    fn split_windows_never_exceed_the_whole() {
        // Truncation means accruing in pieces can only lose dust, never gain
        let principal = Amount::from_nanos(123_456_789_123);
        let rate = Rate::from_ppm(7_777);
        let whole = accrued_yield(principal, rate, 900);
        let pieces = accrued_yield(principal, rate, 300)
            .checked_add(accrued_yield(principal, rate, 300))
            .and_then(|a| a.checked_add(accrued_yield(principal, rate, 300)))
            .unwrap();
        assert!(pieces <= whole);
    }

    #[test]
    fn large_principal_does_not_overflow() {
        let y = accrued_yield(
            Amount::from_nanos(i64::MAX),
            Rate::from_ppm(1_000_000),
            SECONDS_PER_DAY * 365,
        );
        assert!(y.nanos() > 0);
    }
}
