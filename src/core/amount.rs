//! Currency Amounts
//!
//! All currency math runs on `rust_decimal::Decimal`. Floats only appear at
//! the UI boundary and are converted exactly once through [`amount_from_f64`].
//!
//! ## Representation
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Decimal: 96-bit integer mantissa + scale (0..=28)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Exact base-10: 0.1 + 0.2 == 0.3                            │
//! │  Range: ±7.9e28                                             │
//! │  Wire/disk form: canonical string ("1250.5")                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

/// Currency amount.
pub type Amount = Decimal;

// =============================================================================
// ECONOMY CONSTANTS
// =============================================================================

/// Base currency per tap before upgrades.
pub const BASE_PER_CLICK: Amount = Decimal::ONE;

/// Currency per awarded step.
pub const DEFAULT_PER_STEP_YIELD: Amount = Decimal::ONE;

/// Sensor overcount correction: 0.6 = 6 * 10^-1.
pub const DEFAULT_STEP_CORRECTION: Amount = Decimal::from_parts(6, 0, 0, false, 1);

/// Decimal scale of a millisecond count expressed in seconds.
const MILLIS_SCALE: u32 = 3;

// =============================================================================
// CONVERSION
// =============================================================================

/// Convert a UI-supplied float into an amount.
///
/// Returns `None` for NaN, infinities, and values outside the decimal range.
pub fn amount_from_f64(value: f64) -> Option<Amount> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value).map(|d| d.normalize())
}

/// Parse the canonical string form used on the wire and on disk.
pub fn parse_amount(s: &str) -> Option<Amount> {
    s.trim().parse::<Decimal>().ok()
}

/// Canonical string form: normalized, no trailing zeros.
pub fn format_amount(value: Amount) -> String {
    value.normalize().to_string()
}

/// Elapsed milliseconds as a seconds amount (`5000` -> `5.000`).
pub fn seconds_from_millis(millis: i64) -> Amount {
    Decimal::new(millis, MILLIS_SCALE)
}

/// Round half away from zero to a whole step count.
///
/// Negative inputs round to zero.
pub fn round_steps(value: Amount) -> u64 {
    if value.is_sign_negative() {
        return 0;
    }
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .unwrap_or(u64::MAX)
}

/// Larger of two amounts.
#[inline]
pub fn max_amount(a: Amount, b: Amount) -> Amount {
    if a >= b { a } else { b }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correction_constant() {
        assert_eq!(DEFAULT_STEP_CORRECTION, "0.6".parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_amount_from_f64_rejects_non_finite() {
        assert!(amount_from_f64(f64::NAN).is_none());
        assert!(amount_from_f64(f64::INFINITY).is_none());
        assert!(amount_from_f64(f64::NEG_INFINITY).is_none());
        assert_eq!(amount_from_f64(1.25), Some(Decimal::new(125, 2)));
    }

    #[test]
    fn test_parse_and_format() {
        assert_eq!(parse_amount(" 42.50 "), Some(Decimal::new(425, 1)));
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(format_amount(Decimal::new(42500, 3)), "42.5");
        assert_eq!(format_amount(Decimal::new(50000, 3)), "50");
    }

    #[test]
    fn test_seconds_from_millis() {
        assert_eq!(seconds_from_millis(5000), Decimal::from(5));
        assert_eq!(seconds_from_millis(1500), Decimal::new(15, 1));
    }

    #[test]
    fn test_round_steps() {
        assert_eq!(round_steps(Decimal::new(6, 1)), 1);
        assert_eq!(round_steps(Decimal::new(5, 1)), 1);
        assert_eq!(round_steps(Decimal::new(49, 2)), 0);
        assert_eq!(round_steps(Decimal::new(-3, 0)), 0);
        assert_eq!(round_steps(Decimal::from(60)), 60);
    }
}
