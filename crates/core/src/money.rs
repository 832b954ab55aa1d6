//! Decimal money rules for bill totals.
//!
//! Totals are fixed-point decimals: at most 10 integer digits, exactly two
//! fractional digits, never negative.

use rust_decimal::Decimal;

use crate::error::{DomainError, RejectionCode};

/// Two fractional digits everywhere a total is stored or compared.
pub const FRACTION_DIGITS: u32 = 2;

/// Exclusive upper bound: 10 integer digits.
const LIMIT: Decimal = Decimal::from_parts(0x540B_E400, 0x2, 0, false, 0); // 10^10

/// Validate a declared total and normalize it to two fractional digits.
///
/// Declared totals with more than two fractional digits are rejected rather
/// than silently rounded; only OCR-extracted totals get rounded
/// ([`round_extracted`]).
pub fn validate_total(value: Decimal) -> Result<Decimal, DomainError> {
    if value.is_sign_negative() {
        return Err(DomainError::rejected(
            RejectionCode::TotalOutOfRange,
            "total must not be negative",
        ));
    }
    if value >= LIMIT {
        return Err(DomainError::rejected(
            RejectionCode::TotalOutOfRange,
            "total exceeds 10 integer digits",
        ));
    }
    if value.round_dp(FRACTION_DIGITS) != value {
        return Err(DomainError::rejected(
            RejectionCode::TotalOutOfRange,
            "total has more than two fractional digits",
        ));
    }
    let mut normalized = value;
    normalized.rescale(FRACTION_DIGITS);
    Ok(normalized)
}

/// Banker's rounding (midpoint-nearest-even) to two places for totals
/// extracted by OCR; `round_dp` uses that strategy by default.
pub fn round_extracted(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp(FRACTION_DIGITS);
    rounded.rescale(FRACTION_DIGITS);
    rounded
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn limit_constant_is_ten_digits() {
        assert_eq!(LIMIT, dec!(10000000000));
    }

    #[test]
    fn validates_and_normalizes_scale() {
        assert_eq!(validate_total(dec!(150)).unwrap(), dec!(150.00));
        assert_eq!(validate_total(dec!(0.5)).unwrap(), dec!(0.50));
        assert_eq!(validate_total(dec!(9999999999.99)).unwrap(), dec!(9999999999.99));
    }

    #[test]
    fn rejects_negative_oversized_and_overscaled() {
        assert!(validate_total(dec!(-0.01)).is_err());
        assert!(validate_total(dec!(10000000000)).is_err());
        assert!(validate_total(dec!(1.005)).is_err());
    }

    #[test]
    fn extracted_totals_round_half_to_even() {
        assert_eq!(round_extracted(dec!(2.675)), dec!(2.68));
        assert_eq!(round_extracted(dec!(2.665)), dec!(2.66));
        assert_eq!(round_extracted(dec!(2.5)), dec!(2.50));
    }
}
