//! Exact fixed-point numbers for scaled register values.

use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// `raw / divisor`, kept exactly.
///
/// Registers carry integers with a fixed divisor (10, 100, 1000, sometimes
/// something odd); converting to `f64` on the hot path would make the
/// round trip lossy, so the pair is kept as is and only compared by value.
/// `raw` is wide enough for any unsigned 64-bit register.
#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    raw: i128,
    divisor: u32,
}

/// Parsed values are capped at the magnitude of the widest register.
const MAX_PARSED_MAGNITUDE: i128 = u64::MAX as i128;

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl Decimal {
    pub fn new(raw: i128, divisor: u32) -> Self {
        Self {
            raw,
            divisor: divisor.max(1),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self::new(value as i128, 1)
    }

    pub fn raw(&self) -> i128 {
        self.raw
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    /// Nearest `f64`. Lossy for most divisors.
    pub fn to_f64(&self) -> f64 {
        self.raw as f64 / self.divisor as f64
    }

    /// Express this value as an integer count of `1/divisor` units.
    ///
    /// Fails when the conversion would drop precision.
    pub fn rescale(&self, divisor: u32) -> Result<i128> {
        let numerator = self
            .raw
            .checked_mul(divisor.max(1) as i128)
            .ok_or_else(|| Error::invalid(format!("{self} is too large")))?;
        let denominator = self.divisor as i128;
        if numerator % denominator != 0 {
            return Err(Error::invalid(format!(
                "{self} is not representable in steps of 1/{divisor}"
            )));
        }
        Ok(numerator / denominator)
    }

    fn power_of_ten_digits(&self) -> Option<usize> {
        let mut d = self.divisor;
        let mut digits = 0;
        while d > 1 {
            if d % 10 != 0 {
                return None;
            }
            d /= 10;
            digits += 1;
        }
        Some(digits)
    }

    /// The value as `(numerator, digits)` with `digits` decimal places, when
    /// it has a terminating decimal expansion.
    fn terminating(&self) -> Option<(u128, usize)> {
        let magnitude = self.raw.unsigned_abs();
        if let Some(digits) = self.power_of_ten_digits() {
            return Some((magnitude, digits));
        }
        let common = gcd(magnitude, self.divisor as u128);
        let (numerator, mut rest) = (magnitude / common, self.divisor as u128 / common);
        // 10^k / denominator, grown one factor of two or five at a time
        let mut factor = 1u128;
        let mut digits = 0;
        while rest > 1 {
            match (rest % 2 == 0, rest % 5 == 0) {
                (true, true) => rest /= 10,
                (true, false) => {
                    rest /= 2;
                    factor *= 5;
                }
                (false, true) => {
                    rest /= 5;
                    factor *= 2;
                }
                (false, false) => return None,
            }
            digits += 1;
        }
        Some((numerator.checked_mul(factor)?, digits))
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.divisor as i128, other.divisor as i128);
        // whole parts first, then the fractions; neither product can overflow
        self.raw
            .div_euclid(a)
            .cmp(&other.raw.div_euclid(b))
            .then_with(|| (self.raw.rem_euclid(a) * b).cmp(&(other.raw.rem_euclid(b) * a)))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.raw < 0 { "-" } else { "" };
        match self.terminating() {
            Some((magnitude, 0)) => write!(f, "{sign}{magnitude}"),
            Some((magnitude, digits)) => {
                let unit = 10u128.pow(digits as u32);
                write!(
                    f,
                    "{sign}{}.{:0width$}",
                    magnitude / unit,
                    magnitude % unit,
                    width = digits
                )
            }
            None => write!(f, "{}/{}", self.raw, self.divisor),
        }
    }
}

impl FromStr for Decimal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = || Error::invalid(format!("'{s}' is not a decimal number"));
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(bad());
        }
        if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
            return Err(bad());
        }
        let digits = frac_part.len() as u32;
        if digits > 9 {
            return Err(bad());
        }
        let divisor = 10u32.pow(digits);
        let mut raw: i128 = 0;
        for c in int_part.chars().chain(frac_part.chars()) {
            raw = raw
                .checked_mul(10)
                .and_then(|r| r.checked_add(c as i128 - '0' as i128))
                .filter(|r| *r <= MAX_PARSED_MAGNITUDE)
                .ok_or_else(bad)?;
        }
        Ok(Decimal::new(if negative { -raw } else { raw }, divisor))
    }
}

impl Serialize for Decimal {
    /// A JSON number when the value has a finite decimal expansion, otherwise
    /// the exact `raw/divisor` text.
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.terminating() {
            Some(_) => serializer.serialize_f64(self.to_f64()),
            None => serializer.collect_str(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1234, 10, "123.4")]
    #[case(-5, 100, "-0.05")]
    #[case(3000, 1, "3000")]
    #[case(1000, 1000, "1.000")]
    #[case(0, 10, "0.0")]
    #[case(1, 4, "0.25")]
    #[case(-3, 8, "-0.375")]
    #[case(6, 3, "2")]
    #[case(1, 3, "1/3")]
    #[case(-2, 7, "-2/7")]
    fn test_display(#[case] raw: i128, #[case] divisor: u32, #[case] expected: &str) {
        assert_eq!(Decimal::new(raw, divisor).to_string(), expected);
    }

    #[test]
    fn test_non_decimal_divisor_serializes_exactly() {
        let third = serde_json::to_value(Decimal::new(1, 3)).unwrap();
        assert_eq!(third, serde_json::json!("1/3"));
        let quarter = serde_json::to_value(Decimal::new(1, 4)).unwrap();
        assert_eq!(quarter, serde_json::json!(0.25));
    }

    #[test]
    fn test_equality_across_divisors() {
        assert_eq!(Decimal::new(1234, 10), Decimal::new(123400, 1000));
        assert_ne!(Decimal::new(1234, 10), Decimal::new(1235, 10));
        assert!(Decimal::new(-1, 10) < Decimal::new(0, 1));
        assert!(Decimal::new(1, 3) < Decimal::new(34, 100));
        assert!(Decimal::new(-1, 3) > Decimal::new(-34, 100));
    }

    #[test]
    fn test_ordering_at_the_top_of_the_range() {
        let max = Decimal::new(u64::MAX as i128, 1);
        assert!(max > Decimal::new(u64::MAX as i128 - 1, 1));
        assert!(Decimal::new(i128::MAX, 7) > Decimal::new(i128::MAX, 8));
    }

    #[test]
    fn test_parse() {
        assert_eq!("123.4".parse::<Decimal>().unwrap(), Decimal::new(1234, 10));
        assert_eq!("-0.05".parse::<Decimal>().unwrap(), Decimal::new(-5, 100));
        assert_eq!("42".parse::<Decimal>().unwrap(), Decimal::from_integer(42));
        assert_eq!(
            "18446744073709551615".parse::<Decimal>().unwrap(),
            Decimal::new(u64::MAX as i128, 1)
        );
        assert!("18446744073709551616".parse::<Decimal>().is_err());
        assert!("4.2.1".parse::<Decimal>().is_err());
        assert!("abc".parse::<Decimal>().is_err());
        assert!("".parse::<Decimal>().is_err());
    }

    #[test]
    fn test_rescale() {
        assert_eq!(Decimal::new(1234, 10).rescale(100).unwrap(), 12340);
        assert_eq!(Decimal::new(1, 3).rescale(3).unwrap(), 1);
        assert!(Decimal::new(1234, 100).rescale(10).is_err());
        assert!(Decimal::new(i128::MAX, 1).rescale(10).is_err());
    }
}
