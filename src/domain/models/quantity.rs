//! Resource quantities (`100m`, `1.5Gi`, `2e3`)
//!
//! Quantities are kept as an exact rational `numerator / denominator` so that
//! converting to milli-units never suffers from binary floating point error.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantities must match the regular expression '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$': {0}")]
    Format(String),

    #[error("quantity is too large: {0}")]
    Overflow(String),
}

/// Parsed resource quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity {
    numerator: i128,
    denominator: i128,
}

impl Quantity {
    /// Value in thousandths of a unit, rounded up (away from zero for positive values)
    pub fn milli_value(&self) -> i64 {
        let scaled = self.numerator.saturating_mul(1000);
        let mut milli = scaled / self.denominator;
        if scaled % self.denominator > 0 {
            milli += 1;
        }
        i64::try_from(milli).unwrap_or(if milli < 0 { i64::MIN } else { i64::MAX })
    }

    /// Value in whole units, rounded up
    pub fn value(&self) -> i64 {
        let mut whole = self.numerator / self.denominator;
        if self.numerator % self.denominator > 0 {
            whole += 1;
        }
        i64::try_from(whole).unwrap_or(if whole < 0 { i64::MIN } else { i64::MAX })
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format = || QuantityError::Format(s.to_string());
        let overflow = || QuantityError::Overflow(s.to_string());

        let text = s.trim();
        let (negative, text) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };

        let split = text
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(text.len());
        let (number, suffix) = text.split_at(split);
        if number.is_empty() || number == "." || number.matches('.').count() > 1 {
            return Err(format());
        }

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        let digits = format!("{whole}{fraction}");
        let mut numerator: i128 = digits.parse().map_err(|_| overflow())?;
        let mut denominator: i128 = checked_pow(10, fraction.len()).ok_or_else(overflow)?;

        let (mul, div) = suffix_scale(suffix).ok_or_else(format)?;
        numerator = numerator.checked_mul(mul).ok_or_else(overflow)?;
        denominator = denominator.checked_mul(div).ok_or_else(overflow)?;

        if negative {
            numerator = -numerator;
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.numerator % self.denominator == 0 {
            write!(f, "{}", self.numerator / self.denominator)
        } else {
            write!(f, "{}m", self.milli_value())
        }
    }
}

fn checked_pow(base: i128, exp: usize) -> Option<i128> {
    let exp = u32::try_from(exp).ok()?;
    base.checked_pow(exp)
}

/// Multiplier and divisor implied by a quantity suffix
fn suffix_scale(suffix: &str) -> Option<(i128, i128)> {
    let binary = |power: u32| Some((1i128 << power, 1));
    let decimal = |power: usize| checked_pow(10, power).map(|m| (m, 1));
    match suffix {
        "" => Some((1, 1)),
        "n" => Some((1, 1_000_000_000)),
        "u" => Some((1, 1_000_000)),
        "m" => Some((1, 1000)),
        "k" => decimal(3),
        "M" => decimal(6),
        "G" => decimal(9),
        "T" => decimal(12),
        "P" => decimal(15),
        "E" => decimal(18),
        "Ki" => binary(10),
        "Mi" => binary(20),
        "Gi" => binary(30),
        "Ti" => binary(40),
        "Pi" => binary(50),
        "Ei" => binary(60),
        _ => {
            let exp = suffix.strip_prefix(['e', 'E'])?;
            let exp: i32 = exp.parse().ok()?;
            let power = usize::try_from(exp.unsigned_abs()).ok()?;
            let factor = checked_pow(10, power)?;
            if exp >= 0 {
                Some((factor, 1))
            } else {
                Some((1, factor))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn milli(s: &str) -> i64 {
        s.parse::<Quantity>().unwrap().milli_value()
    }

    #[test]
    fn test_milli_values() {
        assert_eq!(milli("100m"), 100);
        assert_eq!(milli("1"), 1000);
        assert_eq!(milli("0.1"), 100);
        assert_eq!(milli("1.5"), 1500);
        assert_eq!(milli("1Ki"), 1_024_000);
        assert_eq!(milli("128Mi"), 134_217_728_000);
        assert_eq!(milli("1k"), 1_000_000);
        assert_eq!(milli("2e3"), 2_000_000);
        assert_eq!(milli("5e-3"), 5);
    }

    #[test]
    fn test_milli_value_rounds_up() {
        assert_eq!(milli("0.0001"), 1);
        assert_eq!(milli("1n"), 1);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("abc".parse::<Quantity>().is_err());
        assert!("1.2.3".parse::<Quantity>().is_err());
        assert!("12Qi".parse::<Quantity>().is_err());
        assert!("".parse::<Quantity>().is_err());
    }

    #[test]
    fn test_value_rounds_up() {
        assert_eq!("1500m".parse::<Quantity>().unwrap().value(), 2);
        assert_eq!("2".parse::<Quantity>().unwrap().value(), 2);
    }

    proptest! {
        #[test]
        fn prop_integer_milli_cores(n in 0i64..1_000_000) {
            prop_assert_eq!(milli(&format!("{n}m")), n);
            prop_assert_eq!(milli(&n.to_string()), n * 1000);
        }
    }
}
