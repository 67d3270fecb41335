//! Minimal Kubernetes resource quantity arithmetic.
//!
//! `k8s-openapi` carries quantities as opaque strings; the template builder needs to add and
//! subtract them, so they are parsed into integers here (bytes, counts or millicores).

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity {value:?}")]
    Invalid { value: String },
    #[error("quantity {value:?} is out of range")]
    Overflow { value: String },
}

/// Splits `value` into its numeric part and a scale `(numerator, denominator)`.
fn split(value: &str) -> Result<(&str, i128, i128), QuantityError> {
    let invalid = || QuantityError::Invalid {
        value: value.to_string(),
    };
    let end = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(end);
    if number.is_empty() {
        return Err(invalid());
    }
    let (num, den) = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        exp if exp.starts_with(['e', 'E']) => {
            let power: u32 = exp[1..].parse().map_err(|_| invalid())?;
            (10_i128.checked_pow(power).ok_or_else(invalid)?, 1)
        }
        _ => return Err(invalid()),
    };
    Ok((number, num, den))
}

/// Parses a quantity scaled by `unit` (1 for base units, 1000 for milli-units), rounding up.
fn parse_scaled(value: &str, unit: i128) -> Result<i64, QuantityError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(QuantityError::Empty);
    }
    let (number, num, den) = split(value)?;
    let invalid = || QuantityError::Invalid {
        value: value.to_string(),
    };
    let (negative, digits) = match number.as_bytes()[0] {
        b'-' => (true, &number[1..]),
        b'+' => (false, &number[1..]),
        _ => (false, number),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if (whole.is_empty() && fraction.is_empty())
        || !whole.bytes().all(|b| b.is_ascii_digit())
        || !fraction.bytes().all(|b| b.is_ascii_digit())
        || fraction.len() > 18
    {
        return Err(invalid());
    }
    let overflow = || QuantityError::Overflow {
        value: value.to_string(),
    };
    let fraction_scale = 10_i128.pow(fraction.len() as u32);
    let mantissa: i128 = format!("{whole}{fraction}").parse().map_err(|_| overflow())?;
    let numerator = mantissa
        .checked_mul(num)
        .and_then(|n| n.checked_mul(unit))
        .ok_or_else(overflow)?;
    let denominator = den * fraction_scale;
    let mut scaled = numerator / denominator;
    if numerator % denominator != 0 {
        scaled += 1;
    }
    if negative {
        scaled = -scaled;
    }
    i64::try_from(scaled).map_err(|_| overflow())
}

/// Value in base units (bytes, counts, cores), rounded up.
pub fn parse_value(value: &str) -> Result<i64, QuantityError> {
    parse_scaled(value, 1)
}

/// Value in thousandths of the base unit, rounded up.
pub fn parse_milli_value(value: &str) -> Result<i64, QuantityError> {
    parse_scaled(value, 1000)
}

pub fn value(quantity: &Quantity) -> Result<i64, QuantityError> {
    parse_value(&quantity.0)
}

pub fn milli_value(quantity: &Quantity) -> Result<i64, QuantityError> {
    parse_milli_value(&quantity.0)
}

/// A plain integer quantity.
pub fn from_value(value: i64) -> Quantity {
    Quantity(value.to_string())
}

/// A quantity given in milli-units; whole values are written without a suffix.
pub fn from_milli_value(milli: i64) -> Quantity {
    if milli % 1000 == 0 {
        Quantity((milli / 1000).to_string())
    } else {
        Quantity(format!("{milli}m"))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn binary_and_decimal_suffixes() {
        assert_eq!(parse_value("200Mi"), Ok(200 * 1024 * 1024));
        assert_eq!(parse_value("1Gi"), Ok(1 << 30));
        assert_eq!(parse_value("3G"), Ok(3_000_000_000));
        assert_eq!(parse_value("1048576"), Ok(1_048_576));
        assert_eq!(parse_value("1.5Ki"), Ok(1536));
        assert_eq!(parse_value("1e3"), Ok(1000));
    }

    #[test]
    fn millicores() {
        assert_eq!(parse_milli_value("1000m"), Ok(1000));
        assert_eq!(parse_milli_value("0.5"), Ok(500));
        assert_eq!(parse_milli_value("2"), Ok(2000));
        assert_eq!(parse_value("1500m"), Ok(2));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_value(""), Err(QuantityError::Empty));
        assert!(matches!(parse_value("ten"), Err(QuantityError::Invalid { .. })));
        assert!(matches!(parse_value("10Xi"), Err(QuantityError::Invalid { .. })));
        assert!(matches!(parse_value("."), Err(QuantityError::Invalid { .. })));
    }

    #[test]
    fn formatting() {
        assert_eq!(from_milli_value(7000), Quantity("7".into()));
        assert_eq!(from_milli_value(1500), Quantity("1500m".into()));
        assert_eq!(value(&from_value(-1)), Ok(-1));
    }
}
