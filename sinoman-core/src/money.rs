//! Rupiah amounts in integer minor units (sen).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SinomanError, SinomanResult};

const MINOR_PER_MAJOR: i64 = 100;
const BASIS_POINTS: i128 = 10_000;

/// A monetary amount with two decimal places, stored as minor units.
///
/// Serialized as a decimal string (`"12500.50"`) so no precision is lost in JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(i64);

impl Amount {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Creates an amount from minor units (`150` is `1.50`).
    #[must_use]
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Creates an amount from whole units, or `None` on overflow.
    #[must_use]
    pub const fn from_major(major: i64) -> Option<Self> {
        match major.checked_mul(MINOR_PER_MAJOR) {
            Some(minor) => Some(Self(minor)),
            None => None,
        }
    }

    /// The amount in minor units.
    #[must_use]
    pub const fn minor_units(self) -> i64 {
        self.0
    }

    /// Whether the amount is greater than zero.
    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Whether the amount is less than zero.
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// `self + other`, or `None` on overflow.
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(sum) => Some(Self(sum)),
            None => None,
        }
    }

    /// `self - other`, or `None` on overflow.
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(difference) => Some(Self(difference)),
            None => None,
        }
    }

    /// `basis_points / 10_000` of the amount, rounded half away from zero to the nearest sen.
    ///
    /// `250` basis points is 2.5%. Returns `None` if the result does not fit.
    #[must_use]
    pub fn percentage_bps(self, basis_points: u32) -> Option<Self> {
        let product = i128::from(self.0) * i128::from(basis_points);
        let mut quotient = product / BASIS_POINTS;
        let remainder = product % BASIS_POINTS;
        if remainder.abs() * 2 >= BASIS_POINTS {
            quotient += product.signum();
        }
        i64::try_from(quotient).ok().map(Self)
    }

    /// Renders the amount the way the app shows it: `Rp 12.500,50`, or `Rp 12.500` when there
    /// are no sen.
    #[must_use]
    pub fn to_rupiah(self) -> String {
        let sign = if self.is_negative() { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        let major = group_thousands(magnitude / 100, '.');
        let minor = magnitude % 100;
        if minor == 0 {
            format!("{sign}Rp {major}")
        } else {
            format!("{sign}Rp {major},{minor:02}")
        }
    }
}

fn group_thousands(value: u64, separator: char) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(separator);
        }
        grouped.push(digit);
    }
    grouped
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.is_negative() { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", magnitude / 100, magnitude % 100)
    }
}

impl FromStr for Amount {
    type Err = SinomanError;

    fn from_str(s: &str) -> SinomanResult<Self> {
        let invalid = |reason: &str| SinomanError::invalid_input("amount", format!("`{s}`: {reason}"));

        let trimmed = s.trim();
        let (negative, unsigned) = trimmed
            .strip_prefix('-')
            .map_or((false, trimmed), |rest| (true, rest));
        let (whole, fraction) = unsigned
            .split_once('.')
            .map_or((unsigned, None), |(whole, fraction)| (whole, Some(fraction)));

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("expected a decimal number"));
        }
        let fraction = match fraction {
            None => "",
            Some(f) if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) => {
                return Err(invalid("expected digits after the decimal point"));
            }
            Some(f) if f.len() > 2 => return Err(invalid("at most two decimal places")),
            Some(f) => f,
        };

        let major: i64 = whole.parse().map_err(|_| invalid("amount too large"))?;
        // "5" after the point is 50 sen
        let minor = match fraction.len() {
            0 => 0,
            1 => i64::from(fraction.as_bytes()[0] - b'0') * 10,
            _ => fraction.parse::<i64>().map_err(|_| invalid("invalid sen"))?,
        };

        let magnitude = major
            .checked_mul(MINOR_PER_MAJOR)
            .and_then(|value| value.checked_add(minor))
            .ok_or_else(|| invalid("amount too large"))?;
        Ok(Self(if negative { -magnitude } else { magnitude }))
    }
}

impl TryFrom<String> for Amount {
    type Error = SinomanError;

    fn try_from(value: String) -> SinomanResult<Self> {
        value.parse()
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.to_string()
    }
}
