use super::MathError;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Taylor terms past this point vanish below the 28-digit mantissa.
const EXP_SERIES_TERMS: u32 = 48;

/// Deterministic decimal used for every consensus-affecting value.
///
/// Wraps a [`Decimal`] and adds an explicit NaN state. Arithmetic on NaN is an
/// error, comparisons involving NaN are always false.
#[derive(Clone, Copy, Debug)]
pub struct Dec(Option<Decimal>);

pub type MathResult<T> = std::result::Result<T, MathError>;

impl Dec {
    pub const ZERO: Dec = Dec(Some(Decimal::ZERO));
    pub const ONE: Dec = Dec(Some(Decimal::ONE));
    pub const NAN: Dec = Dec(None);

    pub fn new(value: Decimal) -> Self {
        Dec(Some(value))
    }

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn one() -> Self {
        Self::ONE
    }

    pub fn nan() -> Self {
        Self::NAN
    }

    pub fn from_i64(value: i64) -> Self {
        Dec(Some(Decimal::from(value)))
    }

    pub fn from_u64(value: u64) -> Self {
        Dec(Some(Decimal::from(value)))
    }

    pub fn from_u128(value: u128) -> MathResult<Self> {
        Decimal::from_u128(value)
            .map(Dec::new)
            .ok_or(MathError::Overflow("u128 conversion"))
    }

    pub fn from_usize(value: usize) -> MathResult<Self> {
        Decimal::from_usize(value)
            .map(Dec::new)
            .ok_or(MathError::Overflow("usize conversion"))
    }

    /// The underlying decimal, or `MathError::NaN`.
    pub fn value(&self) -> MathResult<Decimal> {
        self.0.ok_or(MathError::NaN)
    }

    pub fn is_nan(&self) -> bool {
        self.0.is_none()
    }

    pub fn is_zero(&self) -> bool {
        matches!(self.0, Some(v) if v.is_zero())
    }

    pub fn is_negative(&self) -> bool {
        matches!(self.0, Some(v) if v.is_sign_negative() && !v.is_zero())
    }

    pub fn is_positive(&self) -> bool {
        matches!(self.0, Some(v) if v.is_sign_positive() && !v.is_zero())
    }

    pub fn add(&self, other: Dec) -> MathResult<Dec> {
        let (a, b) = (self.value()?, other.value()?);
        a.checked_add(b)
            .map(Dec::new)
            .ok_or(MathError::Overflow("add"))
    }

    pub fn sub(&self, other: Dec) -> MathResult<Dec> {
        let (a, b) = (self.value()?, other.value()?);
        a.checked_sub(b)
            .map(Dec::new)
            .ok_or(MathError::Overflow("sub"))
    }

    pub fn mul(&self, other: Dec) -> MathResult<Dec> {
        let (a, b) = (self.value()?, other.value()?);
        a.checked_mul(b)
            .map(Dec::new)
            .ok_or(MathError::Overflow("mul"))
    }

    pub fn quo(&self, other: Dec) -> MathResult<Dec> {
        let (a, b) = (self.value()?, other.value()?);
        if b.is_zero() {
            return Err(MathError::DivisionByZero);
        }
        a.checked_div(b)
            .map(Dec::new)
            .ok_or(MathError::Overflow("quo"))
    }

    pub fn neg(&self) -> MathResult<Dec> {
        Ok(Dec::new(-self.value()?))
    }

    pub fn abs(&self) -> MathResult<Dec> {
        Ok(Dec::new(self.value()?.abs()))
    }

    pub fn sqrt(&self) -> MathResult<Dec> {
        let v = self.value()?;
        if v.is_sign_negative() && !v.is_zero() {
            return Err(MathError::Domain(format!("sqrt of negative value {}", v)));
        }
        v.sqrt()
            .map(Dec::new)
            .ok_or(MathError::Overflow("sqrt"))
    }

    /// e^x with range reduction: e^(n + f) = e^n * e^f, f in [0, 1).
    ///
    /// Large negative exponents underflow to zero rather than failing.
    pub fn exp(&self) -> MathResult<Dec> {
        let x = self.value()?;
        if x.is_zero() {
            return Ok(Dec::ONE);
        }
        if x.is_sign_negative() {
            return match Dec::new(-x).exp() {
                Ok(positive) => Dec::ONE.quo(positive),
                Err(MathError::Overflow(_)) => Ok(Dec::ZERO),
                Err(err) => Err(err),
            };
        }

        let whole = x.trunc();
        let frac = x - whole;
        let n = whole.to_i64().ok_or(MathError::Overflow("exp"))?;

        let mut sum = Decimal::ONE;
        let mut term = Decimal::ONE;
        for k in 1..=EXP_SERIES_TERMS {
            term = term
                .checked_mul(frac)
                .and_then(|t| t.checked_div(Decimal::from(k)))
                .ok_or(MathError::Overflow("exp series"))?;
            if term.is_zero() {
                break;
            }
            sum += term;
        }

        let integral = Decimal::E
            .checked_powi(n)
            .ok_or(MathError::Overflow("exp"))?;
        integral
            .checked_mul(sum)
            .map(Dec::new)
            .ok_or(MathError::Overflow("exp"))
    }

    pub fn ln(&self) -> MathResult<Dec> {
        let v = self.value()?;
        if v <= Decimal::ZERO {
            return Err(MathError::Domain(format!("ln of non-positive value {}", v)));
        }
        v.checked_ln()
            .map(Dec::new)
            .ok_or(MathError::Overflow("ln"))
    }

    pub fn powi(&self, exponent: i64) -> MathResult<Dec> {
        self.value()?
            .checked_powi(exponent)
            .map(Dec::new)
            .ok_or(MathError::Overflow("powi"))
    }

    pub fn floor(&self) -> MathResult<Dec> {
        Ok(Dec::new(self.value()?.floor()))
    }

    pub fn ceil(&self) -> MathResult<Dec> {
        Ok(Dec::new(self.value()?.ceil()))
    }

    pub fn to_i64(&self) -> MathResult<i64> {
        self.value()?
            .to_i64()
            .ok_or(MathError::Overflow("i64 conversion"))
    }

    pub fn to_usize(&self) -> MathResult<usize> {
        self.value()?
            .to_usize()
            .ok_or(MathError::Overflow("usize conversion"))
    }

    pub fn gt(&self, other: Dec) -> bool {
        matches!(self.partial_cmp(&other), Some(Ordering::Greater))
    }

    pub fn gte(&self, other: Dec) -> bool {
        matches!(
            self.partial_cmp(&other),
            Some(Ordering::Greater | Ordering::Equal)
        )
    }

    pub fn lt(&self, other: Dec) -> bool {
        matches!(self.partial_cmp(&other), Some(Ordering::Less))
    }

    pub fn lte(&self, other: Dec) -> bool {
        matches!(
            self.partial_cmp(&other),
            Some(Ordering::Less | Ordering::Equal)
        )
    }

    pub fn max(self, other: Dec) -> MathResult<Dec> {
        let (a, b) = (self.value()?, other.value()?);
        Ok(Dec::new(a.max(b)))
    }

    pub fn min(self, other: Dec) -> MathResult<Dec> {
        let (a, b) = (self.value()?, other.value()?);
        Ok(Dec::new(a.min(b)))
    }
}

impl Default for Dec {
    fn default() -> Self {
        Dec::ZERO
    }
}

impl From<Decimal> for Dec {
    fn from(value: Decimal) -> Self {
        Dec::new(value)
    }
}

impl PartialEq for Dec {
    fn eq(&self, other: &Self) -> bool {
        match (self.0, other.0) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Dec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => None,
        }
    }
}

impl FromStr for Dec {
    type Err = MathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("nan") {
            return Ok(Dec::NAN);
        }
        let parsed = if trimmed.contains(['e', 'E']) {
            Decimal::from_scientific(trimmed)
        } else {
            Decimal::from_str(trimmed)
        };
        parsed
            .map(Dec::new)
            .map_err(|e| MathError::Parse(format!("{}: {}", trimmed, e)))
    }
}

impl fmt::Display for Dec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{}", v.normalize()),
            None => write!(f, "NaN"),
        }
    }
}

impl Serialize for Dec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Dec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Dec::from_str(&raw).map_err(serde::de::Error::custom)
    }
}
