//! Scaled-decimal arithmetic on a `BigInt` mantissa.
//!
//! A [`BigDec`] is `mantissa · 10^-scale` with a fixed fractional scale per
//! value. Products and quotients are reduced back to the value's scale with
//! banker's rounding (round half to even); Newton iterations divide with
//! round-toward-zero so every update contracts.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::{Add, Neg, Sub};

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Signed, ToPrimitive, Zero};

use crate::error::MathError;

/// Default fractional scale of the high-accuracy pipeline.
pub const DEFAULT_SCALE: u32 = 384;

/// Extra fractional digits carried through Newton iterations before the
/// final half-even rounding back to the requested scale.
const GUARD_DIGITS: u32 = 4;

fn pow10(scale: u32) -> BigInt {
    BigInt::from(10).pow(scale)
}

/// Quotient of `numerator / denominator` rounded half to even.
fn round_half_even(numerator: &BigInt, denominator: &BigInt) -> BigInt {
    debug_assert!(!denominator.is_zero());
    let (numerator, denominator) = if denominator.is_negative() {
        (-numerator, -denominator)
    } else {
        (numerator.clone(), denominator.clone())
    };
    let (quotient, remainder) = numerator.div_rem(&denominator);
    if remainder.is_zero() {
        return quotient;
    }
    let away = match (remainder.abs() * BigInt::from(2)).cmp(&denominator) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => quotient.is_odd(),
    };
    if !away {
        return quotient;
    }
    if numerator.is_negative() {
        quotient - 1
    } else {
        quotient + 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BigDec {
    units: BigInt,
    scale: u32,
}

impl BigDec {
    /// Zero at the given scale.
    pub fn with_scale(scale: u32) -> Self {
        Self {
            units: BigInt::zero(),
            scale,
        }
    }

    pub fn one(scale: u32) -> Self {
        Self::from_u64(1, scale)
    }

    pub fn from_u64(value: u64, scale: u32) -> Self {
        Self {
            units: BigInt::from(value) * pow10(scale),
            scale,
        }
    }

    fn from_bigint(value: BigInt, scale: u32) -> Self {
        Self {
            units: value * pow10(scale),
            scale,
        }
    }

    /// Exact promotion of a finite `f64`: the binary mantissa is expanded
    /// into decimal, so the only rounding is the final cut to `scale`.
    pub fn from_f64(value: f64, scale: u32) -> Self {
        debug_assert!(value.is_finite());
        if value == 0.0 || !value.is_finite() {
            return Self::with_scale(scale);
        }
        let bits = value.to_bits();
        let negative = bits >> 63 == 1;
        let biased = ((bits >> 52) & 0x7ff) as i64;
        let fraction = bits & ((1u64 << 52) - 1);
        let (mantissa, exponent) = if biased == 0 {
            (fraction, -1074i64)
        } else {
            (fraction | (1u64 << 52), biased - 1075)
        };
        let mut units = BigInt::from(mantissa) * pow10(scale);
        if exponent >= 0 {
            units <<= exponent as usize;
        } else {
            units = round_half_even(&units, &(BigInt::one() << (-exponent) as usize));
        }
        if negative {
            units = -units;
        }
        Self { units, scale }
    }

    /// Projection back to `f64`, correct to the last bit for values that
    /// round-trip (the top 19 significant digits pin down any double).
    pub fn to_f64(&self) -> f64 {
        if self.units.is_zero() {
            return 0.0;
        }
        let digits = self.units.magnitude().to_string();
        let take = digits.len().min(19);
        let exponent = (digits.len() - take) as i64 - i64::from(self.scale);
        let value: f64 = format!("{}e{}", &digits[..take], exponent)
            .parse()
            .expect("constructed scientific literal");
        if self.units.is_negative() { -value } else { value }
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn is_zero(&self) -> bool {
        self.units.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.units.is_positive()
    }

    pub fn is_negative(&self) -> bool {
        self.units.is_negative()
    }

    /// Re-target the fractional scale; reductions round half to even.
    pub fn rescale(&self, scale: u32) -> Self {
        match scale.cmp(&self.scale) {
            Ordering::Equal => self.clone(),
            Ordering::Greater => Self {
                units: &self.units * pow10(scale - self.scale),
                scale,
            },
            Ordering::Less => Self {
                units: round_half_even(&self.units, &pow10(self.scale - scale)),
                scale,
            },
        }
    }

    /// Exact product reduced to the common scale, half to even.
    pub fn mul(&self, rhs: &Self) -> Self {
        debug_assert_eq!(self.scale, rhs.scale);
        Self {
            units: round_half_even(&(&self.units * &rhs.units), &pow10(self.scale)),
            scale: self.scale,
        }
    }

    /// Decimal division to the common scale, half to even.
    pub fn div(&self, rhs: &Self) -> Result<Self, MathError> {
        debug_assert_eq!(self.scale, rhs.scale);
        if rhs.units.is_zero() {
            return Err(MathError::DivisionByZero);
        }
        Ok(Self {
            units: round_half_even(&(&self.units * pow10(self.scale)), &rhs.units),
            scale: self.scale,
        })
    }

    // Truncating division, used inside Newton iterations only.
    fn div_trunc(&self, rhs: &Self) -> Result<Self, MathError> {
        debug_assert_eq!(self.scale, rhs.scale);
        if rhs.units.is_zero() {
            return Err(MathError::DivisionByZero);
        }
        Ok(Self {
            units: (&self.units * pow10(self.scale)) / &rhs.units,
            scale: self.scale,
        })
    }

    // Integer part as a plain integer, truncated toward zero.
    fn trunc_units(&self) -> BigInt {
        &self.units / pow10(self.scale)
    }

    fn integer_digits(&self) -> u32 {
        let whole = self.trunc_units().abs();
        if whole.is_zero() {
            1
        } else {
            whole.to_string().len() as u32
        }
    }

    /// Integer power by square-and-multiply. A zero base yields zero for
    /// every exponent; negative exponents go through the reciprocal.
    pub fn pow_int(&self, exponent: i64) -> Result<Self, MathError> {
        if self.is_zero() {
            return Ok(Self::with_scale(self.scale));
        }
        let mut result = Self::one(self.scale);
        let mut base = self.clone();
        let mut remaining = exponent.unsigned_abs();
        while remaining > 0 {
            if remaining & 1 == 1 {
                result = result.mul(&base);
            }
            remaining >>= 1;
            if remaining > 0 {
                base = base.mul(&base);
            }
        }
        if exponent < 0 {
            Self::one(self.scale).div(&result)
        } else {
            Ok(result)
        }
    }

    /// Real power. Integer exponents representable in 64 bits delegate to
    /// [`pow_int`](Self::pow_int); everything else is `exp(e · ln u)`, so a
    /// non-positive base with a fractional exponent is a domain error.
    pub fn pow_real(&self, exponent: f64) -> Result<Self, MathError> {
        if self.is_zero() {
            return Ok(Self::with_scale(self.scale));
        }
        if exponent == exponent.trunc() && exponent.abs() < 9.007_199_254_740_992e15 {
            return self.pow_int(exponent as i64);
        }
        self.ln()?
            .mul(&Self::from_f64(exponent, self.scale))
            .exp()
    }

    /// Natural exponential. Positive arguments split as `u = a + b` with
    /// integral `a`, computing `exp0(1 + b/a)^a` so the Taylor series only
    /// ever sees arguments below 2.
    pub fn exp(&self) -> Result<Self, MathError> {
        if self.is_zero() {
            return Ok(Self::one(self.scale));
        }
        if self.is_negative() {
            return Self::one(self.scale).div(&(-self).exp()?);
        }
        let whole = self.trunc_units();
        if whole.is_zero() {
            return self.exp_series();
        }
        let power = whole
            .to_i64()
            .ok_or_else(|| MathError::ExponentOverflow(self.to_string()))?;
        let fraction = self - &Self::from_bigint(whole, self.scale);
        let reduced =
            &Self::one(self.scale) + &fraction.div(&Self::from_u64(power as u64, self.scale))?;
        reduced.exp_series()?.pow_int(power)
    }

    // Taylor series Σ x^k / k!, summed until two successive partial sums
    // are bitwise equal at this scale.
    fn exp_series(&self) -> Result<Self, MathError> {
        let mut sum = Self::one(self.scale);
        let mut term = Self::one(self.scale);
        let mut k = 1u64;
        loop {
            term = term.mul(self).div(&Self::from_u64(k, self.scale))?;
            let next = &sum + &term;
            if next.units == sum.units {
                break;
            }
            sum = next;
            k += 1;
        }
        Ok(sum)
    }

    /// Natural logarithm, defined for positive values only. Arguments with
    /// three or more integer digits `d` reduce through the `d`-th root:
    /// `ln u = d · ln(root(u, d))`.
    pub fn ln(&self) -> Result<Self, MathError> {
        if !self.is_positive() {
            return Err(MathError::Domain(format!(
                "natural logarithm of non-positive {self}"
            )));
        }
        let digits = self.integer_digits();
        if digits >= 3 {
            let reduced = self.root(digits)?;
            Ok(reduced
                .ln_newton()?
                .mul(&Self::from_u64(u64::from(digits), self.scale)))
        } else {
            self.ln_newton()
        }
    }

    // Newton on exp: x ← x − (exp(x) − u) / exp(x), iterated at guard scale
    // until the update magnitude falls below 5·10^-(scale+1), then rounded
    // half to even back to the requested scale.
    fn ln_newton(&self) -> Result<Self, MathError> {
        let target = self.rescale(self.scale + GUARD_DIGITS);
        let threshold = BigInt::from(5) * pow10(GUARD_DIGITS - 1);
        let mut x = Self::from_f64(target.magnitude_ln(), target.scale);
        loop {
            let exp_x = x.exp()?;
            let delta = (&exp_x - &target).div_trunc(&exp_x)?;
            x = &x - &delta;
            if delta.units.abs() <= threshold {
                break;
            }
        }
        Ok(x.rescale(self.scale))
    }

    // Seed for the ln Newton iteration: ln of the value from its top
    // significant digits, good to an f64 ulp.
    fn magnitude_ln(&self) -> f64 {
        let digits = self.units.magnitude().to_string();
        let take = digits.len().min(19);
        let top: f64 = digits[..take].parse().expect("decimal digit run");
        top.ln() + (digits.len() - take) as f64 * std::f64::consts::LN_10
            - f64::from(self.scale) * std::f64::consts::LN_10
    }

    /// `degree`-th root via Newton `x ← (u + (k−1)·x^k) / (k·x^(k−1))`,
    /// seeded at `u/k`. Zero yields zero; negative values have no real
    /// root of even degree.
    pub fn root(&self, degree: u32) -> Result<Self, MathError> {
        if degree == 0 {
            return Err(MathError::DivisionByZero);
        }
        if self.is_zero() {
            return Ok(Self::with_scale(self.scale));
        }
        if self.is_negative() && degree % 2 == 0 {
            return Err(MathError::Domain(format!(
                "no real root of even degree {degree} for negative {self}"
            )));
        }
        let target = self.rescale(self.scale + GUARD_DIGITS);
        let threshold = BigInt::from(5) * pow10(GUARD_DIGITS - 1);
        let degree_dec = Self::from_u64(u64::from(degree), target.scale);
        let degree_minus_one = Self::from_u64(u64::from(degree) - 1, target.scale);
        let mut x = target.div_trunc(&degree_dec)?;
        if x.is_zero() {
            // Tiny arguments truncate the u/k seed to zero; restart from u.
            x = target.clone();
        }
        loop {
            let lower_power = x.pow_int(i64::from(degree) - 1)?;
            let full_power = lower_power.mul(&x);
            let numerator = &target + &full_power.mul(&degree_minus_one);
            let denominator = degree_dec.mul(&lower_power);
            let next = numerator.div_trunc(&denominator)?;
            let delta = &next - &x;
            x = next;
            if delta.units.abs() <= threshold {
                break;
            }
        }
        Ok(x.rescale(self.scale))
    }

    /// Probabilistic factorial of a non-negative real: the linear
    /// interpolation between `⌊u⌋!` and `⌊u⌋!·(⌊u⌋ + 1)`, with the
    /// factorial taken as a direct product over reals. Not Gamma.
    pub fn prob_factorial(&self) -> Result<Self, MathError> {
        if self.is_negative() {
            return Err(MathError::Domain(format!(
                "probabilistic factorial of negative {self}"
            )));
        }
        let whole = self.trunc_units();
        let n = whole
            .to_u64()
            .ok_or_else(|| MathError::ExponentOverflow(self.to_string()))?;
        let mut product = Self::one(self.scale);
        for k in 2..=n {
            product = product.mul(&Self::from_u64(k, self.scale));
        }
        let fraction = self - &Self::from_bigint(whole, self.scale);
        if !fraction.is_positive() {
            return Ok(product);
        }
        let lower = product.mul(&(&Self::one(self.scale) - &fraction));
        let upper = product
            .mul(&Self::from_u64(n + 1, self.scale))
            .mul(&fraction);
        Ok(&lower + &upper)
    }
}

impl PartialOrd for BigDec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.scale != other.scale {
            return None;
        }
        Some(self.units.cmp(&other.units))
    }
}

impl Add for &BigDec {
    type Output = BigDec;

    fn add(self, rhs: Self) -> Self::Output {
        debug_assert_eq!(self.scale, rhs.scale);
        BigDec {
            units: &self.units + &rhs.units,
            scale: self.scale,
        }
    }
}

impl Sub for &BigDec {
    type Output = BigDec;

    fn sub(self, rhs: Self) -> Self::Output {
        debug_assert_eq!(self.scale, rhs.scale);
        BigDec {
            units: &self.units - &rhs.units,
            scale: self.scale,
        }
    }
}

impl Neg for &BigDec {
    type Output = BigDec;

    fn neg(self) -> Self::Output {
        BigDec {
            units: -&self.units,
            scale: self.scale,
        }
    }
}

impl Display for BigDec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let digits = self.units.magnitude().to_string();
        let scale = self.scale as usize;
        if self.units.is_negative() {
            write!(f, "-")?;
        }
        if scale == 0 {
            return write!(f, "{digits}");
        }
        if digits.len() > scale {
            let (whole, fraction) = digits.split_at(digits.len() - scale);
            write!(f, "{whole}.{fraction}")
        } else {
            write!(f, "0.{}{}", "0".repeat(scale - digits.len()), digits)
        }
    }
}
