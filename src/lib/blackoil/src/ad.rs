use nalgebra::DVector;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Forward-mode AD scalar: a value plus its partial derivatives with
/// respect to the primary variables of one cell (or one well segment).
///
/// Every physical quantity that ends up in a residual row is computed in
/// this type so the matching Jacobian entries fall out of the same
/// expression. Arithmetic is closed under add/sub/mul/div and the
/// elementary functions below.
///
/// Quantities taken from a neighbouring derivative domain (e.g. an
/// upwinded density borrowed from the outlet segment) must have their
/// derivatives cleared via [`AdScalar::clear_derivatives`] before they
/// mix with local quantities; the derivative slots are positional and
/// only meaningful against the owner's primary variables.
#[derive(Clone, Debug, PartialEq)]
pub struct AdScalar {
    value: f64,
    derivatives: DVector<f64>,
}

impl AdScalar {
    /// A constant: value with all derivatives zero.
    pub fn constant(value: f64, num_derivatives: usize) -> Self {
        AdScalar {
            value,
            derivatives: DVector::zeros(num_derivatives),
        }
    }

    /// The `index`-th primary variable: derivative 1 in its own slot.
    pub fn variable(value: f64, num_derivatives: usize, index: usize) -> Self {
        let mut derivatives = DVector::zeros(num_derivatives);
        derivatives[index] = 1.0;
        AdScalar { value, derivatives }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn derivative(&self, index: usize) -> f64 {
        self.derivatives[index]
    }

    pub fn num_derivatives(&self) -> usize {
        self.derivatives.len()
    }

    /// Zero all derivative slots, keeping the value.
    pub fn clear_derivatives(&mut self) {
        self.derivatives.fill(0.0);
    }

    /// Copy with derivatives cleared. Used at every upwinded reference
    /// that borrows state from a foreign derivative domain.
    pub fn frozen(&self) -> Self {
        AdScalar::constant(self.value, self.derivatives.len())
    }

    /// Chain rule for a unary function: f(self) with f'(self) = dval.
    fn chain(&self, value: f64, dval: f64) -> Self {
        AdScalar {
            value,
            derivatives: &self.derivatives * dval,
        }
    }

    pub fn exp(&self) -> Self {
        let e = self.value.exp();
        self.chain(e, e)
    }

    pub fn ln(&self) -> Self {
        self.chain(self.value.ln(), 1.0 / self.value)
    }

    pub fn powf(&self, exponent: f64) -> Self {
        self.chain(
            self.value.powf(exponent),
            exponent * self.value.powf(exponent - 1.0),
        )
    }

    pub fn powi(&self, exponent: i32) -> Self {
        self.chain(
            self.value.powi(exponent),
            f64::from(exponent) * self.value.powi(exponent - 1),
        )
    }

    pub fn sqrt(&self) -> Self {
        let s = self.value.sqrt();
        self.chain(s, 0.5 / s)
    }

    /// |self|, with the subgradient sign(self) away from zero.
    pub fn abs(&self) -> Self {
        self.chain(self.value.abs(), self.value.signum())
    }

    pub fn is_finite(&self) -> bool {
        self.value.is_finite() && self.derivatives.iter().all(|d| d.is_finite())
    }
}

impl Add for &AdScalar {
    type Output = AdScalar;
    fn add(self, rhs: &AdScalar) -> AdScalar {
        debug_assert_eq!(self.derivatives.len(), rhs.derivatives.len());
        AdScalar {
            value: self.value + rhs.value,
            derivatives: &self.derivatives + &rhs.derivatives,
        }
    }
}

impl Add for AdScalar {
    type Output = AdScalar;
    fn add(self, rhs: AdScalar) -> AdScalar {
        &self + &rhs
    }
}

impl Add<f64> for &AdScalar {
    type Output = AdScalar;
    fn add(self, rhs: f64) -> AdScalar {
        AdScalar {
            value: self.value + rhs,
            derivatives: self.derivatives.clone(),
        }
    }
}

impl Add<f64> for AdScalar {
    type Output = AdScalar;
    fn add(self, rhs: f64) -> AdScalar {
        &self + rhs
    }
}

impl Add<AdScalar> for f64 {
    type Output = AdScalar;
    fn add(self, rhs: AdScalar) -> AdScalar {
        &rhs + self
    }
}

impl Sub for &AdScalar {
    type Output = AdScalar;
    fn sub(self, rhs: &AdScalar) -> AdScalar {
        debug_assert_eq!(self.derivatives.len(), rhs.derivatives.len());
        AdScalar {
            value: self.value - rhs.value,
            derivatives: &self.derivatives - &rhs.derivatives,
        }
    }
}

impl Sub for AdScalar {
    type Output = AdScalar;
    fn sub(self, rhs: AdScalar) -> AdScalar {
        &self - &rhs
    }
}

impl Sub<f64> for &AdScalar {
    type Output = AdScalar;
    fn sub(self, rhs: f64) -> AdScalar {
        AdScalar {
            value: self.value - rhs,
            derivatives: self.derivatives.clone(),
        }
    }
}

impl Sub<f64> for AdScalar {
    type Output = AdScalar;
    fn sub(self, rhs: f64) -> AdScalar {
        &self - rhs
    }
}

impl Sub<AdScalar> for f64 {
    type Output = AdScalar;
    fn sub(self, rhs: AdScalar) -> AdScalar {
        AdScalar {
            value: self - rhs.value,
            derivatives: -rhs.derivatives,
        }
    }
}

impl Mul for &AdScalar {
    type Output = AdScalar;
    fn mul(self, rhs: &AdScalar) -> AdScalar {
        debug_assert_eq!(self.derivatives.len(), rhs.derivatives.len());
        AdScalar {
            value: self.value * rhs.value,
            derivatives: &self.derivatives * rhs.value + &rhs.derivatives * self.value,
        }
    }
}

impl Mul for AdScalar {
    type Output = AdScalar;
    fn mul(self, rhs: AdScalar) -> AdScalar {
        &self * &rhs
    }
}

impl Mul<f64> for &AdScalar {
    type Output = AdScalar;
    fn mul(self, rhs: f64) -> AdScalar {
        AdScalar {
            value: self.value * rhs,
            derivatives: &self.derivatives * rhs,
        }
    }
}

impl Mul<f64> for AdScalar {
    type Output = AdScalar;
    fn mul(self, rhs: f64) -> AdScalar {
        &self * rhs
    }
}

impl Mul<AdScalar> for f64 {
    type Output = AdScalar;
    fn mul(self, rhs: AdScalar) -> AdScalar {
        &rhs * self
    }
}

impl Div for &AdScalar {
    type Output = AdScalar;
    fn div(self, rhs: &AdScalar) -> AdScalar {
        debug_assert_eq!(self.derivatives.len(), rhs.derivatives.len());
        let inv = 1.0 / rhs.value;
        AdScalar {
            value: self.value * inv,
            derivatives: (&self.derivatives * rhs.value - &rhs.derivatives * self.value)
                * (inv * inv),
        }
    }
}

impl Div for AdScalar {
    type Output = AdScalar;
    fn div(self, rhs: AdScalar) -> AdScalar {
        &self / &rhs
    }
}

impl Div<f64> for &AdScalar {
    type Output = AdScalar;
    fn div(self, rhs: f64) -> AdScalar {
        AdScalar {
            value: self.value / rhs,
            derivatives: &self.derivatives / rhs,
        }
    }
}

impl Div<f64> for AdScalar {
    type Output = AdScalar;
    fn div(self, rhs: f64) -> AdScalar {
        &self / rhs
    }
}

impl Div<AdScalar> for f64 {
    type Output = AdScalar;
    fn div(self, rhs: AdScalar) -> AdScalar {
        let inv = 1.0 / rhs.value;
        AdScalar {
            value: self * inv,
            derivatives: rhs.derivatives * (-self * inv * inv),
        }
    }
}

impl Neg for &AdScalar {
    type Output = AdScalar;
    fn neg(self) -> AdScalar {
        AdScalar {
            value: -self.value,
            derivatives: -&self.derivatives,
        }
    }
}

impl Neg for AdScalar {
    type Output = AdScalar;
    fn neg(self) -> AdScalar {
        AdScalar {
            value: -self.value,
            derivatives: -self.derivatives,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn product_rule() {
        let x = AdScalar::variable(3.0, 2, 0);
        let y = AdScalar::variable(4.0, 2, 1);
        let z = &x * &y;
        assert_relative_eq!(z.value(), 12.0);
        assert_relative_eq!(z.derivative(0), 4.0);
        assert_relative_eq!(z.derivative(1), 3.0);
    }

    #[test]
    fn quotient_rule() {
        let x = AdScalar::variable(6.0, 2, 0);
        let y = AdScalar::variable(2.0, 2, 1);
        let z = &x / &y;
        assert_relative_eq!(z.value(), 3.0);
        assert_relative_eq!(z.derivative(0), 0.5);
        assert_relative_eq!(z.derivative(1), -1.5);
    }

    #[test]
    fn elementary_functions_chain() {
        let x = AdScalar::variable(2.0, 1, 0);
        let e = x.exp();
        assert_relative_eq!(e.derivative(0), 2.0_f64.exp());
        let l = x.ln();
        assert_relative_eq!(l.derivative(0), 0.5);
        let p = x.powf(3.0);
        assert_relative_eq!(p.value(), 8.0);
        assert_relative_eq!(p.derivative(0), 12.0);
        let s = x.sqrt();
        assert_relative_eq!(s.derivative(0), 0.25 / 2.0_f64.sqrt());
    }

    #[test]
    fn clearing_derivatives_freezes_value() {
        let x = AdScalar::variable(5.0, 3, 1);
        let f = x.frozen();
        assert_relative_eq!(f.value(), 5.0);
        for i in 0..3 {
            assert_relative_eq!(f.derivative(i), 0.0);
        }
        // A frozen operand no longer contaminates the local domain
        let local = AdScalar::variable(2.0, 3, 0);
        let mix = &local * &f;
        assert_relative_eq!(mix.derivative(0), 5.0);
        assert_relative_eq!(mix.derivative(1), 0.0);
    }

    #[test]
    fn mixed_scalar_arithmetic() {
        let x = AdScalar::variable(2.0, 1, 0);
        let y = 1.0 - (3.0 * x.clone() + 1.0) / 2.0;
        assert_relative_eq!(y.value(), -2.5);
        assert_relative_eq!(y.derivative(0), -1.5);
    }
}
