use num_traits::{One, Zero};
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::errors::Result;
use crate::traits::{ModelFn, Scalar};

/// Forward-mode dual number: `val` carries the point value, `eps` the
/// directional derivative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    /// A value carrying no derivative.
    pub fn constant(val: f64) -> Self {
        Self { val, eps: 0.0 }
    }

    /// A value seeded as the differentiation variable (`eps = 1`).
    pub fn seeded(val: f64) -> Self {
        Self { val, eps: 1.0 }
    }

    // Elementary functions for model right-hand sides that go beyond
    // ring arithmetic.

    pub fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        Self::new(s, self.eps / (2.0 * s))
    }

    pub fn exp(self) -> Self {
        let e = self.val.exp();
        Self::new(e, e * self.eps)
    }

    pub fn ln(self) -> Self {
        Self::new(self.val.ln(), self.eps / self.val)
    }

    pub fn sin(self) -> Self {
        Self::new(self.val.sin(), self.eps * self.val.cos())
    }

    pub fn cos(self) -> Self {
        Self::new(self.val.cos(), -self.eps * self.val.sin())
    }

    pub fn powi(self, n: i32) -> Self {
        Self::new(
            self.val.powi(n),
            f64::from(n) * self.val.powi(n - 1) * self.eps,
        )
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / (rhs.val * rhs.val),
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::constant(0.0)
    }

    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Scalar for Dual {
    fn from_real(v: f64) -> Self {
        Self::constant(v)
    }

    fn is_finite_value(&self) -> bool {
        self.val.is_finite() && self.eps.is_finite()
    }
}

/// Jacobian of the state derivative with respect to the state, row-major
/// `nx * nx`, computed one column at a time by seeding a unit perturbation.
pub fn state_jacobian<F: ModelFn<Dual>>(
    f: &F,
    x: &[f64],
    u: &[f64],
    p: &[f64],
    t: f64,
) -> Result<Vec<f64>> {
    let n = x.len();
    let u_dual: Vec<Dual> = u.iter().map(|&v| Dual::constant(v)).collect();
    let p_dual: Vec<Dual> = p.iter().map(|&v| Dual::constant(v)).collect();
    let t_dual = Dual::constant(t);

    let mut jacobian = vec![0.0; n * n];
    let mut x_dual = vec![Dual::zero(); n];
    let mut dxdt = vec![Dual::zero(); n];
    let mut out = vec![Dual::zero(); f.n_outputs()];

    for j in 0..n {
        for i in 0..n {
            x_dual[i] = Dual::new(x[i], if i == j { 1.0 } else { 0.0 });
        }
        f.eval(&x_dual, &u_dual, &p_dual, t_dual, &mut dxdt, &mut out)?;
        for i in 0..n {
            jacobian[i * n + j] = dxdt[i].eps;
        }
    }

    Ok(jacobian)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay;

    impl<T: Scalar> ModelFn<T> for Decay {
        fn eval(
            &self,
            x: &[T],
            _u: &[T],
            p: &[T],
            _t: T,
            dxdt: &mut [T],
            _out: &mut [T],
        ) -> Result<()> {
            dxdt[0] = -p[0] * x[0];
            Ok(())
        }
    }

    #[test]
    fn product_rule() {
        let a = Dual::seeded(3.0);
        let b = Dual::constant(4.0);
        let c = a * a * b;
        assert_eq!(c.val, 36.0);
        assert_eq!(c.eps, 24.0);
    }

    #[test]
    fn quotient_rule() {
        let x = Dual::seeded(2.0);
        let y = (x * x + Dual::constant(1.0)) / x;
        assert!((y.val - 2.5).abs() < 1e-12);
        // d/dx (x + 1/x) = 1 - 1/x^2
        assert!((y.eps - 0.75).abs() < 1e-12);
    }

    #[test]
    fn elementary_derivatives() {
        let x = Dual::seeded(0.7);
        assert!((x.exp().eps - 0.7_f64.exp()).abs() < 1e-12);
        assert!((x.sin().eps - 0.7_f64.cos()).abs() < 1e-12);
        assert!((x.powi(3).eps - 3.0 * 0.7_f64.powi(2)).abs() < 1e-12);
    }

    #[test]
    fn state_jacobian_of_linear_decay() {
        let jac = state_jacobian(&Decay, &[5.0], &[], &[0.3], 0.0).expect("jacobian");
        assert_eq!(jac.len(), 1);
        assert!((jac[0] + 0.3).abs() < 1e-12);
    }
}
