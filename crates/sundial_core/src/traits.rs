use num_traits::{One, Zero};
use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::errors::Result;

/// A trait for value types the stepping formulas can operate on.
///
/// Only the operations the integration formulas actually need: ring
/// arithmetic, lifting a plain `f64`, and a finiteness check. `f64` and
/// [`crate::autodiff::Dual`] both qualify, so one generic implementation of
/// Euler/RK4/error-estimation serves plain numeric evaluation and
/// derivative-carrying evaluation alike.
pub trait Scalar:
    Copy
    + Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Zero
    + One
    + 'static
{
    /// Lifts a plain `f64` into this value representation.
    fn from_real(v: f64) -> Self;

    /// Whether the carried value is finite. A NaN or infinity poisons the
    /// whole step, so evaluation rejects it immediately.
    fn is_finite_value(&self) -> bool;
}

impl Scalar for f64 {
    fn from_real(v: f64) -> Self {
        v
    }

    fn is_finite_value(&self) -> bool {
        self.is_finite()
    }
}

/// A continuous-time model's right-hand side and auxiliary outputs.
///
/// Evaluates `(state, action, parameters, time)` into the state derivative
/// `dxdt` and the output vector `out`, writing into caller-provided buffers.
/// `dxdt` has the state's length; `out` has length [`ModelFn::n_outputs`].
///
/// Implementing this for both `f64` and `Dual` makes the model
/// differentiable through [`crate::autodiff`].
pub trait ModelFn<T: Scalar> {
    /// Output dimension `no`. Pure ODE right-hand sides report zero.
    fn n_outputs(&self) -> usize {
        0
    }

    /// Evaluates the model at one point.
    fn eval(&self, x: &[T], u: &[T], p: &[T], t: T, dxdt: &mut [T], out: &mut [T]) -> Result<()>;
}

/// A strategy that advances a state vector across one grid interval.
///
/// The simulator invokes this once per consecutive grid-point pair; how the
/// interval is subdivided internally is the strategy's own business.
/// `u0`/`u1` are the action samples at the interval endpoints.
pub trait IntegrationStrategy<F> {
    fn advance(
        &mut self,
        f: &F,
        x: &mut Vec<f64>,
        u0: &[f64],
        u1: &[f64],
        p: &[f64],
        t0: f64,
        t1: f64,
    ) -> Result<()>;
}

/// A function sampled at every grid point of a simulation run.
pub trait OutputFn {
    /// Length of the vector written by [`OutputFn::call`].
    fn n_outputs(&self) -> usize;

    /// Evaluates the output at one state/time.
    fn call(&self, x: &[f64], t: f64, out: &mut [f64]) -> Result<()>;
}
