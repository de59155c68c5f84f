//! Explicit single-step formulas and the step-doubling error estimate.
//!
//! Everything here is generic over [`Scalar`], so the same code path serves
//! plain `f64` stepping and derivative-carrying evaluation with
//! [`crate::autodiff::Dual`].

use crate::errors::{Error, Result};
use crate::traits::{IntegrationStrategy, ModelFn, Scalar};

/// Forward Euler: `x1 = x0 + dt * f(x0, u0, p, t0)`. One model evaluation.
pub fn euler_step<T: Scalar, F: ModelFn<T>>(
    f: &F,
    x0: &[T],
    u0: &[T],
    p: &[T],
    t0: T,
    dt: T,
) -> Result<Vec<T>> {
    let mut k = vec![T::zero(); x0.len()];
    let mut out = vec![T::zero(); f.n_outputs()];
    f.eval(x0, u0, p, t0, &mut k, &mut out)?;
    Ok(x0.iter().zip(&k).map(|(&x, &ki)| x + dt * ki).collect())
}

/// Classical four-stage Runge-Kutta step from `t0` to `t0 + dt`.
///
/// When `u1` is supplied the midpoint stages see the endpoint average
/// `(u0 + u1) / 2` and the final stage sees `u1`; otherwise `u0` is held
/// across the whole step. Four model evaluations.
pub fn rk4_step<T: Scalar, F: ModelFn<T>>(
    f: &F,
    x0: &[T],
    u0: &[T],
    u1: Option<&[T]>,
    p: &[T],
    t0: T,
    dt: T,
) -> Result<Vec<T>> {
    let n = x0.len();
    let half = T::from_real(0.5);
    let sixth = T::from_real(1.0 / 6.0);
    let two = T::from_real(2.0);

    let u_half: Vec<T> = match u1 {
        Some(u1) => u0.iter().zip(u1).map(|(&a, &b)| (a + b) * half).collect(),
        None => u0.to_vec(),
    };
    let u_end = u1.unwrap_or(u0);

    let mut k1 = vec![T::zero(); n];
    let mut k2 = vec![T::zero(); n];
    let mut k3 = vec![T::zero(); n];
    let mut k4 = vec![T::zero(); n];
    let mut tmp = vec![T::zero(); n];
    let mut out = vec![T::zero(); f.n_outputs()];

    f.eval(x0, u0, p, t0, &mut k1, &mut out)?;

    for i in 0..n {
        tmp[i] = x0[i] + dt * half * k1[i];
    }
    f.eval(&tmp, &u_half, p, t0 + dt * half, &mut k2, &mut out)?;

    for i in 0..n {
        tmp[i] = x0[i] + dt * half * k2[i];
    }
    f.eval(&tmp, &u_half, p, t0 + dt * half, &mut k3, &mut out)?;

    for i in 0..n {
        tmp[i] = x0[i] + dt * k3[i];
    }
    f.eval(&tmp, u_end, p, t0 + dt, &mut k4, &mut out)?;

    let mut x1 = vec![T::zero(); n];
    for i in 0..n {
        x1[i] = x0[i] + dt * sixth * (k1[i] + two * k2[i] + two * k3[i] + k4[i]);
    }
    Ok(x1)
}

/// Result of a step with an accompanying local error estimate.
///
/// `state` is the refined (half-step) result; `error` is the per-component
/// truncation estimate a step-size controller checks against its tolerance.
#[derive(Debug, Clone)]
pub struct StepEstimate<T> {
    pub state: Vec<T>,
    pub error: Vec<T>,
}

/// Advances one RK4 step with a step-doubling error estimate.
///
/// Runs one full-`dt` step and two half-`dt` steps (actions interpolated at
/// the midpoint), then forms `error = (x_halves - x_full) / 15`, the
/// Richardson combination matching a fourth-order formula. Twelve model
/// evaluations. The half-step result is returned as `state` since it is the
/// more accurate of the two.
pub fn step_with_error<T: Scalar, F: ModelFn<T>>(
    f: &F,
    x0: &[T],
    u0: &[T],
    u1: Option<&[T]>,
    p: &[T],
    t0: T,
    dt: T,
) -> Result<StepEstimate<T>> {
    let half = T::from_real(0.5);
    let fifteenth = T::from_real(1.0 / 15.0);

    let u_mid: Vec<T> = match u1 {
        Some(u1) => u0.iter().zip(u1).map(|(&a, &b)| (a + b) * half).collect(),
        None => u0.to_vec(),
    };
    let u_end = u1.unwrap_or(u0);

    let full = rk4_step(f, x0, u0, u1, p, t0, dt)?;

    let h = dt * half;
    let mid = rk4_step(f, x0, u0, Some(&u_mid), p, t0, h)?;
    let fine = rk4_step(f, &mid, &u_mid, Some(u_end), p, t0 + h, h)?;

    let error = fine
        .iter()
        .zip(&full)
        .map(|(&a, &b)| (a - b) * fifteenth)
        .collect();

    Ok(StepEstimate { state: fine, error })
}

fn lerp_actions(u0: &[f64], u1: &[f64], theta: f64) -> Vec<f64> {
    u0.iter()
        .zip(u1)
        .map(|(&a, &b)| a + theta * (b - a))
        .collect()
}

fn check_actions(u0: &[f64], u1: &[f64]) -> Result<()> {
    if u0.len() != u1.len() {
        return Err(Error::Configuration(format!(
            "action samples have mismatched lengths {} and {}",
            u0.len(),
            u1.len()
        )));
    }
    Ok(())
}

/// Advances an interval with a fixed number of equal RK4 substeps,
/// interpolating the endpoint action samples linearly across substeps.
#[derive(Debug, Clone, Copy)]
pub struct FixedStepRk4 {
    substeps: usize,
}

impl FixedStepRk4 {
    pub fn new(substeps: usize) -> Result<Self> {
        if substeps == 0 {
            return Err(Error::Configuration(
                "substep count must be at least 1".to_string(),
            ));
        }
        Ok(Self { substeps })
    }

    /// One RK4 step per grid interval.
    pub fn single() -> Self {
        Self { substeps: 1 }
    }
}

impl<F: ModelFn<f64>> IntegrationStrategy<F> for FixedStepRk4 {
    fn advance(
        &mut self,
        f: &F,
        x: &mut Vec<f64>,
        u0: &[f64],
        u1: &[f64],
        p: &[f64],
        t0: f64,
        t1: f64,
    ) -> Result<()> {
        check_actions(u0, u1)?;
        let n = self.substeps;
        let dt = (t1 - t0) / n as f64;
        for k in 0..n {
            let ua = lerp_actions(u0, u1, k as f64 / n as f64);
            let ub = lerp_actions(u0, u1, (k + 1) as f64 / n as f64);
            *x = rk4_step(f, x, &ua, Some(&ub), p, t0 + k as f64 * dt, dt)?;
        }
        Ok(())
    }
}

/// Forward-Euler counterpart of [`FixedStepRk4`].
#[derive(Debug, Clone, Copy)]
pub struct FixedStepEuler {
    substeps: usize,
}

impl FixedStepEuler {
    pub fn new(substeps: usize) -> Result<Self> {
        if substeps == 0 {
            return Err(Error::Configuration(
                "substep count must be at least 1".to_string(),
            ));
        }
        Ok(Self { substeps })
    }
}

impl<F: ModelFn<f64>> IntegrationStrategy<F> for FixedStepEuler {
    fn advance(
        &mut self,
        f: &F,
        x: &mut Vec<f64>,
        u0: &[f64],
        u1: &[f64],
        p: &[f64],
        t0: f64,
        t1: f64,
    ) -> Result<()> {
        check_actions(u0, u1)?;
        let n = self.substeps;
        let dt = (t1 - t0) / n as f64;
        for k in 0..n {
            let ua = lerp_actions(u0, u1, k as f64 / n as f64);
            *x = euler_step(f, x, &ua, p, t0 + k as f64 * dt, dt)?;
        }
        Ok(())
    }
}
