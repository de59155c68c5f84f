//! Solving an implicit relation `g(z, p) = 0` by reduction to a constrained
//! optimization problem: constant-zero objective, equality constraints
//! `g(z, p) = 0`, and simple sign-derived bounds on the unknowns. The
//! optimizer itself is an external collaborator behind [`NlpSolver`];
//! [`NewtonSolver`] is a damped-Newton reference implementation for square
//! systems.

use anyhow::{bail, Context};
use log::trace;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::autodiff::Dual;
use crate::errors::{Error, Result};
use crate::traits::{ModelFn, Scalar};

/// Equality-constraint function of the reduced problem.
pub trait ConstraintFn<T: Scalar> {
    /// Number of equality constraints.
    fn dim(&self) -> usize;

    /// Evaluates `g(z, p)` into `out` (length [`ConstraintFn::dim`]).
    fn eval(&self, z: &[T], p: &[T], out: &mut [T]) -> Result<()>;
}

/// Which model input holds the implicit unknown. The remaining inputs are
/// concatenated in declaration order (state, action, parameters, time) into
/// the flat parameter vector handed to the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownInput {
    State,
    Action,
    Params,
}

/// Sign hint for one unknown component: `Positive` forces a zero lower
/// bound, `Negative` a zero upper bound, `Free` leaves it unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignHint {
    Positive,
    Negative,
    Free,
}

fn bounds_from_hints(hints: &[SignHint]) -> (Vec<f64>, Vec<f64>) {
    let lower = hints
        .iter()
        .map(|h| match h {
            SignHint::Positive => 0.0,
            _ => f64::NEG_INFINITY,
        })
        .collect();
    let upper = hints
        .iter()
        .map(|h| match h {
            SignHint::Negative => 0.0,
            _ => f64::INFINITY,
        })
        .collect();
    (lower, upper)
}

/// The reduced problem handed to an external optimizer.
pub struct NlpProblem<'a, G> {
    pub residual: &'a G,
    pub guess: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub params: Vec<f64>,
}

/// Opaque solver statistics, stored on results but never interpreted here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SolverStats {
    pub iterations: usize,
    pub residual_norm: f64,
}

/// What an external optimizer reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlpSolution {
    pub x: Vec<f64>,
    pub converged: bool,
    pub stats: SolverStats,
}

/// External constrained-optimizer contract.
///
/// A hard failure (bad problem, singular iteration) is an `Err`;
/// running out of iterations is a successful return with
/// `converged == false`. The caller decides what non-convergence means.
pub trait NlpSolver {
    fn solve<G>(&self, problem: &NlpProblem<G>) -> anyhow::Result<NlpSolution>
    where
        G: ConstraintFn<f64> + ConstraintFn<Dual>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonOptions {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
        }
    }
}

/// Damped Newton iteration on the equality constraints, iterates clamped to
/// the simple bounds. Requires a square system (one constraint per unknown).
#[derive(Debug, Clone, Copy, Default)]
pub struct NewtonSolver {
    pub options: NewtonOptions,
}

impl NewtonSolver {
    pub fn new(options: NewtonOptions) -> Self {
        Self { options }
    }
}

impl NlpSolver for NewtonSolver {
    fn solve<G>(&self, problem: &NlpProblem<G>) -> anyhow::Result<NlpSolution>
    where
        G: ConstraintFn<f64> + ConstraintFn<Dual>,
    {
        let dim = ConstraintFn::<f64>::dim(problem.residual);
        if dim == 0 {
            bail!("Constraint system has zero dimension.");
        }
        if problem.guess.len() != dim {
            bail!(
                "Newton solver needs a square system: {} constraints, {} unknowns.",
                dim,
                problem.guess.len()
            );
        }
        if self.options.max_steps == 0 {
            bail!("max_steps must be greater than zero.");
        }
        if self.options.damping <= 0.0 {
            bail!("damping must be positive.");
        }
        if self.options.tolerance <= 0.0 {
            bail!("tolerance must be positive.");
        }

        let mut z = problem.guess.clone();
        clamp_to_bounds(&mut z, &problem.lower, &problem.upper);

        let mut residual = vec![0.0; dim];
        ConstraintFn::<f64>::eval(problem.residual, &z, &problem.params, &mut residual)?;
        let mut residual_norm = l2_norm(&residual);
        let mut iterations = 0usize;

        loop {
            if residual_norm <= self.options.tolerance {
                break;
            }
            if iterations >= self.options.max_steps {
                return Ok(NlpSolution {
                    x: z,
                    converged: false,
                    stats: SolverStats {
                        iterations,
                        residual_norm,
                    },
                });
            }

            let jacobian = constraint_jacobian(problem.residual, &z, &problem.params)?;
            let delta = solve_linear_system(dim, &jacobian, &residual)
                .context("Failed to solve linear system during Newton iteration.")?;

            for i in 0..dim {
                z[i] -= self.options.damping * delta[i];
            }
            clamp_to_bounds(&mut z, &problem.lower, &problem.upper);

            iterations += 1;
            ConstraintFn::<f64>::eval(problem.residual, &z, &problem.params, &mut residual)?;
            residual_norm = l2_norm(&residual);
            trace!("newton iteration {iterations}: residual norm {residual_norm:e}");
        }

        Ok(NlpSolution {
            x: z,
            converged: true,
            stats: SolverStats {
                iterations,
                residual_norm,
            },
        })
    }
}

fn constraint_jacobian<G: ConstraintFn<Dual>>(g: &G, z: &[f64], p: &[f64]) -> Result<Vec<f64>> {
    let dim = g.dim();
    let n = z.len();
    let p_dual: Vec<Dual> = p.iter().map(|&v| Dual::constant(v)).collect();

    let mut jacobian = vec![0.0; dim * n];
    let mut z_dual = vec![Dual::constant(0.0); n];
    let mut out = vec![Dual::constant(0.0); dim];

    for j in 0..n {
        for i in 0..n {
            z_dual[i] = Dual::new(z[i], if i == j { 1.0 } else { 0.0 });
        }
        g.eval(&z_dual, &p_dual, &mut out)?;
        for i in 0..dim {
            jacobian[i * n + j] = out[i].eps;
        }
    }
    Ok(jacobian)
}

fn solve_linear_system(dim: usize, jacobian: &[f64], residual: &[f64]) -> anyhow::Result<Vec<f64>> {
    let j_matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let rhs = DVector::from_column_slice(residual);
    j_matrix
        .lu()
        .solve(&rhs)
        .map(|v| v.iter().cloned().collect())
        .ok_or_else(|| anyhow::anyhow!("Jacobian is singular."))
}

fn clamp_to_bounds(z: &mut [f64], lower: &[f64], upper: &[f64]) {
    for i in 0..z.len() {
        z[i] = z[i].max(lower[i]).min(upper[i]);
    }
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Residual adapter: evaluates the model with the unknown substituted into
/// its designated input slot and reads the derivative output as `g`.
struct ImplicitResidual<'a, M> {
    model: &'a M,
    unknown: UnknownInput,
    nx: usize,
    nu: usize,
    np: usize,
}

impl<'a, M> ImplicitResidual<'a, M> {
    /// Splits the flat parameter vector back into the non-designated model
    /// inputs. Layout is declaration order with the unknown slot skipped,
    /// time last.
    fn split<'b, T>(&self, z: &'b [T], flat: &'b [T]) -> (&'b [T], &'b [T], &'b [T], T)
    where
        T: Scalar,
    {
        match self.unknown {
            UnknownInput::State => {
                let (u, rest) = flat.split_at(self.nu);
                let (p, t) = rest.split_at(self.np);
                (z, u, p, t[0])
            }
            UnknownInput::Action => {
                let (x, rest) = flat.split_at(self.nx);
                let (p, t) = rest.split_at(self.np);
                (x, z, p, t[0])
            }
            UnknownInput::Params => {
                let (x, rest) = flat.split_at(self.nx);
                let (u, t) = rest.split_at(self.nu);
                (x, u, z, t[0])
            }
        }
    }
}

impl<'a, T: Scalar, M: ModelFn<T>> ConstraintFn<T> for ImplicitResidual<'a, M> {
    fn dim(&self) -> usize {
        self.nx
    }

    fn eval(&self, z: &[T], flat: &[T], out: &mut [T]) -> Result<()> {
        let (x, u, p, t) = self.split(z, flat);
        let mut aux = vec![T::zero(); self.model.n_outputs()];
        self.model.eval(x, u, p, t, out, &mut aux)
    }
}

/// Solution of an implicit relation: the solved unknown, the model's
/// auxiliary outputs at the solution, and the optimizer's statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplicitSolution {
    pub unknown: Vec<f64>,
    pub outputs: Vec<f64>,
    pub stats: SolverStats,
}

/// Reduces "solve `g = 0` for one model input" to the optimization problem
/// above and delegates to the injected [`NlpSolver`].
///
/// The designated input's content serves as the initial guess. A
/// non-convergent optimizer result becomes [`Error::SolverDiverged`] --
/// the non-converged iterate is never returned as a solution, and the core
/// does not retry. Retry policy belongs to the caller.
pub struct ImplicitSolver<S> {
    solver: S,
    unknown: UnknownInput,
    sign_hints: Vec<SignHint>,
}

impl<S: NlpSolver> ImplicitSolver<S> {
    pub fn new(solver: S, unknown: UnknownInput) -> Self {
        Self {
            solver,
            unknown,
            sign_hints: Vec::new(),
        }
    }

    /// Per-component sign hints for the unknown. When absent every
    /// component is unbounded.
    pub fn with_sign_hints(mut self, hints: Vec<SignHint>) -> Self {
        self.sign_hints = hints;
        self
    }

    pub fn solve<M>(
        &self,
        model: &M,
        x: &[f64],
        u: &[f64],
        p: &[f64],
        t: f64,
    ) -> Result<ImplicitSolution>
    where
        M: ModelFn<f64> + ModelFn<Dual>,
    {
        let guess: &[f64] = match self.unknown {
            UnknownInput::State => x,
            UnknownInput::Action => u,
            UnknownInput::Params => p,
        };
        if !self.sign_hints.is_empty() && self.sign_hints.len() != guess.len() {
            return Err(Error::Configuration(format!(
                "{} sign hints supplied for {} unknowns",
                self.sign_hints.len(),
                guess.len()
            )));
        }

        let (lower, upper) = if self.sign_hints.is_empty() {
            (
                vec![f64::NEG_INFINITY; guess.len()],
                vec![f64::INFINITY; guess.len()],
            )
        } else {
            bounds_from_hints(&self.sign_hints)
        };

        let mut flat = Vec::with_capacity(x.len() + u.len() + p.len() + 1);
        for (input, slot) in [
            (x, UnknownInput::State),
            (u, UnknownInput::Action),
            (p, UnknownInput::Params),
        ] {
            if slot != self.unknown {
                flat.extend_from_slice(input);
            }
        }
        flat.push(t);

        let residual = ImplicitResidual {
            model,
            unknown: self.unknown,
            nx: x.len(),
            nu: u.len(),
            np: p.len(),
        };
        let problem = NlpProblem {
            residual: &residual,
            guess: guess.to_vec(),
            lower,
            upper,
            params: flat,
        };

        let solution = self
            .solver
            .solve(&problem)
            .map_err(|e| Error::SolverDiverged {
                status: format!("{e:#}"),
            })?;
        if !solution.converged {
            return Err(Error::SolverDiverged {
                status: format!(
                    "no convergence after {} iterations (residual norm {:e})",
                    solution.stats.iterations, solution.stats.residual_norm
                ),
            });
        }

        // One more evaluation with the solved unknown to populate the
        // auxiliary outputs.
        let no = ModelFn::<f64>::n_outputs(model);
        let outputs = if no > 0 {
            let (xs, us, ps) = match self.unknown {
                UnknownInput::State => (solution.x.as_slice(), u, p),
                UnknownInput::Action => (x, solution.x.as_slice(), p),
                UnknownInput::Params => (x, u, solution.x.as_slice()),
            };
            let mut dxdt = vec![0.0; xs.len()];
            let mut out = vec![0.0; no];
            ModelFn::<f64>::eval(model, xs, us, ps, t, &mut dxdt, &mut out)?;
            out
        } else {
            Vec::new()
        };

        Ok(ImplicitSolution {
            unknown: solution.x,
            outputs,
            stats: solution.stats,
        })
    }
}
