pub mod autodiff;
pub mod errors;
pub mod model;
pub mod nlp;
pub mod simulator;
pub mod stepper;
/// The `sundial_core` crate is the numerical engine for Sundial: it advances
/// symbolically described continuous-time models over externally supplied
/// time grids. It is generic over the value representation, supporting plain
/// `f64` arithmetic and forward-mode differentiation via dual numbers.
///
/// Key components:
/// - **Traits**: `Scalar` (value abstraction), `ModelFn` (model right-hand
///   side and outputs), `IntegrationStrategy` / `OutputFn` (simulator
///   collaborators).
/// - **Model**: named state/action/output registries with dense indices and
///   a post-first-evaluation lock.
/// - **Stepper**: Euler and classical RK4 single-step formulas plus the
///   step-doubling local error estimate for adaptive control.
/// - **Simulator**: records an output trajectory across a monotonic time
///   grid, one strategy invocation per interval.
/// - **Nlp**: reduction of implicit relations `g(z, p) = 0` to a
///   constrained optimization problem solved by an external optimizer.
pub mod traits;
