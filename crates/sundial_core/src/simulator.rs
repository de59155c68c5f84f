use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::traits::{IntegrationStrategy, ModelFn, OutputFn};

/// Where a simulator is in its lifecycle. A run is only permitted from
/// `Idle`; `reset` returns a finished or failed simulator there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimPhase {
    Idle,
    Running,
    Done,
    Failed,
}

/// Completed trajectory: one output row per grid point, in grid order,
/// plus the state at the final grid point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub outputs: Vec<Vec<f64>>,
    pub final_state: Vec<f64>,
}

/// Drives an integration strategy across an externally supplied time grid,
/// sampling an output function at every grid point.
///
/// The grid must be non-empty and non-decreasing; both are checked at
/// construction, before any stepping can occur. A single-point grid is a
/// degenerate "evaluate only" run. Failures mid-run discard all partial
/// output -- an incomplete trajectory is never handed back as complete.
#[derive(Debug)]
pub struct Simulator<S, O> {
    strategy: S,
    output_fn: O,
    grid: Vec<f64>,
    phase: SimPhase,
    outputs: Vec<Vec<f64>>,
}

impl<S, O: OutputFn> Simulator<S, O> {
    pub fn new(strategy: S, output_fn: O, grid: Vec<f64>) -> Result<Self> {
        if grid.is_empty() {
            return Err(Error::Configuration(
                "time grid must contain at least one point".to_string(),
            ));
        }
        for i in 1..grid.len() {
            if grid[i] < grid[i - 1] {
                return Err(Error::InvalidGrid {
                    index: i,
                    t_prev: grid[i - 1],
                    t_next: grid[i],
                });
            }
        }
        Ok(Self {
            strategy,
            output_fn,
            grid,
            phase: SimPhase::Idle,
            outputs: Vec::new(),
        })
    }

    pub fn phase(&self) -> SimPhase {
        self.phase
    }

    pub fn grid(&self) -> &[f64] {
        &self.grid
    }

    /// Clears any stale output buffer and returns to `Idle` so the
    /// simulator can run again.
    pub fn reset(&mut self) {
        self.outputs.clear();
        self.phase = SimPhase::Idle;
    }

    /// Runs the full grid from `x0`.
    ///
    /// `actions` supplies one action sample per grid point; an empty slice
    /// stands for an action-less model. Any failure from the model, the
    /// strategy, or the output function aborts the run, moves the simulator
    /// to `Failed`, and is wrapped with the index of the grid interval in
    /// which it occurred.
    pub fn run<M>(
        &mut self,
        model: &M,
        x0: &[f64],
        actions: &[Vec<f64>],
        p: &[f64],
    ) -> Result<SimulationResult>
    where
        M: ModelFn<f64>,
        S: IntegrationStrategy<M>,
    {
        if self.phase != SimPhase::Idle {
            return Err(Error::Configuration(format!(
                "simulator is {:?}; reset before re-running",
                self.phase
            )));
        }
        if !actions.is_empty() && actions.len() != self.grid.len() {
            return Err(Error::Configuration(format!(
                "{} action samples supplied for {} grid points",
                actions.len(),
                self.grid.len()
            )));
        }

        self.phase = SimPhase::Running;
        self.outputs.clear();
        debug!(
            "starting simulation: {} grid points over [{}, {}]",
            self.grid.len(),
            self.grid[0],
            self.grid[self.grid.len() - 1]
        );

        let no_actions: &[f64] = &[];
        let action_at = |i: usize| {
            if actions.is_empty() {
                no_actions
            } else {
                actions[i].as_slice()
            }
        };

        let mut state = x0.to_vec();
        let mut row = vec![0.0; self.output_fn.n_outputs()];

        if let Err(e) = self.output_fn.call(&state, self.grid[0], &mut row) {
            self.phase = SimPhase::Failed;
            self.outputs.clear();
            return Err(e);
        }
        self.outputs.push(row.clone());

        for i in 0..self.grid.len() - 1 {
            let (t0, t1) = (self.grid[i], self.grid[i + 1]);
            trace!("interval {i}: [{t0}, {t1}]");

            let advanced = self
                .strategy
                .advance(model, &mut state, action_at(i), action_at(i + 1), p, t0, t1)
                .and_then(|()| self.output_fn.call(&state, t1, &mut row));

            if let Err(e) = advanced {
                self.phase = SimPhase::Failed;
                self.outputs.clear();
                return Err(Error::StepFailed {
                    interval: i,
                    source: Box::new(e),
                });
            }
            self.outputs.push(row.clone());
        }

        self.phase = SimPhase::Done;
        debug!("simulation done: {} output rows", self.outputs.len());
        Ok(SimulationResult {
            outputs: std::mem::take(&mut self.outputs),
            final_state: state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stepper::FixedStepRk4;
    use std::cell::Cell;

    /// `dxdt = p[0]`.
    struct ConstantRate;

    impl ModelFn<f64> for ConstantRate {
        fn eval(
            &self,
            _x: &[f64],
            _u: &[f64],
            p: &[f64],
            _t: f64,
            dxdt: &mut [f64],
            _out: &mut [f64],
        ) -> Result<()> {
            dxdt[0] = p[0];
            Ok(())
        }
    }

    /// Records the state and time it was sampled at.
    #[derive(Debug)]
    struct StateAndTime;

    impl OutputFn for StateAndTime {
        fn n_outputs(&self) -> usize {
            2
        }

        fn call(&self, x: &[f64], t: f64, out: &mut [f64]) -> Result<()> {
            out[0] = x[0];
            out[1] = t;
            Ok(())
        }
    }

    /// Counts interval advances without touching the state.
    #[derive(Debug)]
    struct CountingStrategy {
        advances: Cell<usize>,
    }

    impl CountingStrategy {
        fn new() -> Self {
            Self {
                advances: Cell::new(0),
            }
        }
    }

    impl<F> IntegrationStrategy<F> for CountingStrategy {
        fn advance(
            &mut self,
            _f: &F,
            _x: &mut Vec<f64>,
            _u0: &[f64],
            _u1: &[f64],
            _p: &[f64],
            _t0: f64,
            _t1: f64,
        ) -> Result<()> {
            self.advances.set(self.advances.get() + 1);
            Ok(())
        }
    }

    /// Fails once the interval start passes a threshold.
    struct FailingStrategy {
        fail_after: f64,
    }

    impl<F> IntegrationStrategy<F> for FailingStrategy {
        fn advance(
            &mut self,
            _f: &F,
            _x: &mut Vec<f64>,
            _u0: &[f64],
            _u1: &[f64],
            _p: &[f64],
            t0: f64,
            _t1: f64,
        ) -> Result<()> {
            if t0 >= self.fail_after {
                Err(Error::Evaluation("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn empty_grid_is_a_configuration_error() {
        let sim = Simulator::new(CountingStrategy::new(), StateAndTime, vec![]);
        assert!(matches!(sim, Err(Error::Configuration(_))));
    }

    #[test]
    fn decreasing_grid_fails_before_any_stepping() {
        let sim = Simulator::new(CountingStrategy::new(), StateAndTime, vec![0.0, 1.0, 0.5]);
        match sim {
            Err(Error::InvalidGrid {
                index,
                t_prev,
                t_next,
            }) => {
                assert_eq!(index, 2);
                assert_eq!(t_prev, 1.0);
                assert_eq!(t_next, 0.5);
            }
            other => panic!("expected InvalidGrid, got {other:?}"),
        }
    }

    #[test]
    fn single_point_grid_evaluates_once_without_stepping() {
        let strategy = CountingStrategy::new();
        let mut sim = Simulator::new(strategy, StateAndTime, vec![2.5]).expect("simulator");
        let result = sim.run(&ConstantRate, &[7.0], &[], &[1.0]).expect("run");

        assert_eq!(result.outputs.len(), 1);
        assert_eq!(result.outputs[0], vec![7.0, 2.5]);
        assert_eq!(result.final_state, vec![7.0]);
        assert_eq!(sim.phase(), SimPhase::Done);
    }

    #[test]
    fn n_point_grid_makes_n_minus_one_advances_in_order() {
        let grid = vec![0.0, 0.5, 1.0, 2.0];
        let mut sim =
            Simulator::new(FixedStepRk4::single(), StateAndTime, grid).expect("simulator");
        let result = sim.run(&ConstantRate, &[0.0], &[], &[2.0]).expect("run");

        assert_eq!(result.outputs.len(), 4);
        // x(t) = 2 t for the constant-rate model.
        for (row, t) in result.outputs.iter().zip([0.0, 0.5, 1.0, 2.0]) {
            assert!((row[0] - 2.0 * t).abs() < 1e-12);
            assert_eq!(row[1], t);
        }
        assert!((result.final_state[0] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn advance_count_matches_interval_count() {
        let mut sim = Simulator::new(CountingStrategy::new(), StateAndTime, vec![0.0, 1.0, 2.0])
            .expect("simulator");
        sim.run(&ConstantRate, &[0.0], &[], &[1.0]).expect("run");
        assert_eq!(sim.strategy.advances.get(), 2);
    }

    #[test]
    fn failure_is_decorated_with_the_interval_index() {
        let strategy = FailingStrategy { fail_after: 1.0 };
        let mut sim = Simulator::new(strategy, StateAndTime, vec![0.0, 1.0, 2.0, 3.0])
            .expect("simulator");
        let err = sim.run(&ConstantRate, &[0.0], &[], &[1.0]);

        match err {
            Err(Error::StepFailed { interval, source }) => {
                assert_eq!(interval, 1);
                assert!(matches!(*source, Error::Evaluation(_)));
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }
        assert_eq!(sim.phase(), SimPhase::Failed);
    }

    #[test]
    fn rerun_requires_reset() {
        let mut sim = Simulator::new(CountingStrategy::new(), StateAndTime, vec![0.0, 1.0])
            .expect("simulator");
        sim.run(&ConstantRate, &[0.0], &[], &[1.0]).expect("first run");

        let second = sim.run(&ConstantRate, &[0.0], &[], &[1.0]);
        assert!(matches!(second, Err(Error::Configuration(_))));

        sim.reset();
        assert_eq!(sim.phase(), SimPhase::Idle);
        sim.run(&ConstantRate, &[0.0], &[], &[1.0])
            .expect("run after reset");
    }

    #[test]
    fn successful_run_locks_the_model() {
        let mut model = crate::model::Model::new("ramp", ConstantRate);
        model.add_state("x").expect("state");

        let mut sim = Simulator::new(FixedStepRk4::single(), StateAndTime, vec![0.0, 1.0])
            .expect("simulator");
        sim.run(&model, &[0.0], &[], &[1.0]).expect("run");

        assert!(model.is_locked());
        assert!(matches!(model.add_state("y"), Err(Error::Locked)));
    }

    #[test]
    fn action_sample_count_must_match_grid() {
        let mut sim = Simulator::new(CountingStrategy::new(), StateAndTime, vec![0.0, 1.0, 2.0])
            .expect("simulator");
        let err = sim.run(&ConstantRate, &[0.0], &[vec![1.0], vec![1.0]], &[1.0]);
        assert!(matches!(err, Err(Error::Configuration(_))));
    }
}
