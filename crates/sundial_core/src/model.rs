use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{Error, Result};
use crate::traits::{ModelFn, Scalar};

/// Bidirectional name <-> index mapping with dense indices from zero.
///
/// Append-only: there is no removal, so an index handed out stays valid for
/// the registry's lifetime.
#[derive(Debug, Default)]
pub struct VariableRegistry {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a name and returns its index.
    pub fn add(&mut self, name: &str) -> Result<usize> {
        if self.index.contains_key(name) {
            return Err(Error::DuplicateName {
                name: name.to_string(),
            });
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        Ok(idx)
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.index.get(name).copied().ok_or_else(|| Error::UnknownName {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Registered names in index order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A continuous-time model: three variable registries (states, actions,
/// outputs) plus the bound model function.
///
/// Variable names must be unique across all three registries. Once the model
/// has been evaluated it locks, and further registration fails with
/// [`Error::Locked`] -- indices handed to running integrations must not be
/// invalidated.
pub struct Model<F> {
    name: String,
    states: VariableRegistry,
    actions: VariableRegistry,
    outputs: VariableRegistry,
    func: F,
    locked: AtomicBool,
}

impl<F> Model<F> {
    /// Binds `func` as the model function for this model's lifetime.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            states: VariableRegistry::new(),
            actions: VariableRegistry::new(),
            outputs: VariableRegistry::new(),
            func,
            locked: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_state(&mut self, name: &str) -> Result<usize> {
        self.assert_unlocked()?;
        self.assert_unique(name)?;
        self.states.add(name)
    }

    pub fn add_action(&mut self, name: &str) -> Result<usize> {
        self.assert_unlocked()?;
        self.assert_unique(name)?;
        self.actions.add(name)
    }

    pub fn add_output(&mut self, name: &str) -> Result<usize> {
        self.assert_unlocked()?;
        self.assert_unique(name)?;
        self.outputs.add(name)
    }

    /// State dimension.
    pub fn nx(&self) -> usize {
        self.states.len()
    }

    /// Action dimension.
    pub fn nu(&self) -> usize {
        self.actions.len()
    }

    /// Output dimension.
    pub fn no(&self) -> usize {
        self.outputs.len()
    }

    /// Combined state + action dimension.
    pub fn nxu(&self) -> usize {
        self.nx() + self.nu()
    }

    pub fn states(&self) -> &VariableRegistry {
        &self.states
    }

    pub fn actions(&self) -> &VariableRegistry {
        &self.actions
    }

    pub fn outputs(&self) -> &VariableRegistry {
        &self.outputs
    }

    pub fn func(&self) -> &F {
        &self.func
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Views a state vector as a name -> value map.
    pub fn state_map<T: Copy>(&self, x: &[T]) -> Result<HashMap<String, T>> {
        Self::vector_map(&self.states, x)
    }

    /// Views an action vector as a name -> value map.
    pub fn action_map<T: Copy>(&self, u: &[T]) -> Result<HashMap<String, T>> {
        Self::vector_map(&self.actions, u)
    }

    /// Packs named state values into a vector in registry index order.
    pub fn pack_state(&self, values: &HashMap<String, f64>) -> Result<Vec<f64>> {
        Self::pack(&self.states, values)
    }

    /// Packs named action values into a vector in registry index order.
    pub fn pack_actions(&self, values: &HashMap<String, f64>) -> Result<Vec<f64>> {
        Self::pack(&self.actions, values)
    }

    /// Evaluates the model function, locking the model on first use and
    /// rejecting non-finite derivative or output entries.
    pub fn eval<T: Scalar>(
        &self,
        x: &[T],
        u: &[T],
        p: &[T],
        t: T,
        dxdt: &mut [T],
        out: &mut [T],
    ) -> Result<()>
    where
        F: ModelFn<T>,
    {
        self.check_len("state", x.len(), self.nx())?;
        self.check_len("action", u.len(), self.nu())?;
        self.check_len("derivative", dxdt.len(), self.nx())?;
        self.check_len("output", out.len(), self.no())?;

        // Single permitted transition; harmless if another thread won.
        let _ = self
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire);

        self.func.eval(x, u, p, t, dxdt, out)?;

        for v in dxdt.iter().chain(out.iter()) {
            if !v.is_finite_value() {
                return Err(Error::Evaluation(format!(
                    "model \"{}\" produced a non-finite value",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn assert_unlocked(&self) -> Result<()> {
        if self.is_locked() {
            Err(Error::Locked)
        } else {
            Ok(())
        }
    }

    fn assert_unique(&self, name: &str) -> Result<()> {
        if self.states.contains(name) || self.actions.contains(name) || self.outputs.contains(name)
        {
            Err(Error::DuplicateName {
                name: name.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn check_len(&self, what: &str, got: usize, want: usize) -> Result<()> {
        if got != want {
            Err(Error::Configuration(format!(
                "model \"{}\": {} vector has length {}, expected {}",
                self.name, what, got, want
            )))
        } else {
            Ok(())
        }
    }

    fn vector_map<T: Copy>(registry: &VariableRegistry, values: &[T]) -> Result<HashMap<String, T>> {
        if values.len() != registry.len() {
            return Err(Error::Configuration(format!(
                "vector has length {}, registry has {} entries",
                values.len(),
                registry.len()
            )));
        }
        Ok(registry
            .names()
            .iter()
            .zip(values)
            .map(|(name, &v)| (name.clone(), v))
            .collect())
    }

    fn pack(registry: &VariableRegistry, values: &HashMap<String, f64>) -> Result<Vec<f64>> {
        for name in values.keys() {
            registry.index_of(name)?;
        }
        let mut packed = Vec::with_capacity(registry.len());
        for name in registry.names() {
            match values.get(name) {
                Some(&v) => packed.push(v),
                None => {
                    return Err(Error::Configuration(format!(
                        "no value supplied for variable \"{name}\""
                    )))
                }
            }
        }
        Ok(packed)
    }
}

/// A model forwards the model-function contract, adding length checks and
/// the lock transition. Anything that steps a `ModelFn` can step a `Model`.
impl<T: Scalar, F: ModelFn<T>> ModelFn<T> for Model<F> {
    fn n_outputs(&self) -> usize {
        self.no()
    }

    fn eval(&self, x: &[T], u: &[T], p: &[T], t: T, dxdt: &mut [T], out: &mut [T]) -> Result<()> {
        Model::eval(self, x, u, p, t, dxdt, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant;

    impl ModelFn<f64> for Constant {
        fn eval(
            &self,
            _x: &[f64],
            _u: &[f64],
            p: &[f64],
            _t: f64,
            dxdt: &mut [f64],
            _out: &mut [f64],
        ) -> Result<()> {
            for d in dxdt.iter_mut() {
                *d = p[0];
            }
            Ok(())
        }
    }

    #[test]
    fn duplicate_name_rejected_and_indices_stay_dense() {
        let mut model = Model::new("m", Constant);
        assert_eq!(model.add_state("x").expect("first add"), 0);
        assert!(matches!(
            model.add_state("x"),
            Err(Error::DuplicateName { .. })
        ));
        // The failed add must not have consumed an index.
        assert_eq!(model.add_state("y").expect("second add"), 1);
        assert_eq!(model.nx(), 2);
    }

    #[test]
    fn names_unique_across_registries() {
        let mut model = Model::new("m", Constant);
        model.add_state("x").expect("state");
        assert!(matches!(
            model.add_action("x"),
            Err(Error::DuplicateName { .. })
        ));
        assert!(matches!(
            model.add_output("x"),
            Err(Error::DuplicateName { .. })
        ));
    }

    #[test]
    fn unknown_name_lookup_fails() {
        let model = Model::new("m", Constant);
        assert!(matches!(
            model.states().index_of("z"),
            Err(Error::UnknownName { .. })
        ));
    }

    #[test]
    fn evaluation_locks_the_model() {
        let mut model = Model::new("m", Constant);
        model.add_state("x").expect("state");
        assert!(!model.is_locked());

        let mut dxdt = [0.0];
        model
            .eval(&[1.0], &[], &[2.0], 0.0, &mut dxdt, &mut [])
            .expect("eval");
        assert!(model.is_locked());
        assert!(matches!(model.add_state("y"), Err(Error::Locked)));
        assert!(matches!(model.add_action("u"), Err(Error::Locked)));
    }

    #[test]
    fn eval_checks_vector_lengths() {
        let mut model = Model::new("m", Constant);
        model.add_state("x").expect("state");
        let mut dxdt = [0.0];
        let err = model.eval(&[1.0, 2.0], &[], &[0.0], 0.0, &mut dxdt, &mut []);
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn pack_and_map_round_trip() {
        let mut model = Model::new("m", Constant);
        model.add_state("pos").expect("pos");
        model.add_state("vel").expect("vel");

        let map = model.state_map(&[1.5, -2.0]).expect("map");
        assert_eq!(map["pos"], 1.5);
        assert_eq!(map["vel"], -2.0);

        let packed = model.pack_state(&map).expect("pack");
        assert_eq!(packed, vec![1.5, -2.0]);
    }

    #[test]
    fn pack_rejects_unknown_and_missing_names() {
        let mut model = Model::new("m", Constant);
        model.add_state("x").expect("x");

        let mut values = HashMap::new();
        values.insert("bogus".to_string(), 1.0);
        assert!(matches!(
            model.pack_state(&values),
            Err(Error::UnknownName { .. })
        ));

        let empty = HashMap::new();
        assert!(matches!(
            model.pack_state(&empty),
            Err(Error::Configuration(_))
        ));
    }

    struct NonFinite;

    impl ModelFn<f64> for NonFinite {
        fn eval(
            &self,
            _x: &[f64],
            _u: &[f64],
            _p: &[f64],
            _t: f64,
            dxdt: &mut [f64],
            _out: &mut [f64],
        ) -> Result<()> {
            dxdt[0] = f64::NAN;
            Ok(())
        }
    }

    #[test]
    fn non_finite_derivative_is_an_evaluation_error() {
        let mut model = Model::new("m", NonFinite);
        model.add_state("x").expect("x");
        let mut dxdt = [0.0];
        let err = model.eval(&[0.0], &[], &[], 0.0, &mut dxdt, &mut []);
        assert!(matches!(err, Err(Error::Evaluation(_))));
    }
}
