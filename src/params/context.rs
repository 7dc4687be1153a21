use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{ParamId, ParameterSet};
use crate::error::{Result, TrainErr};

/// Initialization scheme for a freshly created parameter.
#[derive(Debug, Clone, Copy)]
pub enum Init {
    Zeros,
    Const(f32),
    /// Glorot uniform over the first two shape dimensions.
    Glorot,
}

/// Explicit build-time state threaded through replica construction.
///
/// Owns the shared parameter set and the reuse flag. Replica 0 creates
/// parameters; every later replica must resolve the exact same identities.
/// After replica 0 the trainable generator list is frozen, and any attempt
/// to create a new parameter is a desync.
pub struct BuildContext {
    params: ParameterSet,
    reuse: bool,
    frozen: Option<Vec<ParamId>>,
    rng: StdRng,
}

impl BuildContext {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            params: ParameterSet::default(),
            reuse: false,
            frozen: None,
            rng,
        }
    }

    /// Marks subsequent registrations as reusing existing parameters.
    pub fn set_reuse(&mut self, reuse: bool) {
        self.reuse = reuse;
    }

    pub fn reuse(&self) -> bool {
        self.reuse
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    /// Resolves `name` to its parameter id, creating it on first use.
    ///
    /// # Errors
    /// `GradientMismatch` if the parameter is missing while the context is
    /// in reuse mode or the trainable list is frozen; `SizeMismatch` if it
    /// exists with a different shape.
    pub fn get_or_create(&mut self, name: &str, shape: &[usize], init: Init) -> Result<ParamId> {
        self.resolve(name, shape, init, true)
    }

    /// Like `get_or_create` for non-trainable state (running statistics).
    pub fn get_or_create_state(
        &mut self,
        name: &str,
        shape: &[usize],
        init: Init,
    ) -> Result<ParamId> {
        self.resolve(name, shape, init, false)
    }

    fn resolve(
        &mut self,
        name: &str,
        shape: &[usize],
        init: Init,
        trainable: bool,
    ) -> Result<ParamId> {
        if let Some(id) = self.params.lookup(name) {
            let existing = self.params.get(id);
            if existing.shape() != shape {
                return Err(TrainErr::SizeMismatch {
                    what: "parameter shape",
                    got: shape.iter().product(),
                    expected: existing.len(),
                });
            }
            return Ok(id);
        }

        if self.reuse || self.frozen.is_some() {
            return Err(TrainErr::GradientMismatch { param: name.into() });
        }

        let len: usize = shape.iter().product();
        let values = match init {
            Init::Zeros => vec![0.0; len],
            Init::Const(c) => vec![c; len],
            Init::Glorot => {
                let (fan_in, fan_out) = match shape {
                    [rows, cols, ..] => (*rows, *cols),
                    [n] => (*n, *n),
                    [] => (1, 1),
                };
                let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                (0..len)
                    .map(|_| self.rng.random_range(-limit..limit))
                    .collect()
            }
        };

        self.params.insert(name.to_string(), shape.to_vec(), values, trainable)
    }

    /// Fixes the trainable generator-parameter list used by all subsequent
    /// replicas and every later step. Called once, after replica 0.
    pub fn freeze(&mut self) {
        if self.frozen.is_none() {
            self.frozen = Some(self.params.generator_ids());
        }
    }

    pub fn frozen(&self) -> Option<&[ParamId]> {
        self.frozen.as_deref()
    }

    /// Consumes the context once construction is done.
    ///
    /// # Returns
    /// The shared parameter set and the frozen generator list.
    pub fn into_parts(self) -> (ParameterSet, Vec<ParamId>) {
        let frozen = self
            .frozen
            .unwrap_or_else(|| self.params.generator_ids());
        (self.params, frozen)
    }
}
