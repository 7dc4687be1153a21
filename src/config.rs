use std::{num::NonZeroUsize, path::PathBuf};

use crate::{device::Device, generator::GeneratorKind};

/// Optimizer selection for the gradient apply step.
#[derive(Debug, Clone, Copy)]
pub enum OptimizerKind {
    Adam { b1: f32, b2: f32, eps: f32 },
    GradientDescent,
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::Adam {
            b1: 0.9,
            b2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Immutable hyperparameters for one training run.
///
/// Created once at startup and read-only thereafter. The gradient-clip
/// threshold and the shadow decay are protocol constants, not configuration
/// (see `aggregate::MAX_GRAD_NORM` and `shadow::MOVING_AVERAGE_DECAY`).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub learning_rate: f32,
    pub batch_size: NonZeroUsize,
    /// Dropout keep-probability between recurrent layers. Forced to 1 in
    /// cross-validation sessions.
    pub keep_prob: f32,
    pub batch_norm: bool,
    /// L2 weight-decay scale; 0 disables the regularization term.
    pub l2_scale: f32,
    /// Feature dimension of one input frame.
    pub input_dim: usize,
    pub output_dim: usize,
    /// Context frames stacked to the left/right of the center frame.
    pub left_context: usize,
    pub right_context: usize,
    pub hidden_units: usize,
    pub generator: GeneratorKind,
    pub optimizer: OptimizerKind,
    /// Ordered compute lanes; one replica is built per entry.
    pub devices: Vec<Device>,
    pub save_dir: PathBuf,
    pub seed: Option<u64>,
}

impl TrainerConfig {
    /// Feature dimension the generator actually sees: the center frame plus
    /// the stacked context window.
    pub fn window_dim(&self) -> usize {
        self.input_dim * (self.left_context + 1 + self.right_context)
    }
}
