//! Multi-lane synchronous trainer for a speech-enhancement generator.
//!
//! One replica of the generator runs per compute lane, all replicas sharing
//! a single parameter set. Every step averages the replicas' gradients
//! positionally, clips each averaged gradient by its own norm, applies the
//! update through one optimizer per parameter and refreshes a shadow
//! (moving-average) copy of the trainable parameters, all as one atomic
//! commit. Checkpoints persist both the raw and the shadow values;
//! evaluation restores the shadows.

pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod error;
pub mod generator;
pub mod loss;
pub mod metrics;
pub mod optimization;
pub mod params;
pub mod replica;
pub mod session;
pub mod shadow;

pub use config::{OptimizerKind, TrainerConfig};
pub use error::{Result, TrainErr};
pub use session::{StepOutcome, TrainSession};
