use std::path::PathBuf;

use log::{debug, info};
use ndarray::{Array3, ArrayView3, s};
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::{
    aggregate::GradientAggregator,
    checkpoint::CheckpointManager,
    config::{OptimizerKind, TrainerConfig},
    error::{Result, TrainErr},
    generator::{self, Generator, NormUpdate},
    loss::{self, LossReport},
    metrics::MetricsSink,
    optimization::{Adam, GradientDescent, Optimizer},
    params::{BuildContext, GradientRecord, ParamId, ParameterSet},
    replica::{self, DeviceReplica},
    shadow::{MOVING_AVERAGE_DECAY, ShadowTracker},
};

/// Completion marker for one training step.
#[derive(Debug)]
pub struct StepOutcome {
    pub losses: Vec<LossReport>,
    pub applied: bool,
}

/// One training (or cross-validation) run: the generator replicated across
/// devices, the shared parameters, and the per-step synchronization.
///
/// A step fans the batch out across replicas, joins at the step barrier,
/// then commits the averaged update, the shadow update and any pending
/// normalization statistics in one write-locked section. Replicas only ever
/// read the parameters.
pub struct TrainSession {
    config: TrainerConfig,
    cross_validation: bool,
    generator: Box<dyn Generator>,
    params: RwLock<ParameterSet>,
    g_ids: Vec<ParamId>,
    replicas: Vec<DeviceReplica>,
    aggregator: Option<GradientAggregator>,
    shadow: ShadowTracker,
    checkpoints: CheckpointManager,
    sink: Box<dyn MetricsSink>,
    step: u64,
}

impl TrainSession {
    /// Builds the generator, replicates it across the configured devices
    /// and prepares the apply machinery.
    ///
    /// Cross-validation sessions force keep-probability to 1 and build no
    /// optimizer state; their steps never mutate parameters.
    pub fn new(
        config: TrainerConfig,
        cross_validation: bool,
        sink: Box<dyn MetricsSink>,
    ) -> Result<Self> {
        let keep_prob = if cross_validation {
            1.0
        } else {
            config.keep_prob
        };

        let mut generator = generator::build(config.generator, &config, keep_prob);
        let mut ctx = BuildContext::new(config.seed);
        let replicas = replica::replicate(&config.devices, generator.as_mut(), &mut ctx)?;
        let (params, g_ids) = ctx.into_parts();

        let shadow = ShadowTracker::new(&params, MOVING_AVERAGE_DECAY);

        let aggregator = if cross_validation {
            None
        } else {
            let lr = config.learning_rate;
            let kind = config.optimizer;
            let factory = move |len: usize| -> Box<dyn Optimizer + Send> {
                match kind {
                    OptimizerKind::Adam { b1, b2, eps } => {
                        Box::new(Adam::new(len, lr, b1, b2, eps))
                    }
                    OptimizerKind::GradientDescent => Box::new(GradientDescent::new(lr)),
                }
            };
            Some(GradientAggregator::new(&params, &g_ids, factory))
        };

        let checkpoints = CheckpointManager::new(config.save_dir.clone(), config.generator.tag());

        info!(
            replicas = replicas.len(), cross_validation = cross_validation;
            "constructed {} session with {} parameters",
            config.generator,
            params.len()
        );

        Ok(Self {
            config,
            cross_validation,
            generator,
            params: RwLock::new(params),
            g_ids,
            replicas,
            aggregator,
            shadow,
            checkpoints,
            sink,
            step: 0,
        })
    }

    pub fn global_step(&self) -> u64 {
        self.step
    }

    pub fn replicas(&self) -> &[DeviceReplica] {
        &self.replicas
    }

    pub fn generator_ids(&self) -> &[ParamId] {
        &self.g_ids
    }

    /// Read access to the shared parameters.
    pub fn with_params<R>(&self, f: impl FnOnce(&ParameterSet) -> R) -> R {
        f(&self.params.read())
    }

    pub fn shadow(&self) -> &ShadowTracker {
        &self.shadow
    }

    fn validate_batch(
        &self,
        inputs: &ArrayView3<f32>,
        labels: Option<&ArrayView3<f32>>,
        lengths: &[usize],
    ) -> Result<usize> {
        let (batch, steps, in_dim) = inputs.dim();

        if in_dim != self.config.window_dim() {
            return Err(TrainErr::SizeMismatch {
                what: "input frame",
                got: in_dim,
                expected: self.config.window_dim(),
            });
        }
        if lengths.len() != batch {
            return Err(TrainErr::SizeMismatch {
                what: "sequence lengths",
                got: lengths.len(),
                expected: batch,
            });
        }
        if let Some(labels) = labels {
            let (l_batch, l_steps, l_dim) = labels.dim();
            if (l_batch, l_steps) != (batch, steps) || l_dim != self.config.output_dim {
                return Err(TrainErr::SizeMismatch {
                    what: "labels",
                    got: l_batch * l_steps * l_dim,
                    expected: batch * steps * self.config.output_dim,
                });
            }
        }

        Ok(batch)
    }

    /// Rows each replica receives from a batch of `batch` sequences.
    fn rows_per_replica(&self, batch: usize) -> Result<usize> {
        let n = self.replicas.len();
        if batch % n != 0 {
            return Err(TrainErr::Configuration {
                detail: format!("batch of {batch} doesn't split across {n} replicas"),
            });
        }
        Ok(batch / n)
    }

    /// Runs one full synchronous step: parallel forward/backward on every
    /// replica, positional gradient averaging, per-parameter clipping, and
    /// the joined apply + shadow commit. No partial progress is observable
    /// outside the step.
    pub fn train_step(
        &mut self,
        inputs: ArrayView3<f32>,
        labels: ArrayView3<f32>,
        lengths: &[usize],
    ) -> Result<StepOutcome> {
        if self.cross_validation {
            return Err(TrainErr::Configuration {
                detail: "training step requested on a cross-validation session".into(),
            });
        }
        let batch = self.validate_batch(&inputs, Some(&labels), lengths)?;
        let per = self.rows_per_replica(batch)?;

        let generator = self.generator.as_ref();
        let g_ids = &self.g_ids;
        let l2_scale = self.config.l2_scale;

        let results: Result<Vec<(GradientRecord, LossReport, Vec<NormUpdate>)>> = {
            let guard = self.params.read();
            let params = &*guard;

            self.replicas
                .par_iter()
                .map(|rep| {
                    let row0 = rep.index() * per;
                    let row1 = row0 + per;
                    let rep_inputs = inputs.slice(s![row0..row1, .., ..]);
                    let rep_labels = labels.slice(s![row0..row1, .., ..]);
                    let rep_lengths = &lengths[row0..row1];

                    let fwd = generator.forward(params, rep_inputs, rep_lengths, true)?;
                    let mse = loss::mse_loss(fwd.output.view(), rep_labels.view());
                    let d_output = loss::mse_grad(fwd.output.view(), rep_labels);

                    let mut record = GradientRecord::for_params(params, g_ids);
                    generator.backward(params, &fwd, &d_output, &mut record)?;

                    let l2 = if l2_scale > 0.0 {
                        loss::l2_gradient(params, g_ids, l2_scale, &mut record)?;
                        loss::l2_loss(params, g_ids, l2_scale)
                    } else {
                        0.0
                    };

                    let report = LossReport {
                        mse,
                        l2,
                        total: mse + l2,
                    };
                    debug!(
                        replica = rep.index();
                        "{} g_mse_loss={:.6} g_l2_loss={:.6}", rep.scope(), mse, l2
                    );

                    let updates = generator.norm_updates(&fwd)?;
                    Ok((record, report, updates))
                })
                .collect()
        };

        let mut records = Vec::with_capacity(self.replicas.len());
        let mut reports = Vec::with_capacity(self.replicas.len());
        let mut norm_updates = Vec::new();
        for (record, report, updates) in results? {
            records.push(record);
            reports.push(report);
            norm_updates.extend(updates);
        }

        let Some(aggregator) = self.aggregator.as_mut() else {
            return Err(TrainErr::Configuration {
                detail: "session has no apply machinery".into(),
            });
        };

        let mut avg = aggregator.average(&records)?;
        aggregator.clip(&mut avg);

        {
            let mut params = self.params.write();
            aggregator.apply(&mut params, &avg)?;
            for update in &norm_updates {
                update.apply(&mut params);
            }
            self.shadow.update(&params);
        }

        self.step += 1;
        self.sink.record_step(self.step, &reports);

        Ok(StepOutcome {
            losses: reports,
            applied: true,
        })
    }

    /// Forward and losses only; parameters, shadows and running statistics
    /// stay untouched.
    pub fn evaluate(
        &self,
        inputs: ArrayView3<f32>,
        labels: ArrayView3<f32>,
        lengths: &[usize],
    ) -> Result<Vec<LossReport>> {
        let batch = self.validate_batch(&inputs, Some(&labels), lengths)?;
        let per = self.rows_per_replica(batch)?;

        let generator = self.generator.as_ref();
        let guard = self.params.read();
        let params = &*guard;

        self.replicas
            .par_iter()
            .map(|rep| {
                let row0 = rep.index() * per;
                let row1 = row0 + per;
                let rep_inputs = inputs.slice(s![row0..row1, .., ..]);
                let rep_labels = labels.slice(s![row0..row1, .., ..]);

                let fwd = generator.forward(params, rep_inputs, &lengths[row0..row1], false)?;
                let mse = loss::mse_loss(fwd.output.view(), rep_labels);
                Ok(LossReport {
                    mse,
                    l2: 0.0,
                    total: mse,
                })
            })
            .collect()
    }

    /// Inference-only invocation: labels absent, loss assembly skipped,
    /// only the generator output is produced.
    pub fn infer(&self, inputs: ArrayView3<f32>, lengths: &[usize]) -> Result<Array3<f32>> {
        self.validate_batch(&inputs, None, lengths)?;

        let guard = self.params.read();
        let fwd = self
            .generator
            .forward(&guard, inputs, lengths, false)?;
        Ok(fwd.output)
    }

    /// Persists the current parameter and shadow state at the current step.
    pub fn save(&self) -> Result<PathBuf> {
        self.checkpoints
            .save(self.step, &self.params.read(), &self.shadow)
    }

    /// Restores from the save directory; see `CheckpointManager::load`.
    pub fn load(&mut self, checkpoint: Option<&str>, use_shadow: bool) -> Result<bool> {
        let mut params = self.params.write();
        self.checkpoints
            .load(checkpoint, use_shadow, &mut params, Some(&mut self.shadow))
    }
}
