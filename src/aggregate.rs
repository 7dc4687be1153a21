use crate::{
    error::{Result, TrainErr},
    optimization::Optimizer,
    params::{GradientRecord, ParamId, ParameterSet},
};

/// Per-parameter gradient-norm clip threshold, fixed by the protocol.
pub const MAX_GRAD_NORM: f32 = 15.0;

/// Gradients averaged across replicas, one buffer per updated parameter.
#[derive(Debug)]
pub struct AveragedGradients {
    entries: Vec<(ParamId, Vec<f32>)>,
}

impl AveragedGradients {
    pub fn get(&self, id: ParamId) -> Option<&[f32]> {
        self.entries
            .iter()
            .find(|(e, _)| *e == id)
            .map(|(_, g)| g.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scales `grad` so its L2 norm does not exceed `max_norm`.
pub fn clip_by_norm(grad: &mut [f32], max_norm: f32) {
    let norm = grad.iter().map(|g| g * g).sum::<f32>().sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        grad.iter_mut().for_each(|g| *g *= scale);
    }
}

/// Synchronous data-parallel gradient averaging and the single apply step.
///
/// Holds one optimizer instance per generator parameter; the apply runs
/// under the caller's write lock together with the shadow update, so the
/// two commit as one.
pub struct GradientAggregator {
    max_grad_norm: f32,
    optimizers: Vec<(ParamId, Box<dyn Optimizer + Send>)>,
}

impl GradientAggregator {
    /// # Arguments
    /// * `params` - The shared parameter set.
    /// * `ids` - The frozen generator-parameter list.
    /// * `factory` - Builds one optimizer per parameter, given its length.
    pub fn new<F>(params: &ParameterSet, ids: &[ParamId], mut factory: F) -> Self
    where
        F: FnMut(usize) -> Box<dyn Optimizer + Send>,
    {
        let optimizers = ids
            .iter()
            .map(|&id| (id, factory(params.get(id).len())))
            .collect();

        Self {
            max_grad_norm: MAX_GRAD_NORM,
            optimizers,
        }
    }

    /// Averages per-replica gradients positionally over the frozen list.
    ///
    /// # Errors
    /// `GradientMismatch` if the records disagree about which parameters
    /// exist, their order, or whether a gradient is present.
    pub fn average(&self, records: &[GradientRecord]) -> Result<AveragedGradients> {
        let Some(first) = records.first() else {
            return Ok(AveragedGradients { entries: vec![] });
        };

        for record in &records[1..] {
            if record.len() != first.len() {
                return Err(TrainErr::GradientMismatch {
                    param: "replica gradient lists differ in length".into(),
                });
            }
        }

        let scale = 1.0 / records.len() as f32;
        let mut entries = Vec::with_capacity(first.len());

        for (pos, entry) in first.entries().iter().enumerate() {
            let mut acc: Option<Vec<f32>> = None;
            let mut present = 0usize;

            for record in records {
                let other = &record.entries()[pos];
                if other.id != entry.id {
                    return Err(TrainErr::GradientMismatch {
                        param: entry.name.clone(),
                    });
                }

                if let Some(grad) = &other.grad {
                    present += 1;
                    match &mut acc {
                        Some(acc) => acc.iter_mut().zip(grad).for_each(|(a, g)| *a += g),
                        slot => *slot = Some(grad.clone()),
                    }
                }
            }

            match present {
                0 => continue,
                n if n == records.len() => {}
                _ => {
                    // Present for some replicas and absent for others:
                    // a desync, never silently dropped.
                    return Err(TrainErr::GradientMismatch {
                        param: entry.name.clone(),
                    });
                }
            }

            let mut avg = acc.unwrap_or_default();
            avg.iter_mut().for_each(|g| *g *= scale);
            entries.push((entry.id, avg));
        }

        Ok(AveragedGradients { entries })
    }

    /// Clips each averaged gradient independently by its own L2 norm.
    pub fn clip(&self, avg: &mut AveragedGradients) {
        for (_, grad) in &mut avg.entries {
            clip_by_norm(grad, self.max_grad_norm);
        }
    }

    /// Applies the averaged, clipped gradients to the shared parameters.
    ///
    /// The caller holds the write lock for the whole apply section; this
    /// method only mutates the targeted parameters.
    pub fn apply(&mut self, params: &mut ParameterSet, avg: &AveragedGradients) -> Result<()> {
        for (id, grad) in &avg.entries {
            let optimizer = self
                .optimizers
                .iter_mut()
                .find(|(opt_id, _)| opt_id == id)
                .map(|(_, opt)| opt)
                .ok_or_else(|| TrainErr::GradientMismatch {
                    param: params.get(*id).name().to_string(),
                })?;

            let weights = params.get_mut(*id).values_mut();
            if weights.len() != grad.len() {
                return Err(TrainErr::SizeMismatch {
                    what: "averaged gradient",
                    got: grad.len(),
                    expected: weights.len(),
                });
            }

            optimizer.update_weights(grad, weights);
        }

        Ok(())
    }
}
