use ndarray::{Array1, Array3, ArrayView3, Axis};

use crate::{
    error::{Result, TrainErr},
    params::{BuildContext, GradientRecord, Init, ParamId, ParameterSet},
};

const MOMENTUM: f32 = 0.99;
const EPSILON: f32 = 1e-5;

#[derive(Debug, Clone, Copy)]
struct NormParams {
    gamma: ParamId,
    beta: ParamId,
    r_mean: ParamId,
    r_var: ParamId,
}

/// Batch normalization over the feature axis of `(batch, steps, features)`.
///
/// Training uses batch statistics; evaluation uses the running statistics.
/// The running statistics are plain registry state, folded into the step's
/// apply section rather than mutated during the forward pass, so replicas
/// stay read-only while computing.
pub struct BatchNorm {
    name: String,
    dim: usize,
    ids: Option<NormParams>,
}

pub struct NormTrace {
    x_hat: Array3<f32>,
    inv_std: Array1<f32>,
    batch_mean: Array1<f32>,
    batch_var: Array1<f32>,
    pub(crate) output: Array3<f32>,
    pub(crate) training: bool,
}

/// A pending running-statistics update, committed with the gradient apply.
pub struct NormUpdate {
    r_mean: ParamId,
    r_var: ParamId,
    mean: Vec<f32>,
    var: Vec<f32>,
}

impl NormUpdate {
    /// Folds the batch statistics into the running statistics.
    pub fn apply(&self, params: &mut ParameterSet) {
        let r_mean = params.get_mut(self.r_mean).values_mut();
        for (r, &b) in r_mean.iter_mut().zip(&self.mean) {
            *r = MOMENTUM * *r + (1.0 - MOMENTUM) * b;
        }
        let r_var = params.get_mut(self.r_var).values_mut();
        for (r, &b) in r_var.iter_mut().zip(&self.var) {
            *r = MOMENTUM * *r + (1.0 - MOMENTUM) * b;
        }
    }
}

impl BatchNorm {
    pub fn new(name: impl Into<String>, dim: usize) -> Self {
        Self {
            name: name.into(),
            dim,
            ids: None,
        }
    }

    pub fn register(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let gamma =
            ctx.get_or_create(&format!("{}/gamma", self.name), &[self.dim], Init::Const(1.0))?;
        let beta = ctx.get_or_create(&format!("{}/beta", self.name), &[self.dim], Init::Zeros)?;
        let r_mean = ctx.get_or_create_state(
            &format!("{}/running_mean", self.name),
            &[self.dim],
            Init::Zeros,
        )?;
        let r_var = ctx.get_or_create_state(
            &format!("{}/running_var", self.name),
            &[self.dim],
            Init::Const(1.0),
        )?;

        self.ids = Some(NormParams {
            gamma,
            beta,
            r_mean,
            r_var,
        });
        Ok(())
    }

    fn ids(&self) -> Result<NormParams> {
        self.ids.ok_or_else(|| TrainErr::Configuration {
            detail: format!("{} used before registration", self.name),
        })
    }

    pub fn forward(
        &self,
        params: &ParameterSet,
        inputs: ArrayView3<f32>,
        training: bool,
    ) -> Result<NormTrace> {
        let ids = self.ids()?;
        let (_, _, features) = inputs.dim();

        if features != self.dim {
            return Err(TrainErr::SizeMismatch {
                what: "normalization input",
                got: features,
                expected: self.dim,
            });
        }

        let gamma = params.get(ids.gamma).view1();
        let beta = params.get(ids.beta).view1();

        let (mean, var) = if training {
            let mean = inputs
                .mean_axis(Axis(0))
                .and_then(|m| m.mean_axis(Axis(0)))
                .unwrap_or_else(|| Array1::zeros(self.dim));
            let centered = &inputs - &mean;
            let var = centered
                .mapv(|v| v * v)
                .mean_axis(Axis(0))
                .and_then(|m| m.mean_axis(Axis(0)))
                .unwrap_or_else(|| Array1::zeros(self.dim));
            (mean, var)
        } else {
            (
                params.get(ids.r_mean).view1().to_owned(),
                params.get(ids.r_var).view1().to_owned(),
            )
        };

        let inv_std = var.mapv(|v| 1.0 / (v + EPSILON).sqrt());
        let x_hat = (&inputs - &mean) * &inv_std;
        let output = &(&x_hat * &gamma) + &beta;

        Ok(NormTrace {
            x_hat,
            inv_std,
            batch_mean: mean,
            batch_var: var,
            output,
            training,
        })
    }

    /// # Returns
    /// The gradient with respect to the normalized input.
    pub fn backward(
        &self,
        params: &ParameterSet,
        trace: &NormTrace,
        d_out: &Array3<f32>,
        record: &mut GradientRecord,
    ) -> Result<Array3<f32>> {
        let ids = self.ids()?;
        let (batch, steps, _) = d_out.dim();
        let n = (batch * steps) as f32;

        let gamma = params.get(ids.gamma).view1();

        let sum2 = |a: &Array3<f32>| -> Array1<f32> {
            a.sum_axis(Axis(0)).sum_axis(Axis(0))
        };

        let dbeta = sum2(d_out);
        let dgamma = sum2(&(d_out * &trace.x_hat));

        // dx = gamma * inv_std / n * (n * dy - sum(dy) - x_hat * sum(dy * x_hat))
        let scaled = &(d_out * n) - &dbeta;
        let dx = (&scaled - &(&trace.x_hat * &dgamma)) * &(&gamma * &trace.inv_std) / n;

        record.accumulate(ids.gamma, &dgamma.into_iter().collect::<Vec<_>>())?;
        record.accumulate(ids.beta, &dbeta.into_iter().collect::<Vec<_>>())?;

        Ok(dx)
    }

    /// The running-statistics update owed by a training forward pass.
    pub fn pending_update(&self, trace: &NormTrace) -> Result<NormUpdate> {
        let ids = self.ids()?;
        Ok(NormUpdate {
            r_mean: ids.r_mean,
            r_var: ids.r_var,
            mean: trace.batch_mean.iter().copied().collect(),
            var: trace.batch_var.iter().copied().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn fixture() -> (BatchNorm, ParameterSet) {
        let mut ctx = BuildContext::new(Some(5));
        let mut norm = BatchNorm::new("g_norm", 3);
        norm.register(&mut ctx).unwrap();
        let (params, _) = ctx.into_parts();
        (norm, params)
    }

    #[test]
    fn training_output_is_standardized() {
        let (norm, params) = fixture();
        let x = Array::from_shape_fn((4, 2, 3), |(b, t, f)| (b * 2 + t) as f32 + f as f32 * 10.0);

        let trace = norm.forward(&params, x.view(), true).unwrap();

        for f in 0..3 {
            let col = trace.output.index_axis(Axis(2), f);
            let mean = col.mean().unwrap();
            let var = col.mapv(|v| (v - mean) * (v - mean)).mean().unwrap();
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-2);
        }
    }

    #[test]
    fn evaluation_uses_running_statistics() {
        let (norm, params) = fixture();
        let x = Array::from_shape_fn((2, 2, 3), |(b, t, f)| (b + t + f) as f32);

        // Fresh running stats are mean 0 / var 1: eval output equals
        // gamma * x + beta = x.
        let trace = norm.forward(&params, x.view(), false).unwrap();
        let diff = (&trace.output - &x).mapv(f32::abs).sum();
        assert!(diff < 1e-3);
    }

    #[test]
    fn pending_update_moves_running_stats_toward_batch() {
        let (norm, mut params) = fixture();
        let x = Array::from_shape_fn((8, 4, 3), |(b, t, _)| (b + t) as f32);

        let trace = norm.forward(&params, x.view(), true).unwrap();
        let update = norm.pending_update(&trace).unwrap();

        let before = params.lookup("g_norm/running_mean").unwrap();
        update.apply(&mut params);

        let r_mean = params.get(before).values();
        let batch_mean = trace.batch_mean[0];
        assert!((r_mean[0] - 0.01 * batch_mean).abs() < 1e-4);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let (norm, params) = fixture();
        let g_ids = params.generator_ids();
        let x = Array::from_shape_fn((3, 2, 3), |(b, t, f)| {
            0.5 * b as f32 - 0.2 * t as f32 + 0.1 * (f as f32).powi(2)
        });
        let readout = Array::from_shape_fn((3, 2, 3), |(b, t, f)| {
            0.3 - 0.1 * b as f32 + 0.07 * t as f32 - 0.05 * f as f32
        });

        let loss = |p: &ParameterSet| -> f32 {
            (&norm.forward(p, x.view(), true).unwrap().output * &readout).sum()
        };

        let trace = norm.forward(&params, x.view(), true).unwrap();
        let mut record = GradientRecord::for_params(&params, &g_ids);
        norm.backward(&params, &trace, &readout, &mut record).unwrap();

        let eps = 1e-2_f32;
        let mut probe = ParameterSet::default();
        for (_, p) in params.iter() {
            probe
                .insert(
                    p.name().to_string(),
                    p.shape().to_vec(),
                    p.values().to_vec(),
                    p.trainable(),
                )
                .unwrap();
        }

        for &id in &g_ids {
            let analytic = record.get(id).unwrap().to_vec();
            for k in 0..params.get(id).len() {
                let orig = probe.get(id).values()[k];
                probe.get_mut(id).values_mut()[k] = orig + eps;
                let up = loss(&probe);
                probe.get_mut(id).values_mut()[k] = orig - eps;
                let down = loss(&probe);
                probe.get_mut(id).values_mut()[k] = orig;

                let numeric = (up - down) / (2.0 * eps);
                assert!(
                    (numeric - analytic[k]).abs() < 1e-2 + 2e-2 * numeric.abs(),
                    "param {id} elem {k}: numeric {numeric} vs analytic {}",
                    analytic[k]
                );
            }
        }
    }
}
