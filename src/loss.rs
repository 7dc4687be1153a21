use ndarray::{Array3, ArrayView3};
use serde::Serialize;

use crate::{
    error::Result,
    params::{GradientRecord, ParamId, ParameterSet},
};

/// Per-replica scalar losses, merged per step by the metrics sink.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LossReport {
    pub mse: f32,
    pub l2: f32,
    pub total: f32,
}

impl LossReport {
    /// Elementwise mean over a set of replica reports.
    pub fn merge(reports: &[LossReport]) -> LossReport {
        if reports.is_empty() {
            return LossReport::default();
        }

        let n = reports.len() as f32;
        let mut merged = LossReport::default();
        for r in reports {
            merged.mse += r.mse;
            merged.l2 += r.l2;
            merged.total += r.total;
        }
        merged.mse /= n;
        merged.l2 /= n;
        merged.total /= n;
        merged
    }
}

/// Regression loss over one replica's output:
/// `0.5 * mean((output - labels)^2) * output_dim`.
pub fn mse_loss(output: ArrayView3<f32>, labels: ArrayView3<f32>) -> f32 {
    let output_dim = output.dim().2;
    let diff = &output - &labels;
    let mean = diff.mapv(|d| d * d).mean().unwrap_or_default();
    0.5 * mean * output_dim as f32
}

/// Gradient of `mse_loss` with respect to the output.
pub fn mse_grad(output: ArrayView3<f32>, labels: ArrayView3<f32>) -> Array3<f32> {
    let output_dim = output.dim().2;
    let scale = output_dim as f32 / output.len() as f32;
    (&output - &labels) * scale
}

/// L2 regularization term over the non-bias generator parameters:
/// `l2_scale * sum(0.5 * ||v||^2)`.
pub fn l2_loss(params: &ParameterSet, ids: &[ParamId], l2_scale: f32) -> f32 {
    if l2_scale <= 0.0 {
        return 0.0;
    }

    let sum: f32 = ids
        .iter()
        .map(|&id| params.get(id))
        .filter(|p| !p.is_bias())
        .map(|p| 0.5 * p.values().iter().map(|v| v * v).sum::<f32>())
        .sum();

    l2_scale * sum
}

/// Adds the L2 term's gradient (`l2_scale * v`) into `record` for every
/// non-bias generator parameter.
pub fn l2_gradient(
    params: &ParameterSet,
    ids: &[ParamId],
    l2_scale: f32,
    record: &mut GradientRecord,
) -> Result<()> {
    if l2_scale <= 0.0 {
        return Ok(());
    }

    for &id in ids {
        let p = params.get(id);
        if p.is_bias() {
            continue;
        }
        let grad: Vec<f32> = p.values().iter().map(|v| l2_scale * v).collect();
        record.accumulate(id, &grad)?;
    }

    Ok(())
}
