use ndarray::{Array3, ArrayView3};
use rand::Rng;

use super::{
    Generator,
    cell::{CellTrace, LstmCell},
    norm::{BatchNorm, NormTrace, NormUpdate},
    proj::Projection,
};
use crate::{
    error::Result,
    params::{BuildContext, GradientRecord, ParameterSet},
};

/// Skip-connection wiring of a residual stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipMode {
    /// Plain stacking, no skips.
    None,
    /// Identity skip over each layer past the first.
    Layer,
    /// Skips spanning two layers.
    Span,
    /// A shared projected-input skip into every layer.
    Input,
}

/// A stack of LSTM layers with optional input normalization, residual
/// wiring, inter-layer dropout, and a linear output projection.
///
/// All shipped generator variants are configurations of this stack.
pub struct StackedLstm {
    cells: Vec<LstmCell>,
    out_proj: Projection,
    in_proj: Option<Projection>,
    input_norm: Option<BatchNorm>,
    skip: SkipMode,
    keep_prob: f32,
}

/// Everything one replica's backward pass needs from its forward pass,
/// plus the generator output.
pub struct Forward {
    norm: Option<NormTrace>,
    /// Network input after optional normalization.
    base: Array3<f32>,
    /// Output of the shared input projection, `Input` mode only.
    in_skip: Option<Array3<f32>>,
    traces: Vec<CellTrace>,
    drop_masks: Vec<Option<Array3<f32>>>,
    /// Input to the output projection.
    top: Array3<f32>,
    pub output: Array3<f32>,
}

impl StackedLstm {
    pub fn new(
        in_dim: usize,
        hidden: usize,
        out_dim: usize,
        layers: usize,
        skip: SkipMode,
        batch_norm: bool,
        keep_prob: f32,
    ) -> Self {
        let cells = (0..layers)
            .map(|l| {
                let cell_in = if l == 0 { in_dim } else { hidden };
                LstmCell::new(format!("g_lstm{l}"), cell_in, hidden)
            })
            .collect();

        let in_proj = match skip {
            SkipMode::Input => Some(Projection::new("g_inproj", in_dim, hidden)),
            _ => None,
        };
        let input_norm = batch_norm.then(|| BatchNorm::new("g_norm", in_dim));

        Self {
            cells,
            out_proj: Projection::new("g_output", hidden, out_dim),
            in_proj,
            input_norm,
            skip,
            keep_prob,
        }
    }

    fn dropout_mask(&self, shape: (usize, usize, usize)) -> Array3<f32> {
        let keep = self.keep_prob;
        let mut rng = rand::rng();
        let mut mask = Array3::<f32>::zeros(shape);
        mask.mapv_inplace(|_| {
            if rng.random_range(0.0..1.0) < keep {
                1.0 / keep
            } else {
                0.0
            }
        });
        mask
    }
}

impl Generator for StackedLstm {
    fn register(&mut self, ctx: &mut BuildContext) -> Result<()> {
        if let Some(norm) = &mut self.input_norm {
            norm.register(ctx)?;
        }
        if let Some(proj) = &mut self.in_proj {
            proj.register(ctx)?;
        }
        for cell in &mut self.cells {
            cell.register(ctx)?;
        }
        self.out_proj.register(ctx)
    }

    fn forward(
        &self,
        params: &ParameterSet,
        inputs: ArrayView3<f32>,
        lengths: &[usize],
        training: bool,
    ) -> Result<Forward> {
        let norm = match &self.input_norm {
            Some(norm) => Some(norm.forward(params, inputs.view(), training)?),
            None => None,
        };
        let base = match &norm {
            Some(trace) => trace.output.clone(),
            None => inputs.to_owned(),
        };

        let in_skip = match &self.in_proj {
            Some(proj) => Some(proj.forward(params, &base)?),
            None => None,
        };

        let dropout = training && self.keep_prob < 1.0;
        let mut traces = Vec::with_capacity(self.cells.len());
        let mut drop_masks = Vec::with_capacity(self.cells.len());
        let mut outs: Vec<Array3<f32>> = Vec::with_capacity(self.cells.len());
        let mut cur = base.clone();

        for (l, cell) in self.cells.iter().enumerate() {
            let trace = cell.forward(params, cur.view(), lengths)?;
            let mut h = trace.hidden().clone();

            match self.skip {
                SkipMode::Layer if l >= 1 => h += &cur,
                SkipMode::Span if l >= 2 => h += &outs[l - 2],
                SkipMode::Input => {
                    if let Some(skip) = &in_skip {
                        h += skip;
                    }
                }
                _ => {}
            }

            let mask = dropout.then(|| self.dropout_mask(h.dim()));
            if let Some(m) = &mask {
                h *= m;
            }

            traces.push(trace);
            drop_masks.push(mask);
            outs.push(h.clone());
            cur = h;
        }

        let output = self.out_proj.forward(params, &cur)?;

        Ok(Forward {
            norm,
            base,
            in_skip,
            traces,
            drop_masks,
            top: cur,
            output,
        })
    }

    fn backward(
        &self,
        params: &ParameterSet,
        fwd: &Forward,
        d_output: &Array3<f32>,
        record: &mut GradientRecord,
    ) -> Result<()> {
        let layers = self.cells.len();

        let d_top = self.out_proj.backward(params, &fwd.top, d_output, record)?;

        let mut d_layers: Vec<Array3<f32>> = fwd
            .traces
            .iter()
            .map(|t| Array3::zeros(t.hidden().dim()))
            .collect();
        d_layers[layers - 1] = d_top;

        let mut d_in_skip = fwd
            .in_skip
            .as_ref()
            .map(|s| Array3::<f32>::zeros(s.dim()));
        let mut d_base = Array3::<f32>::zeros(fwd.base.dim());

        for l in (0..layers).rev() {
            let mut d = std::mem::replace(&mut d_layers[l], Array3::zeros((0, 0, 0)));
            if let Some(mask) = &fwd.drop_masks[l] {
                d *= mask;
            }

            match self.skip {
                SkipMode::Layer if l >= 1 => d_layers[l - 1] += &d,
                SkipMode::Span if l >= 2 => d_layers[l - 2] += &d,
                SkipMode::Input => {
                    if let Some(acc) = &mut d_in_skip {
                        *acc += &d;
                    }
                }
                _ => {}
            }

            let d_in = self.cells[l].backward(params, &fwd.traces[l], &d, record)?;
            if l > 0 {
                d_layers[l - 1] += &d_in;
            } else {
                d_base += &d_in;
            }
        }

        if let (Some(proj), Some(d_skip)) = (&self.in_proj, &d_in_skip) {
            d_base += &proj.backward(params, &fwd.base, d_skip, record)?;
        }

        if let (Some(norm), Some(trace)) = (&self.input_norm, &fwd.norm) {
            // Gradient w.r.t. the raw input is data, not parameters.
            norm.backward(params, trace, &d_base, record)?;
        }

        Ok(())
    }

    fn norm_updates(&self, fwd: &Forward) -> Result<Vec<NormUpdate>> {
        match (&self.input_norm, &fwd.norm) {
            (Some(norm), Some(trace)) if trace.training => {
                Ok(vec![norm.pending_update(trace)?])
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn build(skip: SkipMode, layers: usize, batch_norm: bool, keep_prob: f32) -> StackedLstm {
        StackedLstm::new(4, 3, 2, layers, skip, batch_norm, keep_prob)
    }

    fn registered(
        generator: &mut StackedLstm,
    ) -> (ParameterSet, Vec<crate::params::ParamId>) {
        let mut ctx = BuildContext::new(Some(9));
        generator.register(&mut ctx).unwrap();
        ctx.freeze();
        ctx.into_parts()
    }

    fn sample_inputs() -> (Array3<f32>, Vec<usize>) {
        let inputs = Array::from_shape_fn((2, 3, 4), |(b, t, f)| {
            0.1 * b as f32 + 0.05 * t as f32 - 0.02 * f as f32
        });
        (inputs, vec![3, 3])
    }

    #[test]
    fn output_has_projection_shape() {
        for skip in [SkipMode::None, SkipMode::Layer, SkipMode::Span, SkipMode::Input] {
            let mut generator = build(skip, 3, false, 1.0);
            let (params, _) = registered(&mut generator);
            let (inputs, lengths) = sample_inputs();

            let fwd = generator
                .forward(&params, inputs.view(), &lengths, true)
                .unwrap();
            assert_eq!(fwd.output.dim(), (2, 3, 2));
        }
    }

    #[test]
    fn evaluation_forward_is_deterministic_despite_dropout_config() {
        let mut generator = build(SkipMode::None, 2, false, 0.5);
        let (params, _) = registered(&mut generator);
        let (inputs, lengths) = sample_inputs();

        let a = generator
            .forward(&params, inputs.view(), &lengths, false)
            .unwrap();
        let b = generator
            .forward(&params, inputs.view(), &lengths, false)
            .unwrap();
        assert_eq!(a.output, b.output);
    }

    #[test]
    fn backward_fills_every_trainable_gradient() {
        for (skip, batch_norm) in [
            (SkipMode::None, false),
            (SkipMode::Layer, false),
            (SkipMode::Span, false),
            (SkipMode::Input, false),
            (SkipMode::None, true),
        ] {
            let mut generator = build(skip, 3, batch_norm, 1.0);
            let (params, g_ids) = registered(&mut generator);
            let (inputs, lengths) = sample_inputs();

            let fwd = generator
                .forward(&params, inputs.view(), &lengths, true)
                .unwrap();
            let d_output = Array3::<f32>::ones(fwd.output.dim());

            let mut record = GradientRecord::for_params(&params, &g_ids);
            generator
                .backward(&params, &fwd, &d_output, &mut record)
                .unwrap();

            for &id in &g_ids {
                assert!(
                    record.get(id).is_some(),
                    "missing gradient for {} under {skip:?}",
                    params.get(id).name()
                );
            }
        }
    }

    #[test]
    fn stack_gradient_matches_finite_differences() {
        let mut generator = build(SkipMode::Layer, 2, false, 1.0);
        let (params, g_ids) = registered(&mut generator);
        let (inputs, lengths) = sample_inputs();
        let readout = Array::from_shape_fn((2, 3, 2), |(b, t, f)| {
            0.2 - 0.05 * b as f32 + 0.03 * t as f32 + 0.04 * f as f32
        });

        let loss = |p: &ParameterSet| -> f32 {
            let fwd = generator.forward(p, inputs.view(), &lengths, true).unwrap();
            (&fwd.output * &readout).sum()
        };

        let fwd = generator
            .forward(&params, inputs.view(), &lengths, true)
            .unwrap();
        let mut record = GradientRecord::for_params(&params, &g_ids);
        generator
            .backward(&params, &fwd, &readout, &mut record)
            .unwrap();

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
                    (numeric - analytic[k]).abs() < 1e-2 + 3e-2 * numeric.abs(),
                    "param {} elem {k}: numeric {numeric} vs analytic {}",
                    params.get(id).name(),
                    analytic[k]
                );
            }
        }
    }

    #[test]
    fn norm_updates_only_pend_during_training() {
        let mut generator = build(SkipMode::None, 2, true, 1.0);
        let (params, _) = registered(&mut generator);
        let (inputs, lengths) = sample_inputs();

        let train_fwd = generator
            .forward(&params, inputs.view(), &lengths, true)
            .unwrap();
        assert_eq!(generator.norm_updates(&train_fwd).unwrap().len(), 1);

        let eval_fwd = generator
            .forward(&params, inputs.view(), &lengths, false)
            .unwrap();
        assert!(generator.norm_updates(&eval_fwd).unwrap().is_empty());
    }
}
