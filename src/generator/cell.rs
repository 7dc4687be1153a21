use ndarray::{Array1, Array2, Array3, ArrayView3, Axis, s};

use crate::{
    error::{Result, TrainErr},
    params::{BuildContext, GradientRecord, Init, ParamId, ParameterSet},
};

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug, Clone, Copy)]
struct CellParams {
    w_x: ParamId,
    w_h: ParamId,
    bias: ParamId,
}

/// One LSTM layer over a padded batch of sequences.
///
/// Gate projections use the combined layout `[i, f, g, o]` along the last
/// axis. Recurrent state is carried unchanged through padded steps, so a
/// sequence's final state does not depend on its padding.
pub struct LstmCell {
    name: String,
    in_dim: usize,
    hidden: usize,
    ids: Option<CellParams>,
}

/// Forward activations one backward pass needs.
#[derive(Debug)]
pub struct CellTrace {
    inputs: Array3<f32>,
    /// Post-activation gates, `(batch, steps, 4 * hidden)`.
    gates: Array3<f32>,
    /// `tanh` of the pre-mask candidate cell, `(batch, steps, hidden)`.
    tanh_c: Array3<f32>,
    cells: Array3<f32>,
    hidden: Array3<f32>,
    /// 1.0 where the timestep is inside the sequence, 0.0 in the padding.
    mask: Array2<f32>,
}

impl CellTrace {
    pub fn hidden(&self) -> &Array3<f32> {
        &self.hidden
    }
}

impl LstmCell {
    pub fn new(name: impl Into<String>, in_dim: usize, hidden: usize) -> Self {
        Self {
            name: name.into(),
            in_dim,
            hidden,
            ids: None,
        }
    }

    /// Resolves this layer's parameters through the shared registry.
    pub fn register(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let four_h = 4 * self.hidden;
        let w_x = ctx.get_or_create(
            &format!("{}/w_x", self.name),
            &[self.in_dim, four_h],
            Init::Glorot,
        )?;
        let w_h = ctx.get_or_create(
            &format!("{}/w_h", self.name),
            &[self.hidden, four_h],
            Init::Glorot,
        )?;
        let bias = ctx.get_or_create(&format!("{}/bias", self.name), &[four_h], Init::Zeros)?;

        self.ids = Some(CellParams { w_x, w_h, bias });
        Ok(())
    }

    fn ids(&self) -> Result<CellParams> {
        self.ids.ok_or_else(|| TrainErr::Configuration {
            detail: format!("{} used before registration", self.name),
        })
    }

    pub fn forward(
        &self,
        params: &ParameterSet,
        inputs: ArrayView3<f32>,
        lengths: &[usize],
    ) -> Result<CellTrace> {
        let ids = self.ids()?;
        let (batch, steps, in_dim) = inputs.dim();

        if in_dim != self.in_dim {
            return Err(TrainErr::SizeMismatch {
                what: "cell input",
                got: in_dim,
                expected: self.in_dim,
            });
        }
        if lengths.len() != batch {
            return Err(TrainErr::SizeMismatch {
                what: "sequence lengths",
                got: lengths.len(),
                expected: batch,
            });
        }

        let h = self.hidden;
        let w_x = params.get(ids.w_x).view2();
        let w_h = params.get(ids.w_h).view2();
        let bias = params.get(ids.bias).view1();

        let mut mask = Array2::<f32>::zeros((batch, steps));
        for (b, &len) in lengths.iter().enumerate() {
            for t in 0..len.min(steps) {
                mask[[b, t]] = 1.0;
            }
        }

        let mut gates = Array3::<f32>::zeros((batch, steps, 4 * h));
        let mut tanh_c = Array3::<f32>::zeros((batch, steps, h));
        let mut cells = Array3::<f32>::zeros((batch, steps, h));
        let mut hidden = Array3::<f32>::zeros((batch, steps, h));

        let mut h_prev = Array2::<f32>::zeros((batch, h));
        let mut c_prev = Array2::<f32>::zeros((batch, h));

        for t in 0..steps {
            let x_t = inputs.slice(s![.., t, ..]);
            let mut pre = x_t.dot(&w_x) + h_prev.dot(&w_h);
            pre += &bias;

            pre.slice_mut(s![.., 0..h]).mapv_inplace(sigmoid);
            pre.slice_mut(s![.., h..2 * h]).mapv_inplace(sigmoid);
            pre.slice_mut(s![.., 2 * h..3 * h]).mapv_inplace(f32::tanh);
            pre.slice_mut(s![.., 3 * h..4 * h]).mapv_inplace(sigmoid);
            gates.slice_mut(s![.., t, ..]).assign(&pre);

            let i = pre.slice(s![.., 0..h]);
            let f = pre.slice(s![.., h..2 * h]);
            let g = pre.slice(s![.., 2 * h..3 * h]);
            let o = pre.slice(s![.., 3 * h..4 * h]);

            let c_hat = &(&f * &c_prev) + &(&i * &g);
            let tanh_ct = c_hat.mapv(f32::tanh);
            let h_hat = &o * &tanh_ct;

            let m = mask.slice(s![.., t..t + 1]).to_owned();
            let inv_m = m.mapv(|v| 1.0 - v);

            let c_t = &(&c_hat * &m) + &(&c_prev * &inv_m);
            let h_t = &(&h_hat * &m) + &(&h_prev * &inv_m);

            tanh_c.slice_mut(s![.., t, ..]).assign(&tanh_ct);
            cells.slice_mut(s![.., t, ..]).assign(&c_t);
            hidden.slice_mut(s![.., t, ..]).assign(&h_t);

            h_prev = h_t;
            c_prev = c_t;
        }

        Ok(CellTrace {
            inputs: inputs.to_owned(),
            gates,
            tanh_c,
            cells,
            hidden,
            mask,
        })
    }

    /// Backpropagates `d_hidden` through the full sequence, accumulating
    /// parameter gradients into `record`.
    ///
    /// # Returns
    /// The gradient with respect to this layer's inputs.
    pub fn backward(
        &self,
        params: &ParameterSet,
        trace: &CellTrace,
        d_hidden: &Array3<f32>,
        record: &mut GradientRecord,
    ) -> Result<Array3<f32>> {
        let ids = self.ids()?;
        let (batch, steps, in_dim) = trace.inputs.dim();
        let h = self.hidden;

        let w_x = params.get(ids.w_x).view2();
        let w_h = params.get(ids.w_h).view2();

        let mut dw_x = Array2::<f32>::zeros((in_dim, 4 * h));
        let mut dw_h = Array2::<f32>::zeros((h, 4 * h));
        let mut db = Array1::<f32>::zeros(4 * h);
        let mut d_inputs = Array3::<f32>::zeros((batch, steps, in_dim));

        let mut dh_rec = Array2::<f32>::zeros((batch, h));
        let mut dc_rec = Array2::<f32>::zeros((batch, h));
        let zero_state = Array2::<f32>::zeros((batch, h));

        for t in (0..steps).rev() {
            let m = trace.mask.slice(s![.., t..t + 1]).to_owned();
            let inv_m = m.mapv(|v| 1.0 - v);

            let dh_total = &d_hidden.slice(s![.., t, ..]) + &dh_rec;
            let dh_hat = &dh_total * &m;

            let gates = trace.gates.slice(s![.., t, ..]);
            let i = gates.slice(s![.., 0..h]);
            let f = gates.slice(s![.., h..2 * h]);
            let g = gates.slice(s![.., 2 * h..3 * h]);
            let o = gates.slice(s![.., 3 * h..4 * h]);
            let tanh_ct = trace.tanh_c.slice(s![.., t, ..]);

            let c_prev = if t == 0 {
                zero_state.view()
            } else {
                trace.cells.slice(s![.., t - 1, ..])
            };
            let h_prev = if t == 0 {
                zero_state.view()
            } else {
                trace.hidden.slice(s![.., t - 1, ..])
            };

            let dtanh = tanh_ct.mapv(|v| 1.0 - v * v);
            let dc_hat = &(&dc_rec * &m) + &(&(&dh_hat * &o) * &dtanh);

            let d_o = &dh_hat * &tanh_ct;
            let d_i = &dc_hat * &g;
            let d_f = &dc_hat * &c_prev;
            let d_g = &dc_hat * &i;

            let mut d_pre = Array2::<f32>::zeros((batch, 4 * h));
            {
                let mut slot = d_pre.slice_mut(s![.., 0..h]);
                slot.assign(&d_i);
                slot.zip_mut_with(&i, |d, &s| *d *= s * (1.0 - s));
            }
            {
                let mut slot = d_pre.slice_mut(s![.., h..2 * h]);
                slot.assign(&d_f);
                slot.zip_mut_with(&f, |d, &s| *d *= s * (1.0 - s));
            }
            {
                let mut slot = d_pre.slice_mut(s![.., 2 * h..3 * h]);
                slot.assign(&d_g);
                slot.zip_mut_with(&g, |d, &v| *d *= 1.0 - v * v);
            }
            {
                let mut slot = d_pre.slice_mut(s![.., 3 * h..4 * h]);
                slot.assign(&d_o);
                slot.zip_mut_with(&o, |d, &s| *d *= s * (1.0 - s));
            }

            let x_t = trace.inputs.slice(s![.., t, ..]);
            dw_x += &x_t.t().dot(&d_pre);
            dw_h += &h_prev.t().dot(&d_pre);
            db += &d_pre.sum_axis(Axis(0));

            d_inputs.slice_mut(s![.., t, ..]).assign(&d_pre.dot(&w_x.t()));

            dh_rec = &d_pre.dot(&w_h.t()) + &(&dh_total * &inv_m);
            dc_rec = &(&dc_hat * &f) + &(&dc_rec * &inv_m);
        }

        record.accumulate(ids.w_x, &dw_x.into_iter().collect::<Vec<_>>())?;
        record.accumulate(ids.w_h, &dw_h.into_iter().collect::<Vec<_>>())?;
        record.accumulate(ids.bias, &db.into_iter().collect::<Vec<_>>())?;

        Ok(d_inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn fixture() -> (LstmCell, ParameterSet, Array3<f32>, Vec<usize>) {
        let mut ctx = BuildContext::new(Some(42));
        let mut cell = LstmCell::new("g_lstm0", 2, 3);
        cell.register(&mut ctx).unwrap();
        let (params, _) = ctx.into_parts();

        let inputs = Array::from_shape_fn((2, 3, 2), |(b, t, f)| {
            0.3 * (b as f32 - 0.5) + 0.2 * t as f32 - 0.1 * f as f32
        });
        let lengths = vec![3, 2];

        (cell, params, inputs, lengths)
    }

    #[test]
    fn forward_shapes_and_padding() {
        let (cell, params, inputs, lengths) = fixture();
        let trace = cell.forward(&params, inputs.view(), &lengths).unwrap();

        assert_eq!(trace.hidden().dim(), (2, 3, 3));
        // Sequence 1 ends at t=2: state is carried through the padding.
        let h_t1 = trace.hidden.slice(s![1, 1, ..]).to_owned();
        let h_t2 = trace.hidden.slice(s![1, 2, ..]).to_owned();
        assert_eq!(h_t1, h_t2);
    }

    #[test]
    fn forward_is_deterministic() {
        let (cell, params, inputs, lengths) = fixture();
        let a = cell.forward(&params, inputs.view(), &lengths).unwrap();
        let b = cell.forward(&params, inputs.view(), &lengths).unwrap();
        assert_eq!(a.hidden, b.hidden);
    }

    #[test]
    fn unregistered_cell_is_a_configuration_error() {
        let cell = LstmCell::new("g_lstm0", 2, 3);
        let params = ParameterSet::default();
        let inputs = Array3::<f32>::zeros((1, 1, 2));

        let err = cell.forward(&params, inputs.view(), &[1]).unwrap_err();
        assert!(matches!(err, TrainErr::Configuration { .. }));
    }

    #[test]
    fn backward_matches_finite_differences() {
        let (cell, params, inputs, lengths) = fixture();
        let g_ids = params.generator_ids();

        // Fixed linear readout makes d(loss)/d(hidden) constant.
        let readout = Array::from_shape_fn((2, 3, 3), |(b, t, f)| {
            0.05 * (b + 1) as f32 - 0.03 * t as f32 + 0.07 * f as f32
        });

        let loss = |p: &ParameterSet| -> f32 {
            let trace = cell.forward(p, inputs.view(), &lengths).unwrap();
            (trace.hidden() * &readout).sum()
        };

        let trace = cell.forward(&params, inputs.view(), &lengths).unwrap();
        let mut record = GradientRecord::for_params(&params, &g_ids);
        cell.backward(&params, &trace, &readout, &mut record).unwrap();

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
            let len = params.get(id).len();
            let analytic = record.get(id).unwrap().to_vec();
            for k in 0..len {
                let orig = probe.get(id).values()[k];
                probe.get_mut(id).values_mut()[k] = orig + eps;
                let up = loss(&probe);
                probe.get_mut(id).values_mut()[k] = orig - eps;
                let down = loss(&probe);
                probe.get_mut(id).values_mut()[k] = orig;

                let numeric = (up - down) / (2.0 * eps);
                let diff = (numeric - analytic[k]).abs();
                assert!(
                    diff < 1e-2 + 3e-2 * numeric.abs(),
                    "param {id} elem {k}: numeric {numeric} vs analytic {}",
                    analytic[k]
                );
            }
        }
    }

    #[test]
    fn padded_steps_produce_no_gradient() {
        let (cell, params, inputs, _) = fixture();
        let g_ids = params.generator_ids();

        // Everything masked: no step contributes.
        let lengths = vec![0, 0];
        let trace = cell.forward(&params, inputs.view(), &lengths).unwrap();
        let d_hidden = Array3::<f32>::ones((2, 3, 3));

        let mut record = GradientRecord::for_params(&params, &g_ids);
        let d_in = cell.backward(&params, &trace, &d_hidden, &mut record).unwrap();

        assert!(d_in.iter().all(|&v| v == 0.0));
        for &id in &g_ids {
            assert!(record.get(id).unwrap().iter().all(|&v| v == 0.0));
        }
    }
}
