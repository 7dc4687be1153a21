use ndarray::{Array1, Array2, Array3, Axis, s};

use crate::{
    error::{Result, TrainErr},
    params::{BuildContext, GradientRecord, Init, ParamId, ParameterSet},
};

#[derive(Debug, Clone, Copy)]
struct ProjParams {
    weights: ParamId,
    bias: ParamId,
}

/// A linear per-frame projection applied at every timestep.
pub struct Projection {
    name: String,
    in_dim: usize,
    out_dim: usize,
    ids: Option<ProjParams>,
}

impl Projection {
    pub fn new(name: impl Into<String>, in_dim: usize, out_dim: usize) -> Self {
        Self {
            name: name.into(),
            in_dim,
            out_dim,
            ids: None,
        }
    }

    pub fn register(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let weights = ctx.get_or_create(
            &format!("{}/weights", self.name),
            &[self.in_dim, self.out_dim],
            Init::Glorot,
        )?;
        let bias =
            ctx.get_or_create(&format!("{}/bias", self.name), &[self.out_dim], Init::Zeros)?;

        self.ids = Some(ProjParams { weights, bias });
        Ok(())
    }

    fn ids(&self) -> Result<ProjParams> {
        self.ids.ok_or_else(|| TrainErr::Configuration {
            detail: format!("{} used before registration", self.name),
        })
    }

    pub fn forward(&self, params: &ParameterSet, x: &Array3<f32>) -> Result<Array3<f32>> {
        let ids = self.ids()?;
        let (batch, steps, in_dim) = x.dim();

        if in_dim != self.in_dim {
            return Err(TrainErr::SizeMismatch {
                what: "projection input",
                got: in_dim,
                expected: self.in_dim,
            });
        }

        let w = params.get(ids.weights).view2();
        let b = params.get(ids.bias).view1();

        let mut out = Array3::<f32>::zeros((batch, steps, self.out_dim));
        for t in 0..steps {
            let x_t = x.slice(s![.., t, ..]);
            out.slice_mut(s![.., t, ..]).assign(&x_t.dot(&w));
        }
        out += &b;

        Ok(out)
    }

    /// # Returns
    /// The gradient with respect to the projection's input.
    pub fn backward(
        &self,
        params: &ParameterSet,
        x: &Array3<f32>,
        d_out: &Array3<f32>,
        record: &mut GradientRecord,
    ) -> Result<Array3<f32>> {
        let ids = self.ids()?;
        let (batch, steps, _) = x.dim();

        let w = params.get(ids.weights).view2();

        let mut dw = Array2::<f32>::zeros((self.in_dim, self.out_dim));
        let mut db = Array1::<f32>::zeros(self.out_dim);
        let mut dx = Array3::<f32>::zeros((batch, steps, self.in_dim));

        for t in 0..steps {
            let x_t = x.slice(s![.., t, ..]);
            let d_t = d_out.slice(s![.., t, ..]);

            dw += &x_t.t().dot(&d_t);
            db += &d_t.sum_axis(Axis(0));
            dx.slice_mut(s![.., t, ..]).assign(&d_t.dot(&w.t()));
        }

        record.accumulate(ids.weights, &dw.into_iter().collect::<Vec<_>>())?;
        record.accumulate(ids.bias, &db.into_iter().collect::<Vec<_>>())?;

        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn fixture() -> (Projection, ParameterSet) {
        let mut ctx = BuildContext::new(Some(3));
        let mut proj = Projection::new("g_output", 3, 2);
        proj.register(&mut ctx).unwrap();
        let (params, _) = ctx.into_parts();
        (proj, params)
    }

    #[test]
    fn forward_applies_per_timestep() {
        let (proj, params) = fixture();
        let x = Array::from_shape_fn((2, 4, 3), |(b, t, f)| (b + t + f) as f32 * 0.1);

        let out = proj.forward(&params, &x).unwrap();
        assert_eq!(out.dim(), (2, 4, 2));

        // Same frame in, same frame out, wherever it sits in time.
        let single = x.slice(s![0..1, 1..2, ..]).to_owned();
        let single_out = proj.forward(&params, &single).unwrap();
        let expected = out.slice(s![0, 1, ..]).to_owned();
        assert_eq!(single_out.slice(s![0, 0, ..]).to_owned(), expected);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let (proj, params) = fixture();
        let g_ids = params.generator_ids();
        let x = Array::from_shape_fn((2, 2, 3), |(b, t, f)| {
            0.2 * b as f32 - 0.1 * t as f32 + 0.3 * f as f32
        });
        let readout = Array::from_shape_fn((2, 2, 2), |(b, t, f)| {
            0.4 - 0.1 * b as f32 + 0.05 * t as f32 - 0.2 * f as f32
        });

        let loss = |p: &ParameterSet| -> f32 {
            (&proj.forward(p, &x).unwrap() * &readout).sum()
        };

        let mut record = GradientRecord::for_params(&params, &g_ids);
        proj.backward(&params, &x, &readout, &mut record).unwrap();

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
