mod context;
mod record;

pub use context::{BuildContext, Init};
pub use record::GradientRecord;

use std::collections::HashMap;

use ndarray::{ArrayView1, ArrayView2};

use crate::error::{Result, TrainErr};

/// Stable identity of a parameter inside a `ParameterSet`.
pub type ParamId = usize;

/// Name prefix marking generator parameters; gradients are computed and
/// applied for this partition only.
pub const GENERATOR_PREFIX: &str = "g_";

/// Name suffix marking bias-like parameters, which the L2 term skips.
pub const BIAS_SUFFIX: &str = "/bias";

/// One named tensor of the model.
///
/// Trainable entries receive gradient updates and shadow averaging;
/// non-trainable entries (batch-norm running statistics) are plain state.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    shape: Vec<usize>,
    values: Vec<f32>,
    trainable: bool,
}

impl Parameter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    /// Whether this parameter belongs to the generator partition.
    pub fn is_generator(&self) -> bool {
        self.name.starts_with(GENERATOR_PREFIX)
    }

    /// Whether the L2 term skips this parameter.
    pub fn is_bias(&self) -> bool {
        self.name.ends_with(BIAS_SUFFIX)
    }

    /// Views the flat storage as a matrix. The registry guarantees the
    /// storage length matches the declared shape.
    pub fn view2(&self) -> ArrayView2<'_, f32> {
        debug_assert_eq!(self.shape.len(), 2);
        ArrayView2::from_shape((self.shape[0], self.shape[1]), &self.values).unwrap()
    }

    pub fn view1(&self) -> ArrayView1<'_, f32> {
        debug_assert_eq!(self.shape.len(), 1);
        ArrayView1::from_shape(self.shape[0], &self.values).unwrap()
    }
}

/// The shared, insertion-ordered set of model parameters.
///
/// All replicas resolve against the same set; mutation happens only inside
/// the per-step apply section.
#[derive(Debug, Default)]
pub struct ParameterSet {
    params: Vec<Parameter>,
    index: HashMap<String, ParamId>,
}

impl ParameterSet {
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, id: ParamId) -> &Parameter {
        &self.params[id]
    }

    pub fn get_mut(&mut self, id: ParamId) -> &mut Parameter {
        &mut self.params[id]
    }

    pub fn lookup(&self, name: &str) -> Option<ParamId> {
        self.index.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Parameter)> {
        self.params.iter().enumerate()
    }

    /// Ids of every trainable parameter, in creation order.
    pub fn trainable_ids(&self) -> Vec<ParamId> {
        self.iter()
            .filter(|(_, p)| p.trainable())
            .map(|(id, _)| id)
            .collect()
    }

    /// Ids of the trainable generator partition, in creation order. This is
    /// the ordered list gradient averaging pairs positionally.
    pub fn generator_ids(&self) -> Vec<ParamId> {
        self.iter()
            .filter(|(_, p)| p.trainable() && p.is_generator())
            .map(|(id, _)| id)
            .collect()
    }

    pub(crate) fn insert(
        &mut self,
        name: String,
        shape: Vec<usize>,
        values: Vec<f32>,
        trainable: bool,
    ) -> Result<ParamId> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(TrainErr::SizeMismatch {
                what: "parameter storage",
                got: values.len(),
                expected,
            });
        }

        let id = self.params.len();
        self.index.insert(name.clone(), id);
        self.params.push(Parameter {
            name,
            shape,
            values,
            trainable,
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_with(names: &[(&str, bool)]) -> ParameterSet {
        let mut set = ParameterSet::default();
        for (name, trainable) in names {
            set.insert(name.to_string(), vec![2], vec![0.0; 2], *trainable)
                .unwrap();
        }
        set
    }

    #[test]
    fn generator_partition_follows_prefix_and_trainability() {
        let set = set_with(&[
            ("g_lstm0/w_x", true),
            ("g_lstm0/bias", true),
            ("g_norm/running_mean", false),
            ("step_count", true),
        ]);

        let ids = set.generator_ids();
        assert_eq!(ids, vec![0, 1]);
        assert!(set.get(1).is_bias());
        assert!(!set.get(0).is_bias());
    }

    #[test]
    fn insertion_order_is_stable() {
        let set = set_with(&[("g_b", true), ("g_a", true)]);
        let names: Vec<_> = set.iter().map(|(_, p)| p.name().to_string()).collect();
        assert_eq!(names, vec!["g_b", "g_a"]);
    }

    #[test]
    fn insert_rejects_shape_storage_mismatch() {
        let mut set = ParameterSet::default();
        let err = set
            .insert("g_w".into(), vec![2, 3], vec![0.0; 5], true)
            .unwrap_err();
        assert!(matches!(err, TrainErr::SizeMismatch { .. }));
    }
}
