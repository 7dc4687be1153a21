use crate::params::{ParamId, ParameterSet};

/// Decay used for the shadow averages, fixed by the training protocol.
pub const MOVING_AVERAGE_DECAY: f32 = 0.9999;

/// Exponentially-decayed shadow copy of every trainable parameter.
///
/// Updated once per step, after the optimizer has applied the averaged
/// gradients, from the post-update values. Evaluation restores these
/// values instead of the raw trained weights.
pub struct ShadowTracker {
    decay: f32,
    slots: Vec<ShadowSlot>,
}

struct ShadowSlot {
    id: ParamId,
    values: Vec<f32>,
}

impl ShadowTracker {
    /// Initializes one shadow per trainable parameter from its current value.
    pub fn new(params: &ParameterSet, decay: f32) -> Self {
        let slots = params
            .iter()
            .filter(|(_, p)| p.trainable())
            .map(|(id, p)| ShadowSlot {
                id,
                values: p.values().to_vec(),
            })
            .collect();

        Self { decay, slots }
    }

    /// `shadow = decay * shadow + (1 - decay) * value`, over post-update
    /// parameter values.
    pub fn update(&mut self, params: &ParameterSet) {
        let decay = self.decay;

        for slot in &mut self.slots {
            let current = params.get(slot.id).values();
            slot.values
                .iter_mut()
                .zip(current)
                .for_each(|(s, &v)| *s = decay * *s + (1.0 - decay) * v);
        }
    }

    pub fn get(&self, id: ParamId) -> Option<&[f32]> {
        self.slots
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.values.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &[f32])> {
        self.slots.iter().map(|s| (s.id, s.values.as_slice()))
    }

    /// Overwrites one shadow slot, used when restoring a checkpoint.
    pub fn restore(&mut self, id: ParamId, values: &[f32]) -> bool {
        match self.slots.iter_mut().find(|s| s.id == id) {
            Some(slot) if slot.values.len() == values.len() => {
                slot.values.copy_from_slice(values);
                true
            }
            _ => false,
        }
    }
}
