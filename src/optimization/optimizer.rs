/// Defines the strategy for moving parameter values from state `t` to `t+1`
/// given an averaged, clipped gradient.
///
/// One optimizer instance exists per generator parameter, so stateful
/// algorithms keep per-parameter moments without any cross-indexing.
pub trait Optimizer {
    /// Updates the provided parameter values in place.
    ///
    /// # Arguments
    /// * `grad` - The averaged gradient paired with `weights`.
    /// * `weights` - The current values of one parameter.
    fn update_weights(&mut self, grad: &[f32], weights: &mut [f32]);
}
