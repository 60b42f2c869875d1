use std::fmt::Debug;

use crate::error::{Error, Result};
use crate::tensor::{Shape, SyncState, Tensor};

/// One stage of a [`Network`](crate::Network).
///
/// A layer owns its output and input-gradient tensors and overwrites them on
/// every call. `backward` always pairs with the most recent `forward`: it
/// reads the activations cached by that call and must receive the same
/// `input` tensor contents.
pub trait Layer: Debug {
    fn name(&self) -> &'static str;

    /// Per-sample shape this layer consumes.
    fn input_shape(&self) -> Shape;

    /// Per-sample shape this layer produces; a pure function of the input
    /// shape and construction-time hyperparameters.
    fn output_shape(&self) -> Shape;

    fn forward(&mut self, input: &Tensor, training: bool) -> Result<&Tensor>;

    /// Computes the gradient with respect to `input`, plus parameter
    /// gradients for parametric layers.
    ///
    /// For a terminal layer `upstream` is the target; otherwise it is the
    /// gradient with respect to this layer's output.
    fn backward(&mut self, input: &Tensor, upstream: &Tensor) -> Result<&Tensor>;

    /// Output of the last `forward`.
    fn output(&self) -> &Tensor;

    /// Input gradient of the last `backward`.
    fn input_grad(&self) -> &Tensor;

    /// True for layers whose `backward` takes a target instead of a gradient.
    fn is_terminal(&self) -> bool {
        false
    }

    /// `param -= learning_rate * grad` for every parameter tensor.
    fn update_weights(&mut self, _learning_rate: f32) -> Result<()> {
        Ok(())
    }

    /// Parameter tensors in persistence order (weight, then bias).
    fn params(&self) -> Vec<&Tensor> {
        Vec::new()
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        Vec::new()
    }
}

/// Checks that `input` holds a whole number of samples of `sample` and
/// returns that number.
pub(crate) fn batch_of(context: &'static str, sample: Shape, input: &Tensor) -> Result<usize> {
    let batch = sample.batch_in(input.len())?;
    if input.sync_state() == SyncState::HostAhead {
        return Err(Error::Unsynced(context));
    }
    Ok(batch)
}
