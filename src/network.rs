use std::fmt;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TrainConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::init::WeightInit;
use crate::layer::Layer;
use crate::layers::conv2d::Conv2dConfig;
use crate::layers::{Conv2d, Dropout, FullyConnected, MaxPool, Relu, Softmax, SumOfSquares};
use crate::tensor::{Shape, Tensor};
use crate::weights;

/// Where a network stands in the forward → backward → update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Any forward may run next.
    Ready,
    /// A training forward ran; `backward` may consume its activations.
    AwaitingBackward,
    /// Gradients are fresh; `update_weights` may apply them once.
    AwaitingUpdate,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Ready => "ready",
            Phase::AwaitingBackward => "awaiting backward",
            Phase::AwaitingUpdate => "awaiting update",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered stack of layers trained by backpropagation.
///
/// Forward runs the layers in insertion order, backward in reverse starting
/// from the terminal loss layer. Every buffer lives on one [`Device`].
#[derive(Debug)]
pub struct Network {
    device: Device,
    input_shape: Shape,
    layers: Vec<Box<dyn Layer>>,
    /// Device copy of the last training input, read by the first layer's
    /// backward.
    input: Tensor,
    init: WeightInit,
    rng: StdRng,
    phase: Phase,
}

impl Network {
    /// Empty network consuming samples of `input_dims`, e.g. `[28, 28, 1]`.
    pub fn new(device: Device, input_dims: &[usize]) -> Result<Self> {
        let input_shape = Shape::new(input_dims)?;
        Ok(Network {
            input: Tensor::with_shape(&device, input_shape)?,
            device,
            input_shape,
            layers: Vec::new(),
            init: WeightInit::default(),
            rng: StdRng::seed_from_u64(TrainConfig::default().seed),
            phase: Phase::Ready,
        })
    }

    /// Reseeds weight initialisation and dropout masks for layers added
    /// afterwards.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Initialisation strategy for parametric layers added afterwards.
    pub fn with_init(mut self, init: WeightInit) -> Self {
        self.init = init;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn input_shape(&self) -> Shape {
        self.input_shape
    }

    /// Per-sample output shape of the last layer, or the input shape of an
    /// empty network.
    pub fn output_shape(&self) -> Shape {
        self.layers
            .last()
            .map_or(self.input_shape, |layer| layer.output_shape())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn layers(&self) -> impl Iterator<Item = &dyn Layer> {
        self.layers.iter().map(|layer| &**layer)
    }

    /// Number of trainable scalars.
    pub fn parameter_count(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }

    /// Appends a layer whose input shape must equal the current output shape.
    pub fn add_layer(&mut self, layer: Box<dyn Layer>) -> Result<&mut Self> {
        if let Some(last) = self.layers.last() {
            if last.is_terminal() {
                return Err(Error::config(format!(
                    "cannot add {} after terminal layer {}",
                    layer.name(),
                    last.name()
                )));
            }
        }
        if layer.input_shape() != self.output_shape() {
            return Err(Error::ShapeMismatch {
                context: layer.name(),
                expected: self.output_shape(),
                got: layer.input_shape(),
            });
        }
        self.layers.push(layer);
        self.phase = Phase::Ready;
        Ok(self)
    }

    pub fn add_fc(&mut self, in_units: usize, out_units: usize) -> Result<&mut Self> {
        let input = self.output_shape();
        if input.numel() != in_units {
            return Err(Error::ShapeMismatch {
                context: "fully_connected input",
                expected: Shape::new(&[in_units])?,
                got: input,
            });
        }
        let layer = FullyConnected::new(&self.device, input, out_units, self.init, &mut self.rng)?;
        self.add_layer(Box::new(layer))
    }

    /// Appends a square-kernel convolution over the current `[w, h, c]` output
    ///
    /// # Arguments
    ///
    /// * `kernel` - Kernel width and height
    /// * `in_channels` - Must equal the current output's channel count
    /// * `out_channels` - Number of filters
    /// * `stride` - Step between kernel applications
    /// * `padding` - Zero border added on every side
    pub fn add_conv2d(
        &mut self,
        kernel: usize,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        padding: usize,
    ) -> Result<&mut Self> {
        let config = Conv2dConfig::new(kernel, in_channels, out_channels, stride, padding);
        let layer = Conv2d::new(&self.device, self.output_shape(), config, self.init, &mut self.rng)?;
        self.add_layer(Box::new(layer))
    }

    pub fn add_max_pool(&mut self) -> Result<&mut Self> {
        let layer = MaxPool::new(&self.device, self.output_shape())?;
        self.add_layer(Box::new(layer))
    }

    pub fn add_dropout(&mut self, rate: f32) -> Result<&mut Self> {
        let seed = self.rng.random::<u64>();
        let layer = Dropout::new(&self.device, self.output_shape(), rate, seed)?;
        self.add_layer(Box::new(layer))
    }

    pub fn add_relu(&mut self) -> Result<&mut Self> {
        let layer = Relu::new(&self.device, self.output_shape())?;
        self.add_layer(Box::new(layer))
    }

    pub fn add_softmax(&mut self) -> Result<&mut Self> {
        let layer = Softmax::new(&self.device, self.output_shape())?;
        self.add_layer(Box::new(layer))
    }

    pub fn add_sum_of_squares(&mut self) -> Result<&mut Self> {
        let layer = SumOfSquares::new(&self.device, self.output_shape())?;
        self.add_layer(Box::new(layer))
    }

    /// Runs `input` (device copy, `[..sample, batch]`) through every layer and
    /// returns the last layer's output, still on the device.
    ///
    /// # Arguments
    ///
    /// * `input` - Pushed tensor holding a whole number of samples
    /// * `training` - Enables dropout and arms `backward`
    pub fn forward(&mut self, input: &Tensor, training: bool) -> Result<&Tensor> {
        self.phase = Phase::Ready;
        if self.layers.is_empty() {
            return Err(Error::config("forward through a network with no layers"));
        }
        self.input_shape.batch_in(input.len())?;
        if training {
            self.input.copy_from(input)?;
        }

        for i in 0..self.layers.len() {
            let (done, rest) = self.layers.split_at_mut(i);
            let x = match done.last() {
                Some(prev) => prev.output(),
                None => input,
            };
            rest[0].forward(x, training)?;
        }

        if training {
            self.phase = Phase::AwaitingBackward;
        }
        self.output()
    }

    /// Output of the last forward.
    pub fn output(&self) -> Result<&Tensor> {
        self.layers
            .last()
            .map(|layer| layer.output())
            .ok_or_else(|| Error::config("network has no layers"))
    }

    /// Backpropagates from the terminal layer, given the target of the last
    /// training forward.
    pub fn backward(&mut self, target: &Tensor) -> Result<()> {
        self.expect_phase("backward", Phase::AwaitingBackward)?;
        self.phase = Phase::Ready;

        match self.layers.last() {
            Some(last) if last.is_terminal() => {}
            Some(last) => {
                return Err(Error::config(format!(
                    "backward needs a terminal loss layer, the stack ends in {}",
                    last.name()
                )))
            }
            None => return Err(Error::config("backward through a network with no layers")),
        }

        for i in (0..self.layers.len()).rev() {
            let (before, rest) = self.layers.split_at_mut(i);
            let (current, after) = rest.split_at_mut(1);
            let upstream = match after.first() {
                Some(next) => next.input_grad(),
                None => target,
            };
            let input = match before.last() {
                Some(prev) => prev.output(),
                None => &self.input,
            };
            current[0].backward(input, upstream)?;
        }

        self.phase = Phase::AwaitingUpdate;
        Ok(())
    }

    /// `w -= learning_rate * dw` for every parametric layer, once per
    /// backward.
    pub fn update_weights(&mut self, learning_rate: f32) -> Result<()> {
        self.expect_phase("update_weights", Phase::AwaitingUpdate)?;
        self.phase = Phase::Ready;
        for layer in &mut self.layers {
            layer.update_weights(learning_rate)?;
        }
        Ok(())
    }

    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        weights::save(self, path)
    }

    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        weights::load(self, path)?;
        self.phase = Phase::Ready;
        Ok(())
    }

    /// Parameter tensors of every parametric layer in stack order.
    pub fn params(&self) -> Vec<&Tensor> {
        self.layers.iter().flat_map(|layer| layer.params()).collect()
    }

    pub(crate) fn params_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers
            .iter_mut()
            .flat_map(|layer| layer.params_mut())
            .collect()
    }

    fn expect_phase(&self, operation: &'static str, expected: Phase) -> Result<()> {
        if self.phase != expected {
            return Err(Error::CallOrder {
                operation,
                phase: self.phase.as_str(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::{device_tensor, wave};

    fn mnist_like() -> Network {
        let mut nn = Network::new(Device::Cpu, &[28, 28, 1]).unwrap();
        nn.add_conv2d(3, 1, 4, 1, 1)
            .unwrap()
            .add_relu()
            .unwrap()
            .add_max_pool()
            .unwrap()
            .add_conv2d(3, 4, 8, 1, 1)
            .unwrap()
            .add_relu()
            .unwrap()
            .add_max_pool()
            .unwrap()
            .add_fc(7 * 7 * 8, 10)
            .unwrap()
            .add_softmax()
            .unwrap();
        nn
    }

    #[test]
    fn test_shapes_chain_through_the_stack() {
        let nn = mnist_like();
        let layers: Vec<_> = nn.layers().collect();
        for pair in layers.windows(2) {
            assert_eq!(pair[0].output_shape(), pair[1].input_shape());
        }
        assert_eq!(nn.output_shape().dims(), &[10]);
        assert_eq!(nn.len(), 8);
        let expected = (3 * 3 * 4 + 4) + (3 * 3 * 4 * 8 + 8) + (392 * 10 + 10);
        assert_eq!(nn.parameter_count(), expected);
    }

    #[test]
    fn test_rejects_incompatible_layers() {
        let mut nn = Network::new(Device::Cpu, &[28, 28, 1]).unwrap();
        assert!(matches!(nn.add_fc(100, 10), Err(Error::ShapeMismatch { .. })));
        assert!(nn.add_conv2d(3, 2, 4, 1, 1).is_err());
        nn.add_conv2d(3, 1, 2, 1, 0).unwrap();
        // 26x26 pools fine, 13x13 does not.
        nn.add_max_pool().unwrap();
        assert!(nn.add_max_pool().is_err());
        nn.add_fc(13 * 13 * 2, 3).unwrap().add_softmax().unwrap();
        assert!(nn.add_relu().is_err());
        assert_eq!(nn.len(), 4);
    }

    #[test]
    fn test_enforces_call_order() {
        let mut nn = Network::new(Device::Cpu, &[2]).unwrap();
        nn.add_fc(2, 1).unwrap().add_sum_of_squares().unwrap();
        let x = device_tensor(&[2, 3], vec![1.0; 6]);
        let t = device_tensor(&[1, 3], vec![0.0; 3]);

        assert!(matches!(nn.backward(&t), Err(Error::CallOrder { .. })));
        assert!(matches!(nn.update_weights(0.1), Err(Error::CallOrder { .. })));

        nn.forward(&x, false).unwrap();
        assert_eq!(nn.phase(), Phase::Ready);
        assert!(nn.backward(&t).is_err());

        nn.forward(&x, true).unwrap();
        assert_eq!(nn.phase(), Phase::AwaitingBackward);
        assert!(nn.update_weights(0.1).is_err());
        nn.backward(&t).unwrap();
        assert_eq!(nn.phase(), Phase::AwaitingUpdate);
        assert!(nn.backward(&t).is_err());
        nn.update_weights(0.1).unwrap();
        assert_eq!(nn.phase(), Phase::Ready);
        assert!(nn.update_weights(0.1).is_err());
    }

    #[test]
    fn test_backward_requires_terminal_layer() {
        let mut nn = Network::new(Device::Cpu, &[2]).unwrap();
        nn.add_fc(2, 2).unwrap().add_relu().unwrap();
        let x = device_tensor(&[2, 1], vec![1.0, 2.0]);
        nn.forward(&x, true).unwrap();
        let t = device_tensor(&[2, 1], vec![0.0, 0.0]);
        assert!(matches!(nn.backward(&t), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_training_reduces_squared_error() {
        let mut nn = Network::new(Device::Cpu, &[3]).unwrap().with_seed(9);
        nn.add_fc(3, 2).unwrap().add_sum_of_squares().unwrap();
        let x_data = wave(12, 0.4);
        let x = device_tensor(&[3, 4], x_data.clone());
        // Targets from a fixed affine map, so zero loss is reachable.
        let target: Vec<f32> = x_data
            .chunks(3)
            .flat_map(|s| [0.5 * s[0] - 0.3 * s[1] + 0.2 * s[2] + 0.1, 0.1 * s[0] + 0.4 * s[1] - 0.6 * s[2]])
            .collect();
        let t = device_tensor(&[2, 4], target.clone());

        let loss = |nn: &mut Network| -> f32 {
            let y = nn.forward(&x, false).unwrap().to_vec().unwrap();
            y.iter().zip(&target).map(|(y, t)| (y - t).powi(2)).sum::<f32>() / 4.0
        };
        let before = loss(&mut nn);
        for _ in 0..500 {
            nn.forward(&x, true).unwrap();
            nn.backward(&t).unwrap();
            nn.update_weights(0.1).unwrap();
        }
        let after = loss(&mut nn);
        assert!(after < before * 0.5, "loss {before} -> {after}");
    }

    #[test]
    fn test_forward_rejects_partial_samples() {
        let mut nn = Network::new(Device::Cpu, &[4]).unwrap();
        nn.add_relu().unwrap();
        let x = device_tensor(&[6], vec![0.0; 6]);
        assert!(matches!(nn.forward(&x, false), Err(Error::BatchMismatch { .. })));
    }
}
