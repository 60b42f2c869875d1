use rand::Rng;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::init::WeightInit;
use crate::kernels::{self, FcDims};
use crate::layer::{batch_of, Layer};
use crate::tensor::{Shape, Tensor};

/// `y = W·x + b` per batch column.
///
/// Any per-sample input shape is accepted and flattened; the weight tensor has
/// dims `[in_units, out_units]`, i.e. row-major `(out_units, in_units)`.
#[derive(Debug)]
pub struct FullyConnected {
    input_shape: Shape,
    output_shape: Shape,
    weight: Tensor,
    bias: Tensor,
    weight_grad: Tensor,
    bias_grad: Tensor,
    output: Tensor,
    input_grad: Tensor,
}

impl FullyConnected {
    /// Creates a layer mapping every sample of `input_shape` to `out_units`
    ///
    /// # Arguments
    ///
    /// * `device` - Device holding the parameters and activations
    /// * `input_shape` - Per-sample input shape, flattened to `in_units`
    /// * `out_units` - Number of outputs per sample
    /// * `init` - Weight initialization strategy
    /// * `rng` - Source for the initial weights
    pub fn new<R: Rng>(
        device: &Device,
        input_shape: Shape,
        out_units: usize,
        init: WeightInit,
        rng: &mut R,
    ) -> Result<Self> {
        if out_units == 0 {
            return Err(Error::config("fully connected layer with zero output units"));
        }
        let in_units = input_shape.numel();
        let output_shape = Shape::new(&[out_units])?;

        // One contiguous row of in_units weights per output unit.
        let mut weight = Tensor::new(device, &[in_units, out_units])?;
        init.fill(&mut weight, rng, in_units, out_units)?;

        Ok(FullyConnected {
            input_shape,
            output_shape,
            weight,
            bias: Tensor::new(device, &[out_units])?,
            weight_grad: Tensor::new(device, &[in_units, out_units])?,
            bias_grad: Tensor::new(device, &[out_units])?,
            output: Tensor::with_shape(device, output_shape)?,
            input_grad: Tensor::with_shape(device, input_shape)?,
        })
    }

    pub fn in_units(&self) -> usize {
        self.input_shape.numel()
    }

    pub fn out_units(&self) -> usize {
        self.output_shape.numel()
    }

    fn dims(&self, batch: usize) -> FcDims {
        FcDims {
            in_units: self.in_units(),
            out_units: self.out_units(),
            batch,
        }
    }
}

impl Layer for FullyConnected {
    fn name(&self) -> &'static str {
        "fully_connected"
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        self.output_shape
    }

    fn forward(&mut self, input: &Tensor, _training: bool) -> Result<&Tensor> {
        let batch = batch_of("fully_connected forward", self.input_shape, input)?;
        self.output.ensure_shape(self.output_shape.with_batch(batch)?)?;
        let d = self.dims(batch);
        kernels::fc_forward(input, &self.weight, &self.bias, &mut self.output, d)?;
        Ok(&self.output)
    }

    fn backward(&mut self, input: &Tensor, upstream: &Tensor) -> Result<&Tensor> {
        let batch = batch_of("fully_connected backward", self.input_shape, input)?;
        let d = self.dims(batch);
        self.input_grad.ensure_shape(input.shape())?;

        kernels::fc_backward_input(&self.weight, upstream, &mut self.input_grad, d)?;
        kernels::fc_backward_weight(upstream, input, &mut self.weight_grad, d)?;
        kernels::channel_sum(upstream, &mut self.bias_grad, 1, d.out_units, batch)?;
        Ok(&self.input_grad)
    }

    fn output(&self) -> &Tensor {
        &self.output
    }

    fn input_grad(&self) -> &Tensor {
        &self.input_grad
    }

    fn update_weights(&mut self, learning_rate: f32) -> Result<()> {
        kernels::axpy(-learning_rate, &self.weight_grad, &mut self.weight)?;
        kernels::axpy(-learning_rate, &self.bias_grad, &mut self.bias)
    }

    fn params(&self) -> Vec<&Tensor> {
        vec![&self.weight, &self.bias]
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight, &mut self.bias]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::{assert_close, device_tensor, wave};
    use crate::layers::SumOfSquares;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn layer(in_units: usize, out_units: usize) -> FullyConnected {
        let mut rng = StdRng::seed_from_u64(11);
        let shape = Shape::new(&[in_units]).unwrap();
        FullyConnected::new(&Device::Cpu, shape, out_units, WeightInit::Uniform, &mut rng).unwrap()
    }

    fn loss(fc: &mut FullyConnected, x: &Tensor, target: &[f32], batch: usize) -> f64 {
        let y = fc.forward(x, true).unwrap().to_vec().unwrap();
        y.iter()
            .zip(target)
            .map(|(&y, &t)| f64::from(y - t).powi(2))
            .sum::<f64>()
            / batch as f64
    }

    #[test]
    fn test_forward_uses_row_major_weights() {
        let mut fc = layer(2, 3);
        fc.weight.host_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        fc.weight.push().unwrap();
        fc.bias.host_mut().copy_from_slice(&[0.0, 1.0, 0.0]);
        fc.bias.push().unwrap();

        let x = device_tensor(&[2, 1], vec![1.0, -1.0]);
        let y = fc.forward(&x, false).unwrap();
        assert_eq!(y.shape().dims(), &[3, 1]);
        assert_eq!(y.to_vec().unwrap(), vec![-1.0, 0.0, -1.0]);
    }

    #[test]
    fn test_flattens_multi_dimensional_input() {
        let mut rng = StdRng::seed_from_u64(0);
        let shape = Shape::new(&[2, 2, 3]).unwrap();
        let mut fc = FullyConnected::new(&Device::Cpu, shape, 5, WeightInit::Xavier, &mut rng).unwrap();
        assert_eq!(fc.in_units(), 12);

        let x = device_tensor(&[2, 2, 3, 4], wave(48, 0.0));
        assert_eq!(fc.forward(&x, true).unwrap().shape().dims(), &[5, 4]);
        let dy = device_tensor(&[5, 4], wave(20, 1.0));
        let dx = fc.backward(&x, &dy).unwrap();
        assert_eq!(dx.shape().dims(), &[2, 2, 3, 4]);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let (in_units, out_units, batch) = (4, 3, 2);
        let mut fc = layer(in_units, out_units);
        let mut loss_layer = SumOfSquares::new(&Device::Cpu, Shape::new(&[out_units]).unwrap()).unwrap();

        let x = device_tensor(&[in_units, batch], wave(in_units * batch, 0.3));
        let target_data = wave(out_units * batch, 2.0);
        let target = device_tensor(&[out_units, batch], target_data.clone());

        let y = fc.forward(&x, true).unwrap();
        loss_layer.forward(y, true).unwrap();
        let dy = loss_layer.backward(fc.output(), &target).unwrap();
        let dx = fc.backward(&x, dy).unwrap().to_vec().unwrap();
        let dw = fc.weight_grad.to_vec().unwrap();
        let db = fc.bias_grad.to_vec().unwrap();

        let eps = 1e-1;
        for i in 0..in_units * out_units {
            let orig = fc.weight.host()[i];
            fc.weight.host_mut()[i] = orig + eps;
            fc.weight.push().unwrap();
            let plus = loss(&mut fc, &x, &target_data, batch);
            fc.weight.host_mut()[i] = orig - eps;
            fc.weight.push().unwrap();
            let minus = loss(&mut fc, &x, &target_data, batch);
            fc.weight.host_mut()[i] = orig;
            fc.weight.push().unwrap();
            assert_close(dw[i], ((plus - minus) / (2.0 * f64::from(eps))) as f32, "dW");
        }
        for o in 0..out_units {
            fc.bias.host_mut()[o] = eps;
            fc.bias.push().unwrap();
            let plus = loss(&mut fc, &x, &target_data, batch);
            fc.bias.host_mut()[o] = -eps;
            fc.bias.push().unwrap();
            let minus = loss(&mut fc, &x, &target_data, batch);
            fc.bias.host_mut()[o] = 0.0;
            fc.bias.push().unwrap();
            assert_close(db[o], ((plus - minus) / (2.0 * f64::from(eps))) as f32, "db");
        }
        let x_data = x.to_vec().unwrap();
        for i in 0..in_units * batch {
            let mut bumped = x_data.clone();
            bumped[i] += eps;
            let plus = loss(&mut fc, &device_tensor(&[in_units, batch], bumped.clone()), &target_data, batch);
            bumped[i] -= 2.0 * eps;
            let minus = loss(&mut fc, &device_tensor(&[in_units, batch], bumped), &target_data, batch);
            assert_close(dx[i], ((plus - minus) / (2.0 * f64::from(eps))) as f32, "dx");
        }
    }

    #[test]
    fn test_update_descends_along_gradient() {
        let mut fc = layer(2, 1);
        let before = fc.weight.to_vec().unwrap();
        let x = device_tensor(&[2, 1], vec![1.0, 2.0]);
        fc.forward(&x, true).unwrap();
        let dy = device_tensor(&[1, 1], vec![1.0]);
        fc.backward(&x, &dy).unwrap();
        fc.update_weights(0.5).unwrap();

        let after = fc.weight.to_vec().unwrap();
        assert!((after[0] - (before[0] - 0.5)).abs() < 1e-6);
        assert!((after[1] - (before[1] - 1.0)).abs() < 1e-6);
        assert_eq!(fc.bias.to_vec().unwrap(), vec![-0.5]);
    }

    #[test]
    fn test_rejects_partial_batches() {
        let mut fc = layer(4, 2);
        let x = device_tensor(&[6], vec![0.0; 6]);
        assert!(matches!(fc.forward(&x, false), Err(Error::BatchMismatch { .. })));
    }

    #[test]
    fn test_rejects_unpushed_input() {
        let mut fc = layer(2, 2);
        let x = Tensor::from_vec(&Device::Cpu, &[2, 1], vec![1.0, 1.0]).unwrap();
        assert!(matches!(fc.forward(&x, false), Err(Error::Unsynced(_))));
    }
}
