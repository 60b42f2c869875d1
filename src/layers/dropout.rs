use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::kernels;
use crate::layer::{batch_of, Layer};
use crate::tensor::{Shape, Tensor};

/// Inverted dropout: in training each activation is zeroed with probability
/// `rate` and survivors are scaled by `1 / (1 - rate)`; in inference the
/// input passes through unchanged.
#[derive(Debug)]
pub struct Dropout {
    shape: Shape,
    rate: f32,
    scale: f32,
    rng: StdRng,
    mask: Tensor,
    /// Whether the last forward applied `mask`.
    masked: bool,
    output: Tensor,
    input_grad: Tensor,
}

impl Dropout {
    /// # Arguments
    ///
    /// * `rate` - Probability of zeroing an element, in `[0, 1)`
    /// * `seed` - Seed for the layer's mask generator
    pub fn new(device: &Device, shape: Shape, rate: f32, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(Error::config(format!("dropout rate {rate} outside [0, 1)")));
        }
        Ok(Dropout {
            shape,
            rate,
            scale: 1.0 / (1.0 - rate),
            rng: StdRng::seed_from_u64(seed),
            mask: Tensor::with_shape(device, shape)?,
            masked: false,
            output: Tensor::with_shape(device, shape)?,
            input_grad: Tensor::with_shape(device, shape)?,
        })
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    fn regenerate_mask(&mut self, shape: Shape) -> Result<()> {
        self.mask.ensure_shape(shape)?;
        let (rate, scale) = (self.rate, self.scale);
        for keep in self.mask.host_mut() {
            *keep = if self.rng.random::<f32>() >= rate { scale } else { 0.0 };
        }
        self.mask.push()
    }
}

impl Layer for Dropout {
    fn name(&self) -> &'static str {
        "dropout"
    }

    fn input_shape(&self) -> Shape {
        self.shape
    }

    fn output_shape(&self) -> Shape {
        self.shape
    }

    fn forward(&mut self, input: &Tensor, training: bool) -> Result<&Tensor> {
        batch_of("dropout forward", self.shape, input)?;
        self.masked = training && self.rate > 0.0;
        if self.masked {
            self.regenerate_mask(input.shape())?;
            self.output.ensure_shape(input.shape())?;
            kernels::multiply(input, &self.mask, &mut self.output)?;
        } else {
            self.output.copy_from(input)?;
        }
        Ok(&self.output)
    }

    fn backward(&mut self, input: &Tensor, upstream: &Tensor) -> Result<&Tensor> {
        batch_of("dropout backward", self.shape, input)?;
        if self.masked {
            self.input_grad.ensure_shape(input.shape())?;
            kernels::multiply(upstream, &self.mask, &mut self.input_grad)?;
        } else {
            self.input_grad.copy_from(upstream)?;
        }
        Ok(&self.input_grad)
    }

    fn output(&self) -> &Tensor {
        &self.output
    }

    fn input_grad(&self) -> &Tensor {
        &self.input_grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::device_tensor;

    fn dropout(rate: f32) -> Dropout {
        Dropout::new(&Device::Cpu, Shape::new(&[64]).unwrap(), rate, 5).unwrap()
    }

    #[test]
    fn test_zeroed_positions_receive_zero_gradient() {
        let mut d = dropout(0.5);
        let x = device_tensor(&[64, 4], vec![1.0; 256]);
        let y = d.forward(&x, true).unwrap().to_vec().unwrap();
        let dy = device_tensor(&[64, 4], vec![3.0; 256]);
        let dx = d.backward(&x, &dy).unwrap().to_vec().unwrap();

        let dropped = y.iter().filter(|v| **v == 0.0).count();
        assert!(dropped > 64 && dropped < 192, "{dropped} of 256 dropped");
        for (y, dx) in y.iter().zip(&dx) {
            if *y == 0.0 {
                assert_eq!(*dx, 0.0);
            } else {
                assert_eq!(*y, 2.0);
                assert_eq!(*dx, 6.0);
            }
        }
    }

    #[test]
    fn test_mask_changes_every_training_forward() {
        let mut d = dropout(0.5);
        let x = device_tensor(&[64, 1], vec![1.0; 64]);
        let first = d.forward(&x, true).unwrap().to_vec().unwrap();
        let second = d.forward(&x, true).unwrap().to_vec().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_inference_and_zero_rate_are_identity() {
        let x = device_tensor(&[64, 2], (0..128).map(|v| v as f32).collect());
        let expected = x.to_vec().unwrap();

        let mut d = dropout(0.5);
        assert_eq!(d.forward(&x, false).unwrap().to_vec().unwrap(), expected);

        let mut zero = dropout(0.0);
        assert_eq!(zero.forward(&x, true).unwrap().to_vec().unwrap(), expected);
        let dy = device_tensor(&[64, 2], vec![1.5; 128]);
        assert_eq!(zero.backward(&x, &dy).unwrap().to_vec().unwrap(), vec![1.5; 128]);
    }

    #[test]
    fn test_rejects_rate_of_one() {
        assert!(Dropout::new(&Device::Cpu, Shape::new(&[4]).unwrap(), 1.0, 0).is_err());
        assert!(Dropout::new(&Device::Cpu, Shape::new(&[4]).unwrap(), -0.1, 0).is_err());
    }
}
