use crate::device::Device;
use crate::error::{Error, Result};
use crate::kernels::{self, PoolDims};
use crate::layer::{batch_of, Layer};
use crate::tensor::{Shape, Tensor};

/// 2x2 max pooling with stride 2 over `[w, h, c]` samples.
///
/// The slot of each window's maximum is cached during forward so backward can
/// route the upstream gradient to it; ties go to the first slot in
/// row-major window order.
#[derive(Debug)]
pub struct MaxPool {
    input_shape: Shape,
    output_shape: Shape,
    argmax: Tensor,
    output: Tensor,
    input_grad: Tensor,
}

impl MaxPool {
    pub fn new(device: &Device, input_shape: Shape) -> Result<Self> {
        if input_shape.rank() > 3 {
            return Err(Error::config(format!(
                "max pool expects [w, h] or [w, h, c] samples, got {input_shape}"
            )));
        }
        let (w, h, c) = (input_shape.dim(0), input_shape.dim(1), input_shape.dim(2));
        if w % 2 != 0 || h % 2 != 0 {
            return Err(Error::config(format!(
                "2x2 max pool needs even spatial dims, got {w}x{h}"
            )));
        }
        let output_shape = Shape::new(&[w / 2, h / 2, c])?;
        Ok(MaxPool {
            input_shape,
            output_shape,
            argmax: Tensor::with_shape(device, output_shape)?,
            output: Tensor::with_shape(device, output_shape)?,
            input_grad: Tensor::with_shape(device, input_shape)?,
        })
    }

    fn dims(&self, batch: usize) -> PoolDims {
        PoolDims {
            in_w: self.input_shape.dim(0),
            in_h: self.input_shape.dim(1),
            channels: self.input_shape.dim(2),
            batch,
        }
    }
}

impl Layer for MaxPool {
    fn name(&self) -> &'static str {
        "max_pool"
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        self.output_shape
    }

    fn forward(&mut self, input: &Tensor, _training: bool) -> Result<&Tensor> {
        let batch = batch_of("max_pool forward", self.input_shape, input)?;
        let shape = self.output_shape.with_batch(batch)?;
        self.output.ensure_shape(shape)?;
        self.argmax.ensure_shape(shape)?;
        let d = self.dims(batch);
        kernels::max_pool_forward(input, &mut self.output, &mut self.argmax, &d)?;
        Ok(&self.output)
    }

    fn backward(&mut self, input: &Tensor, upstream: &Tensor) -> Result<&Tensor> {
        let batch = batch_of("max_pool backward", self.input_shape, input)?;
        self.input_grad.ensure_shape(input.shape())?;
        let d = self.dims(batch);
        kernels::max_pool_backward(upstream, &self.argmax, &mut self.input_grad, &d)?;
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

    #[test]
    fn test_routes_gradient_to_window_maximum() {
        let mut pool = MaxPool::new(&Device::Cpu, Shape::new(&[4, 2, 2]).unwrap()).unwrap();
        #[rustfmt::skip]
        let x = device_tensor(&[4, 2, 2, 1], vec![
            // channel 0
            1.0, 5.0,   2.0, 0.0,
            3.0, 4.0,   9.0, 1.0,
            // channel 1
            -1.0, -2.0, 0.5, 0.25,
            -3.0, -0.5, 0.1, 0.2,
        ]);
        let y = pool.forward(&x, true).unwrap();
        assert_eq!(y.shape().dims(), &[2, 1, 2, 1]);
        assert_eq!(y.to_vec().unwrap(), vec![5.0, 9.0, -0.5, 0.5]);

        let dy = device_tensor(&[2, 1, 2, 1], vec![10.0, 20.0, 30.0, 40.0]);
        let dx = pool.backward(&x, &dy).unwrap().to_vec().unwrap();
        #[rustfmt::skip]
        assert_eq!(dx, vec![
            0.0, 10.0,  0.0, 0.0,
            0.0, 0.0,   20.0, 0.0,
            0.0, 0.0,   40.0, 0.0,
            0.0, 30.0,  0.0, 0.0,
        ]);
        assert_eq!(dx.iter().sum::<f32>(), 100.0);
    }

    #[test]
    fn test_rejects_odd_spatial_dims() {
        assert!(MaxPool::new(&Device::Cpu, Shape::new(&[5, 4, 1]).unwrap()).is_err());
        assert!(MaxPool::new(&Device::Cpu, Shape::new(&[4, 3]).unwrap()).is_err());
    }

    #[test]
    fn test_keeps_channels_and_batch() {
        let mut pool = MaxPool::new(&Device::Cpu, Shape::new(&[28, 28, 4]).unwrap()).unwrap();
        assert_eq!(pool.output_shape().dims(), &[14, 14, 4]);
        let x = device_tensor(&[28, 28, 4, 3], vec![1.0; 28 * 28 * 4 * 3]);
        assert_eq!(pool.forward(&x, false).unwrap().shape().dims(), &[14, 14, 4, 3]);
    }
}
