use crate::device::Device;
use crate::error::Result;
use crate::kernels;
use crate::layer::{batch_of, Layer};
use crate::tensor::{Shape, Tensor};

/// Elementwise `max(0, x)`.
#[derive(Debug)]
pub struct Relu {
    shape: Shape,
    output: Tensor,
    input_grad: Tensor,
}

impl Relu {
    pub fn new(device: &Device, shape: Shape) -> Result<Self> {
        Ok(Relu {
            shape,
            output: Tensor::with_shape(device, shape)?,
            input_grad: Tensor::with_shape(device, shape)?,
        })
    }
}

impl Layer for Relu {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn input_shape(&self) -> Shape {
        self.shape
    }

    fn output_shape(&self) -> Shape {
        self.shape
    }

    fn forward(&mut self, input: &Tensor, _training: bool) -> Result<&Tensor> {
        batch_of("relu forward", self.shape, input)?;
        self.output.ensure_shape(input.shape())?;
        kernels::relu_forward(input, &mut self.output)?;
        Ok(&self.output)
    }

    fn backward(&mut self, input: &Tensor, upstream: &Tensor) -> Result<&Tensor> {
        batch_of("relu backward", self.shape, input)?;
        self.input_grad.ensure_shape(input.shape())?;
        kernels::relu_backward(input, upstream, &mut self.input_grad)?;
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
    fn test_clamps_and_gates() {
        let mut relu = Relu::new(&Device::Cpu, Shape::new(&[4]).unwrap()).unwrap();
        let x = device_tensor(&[4, 1], vec![-2.0, 0.0, 0.5, 3.0]);
        let y = relu.forward(&x, true).unwrap().to_vec().unwrap();
        assert_eq!(y, vec![0.0, 0.0, 0.5, 3.0]);

        let dy = device_tensor(&[4, 1], vec![1.0, 1.0, 1.0, -2.0]);
        let dx = relu.backward(&x, &dy).unwrap().to_vec().unwrap();
        assert_eq!(dx, vec![0.0, 0.0, 1.0, -2.0]);
    }
}
