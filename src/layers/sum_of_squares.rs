use crate::device::Device;
use crate::error::{Error, Result};
use crate::kernels;
use crate::layer::{batch_of, Layer};
use crate::tensor::{Shape, Tensor};

/// Terminal squared-error loss. Forward records its input as the prediction;
/// backward takes the target and emits `2 * (prediction - target) / batch`.
#[derive(Debug)]
pub struct SumOfSquares {
    shape: Shape,
    output: Tensor,
    input_grad: Tensor,
}

impl SumOfSquares {
    pub fn new(device: &Device, shape: Shape) -> Result<Self> {
        Ok(SumOfSquares {
            shape,
            output: Tensor::with_shape(device, shape)?,
            input_grad: Tensor::with_shape(device, shape)?,
        })
    }
}

impl Layer for SumOfSquares {
    fn name(&self) -> &'static str {
        "sum_of_squares"
    }

    fn input_shape(&self) -> Shape {
        self.shape
    }

    fn output_shape(&self) -> Shape {
        self.shape
    }

    fn forward(&mut self, input: &Tensor, _training: bool) -> Result<&Tensor> {
        batch_of("sum_of_squares forward", self.shape, input)?;
        self.output.copy_from(input)?;
        Ok(&self.output)
    }

    fn backward(&mut self, input: &Tensor, target: &Tensor) -> Result<&Tensor> {
        let batch = batch_of("sum_of_squares backward", self.shape, input)?;
        if target.len() != input.len() {
            return Err(Error::ShapeMismatch {
                context: "sum_of_squares target",
                expected: input.shape(),
                got: target.shape(),
            });
        }
        batch_of("sum_of_squares target", self.shape, target)?;
        self.input_grad.ensure_shape(input.shape())?;
        kernels::scaled_difference(input, target, &mut self.input_grad, 2.0 / batch as f32)?;
        Ok(&self.input_grad)
    }

    fn output(&self) -> &Tensor {
        &self.output
    }

    fn input_grad(&self) -> &Tensor {
        &self.input_grad
    }

    fn is_terminal(&self) -> bool {
        true
    }
}
