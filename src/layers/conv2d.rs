use rand::Rng;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::init::WeightInit;
use crate::kernels::{self, ConvDims};
use crate::layer::{batch_of, Layer};
use crate::tensor::{Shape, Tensor};

/// Hyperparameters of a square-kernel convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub kernel: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2dConfig {
    pub fn new(kernel: usize, in_channels: usize, out_channels: usize, stride: usize, padding: usize) -> Self {
        Conv2dConfig {
            kernel,
            in_channels,
            out_channels,
            stride,
            padding,
        }
    }

    /// `floor((size + 2 * padding - kernel) / stride) + 1`, or `None` if the
    /// padded input is smaller than the kernel.
    pub fn output_size(&self, size: usize) -> Option<usize> {
        (size + 2 * self.padding)
            .checked_sub(self.kernel)
            .map(|span| span / self.stride + 1)
    }
}

/// 2-D convolution over `[w, h, c]` samples with zero padding.
///
/// Weights have dims `[k, k, in_c, out_c]`; bias has one entry per output
/// channel.
#[derive(Debug)]
pub struct Conv2d {
    config: Conv2dConfig,
    input_shape: Shape,
    output_shape: Shape,
    weight: Tensor,
    bias: Tensor,
    weight_grad: Tensor,
    bias_grad: Tensor,
    output: Tensor,
    input_grad: Tensor,
}

impl Conv2d {
    pub fn new<R: Rng>(
        device: &Device,
        input_shape: Shape,
        config: Conv2dConfig,
        init: WeightInit,
        rng: &mut R,
    ) -> Result<Self> {
        let Conv2dConfig {
            kernel,
            in_channels,
            out_channels,
            stride,
            ..
        } = config;
        if kernel == 0 || stride == 0 || in_channels == 0 || out_channels == 0 {
            return Err(Error::config(format!("degenerate convolution {config:?}")));
        }
        if input_shape.rank() > 3 || input_shape.dim(2) != in_channels {
            return Err(Error::ShapeMismatch {
                context: "conv2d input channels",
                expected: Shape::new(&[input_shape.dim(0), input_shape.dim(1), in_channels])?,
                got: input_shape,
            });
        }
        let (w, h) = (input_shape.dim(0), input_shape.dim(1));
        let (Some(out_w), Some(out_h)) = (config.output_size(w), config.output_size(h)) else {
            return Err(Error::config(format!(
                "{kernel}x{kernel} kernel does not fit a {w}x{h} input padded by {}",
                config.padding
            )));
        };
        let output_shape = Shape::new(&[out_w, out_h, out_channels])?;

        let weight_dims = [kernel, kernel, in_channels, out_channels];
        let mut weight = Tensor::new(device, &weight_dims)?;
        init.fill(
            &mut weight,
            rng,
            kernel * kernel * in_channels,
            kernel * kernel * out_channels,
        )?;

        Ok(Conv2d {
            config,
            input_shape,
            output_shape,
            weight,
            bias: Tensor::new(device, &[out_channels])?,
            weight_grad: Tensor::new(device, &weight_dims)?,
            bias_grad: Tensor::new(device, &[out_channels])?,
            output: Tensor::with_shape(device, output_shape)?,
            input_grad: Tensor::with_shape(device, input_shape)?,
        })
    }

    pub fn config(&self) -> Conv2dConfig {
        self.config
    }

    fn dims(&self, batch: usize) -> ConvDims {
        ConvDims {
            in_w: self.input_shape.dim(0),
            in_h: self.input_shape.dim(1),
            in_c: self.config.in_channels,
            out_w: self.output_shape.dim(0),
            out_h: self.output_shape.dim(1),
            out_c: self.config.out_channels,
            kernel: self.config.kernel,
            stride: self.config.stride,
            padding: self.config.padding,
            batch,
        }
    }
}

impl Layer for Conv2d {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        self.output_shape
    }

    fn forward(&mut self, input: &Tensor, _training: bool) -> Result<&Tensor> {
        let batch = batch_of("conv2d forward", self.input_shape, input)?;
        self.output.ensure_shape(self.output_shape.with_batch(batch)?)?;
        let d = self.dims(batch);
        kernels::conv2d_forward(input, &self.weight, &self.bias, &mut self.output, &d)?;
        Ok(&self.output)
    }

    fn backward(&mut self, input: &Tensor, upstream: &Tensor) -> Result<&Tensor> {
        let batch = batch_of("conv2d backward", self.input_shape, input)?;
        let d = self.dims(batch);
        self.input_grad.ensure_shape(input.shape())?;

        kernels::conv2d_backward_input(&self.weight, upstream, &mut self.input_grad, &d)?;
        kernels::conv2d_backward_weight(upstream, input, &mut self.weight_grad, &d)?;
        kernels::channel_sum(upstream, &mut self.bias_grad, d.out_w * d.out_h, d.out_c, batch)?;
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
