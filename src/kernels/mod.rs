//! Device-side math for every layer.
//!
//! Each operation reads and writes only the device copy of its tensors and
//! runs either on the host-simulated device (ndarray) or as a wgpu compute
//! shader. All tensors passed to one operation must live on the same device.

mod cpu;

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::gpu::{GpuContext, Kernel};
use crate::tensor::Tensor;

/// Smallest probability softmax will emit, so `ln(p)` stays finite.
pub const PROB_FLOOR: f32 = 1e-30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FcDims {
    pub in_units: usize,
    pub out_units: usize,
    pub batch: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ConvDims {
    pub in_w: usize,
    pub in_h: usize,
    pub in_c: usize,
    pub out_w: usize,
    pub out_h: usize,
    pub out_c: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub batch: usize,
}

/// 2x2 stride-2 pooling over even spatial dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PoolDims {
    pub in_w: usize,
    pub in_h: usize,
    pub channels: usize,
    pub batch: usize,
}

impl PoolDims {
    pub fn out_w(&self) -> usize {
        self.in_w / 2
    }

    pub fn out_h(&self) -> usize {
        self.in_h / 2
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TargetEncoding {
    /// One class index per batch column.
    Indices,
    /// A full distribution with the same shape as the prediction.
    Dense,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct FcParams {
    in_units: u32,
    out_units: u32,
    batch: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ChannelSumParams {
    inner: u32,
    channels: u32,
    outer: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ConvParams {
    in_w: u32,
    in_h: u32,
    in_c: u32,
    out_w: u32,
    out_h: u32,
    out_c: u32,
    kernel: u32,
    stride: u32,
    padding: u32,
    batch: u32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct PoolParams {
    in_w: u32,
    in_h: u32,
    channels: u32,
    batch: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ElementwiseParams {
    len: u32,
    scale: f32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct SoftmaxParams {
    classes: u32,
    batch: u32,
    dense_target: u32,
    _pad: u32,
}

fn to_u32(v: usize) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::config(format!("{v} does not fit a 32-bit kernel index")))
}

impl FcDims {
    fn params(&self) -> Result<FcParams> {
        Ok(FcParams {
            in_units: to_u32(self.in_units)?,
            out_units: to_u32(self.out_units)?,
            batch: to_u32(self.batch)?,
            _pad: 0,
        })
    }
}

impl ConvDims {
    fn params(&self) -> Result<ConvParams> {
        Ok(ConvParams {
            in_w: to_u32(self.in_w)?,
            in_h: to_u32(self.in_h)?,
            in_c: to_u32(self.in_c)?,
            out_w: to_u32(self.out_w)?,
            out_h: to_u32(self.out_h)?,
            out_c: to_u32(self.out_c)?,
            kernel: to_u32(self.kernel)?,
            stride: to_u32(self.stride)?,
            padding: to_u32(self.padding)?,
            batch: to_u32(self.batch)?,
            _pad: [0; 2],
        })
    }

    pub fn input_len(&self) -> usize {
        self.in_w * self.in_h * self.in_c * self.batch
    }

    pub fn output_len(&self) -> usize {
        self.out_w * self.out_h * self.out_c * self.batch
    }

    pub fn weight_len(&self) -> usize {
        self.kernel * self.kernel * self.in_c * self.out_c
    }
}

impl PoolDims {
    fn params(&self) -> Result<PoolParams> {
        Ok(PoolParams {
            in_w: to_u32(self.in_w)?,
            in_h: to_u32(self.in_h)?,
            channels: to_u32(self.channels)?,
            batch: to_u32(self.batch)?,
        })
    }
}

fn elementwise(len: usize, scale: f32) -> Result<ElementwiseParams> {
    Ok(ElementwiseParams {
        len: to_u32(len)?,
        scale,
        _pad: [0; 2],
    })
}

enum Backend {
    Cpu,
    Gpu(Arc<GpuContext>),
}

fn backend(op: &'static str, tensors: &[&Tensor]) -> Result<Backend> {
    let device = match tensors.first() {
        Some(t) => t.device(),
        None => return Ok(Backend::Cpu),
    };
    if tensors.iter().any(|t| !t.device().same(&device)) {
        return Err(Error::DeviceMismatch(op));
    }
    Ok(match device {
        Device::Cpu => Backend::Cpu,
        Device::Gpu(ctx) => Backend::Gpu(ctx),
    })
}

fn host<'a>(op: &'static str, t: &'a Tensor) -> Result<&'a [f32]> {
    t.storage().as_host().ok_or(Error::DeviceMismatch(op))
}

fn host_mut<'a>(op: &'static str, t: &'a mut Tensor) -> Result<&'a mut [f32]> {
    t.storage_mut().as_host_mut().ok_or(Error::DeviceMismatch(op))
}

fn buffer<'a>(op: &'static str, t: &'a Tensor) -> Result<&'a wgpu::Buffer> {
    t.storage().as_buffer().ok_or(Error::DeviceMismatch(op))
}

fn buffer_mut<'a>(op: &'static str, t: &'a mut Tensor) -> Result<&'a wgpu::Buffer> {
    let storage: &'a crate::device::Storage = t.storage_mut();
    storage.as_buffer().ok_or(Error::DeviceMismatch(op))
}

fn check_len(op: &'static str, t: &Tensor, expected: usize) -> Result<()> {
    if t.len() != expected {
        return Err(Error::config(format!(
            "{op}: tensor {} holds {} elements, kernel expects {expected}",
            t.shape(),
            t.len()
        )));
    }
    Ok(())
}

/// `y = w · x + b` per batch column.
pub(crate) fn fc_forward(x: &Tensor, w: &Tensor, b: &Tensor, y: &mut Tensor, d: FcDims) -> Result<()> {
    const OP: &str = "fc_forward";
    check_len(OP, x, d.in_units * d.batch)?;
    check_len(OP, w, d.in_units * d.out_units)?;
    check_len(OP, b, d.out_units)?;
    check_len(OP, y, d.out_units * d.batch)?;
    match backend(OP, &[x, w, b, &*y])? {
        Backend::Cpu => cpu::fc_forward(host(OP, x)?, host(OP, w)?, host(OP, b)?, host_mut(OP, y)?, d),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::FcForward,
            &d.params()?,
            &[buffer(OP, x)?, buffer(OP, w)?, buffer(OP, b)?, buffer_mut(OP, y)?],
            d.out_units * d.batch,
        ),
    }
}

/// `dx = wᵗ · dy`
pub(crate) fn fc_backward_input(w: &Tensor, dy: &Tensor, dx: &mut Tensor, d: FcDims) -> Result<()> {
    const OP: &str = "fc_backward_input";
    check_len(OP, dy, d.out_units * d.batch)?;
    check_len(OP, dx, d.in_units * d.batch)?;
    match backend(OP, &[w, dy, &*dx])? {
        Backend::Cpu => cpu::fc_backward_input(host(OP, w)?, host(OP, dy)?, host_mut(OP, dx)?, d),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::FcBackwardInput,
            &d.params()?,
            &[buffer(OP, w)?, buffer(OP, dy)?, buffer_mut(OP, dx)?],
            d.in_units * d.batch,
        ),
    }
}

/// `dw = dy · xᵗ`, summed over the batch.
pub(crate) fn fc_backward_weight(dy: &Tensor, x: &Tensor, dw: &mut Tensor, d: FcDims) -> Result<()> {
    const OP: &str = "fc_backward_weight";
    check_len(OP, dy, d.out_units * d.batch)?;
    check_len(OP, x, d.in_units * d.batch)?;
    check_len(OP, dw, d.in_units * d.out_units)?;
    match backend(OP, &[dy, x, &*dw])? {
        Backend::Cpu => cpu::fc_backward_weight(host(OP, dy)?, host(OP, x)?, host_mut(OP, dw)?, d),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::FcBackwardWeight,
            &d.params()?,
            &[buffer(OP, dy)?, buffer(OP, x)?, buffer_mut(OP, dw)?],
            d.in_units * d.out_units,
        ),
    }
}

/// Sums `dy`, viewed as `[inner, channels, outer]`, down to `[channels]`.
pub(crate) fn channel_sum(dy: &Tensor, db: &mut Tensor, inner: usize, channels: usize, outer: usize) -> Result<()> {
    const OP: &str = "channel_sum";
    check_len(OP, dy, inner * channels * outer)?;
    check_len(OP, db, channels)?;
    match backend(OP, &[dy, &*db])? {
        Backend::Cpu => cpu::channel_sum(host(OP, dy)?, host_mut(OP, db)?, inner, channels, outer),
        Backend::Gpu(ctx) => {
            let params = ChannelSumParams {
                inner: to_u32(inner)?,
                channels: to_u32(channels)?,
                outer: to_u32(outer)?,
                _pad: 0,
            };
            ctx.dispatch(Kernel::ChannelSum, &params, &[buffer(OP, dy)?, buffer_mut(OP, db)?], channels)
        }
    }
}

pub(crate) fn conv2d_forward(x: &Tensor, w: &Tensor, b: &Tensor, y: &mut Tensor, d: &ConvDims) -> Result<()> {
    const OP: &str = "conv2d_forward";
    check_len(OP, x, d.input_len())?;
    check_len(OP, w, d.weight_len())?;
    check_len(OP, b, d.out_c)?;
    check_len(OP, y, d.output_len())?;
    match backend(OP, &[x, w, b, &*y])? {
        Backend::Cpu => cpu::conv2d_forward(host(OP, x)?, host(OP, w)?, host(OP, b)?, host_mut(OP, y)?, d),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::Conv2dForward,
            &d.params()?,
            &[buffer(OP, x)?, buffer(OP, w)?, buffer(OP, b)?, buffer_mut(OP, y)?],
            d.output_len(),
        ),
    }
}

pub(crate) fn conv2d_backward_input(w: &Tensor, dy: &Tensor, dx: &mut Tensor, d: &ConvDims) -> Result<()> {
    const OP: &str = "conv2d_backward_input";
    check_len(OP, w, d.weight_len())?;
    check_len(OP, dy, d.output_len())?;
    check_len(OP, dx, d.input_len())?;
    match backend(OP, &[w, dy, &*dx])? {
        Backend::Cpu => cpu::conv2d_backward_input(host(OP, w)?, host(OP, dy)?, host_mut(OP, dx)?, d),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::Conv2dBackwardInput,
            &d.params()?,
            &[buffer(OP, w)?, buffer(OP, dy)?, buffer_mut(OP, dx)?],
            d.input_len(),
        ),
    }
}

pub(crate) fn conv2d_backward_weight(dy: &Tensor, x: &Tensor, dw: &mut Tensor, d: &ConvDims) -> Result<()> {
    const OP: &str = "conv2d_backward_weight";
    check_len(OP, dy, d.output_len())?;
    check_len(OP, x, d.input_len())?;
    check_len(OP, dw, d.weight_len())?;
    match backend(OP, &[dy, x, &*dw])? {
        Backend::Cpu => cpu::conv2d_backward_weight(host(OP, dy)?, host(OP, x)?, host_mut(OP, dw)?, d),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::Conv2dBackwardWeight,
            &d.params()?,
            &[buffer(OP, dy)?, buffer(OP, x)?, buffer_mut(OP, dw)?],
            d.weight_len(),
        ),
    }
}

/// Writes the pooled maxima to `y` and the winning window slot
/// (`dy * 2 + dx`) of each to `argmax`.
pub(crate) fn max_pool_forward(x: &Tensor, y: &mut Tensor, argmax: &mut Tensor, d: &PoolDims) -> Result<()> {
    const OP: &str = "max_pool_forward";
    let out_len = d.out_w() * d.out_h() * d.channels * d.batch;
    check_len(OP, x, d.in_w * d.in_h * d.channels * d.batch)?;
    check_len(OP, y, out_len)?;
    check_len(OP, argmax, out_len)?;
    match backend(OP, &[x, &*y, &*argmax])? {
        Backend::Cpu => cpu::max_pool_forward(host(OP, x)?, host_mut(OP, y)?, host_mut(OP, argmax)?, d),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::MaxPoolForward,
            &d.params()?,
            &[buffer(OP, x)?, buffer_mut(OP, y)?, buffer_mut(OP, argmax)?],
            out_len,
        ),
    }
}

pub(crate) fn max_pool_backward(dy: &Tensor, argmax: &Tensor, dx: &mut Tensor, d: &PoolDims) -> Result<()> {
    const OP: &str = "max_pool_backward";
    let in_len = d.in_w * d.in_h * d.channels * d.batch;
    check_len(OP, dy, argmax.len())?;
    check_len(OP, dx, in_len)?;
    match backend(OP, &[dy, argmax, &*dx])? {
        Backend::Cpu => cpu::max_pool_backward(host(OP, dy)?, host(OP, argmax)?, host_mut(OP, dx)?, d),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::MaxPoolBackward,
            &d.params()?,
            &[buffer(OP, dy)?, buffer(OP, argmax)?, buffer_mut(OP, dx)?],
            in_len,
        ),
    }
}

/// `out = a * b`, elementwise.
pub(crate) fn multiply(a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
    const OP: &str = "multiply";
    check_len(OP, b, a.len())?;
    check_len(OP, out, a.len())?;
    match backend(OP, &[a, b, &*out])? {
        Backend::Cpu => cpu::multiply(host(OP, a)?, host(OP, b)?, host_mut(OP, out)?),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::Multiply,
            &elementwise(a.len(), 1.0)?,
            &[buffer(OP, a)?, buffer(OP, b)?, buffer_mut(OP, out)?],
            a.len(),
        ),
    }
}

pub(crate) fn relu_forward(x: &Tensor, y: &mut Tensor) -> Result<()> {
    const OP: &str = "relu_forward";
    check_len(OP, y, x.len())?;
    match backend(OP, &[x, &*y])? {
        Backend::Cpu => cpu::relu_forward(host(OP, x)?, host_mut(OP, y)?),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::ReluForward,
            &elementwise(x.len(), 1.0)?,
            &[buffer(OP, x)?, buffer_mut(OP, y)?],
            x.len(),
        ),
    }
}

/// Passes `dy` where the forward input was positive.
pub(crate) fn relu_backward(x: &Tensor, dy: &Tensor, dx: &mut Tensor) -> Result<()> {
    const OP: &str = "relu_backward";
    check_len(OP, dy, x.len())?;
    check_len(OP, dx, x.len())?;
    match backend(OP, &[x, dy, &*dx])? {
        Backend::Cpu => cpu::relu_backward(host(OP, x)?, host(OP, dy)?, host_mut(OP, dx)?),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::ReluBackward,
            &elementwise(x.len(), 1.0)?,
            &[buffer(OP, x)?, buffer(OP, dy)?, buffer_mut(OP, dx)?],
            x.len(),
        ),
    }
}

pub(crate) fn softmax_forward(x: &Tensor, y: &mut Tensor, classes: usize, batch: usize) -> Result<()> {
    const OP: &str = "softmax_forward";
    check_len(OP, x, classes * batch)?;
    check_len(OP, y, classes * batch)?;
    match backend(OP, &[x, &*y])? {
        Backend::Cpu => cpu::softmax_forward(host(OP, x)?, host_mut(OP, y)?, classes),
        Backend::Gpu(ctx) => {
            let params = SoftmaxParams {
                classes: to_u32(classes)?,
                batch: to_u32(batch)?,
                dense_target: 0,
                _pad: 0,
            };
            ctx.dispatch(Kernel::SoftmaxForward, &params, &[buffer(OP, x)?, buffer_mut(OP, y)?], batch)
        }
    }
}

/// `dx = (p - onehot(target)) / batch`
pub(crate) fn softmax_backward(
    y: &Tensor,
    target: &Tensor,
    dx: &mut Tensor,
    classes: usize,
    batch: usize,
    encoding: TargetEncoding,
) -> Result<()> {
    const OP: &str = "softmax_backward";
    check_len(OP, y, classes * batch)?;
    check_len(OP, dx, classes * batch)?;
    match encoding {
        TargetEncoding::Indices => check_len(OP, target, batch)?,
        TargetEncoding::Dense => check_len(OP, target, classes * batch)?,
    }
    match backend(OP, &[y, target, &*dx])? {
        Backend::Cpu => cpu::softmax_backward(host(OP, y)?, host(OP, target)?, host_mut(OP, dx)?, classes, encoding),
        Backend::Gpu(ctx) => {
            let params = SoftmaxParams {
                classes: to_u32(classes)?,
                batch: to_u32(batch)?,
                dense_target: u32::from(encoding == TargetEncoding::Dense),
                _pad: 0,
            };
            ctx.dispatch(
                Kernel::SoftmaxBackward,
                &params,
                &[buffer(OP, y)?, buffer(OP, target)?, buffer_mut(OP, dx)?],
                classes * batch,
            )
        }
    }
}

/// `out = scale * (a - b)`
pub(crate) fn scaled_difference(a: &Tensor, b: &Tensor, out: &mut Tensor, scale: f32) -> Result<()> {
    const OP: &str = "scaled_difference";
    check_len(OP, b, a.len())?;
    check_len(OP, out, a.len())?;
    match backend(OP, &[a, b, &*out])? {
        Backend::Cpu => cpu::scaled_difference(host(OP, a)?, host(OP, b)?, host_mut(OP, out)?, scale),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::ScaledDifference,
            &elementwise(a.len(), scale)?,
            &[buffer(OP, a)?, buffer(OP, b)?, buffer_mut(OP, out)?],
            a.len(),
        ),
    }
}

/// `y += alpha * x`, in place.
pub(crate) fn axpy(alpha: f32, x: &Tensor, y: &mut Tensor) -> Result<()> {
    const OP: &str = "axpy";
    check_len(OP, y, x.len())?;
    match backend(OP, &[x, &*y])? {
        Backend::Cpu => cpu::axpy(alpha, host(OP, x)?, host_mut(OP, y)?),
        Backend::Gpu(ctx) => ctx.dispatch(
            Kernel::Axpy,
            &elementwise(x.len(), alpha)?,
            &[buffer(OP, x)?, buffer_mut(OP, y)?],
            x.len(),
        ),
    }
}
