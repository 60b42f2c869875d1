//! wgpu plumbing: adapter/device acquisition, storage buffers, transfers and
//! one compute pipeline per kernel.

use std::collections::HashMap;
use std::fmt;

use wgpu::util::DeviceExt;
use wgpu::{ComputePipeline, Device, PipelineCompilationOptions, Queue};

use crate::error::{Error, Result};

const WORKGROUP_SIZE: usize = 64;
const MAX_GROUPS_PER_DIM: usize = 65_535;

/// Every compute shader the engine dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Kernel {
    FcForward,
    FcBackwardInput,
    FcBackwardWeight,
    ChannelSum,
    Conv2dForward,
    Conv2dBackwardInput,
    Conv2dBackwardWeight,
    MaxPoolForward,
    MaxPoolBackward,
    Multiply,
    ReluForward,
    ReluBackward,
    SoftmaxForward,
    SoftmaxBackward,
    ScaledDifference,
    Axpy,
}

impl Kernel {
    const ALL: [Kernel; 16] = [
        Kernel::FcForward,
        Kernel::FcBackwardInput,
        Kernel::FcBackwardWeight,
        Kernel::ChannelSum,
        Kernel::Conv2dForward,
        Kernel::Conv2dBackwardInput,
        Kernel::Conv2dBackwardWeight,
        Kernel::MaxPoolForward,
        Kernel::MaxPoolBackward,
        Kernel::Multiply,
        Kernel::ReluForward,
        Kernel::ReluBackward,
        Kernel::SoftmaxForward,
        Kernel::SoftmaxBackward,
        Kernel::ScaledDifference,
        Kernel::Axpy,
    ];

    fn source(self) -> &'static str {
        match self {
            Kernel::FcForward => include_str!("shaders/fc_forward.wgsl"),
            Kernel::FcBackwardInput => include_str!("shaders/fc_backward_input.wgsl"),
            Kernel::FcBackwardWeight => include_str!("shaders/fc_backward_weight.wgsl"),
            Kernel::ChannelSum => include_str!("shaders/channel_sum.wgsl"),
            Kernel::Conv2dForward => include_str!("shaders/conv2d_forward.wgsl"),
            Kernel::Conv2dBackwardInput => include_str!("shaders/conv2d_backward_input.wgsl"),
            Kernel::Conv2dBackwardWeight => include_str!("shaders/conv2d_backward_weight.wgsl"),
            Kernel::MaxPoolForward => include_str!("shaders/max_pool_forward.wgsl"),
            Kernel::MaxPoolBackward => include_str!("shaders/max_pool_backward.wgsl"),
            Kernel::Multiply => include_str!("shaders/multiply.wgsl"),
            Kernel::ReluForward => include_str!("shaders/relu_forward.wgsl"),
            Kernel::ReluBackward => include_str!("shaders/relu_backward.wgsl"),
            Kernel::SoftmaxForward => include_str!("shaders/softmax_forward.wgsl"),
            Kernel::SoftmaxBackward => include_str!("shaders/softmax_backward.wgsl"),
            Kernel::ScaledDifference => include_str!("shaders/scaled_difference.wgsl"),
            Kernel::Axpy => include_str!("shaders/axpy.wgsl"),
        }
    }
}

/// A wgpu device, its queue, and the compiled kernels.
pub struct GpuContext {
    adapter_name: String,
    device: Device,
    queue: Queue,
    pipelines: HashMap<Kernel, ComputePipeline>,
}

impl GpuContext {
    /// Blocking wrapper around [`GpuContext::new_async`].
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::default();

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| Error::Gpu("no suitable adapter found".into()))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("layernet device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| Error::Gpu(format!("device request failed: {e}")))?;

        let pipelines = Kernel::ALL
            .iter()
            .map(|&kernel| (kernel, Self::create_pipeline(&device, kernel)))
            .collect();

        Ok(GpuContext {
            adapter_name: adapter.get_info().name,
            device,
            queue,
            pipelines,
        })
    }

    fn create_pipeline(device: &Device, kernel: Kernel) -> ComputePipeline {
        let label = format!("{kernel:?}");
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&label),
            source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(kernel.source())),
        });

        // Layout is derived from the shader: binding 0 is the uniform
        // parameter block, bindings 1.. are storage buffers in call order.
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&label),
            layout: None,
            module: &shader,
            entry_point: Some("main"),
            compilation_options: PipelineCompilationOptions::default(),
            cache: None,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub(crate) fn create_storage_buffer(&self, len: usize) -> wgpu::Buffer {
        // Zero-sized bindings are invalid, so empty tensors still get one slot.
        let size = (len.max(1) * std::mem::size_of::<f32>()) as u64;
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tensor storage"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    pub(crate) fn write(&self, buffer: &wgpu::Buffer, data: &[f32]) {
        if data.is_empty() {
            return;
        }
        self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
    }

    pub(crate) fn copy(&self, src: &wgpu::Buffer, dst: &wgpu::Buffer, len: usize) {
        if len == 0 {
            return;
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tensor copy"),
            });
        encoder.copy_buffer_to_buffer(src, 0, dst, 0, (len * std::mem::size_of::<f32>()) as u64);
        self.queue.submit(Some(encoder.finish()));
    }

    /// Copies `len` floats out of `buffer` through a mapped staging buffer,
    /// blocking until every previously submitted kernel has finished.
    pub(crate) fn read(&self, buffer: &wgpu::Buffer, len: usize, dst: &mut [f32]) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let size = (len * std::mem::size_of::<f32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tensor staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tensor read"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(rx.receive())
            .ok_or_else(|| Error::Gpu("staging buffer mapping was cancelled".into()))?
            .map_err(|e| Error::Gpu(format!("staging buffer mapping failed: {e}")))?;

        {
            let data = slice.get_mapped_range();
            dst.copy_from_slice(bytemuck::cast_slice(&data));
        }
        staging.unmap();
        Ok(())
    }

    /// Runs `kernel` with one invocation per output element.
    ///
    /// Submissions execute in queue order, so a later dispatch or read always
    /// observes the results of this one.
    pub(crate) fn dispatch<P: bytemuck::Pod>(
        &self,
        kernel: Kernel,
        params: &P,
        buffers: &[&wgpu::Buffer],
        threads: usize,
    ) -> Result<()> {
        if threads == 0 {
            return Ok(());
        }
        let pipeline = self
            .pipelines
            .get(&kernel)
            .ok_or_else(|| Error::Gpu(format!("pipeline {kernel:?} was not compiled")))?;

        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kernel params"),
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut entries = Vec::with_capacity(buffers.len() + 1);
        entries.push(wgpu::BindGroupEntry {
            binding: 0,
            resource: params_buffer.as_entire_binding(),
        });
        for (i, buffer) in buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel bind group"),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let (groups_x, groups_y) = workgroups(threads);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kernel encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("kernel pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.adapter_name)
            .finish()
    }
}

/// Splits a 1-D launch over two grid dimensions so large tensors stay under
/// the per-dimension workgroup limit. Shaders rebuild the flat index as
/// `gid.x + gid.y * num_workgroups.x * 64`.
fn workgroups(threads: usize) -> (u32, u32) {
    let groups = threads.div_ceil(WORKGROUP_SIZE);
    let x = groups.min(MAX_GROUPS_PER_DIM);
    let y = groups.div_ceil(x);
    (x as u32, y as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workgroups_cover_every_thread() {
        assert_eq!(workgroups(1), (1, 1));
        assert_eq!(workgroups(64), (1, 1));
        assert_eq!(workgroups(65), (2, 1));
        let (x, y) = workgroups(10_000_000);
        assert!(x as usize <= MAX_GROUPS_PER_DIM);
        assert!(x as usize * y as usize * WORKGROUP_SIZE >= 10_000_000);
    }
}
