use std::sync::Arc;

use crate::config::{self, DevicePreference};
use crate::error::{Error, Result};
use crate::gpu::GpuContext;

/// Where the device copy of every tensor lives.
///
/// `Cpu` keeps the device copy in a second host allocation, so push/pull and
/// staleness behave exactly as they do on a GPU. `Gpu` keeps it in a wgpu
/// storage buffer and runs kernels as compute shaders.
#[derive(Clone, Debug)]
pub enum Device {
    Cpu,
    Gpu(Arc<GpuContext>),
}

impl Device {
    /// Acquires the default wgpu adapter.
    pub fn gpu() -> Result<Self> {
        Ok(Device::Gpu(Arc::new(GpuContext::new()?)))
    }

    /// Device chosen by `LAYERNET_DEVICE`; `auto` falls back to the host
    /// device when no adapter is available.
    pub fn from_env() -> Result<Self> {
        match config::device_preference() {
            DevicePreference::Cpu => Ok(Device::Cpu),
            DevicePreference::Gpu => Self::gpu(),
            DevicePreference::Auto => Ok(Self::gpu().unwrap_or(Device::Cpu)),
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }

    pub(crate) fn alloc(&self, len: usize) -> Result<Storage> {
        match self {
            Device::Cpu => Ok(Storage::Host(vec![0.0; len])),
            Device::Gpu(ctx) => Ok(Storage::Gpu {
                buffer: ctx.create_storage_buffer(len),
                len,
                ctx: Arc::clone(ctx),
            }),
        }
    }

    pub(crate) fn same(&self, other: &Device) -> bool {
        match (self, other) {
            (Device::Cpu, Device::Cpu) => true,
            (Device::Gpu(a), Device::Gpu(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// The device copy of a tensor.
pub(crate) enum Storage {
    Host(Vec<f32>),
    Gpu {
        ctx: Arc<GpuContext>,
        buffer: wgpu::Buffer,
        len: usize,
    },
}

impl Storage {
    pub fn device(&self) -> Device {
        match self {
            Storage::Host(_) => Device::Cpu,
            Storage::Gpu { ctx, .. } => Device::Gpu(Arc::clone(ctx)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::Host(data) => data.len(),
            Storage::Gpu { len, .. } => *len,
        }
    }

    pub fn upload(&mut self, src: &[f32]) -> Result<()> {
        self.check_len(src.len(), "push")?;
        match self {
            Storage::Host(data) => data.copy_from_slice(src),
            Storage::Gpu { ctx, buffer, .. } => ctx.write(buffer, src),
        }
        Ok(())
    }

    pub fn download(&self, dst: &mut [f32]) -> Result<()> {
        self.check_len(dst.len(), "pull")?;
        match self {
            Storage::Host(data) => dst.copy_from_slice(data),
            Storage::Gpu { ctx, buffer, len } => ctx.read(buffer, *len, dst)?,
        }
        Ok(())
    }

    pub fn copy_from(&mut self, src: &Storage) -> Result<()> {
        self.check_len(src.len(), "copy_from")?;
        match (self, src) {
            (Storage::Host(dst), Storage::Host(src)) => dst.copy_from_slice(src),
            (
                Storage::Gpu {
                    ctx, buffer: dst, len, ..
                },
                Storage::Gpu {
                    ctx: src_ctx,
                    buffer: src,
                    ..
                },
            ) if Arc::ptr_eq(ctx, src_ctx) => ctx.copy(src, dst, *len),
            _ => return Err(Error::DeviceMismatch("copy_from")),
        }
        Ok(())
    }

    pub fn as_host(&self) -> Option<&[f32]> {
        match self {
            Storage::Host(data) => Some(data),
            Storage::Gpu { .. } => None,
        }
    }

    pub fn as_host_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            Storage::Host(data) => Some(data),
            Storage::Gpu { .. } => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&wgpu::Buffer> {
        match self {
            Storage::Host(_) => None,
            Storage::Gpu { buffer, .. } => Some(buffer),
        }
    }

    fn check_len(&self, other: usize, context: &'static str) -> Result<()> {
        if self.len() != other {
            return Err(Error::config(format!(
                "{context}: device copy holds {} elements, other side {other}",
                self.len()
            )));
        }
        Ok(())
    }
}
