use std::fmt;

use rand::Rng;

use crate::device::{Device, Storage};
use crate::error::{Error, Result};

/// Up to four dimensions, `d0` innermost.
///
/// The rank is stored explicitly so that a per-sample shape such as
/// `[28, 28, 1]` keeps its trailing unit channel axis and the batch axis can be
/// appended after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: [usize; 4],
    rank: usize,
}

impl Shape {
    pub const MAX_RANK: usize = 4;

    pub fn new(dims: &[usize]) -> Result<Self> {
        if dims.is_empty() || dims.len() > Self::MAX_RANK {
            return Err(Error::config(format!(
                "a shape needs between 1 and {} dimensions, got {}",
                Self::MAX_RANK,
                dims.len()
            )));
        }
        if dims.contains(&0) {
            return Err(Error::config(format!("zero-sized dimension in {dims:?}")));
        }
        let mut all = [1; 4];
        all[..dims.len()].copy_from_slice(dims);
        Ok(Shape {
            dims: all,
            rank: dims.len(),
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.rank]
    }

    /// Dimension `i`, or 1 past the rank.
    pub fn dim(&self, i: usize) -> usize {
        self.dims.get(i).copied().unwrap_or(1)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Appends a batch axis after the last dimension of a per-sample shape.
    pub fn with_batch(&self, batch: usize) -> Result<Shape> {
        if self.rank == Self::MAX_RANK {
            return Err(Error::config(format!(
                "sample shape {self} leaves no room for a batch axis"
            )));
        }
        let mut dims = self.dims().to_vec();
        dims.push(batch);
        Shape::new(&dims)
    }

    /// Number of samples in a batch tensor of length `len` with this
    /// per-sample shape.
    pub fn batch_in(&self, len: usize) -> Result<usize> {
        let sample = self.numel();
        if len == 0 || len % sample != 0 {
            return Err(Error::BatchMismatch { len, sample });
        }
        Ok(len / sample)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims())
    }
}

/// Which copy of a tensor holds the newest data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    /// Host data was written and not pushed yet.
    HostAhead,
    /// Device data was written and not pulled yet.
    DeviceAhead,
}

/// A shape-tagged `f32` buffer with a host copy and a device copy.
///
/// The two copies are never synchronised implicitly: [`Tensor::push`] copies
/// host to device and [`Tensor::pull`] copies device to host. Layer kernels
/// only ever read and write the device copy.
pub struct Tensor {
    shape: Shape,
    host: Vec<f32>,
    storage: Storage,
    sync: SyncState,
}

impl Tensor {
    /// Zero-filled tensor, both copies in sync.
    pub fn new(device: &Device, dims: &[usize]) -> Result<Self> {
        Self::with_shape(device, Shape::new(dims)?)
    }

    pub fn with_shape(device: &Device, shape: Shape) -> Result<Self> {
        let len = shape.numel();
        Ok(Tensor {
            shape,
            host: vec![0.0; len],
            storage: device.alloc(len)?,
            sync: SyncState::Synced,
        })
    }

    /// Wraps host data. The device copy stays zeroed until [`Tensor::push`].
    pub fn from_vec(device: &Device, dims: &[usize], data: Vec<f32>) -> Result<Self> {
        let mut tensor = Self::new(device, dims)?;
        if data.len() != tensor.len() {
            return Err(Error::config(format!(
                "{} values supplied for a {} tensor of {} elements",
                data.len(),
                tensor.shape,
                tensor.len()
            )));
        }
        tensor.host = data;
        tensor.sync = SyncState::HostAhead;
        Ok(tensor)
    }

    /// Reallocates both copies for `dims`. Prior contents are discarded.
    pub fn reset(&mut self, dims: &[usize]) -> Result<()> {
        self.reset_shape(Shape::new(dims)?)
    }

    pub(crate) fn reset_shape(&mut self, shape: Shape) -> Result<()> {
        let len = shape.numel();
        let device = self.device();
        self.storage = device.alloc(len)?;
        self.host = vec![0.0; len];
        self.shape = shape;
        self.sync = SyncState::Synced;
        Ok(())
    }

    /// Reallocates only when the shape changes; an unchanged shape keeps the
    /// buffers so per-batch outputs are overwritten in place.
    pub(crate) fn ensure_shape(&mut self, shape: Shape) -> Result<()> {
        if self.shape == shape {
            return Ok(());
        }
        if self.shape.numel() == shape.numel() {
            self.shape = shape;
            return Ok(());
        }
        self.reset_shape(shape)
    }

    /// Reinterprets the buffer under new dimensions of equal element count.
    pub fn reshape(&mut self, dims: &[usize]) -> Result<()> {
        let to = Shape::new(dims)?;
        if to.numel() != self.shape.numel() {
            return Err(Error::ReshapeMismatch {
                from: self.shape,
                from_len: self.shape.numel(),
                to,
                to_len: to.numel(),
            });
        }
        self.shape = to;
        Ok(())
    }

    /// Fills the host copy with values uniform in `[-scale, scale]`.
    pub fn set_random<R: Rng>(&mut self, rng: &mut R, scale: f32) {
        for v in self.host.iter_mut() {
            *v = rng.random_range(-1.0f32..=1.0) * scale;
        }
        self.sync = SyncState::HostAhead;
    }

    /// Host → device, overwriting the whole device copy.
    pub fn push(&mut self) -> Result<()> {
        self.storage.upload(&self.host)?;
        self.sync = SyncState::Synced;
        Ok(())
    }

    /// Device → host, overwriting the whole host copy.
    pub fn pull(&mut self) -> Result<()> {
        self.storage.download(&mut self.host)?;
        self.sync = SyncState::Synced;
        Ok(())
    }

    /// Downloads the device copy into a new vector, leaving the host copy and
    /// sync state untouched.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        let mut data = vec![0.0; self.len()];
        self.storage.download(&mut data)?;
        Ok(data)
    }

    /// Device-to-device copy of `src`, resizing `self` to match.
    pub fn copy_from(&mut self, src: &Tensor) -> Result<()> {
        self.ensure_shape(src.shape)?;
        self.storage.copy_from(&src.storage)?;
        self.sync = SyncState::DeviceAhead;
        Ok(())
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync
    }

    /// Host copy. Stale if the device copy was written since the last pull.
    pub fn host(&self) -> &[f32] {
        debug_assert!(
            self.sync != SyncState::DeviceAhead,
            "reading host copy of a {} tensor written on the device; pull() first",
            self.shape
        );
        &self.host
    }

    /// Mutable host copy; the device copy becomes stale until [`Tensor::push`].
    pub fn host_mut(&mut self) -> &mut [f32] {
        self.sync = SyncState::HostAhead;
        &mut self.host
    }

    /// True when the host copy can be trusted without a pull.
    pub fn host_is_current(&self) -> bool {
        self.sync != SyncState::DeviceAhead
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Device copy for a kernel that writes it.
    pub(crate) fn storage_mut(&mut self) -> &mut Storage {
        self.sync = SyncState::DeviceAhead;
        &mut self.storage
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("sync", &self.sync)
            .field("device", &self.storage.device())
            .finish()
    }
}
