//! A small neural-network training engine with host/device tensors.
//!
//! A [`Network`] is a linear stack of [`Layer`]s driven through
//! forward → backward → update. Every [`Tensor`] has a host copy and a device
//! copy that are synchronised only by explicit `push`/`pull`; layer math runs
//! on the device, either a wgpu GPU or the host-simulated [`Device::Cpu`].

mod device;
mod gpu;
mod kernels;
mod tensor;

pub mod config;
pub mod dataset;
pub mod error;
pub mod init;
pub mod layer;
pub mod layers;
pub mod metrics;
pub mod network;
pub mod weights;

pub use device::Device;
pub use error::{Error, Result};
pub use gpu::GpuContext;
pub use init::WeightInit;
pub use kernels::PROB_FLOOR;
pub use layer::Layer;
pub use network::{Network, Phase};
pub use tensor::{Shape, SyncState, Tensor};
