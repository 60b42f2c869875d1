use std::path::PathBuf;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Environment variable selecting the device: `cpu`, `gpu` or `auto`.
pub const DEVICE_ENV: &str = "LAYERNET_DEVICE";

/// Environment variable naming the directory holding the MNIST IDX files.
pub const MNIST_DIR_ENV: &str = "LAYERNET_MNIST_DIR";

/// Hyperparameters for a training run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    /// Initial learning rate
    pub learning_rate: f32,

    /// Samples per batch
    pub batch_size: usize,

    /// Factor applied to the learning rate when an epoch's mean loss rises
    pub decay: f32,

    /// Seed for weight initialisation and dropout masks
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            learning_rate: 0.001,
            batch_size: 50,
            decay: 0.6,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Cpu,
    Gpu,
    /// GPU when an adapter is available, otherwise the host device.
    Auto,
}

impl std::str::FromStr for DevicePreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DevicePreference::Cpu),
            "gpu" => Ok(DevicePreference::Gpu),
            "auto" | "" => Ok(DevicePreference::Auto),
            other => Err(Error::config(format!(
                "{DEVICE_ENV}={other}: expected cpu, gpu or auto"
            ))),
        }
    }
}

/// Device preference from the environment, read once per process. Unset or
/// unparsable values mean `Auto`.
pub fn device_preference() -> DevicePreference {
    static PREFERENCE: OnceLock<DevicePreference> = OnceLock::new();
    *PREFERENCE.get_or_init(|| {
        std::env::var(DEVICE_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DevicePreference::Auto)
    })
}

pub fn mnist_dir() -> PathBuf {
    std::env::var_os(MNIST_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mnist"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_train_config() {
        let config = TrainConfig::default();

        assert_eq!(config.learning_rate, 0.001);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.decay, 0.6);
    }

    #[test]
    fn test_parses_device_preference() {
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!(" gpu ".parse::<DevicePreference>().unwrap(), DevicePreference::Gpu);
        assert_eq!("".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }
}
