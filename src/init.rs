use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Weight initialization strategies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WeightInit {
    /// Uniform in [-1, 1], scaled by 1/sqrt(fan_in)
    #[default]
    Uniform,

    /// Xavier/Glorot uniform initialization
    Xavier,

    /// He initialization (good for ReLU networks)
    HeNormal,
}

impl WeightInit {
    /// Fills the host copy of `weight` and pushes it to the device.
    pub(crate) fn fill<R: Rng>(self, weight: &mut Tensor, rng: &mut R, fan_in: usize, fan_out: usize) -> Result<()> {
        match self {
            WeightInit::Uniform => weight.set_random(rng, 1.0 / (fan_in as f32).sqrt()),
            WeightInit::Xavier => {
                let scale = (6.0 / (fan_in + fan_out) as f32).sqrt();
                weight.set_random(rng, scale);
            }
            WeightInit::HeNormal => {
                let std_dev = (2.0 / fan_in as f32).sqrt();
                let normal = Normal::new(0.0, std_dev)
                    .map_err(|e| Error::config(format!("he init with fan-in {fan_in}: {e}")))?;
                for v in weight.host_mut() {
                    *v = normal.sample(rng);
                }
            }
        }
        weight.push()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_uniform_scales_by_fan_in() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut w = Tensor::new(&Device::Cpu, &[100, 10]).unwrap();
        WeightInit::Uniform.fill(&mut w, &mut rng, 100, 10).unwrap();
        let values = w.to_vec().unwrap();
        assert!(values.iter().all(|v| v.abs() <= 0.1));
        assert!(values.iter().any(|v| v.abs() > 0.05));
    }

    #[test]
    fn test_he_normal_has_expected_spread() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut w = Tensor::new(&Device::Cpu, &[50, 200]).unwrap();
        WeightInit::HeNormal.fill(&mut w, &mut rng, 50, 200).unwrap();
        let values = w.to_vec().unwrap();
        let var = values.iter().map(|v| v * v).sum::<f32>() / values.len() as f32;
        assert!((var - 2.0 / 50.0).abs() < 0.01, "variance {var}");
    }

    #[test]
    fn test_same_seed_same_weights() {
        let fill = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut w = Tensor::new(&Device::Cpu, &[8, 8]).unwrap();
            WeightInit::Xavier.fill(&mut w, &mut rng, 8, 8).unwrap();
            w.to_vec().unwrap()
        };
        assert_eq!(fill(3), fill(3));
        assert_ne!(fill(3), fill(4));
    }
}
