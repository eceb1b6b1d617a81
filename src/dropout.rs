//! Dropout masks sampled once per forward pass.
//!
//! A recurrent stage must drop the same units at every step of one pass, so
//! masks are drawn up front from an explicit generator and handed to each
//! stage; nothing in this crate samples from an ambient RNG.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::Result;

/// Masks used by one stage. `None` means no dropout at that site.
#[derive(Debug, Clone, Default)]
pub struct StageMasks {
    /// Shared mask over node-state units (same tensor for every state-reading stage).
    pub states: Option<Tensor>,
    /// Mask over the stage's input features.
    pub input: Option<Tensor>,
    /// Mask over the stage's hidden layer.
    pub hidden: Option<Tensor>,
}

/// Inverted-dropout mask sampler: kept units are scaled by `1 / keep`.
pub struct DropoutSampler<'a> {
    keep: f64,
    rng: &'a mut StdRng,
    device: Device,
}

impl<'a> DropoutSampler<'a> {
    /// Sampler keeping each unit with probability `keep`.
    pub fn new(keep: f64, rng: &'a mut StdRng, device: &Device) -> Self {
        Self { keep, rng, device: device.clone() }
    }

    /// A mask of `width` units, or `None` when nothing is dropped.
    pub fn mask(&mut self, width: usize) -> Result<Option<Tensor>> {
        if self.keep >= 1.0 {
            return Ok(None);
        }
        let scale = (1.0 / self.keep) as f32;
        let values: Vec<f32> = (0..width)
            .map(|_| if self.rng.random::<f64>() < self.keep { scale } else { 0.0 })
            .collect();
        Ok(Some(Tensor::from_vec(values, width, &self.device)?))
    }

    /// Masks for a stage reading node states through `states`, with the given input and hidden widths.
    pub fn stage(&mut self, states: Option<&Tensor>, input: usize, hidden: Option<usize>) -> Result<StageMasks> {
        Ok(StageMasks {
            states: states.cloned(),
            input: self.mask(input)?,
            hidden: match hidden {
                Some(w) => self.mask(w)?,
                None => None,
            },
        })
    }
}

/// Multiply the last axis of `x` by `mask`, if any.
pub fn apply(x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    match mask {
        Some(m) => Ok(x.broadcast_mul(m)?),
        None => Ok(x.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn keep_one_samples_nothing() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut s = DropoutSampler::new(1.0, &mut rng, &Device::Cpu);
        assert!(s.mask(16).unwrap().is_none());
    }

    #[test]
    fn mask_entries_are_zero_or_inverse_keep() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut s = DropoutSampler::new(0.5, &mut rng, &Device::Cpu);
        let m = s.mask(2000).unwrap().unwrap().to_vec1::<f32>().unwrap();
        assert!(m.iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = m.iter().filter(|&&v| v > 0.0).count() as f64 / m.len() as f64;
        assert!((kept - 0.5).abs() < 0.05, "kept={}", kept);
    }

    #[test]
    fn same_seed_gives_same_masks() {
        let mut a = StdRng::seed_from_u64(3);
        let mut b = StdRng::seed_from_u64(3);
        let ma = DropoutSampler::new(0.7, &mut a, &Device::Cpu).mask(64).unwrap().unwrap();
        let mb = DropoutSampler::new(0.7, &mut b, &Device::Cpu).mask(64).unwrap().unwrap();
        assert_eq!(ma.to_vec1::<f32>().unwrap(), mb.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn apply_broadcasts_over_leading_axes() {
        let x = Tensor::ones((2, 3, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let m = Tensor::new(&[0.0f32, 2.0], &Device::Cpu).unwrap();
        let y = apply(&x, Some(&m)).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(y, vec![0.0, 2.0, 0.0, 2.0, 0.0, 2.0, 0.0, 2.0, 0.0, 2.0, 0.0, 2.0]);
    }
}
