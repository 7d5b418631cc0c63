//! Shared encoder: representation space -> latent space.
//!
//! One encoder serves every condition; alignment pressure comes from the
//! training objective, not from per-condition parameters.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use serde::Deserialize;

/// Architecture-size selector trading capacity for speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDepth {
    #[default]
    Small,
    Medium,
    Large,
}

impl NetworkDepth {
    pub fn hidden_widths(&self) -> &'static [usize] {
        match self {
            NetworkDepth::Small => &[64],
            NetworkDepth::Medium => &[128, 64],
            NetworkDepth::Large => &[256, 128, 64],
        }
    }
}

#[derive(Debug)]
pub struct EncoderNet {
    hidden: Vec<Linear>,
    head: Linear,
}

impl EncoderNet {
    pub fn load(
        vb: VarBuilder,
        in_dim: usize,
        latent_dim: usize,
        depth: NetworkDepth,
    ) -> Result<Self> {
        let mut hidden = Vec::new();
        let mut prev = in_dim;
        for (i, width) in depth.hidden_widths().iter().enumerate() {
            hidden.push(linear(prev, *width, vb.pp(format!("hidden{i}")))?);
            prev = *width;
        }
        let head = linear(prev, latent_dim, vb.pp("head"))?;
        Ok(Self { hidden, head })
    }

    /// (cells, in_dim) -> (cells, latent_dim)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.hidden {
            h = layer.forward(&h)?.relu()?;
        }
        self.head.forward(&h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_encoder_forward_shape() -> Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let encoder = EncoderNet::load(vb, 20, 8, NetworkDepth::Medium)?;

        let x = Tensor::zeros((5, 20), DType::F32, &device)?;
        let z = encoder.forward(&x)?;
        assert_eq!(z.dims(), &[5, 8]);
        Ok(())
    }

    #[test]
    fn test_depth_selector_widths() {
        assert_eq!(NetworkDepth::Small.hidden_widths(), &[64]);
        assert_eq!(NetworkDepth::Large.hidden_widths().len(), 3);
    }
}
