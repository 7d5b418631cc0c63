//! Per-condition decoders: latent space -> one condition's native feature
//! space.
//!
//! Each target condition owns an independently parameterized decoder, so the
//! `A->B` and `B->A` projections are separate learned maps, never transposes
//! of one another.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use super::encoder::NetworkDepth;

#[derive(Debug)]
pub struct DecoderNet {
    hidden: Vec<Linear>,
    head: Linear,
}

impl DecoderNet {
    /// Hidden widths mirror the encoder's, walked in reverse.
    pub fn load(
        vb: VarBuilder,
        latent_dim: usize,
        out_dim: usize,
        depth: NetworkDepth,
    ) -> Result<Self> {
        let mut hidden = Vec::new();
        let mut prev = latent_dim;
        for (i, width) in depth.hidden_widths().iter().rev().enumerate() {
            hidden.push(linear(prev, *width, vb.pp(format!("hidden{i}")))?);
            prev = *width;
        }
        let head = linear(prev, out_dim, vb.pp("head"))?;
        Ok(Self { hidden, head })
    }

    /// (cells, latent_dim) -> (cells, out_dim)
    pub fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let mut h = z.clone();
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
    fn test_decoder_forward_shape() -> Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let decoder = DecoderNet::load(vb, 8, 20, NetworkDepth::Medium)?;

        let z = Tensor::zeros((5, 8), DType::F32, &device)?;
        let x = decoder.forward(&z)?;
        assert_eq!(x.dims(), &[5, 20]);
        Ok(())
    }
}
