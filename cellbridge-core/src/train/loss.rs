//! Unsupervised alignment objective.
//!
//! Two components:
//! 1. Alignment: multi-bandwidth RBF maximum mean discrepancy between every
//!    pair of per-condition latent clouds. MMD needs no correspondence labels
//!    and drives the clouds to overlap, which is exactly the observable
//!    contract (clusters form by cell type, not by condition).
//! 2. Reconstruction: per-condition MSE of the decoder output against the
//!    decoder-input representation, active only when decoding is enabled.
//!
//! Bandwidths are the median pairwise squared distance scaled by
//! {0.5, 1, 2}, recomputed per step from detached values.

use candle_core::{DType, Tensor};

use crate::error::Result;

const BANDWIDTH_SCALES: [f64; 3] = [0.5, 1.0, 2.0];

/// Per-component loss values for logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossComponents {
    /// Pairwise MMD alignment term.
    pub align: f32,
    /// Reconstruction term (zero when decoding is disabled).
    pub recon: f32,
    /// Weighted total.
    pub total: f32,
}

/// Weighted combination of alignment and reconstruction terms.
pub struct AlignmentLoss {
    lambda_align: f64,
    lambda_recon: f64,
}

impl AlignmentLoss {
    pub fn new(lambda_align: f64, lambda_recon: f64) -> Self {
        Self {
            lambda_align,
            lambda_recon,
        }
    }

    /// Multi-bandwidth RBF MMD^2 between two latent clouds `x` [n, d] and
    /// `y` [m, d]. Biased estimator; non-negative up to round-off.
    pub fn mmd(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let d2_xx = pairwise_sq_dists(x, x)?;
        let d2_yy = pairwise_sq_dists(y, y)?;
        let d2_xy = pairwise_sq_dists(x, y)?;

        // median heuristic on detached cross distances
        let mut vals = d2_xy.detach().flatten_all()?.to_vec1::<f32>()?;
        vals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = vals.get(vals.len() / 2).copied().unwrap_or(0.0) as f64;
        let median = if median > 1e-12 { median } else { 1.0 };

        let mut total: Option<Tensor> = None;
        for scale in BANDWIDTH_SCALES {
            let neg_inv_bw = -1.0 / (scale * median);
            let k_xx = d2_xx.affine(neg_inv_bw, 0.0)?.exp()?.mean_all()?;
            let k_yy = d2_yy.affine(neg_inv_bw, 0.0)?.exp()?.mean_all()?;
            let k_xy = d2_xy.affine(neg_inv_bw, 0.0)?.exp()?.mean_all()?;
            let term = k_xx.add(&k_yy)?.sub(&k_xy.affine(2.0, 0.0)?)?;
            total = Some(match total {
                Some(t) => t.add(&term)?,
                None => term,
            });
        }
        Ok(total.expect("at least one bandwidth"))
    }

    /// Combined loss over per-condition latents and optional (decoded, target)
    /// reconstruction pairs. Returns the scalar tensor for backward plus the
    /// extracted components for logging.
    pub fn compute(
        &self,
        latents: &[Tensor],
        recons: &[(Tensor, Tensor)],
    ) -> Result<(Tensor, LossComponents)> {
        let device = latents[0].device().clone();

        let mut align: Option<Tensor> = None;
        let mut pairs = 0usize;
        for i in 0..latents.len() {
            for j in (i + 1)..latents.len() {
                let term = self.mmd(&latents[i], &latents[j])?;
                align = Some(match align {
                    Some(t) => t.add(&term)?,
                    None => term,
                });
                pairs += 1;
            }
        }
        let align = match align {
            Some(t) => t.affine(1.0 / pairs as f64, 0.0)?,
            None => Tensor::zeros((), DType::F32, &device)?,
        };

        let mut recon: Option<Tensor> = None;
        for (decoded, target) in recons {
            let term = candle_nn::loss::mse(decoded, target)?;
            recon = Some(match recon {
                Some(t) => t.add(&term)?,
                None => term,
            });
        }
        let recon = match recon {
            Some(t) => t.affine(1.0 / recons.len() as f64, 0.0)?,
            None => Tensor::zeros((), DType::F32, &device)?,
        };

        let total = align
            .affine(self.lambda_align, 0.0)?
            .add(&recon.affine(self.lambda_recon, 0.0)?)?;

        let components = LossComponents {
            align: align.to_scalar::<f32>()?,
            recon: recon.to_scalar::<f32>()?,
            total: total.to_scalar::<f32>()?,
        };
        Ok((total, components))
    }
}

/// Squared euclidean distances between all row pairs of `x` [n, d] and
/// `y` [m, d], as [n, m]. Clamps the tiny negatives f32 round-off produces.
fn pairwise_sq_dists(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let xx = x.sqr()?.sum_keepdim(1)?; // [n, 1]
    let yy = y.sqr()?.sum_keepdim(1)?.t()?; // [1, m]
    let xy = x.matmul(&y.t()?)?; // [n, m]
    let d2 = xx.broadcast_add(&yy)?.sub(&xy.affine(2.0, 0.0)?)?;
    Ok(d2.relu()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn cloud(offset: f32, n: usize, d: usize) -> Tensor {
        let data: Vec<f32> = (0..n * d)
            .map(|i| offset + ((i * 31 + 7) % 13) as f32 / 13.0)
            .collect();
        Tensor::from_slice(&data, (n, d), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_mmd_identical_clouds_is_near_zero() {
        let loss = AlignmentLoss::new(1.0, 1.0);
        let x = cloud(0.0, 12, 4);
        let v = loss.mmd(&x, &x).unwrap().to_scalar::<f32>().unwrap();
        assert!(v.abs() < 1e-4, "mmd(x, x) should vanish, got {v}");
    }

    #[test]
    fn test_mmd_grows_with_separation() {
        let loss = AlignmentLoss::new(1.0, 1.0);
        let x = cloud(0.0, 12, 4);
        let near = loss
            .mmd(&x, &cloud(0.1, 12, 4))
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let far = loss
            .mmd(&x, &cloud(3.0, 12, 4))
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(far > near, "separated clouds must score higher: {far} vs {near}");
    }

    #[test]
    fn test_pairwise_dists_non_negative() {
        let x = cloud(0.0, 6, 3);
        let d2 = pairwise_sq_dists(&x, &x).unwrap();
        let vals = d2.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(vals.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_alignment_gradient_reaches_inputs() {
        let loss = AlignmentLoss::new(1.0, 0.0);
        let x = Var::from_tensor(&cloud(0.0, 8, 3)).unwrap();
        let y = Var::from_tensor(&cloud(1.0, 8, 3)).unwrap();

        let (total, _) = loss
            .compute(&[x.as_tensor().clone(), y.as_tensor().clone()], &[])
            .unwrap();
        let grads = total.backward().unwrap();
        let gx = grads.get(x.as_tensor()).expect("gradient for x");
        let norm: f32 = gx
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(norm > 1e-12, "alignment loss must be connected to inputs");
    }

    #[test]
    fn test_recon_term_included() {
        let loss = AlignmentLoss::new(1.0, 1.0);
        let x = cloud(0.0, 8, 3);
        let y = cloud(0.5, 8, 3);
        let decoded = cloud(0.0, 8, 5);
        let target = cloud(2.0, 8, 5);

        let (_, with_recon) = loss
            .compute(&[x.clone(), y.clone()], &[(decoded, target)])
            .unwrap();
        let (_, without) = loss.compute(&[x, y], &[]).unwrap();
        assert!(with_recon.recon > 0.0);
        assert_eq!(without.recon, 0.0);
        assert!(with_recon.total > without.total);
    }
}
