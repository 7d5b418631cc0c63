//! Joint feature-space reduction across conditions.
//!
//! Computes a shared linear subspace over the row-stacked data of every
//! registered condition and writes each condition's projected matrix back
//! into the registry's representation table, where the trainer can select it
//! by name as encoder input.

use candle_core::{Device, Tensor};

use crate::dataset::{DatasetRegistry, Matrix, RAW_REPR};
use crate::error::{AlignError, Result};

/// Reduction method selector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReduceMethod {
    /// Principal axes of the column-centered stacked matrix, recovered by
    /// orthogonal iteration on the feature-space Gram matrix.
    JointPca { iterations: usize, seed: u64 },
}

impl Default for ReduceMethod {
    fn default() -> Self {
        ReduceMethod::JointPca {
            iterations: 30,
            seed: 42,
        }
    }
}

/// Compute a joint reduced representation and store it under `repr_name` for
/// every condition.
///
/// The decomposition is shared: one set of axes is fit on all conditions
/// together, so condition matrices land in a common `target_dims`-dimensional
/// space. Fails with a dimension error when `target_dims` exceeds what the
/// input can support.
pub fn compute_joint_representation(
    registry: &mut DatasetRegistry,
    repr_name: &str,
    method: ReduceMethod,
    target_dims: usize,
) -> Result<()> {
    if registry.n_conditions() == 0 {
        return Err(AlignError::Config(
            "no conditions registered to reduce".to_string(),
        ));
    }
    let total_cells: usize = registry.conditions().iter().map(|c| c.n_cells()).sum();
    let n_features = registry.n_features();
    let rank_bound = total_cells.min(n_features);
    if target_dims == 0 || target_dims > rank_bound {
        return Err(AlignError::Dimension(format!(
            "target_dims {target_dims} outside 1..={rank_bound} for {total_cells} cells x {n_features} features"
        )));
    }

    let ReduceMethod::JointPca { iterations, seed } = method;

    let device = Device::Cpu;
    let raws: Vec<&Matrix> = registry
        .conditions()
        .iter()
        .map(|c| c.representation(RAW_REPR).expect("raw always present"))
        .collect();
    let stacked = Matrix::vstack(&raws)?;
    let means = stacked.column_means();

    let centered = center_columns(&stacked, &means, &device)?;
    // d x d Gram matrix; features are the shared axis across conditions.
    let gram = centered.t()?.matmul(&centered)?;

    let init = gaussian_matrix(seed, n_features, target_dims, &device)?;
    let mut q = orthonormalize(&init, &device)?;
    for _ in 0..iterations {
        let z = gram.matmul(&q)?;
        q = orthonormalize(&z, &device)?;
    }

    let names: Vec<String> = registry
        .conditions()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    for name in names {
        let raw = registry.representation(&name, RAW_REPR)?;
        let centered = center_columns(raw, &means, &device)?;
        let reduced = centered.matmul(&q)?;
        registry.add_representation(&name, repr_name, Matrix::from_tensor(&reduced)?)?;
    }
    Ok(())
}

fn gaussian_matrix(seed: u64, rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    use rand::{rngs::StdRng, SeedableRng};
    use rand_distr::{Distribution, StandardNormal};

    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| StandardNormal.sample(&mut rng))
        .collect();
    Ok(Tensor::from_slice(&data, (rows, cols), device)?)
}

fn center_columns(m: &Matrix, means: &[f32], device: &Device) -> Result<Tensor> {
    let t = m.to_tensor(device)?;
    let mean_row = Tensor::from_slice(means, (1, means.len()), device)?;
    Ok(t.broadcast_sub(&mean_row)?)
}

/// Modified Gram-Schmidt over the columns of `z`. Detects rank deficiency
/// when a column collapses to (near) zero after removing earlier components.
fn orthonormalize(z: &Tensor, device: &Device) -> Result<Tensor> {
    let (rows, cols) = z.dims2()?;
    let flat = z.flatten_all()?.to_vec1::<f32>()?;
    // column-major working copy
    let mut basis: Vec<Vec<f32>> = (0..cols)
        .map(|c| (0..rows).map(|r| flat[r * cols + c]).collect())
        .collect();

    for c in 0..cols {
        let original_norm: f32 = basis[c].iter().map(|v| v * v).sum::<f32>().sqrt();
        for prev in 0..c {
            let dot: f32 = basis[c]
                .iter()
                .zip(basis[prev].iter())
                .map(|(a, b)| a * b)
                .sum();
            for r in 0..rows {
                basis[c][r] -= dot * basis[prev][r];
            }
        }
        let norm: f32 = basis[c].iter().map(|v| v * v).sum::<f32>().sqrt();
        // relative test: f32 round-off scales with the column magnitude
        if norm < 1e-4 * original_norm.max(1e-12) {
            return Err(AlignError::Dimension(format!(
                "input rank below requested dimensions (component {c} degenerate)"
            )));
        }
        for v in &mut basis[c] {
            *v /= norm;
        }
    }

    let mut out = vec![0.0f32; rows * cols];
    for (c, col) in basis.iter().enumerate() {
        for (r, v) in col.iter().enumerate() {
            out[r * cols + c] = *v;
        }
    }
    Ok(Tensor::from_slice(&out, (rows, cols), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{cell_ids, feature_names};
    use rstest::*;

    fn two_condition_registry(cells: usize, features: usize) -> DatasetRegistry {
        let mut reg = DatasetRegistry::new();
        let names = feature_names(features);
        for cond in ["young", "old"] {
            let data: Vec<f32> = (0..cells * features)
                .map(|i| ((i * 37 + cond.len() * 11) % 17) as f32 / 17.0)
                .collect();
            reg.register(
                cond,
                cell_ids(cond, cells),
                &names,
                Matrix::new(cells, features, data).unwrap(),
                None,
            )
            .unwrap();
        }
        reg
    }

    #[rstest]
    fn joint_pca_writes_reduced_matrices_for_every_condition() {
        let mut reg = two_condition_registry(10, 6);
        compute_joint_representation(&mut reg, "joint4", ReduceMethod::default(), 4).unwrap();

        assert!(reg.has_representation("joint4"));
        let young = reg.representation("young", "joint4").unwrap();
        assert_eq!((young.rows(), young.cols()), (10, 4));
        let old = reg.representation("old", "joint4").unwrap();
        assert_eq!((old.rows(), old.cols()), (10, 4));
    }

    #[rstest]
    #[case(0)]
    #[case(7)] // > n_features
    fn invalid_target_dims_is_a_dimension_error(#[case] dims: usize) {
        let mut reg = two_condition_registry(10, 6);
        let err =
            compute_joint_representation(&mut reg, "joint", ReduceMethod::default(), dims)
                .unwrap_err();
        assert!(matches!(err, AlignError::Dimension(_)));
    }

    #[rstest]
    fn rank_deficient_input_is_detected() {
        // Two distinct rows repeated: rank 2 (at most), asking for 3 axes
        // must fail during orthonormalization.
        let mut reg = DatasetRegistry::new();
        let names = feature_names(4);
        let row_a = [1.0f32, 2.0, 3.0, 4.0];
        let row_b = [0.5f32, -1.0, 2.0, 0.0];
        let mut data = Vec::new();
        for i in 0..6 {
            data.extend_from_slice(if i % 2 == 0 { &row_a } else { &row_b });
        }
        reg.register(
            "only",
            cell_ids("c", 6),
            &names,
            Matrix::new(6, 4, data.clone()).unwrap(),
            None,
        )
        .unwrap();
        reg.register(
            "twin",
            cell_ids("t", 6),
            &names,
            Matrix::new(6, 4, data).unwrap(),
            None,
        )
        .unwrap();

        let err = compute_joint_representation(&mut reg, "joint", ReduceMethod::default(), 3)
            .unwrap_err();
        assert!(matches!(err, AlignError::Dimension(_)));
    }

    #[rstest]
    fn same_seed_reproduces_the_representation() {
        let method = ReduceMethod::JointPca {
            iterations: 20,
            seed: 7,
        };
        let mut a = two_condition_registry(8, 5);
        let mut b = two_condition_registry(8, 5);
        compute_joint_representation(&mut a, "j", method, 3).unwrap();
        compute_joint_representation(&mut b, "j", method, 3).unwrap();
        assert_eq!(
            a.representation("young", "j").unwrap(),
            b.representation("young", "j").unwrap()
        );
    }
}
