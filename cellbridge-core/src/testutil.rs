//! Shared fixtures for the crate's tests.

use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use crate::dataset::{DatasetRegistry, Matrix};

pub(crate) fn feature_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("gene{i}")).collect()
}

pub(crate) fn cell_ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}.{i}")).collect()
}

fn gaussian_rows(rng: &mut StdRng, cells: usize, features: usize) -> Vec<f32> {
    (0..cells * features)
        .map(|_| StandardNormal.sample(rng))
        .collect()
}

/// Two conditions ("young", "old") with two cell types each and a small
/// condition-specific shift, so there is real structure to align.
pub(crate) fn structured_registry(cells: usize, features: usize) -> DatasetRegistry {
    let mut rng = StdRng::seed_from_u64(17);
    let mut reg = DatasetRegistry::new();
    let names = feature_names(features);

    for (cond, shift) in [("young", 0.0f32), ("old", 0.5)] {
        let mut data = gaussian_rows(&mut rng, cells, features);
        let mut labels = Vec::with_capacity(cells);
        for r in 0..cells {
            // first half of cells: type "hsc" pushed up on the leading
            // features, rest: type "prog" pushed down
            let (type_shift, label) = if r < cells / 2 {
                (1.0, "hsc")
            } else {
                (-1.0, "prog")
            };
            labels.push(label.to_string());
            for c in 0..features {
                let v = &mut data[r * features + c];
                if c < features / 2 {
                    *v += type_shift;
                }
                *v += shift;
            }
        }
        reg.register(
            cond,
            cell_ids(cond, cells),
            &names,
            Matrix::new(cells, features, data).unwrap(),
            Some(labels),
        )
        .unwrap();
    }
    reg
}

/// Two conditions drawn from one identical distribution: zero condition
/// effect by construction.
pub(crate) fn null_pair_registry(cells: usize, features: usize) -> DatasetRegistry {
    let mut rng = StdRng::seed_from_u64(23);
    let mut reg = DatasetRegistry::new();
    let names = feature_names(features);
    for cond in ["young", "old"] {
        let data = gaussian_rows(&mut rng, cells, features);
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
