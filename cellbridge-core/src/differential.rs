//! Paired per-cell differential signal from opposite-direction projections.
//!
//! For every cell of conditions A and B, the signal is its vector "in B's
//! space" minus its vector "in A's space": cross-condition cells use their
//! directed projection, own-condition cells use their native decoder-input
//! row. Swapping the arguments therefore negates the matrix. The signal is
//! derived on demand from the two projection artifacts, never stored.

use crate::dataset::{DatasetRegistry, Matrix};
use crate::error::{AlignError, Result};
use crate::store::EmbeddingStore;

/// Per-cell, per-feature paired differential between two conditions.
#[derive(Debug, Clone)]
pub struct DifferentialSignal {
    pub condition_a: String,
    pub condition_b: String,
    /// `(condition, cell_id)` rows in canonical order, restricted to the two
    /// conditions.
    pub cells: Vec<(String, String)>,
    pub feature_names: Vec<String>,
    /// cells x features; `into_b - into_a` per cell.
    pub values: Matrix,
}

/// Compute the differential signal for `(a, b)` from the projections
/// published under `run`. Requires both `a->b` and `b->a`.
pub fn differential(
    store: &EmbeddingStore,
    registry: &DatasetRegistry,
    run: &str,
    a: &str,
    b: &str,
) -> Result<DifferentialSignal> {
    let a_to_b = store.projection(run, a, b)?;
    let b_to_a = store.projection(run, b, a)?;
    if a_to_b.native_repr != b_to_a.native_repr {
        return Err(AlignError::Schema(format!(
            "projections decode different representations: {:?} vs {:?}",
            a_to_b.native_repr, b_to_a.native_repr
        )));
    }
    let native_a = registry.representation(a, &a_to_b.native_repr)?;
    let native_b = registry.representation(b, &b_to_a.native_repr)?;
    let cols = native_a.cols();
    if native_b.cols() != cols || a_to_b.values.cols() != cols || b_to_a.values.cols() != cols {
        return Err(AlignError::Schema(
            "projection and native feature spaces disagree in width".to_string(),
        ));
    }

    let mut cells = Vec::new();
    let mut data = Vec::new();
    // canonical order: walk the registry's condition order, not (a, b)
    // argument order, so both call directions see identical rows.
    for cond in registry.conditions() {
        let name = cond.name();
        if name == a {
            for (r, cell) in cond.cell_ids().iter().enumerate() {
                cells.push((name.to_string(), cell.clone()));
                let into_b = a_to_b.values.row(r);
                let into_a = native_a.row(r);
                data.extend(into_b.iter().zip(into_a.iter()).map(|(pb, pa)| pb - pa));
            }
        } else if name == b {
            for (r, cell) in cond.cell_ids().iter().enumerate() {
                cells.push((name.to_string(), cell.clone()));
                let into_b = native_b.row(r);
                let into_a = b_to_a.values.row(r);
                data.extend(into_b.iter().zip(into_a.iter()).map(|(pb, pa)| pb - pa));
            }
        }
    }
    if cells.is_empty() {
        return Err(AlignError::UnknownCondition(format!("{a} / {b}")));
    }

    let values = Matrix::new(cells.len(), cols, data)?;
    Ok(DifferentialSignal {
        condition_a: a.to_string(),
        condition_b: b.to_string(),
        cells,
        feature_names: registry.feature_names().to_vec(),
        values,
    })
}

/// Top `top_k` feature indices by descending sample variance across the
/// population. Ties break by ascending feature index (registration order),
/// so the ranking is deterministic.
pub fn rank_by_variance(signal: &DifferentialSignal, top_k: usize) -> Result<Vec<usize>> {
    let cols = signal.values.cols();
    if top_k > cols {
        return Err(AlignError::Dimension(format!(
            "top_k {top_k} exceeds {cols} features"
        )));
    }
    let vars = column_variances(&signal.values);
    let mut idx: Vec<usize> = (0..cols).collect();
    idx.sort_by(|&i, &j| {
        vars[j]
            .partial_cmp(&vars[i])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(i.cmp(&j))
    });
    idx.truncate(top_k);
    Ok(idx)
}

/// Hierarchical leaf ordering of one group's cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOrdering {
    pub group: String,
    /// Row indices into the signal, in dendrogram leaf order.
    pub cell_indices: Vec<usize>,
}

/// Order cells within each group by average-linkage agglomerative clustering
/// over the signal rows. Presentation only: the signal itself is untouched.
/// Groups appear in first-occurrence order of `group_assignment`, which must
/// have one entry per signal row.
pub fn cluster_within_group(
    signal: &DifferentialSignal,
    group_assignment: &[String],
) -> Result<Vec<GroupOrdering>> {
    if group_assignment.len() != signal.values.rows() {
        return Err(AlignError::Schema(format!(
            "{} group assignments for {} cells",
            group_assignment.len(),
            signal.values.rows()
        )));
    }

    let mut groups: Vec<String> = Vec::new();
    for g in group_assignment {
        if !groups.contains(g) {
            groups.push(g.clone());
        }
    }

    let mut orderings = Vec::with_capacity(groups.len());
    for group in groups {
        let members: Vec<usize> = group_assignment
            .iter()
            .enumerate()
            .filter(|(_, g)| **g == group)
            .map(|(i, _)| i)
            .collect();
        let cell_indices = leaf_order(&signal.values, &members);
        orderings.push(GroupOrdering {
            group,
            cell_indices,
        });
    }
    Ok(orderings)
}

fn column_variances(m: &Matrix) -> Vec<f32> {
    let (rows, cols) = (m.rows(), m.cols());
    let means = m.column_means();
    let mut vars = vec![0.0f32; cols];
    if rows < 2 {
        return vars;
    }
    for r in 0..rows {
        for (c, v) in vars.iter_mut().enumerate() {
            let d = m.get(r, c) - means[c];
            *v += d * d;
        }
    }
    for v in &mut vars {
        *v /= (rows - 1) as f32;
    }
    vars
}

/// Average-linkage agglomeration over euclidean row distances. Merging is
/// deterministic: ties resolve to the lexicographically smallest cluster
/// pair. The returned order is the concatenation at the final merge.
fn leaf_order(m: &Matrix, members: &[usize]) -> Vec<usize> {
    if members.len() <= 1 {
        return members.to_vec();
    }

    let dist = |x: usize, y: usize| -> f32 {
        m.row(x)
            .iter()
            .zip(m.row(y).iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    };

    let mut clusters: Vec<Vec<usize>> = members.iter().map(|&i| vec![i]).collect();
    while clusters.len() > 1 {
        let mut best = (0usize, 1usize);
        let mut best_d = f32::INFINITY;
        for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                let mut acc = 0.0f32;
                for &x in &clusters[i] {
                    for &y in &clusters[j] {
                        acc += dist(x, y);
                    }
                }
                let d = acc / (clusters[i].len() * clusters[j].len()) as f32;
                if d < best_d {
                    best_d = d;
                    best = (i, j);
                }
            }
        }
        let (i, j) = best;
        let merged = clusters.remove(j);
        clusters[i].extend(merged);
    }
    clusters.pop().unwrap_or_default()
}
