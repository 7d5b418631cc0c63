//! Dataset registry: named conditions over a shared feature schema.
//!
//! The registry is the single source of truth for the canonical combined cell
//! ordering. Conditions are append-only; every downstream artifact (embedding,
//! projection, differential signal) is laid out in the order conditions were
//! registered, then cells within each condition. The order is materialized
//! once at registration time rather than recovered from container iteration.

use std::collections::{BTreeMap, HashMap};

use candle_core::{Device, Tensor};

use crate::error::{AlignError, Result};

/// Name under which every condition's native feature matrix is exposed.
pub const RAW_REPR: &str = "raw";

/// Dense row-major f32 matrix (cells × features).
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(AlignError::Dimension(format!(
                "matrix data length {} does not match {}x{}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Stack matrices vertically. Columns must agree.
    pub fn vstack(parts: &[&Matrix]) -> Result<Self> {
        let cols = parts.first().map(|m| m.cols).unwrap_or(0);
        let mut data = Vec::new();
        let mut rows = 0;
        for part in parts {
            if part.cols != cols {
                return Err(AlignError::Dimension(format!(
                    "cannot stack {} columns onto {}",
                    part.cols, cols
                )));
            }
            data.extend_from_slice(&part.data);
            rows += part.rows;
        }
        Ok(Self { rows, cols, data })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.data,
            (self.rows, self.cols),
            device,
        )?)
    }

    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        let (rows, cols) = t.dims2()?;
        let data = t.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self { rows, cols, data })
    }

    /// Per-column mean.
    pub fn column_means(&self) -> Vec<f32> {
        let mut means = vec![0.0f32; self.cols];
        for r in 0..self.rows {
            for (c, m) in means.iter_mut().enumerate() {
                *m += self.get(r, c);
            }
        }
        let n = self.rows.max(1) as f32;
        for m in &mut means {
            *m /= n;
        }
        means
    }

    /// Per-column population standard deviation.
    pub fn column_stds(&self, means: &[f32]) -> Vec<f32> {
        let mut vars = vec![0.0f32; self.cols];
        for r in 0..self.rows {
            for (c, v) in vars.iter_mut().enumerate() {
                let d = self.get(r, c) - means[c];
                *v += d * d;
            }
        }
        let n = self.rows.max(1) as f32;
        vars.iter().map(|v| (v / n).sqrt()).collect()
    }
}

/// Opaque handle returned by [`DatasetRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionHandle(pub(crate) usize);

/// One experimental batch: cells, native features, optional labels and any
/// number of named alternate representations.
#[derive(Debug)]
pub struct Condition {
    name: String,
    cell_ids: Vec<String>,
    labels: Option<Vec<String>>,
    representations: BTreeMap<String, Matrix>,
}

impl Condition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }

    /// Per-cell labels, a read-only channel for evaluation code. The training
    /// objective never reads this field.
    pub fn labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }

    pub fn representation(&self, name: &str) -> Option<&Matrix> {
        self.representations.get(name)
    }

    pub fn representation_names(&self) -> impl Iterator<Item = &str> {
        self.representations.keys().map(String::as_str)
    }
}

/// Registry of conditions sharing one feature schema.
#[derive(Debug, Default)]
pub struct DatasetRegistry {
    feature_names: Vec<String>,
    conditions: Vec<Condition>,
    by_name: HashMap<String, usize>,
    combined: Vec<(String, String)>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a condition. The first registration fixes the feature schema;
    /// later conditions must present the same feature names in the same order.
    pub fn register(
        &mut self,
        name: &str,
        cell_ids: Vec<String>,
        feature_names: &[String],
        matrix: Matrix,
        labels: Option<Vec<String>>,
    ) -> Result<ConditionHandle> {
        if self.by_name.contains_key(name) {
            return Err(AlignError::Schema(format!(
                "condition {name:?} already registered"
            )));
        }
        if matrix.rows() != cell_ids.len() {
            return Err(AlignError::Schema(format!(
                "condition {name:?}: {} matrix rows for {} cell ids",
                matrix.rows(),
                cell_ids.len()
            )));
        }
        if matrix.cols() != feature_names.len() {
            return Err(AlignError::Schema(format!(
                "condition {name:?}: {} matrix columns for {} feature names",
                matrix.cols(),
                feature_names.len()
            )));
        }
        if let Some(labels) = &labels {
            if labels.len() != cell_ids.len() {
                return Err(AlignError::Schema(format!(
                    "condition {name:?}: {} labels for {} cells",
                    labels.len(),
                    cell_ids.len()
                )));
            }
        }
        if self.conditions.is_empty() {
            self.feature_names = feature_names.to_vec();
        } else if self.feature_names != feature_names {
            return Err(AlignError::Schema(format!(
                "condition {name:?}: feature names disagree with the registered schema"
            )));
        }

        let idx = self.conditions.len();
        self.combined
            .extend(cell_ids.iter().map(|c| (name.to_string(), c.clone())));

        let mut representations = BTreeMap::new();
        representations.insert(RAW_REPR.to_string(), matrix);
        self.conditions.push(Condition {
            name: name.to_string(),
            cell_ids,
            labels,
            representations,
        });
        self.by_name.insert(name.to_string(), idx);
        Ok(ConditionHandle(idx))
    }

    /// Attach a precomputed representation to a condition. Row count must
    /// match the condition's cell count; `"raw"` is reserved.
    pub fn add_representation(
        &mut self,
        condition: &str,
        repr_name: &str,
        matrix: Matrix,
    ) -> Result<()> {
        if repr_name == RAW_REPR {
            return Err(AlignError::Schema(format!(
                "representation name {RAW_REPR:?} is reserved"
            )));
        }
        let idx = self.index_of(condition)?;
        let cond = &mut self.conditions[idx];
        if matrix.rows() != cond.cell_ids.len() {
            return Err(AlignError::Schema(format!(
                "representation {repr_name:?} for {condition:?}: {} rows for {} cells",
                matrix.rows(),
                cond.cell_ids.len()
            )));
        }
        cond.representations.insert(repr_name.to_string(), matrix);
        Ok(())
    }

    /// The canonical `(condition, cell_id)` ordering shared by every combined
    /// output. Append-only and stable for the registry's lifetime.
    pub fn combined_order(&self) -> &[(String, String)] {
        &self.combined
    }

    pub fn n_conditions(&self) -> usize {
        self.conditions.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn condition(&self, name: &str) -> Result<&Condition> {
        Ok(&self.conditions[self.index_of(name)?])
    }

    /// Fetch a named representation for one condition.
    pub fn representation(&self, condition: &str, repr_name: &str) -> Result<&Matrix> {
        let cond = self.condition(condition)?;
        cond.representation(repr_name)
            .ok_or_else(|| AlignError::UnknownRepresentation {
                condition: condition.to_string(),
                name: repr_name.to_string(),
            })
    }

    /// True when every registered condition carries `repr_name`.
    pub fn has_representation(&self, repr_name: &str) -> bool {
        !self.conditions.is_empty()
            && self
                .conditions
                .iter()
                .all(|c| c.representations.contains_key(repr_name))
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| AlignError::UnknownCondition(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    use crate::testutil::{cell_ids, feature_names};

    fn toy_registry() -> DatasetRegistry {
        let mut reg = DatasetRegistry::new();
        let features = feature_names(3);
        reg.register(
            "young",
            cell_ids("y", 4),
            &features,
            Matrix::new(4, 3, (0..12).map(|v| v as f32).collect()).unwrap(),
            None,
        )
        .unwrap();
        reg.register(
            "old",
            cell_ids("o", 2),
            &features,
            Matrix::new(2, 3, vec![1.0; 6]).unwrap(),
            Some(vec!["LT".into(), "ST".into()]),
        )
        .unwrap();
        reg
    }

    #[rstest]
    fn combined_order_is_stable_and_complete() {
        let reg = toy_registry();
        let order = reg.combined_order();
        assert_eq!(order.len(), 6);
        assert_eq!(order[0], ("young".to_string(), "y.0".to_string()));
        assert_eq!(order[4], ("old".to_string(), "o.0".to_string()));
        // repeated calls observe the identical ordering
        assert_eq!(reg.combined_order(), order.to_vec().as_slice());
    }

    #[rstest]
    fn mismatched_feature_schema_is_rejected() {
        let mut reg = toy_registry();
        let disjoint: Vec<String> = (0..3).map(|i| format!("peak{i}")).collect();
        let err = reg
            .register(
                "other",
                cell_ids("x", 1),
                &disjoint,
                Matrix::new(1, 3, vec![0.0; 3]).unwrap(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, AlignError::Schema(_)));
    }

    #[rstest]
    fn duplicate_condition_is_rejected() {
        let mut reg = toy_registry();
        let err = reg
            .register(
                "young",
                cell_ids("y", 1),
                &feature_names(3),
                Matrix::new(1, 3, vec![0.0; 3]).unwrap(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, AlignError::Schema(_)));
    }

    #[rstest]
    fn raw_representation_is_always_present() {
        let reg = toy_registry();
        assert!(reg.has_representation(RAW_REPR));
        assert_eq!(reg.representation("old", RAW_REPR).unwrap().rows(), 2);
    }

    #[rstest]
    fn representation_rows_must_match_cells() {
        let mut reg = toy_registry();
        let err = reg
            .add_representation("young", "pca", Matrix::zeros(3, 2))
            .unwrap_err();
        assert!(matches!(err, AlignError::Schema(_)));

        reg.add_representation("young", "pca", Matrix::zeros(4, 2))
            .unwrap();
        assert!(!reg.has_representation("pca")); // "old" lacks it
        reg.add_representation("old", "pca", Matrix::zeros(2, 2))
            .unwrap();
        assert!(reg.has_representation("pca"));
    }

    #[rstest]
    fn raw_name_is_reserved() {
        let mut reg = toy_registry();
        let err = reg
            .add_representation("young", RAW_REPR, Matrix::zeros(4, 3))
            .unwrap_err();
        assert!(matches!(err, AlignError::Schema(_)));
    }

    #[rstest]
    fn labels_are_optional_and_length_checked() {
        let reg = toy_registry();
        assert!(reg.condition("young").unwrap().labels().is_none());
        assert_eq!(reg.condition("old").unwrap().labels().unwrap().len(), 2);

        let mut reg = DatasetRegistry::new();
        let err = reg
            .register(
                "c",
                cell_ids("c", 2),
                &feature_names(1),
                Matrix::zeros(2, 1),
                Some(vec!["only-one".into()]),
            )
            .unwrap_err();
        assert!(matches!(err, AlignError::Schema(_)));
    }

    #[rstest]
    fn matrix_tensor_round_trip() {
        let m = Matrix::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let t = m.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[2, 3]);
        let back = Matrix::from_tensor(&t).unwrap();
        assert_eq!(back, m);
    }
}
