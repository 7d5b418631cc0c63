//! Store for trained-run artifacts.
//!
//! Artifacts are write-once: re-running training publishes under a new tag
//! and never overwrites what an earlier run produced. Every artifact carries
//! cell identities in the canonical combined ordering, so external tools can
//! re-merge outputs with their own metadata.

use std::collections::BTreeMap;

use crate::dataset::Matrix;
use crate::error::{AlignError, Result};

/// Shared latent embedding over the full combined cell population.
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// Canonical `(condition, cell_id)` ordering, row-aligned with `latent`.
    pub order: Vec<(String, String)>,
    /// cells x latent-dims.
    pub latent: Matrix,
}

/// One directed cross-condition projection: `source` cells expressed in
/// `target`'s native feature space. The reverse direction is an independent
/// artifact produced by a different decoder.
#[derive(Debug, Clone)]
pub struct ProjectionResult {
    pub source: String,
    pub target: String,
    /// Source-condition cell ids, row-aligned with `values`.
    pub cell_ids: Vec<String>,
    /// cells x native-feature-dims.
    pub values: Matrix,
    /// Representation the decoder reconstructs; pairs projections with
    /// native-space values during differential analysis.
    pub native_repr: String,
}

#[derive(Debug, Clone)]
pub enum Artifact {
    Embedding(EmbeddingResult),
    Projection(ProjectionResult),
}

/// Canonical tag for a directed projection under a run.
pub fn projection_tag(run: &str, source: &str, target: &str) -> String {
    format!("{run}/{source}->{target}")
}

/// Immutable tag -> artifact map.
#[derive(Debug, Default)]
pub struct EmbeddingStore {
    artifacts: BTreeMap<String, Artifact>,
}

impl EmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an artifact. Tags are write-once.
    pub fn insert(&mut self, tag: &str, artifact: Artifact) -> Result<()> {
        if self.artifacts.contains_key(tag) {
            return Err(AlignError::TagExists(tag.to_string()));
        }
        self.artifacts.insert(tag.to_string(), artifact);
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<&Artifact> {
        self.artifacts.get(tag)
    }

    /// The embedding published under `run`.
    pub fn embedding(&self, run: &str) -> Result<&EmbeddingResult> {
        match self.artifacts.get(run) {
            Some(Artifact::Embedding(e)) => Ok(e),
            _ => Err(AlignError::MissingArtifact(run.to_string())),
        }
    }

    /// The directed projection `source -> target` published under `run`.
    pub fn projection(&self, run: &str, source: &str, target: &str) -> Result<&ProjectionResult> {
        match self.artifacts.get(&projection_tag(run, source, target)) {
            Some(Artifact::Projection(p)) => Ok(p),
            _ => Err(AlignError::MissingProjection {
                run: run.to_string(),
                source: source.to_string(),
                target: target.to_string(),
            }),
        }
    }

    /// Every tag written so far, in stable sorted order.
    pub fn list_tags(&self) -> Vec<&str> {
        self.artifacts.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn embedding() -> Artifact {
        Artifact::Embedding(EmbeddingResult {
            order: vec![("young".into(), "y.0".into())],
            latent: Matrix::zeros(1, 2),
        })
    }

    fn projection(source: &str, target: &str) -> Artifact {
        Artifact::Projection(ProjectionResult {
            source: source.into(),
            target: target.into(),
            cell_ids: vec!["c".into()],
            values: Matrix::zeros(1, 3),
            native_repr: "raw".into(),
        })
    }

    #[rstest]
    fn tags_are_write_once() {
        let mut store = EmbeddingStore::new();
        store.insert("run", embedding()).unwrap();
        let err = store.insert("run", embedding()).unwrap_err();
        assert!(matches!(err, AlignError::TagExists(_)));
        // the original artifact is untouched
        assert!(store.embedding("run").is_ok());
    }

    #[rstest]
    fn reverse_directions_are_independent_artifacts() {
        let mut store = EmbeddingStore::new();
        store
            .insert(&projection_tag("r", "young", "old"), projection("young", "old"))
            .unwrap();

        assert!(store.projection("r", "young", "old").is_ok());
        let err = store.projection("r", "old", "young").unwrap_err();
        assert!(matches!(err, AlignError::MissingProjection { .. }));
    }

    #[rstest]
    fn list_tags_is_sorted_and_complete() {
        let mut store = EmbeddingStore::new();
        store.insert("b", embedding()).unwrap();
        store.insert("a", embedding()).unwrap();
        store
            .insert(&projection_tag("a", "x", "y"), projection("x", "y"))
            .unwrap();
        assert_eq!(store.list_tags(), vec!["a", "a/x->y", "b"]);
    }

    #[rstest]
    fn wrong_kind_under_tag_is_missing() {
        let mut store = EmbeddingStore::new();
        store
            .insert(&projection_tag("r", "a", "b"), projection("a", "b"))
            .unwrap();
        assert!(store.embedding(&projection_tag("r", "a", "b")).is_err());
    }
}
