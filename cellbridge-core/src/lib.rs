//! # cellbridge: cross-condition single-cell alignment
//!
//! Aligns batches of single-cell measurements collected under different
//! conditions into one shared latent space, and optionally learns directed
//! decoders that project a cell measured under one condition into the
//! expression space of another, enabling per-cell paired differential
//! analysis.
//!
//! ## Pipeline
//!
//! 1. [`dataset::DatasetRegistry`] — register one matrix per condition over a
//!    shared feature schema; the registration order fixes the canonical
//!    combined cell ordering every artifact uses.
//! 2. [`reduce`] — optionally precompute a joint reduced representation
//!    selectable as encoder input.
//! 3. [`train::AlignmentTrainer`] — fit the shared encoder (and, when
//!    decoding is enabled, per-condition decoders) with an unsupervised
//!    objective; labels are never read by training.
//! 4. [`store::EmbeddingStore`] — write-once, tag-addressed artifacts:
//!    embeddings and directed cross-condition projections.
//! 5. [`differential`] — derive the paired per-cell differential signal from
//!    opposite-direction projections, rank features by variance, and order
//!    cells for presentation.
//!
//! The registry is read-only after population; independent training runs can
//! share it across threads as long as each publishes under its own tag.

pub mod dataset;
pub mod differential;
pub mod error;
pub mod models;
pub mod reduce;
pub mod store;
pub mod train;

#[cfg(test)]
pub(crate) mod testutil;

pub use candle_core::Device;

pub use dataset::{Condition, ConditionHandle, DatasetRegistry, Matrix, RAW_REPR};
pub use differential::{
    cluster_within_group, differential, rank_by_variance, DifferentialSignal, GroupOrdering,
};
pub use error::{AlignError, Result};
pub use models::NetworkDepth;
pub use reduce::{compute_joint_representation, ReduceMethod};
pub use store::{projection_tag, Artifact, EmbeddingResult, EmbeddingStore, ProjectionResult};
pub use train::{AlignConfig, AlignmentModel, AlignmentTrainer, Convergence, TrainingHistory};
