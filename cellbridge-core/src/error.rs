//! Error taxonomy for the alignment pipeline.
//!
//! Validation errors fail fast before any optimization work begins.
//! Convergence trouble is deliberately *not* here: a loss plateau is reported
//! through [`crate::train::TrainingHistory`] alongside a usable model.

use std::fmt;

/// Errors raised by registration, reduction, training and differential calls.
///
/// `Display`/`Error`/`From` are written by hand rather than derived with
/// `thiserror` because the `MissingProjection.source` field name would be
/// hijacked by the derive as the error-source field.
#[derive(Debug)]
pub enum AlignError {
    /// Feature schema disagrees across conditions, or input shapes are
    /// inconsistent with the declared cells/features.
    Schema(String),

    /// Invalid dimensionality request (reduction target beyond the input
    /// rank, ranking more features than exist).
    Dimension(String),

    /// Inconsistent training configuration, caught before training starts.
    Config(String),

    /// Condition name not present in the registry.
    UnknownCondition(String),

    /// Representation name not present for a condition.
    UnknownRepresentation { condition: String, name: String },

    /// A differential was requested without the required directed projection.
    MissingProjection {
        run: String,
        source: String,
        target: String,
    },

    /// Store tags are write-once; re-training must use a new tag.
    TagExists(String),

    /// Artifact lookup by tag found nothing.
    MissingArtifact(String),

    /// Tensor backend failure.
    Tensor(candle_core::Error),
}

impl fmt::Display for AlignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema(msg) => write!(f, "schema mismatch: {msg}"),
            Self::Dimension(msg) => write!(f, "invalid dimension: {msg}"),
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Self::UnknownCondition(name) => write!(f, "unknown condition: {name}"),
            Self::UnknownRepresentation { condition, name } => {
                write!(f, "unknown representation {name:?} for condition {condition:?}")
            }
            Self::MissingProjection { run, source, target } => {
                write!(f, "missing projection {source}->{target} for run {run:?}")
            }
            Self::TagExists(tag) => write!(f, "artifact tag already written: {tag:?}"),
            Self::MissingArtifact(tag) => write!(f, "no artifact under tag {tag:?}"),
            Self::Tensor(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl std::error::Error for AlignError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tensor(err) => err.source(),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for AlignError {
    fn from(err: candle_core::Error) -> Self {
        Self::Tensor(err)
    }
}

pub type Result<T> = std::result::Result<T, AlignError>;
