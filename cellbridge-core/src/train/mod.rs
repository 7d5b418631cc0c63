pub mod loss;
pub mod trainer;

pub use loss::{AlignmentLoss, LossComponents};
pub use trainer::{
    AlignConfig, AlignmentModel, AlignmentTrainer, Convergence, TrainingHistory,
};
