pub mod decoder;
pub mod encoder;

// re-export models
pub use decoder::DecoderNet;
pub use encoder::{EncoderNet, NetworkDepth};
