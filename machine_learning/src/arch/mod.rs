pub mod activations;
pub mod init;
pub mod layers;
pub mod models;
mod sequential;

pub use sequential::Sequential;

/// Whether the layers behave as during training or as during inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Dropout is active and batch normalization uses, and updates, batch statistics.
    #[default]
    Train,
    /// Every layer is a pure function of its input and parameters.
    Eval,
}
