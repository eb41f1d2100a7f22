use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    /// A count did not match, e.g. the length of a parameter slice or the rank of a tensor.
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// A tensor reached a layer with a shape the layer cannot accept.
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    /// A parameter distribution was configured with invalid arguments.
    InvalidInit(String),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch for {what}, got {got} and expected {expected}"
            ),
            MlErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a shape mismatch for {what}, got {got:?} and expected {expected:?}"
            ),
            MlErr::InvalidInit(msg) => write!(f, "Invalid parameter initialization: {msg}"),
        }
    }
}

impl Error for MlErr {}
