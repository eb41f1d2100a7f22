use std::{fmt, io};

use machine_learning::MlErr;

/// All errors that can occur while exporting a model.
#[derive(Debug)]
pub enum ExportErr {
    /// An operator needed by the graph is newer than the pinned operator set.
    UnsupportedOperator {
        op: &'static str,
        since: i64,
        opset: i64,
    },
    /// The model rejected the tracing input or its own parameters.
    Model(MlErr),
    /// Writing the artifact failed.
    Io(io::Error),
}

impl fmt::Display for ExportErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedOperator { op, since, opset } => write!(
                f,
                "unsupported operator: {op} requires opset {since}, but opset {opset} is pinned"
            ),
            Self::Model(e) => write!(f, "model error: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ExportErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Model(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for ExportErr {
    fn from(e: MlErr) -> Self {
        Self::Model(e)
    }
}

impl From<io::Error> for ExportErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// All errors that can occur while loading or running an exported model.
#[derive(Debug)]
pub enum RuntimeErr {
    /// The artifact could not be read.
    Io(io::Error),
    /// The artifact is not a valid ONNX model.
    Decode(prost::DecodeError),
    /// The artifact does not declare the single input and output this runtime expects.
    Contract(String),
    /// The inference runtime failed to load, optimize or run the graph.
    Tract(String),
    /// The input or output tensor does not have the declared shape.
    Shape {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
}

impl fmt::Display for RuntimeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Decode(e) => write!(f, "invalid onnx model: {e}"),
            Self::Contract(msg) => write!(f, "unexpected model interface: {msg}"),
            Self::Tract(msg) => write!(f, "inference runtime error: {msg}"),
            Self::Shape {
                what,
                got,
                expected,
            } => write!(f, "shape mismatch for {what}: got {got:?}, expected {expected:?}"),
        }
    }
}

impl std::error::Error for RuntimeErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RuntimeErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<prost::DecodeError> for RuntimeErr {
    fn from(e: prost::DecodeError) -> Self {
        Self::Decode(e)
    }
}
