use super::{Relu, Sigmoid};

/// An element-wise activation function.
#[derive(Clone, Copy, Debug)]
pub enum ActFn {
    Relu(Relu),
    Sigmoid(Sigmoid),
}

impl ActFn {
    pub fn relu() -> Self {
        Self::Relu(Relu)
    }

    pub fn sigmoid() -> Self {
        Self::Sigmoid(Sigmoid)
    }

    pub fn f(&self, x: f32) -> f32 {
        match self {
            Self::Relu(a) => a.f(x),
            Self::Sigmoid(a) => a.f(x),
        }
    }

    /// The name of the operator that computes this activation in an exported graph.
    pub fn op_type(&self) -> &'static str {
        match self {
            Self::Relu(_) => "Relu",
            Self::Sigmoid(_) => "Sigmoid",
        }
    }
}
