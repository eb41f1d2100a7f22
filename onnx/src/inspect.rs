use std::{collections::HashSet, fmt, fs, path::Path};

use prost::Message;

use crate::{
    RuntimeErr,
    proto::{ModelProto, ValueInfoProto, dimension, type_proto},
};

/// A single dimension of a declared tensor shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(usize),
    Symbolic(String),
    Unknown,
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(d) => write!(f, "{d}"),
            Self::Symbolic(name) => write!(f, "{name}"),
            Self::Unknown => write!(f, "?"),
        }
    }
}

/// The declared name, element type and shape of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub elem_type: i32,
    pub dims: Vec<Dim>,
}

impl TensorInfo {
    fn from_value_info(info: &ValueInfoProto) -> Self {
        let tensor = info.r#type.as_ref().and_then(|t| match &t.value {
            Some(type_proto::Value::TensorType(tensor)) => Some(tensor),
            None => None,
        });

        let dims = tensor
            .and_then(|t| t.shape.as_ref())
            .map(|shape| {
                shape
                    .dim
                    .iter()
                    .map(|d| match &d.value {
                        Some(dimension::Value::DimValue(v)) if *v >= 0 => Dim::Fixed(*v as usize),
                        Some(dimension::Value::DimParam(p)) => Dim::Symbolic(p.clone()),
                        _ => Dim::Unknown,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: info.name.clone(),
            elem_type: tensor.map(|t| t.elem_type).unwrap_or_default(),
            dims,
        }
    }

    /// The fixed dimensions, with `None` for symbolic or unknown ones.
    pub fn fixed_dims(&self) -> Vec<Option<usize>> {
        self.dims
            .iter()
            .map(|d| match d {
                Dim::Fixed(d) => Some(*d),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<_> = self.dims.iter().map(Dim::to_string).collect();
        write!(f, "{} [{}]", self.name, dims.join(", "))
    }
}

/// What an exported model declares about itself: metadata plus its single input and output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub ir_version: i64,
    pub opset: i64,
    pub producer: String,
    pub input: TensorInfo,
    pub output: TensorInfo,
}

impl ModelInfo {
    /// Reads and decodes the model at `path`.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, RuntimeErr> {
        let bytes = fs::read(path)?;
        Self::from_proto(&ModelProto::decode(bytes.as_slice())?)
    }

    /// Extracts the interface of `model`.
    ///
    /// Initializers listed among the graph inputs are not part of the interface.
    ///
    /// # Errors
    /// `RuntimeErr::Contract` if the model has no graph, or not exactly one input and one output.
    pub fn from_proto(model: &ModelProto) -> Result<Self, RuntimeErr> {
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| RuntimeErr::Contract("model has no graph".to_string()))?;

        let initializers: HashSet<_> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
        let inputs: Vec<_> = graph
            .input
            .iter()
            .filter(|i| !initializers.contains(i.name.as_str()))
            .collect();

        let [input] = inputs.as_slice() else {
            return Err(RuntimeErr::Contract(format!(
                "expected exactly 1 input, found {}",
                inputs.len()
            )));
        };
        let [output] = graph.output.as_slice() else {
            return Err(RuntimeErr::Contract(format!(
                "expected exactly 1 output, found {}",
                graph.output.len()
            )));
        };

        let opset = model
            .opset_import
            .iter()
            .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
            .map(|o| o.version)
            .unwrap_or_default();

        Ok(Self {
            ir_version: model.ir_version,
            opset,
            producer: model.producer_name.clone(),
            input: TensorInfo::from_value_info(input),
            output: TensorInfo::from_value_info(output),
        })
    }
}
