pub mod error;
pub mod export;
pub mod inspect;
pub mod proto;
pub mod runtime;

pub use error::{ExportErr, RuntimeErr};
pub use export::{ExportOptions, dummy_input, export, to_model_proto};
pub use inspect::{Dim, ModelInfo, TensorInfo};
pub use runtime::Session;

/// Where the exported model is written and read from when no path is given.
pub const DEFAULT_MODEL_PATH: &str = "GeoCodeModel.onnx";

/// The name of the graph's only input, a `(batch_size, 3, 224, 224)` float tensor.
pub const INPUT_NAME: &str = "image";

/// The name of the graph's only output, a `(batch_size, 1)` float tensor.
pub const OUTPUT_NAME: &str = "confidence";

/// The symbolic name of the leading, dynamic, axis of the input and the output.
pub const BATCH_AXIS: &str = "batch_size";

/// The operator set the exported graph is pinned to.
pub const OPSET_VERSION: i64 = 11;

/// The IR version matching [`OPSET_VERSION`].
pub const IR_VERSION: i64 = 6;
