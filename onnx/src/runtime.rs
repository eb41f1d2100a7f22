use std::{
    collections::{HashMap, hash_map::Entry},
    fmt, fs,
    path::Path,
};

use log::{debug, info};
use ndarray::{Array2, Array4};
use prost::Message;
use tract_onnx::prelude::*;

use crate::{
    ModelInfo, RuntimeErr,
    inspect::Dim,
    proto::ModelProto,
};

type Plan = TypedRunnableModel<TypedModel>;

fn tract_err(context: &'static str) -> impl Fn(TractError) -> RuntimeErr {
    move |e| RuntimeErr::Tract(format!("{context} failed: {e}"))
}

/// A loaded ONNX model ready to run batches of images.
///
/// Tract optimizes a graph for concrete shapes, so one plan is built and cached per batch size
/// the session sees.
pub struct Session {
    info: ModelInfo,
    model: InferenceModel,
    plans: HashMap<usize, Plan>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.info)
            .field("plans", &self.plans.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Session {
    /// Loads the model at `path`.
    ///
    /// # Errors
    /// Fails if the file cannot be read, is not an ONNX model, does not declare exactly one input
    /// and one output, or cannot be loaded by the runtime.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RuntimeErr> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let info = ModelInfo::from_proto(&ModelProto::decode(bytes.as_slice())?)?;

        let model = tract_onnx::onnx()
            .model_for_read(&mut bytes.as_slice())
            .map_err(tract_err("onnx load"))?;

        info!(
            "loaded {} (opset {}, {} -> {})",
            path.display(),
            info.opset,
            info.input,
            info.output
        );

        Ok(Self {
            info,
            model,
            plans: HashMap::new(),
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Runs a batch of images through the model.
    ///
    /// # Arguments
    /// * `x` - A batch whose shape matches the declared input, with any batch size `n >= 1`.
    ///
    /// # Returns
    /// The `(n, 1)` confidences.
    pub fn run(&mut self, x: &Array4<f32>) -> Result<Array2<f32>, RuntimeErr> {
        self.check_input(x.shape())?;
        let n = x.shape()[0];

        let plan = match self.plans.entry(n) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!("building plan for batch size {n}");
                entry.insert(build_plan(&self.model, x.shape())?)
            }
        };

        let input = tract_ndarray::ArrayD::<f32>::from_shape_vec(
            tract_ndarray::IxDyn(x.shape()),
            x.iter().copied().collect(),
        )
        .map_err(|e| RuntimeErr::Tract(format!("input reshape failed: {e}")))?
        .into_tvalue();

        let outputs = plan.run(tvec!(input)).map_err(tract_err("onnx run"))?;
        let Some(output) = outputs.first() else {
            return Err(RuntimeErr::Contract("model produced no outputs".to_string()));
        };

        let y = output
            .to_array_view::<f32>()
            .map_err(tract_err("output decode"))?;
        if y.shape() != [n, 1] {
            return Err(RuntimeErr::Shape {
                what: "confidence",
                got: y.shape().to_vec(),
                expected: vec![n, 1],
            });
        }

        Array2::from_shape_vec((n, 1), y.iter().copied().collect()).map_err(|_| RuntimeErr::Shape {
            what: "confidence",
            got: y.shape().to_vec(),
            expected: vec![n, 1],
        })
    }

    /// Checks `shape` against every fixed dimension the model declares for its input.
    fn check_input(&self, shape: &[usize]) -> Result<(), RuntimeErr> {
        let declared = &self.info.input.dims;
        let matches = shape.len() == declared.len()
            && shape[0] > 0
            && shape.iter().zip(declared).all(|(&got, dim)| match dim {
                Dim::Fixed(d) => got == *d,
                _ => true,
            });

        if !matches {
            let expected = declared
                .iter()
                .zip(shape.iter().chain(std::iter::repeat(&1)))
                .map(|(dim, &got)| match dim {
                    Dim::Fixed(d) => *d,
                    _ => got.max(1),
                })
                .collect();

            return Err(RuntimeErr::Shape {
                what: "image",
                got: shape.to_vec(),
                expected,
            });
        }

        Ok(())
    }
}

/// Specializes the model to a concrete input shape and optimizes it.
fn build_plan(model: &InferenceModel, shape: &[usize]) -> Result<Plan, RuntimeErr> {
    let shape: TVec<usize> = shape.iter().copied().collect();

    model
        .clone()
        .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), shape))
        .map_err(tract_err("onnx input fact"))?
        // The declared output carries the symbolic batch axis, let tract infer it instead.
        .with_output_fact(0, InferenceFact::default())
        .map_err(tract_err("onnx output fact"))?
        .into_optimized()
        .map_err(tract_err("onnx optimize"))?
        .into_runnable()
        .map_err(tract_err("onnx runnable"))
}
