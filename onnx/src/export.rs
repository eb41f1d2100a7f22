use std::{fs, path::Path};

use log::{debug, info};
use machine_learning::arch::{
    activations::ActFn,
    layers::{BatchNorm2d, Conv2d, Dense, Layer, MaxPool2d},
    models::{Detector, INPUT_CHANNELS, INPUT_SIZE, NamedLayer},
};
use ndarray::{Array4, Axis};
use prost::Message;
use rand::{SeedableRng, distr::Distribution, rngs::StdRng};
use rand_distr::StandardNormal;

use crate::{
    BATCH_AXIS, ExportErr, INPUT_NAME, IR_VERSION, OPSET_VERSION, OUTPUT_NAME,
    proto::{
        AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
        ValueInfoProto,
    },
};

const PRODUCER_NAME: &str = "geocode";
const GRAPH_NAME: &str = "geocode_detector";

/// How a detector is lowered to an ONNX graph.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// The operator set the graph is pinned to. Exporting fails if a layer needs a newer one.
    pub opset: i64,
    /// Folds every batch norm that directly follows a convolution into that convolution.
    pub fold_batch_norm: bool,
    /// Seeds the dummy input used for tracing, drawn from the OS when `None`.
    pub dummy_seed: Option<u64>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            opset: OPSET_VERSION,
            fold_batch_norm: true,
            dummy_seed: None,
        }
    }
}

/// Exports `detector` to an ONNX file at `path`, overwriting it if it exists.
///
/// The detector is switched to evaluation mode first and stays in it.
///
/// # Errors
/// Returns an `ExportErr` if tracing fails, if an operator is not available in the pinned opset or
/// if the file cannot be written.
pub fn export<P: AsRef<Path>>(
    detector: &mut Detector,
    path: P,
    options: &ExportOptions,
) -> Result<(), ExportErr> {
    let path = path.as_ref();
    let bytes = to_model_proto(detector, options)?.encode_to_vec();
    fs::write(path, &bytes)?;

    info!("wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Traces `detector` with a dummy input and lowers it to an in-memory ONNX model.
pub fn to_model_proto(
    detector: &mut Detector,
    options: &ExportOptions,
) -> Result<ModelProto, ExportErr> {
    detector.eval();

    let dummy = dummy_input(options.dummy_seed);
    let traced = detector.forward(dummy.view())?;
    debug!("traced dummy input, confidence {}", traced[[0, 0]]);

    let mut graph = GraphBuilder::new(options.opset);
    let named = detector.named_layers()?;
    let mut layers = named.iter().peekable();
    let mut shape = dummy.shape().to_vec();
    let mut x = INPUT_NAME.to_string();

    while let Some(layer) = layers.next() {
        shape = layer.layer.output_shape(&shape)?;
        debug!("{} ({}) -> {:?}", layer.name, layer.layer.kind(), shape);

        x = match layer.layer {
            Layer::Conv(conv) => {
                let norm = layers
                    .peek()
                    .copied()
                    .filter(|_| options.fold_batch_norm)
                    .and_then(|next| match next.layer {
                        Layer::BatchNorm(bn) => Some((next, bn)),
                        _ => None,
                    });

                match norm {
                    Some((next, bn)) => {
                        layers.next();
                        shape = next.layer.output_shape(&shape)?;
                        debug!("folded {} into {}", next.name, layer.name);
                        graph.folded_conv(layer, conv, next, bn, &x)?
                    }
                    _ => graph.conv(layer, conv, &x)?,
                }
            }
            Layer::BatchNorm(bn) => graph.batch_norm(layer, bn, &x)?,
            Layer::Act(act_fn) => graph.activation(&layer.name, *act_fn, &x)?,
            Layer::MaxPool(pool) => graph.max_pool(layer, pool, &x)?,
            Layer::GlobalAvgPool(_) => graph.node("GlobalAveragePool", &layer.name, vec![x], vec![])?,
            Layer::Flatten(_) => graph.node(
                "Flatten",
                &layer.name,
                vec![x],
                vec![AttributeProto::int("axis", 1)],
            )?,
            // Identity in evaluation mode.
            Layer::Dropout(_) => x,
            Layer::Dense(dense) => graph.dense(layer, dense, &x)?,
        };
    }

    graph.rename_output(&x, OUTPUT_NAME);
    info!(
        "lowered {} layers to {} nodes and {} initializers (opset {})",
        named.len(),
        graph.nodes.len(),
        graph.initializers.len(),
        options.opset
    );

    Ok(ModelProto {
        ir_version: IR_VERSION,
        producer_name: PRODUCER_NAME.to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        doc_string: "GeoCode pattern detector: (batch, 3, 224, 224) image to (batch, 1) confidence"
            .to_string(),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: options.opset,
        }],
        graph: Some(GraphProto {
            name: GRAPH_NAME.to_string(),
            node: graph.nodes,
            initializer: graph.initializers,
            input: vec![ValueInfoProto::float_batched(
                INPUT_NAME,
                BATCH_AXIS,
                &dummy.shape()[1..],
            )],
            output: vec![ValueInfoProto::float_batched(
                OUTPUT_NAME,
                BATCH_AXIS,
                &shape[1..],
            )],
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// A single `(1, 3, 224, 224)` image drawn from a standard normal, the input used for tracing.
pub fn dummy_input(seed: Option<u64>) -> Array4<f32> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    Array4::from_shape_simple_fn((1, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE), || {
        StandardNormal.sample(&mut rng)
    })
}

/// The opset in which the form of each operator emitted here was introduced.
fn since(op: &str) -> i64 {
    match op {
        "BatchNormalization" => 9,
        "Relu" | "Sigmoid" => 6,
        _ => 1,
    }
}

struct GraphBuilder {
    opset: i64,
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
}

impl GraphBuilder {
    fn new(opset: i64) -> Self {
        Self {
            opset,
            nodes: vec![],
            initializers: vec![],
        }
    }

    /// Appends a node and returns the name of its output.
    fn node(
        &mut self,
        op: &'static str,
        layer: &str,
        input: Vec<String>,
        attribute: Vec<AttributeProto>,
    ) -> Result<String, ExportErr> {
        let since = since(op);
        if since > self.opset {
            return Err(ExportErr::UnsupportedOperator {
                op,
                since,
                opset: self.opset,
            });
        }

        let name = format!("{layer}/{op}");
        let output = format!("{name}_output");
        self.nodes.push(NodeProto {
            name,
            op_type: op.to_string(),
            input,
            output: vec![output.clone()],
            attribute,
            ..Default::default()
        });

        Ok(output)
    }

    fn initializer<I>(&mut self, name: String, dims: &[usize], values: I) -> String
    where
        I: IntoIterator<Item = f32>,
    {
        self.initializers
            .push(TensorProto::float(&name, dims, values));
        name
    }

    fn conv(&mut self, layer: &NamedLayer, conv: &Conv2d, x: &str) -> Result<String, ExportErr> {
        let w = self.initializer(
            format!("{}.weight", layer.name),
            &conv.weight_shape(),
            layer.params.iter().copied(),
        );

        self.node("Conv", &layer.name, vec![x.to_string(), w], conv_attributes(conv))
    }

    /// Emits a convolution whose weights and bias absorb the inference-time affine transform of
    /// the batch norm that follows it.
    fn folded_conv(
        &mut self,
        layer: &NamedLayer,
        conv: &Conv2d,
        norm: &NamedLayer,
        bn: &BatchNorm2d,
        x: &str,
    ) -> Result<String, ExportErr> {
        let (scale, shift) = bn.scale_shift(norm.params)?;
        let weights = conv.view_params(layer.params)?;
        let folded = &weights * &scale.insert_axis(Axis(1));

        let w = self.initializer(
            format!("{}.weight", layer.name),
            &conv.weight_shape(),
            folded.iter().copied(),
        );
        let b = self.initializer(
            format!("{}.bias", layer.name),
            &[conv.out_channels()],
            shift.iter().copied(),
        );

        self.node("Conv", &layer.name, vec![x.to_string(), w, b], conv_attributes(conv))
    }

    fn batch_norm(
        &mut self,
        layer: &NamedLayer,
        bn: &BatchNorm2d,
        x: &str,
    ) -> Result<String, ExportErr> {
        let (gamma, beta) = bn.view_params(layer.params)?;
        let dims = [bn.channels()];
        let input = vec![
            x.to_string(),
            self.initializer(format!("{}.weight", layer.name), &dims, gamma.iter().copied()),
            self.initializer(format!("{}.bias", layer.name), &dims, beta.iter().copied()),
            self.initializer(
                format!("{}.running_mean", layer.name),
                &dims,
                bn.running_mean().iter().copied(),
            ),
            self.initializer(
                format!("{}.running_var", layer.name),
                &dims,
                bn.running_var().iter().copied(),
            ),
        ];

        // ONNX weighs the running statistic, not the new observation, with the momentum.
        let attribute = vec![
            AttributeProto::float("epsilon", bn.eps()),
            AttributeProto::float("momentum", 1. - bn.momentum()),
        ];

        self.node("BatchNormalization", &layer.name, input, attribute)
    }

    fn activation(&mut self, layer: &str, act_fn: ActFn, x: &str) -> Result<String, ExportErr> {
        self.node(act_fn.op_type(), layer, vec![x.to_string()], vec![])
    }

    fn max_pool(
        &mut self,
        layer: &NamedLayer,
        pool: &MaxPool2d,
        x: &str,
    ) -> Result<String, ExportErr> {
        let (k, s) = (pool.kernel() as i64, pool.stride() as i64);
        let attribute = vec![
            AttributeProto::ints("kernel_shape", [k, k]),
            AttributeProto::ints("pads", [0; 4]),
            AttributeProto::ints("strides", [s, s]),
        ];

        self.node("MaxPool", &layer.name, vec![x.to_string()], attribute)
    }

    fn dense(&mut self, layer: &NamedLayer, dense: &Dense, x: &str) -> Result<String, ExportErr> {
        let (weights, biases) = dense.view_params(layer.params)?;
        let (input, output) = dense.dim();

        let w = self.initializer(
            format!("{}.weight", layer.name),
            &[output, input],
            weights.iter().copied(),
        );
        let b = self.initializer(
            format!("{}.bias", layer.name),
            &[output],
            biases.iter().copied(),
        );
        let attribute = vec![
            AttributeProto::float("alpha", 1.),
            AttributeProto::float("beta", 1.),
            AttributeProto::int("transB", 1),
        ];
        let y = self.node("Gemm", &layer.name, vec![x.to_string(), w, b], attribute)?;

        match dense.act_fn() {
            Some(act_fn) => self.activation(&layer.name, act_fn, &y),
            None => Ok(y),
        }
    }

    /// Renames the tensor `from` to `to` wherever a node produces it.
    fn rename_output(&mut self, from: &str, to: &str) {
        self.nodes
            .iter_mut()
            .flat_map(|node| node.output.iter_mut())
            .filter(|output| output.as_str() == from)
            .for_each(|output| *output = to.to_string());
    }
}

fn conv_attributes(conv: &Conv2d) -> Vec<AttributeProto> {
    let (k, p, s) = (
        conv.kernel() as i64,
        conv.padding() as i64,
        conv.stride() as i64,
    );

    vec![
        AttributeProto::ints("dilations", [1, 1]),
        AttributeProto::int("group", conv.groups() as i64),
        AttributeProto::ints("kernel_shape", [k, k]),
        AttributeProto::ints("pads", [p; 4]),
        AttributeProto::ints("strides", [s, s]),
    ]
}

#[cfg(test)]
mod tests {
    use machine_learning::arch::{Mode, models::PARAM_COUNT};

    use super::*;
    use crate::proto::{dimension, type_proto};

    fn options(opset: i64, fold_batch_norm: bool) -> ExportOptions {
        ExportOptions {
            opset,
            fold_batch_norm,
            dummy_seed: Some(5),
        }
    }

    fn count_ops(model: &ModelProto, op: &str) -> usize {
        let graph = model.graph.as_ref().unwrap();
        graph.node.iter().filter(|n| n.op_type == op).count()
    }

    fn initializer_floats(model: &ModelProto) -> usize {
        let graph = model.graph.as_ref().unwrap();
        graph.initializer.iter().map(|t| t.floats().len()).sum()
    }

    fn dims(info: &ValueInfoProto) -> Vec<dimension::Value> {
        let Some(type_proto::Value::TensorType(tensor)) =
            info.r#type.as_ref().and_then(|t| t.value.clone())
        else {
            panic!("{} is not a tensor", info.name);
        };

        tensor
            .shape
            .unwrap()
            .dim
            .into_iter()
            .filter_map(|d| d.value)
            .collect()
    }

    #[test]
    fn dummy_input_is_standard_normal() {
        let x = dummy_input(Some(3));
        assert_eq!(x.dim(), (1, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE));

        let n = x.len() as f32;
        let mean = x.sum() / n;
        let var = x.mapv(|v| (v - mean).powi(2)).sum() / n;
        assert!(mean.abs() < 0.02, "mean {mean}");
        assert!((var - 1.).abs() < 0.02, "var {var}");
        assert!(x.iter().any(|&v| v < 0.));

        assert_eq!(dummy_input(Some(3)), x);
    }

    #[test]
    fn graph_declares_named_dynamic_io() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();
        let model = to_model_proto(&mut detector, &ExportOptions::default()).unwrap();
        let graph = model.graph.as_ref().unwrap();

        assert_eq!(model.opset_import[0].version, 11);
        assert_eq!(model.ir_version, IR_VERSION);
        assert_eq!(graph.input.len(), 1);
        assert_eq!(graph.output.len(), 1);

        let batch = dimension::Value::DimParam(BATCH_AXIS.to_string());
        assert_eq!(graph.input[0].name, INPUT_NAME);
        assert_eq!(
            dims(&graph.input[0]),
            vec![
                batch.clone(),
                dimension::Value::DimValue(3),
                dimension::Value::DimValue(224),
                dimension::Value::DimValue(224),
            ]
        );
        assert_eq!(graph.output[0].name, OUTPUT_NAME);
        assert_eq!(
            dims(&graph.output[0]),
            vec![batch, dimension::Value::DimValue(1)]
        );

        let last = graph.node.last().unwrap();
        assert_eq!(last.op_type, "Sigmoid");
        assert_eq!(last.output, vec![OUTPUT_NAME.to_string()]);
    }

    #[test]
    fn export_switches_to_eval() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();
        assert_eq!(detector.mode(), Mode::Train);
        to_model_proto(&mut detector, &options(11, true)).unwrap();
        assert_eq!(detector.mode(), Mode::Eval);
    }

    #[test]
    fn folding_removes_batch_norms() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();
        let model = to_model_proto(&mut detector, &options(11, true)).unwrap();

        assert_eq!(count_ops(&model, "BatchNormalization"), 0);
        assert_eq!(count_ops(&model, "Conv"), 9);
        assert_eq!(count_ops(&model, "Relu"), 10);
        assert_eq!(count_ops(&model, "MaxPool"), 4);
        assert_eq!(count_ops(&model, "Gemm"), 2);
        assert_eq!(count_ops(&model, "Dropout"), 0);
        // Batch norm scale and shift become one bias per convolution output channel.
        assert_eq!(initializer_floats(&model), PARAM_COUNT - 2944 + 1472);
    }

    #[test]
    fn unfolded_graph_keeps_running_stats() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();
        let model = to_model_proto(&mut detector, &options(11, false)).unwrap();

        assert_eq!(count_ops(&model, "BatchNormalization"), 9);
        assert_eq!(initializer_floats(&model), PARAM_COUNT + 2944);
    }

    #[test]
    fn folded_weights_scale_by_batch_norm() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();
        let model = to_model_proto(&mut detector, &options(11, true)).unwrap();
        let graph = model.graph.as_ref().unwrap();

        let stem = graph
            .initializer
            .iter()
            .find(|t| t.name == "features.0.weight")
            .unwrap();
        let k = 1. / (1. + 1e-5_f32).sqrt();
        let expected: Vec<f32> = detector.params()[..864].iter().map(|w| w * k).collect();
        assert_eq!(stem.dims, vec![32, 3, 3, 3]);
        assert!(
            stem.floats()
                .iter()
                .zip(&expected)
                .all(|(a, b)| (a - b).abs() < 1e-7)
        );
    }

    #[test]
    fn operators_newer_than_the_pinned_opset_are_rejected() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();

        let err = to_model_proto(&mut detector, &options(8, false)).unwrap_err();
        assert!(matches!(
            err,
            ExportErr::UnsupportedOperator {
                op: "BatchNormalization",
                since: 9,
                opset: 8,
            }
        ));

        let err = to_model_proto(&mut detector, &options(5, true)).unwrap_err();
        assert!(matches!(
            err,
            ExportErr::UnsupportedOperator { op: "Relu", .. }
        ));
    }
}
