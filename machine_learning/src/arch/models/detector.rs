use log::debug;
use ndarray::{Array2, ArrayView4, Ix2};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    MlErr, Result,
    arch::{Mode, Sequential, activations::ActFn, layers::Layer},
};

pub const INPUT_CHANNELS: usize = 3;
pub const INPUT_SIZE: usize = 224;
pub const FEATURE_CHANNELS: usize = 512;
pub const DROPOUT_RATE: f32 = 0.2;

/// The amount of learned parameters of the architecture, independent of their values.
pub const PARAM_COUNT: usize = 248_001;

const STEM_CHANNELS: usize = 32;
const HIDDEN_UNITS: usize = 128;

/// The depthwise-separable stages following the stem, as `(input, output)` channels. Each one
/// ends with a 2x2 max pool.
const STAGES: [(usize, usize); 4] = [(32, 64), (64, 128), (128, 256), (256, 512)];

/// A layer of the detector together with its name and its chunk of the parameter slice.
#[derive(Debug)]
pub struct NamedLayer<'a> {
    pub name: String,
    pub layer: &'a Layer,
    pub params: &'a [f32],
}

/// A lightweight convolutional classifier that maps `(n, 3, 224, 224)` images to a `(n, 1)`
/// confidence that the GeoCode pattern is present.
///
/// The feature extractor brings the image down to a `(n, 512, 7, 7)` map with a strided stem
/// convolution followed by four depthwise-separable stages. The classifier head averages that map
/// per channel and squashes the output of two dense layers into `(0, 1)`.
#[derive(Debug, Clone)]
pub struct Detector {
    features: Sequential,
    classifier: Sequential,
    params: Vec<f32>,
    mode: Mode,
}

impl Detector {
    /// Creates a new `Detector` with randomly initialized parameters, in training mode.
    ///
    /// # Arguments
    /// * `rng` - The source of randomness for the parameters and the dropout masks.
    pub fn new<R: Rng>(rng: &mut R) -> Result<Self> {
        let features = Sequential::new(feature_layers());
        let classifier = Sequential::new(classifier_layers(rng));

        let mut params = vec![0.; features.size() + classifier.size()];
        let (feature_params, classifier_params) = params.split_at_mut(features.size());
        features.init(feature_params, rng)?;
        classifier.init(classifier_params, rng)?;
        debug!("initialized detector with {} parameters", params.len());

        Ok(Self {
            features,
            classifier,
            params,
            mode: Mode::Train,
        })
    }

    /// Creates a new `Detector` from a seeded generator, or from one seeded by the OS when `seed`
    /// is `None`.
    pub fn with_seed(seed: Option<u64>) -> Result<Self> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self::new(&mut rng)
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    /// Replaces every parameter, e.g. with a checkpoint trained elsewhere.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` if `params` does not hold exactly `num_params` values.
    pub fn load_params(&mut self, params: &[f32]) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(MlErr::SizeMismatch {
                what: "params",
                got: params.len(),
                expected: self.params.len(),
            });
        }

        self.params.copy_from_slice(params);
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn train(&mut self) {
        self.set_mode(Mode::Train);
    }

    pub fn eval(&mut self) {
        self.set_mode(Mode::Eval);
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.features.set_mode(mode);
        self.classifier.set_mode(mode);
    }

    pub fn features(&self) -> &Sequential {
        &self.features
    }

    pub fn classifier(&self) -> &Sequential {
        &self.classifier
    }

    /// Every layer in forward order, named `features.{i}` or `classifier.{i}`.
    pub fn named_layers(&self) -> Result<Vec<NamedLayer<'_>>> {
        let (feature_params, classifier_params) = self.params.split_at(self.features.size());
        let features = name_layers("features", &self.features, feature_params)?;
        let classifier = name_layers("classifier", &self.classifier, classifier_params)?;

        Ok(features.into_iter().chain(classifier).collect())
    }

    /// Computes the output shape for a batch of `batch` images.
    pub fn output_shape(&self, batch: usize) -> Result<Vec<usize>> {
        let shape = self
            .features
            .output_shape(&[batch, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE])?;
        self.classifier.output_shape(&shape)
    }

    /// Computes the confidence of every image in the batch.
    ///
    /// # Arguments
    /// * `x` - A `(n, 3, 224, 224)` batch of images, `n >= 1`.
    ///
    /// # Returns
    /// A `(n, 1)` array of confidences in `(0, 1)`, or a shape error if `x` is not a valid batch.
    pub fn forward(&mut self, x: ArrayView4<f32>) -> Result<Array2<f32>> {
        let shape = x.shape();
        if shape[0] == 0 || shape[1..] != [INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE] {
            return Err(MlErr::ShapeMismatch {
                what: "image",
                got: shape.to_vec(),
                expected: vec![shape[0].max(1), INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE],
            });
        }

        let (feature_params, classifier_params) = self.params.split_at(self.features.size());
        let x = self.features.forward(feature_params, x.to_owned().into_dyn())?;
        let y = self.classifier.forward(classifier_params, x)?;

        let ndim = y.ndim();
        y.into_dimensionality::<Ix2>()
            .map_err(|_| MlErr::SizeMismatch {
                what: "confidence rank",
                got: ndim,
                expected: 2,
            })
    }
}

fn feature_layers() -> Vec<Layer> {
    let mut layers = vec![
        Layer::conv((INPUT_CHANNELS, STEM_CHANNELS), 3, 2, 1),
        Layer::batch_norm(STEM_CHANNELS),
        Layer::relu(),
    ];

    for (cin, cout) in STAGES {
        layers.extend([
            Layer::depthwise(cin, 3),
            Layer::batch_norm(cin),
            Layer::relu(),
            Layer::pointwise((cin, cout)),
            Layer::batch_norm(cout),
            Layer::relu(),
            Layer::max_pool(2, 2),
        ]);
    }

    layers
}

fn classifier_layers<R: Rng>(rng: &mut R) -> Vec<Layer> {
    vec![
        Layer::global_avg_pool(),
        Layer::flatten(),
        Layer::dropout(DROPOUT_RATE, rng),
        Layer::dense((FEATURE_CHANNELS, HIDDEN_UNITS), Some(ActFn::relu())),
        Layer::dropout(DROPOUT_RATE, rng),
        Layer::dense((HIDDEN_UNITS, 1), Some(ActFn::sigmoid())),
    ]
}

fn name_layers<'a>(
    prefix: &str,
    model: &'a Sequential,
    params: &'a [f32],
) -> Result<Vec<NamedLayer<'a>>> {
    let chunks = model.split_params(params)?;
    let named = model
        .layers()
        .iter()
        .zip(chunks)
        .enumerate()
        .map(|(i, (layer, params))| NamedLayer {
            name: format!("{prefix}.{i}"),
            layer,
            params,
        })
        .collect();

    Ok(named)
}

#[cfg(test)]
mod tests {
    use ndarray::{Array4, s};
    use rand::distr::Distribution;
    use rand_distr::StandardNormal;

    use super::*;

    fn random_images(n: usize, seed: u64) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array4::from_shape_simple_fn((n, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE), || {
            StandardNormal.sample(&mut rng)
        })
    }

    #[test]
    fn param_count_depends_only_on_architecture() {
        let a = Detector::with_seed(Some(1)).unwrap();
        let b = Detector::with_seed(None).unwrap();

        assert_eq!(a.num_params(), PARAM_COUNT);
        assert_eq!(b.num_params(), PARAM_COUNT);
        assert_ne!(a.params(), b.params());
    }

    #[test]
    fn same_seed_same_params() {
        let a = Detector::with_seed(Some(9)).unwrap();
        let b = Detector::with_seed(Some(9)).unwrap();
        assert_eq!(a.params(), b.params());
    }

    #[test]
    fn feature_extractor_reaches_seven_by_seven() {
        let detector = Detector::with_seed(Some(0)).unwrap();
        let shape = detector
            .features()
            .output_shape(&[2, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE])
            .unwrap();

        assert_eq!(shape, vec![2, FEATURE_CHANNELS, 7, 7]);
        assert_eq!(detector.output_shape(2).unwrap(), vec![2, 1]);
    }

    #[test]
    fn all_zero_image_gives_open_unit_confidence() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();
        detector.eval();

        let x = Array4::zeros((1, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE));
        let y = detector.forward(x.view()).unwrap();

        assert_eq!(y.dim(), (1, 1));
        assert!(y[[0, 0]] > 0. && y[[0, 0]] < 1.);
    }

    #[test]
    fn eval_forward_is_deterministic_and_batch_independent() {
        let mut detector = Detector::with_seed(Some(3)).unwrap();
        detector.eval();
        let x = random_images(2, 11);

        let a = detector.forward(x.view()).unwrap();
        let b = detector.forward(x.view()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dim(), (2, 1));
        assert!(a.iter().all(|&v| v > 0. && v < 1.));

        let single = detector.forward(x.slice(s![1..2, .., .., ..])).unwrap();
        assert!((single[[0, 0]] - a[[1, 0]]).abs() < 1e-6);
    }

    #[test]
    fn wrong_channels_are_rejected() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();
        let x = Array4::<f32>::zeros((1, 4, INPUT_SIZE, INPUT_SIZE));

        assert!(matches!(
            detector.forward(x.view()),
            Err(MlErr::ShapeMismatch { what: "image", .. })
        ));
    }

    #[test]
    fn wrong_resolution_is_rejected() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();
        let x = Array4::<f32>::zeros((2, INPUT_CHANNELS, 112, 112));

        let Err(MlErr::ShapeMismatch {
            what,
            got,
            expected,
        }) = detector.forward(x.view())
        else {
            panic!("expected a shape mismatch");
        };
        assert_eq!(what, "image");
        assert_eq!(got, vec![2, INPUT_CHANNELS, 112, 112]);
        assert_eq!(expected, vec![2, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE]);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();
        let x = Array4::<f32>::zeros((0, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE));

        assert!(matches!(
            detector.forward(x.view()),
            Err(MlErr::ShapeMismatch { what: "image", .. })
        ));
    }

    #[test]
    fn load_params_checks_length() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();
        assert!(detector.load_params(&[0.; 3]).is_err());

        let zeros = vec![0.; PARAM_COUNT];
        detector.load_params(&zeros).unwrap();
        assert!(detector.params().iter().all(|&p| p == 0.));
    }

    #[test]
    fn named_layers_cover_every_param() {
        let detector = Detector::with_seed(Some(0)).unwrap();
        let layers = detector.named_layers().unwrap();

        assert_eq!(layers.first().unwrap().name, "features.0");
        assert_eq!(layers.last().unwrap().name, "classifier.5");
        let total: usize = layers.iter().map(|l| l.params.len()).sum();
        assert_eq!(total, PARAM_COUNT);
    }

    #[test]
    fn mode_switches_propagate() {
        let mut detector = Detector::with_seed(Some(0)).unwrap();
        assert_eq!(detector.mode(), Mode::Train);
        detector.eval();
        assert_eq!(detector.mode(), Mode::Eval);
        detector.train();
        assert_eq!(detector.mode(), Mode::Train);
    }
}
