mod detector;

pub use detector::{
    Detector, DROPOUT_RATE, FEATURE_CHANNELS, INPUT_CHANNELS, INPUT_SIZE, NamedLayer, PARAM_COUNT,
};
