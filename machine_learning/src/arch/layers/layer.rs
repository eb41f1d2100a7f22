use ndarray::ArrayD;
use rand::Rng;

use super::{BatchNorm2d, Conv2d, MaxPool2d};
use crate::{Result, arch::Mode, arch::activations::ActFn};

#[derive(Debug, Clone)]
pub enum Layer {
    Conv(Conv2d),
    BatchNorm(BatchNorm2d),
    Act(ActFn),
    MaxPool(MaxPool2d),
    GlobalAvgPool(super::GlobalAvgPool),
    Flatten(super::Flatten),
    Dropout(super::Dropout),
    Dense(super::Dense),
}
use Layer::*;

impl Layer {
    /// A standard convolution with a single channel group.
    pub fn conv(channels: (usize, usize), kernel: usize, stride: usize, padding: usize) -> Self {
        Conv(Conv2d::new(channels, kernel, stride, padding, 1))
    }

    /// A per-channel spatial filter, stride 1 and same padding.
    pub fn depthwise(channels: usize, kernel: usize) -> Self {
        Conv(Conv2d::new((channels, channels), kernel, 1, kernel / 2, channels))
    }

    /// A 1x1 channel-mixing convolution.
    pub fn pointwise(channels: (usize, usize)) -> Self {
        Conv(Conv2d::new(channels, 1, 1, 0, 1))
    }

    pub fn batch_norm(channels: usize) -> Self {
        BatchNorm(BatchNorm2d::new(channels))
    }

    pub fn relu() -> Self {
        Act(ActFn::relu())
    }

    pub fn sigmoid() -> Self {
        Act(ActFn::sigmoid())
    }

    pub fn max_pool(kernel: usize, stride: usize) -> Self {
        MaxPool(MaxPool2d::new(kernel, stride))
    }

    pub fn global_avg_pool() -> Self {
        GlobalAvgPool(super::GlobalAvgPool)
    }

    pub fn flatten() -> Self {
        Flatten(super::Flatten)
    }

    pub fn dropout<R: Rng>(rate: f32, rng: &mut R) -> Self {
        Dropout(super::Dropout::new(rate, rng))
    }

    pub fn dense(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Dense(super::Dense::new(dim, act_fn))
    }

    /// The amount of parameters this layer takes from the model's parameter slice.
    pub fn size(&self) -> usize {
        match self {
            Conv(l) => l.size(),
            BatchNorm(l) => l.size(),
            Dense(l) => l.size(),
            Act(_) | MaxPool(_) | GlobalAvgPool(_) | Flatten(_) | Dropout(_) => 0,
        }
    }

    /// A short name for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Conv(_) => "conv2d",
            BatchNorm(_) => "batch_norm",
            Act(act_fn) => act_fn.op_type(),
            MaxPool(_) => "max_pool",
            GlobalAvgPool(_) => "global_avg_pool",
            Flatten(_) => "flatten",
            Dropout(_) => "dropout",
            Dense(_) => "dense",
        }
    }

    pub fn init<R: Rng>(&self, params: &mut [f32], rng: &mut R) -> Result<()> {
        match self {
            Conv(l) => l.init(params, rng),
            BatchNorm(l) => l.init(params, rng),
            Dense(l) => l.init(params, rng),
            Act(_) | MaxPool(_) | GlobalAvgPool(_) | Flatten(_) | Dropout(_) => Ok(()),
        }
    }

    pub fn set_mode(&mut self, mode: Mode) {
        let training = mode == Mode::Train;
        match self {
            BatchNorm(l) => l.set_training(training),
            Dropout(l) => l.set_training(training),
            _ => {}
        }
    }

    /// Computes the shape this layer outputs for an input of the given shape.
    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        match self {
            Conv(l) => l.output_shape(shape),
            BatchNorm(l) => l.output_shape(shape),
            MaxPool(l) => l.output_shape(shape),
            GlobalAvgPool(l) => l.output_shape(shape),
            Flatten(l) => l.output_shape(shape),
            Dense(l) => l.output_shape(shape),
            Act(_) | Dropout(_) => Ok(shape.to_vec()),
        }
    }

    pub fn forward(&mut self, params: &[f32], x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Conv(l) => l.forward(params, x),
            BatchNorm(l) => l.forward(params, x),
            Act(act_fn) => Ok(x.mapv_into(|v| act_fn.f(v))),
            MaxPool(l) => l.forward(x),
            GlobalAvgPool(l) => l.forward(x),
            Flatten(l) => l.forward(x),
            Dropout(l) => Ok(l.forward(x)),
            Dense(l) => l.forward(params, x),
        }
    }
}
