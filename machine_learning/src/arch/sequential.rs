use log::debug;
use ndarray::ArrayD;
use rand::Rng;

use super::{Mode, layers::Layer};
use crate::{MlErr, Result};

/// A sequential model: information flows forward through its layers in order, each layer taking
/// its own contiguous chunk of the model's parameter slice.
#[derive(Debug, Clone)]
pub struct Sequential {
    layers: Vec<Layer>,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `layers` - The layers the sequential is composed of.
    ///
    /// # Returns
    /// A new `Sequential` instance.
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Layer>,
    {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    /// Returns the amount of parameters in the model.
    pub fn size(&self) -> usize {
        self.layers.iter().map(|layer| layer.size()).sum()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Splits `params` into the chunk of every layer, in order.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` if `params` is not exactly as long as the model's size.
    pub fn split_params<'p>(&self, params: &'p [f32]) -> Result<Vec<&'p [f32]>> {
        self.check_size(params.len())?;

        let mut rest = params;
        let chunks = self
            .layers
            .iter()
            .map(|layer| {
                let chunk;
                (chunk, rest) = rest.split_at(layer.size());
                chunk
            })
            .collect();

        Ok(chunks)
    }

    /// Generates the initial value of every parameter.
    pub fn init<R: Rng>(&self, params: &mut [f32], rng: &mut R) -> Result<()> {
        self.check_size(params.len())?;

        let mut rest = params;
        for layer in &self.layers {
            let chunk;
            (chunk, rest) = std::mem::take(&mut rest).split_at_mut(layer.size());
            layer.init(chunk, rng)?;
        }

        Ok(())
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.layers.iter_mut().for_each(|layer| layer.set_mode(mode));
    }

    /// Computes the output shape of the whole model for an input shape.
    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        self.layers
            .iter()
            .try_fold(shape.to_vec(), |shape, layer| layer.output_shape(&shape))
    }

    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `x` - The input data.
    ///
    /// # Returns
    /// The prediction for the given input or the error of the first layer that rejected it.
    pub fn forward(&mut self, params: &[f32], mut x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.check_size(params.len())?;

        let mut rest = params;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let chunk;
            (chunk, rest) = rest.split_at(layer.size());
            x = layer.forward(chunk, x)?;
            debug!("layer {i} ({}) -> {:?}", layer.kind(), x.shape());
        }

        Ok(x)
    }

    fn check_size(&self, len: usize) -> Result<()> {
        let size = self.size();
        if len != size {
            return Err(MlErr::SizeMismatch {
                what: "params",
                got: len,
                expected: size,
            });
        }

        Ok(())
    }
}
