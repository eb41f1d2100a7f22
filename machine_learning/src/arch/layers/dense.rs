use ndarray::{linalg, prelude::*};
use rand::Rng;

use super::into_rows;
use crate::{MlErr, Result, arch::activations::ActFn, arch::init::ParamGen};

/// A fully connected layer, `y = act(x · Wᵀ + b)`.
///
/// The weights are stored as `(out, in)` followed by the `out` biases.
#[derive(Debug, Clone)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,
    size: usize,
}

impl Dense {
    /// Creates a new `Dense`.
    ///
    /// # Arguments
    /// * `dim` - The input and output features.
    /// * `act_fn` - The activation applied to the affine output, if any.
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self {
            dim,
            act_fn,
            size: (dim.0 + 1) * dim.1,
        }
    }

    /// Returns the size of this layer.
    ///
    /// # Returns
    /// The amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    pub fn act_fn(&self) -> Option<ActFn> {
        self.act_fn
    }

    pub fn init<R: Rng>(&self, params: &mut [f32], rng: &mut R) -> Result<()> {
        // Weights and biases share the same bound.
        ParamGen::fan_in_uniform(self.dim.0).fill(params, rng)
    }

    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        match shape {
            &[n, features] if features == self.dim.0 => Ok(vec![n, self.dim.1]),
            &[_, features] => Err(MlErr::SizeMismatch {
                what: "dense input features",
                got: features,
                expected: self.dim.0,
            }),
            _ => Err(MlErr::SizeMismatch {
                what: "dense input rank",
                got: shape.len(),
                expected: 2,
            }),
        }
    }

    pub fn forward(&self, params: &[f32], x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = into_rows(x, "dense input rank")?;
        self.output_shape(x.shape())?;
        let (w, b) = self.view_params(params)?;

        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w.t(), 0.0, &mut z);
        z += &b;

        if let Some(act_fn) = self.act_fn {
            z.mapv_inplace(|z| act_fn.f(z));
        }

        Ok(z.into_dyn())
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    ///
    /// # Arguments
    /// * `params` - A slice of parameters.
    ///
    /// # Returns
    /// A tuple containing the `(out, in)` weights and biases.
    pub fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        if params.len() != self.size {
            return Err(MlErr::SizeMismatch {
                what: "dense params",
                got: params.len(),
                expected: self.size,
            });
        }

        let (input, output) = self.dim;
        let (w_raw, b_raw) = params.split_at(input * output);
        let weights = ArrayView2::from_shape((output, input), w_raw).map_err(|_| {
            MlErr::SizeMismatch {
                what: "dense weights",
                got: w_raw.len(),
                expected: input * output,
            }
        })?;

        Ok((weights, ArrayView1::from(b_raw)))
    }
}
