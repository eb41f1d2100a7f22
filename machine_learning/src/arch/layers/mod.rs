mod batch_norm;
mod conv;
mod dense;
mod dropout;
mod layer;
mod pool;
mod reshape;

pub use batch_norm::BatchNorm2d;
pub use conv::Conv2d;
pub use dense::Dense;
pub use dropout::Dropout;
pub use layer::Layer;
pub use pool::{GlobalAvgPool, MaxPool2d};
pub use reshape::Flatten;

use ndarray::{Array2, Array4, ArrayD, Ix2, Ix4};

use crate::{MlErr, Result};

/// Narrows a dynamic tensor to the `(batch, channels, height, width)` layout.
fn into_nchw(x: ArrayD<f32>, what: &'static str) -> Result<Array4<f32>> {
    let ndim = x.ndim();
    x.into_dimensionality::<Ix4>()
        .map_err(|_| MlErr::SizeMismatch {
            what,
            got: ndim,
            expected: 4,
        })
}

/// Narrows a dynamic tensor to the `(batch, features)` layout.
fn into_rows(x: ArrayD<f32>, what: &'static str) -> Result<Array2<f32>> {
    let ndim = x.ndim();
    x.into_dimensionality::<Ix2>()
        .map_err(|_| MlErr::SizeMismatch {
            what,
            got: ndim,
            expected: 2,
        })
}

/// Checks that a shape has the expected rank, returning it unchanged.
fn expect_rank<'a>(shape: &'a [usize], rank: usize, what: &'static str) -> Result<&'a [usize]> {
    if shape.len() != rank {
        return Err(MlErr::SizeMismatch {
            what,
            got: shape.len(),
            expected: rank,
        });
    }

    Ok(shape)
}
