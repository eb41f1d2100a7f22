use ndarray::{ArrayD, IxDyn};

use crate::{MlErr, Result};

/// Flattens every dimension after the batch one, `(n, d1, d2, ..) -> (n, d1 * d2 * ..)`.
#[derive(Debug, Clone, Default)]
pub struct Flatten;

impl Flatten {
    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        let Some((&n, rest)) = shape.split_first() else {
            return Err(MlErr::SizeMismatch {
                what: "flatten input rank",
                got: 0,
                expected: 1,
            });
        };

        Ok(vec![n, rest.iter().product()])
    }

    pub fn forward(&self, x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = self.output_shape(x.shape())?;
        let len = x.len();

        x.as_standard_layout()
            .into_owned()
            .into_shape_with_order(IxDyn(&shape))
            .map_err(|_| MlErr::SizeMismatch {
                what: "flatten output",
                got: len,
                expected: shape.iter().product(),
            })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;

    use super::*;

    #[test]
    fn flatten_keeps_batch() {
        let x = Array4::<f32>::zeros((2, 512, 1, 1)).into_dyn();
        let y = Flatten.forward(x).unwrap();
        assert_eq!(y.shape(), &[2, 512]);
    }

    #[test]
    fn flatten_preserves_row_major_order() {
        let x = Array4::from_shape_fn((1, 2, 2, 1), |(_, c, i, _)| (c * 2 + i) as f32).into_dyn();
        let y = Flatten.forward(x).unwrap();
        assert_eq!(y.as_slice().unwrap(), &[0., 1., 2., 3.]);
    }
}
