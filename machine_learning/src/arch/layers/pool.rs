use ndarray::{Zip, prelude::*};

use super::{expect_rank, into_nchw};
use crate::{MlErr, Result};

/// Max pooling with a square window and no padding. Trailing rows and columns that do not fill a
/// whole window are dropped.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    kernel: usize,
    stride: usize,
}

impl MaxPool2d {
    pub fn new(kernel: usize, stride: usize) -> Self {
        Self { kernel, stride }
    }

    pub fn kernel(&self) -> usize {
        self.kernel
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        let shape = expect_rank(shape, 4, "max pool input rank")?;
        let (h, w) = self.output_hw(shape)?;
        Ok(vec![shape[0], shape[1], h, w])
    }

    pub fn forward(&self, x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = into_nchw(x, "max pool input rank")?;
        let (n, c, _, _) = x.dim();
        let (oh, ow) = self.output_hw(x.shape())?;
        let (k, s) = (self.kernel, self.stride);

        let mut y = Array4::zeros((n, c, oh, ow));
        Zip::indexed(&mut y).for_each(|(b, ch, i, j), out| {
            *out = x
                .slice(s![b, ch, i * s..i * s + k, j * s..j * s + k])
                .fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        });

        Ok(y.into_dyn())
    }

    fn output_hw(&self, shape: &[usize]) -> Result<(usize, usize)> {
        let (h, w) = (shape[2], shape[3]);
        if h < self.kernel || w < self.kernel {
            return Err(MlErr::ShapeMismatch {
                what: "max pool input",
                got: shape.to_vec(),
                expected: vec![shape[0], shape[1], self.kernel, self.kernel],
            });
        }

        Ok((
            (h - self.kernel) / self.stride + 1,
            (w - self.kernel) / self.stride + 1,
        ))
    }
}

/// Collapses every channel's spatial grid to its mean, `(n, c, h, w) -> (n, c, 1, 1)`.
#[derive(Debug, Clone, Default)]
pub struct GlobalAvgPool;

impl GlobalAvgPool {
    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        let shape = expect_rank(shape, 4, "global average pool input rank")?;
        Ok(vec![shape[0], shape[1], 1, 1])
    }

    pub fn forward(&self, x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = into_nchw(x, "global average pool input rank")?;
        let (n, c, h, w) = x.dim();
        if h * w == 0 {
            return Err(MlErr::ShapeMismatch {
                what: "global average pool input",
                got: vec![n, c, h, w],
                expected: vec![n, c, 1, 1],
            });
        }

        let area = (h * w) as f32;
        let y = Array4::from_shape_fn((n, c, 1, 1), |(b, ch, _, _)| {
            x.slice(s![b, ch, .., ..]).sum() / area
        });

        Ok(y.into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_pool_halves_and_takes_maximum() {
        let pool = MaxPool2d::new(2, 2);
        let x = Array::from_shape_fn((1, 1, 4, 4), |(_, _, i, j)| (i * 4 + j) as f32);

        let y = pool.forward(x.into_dyn()).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_eq!(y[[0, 0, 0, 0]], 5.);
        assert_eq!(y[[0, 0, 1, 1]], 15.);
    }

    #[test]
    fn max_pool_floors_odd_sizes() {
        let pool = MaxPool2d::new(2, 2);
        assert_eq!(pool.output_shape(&[1, 512, 15, 15]).unwrap(), vec![1, 512, 7, 7]);
    }

    #[test]
    fn max_pool_keeps_negative_maxima() {
        let pool = MaxPool2d::new(2, 2);
        let x = Array4::from_elem((1, 1, 2, 2), -3.);
        let y = pool.forward(x.into_dyn()).unwrap();
        assert_eq!(y[[0, 0, 0, 0]], -3.);
    }

    #[test]
    fn global_avg_pool_takes_channel_means() {
        let x = Array::from_shape_fn((2, 3, 7, 7), |(b, c, _, _)| (b * 3 + c) as f32);
        let y = GlobalAvgPool.forward(x.into_dyn()).unwrap();

        assert_eq!(y.shape(), &[2, 3, 1, 1]);
        assert!((y[[1, 2, 0, 0]] - 5.).abs() < 1e-6);
    }
}
