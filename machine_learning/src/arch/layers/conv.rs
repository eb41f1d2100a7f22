use ndarray::{linalg, prelude::*};
use rand::Rng;

use super::{expect_rank, into_nchw};
use crate::{MlErr, Result, arch::init::ParamGen};

/// A bias-free 2D convolution over `(batch, channels, height, width)` tensors.
///
/// Grouped convolutions are supported: with `groups == in_channels == out_channels` the layer is a
/// depthwise convolution, and a 1x1 kernel with a single group is a pointwise one. The weights are
/// laid out as `(out_channels, in_channels / groups, kernel, kernel)`.
#[derive(Debug, Clone)]
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    groups: usize,
    size: usize,
}

impl Conv2d {
    /// Creates a new `Conv2d`.
    ///
    /// # Arguments
    /// * `channels` - The input and output channels.
    /// * `kernel` - The side of the square kernel.
    /// * `stride` - The step between consecutive windows.
    /// * `padding` - The zero padding added on every side.
    /// * `groups` - The amount of independent channel groups, must divide both channel counts.
    pub fn new(
        channels: (usize, usize),
        kernel: usize,
        stride: usize,
        padding: usize,
        groups: usize,
    ) -> Self {
        let (in_channels, out_channels) = channels;
        debug_assert!(groups > 0 && in_channels % groups == 0 && out_channels % groups == 0);

        Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            groups,
            size: out_channels * (in_channels / groups) * kernel * kernel,
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel(&self) -> usize {
        self.kernel
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    /// The shape of the weight tensor.
    pub fn weight_shape(&self) -> [usize; 4] {
        [
            self.out_channels,
            self.in_channels / self.groups,
            self.kernel,
            self.kernel,
        ]
    }

    pub fn init<R: Rng>(&self, params: &mut [f32], rng: &mut R) -> Result<()> {
        let fan_in = self.in_channels / self.groups * self.kernel * self.kernel;
        ParamGen::fan_in_uniform(fan_in).fill(params, rng)
    }

    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        let shape = expect_rank(shape, 4, "conv2d input rank")?;
        self.check_channels(shape)?;
        let (h, w) = self.output_hw(shape)?;
        Ok(vec![shape[0], self.out_channels, h, w])
    }

    pub fn forward(&self, params: &[f32], x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = into_nchw(x, "conv2d input rank")?;
        let (n, _, _, _) = x.dim();
        self.check_channels(x.shape())?;
        let (oh, ow) = self.output_hw(x.shape())?;
        let weights = self.view_params(params)?;

        let cin = self.in_channels / self.groups;
        let cout = self.out_channels / self.groups;
        let mut y = Array4::zeros((n, self.out_channels, oh, ow));
        let mut cols = Array2::zeros((cin * self.kernel * self.kernel, oh * ow));
        let mut prod = Array2::zeros((cout, oh * ow));

        for b in 0..n {
            for g in 0..self.groups {
                let xg = x.slice(s![b, g * cin..(g + 1) * cin, .., ..]);
                self.im2col(xg, &mut cols, (oh, ow));

                let wg = weights.slice(s![g * cout..(g + 1) * cout, ..]);
                linalg::general_mat_mul(1.0, &wg, &cols, 0.0, &mut prod);

                let out = prod
                    .view()
                    .into_shape_with_order((cout, oh, ow))
                    .map_err(|_| MlErr::SizeMismatch {
                        what: "conv2d output",
                        got: prod.len(),
                        expected: cout * oh * ow,
                    })?;
                y.slice_mut(s![b, g * cout..(g + 1) * cout, .., ..])
                    .assign(&out);
            }
        }

        Ok(y.into_dyn())
    }

    /// Unfolds every kernel window of `x` into a column of `cols`, zero filling the padding.
    fn im2col(&self, x: ArrayView3<f32>, cols: &mut Array2<f32>, (oh, ow): (usize, usize)) {
        let (c, h, w) = x.dim();
        let k = self.kernel;
        let pad = self.padding as isize;
        cols.fill(0.);

        for ci in 0..c {
            for ki in 0..k {
                for kj in 0..k {
                    let row = (ci * k + ki) * k + kj;
                    for oy in 0..oh {
                        let iy = (oy * self.stride + ki) as isize - pad;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }

                        for ox in 0..ow {
                            let ix = (ox * self.stride + kj) as isize - pad;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }

                            cols[[row, oy * ow + ox]] = x[[ci, iy as usize, ix as usize]];
                        }
                    }
                }
            }
        }
    }

    fn check_channels(&self, shape: &[usize]) -> Result<()> {
        if shape[1] != self.in_channels {
            return Err(MlErr::SizeMismatch {
                what: "conv2d input channels",
                got: shape[1],
                expected: self.in_channels,
            });
        }

        Ok(())
    }

    fn output_hw(&self, shape: &[usize]) -> Result<(usize, usize)> {
        let (h, w) = (shape[2] + 2 * self.padding, shape[3] + 2 * self.padding);
        if h < self.kernel || w < self.kernel {
            return Err(MlErr::ShapeMismatch {
                what: "conv2d input",
                got: shape.to_vec(),
                expected: vec![shape[0], self.in_channels, self.kernel, self.kernel],
            });
        }

        Ok((
            (h - self.kernel) / self.stride + 1,
            (w - self.kernel) / self.stride + 1,
        ))
    }

    /// Gives a view of the raw parameter slice as a `(out_channels, in_channels / groups * k * k)`
    /// weight matrix.
    pub fn view_params<'a>(&self, params: &'a [f32]) -> Result<ArrayView2<'a, f32>> {
        let err = MlErr::SizeMismatch {
            what: "conv2d params",
            got: params.len(),
            expected: self.size,
        };
        if params.len() != self.size {
            return Err(err);
        }

        let rows = self.out_channels;
        ArrayView2::from_shape((rows, self.size / rows.max(1)), params).map_err(|_| err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_kernel_keeps_input() {
        let conv = Conv2d::new((1, 1), 3, 1, 1, 1);
        let mut params = vec![0.; 9];
        params[4] = 1.;
        let x = Array::from_shape_fn((1, 1, 4, 4), |(_, _, i, j)| (i * 4 + j) as f32);

        let y = conv.forward(&params, x.clone().into_dyn()).unwrap();
        assert_eq!(y, x.into_dyn());
    }

    #[test]
    fn stride_two_halves_resolution() {
        let conv = Conv2d::new((3, 32), 3, 2, 1, 1);
        assert_eq!(conv.output_shape(&[2, 3, 224, 224]).unwrap(), vec![2, 32, 112, 112]);
    }

    #[test]
    fn padding_contributes_zeros() {
        let conv = Conv2d::new((1, 1), 3, 1, 1, 1);
        let params = vec![1.; 9];
        let x = Array4::ones((1, 1, 3, 3));

        let y = conv.forward(&params, x.into_dyn()).unwrap();
        // Corners see 4 inputs, edges 6 and the center all 9.
        assert_eq!(y[[0, 0, 0, 0]], 4.);
        assert_eq!(y[[0, 0, 0, 1]], 6.);
        assert_eq!(y[[0, 0, 1, 1]], 9.);
    }

    #[test]
    fn depthwise_filters_channels_independently() {
        let conv = Conv2d::new((2, 2), 1, 1, 0, 2);
        let params = vec![2., -1.];
        let x = Array4::ones((1, 2, 2, 2));

        let y = conv.forward(&params, x.into_dyn()).unwrap();
        assert!(y.slice(s![0, 0, .., ..]).iter().all(|&v| v == 2.));
        assert!(y.slice(s![0, 1, .., ..]).iter().all(|&v| v == -1.));
        assert_eq!(conv.size(), 2);
    }

    #[test]
    fn pointwise_mixes_channels() {
        let conv = Conv2d::new((2, 1), 1, 1, 0, 1);
        let params = vec![1., 10.];
        let mut x = Array4::zeros((1, 2, 1, 1));
        x[[0, 0, 0, 0]] = 3.;
        x[[0, 1, 0, 0]] = 4.;

        let y = conv.forward(&params, x.into_dyn()).unwrap();
        assert_eq!(y[[0, 0, 0, 0]], 43.);
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let conv = Conv2d::new((3, 8), 3, 1, 1, 1);
        let params = vec![0.; conv.size()];
        let x = Array4::<f32>::zeros((1, 4, 8, 8));

        let err = conv.forward(&params, x.into_dyn()).unwrap_err();
        assert!(matches!(
            err,
            MlErr::SizeMismatch {
                got: 4,
                expected: 3,
                ..
            }
        ));
    }

    #[test]
    fn wrong_rank_is_rejected() {
        let conv = Conv2d::new((3, 8), 3, 1, 1, 1);
        let params = vec![0.; conv.size()];
        let x = Array2::<f32>::zeros((1, 3));

        assert!(conv.forward(&params, x.into_dyn()).is_err());
    }
}
