use ndarray::{Zip, prelude::*};
use rand::Rng;

use super::{expect_rank, into_nchw};
use crate::{MlErr, Result, arch::init::ParamGen};

pub const DEFAULT_EPS: f32 = 1e-5;
pub const DEFAULT_MOMENTUM: f32 = 0.1;

/// Per-channel batch normalization over `(batch, channels, height, width)` tensors.
///
/// The learned scale and shift live in the parameter slice, `channels` values each. The running
/// mean and variance are buffers owned by the layer: they are updated while training and used as
/// they are during inference.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    channels: usize,
    eps: f32,
    momentum: f32,
    training: bool,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
}

impl BatchNorm2d {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            eps: DEFAULT_EPS,
            momentum: DEFAULT_MOMENTUM,
            training: true,
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        2 * self.channels
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn running_mean(&self) -> ArrayView1<'_, f32> {
        self.running_mean.view()
    }

    pub fn running_var(&self) -> ArrayView1<'_, f32> {
        self.running_var.view()
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn init<R: Rng>(&self, params: &mut [f32], rng: &mut R) -> Result<()> {
        let (gamma, beta) = params.split_at_mut(self.channels);
        ParamGen::Const { value: 1. }.fill(gamma, rng)?;
        ParamGen::Const { value: 0. }.fill(beta, rng)
    }

    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        let shape = expect_rank(shape, 4, "batch norm input rank")?;
        self.check_channels(shape[1])?;
        Ok(shape.to_vec())
    }

    pub fn forward(&mut self, params: &[f32], x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut x = into_nchw(x, "batch norm input rank")?;
        self.check_channels(x.dim().1)?;

        let (scale, shift) = if self.training {
            let (mean, var) = self.batch_stats(x.view());
            self.affine(params, mean.view(), var.view())?
        } else {
            self.scale_shift(params)?
        };

        for (c, mut channel) in x.axis_iter_mut(Axis(1)).enumerate() {
            let (s, t) = (scale[c], shift[c]);
            channel.mapv_inplace(|v| v * s + t);
        }

        Ok(x.into_dyn())
    }

    /// The per-channel `(scale, shift)` this layer applies during inference, so that the output is
    /// `x * scale + shift`.
    pub fn scale_shift(&self, params: &[f32]) -> Result<(Array1<f32>, Array1<f32>)> {
        self.affine(params, self.running_mean.view(), self.running_var.view())
    }

    fn affine(
        &self,
        params: &[f32],
        mean: ArrayView1<f32>,
        var: ArrayView1<f32>,
    ) -> Result<(Array1<f32>, Array1<f32>)> {
        let (gamma, beta) = self.view_params(params)?;
        let scale = Zip::from(&gamma)
            .and(&var)
            .map_collect(|&g, &v| g / (v + self.eps).sqrt());
        let shift = Zip::from(&beta)
            .and(&mean)
            .and(&scale)
            .map_collect(|&b, &m, &s| b - m * s);

        Ok((scale, shift))
    }

    /// Computes the biased batch statistics used for normalization and folds the unbiased variance
    /// into the running statistics.
    fn batch_stats(&mut self, x: ArrayView4<f32>) -> (Array1<f32>, Array1<f32>) {
        let (n, _, h, w) = x.dim();
        let count = (n * h * w) as f32;
        let mut mean = Array1::zeros(self.channels);
        let mut var = Array1::zeros(self.channels);

        for (c, channel) in x.axis_iter(Axis(1)).enumerate() {
            let m = channel.sum() / count;
            let v = channel.fold(0., |acc, &x| acc + (x - m).powi(2)) / count;
            mean[c] = m;
            var[c] = v;
        }

        let unbiased = if count > 1. {
            &var * (count / (count - 1.))
        } else {
            var.clone()
        };
        let momentum = self.momentum;
        self.running_mean
            .zip_mut_with(&mean, |r, &m| *r = (1. - momentum) * *r + momentum * m);
        self.running_var
            .zip_mut_with(&unbiased, |r, &v| *r = (1. - momentum) * *r + momentum * v);

        (mean, var)
    }

    fn check_channels(&self, channels: usize) -> Result<()> {
        if channels != self.channels {
            return Err(MlErr::SizeMismatch {
                what: "batch norm input channels",
                got: channels,
                expected: self.channels,
            });
        }

        Ok(())
    }

    /// Gives a view of the raw parameter slice as the scale and shift of this layer.
    ///
    /// # Arguments
    /// * `params` - A slice of parameters.
    ///
    /// # Returns
    /// A tuple containing the scale (gamma) and shift (beta).
    pub fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> Result<(ArrayView1<'a, f32>, ArrayView1<'a, f32>)> {
        if params.len() != self.size() {
            return Err(MlErr::SizeMismatch {
                what: "batch norm params",
                got: params.len(),
                expected: self.size(),
            });
        }

        let (gamma, beta) = params.split_at(self.channels);
        Ok((ArrayView1::from(gamma), ArrayView1::from(beta)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_params(channels: usize) -> Vec<f32> {
        [vec![1.; channels], vec![0.; channels]].concat()
    }

    #[test]
    fn eval_uses_running_stats() {
        let mut bn = BatchNorm2d::new(2);
        bn.set_training(false);
        let params = [vec![2., 1.], vec![0.5, -1.]].concat();
        let x = Array4::from_elem((1, 2, 2, 2), 3.);

        let y = bn.forward(&params, x.into_dyn()).unwrap();
        let k = 1. / (1. + DEFAULT_EPS).sqrt();
        assert!((y[[0, 0, 0, 0]] - (3. * 2. * k + 0.5)).abs() < 1e-6);
        assert!((y[[0, 1, 1, 1]] - (3. * k - 1.)).abs() < 1e-6);
        assert_eq!(bn.running_mean(), Array1::<f32>::zeros(2));
    }

    #[test]
    fn train_normalizes_with_batch_stats_and_updates_running_stats() {
        let mut bn = BatchNorm2d::new(1);
        let params = unit_params(1);
        let x = Array4::from_shape_vec((2, 1, 1, 2), vec![1., 3., 1., 3.]).unwrap();

        let y = bn.forward(&params, x.into_dyn()).unwrap();
        let expected = 1. / (1. + DEFAULT_EPS).sqrt();
        assert!((y[[0, 0, 0, 0]] + expected).abs() < 1e-5);
        assert!((y[[0, 0, 0, 1]] - expected).abs() < 1e-5);

        // mean 2, biased variance 1, unbiased 4/3.
        assert!((bn.running_mean()[0] - 0.2).abs() < 1e-6);
        assert!((bn.running_var()[0] - (0.9 + 0.1 * 4. / 3.)).abs() < 1e-6);
    }

    #[test]
    fn init_is_identity_affine() {
        let bn = BatchNorm2d::new(3);
        let mut params = vec![7.; bn.size()];
        bn.init(&mut params, &mut rand::rng()).unwrap();
        assert_eq!(params, unit_params(3));
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let mut bn = BatchNorm2d::new(3);
        let params = unit_params(3);
        let x = Array4::<f32>::zeros((1, 2, 2, 2));
        assert!(bn.forward(&params, x.into_dyn()).is_err());
    }
}
