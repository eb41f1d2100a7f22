use ndarray::ArrayD;
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Randomly zeroes units while training, scaling the survivors so the expected activation is
/// unchanged. Identity during inference.
#[derive(Debug, Clone)]
pub struct Dropout {
    rate: f32,
    training: bool,
    rng: StdRng,
}

impl Dropout {
    /// Creates a new `Dropout` whose mask generator is seeded from `rng`.
    ///
    /// # Arguments
    /// * `rate` - The probability of zeroing a unit, in `[0, 1)`.
    /// * `rng` - The source the layer's own generator is seeded from.
    pub fn new<R: Rng>(rate: f32, rng: &mut R) -> Self {
        Self {
            rate: rate.clamp(0., 1.),
            training: true,
            rng: StdRng::from_rng(rng),
        }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn forward(&mut self, mut x: ArrayD<f32>) -> ArrayD<f32> {
        if !self.training || self.rate == 0. {
            return x;
        }

        let rate = self.rate;
        let keep = 1. / (1. - rate).max(f32::EPSILON);
        let rng = &mut self.rng;
        x.mapv_inplace(|v| if rng.random::<f32>() < rate { 0. } else { v * keep });
        x
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    #[test]
    fn eval_is_identity() {
        let mut dropout = Dropout::new(0.2, &mut rand::rng());
        dropout.set_training(false);
        let x = Array2::from_elem((4, 128), 1.5).into_dyn();
        assert_eq!(dropout.forward(x.clone()), x);
    }

    #[test]
    fn train_zeroes_and_rescales() {
        let mut dropout = Dropout::new(0.2, &mut StdRng::seed_from_u64(3));
        let x = Array2::from_elem((16, 128), 1.).into_dyn();
        let y = dropout.forward(x);

        let zeros = y.iter().filter(|&&v| v == 0.).count();
        assert!(zeros > 0 && zeros < y.len() / 2);
        assert!(y.iter().all(|&v| v == 0. || (v - 1.25).abs() < 1e-6));
    }
}
