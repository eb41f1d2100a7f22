use rand::{
    Rng,
    distr::{Distribution, Uniform},
};

use crate::{MlErr, Result};

/// How to generate the initial values of a parameter slice.
#[derive(Debug, Clone, Copy)]
pub enum ParamGen {
    Const { value: f32 },
    Uniform { low: f32, high: f32 },
}

impl ParamGen {
    /// The default for weights and biases feeding from `fan_in` inputs: uniform in
    /// `[-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    pub fn fan_in_uniform(fan_in: usize) -> Self {
        let bound = 1. / (fan_in.max(1) as f32).sqrt();
        Self::Uniform {
            low: -bound,
            high: bound,
        }
    }

    /// Overwrites every element of `params` with a freshly generated value.
    ///
    /// # Arguments
    /// * `params` - The slice to fill.
    /// * `rng` - The source of randomness.
    ///
    /// # Errors
    /// `MlErr::InvalidInit` if the distribution's arguments are invalid.
    pub fn fill<R: Rng>(&self, params: &mut [f32], rng: &mut R) -> Result<()> {
        match *self {
            ParamGen::Const { value } => params.fill(value),
            ParamGen::Uniform { low, high } => {
                let dist = Uniform::new(low, high)
                    .map_err(|e| MlErr::InvalidInit(format!("uniform [{low}, {high}): {e}")))?;
                params.iter_mut().for_each(|p| *p = dist.sample(rng));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn fan_in_uniform_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut params = vec![0.; 1000];
        ParamGen::fan_in_uniform(16).fill(&mut params, &mut rng).unwrap();

        assert!(params.iter().all(|p| (-0.25..0.25).contains(p)));
        assert!(params.iter().any(|&p| p != 0.));
    }

    #[test]
    fn const_fills_every_element() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut params = vec![0.; 8];
        ParamGen::Const { value: 1. }.fill(&mut params, &mut rng).unwrap();
        assert_eq!(params, vec![1.; 8]);
    }

    #[test]
    fn inverted_uniform_bounds_are_rejected() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut params = vec![0.; 8];

        let uniform = ParamGen::Uniform { low: 1., high: 0. };
        assert!(matches!(
            uniform.fill(&mut params, &mut rng),
            Err(MlErr::InvalidInit(_))
        ));
        assert_eq!(params, vec![0.; 8]);
    }

    #[test]
    fn non_finite_uniform_bounds_are_rejected() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut params = vec![0.; 8];

        let uniform = ParamGen::Uniform {
            low: 0.,
            high: f32::INFINITY,
        };
        assert!(uniform.fill(&mut params, &mut rng).is_err());
    }
}
