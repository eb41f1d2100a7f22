#[derive(Clone, Copy, Debug, Default)]
pub struct Sigmoid;

impl Sigmoid {
    pub fn f(&self, z: f32) -> f32 {
        1. / (1. + (-z).exp())
    }
}
