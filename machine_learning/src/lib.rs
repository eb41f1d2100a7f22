pub mod arch;
pub mod decision;
pub mod error;

pub use decision::{Decision, THRESHOLD};
pub use error::{MlErr, Result};
