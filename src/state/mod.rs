pub mod validation;

pub use validation::{validate, validator_for};
