pub mod context;
pub mod error;
pub mod runner;
pub mod types;

pub use context::{RunContext, TimingPolicy};
pub use error::CaseError;
pub use runner::TaskRunner;
