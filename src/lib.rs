pub mod cli;
pub mod engine;
pub mod query;
pub mod rules;
pub mod scheduler;
pub mod state;
pub mod store;
