//! Command implementations for the Retina CLI.

pub mod inspect;
pub mod train;
pub mod types;

pub use types::TrainArgs;
