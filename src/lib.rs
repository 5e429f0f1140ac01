//! Battery-cell State-of-Health series and Remaining-Useful-Life estimation
//! from heterogeneous battery-test JSON exports.

pub mod config;
pub mod data;
pub mod error;
pub mod kalman;
pub mod pipeline;
pub mod rul;
pub mod soh;
pub mod trend;

pub use error::PipelineError;
