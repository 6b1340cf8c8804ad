// Maxwell filter library
// Signal space separation (SSS) and temporal SSS for MEG sensor arrays

pub mod basis;
pub mod calibration;
pub mod config;
pub mod crosstalk;
pub mod decomposition;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod pose;
pub mod recording;
pub mod regularize;
pub mod tsss;
pub mod types;
pub mod windowing;

#[cfg(test)]
mod test_utils;

// Re-export the entry points
pub use config::{BadCondition, Destination, MagScale, MaxwellParams, Origin};
pub use error::{MaxwellError, Result};
pub use filter::{maxwell_filter, FilterReport, MaxwellOutput};
pub use recording::{MeasInfo, Recording};
