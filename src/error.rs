use thiserror::Error;

/// Maxwell filter error types
#[derive(Error, Debug)]
pub enum MaxwellError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unsupported mode: {0}")]
    UnsupportedMode(String),

    #[error("Unknown coordinate frame: {0}")]
    UnknownFrame(String),

    #[error("Data not usable for Maxwell filtering: {0}")]
    Unusable(String),

    #[error("Maxwell filtering {0} step has already been applied, cannot reapply")]
    AlreadyProcessed(String),

    #[error("Invalid head position data: {0}")]
    InvalidPose(String),

    #[error("Cross-talk error: {0}")]
    CrossTalk(String),

    #[error("Fine calibration error: {0}")]
    Calibration(String),

    #[error("Number of requested bases ({requested}) exceeds number of good sensors ({available})")]
    TooManyMoments { requested: usize, available: usize },

    #[error("Matrix is badly conditioned: {0:.0} >= 1000")]
    IllConditioned(f64),

    #[error("Could not automatically determine mag_scale: {0}")]
    MagScale(String),

    #[error("Invalid recording: {0}")]
    InvalidRecording(String),

    #[error("Numerical failure: {0}")]
    Numerical(String),

    #[error("Buffer tiling violated: {0}")]
    Tiling(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for Maxwell filter operations
pub type Result<T> = std::result::Result<T, MaxwellError>;
