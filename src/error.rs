use thiserror::Error;

/// Error kinds surfaced at the host API boundary. The streaming worker never
/// lets any of these cross its thread; it logs and asks the host for a reset.
#[derive(Debug, Error)]
pub enum Error {
    #[error("device not present: {0}")]
    NotPresent(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid mode: {0}")]
    InvalidMode(String),

    #[error("no clock: {0}")]
    NoClock(String),

    #[error("hardware malfunction: {0}")]
    HwMalfunction(String),

    /// A pending transfer was cut short by `abort()`. Expected during
    /// shutdown; anywhere else it is converted into `HwMalfunction`.
    #[error("operation aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, Error>;
