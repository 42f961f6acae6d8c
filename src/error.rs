use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DaqError>;

#[derive(Debug, Error)]
pub enum DaqError {
    /// A ring wait or socket poll ran out of time. Callers loop on this.
    #[error("Timed out")]
    Timeout,

    #[error("System call failed: {0}, {1}")]
    Sys(&'static str, io::Error),

    #[error("Malformed packet: {0}")]
    Packet(&'static str),

    #[error("Status key {0} is missing or unparseable")]
    Key(&'static str),

    #[error("Bad parameter: {0}")]
    Param(String),

    #[error("Shared memory segment {0} does not exist")]
    NoSegment(String),

    #[error("{0}")]
    Io(#[from] io::Error),
}

impl DaqError {
    pub fn last_sys(what: &'static str) -> DaqError {
        DaqError::Sys(what, io::Error::last_os_error())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DaqError::Timeout)
    }
}
