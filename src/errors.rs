use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaqError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
}

/// Rejected configuration requests.
///
/// The wire protocol never reports these to the host; the device logs them
/// and drops the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("input channel {0} out of range (0-5)")]
    InvalidChannel(u8),
    #[error("rate divider index {0} out of range (0-6)")]
    InvalidDividerIndex(u8),
}

pub type Result<T> = std::result::Result<T, DaqError>;
