use std::io;
use thiserror::Error;

/// Errors raised inside a device thread
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The backend has no implementation of this command
    #[error("{0} is not implemented by this decoder")]
    Unimplemented(&'static str),

    #[error("invalid device address {0:?}")]
    Address(String),

    #[error("invalid replay reference {0:?}")]
    Replay(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Transient transport failure: the port should be closed
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Serial(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
