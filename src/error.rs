use std::io;

use thiserror::Error;

/// Errors surfaced by fallible engine operations.
///
/// I/O failures on an established connection never appear here: they tear
/// the connection down and are reported through its close callback instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid socket address: {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, Error>;
