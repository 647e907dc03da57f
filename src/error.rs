//! Address manager errors.

use std::io;

use thiserror::Error;

/// An error occurring while loading or storing the address database.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// An encoding/decoding error.
    #[error("encode/decode error: {0}")]
    Encode(#[from] bitcoin::consensus::encode::Error),

    /// The serialized database uses a format newer than this implementation
    /// understands. The caller should continue with an empty database.
    #[error("unsupported address database format: {0}")]
    UnsupportedFormat(u8),

    /// The serialized key has the wrong size.
    #[error("incorrect key size in address database: {0}")]
    InvalidKeySize(u8),

    /// The serialized data is structurally invalid.
    #[error("corrupt address database: {0}")]
    Corrupt(&'static str),

    /// The supplied group map failed to decode or sanity-check.
    #[error("invalid group map: {0}")]
    GroupMap(&'static str),
}
