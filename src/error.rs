//! # Error Types
//!
//! Central error type for the tscast crate. Stream-level problems (bad sync,
//! continuity errors, CRC failures) are deliberately *not* errors: they are
//! counted and reported through the event channel while processing continues.
//! `TsCastError` covers the failures that abort an operation — bad
//! configuration, socket setup, control-protocol violations — and `Fatal`
//! marks the ones that must terminate the process (driver open failure,
//! control socket bind failure).

use std::num::ParseIntError;
use thiserror::Error;

/// Primary error type for the tscast crate
#[derive(Error, Debug)]
pub enum TsCastError {
    /// I/O errors from sockets and file operations
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors raised while parsing TS/PSI structures
    #[error("parser error: {0}")]
    Parser(String),

    /// Invalid or malformed input data
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Invalid output or process configuration
    #[error("config error: {0}")]
    Config(String),

    /// Control-socket protocol violations
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unrecoverable failures that terminate the process
    #[error("fatal: {0}")]
    Fatal(String),

    /// Errors that occur during integer parsing
    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),
}

/// A specialized Result type for tscast operations.
pub type Result<T> = std::result::Result<T, TsCastError>;
