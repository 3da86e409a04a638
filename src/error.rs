//! Error types for the EGTS receiver.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

use crate::protocol::ResultCode;

/// Result type alias for receiver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the receiver.
#[derive(Error, Debug)]
pub enum Error {
    // Wire protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Collaborator errors
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("identity resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    // Connection errors
    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid schedule expression {expression:?}: {reason}")]
    Schedule { expression: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if the error means the peer is gone and the connection must be dropped.
    pub fn should_close_connection(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed
                | Error::ConnectionTimeout
                | Error::Io(_)
                | Error::Protocol(ProtocolError::InvalidMarker(_))
        )
    }
}

/// Wire format errors raised by the packet codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("not an EGTS packet: first byte {0:#04x}")]
    InvalidMarker(u8),

    #[error("unexpected end of data while reading {0}")]
    UnexpectedEof(&'static str),

    #[error("invalid header length: expected {expected}, got {got}")]
    InvalidHeaderLength { expected: u8, got: u8 },

    #[error("header checksum mismatch: declared {declared:#04x}, computed {computed:#04x}")]
    HeaderChecksum { declared: u8, computed: u8 },

    #[error("frame data checksum mismatch: declared {declared:#06x}, computed {computed:#06x}")]
    FrameChecksum { declared: u16, computed: u16 },

    #[error("unsupported packet type: {0}")]
    UnsupportedPacketType(u8),

    #[error("encrypted frame data (algorithm {0}) is not supported")]
    Encrypted(u8),

    #[error("compressed frame data is not supported")]
    Compressed,

    #[error("{what} length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        what: &'static str,
        declared: usize,
        actual: usize,
    },

    #[error("{what} too large: {size} bytes (max {max})")]
    TooLarge {
        what: &'static str,
        size: usize,
        max: usize,
    },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ProtocolError {
    /// EGTS processing result reported back to the terminal for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            ProtocolError::InvalidMarker(_) => ResultCode::UnsupportedProtocol,
            ProtocolError::UnexpectedEof(_) => ResultCode::IncorrectDataForm,
            ProtocolError::InvalidHeaderLength { .. } => ResultCode::IncorrectHeaderForm,
            ProtocolError::HeaderChecksum { .. } => ResultCode::HeaderCrcError,
            ProtocolError::FrameChecksum { .. } => ResultCode::DataCrcError,
            ProtocolError::UnsupportedPacketType(_) => ResultCode::UnsupportedType,
            ProtocolError::Encrypted(_) => ResultCode::DecryptError,
            ProtocolError::Compressed => ResultCode::UnsupportedProtocol,
            ProtocolError::LengthMismatch { .. } => ResultCode::InvalidDataLength,
            ProtocolError::TooLarge { .. } => ResultCode::InvalidDataLength,
            ProtocolError::InvalidField { .. } => ResultCode::IncorrectDataForm,
        }
    }
}

/// Errors raised by storage collaborators.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store IO error: {0}")]
    Io(#[from] io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Vehicle identity resolution errors.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no provider matches source address {0}")]
    UnknownProvider(IpAddr),

    #[error("object id {oid} matches {candidates} vehicles")]
    Ambiguous { oid: u32, candidates: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reading queue errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("reading queue is closed")]
    QueueClosed,

    #[error("worker task failed: {0}")]
    WorkerFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes() {
        let crc = ProtocolError::FrameChecksum {
            declared: 1,
            computed: 2,
        };
        assert_eq!(crc.result_code(), ResultCode::DataCrcError);
        assert_eq!(
            ProtocolError::InvalidHeaderLength { expected: 11, got: 9 }.result_code(),
            ResultCode::IncorrectHeaderForm
        );
        assert_eq!(ProtocolError::Encrypted(1).result_code(), ResultCode::DecryptError);
    }

    #[test]
    fn test_close_connection() {
        assert!(Error::ConnectionTimeout.should_close_connection());
        assert!(Error::from(ProtocolError::InvalidMarker(0x02)).should_close_connection());
        assert!(!Error::from(PipelineError::QueueClosed).should_close_connection());
        assert!(!Error::from(ProtocolError::Compressed).should_close_connection());
    }
}
