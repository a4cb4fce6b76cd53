//! # dctk-proto
//!
//! Wire codecs for the two Direct Connect dialects.
//!
//! This crate provides:
//! - Typed message enums for the NMDC text protocol and the ADC token
//!   protocol, with grammar parse/emit and an `Unhandled` carry-through
//! - The NMDC lock→key derivation
//! - The [`DcReader`]/[`DcWriter`] framing pair over a byte stream:
//!   `|`-terminated lines, raw binary mode for transfers, and toggleable
//!   streaming zlib on both directions

pub mod adc;
pub mod conn;
pub mod nmdc;

pub use adc::{AdcBody, AdcMessage, AdcRoute, AdcSearch, AdcSearchResult, AdcStatus};
pub use conn::{split, DcReader, DcWriter, Frame, ProtoKind, DELIMITER};
pub use nmdc::{
    nmdc_key, nmdc_key_raw, NmdcMessage, NmdcMyInfo, NmdcSearchQuery, NmdcSearchResult,
    SearchOrigin,
};

use thiserror::Error;

/// Maximum accepted length of a single protocol line.
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Protocol layer errors.
#[derive(Error, Debug)]
pub enum ProtoError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// A line could not be parsed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A line exceeded [`MAX_LINE_SIZE`].
    #[error("line too long: {0} bytes")]
    LineTooLong(usize),

    /// Streaming compression failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// A binary read was attempted past the declared transfer length.
    #[error("binary read past declared length")]
    BinaryOverrun,
}

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// A decoded protocol message of either dialect.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Nmdc(NmdcMessage),
    Adc(AdcMessage),
}
