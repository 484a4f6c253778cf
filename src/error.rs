//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use thiserror::Error;

/// Frame decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Shorter than header + CRC
    #[error("frame too short ({len} bytes)")]
    TooShort { len: usize },

    /// Stored CRC does not match the recomputed one
    #[error("CRC mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    CrcMismatch { stored: u32, computed: u32 },

    /// Control field carries a type code outside DATA/ACK/BEACON
    #[error("unknown frame type {0}")]
    UnknownType(u8),

    /// Payload exceeds the per-frame maximum
    #[error("payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
}

/// Link layer status codes, reported through [`crate::mac::LinkLayer::status`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    /// Initial value if initialization succeeds
    Success = 1,
    /// General error code
    UnspecifiedError = 2,
    /// Attempt to initialize the radio failed
    RfInitFailed = 3,
    /// Last transmission was acknowledged
    TxDelivered = 4,
    /// Last transmission was abandoned after unsuccessful delivery attempts
    TxFailed = 5,
    /// Buffer size was negative
    BadBufSize = 6,
    /// Pointer to a buffer or address was null
    BadAddress = 7,
    /// Illegal MAC address was specified
    BadMacAddress = 8,
    /// One or more arguments are invalid
    IllegalArgument = 9,
    /// Outgoing transmission rejected due to insufficient buffer space
    InsufficientBufferSpace = 10,
}

impl From<Status> for i32 {
    fn from(s: Status) -> i32 {
        s as i32
    }
}
