//! 802.11~ CSMA/CA Medium Access Control layer.
//! Sits between a byte-oriented physical radio and an upper layer exchanging
//! addressed datagrams, providing carrier sense, randomized backoff,
//! acknowledgement / retry, and beacon-based clock synchronization.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

pub mod timer;

pub mod packet;

pub mod clock;

pub mod queue;

pub mod error;

pub mod mac;

pub mod sim;

pub mod prelude;

/// Timestamps are 64-bit signed milliseconds, signed so that clock offsets
/// and countdown arithmetic can go negative without wrapping
pub type Ts = i64;

/// Broadcast / beacon address
pub const BROADCAST_ADDR: u16 = 0xFFFF;

/// Radio interface, the opaque physical layer beneath the MAC.
///
/// `transmit` is synchronous and reports how many bytes the radio accepted,
/// `receive` blocks until a transmission arrives (or the radio is shut down).
/// Implementations are assumed internally thread-safe: the sender task holds
/// the radio during transmit and the receiver task during receive.
pub trait Radio: Send + Sync {
    /// Transmit a frame, returning the number of bytes accepted
    fn transmit(&self, frame: &[u8]) -> usize;

    /// Block until a transmission arrives, `None` if the radio was shut down
    fn receive(&self) -> Option<Vec<u8>>;

    /// Check whether the medium is currently in use
    fn in_use(&self) -> bool;

    /// Milliseconds the medium has been idle
    fn idle_time(&self) -> Ts;

    /// Radio-local monotonic clock in milliseconds
    fn clock(&self) -> Ts;

    /// Contention slot time in milliseconds
    fn slot_time(&self) -> Ts {
        200
    }

    /// Short inter-frame space in milliseconds
    fn sifs(&self) -> Ts {
        100
    }

    /// Minimum contention window
    fn cw_min(&self) -> Ts {
        3
    }

    /// Maximum contention window
    fn cw_max(&self) -> Ts {
        31
    }

    /// dot11RetryLimit, attempts beyond the first before a frame is abandoned
    fn retry_limit(&self) -> u32 {
        5
    }
}

impl<R: Radio + ?Sized> Radio for std::sync::Arc<R> {
    fn transmit(&self, frame: &[u8]) -> usize {
        (**self).transmit(frame)
    }

    fn receive(&self) -> Option<Vec<u8>> {
        (**self).receive()
    }

    fn in_use(&self) -> bool {
        (**self).in_use()
    }

    fn idle_time(&self) -> Ts {
        (**self).idle_time()
    }

    fn clock(&self) -> Ts {
        (**self).clock()
    }

    fn slot_time(&self) -> Ts {
        (**self).slot_time()
    }

    fn sifs(&self) -> Ts {
        (**self).sifs()
    }

    fn cw_min(&self) -> Ts {
        (**self).cw_min()
    }

    fn cw_max(&self) -> Ts {
        (**self).cw_max()
    }

    fn retry_limit(&self) -> u32 {
        (**self).retry_limit()
    }
}
