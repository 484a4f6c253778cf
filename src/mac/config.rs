//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::Ts;

/// Transmissions initiate on multiples of this quantum, matching the
/// reference radio's own scheduling granularity
pub const FRAME_ALIGN: Ts = 50;

/// Slack allowed around a frame-alignment boundary
pub const EPSILON: Ts = 2;

/// Which mode the layer runs in
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LayerMode {
    /// Normal operation
    Standard,
    /// Self-test: queue round-trip probes and measure delivery latency
    RoundTripTest,
}

/// Configuration for the link layer
#[derive(Clone, PartialEq, Debug)]
pub struct MacConfig {
    /// Empirical round-trip estimate underlying the ACK wait, in
    /// milliseconds (measured at 646 against the reference radio)
    pub rtt_estimate_ms: Ts,

    /// Send-data poll period when beacons are disabled, in milliseconds
    pub idle_poll_ms: Ts,

    /// Initial beacon interval in milliseconds, negative disables beacons
    pub beacon_interval_ms: Ts,

    /// Outbound data queue depth
    pub send_data_capacity: usize,

    /// Outbound ACK queue depth
    pub send_ack_capacity: usize,

    /// Inbound data queue depth
    pub recv_data_capacity: usize,

    /// Inbound ACK queue depth
    pub recv_ack_capacity: usize,

    pub mode: LayerMode,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            rtt_estimate_ms: 646,
            idle_poll_ms: 100,
            beacon_interval_ms: -1,

            send_data_capacity: 4,
            send_ack_capacity: 5,
            recv_data_capacity: 4,
            recv_ack_capacity: 5,

            mode: LayerMode::Standard,
        }
    }
}

/// Shared debug-verbosity handle.
///
/// Replaces a process-global debug level: the command channel writes it and
/// both tasks consult their own copy, so nothing reaches for hidden state.
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    level: Arc<AtomicI32>,
}

impl LoggingConfig {
    pub fn new(level: i32) -> Self {
        Self {
            level: Arc::new(AtomicI32::new(level)),
        }
    }

    pub fn level(&self) -> i32 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn set_level(&self, level: i32) {
        self.level.store(level, Ordering::Relaxed);
    }

    /// Whether per-iteration debug output is wanted
    pub fn verbose(&self) -> bool {
        self.level() > 0
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(1)
    }
}
