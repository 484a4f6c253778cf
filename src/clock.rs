//! Synchronized logical clock and beacon service.
//!
//! A Lamport-style forward-only clock: local monotonic time plus an offset
//! that only ever increases, rolled forward whenever an inbound beacon
//! carries a peer time ahead of ours. Also owns beacon generation, the
//! transmit-latency ("fudge") estimator applied to outbound beacon
//! timestamps, and the ACK wait estimates used by the sender.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::packet::{FrameType, Packet};
use crate::timer::Timer;
use crate::{Ts, BROADCAST_ADDR};

/// Transmit-latency samples averaged into the beacon timestamp
const FUDGE_WINDOW: usize = 10;

/// Beacon payload: one big-endian i64 timestamp
const BEACON_PAYLOAD_LEN: usize = 8;

pub struct SyncClock<T: Timer> {
    timer: T,
    local_addr: u16,

    /// Round-trip estimate underlying the ACK wait, measured empirically
    /// against the reference radio
    rtt_estimate_ms: Ts,
    slot_time_ms: Ts,

    /// Only ever increases, the clock never runs backward
    offset_ms: AtomicI64,
    /// Negative disables beacon emission
    beacon_interval_ms: AtomicI64,
    last_beacon_event_ms: AtomicI64,
    beacon_updated_at_ms: AtomicI64,

    fudge: Mutex<FudgeRing>,
    rtt_table: Mutex<HashMap<u16, RttSample>>,
}

#[derive(Default)]
struct FudgeRing {
    samples: [Ts; FUDGE_WINDOW],
    filled: usize,
    next: usize,
}

impl FudgeRing {
    fn push(&mut self, sample: Ts) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % FUDGE_WINDOW;
        if self.filled < FUDGE_WINDOW {
            self.filled += 1;
        }
    }

    fn mean(&self) -> Ts {
        if self.filled == 0 {
            return 0;
        }
        self.samples[..self.filled].iter().sum::<Ts>() / self.filled as Ts
    }
}

#[derive(Debug, Default, Copy, Clone)]
struct RttSample {
    sent: Option<Ts>,
    received: Option<Ts>,
}

impl<T: Timer> SyncClock<T> {
    pub fn new(timer: T, local_addr: u16, rtt_estimate_ms: Ts, slot_time_ms: Ts) -> Self {
        let now = timer.ticks_ms();
        Self {
            timer,
            local_addr,
            rtt_estimate_ms,
            slot_time_ms,
            offset_ms: AtomicI64::new(0),
            beacon_interval_ms: AtomicI64::new(-1),
            last_beacon_event_ms: AtomicI64::new(now),
            beacon_updated_at_ms: AtomicI64::new(now),
            fudge: Mutex::new(FudgeRing::default()),
            rtt_table: Mutex::new(HashMap::new()),
        }
    }

    /// Offset-adjusted monotonic milliseconds. Thread-safe, nonblocking
    pub fn time(&self) -> Ts {
        self.timer.ticks_ms() + self.offset_ms.load(Ordering::SeqCst)
    }

    pub fn offset(&self) -> Ts {
        self.offset_ms.load(Ordering::SeqCst)
    }

    /// Negative disables beacons
    pub fn set_beacon_interval(&self, interval_ms: Ts) {
        info!("Beacon interval set to {} ms", interval_ms);
        self.beacon_interval_ms.store(interval_ms, Ordering::SeqCst);
    }

    pub fn beacon_interval(&self) -> Ts {
        self.beacon_interval_ms.load(Ordering::SeqCst)
    }

    /// Time of the most recent beacon emission event
    pub fn last_beacon_event(&self) -> Ts {
        self.last_beacon_event_ms.load(Ordering::SeqCst)
    }

    /// How long the sender waits on an ACK before declaring a collision
    pub fn ack_wait_estimate(&self) -> Ts {
        self.rtt_estimate_ms + self.slot_time_ms
    }

    /// ACK wait in round-trip-test mode, long enough that retries never
    /// contaminate the measurement
    pub fn ack_wait_rtt_test(&self) -> Ts {
        10 * self.rtt_estimate_ms
    }

    /// Build a beacon carrying the current time.
    ///
    /// Mostly a placeholder to channel through the usual sending logic:
    /// there is no telling how long the contention wait will be, so the
    /// payload is rewritten by [`Self::update_beacon`] just before the
    /// frame hits the wire.
    pub fn generate_beacon(&self) -> Packet {
        let now = self.time();
        Packet::new(
            FrameType::Beacon,
            BROADCAST_ADDR,
            self.local_addr,
            &now.to_be_bytes(),
            0,
            now,
        )
        .expect("beacon payload is 8 bytes")
    }

    /// Rewrite a beacon's timestamp to now plus the transmit-latency
    /// estimate, immediately before transmission
    pub fn update_beacon(&self, beacon: &mut Packet) {
        let now = self.time();
        let stamped = now + self.transmit_fudge();

        beacon
            .set_payload(&stamped.to_be_bytes())
            .expect("beacon payload is 8 bytes");

        self.beacon_updated_at_ms.store(now, Ordering::SeqCst);
        self.last_beacon_event_ms.store(now, Ordering::SeqCst);
        debug!("Beacon updated at {} ms (stamped {} ms)", now, stamped);
    }

    /// Record the packaged-to-wire latency of the beacon that just left
    pub fn on_beacon_transmit(&self) {
        let elapsed = self.time() - self.beacon_updated_at_ms.load(Ordering::SeqCst);
        let mut fudge = self.fudge.lock();
        fudge.push(elapsed);
        debug!(
            "Beacon transmit took {} ms (fudge now {} ms)",
            elapsed,
            fudge.mean()
        );
    }

    /// Moving average of the last [`FUDGE_WINDOW`] packaged-to-wire delays
    pub fn transmit_fudge(&self) -> Ts {
        self.fudge.lock().mean()
    }

    /// Roll the clock forward if a peer's beacon is ahead of us.
    ///
    /// `received_at` must be captured before any frame processing so that
    /// consumption latency does not inflate the observed skew. Returns the
    /// applied adjustment (zero when the peer is behind).
    pub fn consume_beacon(&self, beacon: &Packet, received_at: Ts) -> Ts {
        let payload = beacon.payload();
        if payload.len() < BEACON_PAYLOAD_LEN {
            warn!("Discarding beacon with {} byte payload", payload.len());
            return 0;
        }

        let mut raw = [0u8; BEACON_PAYLOAD_LEN];
        raw.copy_from_slice(&payload[..BEACON_PAYLOAD_LEN]);
        let peer_time = Ts::from_be_bytes(raw);

        let diff = peer_time - received_at;
        if diff > 0 {
            self.offset_ms.fetch_add(diff, Ordering::SeqCst);
            info!(
                "Beacon from {:#06x} ahead by {} ms, clock rolled forward",
                beacon.src_addr(),
                diff
            );
            return diff;
        }

        0
    }

    // Round-trip-test bookkeeping

    pub fn log_transmit_time(&self, seq: u16) {
        let now = self.time();
        self.rtt_table.lock().entry(seq).or_default().sent = Some(now);
    }

    pub fn log_receive_time(&self, seq: u16) {
        let now = self.time();
        self.rtt_table.lock().entry(seq).or_default().received = Some(now);
    }

    /// Mean round-trip over the completed probe pairs, logged and returned
    pub fn process_rtt_results(&self) -> Option<Ts> {
        let table = self.rtt_table.lock();
        let samples: Vec<Ts> = table
            .values()
            .filter_map(|s| match (s.sent, s.received) {
                (Some(tx), Some(rx)) => Some(rx - tx),
                _ => None,
            })
            .collect();

        if samples.is_empty() {
            warn!("RTT test finished with no complete samples");
            return None;
        }

        let mean = samples.iter().sum::<Ts>() / samples.len() as Ts;
        info!(
            "RTT test complete: {} samples, mean {} ms",
            samples.len(),
            mean
        );
        Some(mean)
    }
}
