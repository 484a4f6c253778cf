//! In-process shared-medium simulator.
//!
//! `SimChannel` models the broadcast medium; each [`SimChannel::attach`]
//! hands back a [`SimRadio`] implementing the [`Radio`] port. Supports the
//! fault injection the MAC's failure paths need: dropping frames by type
//! (lost-ACK runs), truncating writes (collisions), and seizing the medium
//! (busy-channel runs). Every accepted transmission is recorded with the
//! medium clock for timing assertions.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;
use parking_lot::Mutex;

use crate::packet::FrameType;
use crate::timer::{SystemTimer, Timer};
use crate::{Radio, Ts};

/// Timing constants a [`SimRadio`] reports through the [`Radio`] port
#[derive(Debug, Clone, PartialEq)]
pub struct RadioParams {
    pub slot_time: Ts,
    pub sifs: Ts,
    pub cw_min: Ts,
    pub cw_max: Ts,
    pub retry_limit: u32,
    /// How long one transmission occupies the medium
    pub air_time: Ts,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            slot_time: 200,
            sifs: 100,
            cw_min: 3,
            cw_max: 31,
            retry_limit: 5,
            air_time: 40,
        }
    }
}

/// One accepted transmission: medium clock plus the bytes that made it out
#[derive(Debug, Clone)]
pub struct TxRecord {
    pub time: Ts,
    pub bytes: Vec<u8>,
}

struct ChannelInner {
    timer: Box<dyn Timer + Send + Sync>,
    /// Medium is in use until this instant
    busy_until: Mutex<Ts>,
    ports: Mutex<Vec<Sender<Vec<u8>>>>,
    dropped_types: Mutex<Vec<FrameType>>,
    /// Truncate the next N transmissions to `truncate_len` bytes
    truncate_count: AtomicUsize,
    truncate_len: AtomicUsize,
    log: Mutex<Vec<TxRecord>>,
}

/// Shared broadcast medium
#[derive(Clone)]
pub struct SimChannel {
    inner: Arc<ChannelInner>,
}

impl SimChannel {
    pub fn new() -> Self {
        Self::with_timer(SystemTimer::new())
    }

    /// Drive the medium clock from an injected timer (mock timers make the
    /// MAC state machines fully deterministic under test)
    pub fn with_timer<T: Timer + Send + Sync + 'static>(timer: T) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                timer: Box::new(timer),
                busy_until: Mutex::new(0),
                ports: Mutex::new(Vec::new()),
                dropped_types: Mutex::new(Vec::new()),
                truncate_count: AtomicUsize::new(0),
                truncate_len: AtomicUsize::new(0),
                log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach a radio to the medium
    pub fn attach(&self, params: RadioParams) -> SimRadio {
        let (tx, rx) = unbounded();
        let mut ports = self.inner.ports.lock();
        ports.push(tx);

        SimRadio {
            channel: self.inner.clone(),
            port: ports.len() - 1,
            rx,
            params,
        }
    }

    /// Silently drop all frames of the given type
    pub fn drop_frames(&self, frame_type: FrameType) {
        self.inner.dropped_types.lock().push(frame_type);
    }

    /// Accept only `len` bytes of each of the next `count` transmissions
    pub fn truncate_transmits(&self, count: usize, len: usize) {
        self.inner.truncate_len.store(len, Ordering::SeqCst);
        self.inner.truncate_count.store(count, Ordering::SeqCst);
    }

    /// Occupy the medium for the next `duration` milliseconds
    pub fn seize(&self, duration: Ts) {
        let now = self.inner.timer.ticks_ms();
        let mut busy = self.inner.busy_until.lock();
        *busy = (*busy).max(now + duration);
    }

    /// Medium clock, shared by every attached radio
    pub fn clock(&self) -> Ts {
        self.inner.timer.ticks_ms()
    }

    /// All accepted transmissions so far
    pub fn transmit_log(&self) -> Vec<TxRecord> {
        self.inner.log.lock().clone()
    }

    /// Detach every radio; blocked `receive` calls return `None`
    pub fn shutdown(&self) {
        self.inner.ports.lock().clear();
    }
}

impl Default for SimChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// A radio attached to a [`SimChannel`]
pub struct SimRadio {
    channel: Arc<ChannelInner>,
    port: usize,
    rx: Receiver<Vec<u8>>,
    params: RadioParams,
}

impl Radio for SimRadio {
    fn transmit(&self, frame: &[u8]) -> usize {
        let now = self.channel.timer.ticks_ms();

        let mut accepted = frame.len();
        if self.channel.truncate_count.load(Ordering::SeqCst) > 0 {
            self.channel.truncate_count.fetch_sub(1, Ordering::SeqCst);
            accepted = accepted.min(self.channel.truncate_len.load(Ordering::SeqCst));
        }

        self.channel.log.lock().push(TxRecord {
            time: now,
            bytes: frame[..accepted].to_vec(),
        });

        // Even a mangled transmission occupies the medium
        {
            let mut busy = self.channel.busy_until.lock();
            *busy = (*busy).max(now + self.params.air_time);
        }

        if accepted < frame.len() {
            trace!("Truncated transmission, {} of {} bytes", accepted, frame.len());
            return accepted;
        }

        let dropped = self
            .channel
            .dropped_types
            .lock()
            .iter()
            .any(|t| *t as u8 == frame[0] >> 5);
        if dropped {
            trace!("Dropping frame on the floor per fault injection");
            return accepted;
        }

        let ports = self.channel.ports.lock();
        for (i, port) in ports.iter().enumerate() {
            if i != self.port {
                let _ = port.send(frame.to_vec());
            }
        }

        accepted
    }

    fn receive(&self) -> Option<Vec<u8>> {
        self.rx.recv().ok()
    }

    fn in_use(&self) -> bool {
        self.channel.timer.ticks_ms() < *self.channel.busy_until.lock()
    }

    fn idle_time(&self) -> Ts {
        let now = self.channel.timer.ticks_ms();
        (now - *self.channel.busy_until.lock()).max(0)
    }

    fn clock(&self) -> Ts {
        self.channel.timer.ticks_ms()
    }

    fn slot_time(&self) -> Ts {
        self.params.slot_time
    }

    fn sifs(&self) -> Ts {
        self.params.sifs
    }

    fn cw_min(&self) -> Ts {
        self.params.cw_min
    }

    fn cw_max(&self) -> Ts {
        self.params.cw_max
    }

    fn retry_limit(&self) -> u32 {
        self.params.retry_limit
    }
}
