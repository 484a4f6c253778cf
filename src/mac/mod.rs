//! Medium Access Control (MAC) layer module.
//! Contains the upper-layer [`LinkLayer`] surface and the sender / receiver
//! tasks it runs on their own OS threads.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::clock::SyncClock;
use crate::error::Status;
use crate::packet::{FrameType, Packet, MAX_DATA_BYTES};
use crate::queue::PacketQueue;
use crate::timer::Timer;
use crate::{Radio, Ts, BROADCAST_ADDR};

pub mod config;
pub use config::{LayerMode, LoggingConfig, MacConfig};

mod send;
use send::SendTask;

mod recv;
use recv::RecvTask;

/// Probe frames queued by the round-trip-time self-test
pub(crate) const NUM_RTT_PACKETS: u16 = 25;

/// Destination the round-trip-time probes are addressed to
pub const RTT_TEST_DEST: u16 = 602;

/// Shared host status word: written by the sender, read by the upper layer
#[derive(Clone, Debug)]
pub struct HostStatus(Arc<AtomicI32>);

impl HostStatus {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicI32::new(0)))
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, status: Status) {
        debug!("Status -> {:?}", status);
        self.0.store(status as i32, Ordering::SeqCst);
    }
}

/// An inbound datagram copied out to the upper layer
#[derive(Debug, Clone)]
pub struct Transmission {
    pub source_addr: u16,
    pub dest_addr: u16,
    pub buf: Vec<u8>,
}

impl Transmission {
    /// A transmission whose buffer accepts up to `capacity` bytes per recv
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            source_addr: 0,
            dest_addr: 0,
            buf: vec![0u8; capacity],
        }
    }
}

/// The 802.11~ link layer.
///
/// Owns the queue fabric and the synchronized clock, and runs the CSMA/CA
/// sender and the receive pipeline on their own threads against the given
/// radio. The upper layer calls in through [`send`](Self::send) /
/// [`recv`](Self::recv) / [`status`](Self::status) /
/// [`command`](Self::command).
pub struct LinkLayer<T: Timer> {
    local_addr: u16,
    mode: LayerMode,

    clock: Arc<SyncClock<T>>,
    status: HostStatus,
    logging: LoggingConfig,
    slot_policy: Arc<AtomicI32>,
    shutdown: Arc<AtomicBool>,

    send_data: PacketQueue,
    recv_data: PacketQueue,

    // Partially consumed inbound packet, carried across recv calls
    last_recv: Option<Packet>,
    last_recv_offset: usize,
}

impl<T> LinkLayer<T>
where
    T: Timer + Send + Sync + 'static,
{
    /// Bring up the layer: build the queue fabric and clock, spawn the
    /// sender and receiver threads, and (in RTT mode) queue the probes
    pub fn new<R>(local_addr: u16, config: MacConfig, radio: R, timer: T) -> Self
    where
        R: Radio + Clone + 'static,
    {
        let clock = Arc::new(SyncClock::new(
            timer,
            local_addr,
            config.rtt_estimate_ms,
            radio.slot_time(),
        ));
        clock.set_beacon_interval(config.beacon_interval_ms);

        let send_data = PacketQueue::with_capacity(config.send_data_capacity);
        let send_ack = PacketQueue::with_capacity(config.send_ack_capacity);
        let recv_data = PacketQueue::with_capacity(config.recv_data_capacity);
        let recv_ack = PacketQueue::with_capacity(config.recv_ack_capacity);

        let status = HostStatus::new();
        let logging = LoggingConfig::default();
        let slot_policy = Arc::new(AtomicI32::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let recv_task = RecvTask::new(
            radio.clone(),
            clock.clone(),
            recv_data.clone(),
            recv_ack.clone(),
            send_ack.clone(),
            local_addr,
            logging.clone(),
            shutdown.clone(),
            config.mode,
        );

        let send_task = SendTask::new(
            radio,
            clock.clone(),
            status.clone(),
            send_data.clone(),
            send_ack,
            recv_ack,
            slot_policy.clone(),
            logging.clone(),
            shutdown.clone(),
            config.mode,
            config.idle_poll_ms,
            local_addr,
        );

        let mut spawn_ok = true;
        if let Err(e) = thread::Builder::new()
            .name("dot11-recv".into())
            .spawn(move || recv_task.run())
        {
            error!("Failed to spawn receiver: {}", e);
            spawn_ok = false;
        }
        if let Err(e) = thread::Builder::new()
            .name("dot11-send".into())
            .spawn(move || send_task.run())
        {
            error!("Failed to spawn sender: {}", e);
            spawn_ok = false;
        }

        if spawn_ok {
            status.set(Status::Success);
        } else {
            status.set(Status::RfInitFailed);
        }

        let layer = Self {
            local_addr,
            mode: config.mode,
            clock,
            status,
            logging,
            slot_policy,
            shutdown,
            send_data,
            recv_data,
            last_recv: None,
            last_recv_offset: 0,
        };

        if layer.mode == LayerMode::RoundTripTest {
            layer.queue_rtt_packets();
        }

        layer
    }

    /// Queue `len` bytes for `dest`, split across frames as needed.
    ///
    /// Returns the bytes queued, or -1 with the status word set on argument
    /// errors or an already-full outbound queue.
    pub fn send(&self, dest: u16, data: &[u8], len: i32) -> i32 {
        // The RTT harness owns the outbound queue
        if self.mode != LayerMode::Standard {
            return 0;
        }

        if len < 0 {
            self.status.set(Status::BadBufSize);
            return -1;
        }
        let len = len as usize;
        if data.len() < len {
            self.status.set(Status::IllegalArgument);
            return -1;
        }
        if self.send_data.is_full() {
            self.status.set(Status::InsufficientBufferSpace);
            return -1;
        }

        debug!("Queueing {} bytes to {:#06x}", len, dest);

        // Broadcast from above is wrapped as a beacon, anything else is data
        let frame_type = if dest == BROADCAST_ADDR {
            FrameType::Beacon
        } else {
            FrameType::Data
        };

        let mut queued = 0;
        while queued < len {
            let chunk = (len - queued).min(MAX_DATA_BYTES);
            let packet = match Packet::new(
                frame_type,
                dest,
                self.local_addr,
                &data[queued..queued + chunk],
                0,
                self.clock.time(),
            ) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Failed to build outbound frame: {}", e);
                    self.status.set(Status::UnspecifiedError);
                    return -1;
                }
            };

            if self.send_data.offer(packet).is_err() {
                warn!("Send queue filled mid-batch, {} of {} bytes queued", queued, len);
                self.status.set(Status::InsufficientBufferSpace);
                return queued as i32;
            }
            queued += chunk;
        }

        queued as i32
    }

    /// Block until inbound data is available and copy it into `t.buf`.
    ///
    /// A payload larger than the buffer is handed out across successive
    /// calls. Returns the bytes copied, or 0 on shutdown.
    pub fn recv(&mut self, t: &mut Transmission) -> i32 {
        if self.last_recv.is_none() {
            info!("recv() waiting for queued data");
            self.last_recv = loop {
                if self.shutdown.load(Ordering::SeqCst) {
                    return 0;
                }
                if let Some(p) = self.recv_data.poll(Duration::from_millis(50)) {
                    break Some(p);
                }
            };
            self.last_recv_offset = 0;
        }

        let packet = match &self.last_recv {
            Some(p) => p,
            None => return 0,
        };

        t.source_addr = packet.src_addr();
        t.dest_addr = packet.dest_addr();

        let remaining = &packet.payload()[self.last_recv_offset..];
        let buf_len = t.buf.len();

        if remaining.len() <= buf_len {
            // The rest fits: hand it out and retire the packet
            t.buf[..remaining.len()].copy_from_slice(remaining);
            let n = remaining.len();
            self.last_recv = None;
            self.last_recv_offset = 0;
            n as i32
        } else {
            // Fill the buffer and keep the remainder for the next call
            t.buf.copy_from_slice(&remaining[..buf_len]);
            self.last_recv_offset += buf_len;
            buf_len as i32
        }
    }

    /// Current status code
    pub fn status(&self) -> i32 {
        self.status.get()
    }

    /// Option-setting command channel: 0 dumps settings, 1 sets the debug
    /// level, 2 the slot-selection policy, 3 the beacon interval (ms)
    pub fn command(&self, cmd: i32, val: i32) -> i32 {
        info!("Command {} with value {}", cmd, val);
        match cmd {
            0 => info!(
                "Current settings: debug level {}, slot selection policy {}, beacon interval {}",
                self.logging.level(),
                self.slot_policy.load(Ordering::SeqCst),
                self.clock.beacon_interval(),
            ),
            1 => self.logging.set_level(val),
            2 => self.slot_policy.store(val, Ordering::SeqCst),
            3 => self.clock.set_beacon_interval(val as Ts),
            _ => warn!("Unknown command {}", cmd),
        }
        0
    }

    /// Ask both tasks to exit at their next suspension point. In-flight
    /// frames are not retransmitted and queues are not drained
    pub fn shutdown(&self) {
        info!("Link layer shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Local MAC address
    pub fn local_addr(&self) -> u16 {
        self.local_addr
    }

    /// Synchronized clock reading, offset included
    pub fn clock_time(&self) -> Ts {
        self.clock.time()
    }

    /// Accumulated forward clock adjustment from peer beacons
    pub fn clock_offset(&self) -> Ts {
        self.clock.offset()
    }

    /// Queue the round-trip probes, blocking as the sender drains them
    fn queue_rtt_packets(&self) {
        for i in 0..NUM_RTT_PACKETS {
            match Packet::new(
                FrameType::Data,
                RTT_TEST_DEST,
                self.local_addr,
                &[i as u8],
                0,
                self.clock.time(),
            ) {
                Ok(p) => self.send_data.put(p),
                Err(e) => warn!("Failed to build RTT probe: {}", e),
            }
        }
        info!("Queued {} RTT probes", NUM_RTT_PACKETS);
    }
}
