//! Receiver task.
//!
//! A single blocking loop: pull bytes off the radio, stamp the arrival time,
//! filter by destination, validate, then dispatch — ACKs to the sender's
//! inbound ACK queue, beacons to the clock, data up to the host (behind a
//! per-peer duplicate filter) with an ACK manufactured in return.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::clock::SyncClock;
use crate::packet::{FrameType, Packet, MAX_SEQ_NUM};
use crate::queue::PacketQueue;
use crate::timer::Timer;
use crate::{Radio, Ts, BROADCAST_ADDR};

use super::config::{LayerMode, LoggingConfig};

pub(crate) struct RecvTask<R: Radio, T: Timer> {
    radio: R,
    clock: Arc<SyncClock<T>>,

    recv_data: PacketQueue,
    recv_ack: PacketQueue,
    send_ack: PacketQueue,

    local_addr: u16,
    logging: LoggingConfig,
    shutdown: Arc<AtomicBool>,
    mode: LayerMode,

    /// Next expected sequence number per source, receiver-thread only.
    /// -1 marks a peer we have never heard from
    last_seqs: HashMap<u16, i32>,
}

impl<R, T> RecvTask<R, T>
where
    R: Radio,
    T: Timer,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        radio: R,
        clock: Arc<SyncClock<T>>,
        recv_data: PacketQueue,
        recv_ack: PacketQueue,
        send_ack: PacketQueue,
        local_addr: u16,
        logging: LoggingConfig,
        shutdown: Arc<AtomicBool>,
        mode: LayerMode,
    ) -> Self {
        info!("RecvTask initialized for {:#06x}", local_addr);
        Self {
            radio,
            clock,
            recv_data,
            recv_ack,
            send_ack,
            local_addr,
            logging,
            shutdown,
            mode,
            last_seqs: HashMap::new(),
        }
    }

    pub(crate) fn run(mut self) {
        info!("RecvTask running");
        while !self.shutdown.load(Ordering::SeqCst) {
            let bytes = match self.radio.receive() {
                Some(b) => b,
                None => break,
            };
            // Stamp arrival before any processing so consumption latency
            // cannot inflate observed beacon skew
            let recv_time = self.clock.time();
            self.handle_transmission(&bytes, recv_time);
        }
        info!("RecvTask interrupted");
    }

    fn handle_transmission(&mut self, bytes: &[u8], recv_time: Ts) {
        // Cheap destination parse first, most traffic is for someone else
        let dest = match Packet::parse_dest(bytes) {
            Some(d) => d,
            None => {
                debug!("Dropping runt transmission ({} bytes)", bytes.len());
                return;
            }
        };
        if dest != self.local_addr && dest != BROADCAST_ADDR {
            if self.logging.verbose() {
                debug!("Ignoring frame addressed to {:#06x}", dest);
            }
            return;
        }

        let packet = match Packet::parse(bytes, recv_time) {
            Ok(p) => p,
            Err(e) => {
                debug!("Dropping invalid frame: {}", e);
                return;
            }
        };

        match packet.frame_type() {
            FrameType::Ack => self.consume_ack(packet),
            FrameType::Beacon => self.consume_beacon(&packet, recv_time),
            FrameType::Data => self.consume_data(packet),
        }
    }

    fn consume_ack(&mut self, ack: Packet) {
        if self.logging.verbose() {
            debug!("Consuming ACK seq {}", ack.sequence_number());
        }
        if self.mode == LayerMode::RoundTripTest {
            self.clock.log_receive_time(ack.sequence_number());
        }
        self.recv_ack.put(ack);
    }

    fn consume_beacon(&mut self, beacon: &Packet, recv_time: Ts) {
        // The RTT harness wants an unsynchronized clock
        if self.mode == LayerMode::RoundTripTest {
            return;
        }
        self.clock.consume_beacon(beacon, recv_time);
    }

    fn consume_data(&mut self, packet: Packet) {
        let src = packet.src_addr();
        let seq = packet.sequence_number() as i32;
        let last = self.last_seqs.get(&src).copied().unwrap_or(-1);

        let max = MAX_SEQ_NUM as i32;
        let next_expected = if last >= max { 0 } else { last + 1 };
        // The frame following the 12-bit wrap is fresh, not a replay
        let duplicate = seq <= last && !(last == max && seq == 0);

        if duplicate {
            debug!("Duplicate data from {:#06x} seq {}, re-ACK only", src, seq);
        } else {
            if seq > next_expected {
                warn!(
                    "Sequence gap from {:#06x}: expected {}, got {}",
                    src, next_expected, seq
                );
            }

            // Drop-new if the host is not draining; the peer will retry
            if let Err(dropped) = self.recv_data.offer(packet.clone()) {
                warn!(
                    "Receive queue full, dropping data seq {}",
                    dropped.sequence_number()
                );
            }
            self.last_seqs.insert(src, next_expected);
        }

        // ACK either way: the sender keeps retrying until it hears one
        self.queue_ack(&packet);
    }

    /// Build an ACK echoing the frame's sequence number back at its source.
    /// A full outbound ACK queue blocks, backpressure beats a lost ACK
    fn queue_ack(&mut self, packet: &Packet) {
        let ack = Packet::new(
            FrameType::Ack,
            packet.src_addr(),
            self.local_addr,
            &[],
            packet.sequence_number(),
            self.clock.time(),
        );
        match ack {
            Ok(ack) => self.send_ack.put(ack),
            Err(e) => warn!("Failed to build ACK: {}", e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{RadioParams, SimChannel};
    use crate::timer::mock::MockTimer;

    const LOCAL: u16 = 0x0001;
    const PEER: u16 = 0x0002;

    struct Fixture {
        timer: MockTimer,
        recv_data: PacketQueue,
        recv_ack: PacketQueue,
        send_ack: PacketQueue,
        clock: Arc<SyncClock<MockTimer>>,
        task: RecvTask<crate::sim::SimRadio, MockTimer>,
    }

    fn fixture(mode: LayerMode) -> Fixture {
        let _ = simplelog::SimpleLogger::init(
            log::LevelFilter::Debug,
            simplelog::Config::default(),
        );

        let timer = MockTimer::new();
        let channel = SimChannel::with_timer(timer.clone());
        let radio = channel.attach(RadioParams::default());

        let clock = Arc::new(SyncClock::new(timer.clone(), LOCAL, 646, 200));
        let recv_data = PacketQueue::with_capacity(4);
        let recv_ack = PacketQueue::with_capacity(5);
        let send_ack = PacketQueue::with_capacity(5);

        let task = RecvTask::new(
            radio,
            clock.clone(),
            recv_data.clone(),
            recv_ack.clone(),
            send_ack.clone(),
            LOCAL,
            LoggingConfig::default(),
            Arc::new(AtomicBool::new(false)),
            mode,
        );

        Fixture {
            timer,
            recv_data,
            recv_ack,
            send_ack,
            clock,
            task,
        }
    }

    fn data(seq: u16, payload: &[u8]) -> Packet {
        Packet::new(FrameType::Data, LOCAL, PEER, payload, seq, 0).unwrap()
    }

    #[test]
    fn data_delivered_and_acked() {
        let mut f = fixture(LayerMode::Standard);
        let p = data(0, b"hi");

        f.timer.set_ms(70);
        f.task.handle_transmission(p.bytes(), 70);

        let delivered = f.recv_data.try_take().unwrap();
        assert_eq!(delivered.payload(), b"hi");
        assert_eq!(delivered.born_at(), 70);

        let ack = f.send_ack.try_take().unwrap();
        assert_eq!(ack.frame_type(), FrameType::Ack);
        assert_eq!(ack.sequence_number(), 0);
        assert_eq!(ack.dest_addr(), PEER);
        assert_eq!(ack.src_addr(), LOCAL);
    }

    #[test]
    fn duplicates_suppressed_but_acked() {
        let mut f = fixture(LayerMode::Standard);
        let p = data(5, b"once");

        f.task.handle_transmission(p.bytes(), 0);
        f.task.handle_transmission(p.bytes(), 1);

        // Delivered exactly once, acknowledged twice
        assert!(f.recv_data.try_take().is_some());
        assert!(f.recv_data.try_take().is_none());
        assert_eq!(f.send_ack.len(), 2);
    }

    #[test]
    fn stale_sequence_suppressed() {
        let mut f = fixture(LayerMode::Standard);

        for seq in 0..3 {
            f.task.handle_transmission(data(seq, b"a").bytes(), 0);
        }
        assert_eq!(f.recv_data.drain().len(), 3);

        // A replay from anywhere at or below the expectation is suppressed
        f.task.handle_transmission(data(1, b"b").bytes(), 0);
        assert!(f.recv_data.try_take().is_none());
        assert_eq!(f.send_ack.len(), 4);
    }

    #[test]
    fn gap_logged_but_delivered() {
        let mut f = fixture(LayerMode::Standard);

        f.task.handle_transmission(data(0, b"a").bytes(), 0);
        f.task.handle_transmission(data(5, b"b").bytes(), 0);

        assert_eq!(f.recv_data.len(), 2);
        assert_eq!(f.task.last_seqs[&PEER], 1);
    }

    #[test]
    fn wrap_is_not_a_duplicate() {
        let mut f = fixture(LayerMode::Standard);
        f.task.last_seqs.insert(PEER, MAX_SEQ_NUM as i32);

        f.task.handle_transmission(data(0, b"wrapped").bytes(), 0);
        assert!(f.recv_data.try_take().is_some());
        assert_eq!(f.task.last_seqs[&PEER], 0);
    }

    #[test]
    fn full_delivery_queue_drops_new_but_still_acks() {
        let mut f = fixture(LayerMode::Standard);

        for seq in 0..5 {
            f.task.handle_transmission(data(seq, &[seq as u8]).bytes(), 0);
        }

        // Queue holds four, the fifth was dropped on the floor
        assert_eq!(f.recv_data.len(), 4);
        for seq in 0..4 {
            assert_eq!(f.recv_data.try_take().unwrap().sequence_number(), seq);
        }
        // All five were acknowledged regardless
        assert_eq!(f.send_ack.len(), 5);
    }

    #[test]
    fn acks_routed_to_sender() {
        let mut f = fixture(LayerMode::Standard);
        let ack = Packet::new(FrameType::Ack, LOCAL, PEER, &[], 9, 0).unwrap();

        f.task.handle_transmission(ack.bytes(), 0);
        assert_eq!(f.recv_ack.try_take().unwrap().sequence_number(), 9);
        assert!(f.send_ack.is_empty());
    }

    #[test]
    fn beacon_rolls_clock() {
        let mut f = fixture(LayerMode::Standard);
        f.timer.set_ms(1000);

        let beacon = Packet::new(
            FrameType::Beacon,
            BROADCAST_ADDR,
            PEER,
            &5000i64.to_be_bytes(),
            0,
            0,
        )
        .unwrap();
        f.task.handle_transmission(beacon.bytes(), 1000);

        assert_eq!(f.clock.offset(), 4000);
        assert!(f.clock.time() >= 5000);
    }

    #[test]
    fn beacon_ignored_in_rtt_mode() {
        let mut f = fixture(LayerMode::RoundTripTest);

        let beacon = Packet::new(
            FrameType::Beacon,
            BROADCAST_ADDR,
            PEER,
            &5000i64.to_be_bytes(),
            0,
            0,
        )
        .unwrap();
        f.task.handle_transmission(beacon.bytes(), 0);

        assert_eq!(f.clock.offset(), 0);
    }

    #[test]
    fn rtt_mode_records_ack_arrival() {
        let mut f = fixture(LayerMode::RoundTripTest);

        f.timer.set_ms(100);
        f.clock.log_transmit_time(0);
        let ack = Packet::new(FrameType::Ack, LOCAL, PEER, &[], 0, 0).unwrap();
        f.timer.set_ms(400);
        f.task.handle_transmission(ack.bytes(), 400);

        assert_eq!(f.clock.process_rtt_results(), Some(300));
    }

    #[test]
    fn frames_for_others_dropped_early() {
        let mut f = fixture(LayerMode::Standard);
        let p = Packet::new(FrameType::Data, 0x0BAD, PEER, b"not ours", 0, 0).unwrap();

        f.task.handle_transmission(p.bytes(), 0);
        assert!(f.recv_data.is_empty());
        assert!(f.send_ack.is_empty());
    }

    #[test]
    fn broadcast_accepted() {
        let mut f = fixture(LayerMode::Standard);
        let p = Packet::new(FrameType::Data, BROADCAST_ADDR, PEER, b"all", 0, 0).unwrap();

        f.task.handle_transmission(p.bytes(), 0);
        assert!(f.recv_data.try_take().is_some());
    }

    #[test]
    fn corrupt_frames_dropped() {
        let mut f = fixture(LayerMode::Standard);
        let p = data(0, b"soon to be mangled");
        let mut bytes = p.bytes().to_vec();
        let n = bytes.len();
        bytes[n - 1] ^= 0xFF;

        f.task.handle_transmission(&bytes, 0);
        assert!(f.recv_data.is_empty());
        assert!(f.send_ack.is_empty());

        // Runts are dropped before the CRC is even looked at
        f.task.handle_transmission(&bytes[..4], 0);
        assert!(f.recv_data.is_empty());
    }
}
