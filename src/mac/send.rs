//! CSMA/CA sender task.
//!
//! A single looping state machine that drains the outbound queues and races
//! the medium:
//!
//! ```text
//! WAIT_DATA -> WAIT_OPEN_CHANNEL -> WAIT_IFS -> WAIT_BACKOFF -> { WAIT_ACK | WAIT_DATA }
//!                   ^_______________________________________________|
//! ```
//!
//! Frame starts are aligned to [`FRAME_ALIGN`] boundaries; completions of
//! the IFS and backoff waits re-yield until the clock sits within
//! [`EPSILON`] of a boundary.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::clock::SyncClock;
use crate::error::Status;
use crate::packet::{FrameType, Packet, MAX_SEQ_NUM};
use crate::queue::PacketQueue;
use crate::timer::Timer;
use crate::{Radio, Ts};

use super::config::{LayerMode, LoggingConfig, EPSILON, FRAME_ALIGN};
use super::{HostStatus, NUM_RTT_PACKETS};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SendState {
    WaitData,
    WaitChannel,
    WaitIfs,
    WaitBackoff,
    WaitAck,
}

pub(crate) struct SendTask<R: Radio, T: Timer> {
    radio: R,
    clock: Arc<SyncClock<T>>,
    status: HostStatus,

    send_data: PacketQueue,
    send_ack: PacketQueue,
    recv_ack: PacketQueue,

    slot_policy: Arc<AtomicI32>,
    logging: LoggingConfig,
    shutdown: Arc<AtomicBool>,
    mode: LayerMode,

    state: SendState,
    packet: Option<Packet>,
    /// Oldest outbound ACK, held until its SIFS has elapsed
    pending_ack: Option<Packet>,
    /// Last issued sequence number per destination, sender-thread only
    last_seqs: HashMap<u16, u16>,
    last_event: Ts,

    try_count: u32,
    max_tries: u32,

    cw: Ts,
    backoff: Ts,
    ack_wait: Ts,

    // Radio constants, fetched once
    slot_time: Ts,
    sifs: Ts,
    cw_min: Ts,
    cw_max: Ts,

    idle_poll_ms: Ts,
    rng: SmallRng,
}

impl<R, T> SendTask<R, T>
where
    R: Radio,
    T: Timer,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        radio: R,
        clock: Arc<SyncClock<T>>,
        status: HostStatus,
        send_data: PacketQueue,
        send_ack: PacketQueue,
        recv_ack: PacketQueue,
        slot_policy: Arc<AtomicI32>,
        logging: LoggingConfig,
        shutdown: Arc<AtomicBool>,
        mode: LayerMode,
        idle_poll_ms: Ts,
        local_addr: u16,
    ) -> Self {
        let slot_time = radio.slot_time();
        let sifs = radio.sifs();
        let cw_min = radio.cw_min();
        let cw_max = radio.cw_max();
        // Tries, not retries: the initial attempt counts too
        let max_tries = radio.retry_limit() + 1;

        let ack_wait = match mode {
            LayerMode::Standard => clock.ack_wait_estimate(),
            LayerMode::RoundTripTest => clock.ack_wait_rtt_test(),
        };

        let mut task = Self {
            radio,
            clock,
            status,
            send_data,
            send_ack,
            recv_ack,
            slot_policy,
            logging,
            shutdown,
            mode,

            state: SendState::WaitData,
            packet: None,
            pending_ack: None,
            last_seqs: HashMap::new(),
            last_event: 0,

            try_count: 0,
            max_tries,

            cw: cw_min,
            backoff: 0,
            ack_wait,

            slot_time,
            sifs,
            cw_min,
            cw_max,

            idle_poll_ms,
            rng: SmallRng::seed_from_u64(local_addr as u64),
        };

        task.set_state(SendState::WaitData);
        info!("SendTask initialized (max tries {})", max_tries);
        task
    }

    pub(crate) fn run(mut self) {
        info!("SendTask running");
        while !self.shutdown.load(Ordering::SeqCst) {
            self.tick();
        }
        info!("SendTask interrupted");
    }

    /// One pass of the main loop
    pub(crate) fn tick(&mut self) {
        // 802.11 spec, Section 9.3.2.8: after successful reception of a
        // frame requiring acknowledgment, transmission of the ACK frame
        // commences after SIFS, without regard to the medium's busy state
        self.process_ack_queue();

        let elapsed = self.clock.time() - self.last_event;
        match self.state {
            SendState::WaitData => self.tick_wait_data(),
            SendState::WaitChannel => self.tick_wait_channel(),
            SendState::WaitIfs => self.tick_wait_ifs(elapsed),
            SendState::WaitBackoff => self.tick_wait_backoff(elapsed),
            SendState::WaitAck => self.tick_wait_ack(elapsed),
        }
    }

    fn tick_wait_data(&mut self) {
        let interval = self.clock.beacon_interval();
        let beacon_elapsed = self.clock.time() - self.clock.last_beacon_event();

        let mut packet = if interval >= 0 && beacon_elapsed >= interval {
            // The timestamp is refreshed again immediately before transmit,
            // there is no telling how long the contention wait will run
            Some(self.clock.generate_beacon())
        } else {
            // Poll for no longer than the beacon interval so the next
            // emission opportunity is not missed
            let wait = if interval >= 0 {
                interval
            } else {
                self.idle_poll_ms
            };
            self.send_data.poll(Duration::from_millis(wait.max(0) as u64))
        };

        if let Some(p) = packet.as_mut() {
            // Only data carries a fresh sequence number, ACK numbers echo
            // the frame they acknowledge
            if p.frame_type() == FrameType::Data {
                let seq = self.next_seq(p.dest_addr());
                p.set_sequence_number(seq);
            }
        }

        if let Some(p) = packet {
            self.try_count = 0;
            self.set_backoff(0, p.frame_type());
            self.packet = Some(p);
            self.set_state(SendState::WaitChannel);
        }
    }

    fn tick_wait_channel(&mut self) {
        if !self.radio.in_use() {
            self.set_state(SendState::WaitIfs);
        } else {
            self.sleepy_time();
        }
    }

    fn tick_wait_ifs(&mut self, elapsed: Ts) {
        let ifs = match &self.packet {
            Some(p) => p.ifs(self.sifs, self.slot_time),
            None => {
                self.set_state(SendState::WaitData);
                return;
            }
        };
        let time_left = ifs - elapsed;

        if self.radio.in_use() || self.radio.idle_time() < elapsed {
            self.set_state(SendState::WaitChannel);
        } else if time_left <= 0 {
            let time = self.clock.time();
            if time % FRAME_ALIGN > EPSILON {
                // Busy wait until the next alignment boundary
                return;
            }
            if self.logging.verbose() {
                debug!("Done waiting IFS at {}", time);
            }
            self.set_state(SendState::WaitBackoff);
        } else {
            self.sleepy_time();
        }
    }

    fn tick_wait_backoff(&mut self, elapsed: Ts) {
        let mut packet = match self.packet.take() {
            Some(p) => p,
            None => {
                self.set_state(SendState::WaitData);
                return;
            }
        };

        if self.radio.in_use() || self.radio.idle_time() < elapsed {
            // Someone jumped on. Freeze the remaining backoff so the next
            // pass resumes the countdown instead of redrawing
            let consumed = (elapsed - self.radio.idle_time()).clamp(0, self.backoff);
            self.backoff -= consumed;
            if self.logging.verbose() {
                debug!("Backoff frozen with {} ms remaining", self.backoff);
            }
            self.packet = Some(packet);
            self.set_state(SendState::WaitChannel);
            return;
        }

        if self.backoff - elapsed > 0 {
            self.packet = Some(packet);
            self.sleepy_time();
            return;
        }

        let time = self.clock.time();
        if time % FRAME_ALIGN > EPSILON {
            // Busy wait until the next alignment boundary
            self.packet = Some(packet);
            return;
        }
        if self.logging.verbose() {
            debug!("Done waiting backoff at {}", time);
        }

        if packet.is_beacon() {
            // Update the timestamp to the latest
            self.clock.update_beacon(&mut packet);
            // Check whether the channel was stolen while we repackaged
            if self.radio.in_use() {
                self.packet = Some(packet);
                self.set_state(SendState::WaitChannel);
                return;
            }
        }

        // Fire away
        info!(
            "Transmitting {:?} seq {} to {:#06x}, try {}",
            packet.frame_type(),
            packet.sequence_number(),
            packet.dest_addr(),
            self.try_count + 1
        );
        let bytes_sent = self.radio.transmit(packet.bytes());
        self.try_count += 1;

        if packet.is_beacon() {
            self.clock.on_beacon_transmit();
        }
        if self.mode == LayerMode::RoundTripTest && packet.frame_type() == FrameType::Data {
            self.clock.log_transmit_time(packet.sequence_number());
        }

        if bytes_sent < packet.size() {
            // The radio did not get the whole frame out. Treat it like a
            // collision, but skip WAIT_ACK: nothing will be acknowledged
            warn!(
                "Partial transmit ({} of {} bytes), retrying",
                bytes_sent,
                packet.size()
            );
            self.prepare_retry(&mut packet);
            self.packet = Some(packet);
            self.set_state(SendState::WaitChannel);
        } else if packet.frame_type() == FrameType::Data {
            self.packet = Some(packet);
            self.set_state(SendState::WaitAck);
        } else {
            // No retries for ACKs and beacons
            self.set_state(SendState::WaitData);
        }
    }

    fn tick_wait_ack(&mut self, elapsed: Ts) {
        let mut packet = match self.packet.take() {
            Some(p) => p,
            None => {
                self.set_state(SendState::WaitData);
                return;
            }
        };

        if self.try_count >= self.max_tries {
            // Give up
            debug!("Giving up on packet {}", packet.sequence_number());
            self.status.set(Status::TxFailed);
            self.set_state(SendState::WaitData);
        } else if self.received_ack_for(&packet) {
            debug!("Packet {} acknowledged", packet.sequence_number());
            self.status.set(Status::TxDelivered);

            if self.mode == LayerMode::RoundTripTest
                && packet.sequence_number() == NUM_RTT_PACKETS - 1
            {
                self.clock.process_rtt_results();
            }
            self.set_state(SendState::WaitData);
        } else if elapsed >= self.ack_wait {
            // No ACK, assume a collision and re-contend
            debug!("No ACK for packet {}", packet.sequence_number());
            self.prepare_retry(&mut packet);
            self.packet = Some(packet);
            self.set_state(SendState::WaitChannel);
        } else {
            self.packet = Some(packet);
            self.sleepy_time();
        }
    }

    /// Send the oldest outbound ACK once its SIFS has elapsed and the clock
    /// sits on an alignment boundary, bypassing the state machine entirely
    fn process_ack_queue(&mut self) {
        if self.pending_ack.is_none() {
            self.pending_ack = self.send_ack.try_take();
        }

        if let Some(ack) = &self.pending_ack {
            let now = self.clock.time();
            if now - ack.born_at() >= self.sifs && now % FRAME_ALIGN <= EPSILON {
                debug!("Sending ACK seq {}", ack.sequence_number());
                self.radio.transmit(ack.bytes());
                self.pending_ack = None;
            }
        }
    }

    /// Snapshot-drain the inbound ACK queue looking for a match; the sender
    /// is this queue's only consumer so the drain cannot race another pop
    fn received_ack_for(&self, packet: &Packet) -> bool {
        for ack in self.recv_ack.drain() {
            if ack.sequence_number() == packet.sequence_number()
                && ack.src_addr() == packet.dest_addr()
            {
                return true;
            }
        }
        false
    }

    fn prepare_retry(&mut self, packet: &mut Packet) {
        packet.set_retry(true);
        self.set_backoff(self.try_count, packet.frame_type());
    }

    /// Random backoff per 802.11 Sec 9.3.3: reset the contention window on
    /// fresh frames, double-plus-one on each retry, clamp to [CW_MIN, CW_MAX]
    fn set_backoff(&mut self, try_count: u32, frame_type: FrameType) {
        if frame_type == FrameType::Beacon {
            self.backoff = 0;
            return;
        }

        let new_cw = if try_count > 0 {
            self.cw * 2 + 1
        } else {
            self.cw_min
        };
        self.cw = new_cw.clamp(self.cw_min, self.cw_max);

        let slots = if self.slot_policy.load(Ordering::SeqCst) != 0 {
            // Debug override: deterministic worst-case slot selection
            self.cw
        } else {
            self.rng.gen_range(0..=self.cw)
        };
        self.backoff = slots * self.slot_time;
    }

    /// Next sequence number for a destination, wrapping past the 12-bit max
    fn next_seq(&mut self, dest: u16) -> u16 {
        let seq = match self.last_seqs.get(&dest) {
            Some(&last) if last < MAX_SEQ_NUM => last + 1,
            Some(_) => 0,
            None => 0,
        };
        self.last_seqs.insert(dest, seq);
        seq
    }

    fn set_state(&mut self, state: SendState) {
        let time = self.clock.time();
        // Frame starts align to the next boundary, so elapsed-time checks
        // in the wait states measure from a clean slot edge
        self.last_event = align_up(time);
        self.state = state;

        if self.logging.verbose() {
            match state {
                SendState::WaitData => debug!("Waiting for data"),
                SendState::WaitChannel => {
                    debug!("Waiting for open channel, try count {}", self.try_count)
                }
                SendState::WaitIfs => debug!("Waiting inter-frame space"),
                SendState::WaitBackoff => debug!("Waiting backoff of {} ms", self.backoff),
                SendState::WaitAck => debug!("Waiting {} ms for ACK", self.ack_wait),
            }
        }
    }

    fn sleepy_time(&self) {
        let ms = (self.slot_time / 10).max(1);
        thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Round up to the next frame-alignment boundary
fn align_up(time: Ts) -> Ts {
    let rem = time % FRAME_ALIGN;
    if rem == 0 {
        time
    } else {
        time + FRAME_ALIGN - rem
    }
}
