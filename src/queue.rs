//! Bounded blocking queue fabric linking the MAC tasks and the upper layer.
//!
//! Thin wrapper over a crossbeam bounded channel: multi-producer with a
//! single-consumer discipline (by convention, the consuming task is the only
//! caller of `take`/`poll`/`drain` for a given queue).
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::packet::Packet;

#[derive(Clone)]
pub struct PacketQueue {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    capacity: usize,
}

impl PacketQueue {
    /// Create a queue holding at most `capacity` packets
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Blocking insert, waits for space
    pub fn put(&self, packet: Packet) {
        // Each handle holds both endpoints so the channel can never
        // disconnect while a handle is live
        let _ = self.tx.send(packet);
    }

    /// Non-blocking insert, hands the packet back if the queue is full
    pub fn offer(&self, packet: Packet) -> Result<(), Packet> {
        match self.tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(p)) | Err(TrySendError::Disconnected(p)) => Err(p),
        }
    }

    /// Blocking remove
    pub fn take(&self) -> Option<Packet> {
        self.rx.recv().ok()
    }

    /// Remove, waiting at most `timeout`
    pub fn poll(&self, timeout: Duration) -> Option<Packet> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking remove
    pub fn try_take(&self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }

    /// Pop everything queued at this instant
    pub fn drain(&self) -> Vec<Packet> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rx.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::{FrameType, Packet};

    fn packet(seq: u16) -> Packet {
        Packet::new(FrameType::Data, 1, 2, &[], seq, 0).unwrap()
    }

    #[test]
    fn fifo_order() {
        let q = PacketQueue::with_capacity(4);
        for seq in 0..3 {
            q.put(packet(seq));
        }

        assert_eq!(q.len(), 3);
        for seq in 0..3 {
            assert_eq!(q.take().unwrap().sequence_number(), seq);
        }
    }

    #[test]
    fn offer_full() {
        let q = PacketQueue::with_capacity(2);
        assert!(q.offer(packet(0)).is_ok());
        assert!(q.offer(packet(1)).is_ok());
        assert!(q.is_full());

        let rejected = q.offer(packet(2)).unwrap_err();
        assert_eq!(rejected.sequence_number(), 2);
    }

    #[test]
    fn poll_times_out() {
        let q = PacketQueue::with_capacity(1);
        assert!(q.poll(Duration::from_millis(10)).is_none());

        q.put(packet(7));
        assert_eq!(
            q.poll(Duration::from_millis(10)).unwrap().sequence_number(),
            7
        );
    }

    #[test]
    fn drain_snapshot() {
        let q = PacketQueue::with_capacity(5);
        for seq in 0..4 {
            q.put(packet(seq));
        }

        let drained = q.drain();
        assert_eq!(drained.len(), 4);
        assert!(q.is_empty());
        assert!(q.drain().is_empty());
    }
}
