//! 802.11~ frame codec.
//!
//! Wire layout, big-endian throughout:
//!
//! ```text
//! byte 0    TTTRSSSS   type (3 bits), retry (1 bit), seq high nibble
//! byte 1    SSSSSSSS   seq low byte
//! byte 2-3  destination address
//! byte 4-5  source address
//! ...       payload (0..=2038 bytes)
//! last 4    CRC-32 over all preceding bytes
//! ```
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::cmp::Ordering;
use core::convert::TryFrom;
use core::fmt;

use crate::error::FrameError;
use crate::Ts;

/// Maximum 12-bit sequence number
pub const MAX_SEQ_NUM: u16 = 4095;

/// Maximum payload bytes per frame
pub const MAX_DATA_BYTES: usize = 2038;

/// Control + destination + source
pub const HEADER_SIZE: usize = 6;

/// Trailing CRC-32
pub const CRC_SIZE: usize = 4;

/// Smallest valid frame (empty payload)
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + CRC_SIZE;

const CONTROL_SIZE: usize = 2;

/// Frame type codes carried in the top three bits of the control field
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    Ack = 1,
    Beacon = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, FrameError> {
        match v {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Ack),
            2 => Ok(FrameType::Beacon),
            _ => Err(FrameError::UnknownType(v)),
        }
    }
}

/// An 802.11~ frame with owned storage.
///
/// The encoded bytes are the single source of truth; accessors decode on the
/// fly and mutators rewrite the field then recompute the CRC, so a packet
/// handed to a queue is always internally consistent.
#[derive(Clone)]
pub struct Packet {
    bytes: Vec<u8>,
    /// Local timestamp at build / parse time, not part of the wire format.
    /// Drives outbound-ACK SIFS accounting and round-trip measurements.
    born_at: Ts,
}

impl Packet {
    /// Build a frame from its parts, CRC computed last
    pub fn new(
        frame_type: FrameType,
        dest: u16,
        src: u16,
        payload: &[u8],
        seq: u16,
        now: Ts,
    ) -> Result<Self, FrameError> {
        if payload.len() > MAX_DATA_BYTES {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }

        let mut bytes = vec![0u8; HEADER_SIZE + payload.len() + CRC_SIZE];

        bytes[0] = (frame_type as u8) << 5;
        bytes[2..4].copy_from_slice(&dest.to_be_bytes());
        bytes[4..6].copy_from_slice(&src.to_be_bytes());
        bytes[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);

        let mut p = Self { bytes, born_at: now };
        p.write_seq(seq);
        p.update_crc();

        Ok(p)
    }

    /// Parse received bytes into a frame, validating length and CRC
    pub fn parse(bytes: &[u8], now: Ts) -> Result<Self, FrameError> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(FrameError::TooShort { len: bytes.len() });
        }

        let p = Self {
            bytes: bytes.to_vec(),
            born_at: now,
        };

        let stored = p.crc();
        let computed = p.compute_crc();
        if stored != computed {
            return Err(FrameError::CrcMismatch { stored, computed });
        }

        // Reject reserved type codes up front so consumers only ever see
        // the three known kinds
        FrameType::try_from(p.bytes[0] >> 5)?;

        Ok(p)
    }

    /// Cheap destination extraction for early address filtering, avoids a
    /// full decode (and CRC pass) for traffic addressed elsewhere
    pub fn parse_dest(bytes: &[u8]) -> Option<u16> {
        if bytes.len() <= CONTROL_SIZE + 2 {
            return None;
        }
        Some(u16::from_be_bytes([bytes[2], bytes[3]]))
    }

    pub fn frame_type(&self) -> FrameType {
        // Valid by construction: checked in parse, set from the enum in new
        match self.bytes[0] >> 5 {
            0 => FrameType::Data,
            1 => FrameType::Ack,
            _ => FrameType::Beacon,
        }
    }

    pub fn is_beacon(&self) -> bool {
        self.frame_type() == FrameType::Beacon
    }

    pub fn is_retry(&self) -> bool {
        self.bytes[0] & 0x10 != 0
    }

    pub fn sequence_number(&self) -> u16 {
        (((self.bytes[0] & 0x0F) as u16) << 8) | self.bytes[1] as u16
    }

    pub fn dest_addr(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    pub fn src_addr(&self) -> u16 {
        u16::from_be_bytes([self.bytes[4], self.bytes[5]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..self.bytes.len() - CRC_SIZE]
    }

    pub fn crc(&self) -> u32 {
        let n = self.bytes.len() - CRC_SIZE;
        u32::from_be_bytes([
            self.bytes[n],
            self.bytes[n + 1],
            self.bytes[n + 2],
            self.bytes[n + 3],
        ])
    }

    /// Total encoded size in bytes
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Encoded wire bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Local timestamp captured when the frame was built or parsed
    pub fn born_at(&self) -> Ts {
        self.born_at
    }

    /// Set the retry flag, recomputing the CRC
    pub fn set_retry(&mut self, retry: bool) {
        if retry {
            self.bytes[0] |= 0x10;
        } else {
            self.bytes[0] &= !0x10;
        }
        self.update_crc();
    }

    /// Set the 12-bit sequence number, recomputing the CRC
    pub fn set_sequence_number(&mut self, seq: u16) {
        self.write_seq(seq);
        self.update_crc();
    }

    /// Replace the payload (resizing if needed), recomputing the CRC
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() > MAX_DATA_BYTES {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }

        let size = HEADER_SIZE + payload.len() + CRC_SIZE;
        if size != self.bytes.len() {
            let mut bytes = vec![0u8; size];
            bytes[..HEADER_SIZE].copy_from_slice(&self.bytes[..HEADER_SIZE]);
            self.bytes = bytes;
        }
        self.bytes[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
        self.update_crc();

        Ok(())
    }

    /// Inter-frame space for this frame's type: SIFS for ACKs,
    /// PIFS (SIFS + slot) for beacons, DIFS (SIFS + 2 slots) for data
    pub fn ifs(&self, sifs: Ts, slot_time: Ts) -> Ts {
        match self.frame_type() {
            FrameType::Ack => sifs,
            FrameType::Beacon => sifs + slot_time,
            FrameType::Data => sifs + 2 * slot_time,
        }
    }

    /// Contention priority: ACKs and beacons precede data frames
    pub fn priority(&self) -> u8 {
        match self.frame_type() {
            FrameType::Data => 1,
            _ => 0,
        }
    }

    /// Ordering for priority queues, lower [`Self::priority`] first
    pub fn compare(&self, other: &Packet) -> Ordering {
        self.priority().cmp(&other.priority())
    }

    fn write_seq(&mut self, seq: u16) {
        debug_assert!(seq <= MAX_SEQ_NUM);
        let seq = seq & MAX_SEQ_NUM;
        self.bytes[0] = (self.bytes[0] & 0xF0) | (seq >> 8) as u8;
        self.bytes[1] = (seq & 0xFF) as u8;
    }

    fn compute_crc(&self) -> u32 {
        crc32fast::hash(&self.bytes[..self.bytes.len() - CRC_SIZE])
    }

    fn update_crc(&mut self) {
        let crc = self.compute_crc().to_be_bytes();
        let n = self.bytes.len() - CRC_SIZE;
        self.bytes[n..].copy_from_slice(&crc);
    }
}

/// Equality over wire bytes only, the local timestamp is bookkeeping
impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Packet {}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.frame_type())
            .field("retry", &self.is_retry())
            .field("seq", &self.sequence_number())
            .field("src", &self.src_addr())
            .field("dest", &self.dest_addr())
            .field("payload_len", &self.payload().len())
            .field("crc", &format_args!("{:#010x}", self.crc()))
            .finish()
    }
}
