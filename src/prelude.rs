//! 802.11~ MAC crate prelude
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

pub use crate::{Radio, Ts, BROADCAST_ADDR};

pub use crate::error::{FrameError, Status};

pub use crate::packet::{FrameType, Packet, MAX_DATA_BYTES, MAX_SEQ_NUM};

pub use crate::clock::SyncClock;

pub use crate::queue::PacketQueue;

pub use crate::timer::{SystemTimer, Timer as MacTimer};

pub use crate::mac::{LayerMode, LinkLayer, LoggingConfig, MacConfig, Transmission};

pub use crate::sim::{RadioParams, SimChannel, SimRadio};
