//! # Messages Module
//!
//! Core data structures for the fragmented messaging protocol.
//!
//! - **RadioMessage**: application-level pipe-delimited message that can
//!   span multiple fragments
//! - **RadioPacket**: one fixed-size on-air frame (a single cipher block)
//! - **PacketType** / **ParsedPacket**: the tagged wire-level sum the
//!   dispatcher routes on
//! - **ParsedMessage**: the decoded application grammar
//!
//! Fragmentation cuts a `RadioMessage` into `RadioPacket`s on send; the
//! reassembly table rebuilds the message from fragments on receive.

pub mod radio_message;
pub mod radio_packet;

pub use radio_message::{ParsedMessage, RadioMessage};
pub use radio_packet::{PacketType, RadioPacket, PRIORITY_HIGH, PRIORITY_NORMAL};

pub(crate) use radio_packet::ParsedPacket;
