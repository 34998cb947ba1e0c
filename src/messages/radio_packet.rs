//! # Radio Packet Module
//!
//! Low-level fragment structure for radio transmission and reception.
//!
//! ## Wire Format
//!
//! Every on-air frame is exactly [`RADIO_PACKET_SIZE`] bytes, the ciphertext
//! of one cipher block. Plaintext layout:
//!
//! - Byte 0: packet type in the low nibble, priority class in the high nibble
//! - Bytes 1-2: message id (big-endian u16)
//! - Byte 3: fragment index (0-based)
//! - Byte 4: total fragment count for the message
//! - Bytes 5-15: payload, zero-filled after the last data byte
//!
//! The payload carries no explicit length; receivers scan from byte 5 and
//! stop at the first zero byte. Application payload therefore must not
//! contain interior NUL bytes — a NUL truncates the fragment on reassembly.
//! This is kept for wire compatibility with deployed nodes.
//!
//! ## Packet Types
//!
//! Only two types exist on the wire: [`PacketType::TextFragment`] carrying a
//! slice of an application message, and [`PacketType::AckConfirm`]
//! acknowledging a fully reassembled message. A confirm optionally carries
//! `|<deviceName>` in its body so the sender can tell who acknowledged;
//! receivers tolerate its absence.
//!
//! ## Design Considerations
//!
//! - **Public buffer**: `data` is public so radio device implementations can
//!   transmit and fill frames without copying.
//! - **Fixed size**: every frame is one full block, padded or not, so frame
//!   length never leaks payload length.

use crate::{FRAGMENT_DATA_SIZE, FRAGMENT_HEADER_SIZE, RADIO_PACKET_SIZE};

/// Normal delivery priority (high nibble of byte 0 left clear).
pub const PRIORITY_NORMAL: u8 = 0x00;

/// Elevated delivery priority. Preserved through the envelope but does not
/// change engine behavior.
pub const PRIORITY_HIGH: u8 = 0x10;

/// On-air packet types, stored in the low nibble of byte 0.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum PacketType {
    /// One fragment of a multi-fragment application message.
    TextFragment = 0x03,
    /// End-to-end acknowledgement of a completed message.
    AckConfirm = 0x08,
}

impl PacketType {
    fn from_nibble(nibble: u8) -> Option<PacketType> {
        match nibble {
            0x03 => Some(PacketType::TextFragment),
            0x08 => Some(PacketType::AckConfirm),
            _ => None,
        }
    }
}

/// Decoded view of a plaintext packet, borrowed from the packet buffer.
///
/// Inbound frames are decrypted in place and then classified into this sum;
/// the dispatcher routes on the variant instead of re-checking nibbles at
/// every call site.
#[cfg_attr(feature = "std", derive(Debug))]
pub(crate) enum ParsedPacket<'a> {
    TextFragment {
        message_id: u16,
        index: u8,
        total: u8,
        payload: &'a [u8],
    },
    AckConfirm {
        message_id: u16,
        /// Acknowledging node's name, when the confirm body carries one.
        sender: Option<&'a str>,
    },
}

/// One fixed-size radio frame.
///
/// Holds either plaintext (freshly built or freshly decrypted) or ciphertext
/// (ready to transmit); the envelope converts between the two in place.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RadioPacket {
    /// Raw frame buffer, always transmitted in full.
    pub data: [u8; RADIO_PACKET_SIZE],
}

impl RadioPacket {
    /// Builds a plaintext text fragment.
    ///
    /// `chunk` is the payload slice for this fragment and must fit the
    /// fragment body; the unused tail is zero-filled, which doubles as the
    /// receiver's payload terminator.
    pub(crate) fn new_text_fragment(priority: u8, message_id: u16, index: u8, total: u8, chunk: &[u8]) -> RadioPacket {
        debug_assert!(chunk.len() <= FRAGMENT_DATA_SIZE);
        let mut data = [0u8; RADIO_PACKET_SIZE];
        data[0] = (priority & 0xF0) | PacketType::TextFragment as u8;
        data[1..3].copy_from_slice(&message_id.to_be_bytes());
        data[3] = index;
        data[4] = total;
        let take = chunk.len().min(FRAGMENT_DATA_SIZE);
        data[FRAGMENT_HEADER_SIZE..FRAGMENT_HEADER_SIZE + take].copy_from_slice(&chunk[..take]);
        RadioPacket { data }
    }

    /// Builds a plaintext confirm for a completed message id.
    ///
    /// The body carries `|<device_name>` after the id bytes, clipped to the
    /// space left in the block.
    pub(crate) fn new_ack_confirm(message_id: u16, device_name: &str) -> RadioPacket {
        let mut data = [0u8; RADIO_PACKET_SIZE];
        data[0] = PacketType::AckConfirm as u8;
        data[1..3].copy_from_slice(&message_id.to_be_bytes());
        let name = device_name.as_bytes();
        if !name.is_empty() {
            data[3] = b'|';
            let take = name.len().min(RADIO_PACKET_SIZE - 4);
            data[4..4 + take].copy_from_slice(&name[..take]);
        }
        RadioPacket { data }
    }

    /// Extracts the packet type nibble from byte 0.
    pub fn packet_type(&self) -> u8 {
        self.data[0] & 0x0F
    }

    /// Extracts the priority class from the high nibble of byte 0.
    pub fn priority(&self) -> u8 {
        self.data[0] & 0xF0
    }

    /// Extracts the message id from bytes 1-2 (big-endian).
    pub fn message_id(&self) -> u16 {
        u16::from_be_bytes([self.data[1], self.data[2]])
    }

    /// Classifies a plaintext packet into its decoded form.
    ///
    /// Returns `None` for unknown type nibbles, which is also where frames
    /// decrypted with a mismatched key end up: they look like noise and are
    /// discarded at this boundary.
    pub(crate) fn parse(&self) -> Option<ParsedPacket<'_>> {
        match PacketType::from_nibble(self.packet_type())? {
            PacketType::TextFragment => {
                let payload_end = self.data[FRAGMENT_HEADER_SIZE..]
                    .iter()
                    .position(|&b| b == 0)
                    .map_or(RADIO_PACKET_SIZE, |i| FRAGMENT_HEADER_SIZE + i);
                Some(ParsedPacket::TextFragment {
                    message_id: self.message_id(),
                    index: self.data[3],
                    total: self.data[4],
                    payload: &self.data[FRAGMENT_HEADER_SIZE..payload_end],
                })
            }
            PacketType::AckConfirm => {
                let body_end = self.data[3..].iter().position(|&b| b == 0).map_or(RADIO_PACKET_SIZE, |i| 3 + i);
                let sender = match &self.data[3..body_end] {
                    [b'|', name @ ..] if !name.is_empty() => core::str::from_utf8(name).ok(),
                    _ => None,
                };
                Some(ParsedPacket::AckConfirm {
                    message_id: self.message_id(),
                    sender,
                })
            }
        }
    }
}
