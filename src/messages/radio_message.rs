//! # Radio Message Module
//!
//! Application-level message abstraction: the pipe-delimited ASCII strings
//! that fragments are cut from on send and concatenated back into on
//! reassembly.
//!
//! ## Grammar
//!
//! - Broadcast text: `MSG|<sender>|<body>`
//! - Directed text: `DMSG|<sender>|<recipient>|<body>`
//! - Position beacon: `BEACON|<sender>|<lat>,<lon>,<alt>,<speed>,<course>,<sats>`
//!
//! Unknown leading types still reassemble and are surfaced to the host as
//! `UNKNOWN`; the engine never drops a completed message for having a type
//! it does not recognize.
//!
//! ## Fragmentation
//!
//! A message of `len` bytes becomes `ceil(len / FRAGMENT_DATA_SIZE)`
//! fragments; fragment `i` carries the byte range
//! `[i * FRAGMENT_DATA_SIZE, min((i + 1) * FRAGMENT_DATA_SIZE, len))`.
//! An empty message yields zero fragments and is dropped at admission.

use core::fmt::{self, Write};

use crate::gps::GpsFix;
use crate::{FRAGMENT_DATA_SIZE, MAX_MESSAGE_SIZE};

/// Decoded view of an assembled message, borrowed from the message buffer.
#[cfg_attr(feature = "std", derive(Debug))]
pub enum ParsedMessage<'a> {
    Broadcast { sender: &'a str, body: &'a str },
    Directed { sender: &'a str, recipient: &'a str, body: &'a str },
    Beacon { sender: &'a str, telemetry: &'a str },
    Unknown { raw: &'a str },
}

/// One application message, at most [`MAX_MESSAGE_SIZE`] bytes.
///
/// Construction goes through the typed constructors so every outgoing
/// message carries well-formed grammar; reassembly rebuilds instances part
/// by part through `push_part`.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RadioMessage {
    payload: [u8; MAX_MESSAGE_SIZE],
    length: usize,
}

impl RadioMessage {
    pub(crate) const fn empty() -> Self {
        RadioMessage {
            payload: [0u8; MAX_MESSAGE_SIZE],
            length: 0,
        }
    }

    /// Composes a broadcast text message. Returns `None` when the composed
    /// string exceeds the message capacity.
    pub fn new_broadcast(sender: &str, body: &str) -> Option<RadioMessage> {
        let mut message = RadioMessage::empty();
        write!(message, "MSG|{}|{}", sender, body).ok()?;
        Some(message)
    }

    /// Composes a directed text message.
    pub fn new_directed(sender: &str, recipient: &str, body: &str) -> Option<RadioMessage> {
        let mut message = RadioMessage::empty();
        write!(message, "DMSG|{}|{}|{}", sender, recipient, body).ok()?;
        Some(message)
    }

    /// Composes a position beacon from a GPS fix.
    pub fn new_beacon(sender: &str, fix: &GpsFix) -> Option<RadioMessage> {
        let mut message = RadioMessage::empty();
        write!(
            message,
            "BEACON|{}|{:.6},{:.6},{:.2},{:.2},{:.0},{}",
            sender, fix.latitude, fix.longitude, fix.altitude, fix.speed, fix.course, fix.satellites
        )
        .ok()?;
        Some(message)
    }

    /// Appends one reassembled fragment payload.
    ///
    /// Fails when the concatenation would exceed the message capacity, which
    /// only happens for fragment counts the reassembly table already rejects.
    pub(crate) fn push_part(&mut self, part: &[u8]) -> Result<(), ()> {
        if self.length + part.len() > MAX_MESSAGE_SIZE {
            return Err(());
        }
        self.payload[self.length..self.length + part.len()].copy_from_slice(part);
        self.length += part.len();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload[..self.length]
    }

    /// Message bytes as text. Reassembled bytes are not guaranteed to be
    /// UTF-8 (a corrupted fragment decrypts to noise), so this yields the
    /// longest valid prefix rather than failing.
    pub fn as_str(&self) -> &str {
        let bytes = self.as_bytes();
        match core::str::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or(""),
        }
    }

    /// Number of fragments this message occupies on the air.
    pub fn fragment_count(&self) -> usize {
        self.length.div_ceil(FRAGMENT_DATA_SIZE)
    }

    /// Payload slice carried by fragment `index`.
    pub(crate) fn fragment_chunk(&self, index: usize) -> &[u8] {
        let start = index * FRAGMENT_DATA_SIZE;
        let end = (start + FRAGMENT_DATA_SIZE).min(self.length);
        &self.payload[start..end]
    }

    /// Splits the assembled string on the message grammar.
    pub fn parse(&self) -> ParsedMessage<'_> {
        let raw = self.as_str();
        let mut fields = raw.splitn(3, '|');
        let kind = fields.next().unwrap_or("");
        let sender = fields.next();
        let rest = fields.next();
        match (kind, sender, rest) {
            ("MSG", Some(sender), Some(body)) => ParsedMessage::Broadcast { sender, body },
            ("DMSG", Some(sender), Some(rest)) => match rest.split_once('|') {
                Some((recipient, body)) => ParsedMessage::Directed { sender, recipient, body },
                None => ParsedMessage::Unknown { raw },
            },
            ("BEACON", Some(sender), Some(telemetry)) => ParsedMessage::Beacon { sender, telemetry },
            _ => ParsedMessage::Unknown { raw },
        }
    }
}

impl Write for RadioMessage {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.length + s.len() > MAX_MESSAGE_SIZE {
            return Err(fmt::Error);
        }
        self.payload[self.length..self.length + s.len()].copy_from_slice(s.as_bytes());
        self.length += s.len();
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    fn fix() -> GpsFix {
        GpsFix {
            latitude: 12.3456,
            longitude: -78.9012,
            altitude: 5.0,
            speed: 0.0,
            course: 0.0,
            satellites: 7,
            valid: true,
        }
    }

    #[test]
    fn composes_broadcast_grammar() {
        let message = RadioMessage::new_broadcast("A1B2", "hi").unwrap();
        assert_eq!(message.as_str(), "MSG|A1B2|hi");
        assert_eq!(message.len(), 11);
    }

    #[test]
    fn composes_directed_grammar() {
        let message = RadioMessage::new_directed("A1B2", "C3D4", "meet").unwrap();
        assert_eq!(message.as_str(), "DMSG|A1B2|C3D4|meet");
    }

    #[test]
    fn composes_beacon_telemetry() {
        let message = RadioMessage::new_beacon("A1B2", &fix()).unwrap();
        assert_eq!(message.as_str(), "BEACON|A1B2|12.345600,-78.901200,5.00,0.00,0,7");
    }

    #[test]
    fn rejects_oversize_composition() {
        let body = "x".repeat(MAX_MESSAGE_SIZE);
        assert!(RadioMessage::new_broadcast("A1B2", &body).is_none());
    }

    #[test]
    fn fragment_count_boundaries() {
        let empty = RadioMessage::empty();
        assert_eq!(empty.fragment_count(), 0);

        let exactly_one = RadioMessage::new_broadcast("A", "12345").unwrap();
        assert_eq!(exactly_one.len(), FRAGMENT_DATA_SIZE);
        assert_eq!(exactly_one.fragment_count(), 1);

        let exactly_two = RadioMessage::new_broadcast("A", "1234567890123456").unwrap();
        assert_eq!(exactly_two.len(), 2 * FRAGMENT_DATA_SIZE);
        assert_eq!(exactly_two.fragment_count(), 2);

        let two_plus_one = RadioMessage::new_broadcast("A", "12345678901234567").unwrap();
        assert_eq!(two_plus_one.fragment_count(), 3);
    }

    #[test]
    fn fragment_chunks_cover_message_exactly_once() {
        let message = RadioMessage::new_broadcast("A1B2", "a slightly longer body").unwrap();
        let mut rebuilt = RadioMessage::empty();
        for i in 0..message.fragment_count() {
            rebuilt.push_part(message.fragment_chunk(i)).unwrap();
        }
        assert_eq!(rebuilt.as_bytes(), message.as_bytes());
        // every chunk except the last is full
        for i in 0..message.fragment_count() - 1 {
            assert_eq!(message.fragment_chunk(i).len(), FRAGMENT_DATA_SIZE);
        }
    }

    #[test]
    fn parses_each_message_kind() {
        match RadioMessage::new_broadcast("A1B2", "hi").unwrap().parse() {
            ParsedMessage::Broadcast { sender, body } => {
                assert_eq!(sender, "A1B2");
                assert_eq!(body, "hi");
            }
            other => panic!("unexpected parse: {:?}", other),
        }
        match RadioMessage::new_directed("A1B2", "C3D4", "meet").unwrap().parse() {
            ParsedMessage::Directed { sender, recipient, body } => {
                assert_eq!(sender, "A1B2");
                assert_eq!(recipient, "C3D4");
                assert_eq!(body, "meet");
            }
            other => panic!("unexpected parse: {:?}", other),
        }
        match RadioMessage::new_beacon("A1B2", &fix()).unwrap().parse() {
            ParsedMessage::Beacon { sender, telemetry } => {
                assert_eq!(sender, "A1B2");
                assert_eq!(telemetry, "12.345600,-78.901200,5.00,0.00,0,7");
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn directed_body_may_contain_pipes() {
        let message = RadioMessage::new_directed("A", "B", "x|y").unwrap();
        match message.parse() {
            ParsedMessage::Directed { recipient, body, .. } => {
                assert_eq!(recipient, "B");
                assert_eq!(body, "x|y");
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_surfaced_not_dropped() {
        let mut message = RadioMessage::empty();
        message.push_part(b"PING|A1B2|x").unwrap();
        match message.parse() {
            ParsedMessage::Unknown { raw } => assert_eq!(raw, "PING|A1B2|x"),
            other => panic!("unexpected parse: {:?}", other),
        }
    }
}
