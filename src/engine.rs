//! Protocol engine: inbound classification and outbound progress.
//!
//! The engine owns every piece of protocol state — envelope, send queue,
//! reassembly table, duplicate window — and is itself owned exclusively by
//! the radio task, so all mutation is serialised by construction. Inbound
//! frames are decrypted and routed here; outbound progress is driven by the
//! radio task through `next_attempt`/`report_attempt`, which keep the radio
//! I/O (and its await points) outside the engine.

use core::fmt::Write as _;

use embassy_time::{Duration, Instant};
use log::{log, Level};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

use crate::console::{self, ConsoleLine};
use crate::envelope::Envelope;
use crate::messages::radio_packet::PRIORITY_NORMAL;
use crate::messages::{ParsedMessage, ParsedPacket, RadioMessage, RadioPacket};
use crate::radio_devices::RadioDeviceError;
use crate::reassembly::{ReassemblyOutcome, ReassemblyTable};
use crate::send_queue::{EnqueueError, FragmentAttempt, ReapEvent, SendQueue};
use crate::{ConsoleQueueSender, DeviceName, RADIO_PACKET_SIZE};

pub(crate) struct ProtocolEngine {
    envelope: Envelope,
    send_queue: SendQueue,
    reassembly: ReassemblyTable,
    device_name: DeviceName,
    rng: WyRand,
    console: ConsoleQueueSender,
}

impl ProtocolEngine {
    pub(crate) fn new(
        device_name: DeviceName,
        max_retries: u8,
        retry_interval: Duration,
        inter_fragment_delay: Duration,
        cipher_key: &[u8; 16],
        rng_seed: u64,
        console: ConsoleQueueSender,
    ) -> Self {
        ProtocolEngine {
            envelope: Envelope::new(cipher_key),
            send_queue: SendQueue::new(max_retries, retry_interval, inter_fragment_delay),
            reassembly: ReassemblyTable::new(),
            device_name,
            rng: WyRand::seed_from_u64(rng_seed),
            console,
        }
    }

    /// Admits an application message: draws a random 16-bit id, fragments,
    /// encrypts and queues it. Saturation and empty messages are dropped
    /// here with a log line; neither reaches the radio.
    pub(crate) fn enqueue_message(&mut self, message: &RadioMessage) {
        let message_id = (self.rng.next_u32() & 0xFFFF) as u16;
        match self.send_queue.enqueue(message, message_id, PRIORITY_NORMAL, &self.envelope) {
            Ok(0) => {
                log!(Level::Debug, "Dropping empty outgoing message");
            }
            Ok(count) => {
                log!(Level::Debug, "Queued message {:04X} in {} fragments", message_id, count);
            }
            Err(EnqueueError::QueueFull) => {
                log!(Level::Warn, "Send queue full, dropping outgoing message {:04X}", message_id);
            }
        }
    }

    /// Decrypts and classifies one received frame and routes it.
    ///
    /// Returns the encrypted confirm to transmit when a reassembly completed
    /// (first time or duplicate); every other path returns `None`. Frames of
    /// the wrong length, unknown type nibbles and malformed fragments are
    /// dropped without a diagnostic — after an unauthenticated decrypt they
    /// are indistinguishable from channel noise.
    pub(crate) fn handle_inbound(&mut self, raw: &[u8], now: Instant) -> Option<RadioPacket> {
        if raw.len() != RADIO_PACKET_SIZE {
            log!(Level::Trace, "Dropping frame with invalid length {}", raw.len());
            return None;
        }
        let mut block = [0u8; RADIO_PACKET_SIZE];
        block.copy_from_slice(raw);
        self.envelope.decrypt(&mut block);
        let packet = RadioPacket { data: block };

        match packet.parse() {
            Some(ParsedPacket::TextFragment {
                message_id,
                index,
                total,
                payload,
            }) => match self.reassembly.accept(message_id, index, total, payload, now) {
                ReassemblyOutcome::Rejected => {
                    log!(Level::Debug, "Dropping malformed fragment for {:04X}", message_id);
                    None
                }
                ReassemblyOutcome::Stored => {
                    self.push_console(console::line(format_args!("RECV|FRAG|{:04X}|{}/{}", message_id, index + 1, total)));
                    None
                }
                ReassemblyOutcome::Completed(message) => {
                    self.push_console(console::line(format_args!("RECV|FRAG|{:04X}|{}/{}", message_id, index + 1, total)));
                    self.report_completed(&message, message_id);
                    Some(self.build_confirm(message_id))
                }
                ReassemblyOutcome::Duplicate => {
                    self.push_console(console::line(format_args!("RECV|FRAG|{:04X}|{}/{}", message_id, index + 1, total)));
                    log!(Level::Debug, "Duplicate completion of {:04X}, re-confirming", message_id);
                    Some(self.build_confirm(message_id))
                }
            },
            Some(ParsedPacket::AckConfirm { message_id, sender }) => {
                if self.send_queue.confirm(message_id) {
                    self.push_console(console::line(format_args!("ACK|CONFIRM|{:04X}", message_id)));
                    log!(Level::Debug, "Message {:04X} confirmed by {}", message_id, sender.unwrap_or("?"));
                } else {
                    log!(Level::Debug, "Confirm for unknown message {:04X}, ignoring", message_id);
                }
                None
            }
            None => {
                log!(Level::Debug, "Dropping frame with unknown type nibble {:#03x}", packet.packet_type());
                None
            }
        }
    }

    /// Removes finished messages from the send queue, reporting final
    /// failures once.
    pub(crate) fn reap(&mut self) {
        while let Some(event) = self.send_queue.reap() {
            match event {
                ReapEvent::Delivered(message_id) => {
                    log!(Level::Debug, "Message {:04X} delivered, removed from queue", message_id);
                }
                ReapEvent::Exhausted(message_id) => {
                    self.push_console(console::line(format_args!("SEND_FAILED|FINAL|{:04X}", message_id)));
                    log!(Level::Warn, "Message {:04X} exhausted its retries", message_id);
                }
            }
        }
    }

    /// See [`SendQueue::next_attempt`].
    pub(crate) fn next_attempt(&mut self, now: Instant) -> Option<FragmentAttempt> {
        self.send_queue.next_attempt(now)
    }

    /// Emits the per-attempt diagnostic after the radio reported back. The
    /// attempt was counted when the fragment was claimed, so a radio failure
    /// still consumes retry budget.
    pub(crate) fn report_attempt(&mut self, attempt: &FragmentAttempt, result: Result<(), RadioDeviceError>) {
        match result {
            Ok(()) => {
                self.push_console(console::line(format_args!(
                    "SEND|{:04X}|{}/{}|try={}",
                    attempt.message_id,
                    attempt.index + 1,
                    attempt.total,
                    attempt.attempt
                )));
            }
            Err(error) => {
                self.push_console(console::line(format_args!(
                    "SEND|FAIL|{:04X}|SEQ={}|ERR={}",
                    attempt.message_id,
                    attempt.index,
                    error.code()
                )));
            }
        }
    }

    fn build_confirm(&mut self, message_id: u16) -> RadioPacket {
        let mut packet = RadioPacket::new_ack_confirm(message_id, self.device_name.as_str());
        self.envelope.encrypt(&mut packet.data);
        packet
    }

    fn report_completed(&mut self, message: &RadioMessage, message_id: u16) {
        let mut record = ConsoleLine::new();
        let _ = match message.parse() {
            ParsedMessage::Broadcast { sender, body } => write!(record, "RECV|MSG|{}|{}|{:04X}", sender, body, message_id),
            ParsedMessage::Directed { sender, recipient, body } => {
                write!(record, "RECV|DMSG|{}|{}|{}|{:04X}", sender, recipient, body, message_id)
            }
            ParsedMessage::Beacon { sender, telemetry } => write!(record, "RECV|BEACON|{}|{}", sender, telemetry),
            ParsedMessage::Unknown { raw } => write!(record, "RECV|UNKNOWN|{}", raw),
        };
        self.push_console(record);
    }

    fn push_console(&mut self, record: ConsoleLine) {
        if self.console.try_send(record).is_err() {
            log!(Level::Warn, "Console queue full, dropping diagnostic record");
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_messages(&self) -> usize {
        self.send_queue.len()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::messages::PacketType;
    use crate::{ConsoleQueue, ConsoleQueueReceiver};
    use embassy_sync::channel::Channel;

    const KEY: [u8; 16] = [0x42; 16];

    fn at(millis: u64) -> Instant {
        Instant::from_millis(millis)
    }

    fn new_engine(name: &str, seed: u64) -> (ProtocolEngine, ConsoleQueueReceiver) {
        let queue: &'static ConsoleQueue = Box::leak(Box::new(Channel::new()));
        let engine = ProtocolEngine::new(
            DeviceName::new(name).unwrap(),
            2,
            Duration::from_millis(2_000),
            Duration::from_millis(0),
            &KEY,
            seed,
            queue.sender(),
        );
        (engine, queue.receiver())
    }

    fn drain(console: &ConsoleQueueReceiver) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(record) = console.try_receive() {
            lines.push(record.as_str().to_string());
        }
        lines
    }

    /// Transmits one full burst, returning the ciphertext blocks in order.
    fn run_burst(engine: &mut ProtocolEngine, now: Instant) -> Vec<[u8; 16]> {
        let mut blocks = Vec::new();
        while let Some(attempt) = engine.next_attempt(now) {
            engine.report_attempt(&attempt, Ok(()));
            blocks.push(attempt.block);
        }
        blocks
    }

    fn message_id_of(block: &[u8; 16]) -> u16 {
        let envelope = Envelope::new(&KEY);
        let mut plain = *block;
        envelope.decrypt(&mut plain);
        RadioPacket { data: plain }.message_id()
    }

    #[test]
    fn clean_link_round_trip_confirms_and_terminates() {
        let (mut node_a, console_a) = new_engine("A1B2", 1);
        let (mut node_b, console_b) = new_engine("C3D4", 2);

        node_a.enqueue_message(&RadioMessage::new_broadcast("A1B2", "hello").unwrap());
        let blocks = run_burst(&mut node_a, at(0));
        assert_eq!(blocks.len(), 2, "MSG|A1B2|hello is 14 bytes and must span 2 fragments");
        let id = message_id_of(&blocks[0]);
        let id_str = format!("{:04X}", id);

        let mut confirm = None;
        for block in &blocks {
            if let Some(ack) = node_b.handle_inbound(block, at(10)) {
                confirm = Some(ack);
            }
        }
        let confirm = confirm.expect("completed reassembly must produce a confirm");

        let lines_b = drain(&console_b);
        assert_eq!(
            lines_b,
            vec![
                format!("RECV|FRAG|{}|1/2", id_str),
                format!("RECV|FRAG|{}|2/2", id_str),
                format!("RECV|MSG|A1B2|hello|{}", id_str),
            ]
        );

        assert!(node_a.handle_inbound(&confirm.data, at(20)).is_none());
        node_a.reap();
        assert_eq!(node_a.pending_messages(), 0);

        let lines_a = drain(&console_a);
        assert!(lines_a.contains(&format!("ACK|CONFIRM|{}", id_str)));
        assert!(!lines_a.iter().any(|l| l.starts_with("SEND_FAILED")));
    }

    #[test]
    fn lost_fragment_is_recovered_by_retry() {
        let (mut node_a, _console_a) = new_engine("A1B2", 3);
        let (mut node_b, console_b) = new_engine("C3D4", 4);

        node_a.enqueue_message(&RadioMessage::new_broadcast("A1B2", "hello").unwrap());
        let first = run_burst(&mut node_a, at(0));
        // fragment 2 lost on the air
        assert!(node_b.handle_inbound(&first[0], at(10)).is_none());

        // nothing to send until the retry interval elapses
        assert!(run_burst(&mut node_a, at(1_000)).is_empty());

        let second = run_burst(&mut node_a, at(2_000));
        assert_eq!(second.len(), 2);
        let mut confirm = None;
        for block in &second {
            if let Some(ack) = node_b.handle_inbound(block, at(2_010)) {
                confirm = Some(ack);
            }
        }
        let confirm = confirm.expect("retry must complete the message");

        let lines_b = drain(&console_b);
        assert_eq!(lines_b.iter().filter(|l| l.starts_with("RECV|MSG|")).count(), 1);

        node_a.handle_inbound(&confirm.data, at(2_020));
        node_a.reap();
        assert_eq!(node_a.pending_messages(), 0);
    }

    #[test]
    fn lost_confirm_triggers_reack_without_redelivery() {
        let (mut node_a, _console_a) = new_engine("A1B2", 5);
        let (mut node_b, console_b) = new_engine("C3D4", 6);

        node_a.enqueue_message(&RadioMessage::new_broadcast("A1B2", "hello").unwrap());
        let first = run_burst(&mut node_a, at(0));
        let mut first_confirm = None;
        for block in &first {
            if let Some(ack) = node_b.handle_inbound(block, at(10)) {
                first_confirm = Some(ack);
            }
        }
        assert!(first_confirm.is_some(), "first completion must confirm");
        // ...but node A never hears it, and retransmits after the interval.
        let second = run_burst(&mut node_a, at(2_000));
        assert_eq!(second.len(), 2);

        let mut second_confirm = None;
        for block in &second {
            if let Some(ack) = node_b.handle_inbound(block, at(2_010)) {
                second_confirm = Some(ack);
            }
        }
        let second_confirm = second_confirm.expect("duplicate completion must re-confirm");

        // the duplicate produced a re-ack but no second RECV|MSG record
        let lines_b = drain(&console_b);
        assert_eq!(lines_b.iter().filter(|l| l.starts_with("RECV|MSG|")).count(), 1);

        node_a.handle_inbound(&second_confirm.data, at(2_020));
        node_a.reap();
        assert_eq!(node_a.pending_messages(), 0);
    }

    #[test]
    fn absent_peer_exhausts_retries_and_fails_finally() {
        let (mut node_a, console_a) = new_engine("A1B2", 7);

        node_a.enqueue_message(&RadioMessage::new_broadcast("A1B2", "hello").unwrap());
        let first = run_burst(&mut node_a, at(0));
        let id_str = format!("{:04X}", message_id_of(&first[0]));

        assert_eq!(run_burst(&mut node_a, at(2_000)).len(), 2);
        // max_retries = 2 attempts per fragment: nothing further to send
        assert!(run_burst(&mut node_a, at(4_000)).is_empty());
        node_a.reap();
        assert_eq!(node_a.pending_messages(), 0);

        let lines = drain(&console_a);
        assert_eq!(lines.iter().filter(|l| l.starts_with("SEND_FAILED|FINAL|")).count(), 1);
        assert!(lines.contains(&format!("SEND_FAILED|FINAL|{}", id_str)));
        // 2 fragments x 2 attempts were diagnosed
        assert_eq!(lines.iter().filter(|l| l.starts_with("SEND|")).count(), 4);
    }

    #[test]
    fn directed_message_round_trip() {
        let (mut node_a, _console_a) = new_engine("A1B2", 8);
        let (mut node_b, console_b) = new_engine("C3D4", 9);

        node_a.enqueue_message(&RadioMessage::new_directed("A1B2", "C3D4", "meet").unwrap());
        let blocks = run_burst(&mut node_a, at(0));
        let id_str = format!("{:04X}", message_id_of(&blocks[0]));
        for block in &blocks {
            node_b.handle_inbound(block, at(10));
        }
        let lines = drain(&console_b);
        assert!(lines.contains(&format!("RECV|DMSG|A1B2|C3D4|meet|{}", id_str)));
    }

    #[test]
    fn beacon_round_trip() {
        use crate::gps::GpsFix;

        let (mut node_a, _console_a) = new_engine("A1B2", 10);
        let (mut node_b, console_b) = new_engine("C3D4", 11);

        let fix = GpsFix {
            latitude: 12.3456,
            longitude: -78.9012,
            altitude: 5.0,
            speed: 0.0,
            course: 0.0,
            satellites: 7,
            valid: true,
        };
        node_a.enqueue_message(&RadioMessage::new_beacon("A1B2", &fix).unwrap());
        for block in run_burst(&mut node_a, at(0)) {
            node_b.handle_inbound(&block, at(10));
        }
        let lines = drain(&console_b);
        assert!(lines.contains(&"RECV|BEACON|A1B2|12.345600,-78.901200,5.00,0.00,0,7".to_string()));
    }

    #[test]
    fn radio_failure_counts_the_attempt() {
        let (mut node_a, console_a) = new_engine("A1B2", 12);
        node_a.enqueue_message(&RadioMessage::new_broadcast("A1B2", "x").unwrap());

        let attempt = node_a.next_attempt(at(0)).unwrap();
        node_a.report_attempt(&attempt, Err(RadioDeviceError::TransmissionFailed));

        let attempt = node_a.next_attempt(at(2_000)).unwrap();
        assert_eq!(attempt.attempt, 2, "failed transmit must still count as an attempt");

        let lines = drain(&console_a);
        assert!(lines.iter().any(|l| l.starts_with("SEND|FAIL|") && l.contains("SEQ=0")));
    }

    #[test]
    fn wrong_length_frames_are_dropped() {
        let (mut node_b, console_b) = new_engine("C3D4", 13);
        assert!(node_b.handle_inbound(&[0u8; 5], at(0)).is_none());
        assert!(node_b.handle_inbound(&[0u8; 32], at(0)).is_none());
        assert!(drain(&console_b).is_empty());
    }

    #[test]
    fn dead_wire_types_are_discarded() {
        let (mut node_b, console_b) = new_engine("C3D4", 14);
        let envelope = Envelope::new(&KEY);
        // 0x02/0x04 style legacy nibbles from abandoned protocol iterations
        for dead_type in [0x02u8, 0x04, 0x05, 0x06, 0x07] {
            let mut block = [0u8; 16];
            block[0] = dead_type;
            envelope.encrypt(&mut block);
            assert!(node_b.handle_inbound(&block, at(0)).is_none());
        }
        assert!(drain(&console_b).is_empty());
    }

    #[test]
    fn confirm_for_unknown_id_is_silent() {
        let (mut node_a, console_a) = new_engine("A1B2", 15);
        let envelope = Envelope::new(&KEY);
        let mut ack = RadioPacket::new_ack_confirm(0xDEAD, "C3D4");
        envelope.encrypt(&mut ack.data);
        assert!(node_a.handle_inbound(&ack.data, at(0)).is_none());
        assert!(drain(&console_a).is_empty());
    }

    #[test]
    fn confirm_packet_carries_our_device_name() {
        let (mut node_b, _console_b) = new_engine("C3D4", 16);
        let (mut node_a, _console_a) = new_engine("A1B2", 17);

        node_a.enqueue_message(&RadioMessage::new_broadcast("A1B2", "x").unwrap());
        let blocks = run_burst(&mut node_a, at(0));
        let ack = node_b.handle_inbound(&blocks[0], at(10)).expect("single fragment completes");

        let envelope = Envelope::new(&KEY);
        let mut plain = ack.data;
        envelope.decrypt(&mut plain);
        let packet = RadioPacket { data: plain };
        assert_eq!(packet.packet_type(), PacketType::AckConfirm as u8);
        match packet.parse() {
            Some(ParsedPacket::AckConfirm { sender, .. }) => assert_eq!(sender, Some("C3D4")),
            other => panic!("unexpected parse: {:?}", other),
        }
    }
}
