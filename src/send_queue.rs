//! Outgoing message queue with per-fragment retry accounting.
//!
//! Each queued message owns its encrypted fragment blocks. The radio task
//! drives the queue in ticks: `reap` removes finished messages and
//! `next_attempt` hands out at most one fragment per tick, so the task is
//! back to listening between any two transmissions. All pacing is expressed
//! as timestamp comparisons:
//!
//! - a global inter-fragment floor spaces consecutive transmissions of the
//!   whole engine,
//! - per message, a new burst starts only once `retry_interval` has passed
//!   since the previous burst finished.
//!
//! Within a burst the fragments of one message go out in seq order; the
//! burst cursor remembers the position between ticks. A failed transmit
//! still counts as an attempt — the airtime is spent either way — which
//! bounds how long a message can occupy the queue whatever the radio does.
//!
//! Per message the lifecycle is `QUEUED → SENDING ⇄ WAITING → CONFIRMED |
//! EXHAUSTED`; both terminal states are observed by `reap`, never by
//! erasing mid-iteration.

use embassy_time::{Duration, Instant};

use crate::envelope::Envelope;
use crate::messages::{RadioMessage, RadioPacket};
use crate::{MAX_FRAGMENT_COUNT, RADIO_PACKET_SIZE, SEND_QUEUE_SIZE};

/// Admission failure.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub(crate) enum EnqueueError {
    QueueFull,
}

/// A message leaving the queue, reported by [`SendQueue::reap`].
#[cfg_attr(feature = "std", derive(Debug))]
pub(crate) enum ReapEvent {
    /// Confirmed end-to-end (or every fragment acknowledged).
    Delivered(u16),
    /// Every fragment exhausted its retries without a confirmation.
    Exhausted(u16),
}

/// One transmission handed to the radio. The attempt is already counted
/// when this is returned.
pub(crate) struct FragmentAttempt {
    pub block: [u8; RADIO_PACKET_SIZE],
    pub message_id: u16,
    pub index: u8,
    pub total: u8,
    /// 1-based attempt number for diagnostics.
    pub attempt: u8,
}

#[derive(Clone, Copy)]
struct OutgoingFragment {
    block: [u8; RADIO_PACKET_SIZE],
    retries: u8,
    last_attempt: Option<Instant>,
    acked: bool,
}

impl OutgoingFragment {
    const EMPTY: OutgoingFragment = OutgoingFragment {
        block: [0u8; RADIO_PACKET_SIZE],
        retries: 0,
        last_attempt: None,
        acked: false,
    };

    fn sendable(&self, max_retries: u8) -> bool {
        !self.acked && self.retries < max_retries
    }
}

struct OutgoingMessage {
    message_id: u16,
    fragments: [OutgoingFragment; MAX_FRAGMENT_COUNT],
    fragment_count: u8,
    /// When the previous burst finished; pacing reference for the next one.
    last_attempt: Option<Instant>,
    /// Next fragment index while a burst is in progress.
    burst_cursor: Option<u8>,
    confirmed: bool,
}

impl OutgoingMessage {
    fn all_acked(&self) -> bool {
        self.fragments[..self.fragment_count as usize].iter().all(|f| f.acked)
    }

    fn has_sendable_fragment(&self, max_retries: u8) -> bool {
        self.fragments[..self.fragment_count as usize].iter().any(|f| f.sendable(max_retries))
    }
}

/// Multi-message FIFO of outgoing fragments.
pub(crate) struct SendQueue {
    slots: [Option<OutgoingMessage>; SEND_QUEUE_SIZE],
    max_retries: u8,
    retry_interval: Duration,
    inter_fragment_delay: Duration,
    /// Engine-wide pacer: timestamp of the most recent transmission.
    last_fragment_tx: Option<Instant>,
}

impl SendQueue {
    pub(crate) const fn new(max_retries: u8, retry_interval: Duration, inter_fragment_delay: Duration) -> Self {
        SendQueue {
            slots: [const { None }; SEND_QUEUE_SIZE],
            max_retries,
            retry_interval,
            inter_fragment_delay,
            last_fragment_tx: None,
        }
    }

    /// Fragments and encrypts a message under `message_id` and appends it.
    ///
    /// Returns the fragment count; zero means the message was empty and was
    /// dropped without occupying a slot or touching the radio.
    pub(crate) fn enqueue(&mut self, message: &RadioMessage, message_id: u16, priority: u8, envelope: &Envelope) -> Result<usize, EnqueueError> {
        let total = message.fragment_count();
        if total == 0 {
            return Ok(0);
        }
        let Some(free) = self.slots.iter().position(|slot| slot.is_none()) else {
            return Err(EnqueueError::QueueFull);
        };

        let mut entry = OutgoingMessage {
            message_id,
            fragments: [OutgoingFragment::EMPTY; MAX_FRAGMENT_COUNT],
            fragment_count: total as u8,
            last_attempt: None,
            burst_cursor: None,
            confirmed: false,
        };
        for i in 0..total {
            let packet = RadioPacket::new_text_fragment(priority, message_id, i as u8, total as u8, message.fragment_chunk(i));
            entry.fragments[i].block = packet.data;
            envelope.encrypt(&mut entry.fragments[i].block);
        }
        self.slots[free] = Some(entry);
        Ok(total)
    }

    /// Confirmation sink. Marks every fragment of the message acknowledged
    /// and flags the message for removal. Returns false for unknown ids,
    /// which the caller ignores silently.
    pub(crate) fn confirm(&mut self, message_id: u16) -> bool {
        for slot in self.slots.iter_mut().flatten() {
            if slot.message_id == message_id {
                for fragment in slot.fragments[..slot.fragment_count as usize].iter_mut() {
                    fragment.acked = true;
                }
                slot.confirmed = true;
                return true;
            }
        }
        false
    }

    /// Removes and reports one finished message per call; `None` once the
    /// queue holds only live messages. Called in a loop by the radio task so
    /// removal never happens while fragments are being iterated.
    pub(crate) fn reap(&mut self) -> Option<ReapEvent> {
        for slot in self.slots.iter_mut() {
            let Some(message) = slot else { continue };
            if message.confirmed || message.all_acked() {
                let id = message.message_id;
                *slot = None;
                return Some(ReapEvent::Delivered(id));
            }
            if !message.has_sendable_fragment(self.max_retries) {
                let id = message.message_id;
                *slot = None;
                return Some(ReapEvent::Exhausted(id));
            }
        }
        None
    }

    /// Claims the next fragment transmission, if any is due at `now`.
    ///
    /// At most one fragment is handed out per call. An in-progress burst is
    /// continued before a new one is started; a new burst begins on the
    /// first slot that is unconfirmed, past its retry interval and still has
    /// a sendable fragment. Returns `None` while the global inter-fragment
    /// floor or every per-message interval is still running.
    pub(crate) fn next_attempt(&mut self, now: Instant) -> Option<FragmentAttempt> {
        if let Some(last) = self.last_fragment_tx {
            if now.saturating_duration_since(last) < self.inter_fragment_delay {
                return None;
            }
        }

        // Continue an in-progress burst first so fragments of one message
        // stay in seq order.
        for slot in self.slots.iter_mut() {
            let Some(message) = slot.as_mut() else { continue };
            let Some(cursor) = message.burst_cursor else { continue };
            if let Some(attempt) = Self::claim_from(message, cursor as usize, self.max_retries, now) {
                self.last_fragment_tx = Some(now);
                return Some(attempt);
            }
        }

        // Start a new burst on the first due message.
        for slot in self.slots.iter_mut() {
            let Some(message) = slot.as_mut() else { continue };
            if message.confirmed || message.burst_cursor.is_some() || !message.has_sendable_fragment(self.max_retries) {
                continue;
            }
            if let Some(last) = message.last_attempt {
                if now.saturating_duration_since(last) < self.retry_interval {
                    continue;
                }
            }
            if let Some(attempt) = Self::claim_from(message, 0, self.max_retries, now) {
                self.last_fragment_tx = Some(now);
                return Some(attempt);
            }
        }
        None
    }

    /// Claims the first sendable fragment at or after `start`, advancing the
    /// burst cursor. Stamps the message pacing clock when the claimed
    /// fragment is the last sendable one of this burst.
    fn claim_from(message: &mut OutgoingMessage, start: usize, max_retries: u8, now: Instant) -> Option<FragmentAttempt> {
        let count = message.fragment_count as usize;
        for i in start..count {
            if !message.fragments[i].sendable(max_retries) {
                continue;
            }
            let fragment = &mut message.fragments[i];
            fragment.retries += 1;
            fragment.last_attempt = Some(now);
            let attempt = FragmentAttempt {
                block: fragment.block,
                message_id: message.message_id,
                index: i as u8,
                total: message.fragment_count,
                attempt: fragment.retries,
            };
            let burst_continues = message.fragments[i + 1..count].iter().any(|f| f.sendable(max_retries));
            if burst_continues {
                message.burst_cursor = Some(i as u8 + 1);
            } else {
                message.burst_cursor = None;
                message.last_attempt = Some(now);
            }
            return Some(attempt);
        }
        // Nothing sendable from here: the burst is over.
        message.burst_cursor = None;
        message.last_attempt = Some(now);
        None
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, message_id: u16) -> bool {
        self.slots.iter().flatten().any(|m| m.message_id == message_id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::messages::{ParsedPacket, PRIORITY_NORMAL};

    fn at(millis: u64) -> Instant {
        Instant::from_millis(millis)
    }

    /// Queue with no inter-fragment floor so a whole burst drains at one
    /// timestamp; the floor has its own test.
    fn test_queue() -> (SendQueue, Envelope) {
        (
            SendQueue::new(2, Duration::from_millis(2_000), Duration::from_millis(0)),
            Envelope::new(&[0x42; 16]),
        )
    }

    fn broadcast(body: &str) -> RadioMessage {
        RadioMessage::new_broadcast("A1B2", body).unwrap()
    }

    /// Drains every attempt due at `now`, i.e. one full burst.
    fn run_burst(queue: &mut SendQueue, now: Instant) -> Vec<FragmentAttempt> {
        let mut attempts = Vec::new();
        while let Some(attempt) = queue.next_attempt(now) {
            attempts.push(attempt);
        }
        attempts
    }

    #[test]
    fn empty_message_is_dropped_without_a_slot() {
        let (mut queue, envelope) = test_queue();
        let empty = RadioMessage::empty();
        assert_eq!(queue.enqueue(&empty, 1, PRIORITY_NORMAL, &envelope), Ok(0));
        assert_eq!(queue.len(), 0);
        assert!(queue.next_attempt(at(0)).is_none());
    }

    #[test]
    fn enqueued_fragments_are_encrypted_and_sent_in_seq_order() {
        let (mut queue, envelope) = test_queue();
        let message = broadcast("hi");
        assert_eq!(queue.enqueue(&message, 0xBEEF, PRIORITY_NORMAL, &envelope), Ok(2));

        let attempts = run_burst(&mut queue, at(0));
        assert_eq!(attempts.len(), 2);
        for (i, attempt) in attempts.iter().enumerate() {
            let mut block = attempt.block;
            envelope.decrypt(&mut block);
            let packet = RadioPacket { data: block };
            match packet.parse() {
                Some(ParsedPacket::TextFragment {
                    message_id,
                    index,
                    total,
                    payload,
                }) => {
                    assert_eq!(message_id, 0xBEEF);
                    assert_eq!(index, i as u8);
                    assert_eq!(total, 2);
                    assert_eq!(payload, message.fragment_chunk(i));
                }
                other => panic!("unexpected parse: {:?}", other),
            }
        }
    }

    #[test]
    fn queue_full_is_reported() {
        let (mut queue, envelope) = test_queue();
        for id in 0..SEND_QUEUE_SIZE as u16 {
            assert!(queue.enqueue(&broadcast("x"), id, PRIORITY_NORMAL, &envelope).is_ok());
        }
        assert_eq!(
            queue.enqueue(&broadcast("x"), 0x7777, PRIORITY_NORMAL, &envelope),
            Err(EnqueueError::QueueFull)
        );
    }

    #[test]
    fn global_floor_spaces_consecutive_fragments() {
        let envelope = Envelope::new(&[0x42; 16]);
        let mut queue = SendQueue::new(2, Duration::from_millis(2_000), Duration::from_millis(2_000));
        queue.enqueue(&broadcast("hi"), 1, PRIORITY_NORMAL, &envelope).unwrap();

        let first = queue.next_attempt(at(0)).expect("fragment 0 is due immediately");
        assert_eq!(first.index, 0);
        assert!(queue.next_attempt(at(1_999)).is_none(), "floor must hold back fragment 1");
        let second = queue.next_attempt(at(2_000)).expect("fragment 1 after the floor");
        assert_eq!(second.index, 1);
    }

    #[test]
    fn pacing_blocks_until_retry_interval_elapses() {
        let (mut queue, envelope) = test_queue();
        queue.enqueue(&broadcast("hi"), 1, PRIORITY_NORMAL, &envelope).unwrap();

        assert_eq!(run_burst(&mut queue, at(0)).len(), 2);
        assert!(queue.next_attempt(at(1_999)).is_none());
        assert!(queue.next_attempt(at(2_000)).is_some());
    }

    #[test]
    fn attempts_never_exceed_max_retries() {
        let (mut queue, envelope) = test_queue();
        queue.enqueue(&broadcast("hi"), 1, PRIORITY_NORMAL, &envelope).unwrap();

        let first = run_burst(&mut queue, at(0));
        assert!(first.iter().all(|a| a.attempt == 1));
        let second = run_burst(&mut queue, at(2_000));
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|a| a.attempt == 2));
        // max_retries = 2: nothing left to send, message awaits reaping
        assert!(queue.next_attempt(at(4_000)).is_none());
        match queue.reap() {
            Some(ReapEvent::Exhausted(1)) => {}
            other => panic!("unexpected reap: {:?}", other),
        }
        assert!(queue.reap().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn confirmation_terminates_the_message() {
        let (mut queue, envelope) = test_queue();
        queue.enqueue(&broadcast("hi"), 0xAA55, PRIORITY_NORMAL, &envelope).unwrap();
        run_burst(&mut queue, at(0));

        assert!(queue.confirm(0xAA55));
        assert!(queue.next_attempt(at(10_000)).is_none());
        match queue.reap() {
            Some(ReapEvent::Delivered(0xAA55)) => {}
            other => panic!("unexpected reap: {:?}", other),
        }
        assert!(!queue.contains(0xAA55));
    }

    #[test]
    fn confirmation_mid_burst_stops_remaining_fragments() {
        let envelope = Envelope::new(&[0x42; 16]);
        let mut queue = SendQueue::new(2, Duration::from_millis(2_000), Duration::from_millis(2_000));
        queue.enqueue(&broadcast("hi"), 9, PRIORITY_NORMAL, &envelope).unwrap();

        assert!(queue.next_attempt(at(0)).is_some());
        // the peer somehow confirms before fragment 1 went out
        assert!(queue.confirm(9));
        assert!(queue.next_attempt(at(2_000)).is_none());
        assert!(matches!(queue.reap(), Some(ReapEvent::Delivered(9))));
    }

    #[test]
    fn confirmation_for_unknown_id_is_ignored() {
        let (mut queue, envelope) = test_queue();
        queue.enqueue(&broadcast("hi"), 1, PRIORITY_NORMAL, &envelope).unwrap();
        assert!(!queue.confirm(0xDEAD));
        assert!(queue.contains(1));
        assert!(queue.reap().is_none());
    }

    #[test]
    fn earlier_slots_are_served_first() {
        let (mut queue, envelope) = test_queue();
        queue.enqueue(&broadcast("first"), 10, PRIORITY_NORMAL, &envelope).unwrap();
        queue.enqueue(&broadcast("second"), 20, PRIORITY_NORMAL, &envelope).unwrap();

        let attempts = run_burst(&mut queue, at(0));
        let mut ids: Vec<u16> = attempts.iter().map(|a| a.message_id).collect();
        ids.dedup();
        assert_eq!(ids, vec![10, 20], "slot order, each message's burst contiguous");
    }

    #[test]
    fn long_retrying_message_interleaves_with_later_ones() {
        let (mut queue, envelope) = test_queue();
        queue.enqueue(&broadcast("first"), 10, PRIORITY_NORMAL, &envelope).unwrap();
        run_burst(&mut queue, at(0));
        queue.enqueue(&broadcast("second"), 20, PRIORITY_NORMAL, &envelope).unwrap();

        // message 10 is waiting out its retry interval; 20 goes first
        let attempts = run_burst(&mut queue, at(500));
        assert!(!attempts.is_empty());
        assert!(attempts.iter().all(|a| a.message_id == 20));
    }
}
