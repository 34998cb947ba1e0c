//! Fragment reassembly and duplicate suppression.
//!
//! Decrypted text fragments land here. Each message id gets one slot holding
//! the parts received so far; when the set `{0..total-1}` is complete the
//! concatenated message is handed back and the slot is released. A bounded
//! window of recently completed ids suppresses re-delivery when the sender
//! retransmits because our confirm was lost — the duplicate is dropped but
//! still re-acknowledged, which is what lets the sender converge.

use embassy_time::Instant;

use crate::messages::RadioMessage;
use crate::{BROADCAST_MEMORY_TIME, FRAGMENT_DATA_SIZE, INCOMING_TABLE_SIZE, MAX_FRAGMENT_COUNT, RECENT_IDS_SIZE};

/// Result of feeding one fragment into the table.
#[cfg_attr(feature = "std", derive(Debug))]
pub(crate) enum ReassemblyOutcome {
    /// Fragment stored, message still incomplete.
    Stored,
    /// Message completed for the first time; caller must confirm once and
    /// surface the message.
    Completed(RadioMessage),
    /// Message completed again inside the duplicate-suppression window;
    /// caller must confirm once and surface nothing.
    Duplicate,
    /// Malformed fragment, dropped.
    Rejected,
}

struct IncomingMessage {
    message_id: u16,
    total: u8,
    received: [bool; MAX_FRAGMENT_COUNT],
    parts: [[u8; FRAGMENT_DATA_SIZE]; MAX_FRAGMENT_COUNT],
    part_lengths: [u8; MAX_FRAGMENT_COUNT],
    first_seen: Instant,
}

impl IncomingMessage {
    fn new(message_id: u16, total: u8, now: Instant) -> Self {
        IncomingMessage {
            message_id,
            total,
            received: [false; MAX_FRAGMENT_COUNT],
            parts: [[0u8; FRAGMENT_DATA_SIZE]; MAX_FRAGMENT_COUNT],
            part_lengths: [0u8; MAX_FRAGMENT_COUNT],
            first_seen: now,
        }
    }

    fn reset(&mut self, total: u8) {
        self.total = total;
        self.received = [false; MAX_FRAGMENT_COUNT];
        self.part_lengths = [0u8; MAX_FRAGMENT_COUNT];
    }

    fn is_complete(&self) -> bool {
        self.received[..self.total as usize].iter().all(|&got| got)
    }

    fn assemble(&self) -> Option<RadioMessage> {
        let mut message = RadioMessage::empty();
        for i in 0..self.total as usize {
            message.push_part(&self.parts[i][..self.part_lengths[i] as usize]).ok()?;
        }
        Some(message)
    }
}

/// Recently completed message ids with their completion time.
///
/// Entries expire after [`BROADCAST_MEMORY_TIME`], evicted lazily on any
/// lookup; when the window is full the oldest entry is overwritten so an
/// id flood cannot grow the table.
pub(crate) struct RecentIds {
    entries: [Option<(u16, Instant)>; RECENT_IDS_SIZE],
}

impl RecentIds {
    pub(crate) const fn new() -> Self {
        RecentIds {
            entries: [None; RECENT_IDS_SIZE],
        }
    }

    fn sweep(&mut self, now: Instant) {
        for entry in self.entries.iter_mut() {
            if let Some((_, completed_at)) = entry {
                if now.saturating_duration_since(*completed_at) > BROADCAST_MEMORY_TIME {
                    *entry = None;
                }
            }
        }
    }

    pub(crate) fn contains(&mut self, message_id: u16, now: Instant) -> bool {
        self.sweep(now);
        self.entries.iter().flatten().any(|&(id, _)| id == message_id)
    }

    pub(crate) fn insert(&mut self, message_id: u16, now: Instant) {
        self.sweep(now);
        let mut oldest_index = 0;
        let mut oldest_time = now;
        for (i, entry) in self.entries.iter().enumerate() {
            match entry {
                None => {
                    self.entries[i] = Some((message_id, now));
                    return;
                }
                Some((_, completed_at)) => {
                    if *completed_at <= oldest_time {
                        oldest_time = *completed_at;
                        oldest_index = i;
                    }
                }
            }
        }
        self.entries[oldest_index] = Some((message_id, now));
    }
}

/// Per-message-id buffers of received fragments.
pub(crate) struct ReassemblyTable {
    slots: [Option<IncomingMessage>; INCOMING_TABLE_SIZE],
    recent: RecentIds,
}

impl ReassemblyTable {
    pub(crate) const fn new() -> Self {
        ReassemblyTable {
            slots: [const { None }; INCOMING_TABLE_SIZE],
            recent: RecentIds::new(),
        }
    }

    /// Feeds one decrypted text fragment into the table.
    ///
    /// A fragment whose claimed `total` differs from the slot's reinitialises
    /// the slot, treating the prior partial message as abandoned (this is
    /// also what makes random id collisions survivable). Completion removes
    /// the slot immediately, on the success and the duplicate path alike.
    pub(crate) fn accept(&mut self, message_id: u16, index: u8, total: u8, payload: &[u8], now: Instant) -> ReassemblyOutcome {
        if total == 0 || total as usize > MAX_FRAGMENT_COUNT || index >= total || payload.len() > FRAGMENT_DATA_SIZE {
            return ReassemblyOutcome::Rejected;
        }

        let slot_index = match self.find_or_allocate(message_id, total, now) {
            Some(i) => i,
            None => return ReassemblyOutcome::Rejected,
        };
        let Some(slot) = self.slots[slot_index].as_mut() else {
            return ReassemblyOutcome::Rejected;
        };

        if slot.total != total {
            slot.reset(total);
        }
        slot.parts[index as usize][..payload.len()].copy_from_slice(payload);
        slot.part_lengths[index as usize] = payload.len() as u8;
        slot.received[index as usize] = true;

        if !slot.is_complete() {
            return ReassemblyOutcome::Stored;
        }

        let Some(finished) = self.slots[slot_index].take() else {
            return ReassemblyOutcome::Rejected;
        };
        if self.recent.contains(message_id, now) {
            return ReassemblyOutcome::Duplicate;
        }
        match finished.assemble() {
            Some(message) => {
                self.recent.insert(message_id, now);
                ReassemblyOutcome::Completed(message)
            }
            None => ReassemblyOutcome::Rejected,
        }
    }

    fn find_or_allocate(&mut self, message_id: u16, total: u8, now: Instant) -> Option<usize> {
        let mut free_index = None;
        let mut oldest_index = None;
        let mut oldest_time = now;
        for (i, entry) in self.slots.iter().enumerate() {
            match entry {
                Some(slot) if slot.message_id == message_id => return Some(i),
                Some(slot) => {
                    if oldest_index.is_none() || slot.first_seen < oldest_time {
                        oldest_time = slot.first_seen;
                        oldest_index = Some(i);
                    }
                }
                None => {
                    if free_index.is_none() {
                        free_index = Some(i);
                    }
                }
            }
        }
        // Table full: evict the oldest incomplete message so a flood of ids
        // cannot pin the table.
        let target = free_index.or(oldest_index)?;
        self.slots[target] = Some(IncomingMessage::new(message_id, total, now));
        Some(target)
    }
}
