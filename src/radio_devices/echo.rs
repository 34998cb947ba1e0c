//! # Radio Device Echo - Loopback Device for Testing
//!
//! The simplest possible radio implementation: every transmitted frame is
//! queued internally and handed back by the next `receive` call. No timing
//! simulation, no channel contention, no hardware.
//!
//! A node talking through this device hears its own fragments, reassembles
//! its own messages and acknowledges itself, which exercises the whole
//! fragment → envelope → reassembly → confirm pipeline on a single node.
//! Useful for smoke-testing the stack and for development without radio
//! hardware; multi-node behavior needs the simulator device instead.

use embassy_time::{Duration, Timer};
use log::{log, Level};

use crate::radio_devices::{RadioDeviceError, RadioDeviceTrait};
use crate::RADIO_PACKET_SIZE;

const LOOPBACK_QUEUE_SIZE: usize = 8;

/// Loopback radio device.
///
/// Holds a small internal ring of pending frames. When the ring is full the
/// oldest frame is dropped, mimicking a receiver that was not listening in
/// time.
pub struct RadioDevice {
    frames: [[u8; RADIO_PACKET_SIZE]; LOOPBACK_QUEUE_SIZE],
    head: usize,
    pending: usize,
}

impl Default for RadioDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioDevice {
    pub const fn new() -> Self {
        RadioDevice {
            frames: [[0u8; RADIO_PACKET_SIZE]; LOOPBACK_QUEUE_SIZE],
            head: 0,
            pending: 0,
        }
    }
}

impl RadioDeviceTrait for RadioDevice {
    async fn transmit(&mut self, data: &[u8]) -> Result<(), RadioDeviceError> {
        if data.len() != RADIO_PACKET_SIZE {
            return Err(RadioDeviceError::TransmissionFailed);
        }
        if self.pending == LOOPBACK_QUEUE_SIZE {
            // Oldest frame is lost, exactly like a missed reception.
            log!(Level::Warn, "Echo device queue full, dropping oldest frame");
            self.head = (self.head + 1) % LOOPBACK_QUEUE_SIZE;
            self.pending -= 1;
        }
        let tail = (self.head + self.pending) % LOOPBACK_QUEUE_SIZE;
        self.frames[tail].copy_from_slice(data);
        self.pending += 1;
        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, RadioDeviceError> {
        if self.pending == 0 {
            Timer::after(timeout).await;
            if self.pending == 0 {
                return Err(RadioDeviceError::Timeout);
            }
        }
        if buffer.len() < RADIO_PACKET_SIZE {
            return Err(RadioDeviceError::ReceptionFailed);
        }
        buffer[..RADIO_PACKET_SIZE].copy_from_slice(&self.frames[self.head]);
        self.head = (self.head + 1) % LOOPBACK_QUEUE_SIZE;
        self.pending -= 1;
        Ok(RADIO_PACKET_SIZE)
    }

    fn start_receive(&mut self) {
        // Nothing to re-arm: the loopback is always listening.
    }
}
