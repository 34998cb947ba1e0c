//! # Radio Device Simulator - Testing and Development Mock
//!
//! Queue-backed radio device for multi-node testing without hardware. The
//! device itself knows nothing about topology: it hands every transmitted
//! frame to an external network simulator through its output queue and
//! receives whatever the simulator decides to deliver through its input
//! queue. Packet loss, duplication and contention are all the simulator's
//! choices, which is exactly what makes lossy-link scenarios reproducible.
//!
//! ## Wiring
//!
//! ```rust,ignore
//! use embassy_sync::channel::Channel;
//! use farlink_radio_lib::radio_devices::simulator::*;
//!
//! static UPLINK: SimulatorFrameQueue = Channel::new();
//! static DOWNLINK: SimulatorFrameQueue = Channel::new();
//!
//! let radio = RadioDevice::with(UPLINK.sender(), DOWNLINK.receiver());
//! // a simulator task moves frames from UPLINK into the DOWNLINK of peers
//! ```

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Timer};
use log::{log, Level};

use crate::radio_devices::{RadioDeviceError, RadioDeviceTrait};
use crate::RADIO_PACKET_SIZE;

/// One simulated on-air frame, always a full block.
pub type SimulatorFrame = [u8; RADIO_PACKET_SIZE];

const SIMULATOR_FRAME_QUEUE_SIZE: usize = 16;

/// Frame channel between a device and the network simulator.
pub type SimulatorFrameQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, SimulatorFrame, SIMULATOR_FRAME_QUEUE_SIZE>;

/// Sending side of a simulator frame channel.
pub type SimulatorFrameQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, SimulatorFrame, SIMULATOR_FRAME_QUEUE_SIZE>;

/// Receiving side of a simulator frame channel.
pub type SimulatorFrameQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, SimulatorFrame, SIMULATOR_FRAME_QUEUE_SIZE>;

/// Simulated radio device bridged to a network simulator.
pub struct RadioDevice {
    uplink: SimulatorFrameQueueSender,
    downlink: SimulatorFrameQueueReceiver,
}

impl RadioDevice {
    /// Builds a device from the two channel endpoints the network simulator
    /// owns the other sides of.
    pub const fn with(uplink: SimulatorFrameQueueSender, downlink: SimulatorFrameQueueReceiver) -> Self {
        RadioDevice { uplink, downlink }
    }
}

impl RadioDeviceTrait for RadioDevice {
    async fn transmit(&mut self, data: &[u8]) -> Result<(), RadioDeviceError> {
        if data.len() != RADIO_PACKET_SIZE {
            return Err(RadioDeviceError::TransmissionFailed);
        }
        let mut frame = [0u8; RADIO_PACKET_SIZE];
        frame.copy_from_slice(data);
        if self.uplink.try_send(frame).is_err() {
            // The simulated channel is saturated; a real radio would have
            // burned the airtime just the same.
            log!(Level::Warn, "Simulator uplink full, frame lost");
        }
        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, RadioDeviceError> {
        if buffer.len() < RADIO_PACKET_SIZE {
            return Err(RadioDeviceError::ReceptionFailed);
        }
        match select(self.downlink.receive(), Timer::after(timeout)).await {
            Either::First(frame) => {
                buffer[..RADIO_PACKET_SIZE].copy_from_slice(&frame);
                Ok(RADIO_PACKET_SIZE)
            }
            Either::Second(_) => Err(RadioDeviceError::Timeout),
        }
    }

    fn start_receive(&mut self) {
        // The simulated receiver never stops listening.
    }
}
