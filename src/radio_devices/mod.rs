//! Radio device implementations
//!
//! This module contains the radio device abstraction and the device
//! implementations that can be enabled one at a time via features:
//!
//! - `echo`: loopback device that hands transmitted frames back to the
//!   receiver, for single-node testing
//! - `simulator`: queue-backed device wired to an external network
//!   simulator, for multi-node testing without hardware
//!
//! Hardware transceivers implement [`RadioDeviceTrait`] in the integrating
//! firmware; initialization is deliberately not part of the trait since pin
//! maps, SPI buses and modem parameters are hardware-specific, and a node
//! has no reason to run at all when its radio fails to come up.

use embassy_time::Duration;

#[cfg(feature = "radio-device-echo")]
pub mod echo;

#[cfg(feature = "radio-device-simulator")]
pub mod simulator;

// Re-export the active radio device implementation
#[cfg(feature = "radio-device-echo")]
pub use echo::RadioDevice;

#[cfg(feature = "radio-device-simulator")]
pub use simulator::RadioDevice;

/// Errors surfaced by radio device operations.
///
/// The numeric codes appear in `SEND|FAIL|...|ERR=<code>` diagnostics, so
/// they are stable protocol surface.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum RadioDeviceError {
    /// No frame arrived within the listen window. The normal idle outcome.
    Timeout,
    /// The device failed to put the frame on the air.
    TransmissionFailed,
    /// The device reported a corrupted or unreadable frame.
    ReceptionFailed,
}

impl RadioDeviceError {
    /// Stable numeric code for host-facing diagnostics.
    pub fn code(&self) -> i16 {
        match self {
            RadioDeviceError::Timeout => -1,
            RadioDeviceError::TransmissionFailed => -2,
            RadioDeviceError::ReceptionFailed => -3,
        }
    }
}

/// Interface the protocol engine drives a radio through.
///
/// The radio is half-duplex: `transmit` takes the channel, and the device is
/// only listening again after `start_receive`. The engine re-arms receive
/// after every transmission for exactly that reason.
pub trait RadioDeviceTrait {
    /// Puts one frame on the air. Blocks (asynchronously) until the radio
    /// has accepted or rejected the frame.
    async fn transmit(&mut self, data: &[u8]) -> Result<(), RadioDeviceError>;

    /// Listens for up to `timeout` and copies a received frame into
    /// `buffer`, returning its length. `Err(Timeout)` when nothing arrived.
    async fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, RadioDeviceError>;

    /// Re-arms the receiver after a transmission.
    fn start_receive(&mut self);
}
