#![cfg_attr(not(feature = "std"), no_std)]
#![allow(async_fn_in_trait)] // We control the usage of this trait

#[cfg(all(feature = "radio-device-echo", feature = "radio-device-simulator"))]
compile_error!("Only one radio implementation feature can be enabled at a time");

#[cfg(all(not(test), not(any(feature = "radio-device-echo", feature = "radio-device-simulator"))))]
compile_error!("At least one radio implementation feature must be enabled");

mod app_task;
mod console;
mod engine;
mod envelope;
mod gps;
pub mod messages;
pub mod radio_devices;
mod reassembly;
mod send_queue;

#[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
mod radio_task;

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::Duration;
use log::{log, Level};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

pub use console::ConsoleLine;
pub use gps::GpsFix;
pub use messages::{ParsedMessage, RadioMessage, RadioPacket};
pub use radio_devices::{RadioDeviceError, RadioDeviceTrait};

use gps::GpsState;

// Wire-format constants; changing any of these breaks compatibility with
// deployed nodes.
pub const RADIO_PACKET_SIZE: usize = 16;
pub const FRAGMENT_HEADER_SIZE: usize = 5;
pub const FRAGMENT_DATA_SIZE: usize = RADIO_PACKET_SIZE - FRAGMENT_HEADER_SIZE;

// Capacity constants; these only bound memory usage on a node.
pub const MAX_MESSAGE_SIZE: usize = 300;
pub const MAX_DEVICE_NAME_SIZE: usize = 15;
pub const CONSOLE_LINE_SIZE: usize = 384;
pub(crate) const MAX_FRAGMENT_COUNT: usize = MAX_MESSAGE_SIZE.div_ceil(FRAGMENT_DATA_SIZE);
pub(crate) const INCOMING_TABLE_SIZE: usize = 8;
pub(crate) const RECENT_IDS_SIZE: usize = 16;
pub(crate) const SEND_QUEUE_SIZE: usize = 8;

/// Window during which a completed message id is remembered and duplicates
/// are suppressed (but still re-confirmed).
pub(crate) const BROADCAST_MEMORY_TIME: Duration = Duration::from_secs(30);

#[cfg(feature = "radio-device-simulator")]
pub(crate) const MAX_NODE_COUNT: usize = 16;

#[cfg(not(feature = "radio-device-simulator"))]
pub(crate) const MAX_NODE_COUNT: usize = 1;

const COMMAND_QUEUE_SIZE: usize = 4;
pub(crate) type CommandQueue = Channel<CriticalSectionRawMutex, ConsoleLine, COMMAND_QUEUE_SIZE>;
pub(crate) type CommandQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ConsoleLine, COMMAND_QUEUE_SIZE>;
pub(crate) type CommandQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ConsoleLine, COMMAND_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static COMMAND_QUEUE: CommandQueue = Channel::new();

const CONSOLE_QUEUE_SIZE: usize = 16;
pub(crate) type ConsoleQueue = Channel<CriticalSectionRawMutex, ConsoleLine, CONSOLE_QUEUE_SIZE>;
pub(crate) type ConsoleQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ConsoleLine, CONSOLE_QUEUE_SIZE>;
pub(crate) type ConsoleQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ConsoleLine, CONSOLE_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static CONSOLE_QUEUE: ConsoleQueue = Channel::new();

pub(crate) const OUTGOING_REQUEST_QUEUE_SIZE: usize = 4;
pub(crate) type OutgoingRequestQueue = Channel<CriticalSectionRawMutex, RadioMessage, OUTGOING_REQUEST_QUEUE_SIZE>;
pub(crate) type OutgoingRequestQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, RadioMessage, OUTGOING_REQUEST_QUEUE_SIZE>;
pub(crate) type OutgoingRequestQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, RadioMessage, OUTGOING_REQUEST_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static OUTGOING_REQUEST_QUEUE: OutgoingRequestQueue = Channel::new();

#[cfg(feature = "embedded")]
static GPS_STATE: GpsState = gps::new_gps_state();

/// Node name carried in every outgoing message and confirm.
///
/// At most [`MAX_DEVICE_NAME_SIZE`] printable ASCII bytes. The pipe
/// character is excluded because the message grammar is pipe-delimited.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct DeviceName {
    bytes: [u8; MAX_DEVICE_NAME_SIZE],
    length: u8,
}

impl DeviceName {
    pub fn new(name: &str) -> Option<DeviceName> {
        if name.is_empty() || name.len() > MAX_DEVICE_NAME_SIZE {
            return None;
        }
        if !name.bytes().all(|b| (b.is_ascii_graphic() || b == b' ') && b != b'|') {
            return None;
        }
        let mut bytes = [0u8; MAX_DEVICE_NAME_SIZE];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Some(DeviceName {
            bytes,
            length: name.len() as u8,
        })
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.length as usize]).unwrap_or("")
    }
}

/// Node configuration consumed once at [`NodeCommunicationManager::initialize`].
///
/// `frequency` and `tx_power` are carried for the radio device integration
/// (modem setup happens before the device is handed over); the engine itself
/// reads `device_name`, `max_retries` and `retry_interval_ms`.
pub struct NodeConfiguration {
    pub device_name: DeviceName,
    /// Carrier frequency in MHz, consumed by the radio device integration.
    pub frequency: f32,
    /// Transmit power in dBm, consumed by the radio device integration.
    pub tx_power: i8,
    /// Transmission attempts per fragment before the message fails finally.
    pub max_retries: u8,
    /// Minimum delay in milliseconds between bursts of the same message.
    pub retry_interval_ms: u32,
    /// Delay in milliseconds between periodic position beacons.
    pub beacon_interval_ms: u32,
    pub beacon_enabled: bool,
    /// Delay in milliseconds between individual fragments within a burst.
    pub delay_between_tx_packets_ms: u16,
    /// 128-bit pre-shared fragment key, identical on every node.
    pub cipher_key: [u8; 16],
}

#[cfg_attr(feature = "std", derive(Debug))]
pub enum SubmitCommandError {
    NotInited,
    LineTooLong,
    ChannelFull,
}

#[cfg_attr(feature = "std", derive(Debug))]
pub enum ReadConsoleError {
    NotInited,
}

#[cfg_attr(feature = "std", derive(Debug))]
pub enum UpdateGpsError {
    NotInited,
}

enum NodeManagerState {
    Uninitialized,
    Initialized {
        command_sender: CommandQueueSender,
        console_receiver: ConsoleQueueReceiver,
        gps_state: &'static GpsState,
    },
}

/// Entry point of the crate: wires the queues, spawns the radio and
/// application tasks and exposes the host-facing surface (command lines in,
/// console records out, GPS fixes in).
pub struct NodeCommunicationManager {
    state: NodeManagerState,
}

impl Default for NodeCommunicationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCommunicationManager {
    pub const fn new() -> Self {
        NodeCommunicationManager {
            state: NodeManagerState::Uninitialized,
        }
    }

    #[cfg(all(feature = "embedded", any(feature = "radio-device-echo", feature = "radio-device-simulator")))]
    pub fn initialize(
        &mut self,
        config: NodeConfiguration,
        spawner: Spawner,
        radio_device: radio_devices::RadioDevice,
        rng_seed: u64,
    ) -> Result<(), ()> {
        self.initialize_common(
            config,
            spawner,
            radio_device,
            &COMMAND_QUEUE,
            &CONSOLE_QUEUE,
            &OUTGOING_REQUEST_QUEUE,
            &GPS_STATE,
            rng_seed,
        )
    }

    #[cfg(all(feature = "std", any(feature = "radio-device-echo", feature = "radio-device-simulator")))]
    pub fn initialize(
        &mut self,
        config: NodeConfiguration,
        spawner: Spawner,
        radio_device: radio_devices::RadioDevice,
        rng_seed: u64,
    ) -> Result<(), ()> {
        let command_queue: &'static CommandQueue = Box::leak(Box::new(Channel::new()));
        let console_queue: &'static ConsoleQueue = Box::leak(Box::new(Channel::new()));
        let outgoing_queue: &'static OutgoingRequestQueue = Box::leak(Box::new(Channel::new()));
        let gps_state: &'static GpsState = Box::leak(Box::new(gps::new_gps_state()));
        self.initialize_common(config, spawner, radio_device, command_queue, console_queue, outgoing_queue, gps_state, rng_seed)
    }

    #[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
    fn initialize_common(
        &mut self,
        config: NodeConfiguration,
        spawner: Spawner,
        radio_device: radio_devices::RadioDevice,
        command_queue: &'static CommandQueue,
        console_queue: &'static ConsoleQueue,
        outgoing_queue: &'static OutgoingRequestQueue,
        gps_state: &'static GpsState,
        rng_seed: u64,
    ) -> Result<(), ()> {
        let mut rng = WyRand::seed_from_u64(rng_seed);

        let NodeConfiguration {
            device_name,
            frequency: _,
            tx_power: _,
            max_retries,
            retry_interval_ms,
            beacon_interval_ms,
            beacon_enabled,
            delay_between_tx_packets_ms,
            cipher_key,
        } = config;

        let radio_task_result = spawner.spawn(radio_task::radio_task(
            radio_device,
            outgoing_queue.receiver(),
            console_queue.sender(),
            device_name,
            max_retries,
            retry_interval_ms,
            delay_between_tx_packets_ms,
            cipher_key,
            rng.next_u64(),
        ));
        if radio_task_result.is_err() {
            return Err(());
        }
        log!(Level::Debug, "Radio task spawned");

        let app_task_result = spawner.spawn(app_task::app_task(
            command_queue.receiver(),
            outgoing_queue.sender(),
            console_queue.sender(),
            gps_state,
            device_name,
            beacon_interval_ms,
            beacon_enabled,
        ));
        if app_task_result.is_err() {
            return Err(());
        }
        log!(Level::Debug, "Application task spawned");
        log!(Level::Info, "Node communication initialized");

        self.state = NodeManagerState::Initialized {
            command_sender: command_queue.sender(),
            console_receiver: console_queue.receiver(),
            gps_state,
        };
        Ok(())
    }

    /// Feeds one command line (without the terminating newline) into the
    /// application task.
    pub fn submit_command(&self, line: &str) -> Result<(), SubmitCommandError> {
        let command_sender = match &self.state {
            NodeManagerState::Uninitialized => return Err(SubmitCommandError::NotInited),
            NodeManagerState::Initialized { command_sender, .. } => command_sender,
        };
        let record = ConsoleLine::from_str(line).ok_or(SubmitCommandError::LineTooLong)?;
        command_sender.try_send(record).map_err(|_| SubmitCommandError::ChannelFull)?;
        Ok(())
    }

    /// Awaits the next console record (command reply or engine diagnostic).
    pub async fn read_console(&self) -> Result<ConsoleLine, ReadConsoleError> {
        let console_receiver = match &self.state {
            NodeManagerState::Uninitialized => return Err(ReadConsoleError::NotInited),
            NodeManagerState::Initialized { console_receiver, .. } => console_receiver,
        };
        Ok(console_receiver.receive().await)
    }

    /// Publishes the latest GPS fix for beacons and `AT+GPS?` replies.
    pub fn update_gps(&self, fix: GpsFix) -> Result<(), UpdateGpsError> {
        let gps_state = match &self.state {
            NodeManagerState::Uninitialized => return Err(UpdateGpsError::NotInited),
            NodeManagerState::Initialized { gps_state, .. } => gps_state,
        };
        gps_state.lock(|cell| cell.set(fix));
        Ok(())
    }
}
