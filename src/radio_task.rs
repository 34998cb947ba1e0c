//! Radio task: the single owner of the radio device and the protocol engine.
//!
//! One loop iteration is one engine tick: listen for a short window,
//! dispatch whatever arrived, drain newly requested outgoing messages, reap
//! finished ones, transmit at most one due fragment, re-arm the receiver
//! and yield. The radio is half-duplex, so receiving and transmitting are
//! strictly interleaved here and nowhere else.

use embassy_time::{Duration, Instant, Timer};
use log::{log, Level};

use crate::engine::ProtocolEngine;
use crate::radio_devices::{RadioDevice, RadioDeviceError, RadioDeviceTrait};
use crate::{ConsoleQueueSender, DeviceName, OutgoingRequestQueueReceiver, MAX_NODE_COUNT, RADIO_PACKET_SIZE};

/// How long one tick listens before giving the transmit side a chance.
const RECEIVE_WINDOW: Duration = Duration::from_millis(50);

/// Cooperative yield at the bottom of every tick.
const IDLE_YIELD: Duration = Duration::from_millis(5);

#[embassy_executor::task(pool_size = MAX_NODE_COUNT)]
pub(crate) async fn radio_task(
    radio_device: RadioDevice,
    outgoing_request_receiver: OutgoingRequestQueueReceiver,
    console_sender: ConsoleQueueSender,
    device_name: DeviceName,
    max_retries: u8,
    retry_interval_ms: u32,
    delay_between_tx_packets_ms: u16,
    cipher_key: [u8; 16],
    rng_seed: u64,
) -> ! {
    log!(Level::Info, "Radio task started as {}", device_name.as_str());
    let engine = ProtocolEngine::new(
        device_name,
        max_retries,
        Duration::from_millis(retry_interval_ms as u64),
        Duration::from_millis(delay_between_tx_packets_ms as u64),
        &cipher_key,
        rng_seed,
        console_sender,
    );
    drive(radio_device, engine, outgoing_request_receiver).await
}

async fn drive<D: RadioDeviceTrait>(
    mut radio_device: D,
    mut engine: ProtocolEngine,
    outgoing_request_receiver: OutgoingRequestQueueReceiver,
) -> ! {
    let mut rx_buffer = [0u8; RADIO_PACKET_SIZE];
    loop {
        // Listen window first so confirmations are heard between our own
        // transmissions.
        match radio_device.receive(&mut rx_buffer, RECEIVE_WINDOW).await {
            Ok(length) => {
                if let Some(confirm) = engine.handle_inbound(&rx_buffer[..length], Instant::now()) {
                    if let Err(error) = radio_device.transmit(&confirm.data).await {
                        log!(Level::Warn, "Failed to transmit confirm: {}", error.code());
                    }
                    radio_device.start_receive();
                }
            }
            Err(RadioDeviceError::Timeout) => {}
            Err(error) => {
                log!(Level::Warn, "Radio receive failed: {}", error.code());
            }
        }

        while let Ok(message) = outgoing_request_receiver.try_receive() {
            engine.enqueue_message(&message);
        }

        engine.reap();

        // At most one fragment per tick; inter-fragment spacing and retry
        // pacing are both timestamp checks inside the queue, so the loop is
        // back to listening right away.
        if let Some(attempt) = engine.next_attempt(Instant::now()) {
            let result = radio_device.transmit(&attempt.block).await;
            engine.report_attempt(&attempt, result);
        }

        radio_device.start_receive();
        Timer::after(IDLE_YIELD).await;
    }
}
