//! Application task: the line-oriented command shell and the beacon timer.
//!
//! Commands arrive as whole lines through the command queue (the integrator
//! owns the physical serial port and splits lines). Replies and engine
//! diagnostics leave through the console queue. Outgoing messages are handed
//! to the radio task as composed [`RadioMessage`]s over the request queue;
//! this task never touches the radio or the protocol state.

use core::fmt::Write as _;

use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant, Timer};
use log::{log, Level};

use crate::console::{self, ConsoleLine};
use crate::gps::GpsState;
use crate::messages::RadioMessage;
use crate::{CommandQueueReceiver, ConsoleQueueSender, DeviceName, OutgoingRequestQueueSender, MAX_NODE_COUNT};

/// Beacon-timer granularity; command handling itself wakes on arrival.
const APP_TICK: Duration = Duration::from_millis(100);

#[embassy_executor::task(pool_size = MAX_NODE_COUNT)]
pub(crate) async fn app_task(
    command_receiver: CommandQueueReceiver,
    outgoing_sender: OutgoingRequestQueueSender,
    console_sender: ConsoleQueueSender,
    gps_state: &'static GpsState,
    device_name: DeviceName,
    beacon_interval_ms: u32,
    beacon_enabled: bool,
) -> ! {
    log!(Level::Info, "Application task started as {}", device_name.as_str());
    let beacon_interval = Duration::from_millis(beacon_interval_ms as u64);
    let mut last_beacon = Instant::now();
    loop {
        match select(command_receiver.receive(), Timer::after(APP_TICK)).await {
            Either::First(line) => {
                handle_command(line.as_str().trim(), &device_name, gps_state, &outgoing_sender, &console_sender);
            }
            Either::Second(_) => {}
        }

        if beacon_enabled && last_beacon.elapsed() >= beacon_interval {
            last_beacon = Instant::now();
            let fix = gps_state.lock(|cell| cell.get());
            if fix.valid {
                if let Some(beacon) = RadioMessage::new_beacon(device_name.as_str(), &fix) {
                    enqueue(beacon, &outgoing_sender, &console_sender);
                }
            } else {
                log!(Level::Debug, "Skipping periodic beacon, no GPS fix");
            }
        }
    }
}

/// Translates one command line into queue traffic and console replies.
fn handle_command(
    line: &str,
    device_name: &DeviceName,
    gps_state: &GpsState,
    outgoing_sender: &OutgoingRequestQueueSender,
    console_sender: &ConsoleQueueSender,
) {
    if let Some(body) = line.strip_prefix("AT+MSG=") {
        match RadioMessage::new_broadcast(device_name.as_str(), body) {
            Some(message) => enqueue(message, outgoing_sender, console_sender),
            None => reply(console_sender, console::line(format_args!("ERR|TOO_LONG"))),
        }
        return;
    }

    if let Some(rest) = line.strip_prefix("AT+DMSG=") {
        let Some((recipient, body)) = rest.split_once('|') else {
            reply(console_sender, console::line(format_args!("ERR|UNKNOWN_CMD")));
            return;
        };
        match RadioMessage::new_directed(device_name.as_str(), recipient, body) {
            Some(message) => enqueue(message, outgoing_sender, console_sender),
            None => reply(console_sender, console::line(format_args!("ERR|TOO_LONG"))),
        }
        return;
    }

    match line {
        "AT+BEACON" => {
            let fix = gps_state.lock(|cell| cell.get());
            if !fix.valid {
                reply(console_sender, console::line(format_args!("GPS|INVALID")));
                return;
            }
            if let Some(beacon) = RadioMessage::new_beacon(device_name.as_str(), &fix) {
                enqueue(beacon, outgoing_sender, console_sender);
            }
        }
        "AT+GPS?" => {
            let fix = gps_state.lock(|cell| cell.get());
            if fix.valid {
                let mut record = ConsoleLine::new();
                let _ = write!(
                    record,
                    "GPS|{:.6},{:.6},{:.1},{:.1},{:.1},{}",
                    fix.latitude, fix.longitude, fix.altitude, fix.speed, fix.course, fix.satellites
                );
                reply(console_sender, record);
            } else {
                reply(console_sender, console::line(format_args!("GPS|INVALID")));
            }
        }
        "AT+DEVICE?" => {
            reply(console_sender, console::line(format_args!("NODE|READY|{}", device_name.as_str())));
        }
        _ => {
            reply(console_sender, console::line(format_args!("ERR|UNKNOWN_CMD")));
        }
    }
}

fn enqueue(message: RadioMessage, outgoing_sender: &OutgoingRequestQueueSender, console_sender: &ConsoleQueueSender) {
    if outgoing_sender.try_send(message).is_err() {
        log!(Level::Warn, "Outgoing request queue full, dropping message");
        reply(console_sender, console::line(format_args!("ERR|QUEUE_FULL")));
    }
}

fn reply(console_sender: &ConsoleQueueSender, record: ConsoleLine) {
    if console_sender.try_send(record).is_err() {
        log!(Level::Warn, "Console queue full, dropping reply");
    }
}
