//! Position snapshot shared between the integrator's GPS driver and the
//! application task.
//!
//! The crate never talks to GPS hardware. The integrator feeds fixes in
//! through [`crate::NodeCommunicationManager::update_gps`]; the application
//! task reads the latest snapshot when a beacon or `AT+GPS?` query needs one.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

/// Latest known position fix.
///
/// `valid` is false until the first real fix arrives; an invalid fix
/// suppresses beacons instead of broadcasting zeroed coordinates.
#[derive(Clone, Copy, PartialEq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above sea level.
    pub altitude: f32,
    /// Kilometers per hour.
    pub speed: f32,
    /// Course over ground in degrees.
    pub course: f32,
    pub satellites: u8,
    pub valid: bool,
}

impl GpsFix {
    pub const fn invalid() -> Self {
        GpsFix {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            speed: 0.0,
            course: 0.0,
            satellites: 0,
            valid: false,
        }
    }
}

/// Shared cell holding the most recent fix. Written by the integrator,
/// read by the application task; both sides copy the whole struct under a
/// short critical section.
pub(crate) type GpsState = Mutex<CriticalSectionRawMutex, Cell<GpsFix>>;

pub(crate) const fn new_gps_state() -> GpsState {
    Mutex::new(Cell::new(GpsFix::invalid()))
}
