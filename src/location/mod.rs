//! Location driver state.
//!
//! An explicit state object around a pluggable position source. Drivers are
//! picked by identifier; the null driver always exists so callers can hold a
//! [`LocationState`] unconditionally. Activation and ownership are separate:
//! the frontend activates the driver, a content session additionally takes
//! ownership while it consumes position updates.

use tracing::{debug, warn};

/// A position fix reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters, when the driver knows it.
    pub horizontal_accuracy: Option<f64>,
    pub vertical_accuracy: Option<f64>,
}

/// A source of position fixes.
pub trait LocationDriver: Send {
    fn ident(&self) -> &'static str;

    /// Begin producing fixes. Idempotent.
    fn start(&mut self) -> bool;

    /// Stop producing fixes. Idempotent.
    fn stop(&mut self);

    /// Latest fix, if one is available since the last poll.
    fn poll(&mut self) -> Option<Position>;

    /// Desired update cadence. Drivers may treat this as a hint.
    fn set_interval(&mut self, interval_ms: u32, distance_m: u32);
}

/// Driver that never produces a fix. Used when no real position source is
/// available or configured.
#[derive(Debug, Default)]
pub struct NullLocationDriver;

impl LocationDriver for NullLocationDriver {
    fn ident(&self) -> &'static str {
        "null"
    }

    fn start(&mut self) -> bool {
        true
    }

    fn stop(&mut self) {}

    fn poll(&mut self) -> Option<Position> {
        None
    }

    fn set_interval(&mut self, _interval_ms: u32, _distance_m: u32) {}
}

/// Look a driver up by identifier. Unknown identifiers fall back to the
/// null driver with a warning.
pub fn driver_by_ident(ident: &str) -> Box<dyn LocationDriver> {
    match ident {
        "null" | "" => Box::new(NullLocationDriver),
        other => {
            warn!("Unknown location driver '{}', using null driver", other);
            Box::new(NullLocationDriver)
        }
    }
}

/// Activation and ownership state around one driver instance.
pub struct LocationState {
    driver: Box<dyn LocationDriver>,
    active: bool,
    owned: bool,
}

impl LocationState {
    pub fn new(driver: Box<dyn LocationDriver>) -> Self {
        Self {
            driver,
            active: false,
            owned: false,
        }
    }

    pub fn with_driver_ident(ident: &str) -> Self {
        Self::new(driver_by_ident(ident))
    }

    pub fn driver_ident(&self) -> &'static str {
        self.driver.ident()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Start the driver. Returns whether the driver is active afterwards;
    /// already-active is not an error.
    pub fn activate(&mut self) -> bool {
        if self.active {
            return true;
        }
        self.active = self.driver.start();
        if self.active {
            debug!("Location driver '{}' activated", self.driver.ident());
        } else {
            warn!("Location driver '{}' failed to start", self.driver.ident());
        }
        self.active
    }

    /// Stop the driver and drop any ownership claim. Idempotent.
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.driver.stop();
        self.active = false;
        self.owned = false;
        debug!("Location driver '{}' deactivated", self.driver.ident());
    }

    /// Claim the position stream for a consumer. Fails when inactive or
    /// already owned.
    pub fn take_ownership(&mut self) -> bool {
        if !self.active || self.owned {
            return false;
        }
        self.owned = true;
        true
    }

    /// Release a previous ownership claim. Idempotent.
    pub fn release_ownership(&mut self) {
        self.owned = false;
    }

    pub fn set_interval(&mut self, interval_ms: u32, distance_m: u32) {
        self.driver.set_interval(interval_ms, distance_m);
    }

    /// Latest fix. Only the owner sees fixes; polls while inactive or
    /// unowned return nothing.
    pub fn poll(&mut self) -> Option<Position> {
        if !self.active || !self.owned {
            return None;
        }
        self.driver.poll()
    }
}

impl Drop for LocationState {
    fn drop(&mut self) {
        self.deactivate();
    }
}
