//! Actuator backends.
//!
//! The controller drives the physical relay through the [`ActuatorBackend`]
//! capability trait so the same state machine runs against real GPIO pins or
//! an in-memory simulator. Backends carry no concurrency of their own: every
//! call arrives serialized from inside the controller's lock, and the
//! backend is exclusively owned by the controller that drives it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ButtonResult;

/// Capability interface over the physical (or simulated) actuator.
///
/// `setup` performs one-time initialization and must not block
/// indefinitely. `drive_high` / `drive_low` change the actuator output and
/// are safe to call redundantly. `sense_on` returns the instantaneous
/// sensed logic level; sense reads are assumed to always succeed
/// (hardware-level faults are out of scope).
pub trait ActuatorBackend: Send {
    /// One-time initialization, called once at controller start.
    ///
    /// # Errors
    ///
    /// Returns [`ButtonError::BackendUnavailable`] when the backend cannot
    /// be brought up.
    fn setup(&mut self) -> ButtonResult<()>;

    /// Assert the actuator output.
    fn drive_high(&mut self);

    /// Deassert the actuator output.
    fn drive_low(&mut self);

    /// Read the sensed logic level of the controlled circuit.
    fn sense_on(&mut self) -> bool;
}

/// In-memory actuator used on hosts without GPIO access and in tests.
///
/// Models the controlled circuit changing state after a completed press:
/// `drive_low` (the end of a press) toggles the sensed level, the way a
/// garage door ends up in the opposite position after the opener button is
/// released. The shared [`level`](SimulatedBackend::level) flag lets tests
/// flip the sensed state externally, as a manual override would.
pub struct SimulatedBackend {
    level: Arc<AtomicBool>,
}

impl SimulatedBackend {
    /// Create a simulator sensing "off".
    #[must_use]
    pub fn new() -> Self {
        Self {
            level: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle to the simulated sense level, for external manipulation.
    #[must_use]
    pub fn level(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.level)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ActuatorBackend for SimulatedBackend {
    fn setup(&mut self) -> ButtonResult<()> {
        Ok(())
    }

    fn drive_high(&mut self) {}

    fn drive_low(&mut self) {
        self.level
            .fetch_xor(true, Ordering::SeqCst);
    }

    fn sense_on(&mut self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

/// Raspberry Pi GPIO actuator backed by rppal.
///
/// The sense pin is configured as an input with pull-up, the drive pin as
/// an output held low. Construction claims both pins and fails with
/// [`ButtonError::BackendUnavailable`] when the GPIO memory map is not
/// accessible (not running on a Pi, or missing permissions); the owner is
/// expected to fall back to [`SimulatedBackend`] or refuse to start.
#[cfg(feature = "hardware")]
pub struct GpioBackend {
    input: rppal::gpio::InputPin,
    output: rppal::gpio::OutputPin,
}

#[cfg(feature = "hardware")]
impl GpioBackend {
    /// Claim the sense and drive pins (BCM numbering).
    ///
    /// # Errors
    ///
    /// Returns [`ButtonError::BackendUnavailable`] when the GPIO peripheral
    /// or either pin cannot be acquired.
    pub fn new(input_pin: u8, output_pin: u8) -> ButtonResult<Self> {
        let gpio = rppal::gpio::Gpio::new()
            .map_err(|e| ButtonError::backend_unavailable(format!("gpio open failed: {e}")))?;
        let input = gpio
            .get(input_pin)
            .map_err(|e| {
                ButtonError::backend_unavailable(format!("input pin {input_pin} unavailable: {e}"))
            })?
            .into_input_pullup();
        let output = gpio
            .get(output_pin)
            .map_err(|e| {
                ButtonError::backend_unavailable(format!(
                    "output pin {output_pin} unavailable: {e}"
                ))
            })?
            .into_output_low();
        Ok(Self { input, output })
    }
}

#[cfg(feature = "hardware")]
impl ActuatorBackend for GpioBackend {
    fn setup(&mut self) -> ButtonResult<()> {
        // Pins are configured at construction; re-assert the resting level.
        self.output.set_low();
        Ok(())
    }

    fn drive_high(&mut self) {
        self.output.set_high();
    }

    fn drive_low(&mut self) {
        self.output.set_low();
    }

    fn sense_on(&mut self) -> bool {
        self.input.is_high()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_backend_toggles_on_release() {
        let mut backend = SimulatedBackend::new();
        assert!(!backend.sense_on());

        backend.drive_high();
        assert!(!backend.sense_on());

        backend.drive_low();
        assert!(backend.sense_on());

        backend.drive_low();
        assert!(!backend.sense_on());
    }

    #[test]
    fn simulated_level_is_shared() {
        let mut backend = SimulatedBackend::new();
        let level = backend.level();
        level.store(true, Ordering::SeqCst);
        assert!(backend.sense_on());
    }
}
