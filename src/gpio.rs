//! `GpioEdgeSource` (spec.md §4.1): subscribes to both-edge interrupts on a
//! GPIO line and hands back one edge event (or a timeout) at a time.

use std::time::Duration;

use rppal::gpio::{Gpio, InputPin, Trigger};

use crate::error::GpioError;

/// Valid GPIO line offsets, inclusive (spec.md §4.1).
pub const PIN_RANGE: std::ops::RangeInclusive<u8> = 1..=40;

/// Result of a single `wait_event` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeEvent {
    /// An edge transition was observed.
    Edge,
    /// No edge arrived before the timeout elapsed. Not an error — spec.md §7
    /// classifies this as `TimeoutEvent`, used only to let the caller re-check
    /// its stop flag.
    Timeout,
}

/// Both-edge interrupt source on a single GPIO line, backed by the Linux
/// gpiochip character device via `rppal` (spec.md §6 prefers the chardev
/// interface over legacy sysfs).
pub struct GpioEdgeSource {
    pin: InputPin,
}

impl GpioEdgeSource {
    /// Configure `pin` as an input with both-edge event notification.
    pub fn open(pin: u8) -> Result<Self, GpioError> {
        if !PIN_RANGE.contains(&pin) {
            return Err(GpioError::PinOutOfRange(pin));
        }

        let gpio = Gpio::new().map_err(|source| GpioError::Open { pin, source })?;
        let mut input = gpio
            .get(pin)
            .map_err(|source| GpioError::Open { pin, source })?
            .into_input();
        input
            .set_interrupt(Trigger::Both, None)
            .map_err(|source| GpioError::Open { pin, source })?;

        Ok(Self { pin: input })
    }

    /// Wait for the next edge. `timeout = None` blocks indefinitely,
    /// matching spec.md §4.1's `timeout<0` convention at this layer's API
    /// boundary (the millisecond/negative encoding lives in
    /// [`crate::receiver::Receiver`]).
    pub fn wait_event(&mut self, timeout: Option<Duration>) -> Result<EdgeEvent, GpioError> {
        match self.pin.poll_interrupt(false, timeout).map_err(GpioError::Wait)? {
            Some(_level) => Ok(EdgeEvent::Edge),
            None => Ok(EdgeEvent::Timeout),
        }
    }

    /// Release the line. Idempotent: dropping a `GpioEdgeSource` does the
    /// same thing, so this is just an explicit early release for callers
    /// that want one.
    pub fn close(self) {
        drop(self)
    }
}
