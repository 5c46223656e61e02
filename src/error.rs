//! Error taxonomy for the GPIO, radio, and receiver layers (spec.md §7).

use thiserror::Error;

/// Failures opening or waiting on the edge-notification GPIO line.
#[derive(Debug, Error)]
pub enum GpioError {
    #[error("gpio pin {0} out of range (expected 1..=40)")]
    PinOutOfRange(u8),
    #[error("failed to open gpio line {pin}: {source}")]
    Open {
        pin: u8,
        #[source]
        source: rppal::gpio::Error,
    },
    #[error("gpio edge wait failed: {0}")]
    Wait(#[source] rppal::gpio::Error),
}

/// Failures in the SPI-attached radio frontend.
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("failed to open spi device: {0}")]
    Open(#[source] rppal::spi::Error),
    #[error("spi transfer failed: {0}")]
    Transfer(#[source] rppal::spi::Error),
    #[error("cc1101 did not reach rx state after {attempts} polls (last state code 0x{code:02X})")]
    RxStateTimeout { attempts: u32, code: u8 },
}

/// Construction-time failure of a [`crate::receiver::Receiver`].
///
/// A `Receiver` that fails to construct never exists as a half-initialized
/// object (unlike the C++ original's `getState() == ERROR` after a
/// same-constructor failure) — Rust's fallible-constructor idiom surfaces
/// this directly as `Err` from `Receiver::new`.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error(transparent)]
    Gpio(#[from] GpioError),
    #[error(transparent)]
    Radio(#[from] RadioError),
}
