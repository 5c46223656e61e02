//! 433.92 MHz Cresta/Hideki weather-sensor reception and decoding engine.
//!
//! This crate is the host-side Linux half of a wireless weather-sensor
//! bridge: it captures pulse-width-modulated RF edges off a GPIO line,
//! optionally drives a CC1101 sub-GHz transceiver over SPI into continuous
//! receive, and decodes the resulting pulse stream with a biphase-mark
//! (Cresta/Hideki) bit-assembly state machine into validated, checksummed
//! frames with an averaged RSSI.
//!
//! What it does *not* do: map frame bytes to physical units (temperature,
//! humidity, wind speed), transmit, filter by sensor identity, or keep a
//! history of past frames. Those are a host application's job; this crate
//! hands back `(frame, length, rssi)` and stops there.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hideki_rf::{Decoder, NullRadio, Receiver};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let receiver = Arc::new(Receiver::new(17, NullRadio)?);
//! let decoder = Decoder::new(receiver);
//! if !decoder.start() {
//!     return Err("decoder failed to start".into());
//! }
//!
//! if let Some(frame) = decoder.fetch() {
//!     println!("decoded {} bytes at {:.1} dBm", frame.length, frame.rssi);
//! }
//!
//! decoder.stop();
//! # Ok(())
//! # }
//! ```

mod barrier;
mod decoder;
mod error;
mod gpio;
mod pulse;
mod radio;
mod receiver;

pub use decoder::{Decoder, Fetched, FrameBuffer, FRAME_CAPACITY, PREAMBLE_BYTE};
pub use error::{GpioError, ReceiverError, RadioError};
pub use gpio::{EdgeEvent, GpioEdgeSource, PIN_RANGE};
pub use pulse::{Pulse, GLITCH_FLOOR_US};
pub use radio::{Cc1101Radio, DataPin, DeviceState, NullRadio, RadioFrontend};
pub use receiver::{Receiver, Timeout};

pub use rppal::spi::{Bus, SlaveSelect};
