//! `Receiver` (spec.md §4.3): owns a GPIO pin, a timeout, a [`RadioFrontend`],
//! and the producer side of the pulse queue. Runs one capture thread that
//! turns edge-transition events into filtered pulse durations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::barrier::ReadyBarrier;
use crate::error::ReceiverError;
use crate::gpio::{EdgeEvent, GpioEdgeSource, PIN_RANGE};
use crate::pulse::{pulse_queue, Pulse, PulseReceiver, PulseSender};
use crate::radio::{DeviceState, RadioFrontend};

/// Maximum blocking interval for a single edge-wait; `None` blocks
/// indefinitely (spec.md §4.3, §9: "`setTimeout(ms<0)` means indefinite").
pub type Timeout = Option<Duration>;

struct CaptureThread {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Owns the edge source and radio frontend for one sensor channel and runs
/// the capture thread that drains edges into the pulse queue. A `Decoder`
/// holds a shared handle to a `Receiver` rather than owning it outright
/// (spec.md §9: "a shared handle with weak reference" is an explicitly
/// acceptable rendering of the non-owning back-reference).
pub struct Receiver<R: RadioFrontend> {
    pin: u8,
    timeout: Mutex<Timeout>,
    radio: Arc<Mutex<R>>,
    // `mpsc::{Sender, Receiver}` are `!Sync`; a Decoder's decode thread needs
    // to move an `Arc<Receiver<R>>` across threads, which requires
    // `Receiver<R>: Sync`. Wrapping each end in a `Mutex` buys that back
    // (both ends are only ever touched one call at a time anyway).
    pulses: Mutex<PulseReceiver>,
    pulse_tx: Mutex<PulseSender>,
    capture: Mutex<Option<CaptureThread>>,
    barrier: Arc<ReadyBarrier>,
    gpio_ok: Arc<AtomicBool>,
}

impl<R: RadioFrontend + Send + 'static> Receiver<R> {
    /// Bind a receiver to `pin` with an already-initialised radio frontend.
    /// `radio` having been constructed at all implies it is past its own
    /// device-open failure mode (spec.md §7 `DeviceOpenError`); only the
    /// GPIO pin range is validated here, since the line itself is opened
    /// lazily by the capture thread, same as the C++ original's `receive()`.
    pub fn new(pin: u8, radio: R) -> Result<Self, ReceiverError> {
        if !PIN_RANGE.contains(&pin) {
            return Err(crate::error::GpioError::PinOutOfRange(pin).into());
        }
        let (pulse_tx, pulses) = pulse_queue();
        Ok(Self {
            pin,
            timeout: Mutex::new(None),
            radio: Arc::new(Mutex::new(radio)),
            pulses: Mutex::new(pulses),
            pulse_tx: Mutex::new(pulse_tx),
            capture: Mutex::new(None),
            barrier: Arc::new(ReadyBarrier::new()),
            gpio_ok: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Only permitted while stopped (spec.md §4.3).
    pub fn set_timeout(&self, timeout: Timeout) {
        let capture = self.capture.lock().unwrap();
        if capture.is_none() {
            *self.timeout.lock().unwrap() = timeout;
        }
    }

    /// Delegates to the owned [`RadioFrontend`] (spec.md §4.3 `rssi()`).
    pub fn rssi(&self) -> f64 {
        self.radio.lock().unwrap().rssi()
    }

    /// ERROR if the last capture-thread startup failed to open the GPIO
    /// line, or if the radio frontend itself reports ERROR; INITIALIZED
    /// otherwise (spec.md §3).
    pub fn state(&self) -> DeviceState {
        if !self.gpio_ok.load(Ordering::SeqCst) {
            return DeviceState::Error;
        }
        self.radio.lock().unwrap().state()
    }

    pub fn is_running(&self) -> bool {
        self.capture.lock().unwrap().is_some()
    }

    /// Spawn the capture thread and block until it signals readiness.
    /// Idempotent: a no-op returning `true` if already running (spec.md §4.3,
    /// P8).
    pub fn start(&self) -> bool {
        let mut capture = self.capture.lock().unwrap();
        if capture.is_some() {
            return true;
        }

        self.barrier.reset();
        let stop = Arc::new(AtomicBool::new(false));
        let pin = self.pin;
        let timeout = *self.timeout.lock().unwrap();
        let tx = self.pulse_tx.lock().unwrap().clone();
        let barrier = Arc::clone(&self.barrier);
        let stop_flag = Arc::clone(&stop);
        let gpio_ok = Arc::clone(&self.gpio_ok);

        let handle = match thread::Builder::new()
            .name(format!("hideki-capture-{pin}"))
            .spawn(move || capture_loop(pin, timeout, tx, stop_flag, barrier, gpio_ok))
        {
            Ok(handle) => handle,
            Err(err) => {
                error!("failed to spawn capture thread for gpio {pin}: {err}");
                return false;
            }
        };

        let ok = self.barrier.wait();
        if ok {
            *capture = Some(CaptureThread { handle, stop });
        } else {
            let _ = handle.join();
        }
        ok
    }

    /// Idempotent: a no-op if not running (spec.md §4.3, P8).
    pub fn stop(&self) {
        let mut capture = self.capture.lock().unwrap();
        if let Some(thread) = capture.take() {
            thread.stop.store(true, Ordering::SeqCst);
            let _ = thread.handle.join();
        }
    }

    /// Nonblocking try-dequeue (spec.md §4.3 `next_pulse()`).
    pub fn next_pulse(&self) -> Option<Pulse> {
        self.pulses.lock().unwrap().try_dequeue()
    }
}

impl<R: RadioFrontend> Drop for Receiver<R> {
    fn drop(&mut self) {
        // `stop()` only touches a mutex and an atomic flag, and joining an
        // already-finished thread is immediate, so it's safe to call from a
        // destructor (spec.md §5: "Stopping is idempotent and must be safe
        // from destructors").
        let mut capture = self.capture.lock().unwrap();
        if let Some(thread) = capture.take() {
            thread.stop.store(true, Ordering::SeqCst);
            let _ = thread.handle.join();
        }
    }
}

/// Capture-thread body (spec.md §4.3 "Capture task algorithm"). Opens the
/// GPIO line, signals the ready barrier, then loops: wait for an edge,
/// compute the elapsed interval, filter glitches, enqueue.
fn capture_loop(
    pin: u8,
    timeout: Timeout,
    tx: PulseSender,
    stop: Arc<AtomicBool>,
    barrier: Arc<ReadyBarrier>,
    gpio_ok: Arc<AtomicBool>,
) {
    let mut source = match GpioEdgeSource::open(pin) {
        Ok(source) => source,
        Err(err) => {
            error!("capture thread failed to open gpio {pin}: {err}");
            gpio_ok.store(false, Ordering::SeqCst);
            barrier.signal(false);
            return;
        }
    };

    gpio_ok.store(true, Ordering::SeqCst);
    barrier.signal(true);
    info!("capture thread for gpio {pin} running");

    let mut t0 = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        match source.wait_event(timeout) {
            Ok(EdgeEvent::Edge) => {
                let t1 = Instant::now();
                // Round to the nearest microsecond rather than flooring, so an
                // interval like 182.6us lands on 183 (valid short pulse) and
                // not 182 (invalid, spurious reset) — spec.md §4.3 step 3 and
                // the original's `round(...)` both specify rounding.
                let duration = ((t1.duration_since(t0).as_nanos() + 500) / 1000) as u32;
                t0 = t1;
                if tx.enqueue(duration) {
                    debug!("pulse {duration}us");
                }
            }
            Ok(EdgeEvent::Timeout) => {}
            Err(err) => {
                error!("gpio wait on pin {pin} failed: {err}");
            }
        }
    }

    source.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::NullRadio;

    #[test]
    fn rejects_pin_out_of_range() {
        let err = Receiver::new(0, NullRadio).unwrap_err();
        assert!(matches!(err, ReceiverError::Gpio(crate::error::GpioError::PinOutOfRange(0))));
        let err = Receiver::new(41, NullRadio).unwrap_err();
        assert!(matches!(err, ReceiverError::Gpio(crate::error::GpioError::PinOutOfRange(41))));
    }

    #[test]
    fn accepts_boundary_pins() {
        assert!(Receiver::new(1, NullRadio).is_ok());
        assert!(Receiver::new(40, NullRadio).is_ok());
    }

    #[test]
    fn rssi_delegates_to_radio_frontend() {
        let receiver = Receiver::new(5, NullRadio).unwrap();
        assert_eq!(receiver.rssi(), 0.0);
    }

    #[test]
    fn next_pulse_is_empty_without_a_running_capture_thread() {
        let receiver = Receiver::new(5, NullRadio).unwrap();
        assert_eq!(receiver.next_pulse(), None);
    }
}
