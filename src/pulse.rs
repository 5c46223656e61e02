//! Pulse durations and the single-producer/single-consumer queue that
//! carries them from the capture thread to the decode thread (spec.md §3,
//! §5: PulseQueue).

use std::sync::mpsc;

/// A pulse duration in microseconds, as measured between two consecutive
/// edge transitions on the data line.
pub type Pulse = u32;

/// Pulses at or below this duration are glitches and never reach the queue
/// (spec.md §3, P2).
pub const GLITCH_FLOOR_US: Pulse = 20;

/// Producer half of the pulse queue. Cheap to clone; every clone feeds the
/// same underlying channel, though in practice only the capture thread ever
/// holds one.
#[derive(Clone)]
pub struct PulseSender(mpsc::Sender<Pulse>);

/// Consumer half of the pulse queue, owned by the [`crate::receiver::Receiver`].
pub struct PulseReceiver(mpsc::Receiver<Pulse>);

/// Build a fresh pulse queue. `std::sync::mpsc` already gives an unbounded,
/// FIFO-per-producer channel, which is exactly the SPSC contract spec.md §3
/// asks for; reaching for a crate like `crossbeam-channel` here would add a
/// dependency this corpus never needs for a single-producer queue.
pub fn pulse_queue() -> (PulseSender, PulseReceiver) {
    let (tx, rx) = mpsc::channel();
    (PulseSender(tx), PulseReceiver(rx))
}

impl PulseSender {
    /// Enqueue a duration, applying the glitch filter. Returns `false` if the
    /// duration was filtered out or the receiving end has been dropped.
    pub fn enqueue(&self, duration: Pulse) -> bool {
        duration > GLITCH_FLOOR_US && self.0.send(duration).is_ok()
    }
}

impl PulseReceiver {
    /// Nonblocking try-dequeue. Returns `None` if the queue is currently
    /// empty (spec.md §4.3, `next_pulse`).
    pub fn try_dequeue(&self) -> Option<Pulse> {
        self.0.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glitches_are_filtered_at_the_source() {
        let (tx, rx) = pulse_queue();
        assert!(!tx.enqueue(20));
        assert!(!tx.enqueue(5));
        assert!(rx.try_dequeue().is_none());
        assert!(tx.enqueue(21));
        assert_eq!(rx.try_dequeue(), Some(21));
    }

    #[test]
    fn queue_preserves_fifo_order() {
        let (tx, rx) = pulse_queue();
        for d in [150u32, 300, 1200, 730] {
            assert!(tx.enqueue(d));
        }
        assert_eq!(rx.try_dequeue(), Some(150));
        assert_eq!(rx.try_dequeue(), Some(300));
        assert_eq!(rx.try_dequeue(), Some(1200));
        assert_eq!(rx.try_dequeue(), Some(730));
        assert_eq!(rx.try_dequeue(), None);
    }
}
