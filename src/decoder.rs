//! `Decoder` (spec.md §4.4): consumes the pulse queue through a shared
//! [`crate::receiver::Receiver`], runs the biphase-mark bit-assembly state
//! machine, validates the frame (preamble, length, CRC1, CRC2), and
//! publishes the most recently validated frame with its averaged RSSI.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, trace};

use crate::barrier::ReadyBarrier;
use crate::pulse::Pulse;
use crate::radio::RadioFrontend;
use crate::receiver::Receiver;

/// Fixed frame capacity: preamble + up to 31-byte payload slot + two CRCs,
/// clamped to 15 bytes by the 5-bit length field's overflow check (spec.md
/// §3 `FrameBuffer`).
pub const FRAME_CAPACITY: usize = 15;

/// The fixed preamble/header byte, after bit-reversal (spec.md §3, §4.4).
pub const PREAMBLE_BYTE: u8 = 0x9F;

/// A full frame buffer: preamble, payload, CRC1, CRC2 (spec.md §3).
pub type FrameBuffer = [u8; FRAME_CAPACITY];

// Pulse classification constants (spec.md §4.4).
const LOW_TIME: Pulse = 183;
const MID_TIME: Pulse = 726;
const HIGH_TIME: Pulse = 1464;

enum PulseKind {
    Long,
    Short,
    Invalid,
}

/// Half-open interval classification: `[MID_TIME, HIGH_TIME)` is long (a
/// logical 1), `[LOW_TIME, MID_TIME)` is short (half of a logical 0),
/// anything else is invalid (spec.md §4.4, P5 scenario).
fn classify(duration: Pulse) -> PulseKind {
    if (MID_TIME..HIGH_TIME).contains(&duration) {
        PulseKind::Long
    } else if (LOW_TIME..MID_TIME).contains(&duration) {
        PulseKind::Short
    } else {
        PulseKind::Invalid
    }
}

/// Full bit-reversal within a byte: swap neighbouring bits, then bit pairs,
/// then nibbles (spec.md §4.4 step 3).
fn reverse_bits(mut b: u8) -> u8 {
    b = ((b & 0xAA) >> 1) | ((b & 0x55) << 1);
    b = ((b & 0xCC) >> 2) | ((b & 0x33) << 2);
    b = ((b & 0xF0) >> 4) | ((b & 0x0F) << 4);
    b
}

/// 8-bit LFSR checksum, polynomial mask 0xE0, right-shifting (spec.md §4.4
/// step 8, CRC2 / GLOSSARY).
fn lfsr_checksum(bytes: &[u8]) -> u8 {
    let mut crc2: u8 = 0;
    for &b in bytes {
        crc2 ^= b;
        for _ in 0..8 {
            crc2 = if crc2 & 1 != 0 { (crc2 >> 1) ^ 0xE0 } else { crc2 >> 1 };
        }
    }
    crc2
}

/// Running RSSI average, sampled once per accepted byte commit (spec.md §3
/// `RssiAccumulator`, §9 "RSSI is sampled per accepted byte, not per frame").
#[derive(Debug, Clone, Copy, Default)]
struct RssiAccumulator {
    sum: f64,
    count: u32,
}

impl RssiAccumulator {
    fn add(&mut self, sample: f64) {
        self.sum += sample;
        self.count += 1;
    }

    fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }
}

/// The most recently validated frame, or nothing (spec.md §3
/// `PublishedFrame`). `valid` tracks at-most-one-outstanding delivery;
/// `fetch` clears it.
#[derive(Clone, Copy)]
struct PublishedFrame {
    frame: FrameBuffer,
    rssi: RssiAccumulator,
    valid: bool,
}

impl Default for PublishedFrame {
    fn default() -> Self {
        Self { frame: [0; FRAME_CAPACITY], rssi: RssiAccumulator::default(), valid: false }
    }
}

/// What a successful [`Decoder::fetch`] hands back to the consumer (spec.md
/// §4.4 `fetch(out_frame, out_rssi)`).
#[derive(Debug, Clone, Copy)]
pub struct Fetched {
    pub frame: FrameBuffer,
    /// Payload length in bytes, derived from `frame[2]` (preamble + payload,
    /// excludes both CRC bytes — spec.md §6 "Published frame payload").
    pub length: usize,
    pub rssi: f64,
}

/// The bit-assembly state machine: half-bits → bits → bytes → a validated
/// frame (spec.md §4.4). Free of any thread/lock concerns so it can be
/// driven directly in tests with a synthetic pulse stream and a fake RSSI
/// source.
struct FrameBuilder {
    count: u32,
    value: u32,
    half_bit: u32,
    byte: usize,
    frame: FrameBuffer,
    rssi: RssiAccumulator,
}

impl FrameBuilder {
    fn new() -> Self {
        Self { count: 0, value: 0, half_bit: 0, byte: 0, frame: [0; FRAME_CAPACITY], rssi: RssiAccumulator::default() }
    }

    fn reset(&mut self) {
        self.count = 0;
        self.value = 0;
        self.half_bit = 0;
        self.byte = 0;
        self.frame = [0; FRAME_CAPACITY];
        self.rssi = RssiAccumulator::default();
    }

    /// Feed one pulse duration into the state machine. Returns a completed,
    /// CRC2-valid frame if this pulse was the one that closed it out.
    /// `sample_rssi` is called at most once per accepted byte, lazily, so a
    /// fake radio in tests only observes exactly the samples spec.md §9
    /// promises.
    fn feed<F: FnMut() -> f64>(&mut self, duration: Pulse, mut sample_rssi: F) -> Option<PublishedFrame> {
        let mut reset = true;

        match classify(duration) {
            PulseKind::Long => {
                self.value = (self.value | 1) << 1;
                self.count += 1;
                self.half_bit = 0;
                reset = false;
            }
            PulseKind::Short => {
                reset = false;
                if self.half_bit == 0 {
                    self.half_bit = 1;
                } else {
                    self.value <<= 1;
                    self.count += 1;
                    self.half_bit = 0;
                }
            }
            PulseKind::Invalid => {
                // Per spec.md §9's Open Question resolution: an invalid
                // pulse resets even with a half-bit pending.
            }
        }

        // "length" starts out larger than any legal value so the
        // byte==length+2 short-circuit below never fires before byte 2 is
        // committed.
        let mut length = FRAME_CAPACITY;
        if self.byte > 2 && !reset {
            length = ((self.frame[2] >> 1) & 0x1F) as usize;
            if length > FRAME_CAPACITY - 1 {
                reset = true;
            }
        }

        // Final byte carries no parity bit on the wire; synthesize one so
        // the same 9-bit commit path below applies uniformly (spec.md §4.4).
        if self.byte == length + 2 && self.count == 8 && !reset {
            let parity = self.value.count_ones() & 1;
            self.value = parity + (self.value << 1);
            self.count += 1;
        }

        let mut published = None;

        if self.count == 9 && !reset {
            self.value >>= 1; // undo the extra pre-shift from bit emission
            let data_bits = ((self.value >> 1) & 0xFF) as u8;
            let parity_bit = (self.value & 1) as u8;

            if data_bits.count_ones() % 2 == parity_bit as u32 {
                let byte_val = reverse_bits(data_bits);
                self.frame[self.byte] = byte_val;

                if self.byte == 0 && byte_val != PREAMBLE_BYTE {
                    reset = true;
                } else {
                    self.byte += 1;
                    self.rssi.add(sample_rssi());
                }

                if self.byte > 2 && !reset {
                    length = ((self.frame[2] >> 1) & 0x1F) as usize;
                    if length > FRAME_CAPACITY - 1 {
                        reset = true;
                    }
                }

                if self.byte > length + 1 && !reset {
                    let crc1 = (1..=length).fold(0u8, |acc, i| acc ^ self.frame[i]);
                    if crc1 != self.frame[length + 1] {
                        reset = true;
                    }
                }

                if self.byte > length + 2 && !reset {
                    let crc2 = lfsr_checksum(&self.frame[1..=length + 1]);
                    if crc2 == self.frame[length + 2] {
                        published = Some(PublishedFrame { frame: self.frame, rssi: self.rssi, valid: true });
                    }
                    reset = true;
                }
            } else {
                reset = true;
            }

            self.count = 0;
            self.value = 0;
            self.half_bit = 0;
        }

        if reset {
            self.reset();
        }

        published
    }
}

struct DecodeThread {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Owns a shared handle to a `Receiver`, a working `FrameBuilder`, and a
/// published slot guarded by a reader-writer lock (spec.md §4.4). Not
/// copyable; the receiver must outlive it.
pub struct Decoder<R: RadioFrontend> {
    receiver: Arc<Receiver<R>>,
    published: Arc<RwLock<PublishedFrame>>,
    decode: Mutex<Option<DecodeThread>>,
    barrier: Arc<ReadyBarrier>,
}

impl<R: RadioFrontend + Send + 'static> Decoder<R> {
    pub fn new(receiver: Arc<Receiver<R>>) -> Self {
        Self {
            receiver,
            published: Arc::new(RwLock::new(PublishedFrame::default())),
            decode: Mutex::new(None),
            barrier: Arc::new(ReadyBarrier::new()),
        }
    }

    /// Starts the receiver's own capture thread, then spawns the decode
    /// thread and blocks until it signals readiness. Idempotent (spec.md
    /// §4.4, P8).
    pub fn start(&self) -> bool {
        let mut decode = self.decode.lock().unwrap();
        if decode.is_some() {
            return true;
        }
        if !self.receiver.start() {
            return false;
        }

        self.barrier.reset();
        let stop = Arc::new(AtomicBool::new(false));
        let receiver = Arc::clone(&self.receiver);
        let published = Arc::clone(&self.published);
        let barrier = Arc::clone(&self.barrier);
        let stop_flag = Arc::clone(&stop);

        let handle = match thread::Builder::new()
            .name("hideki-decode".into())
            .spawn(move || decode_loop(receiver, published, stop_flag, barrier))
        {
            Ok(handle) => handle,
            Err(err) => {
                error!("failed to spawn decode thread: {err}");
                self.receiver.stop();
                return false;
            }
        };

        let ok = self.barrier.wait();
        if ok {
            *decode = Some(DecodeThread { handle, stop });
        } else {
            let _ = handle.join();
        }
        ok
    }

    /// Idempotent (spec.md §4.4, P8).
    pub fn stop(&self) {
        let mut decode = self.decode.lock().unwrap();
        if let Some(thread) = decode.take() {
            thread.stop.store(true, Ordering::SeqCst);
            let _ = thread.handle.join();
        }
        self.receiver.stop();
        *self.published.write().unwrap() = PublishedFrame::default();
    }

    /// If a valid frame is published: copy it out, compute the averaged
    /// RSSI, and clear the valid flag in the same exclusive critical section
    /// (spec.md §4.4 `fetch()`, §9's lock-upgrade resolution, P7).
    pub fn fetch(&self) -> Option<Fetched> {
        let mut slot = self.published.write().unwrap();
        if !slot.valid {
            return None;
        }
        let length = ((slot.frame[2] >> 1) & 0x1F) as usize;
        let result = Fetched { frame: slot.frame, length: length + 1, rssi: slot.rssi.average() };
        *slot = PublishedFrame::default();
        Some(result)
    }
}

impl<R: RadioFrontend> Drop for Decoder<R> {
    fn drop(&mut self) {
        let mut decode = self.decode.lock().unwrap();
        if let Some(thread) = decode.take() {
            thread.stop.store(true, Ordering::SeqCst);
            let _ = thread.handle.join();
        }
    }
}

fn decode_loop<R: RadioFrontend + Send + 'static>(
    receiver: Arc<Receiver<R>>,
    published: Arc<RwLock<PublishedFrame>>,
    stop: Arc<AtomicBool>,
    barrier: Arc<ReadyBarrier>,
) {
    barrier.signal(true);

    let mut builder = FrameBuilder::new();
    while !stop.load(Ordering::SeqCst) {
        match receiver.next_pulse() {
            Some(duration) => {
                if let Some(result) = builder.feed(duration, || receiver.rssi()) {
                    trace!("frame published: {} payload bytes", result.frame[2]);
                    *published.write().unwrap() = result;
                }
            }
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::NullRadio;

    /// Installs `env_logger` once, capturing output per-test instead of
    /// interleaving it on stdout. Tests that exercise the real
    /// capture/decode/publish path call this so `log` output from
    /// `receiver.rs`/`decoder.rs` is visible with `cargo test -- --nocapture`.
    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Turns a logical bit stream into the pulse durations a biphase-mark
    /// line would actually carry: a `1` is one long pulse, a `0` is two
    /// short pulses.
    fn bits_to_pulses(bits: &[u8]) -> Vec<Pulse> {
        let mut pulses = Vec::new();
        for &bit in bits {
            if bit == 1 {
                pulses.push(1000);
            } else {
                pulses.push(300);
                pulses.push(300);
            }
        }
        pulses
    }

    fn byte_bits(b: u8) -> Vec<u8> {
        (0..8).rev().map(|i| (b >> i) & 1).collect()
    }

    /// Bits for one on-wire byte that is *not* the frame's final byte: 8
    /// data bits followed by a parity bit equal to `__builtin_parity(data)`
    /// (spec.md §4.4 step 2; the decoder checks equality with the data's own
    /// bit-parity, not the complemented classical odd-parity convention).
    fn bits_with_parity(b: u8) -> Vec<u8> {
        let mut bits = byte_bits(b);
        bits.push(b.count_ones() as u8 % 2);
        bits
    }

    /// Pulses for a prefix of on-wire bytes, none of which is the frame's
    /// final byte (every byte still carries a real parity bit).
    fn prefix_pulses(bytes: &[u8]) -> Vec<Pulse> {
        let mut bits = Vec::new();
        for &b in bytes {
            bits.extend(bits_with_parity(b));
        }
        bits_to_pulses(&bits)
    }

    /// Build the full pulse stream for one frame: every byte gets 8 data
    /// bits + an odd-parity bit, except the last (CRC2), which is data-only
    /// (spec.md §4.4).
    fn frame_pulses(bytes: &[u8]) -> Vec<Pulse> {
        let mut bits = Vec::new();
        let last = bytes.len() - 1;
        for (i, &b) in bytes.iter().enumerate() {
            if i == last {
                bits.extend(byte_bits(b));
            } else {
                bits.extend(bits_with_parity(b));
            }
        }
        bits_to_pulses(&bits)
    }

    /// A well-formed frame, on the wire (pre-bit-reversal), for
    /// preamble + 8 payload bytes + CRC1 + CRC2. The length field lives in
    /// `frame[2]` — the *second* payload byte, not a separate header byte
    /// (spec.md §3: "Position 2 encodes the payload length in its upper
    /// bits").
    fn golden_frame() -> Vec<u8> {
        let payload: [u8; 8] = [0x11, 0x10, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        let mut post_reversal = vec![PREAMBLE_BYTE];
        post_reversal.extend_from_slice(&payload);

        let length = ((post_reversal[2] >> 1) & 0x1F) as usize;
        assert_eq!(length, 8);

        let crc1 = (1..=length).fold(0u8, |acc, i| acc ^ post_reversal[i]);
        post_reversal.push(crc1);
        let crc2 = lfsr_checksum(&post_reversal[1..=length + 1]);
        post_reversal.push(crc2);

        post_reversal.into_iter().map(reverse_bits).collect()
    }

    #[test]
    fn golden_decode_publishes_and_then_drains() {
        init_logger();
        let mut builder = FrameBuilder::new();
        let pulses = frame_pulses(&golden_frame());

        let mut published = None;
        for p in pulses {
            if let Some(frame) = builder.feed(p, || -40.0) {
                published = Some(frame);
            }
        }

        let frame = published.expect("golden frame should publish");
        assert_eq!(frame.frame[0], 0x9F);
        let length = ((frame.frame[2] >> 1) & 0x1F) as usize;
        assert_eq!(length, 8);
        assert_eq!(frame.rssi.average(), -40.0);
        // 11 accepted bytes total: preamble + 8 payload + CRC1 + CRC2.
        assert_eq!(frame.rssi.count, 11);
    }

    #[test]
    fn rssi_average_reflects_distinct_per_byte_samples() {
        init_logger();
        // P9: rssi == sum_i r_i / count, sampled once per accepted byte. A
        // constant-valued RSSI closure can't distinguish a real running
        // average from "keep only the most recent sample" — feed 11 distinct
        // values (one per accepted byte of the golden frame) and check the
        // actual mean.
        let mut builder = FrameBuilder::new();
        let mut next_rssi = -60.0_f64;
        let mut published = None;
        for p in frame_pulses(&golden_frame()) {
            if let Some(frame) = builder.feed(p, || {
                let sample = next_rssi;
                next_rssi += 1.0;
                sample
            }) {
                published = Some(frame);
            }
        }

        let frame = published.expect("golden frame should publish");
        assert_eq!(frame.rssi.count, 11);
        // Samples are -60.0, -59.0, ..., -50.0 (11 values); their mean is
        // exactly -55.0 — neither endpoint, so this fails under a
        // "last sample wins" regression as well as under a wrong count.
        assert_eq!(frame.rssi.average(), -55.0);
    }

    #[test]
    fn bad_preamble_never_publishes() {
        let mut frame = golden_frame();
        frame[0] = reverse_bits(0x9E); // decodes to 0x9E, not 0x9F
        let mut builder = FrameBuilder::new();
        let mut published = None;
        for p in frame_pulses(&frame) {
            if let Some(f) = builder.feed(p, || -40.0) {
                published = Some(f);
            }
        }
        assert!(published.is_none());
        assert_eq!(builder.byte, 0);
    }

    #[test]
    fn parity_failure_resets_without_publishing() {
        let mut builder = FrameBuilder::new();
        // on-wire preamble byte (pre-reversal) with its parity bit inverted
        let wire_byte = reverse_bits(PREAMBLE_BYTE);
        let mut bits = byte_bits(wire_byte);
        let wrong_parity = 1 - (wire_byte.count_ones() % 2);
        bits.push(wrong_parity);
        let mut published = None;
        for p in bits_to_pulses(&bits) {
            if let Some(f) = builder.feed(p, || -40.0) {
                published = Some(f);
            }
        }
        assert!(published.is_none());
        assert_eq!(builder.byte, 0);
    }

    #[test]
    fn crc2_failure_resets_without_publishing() {
        let mut frame = golden_frame();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF; // corrupt CRC2 on the wire
        let mut builder = FrameBuilder::new();
        let mut published = None;
        for p in frame_pulses(&frame) {
            if let Some(f) = builder.feed(p, || -40.0) {
                published = Some(f);
            }
        }
        assert!(published.is_none());
        assert_eq!(builder.byte, 0);
        assert_eq!(builder.count, 0);
    }

    #[test]
    fn pulse_classification_edges_match_half_open_intervals() {
        assert!(matches!(classify(182), PulseKind::Invalid));
        assert!(matches!(classify(183), PulseKind::Short));
        assert!(matches!(classify(725), PulseKind::Short));
        assert!(matches!(classify(726), PulseKind::Long));
        assert!(matches!(classify(1463), PulseKind::Long));
        assert!(matches!(classify(1464), PulseKind::Invalid));
    }

    #[test]
    fn length_overflow_resets_after_byte_three() {
        let mut frame = golden_frame();
        // frame[2] (on the wire) is the reversed form of the second payload
        // byte, where the length field lives. Set it to encode length=31,
        // which exceeds capacity-1=14.
        frame[2] = reverse_bits(31 << 1);
        let mut builder = FrameBuilder::new();
        // Only feed enough pulses to commit bytes 0..=2 (preamble + first
        // two payload bytes); the overflow is detected right as byte index 2
        // commits.
        let mut published = None;
        for p in prefix_pulses(&frame[0..3]) {
            if let Some(f) = builder.feed(p, || -40.0) {
                published = Some(f);
            }
        }
        assert!(published.is_none(), "a length-overflowing frame must never publish");
        assert_eq!(builder.byte, 0);
    }

    #[test]
    fn reverse_bits_round_trips_to_identity() {
        for b in 0u8..=255 {
            assert_eq!(reverse_bits(reverse_bits(b)), b);
        }
        assert_eq!(reverse_bits(0b1000_0000), 0b0000_0001);
        assert_eq!(reverse_bits(0b1111_0000), 0b0000_1111);
    }

    #[test]
    fn lfsr_checksum_is_deterministic_for_fixed_input() {
        let a = lfsr_checksum(&[0x01, 0x02, 0x03]);
        let b = lfsr_checksum(&[0x01, 0x02, 0x03]);
        assert_eq!(a, b);
        assert_ne!(lfsr_checksum(&[0x01]), lfsr_checksum(&[0x02]));
    }

    /// Builds a `Decoder<NullRadio>` with no real capture thread running.
    /// `NullRadio` needs no hardware, so this is safe to construct in any
    /// test environment; the decode thread itself is never spawned by these
    /// tests, only the real `Decoder::fetch`/`start`/`stop` entry points.
    fn idle_decoder(pin: u8) -> Decoder<NullRadio> {
        let receiver = Arc::new(Receiver::new(pin, NullRadio).unwrap());
        Decoder::new(receiver)
    }

    #[test]
    fn fetch_consumes_published_frame_at_most_once() {
        init_logger();
        let frame = golden_frame();
        let mut builder = FrameBuilder::new();
        let mut published = None;
        for p in frame_pulses(&frame) {
            if let Some(f) = builder.feed(p, || -50.0) {
                published = Some(f);
            }
        }
        let published = published.expect("frame should publish");

        // Drive the real Decoder::fetch() (spec.md §4.4, §9's single
        // exclusive-critical-section resolution, P7) rather than hand-rolling
        // the read/clear dance: install the decoded frame directly into the
        // private published slot (the test module is a descendant of this
        // one and the decode thread would do exactly this write), then call
        // the public method.
        let decoder = idle_decoder(7);
        *decoder.published.write().unwrap() = published;

        let fetched = decoder.fetch().expect("fetch should return the published frame");
        assert_eq!(fetched.frame[0], PREAMBLE_BYTE);
        assert_eq!(fetched.length, 9);
        assert_eq!(fetched.rssi, -50.0);

        assert!(decoder.fetch().is_none(), "a second fetch without a new decode must return None (P7)");
    }

    #[test]
    fn stop_without_a_prior_start_is_a_no_op() {
        init_logger();
        // P8: stop() after stop() (or without ever starting) must not panic
        // or block.
        let decoder = idle_decoder(8);
        decoder.stop();
        decoder.stop();
    }

    #[test]
    fn start_is_idempotent_once_a_decode_thread_is_already_recorded() {
        init_logger();
        // Exercises the real Decoder::start()'s early-return branch (P8)
        // without needing real GPIO hardware: install a stand-in decode
        // thread directly, then confirm start() reports success without
        // spawning a second one, and stop() joins the real thread we put there.
        let decoder = idle_decoder(9);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::spawn({
            let stop = Arc::clone(&stop);
            move || {
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        });
        *decoder.decode.lock().unwrap() = Some(DecodeThread { handle, stop });

        assert!(decoder.start(), "start() must no-op and return true when already running");

        decoder.stop();
        assert!(decoder.decode.lock().unwrap().is_none());
    }
}
