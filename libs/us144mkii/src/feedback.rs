//! Adaptive sample-clock feedback engine.
//!
//! Every millisecond the device reports how many audio frames it consumed
//! over the preceding 8 microframes as a single byte on the feedback
//! endpoint. This module validates those bytes, expands each one into an
//! 8-packet frame-count pattern, and queues the counts in a fixed ring (the
//! accumulator) for the playback scheduler to consume. It also owns the
//! sync / warm-up state machine that gates when the scheduler may trust the
//! queued counts.
//!
//! The feedback callback is the only producer of the accumulator and the
//! playback callback is the only consumer; both publish their index with
//! release ordering and observe the other side with acquire ordering.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use crate::observability::StreamStats;
use crate::profile::RateProfile;

/// Slots in the frame-count accumulator. Power of two; indices are monotonic
/// and masked.
pub const ACCUMULATOR_SLOTS: usize = 128;

const ACCUMULATOR_MASK: usize = ACCUMULATOR_SLOTS - 1;

/// Fill level above which the producer counts the consumer as fallen behind.
pub const ACCUMULATOR_HEADROOM: usize = 16;

/// Consecutive bad feedback URBs tolerated before sync is dropped. One URB
/// per millisecond, so this is roughly 41 ms of continuous feedback failure.
pub const FEEDBACK_ERROR_TOLERANCE: u32 = 41;

/// Expand a feedback adjustment into the per-packet frame counts for the
/// next 8 isochronous packets.
///
/// The `|adjustment|` off-nominal packets are spread evenly by a Bresenham
/// accumulator: each step adds `|adjustment|`, and every time the running
/// value reaches 8 it wraps and that packet carries `nominal ± 1` instead of
/// `nominal`. The result always sums to `8 * nominal + adjustment`.
pub fn feedback_pattern(nominal: u8, adjustment: i8) -> [u8; 8] {
    debug_assert!(adjustment.unsigned_abs() < 8);
    let step = adjustment.unsigned_abs();
    let bumped = if adjustment >= 0 {
        nominal + 1
    } else {
        nominal - 1
    };

    let mut pattern = [nominal; 8];
    let mut acc = 0u8;
    for slot in pattern.iter_mut() {
        acc += step;
        if acc >= 8 {
            acc -= 8;
            *slot = bumped;
        }
    }
    pattern
}

/// Outcome of appending one 8-count pattern to the accumulator.
pub(crate) struct PushOutcome {
    /// The consumer had fallen more than `ACCUMULATOR_HEADROOM` slots behind.
    pub overran: bool,
    /// The pattern was written (false only when the ring had no room at all).
    pub appended: bool,
}

/// Fixed ring of upcoming per-packet frame counts.
///
/// Written 8 slots at a time by the feedback callback, consumed one slot at
/// a time by the playback callback.
pub struct FrameCountAccumulator {
    slots: [AtomicU8; ACCUMULATOR_SLOTS],
    in_idx: AtomicUsize,
    out_idx: AtomicUsize,
}

impl FrameCountAccumulator {
    /// New accumulator, empty but with every slot pre-filled with `nominal`.
    pub fn new(nominal: u8) -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU8::new(nominal)),
            in_idx: AtomicUsize::new(0),
            out_idx: AtomicUsize::new(0),
        }
    }

    /// Unconsumed frame counts.
    pub fn fill(&self) -> usize {
        let in_idx = self.in_idx.load(Ordering::Acquire);
        let out_idx = self.out_idx.load(Ordering::Acquire);
        let fill = in_idx.wrapping_sub(out_idx);
        if fill > ACCUMULATOR_SLOTS { 0 } else { fill }
    }

    /// Producer side: append one 8-count pattern.
    pub(crate) fn push_pattern(&self, pattern: &[u8; 8]) -> PushOutcome {
        let in_idx = self.in_idx.load(Ordering::Relaxed);
        let out_idx = self.out_idx.load(Ordering::Acquire);
        let fill = in_idx.wrapping_sub(out_idx);

        let overran = fill > ACCUMULATOR_SLOTS - ACCUMULATOR_HEADROOM;
        if fill + pattern.len() > ACCUMULATOR_SLOTS {
            // No room; keep the queued counts rather than corrupt them.
            return PushOutcome {
                overran,
                appended: false,
            };
        }

        for (k, &count) in pattern.iter().enumerate() {
            self.slots[(in_idx + k) & ACCUMULATOR_MASK].store(count, Ordering::Relaxed);
        }
        self.in_idx
            .store(in_idx.wrapping_add(pattern.len()), Ordering::Release);
        PushOutcome {
            overran,
            appended: true,
        }
    }

    /// Consumer side: take the next frame count, if any.
    pub fn pop(&self) -> Option<u8> {
        let out_idx = self.out_idx.load(Ordering::Relaxed);
        let in_idx = self.in_idx.load(Ordering::Acquire);
        let fill = in_idx.wrapping_sub(out_idx);
        if fill == 0 || fill > ACCUMULATOR_SLOTS {
            return None;
        }
        let count = self.slots[out_idx & ACCUMULATOR_MASK].load(Ordering::Relaxed);
        self.out_idx
            .store(out_idx.wrapping_add(1), Ordering::Release);
        Some(count)
    }

    /// Producer side: discard queued counts and restore the nominal prefill.
    fn reset_to_nominal(&self, nominal: u8) {
        for slot in &self.slots {
            slot.store(nominal, Ordering::Relaxed);
        }
        let out_idx = self.out_idx.load(Ordering::Acquire);
        self.in_idx.store(out_idx, Ordering::Release);
    }
}

/// One feedback packet as seen by the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackPacket {
    /// Transport OK and at least one byte long; carries the feedback byte.
    Ok(u8),
    /// Zero length or error status.
    Bad,
}

/// Validation, translation and sync tracking for the feedback endpoint.
pub struct FeedbackEngine {
    profile: &'static RateProfile,
    accumulator: FrameCountAccumulator,
    synced: AtomicBool,
    warmed_up: AtomicBool,
    consecutive_errors: AtomicU32,
    skip_remaining: AtomicU32,
    warmup_threshold: usize,
    stats: Arc<StreamStats>,
}

impl FeedbackEngine {
    /// `warmup_threshold` is the accumulator fill (in packets) that must be
    /// reached before the scheduler may consume queued counts; `skip_urbs`
    /// feedback URBs are ignored after start so device timing can settle.
    pub fn new(
        profile: &'static RateProfile,
        warmup_threshold: usize,
        skip_urbs: u32,
        stats: Arc<StreamStats>,
    ) -> Self {
        assert!(warmup_threshold <= ACCUMULATOR_SLOTS - ACCUMULATOR_HEADROOM);
        Self {
            accumulator: FrameCountAccumulator::new(profile.nominal_frames_per_packet),
            profile,
            synced: AtomicBool::new(false),
            warmed_up: AtomicBool::new(false),
            consecutive_errors: AtomicU32::new(0),
            skip_remaining: AtomicU32::new(skip_urbs),
            warmup_threshold,
            stats,
        }
    }

    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    pub fn warmed_up(&self) -> bool {
        self.warmed_up.load(Ordering::Acquire)
    }

    pub fn accumulator_fill(&self) -> usize {
        self.accumulator.fill()
    }

    /// Consumer side, called from the playback callback.
    pub fn pop_frame_count(&self) -> Option<u8> {
        self.accumulator.pop()
    }

    /// Digest one completed feedback URB.
    ///
    /// `append` is false while the playback direction is ghosting (nobody
    /// consumes the accumulator, so queued counts would only overrun); the
    /// sync state machine still runs so ghost sessions keep tracking the
    /// device clock.
    pub fn process_urb(&self, packets: &[FeedbackPacket], append: bool) {
        let skip = self.skip_remaining.load(Ordering::Relaxed);
        if skip > 0 {
            self.skip_remaining.store(skip - 1, Ordering::Relaxed);
            return;
        }

        let nominal = self.profile.nominal_frames_per_packet;
        let mut urb_clean = true;

        for packet in packets {
            match *packet {
                FeedbackPacket::Ok(value) if self.profile.is_valid_feedback(value) => {
                    self.stats.set_last_feedback_value(value);
                    if append {
                        let pattern =
                            feedback_pattern(nominal, self.profile.adjustment_for(value));
                        let outcome = self.accumulator.push_pattern(&pattern);
                        if outcome.overran {
                            self.stats.record_overrun();
                        }
                        if !outcome.appended {
                            tracing::debug!(fill = self.accumulator.fill(), "accumulator full, pattern dropped");
                        }
                    }
                }
                _ => {
                    urb_clean = false;
                    self.stats.record_feedback_error();
                }
            }
        }

        if urb_clean {
            self.consecutive_errors.store(0, Ordering::Relaxed);
            self.synced.store(true, Ordering::Relaxed);
            if !self.warmed_up() && self.accumulator.fill() >= self.warmup_threshold {
                self.warmed_up.store(true, Ordering::Release);
                tracing::info!(
                    rate_hz = self.profile.rate_hz,
                    fill = self.accumulator.fill(),
                    "feedback warmed up, scheduler now tracking device clock"
                );
            }
        } else {
            self.note_bad_urb();
        }
    }

    /// URB-level transport failure (anything but a cancellation).
    pub fn note_transport_error(&self) {
        self.stats.record_feedback_error();
        self.note_bad_urb();
    }

    fn note_bad_urb(&self) {
        let streak = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if streak > FEEDBACK_ERROR_TOLERANCE && self.synced.swap(false, Ordering::Relaxed) {
            self.warmed_up.store(false, Ordering::Release);
            self.stats.record_sync_loss();
            self.accumulator
                .reset_to_nominal(self.profile.nominal_frames_per_packet);
            tracing::warn!(
                streak,
                rate_hz = self.profile.rate_hz,
                "feedback sync lost, falling back to nominal frame counts"
            );
        }
    }
}
