//! Session counters, queryable while streaming.
//!
//! Everything here is written from USB completion callbacks and read from
//! whatever thread asks for a snapshot, so the fields are plain relaxed
//! atomics. Counters only ever increase within a session.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StreamStats {
    underruns: AtomicU64,
    overruns: AtomicU64,
    sync_losses: AtomicU64,
    feedback_errors: AtomicU64,
    transfer_errors: AtomicU64,
    capture_overruns: AtomicU64,
    midi_in_overruns: AtomicU64,
    frames_played: AtomicU64,
    frames_captured: AtomicU64,
    implicit_feedback_frames: AtomicU64,
    last_feedback_value: AtomicU8,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sync_loss(&self) {
        self.sync_losses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_feedback_error(&self) {
        self.feedback_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transfer_error(&self) {
        self.transfer_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_capture_overrun(&self) {
        self.capture_overruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_midi_in_overrun(&self) {
        self.midi_in_overruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_frames_played(&self, frames: u64) {
        self.frames_played.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_frames_captured(&self, frames: u64) {
        self.frames_captured.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_implicit_feedback_frames(&self, frames: u64) {
        self.implicit_feedback_frames
            .fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_last_feedback_value(&self, value: u8) {
        self.last_feedback_value.store(value, Ordering::Relaxed);
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn sync_losses(&self) -> u64 {
        self.sync_losses.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            sync_losses: self.sync_losses.load(Ordering::Relaxed),
            feedback_errors: self.feedback_errors.load(Ordering::Relaxed),
            transfer_errors: self.transfer_errors.load(Ordering::Relaxed),
            capture_overruns: self.capture_overruns.load(Ordering::Relaxed),
            midi_in_overruns: self.midi_in_overruns.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            implicit_feedback_frames: self.implicit_feedback_frames.load(Ordering::Relaxed),
            last_feedback_value: self.last_feedback_value.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub underruns: u64,
    pub overruns: u64,
    pub sync_losses: u64,
    pub feedback_errors: u64,
    pub transfer_errors: u64,
    pub capture_overruns: u64,
    pub midi_in_overruns: u64,
    pub frames_played: u64,
    pub frames_captured: u64,
    pub implicit_feedback_frames: u64,
    pub last_feedback_value: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_monotonic() {
        let stats = StreamStats::new();
        let mut previous = stats.snapshot();

        for _ in 0..10 {
            stats.record_underrun();
            stats.record_overrun();
            stats.record_sync_loss();
            let current = stats.snapshot();
            assert!(current.underruns > previous.underruns);
            assert!(current.overruns > previous.overruns);
            assert!(current.sync_losses > previous.sync_losses);
            previous = current;
        }
    }

    #[test]
    fn test_snapshot_copies_values() {
        let stats = StreamStats::new();
        stats.add_frames_played(480);
        stats.add_frames_captured(96);
        stats.add_implicit_feedback_frames(96);
        stats.set_last_feedback_value(48);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_played, 480);
        assert_eq!(snap.frames_captured, 96);
        assert_eq!(snap.implicit_feedback_frames, 96);
        assert_eq!(snap.last_feedback_value, 48);
    }
}
