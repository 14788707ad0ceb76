//! Playback packet scheduler.
//!
//! Runs inside the isochronous OUT completion callback: for every packet of
//! the URB being resubmitted it picks a frame count (from the feedback
//! accumulator once warmed up, nominal otherwise), pulls that many frames
//! from the playback ring, and lays the payload out packed with per-packet
//! lengths. A ring that comes up short yields silence; while warmed up that
//! counts as an underrun.
//!
//! Ghost mode keeps the OUT stream alive when only capture is running: the
//! device's clock wanders without a steady OUT stream, so the scheduler
//! keeps submitting nominal-length silence and touches neither the ring nor
//! the accumulator.

use crate::feedback::FeedbackEngine;
use crate::observability::StreamStats;
use crate::profile::{PLAYBACK_BYTES_PER_FRAME, RateProfile};
use crate::ring::RingConsumer;

/// Fill one outgoing URB's worth of packets.
///
/// `buf` must hold `lengths.len() * profile.max_packet_bytes()`; packet
/// payloads are packed back to back from the start of `buf` and the
/// per-packet byte counts are written to `lengths`. Returns the total
/// payload length.
pub(crate) fn fill_urb(
    profile: &RateProfile,
    engine: &FeedbackEngine,
    ring: &mut RingConsumer,
    stats: &StreamStats,
    ghost: bool,
    buf: &mut [u8],
    lengths: &mut [u32],
) -> usize {
    let nominal = profile.nominal_frames_per_packet;
    let mut total = 0usize;

    for length in lengths.iter_mut() {
        let warmed_up = !ghost && engine.warmed_up();
        let frames = if warmed_up {
            match engine.pop_frame_count() {
                Some(count) => count,
                None => {
                    stats.record_underrun();
                    nominal
                }
            }
        } else {
            nominal
        };

        let bytes = frames as usize * PLAYBACK_BYTES_PER_FRAME;
        let packet = &mut buf[total..total + bytes];
        if ghost {
            packet.fill(0);
        } else if !ring.read_exact(packet) {
            packet.fill(0);
            if warmed_up {
                stats.record_underrun();
            }
        }

        *length = bytes as u32;
        total += bytes;
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::FeedbackPacket;
    use crate::profile::profile_for_rate;
    use crate::ring::{RingProducer, byte_ring};
    use std::sync::Arc;

    struct Rig {
        profile: &'static RateProfile,
        engine: FeedbackEngine,
        producer: RingProducer,
        consumer: RingConsumer,
        stats: Arc<StreamStats>,
    }

    fn rig() -> Rig {
        let profile = profile_for_rate(48_000).unwrap();
        let stats = Arc::new(StreamStats::new());
        let engine = FeedbackEngine::new(profile, 16, 0, Arc::clone(&stats));
        let (producer, consumer) = byte_ring(4096);
        Rig {
            profile,
            engine,
            producer,
            consumer,
            stats,
        }
    }

    fn warm_up(engine: &FeedbackEngine, value: u8, urbs: usize) {
        for _ in 0..urbs {
            engine.process_urb(&[FeedbackPacket::Ok(value)], true);
        }
    }

    #[test]
    fn test_cold_scheduler_emits_nominal_silence() {
        let mut rig = rig();
        let mut buf = vec![0xEEu8; 8 * rig.profile.max_packet_bytes()];
        let mut lengths = [0u32; 8];

        let total = fill_urb(
            rig.profile,
            &rig.engine,
            &mut rig.consumer,
            &rig.stats,
            false,
            &mut buf,
            &mut lengths,
        );

        assert_eq!(total, 8 * 6 * PLAYBACK_BYTES_PER_FRAME);
        assert!(lengths.iter().all(|&l| l == 72));
        assert!(buf[..total].iter().all(|&b| b == 0), "silence expected");
        // Cold path never touches the accumulator or counts underruns.
        assert_eq!(rig.stats.underruns(), 0);
    }

    #[test]
    fn test_cold_scheduler_does_not_consume_accumulator() {
        let mut rig = rig();
        rig.engine.process_urb(&[FeedbackPacket::Ok(50)], true);
        assert_eq!(rig.engine.accumulator_fill(), 8);
        assert!(!rig.engine.warmed_up());

        let mut buf = vec![0u8; 8 * rig.profile.max_packet_bytes()];
        let mut lengths = [0u32; 8];
        fill_urb(
            rig.profile,
            &rig.engine,
            &mut rig.consumer,
            &rig.stats,
            false,
            &mut buf,
            &mut lengths,
        );

        assert_eq!(rig.engine.accumulator_fill(), 8);
        assert!(lengths.iter().all(|&l| l == 72));
    }

    #[test]
    fn test_warm_scheduler_consumes_feedback_counts() {
        let mut rig = rig();
        warm_up(&rig.engine, 50, 2);
        assert!(rig.engine.warmed_up());

        // Enough audio for one URB: ring frames carry a marker byte.
        let frame = [0xABu8; PLAYBACK_BYTES_PER_FRAME];
        for _ in 0..64 {
            assert!(rig.producer.write_all(&frame));
        }

        let mut buf = vec![0u8; 8 * rig.profile.max_packet_bytes()];
        let mut lengths = [0u32; 8];
        let total = fill_urb(
            rig.profile,
            &rig.engine,
            &mut rig.consumer,
            &rig.stats,
            false,
            &mut buf,
            &mut lengths,
        );

        // feedback 50 -> pattern [6,6,6,7,6,6,6,7].
        let expected: Vec<u32> = [6u32, 6, 6, 7, 6, 6, 6, 7]
            .iter()
            .map(|f| f * PLAYBACK_BYTES_PER_FRAME as u32)
            .collect();
        assert_eq!(&lengths[..], &expected[..]);
        assert_eq!(total, 50 * PLAYBACK_BYTES_PER_FRAME);
        assert!(buf[..total].iter().all(|&b| b == 0xAB));
        assert_eq!(rig.engine.accumulator_fill(), 8);
        assert_eq!(rig.stats.underruns(), 0);
    }

    #[test]
    fn test_empty_ring_yields_silence_and_underruns() {
        let mut rig = rig();
        warm_up(&rig.engine, 48, 2);
        assert!(rig.engine.warmed_up());

        let mut buf = vec![0xEEu8; 8 * rig.profile.max_packet_bytes()];
        let mut lengths = [0u32; 8];
        let total = fill_urb(
            rig.profile,
            &rig.engine,
            &mut rig.consumer,
            &rig.stats,
            false,
            &mut buf,
            &mut lengths,
        );

        assert!(buf[..total].iter().all(|&b| b == 0));
        assert_eq!(rig.stats.underruns(), 8, "one underrun per starved packet");
    }

    #[test]
    fn test_exhausted_accumulator_counts_underruns() {
        let mut rig = rig();
        warm_up(&rig.engine, 48, 2);

        // Drain the 16 queued counts; the scheduler then falls back to
        // nominal and counts one underrun per packet.
        let mut buf = vec![0u8; 8 * rig.profile.max_packet_bytes()];
        let mut lengths = [0u32; 8];
        for _ in 0..2 {
            fill_urb(
                rig.profile,
                &rig.engine,
                &mut rig.consumer,
                &rig.stats,
                false,
                &mut buf,
                &mut lengths,
            );
        }
        let before = rig.stats.underruns();

        fill_urb(
            rig.profile,
            &rig.engine,
            &mut rig.consumer,
            &rig.stats,
            false,
            &mut buf,
            &mut lengths,
        );
        assert!(lengths.iter().all(|&l| l == 72));
        // Accumulator empty and ring empty: two underruns per packet.
        assert_eq!(rig.stats.underruns(), before + 16);
    }

    #[test]
    fn test_ghost_mode_ignores_ring_and_accumulator() {
        let mut rig = rig();
        warm_up(&rig.engine, 50, 2);
        let fill_before = rig.engine.accumulator_fill();

        let frame = [0x55u8; PLAYBACK_BYTES_PER_FRAME];
        for _ in 0..16 {
            rig.producer.write_all(&frame);
        }

        let mut buf = vec![0xEEu8; 8 * rig.profile.max_packet_bytes()];
        let mut lengths = [0u32; 8];
        let total = fill_urb(
            rig.profile,
            &rig.engine,
            &mut rig.consumer,
            &rig.stats,
            true,
            &mut buf,
            &mut lengths,
        );

        assert!(lengths.iter().all(|&l| l == 72));
        assert!(buf[..total].iter().all(|&b| b == 0));
        assert_eq!(rig.engine.accumulator_fill(), fill_before);
        assert_eq!(rig.consumer.occupancy(), 16 * PLAYBACK_BYTES_PER_FRAME);
        assert_eq!(rig.stats.underruns(), 0);
    }
}
