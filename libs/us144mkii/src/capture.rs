// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Capture bitstream decoder.
//!
//! The device returns captured audio in 64-byte chunks, one audio frame per
//! chunk, with the PCM bytes bit-transposed across groups of eight wire
//! bytes. The first 32-byte half carries channels 0 and 2, the second half
//! channels 1 and 3; within a half, bytes 0..8 hold the high byte of both
//! channels, 8..16 the middle byte, 16..24 the low byte, and 24..32 are
//! padding.
//!
//! Each 8-byte group is an 8x8 bit matrix: normalize the MSB-first wire
//! order with a byte swap, transpose, and the two low bit columns fall out
//! as the two channels' PCM bytes. The transpose itself is the three-step
//! XOR-shift butterfly, so decoding a whole frame is twelve shifts and a
//! handful of masks instead of 384 single-bit moves.

use crate::observability::StreamStats;
use crate::profile::CAPTURE_BYTES_PER_FRAME;
use crate::ring::RingProducer;
use std::sync::Arc;

/// Wire size of one capture frame.
pub const CAPTURE_CHUNK_BYTES: usize = 64;

/// 8x8 bit-matrix transpose (Knuth's XOR-shift butterfly). Bit `8i + j` of
/// the input moves to bit `8j + i` of the output; it is its own inverse.
#[inline]
fn transpose8(mut x: u64) -> u64 {
    let mut t = (x ^ (x >> 7)) & 0x00AA_00AA_00AA_00AA;
    x ^= t ^ (t << 7);
    t = (x ^ (x >> 14)) & 0x0000_CCCC_0000_CCCC;
    x ^= t ^ (t << 14);
    t = (x ^ (x >> 28)) & 0x0000_0000_F0F0_F0F0;
    x ^= t ^ (t << 28);
    x
}

/// Extract the two PCM bytes (bit columns 0 and 1) from one 8-byte group.
#[inline]
fn decode_group(group: &[u8]) -> (u8, u8) {
    let x = u64::from_be_bytes(group.try_into().expect("8-byte group"));
    let y = transpose8(x);
    (y as u8, (y >> 8) as u8)
}

/// Decode one 64-byte chunk into four 24-bit samples left-justified in `i32`
/// (low byte zero). Output order is channels 0..3.
#[inline]
pub fn decode_chunk(chunk: &[u8; CAPTURE_CHUNK_BYTES]) -> [i32; 4] {
    let mut bytes = [[0u8; 3]; 4];
    for (half, channels) in [(0usize, [0usize, 2]), (1, [1, 3])] {
        let base = half * 32;
        for plane in 0..3 {
            let group = &chunk[base + plane * 8..base + plane * 8 + 8];
            let (first, second) = decode_group(group);
            bytes[channels[0]][plane] = first;
            bytes[channels[1]][plane] = second;
        }
    }

    let mut samples = [0i32; 4];
    for (sample, [high, mid, low]) in samples.iter_mut().zip(bytes) {
        *sample = ((high as u32) << 24 | (mid as u32) << 16 | (low as u32) << 8) as i32;
    }
    samples
}

/// Decode one chunk for the reduced two-channel hardware (PID 0x800F): only
/// the first half carries audio, as channels 0 and 1; the upper pair stays
/// silent.
#[inline]
pub fn decode_chunk_two_channel(chunk: &[u8; CAPTURE_CHUNK_BYTES]) -> [i32; 4] {
    let mut bytes = [[0u8; 3]; 2];
    for plane in 0..3 {
        let group = &chunk[plane * 8..plane * 8 + 8];
        let (first, second) = decode_group(group);
        bytes[0][plane] = first;
        bytes[1][plane] = second;
    }

    let mut samples = [0i32; 4];
    for (sample, [high, mid, low]) in samples.iter_mut().zip(bytes) {
        *sample = ((high as u32) << 24 | (mid as u32) << 16 | (low as u32) << 8) as i32;
    }
    samples
}

/// Streaming decoder: splits completion buffers into 64-byte chunks
/// (carrying a remainder across URBs), decodes, and publishes frames to the
/// capture ring.
pub(crate) struct CaptureDecoder {
    ring: RingProducer,
    stats: Arc<StreamStats>,
    decode: fn(&[u8; CAPTURE_CHUNK_BYTES]) -> [i32; 4],
    partial: [u8; CAPTURE_CHUNK_BYTES],
    partial_len: usize,
}

impl CaptureDecoder {
    pub(crate) fn new(
        ring: RingProducer,
        stats: Arc<StreamStats>,
        decode: fn(&[u8; CAPTURE_CHUNK_BYTES]) -> [i32; 4],
    ) -> Self {
        Self {
            ring,
            stats,
            decode,
            partial: [0; CAPTURE_CHUNK_BYTES],
            partial_len: 0,
        }
    }

    /// Digest the payload of one completed capture URB.
    pub(crate) fn consume(&mut self, mut data: &[u8]) {
        // Finish a chunk split across URB boundaries first.
        if self.partial_len > 0 {
            let need = CAPTURE_CHUNK_BYTES - self.partial_len;
            let take = need.min(data.len());
            self.partial[self.partial_len..self.partial_len + take]
                .copy_from_slice(&data[..take]);
            self.partial_len += take;
            data = &data[take..];
            if self.partial_len < CAPTURE_CHUNK_BYTES {
                return;
            }
            let chunk = self.partial;
            self.partial_len = 0;
            self.publish(&chunk);
        }

        let mut chunks = data.chunks_exact(CAPTURE_CHUNK_BYTES);
        for chunk in &mut chunks {
            self.publish(chunk.try_into().expect("exact chunk"));
        }

        let rest = chunks.remainder();
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();
    }

    fn publish(&mut self, chunk: &[u8; CAPTURE_CHUNK_BYTES]) {
        let samples = (self.decode)(chunk);
        let mut frame = [0u8; CAPTURE_BYTES_PER_FRAME];
        for (slot, sample) in frame.chunks_exact_mut(4).zip(samples) {
            slot.copy_from_slice(&sample.to_le_bytes());
        }
        if self.ring.write_all(&frame) {
            self.stats.add_frames_captured(1);
        } else {
            self.stats.record_capture_overrun();
        }
        // Platforms without a usable feedback endpoint pace playback off the
        // capture stream instead.
        self.stats.add_implicit_feedback_frames(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::byte_ring;

    /// Naive single-bit reference for the group decode: bit `b` of the first
    /// output byte is row `b`, column 0 of the normalized matrix.
    fn decode_group_reference(group: &[u8]) -> (u8, u8) {
        let x = u64::from_be_bytes(group.try_into().unwrap());
        let mut first = 0u8;
        let mut second = 0u8;
        for row in 0..8 {
            let byte = (x >> (8 * row)) as u8;
            first |= (byte & 0x01) << row;
            second |= ((byte >> 1) & 0x01) << row;
        }
        (first, second)
    }

    /// Inverse of [`decode_chunk`]: build the wire chunk for four samples.
    /// The transpose is an involution, so encoding reuses it directly.
    fn encode_chunk(samples: [i32; 4]) -> [u8; CAPTURE_CHUNK_BYTES] {
        let mut chunk = [0u8; CAPTURE_CHUNK_BYTES];
        for (half, channels) in [(0usize, [0usize, 2]), (1, [1, 3])] {
            let base = half * 32;
            for plane in 0..3 {
                let shift = 24 - 8 * plane;
                let first = (samples[channels[0]] as u32 >> shift) as u8;
                let second = (samples[channels[1]] as u32 >> shift) as u8;
                let y = first as u64 | (second as u64) << 8;
                let x = transpose8(y);
                chunk[base + plane * 8..base + plane * 8 + 8]
                    .copy_from_slice(&x.to_be_bytes());
            }
        }
        chunk
    }

    #[test]
    fn test_transpose_is_involution() {
        for _ in 0..1000 {
            let x = fastrand::u64(..);
            assert_eq!(transpose8(transpose8(x)), x);
        }
    }

    #[test]
    fn test_swar_matches_bit_reference() {
        for _ in 0..10_000 {
            let group: [u8; 8] = std::array::from_fn(|_| fastrand::u8(..));
            assert_eq!(
                decode_group(&group),
                decode_group_reference(&group),
                "mismatch for group {group:02x?}"
            );
        }
    }

    #[test]
    fn test_decode_known_chunk() {
        // 24-bit samples 0x112200 / 0x334400 / 0x556600 / 0x778800, one per
        // channel, distinct bytes on every plane.
        let chunk = encode_chunk([
            0x1122_0000u32 as i32,
            0x3344_0000u32 as i32,
            0x5566_0000u32 as i32,
            0x7788_0000u32 as i32,
        ]);
        let samples = decode_chunk(&chunk);
        assert_eq!(samples[0] as u32, 0x1122_0000);
        assert_eq!(samples[1] as u32, 0x3344_0000);
        assert_eq!(samples[2] as u32, 0x5566_0000);
        assert_eq!(samples[3] as u32, 0x7788_0000);
    }

    #[test]
    fn test_roundtrip_random_frames() {
        for _ in 0..1000 {
            // Arbitrary 24-bit samples, left-justified with a zero low byte.
            let samples: [i32; 4] =
                std::array::from_fn(|_| ((fastrand::u32(..) & 0xFF_FFFF) << 8) as i32);
            assert_eq!(decode_chunk(&encode_chunk(samples)), samples);
        }
    }

    #[test]
    fn test_padding_bytes_are_ignored() {
        let samples = [0x7F00_0100u32 as i32, 0, 0x8000_0000u32 as i32, 0x100];
        let mut chunk = encode_chunk(samples);
        chunk[24..32].fill(0xFF);
        chunk[56..64].fill(0xA5);
        assert_eq!(decode_chunk(&chunk), samples);
    }

    #[test]
    fn test_two_channel_decode_uses_first_half_only() {
        let chunk = encode_chunk([
            0x1122_0000u32 as i32,
            0x3344_0000u32 as i32,
            0x5566_0000u32 as i32,
            0x7788_0000u32 as i32,
        ]);
        let samples = decode_chunk_two_channel(&chunk);
        // The first half carries what the 4-channel layout calls ch0/ch2.
        assert_eq!(samples[0] as u32, 0x1122_0000);
        assert_eq!(samples[1] as u32, 0x5566_0000);
        assert_eq!(samples[2], 0);
        assert_eq!(samples[3], 0);
    }

    #[test]
    fn test_decoder_reassembles_split_chunks() {
        let (producer, mut consumer) = byte_ring(1024);
        let mut decoder =
            CaptureDecoder::new(producer, Arc::new(StreamStats::new()), decode_chunk);

        let samples = [0x0102_0300, 0x0405_0600, 0x0708_0900, 0x0A0B_0C00];
        let chunk = encode_chunk(samples);

        // Two frames delivered as three ragged URB payloads.
        let mut wire = Vec::new();
        wire.extend_from_slice(&chunk);
        wire.extend_from_slice(&chunk);
        decoder.consume(&wire[..40]);
        decoder.consume(&wire[40..70]);
        decoder.consume(&wire[70..]);

        let mut out = [0u8; 2 * CAPTURE_BYTES_PER_FRAME];
        assert!(consumer.read_exact(&mut out));
        for frame in out.chunks_exact(CAPTURE_BYTES_PER_FRAME) {
            for (slot, expected) in frame.chunks_exact(4).zip(samples) {
                assert_eq!(i32::from_le_bytes(slot.try_into().unwrap()), expected);
            }
        }
    }

    #[test]
    fn test_full_ring_counts_drops() {
        let (producer, _consumer) = byte_ring(CAPTURE_BYTES_PER_FRAME);
        let stats = Arc::new(StreamStats::new());
        let mut decoder = CaptureDecoder::new(producer, Arc::clone(&stats), decode_chunk);

        let chunk = encode_chunk([0, 0, 0, 0]);
        decoder.consume(&chunk);
        decoder.consume(&chunk);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_captured, 1);
        assert_eq!(snap.capture_overruns, 1);
        assert_eq!(snap.implicit_feedback_frames, 2);
    }
}
