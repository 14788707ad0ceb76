// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Streaming session lifecycle.
//!
//! A [`Session`] owns the opened device, the URB fleet and the rings that
//! couple host threads to the USB completion context. Three execution
//! contexts touch it:
//!
//! - the control thread (whoever holds the `Session`) runs bring-up,
//!   start/stop and shutdown;
//! - the event-loop thread runs every completion callback via the raw
//!   `user_data` pointer back to [`SessionShared`];
//! - host threads stream audio and MIDI through the handle types.
//!
//! Shutdown ordering is the invariant everything else leans on: clear
//! `running`, cancel every transfer, drain the event loop, and only then
//! free transfer memory and release the interfaces. No callback can observe
//! freed memory because nothing is freed until `in_flight` reaches zero.

use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use libusb1_sys::constants::{
    LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE,
};
use libusb1_sys::{libusb_context, libusb_transfer};
use parking_lot::Mutex;
use rusb::UsbContext;

use crate::capture::{CAPTURE_CHUNK_BYTES, CaptureDecoder};
use crate::config;
use crate::device::{
    EP_AUDIO_OUT, EP_CAPTURE_IN, EP_FEEDBACK_IN, EP_MIDI_IN, EP_MIDI_OUT, OpenedDevice,
};
use crate::error::{DriverError, Result};
use crate::feedback::{FeedbackEngine, FeedbackPacket};
use crate::midi::{MIDI_PACKET_LEN, frame_message};
use crate::observability::{StatsSnapshot, StreamStats};
use crate::playback;
use crate::profile::{
    CAPTURE_BYTES_PER_FRAME, PLAYBACK_BYTES_PER_FRAME, RateProfile, profile_for_rate,
};
use crate::ring::{RingConsumer, RingProducer, byte_ring};
use crate::transfer::{self, Transfer};

/// In-flight isochronous OUT URBs.
pub const NUM_PLAYBACK_URBS: usize = 4;
/// In-flight feedback URBs; also how many are skipped after start while the
/// device clock settles.
pub const NUM_FEEDBACK_URBS: usize = 4;
const NUM_CAPTURE_URBS: usize = 4;
const NUM_MIDI_IN_URBS: usize = 2;

/// Bulk capture reads, a whole number of 64-byte chunks each.
const CAPTURE_URB_BYTES: usize = 48 * CAPTURE_CHUNK_BYTES;

const PLAYBACK_RING_BYTES: usize = 1 << 16;
const CAPTURE_RING_BYTES: usize = 1 << 17;
const MIDI_RING_BYTES: usize = 4096;

const EVENT_LOOP_TICK: Duration = Duration::from_millis(100);
const MIDI_OUT_TIMEOUT_MS: u32 = 1000;

/// Shape of the URB fleet: how much audio each isochronous OUT transfer
/// spans and how many feedback bytes arrive per feedback URB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyProfile {
    /// 1 ms per playback URB.
    Low,
    /// 2 ms per playback URB.
    #[default]
    Normal,
    /// 5 ms per playback URB.
    High,
}

impl LatencyProfile {
    pub fn playback_packets_per_urb(self) -> usize {
        match self {
            LatencyProfile::Low => 8,
            LatencyProfile::Normal => 16,
            LatencyProfile::High => 40,
        }
    }

    pub fn feedback_packets_per_urb(self) -> usize {
        match self {
            LatencyProfile::Low => 1,
            LatencyProfile::Normal => 2,
            LatencyProfile::High => 5,
        }
    }

    /// Accumulator fill required before the scheduler trusts feedback:
    /// two URBs' worth of packets.
    pub(crate) fn warmup_threshold(self) -> usize {
        2 * self.playback_packets_per_urb()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub sample_rate: u32,
    pub latency: LatencyProfile,
    /// Stream the capture direction. Playback is always streamed; without a
    /// writer it ghosts silence to keep the device clock stable.
    pub capture: bool,
    /// Run the MIDI endpoints.
    pub midi: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            latency: LatencyProfile::default(),
            capture: true,
            midi: true,
        }
    }
}

/// Point-in-time view of a running session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSnapshot {
    pub stats: StatsSnapshot,
    pub synced: bool,
    pub warmed_up: bool,
    pub accumulator_fill: usize,
    pub running: bool,
}

/// State reachable from completion callbacks through `user_data`.
///
/// Callbacks borrow this through a raw pointer; the shutdown ordering in
/// [`Session::stop`] guarantees the borrow never outlives the allocation.
struct SessionShared {
    running: AtomicBool,
    fatal: AtomicBool,
    in_flight: AtomicUsize,
    profile: &'static RateProfile,
    latency: LatencyProfile,
    capture_enabled: bool,
    playback_attached: AtomicBool,
    engine: FeedbackEngine,
    stats: Arc<StreamStats>,
    playback_ring: Mutex<RingConsumer>,
    capture_decoder: Mutex<CaptureDecoder>,
    midi_in_ring: Mutex<RingProducer>,
    midi_out_ring: Mutex<RingConsumer>,
    midi_out_busy: AtomicBool,
    midi_out_transfer: AtomicPtr<libusb_transfer>,
    playback_buf_capacity: usize,
    feedback_buf_capacity: usize,
}

impl SessionShared {
    #[inline]
    fn retire(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn fail_fatal(&self, context: &'static str) {
        if !self.fatal.swap(true, Ordering::AcqRel) {
            tracing::error!(context, "fatal transfer error, stopping session");
        }
        self.running.store(false, Ordering::Release);
    }

    /// Resubmit from a completion callback; the transfer stays accounted in
    /// `in_flight` unless submission fails.
    fn resubmit(&self, t: *mut libusb_transfer, context: &'static str) {
        match unsafe { transfer::submit_raw(t) } {
            Ok(()) => {}
            Err(rusb::Error::NoDevice) => {
                self.fail_fatal(context);
                self.retire();
            }
            Err(err) => {
                self.stats.record_transfer_error();
                tracing::warn!(context, %err, "transfer resubmission failed");
                self.retire();
            }
        }
    }

    fn on_playback_complete(&self, t: *mut libusb_transfer) {
        let status = unsafe { (*t).status };
        if !self.running.load(Ordering::Acquire) || status == LIBUSB_TRANSFER_CANCELLED {
            self.retire();
            return;
        }
        if status == LIBUSB_TRANSFER_NO_DEVICE {
            self.fail_fatal("playback");
            self.retire();
            return;
        }
        if status != LIBUSB_TRANSFER_COMPLETED {
            // Isochronous OUT errors are transient; keep the stream going.
            self.stats.record_transfer_error();
        }

        let ghost = !self.playback_attached.load(Ordering::Acquire);
        let packets = self.latency.playback_packets_per_urb();
        let mut lengths = [0u32; 40];
        let lengths = &mut lengths[..packets];

        let total = {
            let mut ring = self.playback_ring.lock();
            let buf = unsafe { transfer::buffer_mut(t, self.playback_buf_capacity) };
            playback::fill_urb(
                self.profile,
                &self.engine,
                &mut ring,
                &self.stats,
                ghost,
                buf,
                lengths,
            )
        };

        unsafe {
            for (descriptor, &len) in transfer::iso_packets(t).iter_mut().zip(lengths.iter()) {
                descriptor.length = len;
            }
            (*t).length = total as i32;
        }
        self.stats
            .add_frames_played((total / PLAYBACK_BYTES_PER_FRAME) as u64);
        self.resubmit(t, "playback");
    }

    fn on_feedback_complete(&self, t: *mut libusb_transfer) {
        let status = unsafe { (*t).status };
        if !self.running.load(Ordering::Acquire) || status == LIBUSB_TRANSFER_CANCELLED {
            self.retire();
            return;
        }
        if status == LIBUSB_TRANSFER_NO_DEVICE {
            self.fail_fatal("feedback");
            self.retire();
            return;
        }

        let append = self.playback_attached.load(Ordering::Acquire);
        if status != LIBUSB_TRANSFER_COMPLETED {
            self.engine.note_transport_error();
        } else {
            let mut packets = [FeedbackPacket::Bad; 8];
            let descriptors = unsafe { transfer::iso_packets(t) };
            let buf = unsafe { transfer::buffer_mut(t, self.feedback_buf_capacity) };
            let count = descriptors.len();
            for (i, descriptor) in descriptors.iter().enumerate() {
                if descriptor.status == LIBUSB_TRANSFER_COMPLETED && descriptor.actual_length >= 1 {
                    packets[i] = FeedbackPacket::Ok(buf[i]);
                }
            }
            self.engine.process_urb(&packets[..count], append);
        }

        self.resubmit(t, "feedback");
    }

    fn on_capture_complete(&self, t: *mut libusb_transfer) {
        let status = unsafe { (*t).status };
        if !self.running.load(Ordering::Acquire) || status == LIBUSB_TRANSFER_CANCELLED {
            self.retire();
            return;
        }
        if status == LIBUSB_TRANSFER_NO_DEVICE {
            self.fail_fatal("capture");
            self.retire();
            return;
        }

        if status == LIBUSB_TRANSFER_COMPLETED {
            let len = unsafe { (*t).actual_length.max(0) } as usize;
            let data = unsafe { transfer::buffer_mut(t, CAPTURE_URB_BYTES) };
            self.capture_decoder.lock().consume(&data[..len]);
        } else {
            self.stats.record_transfer_error();
        }

        self.resubmit(t, "capture");
    }

    fn on_midi_in_complete(&self, t: *mut libusb_transfer) {
        let status = unsafe { (*t).status };
        if !self.running.load(Ordering::Acquire) || status == LIBUSB_TRANSFER_CANCELLED {
            self.retire();
            return;
        }
        if status == LIBUSB_TRANSFER_NO_DEVICE {
            self.fail_fatal("midi in");
            self.retire();
            return;
        }

        if status == LIBUSB_TRANSFER_COMPLETED {
            let len = unsafe { (*t).actual_length.max(0) } as usize;
            let data = unsafe { transfer::buffer_mut(t, MIDI_PACKET_LEN) };
            for packet in data[..len].chunks_exact(MIDI_PACKET_LEN) {
                let payload = crate::midi::unframe_packet(packet.try_into().expect("9-byte packet"));
                if !payload.is_empty() {
                    let mut ring = self.midi_in_ring.lock();
                    if !ring.write_all(payload) {
                        self.stats.record_midi_in_overrun();
                    }
                }
            }
        } else {
            self.stats.record_transfer_error();
        }

        self.resubmit(t, "midi in");
    }

    fn on_midi_out_complete(&self, t: *mut libusb_transfer) {
        let status = unsafe { (*t).status };
        self.retire();
        self.midi_out_busy.store(false, Ordering::Release);
        if !self.running.load(Ordering::Acquire) || status == LIBUSB_TRANSFER_CANCELLED {
            return;
        }
        if status == LIBUSB_TRANSFER_NO_DEVICE {
            self.fail_fatal("midi out");
            return;
        }
        if status != LIBUSB_TRANSFER_COMPLETED {
            self.stats.record_transfer_error();
        }
        self.pump_midi_out();
    }

    /// Push the next queued MIDI envelope onto the OUT endpoint if no
    /// submission is in progress. Called from the host's send path and from
    /// the OUT completion callback.
    ///
    /// Whoever wins the `midi_out_busy` claim either submits (the flag
    /// clears in the completion callback) or releases the claim. Shutdown
    /// takes the claim permanently, so nothing can submit a freed transfer.
    fn pump_midi_out(&self) {
        loop {
            if self
                .midi_out_busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            if !self.running.load(Ordering::Acquire) {
                self.midi_out_busy.store(false, Ordering::Release);
                return;
            }
            let t = self.midi_out_transfer.load(Ordering::Acquire);
            if t.is_null() {
                self.midi_out_busy.store(false, Ordering::Release);
                return;
            }

            let mut packet = [0u8; MIDI_PACKET_LEN];
            let popped = self.midi_out_ring.lock().read_exact(&mut packet);
            if popped {
                unsafe {
                    transfer::buffer_mut(t, MIDI_PACKET_LEN).copy_from_slice(&packet);
                    (*t).length = MIDI_PACKET_LEN as i32;
                }
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                match unsafe { transfer::submit_raw(t) } {
                    Ok(()) => {}
                    Err(err) => {
                        self.retire();
                        self.midi_out_busy.store(false, Ordering::Release);
                        if matches!(err, rusb::Error::NoDevice) {
                            self.fail_fatal("midi out");
                        } else {
                            self.stats.record_transfer_error();
                            tracing::warn!(%err, "midi out submission failed");
                        }
                    }
                }
                return;
            }

            self.midi_out_busy.store(false, Ordering::Release);
            // A producer may have queued between the pop attempt and the
            // release; re-claim in that case so nothing gets stranded.
            if self.midi_out_ring.lock().occupancy() < MIDI_PACKET_LEN {
                return;
            }
        }
    }
}

extern "system" fn playback_cb(t: *mut libusb_transfer) {
    let shared = unsafe { &*((*t).user_data as *const SessionShared) };
    shared.on_playback_complete(t);
}

extern "system" fn feedback_cb(t: *mut libusb_transfer) {
    let shared = unsafe { &*((*t).user_data as *const SessionShared) };
    shared.on_feedback_complete(t);
}

extern "system" fn capture_cb(t: *mut libusb_transfer) {
    let shared = unsafe { &*((*t).user_data as *const SessionShared) };
    shared.on_capture_complete(t);
}

extern "system" fn midi_in_cb(t: *mut libusb_transfer) {
    let shared = unsafe { &*((*t).user_data as *const SessionShared) };
    shared.on_midi_in_complete(t);
}

extern "system" fn midi_out_cb(t: *mut libusb_transfer) {
    let shared = unsafe { &*((*t).user_data as *const SessionShared) };
    shared.on_midi_out_complete(t);
}

struct ContextPtr(*mut libusb_context);
// libusb contexts are thread-safe by contract.
unsafe impl Send for ContextPtr {}

/// One streaming session against an opened device.
pub struct Session {
    shared: Arc<SessionShared>,
    device: OpenedDevice,
    transfers: Vec<Transfer>,
    event_thread: Option<JoinHandle<()>>,
    playback_producer: Option<RingProducer>,
    capture_consumer: Option<RingConsumer>,
    midi_in_consumer: Option<RingConsumer>,
    midi_out_producer: Option<RingProducer>,
    started: bool,
    stopped: bool,
}

impl Session {
    /// Open the first supported device and run bring-up for `config`.
    /// Streaming begins on [`Session::start`].
    pub fn open(config: SessionConfig) -> Result<Session> {
        let profile = profile_for_rate(config.sample_rate)
            .ok_or(DriverError::UnsupportedRate(config.sample_rate))?;

        let device = OpenedDevice::open_first()?;
        config::configure(&device.handle, profile, config.capture)?;

        let stats = Arc::new(StreamStats::new());
        let engine = FeedbackEngine::new(
            profile,
            config.latency.warmup_threshold(),
            NUM_FEEDBACK_URBS as u32,
            Arc::clone(&stats),
        );

        let (playback_producer, playback_consumer) = byte_ring(PLAYBACK_RING_BYTES);
        let (capture_producer, capture_consumer) = byte_ring(CAPTURE_RING_BYTES);
        let (midi_in_producer, midi_in_consumer) = byte_ring(MIDI_RING_BYTES);
        let (midi_out_producer, midi_out_consumer) = byte_ring(MIDI_RING_BYTES);

        let decoder = CaptureDecoder::new(
            capture_producer,
            Arc::clone(&stats),
            device.model.decode_chunk(),
        );

        let packets = config.latency.playback_packets_per_urb();
        let shared = Arc::new(SessionShared {
            running: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            profile,
            latency: config.latency,
            capture_enabled: config.capture,
            playback_attached: AtomicBool::new(false),
            engine,
            stats,
            playback_ring: Mutex::new(playback_consumer),
            capture_decoder: Mutex::new(decoder),
            midi_in_ring: Mutex::new(midi_in_producer),
            midi_out_ring: Mutex::new(midi_out_consumer),
            midi_out_busy: AtomicBool::new(false),
            midi_out_transfer: AtomicPtr::new(std::ptr::null_mut()),
            playback_buf_capacity: packets * profile.max_packet_bytes(),
            feedback_buf_capacity: config.latency.feedback_packets_per_urb(),
        });

        let midi = config.midi && device.model.has_midi();
        let mut session = Session {
            shared,
            device,
            transfers: Vec::new(),
            event_thread: None,
            playback_producer: Some(playback_producer),
            capture_consumer: config.capture.then_some(capture_consumer),
            midi_in_consumer: midi.then_some(midi_in_consumer),
            midi_out_producer: Some(midi_out_producer),
            started: false,
            stopped: false,
        };
        session.allocate_transfers(config, midi)?;
        Ok(session)
    }

    fn allocate_transfers(&mut self, config: SessionConfig, midi: bool) -> Result<()> {
        let handle = self.device.handle.as_raw();
        let user_data = Arc::as_ptr(&self.shared) as *mut c_void;
        let packets = config.latency.playback_packets_per_urb();
        let profile = self.shared.profile;

        for _ in 0..NUM_PLAYBACK_URBS {
            let t = Transfer::new_iso(
                handle,
                EP_AUDIO_OUT,
                packets,
                profile.max_packet_bytes(),
                playback_cb,
                user_data,
            )?;
            prime_playback(&t, packets, profile);
            self.transfers.push(t);
        }

        for _ in 0..NUM_FEEDBACK_URBS {
            self.transfers.push(Transfer::new_iso(
                handle,
                EP_FEEDBACK_IN,
                config.latency.feedback_packets_per_urb(),
                1,
                feedback_cb,
                user_data,
            )?);
        }

        if config.capture {
            for _ in 0..NUM_CAPTURE_URBS {
                self.transfers.push(Transfer::new_bulk(
                    handle,
                    EP_CAPTURE_IN,
                    CAPTURE_URB_BYTES,
                    capture_cb,
                    user_data,
                    0,
                )?);
            }
        }

        if midi {
            for _ in 0..NUM_MIDI_IN_URBS {
                self.transfers.push(Transfer::new_bulk(
                    handle,
                    EP_MIDI_IN,
                    MIDI_PACKET_LEN,
                    midi_in_cb,
                    user_data,
                    0,
                )?);
            }
            let out = Transfer::new_bulk(
                handle,
                EP_MIDI_OUT,
                MIDI_PACKET_LEN,
                midi_out_cb,
                user_data,
                MIDI_OUT_TIMEOUT_MS,
            )?;
            self.shared
                .midi_out_transfer
                .store(out.raw(), Ordering::Release);
            self.transfers.push(out);
        }

        Ok(())
    }

    /// Submit the URB fleet and spawn the event loop.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let context = ContextPtr(self.device.context.as_raw());
        self.event_thread = Some(
            std::thread::Builder::new()
                .name("us144mkii-usb".into())
                .spawn(move || {
                    let context = context;
                    while shared.running.load(Ordering::Acquire)
                        || shared.in_flight.load(Ordering::Acquire) > 0
                    {
                        transfer::handle_events_once(context.0, EVENT_LOOP_TICK);
                    }
                    tracing::debug!("event loop drained");
                })
                .map_err(DriverError::Io)?,
        );

        let midi_out = self.shared.midi_out_transfer.load(Ordering::Acquire);
        let mut submit_error = None;
        for t in &self.transfers {
            // The MIDI OUT transfer is pumped on demand, not kept in flight.
            if t.raw() == midi_out {
                continue;
            }
            self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
            if let Err(err) = t.submit() {
                self.shared.retire();
                submit_error = Some(err);
                break;
            }
        }
        if let Some(err) = submit_error {
            tracing::error!(%err, "initial transfer submission failed");
            self.stop();
            return Err(DriverError::Transfer(format!(
                "initial submission failed: {err}"
            )));
        }

        tracing::info!(
            rate_hz = self.shared.profile.rate_hz,
            latency = ?self.shared.latency,
            capture = self.shared.capture_enabled,
            "session started"
        );
        Ok(())
    }

    /// Cooperative shutdown: cancel, drain, free, release. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.shared.running.store(false, Ordering::Release);
        for t in &self.transfers {
            t.cancel();
        }

        // Take the MIDI pump claim permanently so no host send can touch a
        // transfer once the registry is freed. In-flight holders release it
        // as soon as they observe `running == false`.
        while self
            .shared
            .midi_out_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::thread::yield_now();
        }

        if let Some(thread) = self.event_thread.take() {
            let _ = thread.join();
        }

        self.transfers.clear();
        self.device.release();

        let snapshot = self.snapshot();
        tracing::info!(
            underruns = snapshot.stats.underruns,
            overruns = snapshot.stats.overruns,
            sync_losses = snapshot.stats.sync_losses,
            frames_played = snapshot.stats.frames_played,
            frames_captured = snapshot.stats.frames_captured,
            "session stopped"
        );
    }

    /// False once the session stopped or hit a fatal transport error.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            stats: self.shared.stats.snapshot(),
            synced: self.shared.engine.synced(),
            warmed_up: self.shared.engine.warmed_up(),
            accumulator_fill: self.shared.engine.accumulator_fill(),
            running: self.is_running(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.profile.rate_hz
    }

    pub fn model(&self) -> &'static str {
        self.device.model.name()
    }

    /// Take the playback writer. Taking it ends ghost playback; dropping it
    /// re-enters ghost mode.
    pub fn playback_writer(&mut self) -> Option<PlaybackWriter> {
        let ring = self.playback_producer.take()?;
        self.shared.playback_attached.store(true, Ordering::Release);
        Some(PlaybackWriter {
            ring,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Take the capture reader (sessions configured with capture only).
    pub fn capture_reader(&mut self) -> Option<CaptureReader> {
        Some(CaptureReader {
            ring: self.capture_consumer.take()?,
        })
    }

    /// Take the MIDI sender (sessions configured with MIDI only).
    pub fn midi_sender(&mut self) -> Option<MidiSender> {
        if self
            .shared
            .midi_out_transfer
            .load(Ordering::Acquire)
            .is_null()
        {
            return None;
        }
        let ring = self.midi_out_producer.take()?;
        Some(MidiSender {
            ring,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Take the MIDI receiver (sessions configured with MIDI only).
    pub fn midi_receiver(&mut self) -> Option<MidiReceiver> {
        Some(MidiReceiver {
            ring: self.midi_in_consumer.take()?,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pre-load a playback URB with one nominal-length silent packet per slot.
fn prime_playback(t: &Transfer, packets: usize, profile: &RateProfile) {
    let bytes = profile.nominal_frames_per_packet as usize * PLAYBACK_BYTES_PER_FRAME;
    unsafe {
        for descriptor in transfer::iso_packets(t.raw()) {
            descriptor.length = bytes as u32;
        }
        (*t.raw()).length = (packets * bytes) as i32;
    }
}

/// Largest multiple of `frame` not exceeding `len`.
#[inline]
fn frame_aligned(len: usize, frame: usize) -> usize {
    len - len % frame
}

/// Host-side producer of playback audio. Frames are 12 bytes: four channels
/// of packed little-endian 24-bit samples.
pub struct PlaybackWriter {
    ring: RingProducer,
    shared: Arc<SessionShared>,
}

impl PlaybackWriter {
    /// Write whole frames; partial frames are never queued. Returns the
    /// number of bytes accepted (a multiple of the frame size).
    pub fn write(&mut self, frames: &[u8]) -> usize {
        let want = frame_aligned(frames.len(), PLAYBACK_BYTES_PER_FRAME);
        let fit = frame_aligned(self.ring.free(), PLAYBACK_BYTES_PER_FRAME).min(want);
        if fit == 0 {
            return 0;
        }
        let written = self.ring.write_all(&frames[..fit]);
        debug_assert!(written);
        fit
    }

    /// Frames the ring can currently accept.
    pub fn free_frames(&self) -> usize {
        self.ring.free() / PLAYBACK_BYTES_PER_FRAME
    }
}

impl Drop for PlaybackWriter {
    fn drop(&mut self) {
        self.shared.playback_attached.store(false, Ordering::Release);
    }
}

/// Host-side consumer of capture audio. Frames are 16 bytes: four channels
/// of little-endian 32-bit words with the low byte zero.
pub struct CaptureReader {
    ring: RingConsumer,
}

impl CaptureReader {
    /// Read whole frames into `out`. Returns the number of bytes read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let want = frame_aligned(out.len(), CAPTURE_BYTES_PER_FRAME);
        let have = frame_aligned(self.ring.occupancy(), CAPTURE_BYTES_PER_FRAME).min(want);
        if have == 0 {
            return 0;
        }
        let read = self.ring.read_exact(&mut out[..have]);
        debug_assert!(read);
        have
    }

    /// Frames currently queued.
    pub fn available_frames(&self) -> usize {
        self.ring.occupancy() / CAPTURE_BYTES_PER_FRAME
    }
}

/// Host-side MIDI output. Messages are complete channel-voice messages of
/// one to three bytes; running status must be expanded by the caller.
pub struct MidiSender {
    ring: RingProducer,
    shared: Arc<SessionShared>,
}

impl MidiSender {
    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(DriverError::Session("session not running".into()));
        }
        let [first, second] = frame_message(message).ok_or_else(|| {
            DriverError::Session(format!("invalid MIDI message length {}", message.len()))
        })?;

        let mut wire = [0u8; 2 * MIDI_PACKET_LEN];
        wire[..MIDI_PACKET_LEN].copy_from_slice(&first);
        wire[MIDI_PACKET_LEN..].copy_from_slice(&second);
        if !self.ring.write_all(&wire) {
            return Err(DriverError::MidiBacklog);
        }

        self.shared.pump_midi_out();
        Ok(())
    }
}

/// Host-side MIDI input: raw MIDI bytes in arrival order.
pub struct MidiReceiver {
    ring: RingConsumer,
}

impl MidiReceiver {
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.ring.read(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_profiles_shape_the_fleet() {
        assert_eq!(LatencyProfile::Low.playback_packets_per_urb(), 8);
        assert_eq!(LatencyProfile::Normal.playback_packets_per_urb(), 16);
        assert_eq!(LatencyProfile::High.playback_packets_per_urb(), 40);

        assert_eq!(LatencyProfile::Low.feedback_packets_per_urb(), 1);
        assert_eq!(LatencyProfile::Normal.feedback_packets_per_urb(), 2);
        assert_eq!(LatencyProfile::High.feedback_packets_per_urb(), 5);
    }

    #[test]
    fn test_warmup_threshold_is_two_urbs() {
        assert_eq!(LatencyProfile::Low.warmup_threshold(), 16);
        assert_eq!(LatencyProfile::High.warmup_threshold(), 80);
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.latency, LatencyProfile::Normal);
        assert!(config.capture);
        assert!(config.midi);
    }

    #[test]
    fn test_frame_alignment() {
        assert_eq!(frame_aligned(0, 12), 0);
        assert_eq!(frame_aligned(11, 12), 0);
        assert_eq!(frame_aligned(12, 12), 12);
        assert_eq!(frame_aligned(35, 12), 24);
        assert_eq!(frame_aligned(48, 16), 48);
    }

    #[test]
    fn test_capture_urb_is_whole_chunks() {
        assert_eq!(CAPTURE_URB_BYTES % CAPTURE_CHUNK_BYTES, 0);
    }
}
