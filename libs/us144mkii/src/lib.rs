// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! User-space driver for the TASCAM US-144MKII USB audio/MIDI interface.
//!
//! The hardware (vendor 0x0644, product 0x8020, plus the reduced 0x800F)
//! needs a proprietary bring-up handshake and speaks a non-standard
//! adaptive clock protocol: a one-byte feedback endpoint reports how many
//! frames the device consumed per millisecond, and the host shapes every
//! outgoing isochronous packet to match. Captured audio arrives
//! bit-transposed in 64-byte chunks and has to be unpacked on the hot path.
//!
//! A [`Session`] runs the whole machine: open and claim the device, run the
//! bring-up sequence, keep the URB fleet circulating on a dedicated event
//! loop thread, and exchange audio and MIDI with host threads over
//! lock-free rings.
//!
//! ```no_run
//! use us144mkii::{Session, SessionConfig};
//!
//! let mut session = Session::open(SessionConfig::default())?;
//! session.start()?;
//! let mut capture = session.capture_reader().expect("capture configured");
//!
//! let mut buf = [0u8; 4096];
//! while session.is_running() {
//!     let n = capture.read(&mut buf);
//!     // hand buf[..n] to the audio client
//!     # break;
//! }
//! session.stop();
//! # Ok::<(), us144mkii::DriverError>(())
//! ```

pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod feedback;
pub mod midi;
pub mod observability;
pub(crate) mod playback;
pub mod profile;
pub mod ring;
pub mod session;
pub(crate) mod transfer;

pub use device::{DeviceInfo, PID_US122MKII, PID_US144MKII, VENDOR_ID, list_devices};
pub use error::{DriverError, Result};
pub use observability::StatsSnapshot;
pub use profile::{RateProfile, SUPPORTED_RATES, profile_for_rate};
pub use session::{
    CaptureReader, LatencyProfile, MidiReceiver, MidiSender, PlaybackWriter, Session,
    SessionConfig, SessionSnapshot,
};
