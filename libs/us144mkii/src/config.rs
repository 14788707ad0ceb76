// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Device bring-up.
//!
//! The hardware refuses to stream until a fixed control-transfer sequence
//! has run once: a handshake read, two vendor mode writes around the rate
//! and register programming, three class SET_CUR rate writes (one per
//! streaming endpoint), and five opaque register writes. The register
//! values come verbatim from a vendor trace; there is no datasheet and no
//! interpretation is attempted here.
//!
//! Transfers go through the [`ControlPort`] seam so the sequence can be
//! verified against a mock as well as a live `rusb` handle.

use std::time::Duration;

use rusb::UsbContext;

use crate::device::{EP_AUDIO_OUT, EP_CAPTURE_IN, EP_FEEDBACK_IN};
use crate::error::{DriverError, Result};
use crate::profile::RateProfile;

/// Vendor request selecting the streaming mode.
const REQ_MODE: u8 = 73;
/// Vendor request writing one opaque register.
const REQ_REGISTER: u8 = 65;
/// Audio-class SET_CUR request.
const REQ_SET_CUR: u8 = 0x01;
/// Audio-class SAMPLING_FREQ_CONTROL selector in the high byte of wValue.
const SAMPLING_FREQ_CONTROL: u16 = 0x0100;

const MODE_INITIAL: u16 = 0x0010;
const MODE_STREAMING: u16 = 0x0030;
const REGISTER_INDEX: u16 = 0x0101;

/// Vendor device-to-host: `10000000 | vendor | device`.
const REQUEST_TYPE_VENDOR_IN: u8 = 0xC0;
/// Vendor host-to-device.
const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;
/// Class host-to-endpoint.
const REQUEST_TYPE_CLASS_EP_OUT: u8 = 0x22;

/// Control transfers answer within a second on working hardware.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Minimal synchronous control-transfer surface, implemented by the live
/// device handle and by test mocks.
pub trait ControlPort {
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, rusb::Error>;

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, rusb::Error>;
}

impl<T: UsbContext> ControlPort for rusb::DeviceHandle<T> {
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, rusb::Error> {
        self.read_control(request_type, request, value, index, buf, timeout)
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, rusb::Error> {
        self.write_control(request_type, request, value, index, data, timeout)
    }
}

/// Run the bring-up sequence. `capture` controls whether the capture
/// endpoint receives its rate write; the feedback endpoint always does (all
/// tested firmware revisions accept it, and the MKII requires it).
///
/// The first failing transfer aborts the whole sequence.
pub fn configure(port: &impl ControlPort, profile: &RateProfile, capture: bool) -> Result<()> {
    let step = |step: &'static str| move |source: rusb::Error| DriverError::Handshake { step, source };

    // 1. Handshake read; the byte's value carries no known meaning, but the
    //    device must answer before it will accept anything else.
    let mut handshake = [0u8; 1];
    port.control_in(
        REQUEST_TYPE_VENDOR_IN,
        REQ_MODE,
        0x0000,
        0,
        &mut handshake,
        CONTROL_TIMEOUT,
    )
    .map_err(step("mode handshake read"))?;

    // 2. Initial mode.
    port.control_out(
        REQUEST_TYPE_VENDOR_OUT,
        REQ_MODE,
        MODE_INITIAL,
        0,
        &[],
        CONTROL_TIMEOUT,
    )
    .map_err(step("initial mode write"))?;

    // 3. Sample rate to every streaming endpoint that will run.
    let mut endpoints = vec![EP_AUDIO_OUT];
    if capture {
        endpoints.push(EP_CAPTURE_IN);
    }
    endpoints.push(EP_FEEDBACK_IN);
    for endpoint in endpoints {
        port.control_out(
            REQUEST_TYPE_CLASS_EP_OUT,
            REQ_SET_CUR,
            SAMPLING_FREQ_CONTROL,
            endpoint as u16,
            &profile.sample_rate_payload,
            CONTROL_TIMEOUT,
        )
        .map_err(step("endpoint rate write"))?;
    }

    // 4. Opaque register programming; the fourth word is rate-dependent.
    let words = [
        0x0d04,
        0x0e00,
        0x0f00,
        profile.vendor_register_word,
        0x110b,
    ];
    for word in words {
        port.control_out(
            REQUEST_TYPE_VENDOR_OUT,
            REQ_REGISTER,
            word,
            REGISTER_INDEX,
            &[],
            CONTROL_TIMEOUT,
        )
        .map_err(step("register write"))?;
    }

    // 5. Enable streaming; capture data starts flowing immediately after.
    port.control_out(
        REQUEST_TYPE_VENDOR_OUT,
        REQ_MODE,
        MODE_STREAMING,
        0,
        &[],
        CONTROL_TIMEOUT,
    )
    .map_err(step("streaming enable"))?;

    tracing::info!(rate_hz = profile.rate_hz, capture, "bring-up complete");
    Ok(())
}
