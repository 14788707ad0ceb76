// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Thin wrappers over the raw libusb asynchronous transfer surface.
//!
//! `rusb` has no isochronous API, so URB allocation, submission and the
//! event loop go through `libusb1-sys` directly. Every unsafe touch of a
//! `libusb_transfer` lives in this module; the rest of the crate deals in
//! [`Transfer`] values and plain slices.
//!
//! A [`Transfer`] owns both the `libusb_transfer` and its payload buffer.
//! It must not be dropped while submitted; the session guarantees that by
//! cancelling and draining the event loop before the transfer registry is
//! torn down.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::time::Duration;

use libusb1_sys::constants::{
    LIBUSB_ERROR_ACCESS, LIBUSB_ERROR_BUSY, LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_INVALID_PARAM,
    LIBUSB_ERROR_IO, LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NO_MEM, LIBUSB_ERROR_NOT_FOUND,
    LIBUSB_ERROR_NOT_SUPPORTED, LIBUSB_ERROR_OVERFLOW, LIBUSB_ERROR_PIPE, LIBUSB_ERROR_TIMEOUT,
    LIBUSB_TRANSFER_TYPE_BULK, LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
};
use libusb1_sys::{
    libusb_alloc_transfer, libusb_cancel_transfer, libusb_context, libusb_device_handle,
    libusb_free_transfer, libusb_handle_events_timeout_completed, libusb_iso_packet_descriptor,
    libusb_submit_transfer, libusb_transfer, libusb_transfer_cb_fn,
};

use crate::error::{DriverError, Result};

/// Map a negative libusb return code onto the matching `rusb` error.
pub(crate) fn error_from_code(code: i32) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

/// An allocated URB plus the buffer it scatters into.
pub(crate) struct Transfer {
    raw: NonNull<libusb_transfer>,
    buffer: Box<[u8]>,
}

// The raw pointer is only touched from the submitting thread and the event
// loop, never concurrently with a drop; see the module invariant.
unsafe impl Send for Transfer {}

impl Transfer {
    /// Allocate an isochronous transfer of `packets` packets, each
    /// `packet_len` bytes.
    pub(crate) fn new_iso(
        handle: *mut libusb_device_handle,
        endpoint: u8,
        packets: usize,
        packet_len: usize,
        callback: libusb_transfer_cb_fn,
        user_data: *mut c_void,
    ) -> Result<Transfer> {
        let raw = unsafe { libusb_alloc_transfer(packets as i32) };
        let raw = NonNull::new(raw)
            .ok_or_else(|| DriverError::Transfer("libusb_alloc_transfer failed".into()))?;

        let mut buffer = vec![0u8; packets * packet_len].into_boxed_slice();
        unsafe {
            let t = raw.as_ptr();
            (*t).dev_handle = handle;
            (*t).flags = 0;
            (*t).endpoint = endpoint;
            (*t).transfer_type = LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
            (*t).timeout = 0;
            (*t).callback = callback;
            (*t).user_data = user_data;
            (*t).buffer = buffer.as_mut_ptr();
            (*t).length = buffer.len() as i32;
            (*t).num_iso_packets = packets as i32;
            for descriptor in iso_packets(t) {
                descriptor.length = packet_len as u32;
            }
        }

        Ok(Transfer { raw, buffer })
    }

    /// Allocate a bulk transfer with a `len`-byte buffer. `timeout_ms` of
    /// zero means no timeout.
    pub(crate) fn new_bulk(
        handle: *mut libusb_device_handle,
        endpoint: u8,
        len: usize,
        callback: libusb_transfer_cb_fn,
        user_data: *mut c_void,
        timeout_ms: u32,
    ) -> Result<Transfer> {
        let raw = unsafe { libusb_alloc_transfer(0) };
        let raw = NonNull::new(raw)
            .ok_or_else(|| DriverError::Transfer("libusb_alloc_transfer failed".into()))?;

        let mut buffer = vec![0u8; len].into_boxed_slice();
        unsafe {
            let t = raw.as_ptr();
            (*t).dev_handle = handle;
            (*t).flags = 0;
            (*t).endpoint = endpoint;
            (*t).transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
            (*t).timeout = timeout_ms;
            (*t).callback = callback;
            (*t).user_data = user_data;
            (*t).buffer = buffer.as_mut_ptr();
            (*t).length = buffer.len() as i32;
            (*t).num_iso_packets = 0;
        }

        Ok(Transfer { raw, buffer })
    }

    pub(crate) fn raw(&self) -> *mut libusb_transfer {
        self.raw.as_ptr()
    }

    /// Total bytes the buffer can hold (iso: packets x packet capacity).
    pub(crate) fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn submit(&self) -> std::result::Result<(), rusb::Error> {
        let code = unsafe { libusb_submit_transfer(self.raw.as_ptr()) };
        if code == 0 { Ok(()) } else { Err(error_from_code(code)) }
    }

    /// Request cancellation; completion arrives through the callback with
    /// a cancelled status. Already-complete transfers report `NotFound`,
    /// which is fine.
    pub(crate) fn cancel(&self) {
        let code = unsafe { libusb_cancel_transfer(self.raw.as_ptr()) };
        if code != 0 && code != LIBUSB_ERROR_NOT_FOUND {
            tracing::debug!(code, "transfer cancel returned error");
        }
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        unsafe { libusb_free_transfer(self.raw.as_ptr()) };
    }
}

/// Resubmit a transfer from inside its own completion callback.
pub(crate) unsafe fn submit_raw(
    transfer: *mut libusb_transfer,
) -> std::result::Result<(), rusb::Error> {
    let code = unsafe { libusb_submit_transfer(transfer) };
    if code == 0 { Ok(()) } else { Err(error_from_code(code)) }
}

/// The iso packet descriptor table of a transfer.
///
/// # Safety
/// `transfer` must point to a live transfer allocated with at least as many
/// iso packets as `num_iso_packets` claims.
pub(crate) unsafe fn iso_packets<'a>(
    transfer: *mut libusb_transfer,
) -> &'a mut [libusb_iso_packet_descriptor] {
    unsafe {
        let count = (*transfer).num_iso_packets.max(0) as usize;
        std::slice::from_raw_parts_mut((*transfer).iso_packet_desc.as_mut_ptr(), count)
    }
}

/// The transfer's payload buffer at its full allocated capacity.
///
/// # Safety
/// `transfer` must be live, not currently submitted, and `capacity` must be
/// the allocation size recorded by the owning [`Transfer`].
pub(crate) unsafe fn buffer_mut<'a>(transfer: *mut libusb_transfer, capacity: usize) -> &'a mut [u8] {
    unsafe { std::slice::from_raw_parts_mut((*transfer).buffer, capacity) }
}

/// Run one iteration of the libusb event loop, waiting at most `timeout`.
pub(crate) fn handle_events_once(context: *mut libusb_context, timeout: Duration) {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let code = unsafe { libusb_handle_events_timeout_completed(context, &tv, std::ptr::null_mut()) };
    if code != 0 {
        tracing::debug!(code, "libusb event loop iteration returned error");
    }
}
