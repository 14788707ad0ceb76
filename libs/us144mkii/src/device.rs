// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Device discovery, open/claim, and hardware model dispatch.
//!
//! Two PIDs speak this protocol. They share bring-up and streaming but
//! differ in the capture chunk layout and MIDI capability, so the model is
//! chosen once at open time and dispatched per URB, never per frame.

use rusb::{Context, Device, DeviceHandle, UsbContext};

use crate::capture::{self, CAPTURE_CHUNK_BYTES};
use crate::error::{DriverError, Result};

pub const VENDOR_ID: u16 = 0x0644;
pub const PID_US144MKII: u16 = 0x8020;
pub const PID_US122MKII: u16 = 0x800F;

/// Isochronous audio OUT endpoint.
pub const EP_AUDIO_OUT: u8 = 0x02;
/// Isochronous feedback IN endpoint (1-byte packets).
pub const EP_FEEDBACK_IN: u8 = 0x81;
/// Bulk capture IN endpoint (64-byte frames).
pub const EP_CAPTURE_IN: u8 = 0x86;
/// Bulk MIDI IN endpoint.
pub const EP_MIDI_IN: u8 = 0x83;
/// Bulk MIDI OUT endpoint.
pub const EP_MIDI_OUT: u8 = 0x04;

const CONFIGURATION: u8 = 1;
const INTERFACES: [u8; 2] = [0, 1];
const ALT_SETTING: u8 = 1;

/// Per-model behavior. Dispatch happens at URB granularity; the chunk
/// decoder is handed over as a plain function pointer so the per-frame hot
/// path stays monomorphic.
pub trait DeviceModel: Send + Sync {
    fn name(&self) -> &'static str;
    fn product_id(&self) -> u16;
    fn capture_channels(&self) -> usize;
    fn decode_chunk(&self) -> fn(&[u8; CAPTURE_CHUNK_BYTES]) -> [i32; 4];
    fn has_midi(&self) -> bool;
}

struct Us144Mkii;

impl DeviceModel for Us144Mkii {
    fn name(&self) -> &'static str {
        "US-144MKII"
    }

    fn product_id(&self) -> u16 {
        PID_US144MKII
    }

    fn capture_channels(&self) -> usize {
        4
    }

    fn decode_chunk(&self) -> fn(&[u8; CAPTURE_CHUNK_BYTES]) -> [i32; 4] {
        capture::decode_chunk
    }

    fn has_midi(&self) -> bool {
        true
    }
}

struct Us122Mkii;

impl DeviceModel for Us122Mkii {
    fn name(&self) -> &'static str {
        "US-122MKII"
    }

    fn product_id(&self) -> u16 {
        PID_US122MKII
    }

    fn capture_channels(&self) -> usize {
        2
    }

    fn decode_chunk(&self) -> fn(&[u8; CAPTURE_CHUNK_BYTES]) -> [i32; 4] {
        capture::decode_chunk_two_channel
    }

    fn has_midi(&self) -> bool {
        true
    }
}

static US144MKII: Us144Mkii = Us144Mkii;
static US122MKII: Us122Mkii = Us122Mkii;

/// Model lookup by product id.
pub fn model_for_pid(product_id: u16) -> Option<&'static dyn DeviceModel> {
    match product_id {
        PID_US144MKII => Some(&US144MKII),
        PID_US122MKII => Some(&US122MKII),
        _ => None,
    }
}

/// One attached supported device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub product_id: u16,
    pub model: &'static str,
    pub product: Option<String>,
}

/// Enumerate every attached supported device.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let context = Context::new()?;
    let mut found = Vec::new();

    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(_) => continue,
        };
        if descriptor.vendor_id() != VENDOR_ID {
            continue;
        }
        let Some(model) = model_for_pid(descriptor.product_id()) else {
            continue;
        };

        // Best effort; permissions may not allow opening here.
        let product = device
            .open()
            .ok()
            .and_then(|handle| handle.read_product_string_ascii(&descriptor).ok());

        found.push(DeviceInfo {
            bus: device.bus_number(),
            address: device.address(),
            product_id: descriptor.product_id(),
            model: model.name(),
            product,
        });
    }

    Ok(found)
}

/// An opened, claimed device ready for bring-up.
pub(crate) struct OpenedDevice {
    pub context: Context,
    pub handle: DeviceHandle<Context>,
    pub model: &'static dyn DeviceModel,
}

impl OpenedDevice {
    /// Open the first supported device and prepare it for streaming:
    /// detach any kernel driver, select configuration 1 and claim both
    /// interfaces at alternate setting 1.
    pub(crate) fn open_first() -> Result<OpenedDevice> {
        let context = Context::new()?;

        let mut candidate: Option<(Device<Context>, u16)> = None;
        for device in context.devices()?.iter() {
            if let Ok(descriptor) = device.device_descriptor() {
                if descriptor.vendor_id() == VENDOR_ID
                    && model_for_pid(descriptor.product_id()).is_some()
                {
                    candidate = Some((device, descriptor.product_id()));
                    break;
                }
            }
        }
        let (device, product_id) = candidate.ok_or(DriverError::DeviceNotFound)?;
        let model = model_for_pid(product_id).expect("candidate was model-matched");

        let mut handle = device.open().map_err(|err| match err {
            rusb::Error::Access => DriverError::Permission(err),
            other => DriverError::Usb(other),
        })?;

        // Reattach happens automatically on release once this is set.
        match handle.set_auto_detach_kernel_driver(true) {
            Ok(()) | Err(rusb::Error::NotSupported) => {}
            Err(err) => return Err(err.into()),
        }

        // The device reports "busy" here when the configuration is already
        // active; that is benign.
        match handle.set_active_configuration(CONFIGURATION) {
            Ok(()) | Err(rusb::Error::Busy) => {}
            Err(err) => return Err(err.into()),
        }

        for interface in INTERFACES {
            handle.claim_interface(interface)?;
            handle.set_alternate_setting(interface, ALT_SETTING)?;
        }

        tracing::info!(
            model = model.name(),
            bus = device.bus_number(),
            address = device.address(),
            "device opened and claimed"
        );

        Ok(OpenedDevice {
            context,
            handle,
            model,
        })
    }

    /// Release both interfaces. Kernel drivers detached on open reattach
    /// here via the auto-detach setting.
    pub(crate) fn release(&mut self) {
        for interface in INTERFACES {
            if let Err(err) = self.handle.release_interface(interface) {
                tracing::debug!(interface, %err, "interface release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_lookup() {
        assert_eq!(model_for_pid(PID_US144MKII).unwrap().name(), "US-144MKII");
        assert_eq!(model_for_pid(PID_US122MKII).unwrap().name(), "US-122MKII");
        assert!(model_for_pid(0x1234).is_none());
    }

    #[test]
    fn test_models_differ_in_capture_layout() {
        let full = model_for_pid(PID_US144MKII).unwrap();
        let reduced = model_for_pid(PID_US122MKII).unwrap();
        assert_eq!(full.capture_channels(), 4);
        assert_eq!(reduced.capture_channels(), 2);

        let chunk = [0u8; CAPTURE_CHUNK_BYTES];
        assert_eq!((full.decode_chunk())(&chunk), [0i32; 4]);
        assert_eq!((reduced.decode_chunk())(&chunk), [0i32; 4]);
    }
}
