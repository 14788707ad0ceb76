//! Error types for the driver.
//!
//! Everything that can fail on the control path surfaces as a [`DriverError`].
//! Inside USB completion callbacks errors are counted and logged but never
//! propagated; only transport-fatal conditions end the session.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no supported TASCAM device found")]
    DeviceNotFound,

    #[error("device access denied (udev rules / permissions): {0}")]
    Permission(rusb::Error),

    #[error("bring-up handshake failed during {step}: {source}")]
    Handshake {
        step: &'static str,
        source: rusb::Error,
    },

    #[error("unsupported sample rate: {0} Hz")]
    UnsupportedRate(u32),

    #[error("transfer setup failed: {0}")]
    Transfer(String),

    #[error("MIDI output backlog full")]
    MidiBacklog,

    #[error("session error: {0}")]
    Session(String),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type that uses DriverError
pub type Result<T> = std::result::Result<T, DriverError>;
