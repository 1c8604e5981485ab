//! Transport boundary between a session and a physical device.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Size of every HID report exchanged with a device
pub const REPORT_SIZE: usize = 64;

/// Static device info for detection
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub name: &'static str,
    pub cli_name: &'static str,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceInfo {
    /// Check if a usb id pair belongs to this device
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// An attached device as seen during enumeration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    /// Platform specific path used to open the device
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} {} {}",
            self.vendor_id,
            self.product_id,
            self.product.as_deref().unwrap_or("unknown device"),
            self.path
        )?;
        if let Some(serial) = self.serial_number.as_deref().filter(|s| !s.is_empty()) {
            write!(f, " (serial {serial})")?;
        }
        Ok(())
    }
}

/// The currently opened device.
///
/// Owned by its transport. Once invalidated by a detach it never becomes live
/// again; a re-attached device gets a fresh handle.
#[derive(Debug)]
pub struct DeviceHandle {
    descriptor: DeviceDescriptor,
    alive: AtomicBool,
}

impl DeviceHandle {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            alive: AtomicBool::new(true),
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }

    pub fn path(&self) -> &str {
        &self.descriptor.path
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the device as gone
    pub fn invalidate(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Fail with [`TransportError::Disconnected`] once the handle is dead
    pub fn ensure_alive(&self) -> Result<(), TransportError> {
        self.is_alive()
            .then_some(())
            .ok_or(TransportError::Disconnected)
    }
}

/// Attach and detach notifications delivered by a hot-plug watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Attached(DeviceDescriptor),
    Detached { path: String },
}

/// One fixed size report, plus how many bytes were actually received
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HidReport {
    bytes: [u8; REPORT_SIZE],
    filled: usize,
}

impl HidReport {
    /// A complete outgoing report
    pub const fn new(bytes: [u8; REPORT_SIZE]) -> Self {
        Self {
            bytes,
            filled: REPORT_SIZE,
        }
    }

    /// A report built from a possibly short read, zero padded
    pub fn from_received(received: &[u8]) -> Self {
        let filled = received.len().min(REPORT_SIZE);
        let mut bytes = [0u8; REPORT_SIZE];
        bytes[..filled].copy_from_slice(&received[..filled]);
        Self { bytes, filled }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8; REPORT_SIZE] {
        &self.bytes
    }

    /// Bytes actually received from the device
    #[inline(always)]
    pub fn received(&self) -> &[u8] {
        &self.bytes[..self.filled]
    }
}

impl fmt::Debug for HidReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HidReport({:02x?})", self.received())
    }
}

/// Errors that can occur while talking to a device
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No matching device is attached
    #[error("device not found")]
    NotFound,

    /// The device exists but may not be opened by this user
    #[error("permission denied opening {0} (is the udev rule installed?)")]
    PermissionDenied(String),

    /// The device went away
    #[error("device disconnected")]
    Disconnected,

    /// Fewer bytes were written than a full report
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// HID communication error
    #[error("hid error: {0}")]
    Hid(#[from] hidapi::HidError),

    /// Generic IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the error means the device itself is gone
    pub fn is_device_loss(&self) -> bool {
        matches!(self, TransportError::NotFound | TransportError::Disconnected)
    }
}

/// Blocking report level access to one attached device
pub trait Transport: Send {
    /// Handle of the device this transport is bound to
    fn handle(&self) -> &DeviceHandle;

    /// Send a single report
    fn write_report(&mut self, report: &HidReport) -> Result<(), TransportError>;

    /// Wait up to `timeout` for a single report, `None` if nothing arrived
    fn read_report(&mut self, timeout: Duration) -> Result<Option<HidReport>, TransportError>;
}
