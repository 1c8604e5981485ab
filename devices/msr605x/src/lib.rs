//! Hidapi driver for MSR605X magnetic stripe reader/writers.
//!
//! Layers, leaves first: [`packet`] frames messages into HID reports,
//! [`abi`] and [`response`] speak the escape sequence command protocol, and
//! [`session`] drives exchanges over a [`magstripe_core::Transport`] while
//! tracking hot-plug state.

use magstripe_core::DeviceInfo;

pub mod abi;
pub mod hid;
pub mod packet;
pub mod response;
pub mod session;
pub mod types;

pub use hid::{list_attached_devices, HidTransport, HotplugWatcher};
pub use session::{CardRead, Session, SessionConfig, SessionError, SessionState, SessionStatus};
pub use types::{
    Coercivity, Density, FramingError, Led, ProtocolError, ReadFormat, TrackMask, TrackPayloads,
};

pub mod consts {
    pub const MSR605X_VENDOR_ID: u16 = 0x0801;
    pub const MSR605X_PRODUCT_ID: u16 = 0x0003;

    /// Precedes every command identifier
    pub const ESC: u8 = 0x1B;
    /// Field separator closing composite track blocks
    pub const FS: u8 = 0x1C;
    pub const ACK: u8 = 0x06;
    pub const NAK: u8 = 0x15;
    /// End sentinel written before the closing field separator
    pub const END_SENTINEL: u8 = b'?';
}

/// Static device info for detection
pub static INFO: DeviceInfo = DeviceInfo {
    name: "MSR605X",
    cli_name: "msr605x",
    vendor_id: consts::MSR605X_VENDOR_ID,
    product_id: consts::MSR605X_PRODUCT_ID,
};

/// A session over the real hidapi transport
pub type Msr605x = Session<HidTransport>;
