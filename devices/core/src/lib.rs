//! Core types and traits for magstripe device abstraction.
//!
//! This crate provides:
//! - Per-track geometry (`TrackSpec`) and the card data model (`TrackData`, `CardImage`)
//! - The ISO 7811 track codec (`codec`) for bit-packed track payloads
//! - The transport boundary (`Transport`, `HidReport`, `DeviceHandle`) devices are driven through

pub mod codec;
mod device;
mod track;

pub use codec::CodecError;
pub use device::{
    DeviceDescriptor, DeviceHandle, DeviceInfo, HidReport, HotplugEvent, Transport,
    TransportError, REPORT_SIZE,
};
pub use track::{Alphabet, CardImage, TrackData, TrackNumber, TrackSpec, SENTINELS, TRACKS};
