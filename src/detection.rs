//! Device detection and selection logic.

use std::error::Error;

use magstripe_core::{DeviceDescriptor, TransportError};
use msr605x::{list_attached_devices, HidTransport, HotplugWatcher, Msr605x, INFO};

use crate::config::Config;

/// Check if a device is the one asked for, any device matches without a path
pub fn matches(device: &DeviceDescriptor, path: Option<&str>) -> bool {
    path.is_none_or(|p| device.path == p)
}

fn pick(devices: Vec<DeviceDescriptor>, path: Option<&str>) -> Option<DeviceDescriptor> {
    devices.into_iter().find(|d| matches(d, path))
}

/// Find an attached reader, by hidraw path if given
pub fn select(path: Option<&str>) -> Result<DeviceDescriptor, TransportError> {
    pick(list_attached_devices(&INFO)?, path).ok_or(TransportError::NotFound)
}

/// Open a session on the selected reader.
///
/// The watcher feeds detach events into the session and has to be kept alive
/// for as long as the session is used.
pub fn connect(
    config: &Config,
    path: Option<&str>,
) -> Result<(Msr605x, HotplugWatcher), Box<dyn Error>> {
    let descriptor = match select(path) {
        Ok(descriptor) => descriptor,
        Err(TransportError::NotFound) => {
            let place = path.map(|p| format!(" at {p}")).unwrap_or_default();
            return Err(format!("no {} found{place}", INFO.name).into());
        },
        Err(e) => return Err(e.into()),
    };
    let (watcher, events) = HotplugWatcher::spawn(&INFO, config.device.poll_interval)?;
    let mut session = Msr605x::new(config.session(), events);
    session.attach(HidTransport::open(&descriptor)?)?;
    Ok((session, watcher))
}
