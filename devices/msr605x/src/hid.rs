//! hidapi backed transport, enumeration and hot-plug polling.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hidapi::{HidApi, HidDevice, HidError};
use magstripe_core::{
    DeviceDescriptor, DeviceHandle, DeviceInfo, HidReport, HotplugEvent, Transport,
    TransportError, REPORT_SIZE,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Process wide hidapi context, created on first use
static API: Mutex<Option<HidApi>> = Mutex::new(None);

fn with_api<R>(
    f: impl FnOnce(&mut HidApi) -> Result<R, TransportError>,
) -> Result<R, TransportError> {
    let mut guard = API
        .lock()
        .map_err(|_| TransportError::Io(std::io::Error::other("hidapi context poisoned")))?;
    let api = match guard.take() {
        Some(api) => api,
        None => HidApi::new()?,
    };
    f(guard.insert(api))
}

fn descriptor(device: &hidapi::DeviceInfo) -> DeviceDescriptor {
    DeviceDescriptor {
        path: device.path().to_string_lossy().into_owned(),
        vendor_id: device.vendor_id(),
        product_id: device.product_id(),
        serial_number: device.serial_number().map(str::to_owned),
        manufacturer: device.manufacturer_string().map(str::to_owned),
        product: device.product_string().map(str::to_owned),
    }
}

/// Refresh the device list and collect every interface matching `info`, one per path
pub fn list_attached_devices(info: &DeviceInfo) -> Result<Vec<DeviceDescriptor>, TransportError> {
    with_api(|api| {
        api.refresh_devices()?;
        let mut found: Vec<DeviceDescriptor> = Vec::new();
        for device in api.device_list() {
            if !info.matches(device.vendor_id(), device.product_id()) {
                continue;
            }
            let descriptor = descriptor(device);
            if !found.iter().any(|d| d.path == descriptor.path) {
                found.push(descriptor);
            }
        }
        Ok(found)
    })
}

/// Sort hidapi failures into device loss, permission problems and the rest
fn classify(err: HidError, path: &str) -> TransportError {
    let message = err.to_string().to_lowercase();
    if message.contains("permission denied") || message.contains("access denied") {
        TransportError::PermissionDenied(path.to_owned())
    } else if message.contains("no such device") || message.contains("disconnected") {
        TransportError::Disconnected
    } else {
        TransportError::Hid(err)
    }
}

/// Blocking transport over one opened hidraw device
pub struct HidTransport {
    device: HidDevice,
    handle: DeviceHandle,
    buf: [u8; REPORT_SIZE],
}

impl HidTransport {
    /// Open a specific enumerated device
    pub fn open(descriptor: &DeviceDescriptor) -> Result<Self, TransportError> {
        let path = CString::new(descriptor.path.as_str()).map_err(|_| TransportError::NotFound)?;
        let device = with_api(|api| {
            api.open_path(&path)
                .map_err(|e| classify(e, &descriptor.path))
        })?;
        tracing::info!("opened {descriptor}");
        Ok(Self {
            device,
            handle: DeviceHandle::new(descriptor.clone()),
            buf: [0u8; REPORT_SIZE],
        })
    }

    /// Open the first attached device matching `info`
    pub fn open_first(info: &DeviceInfo) -> Result<Self, TransportError> {
        let descriptor = list_attached_devices(info)?
            .into_iter()
            .next()
            .ok_or(TransportError::NotFound)?;
        Self::open(&descriptor)
    }

    fn fail(&self, err: HidError) -> TransportError {
        let err = classify(err, self.handle.path());
        if err.is_device_loss() {
            self.handle.invalidate();
        }
        err
    }
}

impl Transport for HidTransport {
    fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    fn write_report(&mut self, report: &HidReport) -> Result<(), TransportError> {
        self.handle.ensure_alive()?;
        // hidapi expects the report id in front, devices without ids use 0
        let mut buf = [0u8; REPORT_SIZE + 1];
        buf[1..].copy_from_slice(report.as_bytes());
        tracing::trace!("-> {report:?}");
        let written = self.device.write(&buf).map_err(|e| self.fail(e))?;
        check_written(written, buf.len())
    }

    fn read_report(&mut self, timeout: Duration) -> Result<Option<HidReport>, TransportError> {
        self.handle.ensure_alive()?;
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let len = self
            .device
            .read_timeout(&mut self.buf, millis)
            .map_err(|e| self.fail(e))?;
        if len == 0 {
            return Ok(None);
        }
        let report = HidReport::from_received(&self.buf[..len]);
        tracing::trace!("<- {report:?}");
        Ok(Some(report))
    }
}

/// Background thread diffing the attached device set on an interval.
///
/// Events are delivered on an unbounded channel. The thread exits when the
/// watcher is dropped or every receiver is gone.
pub struct HotplugWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWatcher {
    /// Start watching, returning the event stream. Devices already attached are
    /// reported as attach events first.
    pub fn spawn(
        info: &'static DeviceInfo,
        interval: Duration,
    ) -> Result<(Self, UnboundedReceiver<HotplugEvent>), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name("hotplug".into())
            .spawn({
                let stop = stop.clone();
                move || watch(info, interval, tx, stop)
            })?;
        Ok((
            Self {
                stop,
                thread: Some(thread),
            },
            rx,
        ))
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watch(
    info: &'static DeviceInfo,
    interval: Duration,
    tx: UnboundedSender<HotplugEvent>,
    stop: Arc<AtomicBool>,
) {
    let mut known: HashMap<String, DeviceDescriptor> = HashMap::new();
    while !stop.load(Ordering::Acquire) && !tx.is_closed() {
        match list_attached_devices(info) {
            Ok(devices) => {
                for event in diff(&mut known, devices) {
                    match &event {
                        HotplugEvent::Attached(d) => tracing::info!("attached: {d}"),
                        HotplugEvent::Detached { path } => tracing::info!("detached: {path}"),
                    }
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            },
            Err(e) => tracing::warn!("device enumeration failed: {e}"),
        }
        std::thread::sleep(interval);
    }
    tracing::debug!("hotplug watcher stopped");
}

/// Update `known` to `current`, yielding detaches before attaches
fn diff(
    known: &mut HashMap<String, DeviceDescriptor>,
    current: Vec<DeviceDescriptor>,
) -> Vec<HotplugEvent> {
    let mut events: Vec<HotplugEvent> = known
        .keys()
        .filter(|path| !current.iter().any(|d| &d.path == *path))
        .map(|path| HotplugEvent::Detached { path: path.clone() })
        .collect();
    for event in &events {
        if let HotplugEvent::Detached { path } = event {
            known.remove(path);
        }
    }
    for device in current {
        if !known.contains_key(&device.path) {
            known.insert(device.path.clone(), device.clone());
            events.push(HotplugEvent::Attached(device));
        }
    }
    events
}

/// The write has to cover the report id as well as the report
fn check_written(written: usize, expected: usize) -> Result<(), TransportError> {
    if written < expected {
        return Err(TransportError::ShortWrite { written, expected });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(path: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            path: path.into(),
            vendor_id: 0x0801,
            product_id: 0x0003,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }

    #[test]
    fn diff_reports_changes_once() {
        let mut known = HashMap::new();
        assert_eq!(
            diff(&mut known, vec![device("a")]),
            vec![HotplugEvent::Attached(device("a"))]
        );
        assert!(diff(&mut known, vec![device("a")]).is_empty());
        assert_eq!(
            diff(&mut known, vec![device("b")]),
            vec![
                HotplugEvent::Detached { path: "a".into() },
                HotplugEvent::Attached(device("b"))
            ]
        );
        assert_eq!(
            diff(&mut known, vec![]),
            vec![HotplugEvent::Detached { path: "b".into() }]
        );
        assert!(known.is_empty());
    }

    #[test]
    fn classify_permission_errors() {
        let err = HidError::HidApiError {
            message: "Permission denied".into(),
        };
        assert!(matches!(
            classify(err, "/dev/hidraw0"),
            TransportError::PermissionDenied(p) if p == "/dev/hidraw0"
        ));
        let err = HidError::HidApiError {
            message: "No such device".into(),
        };
        assert!(classify(err, "/dev/hidraw0").is_device_loss());
    }

    #[test]
    fn short_write_counts_report_id() {
        let full = REPORT_SIZE + 1;
        assert!(check_written(full, full).is_ok());
        assert!(matches!(
            check_written(REPORT_SIZE, full),
            Err(TransportError::ShortWrite { written: 64, expected: 65 })
        ));
    }
}
