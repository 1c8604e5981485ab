//! Long running read loop that follows the reader across replugs

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use magstripe_core::{DeviceDescriptor, HotplugEvent, TransportError};
use msr605x::{
    HidTransport, HotplugWatcher, Msr605x, ReadFormat, SessionError, SessionState, SessionStatus,
    INFO,
};

use crate::card;
use crate::config::Config;
use crate::detection;
use crate::lock::Lock;

pub struct MonitorArgs {
    pub path: Option<String>,
    pub format: ReadFormat,
    pub save: bool,
}

/// Read every swiped card until interrupted
pub async fn run(config: Config, args: MonitorArgs) -> Result<(), Box<dyn Error>> {
    let lock = Lock::acquire()?;
    tracing::debug!("holding {}", lock.file_path().display());
    let (watcher, events) = HotplugWatcher::spawn(&INFO, config.device.poll_interval)?;
    let session = Msr605x::new(config.session(), events);
    let mut status = session.subscribe();

    let stop = Arc::new(AtomicBool::new(false));
    let mut worker = tokio::task::spawn_blocking({
        let stop = stop.clone();
        move || read_loop(session, &config, &args, &stop)
    });

    println!("waiting for a {}, press ctrl-c to stop", INFO.name);
    let mut last = status.borrow().clone();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("stopping");
                stop.store(true, Ordering::Release);
                break;
            },
            Ok(()) = status.changed() => {
                let current = status.borrow_and_update().clone();
                announce(&last, &current);
                last = current;
            },
            res = &mut worker => {
                res?;
                return Ok(());
            },
        }
    }

    // the worker notices the flag once the current swipe window closes
    worker.await?;
    drop(watcher);
    drop(lock);
    Ok(())
}

fn announce(last: &SessionStatus, current: &SessionStatus) {
    for line in transitions(last, current) {
        println!("{line}");
    }
}

/// Messages for the edges between two status snapshots
fn transitions(last: &SessionStatus, current: &SessionStatus) -> Vec<String> {
    let mut lines = Vec::new();
    match (last.state, current.state) {
        (SessionState::Disconnected, SessionState::Connected) => {
            if let Some(device) = &current.device {
                lines.push(format!("connected to {device}"));
            }
        },
        (SessionState::Connected | SessionState::Busy, SessionState::Disconnected) => {
            lines.push("device disconnected, waiting for it to come back".into());
        },
        _ => {},
    }
    if current.awaiting_swipe && !last.awaiting_swipe {
        lines.push("swipe a card".into());
    }
    lines
}

/// Idle polls between re-enumerations while no reader is attached
const RESCAN_POLLS: u32 = 20;

/// Counts idle polls and says when the attached devices should be listed again.
///
/// Hot-plug events fire once per path, so a reader whose first attach failed
/// is only picked up again through a rescan.
#[derive(Debug, Default)]
struct Rescan {
    idle: u32,
}

impl Rescan {
    fn due(&mut self) -> bool {
        self.idle += 1;
        if self.idle >= RESCAN_POLLS {
            self.idle = 0;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.idle = 0;
    }
}

fn read_loop(mut session: Msr605x, config: &Config, args: &MonitorArgs, stop: &AtomicBool) {
    let idle = config.device.poll_interval;
    let path = args.path.as_deref();
    let mut rescan = Rescan::default();
    while !stop.load(Ordering::Acquire) {
        let events = session.poll_events();
        if session.state() == SessionState::Disconnected {
            attach_first(&mut session, events, path);
            if session.state() == SessionState::Disconnected && rescan.due() {
                retry_attach(&mut session, path);
            }
            if session.state() == SessionState::Disconnected {
                std::thread::sleep(idle);
            } else {
                rescan.reset();
            }
            continue;
        }

        match session.read_card(args.format) {
            Ok(read) => {
                crate::print_read(&read);
                if args.save {
                    let output = &config.output;
                    let path = card::timestamped_path(output.directory.as_deref(), output.format);
                    match card::save(&read.image, &path, output.format) {
                        Ok(()) => println!("saved {}", path.display()),
                        Err(e) => eprintln!("failed to save {}: {e}", path.display()),
                    }
                }
            },
            Err(SessionError::Timeout) => {},
            Err(SessionError::DeviceLost) => {
                tracing::debug!("device lost during read");
            },
            Err(e) => {
                eprintln!("read failed: {e}");
                std::thread::sleep(idle);
            },
        }
    }
    session.detach();
}

/// Attach to the first announced device that matches the path filter
fn attach_first(session: &mut Msr605x, events: Vec<HotplugEvent>, path: Option<&str>) {
    for event in events {
        let HotplugEvent::Attached(descriptor) = event else {
            continue;
        };
        if !detection::matches(&descriptor, path) {
            tracing::debug!("ignoring {descriptor}");
            continue;
        }
        match attach(session, &descriptor) {
            Ok(()) => return,
            Err(e) => eprintln!("could not use {descriptor}: {e}"),
        }
    }
}

/// List attached readers again and try the selected one
fn retry_attach(session: &mut Msr605x, path: Option<&str>) {
    let descriptor = match detection::select(path) {
        Ok(descriptor) => descriptor,
        Err(TransportError::NotFound) => return,
        Err(e) => {
            tracing::debug!("rescan failed: {e}");
            return;
        },
    };
    tracing::debug!("retrying {descriptor}");
    if let Err(e) = attach(session, &descriptor) {
        tracing::debug!("retry on {descriptor} failed: {e}");
    }
}

fn attach(session: &mut Msr605x, descriptor: &DeviceDescriptor) -> Result<(), SessionError> {
    HidTransport::open(descriptor)
        .map_err(SessionError::from)
        .and_then(|transport| session.attach(transport))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescan_fires_on_a_fixed_period() {
        let mut rescan = Rescan::default();
        let fired: Vec<u32> = (1..=2 * RESCAN_POLLS).filter(|_| rescan.due()).collect();
        assert_eq!(fired.len(), 2);

        for _ in 1..RESCAN_POLLS {
            assert!(!rescan.due());
        }
        rescan.reset();
        for _ in 1..RESCAN_POLLS {
            assert!(!rescan.due());
        }
        assert!(rescan.due());
    }

    #[test]
    fn only_edges_are_announced() {
        let device = DeviceDescriptor {
            path: "/dev/hidraw0".into(),
            vendor_id: 0x0801,
            product_id: 0x0003,
            serial_number: None,
            manufacturer: None,
            product: None,
        };
        let idle = SessionStatus::default();
        let connected = SessionStatus {
            state: SessionState::Connected,
            device: Some(device),
            ..Default::default()
        };
        let waiting = SessionStatus {
            state: SessionState::Busy,
            operation: Some("read iso"),
            awaiting_swipe: true,
            ..connected.clone()
        };

        assert_eq!(
            transitions(&idle, &connected),
            vec!["connected to 0801:0003 unknown device /dev/hidraw0"]
        );
        assert_eq!(transitions(&connected, &waiting), vec!["swipe a card"]);
        assert!(transitions(&waiting, &waiting).is_empty());
        assert_eq!(
            transitions(&waiting, &idle),
            vec!["device disconnected, waiting for it to come back"]
        );
    }
}
