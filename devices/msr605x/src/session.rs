//! Session state machine composing framing, commands and the track codec.
//!
//! A session owns at most one transport. Exchanges are serialized through
//! `&mut self`, so the session is never busy twice. Hot-plug events arrive on
//! a channel and are checked between short read slices, which bounds how long
//! a detach can go unnoticed during a swipe.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use magstripe_core::codec::{self, CodecError};
use magstripe_core::{
    CardImage, DeviceDescriptor, HotplugEvent, TrackData, TrackNumber, TrackSpec, Transport,
    TransportError, TRACKS,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;

use crate::abi::{Command, Expect};
use crate::packet::{self, Reassembler};
use crate::response::{decode_response, Response};
use crate::types::{
    Coercivity, Density, FramingError, Led, ProtocolError, ReadFormat, TrackMask, TrackPayloads,
};

/// Upper bound on stale reports drained before an exchange
const MAX_STALE_REPORTS: usize = 64;

/// Exchange timing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Longest single blocking read, and so the hot-plug reaction time
    pub poll_interval: Duration,
    /// Deadline for commands answered immediately
    pub command_timeout: Duration,
    /// Deadline for commands waiting on a card swipe
    pub swipe_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            command_timeout: Duration::from_secs(2),
            swipe_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connected,
    Busy,
}

/// Snapshot published to subscribers on every state change
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub device: Option<DeviceDescriptor>,
    /// Command in flight
    pub operation: Option<&'static str>,
    /// The device is waiting for a card
    pub awaiting_swipe: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("timed out waiting for the device")]
    Timeout,
    #[error("device was disconnected")]
    DeviceLost,
    #[error("device rejected the write (status {status:#04x})")]
    WriteRejected { status: u8 },
    #[error("no device connected")]
    NotConnected,
    #[error("no tracks selected")]
    EmptyTrackMask,
    #[error("card image has no tracks to write")]
    NothingToWrite,
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("track {track}: {source}")]
    Codec {
        track: TrackNumber,
        #[source]
        source: CodecError,
    },
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        if err.is_device_loss() {
            SessionError::DeviceLost
        } else {
            SessionError::Transport(err)
        }
    }
}

/// Result of a card read. Tracks that failed to decode are listed in
/// `failures` and appear in `image` as empty tracks.
#[derive(Debug, Default)]
pub struct CardRead {
    pub image: CardImage,
    pub failures: Vec<(TrackNumber, CodecError)>,
}

impl CardRead {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// High level access to one device at a time
pub struct Session<T: Transport> {
    config: SessionConfig,
    transport: Option<T>,
    events: UnboundedReceiver<HotplugEvent>,
    pending: VecDeque<HotplugEvent>,
    state: SessionState,
    status: watch::Sender<SessionStatus>,
    specs: [TrackSpec; 3],
    reassembler: Reassembler,
}

impl<T: Transport> Session<T> {
    /// Create a disconnected session fed by a hot-plug event stream
    pub fn new(config: SessionConfig, events: UnboundedReceiver<HotplugEvent>) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            config,
            transport: None,
            events,
            pending: VecDeque::new(),
            state: SessionState::Disconnected,
            status,
            specs: TRACKS,
            reassembler: Reassembler::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[inline(always)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Live status updates
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn device(&self) -> Option<&DeviceDescriptor> {
        self.transport.as_ref().map(|t| t.handle().descriptor())
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// Track geometry as currently configured on the device
    pub fn specs(&self) -> &[TrackSpec; 3] {
        &self.specs
    }

    fn publish(&mut self, operation: Option<&'static str>, awaiting_swipe: bool) {
        let state = self.state;
        let device = self.device().cloned();
        self.status.send_modify(|status| {
            status.state = state;
            status.device = device;
            status.operation = operation;
            status.awaiting_swipe = awaiting_swipe;
        });
    }

    /// Take ownership of a freshly opened device and confirm it answers.
    /// Any previous device is detached first.
    pub fn attach(&mut self, transport: T) -> Result<(), SessionError> {
        if self.transport.is_some() {
            self.detach();
        }
        tracing::info!("attaching {}", transport.handle().descriptor());
        self.transport = Some(transport);
        self.specs = TRACKS;

        match self.exchange(&Command::CommunicationTest) {
            Ok(_) => {
                self.state = SessionState::Connected;
                self.publish(None, false);
                Ok(())
            },
            Err(e) => {
                tracing::warn!("communication test failed: {e}");
                self.detach();
                Err(e)
            },
        }
    }

    /// Drop the device and return to disconnected
    pub fn detach(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.handle().invalidate();
            tracing::info!("detached {}", transport.handle().descriptor());
        }
        self.reassembler.reset();
        self.state = SessionState::Disconnected;
        self.publish(None, false);
    }

    /// Process pending hot-plug events and hand them to the caller.
    /// A detach of the current device disconnects the session.
    pub fn poll_events(&mut self) -> Vec<HotplugEvent> {
        if self.drain_events() {
            self.detach();
        }
        self.pending.drain(..).collect()
    }

    /// Move queued events into `pending`, returning whether our device left
    fn drain_events(&mut self) -> bool {
        let path = self.device().map(|d| d.path.clone());
        let mut lost = false;
        while let Ok(event) = self.events.try_recv() {
            if let HotplugEvent::Detached { path: gone } = &event {
                lost |= path.as_ref() == Some(gone);
            }
            self.pending.push_back(event);
        }
        lost || self.transport.as_ref().is_some_and(|t| !t.handle().is_alive())
    }

    fn check_hotplug(&mut self) -> Result<(), SessionError> {
        if self.drain_events() {
            return Err(SessionError::DeviceLost);
        }
        Ok(())
    }

    /// One request/response round trip, without touching the session state
    fn exchange(&mut self, command: &Command) -> Result<Response, SessionError> {
        let timeout = if command.requires_swipe() {
            self.config.swipe_timeout
        } else {
            self.config.command_timeout
        };
        self.check_hotplug()?;

        let transport = self.transport.as_mut().ok_or(SessionError::NotConnected)?;
        let mut stale = 0;
        while stale < MAX_STALE_REPORTS && transport.read_report(Duration::ZERO)?.is_some() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!("flushed {stale} stale reports");
        }

        let message = command.encode();
        tracing::debug!("{}: sending {} bytes", command.name(), message.len());
        for report in packet::frame(&message) {
            transport.write_report(&report)?;
        }
        if command.expect() == Expect::Nothing {
            return Ok(Response::Nothing);
        }
        if command.requires_swipe() {
            self.publish(Some(command.name()), true);
        }

        self.reassembler.reset();
        let deadline = Instant::now() + timeout;
        loop {
            self.check_hotplug()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::debug!("{}: no reply within {timeout:?}", command.name());
                return Err(SessionError::Timeout);
            }

            let transport = self.transport.as_mut().ok_or(SessionError::NotConnected)?;
            let Some(report) = transport.read_report(remaining.min(self.config.poll_interval))?
            else {
                continue;
            };
            if let Some(reply) = self.reassembler.push(&report)? {
                tracing::debug!("{}: received {} bytes", command.name(), reply.len());
                return Ok(decode_response(command, &reply)?);
            }
        }
    }

    /// Run a command from the connected state, always leaving busy afterwards
    fn run(&mut self, command: Command) -> Result<Response, SessionError> {
        if self.state == SessionState::Disconnected || self.transport.is_none() {
            return Err(SessionError::NotConnected);
        }
        self.state = SessionState::Busy;
        self.publish(Some(command.name()), false);

        let result = self.exchange(&command);
        if matches!(result, Err(SessionError::DeviceLost)) {
            self.detach();
        } else {
            self.state = SessionState::Connected;
            self.publish(None, false);
        }
        result
    }

    /// Communication test
    pub fn self_test(&mut self) -> Result<(), SessionError> {
        self.run(Command::CommunicationTest).map(drop)
    }

    pub fn ram_test(&mut self) -> Result<(), SessionError> {
        self.run(Command::RamTest).map(drop)
    }

    pub fn sensor_test(&mut self) -> Result<(), SessionError> {
        self.run(Command::SensorTest).map(drop)
    }

    /// Reset the device, cancelling any pending swipe
    pub fn reset(&mut self) -> Result<(), SessionError> {
        self.run(Command::Reset).map(drop)
    }

    pub fn firmware_version(&mut self) -> Result<String, SessionError> {
        match self.run(Command::FirmwareVersion)? {
            Response::Text(version) => Ok(version),
            _ => Err(ProtocolError::MalformedResponse("expected a version string").into()),
        }
    }

    pub fn set_led(&mut self, led: Led) -> Result<(), SessionError> {
        self.run(Command::Led(led)).map(drop)
    }

    pub fn set_coercivity(&mut self, coercivity: Coercivity) -> Result<(), SessionError> {
        self.run(Command::SetCoercivity(coercivity)).map(drop)
    }

    pub fn coercivity(&mut self) -> Result<Coercivity, SessionError> {
        match self.run(Command::GetCoercivity)? {
            Response::Coercivity(coercivity) => Ok(coercivity),
            _ => Err(ProtocolError::MalformedResponse("expected a coercivity").into()),
        }
    }

    /// Set bits per character for tracks 1, 2 and 3.
    /// Track alphabets follow the new widths once the device accepts them.
    pub fn set_bpc(&mut self, widths: [u8; 3]) -> Result<(), SessionError> {
        let mut specs = self.specs;
        for (spec, bpc) in specs.iter_mut().zip(widths) {
            let track = spec.track;
            *spec = spec
                .with_bits_per_character(bpc)
                .map_err(|source| SessionError::Codec { track, source })?;
        }
        self.run(Command::SetBpc(widths))?;
        self.specs = specs;
        Ok(())
    }

    pub fn set_density(&mut self, track: TrackNumber, density: Density) -> Result<(), SessionError> {
        self.run(Command::SetDensity { track, density })?;
        self.specs[track.index()].bits_per_inch = density.bpi();
        Ok(())
    }

    pub fn set_leading_zeros(&mut self, bpi210: u8, bpi75: u8) -> Result<(), SessionError> {
        self.run(Command::SetLeadingZeros { bpi210, bpi75 }).map(drop)
    }

    /// Wait for a swipe and decode every track.
    ///
    /// Blank tracks come back as empty data. A track that fails to decode comes
    /// back empty as well and is reported in [`CardRead::failures`] without
    /// failing the others.
    pub fn read_card(&mut self, format: ReadFormat) -> Result<CardRead, SessionError> {
        let command = match format {
            ReadFormat::Iso => Command::ReadIso,
            ReadFormat::Raw => Command::ReadRaw,
        };
        let Response::Tracks(payloads) = self.run(command)? else {
            return Err(ProtocolError::MalformedResponse("expected track data").into());
        };

        let mut read = CardRead::default();
        for (track, payload) in payloads.iter() {
            let spec = &self.specs[track.index()];
            let decoded = match format {
                ReadFormat::Iso => codec::parse_text(spec, payload),
                ReadFormat::Raw => codec::decode_track(spec, payload),
            };
            match decoded {
                Ok(data) => {
                    read.image.insert(data);
                },
                Err(e) => {
                    tracing::warn!("track {track}: {e}");
                    read.image.insert(TrackData::empty(track));
                    read.failures.push((track, e));
                },
            }
        }
        Ok(read)
    }

    /// Encode every present track and wait for a swipe to write them
    pub fn write_card(&mut self, image: &CardImage, format: ReadFormat) -> Result<(), SessionError> {
        if image.is_empty() {
            return Err(SessionError::NothingToWrite);
        }

        let mut payloads = TrackPayloads::new();
        for data in image.iter() {
            let track = data.track();
            let spec = &self.specs[track.index()];
            let bytes = match format {
                ReadFormat::Iso => {
                    codec::validate(spec, data.as_str()).map(|()| data.as_str().as_bytes().to_vec())
                },
                ReadFormat::Raw => codec::encode_track(spec, data),
            }
            .map_err(|source| SessionError::Codec { track, source })?;
            payloads.set(track, bytes)?;
        }

        let command = match format {
            ReadFormat::Iso => Command::WriteIso(payloads),
            ReadFormat::Raw => Command::WriteRaw(payloads),
        };
        match self.run(command) {
            Err(SessionError::Protocol(ProtocolError::DeviceRejected { status })) => {
                Err(SessionError::WriteRejected { status })
            },
            other => other.map(drop),
        }
    }

    /// Erase the selected tracks on the next swipe
    pub fn erase_tracks(&mut self, mask: TrackMask) -> Result<(), SessionError> {
        if mask.is_empty() {
            return Err(SessionError::EmptyTrackMask);
        }
        self.run(Command::Erase(mask)).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use magstripe_core::{DeviceHandle, HidReport, REPORT_SIZE};
    use tokio::sync::mpsc::{self, UnboundedSender};

    use super::*;
    use crate::consts::{ACK, ESC, FS, NAK};

    const PATH: &str = "/dev/mock";

    /// Replies are queued per command, released once its last report is written
    struct MockTransport {
        handle: DeviceHandle,
        replies: VecDeque<Vec<HidReport>>,
        inbox: VecDeque<HidReport>,
        written: Vec<HidReport>,
        messages: usize,
        detach_on: Option<(usize, UnboundedSender<HotplugEvent>)>,
        /// Reads fail once this many messages have been written
        fail_reads: Option<(usize, fn() -> TransportError)>,
    }

    impl MockTransport {
        fn new(replies: Vec<Vec<HidReport>>) -> Self {
            Self {
                handle: DeviceHandle::new(DeviceDescriptor {
                    path: PATH.into(),
                    vendor_id: 0x0801,
                    product_id: 0x0003,
                    serial_number: None,
                    manufacturer: None,
                    product: Some("MSR605X".into()),
                }),
                replies: replies.into(),
                inbox: VecDeque::new(),
                written: Vec::new(),
                messages: 0,
                detach_on: None,
                fail_reads: None,
            }
        }

        /// Every message written so far
        fn sent(&self) -> Vec<Vec<u8>> {
            let mut reassembler = Reassembler::new();
            self.written
                .iter()
                .filter_map(|r| reassembler.push(r).unwrap())
                .collect()
        }
    }

    impl Transport for MockTransport {
        fn handle(&self) -> &DeviceHandle {
            &self.handle
        }

        fn write_report(&mut self, report: &HidReport) -> Result<(), TransportError> {
            self.handle.ensure_alive()?;
            self.written.push(*report);
            if report.as_bytes()[0] & 0x40 != 0 {
                self.messages += 1;
                if let Some(batch) = self.replies.pop_front() {
                    self.inbox.extend(batch);
                }
                if let Some((n, tx)) = &self.detach_on {
                    if *n == self.messages {
                        tx.send(HotplugEvent::Detached { path: PATH.into() }).unwrap();
                    }
                }
            }
            Ok(())
        }

        fn read_report(&mut self, timeout: Duration) -> Result<Option<HidReport>, TransportError> {
            self.handle.ensure_alive()?;
            if let Some((n, error)) = self.fail_reads {
                if self.messages >= n {
                    let error = error();
                    if error.is_device_loss() {
                        self.handle.invalidate();
                    }
                    return Err(error);
                }
            }
            match self.inbox.pop_front() {
                Some(report) => Ok(Some(report)),
                None => {
                    std::thread::sleep(timeout.min(Duration::from_millis(2)));
                    Ok(None)
                },
            }
        }
    }

    fn reply(bytes: &[u8]) -> Vec<HidReport> {
        packet::frame(bytes)
    }

    fn config() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(2),
            command_timeout: Duration::from_millis(40),
            swipe_timeout: Duration::from_millis(60),
        }
    }

    fn session() -> (Session<MockTransport>, UnboundedSender<HotplugEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(config(), rx), tx)
    }

    /// A session attached to a mock that answers the communication test
    fn connected(
        replies: Vec<Vec<HidReport>>,
    ) -> (Session<MockTransport>, UnboundedSender<HotplugEvent>) {
        let (mut session, tx) = session();
        let mut all = vec![reply(&[ACK])];
        all.extend(replies);
        session.attach(MockTransport::new(all)).unwrap();
        (session, tx)
    }

    fn last_sent(session: &Session<MockTransport>) -> Vec<u8> {
        session.transport().unwrap().sent().pop().unwrap()
    }

    #[test]
    fn attach_runs_communication_test() {
        let (session, _tx) = connected(vec![]);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(last_sent(&session), vec![ESC, b'e']);

        let status = session.subscribe().borrow().clone();
        assert_eq!(status.state, SessionState::Connected);
        assert_eq!(status.device.map(|d| d.path), Some(PATH.to_string()));
    }

    #[test]
    fn rejected_attach_stays_disconnected() {
        let (mut session, _tx) = session();
        let err = session
            .attach(MockTransport::new(vec![reply(&[NAK])]))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::DeviceRejected { status: NAK })
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.transport().is_none());
    }

    #[test]
    fn stale_reports_are_flushed() {
        let (mut session, _tx) = session();
        let mut transport = MockTransport::new(vec![reply(&[ACK])]);
        transport.inbox.extend(reply(&[NAK]));
        session.attach(transport).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn self_test_ack_and_nak() {
        let (mut session, _tx) = connected(vec![reply(&[ACK]), reply(&[NAK])]);
        session.self_test().unwrap();
        assert!(matches!(
            session.self_test(),
            Err(SessionError::Protocol(ProtocolError::DeviceRejected { .. }))
        ));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn write_rejection_returns_to_connected() {
        let (mut session, _tx) = connected(vec![reply(&[NAK])]);
        let image = CardImage::new()
            .with(TrackData::new(&TrackNumber::One.spec(), "HELLO").unwrap())
            .with(TrackData::new(&TrackNumber::Two.spec(), "1234").unwrap());

        let err = session.write_card(&image, ReadFormat::Iso).unwrap_err();
        assert!(matches!(err, SessionError::WriteRejected { status: NAK }));
        assert_eq!(session.state(), SessionState::Connected);

        let mut expected = vec![ESC, b'w', ESC, b's', ESC, 1];
        expected.extend_from_slice(b"HELLO");
        expected.extend_from_slice(&[ESC, 2]);
        expected.extend_from_slice(b"1234");
        expected.extend_from_slice(&[ESC, 3, b'?', FS]);
        assert_eq!(last_sent(&session), expected);
    }

    #[test]
    fn detach_mid_read_loses_device() {
        let (mut session, tx) = session();
        let partial = packet::frame(&[0x1B; 100]).remove(0);
        let mut transport = MockTransport::new(vec![reply(&[ACK]), vec![partial]]);
        transport.detach_on = Some((2, tx.clone()));
        session.attach(transport).unwrap();

        assert!(matches!(
            session.read_card(ReadFormat::Iso),
            Err(SessionError::DeviceLost)
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.transport().is_none());
        assert!(matches!(session.self_test(), Err(SessionError::NotConnected)));
        assert_eq!(
            session.poll_events(),
            vec![HotplugEvent::Detached { path: PATH.into() }]
        );
    }

    /// Attached session whose reads fail from the second command on
    fn failing_after_attach(error: fn() -> TransportError) -> Session<MockTransport> {
        let (mut session, _tx) = session();
        let mut transport = MockTransport::new(vec![reply(&[ACK])]);
        transport.fail_reads = Some((2, error));
        session.attach(transport).unwrap();
        session
    }

    #[test]
    fn transport_error_keeps_connection() {
        let mut session = failing_after_attach(|| {
            TransportError::Io(std::io::Error::other("usb stall"))
        });
        assert!(matches!(
            session.self_test(),
            Err(SessionError::Transport(TransportError::Io(_)))
        ));
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.transport().is_some());
    }

    #[test]
    fn transport_loss_disconnects() {
        let mut session = failing_after_attach(|| TransportError::Disconnected);
        let mut status = session.subscribe();
        assert!(matches!(session.self_test(), Err(SessionError::DeviceLost)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.transport().is_none());
        assert_eq!(status.borrow_and_update().state, SessionState::Disconnected);
    }

    #[test]
    fn continuation_without_start_is_framing_error() {
        let mut bytes = [0u8; REPORT_SIZE];
        bytes[0] = 0x01;
        bytes[1] = ACK;
        let (mut session, _tx) = connected(vec![vec![HidReport::new(bytes)]]);
        assert!(matches!(
            session.self_test(),
            Err(SessionError::Framing(FramingError::MissingStart))
        ));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn detach_event_while_idle() {
        let (mut session, tx) = connected(vec![]);
        tx.send(HotplugEvent::Detached {
            path: "/dev/other".into(),
        })
        .unwrap();
        assert_eq!(session.poll_events().len(), 1);
        assert_eq!(session.state(), SessionState::Connected);

        tx.send(HotplugEvent::Detached { path: PATH.into() }).unwrap();
        session.poll_events();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn timeout_unwinds_to_connected() {
        let (mut session, _tx) = connected(vec![vec![]]);
        let started = Instant::now();
        assert!(matches!(session.self_test(), Err(SessionError::Timeout)));
        assert!(started.elapsed() >= config().command_timeout);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.subscribe().borrow().operation, None);
    }

    #[test]
    fn iso_read_reports_failing_track() {
        let message = b"\x1bs\x1b\x01%ABC 123?\x1b\x02;12A?\x1b\x03?\x1c\x1b0";
        let (mut session, _tx) = connected(vec![reply(message)]);

        let read = session.read_card(ReadFormat::Iso).unwrap();
        assert_eq!(read.image.get(TrackNumber::One).unwrap().as_str(), "ABC 123");
        assert!(read.image.get(TrackNumber::Two).unwrap().is_empty());
        assert!(read.image.get(TrackNumber::Three).unwrap().is_empty());
        assert_eq!(read.failures.len(), 1);
        assert!(matches!(
            read.failures[0],
            (
                TrackNumber::Two,
                CodecError::CharacterOutOfRange {
                    character: 'A',
                    position: 2
                }
            )
        ));
        assert_eq!(last_sent(&session), vec![ESC, b'r']);
    }

    #[test]
    fn raw_read_decodes_on_host() {
        let t1 = TrackData::new(&TrackNumber::One.spec(), "HELLO WORLD").unwrap();
        let t2 = TrackData::new(&TrackNumber::Two.spec(), "0123456789").unwrap();
        let w1 = codec::encode_track(&TrackNumber::One.spec(), &t1).unwrap();
        let w2 = codec::encode_track(&TrackNumber::Two.spec(), &t2).unwrap();

        let mut message = vec![ESC, b's', ESC, 1, w1.len() as u8];
        message.extend_from_slice(&w1);
        message.extend_from_slice(&[ESC, 2, w2.len() as u8]);
        message.extend_from_slice(&w2);
        message.extend_from_slice(&[ESC, 3, 0, b'?', FS, ESC, b'0']);

        let (mut session, _tx) = connected(vec![reply(&message)]);
        let read = session.read_card(ReadFormat::Raw).unwrap();
        assert!(read.is_complete());
        let expected = CardImage::new()
            .with(t1)
            .with(t2)
            .with(TrackData::empty(TrackNumber::Three));
        assert_eq!(read.image, expected);
    }

    #[test]
    fn raw_write_encodes_tracks() {
        let (mut session, _tx) = connected(vec![reply(&[ESC, b'0'])]);
        let t2 = TrackData::new(&TrackNumber::Two.spec(), "42").unwrap();
        let wire = codec::encode_track(&TrackNumber::Two.spec(), &t2).unwrap();
        session
            .write_card(&CardImage::new().with(t2), ReadFormat::Raw)
            .unwrap();

        let mut expected = vec![ESC, b'n', ESC, b's', ESC, 1, 0, ESC, 2, wire.len() as u8];
        expected.extend_from_slice(&wire);
        expected.extend_from_slice(&[ESC, 3, 0, b'?', FS]);
        assert_eq!(last_sent(&session), expected);
    }

    #[test]
    fn empty_requests_never_reach_the_device() {
        let (mut session, _tx) = connected(vec![]);
        assert!(matches!(
            session.erase_tracks(TrackMask::NONE),
            Err(SessionError::EmptyTrackMask)
        ));
        assert!(matches!(
            session.write_card(&CardImage::new(), ReadFormat::Iso),
            Err(SessionError::NothingToWrite)
        ));
        assert_eq!(session.transport().unwrap().sent().len(), 1);
    }

    #[test]
    fn erase_sends_track_mask() {
        let (mut session, _tx) = connected(vec![reply(&[ESC, b'0'])]);
        let mask: TrackMask = [TrackNumber::One, TrackNumber::Three].into_iter().collect();
        session.erase_tracks(mask).unwrap();
        assert_eq!(last_sent(&session), vec![ESC, b'c', 0b101]);
    }

    #[test]
    fn bpc_change_updates_alphabets() {
        let (mut session, _tx) = connected(vec![reply(&[ESC, b'0', 7, 8, 5])]);
        assert!(matches!(
            session.set_bpc([7, 6, 5]),
            Err(SessionError::Codec {
                track: TrackNumber::Two,
                source: CodecError::UnsupportedWidth(6)
            })
        ));
        session.set_bpc([7, 8, 5]).unwrap();
        assert_eq!(session.specs()[1].bits_per_character, 8);
        assert_eq!(session.specs()[1].alphabet, magstripe_core::Alphabet::Ascii);
    }

    #[test]
    fn led_does_not_wait_for_reply() {
        let (mut session, _tx) = connected(vec![]);
        session.set_led(Led::Red).unwrap();
        assert_eq!(last_sent(&session), vec![ESC, 0x85]);
    }

    #[test]
    fn queries() {
        let (mut session, _tx) =
            connected(vec![reply(b"\x1bREV2.31"), reply(b"\x1bl")]);
        assert_eq!(session.firmware_version().unwrap(), "REV2.31");
        assert_eq!(session.coercivity().unwrap(), Coercivity::Lo);
    }
}
