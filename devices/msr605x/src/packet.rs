//! Splitting messages into HID reports and folding them back together.
//!
//! Byte 0 of every report is a header: bit 7 marks the first report of a
//! message, bit 6 the last, and bits 0-5 the payload length carried by the
//! report. Payload follows the header, padding after it is ignored.

use magstripe_core::{HidReport, REPORT_SIZE};

use crate::types::FramingError;

/// Payload bytes that fit in one report after the header
pub const MAX_PAYLOAD: usize = REPORT_SIZE - 1;

const FIRST: u8 = 0x80;
const LAST: u8 = 0x40;
const LENGTH: u8 = 0x3F;

/// Split a message into reports. An empty message still produces one report.
pub fn frame(message: &[u8]) -> Vec<HidReport> {
    let count = message.len().div_ceil(MAX_PAYLOAD).max(1);
    let mut chunks = message.chunks(MAX_PAYLOAD);

    (0..count)
        .map(|i| {
            let chunk = chunks.next().unwrap_or_default();
            let mut buf = [0u8; REPORT_SIZE];
            buf[0] = chunk.len() as u8;
            if i == 0 {
                buf[0] |= FIRST;
            }
            if i == count - 1 {
                buf[0] |= LAST;
            }
            buf[1..1 + chunk.len()].copy_from_slice(chunk);
            HidReport::new(buf)
        })
        .collect()
}

/// Incremental message reassembly over reports in arrival order
#[derive(Debug, Default)]
pub struct Reassembler {
    message: Vec<u8>,
    started: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a first report has been seen without its last report yet
    pub fn in_progress(&self) -> bool {
        self.started
    }

    /// Drop any partial message
    pub fn reset(&mut self) {
        self.message.clear();
        self.started = false;
    }

    /// Fold one report in, yielding the message once the last report arrives
    pub fn push(&mut self, report: &HidReport) -> Result<Option<Vec<u8>>, FramingError> {
        let received = report.received();
        let header = received.first().copied().unwrap_or_default();
        let declared = (header & LENGTH) as usize;
        let available = received.len().saturating_sub(1);
        if declared > available {
            return Err(FramingError::LengthOverflow {
                declared,
                available,
            });
        }

        match (self.started, header & FIRST != 0) {
            (false, false) => return Err(FramingError::MissingStart),
            (true, true) => return Err(FramingError::UnexpectedStart),
            _ => self.started = true,
        }

        self.message.extend_from_slice(&received[1..1 + declared]);
        if header & LAST == 0 {
            return Ok(None);
        }

        self.started = false;
        Ok(Some(std::mem::take(&mut self.message)))
    }
}

/// Fold a complete report sequence into its message
pub fn defragment<'a>(
    reports: impl IntoIterator<Item = &'a HidReport>,
) -> Result<Vec<u8>, FramingError> {
    let mut reassembler = Reassembler::new();
    for report in reports {
        if let Some(message) = reassembler.push(report)? {
            return Ok(message);
        }
    }
    Err(FramingError::Truncated)
}
