//! Command vocabulary and its wire encoding.
//!
//! Every command is `ESC` followed by an identifying byte and optional
//! arguments. Composite read/write payloads are framed per track as
//! `ESC <n> <data>` and closed with `? FS`.

use magstripe_core::TrackNumber;

use crate::consts::{END_SENTINEL, ESC, FS};
use crate::types::{Coercivity, Density, Led, ReadFormat, TrackMask, TrackPayloads};

/// Marks the start of a composite track data block
pub const DATA_BLOCK: u8 = b's';

/// Response shape a command expects back
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expect {
    /// One status reply, followed by `echo` argument bytes
    Status { echo: usize },
    /// Short printable string
    Text,
    /// Composite track block closed by a field separator
    Tracks(ReadFormat),
    /// `ESC h` or `ESC l`
    Coercivity,
    /// The device does not answer
    Nothing,
}

/// Closed set of device commands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Reset,
    CommunicationTest,
    RamTest,
    SensorTest,
    FirmwareVersion,
    ReadIso,
    ReadRaw,
    /// Firmware encoded characters per track, without sentinels
    WriteIso(TrackPayloads),
    /// Bit packed payload per track
    WriteRaw(TrackPayloads),
    Erase(TrackMask),
    SetCoercivity(Coercivity),
    GetCoercivity,
    /// Bits per character for tracks 1, 2 and 3
    SetBpc([u8; 3]),
    SetDensity {
        track: TrackNumber,
        density: Density,
    },
    /// Clocking zeros written before the start sentinel
    SetLeadingZeros {
        bpi210: u8,
        bpi75: u8,
    },
    Led(Led),
}

impl Command {
    /// Identifying byte following `ESC`
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Reset => b'a',
            Command::CommunicationTest => b'e',
            Command::RamTest => 0x87,
            Command::SensorTest => 0x86,
            Command::FirmwareVersion => b'v',
            Command::ReadIso => b'r',
            Command::ReadRaw => b'm',
            Command::WriteIso(_) => b'w',
            Command::WriteRaw(_) => b'n',
            Command::Erase(_) => b'c',
            Command::SetCoercivity(Coercivity::Hi) => b'x',
            Command::SetCoercivity(Coercivity::Lo) => b'y',
            Command::GetCoercivity => b'd',
            Command::SetBpc(_) => b'o',
            Command::SetDensity { .. } => b'b',
            Command::SetLeadingZeros { .. } => b'z',
            Command::Led(led) => *led as u8,
        }
    }

    pub fn expect(&self) -> Expect {
        match self {
            Command::Reset
            | Command::CommunicationTest
            | Command::RamTest
            | Command::SensorTest
            | Command::WriteIso(_)
            | Command::WriteRaw(_)
            | Command::Erase(_)
            | Command::SetCoercivity(_)
            | Command::SetDensity { .. }
            | Command::SetLeadingZeros { .. } => Expect::Status { echo: 0 },
            Command::SetBpc(_) => Expect::Status { echo: 3 },
            Command::FirmwareVersion => Expect::Text,
            Command::ReadIso => Expect::Tracks(ReadFormat::Iso),
            Command::ReadRaw => Expect::Tracks(ReadFormat::Raw),
            Command::GetCoercivity => Expect::Coercivity,
            Command::Led(_) => Expect::Nothing,
        }
    }

    /// Whether the device waits for a card before answering
    pub fn requires_swipe(&self) -> bool {
        matches!(
            self,
            Command::ReadIso
                | Command::ReadRaw
                | Command::WriteIso(_)
                | Command::WriteRaw(_)
                | Command::Erase(_)
                | Command::SensorTest
        )
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Reset => "reset",
            Command::CommunicationTest => "communication test",
            Command::RamTest => "ram test",
            Command::SensorTest => "sensor test",
            Command::FirmwareVersion => "firmware version",
            Command::ReadIso => "read iso",
            Command::ReadRaw => "read raw",
            Command::WriteIso(_) => "write iso",
            Command::WriteRaw(_) => "write raw",
            Command::Erase(_) => "erase",
            Command::SetCoercivity(_) => "set coercivity",
            Command::GetCoercivity => "get coercivity",
            Command::SetBpc(_) => "set bpc",
            Command::SetDensity { .. } => "set density",
            Command::SetLeadingZeros { .. } => "set leading zeros",
            Command::Led(_) => "led",
        }
    }

    /// Render the command into the byte sequence the firmware expects
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![ESC, self.opcode()];
        match self {
            Command::WriteIso(payloads) => {
                buf.extend_from_slice(&[ESC, DATA_BLOCK]);
                for (track, data) in payloads.iter() {
                    buf.extend_from_slice(&[ESC, track.get()]);
                    buf.extend_from_slice(data);
                }
                buf.extend_from_slice(&[END_SENTINEL, FS]);
            },
            Command::WriteRaw(payloads) => {
                buf.extend_from_slice(&[ESC, DATA_BLOCK]);
                for (track, data) in payloads.iter() {
                    // payload length is bounded by TrackPayloads::set
                    buf.extend_from_slice(&[ESC, track.get(), data.len() as u8]);
                    buf.extend_from_slice(data);
                }
                buf.extend_from_slice(&[END_SENTINEL, FS]);
            },
            Command::Erase(mask) => buf.push(mask.bits()),
            Command::SetBpc(widths) => buf.extend_from_slice(widths),
            Command::SetDensity { track, density } => buf.push(density.selector(*track)),
            Command::SetLeadingZeros { bpi210, bpi75 } => buf.extend_from_slice(&[*bpi210, *bpi75]),
            Command::Reset
            | Command::CommunicationTest
            | Command::RamTest
            | Command::SensorTest
            | Command::FirmwareVersion
            | Command::ReadIso
            | Command::ReadRaw
            | Command::SetCoercivity(_)
            | Command::GetCoercivity
            | Command::Led(_) => {},
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_commands() {
        assert_eq!(Command::Reset.encode(), vec![0x1B, b'a']);
        assert_eq!(Command::CommunicationTest.encode(), vec![0x1B, b'e']);
        assert_eq!(Command::SetCoercivity(Coercivity::Hi).encode(), vec![0x1B, b'x']);
        assert_eq!(Command::SetCoercivity(Coercivity::Lo).encode(), vec![0x1B, b'y']);
        assert_eq!(Command::Led(Led::Green).encode(), vec![0x1B, 0x83]);
    }

    #[test]
    fn iso_write_layout() {
        let mut payloads = TrackPayloads::new();
        payloads.set(TrackNumber::One, b"AB".to_vec()).unwrap();
        payloads.set(TrackNumber::Three, b"9".to_vec()).unwrap();
        assert_eq!(
            Command::WriteIso(payloads).encode(),
            vec![
                0x1B, b'w', 0x1B, b's', 0x1B, 1, b'A', b'B', 0x1B, 2, 0x1B, 3, b'9', b'?', 0x1C
            ]
        );
    }

    #[test]
    fn raw_write_is_length_prefixed() {
        let mut payloads = TrackPayloads::new();
        payloads.set(TrackNumber::Two, vec![0x1B, 0x1C]).unwrap();
        assert_eq!(
            Command::WriteRaw(payloads).encode(),
            vec![
                0x1B, b'n', 0x1B, b's', 0x1B, 1, 0, 0x1B, 2, 2, 0x1B, 0x1C, 0x1B, 3, 0, b'?', 0x1C
            ]
        );
    }

    #[test]
    fn argument_bytes() {
        assert_eq!(Command::Erase(TrackMask::ALL).encode(), vec![0x1B, b'c', 0x07]);
        assert_eq!(Command::SetBpc([7, 5, 5]).encode(), vec![0x1B, b'o', 7, 5, 5]);
        assert_eq!(
            Command::SetDensity {
                track: TrackNumber::Two,
                density: Density::Bpi210
            }
            .encode(),
            vec![0x1B, b'b', 0xD2]
        );
        assert_eq!(
            Command::SetLeadingZeros {
                bpi210: 61,
                bpi75: 22
            }
            .encode(),
            vec![0x1B, b'z', 61, 22]
        );
    }

    #[test]
    fn response_shapes() {
        assert_eq!(Command::Reset.expect(), Expect::Status { echo: 0 });
        assert_eq!(Command::SetBpc([5, 5, 5]).expect(), Expect::Status { echo: 3 });
        assert_eq!(Command::ReadRaw.expect(), Expect::Tracks(ReadFormat::Raw));
        assert_eq!(Command::FirmwareVersion.expect(), Expect::Text);
        assert_eq!(Command::Led(Led::Off).expect(), Expect::Nothing);
        assert!(Command::Erase(TrackMask::ALL).requires_swipe());
        assert!(Command::SensorTest.requires_swipe());
        assert!(!Command::GetCoercivity.requires_swipe());
    }
}
