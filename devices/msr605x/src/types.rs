use std::fmt;
use std::str::FromStr;

use magstripe_core::TrackNumber;
use serde::{Deserialize, Serialize};

/// Card stock coercivity the write head is driven for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coercivity {
    /// 2750-4000 Oe
    #[default]
    Hi,
    /// 300 Oe
    Lo,
}

impl FromStr for Coercivity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hi" | "high" | "hico" | "hi-co" => Ok(Self::Hi),
            "lo" | "low" | "loco" | "lo-co" => Ok(Self::Lo),
            _ => Err(format!("invalid coercivity: {s}. Available: hi, lo")),
        }
    }
}

impl fmt::Display for Coercivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hi => write!(f, "Hi-Co"),
            Self::Lo => write!(f, "Lo-Co"),
        }
    }
}

/// How track payloads travel over the wire
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadFormat {
    /// Firmware decoded characters
    #[default]
    Iso,
    /// Bit packed track payloads, decoded on the host
    Raw,
}

impl FromStr for ReadFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "iso" => Ok(Self::Iso),
            "raw" => Ok(Self::Raw),
            _ => Err(format!("invalid format: {s}. Available: iso, raw")),
        }
    }
}

impl fmt::Display for ReadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iso => write!(f, "iso"),
            Self::Raw => write!(f, "raw"),
        }
    }
}

/// Front panel led states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Led {
    Off = 0x81,
    All = 0x82,
    Green = 0x83,
    Yellow = 0x84,
    Red = 0x85,
}

impl FromStr for Led {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "all" | "on" => Ok(Self::All),
            "green" | "g" => Ok(Self::Green),
            "yellow" | "y" => Ok(Self::Yellow),
            "red" | "r" => Ok(Self::Red),
            _ => Err(format!(
                "invalid led: {s}. Available: off, all, green, yellow, red"
            )),
        }
    }
}

/// Recording density selectable per track
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Density {
    Bpi75,
    Bpi210,
}

impl Density {
    pub fn from_bpi(bpi: u16) -> Option<Self> {
        match bpi {
            75 => Some(Self::Bpi75),
            210 => Some(Self::Bpi210),
            _ => None,
        }
    }

    pub fn bpi(self) -> u16 {
        match self {
            Self::Bpi75 => 75,
            Self::Bpi210 => 210,
        }
    }

    /// Argument byte of the set density command for a track
    pub fn selector(self, track: TrackNumber) -> u8 {
        match (track, self) {
            (TrackNumber::One, Density::Bpi75) => 0xA0,
            (TrackNumber::One, Density::Bpi210) => 0xA1,
            (TrackNumber::Two, Density::Bpi75) => 0x4B,
            (TrackNumber::Two, Density::Bpi210) => 0xD2,
            (TrackNumber::Three, Density::Bpi75) => 0xC0,
            (TrackNumber::Three, Density::Bpi210) => 0xC1,
        }
    }
}

/// Set of tracks targeted by an erase. Bit 0 is track 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackMask(u8);

impl TrackMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0b111);

    /// Build from raw bits, ignoring anything above bit 2
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    #[inline(always)]
    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn with(self, track: TrackNumber) -> Self {
        Self(self.0 | 1 << track.index())
    }

    pub const fn contains(self, track: TrackNumber) -> bool {
        self.0 & (1 << track.index()) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn tracks(self) -> impl Iterator<Item = TrackNumber> {
        TrackNumber::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl FromIterator<TrackNumber> for TrackMask {
    fn from_iter<I: IntoIterator<Item = TrackNumber>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

impl fmt::Display for TrackMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracks: Vec<String> = self.tracks().map(|t| t.get().to_string()).collect();
        if tracks.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", tracks.join(","))
        }
    }
}

/// Per track byte payloads of a read response or write command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackPayloads {
    tracks: [Vec<u8>; 3],
}

impl TrackPayloads {
    /// Largest payload one length byte can describe
    pub const MAX_LEN: usize = u8::MAX as usize;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, track: TrackNumber, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        if bytes.len() > Self::MAX_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                track,
                len: bytes.len(),
            });
        }
        self.tracks[track.index()] = bytes;
        Ok(())
    }

    pub fn get(&self, track: TrackNumber) -> &[u8] {
        &self.tracks[track.index()]
    }

    /// All three tracks in order, empty payloads included
    pub fn iter(&self) -> impl Iterator<Item = (TrackNumber, &[u8])> {
        TrackNumber::ALL
            .into_iter()
            .map(move |t| (t, self.tracks[t.index()].as_slice()))
    }
}

/// Malformed report sequences
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("message does not begin with a first report")]
    MissingStart,
    #[error("reports ended before the last report of the message")]
    Truncated,
    #[error("report declares {declared} payload bytes but carries {available}")]
    LengthOverflow { declared: usize, available: usize },
    #[error("first report received in the middle of a message")]
    UnexpectedStart,
}

/// Unexpected, rejected or malformed command responses
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("device rejected command (status {status:#04x})")]
    DeviceRejected { status: u8 },
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),
    #[error("response ended before the field separator")]
    Incomplete,
    #[error("track {track} payload is {len} bytes, at most 255 fit a command")]
    PayloadTooLarge { track: TrackNumber, len: usize },
}
