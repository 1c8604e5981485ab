//! ISO 7811 track codec.
//!
//! A track is recorded as a sequence of fixed width character groups:
//!
//! ```text
//! [start sentinel][data ...][end sentinel][LRC]
//! ```
//!
//! Each group holds `bits_per_character - 1` data bits followed by one odd
//! parity bit, least significant bit first. Groups are concatenated into a bit
//! stream which is packed into bytes least significant bit first, zero padding
//! the final byte. The LRC data bits are the XOR of the data bits of every
//! preceding group (sentinels included) and carry their own parity bit.

use crate::track::{TrackData, TrackNumber, TrackSpec, SENTINELS};

/// Errors raised while validating, encoding or decoding a track
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("track {track} holds at most {max} characters, got {actual}")]
    TooLong {
        track: TrackNumber,
        max: usize,
        actual: usize,
    },

    #[error("character {character:?} at position {position} is not representable on this track")]
    CharacterOutOfRange { character: char, position: usize },

    #[error("sentinel {character:?} at position {position} is reserved for track framing")]
    ReservedCharacter { character: char, position: usize },

    #[error("parity error in character {index}")]
    ParityError { index: usize },

    #[error("checksum mismatch: computed lrc {expected:#04x}, read {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("start sentinel not found")]
    MissingStartSentinel,

    #[error("end sentinel not found")]
    MissingEndSentinel,

    #[error("track ends before the lrc character")]
    MissingLrc,

    #[error("data for track {actual} cannot be encoded as track {expected}")]
    TrackMismatch {
        expected: TrackNumber,
        actual: TrackNumber,
    },

    #[error("unsupported width of {0} bits per character")]
    UnsupportedWidth(u8),
}

/// Check that `data` may be recorded on a track with the given geometry
pub fn validate(spec: &TrackSpec, data: &str) -> Result<(), CodecError> {
    let actual = data.chars().count();
    if actual > spec.max_characters {
        return Err(CodecError::TooLong {
            track: spec.track,
            max: spec.max_characters,
            actual,
        });
    }
    for (position, character) in data.chars().enumerate() {
        symbol(spec, character, position)?;
    }
    Ok(())
}

/// Encode a track into its bit packed wire payload
pub fn encode_track(spec: &TrackSpec, data: &TrackData) -> Result<Vec<u8>, CodecError> {
    if data.track() != spec.track {
        return Err(CodecError::TrackMismatch {
            expected: spec.track,
            actual: data.track(),
        });
    }
    validate(spec, data.as_str())?;

    let (start, end) = sentinels(spec);
    let mut codes = Vec::with_capacity(data.len() + 3);
    codes.push(start);
    for (position, character) in data.as_str().chars().enumerate() {
        codes.push(symbol(spec, character, position)?);
    }
    codes.push(end);
    let lrc = codes.iter().fold(0, |acc, code| acc ^ code);
    codes.push(lrc);

    let data_bits = spec.data_bits();
    let mut writer = BitWriter::with_capacity(codes.len() * spec.bits_per_character as usize);
    for code in codes {
        writer.push(pack(code, data_bits), spec.bits_per_character);
    }
    Ok(writer.into_bytes())
}

/// Decode a bit packed wire payload back into track data.
///
/// An all zero or empty payload is a blank track, not an error. Leading all
/// zero groups are skipped and any bits following the LRC are ignored.
pub fn decode_track(spec: &TrackSpec, wire: &[u8]) -> Result<TrackData, CodecError> {
    if wire.iter().all(|b| *b == 0) {
        return Ok(TrackData::empty(spec.track));
    }

    let width = spec.bits_per_character;
    let data_bits = spec.data_bits();
    let (start, end) = sentinels(spec);
    let mut reader = BitReader::new(wire);

    let first = loop {
        match reader.read(width) {
            Some(0) => continue,
            Some(group) => break group,
            None => return Err(CodecError::MissingStartSentinel),
        }
    };
    let first = unpack(first, data_bits).ok_or(CodecError::ParityError { index: 0 })?;
    if first != start {
        return Err(CodecError::MissingStartSentinel);
    }

    let mut lrc = first;
    let mut text = String::new();
    let mut index = 1;
    loop {
        let group = reader.read(width).ok_or(CodecError::MissingEndSentinel)?;
        let code = unpack(group, data_bits).ok_or(CodecError::ParityError { index })?;
        lrc ^= code;
        index += 1;
        if code == end {
            break;
        }
        let character = char::from(spec.alphabet.base() + code);
        if SENTINELS.contains(&character) {
            return Err(CodecError::ReservedCharacter {
                character,
                position: index - 2,
            });
        }
        text.push(character);
    }

    let group = reader.read(width).ok_or(CodecError::MissingLrc)?;
    let actual = unpack(group, data_bits).ok_or(CodecError::ParityError { index })?;
    if actual != lrc {
        return Err(CodecError::ChecksumMismatch {
            expected: lrc,
            actual,
        });
    }

    let actual = index - 2;
    if actual > spec.max_characters {
        return Err(CodecError::TooLong {
            track: spec.track,
            max: spec.max_characters,
            actual,
        });
    }
    Ok(TrackData::from_validated(spec.track, text))
}

/// Interpret a track the firmware has already decoded to text, as returned by
/// an ISO read. Sentinels are stripped if present and the rest is validated.
pub fn parse_text(spec: &TrackSpec, raw: &[u8]) -> Result<TrackData, CodecError> {
    let text: String = raw
        .iter()
        .map(|b| char::from(*b))
        .collect::<String>()
        .trim_matches(|c: char| c == '\0' || c.is_ascii_whitespace() && c != ' ')
        .to_string();
    if text.is_empty() {
        return Ok(TrackData::empty(spec.track));
    }
    let inner = text.strip_prefix(spec.start_sentinel()).unwrap_or(&text);
    let inner = inner.strip_suffix(spec.end_sentinel()).unwrap_or(inner);
    TrackData::new(spec, inner)
}

/// Symbol code of a caller supplied character
fn symbol(spec: &TrackSpec, character: char, position: usize) -> Result<u8, CodecError> {
    if SENTINELS.contains(&character) {
        return Err(CodecError::ReservedCharacter {
            character,
            position,
        });
    }
    spec.alphabet
        .code(character)
        .ok_or(CodecError::CharacterOutOfRange {
            character,
            position,
        })
}

/// Start and end sentinel codes. Both are representable in every alphabet.
fn sentinels(spec: &TrackSpec) -> (u8, u8) {
    let base = spec.alphabet.base();
    (
        (spec.start_sentinel() as u8).wrapping_sub(base),
        (spec.end_sentinel() as u8).wrapping_sub(base),
    )
}

/// Append an odd parity bit above the data bits
#[inline(always)]
fn pack(code: u8, data_bits: u8) -> u8 {
    let parity = u8::from(code.count_ones() % 2 == 0);
    code | parity << data_bits
}

/// Strip the parity bit, or `None` if the group does not have odd parity
#[inline(always)]
fn unpack(group: u8, data_bits: u8) -> Option<u8> {
    let mask = (1u8 << data_bits) - 1;
    (group.count_ones() % 2 == 1).then_some(group & mask)
}

/// LSB first bit stream writer
struct BitWriter {
    bytes: Vec<u8>,
    len: usize,
}

impl BitWriter {
    fn with_capacity(bits: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bits.div_ceil(8)),
            len: 0,
        }
    }

    fn push(&mut self, value: u8, width: u8) {
        for bit in 0..width {
            if self.len % 8 == 0 {
                self.bytes.push(0);
            }
            if value >> bit & 1 == 1 {
                self.bytes[self.len / 8] |= 1 << (self.len % 8);
            }
            self.len += 1;
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// LSB first bit stream reader
struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Read the next `width` bits, or `None` if fewer remain
    fn read(&mut self, width: u8) -> Option<u8> {
        let end = self.pos + width as usize;
        if end > self.bytes.len() * 8 {
            return None;
        }
        let mut value = 0u8;
        for bit in 0..width {
            let i = self.pos + bit as usize;
            if self.bytes[i / 8] >> (i % 8) & 1 == 1 {
                value |= 1 << bit;
            }
        }
        self.pos = end;
        Some(value)
    }
}
