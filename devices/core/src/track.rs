//! Track geometry and the card data model.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};

/// Characters reserved for framing a track. The codec owns their insertion.
pub const SENTINELS: [char; 3] = ['%', ';', '?'];

/// Physical track on the stripe
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum TrackNumber {
    One = 1,
    Two = 2,
    Three = 3,
}

impl TrackNumber {
    pub const ALL: [TrackNumber; 3] = [TrackNumber::One, TrackNumber::Two, TrackNumber::Three];

    /// Track number as written on the wire (1-3)
    #[inline(always)]
    pub const fn get(self) -> u8 {
        self as u8
    }

    /// Zero based index, for per-track arrays
    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize - 1
    }

    pub const fn from_u8(n: u8) -> Option<Self> {
        match n {
            1 => Some(TrackNumber::One),
            2 => Some(TrackNumber::Two),
            3 => Some(TrackNumber::Three),
            _ => None,
        }
    }

    /// Default ISO 7811 geometry for this track
    pub const fn spec(self) -> TrackSpec {
        TRACKS[self.index()]
    }
}

impl From<TrackNumber> for u8 {
    fn from(track: TrackNumber) -> Self {
        track.get()
    }
}

impl TryFrom<u8> for TrackNumber {
    type Error = String;
    fn try_from(n: u8) -> Result<Self, Self::Error> {
        TrackNumber::from_u8(n).ok_or_else(|| format!("invalid track number {n}, must be 1-3"))
    }
}

impl FromStr for TrackNumber {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let n = s.strip_prefix("track").unwrap_or(&s);
        n.parse::<u8>()
            .map_err(|_| format!("invalid track '{s}', must be one of: 1, 2, 3"))?
            .try_into()
    }
}

impl Display for TrackNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Character set selected by the bits-per-character setting of a track.
///
/// One bit of every character is parity, so a `n` bit alphabet carries
/// `2^(n-1)` symbols, offset from an ASCII base.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Alphabet {
    /// 5 bit BCD, `0x30..=0x3F` (`0-9 : ; < = > ?`)
    Numeric,
    /// 7 bit SIXBIT, `0x20..=0x5F` (space, digits, upper case, punctuation)
    Alphanumeric,
    /// 8 bit, `0x00..=0x7F`
    Ascii,
}

impl Alphabet {
    pub const fn from_bits_per_character(bpc: u8) -> Option<Self> {
        match bpc {
            5 => Some(Alphabet::Numeric),
            7 => Some(Alphabet::Alphanumeric),
            8 => Some(Alphabet::Ascii),
            _ => None,
        }
    }

    pub const fn bits_per_character(self) -> u8 {
        match self {
            Alphabet::Numeric => 5,
            Alphabet::Alphanumeric => 7,
            Alphabet::Ascii => 8,
        }
    }

    /// Width of the data portion of a character, excluding parity
    #[inline(always)]
    pub const fn data_bits(self) -> u8 {
        self.bits_per_character() - 1
    }

    /// Number of representable symbols
    #[inline(always)]
    pub const fn size(self) -> u32 {
        1 << self.data_bits()
    }

    /// ASCII value of symbol code zero
    pub(crate) const fn base(self) -> u8 {
        match self {
            Alphabet::Numeric => 0x30,
            Alphabet::Alphanumeric => 0x20,
            Alphabet::Ascii => 0x00,
        }
    }

    /// Map a character to its symbol code, if representable
    pub fn code(self, c: char) -> Option<u8> {
        (c as u32)
            .checked_sub(u32::from(self.base()))
            .filter(|code| *code < self.size())
            .and_then(|code| u8::try_from(code).ok())
    }

    /// Map a symbol code back to its character
    pub fn char(self, code: u8) -> Option<char> {
        let code = u32::from(code);
        (code < self.size())
            .then(|| char::from_u32(u32::from(self.base()) + code))
            .flatten()
    }

    pub const fn start_sentinel(self) -> char {
        match self {
            Alphabet::Numeric => ';',
            Alphabet::Alphanumeric | Alphabet::Ascii => '%',
        }
    }

    pub const fn end_sentinel(self) -> char {
        '?'
    }
}

/// Immutable per-track recording geometry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrackSpec {
    pub track: TrackNumber,
    pub bits_per_character: u8,
    pub bits_per_inch: u16,
    pub max_characters: usize,
    pub alphabet: Alphabet,
}

/// ISO 7811 geometry for tracks 1, 2 and 3
pub const TRACKS: [TrackSpec; 3] = [
    TrackSpec {
        track: TrackNumber::One,
        bits_per_character: 7,
        bits_per_inch: 210,
        max_characters: 79,
        alphabet: Alphabet::Alphanumeric,
    },
    TrackSpec {
        track: TrackNumber::Two,
        bits_per_character: 5,
        bits_per_inch: 75,
        max_characters: 40,
        alphabet: Alphabet::Numeric,
    },
    TrackSpec {
        track: TrackNumber::Three,
        bits_per_character: 5,
        bits_per_inch: 210,
        max_characters: 107,
        alphabet: Alphabet::Numeric,
    },
];

impl TrackSpec {
    #[inline(always)]
    pub const fn data_bits(&self) -> u8 {
        self.alphabet.data_bits()
    }

    #[inline(always)]
    pub const fn start_sentinel(&self) -> char {
        self.alphabet.start_sentinel()
    }

    #[inline(always)]
    pub const fn end_sentinel(&self) -> char {
        self.alphabet.end_sentinel()
    }

    /// Same track recorded with a different character width.
    /// The alphabet follows the width.
    pub fn with_bits_per_character(self, bpc: u8) -> Result<Self, CodecError> {
        let alphabet =
            Alphabet::from_bits_per_character(bpc).ok_or(CodecError::UnsupportedWidth(bpc))?;
        Ok(Self {
            bits_per_character: bpc,
            alphabet,
            ..self
        })
    }
}

/// Logical contents of one track, without sentinels.
///
/// Only constructed through validation, so the string always fits the
/// alphabet and length of the geometry it was checked against.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TrackData {
    track: TrackNumber,
    data: String,
}

impl TrackData {
    /// Validate `data` against `spec` and wrap it
    pub fn new(spec: &TrackSpec, data: impl Into<String>) -> Result<Self, CodecError> {
        let data = data.into();
        codec::validate(spec, &data)?;
        Ok(Self {
            track: spec.track,
            data,
        })
    }

    /// A blank or unreadable track
    pub const fn empty(track: TrackNumber) -> Self {
        Self {
            track,
            data: String::new(),
        }
    }

    pub(crate) fn from_validated(track: TrackNumber, data: String) -> Self {
        Self { track, data }
    }

    #[inline(always)]
    pub fn track(&self) -> TrackNumber {
        self.track
    }

    #[inline(always)]
    pub fn as_str(&self) -> &str {
        &self.data
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of characters
    pub fn len(&self) -> usize {
        self.data.chars().count()
    }

    pub fn into_string(self) -> String {
        self.data
    }
}

impl Display for TrackData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.data)
    }
}

/// Up to three tracks, at most one per track number
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CardImage {
    tracks: [Option<TrackData>; 3],
}

impl CardImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a track, returning the previous data for the same track number
    pub fn insert(&mut self, data: TrackData) -> Option<TrackData> {
        let slot = &mut self.tracks[data.track().index()];
        slot.replace(data)
    }

    /// Builder form of [`CardImage::insert`]
    pub fn with(mut self, data: TrackData) -> Self {
        self.insert(data);
        self
    }

    pub fn get(&self, track: TrackNumber) -> Option<&TrackData> {
        self.tracks[track.index()].as_ref()
    }

    pub fn remove(&mut self, track: TrackNumber) -> Option<TrackData> {
        self.tracks[track.index()].take()
    }

    /// Present tracks in track number order
    pub fn iter(&self) -> impl Iterator<Item = &TrackData> {
        self.tracks.iter().flatten()
    }

    /// Number of present tracks
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.iter().all(Option::is_none)
    }

    /// True when no present track carries any characters
    pub fn is_blank(&self) -> bool {
        self.iter().all(TrackData::is_empty)
    }
}

impl FromIterator<TrackData> for CardImage {
    fn from_iter<I: IntoIterator<Item = TrackData>>(iter: I) -> Self {
        let mut image = CardImage::new();
        for data in iter {
            image.insert(data);
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_geometry() {
        let t1 = TrackNumber::One.spec();
        assert_eq!((t1.bits_per_character, t1.bits_per_inch, t1.max_characters), (7, 210, 79));
        let t2 = TrackNumber::Two.spec();
        assert_eq!((t2.bits_per_character, t2.bits_per_inch, t2.max_characters), (5, 75, 40));
        let t3 = TrackNumber::Three.spec();
        assert_eq!((t3.bits_per_character, t3.bits_per_inch, t3.max_characters), (5, 210, 107));
        for spec in TRACKS {
            assert_eq!(spec.alphabet.bits_per_character(), spec.bits_per_character);
        }
    }

    #[test]
    fn alphabet_codes() {
        assert_eq!(Alphabet::Numeric.code('0'), Some(0));
        assert_eq!(Alphabet::Numeric.code('?'), Some(15));
        assert_eq!(Alphabet::Numeric.code('A'), None);
        assert_eq!(Alphabet::Numeric.code(' '), None);
        assert_eq!(Alphabet::Alphanumeric.code(' '), Some(0));
        assert_eq!(Alphabet::Alphanumeric.code('A'), Some(0x21));
        assert_eq!(Alphabet::Alphanumeric.code('_'), Some(0x3F));
        assert_eq!(Alphabet::Alphanumeric.code('a'), None);
        assert_eq!(Alphabet::Ascii.code('a'), Some(b'a'));
        assert_eq!(Alphabet::Ascii.code('é'), None);
        assert_eq!(Alphabet::Alphanumeric.char(0x21), Some('A'));
        assert_eq!(Alphabet::Numeric.char(16), None);
        assert_eq!(Alphabet::Numeric.size(), 16);
        assert_eq!(Alphabet::Alphanumeric.size(), 64);
    }

    #[test]
    fn sentinels_are_representable() {
        for alphabet in [Alphabet::Numeric, Alphabet::Alphanumeric, Alphabet::Ascii] {
            assert!(alphabet.code(alphabet.start_sentinel()).is_some());
            assert!(alphabet.code(alphabet.end_sentinel()).is_some());
        }
    }

    #[test]
    fn track_number_parsing() {
        assert_eq!("2".parse::<TrackNumber>(), Ok(TrackNumber::Two));
        assert_eq!("Track3".parse::<TrackNumber>(), Ok(TrackNumber::Three));
        assert!("4".parse::<TrackNumber>().is_err());
        assert!("x".parse::<TrackNumber>().is_err());
    }

    #[test]
    fn reconfigured_width_changes_alphabet() {
        let spec = TrackNumber::Two.spec().with_bits_per_character(7).unwrap();
        assert_eq!(spec.alphabet, Alphabet::Alphanumeric);
        assert_eq!(spec.start_sentinel(), '%');
        assert!(matches!(
            TrackNumber::Two.spec().with_bits_per_character(6),
            Err(CodecError::UnsupportedWidth(6))
        ));
    }

    #[test]
    fn card_image_keeps_one_entry_per_track() {
        let t2 = TrackNumber::Two.spec();
        let mut image = CardImage::new();
        assert!(image.is_empty());
        assert!(image.insert(TrackData::new(&t2, "1234").unwrap()).is_none());
        let previous = image.insert(TrackData::new(&t2, "5678").unwrap());
        assert_eq!(previous.unwrap().as_str(), "1234");
        assert_eq!(image.len(), 1);
        assert_eq!(image.get(TrackNumber::Two).unwrap().as_str(), "5678");
        assert!(image.get(TrackNumber::One).is_none());

        let image = image.with(TrackData::empty(TrackNumber::One));
        let order: Vec<_> = image.iter().map(TrackData::track).collect();
        assert_eq!(order, [TrackNumber::One, TrackNumber::Two]);
        assert!(!image.is_blank());
    }
}
