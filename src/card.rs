//! Saved card files.
//!
//! JSON holds one string field per present track (`track1`, `track2`,
//! `track3`); CSV holds one `track,data` row per present track.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use magstripe_core::{CardImage, CodecError, TrackData, TrackNumber};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CardFileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("track {track}: {source}")]
    Track {
        track: TrackNumber,
        #[source]
        source: CodecError,
    },
    #[error("cannot infer file format from {0}, use json or csv")]
    UnknownFormat(PathBuf),
}

/// On disk representation of a card image
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Json,
    Csv,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }

    /// Pick a format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, CardFileError> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
            .ok_or_else(|| CardFileError::UnknownFormat(path.to_owned()))
    }
}

impl FromStr for FileFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            _ => Err(format!("invalid file format: {s}. Available: json, csv")),
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonCard {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    track1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    track2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    track3: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    track: TrackNumber,
    data: String,
}

/// Build track data from user input.
///
/// Sentinels wrapping the whole string are dropped since the device adds its
/// own, anything else goes through track validation unchanged.
pub fn parse_track(track: TrackNumber, text: &str, uppercase: bool) -> Result<TrackData, CodecError> {
    let spec = track.spec();
    let text = text.trim();
    let text = text.strip_prefix(spec.start_sentinel()).unwrap_or(text);
    let text = text.strip_suffix(spec.end_sentinel()).unwrap_or(text);
    if uppercase && track == TrackNumber::One {
        TrackData::new(&spec, text.to_uppercase())
    } else {
        TrackData::new(&spec, text)
    }
}

fn track(track: TrackNumber, text: String) -> Result<TrackData, CardFileError> {
    TrackData::new(&track.spec(), text).map_err(|source| CardFileError::Track { track, source })
}

pub fn to_json(image: &CardImage) -> Result<String, CardFileError> {
    let field = |n| image.get(n).map(|d: &TrackData| d.as_str().to_owned());
    let card = JsonCard {
        track1: field(TrackNumber::One),
        track2: field(TrackNumber::Two),
        track3: field(TrackNumber::Three),
    };
    Ok(serde_json::to_string_pretty(&card)?)
}

pub fn from_json(text: &str) -> Result<CardImage, CardFileError> {
    let card: JsonCard = serde_json::from_str(text)?;
    let mut image = CardImage::new();
    for (n, data) in [
        (TrackNumber::One, card.track1),
        (TrackNumber::Two, card.track2),
        (TrackNumber::Three, card.track3),
    ] {
        if let Some(data) = data {
            image.insert(track(n, data)?);
        }
    }
    Ok(image)
}

pub fn to_csv(image: &CardImage) -> Result<String, CardFileError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for data in image.iter() {
        writer.serialize(CsvRow {
            track: data.track(),
            data: data.as_str().to_owned(),
        })?;
    }
    // serialize only emits the header along with the first row
    if image.is_empty() {
        writer.write_record(["track", "data"])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| CardFileError::Io(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn from_csv(text: &str) -> Result<CardImage, CardFileError> {
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let mut image = CardImage::new();
    for row in reader.deserialize() {
        let row: CsvRow = row?;
        image.insert(track(row.track, row.data)?);
    }
    Ok(image)
}

pub fn save(image: &CardImage, path: &Path, format: FileFormat) -> Result<(), CardFileError> {
    let contents = match format {
        FileFormat::Json => to_json(image)?,
        FileFormat::Csv => to_csv(image)?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

/// Load a card file, inferring the format from the extension
pub fn load(path: &Path) -> Result<CardImage, CardFileError> {
    let format = FileFormat::from_path(path)?;
    let contents = fs::read_to_string(path)?;
    match format {
        FileFormat::Json => from_json(&contents),
        FileFormat::Csv => from_csv(&contents),
    }
}

/// Timestamped file name for a fresh read, e.g. `card-20241019-153012.json`
pub fn timestamped_path(directory: Option<&Path>, format: FileFormat) -> PathBuf {
    let name = format!(
        "card-{}.{}",
        chrono::Local::now().format("%Y%m%d-%H%M%S"),
        format.extension()
    );
    match directory {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> CardImage {
        CardImage::new()
            .with(parse_track(TrackNumber::One, "%b4111111111111111^DOE/JOHN^2512?", true).unwrap())
            .with(parse_track(TrackNumber::Two, ";4111111111111111=2512?", true).unwrap())
    }

    #[test]
    fn user_input_is_normalized() {
        let t1 = parse_track(TrackNumber::One, " %abc? ", true).unwrap();
        assert_eq!(t1.as_str(), "ABC");
        let t1 = parse_track(TrackNumber::One, "ABC", false).unwrap();
        assert_eq!(t1.as_str(), "ABC");
        assert!(matches!(
            parse_track(TrackNumber::Two, "12?34", true),
            Err(CodecError::ReservedCharacter { .. })
        ));
        assert!(parse_track(TrackNumber::One, "abc", false).is_err());
    }

    #[test]
    fn json_has_one_field_per_present_track() {
        let json = to_json(&image()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["track1"], "B4111111111111111^DOE/JOHN^2512");
        assert_eq!(value["track2"], "4111111111111111=2512");
        assert!(value.get("track3").is_none());
        assert_eq!(from_json(&json).unwrap(), image());
    }

    #[test]
    fn csv_rows() {
        let csv = to_csv(&image()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("track,data"));
        assert_eq!(lines.next(), Some("1,B4111111111111111^DOE/JOHN^2512"));
        assert_eq!(lines.next(), Some("2,4111111111111111=2512"));
        assert_eq!(from_csv(&csv).unwrap(), image());
        assert!(from_csv(&to_csv(&CardImage::new()).unwrap()).unwrap().is_empty());
    }

    #[test]
    fn invalid_files_are_rejected() {
        assert!(matches!(
            from_json(r#"{"track2": "12AB"}"#),
            Err(CardFileError::Track {
                track: TrackNumber::Two,
                ..
            })
        ));
        assert!(matches!(
            from_csv("track,data\n4,123\n"),
            Err(CardFileError::Csv(_))
        ));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        for format in [FileFormat::Json, FileFormat::Csv] {
            let path = timestamped_path(Some(dir.path()), format);
            save(&image(), &path, format).unwrap();
            assert_eq!(load(&path).unwrap(), image());
        }
        assert!(matches!(
            load(&dir.path().join("card.txt")),
            Err(CardFileError::UnknownFormat(_))
        ));
    }
}
