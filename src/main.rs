use std::error::Error;
use std::path::PathBuf;

use bpaf::{Bpaf, Parser};
use magstripe_core::{CardImage, TrackNumber};
use msr605x::{
    list_attached_devices, CardRead, Coercivity, Density, Led, Msr605x, ReadFormat, TrackMask,
    INFO,
};
use tracing_subscriber::EnvFilter;

use crate::card::FileFormat;
use crate::config::Config;
use crate::monitor::MonitorArgs;

mod card;
mod config;
mod detection;
mod lock;
mod monitor;

fn verbose() -> impl Parser<usize> {
    bpaf::short('v')
        .long("verbose")
        .help("Increase log output on stderr, repeat for more (-vvv for every HID report)")
        .req_flag(())
        .many()
        .map(|flags| flags.len())
}

#[derive(Clone, Debug, Bpaf)]
#[bpaf(options, version, descr(env!("CARGO_PKG_DESCRIPTION")))]
struct Cli {
    #[bpaf(external(verbose))]
    verbose: usize,
    /// Device path to use instead of the first reader found
    #[bpaf(short, long, argument("PATH"))]
    device: Option<String>,
    /// How long to wait for a card swipe, e.g. "30s"
    #[bpaf(long, argument("DURATION"))]
    timeout: Option<humantime::Duration>,
    #[bpaf(external(command))]
    command: Command,
}

#[derive(Clone, Debug, Bpaf)]
enum Command {
    /// List attached readers
    #[bpaf(command)]
    List,
    /// Run the communication test, optionally the RAM and sensor tests too
    #[bpaf(command)]
    Test {
        /// Also run the RAM test
        #[bpaf(long)]
        ram: bool,
        /// Also run the sensor test, which waits for a swipe
        #[bpaf(long)]
        sensor: bool,
    },
    /// Print the firmware version
    #[bpaf(command)]
    Firmware,
    /// Read a card
    #[bpaf(command)]
    Read {
        /// Transfer format, iso or raw
        #[bpaf(short, long, argument("FORMAT"))]
        format: Option<ReadFormat>,
        /// Save the card to this file, json or csv by extension
        #[bpaf(short, long, argument("FILE"))]
        output: Option<PathBuf>,
        /// Save the card to a timestamped file in the configured directory
        #[bpaf(short, long)]
        save: bool,
    },
    /// Write a card
    #[bpaf(command, fallback_to_usage)]
    Write {
        /// Transfer format, iso or raw
        #[bpaf(short, long, argument("FORMAT"))]
        format: Option<ReadFormat>,
        /// Start from a saved card file
        #[bpaf(long, argument("FILE"))]
        from: Option<PathBuf>,
        /// Track 1 data, without sentinels
        #[bpaf(long, argument("DATA"))]
        track1: Option<String>,
        /// Track 2 data, without sentinels
        #[bpaf(long, argument("DATA"))]
        track2: Option<String>,
        /// Track 3 data, without sentinels
        #[bpaf(long, argument("DATA"))]
        track3: Option<String>,
    },
    /// Erase tracks, all of them unless some are given
    #[bpaf(command)]
    Erase {
        /// Track to erase, may be repeated
        #[bpaf(short, long("track"), argument::<TrackNumber>("TRACK"), many)]
        tracks: Vec<TrackNumber>,
    },
    /// Show or set the write coercivity
    #[bpaf(command)]
    Coercivity {
        /// hi or lo
        #[bpaf(positional("COERCIVITY"))]
        set: Option<Coercivity>,
    },
    /// Read a card and write it to a second one
    #[bpaf(command)]
    Copy {
        /// Transfer format, iso or raw
        #[bpaf(short, long, argument("FORMAT"))]
        format: Option<ReadFormat>,
    },
    /// Read a card and compare it with a saved file
    #[bpaf(command, fallback_to_usage)]
    Compare {
        /// Transfer format, iso or raw
        #[bpaf(short, long, argument("FORMAT"))]
        format: Option<ReadFormat>,
        /// Saved card file
        #[bpaf(positional("FILE"), guard(|p| p.exists(), "file not found"))]
        file: PathBuf,
    },
    /// Set the LED state
    #[bpaf(command, fallback_to_usage)]
    Led {
        /// off, all, green, yellow or red
        #[bpaf(positional("LED"))]
        led: Led,
    },
    /// Set bits per character for tracks 1, 2 and 3
    #[bpaf(command, fallback_to_usage)]
    Bpc {
        #[bpaf(positional("TRACK1"))]
        track1: u8,
        #[bpaf(positional("TRACK2"))]
        track2: u8,
        #[bpaf(positional("TRACK3"))]
        track3: u8,
    },
    /// Set the recording density of one track
    #[bpaf(command, fallback_to_usage)]
    Density {
        #[bpaf(positional("TRACK"))]
        track: TrackNumber,
        /// 75 or 210
        #[bpaf(positional("BPI"))]
        bpi: u16,
    },
    /// Set the leading zeros written before track data
    #[bpaf(command("leading-zeros"), fallback_to_usage)]
    LeadingZeros {
        /// Zeros before 210 bpi tracks
        #[bpaf(positional("BPI210"))]
        bpi210: u8,
        /// Zeros before 75 bpi tracks
        #[bpaf(positional("BPI75"))]
        bpi75: u8,
    },
    /// Reset the device
    #[bpaf(command)]
    Reset,
    /// Keep reading cards, following the reader across replugs
    #[bpaf(command)]
    Monitor {
        /// Transfer format, iso or raw
        #[bpaf(short, long, argument("FORMAT"))]
        format: Option<ReadFormat>,
        /// Save every card to a timestamped file in the configured directory
        #[bpaf(short, long)]
        save: bool,
    },
}

fn init_tracing(verbose: usize) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Print every track of a read, blank and unreadable ones included
pub fn print_read(read: &CardRead) {
    for track in TrackNumber::ALL {
        if let Some((_, e)) = read.failures.iter().find(|(t, _)| *t == track) {
            println!("track {track}: unreadable ({e})");
            continue;
        }
        match read.image.get(track) {
            Some(data) if !data.is_empty() => println!("track {track}: {data}"),
            _ => println!("track {track}: blank"),
        }
    }
}

/// Tracks whose contents differ, treating missing and blank tracks alike
fn differing_tracks(expected: &CardImage, actual: &CardImage) -> Vec<TrackNumber> {
    let text = |image: &CardImage, track| {
        image
            .get(track)
            .map(|d| d.as_str().to_owned())
            .unwrap_or_default()
    };
    TrackNumber::ALL
        .into_iter()
        .filter(|&track| text(expected, track) != text(actual, track))
        .collect()
}

/// Drop blank tracks so they are left untouched when written
fn present_tracks(image: CardImage) -> CardImage {
    image.iter().filter(|d| !d.is_empty()).cloned().collect()
}

fn swipe(session: &mut Msr605x, format: ReadFormat) -> Result<CardRead, Box<dyn Error>> {
    println!("swipe a card to read");
    let read = session.read_card(format)?;
    print_read(&read);
    Ok(read)
}

/// Coercivity has to be set before anything is recorded
fn prepare_write(session: &mut Msr605x, config: &Config) -> Result<(), Box<dyn Error>> {
    session.set_coercivity(config.card.coercivity)?;
    tracing::info!("coercivity set to {}", config.card.coercivity);
    Ok(())
}

fn list() -> Result<(), Box<dyn Error>> {
    let devices = list_attached_devices(&INFO)?;
    if devices.is_empty() {
        println!("no {} attached", INFO.name);
    }
    for device in devices {
        println!("{device}");
        if let Some(manufacturer) = &device.manufacturer {
            println!("  manufacturer: {manufacturer}");
        }
    }
    Ok(())
}

fn run_command(
    session: &mut Msr605x,
    config: &Config,
    command: Command,
) -> Result<(), Box<dyn Error>> {
    let default_format = config.card.format;
    match command {
        Command::List | Command::Monitor { .. } => {
            return Err("command does not use a session".into());
        },
        Command::Test { ram, sensor } => {
            session.self_test()?;
            println!("communication test passed");
            if ram {
                session.ram_test()?;
                println!("ram test passed");
            }
            if sensor {
                println!("swipe a card for the sensor test");
                session.sensor_test()?;
                println!("sensor test passed");
            }
        },
        Command::Firmware => println!("{}", session.firmware_version()?),
        Command::Read {
            format,
            output,
            save,
        } => {
            let read = swipe(session, format.unwrap_or(default_format))?;
            let target = match output {
                Some(path) => Some((FileFormat::from_path(&path)?, path)),
                None if save => {
                    let format = config.output.format;
                    let dir = config.output.directory.as_deref();
                    Some((format, card::timestamped_path(dir, format)))
                },
                None => None,
            };
            if let Some((format, path)) = target {
                card::save(&read.image, &path, format)?;
                println!("saved {}", path.display());
            }
            if !read.is_complete() {
                return Err("some tracks could not be decoded".into());
            }
        },
        Command::Write {
            format,
            from,
            track1,
            track2,
            track3,
        } => {
            let mut image = match from {
                Some(path) => card::load(&path)?,
                None => CardImage::new(),
            };
            for (track, text) in [
                (TrackNumber::One, track1),
                (TrackNumber::Two, track2),
                (TrackNumber::Three, track3),
            ] {
                if let Some(text) = text {
                    let data = card::parse_track(track, &text, config.card.uppercase_track1)
                        .map_err(|e| format!("track {track}: {e}"))?;
                    image.insert(data);
                }
            }
            prepare_write(session, config)?;
            println!("swipe a card to write");
            session.write_card(&present_tracks(image), format.unwrap_or(default_format))?;
            println!("write complete");
        },
        Command::Erase { tracks } => {
            let mask = if tracks.is_empty() {
                TrackMask::ALL
            } else {
                tracks.into_iter().collect()
            };
            prepare_write(session, config)?;
            println!("swipe a card to erase track {mask}");
            session.erase_tracks(mask)?;
            println!("erase complete");
        },
        Command::Coercivity { set: Some(coercivity) } => {
            session.set_coercivity(coercivity)?;
            println!("coercivity set to {coercivity}");
        },
        Command::Coercivity { set: None } => println!("{}", session.coercivity()?),
        Command::Copy { format } => {
            let format = format.unwrap_or(default_format);
            let read = swipe(session, format)?;
            if !read.is_complete() {
                return Err("source card has unreadable tracks, not copying".into());
            }
            prepare_write(session, config)?;
            println!("swipe the card to write");
            session.write_card(&present_tracks(read.image), format)?;
            println!("copy complete");
        },
        Command::Compare { format, file } => {
            let expected = card::load(&file)?;
            let read = swipe(session, format.unwrap_or(default_format))?;
            if !read.is_complete() {
                return Err("card has unreadable tracks, swipe again to compare".into());
            }
            let differing = differing_tracks(&expected, &read.image);
            if !differing.is_empty() {
                let tracks: TrackMask = differing.into_iter().collect();
                let file = file.display();
                return Err(format!("card differs from {file} on track {tracks}").into());
            }
            println!("card matches {}", file.display());
        },
        Command::Led { led } => session.set_led(led)?,
        Command::Bpc {
            track1,
            track2,
            track3,
        } => {
            session.set_bpc([track1, track2, track3])?;
            println!("bits per character set to {track1}, {track2}, {track3}");
        },
        Command::Density { track, bpi } => {
            let density = Density::from_bpi(bpi).ok_or("density must be 75 or 210 bpi")?;
            session.set_density(track, density)?;
            println!("track {track} set to {bpi} bpi");
        },
        Command::LeadingZeros { bpi210, bpi75 } => {
            session.set_leading_zeros(bpi210, bpi75)?;
            println!("leading zeros set to {bpi210} (210 bpi) and {bpi75} (75 bpi)");
        },
        Command::Reset => {
            session.reset()?;
            println!("device reset");
        },
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = cli().run();
    init_tracing(cli.verbose);

    let mut config = Config::load_or_create()?;
    if let Some(timeout) = cli.timeout {
        config.device.swipe_timeout = timeout.into();
    }
    let path = cli.device.or_else(|| config.device.path.clone());

    match cli.command {
        Command::List => list(),
        Command::Monitor { format, save } => {
            let args = MonitorArgs {
                path,
                format: format.unwrap_or(config.card.format),
                save,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(monitor::run(config, args))
        },
        command => {
            let (mut session, _watcher) = detection::connect(&config, path.as_deref())?;
            run_command(&mut session, &config, command)
        },
    }
}
