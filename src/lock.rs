//! Exclusive claim on the reader for `magstripe monitor`.
//!
//! The monitor takes an advisory file lock before it opens any device, at
//! most one monitor reads swipes at a time. The lock file holds the owner's pid.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Held by a running monitor, dropping it deletes the lock file
pub struct Lock {
    _file: File,
    path: PathBuf,
}

impl Lock {
    /// Claim the reader through `magstripe.lock` in the config directory.
    /// Fails with [`io::ErrorKind::AlreadyExists`] naming the owning pid when
    /// a monitor is already reading cards.
    pub fn acquire() -> io::Result<Self> {
        let path = Self::path().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "could not determine lock file path",
            )
        })?;
        Self::acquire_at(path)
    }

    fn acquire_at(path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock().is_err() {
            let mut owner = String::new();
            let _ = file.read_to_string(&mut owner);
            let owner = match owner.trim() {
                "" => String::new(),
                pid => format!(" (pid {pid})"),
            };
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("another magstripe monitor is already reading cards{owner}"),
            ));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self { _file: file, path })
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    fn path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "magstripe").map(|dirs| dirs.config_dir().join("magstripe.lock"))
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
