//! JSON snapshot files and append-only journals.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// A single JSON snapshot file `<dir>/<name>.json`.
///
/// Saves go through a temporary file and a rename, so a crash mid-write
/// leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
    path: PathBuf,
}

impl JsonStore {
    /// Creates a store for `<dir>/<name>.json`. Nothing is touched on disk yet.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            path: dir.join(format!("{name}.json")),
        }
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot, or `T::default()` if none exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot yet");
                return Ok(T::default());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|source| StoreError::Snapshot {
            path: self.path.clone(),
            source,
        })
    }

    /// Writes the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let json = serde_json::to_vec(value).map_err(|source| StoreError::Snapshot {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(&json)?;
                file.sync_all()
            })
            .map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        Ok(())
    }
}

/// An append-only journal of JSON lines, `<dir>/<name>.<generation>.jsonl`.
///
/// Every append reaches the disk before it returns. A failed append is cut
/// back off the file, so later appends never land behind a partial line.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    generation: u64,
    file: File,
    len: u64,
    entries: usize,
}

impl Journal {
    /// Path of journal `generation` for `name` in `dir`.
    #[must_use]
    pub fn path_for(dir: &Path, name: &str, generation: u64) -> PathBuf {
        dir.join(format!("{name}.{generation}.jsonl"))
    }

    /// Generations of the journals for `name` found in `dir`, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub fn generations(dir: &Path, name: &str) -> Result<Vec<u64>> {
        let listing = match std::fs::read_dir(dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        };
        let prefix = format!("{name}.");
        let mut generations = Vec::new();
        for entry in listing {
            let entry = entry.map_err(io_err(dir))?;
            let file_name = entry.file_name();
            let generation = file_name
                .to_str()
                .and_then(|file_name| file_name.strip_prefix(&prefix))
                .and_then(|rest| rest.strip_suffix(".jsonl"))
                .and_then(|generation| generation.parse::<u64>().ok());
            generations.extend(generation);
        }
        generations.sort_unstable();
        Ok(generations)
    }

    /// Opens journal `generation` for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn open(dir: &Path, name: &str, generation: u64) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(io_err(dir))?;
        let path = Self::path_for(dir, name, generation);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        let len = file.metadata().map_err(io_err(&path))?.len();
        Ok(Self {
            path,
            generation,
            file,
            len,
            entries: 0,
        })
    }

    /// Reads every entry of the journal at `path`.
    ///
    /// An unparseable last line is a write cut short by a crash; it is logged
    /// and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or an earlier line is
    /// corrupt.
    pub fn read<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let bytes = std::fs::read(path).map_err(io_err(path))?;
        let contents = String::from_utf8_lossy(&bytes);
        let lines: Vec<(usize, &str)> = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();

        let mut entries = Vec::with_capacity(lines.len());
        for (index, (number, line)) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if index + 1 == lines.len() => {
                    warn!(
                        path = %path.display(),
                        line = number + 1,
                        error = %e,
                        "skipping torn journal tail"
                    );
                }
                Err(source) => {
                    return Err(StoreError::Journal {
                        path: path.to_path_buf(),
                        line: number + 1,
                        source,
                    });
                }
            }
        }
        Ok(entries)
    }

    /// Appends one serialized entry and syncs it to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or the sync fails. The file is then
    /// truncated back to its previous length.
    pub fn append(&mut self, entry: &[u8]) -> Result<()> {
        let mut line = Vec::with_capacity(entry.len() + 1);
        line.extend_from_slice(entry);
        line.push(b'\n');

        let written = self.file.write_all(&line).and_then(|()| self.file.sync_data());
        if let Err(source) = written {
            if let Err(e) = self.file.set_len(self.len) {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to cut back a partial journal write"
                );
            }
            return Err(StoreError::Io {
                path: self.path.clone(),
                source,
            });
        }
        self.len += line.len() as u64;
        self.entries += 1;
        Ok(())
    }

    /// Entries appended through this handle.
    #[must_use]
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// This journal's generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes and deletes the journal file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(self) -> Result<()> {
        let Self { path, file, .. } = self;
        drop(file);
        remove_file(&path)
    }

    /// Swaps the file handle for a read-only one so every append fails.
    #[cfg(test)]
    pub(crate) fn make_unwritable(&mut self) -> Result<()> {
        self.file = File::open(&self.path).map_err(io_err(&self.path))?;
        Ok(())
    }
}

/// Removes `path`, treating a missing file as already removed.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be removed.
pub fn remove_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}
