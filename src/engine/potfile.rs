//! Session potfile reader.
//!
//! Each engine run writes recovered digests to its own potfile as
//! `hash:plain` lines. Plains containing the separator or non-printable
//! bytes are written as `$HEX[..]`, so the last `:` always separates the
//! digest from the plain.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::Result;

/// One recovered digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PotEntry {
    /// Digest as written by the engine.
    pub hash: String,
    /// Recovered plaintext.
    pub plain: String,
}

/// Parse one potfile line.
#[must_use]
pub fn parse_entry(line: &str) -> Option<PotEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (hash, plain) = line.rsplit_once(':')?;
    if hash.is_empty() {
        return None;
    }
    Some(PotEntry {
        hash: hash.to_owned(),
        plain: decode_plain(plain),
    })
}

/// Read every distinct entry, in first-seen order.
///
/// A missing file yields an empty list.
///
/// # Errors
///
/// Returns `AppError::Io` if the file exists but cannot be read.
pub async fn read_entries(path: &Path) -> Result<Vec<PotEntry>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut seen = HashSet::new();
    Ok(String::from_utf8_lossy(&raw)
        .lines()
        .filter_map(parse_entry)
        .filter(|entry| seen.insert(entry.hash.clone()))
        .collect())
}

/// Incremental reader that yields entries appended since the last poll.
#[derive(Debug)]
pub struct PotfileTail {
    path: PathBuf,
    offset: u64,
    partial: String,
    seen: HashSet<String>,
}

impl PotfileTail {
    /// Start tailing `path` from the beginning.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            partial: String::new(),
            seen: HashSet::new(),
        }
    }

    /// Start tailing `path`, treating `known` digests as already reported.
    #[must_use]
    pub fn with_known(path: PathBuf, known: impl IntoIterator<Item = String>) -> Self {
        let mut tail = Self::new(path);
        tail.seen.extend(known);
        tail
    }

    /// Read complete lines appended since the last call.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file exists but cannot be read.
    pub async fn poll_new(&mut self) -> Result<Vec<PotEntry>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            // Truncated underneath us; start over.
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk).await?;
        self.offset += chunk.len() as u64;
        self.partial.push_str(&String::from_utf8_lossy(&chunk));

        let mut entries = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            if let Some(entry) = parse_entry(&line) {
                if self.seen.insert(entry.hash.clone()) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }
}

fn decode_plain(plain: &str) -> String {
    let Some(hex) = plain
        .strip_prefix("$HEX[")
        .and_then(|rest| rest.strip_suffix(']'))
    else {
        return plain.to_owned();
    };
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        return plain.to_owned();
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
        .collect::<std::result::Result<Vec<u8>, _>>();
    match bytes {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => plain.to_owned(),
    }
}
