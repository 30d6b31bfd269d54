//! Parser for the engine's machine-readable status records.
//!
//! With `--status --machine-readable` hashcat emits one tab-separated
//! record per status interval:
//!
//! ```text
//! STATUS 3 SPEED 1000 1000 2000 1000 EXEC_RUNTIME 1.0 1.1 CURKU 42 PROGRESS 50 100
//! RECHASH 0 1 RECSALT 0 1 TEMP 60 61 REJECTED 0 UTIL 95 97
//! ```
//!
//! (shown wrapped and space-separated; the real record is one line of
//! tabs). Each upper-case tag is followed by its values; `SPEED` carries a
//! `(hashes, milliseconds)` pair per device, `TEMP` and `UTIL` one value per
//! device.
//!
//! Every other line is either a device failure reported by the engine or
//! unrelated noise (banners, warnings). Callers get a [`StatusLine`] and
//! must handle all three cases.

use std::collections::HashMap;

use chrono::Utc;

use crate::models::progress::{DeviceStatus, EnginePhase, ProgressSnapshot};
use crate::{AppError, Result};

const TAGS: &[&str] = &[
    "STATUS",
    "SPEED",
    "EXEC_RUNTIME",
    "CURKU",
    "PROGRESS",
    "RECHASH",
    "RECSALT",
    "TEMP",
    "REJECTED",
    "UTIL",
    "POWER",
];

const DEVICE_ERROR_MARKERS: &[&str] = &[
    "error",
    "failed",
    "out of memory",
    "out_of_resources",
    "watchdog",
    "not enough",
];

const BACKEND_PREFIXES: &[&str] = &["cl", "cu", "hip", "hc", "nvrtc", "mtl"];

/// Classification of one line of engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusLine {
    /// A well-formed status record.
    Progress(ProgressSnapshot),
    /// The engine reported a compute device failure.
    DeviceError {
        /// 1-based device id, when the line names one.
        device: Option<u32>,
        /// The raw engine message.
        message: String,
    },
    /// Anything else: banners, warnings, blank lines.
    Unparsed(String),
}

/// Parse one line into a snapshot, discarding everything else.
#[must_use]
pub fn parse(line: &str) -> Option<ProgressSnapshot> {
    match parse_line(line) {
        Ok(StatusLine::Progress(snapshot)) => Some(snapshot),
        _ => None,
    }
}

/// Classify one line of engine output.
///
/// # Errors
///
/// Returns [`AppError::StatusStreamMalformed`] when the line is a `STATUS`
/// record that lacks a required group or carries unparsable numbers.
pub fn parse_line(line: &str) -> Result<StatusLine> {
    let trimmed = line.trim_end_matches(['\r', '\n']);

    if trimmed.starts_with("STATUS\t") || trimmed == "STATUS" {
        return parse_status_record(trimmed).map(StatusLine::Progress);
    }

    if let Some((device, message)) = classify_device_error(trimmed) {
        return Ok(StatusLine::DeviceError { device, message });
    }

    Ok(StatusLine::Unparsed(trimmed.to_owned()))
}

fn parse_status_record(line: &str) -> Result<ProgressSnapshot> {
    let groups = split_groups(line);

    let status_code: u8 = single(&groups, "STATUS")?;
    let (done, total) = pair(&groups, "PROGRESS")?;
    let (recovered, digests) = pair(&groups, "RECHASH")?;

    let speed_values = groups
        .get("SPEED")
        .ok_or_else(|| malformed("missing SPEED group"))?;
    if speed_values.is_empty() || speed_values.len() % 2 != 0 {
        return Err(malformed("SPEED group must hold (hashes, ms) pairs"));
    }
    let device_speeds = speed_values
        .chunks(2)
        .map(|chunk| parse_num::<u64>("SPEED", chunk[0]))
        .collect::<Result<Vec<u64>>>()?;

    let temps = optional_list::<i32>(&groups, "TEMP")?;
    let utils = optional_list::<i32>(&groups, "UTIL")?;

    let devices = device_speeds
        .iter()
        .enumerate()
        .map(|(idx, speed)| DeviceStatus {
            id: u32::try_from(idx + 1).unwrap_or(u32::MAX),
            speed_hps: *speed,
            // hashcat reports -1 when hardware monitoring is unavailable.
            temperature_c: temps.get(idx).copied().filter(|t| *t >= 0),
            utilization: utils
                .get(idx)
                .copied()
                .filter(|u| *u >= 0)
                .and_then(|u| u8::try_from(u).ok()),
        })
        .collect::<Vec<_>>();

    let speed_hps: u64 = device_speeds.iter().sum();
    let remaining = total.saturating_sub(done);
    let eta_seconds = (speed_hps > 0).then(|| remaining / speed_hps);

    Ok(ProgressSnapshot {
        timestamp: Utc::now(),
        phase: EnginePhase::from_code(status_code),
        percent: percent(done, total),
        progress_done: done,
        progress_total: total,
        speed_hps,
        eta_seconds,
        recovered,
        total: digests,
        devices,
    })
}

#[allow(clippy::cast_precision_loss)] // Counts past 2^53 only lose low digits of the ratio.
fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((done as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
}

fn split_groups(line: &str) -> HashMap<&str, Vec<&str>> {
    let mut groups: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut current: Option<&str> = None;

    for token in line.split('\t').map(str::trim).filter(|t| !t.is_empty()) {
        if TAGS.contains(&token) {
            groups.entry(token).or_default();
            current = Some(token);
        } else if let Some(tag) = current {
            groups.entry(tag).or_default().push(token);
        }
    }

    groups
}

fn single<T: std::str::FromStr>(groups: &HashMap<&str, Vec<&str>>, tag: &str) -> Result<T> {
    let values = groups
        .get(tag)
        .ok_or_else(|| malformed(&format!("missing {tag} group")))?;
    let first = values
        .first()
        .ok_or_else(|| malformed(&format!("empty {tag} group")))?;
    parse_num(tag, first)
}

fn pair(groups: &HashMap<&str, Vec<&str>>, tag: &str) -> Result<(u64, u64)> {
    let values = groups
        .get(tag)
        .ok_or_else(|| malformed(&format!("missing {tag} group")))?;
    if values.len() < 2 {
        return Err(malformed(&format!("{tag} group needs two values")));
    }
    Ok((parse_num(tag, values[0])?, parse_num(tag, values[1])?))
}

fn optional_list<T: std::str::FromStr>(
    groups: &HashMap<&str, Vec<&str>>,
    tag: &str,
) -> Result<Vec<T>> {
    groups.get(tag).map_or_else(
        || Ok(Vec::new()),
        |values| values.iter().map(|v| parse_num(tag, v)).collect(),
    )
}

fn parse_num<T: std::str::FromStr>(tag: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| malformed(&format!("invalid {tag} value {raw:?}")))
}

fn malformed(detail: &str) -> AppError {
    AppError::StatusStreamMalformed(detail.to_owned())
}

/// Recognize engine device-failure lines.
fn classify_device_error(line: &str) -> Option<(Option<u32>, String)> {
    let stripped = line.trim_start_matches(['*', ' ']);
    let lower = stripped.to_ascii_lowercase();

    if let Some(rest) = stripped.strip_prefix("Device #") {
        if DEVICE_ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            return Some((digits.parse().ok(), stripped.to_owned()));
        }
        return None;
    }

    // Backend API failures look like `clEnqueueNDRangeKernel(): CL_OUT_OF_RESOURCES`.
    if let Some((call, _)) = stripped.split_once("(): ") {
        let is_backend_call = !call.is_empty()
            && call.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && BACKEND_PREFIXES.iter().any(|p| call.starts_with(p));
        if is_backend_call {
            return Some((None, stripped.to_owned()));
        }
    }

    None
}
