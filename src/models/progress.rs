//! Progress snapshots parsed from the engine status stream.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine-reported run phase from the `STATUS` field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    /// Initializing, autotuning, or running self-tests.
    Starting,
    /// Actively cracking.
    Running,
    /// Paused inside the engine.
    Paused,
    /// Keyspace exhausted.
    Exhausted,
    /// All targets recovered.
    Cracked,
    /// Aborted (by user, checkpoint, or runtime limit).
    Aborted,
    /// Any other numeric status code.
    Other(u8),
}

impl EnginePhase {
    /// Map hashcat's numeric status code.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0..=2 => Self::Starting,
            3 => Self::Running,
            4 => Self::Paused,
            5 => Self::Exhausted,
            6 => Self::Cracked,
            7 | 8 | 11 | 12 | 13 => Self::Aborted,
            other => Self::Other(other),
        }
    }
}

/// Per-device breakdown from one status record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DeviceStatus {
    /// 1-based device id.
    pub id: u32,
    /// Hashes per second on this device.
    pub speed_hps: u64,
    /// Temperature in Celsius, when hardware monitoring is available.
    pub temperature_c: Option<i32>,
    /// Utilization percentage.
    pub utilization: Option<u8>,
}

/// Point-in-time progress measurement. Never altered once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ProgressSnapshot {
    /// When the record was parsed.
    pub timestamp: DateTime<Utc>,
    /// Engine phase.
    pub phase: EnginePhase,
    /// Percentage of keyspace processed, 0.0..=100.0.
    pub percent: f64,
    /// Keyspace positions processed.
    pub progress_done: u64,
    /// Total keyspace positions.
    pub progress_total: u64,
    /// Aggregate candidates per second.
    pub speed_hps: u64,
    /// Estimated seconds remaining, if throughput is non-zero.
    pub eta_seconds: Option<u64>,
    /// Digests recovered so far.
    pub recovered: u64,
    /// Total digests targeted.
    pub total: u64,
    /// Per-device breakdown.
    pub devices: Vec<DeviceStatus>,
}

impl ProgressSnapshot {
    /// Mean utilization across devices reporting one.
    #[must_use]
    pub fn mean_utilization(&self) -> Option<u8> {
        let values: Vec<u32> = self
            .devices
            .iter()
            .filter_map(|d| d.utilization.map(u32::from))
            .collect();
        if values.is_empty() {
            return None;
        }
        let len = u32::try_from(values.len()).unwrap_or(u32::MAX);
        u8::try_from(values.iter().sum::<u32>() / len).ok()
    }
}

/// Bounded ring of recent snapshots; the oldest entry is dropped on overflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressHistory {
    capacity: usize,
    entries: VecDeque<ProgressSnapshot>,
}

impl ProgressHistory {
    /// Empty history retaining at most `capacity` snapshots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Append a snapshot, evicting the oldest when full.
    pub fn push(&mut self, snapshot: ProgressSnapshot) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
    }

    /// Most recent snapshot.
    #[must_use]
    pub fn latest(&self) -> Option<&ProgressSnapshot> {
        self.entries.back()
    }

    /// Snapshots oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ProgressSnapshot> {
        self.entries.iter()
    }

    /// Number of retained snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no snapshot has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
