//! Shared status cell.
//!
//! The probe is the single writer; request handlers are readers. The cell
//! holds an `Arc<StatusSnapshot>` that is swapped as a whole, so a reader
//! sees either the previous snapshot or the next one, never a mix.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Local, Timelike};
use serde::Serialize;

/// Human-readable timestamp layout: ISO-8601 date and time, space separated.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub fn format_timestamp(at: &DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// One probe sample. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusSnapshot {
    at: DateTime<Local>,
    second: u32,
    divisible_by_2: bool,
}

impl StatusSnapshot {
    /// Derive a snapshot from a sampled instant.
    pub fn from_instant(at: DateTime<Local>) -> Self {
        let second = at.second().min(59);
        Self {
            at,
            second,
            divisible_by_2: second % 2 == 0,
        }
    }

    pub fn at(&self) -> DateTime<Local> {
        self.at
    }

    pub fn timestamp(&self) -> String {
        format_timestamp(&self.at)
    }

    pub fn second(&self) -> u32 {
        self.second
    }

    pub fn divisible_by_2(&self) -> bool {
        self.divisible_by_2
    }
}

/// Wire form of `/last_check`. All fields are `null` before the first probe cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LastCheck {
    pub timestamp: Option<String>,
    pub second: Option<u32>,
    pub divisible_by_2: Option<bool>,
}

impl From<Option<&StatusSnapshot>> for LastCheck {
    fn from(snapshot: Option<&StatusSnapshot>) -> Self {
        match snapshot {
            Some(s) => Self {
                timestamp: Some(s.timestamp()),
                second: Some(s.second),
                divisible_by_2: Some(s.divisible_by_2),
            },
            None => Self::default(),
        }
    }
}

/// Process-wide holder of the latest snapshot.
#[derive(Debug, Default)]
pub struct StatusCell {
    current: RwLock<Option<Arc<StatusSnapshot>>>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        let next = Arc::new(snapshot);
        // The guarded value is only ever replaced whole, so a poisoned lock
        // still holds a complete snapshot.
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(next);
    }

    /// Latest snapshot, or `None` before the first publish.
    pub fn read(&self) -> Option<Arc<StatusSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn last_check(&self) -> LastCheck {
        LastCheck::from(self.read().as_deref())
    }
}
