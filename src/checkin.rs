//! Daily check-ins and streaks.
//!
//! The log is a small JSON file next to the database. Writers hold the
//! file's lock across read-modify-write so two processes checking in on the
//! same day cannot lose an entry.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lock::{lock_path_for, write_atomic, write_atomic_locked, FileLock, DEFAULT_LOCK_TIMEOUT_MS};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInLog {
    #[serde(default)]
    days: BTreeSet<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreakSummary {
    pub current: u32,
    pub longest: u32,
    pub total: usize,
}

impl CheckInLog {
    /// Missing file reads as an empty log.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic_locked(path, &bytes, DEFAULT_LOCK_TIMEOUT_MS)
    }

    /// Returns `false` when `day` was already checked in.
    pub fn check_in(&mut self, day: NaiveDate) -> bool {
        self.days.insert(day)
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.days.contains(&day)
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.days.iter().copied()
    }

    /// Consecutive days ending today, or yesterday when today is still open.
    pub fn current_streak(&self, today: NaiveDate) -> u32 {
        let mut day = if self.contains(today) {
            today
        } else {
            match today.pred_opt() {
                Some(yesterday) if self.contains(yesterday) => yesterday,
                _ => return 0,
            }
        };
        let mut streak = 0;
        while self.contains(day) {
            streak += 1;
            match day.pred_opt() {
                Some(prev) => day = prev,
                None => break,
            }
        }
        streak
    }

    pub fn longest_streak(&self) -> u32 {
        let mut longest = 0;
        let mut run = 0;
        let mut previous: Option<NaiveDate> = None;
        for day in self.days() {
            run = match previous {
                Some(prev) if day - prev == Duration::days(1) => run + 1,
                _ => 1,
            };
            longest = longest.max(run);
            previous = Some(day);
        }
        longest
    }

    pub fn summary(&self, today: NaiveDate) -> StreakSummary {
        StreakSummary {
            current: self.current_streak(today),
            longest: self.longest_streak(),
            total: self.len(),
        }
    }
}

/// Check in `day` under the log's file lock; returns the updated log and
/// whether the day was new.
pub fn record_check_in(path: &Path, day: NaiveDate) -> Result<(CheckInLog, bool)> {
    let _lock = FileLock::acquire(lock_path_for(path), DEFAULT_LOCK_TIMEOUT_MS)?;
    let mut log = CheckInLog::load(path)?;
    let added = log.check_in(day);
    if added {
        write_atomic(path, &serde_json::to_vec_pretty(&log)?)?;
    }
    Ok((log, added))
}
