//! JSON status snapshots.
//!
//! A report captures the fleet's health at one moment: overall status,
//! per-slot connection state, idle time, and consecutive-error counts.
//! The watch loop emits one per reporting interval.

use crate::fleet::Fleet;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Serialize)]
pub struct SlotReport {
    pub slot: usize,
    pub state: Option<String>,
    pub consecutive_errors: u32,
    /// Milliseconds since this slot last produced activity, if it ever has.
    pub idle_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct FleetReport {
    pub generated_at: DateTime<Utc>,
    pub status: String,
    /// Entries currently live in the host's update cache.
    pub cached_updates: usize,
    pub slots: Vec<SlotReport>,
}

impl FleetReport {
    pub fn capture(fleet: &Fleet, cached_updates: usize) -> Self {
        let now = Instant::now();
        let slots = (0..fleet.slot_count())
            .map(|slot| SlotReport {
                slot,
                state: fleet.slot_state(slot).map(|s| format!("{s:?}")),
                consecutive_errors: fleet.consecutive_errors(slot),
                idle_ms: fleet
                    .slot_latest_activity(slot)
                    .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            })
            .collect();
        Self {
            generated_at: Utc::now(),
            status: format!("{:?}", fleet.status()),
            cached_updates,
            slots,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
