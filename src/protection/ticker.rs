use chrono::NaiveDateTime;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::protection::engine::Shared;
use crate::protection::policy::{LockPolicy, LockState};
use crate::protection::settings::Settings;
use crate::protection::state::{date_key, DailyState};

/// Tick period
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Number of state changes batched before a flush
pub const FLUSH_BATCH: u32 = 5;

/// Result of advancing the state by one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// Number of changed fields (date rollover and/or consumption)
    pub changes: u32,
    pub rolled_over: bool,
    /// Lock state the tick was evaluated under
    pub lock: LockState,
}

/// Advance `state` by one second of wall-clock time at `now`.
///
/// The date is recomputed first; a stale record is reset before anything
/// else is looked at. Consumption only grows while unlocked.
pub fn advance(state: &mut DailyState, settings: &Settings, now: NaiveDateTime) -> TickOutcome {
    let today = date_key(now);
    let rolled_over = state.roll_over(&today);
    let mut changes = u32::from(rolled_over);

    let lock = LockPolicy::evaluate(settings, state, now);
    if !lock.is_locked() && state.consume_second() {
        changes += 1;
    }

    TickOutcome {
        changes,
        rolled_over,
        lock,
    }
}

/// Start/stop bookkeeping for the tick loop.
///
/// Every activation or deactivation bumps the generation; a loop keeps
/// running only while its generation is current.
#[derive(Debug, Default)]
pub struct TickerControl {
    generation: u64,
    running: bool,
}

impl TickerControl {
    /// Mark the ticker running. Returns the generation for a new loop, or
    /// `None` if one is already running.
    pub fn activate(&mut self) -> Option<u64> {
        if self.running {
            return None;
        }
        self.running = true;
        self.generation += 1;
        Some(self.generation)
    }

    /// Mark the ticker stopped. Returns false if it was not running.
    pub fn deactivate(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.running = false;
        self.generation += 1;
        true
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.running && self.generation == generation
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// Spawn the 1 Hz loop for `generation`.
///
/// The loop holds only a weak reference to the engine and exits once the
/// engine is dropped or the generation is superseded.
pub(crate) fn spawn(shared: Weak<Shared>, generation: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let Some(shared) = shared.upgrade() else {
                break;
            };

            if !shared.tick_if_current(generation).await {
                break;
            }
        }

        debug!("Clock ticker generation {} stopped", generation);
    })
}
