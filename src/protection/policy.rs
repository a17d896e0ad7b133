use crate::protection::schedule::ScheduleEvaluator;
use crate::protection::settings::{ProtectionMode, Settings};
use crate::protection::state::DailyState;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Why access is currently denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    Schedule,
    DailyLimit,
}

/// Lock state, derived on demand and never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    LockedBySchedule,
    LockedByDailyLimit,
}

impl LockState {
    pub fn reason(self) -> Option<LockReason> {
        match self {
            Self::Unlocked => None,
            Self::LockedBySchedule => Some(LockReason::Schedule),
            Self::LockedByDailyLimit => Some(LockReason::DailyLimit),
        }
    }

    pub fn is_locked(self) -> bool {
        self != Self::Unlocked
    }
}

/// Combines mode, schedule and consumption into a lock decision.
///
/// `state` must already be the record for the day containing `now`.
pub struct LockPolicy;

impl LockPolicy {
    pub fn evaluate(settings: &Settings, state: &DailyState, now: NaiveDateTime) -> LockState {
        if settings.mode == ProtectionMode::Off {
            return LockState::Unlocked;
        }

        // Schedule wins over the daily limit
        if ScheduleEvaluator::is_locked(settings, now) {
            return LockState::LockedBySchedule;
        }

        if state.consumed_seconds >= Self::effective_limit_seconds(settings, state) {
            return LockState::LockedByDailyLimit;
        }

        LockState::Unlocked
    }

    /// Daily budget in seconds, including a self-extension taken today
    pub fn effective_limit_seconds(settings: &Settings, state: &DailyState) -> u32 {
        let mut limit = settings.daily_limit_minutes * 60;
        if settings.mode == ProtectionMode::SelfManaged && state.self_extension_used {
            limit += settings.self_extension_minutes * 60;
        }
        limit
    }

    /// Budget left today, `None` when protection is off
    pub fn remaining_seconds(settings: &Settings, state: &DailyState) -> Option<u32> {
        if settings.mode == ProtectionMode::Off {
            return None;
        }
        Some(Self::effective_limit_seconds(settings, state).saturating_sub(state.consumed_seconds))
    }

    pub fn self_extension_available(settings: &Settings, state: &DailyState, lock: LockState) -> bool {
        settings.mode == ProtectionMode::SelfManaged
            && lock == LockState::LockedByDailyLimit
            && !state.self_extension_used
            && settings.self_extension_minutes > 0
    }

    pub fn parental_unlock_available(settings: &Settings, lock: LockState) -> bool {
        settings.mode == ProtectionMode::Parental
            && lock == LockState::LockedByDailyLimit
            && settings.parent_pin_hash.is_some()
    }
}
