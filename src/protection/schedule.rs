use crate::protection::settings::{DayWindow, Settings};
use chrono::{Datelike, Days, NaiveDateTime, NaiveTime, Timelike};

/// How many days ahead to look for the next opening
const LOOKAHEAD_DAYS: u64 = 7;

/// Weekly time-of-day schedule evaluation
pub struct ScheduleEvaluator;

impl ScheduleEvaluator {
    /// Whether the weekly schedule denies access at `now`
    pub fn is_locked(settings: &Settings, now: NaiveDateTime) -> bool {
        if !settings.schedule_enabled {
            return false;
        }

        let window = settings.daily_windows.get(now.weekday());
        !Self::window_allows(window, minutes_since_midnight(now))
    }

    /// Whether `window` allows access at `now_minutes` past midnight
    pub fn window_allows(window: &DayWindow, now_minutes: u32) -> bool {
        let start = window.start.minutes();
        let end = window.end.minutes();

        if start == end {
            // Degenerate window: open all day
            true
        } else if start < end {
            start <= now_minutes && now_minutes < end
        } else {
            now_minutes >= start || now_minutes < end
        }
    }

    /// The next moment strictly after `now` at which a window opens.
    ///
    /// Scans today and the following seven days. A day whose window has
    /// `start == end` opens at midnight. Returns `None` when the schedule
    /// is disabled.
    pub fn next_access_at(settings: &Settings, now: NaiveDateTime) -> Option<NaiveDateTime> {
        if !settings.schedule_enabled {
            return None;
        }

        (0..=LOOKAHEAD_DAYS).find_map(|offset| {
            let day = now.date().checked_add_days(Days::new(offset))?;
            let window = settings.daily_windows.get(day.weekday());

            let opens_at = if window.start == window.end {
                NaiveTime::MIN
            } else {
                NaiveTime::from_hms_opt(window.start.hour(), window.start.minute(), 0)?
            };

            let candidate = day.and_time(opens_at);
            (candidate > now).then_some(candidate)
        })
    }
}

fn minutes_since_midnight(now: NaiveDateTime) -> u32 {
    now.hour() * 60 + now.minute()
}
