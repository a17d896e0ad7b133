use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key of the persisted daily state in the host key-value store
pub const STATE_KEY: &str = "usageProtectionState";

/// Upper bound for consumption in one day
pub const MAX_CONSUMED_SECONDS: u32 = 86_400;

const DATE_KEY_FORMAT: &str = "%Y-%m-%d";

/// Local calendar date key (`YYYY-MM-DD`) for a local wall-clock time
pub fn date_key(now: NaiveDateTime) -> String {
    now.format(DATE_KEY_FORMAT).to_string()
}

/// Consumption record for one local calendar day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyState {
    pub date_key: String,
    pub consumed_seconds: u32,
    pub self_extension_used: bool,
}

impl DailyState {
    /// Fresh zero record for the given date
    pub fn new(date_key: impl Into<String>) -> Self {
        Self {
            date_key: date_key.into(),
            consumed_seconds: 0,
            self_extension_used: false,
        }
    }

    /// Sanitize a stored or remote record.
    ///
    /// A missing or malformed `dateKey` becomes `today`, since the record
    /// can no longer be attributed to any other day.
    pub fn normalize(raw: &Value, today: &str) -> Self {
        let date_key = raw
            .get("dateKey")
            .and_then(Value::as_str)
            .filter(|key| NaiveDate::parse_from_str(key, DATE_KEY_FORMAT).is_ok())
            .unwrap_or(today)
            .to_string();

        let consumed_seconds = match raw.get("consumedSeconds").and_then(Value::as_f64) {
            Some(n) if n.is_finite() => n.round().clamp(0.0, f64::from(MAX_CONSUMED_SECONDS)) as u32,
            _ => 0,
        };

        Self {
            date_key,
            consumed_seconds,
            self_extension_used: raw
                .get("selfExtensionUsed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }

    /// Parse the JSON text written by [`DailyState::to_json`]
    pub fn from_json(raw: &str, today: &str) -> Self {
        serde_json::from_str::<Value>(raw)
            .map(|value| Self::normalize(&value, today))
            .unwrap_or_else(|_| Self::new(today))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Check if the record belongs to a day other than `today`
    pub fn needs_daily_reset(&self, today: &str) -> bool {
        self.date_key != today
    }

    /// Reset to a zero record if the record is stale. Returns true on reset.
    pub fn roll_over(&mut self, today: &str) -> bool {
        if !self.needs_daily_reset(today) {
            return false;
        }
        *self = Self::new(today);
        true
    }

    /// Copy of this record as seen on `today`
    pub fn for_day(&self, today: &str) -> Self {
        let mut view = self.clone();
        view.roll_over(today);
        view
    }

    /// Count one second of use. Returns false if the day is already full.
    pub fn consume_second(&mut self) -> bool {
        if self.consumed_seconds >= MAX_CONSUMED_SECONDS {
            return false;
        }
        self.consumed_seconds += 1;
        true
    }

    /// Mark today's self-extension as taken
    pub fn apply_self_extension(&mut self) {
        self.self_extension_used = true;
    }

    /// Return `seconds` to today's budget after a parental unlock
    pub fn apply_parental_grant(&mut self, seconds: u32, today: &str) {
        self.roll_over(today);
        self.consumed_seconds = self.consumed_seconds.saturating_sub(seconds);
        self.self_extension_used = false;
        self.date_key = today.to_string();
    }
}

/// Reconcile a local and a remote record for `today`.
///
/// Each side is first reset if it names another day. The merge keeps the
/// larger consumption and any extension already taken, so pulling an older
/// copy never gives time back.
pub fn merge_states(local: &DailyState, remote: &DailyState, today: &str) -> DailyState {
    let local = local.for_day(today);
    let remote = remote.for_day(today);

    DailyState {
        date_key: today.to_string(),
        consumed_seconds: local.consumed_seconds.max(remote.consumed_seconds),
        self_extension_used: local.self_extension_used || remote.self_extension_used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TODAY: &str = "2026-10-19";

    #[test]
    fn test_date_key_format() {
        let now = NaiveDate::from_ymd_opt(2026, 3, 7)
            .unwrap()
            .and_hms_opt(23, 59, 59)
            .unwrap();
        assert_eq!(date_key(now), "2026-03-07");
    }

    #[test]
    fn test_normalize_clamps_consumption() {
        let state = DailyState::normalize(&json!({ "dateKey": TODAY, "consumedSeconds": -20 }), TODAY);
        assert_eq!(state.consumed_seconds, 0);

        let state = DailyState::normalize(&json!({ "dateKey": TODAY, "consumedSeconds": 1e9 }), TODAY);
        assert_eq!(state.consumed_seconds, MAX_CONSUMED_SECONDS);

        let state = DailyState::normalize(&json!({ "dateKey": TODAY, "consumedSeconds": "lots" }), TODAY);
        assert_eq!(state.consumed_seconds, 0);
    }

    #[test]
    fn test_normalize_keeps_valid_fields() {
        let raw = json!({
            "dateKey": "2026-10-18",
            "consumedSeconds": 1234.4,
            "selfExtensionUsed": true,
        });
        let state = DailyState::normalize(&raw, TODAY);
        assert_eq!(state.date_key, "2026-10-18");
        assert_eq!(state.consumed_seconds, 1234);
        assert!(state.self_extension_used);
    }

    #[test]
    fn test_normalize_bad_date_key_becomes_today() {
        let state = DailyState::normalize(&json!({ "dateKey": "yesterday", "consumedSeconds": 5 }), TODAY);
        assert_eq!(state.date_key, TODAY);
        assert_eq!(state.consumed_seconds, 5);
    }

    #[test]
    fn test_from_json_handles_corruption() {
        assert_eq!(DailyState::from_json("{not json", TODAY), DailyState::new(TODAY));

        let state = DailyState {
            date_key: TODAY.to_string(),
            consumed_seconds: 77,
            self_extension_used: true,
        };
        assert_eq!(DailyState::from_json(&state.to_json(), TODAY), state);
    }

    #[test]
    fn test_roll_over_resets_everything() {
        let mut state = DailyState {
            date_key: "2026-10-18".to_string(),
            consumed_seconds: 5000,
            self_extension_used: true,
        };

        assert!(state.roll_over(TODAY));
        assert_eq!(state, DailyState::new(TODAY));
        assert!(!state.roll_over(TODAY));
    }

    #[test]
    fn test_for_day_does_not_mutate() {
        let state = DailyState {
            date_key: "2026-10-18".to_string(),
            consumed_seconds: 10,
            self_extension_used: false,
        };
        assert_eq!(state.for_day(TODAY), DailyState::new(TODAY));
        assert_eq!(state.consumed_seconds, 10);
    }

    #[test]
    fn test_consume_second_caps_at_one_day() {
        let mut state = DailyState::new(TODAY);
        state.consumed_seconds = MAX_CONSUMED_SECONDS - 1;
        assert!(state.consume_second());
        assert!(!state.consume_second());
        assert_eq!(state.consumed_seconds, MAX_CONSUMED_SECONDS);
    }

    #[test]
    fn test_parental_grant_floors_at_zero() {
        let mut state = DailyState {
            date_key: TODAY.to_string(),
            consumed_seconds: 4000,
            self_extension_used: true,
        };
        state.apply_parental_grant(1800, TODAY);
        assert_eq!(state.consumed_seconds, 2200);
        assert!(!state.self_extension_used);

        state.apply_parental_grant(1800 * 2, TODAY);
        assert_eq!(state.consumed_seconds, 0);
    }

    #[test]
    fn test_parental_grant_on_stale_record_starts_from_zero() {
        let mut state = DailyState {
            date_key: "2026-10-18".to_string(),
            consumed_seconds: 4000,
            self_extension_used: true,
        };
        state.apply_parental_grant(60, TODAY);
        assert_eq!(state, DailyState::new(TODAY));
    }

    #[test]
    fn test_merge_takes_max_and_or() {
        let local = DailyState {
            date_key: TODAY.to_string(),
            consumed_seconds: 100,
            self_extension_used: false,
        };
        let remote = DailyState {
            date_key: TODAY.to_string(),
            consumed_seconds: 150,
            self_extension_used: true,
        };

        let merged = merge_states(&local, &remote, TODAY);
        assert_eq!(merged.consumed_seconds, 150);
        assert!(merged.self_extension_used);
        assert_eq!(merge_states(&remote, &local, TODAY), merged);
    }

    #[test]
    fn test_merge_ignores_stale_side() {
        let local = DailyState {
            date_key: TODAY.to_string(),
            consumed_seconds: 100,
            self_extension_used: false,
        };
        let remote = DailyState {
            date_key: "2026-10-18".to_string(),
            consumed_seconds: 9000,
            self_extension_used: true,
        };

        assert_eq!(merge_states(&local, &remote, TODAY), local);
    }

    #[test]
    fn test_serialized_shape() {
        let value = serde_json::to_value(DailyState::new(TODAY)).unwrap();
        assert_eq!(
            value,
            json!({ "dateKey": TODAY, "consumedSeconds": 0, "selfExtensionUsed": false })
        );
    }
}
