use anyhow::{Context, Result};
use chrono::Weekday;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::sync::RwLock;

/// Key of the usage protection object inside the host's application settings
pub const SETTINGS_PATH: &str = "usageProtection";

pub const DAILY_LIMIT_RANGE: (u32, u32) = (5, 720);
pub const SELF_EXTENSION_RANGE: (u32, u32) = (0, 120);
pub const PARENTAL_EXTENSION_RANGE: (u32, u32) = (1, 240);

const DEFAULT_DAILY_LIMIT: u32 = 120;
const DEFAULT_SELF_EXTENSION: u32 = 15;
const DEFAULT_PARENTAL_EXTENSION: u32 = 30;

const DEFAULT_WEEKDAY_WINDOW: DayWindow = DayWindow {
    start: TimeOfDay::hm(8, 0),
    end: TimeOfDay::hm(20, 0),
};

const DEFAULT_WEEKEND_WINDOW: DayWindow = DayWindow {
    start: TimeOfDay::hm(9, 0),
    end: TimeOfDay::hm(21, 0),
};

/// Enforcement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProtectionMode {
    /// Never locks, never tracks
    #[default]
    #[serde(rename = "off")]
    Off,
    /// The user manages their own budget and may extend it once a day
    #[serde(rename = "self")]
    SelfManaged,
    /// A parent manages the budget and unlocks with a PIN
    #[serde(rename = "parental")]
    Parental,
}

impl ProtectionMode {
    fn parse(raw: &str) -> Self {
        match raw {
            "self" => Self::SelfManaged,
            "parental" => Self::Parental,
            _ => Self::Off,
        }
    }
}

/// Wall-clock time of day with minute precision, written as `HH:MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    const fn hm(hour: u16, minute: u16) -> Self {
        Self(hour * 60 + minute)
    }

    /// Parse a zero-padded 24h `HH:MM` string. Anything else is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let bytes = raw.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return None;
        }

        let digit = |b: u8| b.is_ascii_digit().then(|| u16::from(b - b'0'));
        let hour = digit(bytes[0])? * 10 + digit(bytes[1])?;
        let minute = digit(bytes[3])? * 10 + digit(bytes[4])?;

        if hour > 23 || minute > 59 {
            return None;
        }

        Some(Self::hm(hour, minute))
    }

    /// Minutes since midnight
    pub fn minutes(self) -> u32 {
        u32::from(self.0)
    }

    pub fn hour(self) -> u32 {
        u32::from(self.0 / 60)
    }

    pub fn minute(self) -> u32 {
        u32::from(self.0 % 60)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid time of day: {raw}")))
    }
}

/// Allowed interval for one weekday. May wrap past midnight when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

/// One window per weekday
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyWindows {
    pub monday: DayWindow,
    pub tuesday: DayWindow,
    pub wednesday: DayWindow,
    pub thursday: DayWindow,
    pub friday: DayWindow,
    pub saturday: DayWindow,
    pub sunday: DayWindow,
}

impl WeeklyWindows {
    /// Build the week by asking `f` for each day's window
    pub fn from_fn(f: impl Fn(Weekday) -> DayWindow) -> Self {
        Self {
            monday: f(Weekday::Mon),
            tuesday: f(Weekday::Tue),
            wednesday: f(Weekday::Wed),
            thursday: f(Weekday::Thu),
            friday: f(Weekday::Fri),
            saturday: f(Weekday::Sat),
            sunday: f(Weekday::Sun),
        }
    }

    pub fn get(&self, day: Weekday) -> &DayWindow {
        match day {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        }
    }
}

impl Default for WeeklyWindows {
    fn default() -> Self {
        Self::from_fn(default_window)
    }
}

/// Usage protection settings, always in normalized form
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub mode: ProtectionMode,
    pub daily_limit_minutes: u32,
    pub self_extension_minutes: u32,
    pub parental_extension_minutes: u32,
    pub schedule_enabled: bool,
    pub daily_windows: WeeklyWindows,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_pin_hash: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: ProtectionMode::Off,
            daily_limit_minutes: DEFAULT_DAILY_LIMIT,
            self_extension_minutes: DEFAULT_SELF_EXTENSION,
            parental_extension_minutes: DEFAULT_PARENTAL_EXTENSION,
            schedule_enabled: false,
            daily_windows: WeeklyWindows::default(),
            parent_pin_hash: None,
        }
    }
}

impl Settings {
    /// Sanitize arbitrary input into valid settings.
    ///
    /// Never fails: anything unusable falls back to its default. Accepts the
    /// legacy flat `weekdayStart`/`weekdayEnd`/`weekendStart`/`weekendEnd`
    /// fields when `dailyWindows` is absent. Normalizing the serialized
    /// output again yields the same value.
    pub fn normalize(raw: &Value) -> Self {
        let empty = Map::new();
        let fields = raw.as_object().unwrap_or(&empty);

        Self {
            mode: fields
                .get("mode")
                .and_then(Value::as_str)
                .map(ProtectionMode::parse)
                .unwrap_or_default(),
            daily_limit_minutes: clamped_minutes(
                fields.get("dailyLimitMinutes"),
                DAILY_LIMIT_RANGE,
                DEFAULT_DAILY_LIMIT,
            ),
            self_extension_minutes: clamped_minutes(
                fields.get("selfExtensionMinutes"),
                SELF_EXTENSION_RANGE,
                DEFAULT_SELF_EXTENSION,
            ),
            parental_extension_minutes: clamped_minutes(
                fields.get("parentalExtensionMinutes"),
                PARENTAL_EXTENSION_RANGE,
                DEFAULT_PARENTAL_EXTENSION,
            ),
            schedule_enabled: fields
                .get("scheduleEnabled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            daily_windows: normalize_windows(fields),
            parent_pin_hash: fields
                .get("parentPinHash")
                .and_then(Value::as_str)
                .and_then(normalize_pin_hash),
        }
    }

    /// Serialized form, as stored by the host and sent to the server
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Lowercase weekday name used as the `dailyWindows` key
pub fn day_key(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

fn default_window(day: Weekday) -> DayWindow {
    if is_weekend(day) {
        DEFAULT_WEEKEND_WINDOW
    } else {
        DEFAULT_WEEKDAY_WINDOW
    }
}

fn clamped_minutes(raw: Option<&Value>, (min, max): (u32, u32), default: u32) -> u32 {
    match raw.and_then(Value::as_f64) {
        Some(n) if n.is_finite() => n.round().clamp(f64::from(min), f64::from(max)) as u32,
        _ => default,
    }
}

fn time_field(fields: Option<&Map<String, Value>>, key: &str) -> Option<TimeOfDay> {
    fields?.get(key)?.as_str().and_then(TimeOfDay::parse)
}

fn normalize_windows(fields: &Map<String, Value>) -> WeeklyWindows {
    if let Some(days) = fields.get("dailyWindows").and_then(Value::as_object) {
        return WeeklyWindows::from_fn(|day| {
            let fallback = default_window(day);
            let entry = days.get(day_key(day)).and_then(Value::as_object);
            DayWindow {
                start: time_field(entry, "start").unwrap_or(fallback.start),
                end: time_field(entry, "end").unwrap_or(fallback.end),
            }
        });
    }

    // Legacy shape: one pair for Monday-Friday, one for the weekend
    let weekday_start = time_field(Some(fields), "weekdayStart");
    let weekday_end = time_field(Some(fields), "weekdayEnd");
    let weekend_start = time_field(Some(fields), "weekendStart");
    let weekend_end = time_field(Some(fields), "weekendEnd");

    WeeklyWindows::from_fn(|day| {
        let fallback = default_window(day);
        let (start, end) = if is_weekend(day) {
            (weekend_start, weekend_end)
        } else {
            (weekday_start, weekday_end)
        };
        DayWindow {
            start: start.unwrap_or(fallback.start),
            end: end.unwrap_or(fallback.end),
        }
    })
}

fn normalize_pin_hash(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (trimmed.len() == 64 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()))
        .then(|| trimmed.to_ascii_lowercase())
}

/// Read access to the host's application settings
pub trait SettingsSource: Send + Sync {
    /// The raw `usageProtection` object, if the host has one
    fn usage_protection(&self) -> Option<Value>;

    /// Current settings in normalized form
    fn settings(&self) -> Settings {
        self.usage_protection()
            .map(|raw| Settings::normalize(&raw))
            .unwrap_or_default()
    }
}

/// In-process copy of the host's application settings object
#[derive(Debug, Default)]
pub struct HostSettings {
    document: RwLock<Value>,
}

impl HostSettings {
    pub fn new(document: Value) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }

    /// Replace the whole settings document. Returns true if it changed.
    pub fn replace(&self, document: Value) -> bool {
        let mut current = self.document.write().unwrap_or_else(|e| e.into_inner());
        if *current == document {
            return false;
        }
        *current = document;
        true
    }
}

impl SettingsSource for HostSettings {
    fn usage_protection(&self) -> Option<Value> {
        self.document
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(SETTINGS_PATH)
            .cloned()
    }
}

/// Load the host settings document from a YAML file
pub fn load_settings_document(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

    let document: Value = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML settings file: {}", path.display()))?;

    Ok(document)
}

/// Example host settings file content
pub const EXAMPLE_SETTINGS: &str = include_str!("../../example-settings.yaml");
