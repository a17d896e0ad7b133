/// Usage protection engine
///
/// This module provides functionality to:
/// - Normalize usage protection settings from the host (including legacy shapes)
/// - Evaluate the weekly time-of-day schedule and the daily time budget
/// - Count usage once per second while the app is visible
/// - Offer a one-time self-extension or a PIN-gated parental unlock
/// - Persist the daily state locally and reconcile it with a server copy

pub mod auth;
pub mod clock;
pub mod engine;
pub mod policy;
pub mod remote;
pub mod schedule;
pub mod settings;
pub mod state;
pub mod store;
pub mod sync;
pub mod ticker;

pub use auth::{PinError, PinVerifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{ProtectionStatus, UsageGuard};
pub use policy::{LockPolicy, LockReason, LockState};
pub use remote::{HttpSyncClient, RemoteConfig, RemotePayload, RemoteSnapshot, RemoteSyncClient};
pub use schedule::ScheduleEvaluator;
pub use settings::{DayWindow, HostSettings, ProtectionMode, Settings, SettingsSource, TimeOfDay, WeeklyWindows};
pub use state::{merge_states, DailyState};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use sync::PersistenceSync;
