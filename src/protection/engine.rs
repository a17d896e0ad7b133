use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::protection::auth::{PinError, PinVerifier};
use crate::protection::clock::Clock;
use crate::protection::policy::{LockPolicy, LockReason, LockState};
use crate::protection::remote::{RemoteSnapshot, RemoteSyncClient};
use crate::protection::schedule::ScheduleEvaluator;
use crate::protection::settings::{ProtectionMode, Settings, SettingsSource};
use crate::protection::state::{date_key, merge_states, DailyState};
use crate::protection::store::KeyValueStore;
use crate::protection::sync::PersistenceSync;
use crate::protection::ticker::{self, TickerControl, FLUSH_BATCH};

/// Snapshot of everything the host UI needs to render protection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionStatus {
    pub lock_reason: Option<LockReason>,
    /// `None` when protection is off
    pub remaining_seconds: Option<u32>,
    pub self_extension_available: bool,
    pub parental_unlock_available: bool,
    /// When a schedule lock ends
    pub next_access_at: Option<NaiveDateTime>,
    pub consumed_seconds: u32,
    pub date_key: String,
}

impl ProtectionStatus {
    /// `state` must be the record for the day containing `now`
    pub fn evaluate(settings: &Settings, state: &DailyState, now: NaiveDateTime) -> Self {
        let lock = LockPolicy::evaluate(settings, state, now);

        Self {
            lock_reason: lock.reason(),
            remaining_seconds: LockPolicy::remaining_seconds(settings, state),
            self_extension_available: LockPolicy::self_extension_available(settings, state, lock),
            parental_unlock_available: LockPolicy::parental_unlock_available(settings, lock),
            next_access_at: match lock {
                LockState::LockedBySchedule => ScheduleEvaluator::next_access_at(settings, now),
                _ => None,
            },
            consumed_seconds: state.consumed_seconds,
            date_key: state.date_key.clone(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_reason.is_some()
    }
}

/// Mutable engine state, guarded by a single lock so writers never interleave
struct Core {
    state: DailyState,
    pending_writes: u32,
    tracking: bool,
    visible: bool,
    ticker: TickerControl,
    session_user: Option<String>,
    loaded_user: Option<String>,
}

pub(crate) struct Shared {
    settings: Arc<dyn SettingsSource>,
    clock: Arc<dyn Clock>,
    sync: PersistenceSync,
    core: Mutex<Core>,
    status_tx: watch::Sender<ProtectionStatus>,
}

impl Shared {
    /// Called by the tick loop. Returns false once `generation` is stale.
    pub(crate) async fn tick_if_current(&self, generation: u64) -> bool {
        let mut core = self.core.lock().await;
        if !core.ticker.is_current(generation) {
            return false;
        }
        self.tick_locked(&mut core);
        true
    }

    fn tick_locked(&self, core: &mut Core) {
        let settings = self.settings.settings();
        if settings.mode == ProtectionMode::Off {
            return;
        }

        let now = self.clock.now();
        let outcome = ticker::advance(&mut core.state, &settings, now);

        if outcome.rolled_over {
            info!("New day {}: usage budget reset", core.state.date_key);
        }

        core.pending_writes += outcome.changes;
        if core.pending_writes >= FLUSH_BATCH {
            self.flush_locked(core, &settings);
        }

        self.publish(core, &settings, now);
    }

    /// Persist locally, then try a remote sync. Resets the pending counter.
    fn flush_locked(&self, core: &mut Core, settings: &Settings) {
        core.pending_writes = 0;
        self.sync.save_local(&core.state);
        self.sync
            .sync_remote(core.session_user.as_deref(), settings, &core.state);
    }

    /// Recompute the status and notify subscribers if it changed
    fn publish(&self, core: &Core, settings: &Settings, now: NaiveDateTime) {
        let view = core.state.for_day(&date_key(now));
        let status = ProtectionStatus::evaluate(settings, &view, now);

        let previous = self.status_tx.borrow().lock_reason;
        if previous != status.lock_reason {
            match status.lock_reason {
                Some(reason) => info!("Access locked ({:?})", reason),
                None => info!("Access unlocked"),
            }
        }

        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    /// Start or stop the tick loop to match tracking, visibility and mode
    fn reconcile_ticker(self: &Arc<Self>, core: &mut Core, settings: &Settings) {
        let should_run = core.tracking && core.visible && settings.mode != ProtectionMode::Off;

        if should_run {
            if let Some(generation) = core.ticker.activate() {
                debug!("Starting clock ticker generation {}", generation);
                ticker::spawn(Arc::downgrade(self), generation);
            }
            return;
        }

        if core.ticker.deactivate() {
            debug!("Clock ticker deactivated");
        }

        if core.pending_writes > 0 {
            self.flush_locked(core, settings);
        }
    }
}

/// The usage protection engine.
///
/// Owns the daily state. The tick loop, extension and unlock requests,
/// and session reconciliation all mutate it under one lock.
pub struct UsageGuard {
    shared: Arc<Shared>,
}

impl UsageGuard {
    /// Create the engine and load the local daily state
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        store: Arc<dyn KeyValueStore>,
        remote: Option<Arc<dyn RemoteSyncClient>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sync = PersistenceSync::new(store, remote);

        let now = clock.now();
        let today = date_key(now);
        let mut state = sync
            .load_local(&today)
            .unwrap_or_else(|| DailyState::new(today.as_str()));
        if state.roll_over(&today) {
            debug!("Stored usage state was from an earlier day");
        }

        let current = settings.settings();
        let status = ProtectionStatus::evaluate(&current, &state, now);
        let (status_tx, _) = watch::channel(status);

        Self {
            shared: Arc::new(Shared {
                settings,
                clock,
                sync,
                core: Mutex::new(Core {
                    state,
                    pending_writes: 0,
                    tracking: false,
                    visible: true,
                    ticker: TickerControl::default(),
                    session_user: None,
                    loaded_user: None,
                }),
                status_tx,
            }),
        }
    }

    /// Receive a notification whenever the status changes
    pub fn subscribe(&self) -> watch::Receiver<ProtectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Fresh status for the current moment
    pub async fn status(&self) -> ProtectionStatus {
        let core = self.shared.core.lock().await;
        let settings = self.shared.settings.settings();
        let now = self.shared.clock.now();
        ProtectionStatus::evaluate(&settings, &core.state.for_day(&date_key(now)), now)
    }

    /// Today's record (a stale record reads as zero)
    pub async fn daily_state(&self) -> DailyState {
        let core = self.shared.core.lock().await;
        core.state.for_day(&date_key(self.shared.clock.now()))
    }

    pub fn settings(&self) -> Settings {
        self.shared.settings.settings()
    }

    pub async fn is_ticking(&self) -> bool {
        self.shared.core.lock().await.ticker.is_running()
    }

    /// Begin counting usage (subject to visibility and mode)
    pub async fn start_tracking(&self) {
        let mut core = self.shared.core.lock().await;
        if !core.tracking {
            info!("Usage tracking started");
        }
        core.tracking = true;
        let settings = self.shared.settings.settings();
        self.shared.reconcile_ticker(&mut core, &settings);
    }

    /// Stop counting usage. Pending changes are flushed immediately.
    pub async fn stop_tracking(&self) {
        let mut core = self.shared.core.lock().await;
        if core.tracking {
            info!("Usage tracking stopped");
        }
        core.tracking = false;
        let settings = self.shared.settings.settings();
        self.shared.reconcile_ticker(&mut core, &settings);
    }

    /// Host visibility signal; usage only counts while visible
    pub async fn set_visible(&self, visible: bool) {
        let mut core = self.shared.core.lock().await;
        core.visible = visible;
        let settings = self.shared.settings.settings();
        self.shared.reconcile_ticker(&mut core, &settings);
    }

    /// Advance by one tick, as the 1 Hz loop does
    pub async fn tick(&self) {
        let mut core = self.shared.core.lock().await;
        self.shared.tick_locked(&mut core);
    }

    /// Stop tracking and finish every pending write, local and remote.
    ///
    /// Hosts call this before exiting; pushes still running when the runtime
    /// goes away are lost otherwise.
    pub async fn shutdown(&self) {
        self.stop_tracking().await;

        let (user_id, state) = {
            let core = self.shared.core.lock().await;
            (core.session_user.clone(), core.state.clone())
        };
        let settings = self.shared.settings.settings();

        self.shared
            .sync
            .drain(user_id.as_deref(), &settings, &state)
            .await;
        debug!("Usage protection shut down");
    }

    /// Persist now, regardless of the batch counter
    pub async fn flush(&self) {
        let mut core = self.shared.core.lock().await;
        let settings = self.shared.settings.settings();
        self.shared.flush_locked(&mut core, &settings);
    }

    /// Host settings were replaced: re-derive the lock and ticker state
    pub async fn on_settings_changed(&self) {
        let mut core = self.shared.core.lock().await;
        let settings = self.shared.settings.settings();
        let now = self.shared.clock.now();

        debug!("Settings changed (mode {:?})", settings.mode);
        self.shared.reconcile_ticker(&mut core, &settings);
        self.shared.publish(&core, &settings, now);
    }

    /// Grant today's self-extension. Returns false if it is not on offer.
    pub async fn apply_self_extension(&self) -> bool {
        let mut core = self.shared.core.lock().await;
        let settings = self.shared.settings.settings();
        let now = self.shared.clock.now();

        if core.state.roll_over(&date_key(now)) {
            core.pending_writes += 1;
        }

        let lock = LockPolicy::evaluate(&settings, &core.state, now);
        if !LockPolicy::self_extension_available(&settings, &core.state, lock) {
            debug!("Self-extension requested but not available");
            return false;
        }

        core.state.apply_self_extension();
        info!(
            "Self-extension applied: {} extra minutes today",
            settings.self_extension_minutes
        );

        self.shared.flush_locked(&mut core, &settings);
        self.shared.publish(&core, &settings, now);
        true
    }

    /// Return parental extension time to today's budget after checking the PIN
    pub async fn unlock_with_parent_pin(&self, pin: &str) -> Result<(), PinError> {
        let mut core = self.shared.core.lock().await;
        let settings = self.shared.settings.settings();

        let stored_hash = match (settings.mode, settings.parent_pin_hash.as_deref()) {
            (ProtectionMode::Parental, Some(hash)) => hash,
            _ => return Err(PinError::Unavailable),
        };

        if let Err(e) = PinVerifier::verify(pin, stored_hash) {
            warn!("Parental unlock rejected: {}", e);
            return Err(e);
        }

        let now = self.shared.clock.now();
        let granted = settings.parental_extension_minutes * 60;
        core.state.apply_parental_grant(granted, &date_key(now));
        info!(
            "Parental unlock granted {} minutes",
            settings.parental_extension_minutes
        );

        self.shared.flush_locked(&mut core, &settings);
        self.shared.publish(&core, &settings, now);
        Ok(())
    }

    /// The authenticated user changed.
    ///
    /// A user id other than the last one loaded triggers reconciliation
    /// with the server copy. `None` stops remote sync.
    pub async fn on_session_changed(&self, user_id: Option<String>) {
        let load_for = {
            let mut core = self.shared.core.lock().await;
            core.session_user = user_id.clone();

            match user_id {
                Some(id) if core.loaded_user.as_deref() != Some(id.as_str()) => {
                    core.loaded_user = Some(id.clone());
                    Some(id)
                }
                _ => None,
            }
        };

        let Some(user_id) = load_for else {
            return;
        };

        if !self.shared.sync.has_remote() {
            return;
        }

        info!("Loading usage protection for user {}", user_id);
        let snapshot = self.shared.sync.fetch_remote(&user_id).await;
        self.reconcile_remote(&user_id, snapshot).await;
    }

    async fn reconcile_remote(&self, user_id: &str, snapshot: Option<RemoteSnapshot>) {
        let mut core = self.shared.core.lock().await;

        if core.session_user.as_deref() != Some(user_id) {
            debug!("Session changed while loading; discarding server copy");
            return;
        }

        let settings = self.shared.settings.settings();
        let now = self.shared.clock.now();
        let today = date_key(now);

        match snapshot {
            Some(snapshot) => {
                // This device's settings stay authoritative
                if Settings::normalize(&snapshot.settings) != settings {
                    debug!("Server settings differ from local settings; keeping local");
                }

                let remote = DailyState::normalize(&snapshot.state, &today);
                core.state = merge_states(&core.state, &remote, &today);
                info!(
                    "Merged server usage: {}s consumed today",
                    core.state.consumed_seconds
                );
            }
            None => {
                core.state.roll_over(&today);
            }
        }

        self.shared.flush_locked(&mut core, &settings);
        self.shared.publish(&core, &settings, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protection::clock::ManualClock;
    use crate::protection::remote::RemotePayload;
    use crate::protection::settings::HostSettings;
    use crate::protection::state::STATE_KEY;
    use crate::protection::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeDelta};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    const HASH_1234: &str = "03ac674216f3e15c761ee1a5e255f067953623c8b388b4459e13f978d7c846f4";

    #[derive(Default)]
    struct FakeRemote {
        snapshots: StdMutex<HashMap<String, Value>>,
        fail: bool,
        fetches: StdMutex<Vec<String>>,
        pushes: StdMutex<Vec<RemotePayload>>,
        /// `fetch` signals the first and then waits for the second
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl FakeRemote {
        fn serving(user_id: &str, snapshot: Value) -> Self {
            let remote = Self::default();
            remote.add_user(user_id, snapshot);
            remote
        }

        fn add_user(&self, user_id: &str, snapshot: Value) {
            self.snapshots
                .lock()
                .unwrap()
                .insert(user_id.to_string(), snapshot);
        }
    }

    #[async_trait]
    impl RemoteSyncClient for FakeRemote {
        async fn fetch(&self, user_id: &str) -> anyhow::Result<Option<RemoteSnapshot>> {
            self.fetches.lock().unwrap().push(user_id.to_string());
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            if self.fail {
                anyhow::bail!("network down");
            }
            let snapshot = self.snapshots.lock().unwrap().get(user_id).cloned();
            Ok(snapshot.map(|v| serde_json::from_value(v).unwrap()))
        }

        async fn push(&self, _user_id: &str, payload: &RemotePayload) -> anyhow::Result<()> {
            self.pushes.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    struct Harness {
        guard: UsageGuard,
        host: Arc<HostSettings>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    // Monday
    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn harness(usage_protection: Value, remote: Option<Arc<FakeRemote>>) -> Harness {
        let host = Arc::new(HostSettings::new(json!({ "usageProtection": usage_protection })));
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(noon()));
        let guard = UsageGuard::new(
            host.clone(),
            store.clone(),
            remote.map(|r| r as Arc<dyn RemoteSyncClient>),
            clock.clone(),
        );
        Harness {
            guard,
            host,
            store,
            clock,
        }
    }

    fn stored_state(store: &MemoryStore) -> Option<DailyState> {
        store
            .get(STATE_KEY)
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    async fn ticks(guard: &UsageGuard, n: u32) {
        for _ in 0..n {
            guard.tick().await;
        }
    }

    fn self_mode() -> Value {
        json!({ "mode": "self", "dailyLimitMinutes": 60, "selfExtensionMinutes": 5 })
    }

    fn parental_mode() -> Value {
        json!({
            "mode": "parental",
            "dailyLimitMinutes": 60,
            "parentalExtensionMinutes": 10,
            "parentPinHash": HASH_1234,
        })
    }

    #[tokio::test]
    async fn test_off_mode_never_counts_or_locks() {
        let h = harness(json!({ "mode": "off" }), None);
        ticks(&h.guard, 10).await;

        let status = h.guard.status().await;
        assert_eq!(status.lock_reason, None);
        assert_eq!(status.remaining_seconds, None);
        assert_eq!(status.consumed_seconds, 0);
    }

    #[tokio::test]
    async fn test_writes_are_batched() {
        let h = harness(self_mode(), None);

        ticks(&h.guard, 4).await;
        assert!(stored_state(&h.store).is_none());

        ticks(&h.guard, 1).await;
        assert_eq!(stored_state(&h.store).unwrap().consumed_seconds, 5);

        ticks(&h.guard, 2).await;
        assert_eq!(stored_state(&h.store).unwrap().consumed_seconds, 5);

        h.guard.stop_tracking().await;
        assert_eq!(stored_state(&h.store).unwrap().consumed_seconds, 7);
    }

    #[tokio::test]
    async fn test_self_extension_scenario() {
        let h = harness(self_mode(), None);

        ticks(&h.guard, 3599).await;
        assert_eq!(h.guard.status().await.lock_reason, None);

        ticks(&h.guard, 1).await;
        let status = h.guard.status().await;
        assert_eq!(status.lock_reason, Some(LockReason::DailyLimit));
        assert!(status.self_extension_available);

        // Locked ticks do not count
        ticks(&h.guard, 10).await;
        assert_eq!(h.guard.daily_state().await.consumed_seconds, 3600);

        assert!(h.guard.apply_self_extension().await);
        let status = h.guard.status().await;
        assert_eq!(status.lock_reason, None);
        assert_eq!(status.remaining_seconds, Some(300));
        assert!(stored_state(&h.store).unwrap().self_extension_used);

        ticks(&h.guard, 299).await;
        assert_eq!(h.guard.status().await.lock_reason, None);

        ticks(&h.guard, 1).await;
        let status = h.guard.status().await;
        assert_eq!(status.lock_reason, Some(LockReason::DailyLimit));
        assert!(!status.self_extension_available);

        let before = h.guard.daily_state().await;
        assert!(!h.guard.apply_self_extension().await);
        assert_eq!(h.guard.daily_state().await, before);
    }

    #[tokio::test]
    async fn test_self_extension_requires_daily_limit_lock() {
        let h = harness(self_mode(), None);
        assert!(!h.guard.apply_self_extension().await);
        assert!(!h.guard.daily_state().await.self_extension_used);
    }

    #[tokio::test]
    async fn test_day_rollover_resets_usage() {
        let h = harness(self_mode(), None);
        ticks(&h.guard, 3600).await;
        assert!(h.guard.apply_self_extension().await);

        h.clock.advance(TimeDelta::hours(13));
        // Reads see the new day before any tick happens
        assert_eq!(h.guard.status().await.consumed_seconds, 0);

        ticks(&h.guard, 1).await;
        let state = h.guard.daily_state().await;
        assert_eq!(state.date_key, "2026-10-20");
        assert_eq!(state.consumed_seconds, 1);
        assert!(!state.self_extension_used);
    }

    #[tokio::test]
    async fn test_parental_unlock_with_correct_pin() {
        let h = harness(parental_mode(), None);
        ticks(&h.guard, 3600).await;

        let status = h.guard.status().await;
        assert_eq!(status.lock_reason, Some(LockReason::DailyLimit));
        assert!(status.parental_unlock_available);
        assert!(!status.self_extension_available);

        h.guard.unlock_with_parent_pin(" 1234 ").await.unwrap();

        let state = h.guard.daily_state().await;
        assert_eq!(state.consumed_seconds, 3000);
        assert!(!state.self_extension_used);
        assert_eq!(stored_state(&h.store).unwrap().consumed_seconds, 3000);
        assert_eq!(h.guard.status().await.remaining_seconds, Some(600));
    }

    #[tokio::test]
    async fn test_parental_unlock_rejections_change_nothing() {
        let h = harness(parental_mode(), None);
        ticks(&h.guard, 3600).await;
        let before = h.guard.daily_state().await;

        assert_eq!(
            h.guard.unlock_with_parent_pin("9999").await,
            Err(PinError::Mismatch)
        );
        assert_eq!(
            h.guard.unlock_with_parent_pin("12ab").await,
            Err(PinError::InvalidFormat)
        );
        assert_eq!(h.guard.daily_state().await, before);
    }

    #[tokio::test]
    async fn test_parental_unlock_unavailable_outside_parental_mode() {
        let mut settings = parental_mode();
        settings["mode"] = json!("self");
        let h = harness(settings, None);
        assert_eq!(
            h.guard.unlock_with_parent_pin("1234").await,
            Err(PinError::Unavailable)
        );

        let h = harness(json!({ "mode": "parental" }), None);
        assert_eq!(
            h.guard.unlock_with_parent_pin("1234").await,
            Err(PinError::Unavailable)
        );
    }

    #[tokio::test]
    async fn test_schedule_lock_reports_next_access() {
        let h = harness(
            json!({
                "mode": "self",
                "scheduleEnabled": true,
                "dailyWindows": { "monday": { "start": "18:00", "end": "20:00" } },
            }),
            None,
        );

        let status = h.guard.status().await;
        assert_eq!(status.lock_reason, Some(LockReason::Schedule));
        assert_eq!(
            status.next_access_at.map(|t| t.to_string()).as_deref(),
            Some("2026-10-19 18:00:00")
        );

        ticks(&h.guard, 3).await;
        assert_eq!(h.guard.daily_state().await.consumed_seconds, 0);
    }

    #[tokio::test]
    async fn test_settings_change_is_published() {
        let h = harness(self_mode(), None);
        let mut rx = h.guard.subscribe();
        ticks(&h.guard, 600).await;
        let _ = rx.borrow_and_update();

        h.host.replace(json!({ "usageProtection": { "mode": "self", "dailyLimitMinutes": 5 } }));
        h.guard.on_settings_changed().await;

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow().lock_reason, Some(LockReason::DailyLimit));
    }

    #[tokio::test]
    async fn test_local_state_is_loaded_on_start() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                STATE_KEY,
                r#"{"dateKey":"2026-10-19","consumedSeconds":1200,"selfExtensionUsed":true}"#,
            )
            .unwrap();

        let guard = UsageGuard::new(
            Arc::new(HostSettings::new(json!({ "usageProtection": self_mode() }))),
            store,
            None,
            Arc::new(ManualClock::new(noon())),
        );

        let state = guard.daily_state().await;
        assert_eq!(state.consumed_seconds, 1200);
        assert!(state.self_extension_used);
    }

    #[tokio::test]
    async fn test_session_merges_remote_state() {
        let remote = Arc::new(FakeRemote::serving(
            "u1",
            json!({
                "settings": { "mode": "off" },
                "state": { "dateKey": "2026-10-19", "consumedSeconds": 150, "selfExtensionUsed": true },
            }),
        ));
        let h = harness(self_mode(), Some(remote.clone()));
        ticks(&h.guard, 100).await;

        h.guard.on_session_changed(Some("u1".to_string())).await;

        let state = h.guard.daily_state().await;
        assert_eq!(state.consumed_seconds, 150);
        assert!(state.self_extension_used);
        assert_eq!(stored_state(&h.store), Some(state.clone()));

        // Local settings stay authoritative
        assert_eq!(h.guard.settings().mode, ProtectionMode::SelfManaged);

        h.guard.shutdown().await;
        let pushes = remote.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].state, state);
    }

    #[tokio::test]
    async fn test_session_reload_only_for_new_user() {
        let remote = Arc::new(FakeRemote::serving(
            "u1",
            json!({
                "settings": {},
                "state": { "dateKey": "2026-10-19", "consumedSeconds": 50 },
            }),
        ));
        let h = harness(self_mode(), Some(remote));

        h.guard.on_session_changed(Some("u1".to_string())).await;
        assert_eq!(h.guard.daily_state().await.consumed_seconds, 50);

        h.store
            .set(STATE_KEY, r#"{"dateKey":"2026-10-19","consumedSeconds":0}"#)
            .unwrap();
        h.guard.on_session_changed(None).await;
        h.guard.on_session_changed(Some("u1".to_string())).await;

        // Same user: nothing reloaded, in-memory state unchanged
        assert_eq!(h.guard.daily_state().await.consumed_seconds, 50);
    }

    #[tokio::test]
    async fn test_switching_user_fetches_and_merges_again() {
        let remote = Arc::new(FakeRemote::serving(
            "u1",
            json!({
                "settings": {},
                "state": { "dateKey": "2026-10-19", "consumedSeconds": 50 },
            }),
        ));
        remote.add_user(
            "u2",
            json!({
                "settings": {},
                "state": { "dateKey": "2026-10-19", "consumedSeconds": 400, "selfExtensionUsed": true },
            }),
        );
        let h = harness(self_mode(), Some(remote.clone()));

        h.guard.on_session_changed(Some("u1".to_string())).await;
        assert_eq!(h.guard.daily_state().await.consumed_seconds, 50);

        h.guard.on_session_changed(Some("u2".to_string())).await;
        let state = h.guard.daily_state().await;
        assert_eq!(state.consumed_seconds, 400);
        assert!(state.self_extension_used);
        assert_eq!(stored_state(&h.store), Some(state));

        assert_eq!(*remote.fetches.lock().unwrap(), vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_sign_out_during_load_discards_server_copy() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let remote = Arc::new(FakeRemote {
            gate: Some((entered.clone(), release.clone())),
            ..FakeRemote::serving(
                "u1",
                json!({
                    "settings": {},
                    "state": { "dateKey": "2026-10-19", "consumedSeconds": 900, "selfExtensionUsed": true },
                }),
            )
        });
        let h = harness(self_mode(), Some(remote.clone()));
        ticks(&h.guard, 10).await;

        let guard = Arc::new(h.guard);
        let loading = tokio::spawn({
            let guard = guard.clone();
            async move { guard.on_session_changed(Some("u1".to_string())).await }
        });

        // The fetch is in progress when the user signs out
        entered.notified().await;
        guard.on_session_changed(None).await;
        release.notify_one();
        loading.await.unwrap();

        let state = guard.daily_state().await;
        assert_eq!(state.consumed_seconds, 10);
        assert!(!state.self_extension_used);
        assert_eq!(stored_state(&h.store).unwrap().consumed_seconds, 10);
        assert_eq!(*remote.fetches.lock().unwrap(), vec!["u1"]);
        assert!(remote.pushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_remote_state_is_ignored() {
        let remote = Arc::new(FakeRemote::serving(
            "u1",
            json!({
                "settings": {},
                "state": { "dateKey": "2026-10-18", "consumedSeconds": 9000, "selfExtensionUsed": true },
            }),
        ));
        let h = harness(self_mode(), Some(remote));
        ticks(&h.guard, 10).await;

        h.guard.on_session_changed(Some("u1".to_string())).await;

        let state = h.guard.daily_state().await;
        assert_eq!(state.consumed_seconds, 10);
        assert!(!state.self_extension_used);
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_local_state() {
        let remote = Arc::new(FakeRemote {
            fail: true,
            ..Default::default()
        });
        let h = harness(self_mode(), Some(remote));
        ticks(&h.guard, 42).await;

        h.guard.on_session_changed(Some("u1".to_string())).await;
        assert_eq!(h.guard.daily_state().await.consumed_seconds, 42);

        ticks(&h.guard, 1).await;
        assert_eq!(h.guard.daily_state().await.consumed_seconds, 43);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_runs_only_while_tracking_and_visible() {
        let h = harness(self_mode(), None);
        assert!(!h.guard.is_ticking().await);

        h.guard.start_tracking().await;
        assert!(h.guard.is_ticking().await);
        tokio::time::sleep(std::time::Duration::from_millis(3500)).await;
        assert_eq!(h.guard.daily_state().await.consumed_seconds, 3);

        h.guard.set_visible(false).await;
        assert!(!h.guard.is_ticking().await);
        // Hiding flushes pending writes
        assert_eq!(stored_state(&h.store).unwrap().consumed_seconds, 3);

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert_eq!(h.guard.daily_state().await.consumed_seconds, 3);

        h.guard.set_visible(true).await;
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        assert_eq!(h.guard.daily_state().await.consumed_seconds, 5);

        h.guard.stop_tracking().await;
        assert!(!h.guard.is_ticking().await);
        assert_eq!(stored_state(&h.store).unwrap().consumed_seconds, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_off_stops_ticker() {
        let h = harness(self_mode(), None);
        h.guard.start_tracking().await;
        assert!(h.guard.is_ticking().await);

        h.host.replace(json!({ "usageProtection": { "mode": "off" } }));
        h.guard.on_settings_changed().await;
        assert!(!h.guard.is_ticking().await);

        h.host.replace(json!({ "usageProtection": self_mode() }));
        h.guard.on_settings_changed().await;
        assert!(h.guard.is_ticking().await);
    }
}
