use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protection::remote::{RemotePayload, RemoteSnapshot, RemoteSyncClient};
use crate::protection::settings::Settings;
use crate::protection::state::{DailyState, STATE_KEY};
use crate::protection::store::KeyValueStore;

/// Minimum spacing between remote sync attempts
pub const REMOTE_SYNC_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Default)]
struct RemoteSlot {
    last_attempt: Option<Instant>,
    /// A sync was refused by the rate limit and nothing was sent since
    deferred: bool,
    in_flight: Vec<JoinHandle<()>>,
}

/// Local write-through plus best-effort, rate-limited remote sync
pub struct PersistenceSync {
    store: Arc<dyn KeyValueStore>,
    remote: Option<Arc<dyn RemoteSyncClient>>,
    min_interval: Duration,
    slot: Mutex<RemoteSlot>,
}

impl PersistenceSync {
    pub fn new(store: Arc<dyn KeyValueStore>, remote: Option<Arc<dyn RemoteSyncClient>>) -> Self {
        Self {
            store,
            remote,
            min_interval: REMOTE_SYNC_INTERVAL,
            slot: Mutex::new(RemoteSlot::default()),
        }
    }

    /// Read the local record, normalized for `today`'s date key fallback.
    /// Missing or unreadable records yield `None`.
    pub fn load_local(&self, today: &str) -> Option<DailyState> {
        match self.store.get(STATE_KEY) {
            Ok(raw) => raw.map(|raw| DailyState::from_json(&raw, today)),
            Err(e) => {
                tracing::warn!("Failed to read local usage state: {:#}", e);
                None
            }
        }
    }

    /// Write the state to the local store. Failures are logged; the caller's
    /// in-memory copy stays authoritative either way.
    pub fn save_local(&self, state: &DailyState) {
        match self.store.set(STATE_KEY, &state.to_json()) {
            Ok(()) => tracing::debug!(
                "Saved usage state {} ({}s)",
                state.date_key,
                state.consumed_seconds
            ),
            Err(e) => tracing::warn!("Failed to save usage state: {:#}", e),
        }
    }

    /// Start a remote sync for `user_id` unless one was attempted within the
    /// rate-limit interval, in which case it is deferred until
    /// [`PersistenceSync::drain`]. Push failures are logged and dropped.
    pub fn sync_remote(&self, user_id: Option<&str>, settings: &Settings, state: &DailyState) {
        let (Some(remote), Some(user_id)) = (self.remote.clone(), user_id) else {
            return;
        };

        let mut slot = self.lock_slot();
        let now = Instant::now();

        if let Some(previous) = slot.last_attempt {
            if now.duration_since(previous) < self.min_interval {
                tracing::trace!("Remote sync deferred (rate limited)");
                slot.deferred = true;
                return;
            }
        }

        slot.last_attempt = Some(now);
        slot.deferred = false;
        slot.in_flight.retain(|handle| !handle.is_finished());

        let user_id = user_id.to_string();
        let payload = RemotePayload {
            settings: settings.clone(),
            state: state.clone(),
        };

        slot.in_flight.push(tokio::spawn(async move {
            if let Err(e) = remote.push(&user_id, &payload).await {
                tracing::debug!("Remote usage sync failed: {:#}", e);
            }
        }));
    }

    /// Wait for every push started so far
    pub async fn wait_for_pushes(&self) {
        let handles = std::mem::take(&mut self.lock_slot().in_flight);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::debug!("Remote sync task did not complete: {}", e);
            }
        }
    }

    /// Finish all remote work before the host exits.
    ///
    /// Waits for in-flight pushes, then sends `state` if a sync was deferred
    /// by the rate limit. That last push still honors the interval.
    pub async fn drain(&self, user_id: Option<&str>, settings: &Settings, state: &DailyState) {
        self.wait_for_pushes().await;

        let ready_at = {
            let slot = self.lock_slot();
            match (slot.deferred, slot.last_attempt) {
                (true, Some(last)) => Some(last + self.min_interval),
                _ => None,
            }
        };

        if let Some(ready_at) = ready_at {
            tracing::debug!("Waiting for the rate limit to send the final sync");
            tokio::time::sleep_until(ready_at).await;
            self.sync_remote(user_id, settings, state);
            self.wait_for_pushes().await;
        }
    }

    /// Fetch the server copy. Network failures are logged and yield `None`.
    pub async fn fetch_remote(&self, user_id: &str) -> Option<RemoteSnapshot> {
        let remote = self.remote.as_ref()?;
        match remote.fetch(user_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!("Remote usage fetch failed: {:#}", e);
                None
            }
        }
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, RemoteSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}
