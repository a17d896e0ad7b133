use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use usage_protection::config::HostConfig;
use usage_protection::platform::common::atomic_write;
use usage_protection::protection::settings::{load_settings_document, EXAMPLE_SETTINGS};
use usage_protection::protection::{
    FileStore, HostSettings, HttpSyncClient, PinVerifier, RemoteSyncClient, SystemClock, UsageGuard,
};

use super::utils::{describe_lock, format_seconds, print_status};

/// Engine wired to the host's files
struct Host {
    guard: UsageGuard,
    settings: Arc<HostSettings>,
    user_id: Option<String>,
}

impl Host {
    fn open(config: &HostConfig) -> Result<Self> {
        let settings = Arc::new(HostSettings::new(read_settings(&config.settings.path)));
        let store = Arc::new(FileStore::new(&config.storage.data_dir));

        let remote: Option<Arc<dyn RemoteSyncClient>> = match &config.remote {
            Some(remote) => Some(Arc::new(
                HttpSyncClient::new(remote.client.clone()).context("Invalid remote configuration")?,
            )),
            None => None,
        };
        let user_id = config.remote.as_ref().and_then(|r| r.user_id.clone());

        let guard = UsageGuard::new(settings.clone(), store, remote, Arc::new(SystemClock));

        Ok(Self {
            guard,
            settings,
            user_id,
        })
    }

    /// Bring in the server copy for the configured user, if any
    async fn sign_in(&self) {
        if self.user_id.is_some() {
            self.guard.on_session_changed(self.user_id.clone()).await;
        }
    }

    async fn reload_settings(&self, path: &Path) {
        let document = match load_settings_document(path) {
            Ok(document) => document,
            Err(e) => {
                warn!("Keeping previous settings: {:#}", e);
                return;
            }
        };

        if self.settings.replace(document) {
            info!("Settings reloaded from {}", path.display());
            self.guard.on_settings_changed().await;
        }
    }
}

/// A missing or unreadable settings file means protection is off
fn read_settings(path: &Path) -> Value {
    match load_settings_document(path) {
        Ok(document) => document,
        Err(e) => {
            warn!("{:#}; usage protection stays off", e);
            Value::Null
        }
    }
}

/// Write an example host config and settings file
pub fn init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse --force to overwrite",
            config_path.display()
        );
    }

    let config = HostConfig::default();
    config.save(config_path)?;
    println!("✓ Created host configuration: {}", config_path.display());

    let settings_path = &config.settings.path;
    if settings_path.exists() && !force {
        println!("  Keeping existing settings file: {}", settings_path.display());
    } else {
        atomic_write(settings_path, EXAMPLE_SETTINGS.as_bytes())?;
        println!("✓ Created example settings: {}", settings_path.display());
    }

    println!("\nEdit the settings file to choose a mode, a daily limit and a schedule.");
    println!("To require a parental PIN, store the output of:");
    println!("  usage-protection hash-pin <PIN>");
    println!("as `parentPinHash`, then start tracking with: usage-protection run");

    Ok(())
}

/// Print the hash of a new parental PIN
pub fn hash_pin(pin: &str) -> Result<()> {
    let hash = PinVerifier::hash_new_pin(pin)?;
    println!("{}", hash);
    Ok(())
}

/// Show today's usage and lock state.
///
/// Only reads the local record, so it is safe next to a running `run`.
pub async fn status(config: HostConfig, json: bool) -> Result<()> {
    let host = Host::open(&config)?;

    let status = host.guard.status().await;
    if json {
        let output = serde_json::to_string_pretty(&status).context("Failed to serialize status")?;
        println!("{}", output);
    } else {
        print_status(&status);
    }

    Ok(())
}

/// Use today's self-extension
pub async fn extend(config: HostConfig) -> Result<()> {
    let host = Host::open(&config)?;
    host.sign_in().await;

    let minutes = host.guard.settings().self_extension_minutes;
    let applied = host.guard.apply_self_extension().await;
    host.guard.shutdown().await;

    if !applied {
        anyhow::bail!("No extension available (self mode only, once per day, after the daily limit is reached)");
    }

    println!("✓ Added {} minutes for today", minutes);
    Ok(())
}

/// Return parental extension time to today's budget
pub async fn unlock(config: HostConfig, pin: String) -> Result<()> {
    let host = Host::open(&config)?;
    host.sign_in().await;

    let minutes = host.guard.settings().parental_extension_minutes;
    let result = host.guard.unlock_with_parent_pin(&pin).await;
    host.guard.shutdown().await;
    result?;

    println!("✓ Added {} minutes for today", minutes);
    Ok(())
}

/// Track usage in the foreground until Ctrl-C.
///
/// Lines on stdin act as host UI events: `status`, `extend`,
/// `unlock <PIN>`, `hide` and `show`.
pub async fn run(config: HostConfig) -> Result<()> {
    let host = Host::open(&config)?;
    host.sign_in().await;

    let mut status_rx = host.guard.subscribe();
    let mut last_reason = status_rx.borrow_and_update().lock_reason;
    println!("{}", describe_lock(&host.guard.status().await));

    host.guard.start_tracking().await;
    info!("Tracking usage (settings: {})", config.settings.path.display());

    let mut reload = tokio::time::interval(Duration::from_secs(config.settings.reload_interval));
    reload.set_missed_tick_behavior(MissedTickBehavior::Skip);
    reload.tick().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down");
                break;
            }
            _ = reload.tick() => {
                host.reload_settings(&config.settings.path).await;
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                if status.lock_reason != last_reason {
                    last_reason = status.lock_reason;
                    println!("{}", describe_lock(&status));
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => handle_command(&host, line.trim()).await,
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("Stopped reading commands: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    host.guard.shutdown().await;
    let state = host.guard.daily_state().await;
    println!("Used today: {}", format_seconds(state.consumed_seconds));

    Ok(())
}

async fn handle_command(host: &Host, line: &str) {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (None, _) => {}
        (Some("status"), _) => print_status(&host.guard.status().await),
        (Some("extend"), _) => {
            if host.guard.apply_self_extension().await {
                println!("✓ Extension applied");
            } else {
                println!("No extension available");
            }
        }
        (Some("unlock"), Some(pin)) => match host.guard.unlock_with_parent_pin(pin).await {
            Ok(()) => println!("✓ Parental time added"),
            Err(e) => println!("Unlock refused: {}", e),
        },
        (Some("hide"), _) => host.guard.set_visible(false).await,
        (Some("show"), _) => host.guard.set_visible(true).await,
        (Some(other), _) => {
            println!("Unknown command: {} (status, extend, unlock <PIN>, hide, show)", other);
        }
    }
}
