use chrono::NaiveDateTime;

use usage_protection::protection::{LockReason, ProtectionStatus};

/// Initialize logging on stderr, keeping stdout for command output.
/// `RUST_LOG` wins over the configured level.
pub fn init_logging(verbose: bool, level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if verbose { "debug" } else { level };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Format a number of seconds for display, e.g. `1h 05m` or `42s`
pub fn format_seconds(seconds: u32) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

fn format_instant(at: NaiveDateTime) -> String {
    at.format("%a %H:%M").to_string()
}

/// One-line summary of a status, for the `run` loop
pub fn describe_lock(status: &ProtectionStatus) -> String {
    if !status.is_locked() {
        return match status.remaining_seconds {
            Some(remaining) => format!("✓ Unlocked, {} left today", format_seconds(remaining)),
            None => "✓ Usage protection is off".to_string(),
        };
    }

    match (status.lock_reason, status.next_access_at) {
        (Some(LockReason::Schedule), Some(at)) => {
            format!("🔒 Locked by schedule until {}", format_instant(at))
        }
        (Some(LockReason::Schedule), None) => "🔒 Locked by schedule".to_string(),
        _ => "🔒 Daily limit reached".to_string(),
    }
}

/// Multi-line status report for the `status` command
pub fn print_status(status: &ProtectionStatus) {
    println!("\n=== Usage Protection Status ===\n");
    println!("Date: {}", status.date_key);
    println!("Used today: {}", format_seconds(status.consumed_seconds));
    match status.remaining_seconds {
        Some(remaining) => println!("Remaining: {}", format_seconds(remaining)),
        None => println!("Remaining: unlimited (protection off)"),
    }
    println!("Status: {}", describe_lock(status));

    if status.self_extension_available {
        println!("\nA one-time extension is available: usage-protection extend");
    }
    if status.parental_unlock_available {
        println!("\nA parent can add time: usage-protection unlock --pin <PIN>");
    }
    println!();
}
