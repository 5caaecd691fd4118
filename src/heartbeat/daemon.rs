//! Heartbeat Daemon
//!
//! Runs a background loop that checks cron schedules and executes due
//! heartbeat tasks. Uses `tokio::time::interval` for the tick loop and
//! `Arc<AtomicBool>` for graceful shutdown signaling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::tasks::{execute_task, HeartbeatContext};

/// One scheduled periodic job.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatEntry {
    pub name: String,
    /// Six-field cron expression (seconds first).
    pub schedule: String,
    pub task: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
}

/// The built-in schedule: hourly discovery refresh, six-hourly prune.
pub fn default_entries() -> Vec<HeartbeatEntry> {
    vec![
        HeartbeatEntry {
            name: "refresh_models".to_string(),
            schedule: "0 0 * * * *".to_string(),
            task: "refresh_models".to_string(),
            enabled: true,
            last_run: None,
        },
        HeartbeatEntry {
            name: "prune_dead_children".to_string(),
            schedule: "0 0 */6 * * *".to_string(),
            task: "prune_dead_children".to_string(),
            enabled: true,
            last_run: None,
        },
    ]
}

/// Options for creating a heartbeat daemon.
pub struct HeartbeatDaemonOptions {
    /// Tick interval in seconds. Defaults to 30.
    pub tick_interval_secs: u64,
    pub entries: Vec<HeartbeatEntry>,
}

impl Default for HeartbeatDaemonOptions {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            entries: default_entries(),
        }
    }
}

/// The heartbeat daemon. Owns one background tokio task that ticks at
/// the configured interval and executes due entries.
pub struct HeartbeatDaemon {
    running: Arc<AtomicBool>,
    interval_handle: Option<JoinHandle<()>>,
    tick_interval_secs: u64,
    entries: Arc<tokio::sync::RwLock<Vec<HeartbeatEntry>>>,
}

pub fn create_heartbeat_daemon(options: HeartbeatDaemonOptions) -> HeartbeatDaemon {
    HeartbeatDaemon {
        running: Arc::new(AtomicBool::new(false)),
        interval_handle: None,
        tick_interval_secs: options.tick_interval_secs,
        entries: Arc::new(tokio::sync::RwLock::new(options.entries)),
    }
}

impl HeartbeatDaemon {
    /// Start the background loop.
    pub fn start(&mut self, ctx: Arc<HeartbeatContext>) {
        if self.running.load(Ordering::SeqCst) {
            warn!("heartbeat daemon is already running");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        info!(
            tick_secs = self.tick_interval_secs,
            "starting heartbeat daemon"
        );

        let running = Arc::clone(&self.running);
        let entries = Arc::clone(&self.entries);
        let tick_secs = self.tick_interval_secs;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));

            loop {
                interval.tick().await;

                if !running.load(Ordering::SeqCst) {
                    info!("heartbeat daemon stopping");
                    break;
                }

                tick(&entries, &ctx).await;
            }
        });

        self.interval_handle = Some(handle);
    }

    /// Stop the daemon gracefully.
    pub fn stop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("heartbeat daemon is not running");
            return;
        }

        info!("stopping heartbeat daemon");
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.interval_handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Whether an entry is due based on its cron schedule and last run.
pub fn is_due(entry: &HeartbeatEntry) -> bool {
    if !entry.enabled {
        return false;
    }

    let schedule: Schedule = match entry.schedule.parse() {
        Ok(s) => s,
        Err(e) => {
            warn!(
                entry = %entry.name,
                schedule = %entry.schedule,
                error = %e,
                "invalid cron schedule"
            );
            return false;
        }
    };

    let now = Utc::now();

    if let Some(ref last_run_str) = entry.last_run {
        if let Ok(last_run) = last_run_str.parse::<chrono::DateTime<Utc>>() {
            if let Some(next) = schedule.after(&last_run).next() {
                return now >= next;
            }
        }
    }

    // Never run before: due immediately.
    true
}

/// One tick: run every due entry and stamp its last run.
async fn tick(entries: &tokio::sync::RwLock<Vec<HeartbeatEntry>>, ctx: &HeartbeatContext) {
    let current_entries = entries.read().await.clone();
    let mut executed: Vec<String> = Vec::new();

    for entry in &current_entries {
        if !is_due(entry) {
            continue;
        }
        info!(entry = %entry.name, "executing heartbeat task");
        match execute_task(&entry.task, ctx).await {
            Ok(()) => executed.push(entry.name.clone()),
            Err(e) => {
                error!(entry = %entry.name, error = %e, "heartbeat task failed");
                // Stamp failures too so a broken task does not spin.
                executed.push(entry.name.clone());
            }
        }
    }

    if !executed.is_empty() {
        let now = Utc::now().to_rfc3339();
        let mut writable = entries.write().await;
        for entry in writable.iter_mut() {
            if executed.contains(&entry.name) {
                entry.last_run = Some(now.clone());
            }
        }
    }
}
