//! Background auto-update scheduler.
//!
//! Runs periodic checks independently of foreground requests. Checking is
//! read-only and takes no lock; applying goes through
//! [`Session::apply_updates`] and therefore serializes behind the same
//! per-installation lock as everything else, so a foreground install and a
//! background update never interleave writes.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use modwright_schema::ModId;

use crate::ops::Session;

/// Handle to a running scheduler task.
#[derive(Debug)]
pub struct AutoUpdateScheduler {
    handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl AutoUpdateScheduler {
    /// Start checking `session` every `period`, applying updates for mods
    /// with auto-update enabled.
    pub fn spawn(session: Arc<Session>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh session
            // does not race its own startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        run_once(&session, &task_cancel).await;
                    }
                }
            }
        });
        Self { handle, cancel }
    }

    /// Signal the scheduler to stop after the current iteration.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run_once(session: &Session, cancel: &CancellationToken) {
    let available = match session.check_updates().await {
        Ok(available) => available,
        Err(err) => {
            tracing::warn!(%err, "scheduled update check failed");
            return;
        }
    };
    if available.is_empty() {
        return;
    }

    let auto_ids: Vec<ModId> = {
        let records = session.list().await;
        available
            .iter()
            .filter(|u| {
                records.iter().any(|r| {
                    r.installed.id() == &u.id
                        && r.settings.auto_update
                        && r.installed.enabled
                })
            })
            .map(|u| u.id.clone())
            .collect()
    };
    if auto_ids.is_empty() {
        tracing::debug!(
            count = available.len(),
            "updates available, none auto-update enabled"
        );
        return;
    }

    tracing::info!(count = auto_ids.len(), "applying scheduled updates");
    match session.apply_updates(Some(&auto_ids), cancel).await {
        Ok(reports) => {
            for report in &reports {
                for warning in &report.warnings {
                    tracing::warn!(warning = warning.description.as_str(), "update warning");
                }
            }
        }
        Err(err) => tracing::error!(%err, "scheduled update failed"),
    }
}
