//! Periodic and on-request housekeeping: state backups, rule hit-count reports and
//! the declared-message window.

use crate::bus::SignalBus;
use crate::entities::SECTION_NAMES;
use crate::error::VigilResult;
use crate::rules::table_blob_name;
use crate::transport::Attachment;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

async fn send_backup(bus: &SignalBus, name: &str, blob: VigilResult<Vec<u8>>) -> VigilResult<()> {
    let ctx = bus.context();
    let sealed = ctx.cipher.seal_bytes(&blob?)?;
    let to = [ctx.config.backup_receiver.clone()];
    bus.emit(&to, "backup", "data", json!(name), Some(Attachment::new(name, sealed)))
        .await
}

/// Send every persisted blob (entity sections, then rule tables) to the backup receiver.
/// Returns the number sent.
pub async fn backup_all(bus: &SignalBus) -> usize {
    let ctx = bus.context();
    let mut sent = 0;

    for name in SECTION_NAMES {
        match send_backup(bus, name, ctx.entities.export(name)).await {
            Ok(()) => sent += 1,
            Err(e) => tracing::warn!(target: "vigil::maintenance", blob = name, error = %e, "backup failed"),
        }
    }
    for category in ctx.rules.categories() {
        let name = table_blob_name(&category);
        match send_backup(bus, &name, ctx.rules.export(&category)).await {
            Ok(()) => sent += 1,
            Err(e) => tracing::warn!(target: "vigil::maintenance", blob = %name, error = %e, "backup failed"),
        }
    }

    tracing::info!(target: "vigil::maintenance", sent, "backup finished");
    sent
}

/// Report hit counts accumulated since the last report to the regex receiver, one
/// sealed `{pattern: count}` table per category. Counts are marked reported only after
/// they were handed to the transport. Returns the number of categories reported.
pub async fn report_rule_counts(bus: &SignalBus) -> usize {
    let ctx = bus.context();
    let to = [ctx.config.regex_receiver.clone()];
    let mut reported = 0;

    for category in ctx.rules.categories() {
        let result: VigilResult<bool> = async {
            let counts = ctx.rules.unreported(&category)?;
            if counts.is_empty() {
                return Ok(false);
            }
            let name = format!("{}_words", category);
            let sealed = ctx.cipher.seal_bytes(&serde_json::to_vec(&counts)?)?;
            bus.emit(&to, "regex", "count", json!(name), Some(Attachment::new(name.clone(), sealed)))
                .await?;
            ctx.rules.mark_reported(&category, &counts)?;
            Ok(true)
        }
        .await;

        match result {
            Ok(true) => reported += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(target: "vigil::maintenance", category = %category, error = %e, "hit count report failed");
            }
        }
    }

    tracing::debug!(target: "vigil::maintenance", reported, "hit counts reported");
    reported
}

/// Run backups and declared-window resets on their configured intervals.
pub fn spawn_maintenance(bus: Arc<SignalBus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cfg = &bus.context().config;
        let mut backup = tokio::time::interval(Duration::from_secs(cfg.backup_interval_secs.max(1)));
        let mut reset = tokio::time::interval(Duration::from_secs(cfg.declared_reset_secs.max(1)));
        // Both intervals fire immediately; skip that first tick.
        backup.tick().await;
        reset.tick().await;

        loop {
            tokio::select! {
                _ = backup.tick() => {
                    backup_all(&bus).await;
                }
                _ = reset.tick() => {
                    if let Err(e) = bus.context().entities.reset_declared() {
                        tracing::warn!(target: "vigil::maintenance", error = %e, "declared window not reset");
                    } else {
                        tracing::debug!(target: "vigil::maintenance", "declared window reset");
                    }
                }
            }
        }
    })
}
