use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that periodically re-derives each slot's `available`
/// counter from its booking records and repairs any drift. A cancelled
/// booking whose units were never released would otherwise shrink
/// effective capacity forever; this sweep is the active guard against it.
pub async fn run_reconciler(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        for (slot_id, _expected) in engine.collect_drift() {
            match engine.repair_slot(slot_id).await {
                Some((before, after)) => {
                    info!("reconciled slot {slot_id}: available {before} -> {after}")
                }
                // A concurrent mutation already settled the counter — fine
                None => tracing::debug!("reconciler: slot {slot_id} settled on its own"),
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} appends"),
                Err(e) => tracing::error!("WAL compaction failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::FanoutHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("paddock_test_reconcile");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn admin() -> Identity {
        Identity {
            id: "ops".into(),
            role: Role::Admin,
        }
    }

    #[tokio::test]
    async fn drift_is_detected_and_repaired() {
        let path = test_wal_path("drift_repair.wal");
        let notify = Arc::new(FanoutHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        let slot_id = Ulid::new();
        engine
            .create_slot(
                Some(&admin()),
                slot_id,
                "GP heat".into(),
                1_700_000_000_000,
                4,
                Money::from_cents(2000),
            )
            .await
            .unwrap();

        // Sabotage the derived counter to simulate a lost release.
        {
            let rs = engine.get_slot(&slot_id).unwrap();
            rs.write().await.available = 1;
        }

        let drifted = engine.collect_drift();
        assert_eq!(drifted.len(), 1);
        assert_eq!(drifted[0], (slot_id, 4));

        let repaired = engine.repair_slot(slot_id).await;
        assert_eq!(repaired, Some((1, 4)));

        assert!(engine.collect_drift().is_empty());
        let info = engine.availability(slot_id).await.unwrap();
        assert_eq!(info.available, 4);
    }

    #[tokio::test]
    async fn consistent_slot_is_left_alone() {
        let path = test_wal_path("no_drift.wal");
        let notify = Arc::new(FanoutHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        let slot_id = Ulid::new();
        engine
            .create_slot(
                Some(&admin()),
                slot_id,
                "GP heat".into(),
                1_700_000_000_000,
                4,
                Money::from_cents(2000),
            )
            .await
            .unwrap();

        assert!(engine.collect_drift().is_empty());
        assert_eq!(engine.repair_slot(slot_id).await, None);
    }
}
