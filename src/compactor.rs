use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Rewrite the log once it has grown `threshold` appends past the last
/// snapshot. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Per-tenant background task. Runs until the engine's last owner drops it.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if Arc::strong_count(&engine) == 1 {
            debug!("engine dropped, compactor exiting");
            return;
        }
        compact_if_due(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{NaiveTime, Weekday};
    use ulid::Ulid;

    use super::*;
    use crate::engine::EngineSettings;
    use crate::model::Slot;
    use crate::notify::NotifyHub;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str) -> Engine {
        Engine::new(
            test_wal_path(name),
            Arc::new(NotifyHub::logging()),
            EngineSettings::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let engine = engine("threshold.wal");
        let pid = Ulid::new();
        engine.create_provider(pid, None).await.unwrap();
        let slot = Slot::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
        );
        for _ in 0..5 {
            engine
                .set_template_day(pid, Weekday::Fri, vec![slot])
                .await
                .unwrap();
        }

        assert!(!compact_if_due(&engine, 100).await);
        assert_eq!(engine.wal_appends_since_compact().await, 6);

        assert!(compact_if_due(&engine, 6).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(
            engine.get_template(pid).await.unwrap().day(Weekday::Fri),
            &[slot]
        );
        // Nothing new since: not due again
        assert!(!compact_if_due(&engine, 1).await);
    }
}
