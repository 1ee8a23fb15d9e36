use chrono::{DateTime, Utc};
use slotwarden_common::{RunId, SlotId, WorkerRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::SharedState;
use crate::clock::Clock;
use crate::errors::StoreError;
use crate::store::SlotStore;

/// Writes the worker document on a fixed interval, whatever the phase.
pub struct HeartbeatPublisher {
    store: SlotStore,
    slot: SlotId,
    run_id: RunId,
    pid: u32,
    started_at: DateTime<Utc>,
    state: SharedState,
    clock: Arc<dyn Clock>,
    last_claims: u64,
    last_at: DateTime<Utc>,
}

impl HeartbeatPublisher {
    pub fn new(
        store: SlotStore,
        slot: SlotId,
        run_id: RunId,
        state: SharedState,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            store,
            slot,
            run_id,
            pid: std::process::id(),
            started_at: now,
            state,
            clock,
            last_claims: 0,
            last_at: now,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Publish one heartbeat, updating throughput from the claims made since
    /// the previous one.
    pub async fn publish(&mut self) -> Result<WorkerRecord, StoreError> {
        let now = self.clock.now();
        let record = {
            let mut state = self.state.lock().await;
            let claims = state.metrics.claimed_total;
            let secs = (now - self.last_at).num_milliseconds() as f64 / 1000.0;
            if secs > 0.0 {
                let per_minute = claims.saturating_sub(self.last_claims) as f64 * 60.0 / secs;
                state.metrics.throughput = (per_minute * 100.0).round() / 100.0;
                self.last_claims = claims;
                self.last_at = now;
            }
            WorkerRecord {
                run_id: Some(self.run_id),
                pid: Some(self.pid),
                started_at: Some(self.started_at),
                last_heartbeat: Some(now),
                phase: state.phase,
                metrics: state.metrics.clone(),
                stop_reason: state.stop_reason.clone(),
            }
        };
        self.store.write_worker(&self.slot, &record)?;
        Ok(record)
    }

    /// Publish every `every` until `stop` flips, then hand the publisher back
    /// for the final heartbeat.
    pub fn spawn(mut self, every: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<Self> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.publish().await {
                            tracing::warn!(slot = %self.slot, error = %e, "Failed to publish heartbeat");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::worker::WorkerState;
    use slotwarden_common::{Phase, SlotConfig};
    use tokio::sync::Mutex;

    fn setup() -> (tempfile::TempDir, SlotStore, SlotId) {
        let dir = tempfile::tempdir().unwrap();
        let store = SlotStore::new(dir.path());
        let slot = SlotId::new("slot_hb").unwrap();
        store.provision(&slot, SlotConfig::default()).unwrap();
        (dir, store, slot)
    }

    #[tokio::test]
    async fn test_publish_writes_phase_and_throughput() {
        let (_dir, store, slot) = setup();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let state = Arc::new(Mutex::new(WorkerState::default()));
        let run_id = RunId::new();
        let mut publisher =
            HeartbeatPublisher::new(store.clone(), slot.clone(), run_id, state.clone(), clock.clone());

        let first = publisher.publish().await.unwrap();
        assert_eq!(first.phase, Phase::Booting);
        assert_eq!(first.metrics.throughput, 0.0);

        {
            let mut s = state.lock().await;
            s.phase = Phase::Scanning;
            s.metrics.claimed_total = 3;
        }
        clock.advance(Duration::from_secs(30));
        let second = publisher.publish().await.unwrap();
        assert_eq!(second.phase, Phase::Scanning);
        assert_eq!(second.metrics.throughput, 6.0);

        let on_disk = store.read_worker(&slot).unwrap().unwrap();
        assert_eq!(on_disk.heartbeat_for(Some(run_id)), second.last_heartbeat);
        assert_eq!(on_disk.pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn test_spawned_publisher_stops_on_signal() {
        let (_dir, store, slot) = setup();
        let state = Arc::new(Mutex::new(WorkerState::default()));
        let publisher = HeartbeatPublisher::new(
            store.clone(),
            slot.clone(),
            RunId::new(),
            state,
            Arc::new(crate::clock::SystemClock),
        );
        let (tx, rx) = watch::channel(false);
        let handle = publisher.spawn(Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let mut publisher = handle.await.unwrap();
        assert!(store.read_worker(&slot).unwrap().is_some());
        publisher.publish().await.unwrap();
    }
}
