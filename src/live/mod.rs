//! Live per-event totals.
//!
//! Each event gets one tally behind an async mutex (the single writer) and one `watch`
//! channel. Subscribers only ever see the latest snapshot; a slow dashboard skips
//! intermediate values instead of stalling the scan path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Attendance, ScanResult};
use crate::store::{AttendanceStore, EventCounts, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultTotals {
    pub valid: u64,
    pub duplicate: u64,
    /// Rejections of any kind, revoked and expired included.
    pub invalid: u64,
}

impl ResultTotals {
    fn add(&mut self, result: ScanResult, count: u64) {
        match result {
            ScanResult::Valid => self.valid += count,
            ScanResult::Duplicate => self.duplicate += count,
            ScanResult::Invalid | ScanResult::Revoked | ScanResult::Expired => {
                self.invalid += count
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.valid + self.duplicate + self.invalid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointTotals {
    pub checkpoint_id: Option<Uuid>,
    #[serde(flatten)]
    pub totals: ResultTotals,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotalsSnapshot {
    pub event_id: Uuid,
    /// Bumped on every change; doubles as the SSE event id.
    pub sequence: u64,
    pub generated_at: DateTime<Utc>,
    pub last_change_at: Option<DateTime<Utc>>,
    pub totals: ResultTotals,
    pub checkpoints: Vec<CheckpointTotals>,
}

impl TotalsSnapshot {
    fn empty(event_id: Uuid) -> Self {
        Self {
            event_id,
            sequence: 0,
            generated_at: Utc::now(),
            last_change_at: None,
            totals: ResultTotals::default(),
            checkpoints: Vec::new(),
        }
    }
}

/// How long a failed seed blocks further attempts for the same event.
const SEED_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Tally {
    /// Records up to this sequence were already counted by the seed query.
    seeded_through: i64,
    sequence: u64,
    last_change_at: Option<DateTime<Utc>>,
    totals: ResultTotals,
    checkpoints: BTreeMap<Option<Uuid>, ResultTotals>,
}

impl Tally {
    /// `floor` is the last published sequence; a reseed never moves below it.
    fn seeded(counts: EventCounts, floor: u64) -> Self {
        let mut tally = Self {
            seeded_through: counts.max_seq,
            sequence: u64::try_from(counts.max_seq).unwrap_or_default().max(floor),
            last_change_at: None,
            totals: ResultTotals::default(),
            checkpoints: BTreeMap::new(),
        };
        for row in counts.rows {
            tally.add(row.checkpoint_id, row.result, row.count);
        }
        tally
    }

    fn add(&mut self, checkpoint_id: Option<Uuid>, result: ScanResult, count: u64) {
        self.totals.add(result, count);
        self.checkpoints
            .entry(checkpoint_id)
            .or_default()
            .add(result, count);
    }

    fn snapshot(&self, event_id: Uuid) -> TotalsSnapshot {
        TotalsSnapshot {
            event_id,
            sequence: self.sequence,
            generated_at: Utc::now(),
            last_change_at: self.last_change_at,
            totals: self.totals,
            checkpoints: self
                .checkpoints
                .iter()
                .map(|(checkpoint_id, totals)| CheckpointTotals {
                    checkpoint_id: *checkpoint_id,
                    totals: *totals,
                })
                .collect(),
        }
    }
}

#[derive(Default)]
struct FeedState {
    tally: Option<Tally>,
    retry_seed_at: Option<Instant>,
}

struct EventFeed {
    state: Mutex<FeedState>,
    /// Set when an update was dropped; the next holder of `state` reseeds.
    stale: AtomicBool,
    sender: watch::Sender<Arc<TotalsSnapshot>>,
}

pub struct TotalsBroadcaster {
    attendances: Arc<dyn AttendanceStore>,
    store_timeout: Duration,
    feeds: DashMap<Uuid, Arc<EventFeed>>,
}

impl TotalsBroadcaster {
    pub fn new(attendances: Arc<dyn AttendanceStore>, store_timeout: Duration) -> Self {
        Self {
            attendances,
            store_timeout,
            feeds: DashMap::new(),
        }
    }

    fn feed(&self, event_id: Uuid) -> Arc<EventFeed> {
        self.feeds
            .entry(event_id)
            .or_insert_with(|| {
                let (sender, _) = watch::channel(Arc::new(TotalsSnapshot::empty(event_id)));
                Arc::new(EventFeed {
                    state: Mutex::new(FeedState::default()),
                    stale: AtomicBool::new(false),
                    sender,
                })
            })
            .clone()
    }

    /// Seeds the tally from stored counts the first time an event is touched, and again
    /// after an update was dropped.
    async fn seeded<'a>(
        &self,
        event_id: Uuid,
        state: &'a mut FeedState,
        feed: &EventFeed,
    ) -> Result<&'a mut Tally, StoreError> {
        if feed.stale.swap(false, Ordering::AcqRel) {
            debug!(%event_id, "Live totals went stale, reseeding");
            state.tally = None;
        }

        if state.tally.is_none() {
            if state.retry_seed_at.is_some_and(|at| Instant::now() < at) {
                return Err(StoreError::Unavailable(
                    "live totals are not seeded yet".to_string(),
                ));
            }

            let counts = tokio::time::timeout(
                self.store_timeout,
                self.attendances.event_counts(event_id),
            )
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout));
            let counts = match counts {
                Ok(counts) => counts,
                Err(e) => {
                    state.retry_seed_at = Some(Instant::now() + SEED_BACKOFF);
                    return Err(e);
                }
            };

            let floor = feed.sender.borrow().sequence;
            let tally = Tally::seeded(counts, floor);
            debug!(%event_id, seeded_through = tally.seeded_through, "Seeded live totals");
            feed.sender.send_replace(Arc::new(tally.snapshot(event_id)));
            state.retry_seed_at = None;
            state.tally = Some(tally);
        }

        state
            .tally
            .as_mut()
            .ok_or_else(|| StoreError::Corrupt("live totals were not seeded".to_string()))
    }

    /// Applies a freshly recorded attendance and publishes the new totals.
    ///
    /// Waits at most the store timeout. An update that cannot be applied in time marks
    /// the event stale so the next seed picks the record up from storage.
    pub async fn record(&self, attendance: &Attendance) -> Result<(), StoreError> {
        let Some(event_id) = attendance.event_id else {
            return Ok(());
        };

        let feed = self.feed(event_id);
        let Ok(mut state) = tokio::time::timeout(self.store_timeout, feed.state.lock()).await
        else {
            feed.stale.store(true, Ordering::Release);
            return Err(StoreError::Timeout);
        };
        // a failed seed leaves the feed unseeded, so the next seed counts this record
        let tally = self.seeded(event_id, &mut state, &feed).await?;

        if attendance.seq <= tally.seeded_through {
            return Ok(());
        }

        tally.add(attendance.checkpoint_id, attendance.result, 1);
        let seq = u64::try_from(attendance.seq).unwrap_or_default();
        tally.sequence = (tally.sequence + 1).max(seq);
        tally.last_change_at = Some(attendance.recorded_at);
        feed.sender.send_replace(Arc::new(tally.snapshot(event_id)));
        Ok(())
    }

    /// Current totals for the event.
    pub async fn snapshot(&self, event_id: Uuid) -> Result<Arc<TotalsSnapshot>, StoreError> {
        let feed = self.feed(event_id);
        let mut state = feed.state.lock().await;
        self.seeded(event_id, &mut state, &feed).await?;
        let snapshot = feed.sender.borrow().clone();
        Ok(snapshot)
    }

    /// A receiver that always holds the latest snapshot. Dropping it unsubscribes.
    pub async fn subscribe(
        &self,
        event_id: Uuid,
    ) -> Result<watch::Receiver<Arc<TotalsSnapshot>>, StoreError> {
        let feed = self.feed(event_id);
        let mut state = feed.state.lock().await;
        self.seeded(event_id, &mut state, &feed).await?;
        Ok(feed.sender.subscribe())
    }

    /// Number of open subscriptions for the event.
    pub fn subscriber_count(&self, event_id: Uuid) -> usize {
        self.feeds
            .get(&event_id)
            .map(|feed| feed.sender.receiver_count())
            .unwrap_or_default()
    }

    /// Applies an attendance, logging instead of failing when seeding is impossible.
    pub async fn record_or_warn(&self, attendance: &Attendance) {
        if let Err(e) = self.record(attendance).await {
            warn!(attendance_id = %attendance.id, error = %e, "Failed to update live totals");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewAttendance;
    use crate::store::MemoryStore;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn new_attendance(event_id: Uuid, checkpoint_id: Option<Uuid>, result: ScanResult) -> NewAttendance {
        NewAttendance {
            id: Uuid::new_v4(),
            event_id: Some(event_id),
            ticket_id: Some(Uuid::new_v4()),
            guest_id: None,
            checkpoint_id,
            operator_id: None,
            device_id: None,
            scanned_at: Utc::now(),
            recorded_at: Utc::now(),
            result,
            reason: None,
            offline: false,
            subject: "subject".to_string(),
            idempotency_token: None,
            payload_hash: None,
            admission_key: None,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn test_seeds_from_existing_records() {
        let store = Arc::new(MemoryStore::new());
        let event_id = Uuid::new_v4();
        for result in [ScanResult::Valid, ScanResult::Valid, ScanResult::Revoked] {
            store.insert(new_attendance(event_id, None, result)).await.unwrap();
        }

        let broadcaster = TotalsBroadcaster::new(store, TIMEOUT);
        let snapshot = broadcaster.snapshot(event_id).await.unwrap();

        assert_eq!(snapshot.totals.valid, 2);
        assert_eq!(snapshot.totals.invalid, 1);
        assert_eq!(snapshot.sequence, 3);
    }

    #[tokio::test]
    async fn test_already_seeded_records_are_not_double_counted() {
        let store = Arc::new(MemoryStore::new());
        let event_id = Uuid::new_v4();
        let early = store
            .insert(new_attendance(event_id, None, ScanResult::Valid))
            .await
            .unwrap();

        let broadcaster = TotalsBroadcaster::new(store.clone(), TIMEOUT);
        broadcaster.snapshot(event_id).await.unwrap();
        broadcaster.record(&early).await.unwrap();

        let late = store
            .insert(new_attendance(event_id, None, ScanResult::Duplicate))
            .await
            .unwrap();
        broadcaster.record(&late).await.unwrap();

        let snapshot = broadcaster.snapshot(event_id).await.unwrap();
        assert_eq!(snapshot.totals.valid, 1);
        assert_eq!(snapshot.totals.duplicate, 1);
        assert_eq!(snapshot.sequence, 2);
    }

    #[tokio::test]
    async fn test_checkpoint_sums_match_totals() {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = TotalsBroadcaster::new(store.clone(), TIMEOUT);
        let event_id = Uuid::new_v4();
        let gates = [Some(Uuid::new_v4()), Some(Uuid::new_v4()), None];

        for (i, result) in [
            ScanResult::Valid,
            ScanResult::Duplicate,
            ScanResult::Invalid,
            ScanResult::Expired,
            ScanResult::Valid,
        ]
        .into_iter()
        .enumerate()
        {
            let stored = store
                .insert(new_attendance(event_id, gates[i % gates.len()], result))
                .await
                .unwrap();
            broadcaster.record(&stored).await.unwrap();
        }

        let snapshot = broadcaster.snapshot(event_id).await.unwrap();
        let summed = snapshot
            .checkpoints
            .iter()
            .fold(ResultTotals::default(), |mut acc, checkpoint| {
                acc.valid += checkpoint.totals.valid;
                acc.duplicate += checkpoint.totals.duplicate;
                acc.invalid += checkpoint.totals.invalid;
                acc
            });
        assert_eq!(summed, snapshot.totals);
        assert_eq!(snapshot.totals.total(), 5);
        assert_eq!(snapshot.checkpoints.len(), 3);
    }

    #[tokio::test]
    async fn test_subscriber_sees_latest_value() {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = TotalsBroadcaster::new(store.clone(), TIMEOUT);
        let event_id = Uuid::new_v4();
        let mut receiver = broadcaster.subscribe(event_id).await.unwrap();
        assert_eq!(broadcaster.subscriber_count(event_id), 1);

        for _ in 0..3 {
            let stored = store
                .insert(new_attendance(event_id, None, ScanResult::Valid))
                .await
                .unwrap();
            broadcaster.record(&stored).await.unwrap();
        }

        receiver.changed().await.unwrap();
        let latest = receiver.borrow_and_update().clone();
        assert_eq!(latest.sequence, 3);
        assert_eq!(latest.totals.valid, 3);

        drop(receiver);
        assert_eq!(broadcaster.subscriber_count(event_id), 0);
    }

    #[tokio::test]
    async fn test_stalled_seed_gives_up_and_recovers() {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = TotalsBroadcaster::new(store.clone(), TIMEOUT);
        let event_id = Uuid::new_v4();
        store.set_counts_delay(Some(Duration::from_secs(30)));

        let stored = store
            .insert(new_attendance(event_id, None, ScanResult::Valid))
            .await
            .unwrap();
        let started = Instant::now();
        let err = broadcaster.record(&stored).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));

        // backing off: no second stalled query
        let started = Instant::now();
        assert!(broadcaster.record(&stored).await.is_err());
        assert!(started.elapsed() < TIMEOUT);

        store.set_counts_delay(None);
        tokio::time::sleep(SEED_BACKOFF).await;
        let snapshot = broadcaster.snapshot(event_id).await.unwrap();
        assert_eq!(snapshot.totals.valid, 1);
    }

    #[tokio::test]
    async fn test_dropped_update_is_recovered_by_reseed() {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = TotalsBroadcaster::new(store.clone(), TIMEOUT);
        let event_id = Uuid::new_v4();
        broadcaster.snapshot(event_id).await.unwrap();

        let stored = store
            .insert(new_attendance(event_id, None, ScanResult::Valid))
            .await
            .unwrap();
        let feed = broadcaster.feed(event_id);
        {
            let _held = feed.state.lock().await;
            let err = broadcaster.record(&stored).await.unwrap_err();
            assert!(matches!(err, StoreError::Timeout));
        }

        let snapshot = broadcaster.snapshot(event_id).await.unwrap();
        assert_eq!(snapshot.totals.valid, 1);
        assert_eq!(snapshot.sequence, 1);
    }

    #[tokio::test]
    async fn test_sequence_never_goes_backwards_across_restarts() {
        let store = Arc::new(MemoryStore::new());
        let event_id = Uuid::new_v4();
        let first = TotalsBroadcaster::new(store.clone(), TIMEOUT);
        first.snapshot(event_id).await.unwrap();
        for _ in 0..4 {
            let stored = store
                .insert(new_attendance(event_id, None, ScanResult::Duplicate))
                .await
                .unwrap();
            first.record(&stored).await.unwrap();
        }
        let before = first.snapshot(event_id).await.unwrap().sequence;

        let restarted = TotalsBroadcaster::new(store.clone(), TIMEOUT);
        let after = restarted.snapshot(event_id).await.unwrap();
        assert!(after.sequence >= before);
        assert_eq!(after.totals.duplicate, 4);
    }
}
