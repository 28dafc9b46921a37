//! Worker state machine: ingestion, flush orchestration, retry policy.

use crate::channel::{DeliveryChannel, DeliveryOutcome};
use crate::config::{PipelineConfig, VerboseFlag};
use crate::decide::DecideManager;
use crate::error::Result;
use crate::store::RecordStore;
use crate::types::{Clock, InsertOutcome, ReadBatch, RecordClass, RecordId, Timestamp};
use crate::worker::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Whether the worker loop should keep running after a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// How a class's drain loop ended.
enum ClassOutcome {
    /// Everything readable was delivered or dropped.
    Drained,
    /// A recoverable failure; a retry is scheduled and the remaining
    /// classes wait for it.
    StopCycle,
}

/// Ephemeral flush bookkeeping. Worker-local only: never persisted,
/// never shared across threads.
#[derive(Debug, Default)]
struct FlushState {
    /// Deadline of the pending delayed flush, if one is scheduled.
    scheduled_deadline: Option<Timestamp>,
    last_flush_at: Option<Timestamp>,
    /// Running average of time between flush cycles. Diagnostic only.
    average_flush_interval_ms: Option<f64>,
    flush_count: u64,
}

/// The logic half of the serialization worker.
///
/// Owns the store and the channel outright; exactly one thread drives
/// `handle`/`on_timer`, which makes ingestion thread-safe by
/// construction. The thread wrapper supplies real timing; tests drive
/// the core directly under a manual clock.
pub struct WorkerCore {
    store: RecordStore,
    channel: Box<dyn DeliveryChannel>,
    decide: Arc<DecideManager>,
    config: Arc<PipelineConfig>,
    clock: Arc<dyn Clock>,
    verbose: VerboseFlag,
    flush: FlushState,
    /// Cutoffs rejected at the application level once, awaiting their
    /// single retry (only populated when the retry policy is on).
    pending_rejection: HashMap<RecordClass, RecordId>,
}

impl WorkerCore {
    pub fn new(
        store: RecordStore,
        channel: Box<dyn DeliveryChannel>,
        decide: Arc<DecideManager>,
        config: Arc<PipelineConfig>,
        clock: Arc<dyn Clock>,
        verbose: VerboseFlag,
    ) -> Self {
        Self {
            store,
            channel,
            decide,
            config,
            clock,
            verbose,
            flush: FlushState::default(),
            pending_rejection: HashMap::new(),
        }
    }

    /// Process one mailbox message.
    pub fn handle(&mut self, msg: Message) -> Result<Flow> {
        match msg {
            Message::EnqueueEvent {
                owner,
                payload,
                is_automatic,
            } => {
                self.on_enqueue(RecordClass::Event, &owner, &payload, is_automatic);
            }
            Message::EnqueuePeopleUpdate { owner, payload } => {
                self.on_enqueue(RecordClass::ProfileUpdate, &owner, &payload, false);
            }
            Message::FlushNow => {
                self.run_flush_cycle();
            }
            Message::CheckRemoteDecide => {
                self.run_flush_cycle();
                self.decide.run_checks(&*self.channel);
            }
            Message::Shutdown => {
                debug!("hard kill: wiping store and terminating worker");
                if let Err(e) = self.store.wipe() {
                    error!(error = %e, "store wipe during shutdown failed");
                }
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Timer wakeup from the thread wrapper. A delayed flush that
    /// became redundant is a no-op here: an immediate flush already
    /// cleared the deadline.
    pub fn on_timer(&mut self) -> Result<Flow> {
        if let Some(deadline) = self.flush.scheduled_deadline {
            if self.clock.now() >= deadline {
                self.run_flush_cycle();
            }
        }
        Ok(Flow::Continue)
    }

    /// How long the thread wrapper may sleep before the next scheduled
    /// flush is due. `None` means no flush is pending.
    pub fn wake_after(&self) -> Option<Duration> {
        self.flush
            .scheduled_deadline
            .map(|deadline| Duration::from_millis(self.clock.now().millis_until(deadline) as u64))
    }

    fn on_enqueue(&mut self, class: RecordClass, owner: &str, payload: &[u8], is_automatic: bool) {
        let now = self.clock.now();
        match self.store.insert(class, payload, owner, is_automatic, now) {
            Ok(InsertOutcome::Stored { owner_count }) => {
                if self.verbose.enabled() {
                    debug!(class = %class, owner, owner_count, "record queued");
                }
                if owner_count >= self.config.bulk_upload_limit {
                    self.run_flush_cycle();
                } else {
                    self.schedule_flush(now);
                }
            }
            Ok(InsertOutcome::AdmissionDenied) => {
                warn!(class = %class, owner, "record dropped: store admission denied");
            }
            Err(e) => {
                // The store has already wiped itself; the in-flight
                // record is lost along with the queue.
                warn!(class = %class, error = %e, "record lost to store fault");
            }
        }
    }

    /// Schedule one delayed flush if none is pending. A negative
    /// interval disables auto-flush; the host must flush explicitly.
    fn schedule_flush(&mut self, now: Timestamp) {
        if self.config.flush_interval_ms < 0 || self.flush.scheduled_deadline.is_some() {
            return;
        }
        let deadline = now.saturating_add_ms(self.config.flush_interval_ms);
        self.flush.scheduled_deadline = Some(deadline);
        if self.verbose.enabled() {
            debug!(?deadline, "delayed flush scheduled");
        }
    }

    /// One full flush cycle: expiry sweep, then drain each class until
    /// empty or a failure stops the cycle.
    fn run_flush_cycle(&mut self) {
        let now = self.clock.now();
        self.note_flush_interval(now);
        self.flush.scheduled_deadline = None;
        self.expire_old_records(now);

        for class in RecordClass::ALL {
            for owner in self.store.owners(class) {
                match self.drain_class(class, &owner, now) {
                    ClassOutcome::Drained => {}
                    ClassOutcome::StopCycle => return,
                }
            }
        }
    }

    /// Drain one owner's queue in one class.
    fn drain_class(&mut self, class: RecordClass, owner: &str, now: Timestamp) -> ClassOutcome {
        loop {
            let Some(batch) = self.store.read_batch(
                class,
                owner,
                self.config.flush_batch_size,
                self.config.include_automatic_events,
            ) else {
                return ClassOutcome::Drained;
            };

            let body = batch_body(&batch);
            let outcome = self.channel.deliver(
                &body,
                self.config.endpoint_for(class),
                self.config.fallback_for(class),
            );

            match outcome {
                DeliveryOutcome::Succeeded(_) => {
                    self.pending_rejection.remove(&class);
                    if self.verbose.enabled() {
                        debug!(class = %class, owner, count = batch.records.len(),
                               cutoff = %batch.cutoff, "batch delivered");
                    }
                    if self.delete_delivered(class, batch.cutoff, owner).is_err() {
                        return ClassOutcome::StopCycle;
                    }
                }
                DeliveryOutcome::FailedRecoverable => {
                    debug!(class = %class, owner, "recoverable delivery failure, rescheduling");
                    self.schedule_flush(now);
                    return ClassOutcome::StopCycle;
                }
                DeliveryOutcome::FailedUnrecoverable => {
                    let retry = self.config.retry_ambiguous_rejection
                        && self.pending_rejection.get(&class) != Some(&batch.cutoff);
                    if retry {
                        warn!(class = %class, cutoff = %batch.cutoff,
                              "batch rejected, holding for one retry");
                        self.pending_rejection.insert(class, batch.cutoff);
                        self.schedule_flush(now);
                        return ClassOutcome::StopCycle;
                    }
                    warn!(class = %class, cutoff = %batch.cutoff,
                          "batch rejected by service, dropping");
                    self.pending_rejection.remove(&class);
                    if self.delete_delivered(class, batch.cutoff, owner).is_err() {
                        return ClassOutcome::StopCycle;
                    }
                }
            }
        }
    }

    /// Remove a delivered (or dropped) batch. A store fault here has
    /// already wiped the queue, so the cycle has nothing left to do.
    fn delete_delivered(&mut self, class: RecordClass, cutoff: RecordId, owner: &str) -> Result<()> {
        self.store
            .delete_up_to(class, cutoff, owner, self.config.include_automatic_events)
            .map(|_| ())
            .map_err(|e| {
                warn!(class = %class, error = %e, "cutoff deletion failed, store wiped");
                e
            })
    }

    /// Age-based expiry: records past their shelf life leave the queue
    /// regardless of owner before each delivery round.
    fn expire_old_records(&mut self, now: Timestamp) {
        let horizon = Timestamp(now.0 - self.config.data_expiration_ms);
        for class in RecordClass::ALL {
            match self.store.delete_older_than(class, horizon) {
                Ok(0) => {}
                Ok(removed) => debug!(class = %class, removed, "expired records swept"),
                Err(e) => warn!(class = %class, error = %e, "expiry sweep failed, store wiped"),
            }
        }
    }

    /// Running estimate of time between flush cycles. Diagnostic only.
    fn note_flush_interval(&mut self, now: Timestamp) {
        if let Some(last) = self.flush.last_flush_at {
            let interval = (now.0 - last.0) as f64;
            let count = self.flush.flush_count as f64;
            self.flush.average_flush_interval_ms = Some(match self.flush.average_flush_interval_ms {
                Some(avg) => (avg * count + interval) / (count + 1.0),
                None => interval,
            });
        }
        self.flush.last_flush_at = Some(now);
        self.flush.flush_count += 1;
    }
}

/// Assemble the wire body: a JSON array of the already-serialized
/// record payloads.
fn batch_body(batch: &ReadBatch) -> Vec<u8> {
    let mut body = Vec::with_capacity(
        batch.records.iter().map(|r| r.payload.len() + 1).sum::<usize>() + 2,
    );
    body.push(b'[');
    for (i, record) in batch.records.iter().enumerate() {
        if i > 0 {
            body.push(b',');
        }
        body.extend_from_slice(&record.payload);
    }
    body.push(b']');
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::TempDir;

    struct ManualClock(AtomicI64);

    impl ManualClock {
        fn at(ms: i64) -> Arc<Self> {
            Arc::new(ManualClock(AtomicI64::new(ms)))
        }

        fn advance(&self, ms: i64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Timestamp {
            Timestamp(self.0.load(Ordering::SeqCst))
        }
    }

    #[derive(Default)]
    struct MockState {
        script: Mutex<VecDeque<DeliveryOutcome>>,
        deliveries: Mutex<Vec<Vec<u8>>>,
    }

    /// Scripted channel: pops the next outcome per delivery, acking by
    /// default once the script runs dry.
    #[derive(Clone, Default)]
    struct MockChannel(Arc<MockState>);

    impl MockChannel {
        fn script(&self, outcomes: Vec<DeliveryOutcome>) {
            *self.0.script.lock() = outcomes.into();
        }

        fn delivery_count(&self) -> usize {
            self.0.deliveries.lock().len()
        }

        fn last_delivery(&self) -> Option<Vec<u8>> {
            self.0.deliveries.lock().last().cloned()
        }
    }

    impl DeliveryChannel for MockChannel {
        fn deliver(&self, payload: &[u8], _endpoint: &str, _fallback: Option<&str>) -> DeliveryOutcome {
            self.0.deliveries.lock().push(payload.to_vec());
            self.0
                .script
                .lock()
                .pop_front()
                .unwrap_or(DeliveryOutcome::Succeeded(b"1".to_vec()))
        }

        fn get(&self, _url: &str, _fallback: Option<&str>) -> DeliveryOutcome {
            self.0
                .script
                .lock()
                .pop_front()
                .unwrap_or(DeliveryOutcome::Succeeded(b"{}".to_vec()))
        }
    }

    struct Harness {
        core: WorkerCore,
        clock: Arc<ManualClock>,
        channel: MockChannel,
        _dir: TempDir,
    }

    fn harness(tweak: impl FnOnce(&mut PipelineConfig)) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = PipelineConfig {
            storage_path: dir.path().join("queue"),
            bulk_upload_limit: 5,
            flush_interval_ms: 60_000,
            ..Default::default()
        };
        tweak(&mut config);
        let config = Arc::new(config);

        let clock = ManualClock::at(1_000_000);
        let channel = MockChannel::default();
        let store = RecordStore::open(&config).unwrap();
        let decide = Arc::new(DecideManager::new(config.clone()));
        let core = WorkerCore::new(
            store,
            Box::new(channel.clone()),
            decide,
            config,
            clock.clone(),
            VerboseFlag::new(false),
        );
        Harness {
            core,
            clock,
            channel,
            _dir: dir,
        }
    }

    fn enqueue_event(core: &mut WorkerCore, n: u64) {
        for i in 0..n {
            core.handle(Message::EnqueueEvent {
                owner: "token".into(),
                payload: format!("{{\"n\":{}}}", i).into_bytes(),
                is_automatic: false,
            })
            .unwrap();
        }
    }

    #[test]
    fn test_below_limit_schedules_single_delayed_flush() {
        let mut h = harness(|_| {});

        enqueue_event(&mut h.core, 3);

        // No delivery yet; exactly one deadline, at now + interval.
        assert_eq!(h.channel.delivery_count(), 0);
        assert_eq!(
            h.core.flush.scheduled_deadline,
            Some(Timestamp(1_000_000 + 60_000))
        );

        // Advancing to the deadline fires exactly one flush attempt.
        h.clock.advance(60_000);
        h.core.on_timer().unwrap();
        assert_eq!(h.channel.delivery_count(), 1);
        assert!(h.core.store.read_batch(RecordClass::Event, "token", 10, true).is_none());
        assert_eq!(h.core.flush.scheduled_deadline, None);
    }

    #[test]
    fn test_reaching_limit_flushes_without_timer() {
        let mut h = harness(|c| c.bulk_upload_limit = 5);

        enqueue_event(&mut h.core, 5);

        // Flush happened synchronously in the fifth processing step.
        assert_eq!(h.channel.delivery_count(), 1);
        assert!(h.core.store.read_batch(RecordClass::Event, "token", 10, true).is_none());
    }

    #[test]
    fn test_negative_interval_disables_auto_flush() {
        let mut h = harness(|c| c.flush_interval_ms = -1);

        enqueue_event(&mut h.core, 2);
        assert_eq!(h.core.flush.scheduled_deadline, None);

        // Explicit flush still works.
        h.core.handle(Message::FlushNow).unwrap();
        assert_eq!(h.channel.delivery_count(), 1);
    }

    #[test]
    fn test_redundant_delayed_flush_is_noop() {
        let mut h = harness(|_| {});

        enqueue_event(&mut h.core, 2);
        assert!(h.core.flush.scheduled_deadline.is_some());

        // An immediate flush runs first; the timer deadline is cleared.
        h.core.handle(Message::FlushNow).unwrap();
        assert_eq!(h.channel.delivery_count(), 1);

        h.clock.advance(120_000);
        h.core.on_timer().unwrap();
        assert_eq!(h.channel.delivery_count(), 1);
    }

    #[test]
    fn test_recoverable_failure_keeps_records_and_reschedules() {
        let mut h = harness(|_| {});
        h.channel.script(vec![DeliveryOutcome::FailedRecoverable]);

        enqueue_event(&mut h.core, 2);
        h.core.handle(Message::FlushNow).unwrap();

        assert_eq!(h.channel.delivery_count(), 1);
        let batch = h.core.store.read_batch(RecordClass::Event, "token", 10, true).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert!(h.core.flush.scheduled_deadline.is_some());

        // The retry succeeds and drains the queue.
        h.clock.advance(60_000);
        h.core.on_timer().unwrap();
        assert_eq!(h.channel.delivery_count(), 2);
        assert!(h.core.store.read_batch(RecordClass::Event, "token", 10, true).is_none());
    }

    #[test]
    fn test_unrecoverable_failure_drops_batch() {
        let mut h = harness(|_| {});
        h.channel.script(vec![DeliveryOutcome::FailedUnrecoverable]);

        enqueue_event(&mut h.core, 2);
        h.core.handle(Message::FlushNow).unwrap();

        assert!(h.core.store.read_batch(RecordClass::Event, "token", 10, true).is_none());
        assert_eq!(h.core.flush.scheduled_deadline, None);
    }

    #[test]
    fn test_ambiguous_rejection_retried_once_when_configured() {
        let mut h = harness(|c| c.retry_ambiguous_rejection = true);
        h.channel.script(vec![
            DeliveryOutcome::FailedUnrecoverable,
            DeliveryOutcome::FailedUnrecoverable,
        ]);

        enqueue_event(&mut h.core, 2);
        h.core.handle(Message::FlushNow).unwrap();

        // First rejection holds the batch and schedules the retry.
        assert!(h.core.store.read_batch(RecordClass::Event, "token", 10, true).is_some());
        assert!(h.core.flush.scheduled_deadline.is_some());

        // Second rejection of the same cutoff drops it.
        h.clock.advance(60_000);
        h.core.on_timer().unwrap();
        assert!(h.core.store.read_batch(RecordClass::Event, "token", 10, true).is_none());
    }

    #[test]
    fn test_profile_updates_flush_after_events() {
        let mut h = harness(|_| {});

        h.core
            .handle(Message::EnqueueEvent {
                owner: "token".into(),
                payload: b"{\"e\":1}".to_vec(),
                is_automatic: false,
            })
            .unwrap();
        h.core
            .handle(Message::EnqueuePeopleUpdate {
                owner: "token".into(),
                payload: b"{\"$set\":{}}".to_vec(),
            })
            .unwrap();

        h.core.handle(Message::FlushNow).unwrap();
        assert_eq!(h.channel.delivery_count(), 2);
        assert!(h.core.store.read_batch(RecordClass::ProfileUpdate, "token", 10, true).is_none());
    }

    #[test]
    fn test_recoverable_failure_stops_remaining_classes() {
        let mut h = harness(|_| {});
        h.channel.script(vec![DeliveryOutcome::FailedRecoverable]);

        h.core
            .handle(Message::EnqueueEvent {
                owner: "token".into(),
                payload: b"{}".to_vec(),
                is_automatic: false,
            })
            .unwrap();
        h.core
            .handle(Message::EnqueuePeopleUpdate {
                owner: "token".into(),
                payload: b"{}".to_vec(),
            })
            .unwrap();

        h.core.handle(Message::FlushNow).unwrap();

        // Events failed recoverably; profile updates were not attempted.
        assert_eq!(h.channel.delivery_count(), 1);
        assert!(h.core.store.read_batch(RecordClass::ProfileUpdate, "token", 10, true).is_some());
    }

    #[test]
    fn test_batch_body_is_json_array_of_payloads() {
        let mut h = harness(|_| {});
        enqueue_event(&mut h.core, 2);
        h.core.handle(Message::FlushNow).unwrap();

        let body = h.channel.last_delivery().unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_expired_records_swept_before_delivery() {
        let mut h = harness(|c| c.data_expiration_ms = 1_000);

        enqueue_event(&mut h.core, 1);
        h.clock.advance(10_000);
        h.core.handle(Message::FlushNow).unwrap();

        // The record aged out; nothing was delivered.
        assert_eq!(h.channel.delivery_count(), 0);
    }

    #[test]
    fn test_shutdown_wipes_store_and_stops() {
        let mut h = harness(|_| {});
        enqueue_event(&mut h.core, 3);

        let flow = h.core.handle(Message::Shutdown).unwrap();
        assert_eq!(flow, Flow::Stop);
        assert_eq!(h.core.store.stats().event_count, 0);
    }

    #[test]
    fn test_scenario_three_events_timer_then_success() {
        // bulk_upload_limit = 5, flush_interval = 60000 ms.
        let mut h = harness(|c| {
            c.bulk_upload_limit = 5;
            c.flush_interval_ms = 60_000;
        });

        enqueue_event(&mut h.core, 3);
        assert_eq!(h.channel.delivery_count(), 0);

        h.clock.advance(60_000);
        h.core.on_timer().unwrap();
        h.core.on_timer().unwrap();

        assert_eq!(h.channel.delivery_count(), 1);
        assert_eq!(h.core.store.stats().event_count, 0);
    }
}
