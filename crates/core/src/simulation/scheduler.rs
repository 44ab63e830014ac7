//! Real-time discrete-event scheduler.
//!
//! Events are dispatched in simulated-time order with ties broken by
//! insertion order, and never before their wall-clock deadline: an event at
//! simulated time T waits until `anchor + T` has elapsed on the injected
//! clock. If dispatch falls behind the wall clock the scheduler does not
//! skip or reorder anything; it dispatches immediately and reports drift.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::Notify;

use super::time::{ClockAnchorError, SimulationClock, TimeSource};
use crate::frame::{EndpointId, Frame};

/// Dispatches behind the wall clock by more than this are logged as drift.
const DRIFT_WARN_NANOS: u64 = 1_000_000;

/// Unique identifier for a scheduled event; doubles as the insertion-order
/// tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

impl EventId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// The event vocabulary of the emulation pipeline.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A raw frame ingested at a bridge, due to enter the channel.
    FrameArrival { endpoint: EndpointId, payload: Bytes },
    /// A bridge contends for the medium on behalf of its frame.
    TransmitStart { frame: Frame },
    /// The medium frees at a transmission's busy-until instant.
    TransmitEnd { tx_seq: u64 },
    /// The channel delivers a frame copy to one endpoint.
    Deliver { endpoint: EndpointId, frame: Frame },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::FrameArrival { .. } => "frame-arrival",
            EventKind::TransmitStart { .. } => "transmit-start",
            EventKind::TransmitEnd { .. } => "transmit-end",
            EventKind::Deliver { .. } => "deliver",
        }
    }

    /// Whether this event would put new traffic on the medium, as opposed
    /// to finishing traffic already in transit.
    fn starts_new_traffic(&self) -> bool {
        matches!(
            self,
            EventKind::FrameArrival { .. } | EventKind::TransmitStart { .. }
        )
    }
}

/// A scheduled event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Simulated time at which this event is due, in nanoseconds.
    pub timestamp: u64,
    pub id: EventId,
    pub kind: EventKind,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: earliest timestamp first; insertion order on ties. The
        // channel's busy-until boundary rule depends on exactly this order.
        match other.timestamp.cmp(&self.timestamp) {
            Ordering::Equal => other.id.0.cmp(&self.id.0),
            ord => ord,
        }
    }
}

/// A follow-up event requested by a dispatch handler.
#[derive(Debug)]
pub struct ScheduleRequest {
    pub at: u64,
    pub kind: EventKind,
}

impl ScheduleRequest {
    pub fn at(at: u64, kind: EventKind) -> Self {
        Self { at, kind }
    }
}

/// Receiver of dispatched events.
///
/// Handlers return the follow-up events their handling produced; the
/// scheduler inserts them before the next dispatch. `poll_arrivals` is the
/// single crossing point for externally produced frames: it is called with
/// the current simulated time whenever the scheduler is about to wait and
/// whenever the arrival signal fires.
pub trait EventSink {
    fn on_event(&mut self, now: u64, kind: EventKind) -> Vec<ScheduleRequest>;

    fn poll_arrivals(&mut self, now: u64) -> Vec<ScheduleRequest>;
}

/// Requests cooperative termination of a running scheduler.
///
/// Cloneable and callable from event handlers, signal handlers, or other
/// threads. Stopping twice is the same as stopping once.
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

struct StopState {
    requested: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopState {
                requested: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn stop(&self) {
        if !self.inner.requested.swap(true, AtomicOrdering::SeqCst) {
            tracing::debug!("stop requested");
        }
        self.inner.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.requested.load(AtomicOrdering::SeqCst)
    }

    async fn notified(&self) {
        if self.is_stopped() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// How the scheduler reacts to falling behind the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Dispatch immediately and log a warning; the run continues.
    #[default]
    BestEffort,
    /// Abort the run once drift exceeds the bound.
    HardLimit { max_drift: Duration },
}

/// Drift accounting for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriftStats {
    /// Worst observed lag behind the wall clock, in nanoseconds.
    pub worst_nanos: u64,
    /// Dispatches later than the warn threshold.
    pub late_dispatches: u64,
}

/// Counters returned by [`RealTimeScheduler::run`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub dispatched: u64,
    /// Arrival/transmit-start events discarded after the stop threshold.
    pub discarded_after_threshold: u64,
    pub drift: DriftStats,
}

/// An event may not be scheduled behind the current simulated time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event at {at}ns is behind simulated time {now}ns")]
pub struct PastDeadlineError {
    pub at: u64,
    pub now: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    PastDeadline(#[from] PastDeadlineError),
    #[error("drifted {behind_nanos}ns behind wall clock, past the {limit_nanos}ns hard limit")]
    DriftLimitExceeded { behind_nanos: u64, limit_nanos: u64 },
}

/// The single scheduling authority of the emulation.
///
/// Owns the event queue and the simulation clock; all channel and bridge
/// logic runs on its dispatch loop, so nothing else ever mutates medium
/// state.
pub struct RealTimeScheduler<T: TimeSource> {
    clock: SimulationClock<T>,
    queue: BinaryHeap<Event>,
    next_event_id: u64,
    stop: StopHandle,
    arrivals: Arc<Notify>,
    sync_mode: SyncMode,
}

impl<T: TimeSource> RealTimeScheduler<T> {
    /// Anchors simulated time zero to the source's current reading.
    ///
    /// `horizon_nanos` is the furthest simulated time the run is expected
    /// to reach; anchoring fails if the clock cannot represent it.
    pub fn anchor(source: T, horizon_nanos: u64) -> Result<Self, ClockAnchorError> {
        Ok(Self {
            clock: SimulationClock::anchor(source, horizon_nanos)?,
            queue: BinaryHeap::new(),
            next_event_id: 0,
            stop: StopHandle::new(),
            arrivals: Arc::new(Notify::new()),
            sync_mode: SyncMode::default(),
        })
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Current simulated time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Re-samples the wall anchor so pacing deadlines count from the
    /// present instant instead of from [`anchor`](Self::anchor) time.
    pub fn reanchor(&mut self) {
        self.clock.reanchor();
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Handle used to request a graceful stop.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Signal that interface readers fire after queueing a raw frame, so a
    /// waiting scheduler re-polls arrivals instead of sleeping through them.
    pub fn arrival_signal(&self) -> Arc<Notify> {
        self.arrivals.clone()
    }

    /// Inserts an event at an absolute simulated time.
    pub fn schedule_at(&mut self, at: u64, kind: EventKind) -> Result<EventId, PastDeadlineError> {
        let now = self.clock.now();
        if at < now {
            return Err(PastDeadlineError { at, now });
        }
        Ok(self.insert(at, kind))
    }

    /// Inserts an event `delay` after the current simulated time; never
    /// retroactive since the delay is non-negative.
    pub fn schedule_after(&mut self, delay: Duration, kind: EventKind) -> EventId {
        let at = self.clock.now().saturating_add(delay.as_nanos() as u64);
        self.insert(at, kind)
    }

    fn insert(&mut self, at: u64, kind: EventKind) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;
        self.queue.push(Event {
            timestamp: at,
            id,
            kind,
        });
        id
    }

    fn submit(&mut self, requests: Vec<ScheduleRequest>) -> Result<(), PastDeadlineError> {
        for request in requests {
            self.schedule_at(request.at, request.kind)?;
        }
        Ok(())
    }

    fn next_due(&self) -> Option<u64> {
        self.queue.peek().map(|e| e.timestamp)
    }

    /// Runs the dispatch loop until `until_nanos` of simulated time has
    /// elapsed, then drains in-flight transmit-end/deliver events before
    /// returning. New traffic (arrivals, transmit starts) is discarded once
    /// the threshold is reached or a stop was requested.
    pub async fn run<S: EventSink>(
        &mut self,
        until_nanos: u64,
        sink: &mut S,
    ) -> Result<RunStats, SchedulerError> {
        let mut stats = RunStats::default();
        loop {
            let draining = self.stop.is_stopped() || self.clock.elapsed_now() >= until_nanos;
            let now = self.clock.elapsed_now();
            let requests = sink.poll_arrivals(now);
            if !draining {
                self.submit(requests)?;
            } else if !requests.is_empty() {
                // Frames still trickling in past the threshold are shed
                // here instead of ever becoming queued events.
                stats.discarded_after_threshold += requests.len() as u64;
                tracing::debug!(
                    count = requests.len(),
                    "shedding arrivals past the stop threshold"
                );
            }

            let Some(next_at) = self.next_due() else {
                if draining || self.clock.now() >= until_nanos {
                    let reached = until_nanos.min(self.clock.elapsed_now());
                    self.clock.advance_to(reached);
                    break;
                }
                // Idle: nothing queued, threshold not reached.
                tokio::select! {
                    biased;
                    _ = self.stop.notified() => continue,
                    _ = self.arrivals.notified() => continue,
                    _ = self.clock.sleep_until_due(until_nanos) => {
                        self.clock.advance_to(until_nanos);
                        break;
                    }
                }
            };

            tokio::select! {
                biased;
                _ = self.stop.notified(), if !draining => continue,
                _ = self.arrivals.notified(), if !draining => continue,
                _ = self.clock.sleep_until_due(next_at) => {}
            }

            let Some(event) = self.queue.pop() else {
                continue;
            };
            self.clock.advance_to(event.timestamp);
            self.note_drift(&event, &mut stats)?;

            let past_threshold = self.stop.is_stopped() || event.timestamp >= until_nanos;
            if past_threshold && event.kind.starts_new_traffic() {
                stats.discarded_after_threshold += 1;
                tracing::debug!(
                    at = event.timestamp,
                    kind = event.kind.label(),
                    "discarding event past the stop threshold"
                );
                continue;
            }

            let follow_ups = sink.on_event(event.timestamp, event.kind);
            stats.dispatched += 1;
            self.submit(follow_ups)?;
        }
        Ok(stats)
    }

    fn note_drift(&self, event: &Event, stats: &mut RunStats) -> Result<(), SchedulerError> {
        let behind = self.clock.behind_by(event.timestamp);
        if behind == 0 {
            return Ok(());
        }
        stats.drift.worst_nanos = stats.drift.worst_nanos.max(behind);
        if behind >= DRIFT_WARN_NANOS {
            stats.drift.late_dispatches += 1;
            tracing::warn!(
                behind_nanos = behind,
                at = event.timestamp,
                kind = event.kind.label(),
                "dispatch running behind wall clock"
            );
        }
        if let SyncMode::HardLimit { max_drift } = self.sync_mode {
            let limit_nanos = max_drift.as_nanos() as u64;
            if behind > limit_nanos {
                return Err(SchedulerError::DriftLimitExceeded {
                    behind_nanos: behind,
                    limit_nanos,
                });
            }
        }
        Ok(())
    }
}

impl<T: TimeSource> std::fmt::Debug for RealTimeScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealTimeScheduler")
            .field("now", &self.now())
            .field("pending", &self.pending())
            .field("sync_mode", &self.sync_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::time::VirtualTime;
    use std::sync::Mutex;

    /// Sink that records dispatches and replays scripted follow-ups.
    struct RecordingSink {
        log: Arc<Mutex<Vec<(u64, &'static str)>>>,
        follow_ups: Vec<(u64, ScheduleRequest)>,
    }

    impl RecordingSink {
        fn new() -> (Self, Arc<Mutex<Vec<(u64, &'static str)>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    log: log.clone(),
                    follow_ups: Vec::new(),
                },
                log,
            )
        }

        fn follow_up_at(mut self, trigger: u64, request: ScheduleRequest) -> Self {
            self.follow_ups.push((trigger, request));
            self
        }
    }

    impl EventSink for RecordingSink {
        fn on_event(&mut self, now: u64, kind: EventKind) -> Vec<ScheduleRequest> {
            self.log.lock().unwrap().push((now, kind.label()));
            let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.follow_ups)
                .into_iter()
                .partition(|(trigger, _)| *trigger == now);
            self.follow_ups = rest;
            due.into_iter().map(|(_, request)| request).collect()
        }

        fn poll_arrivals(&mut self, _now: u64) -> Vec<ScheduleRequest> {
            Vec::new()
        }
    }

    fn end_event(tx_seq: u64) -> EventKind {
        EventKind::TransmitEnd { tx_seq }
    }

    fn arrival_event(endpoint: u32) -> EventKind {
        EventKind::FrameArrival {
            endpoint: EndpointId::new(endpoint),
            payload: Bytes::from_static(b"frame"),
        }
    }

    #[tokio::test]
    async fn dispatches_in_timestamp_order() {
        let vt = VirtualTime::new();
        let mut sched = RealTimeScheduler::anchor(vt.clone(), 1_000_000).unwrap();
        sched.schedule_at(300, end_event(3)).unwrap();
        sched.schedule_at(100, end_event(1)).unwrap();
        sched.schedule_at(200, end_event(2)).unwrap();

        // Wall clock already past every deadline: dispatch runs straight
        // through without suspending.
        vt.advance_to(10_000);
        let (mut sink, log) = RecordingSink::new();
        let stats = sched.run(1_000, &mut sink).await.unwrap();

        let times: Vec<u64> = log.lock().unwrap().iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![100, 200, 300]);
        assert_eq!(stats.dispatched, 3);
        assert_eq!(sched.now(), 1_000);
    }

    #[tokio::test]
    async fn ties_dispatch_in_insertion_order() {
        let vt = VirtualTime::new();
        let mut sched = RealTimeScheduler::anchor(vt.clone(), 1_000_000).unwrap();
        sched.schedule_at(500, end_event(7)).unwrap();
        sched.schedule_at(500, arrival_event(0)).unwrap();

        vt.advance_to(10_000);
        let (mut sink, log) = RecordingSink::new();
        sched.run(1_000, &mut sink).await.unwrap();

        let labels: Vec<&'static str> = log.lock().unwrap().iter().map(|(_, l)| *l).collect();
        assert_eq!(labels, vec!["transmit-end", "frame-arrival"]);
    }

    #[tokio::test]
    async fn rejects_events_behind_simulated_time() {
        let vt = VirtualTime::new();
        let mut sched = RealTimeScheduler::anchor(vt.clone(), 1_000_000).unwrap();
        sched.schedule_at(100, end_event(1)).unwrap();
        vt.advance_to(10_000);
        let (mut sink, _log) = RecordingSink::new();
        sched.run(100, &mut sink).await.unwrap();

        let err = sched.schedule_at(50, end_event(2)).unwrap_err();
        assert_eq!(err, PastDeadlineError { at: 50, now: 100 });
    }

    #[tokio::test]
    async fn never_dispatches_before_the_wall_deadline() {
        let vt = VirtualTime::new();
        let mut sched = RealTimeScheduler::anchor(vt.clone(), 1_000_000).unwrap();
        sched.schedule_at(5_000, end_event(1)).unwrap();

        let (mut sink, log) = RecordingSink::new();
        let handle = tokio::spawn(async move { sched.run(5_000, &mut sink).await });

        // One nanosecond short of the deadline: nothing may fire.
        vt.advance_to(4_999);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(log.lock().unwrap().is_empty());

        vt.advance_to(5_000);
        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run must finish once the clock reaches the deadline")
            .unwrap()
            .unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(log.lock().unwrap().as_slice(), &[(5_000, "transmit-end")]);
    }

    #[tokio::test]
    async fn follow_ups_are_scheduled_and_dispatched() {
        let vt = VirtualTime::new();
        let mut sched = RealTimeScheduler::anchor(vt.clone(), 1_000_000).unwrap();
        sched.schedule_at(100, end_event(1)).unwrap();

        vt.advance_to(10_000);
        let (sink, log) = RecordingSink::new();
        let mut sink = sink.follow_up_at(100, ScheduleRequest::at(150, end_event(2)));
        let stats = sched.run(1_000, &mut sink).await.unwrap();

        let times: Vec<u64> = log.lock().unwrap().iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![100, 150]);
        assert_eq!(stats.dispatched, 2);
    }

    #[tokio::test]
    async fn drain_discards_new_traffic_but_honors_in_flight() {
        let vt = VirtualTime::new();
        let mut sched = RealTimeScheduler::anchor(vt.clone(), 1_000_000).unwrap();
        // Past the 1_000ns threshold: an arrival (new traffic) and a
        // delivery already in transit.
        sched.schedule_at(1_050, arrival_event(2)).unwrap();
        sched.schedule_at(1_100, end_event(9)).unwrap();

        vt.advance_to(10_000);
        let (mut sink, log) = RecordingSink::new();
        let stats = sched.run(1_000, &mut sink).await.unwrap();

        let labels: Vec<&'static str> = log.lock().unwrap().iter().map(|(_, l)| *l).collect();
        assert_eq!(labels, vec!["transmit-end"]);
        assert_eq!(stats.discarded_after_threshold, 1);
        assert_eq!(stats.dispatched, 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_graceful() {
        let vt = VirtualTime::new();
        let mut sched = RealTimeScheduler::anchor(vt.clone(), 1_000_000).unwrap();
        sched.schedule_at(100, arrival_event(0)).unwrap();
        sched.schedule_at(200, end_event(1)).unwrap();

        let stop = sched.stop_handle();
        stop.stop();
        stop.stop();
        assert!(stop.is_stopped());

        vt.advance_to(10_000);
        let (mut sink, log) = RecordingSink::new();
        let stats = sched.run(100_000, &mut sink).await.unwrap();

        // The queued arrival is new traffic and is discarded; the in-flight
        // end still runs to completion.
        let labels: Vec<&'static str> = log.lock().unwrap().iter().map(|(_, l)| *l).collect();
        assert_eq!(labels, vec!["transmit-end"]);
        assert_eq!(stats.discarded_after_threshold, 1);
    }

    #[tokio::test]
    async fn hard_limit_aborts_on_excess_drift() {
        let vt = VirtualTime::new();
        let mut sched = RealTimeScheduler::anchor(vt.clone(), 1_000_000)
            .unwrap()
            .with_sync_mode(SyncMode::HardLimit {
                max_drift: Duration::from_nanos(500),
            });
        sched.schedule_at(100, end_event(1)).unwrap();

        // Wall clock is 9_900ns past the event's deadline.
        vt.advance_to(10_000);
        let (mut sink, _log) = RecordingSink::new();
        let err = sched.run(1_000, &mut sink).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DriftLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn best_effort_records_drift_instead_of_failing() {
        let vt = VirtualTime::new();
        let mut sched = RealTimeScheduler::anchor(vt.clone(), 1_000_000_000).unwrap();
        sched.schedule_at(100, end_event(1)).unwrap();

        // More than the warn threshold behind.
        vt.advance_to(5_000_000);
        let (mut sink, _log) = RecordingSink::new();
        let stats = sched.run(1_000, &mut sink).await.unwrap();
        assert_eq!(stats.drift.late_dispatches, 1);
        assert!(stats.drift.worst_nanos >= DRIFT_WARN_NANOS);
    }

    #[tokio::test]
    async fn empty_queue_completes_at_the_horizon() {
        let vt = VirtualTime::new();
        let mut sched = RealTimeScheduler::anchor(vt.clone(), 1_000_000).unwrap();
        vt.advance_to(2_000);
        let (mut sink, log) = RecordingSink::new();
        let stats = sched.run(1_500, &mut sink).await.unwrap();
        assert_eq!(stats.dispatched, 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(sched.now(), 1_500);
    }
}
