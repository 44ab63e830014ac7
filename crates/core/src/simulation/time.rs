//! Time abstraction for the real-time engine.
//!
//! Pacing is keyed off a monotonic clock anchor: an event due at simulated
//! time T may not be dispatched before the anchor plus T nanoseconds of wall
//! time have elapsed. The clock behind that rule is injectable so pacing and
//! drift behavior are testable without real sleeps:
//! - `RealTime` delegates to the tokio timer over an `Instant` epoch
//! - `VirtualTime` only advances when explicitly stepped

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc, Mutex,
    },
    task::{Context, Poll, Waker},
    time::Duration,
};

/// Monotonic nanosecond clock with suspendable waits.
///
/// All simulated timestamps are nanoseconds since the source's epoch.
pub trait TimeSource: Send + Sync + Clone + 'static {
    /// Nanoseconds elapsed since the source's epoch.
    fn now_nanos(&self) -> u64;

    /// Completes after `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Completes once the clock reaches `deadline_nanos`; immediately if it
    /// already has.
    fn sleep_until(&self, deadline_nanos: u64) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Wall-clock time source backed by the tokio timer.
#[derive(Clone)]
pub struct RealTime {
    epoch: std::time::Instant,
}

impl Default for RealTime {
    fn default() -> Self {
        Self::new()
    }
}

impl RealTime {
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl TimeSource for RealTime {
    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn sleep_until(&self, deadline_nanos: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let now = self.now_nanos();
        if deadline_nanos <= now {
            Box::pin(std::future::ready(()))
        } else {
            Box::pin(tokio::time::sleep(Duration::from_nanos(deadline_nanos - now)))
        }
    }
}

/// A pending wakeup registered against a `VirtualTime`.
struct Wakeup {
    deadline: u64,
    seq: u64,
}

impl PartialEq for Wakeup {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Wakeup {}

impl PartialOrd for Wakeup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Wakeup {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: earliest deadline first, registration order on ties.
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

struct VirtualTimeState {
    current_nanos: AtomicU64,
    next_seq: AtomicU64,
    pending: Mutex<BinaryHeap<Wakeup>>,
    wakers: Mutex<Vec<(u64, Waker)>>,
}

/// Manually advanced clock for deterministic tests.
///
/// Sleeps register a wakeup; `advance`/`advance_to` move the clock and wake
/// every sleeper whose deadline has passed, in deadline order with FIFO
/// tie-breaking.
#[derive(Clone)]
pub struct VirtualTime {
    state: Arc<VirtualTimeState>,
}

impl Default for VirtualTime {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTime {
    /// Creates a virtual clock at nanosecond zero.
    pub fn new() -> Self {
        Self {
            state: Arc::new(VirtualTimeState {
                current_nanos: AtomicU64::new(0),
                next_seq: AtomicU64::new(0),
                pending: Mutex::new(BinaryHeap::new()),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Number of sleepers that have not yet been woken.
    pub fn pending_wakeups(&self) -> usize {
        self.state.pending.lock().unwrap().len()
    }

    /// Advances the clock by `duration`, returning how many sleepers woke.
    pub fn advance(&self, duration: Duration) -> usize {
        let target = self
            .state
            .current_nanos
            .load(AtomicOrdering::SeqCst)
            .saturating_add(duration.as_nanos() as u64);
        self.advance_to(target)
    }

    /// Advances the clock to an absolute nanosecond, returning how many
    /// sleepers woke. Moving backwards is a no-op.
    pub fn advance_to(&self, target_nanos: u64) -> usize {
        let current = self.state.current_nanos.load(AtomicOrdering::SeqCst);
        if target_nanos <= current {
            return 0;
        }
        self.state
            .current_nanos
            .store(target_nanos, AtomicOrdering::SeqCst);

        let mut woken = 0;
        let mut to_wake = Vec::new();
        {
            let mut pending = self.state.pending.lock().unwrap();
            let mut wakers = self.state.wakers.lock().unwrap();
            while let Some(wakeup) = pending.peek() {
                if wakeup.deadline > target_nanos {
                    break;
                }
                let wakeup = pending.pop().unwrap();
                woken += 1;
                if let Some(pos) = wakers.iter().position(|(seq, _)| *seq == wakeup.seq) {
                    let (_, waker) = wakers.swap_remove(pos);
                    to_wake.push(waker);
                }
            }
        }
        // Wake outside the locks so woken tasks can poll immediately.
        for waker in to_wake {
            waker.wake();
        }
        woken
    }

    fn register(&self, deadline: u64) -> u64 {
        let seq = self.state.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.state
            .pending
            .lock()
            .unwrap()
            .push(Wakeup { deadline, seq });
        seq
    }
}

impl TimeSource for VirtualTime {
    fn now_nanos(&self) -> u64 {
        self.state.current_nanos.load(AtomicOrdering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let deadline = self.now_nanos().saturating_add(duration.as_nanos() as u64);
        self.sleep_until(deadline)
    }

    fn sleep_until(&self, deadline_nanos: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        if deadline_nanos <= self.now_nanos() {
            return Box::pin(std::future::ready(()));
        }
        let seq = self.register(deadline_nanos);
        Box::pin(VirtualSleep {
            seq,
            deadline: deadline_nanos,
            state: self.state.clone(),
        })
    }
}

/// Future returned by `VirtualTime::sleep_until`.
///
/// Ready once its deadline is at or behind the clock, or once its wakeup has
/// been popped by `advance_to`; a sleeper that was woken before it first
/// polled still completes.
struct VirtualSleep {
    seq: u64,
    deadline: u64,
    state: Arc<VirtualTimeState>,
}

impl Future for VirtualSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Both locks, in advance_to's order: the completion check and the
        // waker registration must be one step against a concurrent advance,
        // or a wakeup popped in between would leave this waker registered
        // but never invoked.
        let mut pending = self.state.pending.lock().unwrap();
        let mut wakers = self.state.wakers.lock().unwrap();
        let now = self.state.current_nanos.load(AtomicOrdering::SeqCst);
        let still_pending = pending.iter().any(|w| w.seq == self.seq);
        if now >= self.deadline || !still_pending {
            if still_pending {
                // The clock moved past the deadline before the wakeup was
                // registered; discard the stale entry.
                pending.retain(|w| w.seq != self.seq);
            }
            if let Some(pos) = wakers.iter().position(|(seq, _)| *seq == self.seq) {
                wakers.swap_remove(pos);
            }
            return Poll::Ready(());
        }
        if let Some(pos) = wakers.iter().position(|(seq, _)| *seq == self.seq) {
            wakers[pos].1 = cx.waker().clone();
        } else {
            wakers.push((self.seq, cx.waker().clone()));
        }
        Poll::Pending
    }
}

impl Drop for VirtualSleep {
    fn drop(&mut self) {
        let mut pending = self.state.pending.lock().unwrap();
        let mut wakers = self.state.wakers.lock().unwrap();
        pending.retain(|w| w.seq != self.seq);
        if let Some(pos) = wakers.iter().position(|(seq, _)| *seq == self.seq) {
            wakers.swap_remove(pos);
        }
    }
}

/// Run-scoped pairing of the simulated-time cursor with its wall-clock
/// anchor.
///
/// The cursor only moves forward; the anchor is sampled at construction and
/// refreshed with [`reanchor`](Self::reanchor) when the run actually starts.
/// Anchoring fails if the requested horizon cannot be represented in the
/// source's nanosecond domain.
pub struct SimulationClock<T: TimeSource> {
    source: T,
    anchor_nanos: u64,
    sim_nanos: u64,
}

/// The monotonic clock cannot cover the requested run horizon.
#[derive(Debug, thiserror::Error)]
#[error("clock anchor unavailable: a {horizon_nanos}ns horizon is not representable from the current anchor")]
pub struct ClockAnchorError {
    pub horizon_nanos: u64,
}

impl<T: TimeSource> SimulationClock<T> {
    /// Anchors simulated time zero to the source's current reading.
    pub fn anchor(source: T, horizon_nanos: u64) -> Result<Self, ClockAnchorError> {
        let anchor_nanos = source.now_nanos();
        if anchor_nanos.checked_add(horizon_nanos).is_none() {
            return Err(ClockAnchorError { horizon_nanos });
        }
        Ok(Self {
            source,
            anchor_nanos,
            sim_nanos: 0,
        })
    }

    /// Re-samples the wall anchor so the cursor corresponds to the source's
    /// present reading. Wall time spent between construction and the run
    /// start is discarded instead of counting as drift.
    pub fn reanchor(&mut self) {
        self.anchor_nanos = self.source.now_nanos().saturating_sub(self.sim_nanos);
    }

    /// Current simulated time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.sim_nanos
    }

    /// Moves the cursor forward to `sim_nanos`; never backwards.
    pub fn advance_to(&mut self, sim_nanos: u64) {
        if sim_nanos > self.sim_nanos {
            self.sim_nanos = sim_nanos;
        }
    }

    /// Simulated time corresponding to the wall clock right now, clamped so
    /// it never reads behind the cursor.
    pub fn elapsed_now(&self) -> u64 {
        self.source
            .now_nanos()
            .saturating_sub(self.anchor_nanos)
            .max(self.sim_nanos)
    }

    /// How far wall time has run past the deadline for `sim_nanos`, or zero
    /// if that deadline has not been reached yet.
    pub fn behind_by(&self, sim_nanos: u64) -> u64 {
        self.source
            .now_nanos()
            .saturating_sub(self.anchor_nanos.saturating_add(sim_nanos))
    }

    /// Completes once wall time reaches the anchor plus `sim_nanos`.
    pub fn sleep_until_due(&self, sim_nanos: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.source
            .sleep_until(self.anchor_nanos.saturating_add(sim_nanos))
    }
}
