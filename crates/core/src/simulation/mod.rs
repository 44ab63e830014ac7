//! The real-time-synchronized discrete-event engine.
//!
//! Two pieces, deliberately separated:
//!
//! - [`time`]: the injectable clock. `RealTime` is the production source;
//!   `VirtualTime` lets tests drive pacing and drift by hand, without
//!   wall-clock sleeps.
//! - [`scheduler`]: the event queue and dispatch loop. Everything that
//!   touches medium state runs on this loop; external I/O only ever enters
//!   through the arrival-polling seam.
//!
//! Determinism rule: events dispatch in non-decreasing simulated time, with
//! ties resolved by insertion order. Realtime rule: an event due at
//! simulated time T is never dispatched before `anchor + T` on the wall
//! clock, while a scheduler running behind dispatches immediately and
//! reports drift rather than reordering or skipping work.

mod scheduler;
mod time;

pub use scheduler::{
    DriftStats, Event, EventId, EventKind, EventSink, PastDeadlineError, RealTimeScheduler,
    RunStats, ScheduleRequest, SchedulerError, StopHandle, SyncMode,
};
pub use time::{ClockAnchorError, RealTime, SimulationClock, TimeSource, VirtualTime};
