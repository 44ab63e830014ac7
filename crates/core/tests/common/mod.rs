//! Common test utilities shared across integration tests.
//!
//! These utilities are shared across test files and may not all be used in
//! every one of them.
#![allow(dead_code)]

use bytes::Bytes;
use tapnet::{
    bridge::BridgeMode,
    channel::CsmaChannel,
    frame::{EndpointId, Frame},
    simulation::{EventKind, EventSink, RealTimeScheduler, ScheduleRequest, VirtualTime},
    LanFabric, NodeIo, NodeRegistry,
};

/// Default horizon for virtual-clock scenarios: ten simulated seconds.
pub const HORIZON: u64 = 10_000_000_000;

/// A wired LAN over a virtual clock, with the per-node I/O ends kept on
/// the test side. No reader/writer tasks are spawned; arrivals are
/// preloaded on the scheduler and deliveries read off the egress queues.
pub fn virtual_lan(
    nodes: usize,
) -> (
    RealTimeScheduler<VirtualTime>,
    LanFabric,
    Vec<NodeIo>,
    VirtualTime,
) {
    let time = VirtualTime::new();
    let scheduler =
        RealTimeScheduler::anchor(time.clone(), HORIZON).expect("anchor virtual clock");
    let mut channel = CsmaChannel::new(
        "100Mbps".parse().expect("valid rate"),
        "6560ns".parse().expect("valid delay"),
    );
    let (registry, io) = NodeRegistry::build(
        nodes,
        "tap-test",
        BridgeMode::Bridge,
        &mut channel,
        scheduler.arrival_signal(),
    )
    .expect("build registry");
    (scheduler, LanFabric::new(channel, registry), io, time)
}

pub fn test_frame(source: u32, len: usize, at: u64) -> Frame {
    Frame::new(Bytes::from(vec![0xa5; len]), EndpointId::new(source), at)
}

/// Wraps the fabric and records every dispatch instant and kind.
pub struct RecordingFabric {
    pub inner: LanFabric,
    pub log: Vec<(u64, &'static str)>,
}

impl RecordingFabric {
    pub fn new(inner: LanFabric) -> Self {
        Self {
            inner,
            log: Vec::new(),
        }
    }

    pub fn dispatches(&self, label: &str) -> Vec<u64> {
        self.log
            .iter()
            .filter(|(_, l)| *l == label)
            .map(|(t, _)| *t)
            .collect()
    }
}

impl EventSink for RecordingFabric {
    fn on_event(&mut self, now: u64, kind: EventKind) -> Vec<ScheduleRequest> {
        self.log.push((now, kind.label()));
        self.inner.on_event(now, kind)
    }

    fn poll_arrivals(&mut self, now: u64) -> Vec<ScheduleRequest> {
        self.inner.poll_arrivals(now)
    }
}
