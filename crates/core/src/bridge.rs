//! Frame bridges between external interfaces and the simulated medium.
//!
//! A [`FrameBridge`] is the only crossing point between asynchronous OS
//! interface I/O and the single-threaded event core. Inbound frames travel
//! reader task → lock-free ingest ring → scheduler ingest step; outbound
//! frames travel dispatch → bounded egress queue → writer task. Neither
//! direction ever blocks the dispatch loop or the OS-side path: the ingest
//! ring drops its oldest entry on overflow and the egress queue drops the
//! frame being delivered.

use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::{
    frame::{EndpointId, Frame, MacAddr},
    simulation::{EventKind, ScheduleRequest},
    tap::LinkPort,
};

/// Frames buffered between the reader task and the ingest step.
const INGEST_CAPACITY: usize = 1024;
/// Frames buffered between dispatch and the writer task.
const EGRESS_CAPACITY: usize = 1024;
/// Upper bound on a single external write before the frame is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Forwarding discipline on the delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeMode {
    /// Promiscuous: every delivered frame is written out, regardless of
    /// destination address. Mirrors the Linux bridge the tap stands in for.
    #[default]
    Bridge,
    /// Only frames destined to the interface's learned address, broadcast
    /// or multicast are written out. The address is learned from the source
    /// field of frames the external host sends in.
    Local,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid bridge mode {0:?}, expected \"bridge\" or \"local\"")]
pub struct ParseBridgeModeError(String);

impl FromStr for BridgeMode {
    type Err = ParseBridgeModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("bridge") {
            Ok(BridgeMode::Bridge)
        } else if s.eq_ignore_ascii_case("local") {
            Ok(BridgeMode::Local)
        } else {
            Err(ParseBridgeModeError(s.to_owned()))
        }
    }
}

impl std::fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeMode::Bridge => f.write_str("bridge"),
            BridgeMode::Local => f.write_str("local"),
        }
    }
}

/// Live counters for one bridge, shared with its I/O tasks.
#[derive(Debug, Default)]
pub struct BridgeStats {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    ingest_overflow: AtomicU64,
    egress_drops: AtomicU64,
    filtered: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeCounters {
    /// Frames ingested from the external interface into the simulation.
    pub frames_in: u64,
    /// Frames successfully written to the external interface.
    pub frames_out: u64,
    /// Oldest-frame drops caused by a full ingest ring.
    pub ingest_overflow: u64,
    /// Delivery-side drops: full egress queue, write error or timeout.
    pub egress_drops: u64,
    /// Deliveries suppressed by local-mode filtering.
    pub filtered: u64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> BridgeCounters {
        BridgeCounters {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            ingest_overflow: self.ingest_overflow.load(Ordering::Relaxed),
            egress_drops: self.egress_drops.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
        }
    }
}

impl BridgeCounters {
    pub fn merge(&mut self, other: BridgeCounters) {
        self.frames_in += other.frames_in;
        self.frames_out += other.frames_out;
        self.ingest_overflow += other.ingest_overflow;
        self.egress_drops += other.egress_drops;
        self.filtered += other.filtered;
    }
}

/// Sending half of the ingest ring, handed to the interface reader task.
///
/// `push` never blocks; a full ring displaces its oldest frame and counts
/// the overflow.
#[derive(Clone)]
pub struct IngressHandle {
    ring: Arc<ArrayQueue<Bytes>>,
    signal: Arc<Notify>,
    stats: Arc<BridgeStats>,
    interface: Arc<str>,
}

impl IngressHandle {
    pub fn push(&self, frame: Bytes) {
        if self.ring.force_push(frame).is_some() {
            self.stats.ingest_overflow.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                interface = %self.interface,
                "ingest ring full, dropped oldest pending frame"
            );
        }
        self.signal.notify_one();
    }
}

/// One node's crossing point between its external interface and the medium.
pub struct FrameBridge {
    endpoint: EndpointId,
    interface: Arc<str>,
    mode: BridgeMode,
    ring: Arc<ArrayQueue<Bytes>>,
    egress: mpsc::Sender<Bytes>,
    learned: Option<MacAddr>,
    stats: Arc<BridgeStats>,
}

impl FrameBridge {
    /// Builds a bridge plus the two ends its I/O tasks need: the ingest
    /// handle for the reader and the egress receiver for the writer.
    ///
    /// `arrival_signal` is the scheduler's ingest wakeup; every push on the
    /// ring pokes it so a parked run loop re-polls arrivals.
    pub fn new(
        endpoint: EndpointId,
        interface: impl Into<Arc<str>>,
        mode: BridgeMode,
        arrival_signal: Arc<Notify>,
    ) -> (Self, IngressHandle, mpsc::Receiver<Bytes>) {
        let interface = interface.into();
        let ring = Arc::new(ArrayQueue::new(INGEST_CAPACITY));
        let stats = Arc::new(BridgeStats::default());
        let (egress_tx, egress_rx) = mpsc::channel(EGRESS_CAPACITY);
        let ingress = IngressHandle {
            ring: ring.clone(),
            signal: arrival_signal,
            stats: stats.clone(),
            interface: interface.clone(),
        };
        let bridge = Self {
            endpoint,
            interface,
            mode,
            ring,
            egress: egress_tx,
            learned: None,
            stats,
        };
        (bridge, ingress, egress_rx)
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn mode(&self) -> BridgeMode {
        self.mode
    }

    /// Local-mode address learned so far, if any.
    pub fn learned_address(&self) -> Option<MacAddr> {
        self.learned
    }

    pub fn stats_handle(&self) -> Arc<BridgeStats> {
        self.stats.clone()
    }

    pub fn counters(&self) -> BridgeCounters {
        self.stats.snapshot()
    }

    /// Empties the ingest ring into arrival events stamped `now`.
    pub fn drain_arrivals(&mut self, now: u64) -> Vec<ScheduleRequest> {
        let mut requests = Vec::new();
        while let Some(payload) = self.ring.pop() {
            requests.push(ScheduleRequest::at(
                now,
                EventKind::FrameArrival {
                    endpoint: self.endpoint,
                    payload,
                },
            ));
        }
        requests
    }

    /// Handles a dispatched arrival: accounts it, learns the host address
    /// in local mode and requests the transmit attempt at the same instant.
    pub fn on_arrival(&mut self, now: u64, payload: Bytes) -> ScheduleRequest {
        self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(payload, self.endpoint, now);
        if self.mode == BridgeMode::Local {
            if let Some(source) = frame.source_mac() {
                if self.learned != Some(source) {
                    tracing::debug!(
                        interface = %self.interface,
                        address = %source,
                        "learned local address from inbound frame"
                    );
                    self.learned = Some(source);
                }
            }
        }
        ScheduleRequest::at(now, EventKind::TransmitStart { frame })
    }

    /// Hands a delivered frame to the writer task. Filtering and queue
    /// overflow drop the frame here; write failures drop it in the writer.
    pub fn deliver(&mut self, frame: &Frame) {
        if self.mode == BridgeMode::Local && !self.accepts(frame) {
            self.stats.filtered.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                interface = %self.interface,
                "delivery filtered in local mode"
            );
            return;
        }
        match self.egress.try_send(frame.payload().clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.egress_drops.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    interface = %self.interface,
                    "egress queue full, dropped delivered frame"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.egress_drops.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    interface = %self.interface,
                    "egress writer gone, dropped delivered frame"
                );
            }
        }
    }

    fn accepts(&self, frame: &Frame) -> bool {
        match frame.destination() {
            Some(dst) => {
                dst.is_broadcast() || dst.is_multicast() || self.learned == Some(dst)
            }
            // Too short to carry a header; let it through untouched.
            None => true,
        }
    }
}

impl std::fmt::Debug for FrameBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBridge")
            .field("endpoint", &self.endpoint)
            .field("interface", &self.interface)
            .field("mode", &self.mode)
            .field("pending", &self.ring.len())
            .finish()
    }
}

/// Pulls frames off the external interface into the ingest ring until the
/// port reports an error (normally teardown closing the descriptor).
pub fn spawn_reader<P: LinkPort>(port: Arc<P>, ingress: IngressHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match port.recv_frame().await {
                Ok(frame) if frame.is_empty() => continue,
                Ok(frame) => ingress.push(frame),
                Err(err) => {
                    tracing::debug!(%err, "interface reader stopped");
                    break;
                }
            }
        }
    })
}

/// Writes delivered frames to the external interface, best effort. Exits
/// once every sender half of the egress queue is dropped.
pub fn spawn_writer<P: LinkPort>(
    port: Arc<P>,
    mut egress: mpsc::Receiver<Bytes>,
    stats: Arc<BridgeStats>,
    interface: Arc<str>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = egress.recv().await {
            match tokio::time::timeout(WRITE_TIMEOUT, port.send_frame(&frame)).await {
                Ok(Ok(())) => {
                    stats.frames_out.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(err)) => {
                    stats.egress_drops.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        interface = %interface,
                        %err,
                        "external write failed, frame dropped"
                    );
                }
                Err(_) => {
                    stats.egress_drops.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        interface = %interface,
                        "external write timed out, frame dropped"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tap::MemoryLink;

    fn arrival_signal() -> Arc<Notify> {
        Arc::new(Notify::new())
    }

    fn unicast_payload(dst: [u8; 6], src: [u8; 6]) -> Bytes {
        let mut buf = Vec::with_capacity(14);
        buf.extend_from_slice(&dst);
        buf.extend_from_slice(&src);
        buf.extend_from_slice(&[0x08, 0x00]);
        Bytes::from(buf)
    }

    #[test]
    fn ingest_overflow_drops_the_oldest_frames() {
        let (mut bridge, ingress, _egress) = FrameBridge::new(
            EndpointId::new(0),
            "tap-test-1",
            BridgeMode::Bridge,
            arrival_signal(),
        );

        for i in 0..(INGEST_CAPACITY as u64 + 3) {
            ingress.push(Bytes::copy_from_slice(&i.to_be_bytes()));
        }

        let requests = bridge.drain_arrivals(50);
        assert_eq!(requests.len(), INGEST_CAPACITY);
        assert_eq!(bridge.counters().ingest_overflow, 3);
        match &requests[0].kind {
            EventKind::FrameArrival { payload, .. } => {
                assert_eq!(payload.as_ref(), 3u64.to_be_bytes());
            }
            other => panic!("unexpected request kind {other:?}"),
        }
        assert!(requests.iter().all(|r| r.at == 50));
    }

    #[test]
    fn arrival_requests_a_transmit_at_the_same_instant() {
        let (mut bridge, _ingress, _egress) = FrameBridge::new(
            EndpointId::new(2),
            "tap-test-3",
            BridgeMode::Bridge,
            arrival_signal(),
        );

        let request = bridge.on_arrival(7_000, Bytes::from_static(b"frame"));
        assert_eq!(request.at, 7_000);
        match request.kind {
            EventKind::TransmitStart { frame } => {
                assert_eq!(frame.source(), EndpointId::new(2));
                assert_eq!(frame.arrived_at(), 7_000);
                assert_eq!(frame.len(), 5);
            }
            other => panic!("unexpected request kind {other:?}"),
        }
        assert_eq!(bridge.counters().frames_in, 1);
    }

    #[test]
    fn local_mode_learns_and_filters() {
        let signal = arrival_signal();
        let (mut bridge, _ingress, mut egress) = FrameBridge::new(
            EndpointId::new(0),
            "tap-test-1",
            BridgeMode::Local,
            signal,
        );
        let host = [0x02, 0, 0, 0, 0, 0x0a];
        let peer = [0x02, 0, 0, 0, 0, 0x0b];
        let stranger = [0x02, 0, 0, 0, 0, 0x0c];

        bridge.on_arrival(0, unicast_payload(peer, host));
        assert_eq!(bridge.learned_address(), Some(MacAddr::new(host)));

        // Unicast to a stranger never reaches the interface.
        let other = Frame::new(unicast_payload(stranger, peer), EndpointId::new(1), 10);
        bridge.deliver(&other);
        assert!(egress.try_recv().is_err());
        assert_eq!(bridge.counters().filtered, 1);

        // Unicast to the learned address, broadcast and multicast all pass.
        let to_host = Frame::new(unicast_payload(host, peer), EndpointId::new(1), 20);
        bridge.deliver(&to_host);
        let broadcast = Frame::new(
            unicast_payload([0xff; 6], peer),
            EndpointId::new(1),
            30,
        );
        bridge.deliver(&broadcast);
        let multicast = Frame::new(
            unicast_payload([0x01, 0, 0x5e, 0, 0, 1], peer),
            EndpointId::new(1),
            40,
        );
        bridge.deliver(&multicast);
        assert!(egress.try_recv().is_ok());
        assert!(egress.try_recv().is_ok());
        assert!(egress.try_recv().is_ok());
    }

    #[test]
    fn bridge_mode_forwards_everything() {
        let (mut bridge, _ingress, mut egress) = FrameBridge::new(
            EndpointId::new(0),
            "tap-test-1",
            BridgeMode::Bridge,
            arrival_signal(),
        );
        let frame = Frame::new(
            unicast_payload([0x02, 0, 0, 0, 0, 0x42], [0x02, 0, 0, 0, 0, 0x43]),
            EndpointId::new(1),
            5,
        );
        bridge.deliver(&frame);
        assert_eq!(egress.try_recv().unwrap(), frame.payload().clone());
        assert_eq!(bridge.counters().filtered, 0);
    }

    #[test]
    fn full_egress_queue_drops_and_counts() {
        let (mut bridge, _ingress, _egress) = FrameBridge::new(
            EndpointId::new(0),
            "tap-test-1",
            BridgeMode::Bridge,
            arrival_signal(),
        );
        let frame = Frame::new(Bytes::from_static(b"payload"), EndpointId::new(1), 0);
        for _ in 0..(EGRESS_CAPACITY + 2) {
            bridge.deliver(&frame);
        }
        assert_eq!(bridge.counters().egress_drops, 2);
    }

    #[tokio::test]
    async fn reader_feeds_the_ring_and_pokes_the_signal() {
        let signal = arrival_signal();
        let (mut bridge, ingress, _egress) = FrameBridge::new(
            EndpointId::new(1),
            "tap-test-2",
            BridgeMode::Bridge,
            signal.clone(),
        );
        let (port, host) = MemoryLink::pair(4);
        let reader = spawn_reader(Arc::new(port), ingress);

        host.inject(Bytes::from_static(b"external")).await.unwrap();
        signal.notified().await;

        let requests = bridge.drain_arrivals(123);
        assert_eq!(requests.len(), 1);

        drop(host);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn writer_drains_deliveries_to_the_port() {
        let (bridge, _ingress, egress) = FrameBridge::new(
            EndpointId::new(0),
            "tap-test-1",
            BridgeMode::Bridge,
            arrival_signal(),
        );
        let (port, mut host) = MemoryLink::pair(4);
        let stats = bridge.stats_handle();
        let writer = spawn_writer(
            Arc::new(port),
            egress,
            stats.clone(),
            Arc::from("tap-test-1"),
        );

        let mut bridge = bridge;
        let frame = Frame::new(Bytes::from_static(b"outbound"), EndpointId::new(1), 0);
        bridge.deliver(&frame);
        assert_eq!(host.written().await.unwrap(), "outbound");

        drop(bridge);
        writer.await.unwrap();
        assert_eq!(stats.snapshot().frames_out, 1);
    }

    #[test]
    fn mode_parses_from_config_strings() {
        assert_eq!("bridge".parse::<BridgeMode>().unwrap(), BridgeMode::Bridge);
        assert_eq!("Local".parse::<BridgeMode>().unwrap(), BridgeMode::Local);
        assert!("hub".parse::<BridgeMode>().is_err());
    }
}
