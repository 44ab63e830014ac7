//! Topology and the run lifecycle.
//!
//! [`NodeRegistry`] builds the fixed set of nodes, one bridge and one
//! channel attachment each. [`LanFabric`] is the event handler the
//! scheduler drives: it routes dispatched events between the bridges and
//! the channel. [`Emulator`] composes everything from configuration and
//! owns start, run and teardown.

use std::{io, sync::Arc};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::{
    bridge::{self, BridgeCounters, BridgeMode, BridgeStats, FrameBridge, IngressHandle},
    channel::{AttachmentHandle, ChannelStats, CsmaChannel, DuplicateAttachmentError},
    config::Config,
    frame::EndpointId,
    simulation::{
        ClockAnchorError, EventKind, EventSink, RealTime, RealTimeScheduler, RunStats,
        ScheduleRequest, SchedulerError, StopHandle, SyncMode, TimeSource,
    },
    tap::TapDevice,
};

/// A topology needs at least one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid topology: {nodes} nodes requested, at least one is required")]
pub struct InvalidTopologyError {
    pub nodes: usize,
}

/// Anything that can abort startup, before the run loop begins.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Topology(#[from] InvalidTopologyError),
    #[error("channel attachment for {interface} failed")]
    Attach {
        interface: String,
        #[source]
        source: DuplicateAttachmentError,
    },
    #[error(transparent)]
    Anchor(#[from] ClockAnchorError),
    #[error("failed to attach external interface {interface}")]
    Interface {
        interface: String,
        #[source]
        source: io::Error,
    },
}

/// The two sides of one node: its bridge to the external interface and its
/// attachment point on the medium.
pub struct NetworkEndpoint {
    bridge: FrameBridge,
    attachment: AttachmentHandle,
}

/// One simulated machine. Identity is fixed at build time.
pub struct Node {
    endpoint: EndpointId,
    network: NetworkEndpoint,
}

impl Node {
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn interface(&self) -> &str {
        self.network.bridge.interface()
    }

    pub fn attachment(&self) -> AttachmentHandle {
        self.network.attachment
    }

    pub fn bridge(&self) -> &FrameBridge {
        &self.network.bridge
    }
}

/// Per-node pieces the I/O tasks need, handed out at build time.
pub struct NodeIo {
    pub endpoint: EndpointId,
    pub interface: Arc<str>,
    pub ingress: IngressHandle,
    pub egress: mpsc::Receiver<bytes::Bytes>,
    pub stats: Arc<BridgeStats>,
}

/// The fixed set of nodes in the emulation.
pub struct NodeRegistry {
    nodes: Vec<Node>,
}

impl NodeRegistry {
    /// Builds `count` nodes named `<prefix>-1` through `<prefix>-N`, each
    /// with a bridge and a channel attachment.
    pub fn build(
        count: usize,
        prefix: &str,
        mode: BridgeMode,
        channel: &mut CsmaChannel,
        arrival_signal: Arc<Notify>,
    ) -> Result<(Self, Vec<NodeIo>), SetupError> {
        if count == 0 {
            return Err(InvalidTopologyError { nodes: count }.into());
        }
        let mut nodes = Vec::with_capacity(count);
        let mut io = Vec::with_capacity(count);
        for index in 0..count {
            let endpoint = EndpointId::new(index as u32);
            let interface: Arc<str> = Arc::from(format!("{prefix}-{}", index + 1));
            let (bridge, ingress, egress) =
                FrameBridge::new(endpoint, interface.clone(), mode, arrival_signal.clone());
            let stats = bridge.stats_handle();
            let attachment = channel
                .attach(endpoint)
                .map_err(|source| SetupError::Attach {
                    interface: interface.to_string(),
                    source,
                })?;
            nodes.push(Node {
                endpoint,
                network: NetworkEndpoint { bridge, attachment },
            });
            io.push(NodeIo {
                endpoint,
                interface,
                ingress,
                egress,
                stats,
            });
        }
        Ok((Self { nodes }, io))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, endpoint: EndpointId) -> Option<&Node> {
        self.nodes.get(endpoint.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    fn node_mut(&mut self, endpoint: EndpointId) -> Option<&mut Node> {
        self.nodes.get_mut(endpoint.index())
    }
}

/// Routes dispatched events between the channel and the bridges.
///
/// Runs entirely on the scheduler's dispatch loop; it is the only code
/// that touches channel state or bridge delivery.
pub struct LanFabric {
    channel: CsmaChannel,
    registry: NodeRegistry,
}

impl LanFabric {
    pub fn new(channel: CsmaChannel, registry: NodeRegistry) -> Self {
        Self { channel, registry }
    }

    pub fn channel(&self) -> &CsmaChannel {
        &self.channel
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    fn teardown(&mut self) {
        for node in &self.registry.nodes {
            self.channel.detach(node.network.attachment);
        }
    }
}

impl EventSink for LanFabric {
    fn on_event(&mut self, now: u64, kind: EventKind) -> Vec<ScheduleRequest> {
        tracing::trace!(now, event = kind.label(), "dispatch");
        match kind {
            EventKind::FrameArrival { endpoint, payload } => {
                match self.registry.node_mut(endpoint) {
                    Some(node) => vec![node.network.bridge.on_arrival(now, payload)],
                    None => {
                        tracing::warn!(%endpoint, "arrival for unknown endpoint dropped");
                        Vec::new()
                    }
                }
            }
            EventKind::TransmitStart { frame } => match self.registry.get(frame.source()) {
                Some(node) => self
                    .channel
                    .begin_transmit(node.network.attachment, frame, now),
                None => {
                    tracing::warn!(
                        endpoint = %frame.source(),
                        "transmit for unknown endpoint dropped"
                    );
                    Vec::new()
                }
            },
            EventKind::TransmitEnd { tx_seq } => self.channel.transmit_end(tx_seq, now),
            EventKind::Deliver { endpoint, frame } => {
                if let Some(node) = self.registry.node_mut(endpoint) {
                    node.network.bridge.deliver(&frame);
                }
                Vec::new()
            }
        }
    }

    fn poll_arrivals(&mut self, now: u64) -> Vec<ScheduleRequest> {
        let mut requests = Vec::new();
        for node in self.registry.nodes.iter_mut() {
            requests.extend(node.network.bridge.drain_arrivals(now));
        }
        requests
    }
}

/// Final counters for one run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub run: RunStats,
    pub channel: ChannelStats,
    pub bridges: BridgeCounters,
}

/// The composed emulation: scheduler, fabric and per-node I/O tasks.
pub struct Emulator<T: TimeSource> {
    scheduler: RealTimeScheduler<T>,
    fabric: LanFabric,
    readers: Vec<JoinHandle<()>>,
    writers: Vec<JoinHandle<()>>,
    duration_nanos: u64,
}

impl Emulator<RealTime> {
    /// Builds the emulation from configuration, attaching one tap device
    /// per node. Anchors the clock; [`run`](Self::run) re-samples the
    /// anchor when it starts, so simulated time zero is the instant pacing
    /// begins. Must run inside a tokio runtime.
    pub fn build(config: &Config) -> Result<Self, SetupError> {
        if config.nodes == 0 {
            return Err(InvalidTopologyError { nodes: 0 }.into());
        }
        let duration_nanos = config.duration_nanos();
        let mut scheduler = RealTimeScheduler::anchor(RealTime::new(), duration_nanos)?;
        if let Some(max_drift) = config.max_drift {
            scheduler = scheduler.with_sync_mode(SyncMode::HardLimit { max_drift });
        }

        let arrival_signal = scheduler.arrival_signal();
        let mut channel = CsmaChannel::new(config.data_rate, config.delay);
        let (registry, io) = NodeRegistry::build(
            config.nodes,
            &config.prefix,
            config.mode,
            &mut channel,
            arrival_signal,
        )?;

        let mut readers = Vec::with_capacity(io.len());
        let mut writers = Vec::with_capacity(io.len());
        for node_io in io {
            let port =
                TapDevice::attach(&node_io.interface).map_err(|source| SetupError::Interface {
                    interface: node_io.interface.to_string(),
                    source,
                })?;
            tracing::info!(interface = %node_io.interface, "attached external interface");
            let port = Arc::new(port);
            readers.push(bridge::spawn_reader(port.clone(), node_io.ingress));
            writers.push(bridge::spawn_writer(
                port,
                node_io.egress,
                node_io.stats,
                node_io.interface,
            ));
        }

        Ok(Self {
            scheduler,
            fabric: LanFabric::new(channel, registry),
            readers,
            writers,
            duration_nanos,
        })
    }
}

impl<T: TimeSource> Emulator<T> {
    /// Assembles an emulation from already-built parts. The tap-device
    /// path is [`Emulator::build`]; this is the seam for memory-backed
    /// ports and virtual clocks.
    pub fn from_parts(
        scheduler: RealTimeScheduler<T>,
        fabric: LanFabric,
        readers: Vec<JoinHandle<()>>,
        writers: Vec<JoinHandle<()>>,
        duration_nanos: u64,
    ) -> Self {
        Self {
            scheduler,
            fabric,
            readers,
            writers,
            duration_nanos,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.scheduler.stop_handle()
    }

    pub fn node_count(&self) -> usize {
        self.fabric.registry.len()
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.fabric.registry
    }

    pub fn duration_nanos(&self) -> u64 {
        self.duration_nanos
    }

    /// Direct access to the scheduler, for preloading traffic before the
    /// run starts.
    pub fn scheduler_mut(&mut self) -> &mut RealTimeScheduler<T> {
        &mut self.scheduler
    }

    /// Runs to the configured duration (or until stopped), then tears
    /// everything down. In-flight transmissions and deliveries complete
    /// before teardown; new traffic past the threshold is discarded.
    pub async fn run(self) -> Result<RunSummary, SchedulerError> {
        let Self {
            mut scheduler,
            mut fabric,
            readers,
            writers,
            duration_nanos,
        } = self;
        tracing::info!(
            nodes = fabric.registry.len(),
            duration_nanos,
            "emulation starting"
        );

        // Pacing counts from here, not from build time.
        scheduler.reanchor();
        let outcome = scheduler.run(duration_nanos, &mut fabric).await;

        for reader in &readers {
            reader.abort();
        }
        fabric.teardown();
        let channel = fabric.channel.stats();
        let stats_handles: Vec<_> = fabric
            .registry
            .nodes
            .iter()
            .map(|node| node.network.bridge.stats_handle())
            .collect();
        // Dropping the fabric closes every egress queue; the writers flush
        // what is left and exit on their own.
        drop(fabric);
        for writer in writers {
            if let Err(join_error) = writer.await {
                if !join_error.is_cancelled() {
                    tracing::warn!(
                        %join_error,
                        "egress writer exited abnormally, final flush may be incomplete"
                    );
                }
            }
        }
        for reader in readers {
            let _ = reader.await;
        }

        let mut bridges = BridgeCounters::default();
        for handle in &stats_handles {
            bridges.merge(handle.snapshot());
        }
        let run = outcome?;
        tracing::info!(
            dispatched = run.dispatched,
            collisions = channel.collisions,
            "emulation finished"
        );
        Ok(RunSummary {
            run,
            channel,
            bridges,
        })
    }
}
