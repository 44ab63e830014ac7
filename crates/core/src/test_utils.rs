//! Memory-backed emulation harness.
//!
//! [`MemoryLan`] wires the full pipeline over in-memory ports and a virtual
//! clock, so integration tests drive real arrivals and deliveries without
//! tap devices, root privileges or wall-clock waits.

use std::sync::Arc;

use crate::{
    bridge::{self, BridgeMode, BridgeStats},
    channel::{CsmaChannel, DataRate, Delay},
    node::{Emulator, LanFabric, NodeRegistry, SetupError},
    simulation::{RealTimeScheduler, VirtualTime},
    tap::{MemoryLink, MemoryLinkHost},
};

/// Knobs for a memory-backed LAN.
#[derive(Debug, Clone)]
pub struct LanSettings {
    pub nodes: usize,
    pub prefix: String,
    pub mode: BridgeMode,
    pub data_rate: DataRate,
    pub delay: Delay,
    pub duration_nanos: u64,
}

impl Default for LanSettings {
    fn default() -> Self {
        Self {
            nodes: 4,
            prefix: "tap-test".to_owned(),
            mode: BridgeMode::Bridge,
            data_rate: "100Mbps".parse().expect("valid rate"),
            delay: "6560ns".parse().expect("valid delay"),
            duration_nanos: 10_000_000_000,
        }
    }
}

/// A fully wired emulation over in-memory ports and a virtual clock.
///
/// `time` shares state with the scheduler's clock: advancing it releases
/// pacing waits, so a test decides exactly when simulated time passes.
/// `hosts[i]` plays the external host on node i's interface.
pub struct MemoryLan {
    pub emulator: Emulator<VirtualTime>,
    pub hosts: Vec<MemoryLinkHost>,
    pub time: VirtualTime,
    /// Per-node bridge counters, observable while the run is in flight.
    pub stats: Vec<Arc<BridgeStats>>,
}

impl MemoryLan {
    /// Builds a LAN per `settings`, spawning the per-node I/O tasks. Must
    /// be called inside a tokio runtime.
    pub fn build(settings: LanSettings) -> Result<Self, SetupError> {
        let time = VirtualTime::new();
        let scheduler = RealTimeScheduler::anchor(time.clone(), settings.duration_nanos)?;
        let arrival_signal = scheduler.arrival_signal();
        let mut channel = CsmaChannel::new(settings.data_rate, settings.delay);
        let (registry, io) = NodeRegistry::build(
            settings.nodes,
            &settings.prefix,
            settings.mode,
            &mut channel,
            arrival_signal,
        )?;

        let mut hosts = Vec::with_capacity(io.len());
        let mut stats = Vec::with_capacity(io.len());
        let mut readers = Vec::with_capacity(io.len());
        let mut writers = Vec::with_capacity(io.len());
        for node_io in io {
            let (port, host) = MemoryLink::pair(64);
            let port = Arc::new(port);
            stats.push(node_io.stats.clone());
            readers.push(bridge::spawn_reader(port.clone(), node_io.ingress));
            writers.push(bridge::spawn_writer(
                port,
                node_io.egress,
                node_io.stats,
                node_io.interface,
            ));
            hosts.push(host);
        }

        let emulator = Emulator::from_parts(
            scheduler,
            LanFabric::new(channel, registry),
            readers,
            writers,
            settings.duration_nanos,
        );
        Ok(Self {
            emulator,
            hosts,
            time,
            stats,
        })
    }
}
