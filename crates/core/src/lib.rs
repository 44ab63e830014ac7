/// Frame bridges between external interfaces and the simulated medium.
pub mod bridge;

/// The shared CSMA broadcast medium.
pub mod channel;

/// Runtime configuration surface (entry point for the binary).
pub mod config;

/// Frames, endpoint identities and link-layer addresses.
pub mod frame;

/// Node topology, event routing and the run lifecycle.
mod node;
pub use node::{
    Emulator, InvalidTopologyError, LanFabric, NetworkEndpoint, Node, NodeIo, NodeRegistry,
    RunSummary, SetupError,
};

/// The real-time-synchronized discrete-event engine.
pub mod simulation;

/// Tap devices and the port abstraction over them.
pub mod tap;

/// Tracing and logging infrastructure.
#[cfg(feature = "trace")]
pub(crate) mod tracer;

pub mod test_utils;
