//! Runtime configuration.
//!
//! [`ConfigArgs`] is the CLI/env surface; [`ConfigArgs::build`] validates it
//! into the [`Config`] the emulator is composed from.

use std::{sync::atomic::AtomicBool, time::Duration};

use crate::{
    bridge::BridgeMode,
    channel::{DataRate, Delay},
};

/// Real-time CSMA LAN emulator bridging external tap interfaces.
#[derive(clap::Parser, Debug, Clone)]
pub struct ConfigArgs {
    /// Number of simulated nodes on the shared medium.
    #[clap(long, default_value_t = 4, env = "TAPNET_NODES")]
    pub nodes: usize,

    /// External interface name prefix; taps are named `<prefix>-1` through
    /// `<prefix>-N`.
    #[clap(long, default_value = "tap-beacon", env = "TAPNET_PREFIX")]
    pub prefix: String,

    /// Simulated run duration in seconds.
    #[clap(long, default_value_t = 600.0, env = "TAPNET_DURATION")]
    pub duration: f64,

    /// Channel data rate, e.g. "100Mbps".
    #[clap(long, default_value = "100Mbps", env = "TAPNET_DATA_RATE")]
    pub data_rate: DataRate,

    /// Uniform propagation delay, e.g. "6560ns".
    #[clap(long, default_value = "6560ns", env = "TAPNET_DELAY")]
    pub delay: Delay,

    /// Delivery filtering: "bridge" (promiscuous) or "local".
    #[clap(long, default_value = "bridge", env = "TAPNET_MODE")]
    pub mode: BridgeMode,

    /// Abort the run once the scheduler drifts further than this many
    /// milliseconds behind the wall clock, instead of warning.
    #[clap(long, env = "TAPNET_MAX_DRIFT_MS")]
    pub max_drift_ms: Option<u64>,

    /// Verbose diagnostics (debug-level logging).
    #[clap(long, short, env = "TAPNET_VERBOSE")]
    pub verbose: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("duration must be a positive number of seconds, got {0}")]
    InvalidDuration(f64),
}

impl ConfigArgs {
    pub fn build(self) -> Result<Config, ConfigError> {
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(ConfigError::InvalidDuration(self.duration));
        }
        Ok(Config {
            nodes: self.nodes,
            prefix: self.prefix,
            duration: Duration::from_secs_f64(self.duration),
            data_rate: self.data_rate,
            delay: self.delay,
            mode: self.mode,
            max_drift: self.max_drift_ms.map(Duration::from_millis),
            verbose: self.verbose,
        })
    }
}

/// Validated configuration the emulation is composed from.
#[derive(Debug, Clone)]
pub struct Config {
    pub nodes: usize,
    pub prefix: String,
    pub duration: Duration,
    pub data_rate: DataRate,
    pub delay: Delay,
    pub mode: BridgeMode,
    pub max_drift: Option<Duration>,
    pub verbose: bool,
}

impl Config {
    /// Run horizon in simulated nanoseconds.
    pub fn duration_nanos(&self) -> u64 {
        u64::try_from(self.duration.as_nanos()).unwrap_or(u64::MAX)
    }
}

pub fn set_logger(level: Option<tracing::level_filters::LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        crate::tracer::init_tracer(level).expect("failed tracing initialization")
    }
}
