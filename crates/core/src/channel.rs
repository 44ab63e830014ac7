//! The shared broadcast medium.
//!
//! `CsmaChannel` enforces carrier-sense semantics for every attached
//! endpoint: one transmitter at a time, a fixed propagation delay to every
//! other endpoint, and collisions resolved by dropping both frames. All
//! methods run on the scheduler's dispatch loop; the channel never sees
//! concurrent access.

use std::{str::FromStr, time::Duration};

use crate::{
    frame::{EndpointId, Frame},
    simulation::{EventKind, ScheduleRequest},
};

/// Channel throughput, stored as bits per second.
///
/// Parses the attribute strings the scenario configuration uses:
/// `"9600bps"`, `"56Kbps"`, `"100Mbps"`, `"1Gbps"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRate(u64);

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid data rate {0:?}, expected e.g. \"100Mbps\"")]
pub struct ParseDataRateError(String);

impl DataRate {
    pub fn bits_per_sec(&self) -> u64 {
        self.0
    }

    /// Time to serialize `bytes` onto the medium, rounded to whole
    /// nanoseconds. Zero-length frames take zero time.
    pub fn transmission_time(&self, bytes: usize) -> Duration {
        let bits = bytes as u128 * 8;
        let rate = self.0 as u128;
        let nanos = (bits * 1_000_000_000 + rate / 2) / rate;
        Duration::from_nanos(nanos as u64)
    }
}

impl FromStr for DataRate {
    type Err = ParseDataRateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (value, multiplier) = if let Some(v) = s.strip_suffix("Gbps") {
            (v, 1_000_000_000u64)
        } else if let Some(v) = s.strip_suffix("Mbps") {
            (v, 1_000_000)
        } else if let Some(v) = s.strip_suffix("Kbps") {
            (v, 1_000)
        } else if let Some(v) = s.strip_suffix("bps") {
            (v, 1)
        } else {
            return Err(ParseDataRateError(s.to_owned()));
        };
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| ParseDataRateError(s.to_owned()))?;
        let bits = value * multiplier as f64;
        if !bits.is_finite() || bits < 1.0 || bits > u64::MAX as f64 {
            return Err(ParseDataRateError(s.to_owned()));
        }
        Ok(DataRate(bits.round() as u64))
    }
}

impl std::fmt::Display for DataRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            b if b % 1_000_000_000 == 0 => write!(f, "{}Gbps", b / 1_000_000_000),
            b if b % 1_000_000 == 0 => write!(f, "{}Mbps", b / 1_000_000),
            b if b % 1_000 == 0 => write!(f, "{}Kbps", b / 1_000),
            b => write!(f, "{b}bps"),
        }
    }
}

/// Propagation delay, parsed from strings like `"6560ns"`, `"2us"`,
/// `"1.5ms"`, `"1s"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delay(Duration);

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid delay {0:?}, expected e.g. \"6560ns\"")]
pub struct ParseDelayError(String);

impl Delay {
    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn nanos(&self) -> u64 {
        self.0.as_nanos() as u64
    }
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl FromStr for Delay {
    type Err = ParseDelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (value, nanos_per_unit) = if let Some(v) = s.strip_suffix("ns") {
            (v, 1f64)
        } else if let Some(v) = s.strip_suffix("us") {
            (v, 1_000.0)
        } else if let Some(v) = s.strip_suffix("ms") {
            (v, 1_000_000.0)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1_000_000_000.0)
        } else {
            return Err(ParseDelayError(s.to_owned()));
        };
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| ParseDelayError(s.to_owned()))?;
        let nanos = value * nanos_per_unit;
        if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
            return Err(ParseDelayError(s.to_owned()));
        }
        Ok(Delay(Duration::from_nanos(nanos.round() as u64)))
    }
}

impl std::fmt::Display for Delay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nanos = self.nanos();
        match nanos {
            n if n % 1_000_000_000 == 0 => write!(f, "{}s", n / 1_000_000_000),
            n if n % 1_000_000 == 0 => write!(f, "{}ms", n / 1_000_000),
            n if n % 1_000 == 0 => write!(f, "{}us", n / 1_000),
            n => write!(f, "{n}ns"),
        }
    }
}

/// Proof of attachment handed out by [`CsmaChannel::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("endpoint {endpoint} is already attached to the channel")]
pub struct DuplicateAttachmentError {
    pub endpoint: EndpointId,
}

struct Attachment {
    endpoint: EndpointId,
    active: bool,
}

enum ChannelState {
    Idle,
    /// Medium occupied until `ends_at`. `live` holds the deliverable frame;
    /// a collision clears it, leaving the medium jammed but undeliverable.
    Transmitting {
        ends_at: u64,
        tx_seq: u64,
        live: Option<(AttachmentHandle, Frame)>,
    },
}

/// Runtime counters, readable at any point of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Transmissions that acquired the medium.
    pub transmissions: u64,
    /// Transmission attempts that overlapped an occupied medium.
    pub collisions: u64,
    /// Frames destroyed by collisions (incoming and in-flight).
    pub frames_dropped: u64,
    /// Per-endpoint deliveries scheduled by completed transmissions.
    pub deliveries: u64,
}

impl ChannelStats {
    /// Fraction of medium-access attempts that collided.
    pub fn collision_rate(&self) -> f64 {
        let attempts = self.transmissions + self.collisions;
        if attempts == 0 {
            0.0
        } else {
            self.collisions as f64 / attempts as f64
        }
    }
}

/// The CSMA broadcast medium shared by every attached endpoint.
pub struct CsmaChannel {
    data_rate: DataRate,
    delay_nanos: u64,
    state: ChannelState,
    attachments: Vec<Attachment>,
    next_tx_seq: u64,
    stats: ChannelStats,
}

impl CsmaChannel {
    pub fn new(data_rate: DataRate, delay: Delay) -> Self {
        Self {
            data_rate,
            delay_nanos: delay.nanos(),
            state: ChannelState::Idle,
            attachments: Vec::new(),
            next_tx_seq: 0,
            stats: ChannelStats::default(),
        }
    }

    pub fn data_rate(&self) -> DataRate {
        self.data_rate
    }

    pub fn propagation_delay(&self) -> Duration {
        Duration::from_nanos(self.delay_nanos)
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ChannelState::Idle)
    }

    /// Registers an endpoint on the medium.
    pub fn attach(&mut self, endpoint: EndpointId) -> Result<AttachmentHandle, DuplicateAttachmentError> {
        if self
            .attachments
            .iter()
            .any(|a| a.active && a.endpoint == endpoint)
        {
            return Err(DuplicateAttachmentError { endpoint });
        }
        let handle = AttachmentHandle(self.attachments.len() as u32);
        self.attachments.push(Attachment {
            endpoint,
            active: true,
        });
        Ok(handle)
    }

    /// Releases an attachment; the endpoint no longer receives deliveries.
    pub fn detach(&mut self, handle: AttachmentHandle) {
        if let Some(attachment) = self.attachments.get_mut(handle.0 as usize) {
            attachment.active = false;
        }
    }

    pub fn is_active(&self, handle: AttachmentHandle) -> bool {
        self.attachments
            .get(handle.0 as usize)
            .map(|a| a.active)
            .unwrap_or(false)
    }

    /// Carrier-sense entry point, called when a transmit-start event
    /// dispatches.
    ///
    /// On an idle medium the frame occupies it for its transmission
    /// duration and a transmit-end is requested at the busy-until instant.
    /// On an occupied medium this is a collision: both frames are
    /// discarded and the medium stays jammed until the earlier of the two
    /// busy-until times.
    pub fn begin_transmit(
        &mut self,
        handle: AttachmentHandle,
        frame: Frame,
        now: u64,
    ) -> Vec<ScheduleRequest> {
        if !self.is_active(handle) {
            tracing::warn!(
                endpoint = %frame.source(),
                "transmit from a detached endpoint; frame dropped"
            );
            self.stats.frames_dropped += 1;
            return Vec::new();
        }

        let duration = self.data_rate.transmission_time(frame.len());
        let busy_until = now.saturating_add(duration.as_nanos() as u64);

        match std::mem::replace(&mut self.state, ChannelState::Idle) {
            ChannelState::Idle => {
                let tx_seq = self.next_tx_seq;
                self.next_tx_seq += 1;
                self.stats.transmissions += 1;
                tracing::debug!(
                    at = now,
                    endpoint = %frame.source(),
                    len = frame.len(),
                    busy_until,
                    "transmission started"
                );
                self.state = ChannelState::Transmitting {
                    ends_at: busy_until,
                    tx_seq,
                    live: Some((handle, frame)),
                };
                vec![ScheduleRequest::at(
                    busy_until,
                    EventKind::TransmitEnd { tx_seq },
                )]
            }
            ChannelState::Transmitting {
                ends_at,
                tx_seq,
                live,
            } => {
                self.stats.collisions += 1;
                self.stats.frames_dropped += 1;
                if let Some((_, in_flight)) = live {
                    self.stats.frames_dropped += 1;
                    tracing::warn!(
                        at = now,
                        incoming = %frame.source(),
                        in_flight = %in_flight.source(),
                        "collision on the medium; both frames dropped"
                    );
                } else {
                    tracing::warn!(
                        at = now,
                        incoming = %frame.source(),
                        "transmission into a jammed medium; frame dropped"
                    );
                }
                // The medium frees at the earlier busy-until. If the
                // incoming frame would have ended first, the end event
                // already in the queue is superseded by a fresh sequence
                // number and ignored when it fires.
                let (frees_at, seq, requests) = if busy_until < ends_at {
                    let fresh = self.next_tx_seq;
                    self.next_tx_seq += 1;
                    let request = ScheduleRequest::at(busy_until, EventKind::TransmitEnd { tx_seq: fresh });
                    (busy_until, fresh, vec![request])
                } else {
                    (ends_at, tx_seq, Vec::new())
                };
                self.state = ChannelState::Transmitting {
                    ends_at: frees_at,
                    tx_seq: seq,
                    live: None,
                };
                requests
            }
        }
    }

    /// Busy-until handler. A completed transmission fans its frame out to
    /// every other attached endpoint after the propagation delay; a
    /// collision residue just frees the medium. Superseded end events are
    /// ignored.
    pub fn transmit_end(&mut self, tx_seq: u64, now: u64) -> Vec<ScheduleRequest> {
        match std::mem::replace(&mut self.state, ChannelState::Idle) {
            ChannelState::Transmitting {
                tx_seq: current,
                live,
                ..
            } if current == tx_seq => match live {
                Some((sender, frame)) => {
                    let deliver_at = now.saturating_add(self.delay_nanos);
                    let requests: Vec<ScheduleRequest> = self
                        .attachments
                        .iter()
                        .enumerate()
                        .filter(|(index, a)| a.active && *index != sender.0 as usize)
                        .map(|(_, a)| {
                            ScheduleRequest::at(
                                deliver_at,
                                EventKind::Deliver {
                                    endpoint: a.endpoint,
                                    frame: frame.clone(),
                                },
                            )
                        })
                        .collect();
                    self.stats.deliveries += requests.len() as u64;
                    tracing::debug!(
                        at = now,
                        endpoint = %frame.source(),
                        receivers = requests.len(),
                        deliver_at,
                        "transmission complete"
                    );
                    requests
                }
                None => {
                    tracing::debug!(at = now, "medium freed after collision");
                    Vec::new()
                }
            },
            ChannelState::Idle => {
                tracing::trace!(at = now, tx_seq, "stale transmit end on idle medium");
                Vec::new()
            }
            other => {
                // A later transmission owns the medium now; this end event
                // belongs to one superseded by a collision.
                self.state = other;
                tracing::trace!(at = now, tx_seq, "superseded transmit end ignored");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for CsmaChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsmaChannel")
            .field("data_rate", &self.data_rate)
            .field("delay_nanos", &self.delay_nanos)
            .field("idle", &self.is_idle())
            .field("attached", &self.attachments.iter().filter(|a| a.active).count())
            .field("stats", &self.stats)
            .finish()
    }
}
