//! Link-layer frame model.
//!
//! Frames are opaque byte sequences; the emulator never parses past the
//! Ethernet addressing fields, and only does that for local-mode forwarding
//! decisions. Payloads are immutable and cheap to clone, so fanning a frame
//! out to every endpoint shares one buffer.

use bytes::Bytes;

/// Identity of a channel attachment point, assigned by the node registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(u32);

impl EndpointId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self(octets))
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// Group bit of the first octet; set for broadcast as well.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// An immutable frame in flight through the pipeline.
///
/// Carries the raw bytes read off the source interface, the endpoint that
/// injected it, and the simulated time at which it arrived at that bridge.
#[derive(Clone)]
pub struct Frame {
    payload: Bytes,
    source: EndpointId,
    arrived_at: u64,
}

impl Frame {
    pub fn new(payload: Bytes, source: EndpointId, arrived_at: u64) -> Self {
        Self {
            payload,
            source,
            arrived_at,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn source(&self) -> EndpointId {
        self.source
    }

    /// Simulated time at which the source bridge ingested this frame.
    pub fn arrived_at(&self) -> u64 {
        self.arrived_at
    }

    /// Destination address, if the frame is long enough to carry one.
    pub fn destination(&self) -> Option<MacAddr> {
        MacAddr::from_slice(&self.payload)
    }

    /// Source address, if the frame is long enough to carry one.
    pub fn source_mac(&self) -> Option<MacAddr> {
        MacAddr::from_slice(self.payload.get(6..)?)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.payload.len())
            .field("source", &self.source)
            .field("arrived_at", &self.arrived_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_header(dst: [u8; 6], src: [u8; 6]) -> Frame {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&dst);
        bytes.extend_from_slice(&src);
        bytes.extend_from_slice(&[0x08, 0x00, 0xaa, 0xbb]);
        Frame::new(Bytes::from(bytes), EndpointId::new(0), 0)
    }

    #[test]
    fn extracts_addresses_from_the_header() {
        let frame = frame_with_header([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 7]);
        assert_eq!(
            frame.destination(),
            MacAddr::from_slice(&[2, 0, 0, 0, 0, 1])
        );
        assert_eq!(frame.source_mac(), MacAddr::from_slice(&[2, 0, 0, 0, 0, 7]));
    }

    #[test]
    fn runt_frames_have_no_addresses() {
        let frame = Frame::new(Bytes::from_static(&[1, 2, 3]), EndpointId::new(1), 10);
        assert!(frame.destination().is_none());
        assert!(frame.source_mac().is_none());
    }

    #[test]
    fn broadcast_and_multicast_bits() {
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr::BROADCAST.is_multicast());

        let multicast = MacAddr::from_slice(&[0x01, 0x00, 0x5e, 0, 0, 1]).unwrap();
        assert!(multicast.is_multicast());
        assert!(!multicast.is_broadcast());

        let unicast = MacAddr::from_slice(&[0x02, 0, 0, 0, 0, 1]).unwrap();
        assert!(!unicast.is_multicast());
    }

    #[test]
    fn mac_display_is_colon_separated_hex() {
        let mac = MacAddr::from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]).unwrap();
        assert_eq!(mac.to_string(), "de:ad:be:ef:00:01");
    }
}
