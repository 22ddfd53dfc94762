//! Service-request marker filtering.
//!
//! A Genesys unit announces a service request by sending the byte `0x80 + address`
//! twice, interleaved anywhere in the normal byte stream. Those bytes are never
//! part of a frame.

/// Service request raised by the unit at `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrqEvent {
    /// Bus address of the requesting unit
    pub address: u8,
}

/// Separates SRQ markers from frame bytes. Keeps state across reads so a
/// marker pair split over two reads is still recognised.
#[derive(Debug, Default)]
pub struct SrqFilter {
    half: Option<u8>,
}

impl SrqFilter {
    /// Append frame bytes of `input` to `out` and return the completed SRQs.
    pub fn filter(&mut self, input: &[u8], out: &mut Vec<u8>) -> Vec<SrqEvent> {
        let mut events = Vec::new();
        for &byte in input {
            if byte < 0x80 {
                self.half = None;
                out.push(byte);
                continue;
            }
            match self.half.take() {
                Some(first) if first == byte => events.push(SrqEvent {
                    address: byte - 0x80,
                }),
                _ => self.half = Some(byte),
            }
        }
        events
    }

    /// Forget a half-received marker.
    pub fn reset(&mut self) {
        self.half = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_pair_split_across_reads() {
        let mut filter = SrqFilter::default();
        let mut out = Vec::new();
        assert!(filter.filter(b"1.0\x83", &mut out).is_empty());
        let events = filter.filter(b"\x8300\r", &mut out);
        assert_eq!(events, vec![SrqEvent { address: 3 }]);
        assert_eq!(out, b"1.000\r");
    }

    #[test]
    fn test_lone_marker_is_dropped() {
        let mut filter = SrqFilter::default();
        let mut out = Vec::new();
        let events = filter.filter(b"O\x85K\r", &mut out);
        assert!(events.is_empty());
        assert_eq!(out, b"OK\r");
    }
}
