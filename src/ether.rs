//! Ethernet framing (component G).

use bit_field::BitField as _;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use std::str::FromStr;

pub const ADDR_LEN: usize = 6;
pub const HDR_SIZE: usize = 14;
pub const FRAME_SIZE_MIN: usize = 60;
pub const FRAME_SIZE_MAX: usize = 1514;
pub const PAYLOAD_SIZE_MIN: usize = FRAME_SIZE_MIN - HDR_SIZE;
pub const PAYLOAD_SIZE_MAX: usize = FRAME_SIZE_MAX - HDR_SIZE;

/// A 6-octet hardware address. All-zero is the wildcard `ANY`; all-one is
/// the broadcast address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EtherAddr(pub [u8; ADDR_LEN]);

impl EtherAddr {
    pub const ANY: EtherAddr = EtherAddr([0; ADDR_LEN]);
    pub const BROADCAST: EtherAddr = EtherAddr([0xff; ADDR_LEN]);

    pub const fn new(octets: [u8; ADDR_LEN]) -> Self {
        EtherAddr(octets)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for EtherAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid ethernet address")]
pub struct ParseEtherAddrError;

impl FromStr for EtherAddr {
    type Err = ParseEtherAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; ADDR_LEN];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or(ParseEtherAddrError)?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseEtherAddrError)?;
        }
        if parts.next().is_some() {
            return Err(ParseEtherAddrError);
        }
        Ok(EtherAddr(octets))
    }
}

/// EtherTypes carried in the 2-byte type field (IANA 802 numbers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum EtherType {
    Ip = 0x0800,
    Arp = 0x0806,
    Ipv6 = 0x86dd,
}

/// Builds a `[dst(6)][src(6)][type(2)][payload]` frame, zero-padding
/// payloads shorter than [`PAYLOAD_SIZE_MIN`] up to the 60-byte frame
/// floor. Mirrors `ether_transmit_helper`.
pub fn build_frame(dst: EtherAddr, src: EtherAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HDR_SIZE + payload.len().max(PAYLOAD_SIZE_MIN));
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    if payload.len() < PAYLOAD_SIZE_MIN {
        frame.resize(HDR_SIZE + PAYLOAD_SIZE_MIN, 0);
    }
    frame
}

/// Parsed view of an inbound frame that passed the address filter.
pub struct ParsedFrame<'a> {
    pub ethertype: u16,
    pub payload: &'a [u8],
}

/// Parses `frame`, rejecting anything below [`FRAME_SIZE_MIN`] minus the
/// trailing FCS the host NIC already strips, and filtering destination
/// addresses to `own` or broadcast. Mirrors `ether_input_helper`.
pub fn parse_frame(frame: &[u8], own: EtherAddr) -> Option<ParsedFrame<'_>> {
    if frame.len() < HDR_SIZE {
        return None;
    }
    let dst = EtherAddr(frame[0..6].try_into().unwrap());
    if dst != own && !dst.is_broadcast() {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    Some(ParsedFrame { ethertype, payload: &frame[HDR_SIZE..] })
}

/// Extracts the 4-bit version and 4-bit IHL nibbles packed into an IPv4
/// header's first octet, using the bit-field view rather than manual shift
/// masks.
pub fn split_nibbles(octet: u8) -> (u8, u8) {
    (octet.get_bits(4..8), octet.get_bits(0..4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_payload_is_padded_to_frame_floor() {
        let frame = build_frame(EtherAddr::BROADCAST, EtherAddr::ANY, 0x0800, &[1, 2, 3]);
        assert_eq!(frame.len(), FRAME_SIZE_MIN);
    }

    #[test]
    fn parse_rejects_foreign_unicast() {
        let frame = build_frame(EtherAddr([9; 6]), EtherAddr::ANY, 0x0800, &[0; 46]);
        assert!(parse_frame(&frame, EtherAddr([1; 6])).is_none());
    }

    #[test]
    fn parse_accepts_broadcast() {
        let frame = build_frame(EtherAddr::BROADCAST, EtherAddr::ANY, 0x0806, &[0; 46]);
        let parsed = parse_frame(&frame, EtherAddr([1; 6])).unwrap();
        assert_eq!(parsed.ethertype, 0x0806);
    }

    #[test]
    fn addr_round_trips_through_display_and_from_str() {
        let addr = EtherAddr([0x00, 0x00, 0x5e, 0x00, 0x53, 0x01]);
        let text = addr.to_string();
        assert_eq!(text, "00:00:5e:00:53:01");
        assert_eq!(text.parse::<EtherAddr>().unwrap(), addr);
    }

    #[test]
    fn nibble_split_matches_manual_shift() {
        let octet = 0x45;
        assert_eq!(split_nibbles(octet), (4, 5));
    }
}
