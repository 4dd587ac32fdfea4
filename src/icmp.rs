//! ICMP (component J).

use crate::ip::{IpIfaceInfo, IpStack, PROTOCOL_ICMP};
use crate::octet::checksum;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub const TYPE_ECHOREPLY: u8 = 0;
pub const TYPE_ECHO: u8 = 8;

const HDR_SIZE: usize = 8;

pub struct IcmpStack {
    ip: Arc<IpStack>,
}

impl IcmpStack {
    /// Registers the Echo/EchoReply handler as IP protocol 1. Mirrors
    /// `icmp_init`.
    pub fn init(ip: Arc<IpStack>) -> Arc<Self> {
        let icmp = Arc::new(IcmpStack { ip: ip.clone() });
        let handler = icmp.clone();
        ip.protocol_register(
            PROTOCOL_ICMP,
            Arc::new(move |data, src, dst, iface| handler.input(data, src, dst, iface)),
        )
        .expect("icmp: protocol 1 already registered");
        icmp
    }

    fn input(&self, data: &[u8], src: Ipv4Addr, _dst: Ipv4Addr, iface: &IpIfaceInfo) {
        if data.len() < HDR_SIZE {
            log::debug!("icmp: dropping short message from {src}");
            return;
        }
        if checksum(data, 0) != 0 {
            log::debug!("icmp: dropping message with bad checksum from {src}");
            return;
        }
        let kind = data[0];
        let code = data[1];
        let values = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let payload = &data[HDR_SIZE..];

        if kind == TYPE_ECHO {
            if let Err(err) = self.output(TYPE_ECHOREPLY, code, values, payload, iface.unicast, src) {
                log::warn!("icmp: failed to send echo reply to {src}: {err}");
            }
        } else {
            log::debug!("icmp: received type={kind} code={code} from {src} (no reply)");
        }
    }

    /// Builds an ICMP message and hands it to `ip_output`. Mirrors
    /// `icmp_output`.
    pub fn output(
        &self,
        kind: u8,
        code: u8,
        values: u32,
        payload: &[u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) -> Result<usize, crate::error::IpError> {
        let mut msg = Vec::with_capacity(HDR_SIZE + payload.len());
        msg.push(kind);
        msg.push(code);
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&values.to_be_bytes());
        msg.extend_from_slice(payload);
        let sum = checksum(&msg, 0);
        msg[2..4].copy_from_slice(&sum.to_be_bytes());
        self.ip.output(PROTOCOL_ICMP, &msg, src, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_reply_preserves_values_and_payload() {
        let mut msg = vec![TYPE_ECHO, 0, 0, 0, 0, 1, 0, 2];
        msg.extend_from_slice(b"ping");
        let sum = checksum(&msg, 0);
        msg[2..4].copy_from_slice(&sum.to_be_bytes());
        assert!(checksum(&msg, 0) == 0);

        let values = u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]);
        assert_eq!(values, 0x0001_0002);
        assert_eq!(&msg[HDR_SIZE..], b"ping");
    }
}
