//! TCP, RFC-793 subset (component L).
//!
//! Grounded on `examples/original_source/tcp.c`, which fully implements
//! only the passive-open path (LISTEN → SYN_RECEIVED → ESTABLISHED, RST on
//! unexpected segments). `spec.md` §9 open question 1 is resolved as (b):
//! this module completes the subset with established-state data transfer,
//! ACK generation, and graceful FIN teardown, since `spec.md` §4.11 step 7
//! and §8 scenario 6 both name that as required of a correct rewrite.
//! Active open remains out of scope (`spec.md` §1 Non-goals).

use crate::error::TcpError;
use crate::event::EventBus;
use crate::ip::{pseudo_header_seed, Endpoint, IpIfaceInfo, IpStack, PROTOCOL_TCP};
use crate::octet::{checksum, checksum_nonzero};
use crate::sched::{SchedCtx, SchedState, SleepOutcome};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const PCB_CAPACITY: usize = 16;
const HDR_SIZE: usize = 20;
const RX_BUF_CAPACITY: usize = 65535;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_PSH: u8 = 0x08;
const FLAG_ACK: u8 = 0x10;
#[allow(dead_code)]
const FLAG_URG: u8 = 0x20;

pub type PcbId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Free,
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

#[derive(Debug, Default, Clone, Copy)]
struct SndVars {
    nxt: u32,
    una: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct RcvVars {
    nxt: u32,
    wnd: u16,
}

struct Pcb {
    state: TcpState,
    local: Endpoint,
    foreign: Endpoint,
    snd: SndVars,
    iss: u32,
    rcv: RcvVars,
    irs: u32,
    rxbuf: VecDeque<u8>,
    sched: SchedState,
}

impl Pcb {
    fn free() -> Self {
        Pcb {
            state: TcpState::Free,
            local: Endpoint { addr: Ipv4Addr::UNSPECIFIED, port: 0 },
            foreign: Endpoint { addr: Ipv4Addr::UNSPECIFIED, port: 0 },
            snd: SndVars::default(),
            iss: 0,
            rcv: RcvVars::default(),
            irs: 0,
            rxbuf: VecDeque::new(),
            sched: SchedState::default(),
        }
    }
}

/// `true` iff `ack` lies in `(una, nxt]`, using wrapping 32-bit sequence
/// arithmetic (RFC 793 §3.3).
fn ack_in_window(ack: u32, una: u32, nxt: u32) -> bool {
    let window = nxt.wrapping_sub(una);
    let delta = ack.wrapping_sub(una);
    delta != 0 && delta <= window
}

/// A non-cryptographic but non-repeating ISS, combining a monotonic
/// counter with the connection 4-tuple so concurrent handshakes to the
/// same peer don't collide. Mirrors `tcp_pcb_get_iss`'s call to `random()`.
fn initial_seq(local: Endpoint, foreign: Endpoint) -> u32 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = counter
        ^ (u64::from(local.port) << 48)
        ^ (u64::from(foreign.port) << 32)
        ^ u64::from(u32::from(foreign.addr));
    ChaCha8Rng::seed_from_u64(seed).next_u32()
}

struct Header {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
}

impl Header {
    fn build(&self, payload: &[u8], pseudo_seed: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; HDR_SIZE + payload.len()];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.seq.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack.to_be_bytes());
        bytes[12] = 5 << 4; // data offset = 5 words, no options
        bytes[13] = self.flags;
        bytes[14..16].copy_from_slice(&self.window.to_be_bytes());
        bytes[HDR_SIZE..].copy_from_slice(payload);
        let sum = checksum_nonzero(checksum(&bytes, pseudo_seed));
        bytes[16..18].copy_from_slice(&sum.to_be_bytes());
        bytes
    }

    fn parse(data: &[u8]) -> Option<(Header, &[u8])> {
        if data.len() < HDR_SIZE {
            return None;
        }
        let doff = (data[12] >> 4) as usize * 4;
        if doff < HDR_SIZE || data.len() < doff {
            return None;
        }
        let header = Header {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
        };
        Some((header, &data[doff..]))
    }
}

/// 16-PCB table behind a single mutex, condition variables held outside
/// it (see `udp::UdpStack` docs for why).
pub struct TcpStack {
    ip: Arc<IpStack>,
    pcbs: Mutex<Vec<Pcb>>,
    ctxs: Vec<SchedCtx>,
}

impl TcpStack {
    /// Registers the protocol-6 handler and an event-bus subscriber that
    /// interrupts every live PCB. Mirrors `tcp_init`.
    pub fn init(ip: Arc<IpStack>, events: &EventBus) -> Arc<Self> {
        let pcbs = (0..PCB_CAPACITY).map(|_| Pcb::free()).collect();
        let ctxs = (0..PCB_CAPACITY).map(|_| SchedCtx::new()).collect();
        let tcp = Arc::new(TcpStack { ip: ip.clone(), pcbs: Mutex::new(pcbs), ctxs });

        let handler = tcp.clone();
        ip.protocol_register(
            PROTOCOL_TCP,
            Arc::new(move |data, src, dst, iface| handler.input(data, src, dst, iface)),
        )
        .expect("tcp: protocol 6 already registered");

        let interrupter = tcp.clone();
        events.subscribe(move || interrupter.interrupt_all());
        tcp
    }

    fn interrupt_all(&self) {
        let mut pcbs = self.pcbs.lock().expect("tcp pcb table poisoned");
        for i in 0..pcbs.len() {
            if pcbs[i].state != TcpState::Free {
                self.ctxs[i].interrupt(&mut pcbs, |table| &mut table[i].sched);
            }
        }
    }

    fn send_segment(&self, local: Endpoint, foreign: Endpoint, seq: u32, ack: u32, flags: u8, payload: &[u8]) {
        let header = Header { src_port: local.port, dst_port: foreign.port, seq, ack, flags, window: RX_BUF_CAPACITY as u16 };
        let seed = pseudo_header_seed(local.addr, foreign.addr, PROTOCOL_TCP, (HDR_SIZE + payload.len()) as u16);
        let segment = header.build(payload, seed);
        if let Err(err) = self.ip.output(PROTOCOL_TCP, &segment, local.addr, foreign.addr) {
            log::warn!("tcp: failed to send segment to {foreign}: {err}");
        }
    }

    fn reply_rst(&self, local: Endpoint, foreign: Endpoint, hdr: &Header, seg_len: u32) {
        if hdr.flags & FLAG_ACK == 0 {
            self.send_segment(local, foreign, 0, hdr.seq.wrapping_add(seg_len), FLAG_RST | FLAG_ACK, &[]);
        } else {
            self.send_segment(local, foreign, hdr.ack, 0, FLAG_RST, &[]);
        }
    }

    /// Opens a passive-open listener and blocks until the handshake
    /// completes. Mirrors `tcp_open_rfc793`; active open is a declared
    /// non-goal.
    pub fn open_rfc793(&self, local: Endpoint, foreign: Option<Endpoint>, active: bool) -> Result<PcbId, TcpError> {
        if active {
            return Err(TcpError::Unsupported);
        }
        let mut pcbs = self.pcbs.lock().expect("tcp pcb table poisoned");
        let id = pcbs.iter().position(|pcb| pcb.state == TcpState::Free).ok_or(TcpError::TableFull)?;
        pcbs[id] = Pcb::free();
        pcbs[id].state = TcpState::Listen;
        pcbs[id].local = local;
        pcbs[id].foreign = foreign.unwrap_or(Endpoint { addr: Ipv4Addr::UNSPECIFIED, port: 0 });
        pcbs[id].rcv.wnd = RX_BUF_CAPACITY as u16;

        loop {
            match pcbs[id].state {
                TcpState::Established => return Ok(id),
                TcpState::Listen | TcpState::SynReceived => {}
                _ => {
                    pcbs[id] = Pcb::free();
                    return Err(TcpError::Reset);
                }
            }
            let (guard, outcome) = self.ctxs[id].sleep(pcbs, None, |table| &mut table[id].sched);
            pcbs = guard;
            if outcome == SleepOutcome::Interrupted {
                pcbs[id] = Pcb::free();
                return Err(TcpError::Interrupted);
            }
        }
    }

    /// Releases a PCB. From ESTABLISHED (and other non-graceful states)
    /// this sends RST and frees immediately, matching `spec.md` §8
    /// scenario 6 and the reference's minimal `tcp_close`. From
    /// CLOSE_WAIT it instead sends FIN and waits for the peer's ACK
    /// (LAST_ACK → CLOSED), completing the graceful half of RFC-793 that
    /// the reference leaves unfinished.
    pub fn close(&self, id: PcbId) -> Result<(), TcpError> {
        let mut pcbs = self.pcbs.lock().expect("tcp pcb table poisoned");
        let state = pcbs.get(id).ok_or(TcpError::Closed)?.state;
        match state {
            TcpState::Free | TcpState::Closed => Err(TcpError::Closed),
            TcpState::CloseWait => {
                let (local, foreign, seq, ack) = (pcbs[id].local, pcbs[id].foreign, pcbs[id].snd.nxt, pcbs[id].rcv.nxt);
                pcbs[id].state = TcpState::LastAck;
                pcbs[id].snd.nxt = seq.wrapping_add(1);
                self.send_segment(local, foreign, seq, ack, FLAG_FIN | FLAG_ACK, &[]);
                Ok(())
            }
            _ => {
                let (local, foreign, seq) = (pcbs[id].local, pcbs[id].foreign, pcbs[id].snd.nxt);
                pcbs[id] = Pcb::free();
                if foreign.port != 0 {
                    self.send_segment(local, foreign, seq, 0, FLAG_RST, &[]);
                }
                Ok(())
            }
        }
    }

    /// Sends `data` immediately as one PSH,ACK segment. Flow control
    /// beyond the advertised receive window and retransmission are
    /// declared non-goals, so there is no unacked-data queue to manage.
    pub fn send(&self, id: PcbId, data: &[u8]) -> Result<usize, TcpError> {
        let (local, foreign, seq, ack) = {
            let mut pcbs = self.pcbs.lock().expect("tcp pcb table poisoned");
            let pcb = pcbs.get_mut(id).ok_or(TcpError::Closed)?;
            if !matches!(pcb.state, TcpState::Established | TcpState::CloseWait) {
                return Err(TcpError::Closed);
            }
            let seq = pcb.snd.nxt;
            let ack = pcb.rcv.nxt;
            pcb.snd.nxt = seq.wrapping_add(data.len() as u32);
            (pcb.local, pcb.foreign, seq, ack)
        };
        self.send_segment(local, foreign, seq, ack, FLAG_PSH | FLAG_ACK, data);
        Ok(data.len())
    }

    /// Blocks until the stream has bytes to consume or the peer half-
    /// closes (FIN observed), returning `Ok(0)` at end-of-stream. Mirrors
    /// `tcp_receive`.
    pub fn receive(&self, id: PcbId, buf: &mut [u8]) -> Result<usize, TcpError> {
        let mut pcbs = self.pcbs.lock().expect("tcp pcb table poisoned");
        loop {
            let state = pcbs.get(id).ok_or(TcpError::Closed)?.state;
            if !pcbs[id].rxbuf.is_empty() {
                let n = buf.len().min(pcbs[id].rxbuf.len());
                for slot in &mut buf[..n] {
                    *slot = pcbs[id].rxbuf.pop_front().expect("checked non-empty above");
                }
                return Ok(n);
            }
            match state {
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {}
                TcpState::CloseWait | TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => return Ok(0),
                _ => return Err(TcpError::Closed),
            }
            let (guard, outcome) = self.ctxs[id].sleep(pcbs, None, |table| &mut table[id].sched);
            pcbs = guard;
            if outcome == SleepOutcome::Interrupted {
                return Err(TcpError::Interrupted);
            }
        }
    }

    /// The SEGMENT ARRIVES pipeline (`spec.md` §4.11), executed entirely
    /// under the PCB table mutex.
    fn input(&self, data: &[u8], src: Ipv4Addr, dst: Ipv4Addr, _iface: &IpIfaceInfo) {
        if src == Ipv4Addr::BROADCAST || dst == Ipv4Addr::BROADCAST {
            log::debug!("tcp: dropping segment on broadcast address");
            return;
        }
        let Some((hdr, payload)) = Header::parse(data) else {
            log::debug!("tcp: dropping malformed segment from {src}");
            return;
        };
        let seed = pseudo_header_seed(src, dst, PROTOCOL_TCP, data.len() as u16);
        if checksum(data, seed) != 0 {
            log::debug!("tcp: dropping segment with bad checksum from {src}");
            return;
        }

        let local = Endpoint { addr: dst, port: hdr.dst_port };
        let foreign = Endpoint { addr: src, port: hdr.src_port };
        let seg_len =
            payload.len() as u32 + u32::from(hdr.flags & FLAG_SYN != 0) + u32::from(hdr.flags & FLAG_FIN != 0);

        let mut pcbs = self.pcbs.lock().expect("tcp pcb table poisoned");
        let id = pcbs
            .iter()
            .position(|pcb| {
                !matches!(pcb.state, TcpState::Free | TcpState::Listen) && pcb.local == local && pcb.foreign == foreign
            })
            .or_else(|| {
                pcbs.iter().position(|pcb| {
                    pcb.state == TcpState::Listen
                        && (pcb.local.addr == Ipv4Addr::UNSPECIFIED || pcb.local.addr == local.addr)
                        && pcb.local.port == local.port
                })
            });

        let Some(id) = id else {
            if hdr.flags & FLAG_RST == 0 {
                self.reply_rst(local, foreign, &hdr, seg_len);
            }
            return;
        };

        match pcbs[id].state {
            TcpState::Listen => {
                if hdr.flags & FLAG_RST != 0 {
                    return;
                }
                if hdr.flags & FLAG_ACK != 0 {
                    self.reply_rst(local, foreign, &hdr, seg_len);
                    return;
                }
                if hdr.flags & FLAG_SYN == 0 {
                    return;
                }
                let iss = initial_seq(local, foreign);
                let rcv_nxt = hdr.seq.wrapping_add(1);
                pcbs[id].local = local;
                pcbs[id].foreign = foreign;
                pcbs[id].rcv.nxt = rcv_nxt;
                pcbs[id].rcv.wnd = RX_BUF_CAPACITY as u16;
                pcbs[id].irs = hdr.seq;
                pcbs[id].iss = iss;
                pcbs[id].snd.nxt = iss.wrapping_add(1);
                pcbs[id].snd.una = iss;
                pcbs[id].state = TcpState::SynReceived;
                self.send_segment(local, foreign, iss, rcv_nxt, FLAG_SYN | FLAG_ACK, &[]);
            }
            TcpState::SynReceived => {
                if hdr.flags & FLAG_RST != 0 {
                    pcbs[id] = Pcb::free();
                    return;
                }
                let (una, nxt) = (pcbs[id].snd.una, pcbs[id].snd.nxt);
                if hdr.flags & FLAG_ACK != 0 && ack_in_window(hdr.ack, una, nxt) {
                    pcbs[id].snd.una = hdr.ack;
                    pcbs[id].state = TcpState::Established;
                    self.ctxs[id].wakeup();
                } else {
                    self.reply_rst(local, foreign, &hdr, seg_len);
                }
            }
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimeWait => self.segment_arrives_open(id, &mut pcbs, &hdr, payload, local, foreign),
            TcpState::Free | TcpState::Closed | TcpState::SynSent => {
                if hdr.flags & FLAG_RST == 0 {
                    self.reply_rst(local, foreign, &hdr, seg_len);
                }
            }
        }
    }

    /// Step 7 of the arrival pipeline for a connection past the
    /// handshake: ACK processing, in-order data delivery, and FIN →
    /// CLOSE_WAIT. Completes the subset the reference leaves unfinished.
    fn segment_arrives_open(
        &self,
        id: PcbId,
        pcbs: &mut Vec<Pcb>,
        hdr: &Header,
        payload: &[u8],
        local: Endpoint,
        foreign: Endpoint,
    ) {
        if hdr.flags & FLAG_RST != 0 {
            pcbs[id] = Pcb::free();
            return;
        }

        if hdr.flags & FLAG_ACK != 0 {
            let (una, nxt) = (pcbs[id].snd.una, pcbs[id].snd.nxt);
            if ack_in_window(hdr.ack, una, nxt) || hdr.ack == nxt {
                pcbs[id].snd.una = hdr.ack;
            }
            if pcbs[id].state == TcpState::LastAck && hdr.ack == pcbs[id].snd.nxt {
                pcbs[id] = Pcb::free();
                return;
            }
        }

        let mut should_ack = false;
        if !payload.is_empty()
            && hdr.seq == pcbs[id].rcv.nxt
            && matches!(pcbs[id].state, TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2)
        {
            let room = RX_BUF_CAPACITY.saturating_sub(pcbs[id].rxbuf.len());
            let take = payload.len().min(room);
            pcbs[id].rxbuf.extend(payload[..take].iter().copied());
            pcbs[id].rcv.nxt = pcbs[id].rcv.nxt.wrapping_add(take as u32);
            should_ack = true;
        }

        if hdr.flags & FLAG_FIN != 0 && hdr.seq.wrapping_add(payload.len() as u32) == pcbs[id].rcv.nxt {
            pcbs[id].rcv.nxt = pcbs[id].rcv.nxt.wrapping_add(1);
            if pcbs[id].state == TcpState::Established {
                pcbs[id].state = TcpState::CloseWait;
            }
            should_ack = true;
        }

        if should_ack {
            let (seq, ack) = (pcbs[id].snd.nxt, pcbs[id].rcv.nxt);
            self.send_segment(local, foreign, seq, ack, FLAG_ACK, &[]);
            self.ctxs[id].wakeup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arp::ArpTable;
    use crate::device::{loopback::LoopbackDriver, DeviceFlags, DeviceParams, DeviceType, Registry};
    use crate::interrupt::Interrupts;
    use std::thread;
    use std::time::Duration;

    fn loopback_stack() -> (Arc<IpStack>, Arc<Interrupts>) {
        let interrupts = Interrupts::new();
        let registry = Arc::new(Registry::new());
        let driver = LoopbackDriver::new(1, interrupts.clone());
        let dev = registry.register(DeviceParams {
            kind: DeviceType::Loopback,
            mtu: 65535,
            flags: DeviceFlags::UP | DeviceFlags::LOOPBACK,
            hlen: 0,
            alen: 0,
            addr: Default::default(),
            broadcast: Default::default(),
            ops: driver.clone(),
        });
        let arp = ArpTable::new();
        let ip = IpStack::new(registry, arp);
        ip.iface_register(&dev, "127.0.0.1".parse().unwrap(), "255.0.0.0".parse().unwrap());

        let ip2 = ip.clone();
        let dev2 = dev.clone();
        interrupts
            .request_irq(1, "loopback", crate::interrupt::IrqFlags::Exclusive, move || {
                driver.drain(|ethertype, data| {
                    if ethertype == u16::from(crate::ether::EtherType::Ip) {
                        ip2.input(data, &dev2);
                    }
                });
            })
            .unwrap();
        (ip, interrupts)
    }

    #[test]
    fn active_open_is_rejected() {
        let (ip, interrupts) = loopback_stack();
        let events = EventBus::new();
        let tcp = TcpStack::init(ip, &events);
        let result = tcp.open_rfc793(Endpoint { addr: "127.0.0.1".parse().unwrap(), port: 7 }, None, true);
        assert!(matches!(result, Err(TcpError::Unsupported)));
        interrupts.shutdown();
    }

    #[test]
    fn ack_window_check_matches_rfc793_half_open_interval() {
        assert!(ack_in_window(11, 10, 20));
        assert!(ack_in_window(20, 10, 20));
        assert!(!ack_in_window(10, 10, 20));
        assert!(!ack_in_window(21, 10, 20));
    }

    #[test]
    fn passive_open_reaches_established_and_close_sends_rst() {
        let (ip, interrupts) = loopback_stack();
        let events = EventBus::new();
        let tcp = TcpStack::init(ip.clone(), &events);

        let local = Endpoint { addr: "127.0.0.1".parse().unwrap(), port: 7 };
        let tcp2 = tcp.clone();
        let server = thread::spawn(move || tcp2.open_rfc793(local, None, false));

        thread::sleep(Duration::from_millis(10));
        // Drive a minimal external handshake directly through `IpStack::input`
        // the way an independent peer's segments would arrive.
        let client_iss = 1000u32;
        let syn = Header { src_port: 4000, dst_port: 7, seq: client_iss, ack: 0, flags: FLAG_SYN, window: 4096 };
        let seed = pseudo_header_seed(
            "127.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            PROTOCOL_TCP,
            HDR_SIZE as u16,
        );
        tcp.input(&syn.build(&[], seed), "127.0.0.1".parse().unwrap(), "127.0.0.1".parse().unwrap(), &dummy_iface(&ip));

        thread::sleep(Duration::from_millis(10));
        let server_iss = {
            let pcbs = tcp.pcbs.lock().unwrap();
            let pcb = pcbs.iter().find(|p| p.state == TcpState::SynReceived).expect("pcb reached SYN_RECEIVED");
            pcb.iss
        };

        let ack = Header {
            src_port: 4000,
            dst_port: 7,
            seq: client_iss.wrapping_add(1),
            ack: server_iss.wrapping_add(1),
            flags: FLAG_ACK,
            window: 4096,
        };
        tcp.input(&ack.build(&[], seed), "127.0.0.1".parse().unwrap(), "127.0.0.1".parse().unwrap(), &dummy_iface(&ip));

        let id = server.join().unwrap().unwrap();
        assert_eq!(tcp.pcbs.lock().unwrap()[id].state, TcpState::Established);

        tcp.close(id).unwrap();
        assert_eq!(tcp.pcbs.lock().unwrap()[id].state, TcpState::Free);
        interrupts.shutdown();
    }

    #[test]
    fn wildcard_bound_listener_accepts_a_handshake_on_any_local_address() {
        let (ip, interrupts) = loopback_stack();
        let events = EventBus::new();
        let tcp = TcpStack::init(ip.clone(), &events);

        let local = Endpoint { addr: Ipv4Addr::UNSPECIFIED, port: 7 };
        let tcp2 = tcp.clone();
        let server = thread::spawn(move || tcp2.open_rfc793(local, None, false));

        thread::sleep(Duration::from_millis(10));
        let client_iss = 2000u32;
        let syn = Header { src_port: 4001, dst_port: 7, seq: client_iss, ack: 0, flags: FLAG_SYN, window: 4096 };
        let seed = pseudo_header_seed(
            "127.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            PROTOCOL_TCP,
            HDR_SIZE as u16,
        );
        tcp.input(&syn.build(&[], seed), "127.0.0.1".parse().unwrap(), "127.0.0.1".parse().unwrap(), &dummy_iface(&ip));

        thread::sleep(Duration::from_millis(10));
        let (server_iss, pinned_local) = {
            let pcbs = tcp.pcbs.lock().unwrap();
            let pcb = pcbs.iter().find(|p| p.state == TcpState::SynReceived).expect("pcb reached SYN_RECEIVED");
            (pcb.iss, pcb.local)
        };
        // The wildcard listener must have pinned the concrete destination
        // address of the inbound SYN, not kept the 0.0.0.0 wildcard.
        assert_eq!(pinned_local, Endpoint { addr: "127.0.0.1".parse().unwrap(), port: 7 });

        let ack = Header {
            src_port: 4001,
            dst_port: 7,
            seq: client_iss.wrapping_add(1),
            ack: server_iss.wrapping_add(1),
            flags: FLAG_ACK,
            window: 4096,
        };
        tcp.input(&ack.build(&[], seed), "127.0.0.1".parse().unwrap(), "127.0.0.1".parse().unwrap(), &dummy_iface(&ip));

        let id = server.join().unwrap().unwrap();
        assert_eq!(tcp.pcbs.lock().unwrap()[id].state, TcpState::Established);
        interrupts.shutdown();
    }

    fn dummy_iface(ip: &Arc<IpStack>) -> IpIfaceInfo {
        ip.iface_select("127.0.0.1".parse().unwrap()).expect("loopback iface registered")
    }
}
