//! UDP (component K).

use crate::error::{IpError, UdpError};
use crate::event::EventBus;
use crate::ip::{pseudo_header_seed, Endpoint, IpIfaceInfo, IpStack, PROTOCOL_UDP};
use crate::octet::{checksum, checksum_nonzero};
use crate::queue::Fifo;
use crate::sched::{SchedCtx, SchedState, SleepOutcome};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

pub const PCB_CAPACITY: usize = 16;
const EPHEMERAL_MIN: u16 = 49152;
const EPHEMERAL_MAX: u16 = 65535;
const HDR_SIZE: usize = 8;

pub type PcbId = usize;

struct Datagram {
    foreign: Endpoint,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PcbState {
    Free,
    Open,
    Closing,
}

struct Pcb {
    state: PcbState,
    local: Endpoint,
    queue: Fifo<Datagram>,
    sched: SchedState,
}

impl Pcb {
    fn free() -> Self {
        Pcb {
            state: PcbState::Free,
            local: Endpoint { addr: Ipv4Addr::UNSPECIFIED, port: 0 },
            queue: Fifo::new(),
            sched: SchedState::default(),
        }
    }
}

fn addrs_overlap(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    a == b || a == Ipv4Addr::UNSPECIFIED || b == Ipv4Addr::UNSPECIFIED
}

fn alloc_ephemeral_port(pcbs: &[Pcb], addr: Ipv4Addr) -> Option<u16> {
    (EPHEMERAL_MIN..=EPHEMERAL_MAX).find(|port| {
        !pcbs
            .iter()
            .any(|pcb| pcb.state == PcbState::Open && pcb.local.port == *port && addrs_overlap(pcb.local.addr, addr))
    })
}

/// 16-PCB table behind a single mutex (`spec.md` §5). The condition
/// variable for each PCB lives outside the mutex, in a fixed-length
/// sibling array indexed by the same id: `Condvar` is `Sync` on its own,
/// only the `interrupted`/`waiters` predicate it guards needs the lock.
pub struct UdpStack {
    ip: Arc<IpStack>,
    pcbs: Mutex<Vec<Pcb>>,
    ctxs: Vec<SchedCtx>,
}

impl UdpStack {
    /// Registers the protocol-17 handler and an event-bus subscriber that
    /// interrupts every open PCB. Mirrors `udp_init`.
    pub fn init(ip: Arc<IpStack>, events: &EventBus) -> Arc<Self> {
        let pcbs = (0..PCB_CAPACITY).map(|_| Pcb::free()).collect();
        let ctxs = (0..PCB_CAPACITY).map(|_| SchedCtx::new()).collect();
        let udp = Arc::new(UdpStack { ip: ip.clone(), pcbs: Mutex::new(pcbs), ctxs });

        let handler = udp.clone();
        ip.protocol_register(
            PROTOCOL_UDP,
            Arc::new(move |data, src, dst, iface| handler.input(data, src, dst, iface)),
        )
        .expect("udp: protocol 17 already registered");

        let interrupter = udp.clone();
        events.subscribe(move || interrupter.interrupt_all());
        udp
    }

    fn interrupt_all(&self) {
        let mut pcbs = self.pcbs.lock().expect("udp pcb table poisoned");
        for i in 0..pcbs.len() {
            if pcbs[i].state != PcbState::Free {
                self.ctxs[i].interrupt(&mut pcbs, |table| &mut table[i].sched);
            }
        }
    }

    /// Allocates a FREE pcb and marks it OPEN. Mirrors `udp_open`.
    pub fn open(&self) -> Result<PcbId, UdpError> {
        let mut pcbs = self.pcbs.lock().expect("udp pcb table poisoned");
        let id = pcbs.iter().position(|pcb| pcb.state == PcbState::Free).ok_or(UdpError::TableFull)?;
        pcbs[id] = Pcb::free();
        pcbs[id].state = PcbState::Open;
        Ok(id)
    }

    /// Binds `id` to `local`, rejecting a conflicting (addr, port) already
    /// bound by another OPEN pcb. Mirrors `udp_bind`.
    pub fn bind(&self, id: PcbId, local: Endpoint) -> Result<(), UdpError> {
        let mut pcbs = self.pcbs.lock().expect("udp pcb table poisoned");
        if pcbs.get(id).map(|pcb| pcb.state) != Some(PcbState::Open) {
            return Err(UdpError::NotOpen);
        }
        let conflict = pcbs
            .iter()
            .enumerate()
            .any(|(i, pcb)| i != id && pcb.state == PcbState::Open && pcb.local.port == local.port && addrs_overlap(pcb.local.addr, local.addr));
        if conflict {
            return Err(UdpError::AddressInUse);
        }
        pcbs[id].local = local;
        Ok(())
    }

    /// Marks `id` CLOSING; releases it immediately if no thread is
    /// sleeping on it, else wakes waiters so they observe CLOSING and
    /// release it themselves. Mirrors `udp_close`.
    pub fn close(&self, id: PcbId) -> Result<(), UdpError> {
        let mut pcbs = self.pcbs.lock().expect("udp pcb table poisoned");
        if pcbs.get(id).map(|pcb| pcb.state) != Some(PcbState::Open) {
            return Err(UdpError::NotOpen);
        }
        pcbs[id].state = PcbState::Closing;
        match crate::sched::destroy(&pcbs[id].sched) {
            Ok(()) => pcbs[id] = Pcb::free(),
            Err(_) => {
                drop(pcbs);
                self.ctxs[id].wakeup();
            }
        }
        Ok(())
    }

    /// Resolves a local address/port if unset, then sends. Mirrors
    /// `udp_sendto`.
    pub fn sendto(&self, id: PcbId, data: &[u8], foreign: Endpoint) -> Result<usize, UdpError> {
        let local = {
            let mut pcbs = self.pcbs.lock().expect("udp pcb table poisoned");
            if pcbs.get(id).map(|pcb| pcb.state) != Some(PcbState::Open) {
                return Err(UdpError::NotOpen);
            }
            if pcbs[id].local.addr == Ipv4Addr::UNSPECIFIED {
                pcbs[id].local.addr = self.ip.source_for(foreign.addr).ok_or(UdpError::Ip(IpError::Unreachable))?;
            }
            if pcbs[id].local.port == 0 {
                let addr = pcbs[id].local.addr;
                let port = alloc_ephemeral_port(&pcbs, addr).ok_or(UdpError::NoEphemeralPort)?;
                pcbs[id].local.port = port;
            }
            pcbs[id].local
        };
        self.output(local, foreign, data)
    }

    /// Builds a UDP datagram and hands it to `ip_output`. Mirrors
    /// `udp_output`.
    pub fn output(&self, src: Endpoint, dst: Endpoint, data: &[u8]) -> Result<usize, UdpError> {
        let total_len = HDR_SIZE + data.len();
        let mut msg = Vec::with_capacity(total_len);
        msg.extend_from_slice(&src.port.to_be_bytes());
        msg.extend_from_slice(&dst.port.to_be_bytes());
        msg.extend_from_slice(&(total_len as u16).to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(data);

        let seed = pseudo_header_seed(src.addr, dst.addr, PROTOCOL_UDP, total_len as u16);
        let sum = checksum_nonzero(checksum(&msg, seed));
        msg[6..8].copy_from_slice(&sum.to_be_bytes());

        self.ip.output(PROTOCOL_UDP, &msg, src.addr, dst.addr).map_err(UdpError::from)
    }

    fn input(&self, data: &[u8], src: Ipv4Addr, dst: Ipv4Addr, _iface: &IpIfaceInfo) {
        if data.len() < HDR_SIZE {
            log::debug!("udp: dropping short datagram from {src}");
            return;
        }
        let length = u16::from_be_bytes([data[4], data[5]]) as usize;
        if length != data.len() {
            log::debug!("udp: length mismatch ({length} vs {}) from {src}", data.len());
            return;
        }
        let sum = u16::from_be_bytes([data[6], data[7]]);
        if sum != 0 {
            let seed = pseudo_header_seed(src, dst, PROTOCOL_UDP, length as u16);
            if checksum(data, seed) != 0 {
                log::debug!("udp: dropping datagram with bad checksum from {src}");
                return;
            }
        }
        let src_port = u16::from_be_bytes([data[0], data[1]]);
        let dst_port = u16::from_be_bytes([data[2], data[3]]);
        let payload = &data[HDR_SIZE..];

        let mut pcbs = self.pcbs.lock().expect("udp pcb table poisoned");
        let Some(id) = pcbs
            .iter()
            .position(|pcb| pcb.state == PcbState::Open && pcb.local.port == dst_port && addrs_overlap(pcb.local.addr, dst))
        else {
            log::debug!("udp: no pcb bound to port {dst_port}");
            return;
        };
        pcbs[id].queue.push(Datagram { foreign: Endpoint { addr: src, port: src_port }, data: payload.to_vec() });
        drop(pcbs);
        self.ctxs[id].wakeup();
    }

    /// Pops one datagram, blocking on the PCB's context while the queue is
    /// empty. Mirrors `udp_recvfrom`.
    pub fn recvfrom(&self, id: PcbId, buf: &mut [u8]) -> Result<(usize, Endpoint), UdpError> {
        let mut pcbs = self.pcbs.lock().expect("udp pcb table poisoned");
        loop {
            match pcbs.get(id).map(|pcb| pcb.state) {
                Some(PcbState::Closing) => {
                    pcbs[id] = Pcb::free();
                    return Err(UdpError::NotOpen);
                }
                Some(PcbState::Open) => {}
                _ => return Err(UdpError::NotOpen),
            }
            if let Some(entry) = pcbs[id].queue.pop() {
                let n = entry.data.len().min(buf.len());
                buf[..n].copy_from_slice(&entry.data[..n]);
                return Ok((n, entry.foreign));
            }
            let (guard, outcome) = self.ctxs[id].sleep(pcbs, None, |table| &mut table[id].sched);
            pcbs = guard;
            if outcome == SleepOutcome::Interrupted {
                return Err(UdpError::Interrupted);
            }
        }
    }
}
