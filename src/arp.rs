//! ARP resolver (component H).

use crate::device::{Device, DeviceType};
use crate::error::ArpError;
use crate::ether::{EtherAddr, EtherType};
use crate::interrupt::Interrupts;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const CACHE_SIZE: usize = 32;
const HRD_ETHERNET: u16 = 1;
const OP_REQUEST: u16 = 1;
const OP_REPLY: u16 = 2;

/// How stale a non-STATIC entry may get before the expiry sweeper reclaims
/// it (`spec.md` §9 open question 2 — added behind the existing timer
/// subsystem, since the reference cache has no wall-clock expiry pass).
const ENTRY_TTL: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Free,
    Incomplete,
    Resolved,
    Static,
}

#[derive(Debug, Clone)]
struct Entry {
    state: State,
    pa: Ipv4Addr,
    ha: EtherAddr,
    timestamp: Instant,
}

impl Entry {
    fn free() -> Self {
        Entry { state: State::Free, pa: Ipv4Addr::UNSPECIFIED, ha: EtherAddr::ANY, timestamp: Instant::now() }
    }
}

struct Cache {
    entries: Vec<Entry>,
}

impl Cache {
    fn new() -> Self {
        Cache { entries: (0..CACHE_SIZE).map(|_| Entry::free()).collect() }
    }

    fn select(&self, pa: Ipv4Addr) -> Option<usize> {
        self.entries.iter().position(|e| e.state != State::Free && e.pa == pa)
    }

    /// First FREE entry, else the oldest non-STATIC entry (cleared first).
    /// Mirrors `arp_cache_alloc`.
    fn alloc(&mut self) -> Option<usize> {
        if let Some(i) = self.entries.iter().position(|e| e.state == State::Free) {
            return Some(i);
        }
        let oldest = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state != State::Static)
            .min_by_key(|(_, e)| e.timestamp)
            .map(|(i, _)| i)?;
        self.entries[oldest] = Entry::free();
        Some(oldest)
    }

    /// If an entry for `pa` exists and is not STATIC, overwrites `ha` and
    /// refreshes the timestamp; else returns `false`.
    fn update(&mut self, pa: Ipv4Addr, ha: EtherAddr) -> bool {
        match self.select(pa) {
            Some(i) if self.entries[i].state != State::Static => {
                self.entries[i].ha = ha;
                self.entries[i].state = State::Resolved;
                self.entries[i].timestamp = Instant::now();
                true
            }
            _ => false,
        }
    }

    fn insert(&mut self, pa: Ipv4Addr, ha: EtherAddr) -> Result<(), ArpError> {
        let i = self.alloc().ok_or(ArpError::CacheFull)?;
        self.entries[i] = Entry { state: State::Resolved, pa, ha, timestamp: Instant::now() };
        Ok(())
    }
}

pub struct ArpTable {
    cache: Mutex<Cache>,
}

impl ArpTable {
    pub fn new() -> Arc<Self> {
        Arc::new(ArpTable { cache: Mutex::new(Cache::new()) })
    }

    /// Registers the periodic expiry sweeper on `interrupts` (open question
    /// 2): entries older than [`ENTRY_TTL`] and not STATIC are reclaimed.
    pub fn install_expiry_sweeper(self: &Arc<Self>, interrupts: &Arc<Interrupts>) {
        let table = self.clone();
        interrupts.register_timer(Duration::from_secs(30), move || table.sweep_expired());
    }

    fn sweep_expired(&self) {
        let mut cache = self.cache.lock().expect("arp cache poisoned");
        let now = Instant::now();
        for entry in cache.entries.iter_mut() {
            if entry.state == State::Resolved && now.duration_since(entry.timestamp) > ENTRY_TTL {
                log::debug!("arp: expiring stale entry for {}", entry.pa);
                *entry = Entry::free();
            }
        }
    }

    /// Resolves `pa` to a hardware address reachable from `dev`. Requires
    /// an Ethernet device with an IP interface attached. Mirrors
    /// `arp_resolve`.
    pub fn resolve(&self, dev: &Arc<Device>, pa: Ipv4Addr) -> Result<EtherAddr, ArpError> {
        if dev.kind != DeviceType::Ethernet {
            return Err(ArpError::Unsupported);
        }
        dev.with_ip_iface(|_| ()).ok_or_else(|| crate::error::DeviceError::NoSuchInterface(dev.name.clone()))?;

        let mut cache = self.cache.lock().expect("arp cache poisoned");
        match cache.select(pa) {
            None => {
                let i = cache.alloc().ok_or(ArpError::CacheFull)?;
                cache.entries[i] = Entry { state: State::Incomplete, pa, ha: EtherAddr::ANY, timestamp: Instant::now() };
                drop(cache);
                self.send_request(dev, pa);
                Err(ArpError::Incomplete)
            }
            Some(i) if cache.entries[i].state == State::Incomplete => {
                drop(cache);
                self.send_request(dev, pa);
                Err(ArpError::Incomplete)
            }
            Some(i) => Ok(cache.entries[i].ha),
        }
    }

    fn send_request(&self, dev: &Arc<Device>, target_pa: Ipv4Addr) {
        let Some(sender) = dev.with_ip_iface(|iface| iface.info()).flatten() else {
            return;
        };
        let msg = Message {
            op: OP_REQUEST,
            sha: dev.ether_addr(),
            spa: sender.unicast,
            tha: EtherAddr::ANY,
            tpa: target_pa,
        };
        if let Err(err) = dev.output(u16::from(EtherType::Arp), &msg.build(), &EtherAddr::BROADCAST.0) {
            log::warn!("arp: failed to send request for {target_pa}: {err}");
        }
    }

    /// Processes an inbound ARP message arriving on `dev`. Mirrors
    /// `arp_input`.
    pub fn input(&self, data: &[u8], dev: &Arc<Device>) {
        if dev.kind != DeviceType::Ethernet {
            return;
        }
        let Some(msg) = Message::parse(data) else {
            log::debug!("arp: dropping malformed message on {}", dev.name);
            return;
        };

        let merged = self.cache.lock().expect("arp cache poisoned").update(msg.spa, msg.sha);

        let Some(iface) = dev.with_ip_iface(|iface| iface.info()).flatten() else {
            return;
        };

        if !merged && msg.tpa == iface.unicast {
            let mut cache = self.cache.lock().expect("arp cache poisoned");
            if let Err(err) = cache.insert(msg.spa, msg.sha) {
                log::warn!("arp: cache full, dropping entry for {}: {err}", msg.spa);
            }
        }

        if msg.op == OP_REQUEST && msg.tpa == iface.unicast {
            let reply = Message { op: OP_REPLY, sha: dev.ether_addr(), spa: iface.unicast, tha: msg.sha, tpa: msg.spa };
            if let Err(err) = dev.output(u16::from(EtherType::Arp), &reply.build(), &msg.sha.0) {
                log::warn!("arp: failed to send reply to {}: {err}", msg.spa);
            }
        }
    }
}

struct Message {
    op: u16,
    sha: EtherAddr,
    spa: Ipv4Addr,
    tha: EtherAddr,
    tpa: Ipv4Addr,
}

impl Message {
    fn build(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(28);
        bytes.extend_from_slice(&HRD_ETHERNET.to_be_bytes());
        bytes.extend_from_slice(&u16::from(EtherType::Ip).to_be_bytes());
        bytes.push(6); // hln
        bytes.push(4); // pln
        bytes.extend_from_slice(&self.op.to_be_bytes());
        bytes.extend_from_slice(&self.sha.0);
        bytes.extend_from_slice(&self.spa.octets());
        bytes.extend_from_slice(&self.tha.0);
        bytes.extend_from_slice(&self.tpa.octets());
        bytes
    }

    fn parse(data: &[u8]) -> Option<Message> {
        if data.len() < 28 {
            return None;
        }
        let hrd = u16::from_be_bytes([data[0], data[1]]);
        let pro = u16::from_be_bytes([data[2], data[3]]);
        let (hln, pln) = (data[4], data[5]);
        if hrd != HRD_ETHERNET || pro != u16::from(EtherType::Ip) || hln != 6 || pln != 4 {
            return None;
        }
        Some(Message {
            op: u16::from_be_bytes([data[6], data[7]]),
            sha: EtherAddr(data[8..14].try_into().unwrap()),
            spa: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
            tha: EtherAddr(data[18..24].try_into().unwrap()),
            tpa: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_select_skips_free_entries() {
        let mut cache = Cache::new();
        assert_eq!(cache.select(Ipv4Addr::new(192, 0, 2, 1)), None);
        cache.insert(Ipv4Addr::new(192, 0, 2, 1), EtherAddr([1; 6])).unwrap();
        assert!(cache.select(Ipv4Addr::new(192, 0, 2, 1)).is_some());
    }

    #[test]
    fn alloc_prefers_free_then_oldest_non_static() {
        let mut cache = Cache::new();
        for i in 0..CACHE_SIZE {
            cache.entries[i] = Entry {
                state: State::Resolved,
                pa: Ipv4Addr::new(10, 0, 0, i as u8),
                ha: EtherAddr([i as u8; 6]),
                timestamp: Instant::now() - Duration::from_secs((CACHE_SIZE - i) as u64),
            };
        }
        // entry 0 has the oldest timestamp.
        let idx = cache.alloc().unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn alloc_never_evicts_static_entries() {
        let mut cache = Cache::new();
        cache.entries[0] =
            Entry { state: State::Static, pa: Ipv4Addr::new(10, 0, 0, 1), ha: EtherAddr([9; 6]), timestamp: Instant::now() - Duration::from_secs(1000) };
        for i in 1..CACHE_SIZE {
            cache.entries[i] = Entry {
                state: State::Resolved,
                pa: Ipv4Addr::new(10, 0, 0, i as u8),
                ha: EtherAddr([i as u8; 6]),
                timestamp: Instant::now(),
            };
        }
        let idx = cache.alloc().unwrap();
        assert_ne!(idx, 0);
    }

    #[test]
    fn update_fails_when_no_entry_exists() {
        let mut cache = Cache::new();
        assert!(!cache.update(Ipv4Addr::new(192, 0, 2, 1), EtherAddr([1; 6])));
    }

    #[test]
    fn arp_message_round_trips() {
        let msg = Message {
            op: OP_REQUEST,
            sha: EtherAddr([1, 2, 3, 4, 5, 6]),
            spa: Ipv4Addr::new(192, 0, 2, 1),
            tha: EtherAddr::ANY,
            tpa: Ipv4Addr::new(192, 0, 2, 2),
        };
        let bytes = msg.build();
        let parsed = Message::parse(&bytes).unwrap();
        assert_eq!(parsed.op, OP_REQUEST);
        assert_eq!(parsed.spa, msg.spa);
        assert_eq!(parsed.tpa, msg.tpa);
    }
}
