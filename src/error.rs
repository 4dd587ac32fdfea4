//! Crate-wide error type.
//!
//! Each protocol module exposes its own narrow error enum for the failure
//! modes it can produce synchronously (resource exhaustion, bad state,
//! transient conditions, interruption); they all convert into [`Error`] at
//! the public API boundary. Validation failures on the input path (short
//! frames, bad checksums) are never represented here — they are logged and
//! the packet is dropped.

use thiserror::Error;

/// Errors returned by the device/interface registry (component E).
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device `{0}` is not up")]
    NotUp(String),
    #[error("frame of {len} bytes exceeds device MTU {mtu}")]
    Mtu { len: usize, mtu: usize },
    #[error("no interface of the requested family on device `{0}`")]
    NoSuchInterface(String),
    #[error("device transmit failed: {0}")]
    Transmit(String),
    #[error("device open failed: {0}")]
    Open(String),
}

/// Errors returned by the ARP resolver (component H).
#[derive(Debug, Error)]
pub enum ArpError {
    #[error("device is not Ethernet or has no IP interface")]
    Unsupported,
    #[error("address resolution pending")]
    Incomplete,
    #[error("arp cache is full")]
    CacheFull,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Errors returned by the IPv4 layer (component I).
#[derive(Debug, Error)]
pub enum IpError {
    #[error("no interface bound to source address")]
    NoSuchSource,
    #[error("destination unreachable")]
    Unreachable,
    #[error("{len} byte datagram exceeds device MTU {mtu}")]
    Mtu { len: usize, mtu: usize },
    #[error("protocol {0} already registered")]
    ProtocolInUse(u8),
    #[error(transparent)]
    Arp(#[from] ArpError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Errors returned by the UDP layer (component K).
#[derive(Debug, Error)]
pub enum UdpError {
    #[error("pcb table is full")]
    TableFull,
    #[error("address already in use")]
    AddressInUse,
    #[error("no ephemeral port available")]
    NoEphemeralPort,
    #[error("pcb is not open")]
    NotOpen,
    #[error("operation was interrupted")]
    Interrupted,
    #[error(transparent)]
    Ip(#[from] IpError),
}

/// Errors returned by the TCP layer (component L).
#[derive(Debug, Error)]
pub enum TcpError {
    #[error("pcb table is full")]
    TableFull,
    #[error("connection was reset")]
    Reset,
    #[error("operation was interrupted")]
    Interrupted,
    #[error("connection is closed")]
    Closed,
    #[error("active open is not supported")]
    Unsupported,
    #[error(transparent)]
    Ip(#[from] IpError),
}

/// Top-level error type returned from the crate's public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Arp(#[from] ArpError),
    #[error(transparent)]
    Ip(#[from] IpError),
    #[error(transparent)]
    Udp(#[from] UdpError),
    #[error(transparent)]
    Tcp(#[from] TcpError),
    #[error("initialization failed: {0}")]
    Init(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
