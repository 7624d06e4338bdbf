//! Capture sources
//!
//! The correlator reads a capture twice, once per traffic direction relative
//! to the recorded device socket. [`PacketSource`] is the seam between the
//! correlator and wherever the frames come from: [`PcapFile`] reads a
//! `.pcap`/`.pcapng` file through libpcap, [`VecSource`] serves frames that
//! are already in memory.

use chrono::{DateTime, Utc};
use etherparse::{SlicedPacket, TransportSlice};
use log::{debug, info};
use pcap::{Capture, Linktype, Offline};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{ModbusError, ModbusResult};

/// BSD loopback / NULL link header: 4-byte address family
const NULL_LINK_HEADER_LEN: usize = 4;

/// Traffic direction relative to the recorded device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Packets addressed to the device (requests)
    Destined,
    /// Packets sent by the device (responses)
    Sourced,
}

impl Direction {
    /// BPF expression selecting this direction for `device`
    pub fn bpf_filter(self, device: &SocketAddr) -> String {
        let side = match self {
            Direction::Destined => "dst",
            Direction::Sourced => "src",
        };
        format!("tcp and {side} host {} and {side} port {}", device.ip(), device.port())
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Destined => write!(f, "destined"),
            Direction::Sourced => write!(f, "sourced"),
        }
    }
}

/// A non-empty TCP payload with its capture timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl CapturedFrame {
    pub fn new(timestamp: DateTime<Utc>, payload: impl Into<Vec<u8>>) -> Self {
        Self { timestamp, payload: payload.into() }
    }
}

/// Source of captured Modbus payloads
///
/// Implementations return the frames of one direction in capture order.
/// Failing to open or filter the source is a setup error.
pub trait PacketSource {
    fn frames(&self, direction: Direction) -> ModbusResult<Vec<CapturedFrame>>;
}

/// libpcap-backed capture file
#[derive(Debug, Clone)]
pub struct PcapFile {
    path: PathBuf,
    device: SocketAddr,
}

impl PcapFile {
    /// Capture file `path`, filtered around the recorded `device` socket
    pub fn new<P: AsRef<Path>>(path: P, device: SocketAddr) -> Self {
        Self { path: path.as_ref().to_path_buf(), device }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self, direction: Direction) -> ModbusResult<Capture<Offline>> {
        let path = resolve_capture_path(&self.path);
        let mut capture = Capture::from_file(&path).map_err(|e| {
            ModbusError::capture(format!("cannot open {}: {}", path.display(), e))
        })?;

        let filter = direction.bpf_filter(&self.device);
        capture.filter(&filter, true).map_err(|e| {
            ModbusError::capture(format!("cannot apply filter '{}': {}", filter, e))
        })?;

        debug!("📂 Opened {} with filter '{}'", path.display(), filter);
        Ok(capture)
    }
}

/// Path to open for `path`
///
/// A path without extension that does not exist falls back to the first
/// existing of `<path>.pcapng` and `<path>.pcap`.
fn resolve_capture_path(path: &Path) -> PathBuf {
    if path.exists() || path.extension().is_some() {
        return path.to_path_buf();
    }
    ["pcapng", "pcap"]
        .iter()
        .map(|extension| path.with_extension(extension))
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

impl PacketSource for PcapFile {
    fn frames(&self, direction: Direction) -> ModbusResult<Vec<CapturedFrame>> {
        let mut capture = self.open(direction)?;
        let linktype = capture.get_datalink();
        let mut frames = Vec::new();
        let mut skipped = 0usize;

        loop {
            let packet = match capture.next_packet() {
                Ok(packet) => packet,
                Err(pcap::Error::NoMorePackets) => break,
                Err(e) => return Err(e.into()),
            };

            let payload = match tcp_payload(linktype, packet.data)? {
                Some(payload) if !payload.is_empty() => payload,
                _ => {
                    skipped += 1;
                    continue;
                }
            };

            let ts = packet.header.ts;
            let timestamp = DateTime::from_timestamp(ts.tv_sec as i64, (ts.tv_usec as u32) * 1_000)
                .ok_or_else(|| {
                    ModbusError::capture(format!("packet timestamp out of range: {}s", ts.tv_sec))
                })?;

            frames.push(CapturedFrame::new(timestamp, payload));
        }

        info!(
            "📦 {} pass over {}: {} payloads, {} empty or non-TCP packets skipped",
            direction, self.path.display(), frames.len(), skipped
        );
        Ok(frames)
    }
}

/// Slice the TCP payload out of a link-layer packet
///
/// Packets etherparse cannot slice yield `None`; an unsupported link type is
/// a capture error since no packet of the file could ever be read.
fn tcp_payload(linktype: Linktype, data: &[u8]) -> ModbusResult<Option<&[u8]>> {
    let sliced = match linktype {
        Linktype::ETHERNET => SlicedPacket::from_ethernet(data),
        Linktype::LINUX_SLL => SlicedPacket::from_linux_sll(data),
        Linktype::NULL | Linktype::LOOP => match data.get(NULL_LINK_HEADER_LEN..) {
            Some(ip) => SlicedPacket::from_ip(ip),
            None => return Ok(None),
        },
        Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => SlicedPacket::from_ip(data),
        other => {
            return Err(ModbusError::capture(format!(
                "unsupported link type {:?}", other
            )));
        }
    };

    match sliced {
        Ok(SlicedPacket {
            transport: Some(TransportSlice::Tcp(tcp)),
            ..
        }) => Ok(Some(tcp.payload())),
        Ok(_) => Ok(None),
        Err(e) => {
            debug!("Skipping unparsable packet: {}", e);
            Ok(None)
        }
    }
}

/// In-memory capture
///
/// Holds the destined and sourced frames separately, as a filtered capture
/// file would deliver them.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    destined: Vec<CapturedFrame>,
    sourced: Vec<CapturedFrame>,
}

impl VecSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame sent to the device
    pub fn request(mut self, timestamp: DateTime<Utc>, payload: impl Into<Vec<u8>>) -> Self {
        self.destined.push(CapturedFrame::new(timestamp, payload));
        self
    }

    /// Record a frame sent by the device
    pub fn response(mut self, timestamp: DateTime<Utc>, payload: impl Into<Vec<u8>>) -> Self {
        self.sourced.push(CapturedFrame::new(timestamp, payload));
        self
    }
}

impl PacketSource for VecSource {
    fn frames(&self, direction: Direction) -> ModbusResult<Vec<CapturedFrame>> {
        let frames = match direction {
            Direction::Destined => &self.destined,
            Direction::Sourced => &self.sourced,
        };
        Ok(frames.iter().filter(|frame| !frame.payload.is_empty()).cloned().collect())
    }
}
