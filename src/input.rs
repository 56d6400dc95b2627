//! Capture drivers.
//!
//! A driver delivers 188-byte aligned TS packets to the demultiplexer and
//! implements the PID-filter contract; only the UDP/RTP driver lives in
//! this tree, tuner and ASI capture plug in behind the same traits.

use std::net::{IpAddr, SocketAddr};

use log::{debug, warn};
use tokio::net::UdpSocket;

use crate::block::{BlockPool, TsBlock};
use crate::config::{parse_addr, DEFAULT_IPV4_MTU, DEFAULT_IPV6_MTU, DEFAULT_PORT, RTP_HEADER_SIZE};
use crate::demux::pid::FilterHandle;
use crate::error::{Result, TsCastError};
use crate::events::Reporter;
use crate::ts::TS_SIZE;
use crate::Mtime;

/// Minimum spacing between two source-address status prints (µs).
const PRINT_REFRACTORY_PERIOD: Mtime = 1_000_000;

/// Hardware PID filter contract of a capture driver.
pub trait CaptureFilters {
    /// Retunes / reopens the device after a watchdog trip.
    fn reset(&mut self);

    /// Starts capturing a PID; `None` when the driver captures everything
    /// anyway (network sources, budget mode).
    fn set_filter(&mut self, pid: u16) -> Option<FilterHandle>;

    /// Releases a previously set filter.
    fn unset_filter(&mut self, handle: FilterHandle, pid: u16);
}

/// Filter backend of drivers that always deliver the whole transponder.
#[derive(Debug, Default)]
pub struct NoFilters;

impl CaptureFilters for NoFilters {
    fn reset(&mut self) {}

    fn set_filter(&mut self, _pid: u16) -> Option<FilterHandle> {
        None
    }

    fn unset_filter(&mut self, _handle: FilterHandle, _pid: u16) {}
}

/// Parsed form of the input source string
/// `[connect-address@]bind-address[:port][/udp][/mtu=…][/ifindex=…]`.
#[derive(Debug)]
struct UdpSourceSpec {
    bind: SocketAddr,
    connect: Option<SocketAddr>,
    raw_udp: bool,
    mtu: usize,
    if_index: u32,
}

fn parse_source(source: &str) -> Result<UdpSourceSpec> {
    let mut parts = source.split('/');
    let addr_part = parts.next().unwrap_or_default();

    let (connect_part, bind_part) = match addr_part.split_once('@') {
        Some((connect, bind)) => (Some(connect), bind),
        None => (None, addr_part),
    };
    let bind = parse_addr(bind_part, DEFAULT_PORT)?;
    let connect = match connect_part {
        Some(text) => {
            let addr = parse_addr(text, 0)?;
            if addr.is_ipv4() != bind.is_ipv4() {
                warn!("invalid connect address");
                None
            } else {
                Some(addr)
            }
        }
        None => None,
    };

    let mut spec = UdpSourceSpec {
        bind,
        connect,
        raw_udp: false,
        mtu: 0,
        if_index: 0,
    };
    for option in parts {
        let (key, value) = option.split_once('=').unwrap_or((option, ""));
        match key.to_ascii_lowercase().as_str() {
            "udp" => spec.raw_udp = true,
            "mtu" => spec.mtu = value.parse()?,
            "ifindex" => spec.if_index = value.parse()?,
            other => warn!("unrecognized option {}", other),
        }
    }
    if spec.mtu == 0 {
        spec.mtu = if bind.is_ipv6() {
            DEFAULT_IPV6_MTU
        } else {
            DEFAULT_IPV4_MTU
        };
    }
    Ok(spec)
}

/// UDP/RTP input: receives the MPTS from the network instead of a tuner.
pub struct UdpInput {
    socket: UdpSocket,
    raw_udp: bool,
    recv_buf: Vec<u8>,
    ssrc: [u8; 4],
    next_seqnum: Option<u16>,
    synced: bool,
    last_print: Mtime,
    last_addr: Option<SocketAddr>,
}

impl UdpInput {
    /// Binds the input socket, joining the multicast group when the bind
    /// address is one.
    pub async fn open(source: &str) -> Result<Self> {
        let spec = parse_source(source)?;

        let std_socket = {
            let socket = std::net::UdpSocket::bind(spec.bind).map_err(|err| {
                TsCastError::Fatal(format!("couldn't bind {} ({})", spec.bind, err))
            })?;
            socket.set_nonblocking(true)?;
            socket
        };

        match spec.bind.ip() {
            IpAddr::V4(group) if group.is_multicast() => {
                std_socket.join_multicast_v4(&group, &std::net::Ipv4Addr::UNSPECIFIED)?;
                if spec.connect.is_some() {
                    warn!("source-specific multicast is not supported, filtering by connect only");
                }
            }
            IpAddr::V6(group) if group.is_multicast() => {
                std_socket.join_multicast_v6(&group, spec.if_index)?;
            }
            _ => {}
        }

        if let Some(connect) = spec.connect {
            if connect.port() != 0 {
                if let Err(err) = std_socket.connect(connect) {
                    warn!("couldn't connect socket ({})", err);
                }
            }
        }

        debug!("binding socket to {}", source);

        Ok(Self {
            socket: UdpSocket::from_std(std_socket)?,
            raw_udp: spec.raw_udp,
            recv_buf: vec![0u8; spec.mtu.max(TS_SIZE + RTP_HEADER_SIZE)],
            ssrc: [0; 4],
            next_seqnum: None,
            synced: false,
            last_print: 0,
            last_addr: None,
        })
    }

    /// Waits until a datagram is ready.
    pub async fn readable(&self) -> std::io::Result<()> {
        self.socket.readable().await
    }

    /// True while packets keep the input locked.
    pub fn synced(&self) -> bool {
        self.synced
    }

    /// Mute timer fired: report and drop lock.
    pub fn lose_lock(&mut self, reporter: &mut Reporter) {
        warn!("frontend has lost lock");
        reporter.lock_status(false);
        self.synced = false;
    }

    /// Drains one pending datagram into pool-backed blocks. Returns an
    /// empty vector when nothing was pending or the payload was not TS.
    pub fn read_burst(
        &mut self,
        pool: &mut BlockPool,
        now: Mtime,
        reporter: &mut Reporter,
    ) -> Vec<TsBlock> {
        let (len, from) = match self.socket.try_recv_from(&mut self.recv_buf) {
            Ok(ok) => ok,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return Vec::new(),
            Err(err) => {
                log::error!("couldn't read from network ({})", err);
                return Vec::new();
            }
        };

        if self.last_print + PRINT_REFRACTORY_PERIOD < now {
            self.last_print = now;
            if self.last_addr != Some(from) {
                self.last_addr = Some(from);
                log::info!("source: {}", from);
                reporter.source(&from.ip().to_string(), &from.port().to_string());
            }
        }

        let mut payload = &self.recv_buf[..len];
        if !self.raw_udp {
            if payload.len() < RTP_HEADER_SIZE {
                warn!("invalid RTP packet received");
                return Vec::new();
            }
            let header = &payload[..RTP_HEADER_SIZE];
            if header[0] & 0xc0 != 0x80 {
                warn!("invalid RTP packet received");
            }
            if header[1] & 0x7f != 33 {
                warn!("non-TS RTP packet received");
            }
            let seqnum = ((header[2] as u16) << 8) | header[3] as u16;
            let ssrc = [header[8], header[9], header[10], header[11]];
            if ssrc == self.ssrc {
                if let Some(expected) = self.next_seqnum {
                    if seqnum != expected {
                        warn!("RTP discontinuity");
                    }
                }
            } else {
                let source = format!("{}.{}.{}.{}", ssrc[0], ssrc[1], ssrc[2], ssrc[3]);
                debug!("new RTP source: {}", source);
                self.ssrc = ssrc;
                reporter.rtp_source(&source);
            }
            self.next_seqnum = Some(seqnum.wrapping_add(1));
            payload = &payload[RTP_HEADER_SIZE..];
        }

        let count = payload.len() / TS_SIZE;
        if count > 0 && !self.synced {
            log::info!("frontend has acquired lock");
            reporter.lock_status(true);
            self.synced = true;
        }

        let mut blocks = Vec::with_capacity(count);
        for chunk in payload.chunks_exact(TS_SIZE) {
            let mut buf = pool.alloc();
            buf.copy_from_slice(chunk);
            // The DTS is interpolated over the burst by the demultiplexer.
            blocks.push(TsBlock::new(buf.freeze(), now));
        }
        blocks
    }
}

impl CaptureFilters for UdpInput {
    fn reset(&mut self) {}

    fn set_filter(&mut self, _pid: u16) -> Option<FilterHandle> {
        None
    }

    fn unset_filter(&mut self, _handle: FilterHandle, _pid: u16) {}
}
