//! The sender half of an output: datagram assembly, RTP headers and the
//! latency-driven queue drain.
//!
//! Writes never block and are never retried; a failed send is logged and
//! counted against the output's watch threshold.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use bytes::{BufMut, BytesMut};
use log::{debug, error, warn};

use crate::config::OutputConfig;
use crate::error::Result;
use crate::ts::packet::PADDING_PACKET;
use crate::Mtime;

use super::Output;

/// RTP payload type for MPEG-2 TS.
const RTP_TYPE_TS: u8 = 33;

/// Destination for assembled datagrams.
pub trait PacketSink {
    /// Sends one datagram; non-blocking.
    fn send(&mut self, datagram: &[u8]) -> std::io::Result<usize>;
}

/// The regular UDP socket sink.
pub struct UdpSink {
    socket: UdpSocket,
}

impl UdpSink {
    /// Opens and connects the socket for `config`.
    pub fn open(config: &OutputConfig) -> Result<Self> {
        let bind = config.bind.unwrap_or(match config.remote {
            SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        });
        let socket = UdpSocket::bind(bind)?;

        if config.remote.ip().is_multicast() {
            match config.remote {
                SocketAddr::V4(_) => socket.set_multicast_ttl_v4(config.ttl)?,
                SocketAddr::V6(_) => {
                    // Hop limit control is not exposed for IPv6 here.
                    debug!("{}: leaving IPv6 multicast hops at default", config.display_name);
                }
            }
        } else {
            socket.set_ttl(config.ttl)?;
        }
        if config.tos != 0 {
            debug!("{}: TOS {:#x} not applied", config.display_name, config.tos);
        }
        if config.src_addr.is_some() {
            warn!(
                "{}: source spoofing is unsupported, sending from the bound address",
                config.display_name
            );
        }

        socket.connect(config.remote)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl PacketSink for UdpSink {
    fn send(&mut self, datagram: &[u8]) -> std::io::Result<usize> {
        self.socket.send(datagram)
    }
}

impl Output {
    /// RTP header: version 2, payload type 33, monotonic sequence number,
    /// 90 kHz timestamp derived from the group DTS against the output's
    /// reference, configured SSRC.
    fn rtp_header(&mut self, dts: Mtime) -> [u8; 12] {
        let timestamp =
            (self.ref_timestamp + (dts - self.ref_wallclock) * 9 / 100) as u32;
        let mut header = [0u8; 12];
        header[0] = 0x80;
        header[1] = RTP_TYPE_TS;
        header[2] = (self.seqnum >> 8) as u8;
        header[3] = (self.seqnum & 0xff) as u8;
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.config.ssrc);
        self.seqnum = self.seqnum.wrapping_add(1);
        header
    }

    /// Assembles and sends the oldest queued group, padding short groups
    /// with null packets.
    fn flush_front(&mut self, now: Mtime) {
        let Some(group) = self.groups.pop_front() else {
            return;
        };
        let block_count = self.block_count();
        let mut datagram = BytesMut::with_capacity(self.config.mtu);
        if !self.config.udp {
            let header = self.rtp_header(group.dts);
            datagram.put_slice(&header);
        }
        for block in &group.blocks {
            datagram.put_slice(&block.data);
        }
        for _ in group.blocks.len()..block_count {
            datagram.put_slice(&PADDING_PACKET);
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.send(&datagram) {
                error!("couldn't write to {} ({})", self.config.display_name, err);
                self.errors += 1;
                self.last_error = now;
            }
        }

        let mut pool = self.pool.borrow_mut();
        for block in group.blocks {
            pool.reclaim(block.data);
        }
    }

    /// Sends every group whose latency bound has expired. Returns the send
    /// deadline of the next pending group, if any.
    pub fn send_due(&mut self, now: Mtime) -> Option<Mtime> {
        while matches!(self.groups.front(),
                       Some(group) if group.dts + self.config.latency <= now)
        {
            self.flush_front(now);
        }
        self.groups.front().map(|g| g.dts + self.config.latency)
    }
}
