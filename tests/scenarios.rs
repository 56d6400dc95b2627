//! End-to-end scenarios: a demuxer fed synthetic TS packets, real UDP
//! outputs received by a local listener socket.

use std::net::UdpSocket;
use std::time::Duration;

use bytes::Bytes;

use tscast::block::TsBlock;
use tscast::config::{parse_output_line, OutputDefaults, RTP_HEADER_SIZE};
use tscast::demux::Demuxer;
use tscast::events::Reporter;
use tscast::input::NoFilters;
use tscast::ts::psi::{split_end, split_section, PsiSection};
use tscast::ts::tables::{build_pat, DescriptorLoop, PatView, PmtBuilder, PmtView};
use tscast::ts::{packet, TsPacket, PAT_PID, TS_SIZE};
use tscast::Mtime;

fn demuxer() -> Demuxer {
    Demuxer::new(
        Default::default(),
        Reporter::disabled(),
        Box::new(NoFilters),
        None,
    )
}

/// A local UDP listener to receive output datagrams.
struct Listener {
    socket: UdpSocket,
}

impl Listener {
    fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        Self { socket }
    }

    fn addr(&self) -> String {
        self.socket.local_addr().unwrap().to_string()
    }

    fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        match self.socket.recv(&mut buf) {
            Ok(len) => {
                buf.truncate(len);
                Some(buf)
            }
            Err(_) => None,
        }
    }

    fn recv_all(&self) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        while let Some(datagram) = self.recv() {
            datagrams.push(datagram);
        }
        datagrams
    }
}

/// Splits a section into TS packets and feeds them at wall-clock `now`.
fn feed_section(demuxer: &mut Demuxer, pid: u16, section: &PsiSection, cc: &mut u8, now: Mtime) {
    demuxer.wallclock = now;
    let bytes = &section.as_bytes()[..section.total_len()];
    let mut section_offset = 0usize;
    while section_offset < bytes.len() {
        let mut ts = [0u8; TS_SIZE];
        let mut ts_offset = 0usize;
        split_section(&mut ts, &mut ts_offset, bytes, &mut section_offset);
        split_end(&mut ts, &mut ts_offset);
        packet::set_pid(&mut ts, pid);
        packet::set_cc(&mut ts, *cc);
        *cc = (*cc + 1) & 0x0f;
        demuxer.handle(TsBlock::new(Bytes::copy_from_slice(&ts), now));
    }
}

fn feed_es(demuxer: &mut Demuxer, pid: u16, cc: &mut u8, now: Mtime) {
    demuxer.wallclock = now;
    let mut ts = [0xffu8; TS_SIZE];
    ts[0] = 0x47;
    ts[1] = 0x40 | ((pid >> 8) & 0x1f) as u8;
    ts[2] = (pid & 0xff) as u8;
    ts[3] = 0x10 | *cc;
    *cc = (*cc + 1) & 0x0f;
    ts[4] = 0x00;
    ts[5] = 0x00;
    ts[6] = 0x01;
    ts[7] = 0xe0;
    demuxer.handle(TsBlock::new(Bytes::copy_from_slice(&ts), now));
}

fn pids_in(datagram: &[u8], rtp: bool) -> Vec<u16> {
    let payload = if rtp {
        &datagram[RTP_HEADER_SIZE..]
    } else {
        datagram
    };
    payload
        .chunks_exact(TS_SIZE)
        .map(|chunk| TsPacket(chunk).pid())
        .collect()
}

#[test]
fn single_service_with_pid_list() {
    let listener = Listener::new();
    let mut demuxer = demuxer();

    let defaults = OutputDefaults::default();
    let line = format!("{}/dvb 0 1 100,101", listener.addr());
    let config = parse_output_line(&line, &defaults).unwrap().unwrap();
    let index = demuxer.create_output(&config).unwrap();
    demuxer.change_output(index, &config);

    let mut pat_cc = 0u8;
    let mut pmt_cc = 0u8;
    feed_section(&mut demuxer, PAT_PID, &build_pat(0x42, 0, &[(1, 0x20)]), &mut pat_cc, 0);

    let mut builder = PmtBuilder::new(1, 0);
    builder
        .pcr_pid(102)
        .add_es(0x02, 100, DescriptorLoop::new())
        .add_es(0x04, 101, DescriptorLoop::new());
    feed_section(&mut demuxer, 0x20, &builder.build(), &mut pmt_cc, 0);

    let mut es_cc = 0u8;
    for i in 0..8 {
        feed_es(&mut demuxer, 100, &mut es_cc, i * 1000);
    }

    demuxer.send_outputs(Mtime::MAX);

    let datagrams = listener.recv_all();
    assert!(!datagrams.is_empty());
    let mut seen = Vec::new();
    for datagram in &datagrams {
        // RTP mode: fixed header, payload type 33.
        assert_eq!(datagram[0] & 0xc0, 0x80);
        assert_eq!(datagram[1] & 0x7f, 33);
        assert_eq!((datagram.len() - RTP_HEADER_SIZE) % TS_SIZE, 0);
        seen.extend(pids_in(datagram, true));
    }
    assert!(seen.contains(&0u16)); // rebuilt PAT
    assert!(seen.contains(&0x20u16)); // rebuilt PMT
    assert!(seen.contains(&100u16)); // selected ES
}

#[test]
fn rtp_sequence_numbers_are_consecutive() {
    let listener = Listener::new();
    let mut demuxer = demuxer();

    let defaults = OutputDefaults::default();
    let line = format!("{} 0 1", listener.addr());
    let config = parse_output_line(&line, &defaults).unwrap().unwrap();
    let index = demuxer.create_output(&config).unwrap();
    demuxer.change_output(index, &config);

    let mut pat_cc = 0u8;
    // Spread sends over several groups by spacing the DTS beyond retention.
    for i in 0..5 {
        feed_section(
            &mut demuxer,
            PAT_PID,
            &build_pat(0x42, 0, &[(1, 0x20)]),
            &mut pat_cc,
            i * 1_000_000,
        );
    }
    demuxer.send_outputs(Mtime::MAX);

    let datagrams = listener.recv_all();
    assert!(datagrams.len() >= 2);
    let seqs: Vec<u16> = datagrams
        .iter()
        .map(|d| ((d[2] as u16) << 8) | d[3] as u16)
        .collect();
    for pair in seqs.windows(2) {
        assert_eq!(pair[1], pair[0].wrapping_add(1));
    }
}

#[test]
fn latency_bound_gates_sending() {
    let listener = Listener::new();
    let mut demuxer = demuxer();

    let defaults = OutputDefaults::default();
    let line = format!("{}/latency=100/retention=10 0 1", listener.addr());
    let config = parse_output_line(&line, &defaults).unwrap().unwrap();
    let index = demuxer.create_output(&config).unwrap();
    demuxer.change_output(index, &config);

    let mut pat_cc = 0u8;
    feed_section(
        &mut demuxer,
        PAT_PID,
        &build_pat(0x42, 0, &[(1, 0x20)]),
        &mut pat_cc,
        1_000_000,
    );

    // Before the latency bound nothing leaves.
    let deadline = demuxer.send_outputs(1_000_000 + 99_999);
    assert_eq!(deadline, Some(1_000_000 + 100_000));
    assert!(listener.recv().is_none());

    // At the bound the group goes out.
    assert_eq!(demuxer.send_outputs(1_000_000 + 100_000), None);
    assert!(listener.recv().is_some());
}

#[test]
fn udp_mode_sends_bare_ts() {
    let listener = Listener::new();
    let mut demuxer = demuxer();

    let defaults = OutputDefaults::default();
    let line = format!("{}/udp 0 1", listener.addr());
    let config = parse_output_line(&line, &defaults).unwrap().unwrap();
    let index = demuxer.create_output(&config).unwrap();
    demuxer.change_output(index, &config);

    let mut pat_cc = 0u8;
    feed_section(&mut demuxer, PAT_PID, &build_pat(0x42, 0, &[(1, 0x20)]), &mut pat_cc, 0);
    demuxer.send_outputs(Mtime::MAX);

    let datagram = listener.recv().expect("datagram");
    assert_eq!(datagram.len() % TS_SIZE, 0);
    assert_eq!(datagram[0], 0x47);
    let pids = pids_in(&datagram, false);
    assert!(pids.contains(&0));
    // Short group padded with null packets.
    assert!(pids.contains(&0x1fff));
}

#[test]
fn reload_closes_dropped_outputs() {
    let listener_a = Listener::new();
    let listener_b = Listener::new();
    let mut demuxer = demuxer();
    let defaults = OutputDefaults::default();

    let config_a = parse_output_line(&format!("{} 0 1", listener_a.addr()), &defaults)
        .unwrap()
        .unwrap();
    let config_b = parse_output_line(&format!("{} 0 2", listener_b.addr()), &defaults)
        .unwrap()
        .unwrap();

    demuxer.apply_config(&[config_a.clone(), config_b]);
    assert_eq!(demuxer.outputs.iter().filter(|o| o.valid).count(), 2);

    // Second reload drops the B line.
    demuxer.apply_config(&[config_a]);
    assert_eq!(demuxer.outputs.iter().filter(|o| o.valid).count(), 1);

    // And a third one reuses the tombstoned slot.
    let config_c = parse_output_line(&format!("{} 0 3", listener_b.addr()), &defaults)
        .unwrap()
        .unwrap();
    let kept = demuxer.outputs[0].config.clone();
    let before = demuxer.outputs.len();
    demuxer.apply_config(&[kept, config_c]);
    assert_eq!(demuxer.outputs.len(), before.max(2));
    assert_eq!(demuxer.outputs.iter().filter(|o| o.valid).count(), 2);
}

#[test]
fn rebuilt_pat_lists_exactly_one_program() {
    let listener = Listener::new();
    let mut demuxer = demuxer();
    let defaults = OutputDefaults::default();

    let line = format!("{} 0 2", listener.addr());
    let config = parse_output_line(&line, &defaults).unwrap().unwrap();
    let index = demuxer.create_output(&config).unwrap();
    demuxer.change_output(index, &config);

    let mut pat_cc = 0u8;
    feed_section(
        &mut demuxer,
        PAT_PID,
        &build_pat(0x42, 0, &[(1, 0x20), (2, 0x21), (3, 0x22)]),
        &mut pat_cc,
        0,
    );

    let pat = demuxer.outputs[index].pat.section.as_ref().unwrap();
    let programs: Vec<_> = PatView(pat).programs().collect();
    assert_eq!(programs, vec![(2, 0x21)]);

    let mut pmt_cc = 0u8;
    let mut builder = PmtBuilder::new(2, 0);
    builder.pcr_pid(0x65).add_es(0x1b, 0x65, DescriptorLoop::new());
    feed_section(&mut demuxer, 0x21, &builder.build(), &mut pmt_cc, 0);

    let pmt = demuxer.outputs[index].pmt.section.as_ref().unwrap();
    assert_eq!(PmtView(pmt).program(), 2);
    let es: Vec<_> = PmtView(pmt).es().map(|e| e.pid).collect();
    assert_eq!(es, vec![0x65]);
}
