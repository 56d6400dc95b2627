//! Output state and packet queueing.
//!
//! An output owns its destination socket, a bounded FIFO of outgoing packet
//! groups, the PSI sections rebuilt for its reduced program set (with their
//! versions and continuity counters), the EIT packetization buffer and the
//! PID remap table. The demultiplexer fans packets out with
//! [`Output::put`]; the runtime drains due groups with the sender half in
//! [`sender`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rand::Rng;

use crate::block::{BlockPool, TsBlock};
use crate::config::{OutputConfig, RTP_HEADER_SIZE};
use crate::error::Result;
use crate::ts::psi::{split_end, split_section, MIN_SECTION_FRAGMENT};
use crate::ts::{packet, PsiSection, TS_SIZE};
use crate::Mtime;

pub mod rebuild;
pub mod remap;
pub mod sender;

pub use remap::RemapTable;
pub use sender::PacketSink;

/// One datagram's worth of TS packets waiting to be sent.
#[derive(Debug)]
pub(crate) struct PacketGroup {
    pub blocks: Vec<TsBlock>,
    pub dts: Mtime,
}

/// A rebuilt table held by an output: the section, its running version and
/// the continuity counter of the PID it is sent on.
#[derive(Debug)]
pub struct TableState {
    /// Current rebuilt section, when one could be built
    pub section: Option<PsiSection>,
    /// Monotonically increasing version (masked to 5 bits on the wire)
    pub version: u8,
    /// Continuity counter for this table's PID on this output
    pub cc: u8,
}

impl TableState {
    fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            section: None,
            version: rng.gen::<u8>() & 0x1f,
            cc: rng.gen::<u8>() & 0x0f,
        }
    }

    /// Drops the section and advances the version for the next rebuild.
    pub fn invalidate(&mut self) {
        self.section = None;
        self.version = (self.version + 1) & 0x1f;
    }
}

/// Partially filled EIT TS packet kept between sections.
#[derive(Debug)]
pub(crate) struct EitBuffer {
    pub ts: [u8; TS_SIZE],
    pub offset: usize,
    pub dts: Mtime,
}

/// One configured output destination.
pub struct Output {
    /// Its configuration, as last applied
    pub config: OutputConfig,
    /// False once closed; tombstoned entries are skipped and reused
    pub valid: bool,
    /// Reload marker: lines still in the config file set this
    pub still_present: bool,

    pub(crate) sink: Option<Box<dyn PacketSink>>,
    pool: Rc<RefCell<BlockPool>>,
    pub(crate) groups: VecDeque<PacketGroup>,
    pub(crate) seqnum: u16,
    pub(crate) ref_timestamp: i64,
    pub(crate) ref_wallclock: Mtime,

    /// PID of a partial (PCR-only) subscription, 0 when none
    pub pcr_pid: u16,
    /// TSID stamped on rebuilt tables
    pub tsid: u16,
    /// Watchdog error counter
    pub errors: u32,
    /// Wall clock of the last counted watchdog error
    pub last_error: Mtime,

    /// Rebuilt PAT
    pub pat: TableState,
    /// Rebuilt PMT
    pub pmt: TableState,
    /// Rebuilt NIT
    pub nit: TableState,
    /// Rebuilt SDT
    pub sdt: TableState,
    /// Continuity counter of forwarded EIT packets
    pub eit_cc: u8,
    pub(crate) eit_buffer: Option<EitBuffer>,
    /// PID remap assignments, recomputed on each PMT rebuild
    pub remap: RemapTable,
}

impl Output {
    /// Creates an output with its network sink.
    pub fn new(config: OutputConfig, pool: Rc<RefCell<BlockPool>>) -> Result<Self> {
        let sink = sender::UdpSink::open(&config)?;
        Ok(Self::with_sink(config, pool, Box::new(sink)))
    }

    /// Creates an output around an arbitrary sink (tests, duplication).
    pub fn with_sink(
        config: OutputConfig,
        pool: Rc<RefCell<BlockPool>>,
        sink: Box<dyn PacketSink>,
    ) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            config,
            valid: true,
            still_present: true,
            sink: Some(sink),
            pool,
            groups: VecDeque::new(),
            seqnum: rng.gen(),
            ref_timestamp: 0,
            ref_wallclock: 0,
            pcr_pid: 0,
            tsid: 0,
            errors: 0,
            last_error: 0,
            pat: TableState::random(),
            pmt: TableState::random(),
            nit: TableState::random(),
            sdt: TableState::random(),
            eit_cc: rng.gen::<u8>() & 0x0f,
            eit_buffer: None,
            remap: RemapTable::new(),
        }
    }

    /// TS packets per datagram for this output's MTU and mode.
    pub fn block_count(&self) -> usize {
        let headroom = if self.config.udp { 0 } else { RTP_HEADER_SIZE };
        ((self.config.mtu.saturating_sub(headroom)) / TS_SIZE).max(1)
    }

    /// Queues one packet, starting a new group when the pending one is
    /// full or older than the retention bound. A PCR-bearing packet
    /// refreshes the group timestamp so the RTP clock tracks the stream.
    pub fn put(&mut self, block: &TsBlock) {
        let block_count = self.block_count();
        let append = match self.groups.back() {
            Some(last) => {
                last.blocks.len() < block_count
                    && last.dts + self.config.retention > block.dts
            }
            None => false,
        };
        if append {
            let last = self.groups.back_mut().unwrap();
            if block.packet().has_pcr() {
                last.dts = block.dts;
            }
            last.blocks.push(block.clone());
        } else {
            let mut blocks = Vec::with_capacity(block_count);
            blocks.push(block.clone());
            self.groups.push_back(PacketGroup {
                blocks,
                dts: block.dts,
            });
        }
    }

    /// Number of queued groups.
    pub fn queued_groups(&self) -> usize {
        self.groups.len()
    }

    /// Packetizes `section` on `pid` and queues the resulting TS packets.
    /// `cc` is the per-table continuity counter to advance.
    pub fn put_section(&mut self, section: &PsiSection, pid: u16, cc: &mut u8, dts: Mtime) {
        let bytes = &section.as_bytes()[..section.total_len()];
        let mut section_offset = 0usize;
        while section_offset < bytes.len() {
            let mut ts = [0u8; TS_SIZE];
            let mut ts_offset = 0usize;
            split_section(&mut ts, &mut ts_offset, bytes, &mut section_offset);
            packet::set_pid(&mut ts, pid);
            packet::set_cc(&mut ts, *cc);
            *cc = (*cc + 1) & 0x0f;
            split_end(&mut ts, &mut ts_offset);
            self.put_raw(&ts, dts);
        }
    }

    /// Packetizes an EIT section through the retention buffer: a short tail
    /// stays buffered so the next section can share the packet instead of
    /// wasting most of one on stuffing.
    pub fn put_eit_section(&mut self, section: &PsiSection, pid: u16, dts: Mtime) {
        let bytes = &section.as_bytes()[..section.total_len()];
        let mut section_offset = 0usize;
        loop {
            let (mut ts, mut ts_offset, buffer_dts, fresh) = match self.eit_buffer.take() {
                Some(buffer) => (buffer.ts, buffer.offset, buffer.dts, false),
                None => ([0u8; TS_SIZE], 0usize, dts, true),
            };

            split_section(&mut ts, &mut ts_offset, bytes, &mut section_offset);
            if fresh {
                packet::set_pid(&mut ts, pid);
                packet::set_cc(&mut ts, self.eit_cc);
                self.eit_cc = (self.eit_cc + 1) & 0x0f;
            }

            if section_offset == bytes.len() {
                if ts_offset < TS_SIZE - MIN_SECTION_FRAGMENT {
                    // The buffer keeps the dts of its oldest content so
                    // the retention flush fires from the first fragment.
                    self.eit_buffer = Some(EitBuffer {
                        ts,
                        offset: ts_offset,
                        dts: buffer_dts,
                    });
                    return;
                }
                split_end(&mut ts, &mut ts_offset);
                self.put_raw(&ts, dts);
                return;
            }

            // Packet full, the section continues into a fresh one.
            self.put_raw(&ts, dts);
        }
    }

    /// Wall clock of the oldest buffered EIT fragment.
    pub fn eit_buffer_dts(&self) -> Option<Mtime> {
        self.eit_buffer.as_ref().map(|b| b.dts)
    }

    /// Seals and queues the EIT packetization buffer.
    pub fn flush_eit(&mut self, dts: Mtime) {
        if let Some(mut buffer) = self.eit_buffer.take() {
            split_end(&mut buffer.ts, &mut buffer.offset);
            self.put_raw(&buffer.ts, dts);
        }
    }

    fn put_raw(&mut self, ts: &[u8; TS_SIZE], dts: Mtime) {
        let mut buf = self.pool.borrow_mut().alloc();
        buf.copy_from_slice(ts);
        let block = TsBlock::new(buf.freeze(), dts);
        self.put(&block);
    }

    /// Releases the queue and socket; the slot may be reused by a later
    /// config line.
    pub fn close(&mut self) {
        let mut pool = self.pool.borrow_mut();
        for group in self.groups.drain(..) {
            for block in group.blocks {
                pool.reclaim(block.data);
            }
        }
        drop(pool);
        self.sink = None;
        self.eit_buffer = None;
        self.pat.section = None;
        self.pmt.section = None;
        self.nit.section = None;
        self.sdt.section = None;
        self.valid = false;
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("display_name", &self.config.display_name)
            .field("valid", &self.valid)
            .field("sid", &self.config.sid)
            .field("queued_groups", &self.groups.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink recording every datagram for inspection.
    #[derive(Clone, Default)]
    pub struct RecordingSink(pub Arc<Mutex<Vec<Vec<u8>>>>);

    impl PacketSink for RecordingSink {
        fn send(&mut self, datagram: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().push(datagram.to_vec());
            Ok(datagram.len())
        }
    }

    /// An output wired to a recording sink.
    pub fn recording_output(config: OutputConfig) -> (Output, RecordingSink) {
        let sink = RecordingSink::default();
        let pool = Rc::new(RefCell::new(BlockPool::default()));
        let output = Output::with_sink(config, pool, Box::new(sink.clone()));
        (output, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::recording_output;
    use super::*;
    use crate::config::OutputDefaults;

    fn test_config() -> OutputConfig {
        let defaults = OutputDefaults::default();
        let mut config = OutputConfig::new("127.0.0.1:5004".parse().unwrap(), &defaults);
        config.sid = 1;
        config
    }

    fn block(pool: &Rc<RefCell<BlockPool>>, pid: u16, dts: Mtime) -> TsBlock {
        let mut buf = pool.borrow_mut().alloc();
        buf.fill(0xff);
        buf[0] = 0x47;
        buf[1] = ((pid >> 8) & 0x1f) as u8;
        buf[2] = (pid & 0xff) as u8;
        buf[3] = 0x10;
        TsBlock::new(buf.freeze(), dts)
    }

    #[test]
    fn test_put_groups_by_size() {
        let (mut output, _) = recording_output(test_config());
        let pool = Rc::new(RefCell::new(BlockPool::default()));
        let count = output.block_count();
        for i in 0..count + 1 {
            output.put(&block(&pool, 100, i as Mtime));
        }
        // One full group and one freshly started.
        assert_eq!(output.queued_groups(), 2);
    }

    #[test]
    fn test_put_respects_retention() {
        let mut config = test_config();
        config.retention = 1000;
        let (mut output, _) = recording_output(config);
        let pool = Rc::new(RefCell::new(BlockPool::default()));
        output.put(&block(&pool, 100, 0));
        output.put(&block(&pool, 100, 500));
        assert_eq!(output.queued_groups(), 1);
        // Beyond the retention bound a new group starts.
        output.put(&block(&pool, 100, 2000));
        assert_eq!(output.queued_groups(), 2);
    }

    #[test]
    fn test_put_section_sets_pid_and_cc() {
        let (mut output, _) = recording_output(test_config());
        let section = crate::ts::tables::build_pat(1, 0, &[(1, 0x100)]);
        let mut cc = 5;
        output.put_section(&section, 0x1000, &mut cc, 0);
        assert_eq!(cc, 6);
        let group = output.groups.front().unwrap();
        let packet = group.blocks[0].packet();
        assert_eq!(packet.pid(), 0x1000);
        assert_eq!(packet.cc(), 5);
        assert!(packet.unit_start());
    }

    #[test]
    fn test_eit_buffer_accumulates_short_sections() {
        let (mut output, _) = recording_output(test_config());
        let section = crate::ts::tables::build_pat(1, 0, &[]);
        output.put_eit_section(&section, 0x12, 100);
        assert!(output.eit_buffer_dts().is_some());
        assert_eq!(output.queued_groups(), 0);

        output.flush_eit(200);
        assert!(output.eit_buffer_dts().is_none());
        assert_eq!(output.queued_groups(), 1);
    }

    #[test]
    fn test_close_clears_state() {
        let (mut output, _) = recording_output(test_config());
        let pool = Rc::new(RefCell::new(BlockPool::default()));
        output.put(&block(&pool, 100, 0));
        output.close();
        assert!(!output.valid);
        assert_eq!(output.queued_groups(), 0);
    }
}
