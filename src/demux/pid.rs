//! Per-PID demultiplexer state.

use crate::ts::PsiAssembler;
use crate::Mtime;

/// Handle returned by a capture driver for a hardware PID filter.
pub type FilterHandle = i32;

/// Accumulated per-PID statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct PidInfo {
    /// Wall clock of the first packet seen
    pub first_packet_ts: Mtime,
    /// Wall clock of the most recent packet
    pub last_packet_ts: Mtime,
    /// Packets seen
    pub packets: u64,
    /// Continuity counter errors
    pub cc_errors: u64,
    /// transport_error_indicator packets
    pub transport_errors: u64,
    /// Bytes over the last one-second window
    pub bytes_per_sec: u64,
    /// Scrambling bits of the last packet (0 clear, 2/3 scrambled)
    pub scrambling: u8,
}

/// State of one PID slot (0..8191).
#[derive(Debug, Default)]
pub struct PidState {
    /// Hardware-filter reference count
    pub refcount: u32,
    /// PSI consumers (table tracking) holding this PID
    pub psi_refcount: u32,
    /// PID carries PES per the owning PMT
    pub pes: bool,
    /// PID carries EMMs per the CAT
    pub emm: bool,
    /// Last continuity counter seen
    pub last_cc: Option<u8>,
    /// Driver filter handle when one is set
    pub filter: Option<FilterHandle>,
    /// Statistics
    pub info: PidInfo,
    /// PSI gathering buffer
    pub assembler: PsiAssembler,
    /// Subscribing outputs as slots into the demuxer's output arena;
    /// `None` entries are tombstones reused on the next subscribe
    pub outputs: Vec<Option<usize>>,
    /// ES presence: `None` unknown, `Some(pes)` reported up
    pub pes_status: Option<bool>,
    /// Deadline after which the PID is reported down
    pub presence_deadline: Option<Mtime>,

    // one-second window for bytes_per_sec
    pub(crate) window_start: Mtime,
    pub(crate) window_packets: u64,
}

impl PidState {
    /// Adds `output` to the subscriber list. Returns false when it was
    /// already subscribed.
    pub fn subscribe(&mut self, output: usize) -> bool {
        if self.outputs.contains(&Some(output)) {
            return false;
        }
        match self.outputs.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(output),
            None => self.outputs.push(Some(output)),
        }
        true
    }

    /// Tombstones `output` in the subscriber list. Returns true when it
    /// was subscribed.
    pub fn unsubscribe(&mut self, output: usize) -> bool {
        match self.outputs.iter_mut().find(|slot| **slot == Some(output)) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// True when at least one output subscribes to this PID.
    pub fn is_selected(&self) -> bool {
        self.outputs.iter().any(|slot| slot.is_some())
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.outputs.iter().filter(|slot| slot.is_some()).count()
    }
}
