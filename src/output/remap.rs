//! PID remapping.
//!
//! Each remapping output owns two 8192-entry arrays: `newpids` maps an
//! original PID to its assigned output PID, `freepids` reserves assigned
//! slots so several streams of one class (two audio tracks, say) land on
//! distinct sequential PIDs. The pair stays bidirectionally consistent:
//! `freepids[new] == orig` iff `newpids[orig] == new`.

use crate::config::{MapSlot, UNUSED_PID};
use crate::ts::tables::EsView;
use crate::ts::MAX_PIDS;

/// Per-output PID remap state, rebuilt on every PMT rewrite.
#[derive(Debug, Clone)]
pub struct RemapTable {
    newpids: Vec<u16>,
    freepids: Vec<u16>,
}

impl RemapTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            newpids: vec![UNUSED_PID; MAX_PIDS],
            freepids: vec![UNUSED_PID; MAX_PIDS],
        }
    }

    /// Forgets all mappings; called before each PMT rewrite so the
    /// assignment tracks the current ES set.
    pub fn reset(&mut self) {
        self.newpids.fill(UNUSED_PID);
        self.freepids.fill(UNUSED_PID);
    }

    /// The assigned output PID for `orig`, when one exists.
    pub fn get(&self, orig: u16) -> Option<u16> {
        match self.newpids[orig as usize] {
            UNUSED_PID.. => None,
            pid => Some(pid),
        }
    }

    /// The original PID occupying assigned slot `new`, when taken.
    pub fn reserved_by(&self, new: u16) -> Option<u16> {
        match self.freepids[new as usize] {
            UNUSED_PID.. => None,
            pid => Some(pid),
        }
    }

    /// Assigns `orig` the first free PID at or after `base` and records the
    /// bidirectional mapping. A base of 0 (or out of range) keeps the
    /// original PID.
    pub fn assign(&mut self, base: u16, orig: u16) -> u16 {
        if base == 0 || base as usize >= MAX_PIDS {
            return orig;
        }
        let mut new = base;
        while (new as usize) < MAX_PIDS - 1 && self.freepids[new as usize] != UNUSED_PID {
            new += 1;
        }
        self.freepids[new as usize] = orig;
        self.newpids[orig as usize] = new;
        new
    }
}

impl Default for RemapTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The remap class of an elementary stream, when it has one.
///
/// Private PES data (stream type 0x06) is classed by its descriptors:
/// AC-3/E-AC-3/DTS/AAC tags make it audio, VBI/teletext/dvbsub tags make
/// it subtitles.
pub fn es_map_slot(es: &EsView<'_>) -> Option<MapSlot> {
    match es.stream_type {
        0x03 | 0x04 | 0x0f | 0x11 | 0x81 | 0x87 => Some(MapSlot::Audio),
        0x01 | 0x02 | 0x10 | 0x1b | 0x24 | 0x42 => Some(MapSlot::Video),
        0x06 => {
            let mut slot = None;
            for desc in es.descriptors() {
                match desc.tag {
                    0x6a | 0x7a | 0x7b | 0x7c => slot = Some(MapSlot::Audio),
                    0x46 | 0x56 | 0x59 => slot = Some(MapSlot::Spu),
                    _ => {}
                }
            }
            slot
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::tables::{DescriptorLoop, PmtBuilder, PmtView};

    #[test]
    fn test_assign_and_invariant() {
        let mut table = RemapTable::new();
        assert_eq!(table.assign(600, 300), 600);
        assert_eq!(table.get(300), Some(600));
        assert_eq!(table.reserved_by(600), Some(300));
    }

    #[test]
    fn test_collision_walks_forward() {
        let mut table = RemapTable::new();
        assert_eq!(table.assign(600, 300), 600);
        assert_eq!(table.assign(600, 301), 601);
        assert_eq!(table.assign(600, 302), 602);
        assert_eq!(table.get(301), Some(601));
        assert_eq!(table.reserved_by(602), Some(302));
    }

    #[test]
    fn test_zero_base_keeps_original() {
        let mut table = RemapTable::new();
        assert_eq!(table.assign(0, 300), 300);
        assert_eq!(table.get(300), None);
    }

    #[test]
    fn test_reset_clears_both_sides() {
        let mut table = RemapTable::new();
        table.assign(600, 300);
        table.reset();
        assert_eq!(table.get(300), None);
        assert_eq!(table.reserved_by(600), None);
    }

    #[quickcheck_macros::quickcheck]
    fn prop_mapping_stays_bijective(ops: Vec<(u16, u16)>) -> bool {
        let mut table = RemapTable::new();
        for (base, orig) in ops.into_iter().take(64) {
            let base = base % 4096;
            let orig = orig % 8192;
            if table.get(orig).is_some() {
                continue;
            }
            let new = table.assign(base, orig);
            if base == 0 {
                continue;
            }
            if table.get(orig) != Some(new) || table.reserved_by(new) != Some(orig) {
                return false;
            }
        }
        true
    }

    #[test]
    fn test_es_map_slots() {
        let mut builder = PmtBuilder::new(1, 0);
        let mut teletext = DescriptorLoop::new();
        teletext.push(0x56, &[0x65, 0x6e, 0x67, 0x09, 0x88]);
        let mut ac3 = DescriptorLoop::new();
        ac3.push(0x6a, &[0x00]);
        builder
            .add_es(0x1b, 0x64, DescriptorLoop::new())
            .add_es(0x04, 0x65, DescriptorLoop::new())
            .add_es(0x06, 0x66, teletext)
            .add_es(0x06, 0x67, ac3)
            .add_es(0x05, 0x68, DescriptorLoop::new());
        let pmt = builder.build();
        let slots: Vec<_> = PmtView(&pmt).es().map(|es| es_map_slot(&es)).collect();
        assert_eq!(
            slots,
            vec![
                Some(MapSlot::Video),
                Some(MapSlot::Audio),
                Some(MapSlot::Spu),
                Some(MapSlot::Audio),
                None,
            ]
        );
    }
}
