//! Elementary-stream selection policy.
//!
//! Which PIDs an output receives when no explicit list is given: the
//! recognized audio/video types, plus private PES data whose descriptors
//! identify teletext, VBI, DVB subtitles or the packaged audio codecs.

use crate::ts::tables::{EsView, PmtView};
use crate::ts::PsiSection;

/// Whether auto-selection would pick this ES.
pub fn es_would_be_selected(es: &EsView<'_>, any_type: bool) -> bool {
    if any_type {
        return true;
    }
    match es.stream_type {
        0x01 // video MPEG-1
        | 0x02 // video MPEG-2
        | 0x03 // audio MPEG-1
        | 0x04 // audio MPEG-2
        | 0x0f // audio AAC ADTS
        | 0x10 // video MPEG-4
        | 0x11 // audio AAC LATM
        | 0x1b // video H264
        | 0x24 // video H265
        | 0x42 // video AVS
        | 0x81 // ATSC AC-3
        | 0x87 // ATSC E-AC-3
        => true,
        0x06 => es.descriptors().any(|desc| {
            matches!(
                desc.tag,
                0x46 // VBI + teletext
                | 0x56 // teletext
                | 0x59 // dvbsub
                | 0x6a // AC-3
                | 0x7a // E-AC-3
                | 0x7b // DTS
                | 0x7c // AAC
            )
        }),
        _ => false,
    }
}

/// Whether packets of this ES carry PES (used by the invalid-PES watchdog).
pub fn es_carries_pes(es: &EsView<'_>) -> bool {
    matches!(
        es.stream_type,
        0x01 | 0x02 | 0x03 | 0x04 | 0x06 | 0x0f | 0x10 | 0x11 | 0x1b | 0x24 | 0x81 | 0x87
    )
}

/// Whether the PMT references any CA descriptor, in the program info or in
/// any ES info: such a service needs the external CAM to be watchable.
pub fn pmt_needs_descrambling(pmt: &PsiSection) -> bool {
    let view = PmtView(pmt);
    view.descriptors().any(|d| d.ca_pid().is_some())
        || view
            .es()
            .any(|es| es.descriptors().any(|d| d.ca_pid().is_some()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::tables::{DescriptorLoop, PmtBuilder};

    fn pmt_with_es(entries: &[(u8, u16, Option<(u8, Vec<u8>)>)]) -> PsiSection {
        let mut builder = PmtBuilder::new(1, 0);
        for (stream_type, pid, desc) in entries {
            let mut descs = DescriptorLoop::new();
            if let Some((tag, data)) = desc {
                descs.push(*tag, data);
            }
            builder.add_es(*stream_type, *pid, descs);
        }
        builder.build()
    }

    #[test]
    fn test_av_types_selected() {
        let pmt = pmt_with_es(&[(0x02, 100, None), (0x04, 101, None), (0x05, 102, None)]);
        let selected: Vec<bool> = PmtView(&pmt)
            .es()
            .map(|es| es_would_be_selected(&es, false))
            .collect();
        assert_eq!(selected, vec![true, true, false]);
    }

    #[test]
    fn test_private_data_needs_known_descriptor() {
        let pmt = pmt_with_es(&[
            (0x06, 100, Some((0x59, vec![0x65, 0x6e, 0x67, 0x10, 0x00, 0x10, 0x01]))),
            (0x06, 101, Some((0x52, vec![0x01]))),
        ]);
        let selected: Vec<bool> = PmtView(&pmt)
            .es()
            .map(|es| es_would_be_selected(&es, false))
            .collect();
        assert_eq!(selected, vec![true, false]);
    }

    #[test]
    fn test_any_type_selects_everything() {
        let pmt = pmt_with_es(&[(0x05, 100, None)]);
        assert!(PmtView(&pmt)
            .es()
            .all(|es| es_would_be_selected(&es, true)));
    }

    #[test]
    fn test_needs_descrambling() {
        let clear = pmt_with_es(&[(0x02, 100, None)]);
        assert!(!pmt_needs_descrambling(&clear));

        let scrambled = pmt_with_es(&[(0x02, 100, Some((0x09, vec![0x06, 0x04, 0xe1, 0x90])))]);
        assert!(pmt_needs_descrambling(&scrambled));

        let mut builder = PmtBuilder::new(1, 0);
        let mut ca = DescriptorLoop::new();
        ca.push(0x09, &[0x06, 0x04, 0xe1, 0x90]);
        builder.program_descs(ca);
        let program_level = builder.build();
        assert!(pmt_needs_descrambling(&program_level));
    }
}
