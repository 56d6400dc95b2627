//! Per-output PSI rebuilding.
//!
//! Every output advertises exactly its reduced program set: a one-program
//! PAT (plus the NIT entry in DVB mode), a PMT restricted to the forwarded
//! elementary streams with remapped PIDs, a NIT whose transport loop
//! carries the output's TSID, and a single-service SDT. Each rebuild bumps
//! that table's version; continuity counters are untouched.

use log::debug;

use crate::config::{MapSlot, N_MAP_PIDS, UNUSED_PID};
use crate::demux::select::es_would_be_selected;
use crate::demux::tracker::SectionSet;
use crate::ts::tables::{
    build_nit, build_pat, parse_service_descriptor, service_descriptor, DescriptorLoop, EsView,
    PatView, PmtBuilder, PmtView, SdtBuilder, SdtView,
};
use crate::ts::{PsiSection, CA_DESC_TAG, NIT_PID, PADDING_PID};

use super::remap::es_map_slot;
use super::Output;

/// Context the rebuilders need from the demultiplexer.
#[derive(Clone, Copy, Default)]
pub struct RebuildContext<'a> {
    /// Complete current PAT, when one has been promoted
    pub current_pat: Option<&'a SectionSet>,
    /// Complete current SDT, when one has been promoted
    pub current_sdt: Option<&'a SectionSet>,
    /// Current PMT of the output's service
    pub current_pmt: Option<&'a PsiSection>,
    /// Process-wide remap bases, overriding per-output ones
    pub global_remap: Option<[u16; N_MAP_PIDS]>,
    /// Keep CA descriptors and select ECM PIDs
    pub enable_ecm: bool,
    /// Select every ES type
    pub any_type: bool,
}

/// The PMT PID this output advertises for its service.
pub fn mapped_pmt_pid(output: &Output, ctx: &RebuildContext<'_>, original: u16) -> u16 {
    if let Some(map) = ctx.global_remap {
        if map[MapSlot::Pmt as usize] != 0 && map[MapSlot::Pmt as usize] != UNUSED_PID {
            return map[MapSlot::Pmt as usize];
        }
    } else if output.config.do_remap {
        let pid = output.config.map_pids[MapSlot::Pmt as usize];
        if pid != 0 && pid != UNUSED_PID {
            return pid;
        }
    }
    original
}

/// The remap base for one ES, from the global table or the output's.
fn remap_base(output: &Output, ctx: &RebuildContext<'_>, es: &EsView<'_>) -> u16 {
    if ctx.global_remap.is_none() && !output.config.do_remap {
        return 0;
    }
    let Some(slot) = es_map_slot(es) else {
        return 0;
    };
    let base = match ctx.global_remap {
        Some(map) => map[slot as usize],
        None => output.config.map_pids[slot as usize],
    };
    if base == UNUSED_PID {
        0
    } else {
        base
    }
}

/// Rebuilds the output's PAT: one program (renamed when `newsid` is set),
/// the NIT entry in DVB mode. When the service is missing from the input
/// PAT no section is stored; the router then emits an empty PAT so
/// receivers still see a consistent version increment.
pub fn new_pat(output: &mut Output, ctx: &RebuildContext<'_>) {
    output.pat.invalidate();

    if output.config.sid == 0 {
        return;
    }
    let Some(pat) = ctx.current_pat else {
        return;
    };
    let pmt_pid = pat.sections().into_iter().find_map(|section| {
        PatView(section)
            .programs()
            .find(|&(program, _)| program == output.config.sid)
            .map(|(_, pid)| pid)
    });
    let Some(pmt_pid) = pmt_pid else {
        return;
    };

    let mut programs = Vec::with_capacity(2);
    if output.config.dvb {
        programs.push((0, NIT_PID));
    }
    if output.config.new_sid != 0 {
        debug!(
            "mapping PAT SID {} to {}",
            output.config.sid, output.config.new_sid
        );
    }
    programs.push((
        output.config.effective_sid(),
        mapped_pmt_pid(output, ctx, pmt_pid),
    ));

    output.pat.section = Some(build_pat(output.tsid, output.pat.version, &programs));
}

/// Copies a descriptor loop, dropping CA descriptors unless ECM
/// passthrough keeps them meaningful downstream.
fn copy_descs<'a>(descs: impl Iterator<Item = crate::ts::tables::Descriptor<'a>>, enable_ecm: bool) -> DescriptorLoop {
    let mut copied = DescriptorLoop::new();
    for desc in descs {
        if !enable_ecm && desc.tag == CA_DESC_TAG {
            continue;
        }
        copied.push_desc(&desc);
    }
    copied
}

/// Rebuilds the output's PMT from the service's current PMT, keeping only
/// the selected elementary streams and applying PID remapping. The PCR PID
/// is resolved after the ES loop so it picks up any reassignment.
pub fn new_pmt(output: &mut Output, ctx: &RebuildContext<'_>) {
    output.pmt.invalidate();

    if output.config.sid == 0 {
        return;
    }
    let Some(pmt) = ctx.current_pmt else {
        return;
    };
    let view = PmtView(pmt);

    output.remap.reset();
    let mut builder = PmtBuilder::new(output.config.effective_sid(), output.pmt.version);
    builder.program_descs(copy_descs(view.descriptors(), ctx.enable_ecm));

    for es in view.es() {
        let in_list = output.config.pids.contains(&es.pid);
        if (!output.config.pids.is_empty() || !es_would_be_selected(&es, ctx.any_type)) && !in_list
        {
            continue;
        }
        let base = remap_base(output, ctx, &es);
        let new_pid = output.remap.assign(base, es.pid);
        builder.add_es(es.stream_type, new_pid, copy_descs(es.descriptors(), ctx.enable_ecm));
    }

    let mut pcr_pid = view.pcr_pid();
    if pcr_pid != PADDING_PID {
        if let Some(mapped) = output.remap.get(pcr_pid) {
            debug!("PCR PID remapped from {} to {}", pcr_pid, mapped);
            pcr_pid = mapped;
        }
    }
    builder.pcr_pid(pcr_pid);

    output.pmt.section = Some(builder.build());
}

/// Rebuilds the output's NIT: configured network id and name, one
/// transport entry advertising this output's TSID.
pub fn new_nit(output: &mut Output) {
    output.nit.invalidate();
    let name = &output.config.network_name;
    output.nit.section = Some(build_nit(
        output.config.network_id,
        output.nit.version,
        (!name.is_empty()).then_some(name.as_slice()),
        output.tsid,
        output.config.effective_onid(),
    ));
}

/// Rebuilds the output's SDT: the one selected service with copied or
/// overridden names. EITp/f presence is always carried over; the schedule
/// flag only with the EPG option. free_CA is never set since the output is
/// expected to be descrambled.
pub fn new_sdt(output: &mut Output, ctx: &RebuildContext<'_>) {
    output.sdt.invalidate();

    if output.config.sid == 0 {
        return;
    }
    let Some(sdt) = ctx.current_sdt else {
        return;
    };
    let sections = sdt.sections();
    let service = sections
        .iter()
        .copied()
        .flat_map(|section| SdtView(section).services())
        .find(|service| service.sid == output.config.sid);

    let Some(service) = service else {
        // Service gone from the SDT: an empty PAT with no SDT entry means
        // the program disappeared entirely, drop the stale PAT too.
        if let Some(pat) = &output.pat.section {
            if PatView(pat).programs().next().is_none() {
                output.pat.invalidate();
            }
        }
        return;
    };

    let onid = if output.config.onid != 0 {
        output.config.onid
    } else {
        sections
            .first()
            .copied()
            .map(|section| SdtView(section).onid())
            .unwrap_or(output.config.network_id)
    };

    let mut builder = SdtBuilder::new(
        output.tsid,
        output.sdt.version,
        onid,
        output.config.effective_sid(),
    );
    builder.eit_flags(
        output.config.epg && service.eit_schedule,
        service.eit_present,
    );
    builder.running(service.running);

    let override_names =
        !output.config.provider_name.is_empty() || !output.config.service_name.is_empty();
    let mut descs = DescriptorLoop::new();
    for desc in service.descriptors() {
        if override_names && desc.tag == 0x48 {
            if let Some((service_type, provider, name)) = parse_service_descriptor(desc.data) {
                let provider = if output.config.provider_name.is_empty() {
                    provider
                } else {
                    &output.config.provider_name
                };
                let name = if output.config.service_name.is_empty() {
                    name
                } else {
                    &output.config.service_name
                };
                descs.push(0x48, &service_descriptor(service_type, provider, name));
                continue;
            }
        }
        descs.push_desc(&desc);
    }
    builder.descs(descs);

    output.sdt.section = Some(builder.build());
}
