//! The demultiplexer: PSI tracking, PID selection and the output router.
//!
//! One [`Demuxer`] value owns everything the event loop mutates: the
//! 8192-entry PID state table, the service registry, the current/next PSI
//! tables, the output arena and the coordination with the external CA
//! stack. Incoming packets flow through [`Demuxer::run_burst`]; the
//! runtime drains output queues and drives timers between bursts.

use std::cell::RefCell;
use std::rc::Rc;

use bitvec::prelude::*;
use log::{debug, info, warn};

use crate::block::{BlockPool, TsBlock};
use crate::ca::CaSession;
use crate::config::{
    MapSlot, OutputConfig, Settings, MAX_ERRORS, MAX_EIT_RETENTION, UNUSED_PID, WATCHDOG_REFRACTORY_PERIOD,
    WATCHDOG_WAIT,
};
use crate::error::Result;
use crate::events::Reporter;
use crate::input::CaptureFilters;
use crate::output::rebuild::{self, RebuildContext};
use crate::output::Output;
use crate::ts::packet::{cc_is_discontinuity, cc_is_duplicate, pes_validate};
use crate::ts::psi::{pack_sections, Assembled};
use crate::ts::tables::{
    self, eit, CatView, EitView, NitView, PatView, PmtView, SdtView,
};
use crate::ts::{
    PsiSection, TsPacket, CAT_PID, CAT_TABLE_ID, EIT_PID, EIT_TABLE_ID_PF_ACTUAL, MAX_PIDS,
    NIT_PID, NIT_TABLE_ID_ACTUAL, PADDING_PID, PAT_PID, PAT_TABLE_ID, PMT_TABLE_ID, RST_PID,
    SDT_PID, SDT_TABLE_ID_ACTUAL, TDT_PID, TS_SIZE,
};
use crate::Mtime;

pub mod pid;
pub mod select;
pub mod tracker;

use pid::PidState;
use select::{es_carries_pes, es_would_be_selected, pmt_needs_descrambling};
use tracker::{Promotion, SectionSet, TableTracker};

/// Number of EIT tables tracked per service (present/following plus the
/// actual-TS schedule range).
pub const MAX_EIT_TABLES: usize =
    (crate::ts::EIT_TABLE_ID_SCHED_ACTUAL_LAST - EIT_TABLE_ID_PF_ACTUAL) as usize;

/// One tracked service.
#[derive(Debug)]
pub struct Service {
    /// Service id; 0 marks a tombstoned slot
    pub sid: u16,
    /// PID its PMT arrives on
    pub pmt_pid: u16,
    /// Last accepted PMT
    pub current_pmt: Option<PsiSection>,
    /// EIT sections per table, indexed by section number. EN 300 468
    /// allows holes in EIT section numbering, so these are not
    /// table-tracked: there is no sure way to know a table is complete.
    pub eit: Vec<Vec<Option<PsiSection>>>,
}

impl Service {
    fn new(sid: u16, pmt_pid: u16) -> Self {
        Self {
            sid,
            pmt_pid,
            current_pmt: None,
            eit: (0..MAX_EIT_TABLES)
                .map(|_| vec![None; crate::ts::psi::PSI_TABLE_MAX_SECTIONS])
                .collect(),
        }
    }

    fn clear(&mut self) {
        self.sid = 0;
        self.pmt_pid = 0;
        self.current_pmt = None;
        for table in &mut self.eit {
            table.iter_mut().for_each(|s| *s = None);
        }
    }
}

type PidMap = BitArr!(for MAX_PIDS);

/// Counters reported by the periodic status print.
#[derive(Debug, Default)]
struct Counters {
    packets: u64,
    invalids: u64,
    discontinuities: u64,
    transport_errors: u64,
}

/// The demultiplexer and output router.
pub struct Demuxer {
    /// Process settings
    pub settings: Settings,
    /// Structured event channel
    pub reporter: Reporter,
    /// Shared carrier pool
    pub pool: Rc<RefCell<BlockPool>>,
    /// Capture driver filter backend
    pub filters: Box<dyn CaptureFilters>,
    /// External CA stack, when one is attached
    pub ca: Option<Box<dyn CaSession>>,
    /// Current wall clock (µs)
    pub wallclock: Mtime,

    pids: Vec<PidState>,
    services: Vec<Service>,
    pat: TableTracker,
    cat: TableTracker,
    nit: TableTracker,
    sdt: TableTracker,

    /// Output arena; invalid entries are tombstones reused on creation
    pub outputs: Vec<Output>,
    /// Optional duplication output receiving every valid packet
    pub dup: Option<Output>,

    last_dts: Option<Mtime>,
    counters: Counters,
    tuner_errors: u32,
    last_error: Mtime,
    last_reset: Mtime,
    budget_filter: Option<pid::FilterHandle>,
}

impl Demuxer {
    /// Builds the demuxer and arms the base PSI PIDs (PAT, CAT when EMM
    /// tracking is on, NIT, SDT, EIT, RST, TDT).
    pub fn new(
        settings: Settings,
        reporter: Reporter,
        filters: Box<dyn CaptureFilters>,
        ca: Option<Box<dyn CaSession>>,
    ) -> Self {
        let mut demuxer = Self {
            settings,
            reporter,
            pool: Rc::new(RefCell::new(BlockPool::default())),
            filters,
            ca,
            wallclock: 0,
            pids: (0..MAX_PIDS).map(|_| PidState::default()).collect(),
            services: Vec::new(),
            pat: TableTracker::new(),
            cat: TableTracker::new(),
            nit: TableTracker::new(),
            sdt: TableTracker::new(),
            outputs: Vec::new(),
            dup: None,
            last_dts: None,
            counters: Counters::default(),
            tuner_errors: 0,
            last_error: 0,
            last_reset: 0,
            budget_filter: None,
        };

        if demuxer.settings.budget_mode {
            demuxer.budget_filter = demuxer.filters.set_filter(MAX_PIDS as u16);
        }

        demuxer.set_pid(PAT_PID);
        demuxer.pids[PAT_PID as usize].psi_refcount += 1;
        if demuxer.settings.enable_emm {
            demuxer.set_pid_emm(CAT_PID);
            demuxer.pids[CAT_PID as usize].psi_refcount += 1;
        }
        demuxer.set_pid(NIT_PID);
        demuxer.pids[NIT_PID as usize].psi_refcount += 1;
        demuxer.set_pid(SDT_PID);
        demuxer.pids[SDT_PID as usize].psi_refcount += 1;
        demuxer.set_pid(EIT_PID);
        demuxer.pids[EIT_PID as usize].psi_refcount += 1;
        demuxer.set_pid(RST_PID);
        demuxer.set_pid(TDT_PID);
        demuxer
    }

    // -----------------------------------------------------------------
    // PID filter accounting
    // -----------------------------------------------------------------

    fn set_pid(&mut self, pid: u16) {
        let state = &mut self.pids[pid as usize];
        state.refcount += 1;
        if !self.settings.budget_mode && state.refcount > 0 && state.filter.is_none() {
            state.filter = self.filters.set_filter(pid);
        }
    }

    fn set_pid_emm(&mut self, pid: u16) {
        self.set_pid(pid);
        self.pids[pid as usize].emm = true;
    }

    fn unset_pid(&mut self, pid: u16) {
        let state = &mut self.pids[pid as usize];
        state.refcount = state.refcount.saturating_sub(1);
        if !self.settings.budget_mode && state.refcount == 0 {
            if let Some(handle) = state.filter.take() {
                self.filters.unset_filter(handle, pid);
            }
            state.emm = false;
        }
    }

    fn start_pid(&mut self, output: usize, pid: u16) {
        if self.pids[pid as usize].subscribe(output) {
            self.set_pid(pid);
        }
    }

    fn stop_pid(&mut self, output: usize, pid: u16) {
        if self.pids[pid as usize].unsubscribe(output) {
            self.unset_pid(pid);
        }
    }

    fn select_pid(&mut self, sid: u16, pid: u16, is_pcr: bool) {
        for index in 0..self.outputs.len() {
            let output = &self.outputs[index];
            if !output.valid || output.config.sid != sid {
                continue;
            }
            if !output.config.pids.is_empty() && !output.config.pids.contains(&pid) {
                if is_pcr {
                    self.outputs[index].pcr_pid = pid;
                } else {
                    continue;
                }
            }
            self.start_pid(index, pid);
        }
    }

    fn unselect_pid(&mut self, sid: u16, pid: u16) {
        for index in 0..self.outputs.len() {
            let output = &self.outputs[index];
            if output.valid && output.config.sid == sid && output.config.pids.is_empty() {
                self.stop_pid(index, pid);
            }
        }
    }

    fn outputs_on_sid(&self, sid: u16) -> usize {
        self.outputs
            .iter()
            .filter(|o| o.valid && o.config.sid == sid)
            .count()
    }

    fn select_pmt(&mut self, sid: u16, pid: u16) {
        self.pids[pid as usize].psi_refcount += 1;
        self.pids[pid as usize].pes = false;
        if self.settings.select_pmts {
            self.set_pid(pid);
        } else {
            for _ in 0..self.outputs_on_sid(sid) {
                self.set_pid(pid);
            }
        }
    }

    fn unselect_pmt(&mut self, sid: u16, pid: u16) {
        let state = &mut self.pids[pid as usize];
        state.psi_refcount = state.psi_refcount.saturating_sub(1);
        if state.psi_refcount == 0 {
            state.assembler.reset();
        }
        if self.settings.select_pmts {
            self.unset_pid(pid);
        } else {
            for _ in 0..self.outputs_on_sid(sid) {
                self.unset_pid(pid);
            }
        }
    }

    // -----------------------------------------------------------------
    // Service registry
    // -----------------------------------------------------------------

    fn find_service(&self, sid: u16) -> Option<usize> {
        self.services.iter().position(|s| s.sid == sid)
    }

    fn sid_is_selected(&self, sid: u16) -> bool {
        self.outputs
            .iter()
            .any(|o| o.valid && o.config.sid == sid)
    }

    /// True when any output subscribes to `pid`.
    pub fn pid_is_selected(&self, pid: u16) -> bool {
        self.pids[pid as usize].is_selected()
    }

    // -----------------------------------------------------------------
    // PID selection (wanted set of one output config)
    // -----------------------------------------------------------------

    /// Computes the PIDs an output wants for `(sid, explicit list)` along
    /// with the PCR PID to subscribe partially, 0 when none.
    pub fn pids_for_service(&self, sid: u16, explicit: &[u16]) -> (Vec<u16>, u16) {
        let mut wanted: Vec<u16> = Vec::new();
        let mut pcr = 0u16;

        if !explicit.is_empty() || sid == 0 {
            wanted.extend_from_slice(explicit);
            if sid == 0 {
                return (wanted, pcr);
            }
        }

        let Some(service) = self.find_service(sid).map(|i| &self.services[i]) else {
            return (wanted, pcr);
        };
        let Some(pmt) = &service.current_pmt else {
            debug!("no current PMT on sid {}", sid);
            return (wanted, pcr);
        };

        let view = PmtView(pmt);
        for es in view.es() {
            let selected = if !explicit.is_empty() {
                explicit.contains(&es.pid)
            } else {
                let selected = es_would_be_selected(&es, self.settings.any_type);
                if selected {
                    wanted.push(es.pid);
                }
                selected
            };

            if selected && self.settings.enable_ecm {
                for desc in es.descriptors() {
                    if let Some((_, ecm_pid)) = desc.ca_pid() {
                        wanted.push(ecm_pid);
                    }
                }
            }
        }

        if self.settings.enable_ecm {
            for desc in view.descriptors() {
                if let Some((_, ecm_pid)) = desc.ca_pid() {
                    wanted.push(ecm_pid);
                }
            }
        }

        let pcr_pid = view.pcr_pid();
        if pcr_pid != PADDING_PID && pcr_pid != service.pmt_pid && !wanted.contains(&pcr_pid) {
            wanted.push(pcr_pid);
            // Only the PCR packets of this PID are needed (partial).
            pcr = pcr_pid;
            debug!("requesting partial PCR PID {}", pcr_pid);
        }

        (wanted, pcr)
    }

    // -----------------------------------------------------------------
    // Output management
    // -----------------------------------------------------------------

    /// Finds an existing output with the same identity (target and bind).
    pub fn find_output(&self, config: &OutputConfig) -> Option<usize> {
        self.outputs.iter().position(|o| {
            o.valid && o.config.remote == config.remote && o.config.bind == config.bind
        })
    }

    /// Creates an output in a tombstone slot or at the end of the arena.
    /// The demux-facing half of the config starts blank so the first
    /// `change_output` sees every difference and starts the filters.
    pub fn create_output(&mut self, config: &OutputConfig) -> Result<usize> {
        let mut initial = config.clone();
        initial.sid = 0;
        initial.pids.clear();
        initial.passthrough = false;
        initial.tsid = None;

        let mut output = Output::new(initial, Rc::clone(&self.pool))?;
        if self.settings.unique_tsid {
            output.tsid = rand::random::<u16>();
        }
        info!("opening output {}", config.display_name);

        match self.outputs.iter().position(|o| !o.valid) {
            Some(slot) => {
                self.outputs[slot] = output;
                Ok(slot)
            }
            None => {
                self.outputs.push(output);
                Ok(self.outputs.len() - 1)
            }
        }
    }

    fn resolve_tsid(&self, explicit: Option<u16>) -> u16 {
        if let Some(tsid) = explicit {
            return tsid;
        }
        match self.pat.current() {
            Some(current) if !self.settings.random_tsid => current.tableidext().unwrap_or(0),
            _ => rand::random::<u16>(),
        }
    }

    fn regen_pat(&mut self, index: usize) {
        let pat = self.pat.current().cloned();
        let ctx = RebuildContext {
            current_pat: pat.as_ref(),
            global_remap: self.settings.remap,
            ..Default::default()
        };
        rebuild::new_pat(&mut self.outputs[index], &ctx);
    }

    /// Applies a new configuration to an output: diffs PID selections,
    /// updates CA subscriptions and regenerates exactly the affected
    /// tables. Calling it twice with the same config is a no-op.
    pub fn change_output(&mut self, index: usize, new_config: &OutputConfig) {
        let old_config = self.outputs[index].config.clone();
        let old_sid = old_config.sid;
        let new_sid = new_config.sid;

        let sid_change = new_sid != old_sid;
        let mut pid_change = false;
        let mut tsid_change = false;
        let dvb_change = old_config.dvb != new_config.dvb;
        let epg_change = old_config.epg != new_config.epg;
        let network_change = old_config.network_name != new_config.network_name
            || old_config.network_id != new_config.network_id;
        let service_name_change = old_config.service_name != new_config.service_name
            || old_config.provider_name != new_config.provider_name;
        let remap_change = old_config.new_sid != new_config.new_sid
            || old_config.onid != new_config.onid
            || old_config.do_remap != new_config.do_remap
            || old_config.map_pids != new_config.map_pids;

        if old_config.tsid != new_config.tsid || self.outputs[index].tsid == 0 {
            self.outputs[index].tsid = self.resolve_tsid(new_config.tsid);
            tsid_change = true;
        }

        let same_selection = new_config.passthrough == old_config.passthrough
            && !sid_change
            && new_config.pids == old_config.pids;

        if !same_selection {
            let (wanted, wanted_pcr) = self.pids_for_service(new_sid, &new_config.pids);
            let (current, _) = self.pids_for_service(old_sid, &old_config.pids);

            // While the selection changes hands, config.sid is flipped so
            // the per-service accounting never counts this output twice.
            if sid_change && old_sid != 0 {
                self.outputs[index].config.sid = new_sid;
                if let Some(service_index) = self.find_service(old_sid) {
                    let pmt_pid = self.services[service_index].pmt_pid;
                    self.unselect_pmt(old_sid, pmt_pid);

                    let pmt = self.services[service_index].current_pmt.clone();
                    if let Some(pmt) = pmt {
                        if self.ca.is_some()
                            && !self.sid_is_selected(old_sid)
                            && pmt_needs_descrambling(&pmt)
                        {
                            self.ca.as_mut().unwrap().delete_pmt(&pmt);
                        }
                    }
                }
            }

            for pid in &current {
                if !wanted.contains(pid) {
                    self.stop_pid(index, *pid);
                    pid_change = true;
                }
            }

            if sid_change && self.ca.is_some() && old_sid != 0 && self.sid_is_selected(old_sid) {
                if let Some(service_index) = self.find_service(old_sid) {
                    if let Some(pmt) = self.services[service_index].current_pmt.clone() {
                        if pmt_needs_descrambling(&pmt) {
                            self.ca.as_mut().unwrap().update_pmt(&pmt);
                        }
                    }
                }
            }

            for pid in &wanted {
                if !current.contains(pid) {
                    self.start_pid(index, *pid);
                    pid_change = true;
                }
            }
            self.outputs[index].pcr_pid = wanted_pcr;

            if sid_change && new_sid != 0 {
                self.outputs[index].config.sid = old_sid;
                if let Some(service_index) = self.find_service(new_sid) {
                    let pmt_pid = self.services[service_index].pmt_pid;
                    self.select_pmt(new_sid, pmt_pid);

                    let pmt = self.services[service_index].current_pmt.clone();
                    if let Some(pmt) = pmt {
                        if self.ca.is_some()
                            && !self.sid_is_selected(new_sid)
                            && pmt_needs_descrambling(&pmt)
                        {
                            self.ca.as_mut().unwrap().add_pmt(&pmt);
                        }
                    }
                }
            }

            if self.ca.is_some() && new_sid != 0 && self.sid_is_selected(new_sid) {
                if let Some(service_index) = self.find_service(new_sid) {
                    if let Some(pmt) = self.services[service_index].current_pmt.clone() {
                        if pmt_needs_descrambling(&pmt) {
                            self.ca.as_mut().unwrap().update_pmt(&pmt);
                        }
                    }
                }
            }
        }

        self.outputs[index].config = new_config.clone();
        self.outputs[index].still_present = true;

        if sid_change || pid_change || tsid_change || dvb_change || network_change
            || service_name_change || remap_change
        {
            debug!(
                "change {}{}{}{}{}{}{}",
                if sid_change { "sid " } else { "" },
                if pid_change { "pid " } else { "" },
                if tsid_change { "tsid " } else { "" },
                if dvb_change { "dvb " } else { "" },
                if network_change { "network " } else { "" },
                if service_name_change { "service_name " } else { "" },
                if remap_change { "remap " } else { "" },
            );
        }

        let ctx_sid = new_sid;
        if sid_change || remap_change {
            self.regen_sdt(index);
            rebuild::new_nit(&mut self.outputs[index]);
            self.regen_pat(index);
            self.regen_pmt(index, ctx_sid);
        } else {
            if tsid_change {
                self.regen_sdt(index);
                rebuild::new_nit(&mut self.outputs[index]);
                self.regen_pat(index);
            } else if dvb_change {
                rebuild::new_nit(&mut self.outputs[index]);
                self.regen_pat(index);
            } else if network_change {
                rebuild::new_nit(&mut self.outputs[index]);
            }
            if !tsid_change && (service_name_change || epg_change) {
                self.regen_sdt(index);
            }
            if pid_change {
                self.regen_pmt(index, ctx_sid);
            }
        }
    }

    fn regen_pmt(&mut self, index: usize, sid: u16) {
        let pmt = self
            .find_service(sid)
            .and_then(|i| self.services[i].current_pmt.clone());
        let ctx = RebuildContext {
            current_pmt: pmt.as_ref(),
            global_remap: self.settings.remap,
            enable_ecm: self.settings.enable_ecm,
            any_type: self.settings.any_type,
            ..Default::default()
        };
        rebuild::new_pmt(&mut self.outputs[index], &ctx);
    }

    fn regen_sdt(&mut self, index: usize) {
        let sdt = self.sdt.current().cloned();
        let ctx = RebuildContext {
            current_sdt: sdt.as_ref(),
            ..Default::default()
        };
        rebuild::new_sdt(&mut self.outputs[index], &ctx);
    }

    /// Unselects everything an output holds and closes it.
    pub fn close_output(&mut self, index: usize) {
        let mut blank = self.outputs[index].config.clone();
        blank.sid = 0;
        blank.pids.clear();
        blank.passthrough = false;
        self.change_output(index, &blank);
        info!("closing {}", self.outputs[index].config.display_name);
        self.outputs[index].close();
    }

    /// Applies a full set of parsed config lines: finds or creates each
    /// output, diffs it, and closes outputs whose lines disappeared.
    pub fn apply_config(&mut self, configs: &[OutputConfig]) {
        for output in self.outputs.iter_mut() {
            output.still_present = false;
        }
        for config in configs {
            let index = match self.find_output(config) {
                Some(index) => index,
                None => match self.create_output(config) {
                    Ok(index) => index,
                    Err(err) => {
                        log::error!("couldn't open {} ({})", config.display_name, err);
                        continue;
                    }
                },
            };
            self.outputs[index].config.display_name = config.display_name.clone();
            self.change_output(index, config);
        }
        for index in 0..self.outputs.len() {
            if self.outputs[index].valid && !self.outputs[index].still_present {
                self.close_output(index);
            }
        }
    }

    // -----------------------------------------------------------------
    // Burst handling
    // -----------------------------------------------------------------

    /// Demuxes one burst of packets read from the input, stamping DTS by
    /// interpolating the previous read time over the burst.
    pub fn run_burst(&mut self, mut blocks: Vec<TsBlock>, now: Mtime) {
        self.wallclock = now;
        let count = blocks.len() as Mtime;
        let duration = match self.last_dts {
            Some(last) => now - last,
            None => 0,
        };
        for (i, block) in blocks.iter_mut().enumerate() {
            block.dts = now - duration * (count - 1 - i as Mtime) / count.max(1);
        }
        self.last_dts = Some(now);

        for block in blocks {
            self.handle(block);
        }
    }

    /// Routes one packet: statistics, watchdogs, PSI, then fan-out.
    pub fn handle(&mut self, block: TsBlock) {
        self.counters.packets += 1;

        if !block.packet().validate() {
            warn!("lost TS sync");
            self.counters.invalids += 1;
            self.pool.borrow_mut().reclaim(block.data);
            return;
        }

        let packet = block.packet();
        let pid = packet.pid();
        let cc = packet.cc();
        let unit_start = packet.unit_start();
        let scrambling = packet.scrambling();
        let transport_error = packet.transport_error();
        let now = self.wallclock;

        {
            let state = &mut self.pids[pid as usize];
            if pid != PADDING_PID {
                state.info.scrambling = scrambling;
            }
            state.info.last_packet_ts = now;
            state.info.packets += 1;
            state.window_packets += 1;
            if now > state.window_start + 1_000_000 {
                state.info.bytes_per_sec = state.window_packets * TS_SIZE as u64;
                state.window_packets = 0;
                state.window_start = now;
            }
            if state.info.first_packet_ts == 0 {
                state.info.first_packet_ts = now;
            }
        }

        let last_cc = self.pids[pid as usize].last_cc;
        if pid != PADDING_PID {
            if let Some(last) = last_cc {
                if !cc_is_duplicate(cc, last) && cc_is_discontinuity(cc, last) {
                    let (desc, sid) = self.pid_description(pid);
                    self.pids[pid as usize].info.cc_errors += 1;
                    self.counters.discontinuities += 1;
                    warn!(
                        "TS discontinuity on pid {:4} expected_cc {:2} got {:2} ({}, sid {})",
                        pid,
                        (last + 1) & 0x0f,
                        cc,
                        desc,
                        sid
                    );
                }
            }
        }

        if transport_error {
            let (desc, sid) = self.pid_description(pid);
            self.pids[pid as usize].info.transport_errors += 1;
            warn!("transport_error_indicator on pid {} ({}, sid {})", pid, desc, sid);
            self.counters.transport_errors += 1;
            self.tuner_errors += 1;
            self.last_error = now;
        } else if now > self.last_error + WATCHDOG_WAIT {
            self.tuner_errors = 0;
        }

        if self.tuner_errors > MAX_ERRORS {
            self.tuner_errors = 0;
            warn!("too many transport errors, tuning again");
            self.reporter.reset("transport");
            self.filters.reset();
        }

        if self.settings.es_timeout != 0 {
            self.track_presence(&block, pid, now);
        }

        if !transport_error {
            if pid == TDT_PID || pid == RST_PID {
                self.send_tdt(&block);
            } else if self.pids[pid as usize].psi_refcount > 0 {
                self.handle_psi_packet(&block);
            }
            if self.settings.enable_emm && self.pids[pid as usize].emm {
                self.send_emm(&block);
            }
        }

        self.pids[pid as usize].last_cc = Some(cc);

        // Fan out to subscribers.
        let subscribers: Vec<usize> = self.pids[pid as usize]
            .outputs
            .iter()
            .filter_map(|slot| *slot)
            .collect();
        for index in subscribers {
            if !self.outputs[index].valid {
                continue;
            }

            if self.ca.is_some() && self.outputs[index].config.watch && unit_start {
                let payload = packet.payload();
                let suspicious = scrambling != 0
                    || (self.pids[pid as usize].pes
                        && payload.len() >= 3
                        && !pes_validate(payload));
                if suspicious {
                    if now > self.last_reset + WATCHDOG_REFRACTORY_PERIOD {
                        self.outputs[index].errors += 1;
                        self.outputs[index].last_error = now;
                    }
                } else if now > self.outputs[index].last_error + WATCHDOG_WAIT {
                    self.outputs[index].errors = 0;
                }

                if self.outputs[index].errors > MAX_ERRORS {
                    for output in self.outputs.iter_mut() {
                        output.errors = 0;
                    }
                    warn!(
                        "too many errors for stream {}, resetting",
                        self.outputs[index].config.display_name
                    );
                    self.reporter.reset("scrambling");
                    self.last_reset = now;
                    if let Some(ca) = self.ca.as_mut() {
                        ca.reset();
                    }
                    self.resend_ca_pmts();
                }
            }

            let partial = self.outputs[index].pcr_pid == pid;
            if !partial || packet.has_pcr() {
                self.outputs[index].put(&block);
            }

            if let Some(buffer_dts) = self.outputs[index].eit_buffer_dts() {
                if block.dts > buffer_dts + MAX_EIT_RETENTION {
                    self.outputs[index].flush_eit(block.dts);
                }
            }
        }

        for output in self.outputs.iter_mut() {
            if output.valid && output.config.passthrough {
                output.put(&block);
            }
        }
        if let Some(dup) = self.dup.as_mut() {
            if dup.valid {
                dup.put(&block);
            }
        }

        self.pool.borrow_mut().reclaim(block.data);
    }

    fn track_presence(&mut self, block: &TsBlock, pid: u16, now: Mtime) {
        let packet = block.packet();
        let status = if packet.scrambling() != 0 {
            Some(false)
        } else if packet.unit_start() {
            let payload = packet.payload();
            (payload.len() >= 3).then(|| pes_validate(payload))
        } else {
            None
        };

        let Some(status) = status else {
            return;
        };
        let timeout = if pid == TDT_PID {
            30_000_000
        } else {
            self.settings.es_timeout
        };

        match self.pids[pid as usize].pes_status {
            None => {
                self.pids[pid as usize].pes_status = Some(status);
                self.reporter.pid_status(pid, true, status);
            }
            Some(previous) if previous != status => {
                self.pids[pid as usize].pes_status = Some(status);
                self.reporter.pid_status(pid, true, status);
            }
            Some(_) => {}
        }
        self.pids[pid as usize].presence_deadline = Some(now + timeout);
    }

    /// Sweeps the PID presence deadlines; fired from the housekeeping
    /// tick.
    pub fn check_presence(&mut self, now: Mtime) {
        if self.settings.es_timeout == 0 {
            return;
        }
        for pid in 0..MAX_PIDS as u16 {
            let state = &mut self.pids[pid as usize];
            if let Some(deadline) = state.presence_deadline {
                if now >= deadline {
                    state.presence_deadline = None;
                    state.pes_status = None;
                    self.reporter.pid_status(pid, false, false);
                }
            }
        }
    }

    /// Periodic status print: bitrate then the accumulated error counters.
    pub fn print_status(&mut self, period: Mtime) {
        let bitrate = self
            .counters
            .packets
            .saturating_mul(TS_SIZE as u64 * 8 * 1_000_000)
            / period.max(1) as u64;
        self.reporter.bitrate(bitrate);
        self.counters.packets = 0;

        if self.counters.invalids > 0 {
            self.reporter.invalids(self.counters.invalids);
            self.counters.invalids = 0;
        }
        if self.counters.discontinuities > 0 {
            self.reporter.discontinuities(self.counters.discontinuities);
            self.counters.discontinuities = 0;
        }
        if self.counters.transport_errors > 0 {
            self.reporter.transport_errors(self.counters.transport_errors);
            self.counters.transport_errors = 0;
        }
    }

    /// Drains due packet groups on every output. Returns the earliest
    /// pending send deadline.
    pub fn send_outputs(&mut self, now: Mtime) -> Option<Mtime> {
        let mut earliest: Option<Mtime> = None;
        let mut fold = |deadline: Option<Mtime>| {
            if let Some(deadline) = deadline {
                earliest = Some(earliest.map_or(deadline, |e: Mtime| e.min(deadline)));
            }
        };
        if let Some(dup) = self.dup.as_mut() {
            if dup.valid {
                fold(dup.send_due(now));
            }
        }
        for output in self.outputs.iter_mut() {
            if output.valid {
                fold(output.send_due(now));
            }
        }
        earliest
    }

    // -----------------------------------------------------------------
    // PSI handling
    // -----------------------------------------------------------------

    fn handle_psi_packet(&mut self, block: &TsBlock) {
        let packet = block.packet();
        let pid = packet.pid();
        let cc = packet.cc();
        let dts = block.dts;

        let state = &mut self.pids[pid as usize];
        if let Some(last) = state.last_cc {
            if cc_is_duplicate(cc, last) {
                return;
            }
            if cc_is_discontinuity(cc, last) {
                state.assembler.reset();
            }
        }
        if !packet.has_payload() {
            return;
        }

        let data = block.data.clone();
        let view = TsPacket(&data);
        let payload_offset = view.payload_offset();
        if payload_offset >= TS_SIZE {
            return;
        }

        // Tail of a section in progress: up to the pointer target on
        // unit-start packets, the whole payload otherwise.
        let cont_offset = if view.unit_start() {
            (payload_offset + 1).min(TS_SIZE)
        } else {
            payload_offset
        };
        if !self.pids[pid as usize].assembler.is_empty() {
            let mut payload = &data[cont_offset..];
            match self.pids[pid as usize].assembler.push(&mut payload) {
                Assembled::Section(section) => self.handle_section(pid, section, dts),
                Assembled::Invalid => self.reporter.error_pid("invalid_section", pid),
                Assembled::Incomplete => {}
            }
        }

        // Sections starting in this packet.
        let Some(offset) = view.next_section_offset() else {
            return;
        };
        let mut payload = &data[offset..];
        while !payload.is_empty() {
            match self.pids[pid as usize].assembler.push(&mut payload) {
                Assembled::Section(section) => self.handle_section(pid, section, dts),
                Assembled::Incomplete => break,
                Assembled::Invalid => {
                    self.reporter.error_pid("invalid_section", pid);
                    break;
                }
            }
        }
    }

    fn handle_section(&mut self, pid: u16, section: PsiSection, dts: Mtime) {
        if !section.validate() {
            warn!("invalid section on PID {}", pid);
            self.reporter.error_pid("invalid_section", pid);
            return;
        }
        if !section.is_current() {
            return;
        }

        match section.table_id() {
            PAT_TABLE_ID => self.handle_pat_section(pid, section, dts),
            CAT_TABLE_ID => {
                if self.settings.enable_emm {
                    self.handle_cat_section(pid, section);
                }
            }
            PMT_TABLE_ID => self.handle_pmt(pid, section, dts),
            NIT_TABLE_ID_ACTUAL => self.handle_nit_section(pid, section, dts),
            SDT_TABLE_ID_ACTUAL => self.handle_sdt_section(pid, section, dts),
            table_id if tables::is_eit_table_id(table_id) => {
                self.handle_eit(pid, section, dts);
            }
            _ => {}
        }
    }

    // --- PAT ---

    fn handle_pat_section(&mut self, pid: u16, section: PsiSection, dts: Mtime) {
        if pid != PAT_PID || !PatView(&section).validate() {
            warn!("invalid PAT section received on PID {}", pid);
            self.reporter.error("invalid_pat_section");
            return;
        }
        if self.pat.push(section) {
            self.handle_pat(dts);
        }
    }

    fn handle_pat(&mut self, dts: Mtime) {
        let next_ok = self
            .pat
            .next()
            .sections()
            .into_iter()
            .all(|s| PatView(s).validate());
        if !next_ok {
            warn!("invalid PAT received");
            self.reporter.error("invalid_pat");
            self.pat.discard_next();
            self.send_pat(dts);
            return;
        }

        let old = match self.pat.promote() {
            Promotion::Unchanged => {
                self.send_pat(dts);
                return;
            }
            Promotion::Switched(old) => old,
        };

        let tsid_changed = match &old {
            None => true,
            Some(old) => old.tableidext() != self.pat.current().unwrap().tableidext(),
        };
        if tsid_changed {
            self.update_tsid();
        }

        let current = self.pat.current().unwrap().to_vec();
        for section in &current {
            for (sid, pid) in PatView(section).programs() {
                if sid == 0 {
                    if pid != NIT_PID {
                        warn!("NIT is carried on PID {} which isn't DVB compliant", pid);
                    }
                    continue;
                }

                let old_pid = old.as_ref().and_then(|set| {
                    set.sections().into_iter().find_map(|s| {
                        PatView(s)
                            .programs()
                            .find(|&(program, _)| program == sid)
                            .map(|(_, p)| p)
                    })
                });

                if old_pid.is_none() || old_pid != Some(pid) || tsid_changed {
                    if let Some(old_pid) = old_pid {
                        self.delete_program(sid, old_pid);
                    }
                    self.select_pmt(sid, pid);

                    match self.services.iter_mut().find(|s| s.sid == 0) {
                        Some(slot) => {
                            slot.sid = sid;
                            slot.pmt_pid = pid;
                        }
                        None => self.services.push(Service::new(sid, pid)),
                    }

                    self.update_pat_outputs(sid);
                }
            }
        }

        if let Some(old) = old {
            for section in old.sections() {
                for (sid, pid) in PatView(section).programs() {
                    if sid == 0 {
                        continue;
                    }
                    let still_there = current
                        .iter()
                        .any(|s| PatView(s).programs().any(|(program, _)| program == sid));
                    if !still_there {
                        self.delete_program(sid, pid);
                        self.update_pat_outputs(sid);
                    }
                }
            }
        }

        self.send_pat(dts);
    }

    fn update_tsid(&mut self) {
        let Some(tsid) = self.pat.current().and_then(|c| c.tableidext()) else {
            return;
        };
        if self.settings.random_tsid || self.settings.unique_tsid {
            return;
        }
        for index in 0..self.outputs.len() {
            if self.outputs[index].valid && self.outputs[index].config.tsid.is_none() {
                self.outputs[index].tsid = tsid;
                rebuild::new_nit(&mut self.outputs[index]);
            }
        }
    }

    fn update_pat_outputs(&mut self, sid: u16) {
        for index in 0..self.outputs.len() {
            if self.outputs[index].valid && self.outputs[index].config.sid == sid {
                self.regen_pat(index);
            }
        }
    }

    fn send_pat(&mut self, dts: Mtime) {
        let pat_valid = self.pat.current().is_some();
        for output in self.outputs.iter_mut() {
            if !output.valid || output.config.passthrough {
                continue;
            }
            if output.pat.section.is_none() && pat_valid {
                // Service not present: an empty PAT keeps receivers fed
                // with a consistent version sequence.
                output.pat.section = Some(tables::build_pat(output.tsid, output.pat.version, &[]));
            }
            if let Some(section) = output.pat.section.clone() {
                let mut cc = output.pat.cc;
                output.put_section(&section, PAT_PID, &mut cc, dts);
                output.pat.cc = cc;
            }
        }
    }

    // --- CAT / EMM ---

    fn handle_cat_section(&mut self, pid: u16, section: PsiSection) {
        if pid != CAT_PID || !CatView(&section).validate() {
            warn!("invalid CAT section received on PID {}", pid);
            self.reporter.error("invalid_cat_section");
            return;
        }
        if !self.cat.push(section) {
            return;
        }

        let old = match self.cat.promote() {
            Promotion::Unchanged => return,
            Promotion::Switched(old) => old,
        };

        let current = self.cat.current().unwrap().to_vec();
        let mut current_emm: Vec<u16> = Vec::new();
        for section in &current {
            for desc in CatView(section).descriptors() {
                if let Some((_, emm_pid)) = desc.ca_pid() {
                    current_emm.push(emm_pid);
                    self.set_pid_emm(emm_pid);
                }
            }
        }

        if let Some(old) = old {
            for section in old.sections() {
                for desc in CatView(section).descriptors() {
                    if let Some((_, emm_pid)) = desc.ca_pid() {
                        if !current_emm.contains(&emm_pid) {
                            self.unset_pid(emm_pid);
                            self.pids[emm_pid as usize].emm = false;
                        }
                    }
                }
            }
        }
    }

    // --- PMT ---

    fn mark_pmt_pids(&mut self, pmt: &PsiSection, map: &mut PidMap, set_pes: bool) {
        let view = PmtView(pmt);

        if self.settings.enable_ecm {
            for desc in view.descriptors() {
                if let Some((_, ecm_pid)) = desc.ca_pid() {
                    map.set(ecm_pid as usize, true);
                }
            }
        }

        let pcr_pid = view.pcr_pid();
        if pcr_pid != PADDING_PID {
            map.set(pcr_pid as usize, true);
        }

        for es in view.es() {
            if es_would_be_selected(&es, self.settings.any_type) {
                map.set(es.pid as usize, true);
            }
            if set_pes {
                self.pids[es.pid as usize].pes = es_carries_pes(&es);
            }
            if self.settings.enable_ecm {
                for desc in es.descriptors() {
                    if let Some((_, ecm_pid)) = desc.ca_pid() {
                        map.set(ecm_pid as usize, true);
                    }
                }
            }
        }
    }

    fn handle_pmt(&mut self, pid: u16, section: PsiSection, dts: Mtime) {
        let sid = section.tableidext();
        let Some(service_index) = self.find_service(sid) else {
            // Unwanted program on a shared PMT PID.
            return;
        };

        if self.services[service_index].pmt_pid != pid {
            warn!("invalid PMT section received on PID {}", pid);
            self.reporter.ghost_pmt(sid, pid);
            return;
        }

        let identical = self.services[service_index]
            .current_pmt
            .as_ref()
            .map(|current| current == &section)
            .unwrap_or(false);
        if identical {
            self.send_pmt(sid, dts);
            return;
        }

        if !PmtView(&section).validate() {
            warn!("invalid PMT section received on PID {}", pid);
            self.reporter.error_pid("invalid_pmt_section", pid);
            self.send_pmt(sid, dts);
            return;
        }

        let needs = pmt_needs_descrambling(&section);
        let needed = self.services[service_index]
            .current_pmt
            .as_ref()
            .map(|pmt| pmt_needs_descrambling(pmt))
            .unwrap_or(false);
        let selected = self.sid_is_selected(sid);

        if self.ca.is_some() && selected && !needs && needed {
            let old = self.services[service_index].current_pmt.clone().unwrap();
            if let Some(ca) = self.ca.as_mut() {
                ca.delete_pmt(&old);
            }
        }

        let mut old_pids: PidMap = BitArray::ZERO;
        let mut new_pids: PidMap = BitArray::ZERO;
        if let Some(old_pmt) = self.services[service_index].current_pmt.clone() {
            self.mark_pmt_pids(&old_pmt, &mut old_pids, false);
        }
        self.mark_pmt_pids(&section, &mut new_pids, true);

        let pcr_pid = PmtView(&section).pcr_pid();
        for output in self.outputs.iter_mut() {
            if output.valid && output.config.sid == sid {
                output.pcr_pid = 0;
            }
        }

        for pid in 0..MAX_PIDS {
            match (old_pids[pid], new_pids[pid]) {
                (true, false) => self.unselect_pid(sid, pid as u16),
                (false, true) => self.select_pid(sid, pid as u16, pid as u16 == pcr_pid),
                _ => {}
            }
        }

        self.services[service_index].current_pmt = Some(section.clone());

        if self.ca.is_some() && selected {
            if let Some(ca) = self.ca.as_mut() {
                if needs && !needed {
                    ca.add_pmt(&section);
                } else if needs && needed {
                    ca.update_pmt(&section);
                }
            }
        }

        for index in 0..self.outputs.len() {
            if self.outputs[index].valid && self.outputs[index].config.sid == sid {
                self.regen_pmt(index, sid);
            }
        }

        self.send_pmt(sid, dts);
    }

    fn send_pmt(&mut self, sid: u16, dts: Mtime) {
        let Some(service_index) = self.find_service(sid) else {
            return;
        };
        let original_pid = self.services[service_index].pmt_pid;

        for index in 0..self.outputs.len() {
            let output = &self.outputs[index];
            if !output.valid || output.config.sid != sid || output.pmt.section.is_none() {
                continue;
            }
            let mut pmt_pid = original_pid;
            if let Some(map) = self.settings.remap {
                if map[MapSlot::Pmt as usize] != 0 && map[MapSlot::Pmt as usize] != UNUSED_PID {
                    pmt_pid = map[MapSlot::Pmt as usize];
                }
            } else if output.config.do_remap
                && output.config.map_pids[MapSlot::Pmt as usize] != 0
                && output.config.map_pids[MapSlot::Pmt as usize] != UNUSED_PID
            {
                pmt_pid = output.config.map_pids[MapSlot::Pmt as usize];
            }

            let output = &mut self.outputs[index];
            let section = output.pmt.section.clone().unwrap();
            let mut cc = output.pmt.cc;
            output.put_section(&section, pmt_pid, &mut cc, dts);
            output.pmt.cc = cc;
        }
    }

    // --- NIT ---

    fn handle_nit_section(&mut self, pid: u16, section: PsiSection, dts: Mtime) {
        if pid != NIT_PID || !NitView(&section).validate() {
            warn!("invalid NIT section received on PID {}", pid);
            self.reporter.error_pid("invalid_nit_section", pid);
            return;
        }
        if self.nit.push(section) {
            match self.nit.promote() {
                Promotion::Unchanged => {}
                Promotion::Switched(_) => debug!("new NIT received"),
            }
        }

        // DVB mandates a minimum bitrate on PID 0x10, so the rebuilt NIT
        // goes out on every incoming NIT section.
        self.send_nit(dts);
    }

    fn send_nit(&mut self, dts: Mtime) {
        for output in self.outputs.iter_mut() {
            if output.valid
                && !output.config.passthrough
                && output.config.dvb
                && output.nit.section.is_some()
            {
                let section = output.nit.section.clone().unwrap();
                let mut cc = output.nit.cc;
                output.put_section(&section, NIT_PID, &mut cc, dts);
                output.nit.cc = cc;
            }
        }
    }

    // --- SDT ---

    fn handle_sdt_section(&mut self, pid: u16, section: PsiSection, dts: Mtime) {
        if pid != SDT_PID || !SdtView(&section).validate() {
            warn!("invalid SDT section received on PID {}", pid);
            self.reporter.error_pid("invalid_sdt_section", pid);
            return;
        }
        if !self.sdt.push(section) {
            return;
        }

        let old = match self.sdt.promote() {
            Promotion::Unchanged => {
                self.send_sdt(dts);
                return;
            }
            Promotion::Switched(old) => old,
        };

        let current = self.sdt.current().unwrap().to_vec();
        let mut touched: Vec<u16> = Vec::new();
        for section in &current {
            for service in SdtView(section).services() {
                touched.push(service.sid);
            }
        }
        if let Some(old) = old {
            for section in old.sections() {
                for service in SdtView(section).services() {
                    if !touched.contains(&service.sid) {
                        touched.push(service.sid);
                    }
                }
            }
        }
        for sid in touched {
            for index in 0..self.outputs.len() {
                if self.outputs[index].valid && self.outputs[index].config.sid == sid {
                    self.regen_sdt(index);
                }
            }
        }

        self.send_sdt(dts);
    }

    fn send_sdt(&mut self, dts: Mtime) {
        for output in self.outputs.iter_mut() {
            if output.valid
                && !output.config.passthrough
                && output.config.dvb
                && output.sdt.section.is_some()
            {
                let section = output.sdt.section.clone().unwrap();
                let mut cc = output.sdt.cc;
                output.put_section(&section, SDT_PID, &mut cc, dts);
                output.sdt.cc = cc;
            }
        }
    }

    // --- EIT ---

    fn handle_eit(&mut self, pid: u16, section: PsiSection, dts: Mtime) {
        let sid = EitView(&section).sid();
        let Some(service_index) = self.find_service(sid) else {
            return;
        };

        if pid != EIT_PID || !EitView(&section).validate() {
            warn!("invalid EIT section received on PID {}", pid);
            self.reporter.error_pid("invalid_eit_section", pid);
            return;
        }

        let table_index = (section.table_id() - EIT_TABLE_ID_PF_ACTUAL) as usize;
        if table_index < MAX_EIT_TABLES {
            let number = section.section_number() as usize;
            self.services[service_index].eit[table_index][number] = Some(section.clone());
        }

        self.send_eit(sid, &section, dts);
    }

    fn send_eit(&mut self, sid: u16, section: &PsiSection, dts: Mtime) {
        let schedule = section.table_id() != EIT_TABLE_ID_PF_ACTUAL;
        for output in self.outputs.iter_mut() {
            if !output.valid
                || output.config.passthrough
                || !output.config.dvb
                || (schedule && !output.config.epg)
                || output.config.sid != sid
            {
                continue;
            }

            let mut rewritten = section.clone();
            eit::set_tsid(&mut rewritten, output.tsid);
            eit::set_sid(&mut rewritten, output.config.effective_sid());
            if output.config.onid != 0 {
                eit::set_onid(&mut rewritten, output.config.onid);
            }
            rewritten.set_crc();
            output.put_eit_section(&rewritten, EIT_PID, dts);
        }
    }

    // --- TDT / EMM broadcast ---

    fn send_tdt(&mut self, block: &TsBlock) {
        for output in self.outputs.iter_mut() {
            if output.valid
                && !output.config.passthrough
                && output.config.dvb
                && output.sdt.section.is_some()
            {
                output.put(block);
            }
        }
    }

    fn send_emm(&mut self, block: &TsBlock) {
        for output in self.outputs.iter_mut() {
            if output.valid && !output.config.passthrough {
                output.put(block);
            }
        }
    }

    // -----------------------------------------------------------------
    // Program lifecycle
    // -----------------------------------------------------------------

    fn delete_program(&mut self, sid: u16, pmt_pid: u16) {
        self.unselect_pmt(sid, pmt_pid);

        let Some(service_index) = self.find_service(sid) else {
            return;
        };

        if let Some(pmt) = self.services[service_index].current_pmt.clone() {
            if self.ca.is_some() && self.sid_is_selected(sid) && pmt_needs_descrambling(&pmt) {
                if let Some(ca) = self.ca.as_mut() {
                    ca.delete_pmt(&pmt);
                }
            }

            let view = PmtView(&pmt);
            let pcr_pid = view.pcr_pid();
            if pcr_pid != PADDING_PID && pcr_pid != self.services[service_index].pmt_pid {
                self.unselect_pid(sid, pcr_pid);
            }

            if self.settings.enable_ecm {
                for desc in view.descriptors() {
                    if let Some((_, ecm_pid)) = desc.ca_pid() {
                        self.unselect_pid(sid, ecm_pid);
                    }
                }
            }

            for es in view.es() {
                if es_would_be_selected(&es, self.settings.any_type) {
                    self.unselect_pid(sid, es.pid);
                }
                if self.settings.enable_ecm {
                    for desc in es.descriptors() {
                        if let Some((_, ecm_pid)) = desc.ca_pid() {
                            self.unselect_pid(sid, ecm_pid);
                        }
                    }
                }
            }
        }

        self.services[service_index].clear();
    }

    /// Replays `add_pmt` for every descrambling selected service, called
    /// after a CA module (re)initialization.
    pub fn resend_ca_pmts(&mut self) {
        let pmts: Vec<PsiSection> = self
            .services
            .iter()
            .filter(|s| s.sid != 0 && self.sid_is_selected(s.sid))
            .filter_map(|s| s.current_pmt.clone())
            .filter(pmt_needs_descrambling)
            .collect();
        if let Some(ca) = self.ca.as_mut() {
            for pmt in &pmts {
                ca.add_pmt(pmt);
            }
        }
    }

    // -----------------------------------------------------------------
    // Introspection (control socket, diagnostics)
    // -----------------------------------------------------------------

    /// Current PAT as packed sections.
    pub fn packed_pat(&self) -> Option<Vec<u8>> {
        self.pat.current().map(|set| set.pack())
    }

    /// Current CAT as packed sections.
    pub fn packed_cat(&self) -> Option<Vec<u8>> {
        self.cat.current().map(|set| set.pack())
    }

    /// Current NIT as packed sections.
    pub fn packed_nit(&self) -> Option<Vec<u8>> {
        self.nit.current().map(|set| set.pack())
    }

    /// Current SDT as packed sections.
    pub fn packed_sdt(&self) -> Option<Vec<u8>> {
        self.sdt.current().map(|set| set.pack())
    }

    /// Current PMT of `sid` as a packed section.
    pub fn packed_pmt(&self, sid: u16) -> Option<Vec<u8>> {
        self.find_service(sid)
            .and_then(|i| self.services[i].current_pmt.as_ref())
            .map(|pmt| pack_sections(std::iter::once(pmt)))
    }

    /// Gathered EIT sections of `sid` over a table-id range, packed.
    fn packed_eit(&self, sid: u16, first_table: u8, last_table: u8) -> Option<Vec<u8>> {
        let service = &self.services[self.find_service(sid)?];
        let mut flat = Vec::new();
        for table_id in first_table..=last_table {
            let index = (table_id - EIT_TABLE_ID_PF_ACTUAL) as usize;
            if index >= MAX_EIT_TABLES {
                continue;
            }
            for section in service.eit[index].iter().flatten() {
                flat.extend_from_slice(&section.as_bytes()[..section.total_len()]);
            }
        }
        Some(flat)
    }

    /// EIT present/following sections of `sid`, packed.
    pub fn packed_eit_pf(&self, sid: u16) -> Option<Vec<u8>> {
        self.packed_eit(sid, EIT_TABLE_ID_PF_ACTUAL, EIT_TABLE_ID_PF_ACTUAL)
    }

    /// EIT schedule sections of `sid`, packed.
    pub fn packed_eit_schedule(&self, sid: u16) -> Option<Vec<u8>> {
        self.packed_eit(
            sid,
            crate::ts::EIT_TABLE_ID_SCHED_ACTUAL_FIRST,
            crate::ts::EIT_TABLE_ID_SCHED_ACTUAL_LAST,
        )
    }

    /// Filter/PSI refcounts of one PID, exposed for invariant checks.
    pub fn pid_refcounts(&self, pid: u16) -> (u32, u32, usize) {
        let state = &self.pids[pid as usize];
        (state.refcount, state.psi_refcount, state.subscriber_count())
    }

    /// Human description of what a PID carries, with the owning SID.
    fn pid_description(&self, pid: u16) -> (&'static str, u16) {
        match pid {
            0x00 => return ("PAT", 0),
            0x01 => return ("CAT", 0),
            0x11 => return ("SDT", 0),
            0x12 => return ("EPG", 0),
            0x14 => return ("TDT/TOT", 0),
            _ => {}
        }

        for service in &self.services {
            if service.sid == 0 {
                continue;
            }
            if service.pmt_pid == pid {
                return ("PMT", service.sid);
            }
            if let Some(pmt) = &service.current_pmt {
                let view = PmtView(pmt);
                for desc in view.descriptors() {
                    if desc.ca_pid().map(|(_, p)| p) == Some(pid) {
                        return ("ECM", service.sid);
                    }
                }
                for es in view.es() {
                    if es.pid == pid {
                        return (h222_stream_type(es.stream_type), service.sid);
                    }
                }
                if view.pcr_pid() == pid {
                    return ("PCR", service.sid);
                }
            }
        }

        if pid == NIT_PID {
            return ("NIT", 0);
        }
        ("...", 0)
    }
}

/// ISO/IEC 13818-1 table 2-29 stream type names used in diagnostics.
fn h222_stream_type(stream_type: u8) -> &'static str {
    match stream_type {
        0x00 => "Reserved stream",
        0x01 => "11172-2 video (MPEG-1)",
        0x02 => "H.262/13818-2 video (MPEG-2) or 11172-2 constrained video",
        0x03 => "11172-3 audio (MPEG-1)",
        0x04 => "13818-3 audio (MPEG-2)",
        0x05 => "H.222.0/13818-1 private sections",
        0x06 => "H.222.0/13818-1 PES private data",
        0x07 => "13522 MHEG",
        0x08 => "H.222.0/13818-1 Annex A - DSM CC",
        0x09 => "H.222.1",
        0x0a => "13818-6 type A",
        0x0b => "13818-6 type B",
        0x0c => "13818-6 type C",
        0x0d => "13818-6 type D",
        0x0e => "H.222.0/13818-1 auxiliary",
        0x0f => "13818-7 Audio with ADTS transport syntax",
        0x10 => "14496-2 Visual (MPEG-4 part 2 video)",
        0x11 => "14496-3 Audio with LATM transport syntax",
        0x1b => "H.264/14496-10 video (MPEG-4/AVC)",
        0x24 => "H.265/23008-2 video (HEVC)",
        0x42 => "AVS Video",
        0x7f => "IPMP stream",
        _ => "Unknown stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::test_support::{CaCall, RecordingCa};
    use crate::config::{OutputDefaults, DEFAULT_MAX_RETENTION};
    use crate::events::PrintMode;
    use crate::input::NoFilters;
    use crate::output::test_support::RecordingSink;
    use crate::ts::psi::{split_end, split_section};
    use crate::ts::tables::{build_pat, DescriptorLoop, PmtBuilder, SdtBuilder};
    use bytes::Bytes;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Bench {
        demuxer: Demuxer,
        events: SharedWriter,
        ccs: std::collections::HashMap<u16, u8>,
    }

    impl Bench {
        fn new(settings: Settings) -> Self {
            Self::with_ca(settings, None)
        }

        fn with_ca(settings: Settings, ca: Option<Box<dyn CaSession>>) -> Self {
            let events = SharedWriter::default();
            let reporter = Reporter::new(PrintMode::Text, Box::new(events.clone()));
            Self {
                demuxer: Demuxer::new(settings, reporter, Box::new(NoFilters), ca),
                events,
                ccs: std::collections::HashMap::new(),
            }
        }

        fn events(&self) -> String {
            String::from_utf8(self.events.0.lock().unwrap().clone()).unwrap()
        }

        fn add_output(&mut self, config: &OutputConfig) -> (usize, RecordingSink) {
            let mut initial = config.clone();
            initial.sid = 0;
            initial.pids.clear();
            initial.passthrough = false;
            initial.tsid = None;
            let sink = RecordingSink::default();
            let output =
                Output::with_sink(initial, self.demuxer.pool.clone(), Box::new(sink.clone()));
            self.demuxer.outputs.push(output);
            let index = self.demuxer.outputs.len() - 1;
            self.demuxer.change_output(index, config);
            (index, sink)
        }

        /// Feeds one section on `pid`, split over as many packets as needed.
        fn feed_section(&mut self, pid: u16, section: &PsiSection) {
            let bytes = &section.as_bytes()[..section.total_len()];
            let mut section_offset = 0usize;
            while section_offset < bytes.len() {
                let mut ts = [0u8; TS_SIZE];
                let mut ts_offset = 0usize;
                split_section(&mut ts, &mut ts_offset, bytes, &mut section_offset);
                split_end(&mut ts, &mut ts_offset);
                crate::ts::packet::set_pid(&mut ts, pid);
                let cc = self.ccs.entry(pid).or_insert(0);
                crate::ts::packet::set_cc(&mut ts, *cc);
                *cc = (*cc + 1) & 0x0f;
                let dts = self.demuxer.wallclock;
                self.demuxer.handle(TsBlock::new(Bytes::copy_from_slice(&ts), dts));
            }
        }

        /// Feeds one ES packet on `pid`.
        fn feed_es(&mut self, pid: u16, scrambled: bool, dts: Mtime) {
            let mut ts = [0u8; TS_SIZE];
            ts[0] = 0x47;
            ts[1] = 0x40 | ((pid >> 8) & 0x1f) as u8;
            ts[2] = (pid & 0xff) as u8;
            let cc = self.ccs.entry(pid).or_insert(0);
            ts[3] = 0x10 | *cc;
            *cc = (*cc + 1) & 0x0f;
            if scrambled {
                ts[3] |= 0x80;
            }
            // PES start code so the payload parses as PES.
            ts[4] = 0x00;
            ts[5] = 0x00;
            ts[6] = 0x01;
            ts[7] = 0xe0;
            self.demuxer.handle(TsBlock::new(Bytes::copy_from_slice(&ts), dts));
        }
    }

    fn output_config(sid: u16, pids: &[u16]) -> OutputConfig {
        let defaults = OutputDefaults::default();
        let mut config = OutputConfig::new("127.0.0.1:5004".parse().unwrap(), &defaults);
        config.sid = sid;
        config.pids = pids.to_vec();
        config
    }

    fn simple_pmt(sid: u16, version: u8) -> PsiSection {
        let mut builder = PmtBuilder::new(sid, version);
        builder
            .pcr_pid(102)
            .add_es(0x02, 100, DescriptorLoop::new())
            .add_es(0x04, 101, DescriptorLoop::new());
        builder.build()
    }

    fn scrambled_pmt(sid: u16, version: u8) -> PsiSection {
        let mut ca = DescriptorLoop::new();
        ca.push(0x09, &[0x06, 0x04, 0xe1, 0x90]);
        let mut builder = PmtBuilder::new(sid, version);
        builder
            .pcr_pid(100)
            .add_es(0x02, 100, ca);
        builder.build()
    }

    #[test]
    fn test_single_service_selection() {
        let mut bench = Bench::new(Settings::default());
        let mut config = output_config(1, &[100, 101]);
        config.dvb = true;
        let (index, _) = bench.add_output(&config);

        bench.feed_section(PAT_PID, &build_pat(0x42, 0, &[(1, 0x20)]));
        bench.feed_section(0x20, &simple_pmt(1, 0));
        let mut sdt = SdtBuilder::new(0x42, 0, 0xff01, 1);
        sdt.eit_flags(false, true).running(4);
        bench.feed_section(SDT_PID, &sdt.build());

        let output = &bench.demuxer.outputs[index];
        // Inherited TSID.
        assert_eq!(output.tsid, 0x42);

        let pat = output.pat.section.as_ref().expect("rebuilt PAT");
        let programs: Vec<_> = PatView(pat).programs().collect();
        assert_eq!(programs, vec![(0, NIT_PID), (1, 0x20)]);

        let pmt = output.pmt.section.as_ref().expect("rebuilt PMT");
        let es: Vec<_> = PmtView(pmt).es().map(|e| e.pid).collect();
        assert_eq!(es, vec![100, 101]);
        assert_eq!(PmtView(pmt).pcr_pid(), 102);

        // PCR PID auto-added as a partial subscription.
        assert_eq!(output.pcr_pid, 102);
        let (_, _, subs) = bench.demuxer.pid_refcounts(102);
        assert_eq!(subs, 1);
        let (_, _, subs) = bench.demuxer.pid_refcounts(100);
        assert_eq!(subs, 1);

        let sdt = output.sdt.section.as_ref().expect("rebuilt SDT");
        let service = SdtView(sdt).services().next().unwrap();
        assert_eq!(service.sid, 1);
        assert!(service.eit_present);
    }

    #[test]
    fn test_service_remap() {
        let mut bench = Bench::new(Settings::default());
        let mut config = output_config(10, &[]);
        config.new_sid = 20;
        config.do_remap = true;
        config.map_pids = [500, 600, 700, 0];
        let (index, _) = bench.add_output(&config);

        bench.feed_section(PAT_PID, &build_pat(0x42, 0, &[(10, 200)]));
        let mut builder = PmtBuilder::new(10, 0);
        builder
            .pcr_pid(400)
            .add_es(0x04, 300, DescriptorLoop::new())
            .add_es(0x02, 400, DescriptorLoop::new());
        bench.feed_section(200, &builder.build());

        let output = &bench.demuxer.outputs[index];
        let pat = output.pat.section.as_ref().expect("rebuilt PAT");
        assert_eq!(PatView(pat).programs().next(), Some((20, 500)));

        let pmt = output.pmt.section.as_ref().expect("rebuilt PMT");
        let es: Vec<_> = PmtView(pmt).es().map(|e| (e.stream_type, e.pid)).collect();
        assert_eq!(es, vec![(0x04, 600), (0x02, 700)]);
        // PCR rode the video PID and follows its remap.
        assert_eq!(PmtView(pmt).pcr_pid(), 700);
    }

    #[test]
    fn test_pmt_replay_keeps_version() {
        let mut bench = Bench::new(Settings::default());
        let (index, _) = bench.add_output(&output_config(1, &[]));

        bench.feed_section(PAT_PID, &build_pat(0x42, 0, &[(1, 0x20)]));
        bench.feed_section(0x20, &simple_pmt(1, 0));
        let version = bench.demuxer.outputs[index]
            .pmt
            .section
            .as_ref()
            .unwrap()
            .version();

        for _ in 0..3 {
            bench.feed_section(0x20, &simple_pmt(1, 0));
        }
        let output = &bench.demuxer.outputs[index];
        assert_eq!(output.pmt.section.as_ref().unwrap().version(), version);
        // Replaying the PAT does not bump either.
        let pat_version = output.pat.section.as_ref().unwrap().version();
        bench.feed_section(PAT_PID, &build_pat(0x42, 0, &[(1, 0x20)]));
        let output = &bench.demuxer.outputs[index];
        assert_eq!(output.pat.section.as_ref().unwrap().version(), pat_version);
    }

    #[test]
    fn test_pat_program_removal() {
        let mut bench = Bench::new(Settings::default());
        let (index, _) = bench.add_output(&output_config(1, &[]));

        bench.feed_section(PAT_PID, &build_pat(0x42, 0, &[(1, 0x20), (2, 0x21)]));
        bench.feed_section(0x20, &simple_pmt(1, 0));
        let (_, psi_refs, _) = bench.demuxer.pid_refcounts(0x20);
        assert_eq!(psi_refs, 1);
        assert!(bench.demuxer.outputs[index].pat.section.is_some());
        let (_, _, subs) = bench.demuxer.pid_refcounts(100);
        assert_eq!(subs, 1);

        // Program 1 disappears.
        bench.feed_section(PAT_PID, &build_pat(0x42, 1, &[(2, 0x21)]));
        let (_, psi_refs, _) = bench.demuxer.pid_refcounts(0x20);
        assert_eq!(psi_refs, 0);
        let (_, _, subs) = bench.demuxer.pid_refcounts(100);
        assert_eq!(subs, 0);
        assert!(bench.demuxer.outputs[index].pat.section.is_none());
        assert!(bench.demuxer.packed_pmt(1).is_none());
    }

    #[test]
    fn test_ghost_pmt_rejected() {
        let mut bench = Bench::new(Settings::default());
        let (_, _) = bench.add_output(&output_config(1, &[]));

        bench.feed_section(PAT_PID, &build_pat(0x42, 0, &[(1, 0x20), (2, 0x21)]));
        // A PMT for program 2 shows up on program 1's PID.
        bench.feed_section(0x20, &simple_pmt(2, 0));
        assert!(bench.events().contains("ghost_pmt"));
        assert!(bench.demuxer.packed_pmt(2).is_none());
    }

    #[test]
    fn test_change_output_is_idempotent() {
        let mut bench = Bench::new(Settings::default());
        let config = output_config(1, &[]);
        let (index, _) = bench.add_output(&config);

        bench.feed_section(PAT_PID, &build_pat(0x42, 0, &[(1, 0x20)]));
        bench.feed_section(0x20, &simple_pmt(1, 0));

        let pat_version = bench.demuxer.outputs[index].pat.version;
        let pmt_version = bench.demuxer.outputs[index].pmt.version;
        let refs_100 = bench.demuxer.pid_refcounts(100);
        let refs_pmt = bench.demuxer.pid_refcounts(0x20);

        bench.demuxer.change_output(index, &config);

        assert_eq!(bench.demuxer.outputs[index].pat.version, pat_version);
        assert_eq!(bench.demuxer.outputs[index].pmt.version, pmt_version);
        assert_eq!(bench.demuxer.pid_refcounts(100), refs_100);
        assert_eq!(bench.demuxer.pid_refcounts(0x20), refs_pmt);
    }

    #[test]
    fn test_scrambling_watchdog() {
        let ca = RecordingCa::default();
        let calls = ca.0.clone();
        let mut bench = Bench::with_ca(Settings::default(), Some(Box::new(ca)));
        let mut config = output_config(1, &[]);
        config.watch = true;
        bench.add_output(&config);

        bench.feed_section(PAT_PID, &build_pat(0x42, 0, &[(1, 0x20)]));
        bench.feed_section(0x20, &scrambled_pmt(1, 0));
        assert_eq!(calls.borrow()[0], CaCall::Add(1));

        // Past the refractory period, scrambled payloads count.
        bench.demuxer.wallclock = 2 * WATCHDOG_REFRACTORY_PERIOD;
        let now = bench.demuxer.wallclock;
        for _ in 0..=MAX_ERRORS {
            bench.feed_es(100, true, now);
        }

        assert!(bench.events().contains("reset cause: scrambling"));
        let calls = calls.borrow();
        assert!(calls.contains(&CaCall::Reset));
        // The PMT is replayed after the reset.
        let reset_at = calls.iter().position(|c| *c == CaCall::Reset).unwrap();
        assert!(calls[reset_at..].contains(&CaCall::Add(1)));
    }

    #[test]
    fn test_eit_forward_and_retention_flush() {
        let mut bench = Bench::new(Settings::default());
        let mut config = output_config(1, &[]);
        config.dvb = true;
        let (index, _) = bench.add_output(&config);

        bench.feed_section(PAT_PID, &build_pat(0x42, 0, &[(1, 0x20)]));
        bench.feed_section(0x20, &simple_pmt(1, 0));
        let queued = bench.demuxer.outputs[index].queued_groups();

        // Minimal EITp/f section for sid 1.
        let mut data = vec![
            0x4e, 0xb0, 0x00, 0x00, 0x01, 0xc1, 0x00, 0x01, 0x00, 0x42, 0xff, 0x01, 0x01, 0x4e,
        ];
        let length = data.len() + 4 - 3;
        data[1] = 0xb0 | ((length >> 8) & 0x0f) as u8;
        data[2] = (length & 0xff) as u8;
        data.extend_from_slice(&[0u8; 4]);
        let mut eit_section = PsiSection::new(data);
        eit_section.set_crc();
        bench.feed_section(EIT_PID, &eit_section);

        // Short section: buffered, not yet queued.
        assert!(bench.demuxer.outputs[index].eit_buffer_dts().is_some());
        assert_eq!(bench.demuxer.outputs[index].queued_groups(), queued);

        // A later packet on a subscribed PID flushes the stale buffer.
        bench.demuxer.wallclock = MAX_EIT_RETENTION + 1;
        bench.feed_es(100, false, MAX_EIT_RETENTION + 1);
        let output = &bench.demuxer.outputs[index];
        assert!(output.eit_buffer_dts().is_none());
        assert!(output.queued_groups() > queued);
    }

    #[test]
    fn test_eit_rewrites_ids() {
        let mut bench = Bench::new(Settings::default());
        let mut config = output_config(1, &[]);
        config.dvb = true;
        config.new_sid = 77;
        config.tsid = Some(0x1000);
        config.onid = 0x2000;
        let (index, _) = bench.add_output(&config);

        bench.feed_section(PAT_PID, &build_pat(0x42, 0, &[(1, 0x20)]));

        let mut data = vec![
            0x4e, 0xb0, 0x00, 0x00, 0x01, 0xc1, 0x00, 0x01, 0x00, 0x42, 0xff, 0x01, 0x01, 0x4e,
        ];
        let length = data.len() + 4 - 3;
        data[1] = 0xb0 | ((length >> 8) & 0x0f) as u8;
        data[2] = (length & 0xff) as u8;
        data.extend_from_slice(&[0u8; 4]);
        let mut eit_section = PsiSection::new(data);
        eit_section.set_crc();
        bench.feed_section(EIT_PID, &eit_section);

        let output = &mut bench.demuxer.outputs[index];
        output.flush_eit(0);
        let group = output.queued_groups();
        assert!(group >= 1);
        // Walk the queued EIT packet and check the rewritten section.
        let block = {
            let front = output.groups.front().unwrap();
            front.blocks.last().unwrap().clone()
        };
        let packet = block.packet();
        assert_eq!(packet.pid(), EIT_PID);
        let offset = packet.next_section_offset().unwrap();
        let section = PsiSection::new(block.data[offset..].to_vec());
        assert_eq!(EitView(&section).sid(), 77);
        assert_eq!(EitView(&section).tsid(), 0x1000);
        assert_eq!(EitView(&section).onid(), 0x2000);
        assert!(section.check_crc());
    }

    #[test]
    fn test_emm_tracking_and_broadcast() {
        let settings = Settings {
            enable_emm: true,
            ..Settings::default()
        };
        let mut bench = Bench::new(settings);
        let (index, _) = bench.add_output(&output_config(1, &[]));

        // CAT with one EMM PID 0x190.
        let mut data = vec![0x01, 0xb0, 0x00, 0xff, 0xff, 0xc1, 0x00, 0x00];
        data.extend_from_slice(&[0x09, 0x04, 0x06, 0x04, 0xe1, 0x90]);
        let length = data.len() + 4 - 3;
        data[1] = 0xb0 | ((length >> 8) & 0x0f) as u8;
        data[2] = (length & 0xff) as u8;
        data.extend_from_slice(&[0u8; 4]);
        let mut cat = PsiSection::new(data);
        cat.set_crc();
        bench.feed_section(CAT_PID, &cat);

        let (refs, _, _) = bench.demuxer.pid_refcounts(0x190);
        assert_eq!(refs, 1);

        // EMM packets fan out to non-passthrough outputs.
        bench.feed_es(0x190, false, 0);
        let blocks: usize = bench.demuxer.outputs[index]
            .groups
            .iter()
            .map(|g| g.blocks.len())
            .sum();
        assert_eq!(blocks, 1);
    }

    #[test]
    fn test_passthrough_receives_everything() {
        let mut bench = Bench::new(Settings::default());
        let defaults = OutputDefaults::default();
        let mut config = OutputConfig::new("127.0.0.1:5006".parse().unwrap(), &defaults);
        config.passthrough = true;
        let (index, _) = bench.add_output(&config);

        bench.feed_es(0x333, false, 0);
        bench.feed_es(0x444, false, 0);
        let output = &bench.demuxer.outputs[index];
        let blocks: usize = output.groups.iter().map(|g| g.blocks.len()).sum();
        assert_eq!(blocks, 2);
    }

    #[test]
    fn test_invalid_packets_counted_not_routed() {
        let mut bench = Bench::new(Settings::default());
        let defaults = OutputDefaults::default();
        let mut config = OutputConfig::new("127.0.0.1:5006".parse().unwrap(), &defaults);
        config.passthrough = true;
        let (index, _) = bench.add_output(&config);

        let garbage = [0u8; TS_SIZE];
        bench.demuxer.handle(TsBlock::new(Bytes::copy_from_slice(&garbage), 0));
        assert_eq!(bench.demuxer.outputs[index].queued_groups(), 0);

        bench.demuxer.print_status(1_000_000);
        assert!(bench.events().contains("invalids: 1"));
    }

    #[test]
    fn test_dts_interpolation() {
        let mut bench = Bench::new(Settings::default());
        let defaults = OutputDefaults::default();
        let mut config = OutputConfig::new("127.0.0.1:5006".parse().unwrap(), &defaults);
        config.passthrough = true;
        config.retention = DEFAULT_MAX_RETENTION;
        let (index, _) = bench.add_output(&config);

        let mut packet = [0xffu8; TS_SIZE];
        packet[0] = 0x47;
        packet[1] = 0x03;
        packet[2] = 0x33;
        packet[3] = 0x10;
        let blocks: Vec<TsBlock> = (0..4)
            .map(|i| {
                let mut p = packet;
                p[3] = 0x10 | i;
                TsBlock::new(Bytes::copy_from_slice(&p), 0)
            })
            .collect();

        bench.demuxer.run_burst(blocks.clone(), 1_000_000);
        bench.demuxer.run_burst(blocks, 2_000_000);

        // The second burst is spread over the preceding second.
        let output = &bench.demuxer.outputs[index];
        let dts: Vec<Mtime> = output
            .groups
            .iter()
            .flat_map(|g| g.blocks.iter().map(|b| b.dts))
            .collect();
        assert_eq!(dts[4], 1_250_000);
        assert_eq!(dts[7], 2_000_000);
        assert!(dts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_presence_events() {
        let settings = Settings {
            es_timeout: 1_000_000,
            ..Settings::default()
        };
        let mut bench = Bench::new(settings);
        bench.demuxer.wallclock = 10;
        bench.feed_es(0x123, false, 10);
        assert!(bench.events().contains("pid: 291 up pes"));

        bench.demuxer.check_presence(2_000_000);
        assert!(bench.events().contains("pid: 291 down"));
    }
}
