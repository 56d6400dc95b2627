//! Typed views and builders for the MPEG/DVB tables the demultiplexer
//! tracks and the outputs rebuild: PAT, CAT, PMT, NIT, SDT and EIT.
//!
//! Views borrow a [`PsiSection`] and expose the table's loops without
//! copying; builders assemble fresh sections for the per-output rewriters.
//! The raw section stays the canonical representation throughout.

use super::psi::{PsiSection, PSI_CRC_SIZE, PSI_HEADER_SIZE, PSI_HEADER_SIZE_SYNTAX1};
use super::{
    CA_DESC_TAG, EIT_TABLE_ID_PF_ACTUAL, EIT_TABLE_ID_SCHED_ACTUAL_FIRST,
    EIT_TABLE_ID_SCHED_ACTUAL_LAST, NIT_TABLE_ID_ACTUAL, PADDING_PID, PAT_TABLE_ID, PMT_TABLE_ID,
    SDT_TABLE_ID_ACTUAL,
};

/// One descriptor borrowed from a descriptor loop.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor<'a> {
    /// Descriptor tag
    pub tag: u8,
    /// Descriptor payload (after tag and length bytes)
    pub data: &'a [u8],
}

impl<'a> Descriptor<'a> {
    /// For CA descriptors (tag 0x09): the CA_system_id and ECM/EMM PID.
    /// `None` when the descriptor is not a well-formed CA descriptor.
    pub fn ca_pid(&self) -> Option<(u16, u16)> {
        if self.tag != CA_DESC_TAG || self.data.len() < 4 {
            return None;
        }
        let sysid = ((self.data[0] as u16) << 8) | self.data[1] as u16;
        let pid = (((self.data[2] & 0x1f) as u16) << 8) | self.data[3] as u16;
        Some((sysid, pid))
    }
}

/// Iterator over a raw descriptor loop.
pub struct DescriptorIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DescriptorIter<'a> {
    /// Iterates over `data`, a bare concatenation of descriptors.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Descriptor<'a>;

    fn next(&mut self) -> Option<Descriptor<'a>> {
        if self.pos + 2 > self.data.len() {
            return None;
        }
        let tag = self.data[self.pos];
        let length = self.data[self.pos + 1] as usize;
        let start = self.pos + 2;
        if start + length > self.data.len() {
            self.pos = self.data.len();
            return None;
        }
        self.pos = start + length;
        Some(Descriptor {
            tag,
            data: &self.data[start..start + length],
        })
    }
}

/// Incrementally built descriptor loop.
#[derive(Debug, Default, Clone)]
pub struct DescriptorLoop(Vec<u8>);

impl DescriptorLoop {
    /// Creates an empty loop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one descriptor. Oversized payloads are truncated to the
    /// 255-byte descriptor limit.
    pub fn push(&mut self, tag: u8, data: &[u8]) {
        let len = data.len().min(255);
        self.0.push(tag);
        self.0.push(len as u8);
        self.0.extend_from_slice(&data[..len]);
    }

    /// Copies a borrowed descriptor unchanged.
    pub fn push_desc(&mut self, desc: &Descriptor<'_>) {
        self.push(desc.tag, desc.data);
    }

    /// The raw loop bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Loop length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no descriptor has been pushed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Closes a section built with a placeholder length: fixes up
/// section_length, appends and signs the CRC.
fn finish_section(mut data: Vec<u8>) -> PsiSection {
    let length = data.len() + PSI_CRC_SIZE - PSI_HEADER_SIZE;
    data[1] = (data[1] & 0xf0) | ((length >> 8) & 0x0f) as u8;
    data[2] = (length & 0xff) as u8;
    data.extend_from_slice(&[0u8; PSI_CRC_SIZE]);
    let mut section = PsiSection::new(data);
    section.set_crc();
    section
}

/// Writes the 8-byte syntax-1 header with a zero length placeholder.
fn syntax_header(table_id: u8, idext: u16, version: u8, section: u8, last: u8) -> Vec<u8> {
    vec![
        table_id,
        0xb0,
        0x00,
        (idext >> 8) as u8,
        (idext & 0xff) as u8,
        0xc1 | ((version & 0x1f) << 1),
        section,
        last,
    ]
}

// ---------------------------------------------------------------------------
// PAT
// ---------------------------------------------------------------------------

/// Borrowed view of one PAT section.
pub struct PatView<'a>(pub &'a PsiSection);

impl<'a> PatView<'a> {
    /// Structural check: right table id, syntax section, program loop a
    /// multiple of four bytes.
    pub fn validate(&self) -> bool {
        let s = self.0;
        s.validate()
            && s.table_id() == PAT_TABLE_ID
            && s.has_syntax()
            && (s.total_len() - PSI_HEADER_SIZE_SYNTAX1 - PSI_CRC_SIZE) % 4 == 0
    }

    /// Transport stream id of this PAT.
    pub fn tsid(&self) -> u16 {
        self.0.tableidext()
    }

    /// Iterates `(program_number, pid)` pairs. program_number 0 locates
    /// the NIT.
    pub fn programs(&self) -> impl Iterator<Item = (u16, u16)> + 'a {
        self.0.payload().chunks_exact(4).map(|entry| {
            let program = ((entry[0] as u16) << 8) | entry[1] as u16;
            let pid = (((entry[2] & 0x1f) as u16) << 8) | entry[3] as u16;
            (program, pid)
        })
    }
}

/// Finds `sid` in a complete PAT (all sections); returns its PMT PID.
pub fn pat_find_program(sections: &[PsiSection], sid: u16) -> Option<u16> {
    sections.iter().find_map(|section| {
        PatView(section)
            .programs()
            .find(|&(program, _)| program == sid)
            .map(|(_, pid)| pid)
    })
}

/// Builds a single-section PAT. `programs` is `(program_number, pid)`;
/// an empty slice yields a valid empty PAT.
pub fn build_pat(tsid: u16, version: u8, programs: &[(u16, u16)]) -> PsiSection {
    let mut data = syntax_header(PAT_TABLE_ID, tsid, version, 0, 0);
    for &(program, pid) in programs {
        data.extend_from_slice(&program.to_be_bytes());
        data.push(0xe0 | ((pid >> 8) & 0x1f) as u8);
        data.push((pid & 0xff) as u8);
    }
    finish_section(data)
}

// ---------------------------------------------------------------------------
// CAT
// ---------------------------------------------------------------------------

/// Borrowed view of one CAT section. The payload is one descriptor loop.
pub struct CatView<'a>(pub &'a PsiSection);

impl<'a> CatView<'a> {
    /// Structural check.
    pub fn validate(&self) -> bool {
        self.0.validate() && self.0.table_id() == super::CAT_TABLE_ID && self.0.has_syntax()
    }

    /// Iterates the CA descriptors (EMM PID carriers).
    pub fn descriptors(&self) -> DescriptorIter<'a> {
        DescriptorIter::new(self.0.payload())
    }
}

// ---------------------------------------------------------------------------
// PMT
// ---------------------------------------------------------------------------

/// Borrowed view of one elementary stream entry in a PMT.
#[derive(Clone, Copy)]
pub struct EsView<'a> {
    /// stream_type field
    pub stream_type: u8,
    /// Elementary PID
    pub pid: u16,
    descs: &'a [u8],
}

impl<'a> EsView<'a> {
    /// Iterates the ES-info descriptors.
    pub fn descriptors(&self) -> DescriptorIter<'a> {
        DescriptorIter::new(self.descs)
    }
}

/// Borrowed view of one PMT section.
pub struct PmtView<'a>(pub &'a PsiSection);

impl<'a> PmtView<'a> {
    /// Structural check: table id, single-section table, loops in bounds.
    pub fn validate(&self) -> bool {
        let s = self.0;
        if !(s.validate()
            && s.table_id() == PMT_TABLE_ID
            && s.has_syntax()
            && s.section_number() == 0
            && s.last_section_number() == 0)
        {
            return false;
        }
        let payload = s.payload();
        if payload.len() < 4 {
            return false;
        }
        let desc_len = (((payload[2] & 0x0f) as usize) << 8) | payload[3] as usize;
        let mut pos = 4 + desc_len;
        if pos > payload.len() {
            return false;
        }
        while pos < payload.len() {
            if pos + 5 > payload.len() {
                return false;
            }
            let es_len = (((payload[pos + 3] & 0x0f) as usize) << 8) | payload[pos + 4] as usize;
            pos += 5 + es_len;
        }
        pos == payload.len()
    }

    /// Program (service) number.
    pub fn program(&self) -> u16 {
        self.0.tableidext()
    }

    /// PCR PID; the padding PID means "no PCR".
    pub fn pcr_pid(&self) -> u16 {
        let payload = self.0.payload();
        (((payload[0] & 0x1f) as u16) << 8) | payload[1] as u16
    }

    /// Iterates the program-info descriptors.
    pub fn descriptors(&self) -> DescriptorIter<'a> {
        let payload = self.0.payload();
        let desc_len = (((payload[2] & 0x0f) as usize) << 8) | payload[3] as usize;
        DescriptorIter::new(&payload[4..(4 + desc_len).min(payload.len())])
    }

    /// Iterates the elementary stream entries.
    pub fn es(&self) -> EsIter<'a> {
        let payload = self.0.payload();
        let desc_len = (((payload[2] & 0x0f) as usize) << 8) | payload[3] as usize;
        EsIter {
            data: payload,
            pos: (4 + desc_len).min(payload.len()),
        }
    }
}

/// Iterator over the ES loop of a PMT.
pub struct EsIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for EsIter<'a> {
    type Item = EsView<'a>;

    fn next(&mut self) -> Option<EsView<'a>> {
        if self.pos + 5 > self.data.len() {
            return None;
        }
        let stream_type = self.data[self.pos];
        let pid = (((self.data[self.pos + 1] & 0x1f) as u16) << 8) | self.data[self.pos + 2] as u16;
        let es_len =
            (((self.data[self.pos + 3] & 0x0f) as usize) << 8) | self.data[self.pos + 4] as usize;
        let start = self.pos + 5;
        if start + es_len > self.data.len() {
            self.pos = self.data.len();
            return None;
        }
        self.pos = start + es_len;
        Some(EsView {
            stream_type,
            pid,
            descs: &self.data[start..start + es_len],
        })
    }
}

/// Builder for a rewritten single-program PMT.
pub struct PmtBuilder {
    program: u16,
    version: u8,
    pcr_pid: u16,
    program_descs: DescriptorLoop,
    es: Vec<(u8, u16, DescriptorLoop)>,
}

impl PmtBuilder {
    /// Starts a PMT for `program` with no PCR PID yet.
    pub fn new(program: u16, version: u8) -> Self {
        Self {
            program,
            version,
            pcr_pid: PADDING_PID,
            program_descs: DescriptorLoop::new(),
            es: Vec::new(),
        }
    }

    /// Sets the PCR PID.
    pub fn pcr_pid(&mut self, pid: u16) -> &mut Self {
        self.pcr_pid = pid;
        self
    }

    /// Replaces the program-info descriptor loop.
    pub fn program_descs(&mut self, descs: DescriptorLoop) -> &mut Self {
        self.program_descs = descs;
        self
    }

    /// Appends one elementary stream entry.
    pub fn add_es(&mut self, stream_type: u8, pid: u16, descs: DescriptorLoop) -> &mut Self {
        self.es.push((stream_type, pid, descs));
        self
    }

    /// Assembles and signs the section.
    pub fn build(&self) -> PsiSection {
        let mut data = syntax_header(PMT_TABLE_ID, self.program, self.version, 0, 0);
        data.push(0xe0 | ((self.pcr_pid >> 8) & 0x1f) as u8);
        data.push((self.pcr_pid & 0xff) as u8);
        data.push(0xf0 | ((self.program_descs.len() >> 8) & 0x0f) as u8);
        data.push((self.program_descs.len() & 0xff) as u8);
        data.extend_from_slice(self.program_descs.as_bytes());
        for (stream_type, pid, descs) in &self.es {
            data.push(*stream_type);
            data.push(0xe0 | ((pid >> 8) & 0x1f) as u8);
            data.push((pid & 0xff) as u8);
            data.push(0xf0 | ((descs.len() >> 8) & 0x0f) as u8);
            data.push((descs.len() & 0xff) as u8);
            data.extend_from_slice(descs.as_bytes());
        }
        finish_section(data)
    }
}

// ---------------------------------------------------------------------------
// NIT
// ---------------------------------------------------------------------------

/// Borrowed view of one NIT section.
pub struct NitView<'a>(pub &'a PsiSection);

impl<'a> NitView<'a> {
    /// Structural check.
    pub fn validate(&self) -> bool {
        let s = self.0;
        s.validate() && s.table_id() == NIT_TABLE_ID_ACTUAL && s.has_syntax() && {
            let payload = s.payload();
            payload.len() >= 2 && {
                let desc_len = (((payload[0] & 0x0f) as usize) << 8) | payload[1] as usize;
                2 + desc_len + 2 <= payload.len()
            }
        }
    }

    /// Network id.
    pub fn nid(&self) -> u16 {
        self.0.tableidext()
    }
}

/// Builds a single-section NIT with one transport stream entry.
pub fn build_nit(
    nid: u16,
    version: u8,
    network_name: Option<&[u8]>,
    tsid: u16,
    onid: u16,
) -> PsiSection {
    let mut data = syntax_header(NIT_TABLE_ID_ACTUAL, nid, version, 0, 0);
    let mut descs = DescriptorLoop::new();
    if let Some(name) = network_name {
        descs.push(0x40, name);
    }
    data.push(0xf0 | ((descs.len() >> 8) & 0x0f) as u8);
    data.push((descs.len() & 0xff) as u8);
    data.extend_from_slice(descs.as_bytes());
    // Transport stream loop: one 6-byte entry without descriptors.
    data.push(0xf0);
    data.push(6);
    data.extend_from_slice(&tsid.to_be_bytes());
    data.extend_from_slice(&onid.to_be_bytes());
    data.push(0xf0);
    data.push(0);
    finish_section(data)
}

// ---------------------------------------------------------------------------
// SDT
// ---------------------------------------------------------------------------

/// Borrowed view of one service entry in an SDT.
#[derive(Clone, Copy)]
pub struct SdtServiceView<'a> {
    /// Service id
    pub sid: u16,
    /// EIT_schedule_flag
    pub eit_schedule: bool,
    /// EIT_present_following_flag
    pub eit_present: bool,
    /// 3-bit running_status
    pub running: u8,
    /// free_CA_mode bit
    pub free_ca: bool,
    descs: &'a [u8],
}

impl<'a> SdtServiceView<'a> {
    /// Iterates the service descriptors (tag 0x48 carries the names).
    pub fn descriptors(&self) -> DescriptorIter<'a> {
        DescriptorIter::new(self.descs)
    }
}

/// Borrowed view of one SDT section.
pub struct SdtView<'a>(pub &'a PsiSection);

impl<'a> SdtView<'a> {
    /// Structural check: table id and service loop bounds.
    pub fn validate(&self) -> bool {
        let s = self.0;
        if !(s.validate() && s.table_id() == SDT_TABLE_ID_ACTUAL && s.has_syntax()) {
            return false;
        }
        let payload = s.payload();
        if payload.len() < 3 {
            return false;
        }
        let mut pos = 3;
        while pos < payload.len() {
            if pos + 5 > payload.len() {
                return false;
            }
            let desc_len = (((payload[pos + 3] & 0x0f) as usize) << 8) | payload[pos + 4] as usize;
            pos += 5 + desc_len;
        }
        pos == payload.len()
    }

    /// Transport stream id.
    pub fn tsid(&self) -> u16 {
        self.0.tableidext()
    }

    /// original_network_id.
    pub fn onid(&self) -> u16 {
        let payload = self.0.payload();
        ((payload[0] as u16) << 8) | payload[1] as u16
    }

    /// Iterates the service entries.
    pub fn services(&self) -> SdtServiceIter<'a> {
        SdtServiceIter {
            data: self.0.payload(),
            pos: 3,
        }
    }
}

/// Iterator over SDT service entries.
pub struct SdtServiceIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for SdtServiceIter<'a> {
    type Item = SdtServiceView<'a>;

    fn next(&mut self) -> Option<SdtServiceView<'a>> {
        if self.pos + 5 > self.data.len() {
            return None;
        }
        let d = &self.data[self.pos..];
        let sid = ((d[0] as u16) << 8) | d[1] as u16;
        let eit_schedule = d[2] & 0x02 != 0;
        let eit_present = d[2] & 0x01 != 0;
        let running = (d[3] >> 5) & 0x07;
        let free_ca = d[3] & 0x10 != 0;
        let desc_len = (((d[3] & 0x0f) as usize) << 8) | d[4] as usize;
        let start = self.pos + 5;
        if start + desc_len > self.data.len() {
            self.pos = self.data.len();
            return None;
        }
        self.pos = start + desc_len;
        Some(SdtServiceView {
            sid,
            eit_schedule,
            eit_present,
            running,
            free_ca,
            descs: &self.data[start..start + desc_len],
        })
    }
}

/// Finds `sid` across a complete SDT and returns its service view.
pub fn sdt_find_service<'a>(sections: &'a [PsiSection], sid: u16) -> Option<SdtServiceView<'a>> {
    sections
        .iter()
        .flat_map(|section| SdtView(section).services())
        .find(|service| service.sid == sid)
}

/// Builds a single-service SDT section.
pub struct SdtBuilder {
    tsid: u16,
    version: u8,
    onid: u16,
    sid: u16,
    eit_schedule: bool,
    eit_present: bool,
    running: u8,
    descs: DescriptorLoop,
}

impl SdtBuilder {
    /// Starts an SDT for the given transport and service.
    pub fn new(tsid: u16, version: u8, onid: u16, sid: u16) -> Self {
        Self {
            tsid,
            version,
            onid,
            sid,
            eit_schedule: false,
            eit_present: false,
            running: 0,
            descs: DescriptorLoop::new(),
        }
    }

    /// Sets the EIT presence flags.
    pub fn eit_flags(&mut self, schedule: bool, present: bool) -> &mut Self {
        self.eit_schedule = schedule;
        self.eit_present = present;
        self
    }

    /// Sets the running_status.
    pub fn running(&mut self, running: u8) -> &mut Self {
        self.running = running & 0x07;
        self
    }

    /// Replaces the service descriptor loop.
    pub fn descs(&mut self, descs: DescriptorLoop) -> &mut Self {
        self.descs = descs;
        self
    }

    /// Assembles and signs the section. free_CA is never set.
    pub fn build(&self) -> PsiSection {
        let mut data = syntax_header(SDT_TABLE_ID_ACTUAL, self.tsid, self.version, 0, 0);
        data.extend_from_slice(&self.onid.to_be_bytes());
        data.push(0xff); // reserved_future_use
        data.extend_from_slice(&self.sid.to_be_bytes());
        data.push(
            0xfc | if self.eit_schedule { 0x02 } else { 0 } | if self.eit_present { 0x01 } else { 0 },
        );
        data.push((self.running << 5) | ((self.descs.len() >> 8) & 0x0f) as u8);
        data.push((self.descs.len() & 0xff) as u8);
        data.extend_from_slice(self.descs.as_bytes());
        finish_section(data)
    }
}

/// Builds a DVB service descriptor (tag 0x48) payload.
pub fn service_descriptor(service_type: u8, provider: &[u8], name: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(3 + provider.len() + name.len());
    data.push(service_type);
    data.push(provider.len().min(255) as u8);
    data.extend_from_slice(&provider[..provider.len().min(255)]);
    data.push(name.len().min(255) as u8);
    data.extend_from_slice(&name[..name.len().min(255)]);
    data
}

/// Splits a service descriptor payload into `(type, provider, name)`.
pub fn parse_service_descriptor(data: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    if data.len() < 3 {
        return None;
    }
    let service_type = data[0];
    let provider_len = data[1] as usize;
    if 2 + provider_len + 1 > data.len() {
        return None;
    }
    let provider = &data[2..2 + provider_len];
    let name_len = data[2 + provider_len] as usize;
    let name_start = 3 + provider_len;
    if name_start + name_len > data.len() {
        return None;
    }
    Some((service_type, provider, &data[name_start..name_start + name_len]))
}

// ---------------------------------------------------------------------------
// EIT
// ---------------------------------------------------------------------------

/// True when `table_id` is an actual-TS EIT table the forwarder handles.
pub fn is_eit_table_id(table_id: u8) -> bool {
    table_id == EIT_TABLE_ID_PF_ACTUAL
        || (EIT_TABLE_ID_SCHED_ACTUAL_FIRST..=EIT_TABLE_ID_SCHED_ACTUAL_LAST).contains(&table_id)
}

/// Borrowed view of one EIT section.
pub struct EitView<'a>(pub &'a PsiSection);

impl<'a> EitView<'a> {
    /// Structural check: an EIT table id and room for the EIT header.
    pub fn validate(&self) -> bool {
        let s = self.0;
        s.validate()
            && is_eit_table_id(s.table_id())
            && s.has_syntax()
            && s.total_len() >= PSI_HEADER_SIZE_SYNTAX1 + 6 + PSI_CRC_SIZE
    }

    /// Service id this EIT describes.
    pub fn sid(&self) -> u16 {
        self.0.tableidext()
    }

    /// transport_stream_id field.
    pub fn tsid(&self) -> u16 {
        let payload = self.0.payload();
        ((payload[0] as u16) << 8) | payload[1] as u16
    }

    /// original_network_id field.
    pub fn onid(&self) -> u16 {
        let payload = self.0.payload();
        ((payload[2] as u16) << 8) | payload[3] as u16
    }
}

/// In-place EIT rewrites used when forwarding to an output. The caller
/// re-signs the CRC afterwards.
pub mod eit {
    use super::PsiSection;

    /// Overwrites the service id (table_id_extension).
    pub fn set_sid(section: &mut PsiSection, sid: u16) {
        let data = section.as_bytes_mut();
        data[3] = (sid >> 8) as u8;
        data[4] = (sid & 0xff) as u8;
    }

    /// Overwrites transport_stream_id.
    pub fn set_tsid(section: &mut PsiSection, tsid: u16) {
        let data = section.as_bytes_mut();
        data[8] = (tsid >> 8) as u8;
        data[9] = (tsid & 0xff) as u8;
    }

    /// Overwrites original_network_id.
    pub fn set_onid(section: &mut PsiSection, onid: u16) {
        let data = section.as_bytes_mut();
        data[10] = (onid >> 8) as u8;
        data[11] = (onid & 0xff) as u8;
    }
}
