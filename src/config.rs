//! Process settings and per-output configuration.
//!
//! An output is described by one config-file line:
//!
//! ```text
//! target[/option…] watch-flag sid|* [pid,pid,…]
//! ```
//!
//! `target` is `address[:port][@bind-address[:port]]`; options are
//! slash-separated `key=value` pairs (`udp`, `dvb`, `epg`, `tsid=`, …).
//! `#` starts a comment. Parsing is pure: the demultiplexer applies parsed
//! configs to live outputs with its diff-driven change protocol.

use std::net::{IpAddr, SocketAddr};

use crate::charset::{SiTextCodec, StandardCodec};
use crate::error::{Result, TsCastError};
use crate::ts::{MAX_PIDS, TS_SIZE};
use crate::Mtime;

/// Default output port.
pub const DEFAULT_PORT: u16 = 3001;
/// Default MTU for IPv4 targets.
pub const DEFAULT_IPV4_MTU: usize = 1500;
/// Default MTU for IPv6 targets.
pub const DEFAULT_IPV6_MTU: usize = 1280;
/// RTP header size (no CSRC, no extensions).
pub const RTP_HEADER_SIZE: usize = 12;
/// Default time a packet may wait in an output queue before the group is
/// sealed (µs).
pub const DEFAULT_MAX_RETENTION: Mtime = 40_000;
/// Default extra delay before a sealed group is sent (µs).
pub const DEFAULT_OUTPUT_LATENCY: Mtime = 200_000;
/// Longest an EIT fragment may sit in the packetization buffer (µs).
pub const MAX_EIT_RETENTION: Mtime = 500_000;
/// Window over which watchdog error counters accumulate (µs).
pub const WATCHDOG_WAIT: Mtime = 10_000_000;
/// Minimum spacing between two watchdog-driven CA resets (µs).
pub const WATCHDOG_REFRACTORY_PERIOD: Mtime = 60_000_000;
/// Error count that trips a watchdog.
pub const MAX_ERRORS: u32 = 1000;
/// Default silence on the UDP input before lock is declared lost (µs).
pub const DEFAULT_UDP_LOCK_TIMEOUT: Mtime = 5_000_000;
/// Default frontend lock timeout (µs).
pub const DEFAULT_FRONTEND_TIMEOUT: Mtime = 30_000_000;
/// Exit code when the frontend never locks and a quit timeout is set.
pub const EXIT_STATUS_FRONTEND_TIMEOUT: i32 = 100;

/// Number of remappable stream classes.
pub const N_MAP_PIDS: usize = 4;
/// Sentinel one past the PID space: "no mapping".
pub const UNUSED_PID: u16 = MAX_PIDS as u16;

/// Slot indices in a `pidmap=` option: PMT, audio, video, subtitles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapSlot {
    /// Rewritten PMT PID
    Pmt = 0,
    /// First audio PID
    Audio = 1,
    /// First video PID
    Video = 2,
    /// First subtitle/teletext PID
    Spu = 3,
}

/// Full description of one output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    /// Display name used in logs (the raw target string)
    pub display_name: String,
    /// Destination address
    pub remote: SocketAddr,
    /// Optional local bind address
    pub bind: Option<SocketAddr>,
    /// IPv6 multicast output interface index
    pub if_index_v6: Option<u32>,

    /// Arm the scrambling/invalid-PES watchdog for this output
    pub watch: bool,
    /// Plain UDP payload (no RTP header)
    pub udp: bool,
    /// Insert DVB conformance tables (NIT/SDT, NIT entry in the PAT)
    pub dvb: bool,
    /// Forward EIT schedule tables as well as present/following
    pub epg: bool,

    /// Network id advertised in the rebuilt NIT
    pub network_id: u16,
    /// SI-encoded network name (empty: no network-name descriptor)
    pub network_name: Vec<u8>,
    /// SI-encoded service name override (empty: copy from input SDT)
    pub service_name: Vec<u8>,
    /// SI-encoded provider name override (empty: copy from input SDT)
    pub provider_name: Vec<u8>,
    /// RTP synchronization source identifier
    pub ssrc: [u8; 4],
    /// Send delay bound (µs)
    pub latency: Mtime,
    /// Packet-group retention bound (µs)
    pub retention: Mtime,
    /// Multicast TTL
    pub ttl: u32,
    /// IP type-of-service byte
    pub tos: u8,
    /// Datagram size bound, RTP header included
    pub mtu: usize,
    /// Source address for raw-socket spoofing (parsed, unsupported)
    pub src_addr: Option<String>,
    /// Source port for raw-socket spoofing
    pub src_port: u16,

    /// Advertised TSID; `None` inherits the input TSID
    pub tsid: Option<u16>,
    /// Selected service; 0 means raw PID slicing
    pub sid: u16,
    /// Explicit PID list (overrides auto-selection from the PMT)
    pub pids: Vec<u16>,
    /// Renamed SID on the output; 0 keeps the original
    pub new_sid: u16,
    /// Original network id override; 0 uses the network id
    pub onid: u16,
    /// Forward the whole MPTS unmodified
    pub passthrough: bool,

    /// Per-output PID remapping enabled
    pub do_remap: bool,
    /// Remap base PIDs per [`MapSlot`] (`UNUSED_PID` = slot unused)
    pub map_pids: [u16; N_MAP_PIDS],
}

impl OutputConfig {
    /// A config with global defaults applied, targeting `remote`.
    pub fn new(remote: SocketAddr, defaults: &OutputDefaults) -> Self {
        Self {
            display_name: remote.to_string(),
            remote,
            bind: None,
            if_index_v6: None,
            watch: false,
            udp: defaults.udp,
            dvb: defaults.dvb,
            epg: defaults.epg,
            network_id: defaults.network_id,
            network_name: defaults.network_name.clone(),
            service_name: Vec::new(),
            provider_name: defaults.provider_name.clone(),
            ssrc: defaults.ssrc,
            latency: defaults.latency,
            retention: defaults.retention,
            ttl: defaults.ttl,
            tos: 0,
            mtu: 0,
            src_addr: None,
            src_port: 0,
            tsid: None,
            sid: 0,
            pids: Vec::new(),
            new_sid: 0,
            onid: 0,
            passthrough: false,
            do_remap: false,
            map_pids: [UNUSED_PID; N_MAP_PIDS],
        }
    }

    /// The ONID to advertise: explicit override or the network id.
    pub fn effective_onid(&self) -> u16 {
        if self.onid != 0 {
            self.onid
        } else {
            self.network_id
        }
    }

    /// The SID stamped on rebuilt tables.
    pub fn effective_sid(&self) -> u16 {
        if self.new_sid != 0 {
            self.new_sid
        } else {
            self.sid
        }
    }
}

/// Global defaults an output line starts from, set on the command line.
#[derive(Debug, Clone)]
pub struct OutputDefaults {
    /// Default to UDP payloads
    pub udp: bool,
    /// Default to DVB table insertion
    pub dvb: bool,
    /// Default to EIT schedule forwarding
    pub epg: bool,
    /// Default latency (µs)
    pub latency: Mtime,
    /// Default retention (µs)
    pub retention: Mtime,
    /// Default TTL
    pub ttl: u32,
    /// Default SSRC
    pub ssrc: [u8; 4],
    /// Default network id
    pub network_id: u16,
    /// Default SI-encoded network name
    pub network_name: Vec<u8>,
    /// Default SI-encoded provider name
    pub provider_name: Vec<u8>,
}

impl Default for OutputDefaults {
    fn default() -> Self {
        Self {
            udp: false,
            dvb: false,
            epg: false,
            latency: DEFAULT_OUTPUT_LATENCY,
            retention: DEFAULT_MAX_RETENTION,
            ttl: 64,
            ssrc: [0; 4],
            network_id: 0xffff,
            network_name: Vec::new(),
            provider_name: Vec::new(),
        }
    }
}

/// Process-wide settings, populated by the CLI.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Output config file path
    pub config_file: Option<String>,
    /// UDP/RTP input source (`address[:port][/udp][/mtu=…][/ifindex=…]`)
    pub udp_source: Option<String>,
    /// Control socket path
    pub comm_socket: Option<String>,
    /// Duplication output target line
    pub duplicate: Option<String>,
    /// Event channel mode and period (µs, 0 disables the periodic report)
    pub print_period: Mtime,
    /// ES activity timeout (µs, 0 disables presence tracking)
    pub es_timeout: Mtime,
    /// Pass EMM PIDs to all non-passthrough outputs
    pub enable_emm: bool,
    /// Select ECM PIDs alongside their services
    pub enable_ecm: bool,
    /// Select every ES type, not only the recognized A/V/sub set
    pub any_type: bool,
    /// One whole-transponder hardware filter instead of per-PID filters
    pub budget_mode: bool,
    /// Keep hardware filters on every PMT PID
    pub select_pmts: bool,
    /// Invent a random TSID instead of inheriting
    pub random_tsid: bool,
    /// Give every output its own random TSID
    pub unique_tsid: bool,
    /// Global PID remapping (PMT, audio, video, SPU)
    pub remap: Option<[u16; N_MAP_PIDS]>,
    /// Input silence tolerated before declaring lock loss (µs)
    pub udp_lock_timeout: Mtime,
    /// Stop the loop after this long, 0 to run forever (µs)
    pub quit_timeout: Mtime,
    /// Defaults applied to each output line
    pub defaults: OutputDefaults,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_file: None,
            udp_source: None,
            comm_socket: None,
            duplicate: None,
            print_period: 0,
            es_timeout: 0,
            enable_emm: false,
            enable_ecm: false,
            any_type: false,
            budget_mode: false,
            select_pmts: false,
            random_tsid: false,
            unique_tsid: false,
            remap: None,
            udp_lock_timeout: DEFAULT_UDP_LOCK_TIMEOUT,
            quit_timeout: 0,
            defaults: OutputDefaults::default(),
        }
    }
}

/// Turns a config option value into bytes: underscores become spaces, as
/// the file format cannot carry them.
fn unescape_option(value: &str) -> String {
    value.replace('_', " ")
}

/// Parses `address[:port]`, with IPv6 literals in brackets.
pub fn parse_addr(text: &str, default_port: u16) -> Result<SocketAddr> {
    let (host, port) = if let Some(rest) = text.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| TsCastError::Config(format!("invalid IPv6 address {}", text)))?;
        let host = &rest[..end];
        let port = match &rest[end + 1..] {
            "" => default_port,
            p => p
                .strip_prefix(':')
                .ok_or_else(|| TsCastError::Config(format!("invalid address {}", text)))?
                .parse()?,
        };
        (host.to_string(), port)
    } else {
        match text.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse()?),
            None => (text.to_string(), default_port),
        }
    };
    let ip: IpAddr = host
        .parse()
        .map_err(|_| TsCastError::Config(format!("invalid address {}", host)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Parses a `pidmap=pmt,apid,vpid,spupid` value.
fn parse_pidmap(value: &str) -> Result<[u16; N_MAP_PIDS]> {
    let mut map = [UNUSED_PID; N_MAP_PIDS];
    for (slot, token) in value.split(',').take(N_MAP_PIDS).enumerate() {
        let pid: u16 = token.trim().parse()?;
        if pid as usize >= MAX_PIDS {
            return Err(TsCastError::Config(format!("invalid pid map entry {}", pid)));
        }
        map[slot] = pid;
    }
    Ok(map)
}

/// Parses the `target[/option…]` field of a config line.
pub fn parse_target(target: &str, defaults: &OutputDefaults) -> Result<OutputConfig> {
    let mut parts = target.split('/');
    let addr_part = parts.next().unwrap_or_default();

    let (remote_part, bind_part) = match addr_part.split_once('@') {
        Some((remote, bind)) => (remote, Some(bind)),
        None => (addr_part, None),
    };
    let remote = parse_addr(remote_part, DEFAULT_PORT)?;

    let mut config = OutputConfig::new(remote, defaults);
    config.display_name = target.to_string();
    if let Some(bind) = bind_part {
        config.bind = Some(parse_addr(bind, 0)?);
    }

    let codec = StandardCodec;
    for option in parts {
        let (key, value) = option.split_once('=').unwrap_or((option, ""));
        match key.to_ascii_lowercase().as_str() {
            "udp" => config.udp = true,
            "dvb" => config.dvb = true,
            "epg" => config.epg = true,
            "tsid" => config.tsid = Some(value.parse()?),
            "retention" => config.retention = value.parse::<Mtime>()? * 1000,
            "latency" => config.latency = value.parse::<Mtime>()? * 1000,
            "ttl" => config.ttl = value.parse()?,
            "tos" => config.tos = value.parse()?,
            "mtu" => config.mtu = value.parse()?,
            "ifindex" => config.if_index_v6 = Some(value.parse()?),
            "networkid" => config.network_id = value.parse()?,
            "onid" => config.onid = value.parse()?,
            "charset" => {
                if !value.eq_ignore_ascii_case("utf-8") && !value.eq_ignore_ascii_case("utf8") {
                    log::warn!("charset {} not supported, names use UTF-8", value);
                }
            }
            "networkname" => {
                config.network_name = codec.encode(&unescape_option(value));
            }
            "srvname" => {
                config.service_name = codec.encode(&unescape_option(value));
            }
            "srvprovider" => {
                config.provider_name = codec.encode(&unescape_option(value));
            }
            "srcaddr" => {
                if !config.remote.is_ipv4() {
                    return Err(TsCastError::Config(
                        "source spoofing is IPv4 only".to_string(),
                    ));
                }
                config.src_addr = Some(value.to_string());
            }
            "srcport" => config.src_port = value.parse()?,
            "ssrc" => {
                let ip: std::net::Ipv4Addr = value
                    .parse()
                    .map_err(|_| TsCastError::Config(format!("invalid ssrc {}", value)))?;
                config.ssrc = ip.octets();
            }
            "pidmap" => {
                config.map_pids = parse_pidmap(value)?;
                config.do_remap = true;
            }
            "newsid" => config.new_sid = value.parse()?,
            other => log::warn!("unrecognized option {}", other),
        }
    }

    let default_mtu = if config.remote.is_ipv6() {
        DEFAULT_IPV6_MTU
    } else {
        DEFAULT_IPV4_MTU
    };
    if config.mtu == 0 {
        config.mtu = default_mtu;
    } else if config.mtu < TS_SIZE + RTP_HEADER_SIZE {
        log::warn!("invalid MTU {}, setting {}", config.mtu, default_mtu);
        config.mtu = default_mtu;
    }

    Ok(config)
}

/// Parses one non-comment config line. Returns `None` for blank lines.
pub fn parse_output_line(line: &str, defaults: &OutputDefaults) -> Result<Option<OutputConfig>> {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
        return Ok(None);
    }

    let mut fields = line.split_whitespace();
    let target = fields
        .next()
        .ok_or_else(|| TsCastError::Config("missing target".to_string()))?;
    let mut config = parse_target(target, defaults)?;

    let watch = fields
        .next()
        .ok_or_else(|| TsCastError::Config(format!("{}: missing watch flag", target)))?;
    config.watch = watch == "1";

    let sid = fields
        .next()
        .ok_or_else(|| TsCastError::Config(format!("{}: missing service id", target)))?;
    if sid == "*" {
        config.passthrough = true;
    } else {
        config.sid = sid.parse()?;
        if let Some(pid_list) = fields.next() {
            for token in pid_list.split(',') {
                let pid: u16 = token.parse()?;
                if pid as usize >= MAX_PIDS {
                    return Err(TsCastError::Config(format!("{}: invalid pid {}", target, pid)));
                }
                config.pids.push(pid);
            }
        }
    }

    Ok(Some(config))
}

/// Reads the whole config file; invalid lines are logged and skipped so one
/// bad output never takes the process down.
pub fn read_config_file(path: &str, defaults: &OutputDefaults) -> Result<Vec<OutputConfig>> {
    let contents = std::fs::read_to_string(path)?;
    let mut configs = Vec::new();
    for line in contents.lines() {
        match parse_output_line(line, defaults) {
            Ok(Some(config)) => configs.push(config),
            Ok(None) => {}
            Err(err) => log::error!("config line {:?} ignored: {}", line, err),
        }
    }
    Ok(configs)
}
