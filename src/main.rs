//! tscast process entry point: CLI parsing, logging, construction of the
//! demultiplexer and the event loop.

use clap::Parser;
use log::{error, info};

use tscast::ca::{CaSession, LogCa};
use tscast::comm::CommServer;
use tscast::config::{
    parse_target, read_config_file, OutputDefaults, Settings, DEFAULT_UDP_LOCK_TIMEOUT,
    N_MAP_PIDS,
};
use tscast::demux::Demuxer;
use tscast::events::{PrintMode, Reporter};
use tscast::input::{NoFilters, UdpInput};
use tscast::output::Output;
use tscast::runtime;
use tscast::TsCastError;

#[derive(Parser, Debug)]
#[command(name = "tscast", version, about = "MPEG-TS demultiplexer and UDP/RTP forwarder")]
struct Cli {
    /// Output configuration file
    #[arg(short = 'c', long = "config-file")]
    config_file: Option<String>,

    /// UDP/RTP input source: [connect@]address[:port][/udp][/mtu=][/ifindex=]
    #[arg(short = 'D', long = "udp-source")]
    udp_source: Option<String>,

    /// Control socket path
    #[arg(short = 'r', long = "remote-socket")]
    remote_socket: Option<String>,

    /// Duplicate the whole input to this target line
    #[arg(short = 'd', long = "duplicate")]
    duplicate: Option<String>,

    /// Event output mode (text or xml)
    #[arg(short = 'x', long = "print")]
    print: Option<String>,

    /// Status print period in milliseconds (0 disables)
    #[arg(long = "print-period", default_value_t = 0)]
    print_period: i64,

    /// ES presence timeout in milliseconds (0 disables)
    #[arg(long = "es-timeout", default_value_t = 0)]
    es_timeout: i64,

    /// Pass EMM PIDs through to all non-passthrough outputs
    #[arg(long = "emm-passthrough")]
    emm: bool,

    /// Select ECM PIDs alongside their services
    #[arg(long = "ecm-passthrough")]
    ecm: bool,

    /// Select all elementary streams regardless of type
    #[arg(long = "any-type")]
    any_type: bool,

    /// One whole-transponder filter instead of per-PID filters
    #[arg(short = 'u', long = "budget-mode")]
    budget_mode: bool,

    /// Keep filters on all PMT PIDs
    #[arg(short = 'P', long = "select-pmts")]
    select_pmts: bool,

    /// Invent a random TSID instead of inheriting the input one
    #[arg(long = "random-tsid")]
    random_tsid: bool,

    /// Give each output its own random TSID
    #[arg(short = 'T', long = "unique-tsid")]
    unique_tsid: bool,

    /// Global PID remapping: pmt,audio,video,spu
    #[arg(long = "pidmap")]
    pidmap: Option<String>,

    /// Input silence before lock loss, in milliseconds
    #[arg(short = 'O', long = "lock-timeout", default_value_t = DEFAULT_UDP_LOCK_TIMEOUT / 1000)]
    lock_timeout: i64,

    /// Stop after this many milliseconds (0 runs forever)
    #[arg(long = "quit-timeout", default_value_t = 0)]
    quit_timeout: i64,

    /// Default outputs to plain UDP instead of RTP
    #[arg(short = 'U', long = "udp")]
    udp: bool,

    /// Default output latency in milliseconds
    #[arg(short = 'L', long = "latency")]
    latency: Option<i64>,

    /// Default packet-group retention in milliseconds
    #[arg(short = 'E', long = "retention")]
    retention: Option<i64>,

    /// Default multicast TTL
    #[arg(short = 't', long = "ttl", default_value_t = 64)]
    ttl: u32,

    /// Default RTP SSRC, as a dotted quad
    #[arg(short = 'S', long = "ssrc")]
    ssrc: Option<String>,

    /// Default DVB network id
    #[arg(long = "network-id", default_value_t = 0xffff)]
    network_id: u16,

    /// Default DVB network name
    #[arg(short = 'M', long = "network-name")]
    network_name: Option<String>,

    /// Default service provider name
    #[arg(long = "provider-name")]
    provider_name: Option<String>,

    /// Attach the logging CA stub instead of running CAM-less
    #[arg(long = "log-ca")]
    log_ca: bool,

    /// Verbosity; repeat for more detail
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn settings_from_cli(cli: &Cli) -> Result<Settings, TsCastError> {
    use tscast::charset::{SiTextCodec, StandardCodec};
    let codec = StandardCodec;

    let mut defaults = OutputDefaults {
        udp: cli.udp,
        ttl: cli.ttl,
        network_id: cli.network_id,
        ..OutputDefaults::default()
    };
    if let Some(latency) = cli.latency {
        defaults.latency = latency * 1000;
    }
    if let Some(retention) = cli.retention {
        defaults.retention = retention * 1000;
    }
    if let Some(ssrc) = &cli.ssrc {
        let ip: std::net::Ipv4Addr = ssrc
            .parse()
            .map_err(|_| TsCastError::Config(format!("invalid ssrc {}", ssrc)))?;
        defaults.ssrc = ip.octets();
    }
    if let Some(name) = &cli.network_name {
        defaults.network_name = codec.encode(name);
    }
    if let Some(name) = &cli.provider_name {
        defaults.provider_name = codec.encode(name);
    }

    let remap = match &cli.pidmap {
        Some(value) => {
            let mut map = [0u16; N_MAP_PIDS];
            for (slot, token) in value.split(',').take(N_MAP_PIDS).enumerate() {
                map[slot] = token
                    .trim()
                    .parse()
                    .map_err(|_| TsCastError::Config(format!("invalid pidmap {}", value)))?;
            }
            Some(map)
        }
        None => None,
    };

    Ok(Settings {
        config_file: cli.config_file.clone(),
        udp_source: cli.udp_source.clone(),
        comm_socket: cli.remote_socket.clone(),
        duplicate: cli.duplicate.clone(),
        print_period: cli.print_period * 1000,
        es_timeout: cli.es_timeout * 1000,
        enable_emm: cli.emm,
        enable_ecm: cli.ecm,
        any_type: cli.any_type,
        budget_mode: cli.budget_mode,
        select_pmts: cli.select_pmts,
        random_tsid: cli.random_tsid,
        unique_tsid: cli.unique_tsid,
        remap,
        udp_lock_timeout: cli.lock_timeout * 1000,
        quit_timeout: cli.quit_timeout * 1000,
        defaults,
    })
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let settings = match settings_from_cli(&cli) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("tscast: {}", err);
            std::process::exit(1);
        }
    };

    let mode = match cli.print.as_deref() {
        Some("xml") => PrintMode::Xml,
        Some("text") => PrintMode::Text,
        Some(other) => {
            eprintln!("tscast: unknown print mode {}", other);
            std::process::exit(1);
        }
        None => PrintMode::None,
    };

    let exit_code = match run(settings, mode, cli.log_ca) {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            1
        }
    };
    std::process::exit(exit_code);
}

#[tokio::main(flavor = "current_thread")]
async fn run(settings: Settings, mode: PrintMode, log_ca: bool) -> tscast::Result<i32> {
    let Some(source) = settings.udp_source.clone() else {
        return Err(TsCastError::Fatal(
            "no input source configured (use --udp-source)".to_string(),
        ));
    };

    let reporter = Reporter::stdout(mode);
    let ca: Option<Box<dyn CaSession>> =
        log_ca.then(|| Box::new(LogCa::default()) as Box<dyn CaSession>);
    let mut demuxer = Demuxer::new(settings, reporter, Box::new(NoFilters), ca);

    let input = UdpInput::open(&source).await?;

    if let Some(target) = demuxer.settings.duplicate.clone() {
        let mut config = parse_target(&target, &demuxer.settings.defaults)?;
        config.passthrough = true;
        match Output::new(config, demuxer.pool.clone()) {
            Ok(output) => demuxer.dup = Some(output),
            Err(err) => error!("couldn't open duplicate output {} ({})", target, err),
        }
    }

    if let Some(path) = demuxer.settings.config_file.clone() {
        let configs = read_config_file(&path, &demuxer.settings.defaults)?;
        demuxer.apply_config(&configs);
    }

    let comm = match demuxer.settings.comm_socket.clone() {
        Some(path) => Some(CommServer::bind(&path)?),
        None => None,
    };

    info!("tscast starting");
    runtime::run(demuxer, input, comm).await
}
