//! The event loop.
//!
//! A single-threaded reactor over: input readiness, the earliest output
//! send deadline, a coarse housekeeping tick (status print, PID presence,
//! input mute), control-socket commands and POSIX signals. Nothing in the
//! loop blocks; socket writes that would are dropped and counted.

use std::time::{Duration, Instant};

use log::info;
use tokio::signal::unix::{signal, SignalKind};

use crate::comm::{CommAction, CommServer};
use crate::config::{read_config_file, EXIT_STATUS_FRONTEND_TIMEOUT};
use crate::demux::Demuxer;
use crate::error::Result;
use crate::input::UdpInput;
use crate::Mtime;

/// Longest the loop sleeps between housekeeping passes (µs).
const MAX_POLL_TIMEOUT: Mtime = 100_000;
/// Shortest sleep worth doing at all (µs).
const MIN_POLL_TIMEOUT: Mtime = 100;

/// Microseconds since the loop epoch.
fn mdate(epoch: Instant) -> Mtime {
    epoch.elapsed().as_micros() as Mtime
}

/// Runs the loop until shutdown. Returns the process exit code.
pub async fn run(
    mut demuxer: Demuxer,
    mut input: UdpInput,
    mut comm: Option<CommServer>,
) -> Result<i32> {
    let epoch = Instant::now();
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let mut last_packet: Mtime = 0;
    let mut last_print: Mtime = 0;
    let mut exit_code = 0;

    loop {
        let now = mdate(epoch);
        let next_send = demuxer.send_outputs(now);

        // Sleep until the next send deadline, bounded so housekeeping and
        // mute detection keep running.
        let sleep_for = next_send
            .map(|deadline| (deadline - now).clamp(MIN_POLL_TIMEOUT, MAX_POLL_TIMEOUT))
            .unwrap_or(MAX_POLL_TIMEOUT);

        tokio::select! {
            result = input.readable() => {
                result?;
                let now = mdate(epoch);
                let blocks = {
                    let pool = demuxer.pool.clone();
                    let mut pool = pool.borrow_mut();
                    input.read_burst(&mut pool, now, &mut demuxer.reporter)
                };
                if !blocks.is_empty() {
                    last_packet = now;
                    demuxer.run_burst(blocks, now);
                }
            }
            result = wait_comm(&comm) => {
                result?;
                if let Some(server) = comm.as_mut() {
                    match server.handle_pending(&mut demuxer) {
                        CommAction::Shutdown => {
                            info!("shutdown was requested");
                            break;
                        }
                        CommAction::Reload => reload(&mut demuxer),
                        CommAction::None => {}
                    }
                }
            }
            _ = sighup.recv() => {
                info!("configuration reload was requested");
                reload(&mut demuxer);
            }
            _ = sigint.recv() => {
                info!("shutdown was requested");
                break;
            }
            _ = sigterm.recv() => {
                info!("shutdown was requested");
                break;
            }
            _ = tokio::time::sleep(Duration::from_micros(sleep_for as u64)) => {}
        }

        let now = mdate(epoch);

        // Input mute: no packets for the lock timeout means lost lock,
        // retune and CA reset.
        if input.synced() && now > last_packet + demuxer.settings.udp_lock_timeout {
            input.lose_lock(&mut demuxer.reporter);
            demuxer.filters.reset();
            if let Some(ca) = demuxer.ca.as_mut() {
                ca.reset();
            }
            demuxer.resend_ca_pmts();
        }

        let period = demuxer.settings.print_period;
        if period > 0 && now >= last_print + period {
            last_print = now;
            demuxer.print_status(period);
        }

        demuxer.check_presence(now);

        let quit = demuxer.settings.quit_timeout;
        if quit > 0 && now >= quit {
            if !input.synced() {
                exit_code = EXIT_STATUS_FRONTEND_TIMEOUT;
            }
            info!("quit timeout elapsed");
            break;
        }
    }

    // Final drain before the sockets close.
    demuxer.send_outputs(Mtime::MAX);
    drop(comm);
    Ok(exit_code)
}

async fn wait_comm(comm: &Option<CommServer>) -> std::io::Result<()> {
    match comm {
        Some(server) => server.readable().await,
        None => futures::future::pending().await,
    }
}

/// Re-reads the config file and applies the diff to the output set.
pub fn reload(demuxer: &mut Demuxer) {
    let Some(path) = demuxer.settings.config_file.clone() else {
        log::error!("no config file");
        return;
    };
    match read_config_file(&path, &demuxer.settings.defaults) {
        Ok(configs) => demuxer.apply_config(&configs),
        Err(err) => log::error!("couldn't read config file {} ({})", path, err),
    }
}
