//! Control socket: a UNIX datagram endpoint for supervision tools.
//!
//! Frame format, both directions: a 4-byte header `{magic, cmd|ret, 0, 0}`
//! then 4 little-endian bytes holding the total frame length (header
//! included), then the payload. Oversized replies are fragmented into
//! chunks no larger than [`COMM_MAX_MSG_CHUNK`].

use std::path::PathBuf;

use log::{debug, error};
use tokio::net::UnixDatagram;

use crate::demux::Demuxer;
use crate::error::{Result, TsCastError};

/// Protocol magic / version byte.
pub const COMM_HEADER_MAGIC: u8 = 0x48;
/// Size of the fixed frame prefix (magic header plus length field).
pub const COMM_HEADER_SIZE: usize = 8;
/// Receive buffer size.
pub const COMM_BUFFER_SIZE: usize = 4096;
/// Largest fragment written in one send.
pub const COMM_MAX_MSG_CHUNK: usize = 4096;

/// Commands a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Re-read the output config file
    Reload = 1,
    /// Terminate the process
    Shutdown = 2,
    /// Tuner frontend status
    FrontendStatus = 3,
    /// CAM MMI summary
    MmiStatus = 4,
    /// CAM MMI status of one slot
    MmiSlotStatus = 5,
    /// Open an MMI session
    MmiOpen = 6,
    /// Close an MMI session
    MmiClose = 7,
    /// Fetch a pending MMI object
    MmiRecv = 8,
    /// Send an MMI object
    MmiSend = 9,
    /// Current PAT as packed sections
    GetPat = 10,
    /// Current CAT as packed sections
    GetCat = 11,
    /// Current NIT as packed sections
    GetNit = 12,
    /// Current SDT as packed sections
    GetSdt = 13,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        Ok(match value {
            1 => Command::Reload,
            2 => Command::Shutdown,
            3 => Command::FrontendStatus,
            4 => Command::MmiStatus,
            5 => Command::MmiSlotStatus,
            6 => Command::MmiOpen,
            7 => Command::MmiClose,
            8 => Command::MmiRecv,
            9 => Command::MmiSend,
            10 => Command::GetPat,
            11 => Command::GetCat,
            12 => Command::GetNit,
            13 => Command::GetSdt,
            other => return Err(other),
        })
    }
}

/// Result codes echoed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    /// Command accepted
    Ok = 0,
    /// Command failed
    Err = 1,
    /// Frontend status payload follows
    FrontendStatus = 2,
    /// MMI status payload follows
    MmiStatus = 3,
    /// MMI slot status payload follows
    MmiSlotStatus = 4,
    /// MMI object payload follows
    MmiRecv = 5,
    /// Requested table has no data
    NoData = 7,
    /// Packed PAT follows
    Pat = 8,
    /// Packed CAT follows
    Cat = 9,
    /// Packed NIT follows
    Nit = 10,
    /// Packed SDT follows
    Sdt = 11,
    /// Unrecognized command
    Huh = 255,
}

/// Side effect a processed command asks of the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommAction {
    /// Nothing to do
    None,
    /// Reload the config file
    Reload,
    /// Leave the event loop
    Shutdown,
}

/// Decodes and executes one command frame against the demuxer. Returns the
/// result code, the reply payload and the action for the event loop.
pub fn process_command(frame: &[u8], demuxer: &mut Demuxer) -> (ReturnCode, Vec<u8>, CommAction) {
    if frame.len() < COMM_HEADER_SIZE || frame[0] != COMM_HEADER_MAGIC {
        error!("wrong control protocol magic");
        return (ReturnCode::Huh, Vec::new(), CommAction::None);
    }
    let Ok(command) = Command::try_from(frame[1]) else {
        error!("wrong command {}", frame[1]);
        return (ReturnCode::Huh, Vec::new(), CommAction::None);
    };
    let payload = &frame[COMM_HEADER_SIZE..];

    let table = |data: Option<Vec<u8>>, code: ReturnCode| match data {
        Some(data) if !data.is_empty() && data.len() <= COMM_BUFFER_SIZE - COMM_HEADER_SIZE => {
            (code, data, CommAction::None)
        }
        Some(data) if data.len() > COMM_BUFFER_SIZE - COMM_HEADER_SIZE => {
            error!("section size is too big ({})", data.len());
            (ReturnCode::NoData, Vec::new(), CommAction::None)
        }
        _ => (ReturnCode::NoData, Vec::new(), CommAction::None),
    };

    match command {
        Command::Reload => (ReturnCode::Ok, Vec::new(), CommAction::Reload),
        Command::Shutdown => (ReturnCode::Ok, Vec::new(), CommAction::Shutdown),
        Command::FrontendStatus => {
            // Only the network capture driver lives in this tree; there is
            // no frontend to report on.
            (ReturnCode::Err, Vec::new(), CommAction::None)
        }
        Command::MmiStatus => mmi_reply(demuxer, ReturnCode::MmiStatus, |ca, _| ca.mmi_status()),
        Command::MmiSlotStatus => mmi_with_slot(demuxer, payload, ReturnCode::MmiSlotStatus, |ca, slot| {
            ca.mmi_slot_status(slot)
        }),
        Command::MmiOpen => {
            mmi_with_slot(demuxer, payload, ReturnCode::Ok, |ca, slot| {
                ca.mmi_open(slot).map(|_| Vec::new())
            })
        }
        Command::MmiClose => {
            mmi_with_slot(demuxer, payload, ReturnCode::Ok, |ca, slot| {
                ca.mmi_close(slot).map(|_| Vec::new())
            })
        }
        Command::MmiRecv => {
            mmi_with_slot(demuxer, payload, ReturnCode::MmiRecv, |ca, slot| ca.mmi_recv(slot))
        }
        Command::MmiSend => match payload.split_first() {
            Some((&slot, object)) => match demuxer.ca.as_mut() {
                Some(ca) => match ca.mmi_send(slot, object) {
                    Ok(()) => (ReturnCode::Ok, Vec::new(), CommAction::None),
                    Err(_) => (ReturnCode::Err, Vec::new(), CommAction::None),
                },
                None => (ReturnCode::Err, Vec::new(), CommAction::None),
            },
            None => (ReturnCode::Err, Vec::new(), CommAction::None),
        },
        Command::GetPat => table(demuxer.packed_pat(), ReturnCode::Pat),
        Command::GetCat => table(demuxer.packed_cat(), ReturnCode::Cat),
        Command::GetNit => table(demuxer.packed_nit(), ReturnCode::Nit),
        Command::GetSdt => table(demuxer.packed_sdt(), ReturnCode::Sdt),
    }
}

fn mmi_reply(
    demuxer: &mut Demuxer,
    code: ReturnCode,
    f: impl FnOnce(&mut dyn crate::ca::CaSession, u8) -> Result<Vec<u8>>,
) -> (ReturnCode, Vec<u8>, CommAction) {
    match demuxer.ca.as_mut() {
        Some(ca) => match f(ca.as_mut(), 0) {
            Ok(data) => (code, data, CommAction::None),
            Err(_) => (ReturnCode::Err, Vec::new(), CommAction::None),
        },
        None => (ReturnCode::Err, Vec::new(), CommAction::None),
    }
}

fn mmi_with_slot(
    demuxer: &mut Demuxer,
    payload: &[u8],
    code: ReturnCode,
    f: impl FnOnce(&mut dyn crate::ca::CaSession, u8) -> Result<Vec<u8>>,
) -> (ReturnCode, Vec<u8>, CommAction) {
    let Some(&slot) = payload.first() else {
        return (ReturnCode::Err, Vec::new(), CommAction::None);
    };
    match demuxer.ca.as_mut() {
        Some(ca) => match f(ca.as_mut(), slot) {
            Ok(data) => (code, data, CommAction::None),
            Err(_) => (ReturnCode::Err, Vec::new(), CommAction::None),
        },
        None => (ReturnCode::Err, Vec::new(), CommAction::None),
    }
}

/// Frames a reply: header, little-endian total length, payload.
pub fn encode_reply(code: ReturnCode, payload: &[u8]) -> Vec<u8> {
    let total = (COMM_HEADER_SIZE + payload.len()) as u32;
    let mut frame = Vec::with_capacity(total as usize);
    frame.push(COMM_HEADER_MAGIC);
    frame.push(code as u8);
    frame.push(0);
    frame.push(0);
    frame.extend_from_slice(&total.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Frames a command, for clients and tests.
pub fn encode_command(command: Command, payload: &[u8]) -> Vec<u8> {
    let total = (COMM_HEADER_SIZE + payload.len()) as u32;
    let mut frame = Vec::with_capacity(total as usize);
    frame.push(COMM_HEADER_MAGIC);
    frame.push(command as u8);
    frame.push(0);
    frame.push(0);
    frame.extend_from_slice(&total.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// The bound control socket.
pub struct CommServer {
    socket: UnixDatagram,
    path: PathBuf,
}

impl CommServer {
    /// Binds the control socket, replacing a stale socket file. Failure is
    /// fatal: a supervisor relying on the socket must not run blind.
    pub fn bind(path: &str) -> Result<Self> {
        let path = PathBuf::from(path);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let socket = UnixDatagram::bind(&path).map_err(|err| {
            TsCastError::Fatal(format!("cannot bind comm socket {} ({})", path.display(), err))
        })?;
        Ok(Self { socket, path })
    }

    /// Waits for a pending command frame.
    pub async fn readable(&self) -> std::io::Result<()> {
        self.socket.readable().await
    }

    /// Processes every queued command. Returns the strongest action
    /// requested (shutdown beats reload).
    pub fn handle_pending(&mut self, demuxer: &mut Demuxer) -> CommAction {
        let mut action = CommAction::None;
        let mut buffer = [0u8; COMM_BUFFER_SIZE];
        loop {
            let (len, from) = match self.socket.try_recv_from(&mut buffer) {
                Ok(ok) => ok,
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!("cannot read comm socket ({})", err);
                    break;
                }
            };
            let Some(from) = from.as_pathname() else {
                error!("anonymous packet from comm socket");
                continue;
            };

            let (code, payload, requested) = process_command(&buffer[..len], demuxer);
            debug!("answering {:?} with size {}", code, payload.len());

            let reply = encode_reply(code, &payload);
            let mut sent = 0;
            while sent < reply.len() {
                let chunk = &reply[sent..(sent + COMM_MAX_MSG_CHUNK).min(reply.len())];
                match self.socket.try_send_to(chunk, from) {
                    Ok(n) => sent += n,
                    Err(err) => {
                        error!("cannot send comm socket ({})", err);
                        break;
                    }
                }
            }

            if requested == CommAction::Shutdown
                || (requested == CommAction::Reload && action == CommAction::None)
            {
                action = requested;
            }
        }
        action
    }
}

impl Drop for CommServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::events::Reporter;
    use crate::input::NoFilters;
    use crate::ts::tables::build_pat;

    fn demuxer() -> Demuxer {
        Demuxer::new(
            Settings::default(),
            Reporter::disabled(),
            Box::new(NoFilters),
            None,
        )
    }

    fn feed_pat(demuxer: &mut Demuxer) {
        let pat = build_pat(0x42, 0, &[(1, 0x20)]);
        let mut ts = [0u8; crate::ts::TS_SIZE];
        let mut ts_offset = 0usize;
        let mut section_offset = 0usize;
        crate::ts::psi::split_section(
            &mut ts,
            &mut ts_offset,
            pat.as_bytes(),
            &mut section_offset,
        );
        crate::ts::psi::split_end(&mut ts, &mut ts_offset);
        crate::ts::packet::set_pid(&mut ts, crate::ts::PAT_PID);
        let block = crate::block::TsBlock::new(bytes::Bytes::copy_from_slice(&ts), 0);
        demuxer.handle(block);
    }

    #[test]
    fn test_reload_and_shutdown() {
        let mut demuxer = demuxer();
        let (code, payload, action) =
            process_command(&encode_command(Command::Reload, &[]), &mut demuxer);
        assert_eq!(code, ReturnCode::Ok);
        assert!(payload.is_empty());
        assert_eq!(action, CommAction::Reload);

        let (code, _, action) =
            process_command(&encode_command(Command::Shutdown, &[]), &mut demuxer);
        assert_eq!(code, ReturnCode::Ok);
        assert_eq!(action, CommAction::Shutdown);
    }

    #[test]
    fn test_get_pat_roundtrip() {
        let mut demuxer = demuxer();
        let (code, payload, _) =
            process_command(&encode_command(Command::GetPat, &[]), &mut demuxer);
        assert_eq!(code, ReturnCode::NoData);
        assert!(payload.is_empty());

        feed_pat(&mut demuxer);
        let (code, payload, _) =
            process_command(&encode_command(Command::GetPat, &[]), &mut demuxer);
        assert_eq!(code, ReturnCode::Pat);
        let sections = crate::ts::psi::unpack_sections(&payload).expect("valid pack");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].tableidext(), 0x42);
    }

    #[test]
    fn test_bad_magic_and_command() {
        let mut demuxer = demuxer();
        let mut frame = encode_command(Command::Reload, &[]);
        frame[0] = 0x47;
        let (code, _, _) = process_command(&frame, &mut demuxer);
        assert_eq!(code, ReturnCode::Huh);

        let mut frame = encode_command(Command::Reload, &[]);
        frame[1] = 200;
        let (code, _, _) = process_command(&frame, &mut demuxer);
        assert_eq!(code, ReturnCode::Huh);
    }

    #[test]
    fn test_mmi_without_cam_errors() {
        let mut demuxer = demuxer();
        let (code, _, _) =
            process_command(&encode_command(Command::MmiStatus, &[]), &mut demuxer);
        assert_eq!(code, ReturnCode::Err);
    }

    #[test]
    fn test_reply_framing() {
        let reply = encode_reply(ReturnCode::Pat, &[1, 2, 3]);
        assert_eq!(reply[0], COMM_HEADER_MAGIC);
        assert_eq!(reply[1], ReturnCode::Pat as u8);
        assert_eq!(
            u32::from_le_bytes(reply[4..8].try_into().unwrap()),
            (COMM_HEADER_SIZE + 3) as u32
        );
        assert_eq!(&reply[8..], &[1, 2, 3]);
    }
}
