//! The structured event print channel.
//!
//! Separate from `log`: supervisors parse this stream. Two renderings of
//! the same events, selected at startup: a line-oriented text form and an
//! XML form (`<ERROR …/>`, `<EVENT …/>`, `<STATUS …/>`). Every stream
//! error class, recovery action and status transition is announced here.

use std::io::Write;

/// Rendering mode of the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintMode {
    /// Channel disabled
    #[default]
    None,
    /// Line-oriented text
    Text,
    /// XML elements
    Xml,
}

/// Sink for structured events.
pub struct Reporter {
    mode: PrintMode,
    out: Box<dyn Write + Send>,
}

impl Reporter {
    /// Creates a reporter writing to stdout.
    pub fn stdout(mode: PrintMode) -> Self {
        Self::new(mode, Box::new(std::io::stdout()))
    }

    /// Creates a reporter with an explicit sink.
    pub fn new(mode: PrintMode, out: Box<dyn Write + Send>) -> Self {
        Self { mode, out }
    }

    /// Creates a disabled reporter.
    pub fn disabled() -> Self {
        Self::new(PrintMode::None, Box::new(std::io::sink()))
    }

    /// Whether events are being emitted at all.
    pub fn enabled(&self) -> bool {
        self.mode != PrintMode::None
    }

    /// The configured mode.
    pub fn mode(&self) -> PrintMode {
        self.mode
    }

    fn line(&mut self, text: String, xml: String) {
        let _ = match self.mode {
            PrintMode::None => return,
            PrintMode::Text => writeln!(self.out, "{}", text),
            PrintMode::Xml => writeln!(self.out, "{}", xml),
        };
    }

    /// An error without attributes, e.g. `invalid_pat`.
    pub fn error(&mut self, kind: &str) {
        self.line(
            format!("error type: {}", kind),
            format!("<ERROR type=\"{}\"/>", kind),
        );
    }

    /// An error attributed to one PID, e.g. `invalid_pmt_section`.
    pub fn error_pid(&mut self, kind: &str, pid: u16) {
        self.line(
            format!("error type: {} pid: {}", kind, pid),
            format!("<ERROR type=\"{}\" pid=\"{}\"/>", kind, pid),
        );
    }

    /// A PMT received on a PID tracking another program.
    pub fn ghost_pmt(&mut self, program: u16, pid: u16) {
        self.line(
            format!("error type: ghost_pmt program: {} pid: {}", program, pid),
            format!("<ERROR type=\"ghost_pmt\" program=\"{}\" pid=\"{}\"/>", program, pid),
        );
    }

    /// Accumulated invalid-sync packets over the print period.
    pub fn invalids(&mut self, count: u64) {
        self.line(
            format!("invalids: {}", count),
            format!("<ERROR type=\"invalid_ts\" number=\"{}\" />", count),
        );
    }

    /// Accumulated continuity discontinuities over the print period.
    pub fn discontinuities(&mut self, count: u64) {
        self.line(
            format!("discontinuities: {}", count),
            format!("<ERROR type=\"invalid_discontinuity\" number=\"{}\" />", count),
        );
    }

    /// Accumulated transport_error_indicator packets over the print period.
    pub fn transport_errors(&mut self, count: u64) {
        self.line(
            format!("errors: {}", count),
            format!("<ERROR type=\"transport_error\" number=\"{}\" />", count),
        );
    }

    /// A watchdog-driven reset with its cause (`transport`, `scrambling`).
    pub fn reset(&mut self, cause: &str) {
        self.line(
            format!("reset cause: {}", cause),
            format!("<EVENT type=\"reset\" cause=\"{}\" />", cause),
        );
    }

    /// Input lock acquired or lost.
    pub fn lock_status(&mut self, locked: bool) {
        let status = locked as u8;
        self.line(
            format!("lock status: {}", status),
            format!("<STATUS type=\"lock\" status=\"{}\"/>", status),
        );
    }

    /// Periodic bitrate estimation.
    pub fn bitrate(&mut self, bitrate: u64) {
        self.line(
            format!("bitrate: {}", bitrate),
            format!(
                "<STATUS type=\"bitrate\" status=\"{}\" value=\"{}\" />",
                (bitrate != 0) as u8,
                bitrate
            ),
        );
    }

    /// Datagram source address change on the input socket.
    pub fn source(&mut self, addr: &str, port: &str) {
        self.line(
            format!("source status: {}:{}", addr, port),
            format!("<STATUS type=\"source\" address=\"{}\" port=\"{}\"/>", addr, port),
        );
    }

    /// RTP SSRC change on the input.
    pub fn rtp_source(&mut self, source: &str) {
        self.line(
            format!("rtpsource: {}", source),
            format!("<STATUS type=\"rtpsource\" source=\"{}\"/>", source),
        );
    }

    /// A PID coming up, with PES detection, or going down.
    pub fn pid_status(&mut self, pid: u16, up: bool, pes: bool) {
        if up {
            self.line(
                format!("pid: {} up{}", pid, if pes { " pes" } else { "" }),
                format!(
                    "<STATUS type=\"pid\" pid=\"{}\" status=\"1\" pes=\"{}\" />",
                    pid, pes as u8
                ),
            );
        } else {
            self.line(
                format!("pid: {} down", pid),
                format!("<STATUS type=\"pid\" pid=\"{}\" status=\"0\" />", pid),
            );
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter").field("mode", &self.mode).finish()
    }
}
