//! Outbound interface to the EN 50221 conditional-access stack.
//!
//! The demultiplexer only tells the CAM which PMTs to descramble: add when
//! the first output selects a service that needs it, update when that
//! service's PMT changes, delete when no output selects it anymore. The
//! transport/session/application layers live behind this trait; the MMI
//! pass-through exists for the control socket.

use crate::error::{Result, TsCastError};
use crate::ts::PsiSection;

/// CA session layer as seen from the demultiplexer.
pub trait CaSession {
    /// A newly selected service needs descrambling.
    fn add_pmt(&mut self, pmt: &PsiSection);

    /// The PMT of a selected, descrambling service changed.
    fn update_pmt(&mut self, pmt: &PsiSection);

    /// No output selects this service anymore.
    fn delete_pmt(&mut self, pmt: &PsiSection);

    /// Watchdog-driven module reset. The demultiplexer replays `add_pmt`
    /// for every descrambling service afterwards.
    fn reset(&mut self);

    /// MMI status summary for the control socket.
    fn mmi_status(&mut self) -> Result<Vec<u8>> {
        Err(TsCastError::Protocol("no CAM attached".to_string()))
    }

    /// MMI status of one slot.
    fn mmi_slot_status(&mut self, _slot: u8) -> Result<Vec<u8>> {
        Err(TsCastError::Protocol("no CAM attached".to_string()))
    }

    /// Opens an MMI session on a slot.
    fn mmi_open(&mut self, _slot: u8) -> Result<()> {
        Err(TsCastError::Protocol("no CAM attached".to_string()))
    }

    /// Closes the MMI session of a slot.
    fn mmi_close(&mut self, _slot: u8) -> Result<()> {
        Err(TsCastError::Protocol("no CAM attached".to_string()))
    }

    /// Fetches the pending MMI object of a slot.
    fn mmi_recv(&mut self, _slot: u8) -> Result<Vec<u8>> {
        Err(TsCastError::Protocol("no CAM attached".to_string()))
    }

    /// Sends an MMI object (menu answer, enquiry reply) to a slot.
    fn mmi_send(&mut self, _slot: u8, _object: &[u8]) -> Result<()> {
        Err(TsCastError::Protocol("no CAM attached".to_string()))
    }
}

/// CA stub that logs the PMT traffic; stands in when no CAM is attached
/// but descrambling coordination still needs exercising.
#[derive(Debug, Default)]
pub struct LogCa;

impl CaSession for LogCa {
    fn add_pmt(&mut self, pmt: &PsiSection) {
        log::debug!("CA add_pmt program {}", pmt.tableidext());
    }

    fn update_pmt(&mut self, pmt: &PsiSection) {
        log::debug!("CA update_pmt program {}", pmt.tableidext());
    }

    fn delete_pmt(&mut self, pmt: &PsiSection) {
        log::debug!("CA delete_pmt program {}", pmt.tableidext());
    }

    fn reset(&mut self) {
        log::debug!("CA reset");
    }
}
