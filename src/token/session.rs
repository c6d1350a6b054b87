use std::{fmt, sync::Arc};

use cryptoki::error::RvError;
use cryptoki_sys::CKF_SERIAL_SESSION;
use log::{trace, warn};

use super::api::{Pkcs11Api, SessionHandle, SlotId};

/// An open session against the token in one slot.
///
/// The session is closed when dropped. Logging out is not tracked: closing the last session returns the token to the
/// public (not logged in) state anyway.
pub struct Session {
    api: Arc<dyn Pkcs11Api>,

    slot: SlotId,

    handle: SessionHandle,
}

impl Session {
    pub fn open(api: Arc<dyn Pkcs11Api>, slot: SlotId) -> Result<Self, RvError> {
        // PKCS#11 v2.20: "For legacy reasons, the CKF_SERIAL_SESSION bit must always be set"
        let handle = api.open_session(slot, CKF_SERIAL_SESSION)?;
        trace!("PKCS#11: Opened session {} on slot {}", handle, slot);
        Ok(Session { api, slot, handle })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn api(&self) -> &Arc<dyn Pkcs11Api> {
        &self.api
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("slot", &self.slot)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        trace!("PKCS#11: Closing session {}", self.handle);
        if let Err(err) = self.api.close_session(self.handle) {
            warn!("PKCS#11: Close session failed: {}", err);
        }
    }
}

//------------ SessionSlot ---------------------------------------------------

/// Holds the at most one open session of an instance.
#[derive(Debug, Default)]
pub struct SessionSlot {
    current: Option<Session>,
}

impl SessionSlot {
    /// Opens a session on `slot`, closing the current one first even if opening the new one fails.
    pub fn reopen(&mut self, api: &Arc<dyn Pkcs11Api>, slot: SlotId) -> Result<&Session, RvError> {
        self.close();
        let session = Session::open(api.clone(), slot)?;
        Ok(self.current.insert(session))
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn close(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{Call, MockPkcs11};

    #[test]
    fn reopen_closes_previous_session() {
        let mock = Arc::new(MockPkcs11::new().with_card(1, "AB0000001", true));
        let api: Arc<dyn Pkcs11Api> = mock.clone();

        let mut sessions = SessionSlot::default();
        let first = sessions.reopen(&api, 1).unwrap().handle();
        let second = sessions.reopen(&api, 1).unwrap().handle();

        assert_ne!(first, second);
        assert_eq!(mock.calls(Call::CloseSession), 1);
        assert_eq!(mock.open_sessions(), 1);

        sessions.close();
        assert_eq!(mock.open_sessions(), 0);
    }

    #[test]
    fn failed_open_leaves_no_session() {
        let mock = Arc::new(MockPkcs11::new().with_card(1, "AB0000001", true));
        let api: Arc<dyn Pkcs11Api> = mock.clone();

        let mut sessions = SessionSlot::default();
        sessions.reopen(&api, 1).unwrap();
        assert_eq!(sessions.reopen(&api, 7).unwrap_err(), RvError::SlotIdInvalid);
        assert!(sessions.current().is_none());
        assert_eq!(mock.open_sessions(), 0);
    }
}
