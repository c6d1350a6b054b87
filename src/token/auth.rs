//! Logging in to the token, with the PIN typed on the host or on the pad of the card reader.

use std::{fmt, sync::Arc, time::Duration};

use cryptoki::error::RvError;
use cryptoki_sys::{CKF_LOGIN_REQUIRED, CKF_PROTECTED_AUTHENTICATION_PATH, CKU_USER};
use log::{debug, info, trace, warn};
use secrecy::ExposeSecret;
use tokio::{
    task::{JoinError, JoinHandle},
    time::{self, Instant},
};

use super::{
    api::{Pkcs11Api, SessionHandle, SlotId},
    pin::{PinKind, PinPrompt, TokenData, TokenFlags},
    session::SessionSlot,
};

//------------ PinStatus -----------------------------------------------------

/// The outcome of a login attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PinStatus {
    PinOk,
    PinCanceled,
    PinIncorrect,
    PinLocked,
    DeviceError,
    GeneralError,
    UnknownError,
}

impl PinStatus {
    pub fn is_ok(self) -> bool {
        self == PinStatus::PinOk
    }
}

impl From<Result<(), RvError>> for PinStatus {
    fn from(res: Result<(), RvError>) -> Self {
        match res {
            Ok(()) | Err(RvError::UserAlreadyLoggedIn) => PinStatus::PinOk,
            Err(RvError::Cancel) | Err(RvError::FunctionCanceled) => PinStatus::PinCanceled,
            Err(RvError::PinIncorrect) => PinStatus::PinIncorrect,
            Err(RvError::PinLocked) => PinStatus::PinLocked,
            Err(RvError::DeviceError) => PinStatus::DeviceError,
            Err(RvError::GeneralError) => PinStatus::GeneralError,
            Err(_) => PinStatus::UnknownError,
        }
    }
}

/// The message shown to the user. Empty for a successful login.
impl fmt::Display for PinStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            PinStatus::PinOk => "",
            PinStatus::PinCanceled => "PIN Canceled",
            PinStatus::PinLocked => "PIN locked",
            PinStatus::PinIncorrect => "PIN Incorrect",
            PinStatus::GeneralError => "PKCS11 general error",
            PinStatus::DeviceError => "PKCS11 device error",
            PinStatus::UnknownError => "PKCS11 unknown error",
        };
        f.write_str(s)
    }
}

//------------ PinpadTiming --------------------------------------------------

/// What the user is shown while the reader waits for the PIN.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PinpadTiming {
    /// The countdown start. Only displayed, the reader enforces its own timeout.
    pub timeout: Duration,

    /// Interval of [`PinPrompt::pinpad_tick`] calls.
    pub tick: Duration,
}

impl Default for PinpadTiming {
    fn default() -> Self {
        PinpadTiming {
            timeout: Duration::from_secs(30),
            tick: Duration::from_secs(1),
        }
    }
}

//------------ PinpadLogin ---------------------------------------------------

/// A `C_Login` blocked on the reader's PIN pad, running on the blocking thread pool.
///
/// The call cannot be aborted from the host, it returns when the user entered the PIN, cancelled on the reader, or
/// the reader timed out. So all this offers is waiting for it.
struct PinpadLogin {
    handle: JoinHandle<Result<(), RvError>>,
}

impl PinpadLogin {
    fn spawn(api: Arc<dyn Pkcs11Api>, session: SessionHandle) -> Self {
        let handle = tokio::task::spawn_blocking(move || api.login(session, CKU_USER, None));
        PinpadLogin { handle }
    }

    async fn join(self) -> Result<Result<(), RvError>, JoinError> {
        self.handle.await
    }
}

//------------ login ---------------------------------------------------------

/// Logs the user in to the token in `slot`, asking `prompt` for the PIN if needed.
///
/// A new session is opened on the slot for the login, replacing the current one. PIN pad logins run on a blocking
/// worker thread, which requires a Tokio runtime; meanwhile the prompt is ticked every `timing.tick`.
///
/// The returned future must be awaited to completion. Dropping it, for instance under `tokio::time::timeout`, leaves
/// a PIN pad `C_Login` running on the worker against a session that may be closed or reused meanwhile.
pub async fn login(
    api: &Arc<dyn Pkcs11Api>,
    slot: SlotId,
    sessions: &mut SessionSlot,
    prompt: &dyn PinPrompt,
    token: &TokenData,
    timing: PinpadTiming,
) -> PinStatus {
    let info = match api.get_token_info(slot) {
        Ok(info) => info,
        Err(err) => {
            warn!("PKCS#11: Cannot read token info of slot {}: {}", slot, err);
            return PinStatus::UnknownError;
        }
    };
    if !info.has_flag(CKF_LOGIN_REQUIRED) {
        debug!("PKCS#11: Token in slot {} needs no login", slot);
        return PinStatus::PinOk;
    }

    let mut token = token.clone();
    token.flags.merge(TokenFlags::from_token_flags(info.flags));

    let session = match sessions.reopen(api, slot) {
        Ok(session) => session.handle(),
        Err(err) => {
            warn!("PKCS#11: Unable to open session on slot {} for login: {}", slot, err);
            return PinStatus::UnknownError;
        }
    };

    let pin2 = token.cert.as_ref().is_some_and(|cert| cert.is_signing_certificate());
    let kind = PinKind::new(pin2, info.has_flag(CKF_PROTECTED_AUTHENTICATION_PATH));
    trace!("PKCS#11: Logging in to slot {} with {}, pin pad: {}", slot, kind, kind.is_pinpad());

    let status = if kind.is_pinpad() {
        pinpad_login(api, session, prompt, &token, kind, timing).await
    } else {
        let Some(pin) = prompt.ask_pin(kind, &token) else {
            debug!("PKCS#11: {} entry cancelled", kind);
            return PinStatus::PinCanceled;
        };
        // The secret is wiped when `pin` goes out of scope at the end of this block.
        PinStatus::from(api.login(session, CKU_USER, Some(pin.expose_secret().as_bytes())))
    };

    match status {
        PinStatus::PinOk => info!("PKCS#11: Logged in to card {} with {}", token.card, kind),
        status => warn!("PKCS#11: {} login to card {} failed: {:?}", kind, token.card, status),
    }
    status
}

async fn pinpad_login(
    api: &Arc<dyn Pkcs11Api>,
    session: SessionHandle,
    prompt: &dyn PinPrompt,
    token: &TokenData,
    kind: PinKind,
    timing: PinpadTiming,
) -> PinStatus {
    let worker = PinpadLogin::spawn(api.clone(), session);
    prompt.pinpad_started(kind, token, timing.timeout);

    // interval() panics on a zero period
    let period = timing.tick.max(Duration::from_millis(1));
    let started = Instant::now();
    let mut ticks = time::interval_at(started + period, period);
    let join = worker.join();
    tokio::pin!(join);

    let res = loop {
        tokio::select! {
            res = &mut join => break res,
            _ = ticks.tick() => prompt.pinpad_tick(started.elapsed()),
        }
    };
    prompt.pinpad_finished();

    match res {
        Ok(res) => PinStatus::from(res),
        Err(err) => {
            warn!("PKCS#11: Pin pad login worker failed: {}", err);
            PinStatus::UnknownError
        }
    }
}

/// Ends the login state of the token. Returns whether the module reported success.
pub fn logout(api: &dyn Pkcs11Api, sessions: &SessionSlot) -> bool {
    let Some(session) = sessions.current() else {
        debug!("PKCS#11: Logout without session");
        return false;
    };
    match api.logout(session.handle()) {
        Ok(()) => {
            debug!("PKCS#11: Logged out of slot {}", session.slot());
            true
        }
        Err(err) => {
            warn!("PKCS#11: C_Logout failed: {}", err);
            false
        }
    }
}

//------------ Tests ---------------------------------------------------------
