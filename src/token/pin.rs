//! The contract with the PIN entry user interface.

use std::{fmt, time::Duration};

use cryptoki_sys::{
    CK_FLAGS, CKF_SO_PIN_COUNT_LOW, CKF_SO_PIN_FINAL_TRY, CKF_SO_PIN_LOCKED, CKF_USER_PIN_COUNT_LOW,
    CKF_USER_PIN_FINAL_TRY, CKF_USER_PIN_LOCKED,
};
use secrecy::SecretString;

use crate::cert::Certificate;

//------------ PinKind -------------------------------------------------------

/// Which PIN is asked for and how it is entered.
///
/// PIN1 guards the authentication key, PIN2 the key used for qualified (non-repudiation) signatures. The distinction
/// only changes what the user is shown, the login call is the same.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PinKind {
    Pin1,
    Pin2,
    Pin1Pinpad,
    Pin2Pinpad,
}

impl PinKind {
    pub fn new(pin2: bool, pinpad: bool) -> Self {
        match (pin2, pinpad) {
            (false, false) => PinKind::Pin1,
            (true, false) => PinKind::Pin2,
            (false, true) => PinKind::Pin1Pinpad,
            (true, true) => PinKind::Pin2Pinpad,
        }
    }

    pub fn is_pin2(self) -> bool {
        matches!(self, PinKind::Pin2 | PinKind::Pin2Pinpad)
    }

    pub fn is_pinpad(self) -> bool {
        matches!(self, PinKind::Pin1Pinpad | PinKind::Pin2Pinpad)
    }
}

impl fmt::Display for PinKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_pin2() { f.write_str("PIN2") } else { f.write_str("PIN1") }
    }
}

//------------ TokenFlags ----------------------------------------------------

/// PIN retry state of a token, as far as the user needs to be warned about it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TokenFlags {
    pub pin_count_low: bool,
    pub pin_final_try: bool,
    pub pin_locked: bool,
}

impl TokenFlags {
    /// Derives the flags from `CK_TOKEN_INFO.flags`, treating SO and user PIN state alike.
    pub fn from_token_flags(flags: CK_FLAGS) -> Self {
        let any = |so: CK_FLAGS, user: CK_FLAGS| flags & (so | user) != 0;
        TokenFlags {
            pin_count_low: any(CKF_SO_PIN_COUNT_LOW, CKF_USER_PIN_COUNT_LOW),
            pin_final_try: any(CKF_SO_PIN_FINAL_TRY, CKF_USER_PIN_FINAL_TRY),
            pin_locked: any(CKF_SO_PIN_LOCKED, CKF_USER_PIN_LOCKED),
        }
    }

    /// Adds the flags set in `other`.
    pub fn merge(&mut self, other: TokenFlags) {
        self.pin_count_low |= other.pin_count_low;
        self.pin_final_try |= other.pin_final_try;
        self.pin_locked |= other.pin_locked;
    }
}

//------------ TokenData -----------------------------------------------------

/// What is known about the selected card. Built fresh by every selection or login, never cached.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TokenData {
    pub card: String,
    pub cert: Option<Certificate>,
    pub flags: TokenFlags,
}

impl TokenData {
    pub fn for_card(card: &str) -> Self {
        TokenData {
            card: card.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cert.is_none()
    }
}

//------------ PinPrompt -----------------------------------------------------

/// The PIN entry dialog of the host application.
///
/// During a PIN pad login the ticks arrive while the login call runs on another thread.
pub trait PinPrompt: Sync {
    /// Asks the user to type a PIN. Returns `None` if the user cancelled.
    fn ask_pin(&self, kind: PinKind, token: &TokenData) -> Option<SecretString>;

    /// PIN entry has moved to the pad of the card reader. Nothing secret is collected by the host. The `timeout` is
    /// what the reader is expected to wait for, for showing a countdown.
    fn pinpad_started(&self, kind: PinKind, token: &TokenData, timeout: Duration);

    /// Called periodically while the reader waits for the PIN.
    fn pinpad_tick(&self, _elapsed: Duration) {}

    /// The reader returned, whatever the outcome.
    fn pinpad_finished(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_from_so_or_user_bits() {
        let flags = TokenFlags::from_token_flags(CKF_USER_PIN_COUNT_LOW | CKF_SO_PIN_LOCKED);
        assert!(flags.pin_count_low);
        assert!(!flags.pin_final_try);
        assert!(flags.pin_locked);

        assert_eq!(TokenFlags::from_token_flags(0), TokenFlags::default());
    }

    #[test]
    fn pin_kind() {
        assert_eq!(PinKind::new(true, true), PinKind::Pin2Pinpad);
        assert!(PinKind::Pin1Pinpad.is_pinpad());
        assert!(!PinKind::Pin1Pinpad.is_pin2());
        assert_eq!(PinKind::Pin2.to_string(), "PIN2");
    }
}
