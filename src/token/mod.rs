//! Access to an eID card through its PKCS#11 module.
//!
//! [`EidToken`] ties the pieces together: it binds the module, lists the cards, selects the slot of a card by the
//! key usage of its certificate, logs in, and runs RSA operations with the card's private key.

pub mod api;
pub mod auth;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod objects;
pub mod pin;
pub mod session;
pub mod signer;
pub mod slots;

use std::{fmt, path::Path, sync::Arc};

use cryptoki_sys::CK_OBJECT_CLASS;
use log::{debug, error, info};

pub use self::{
    auth::{PinStatus, PinpadTiming},
    crypto::HashAlgorithm,
    error::{DriverError, TokenError},
    pin::{PinKind, PinPrompt, TokenData, TokenFlags},
    signer::{DigestSigner, TokenKey},
};
use self::{
    api::{ObjectHandle, Pkcs11Api, SlotId},
    driver::DriverBinder,
    session::{Session, SessionSlot},
    slots::SlotList,
};
use crate::{
    cert::{CertInspector, KeyUsage, X509Inspector},
    config::Config,
};

//------------ Selection -----------------------------------------------------

/// Which slot operations go to.
///
/// Dropping a selection closes its session, so replacing the selection is all it takes to invalidate dependent state.
#[derive(Debug, Default)]
enum Selection {
    #[default]
    None,

    /// A slot was selected. Its session may be gone if re-opening it for a login failed.
    Slot { slot: SlotId, sessions: SessionSlot },
}

//------------ EidToken ------------------------------------------------------

/// A client for one eID card at a time.
///
/// All methods take the instance exclusively or are read-only, there is no internal locking. Dropping the instance
/// unloads the module.
pub struct EidToken {
    binder: DriverBinder,
    slots: SlotList,
    selection: Selection,
    inspector: Box<dyn CertInspector>,
    pinpad: PinpadTiming,
}

impl Default for EidToken {
    fn default() -> Self {
        Self::new()
    }
}

impl EidToken {
    pub fn new() -> Self {
        EidToken {
            binder: DriverBinder::default(),
            slots: SlotList::default(),
            selection: Selection::None,
            inspector: Box::new(X509Inspector),
            pinpad: PinpadTiming::default(),
        }
    }

    /// Uses `inspector` instead of the built-in X.509 parser for reading certificates.
    pub fn with_inspector(mut self, inspector: Box<dyn CertInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_pinpad_timing(mut self, timing: PinpadTiming) -> Self {
        self.pinpad = timing;
        self
    }

    /// Creates an instance with the configured module loaded.
    pub fn from_config(config: &Config) -> Result<Self, DriverError> {
        let mut token = EidToken::new().with_pinpad_timing(config.pinpad_timing());
        token.load_driver(&config.driver_path)?;
        Ok(token)
    }

    /// Loads and initializes the PKCS#11 module at `path`. On failure nothing stays loaded.
    pub fn load_driver(&mut self, path: &Path) -> Result<(), DriverError> {
        self.binder.load(path).inspect_err(|err| {
            error!("PKCS#11: Cannot load '{}': {}", path.display(), err);
        })
    }

    /// Uses an already loaded and initialized module.
    pub fn bind(&mut self, api: Arc<dyn Pkcs11Api>) -> Result<(), DriverError> {
        self.binder.bind(api)
    }

    /// Forgets the slots, closes the session, and finalizes and releases the module. Safe to call any time.
    pub fn unload_driver(&mut self) {
        self.selection = Selection::None;
        self.slots.clear();
        self.binder.unload();
    }

    pub fn is_loaded(&self) -> bool {
        self.binder.is_loaded()
    }

    /// Re-reads the slots and returns the serial numbers of the cards in them, distinct and in descending order.
    ///
    /// Returns an empty list if no module is loaded or the slots cannot be listed.
    pub fn cards(&mut self) -> Vec<String> {
        let Some(api) = self.binder.api() else {
            return Vec::new();
        };
        if let Err(err) = self.slots.refresh(api.as_ref()) {
            error!("PKCS#11: C_GetSlotList failed: {}", err);
            return Vec::new();
        }
        slots::card_ids(api.as_ref(), &self.slots)
    }

    /// Selects the first slot of card `card` holding a certificate with key usage `usage`.
    ///
    /// Uses the slots of the last [`cards`](Self::cards) call. Any previous selection is dropped first. If there is
    /// no such slot, nothing is selected and the returned data is empty.
    pub fn select_slot(&mut self, card: &str, usage: KeyUsage) -> TokenData {
        self.selection = Selection::None;
        let Some(api) = self.binder.api() else {
            return TokenData::default();
        };

        let mut sessions = SessionSlot::default();
        match slots::find_card_slot(api, &self.slots, &mut sessions, self.inspector.as_ref(), card, usage) {
            Some((slot, data)) => {
                self.selection = Selection::Slot { slot, sessions };
                data
            }
            None => {
                debug!("PKCS#11: No slot of card {} has a certificate for {}", card, usage);
                TokenData::default()
            }
        }
    }

    pub fn selected_slot(&self) -> Option<SlotId> {
        match self.selection {
            Selection::None => None,
            Selection::Slot { slot, .. } => Some(slot),
        }
    }

    /// Logs in to the selected slot. See [`auth::login`], also for why the future must run to completion.
    pub async fn login(&mut self, prompt: &dyn PinPrompt, token: &TokenData) -> PinStatus {
        let Some(api) = self.binder.api() else {
            return PinStatus::UnknownError;
        };
        let Selection::Slot { slot, sessions } = &mut self.selection else {
            debug!("PKCS#11: Login without selected slot");
            return PinStatus::UnknownError;
        };
        auth::login(api, *slot, sessions, prompt, token, self.pinpad).await
    }

    pub fn logout(&self) -> bool {
        match (self.binder.api(), &self.selection) {
            (Some(api), Selection::Slot { sessions, .. }) => auth::logout(api.as_ref(), sessions),
            _ => false,
        }
    }

    fn session(&self) -> Result<&Session, TokenError> {
        if !self.binder.is_loaded() {
            return Err(TokenError::NotLoaded);
        }
        match &self.selection {
            Selection::Slot { sessions, .. } => sessions.current().ok_or(TokenError::NoSession),
            Selection::None => Err(TokenError::NoSession),
        }
    }

    /// The first object of `class` in the current session.
    pub fn find_object(&self, class: CK_OBJECT_CLASS) -> Option<ObjectHandle> {
        objects::find_object(self.session().ok()?, class)
    }

    pub fn sign(&self, algorithm: HashAlgorithm, digest: &[u8]) -> Result<Vec<u8>, TokenError> {
        crypto::sign(self.session()?, algorithm, digest)
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        self.session()
            .map(|session| crypto::verify(session, data, signature))
            .unwrap_or(false)
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        crypto::encrypt(self.session()?, data)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        crypto::decrypt(self.session()?, data)
    }

    /// The card's key as a signer for crypto code that needs the public key too.
    pub fn key(&self) -> Result<TokenKey<'_>, TokenError> {
        TokenKey::new(self.session()?)
    }
}

impl fmt::Debug for EidToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EidToken")
            .field("binder", &self.binder)
            .field("slots", &self.slots)
            .field("selection", &self.selection)
            .field("pinpad", &self.pinpad)
            .finish()
    }
}

impl Drop for EidToken {
    fn drop(&mut self) {
        if self.is_loaded() {
            info!("PKCS#11: Releasing token client");
        }
        self.unload_driver();
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use cryptoki::error::RvError;
    use cryptoki_sys::{CKO_CERTIFICATE, CKO_PRIVATE_KEY};
    use openssl::{hash::MessageDigest, sign::Verifier, x509::X509};

    use super::*;
    use crate::test::{self, Call, MockPkcs11, RecordingPrompt};

    fn bound(mock: MockPkcs11) -> (Arc<MockPkcs11>, EidToken) {
        test::init_logging();
        let mock = Arc::new(mock);
        let mut token = EidToken::new();
        token.bind(mock.clone()).unwrap();
        (mock, token)
    }

    /// Two cards: one with an authentication and a signing slot, one with just an authentication slot.
    fn two_cards() -> MockPkcs11 {
        MockPkcs11::new()
            .with_card(1, "AB0000001", true)
            .with_card_usage(2, "AB0000001", &[KeyUsage::NonRepudiation])
            .with_card(3, "CD0000002", true)
    }

    #[test]
    fn nothing_works_without_module() {
        let mut token = EidToken::new();
        assert!(token.cards().is_empty());
        assert!(token.select_slot("AB0000001", KeyUsage::DigitalSignature).is_empty());
        assert_eq!(token.sign(HashAlgorithm::Sha256, &[0; 32]), Err(TokenError::NotLoaded));
        assert!(!token.verify(b"data", b"signature"));
        assert!(!token.logout());
    }

    #[test]
    fn from_config_fails_for_missing_module() {
        let config = Config {
            driver_path: PathBuf::from("/nonexistent/libmissing-pkcs11.so"),
            ..Default::default()
        };
        assert!(matches!(EidToken::from_config(&config), Err(DriverError::Load(_))));
    }

    #[test]
    fn cards_are_listed_once() {
        let (_mock, mut token) = bound(two_cards());
        assert_eq!(token.cards(), vec!["CD0000002", "AB0000001"]);
    }

    #[test]
    fn failing_slot_list_gives_no_cards() {
        let (_mock, mut token) = bound(two_cards().failing(Call::GetSlotList, RvError::GeneralError));
        assert!(token.cards().is_empty());
    }

    #[test]
    fn select_by_key_usage() {
        let (mock, mut token) = bound(two_cards());
        token.cards();

        let data = token.select_slot("AB0000001", KeyUsage::NonRepudiation);
        assert_eq!(token.selected_slot(), Some(2));
        assert_eq!(data.card, "AB0000001");
        assert_eq!(data.cert.unwrap().der(), mock.card_certificate(2).as_slice());

        token.select_slot("AB0000001", KeyUsage::DigitalSignature);
        assert_eq!(token.selected_slot(), Some(1));
        assert_eq!(mock.open_sessions(), 1);
        assert!(token.find_object(CKO_CERTIFICATE).is_some());
    }

    #[test]
    fn select_without_match_selects_nothing() {
        let (mock, mut token) = bound(two_cards());
        token.cards();
        token.select_slot("AB0000001", KeyUsage::DigitalSignature);

        for _ in 0..2 {
            let data = token.select_slot("CD0000002", KeyUsage::NonRepudiation);
            assert_eq!(data, TokenData::default());
            assert_eq!(token.selected_slot(), None);
            assert_eq!(mock.open_sessions(), 0);
        }
        assert_eq!(token.sign(HashAlgorithm::Sha256, &[0; 32]), Err(TokenError::NoSession));
        assert!(token.find_object(CKO_PRIVATE_KEY).is_none());
    }

    #[test]
    fn select_without_enumeration_selects_nothing() {
        let (mock, mut token) = bound(two_cards());
        assert_eq!(token.select_slot("AB0000001", KeyUsage::DigitalSignature), TokenData::default());
        assert_eq!(mock.calls(Call::OpenSession), 0);
    }

    #[tokio::test]
    async fn login_without_selection() {
        let (mock, mut token) = bound(two_cards());
        let prompt = RecordingPrompt::answering("1234");

        assert_eq!(token.login(&prompt, &TokenData::default()).await, PinStatus::UnknownError);
        assert_eq!(mock.calls(Call::GetTokenInfo), 0);
    }

    #[tokio::test]
    async fn authenticate_and_sign() {
        let (mock, mut token) = bound(two_cards());
        token.cards();
        let data = token.select_slot("AB0000001", KeyUsage::DigitalSignature);

        assert!(matches!(
            token.sign(HashAlgorithm::Sha256, &[0; 32]),
            Err(TokenError::Pkcs11 {
                error: RvError::UserNotLoggedIn,
                ..
            })
        ));

        let prompt = RecordingPrompt::answering("1234");
        assert_eq!(token.login(&prompt, &data).await, PinStatus::PinOk);
        assert_eq!(prompt.asked_kinds(), vec![PinKind::Pin1]);

        let digest = openssl::hash::hash(MessageDigest::sha256(), b"challenge").unwrap();
        let signature = token.sign(HashAlgorithm::Sha256, &digest).unwrap();

        let cert = X509::from_der(&mock.card_certificate(1)).unwrap();
        let public = cert.public_key().unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), &public).unwrap();
        verifier.update(b"challenge").unwrap();
        assert!(verifier.verify(&signature).unwrap());

        assert!(token.logout());
        assert!(!token.logout());
    }

    #[tokio::test]
    async fn signing_slot_asks_pin2() {
        let (_mock, mut token) = bound(two_cards());
        token.cards();
        let data = token.select_slot("AB0000001", KeyUsage::NonRepudiation);

        let prompt = RecordingPrompt::cancelling();
        assert_eq!(token.login(&prompt, &data).await, PinStatus::PinCanceled);
        assert_eq!(prompt.asked_kinds(), vec![PinKind::Pin2]);
    }

    #[tokio::test]
    async fn pinpad_login_uses_configured_timing() {
        let mock = MockPkcs11::new()
            .with_card(1, "AB0000001", true)
            .with_pinpad(1)
            .with_login_delay(Duration::from_millis(100));
        let (mock, token) = bound(mock);
        let mut token = token.with_pinpad_timing(PinpadTiming {
            timeout: Duration::from_secs(10),
            tick: Duration::from_millis(10),
        });
        token.cards();
        let data = token.select_slot("AB0000001", KeyUsage::DigitalSignature);

        let prompt = RecordingPrompt::answering("1234");
        assert_eq!(token.login(&prompt, &data).await, PinStatus::PinOk);
        assert_eq!(
            *prompt.pinpad.lock().unwrap(),
            vec![(PinKind::Pin1Pinpad, Duration::from_secs(10))]
        );
        assert_eq!(mock.logins(), vec![None]);
    }

    #[tokio::test]
    async fn operations_probe_then_fetch() {
        let (mock, mut token) = bound(two_cards());
        token.cards();
        let data = token.select_slot("AB0000001", KeyUsage::DigitalSignature);
        token.login(&RecordingPrompt::answering("1234"), &data).await;
        let size = Some(mock.card_key(1).size() as usize);

        token.sign(HashAlgorithm::Sha1, &[7; 20]).unwrap();
        let encrypted = token.encrypt(b"payload").unwrap();
        assert_eq!(token.decrypt(&encrypted).unwrap(), b"payload");

        assert_eq!(mock.buffers(Call::Sign), vec![None, size]);
        assert_eq!(mock.buffers(Call::Encrypt), vec![None, size]);
        assert_eq!(mock.buffers(Call::Decrypt), vec![None, size]);
    }

    #[tokio::test]
    async fn failed_probes_stop_operations() {
        let mock = two_cards()
            .failing(Call::Encrypt, RvError::DeviceError)
            .failing(Call::Decrypt, RvError::DeviceError)
            .failing(Call::VerifyInit, RvError::KeyFunctionNotPermitted);
        let (mock, mut token) = bound(mock);
        token.cards();
        let data = token.select_slot("AB0000001", KeyUsage::DigitalSignature);
        token.login(&RecordingPrompt::answering("1234"), &data).await;

        assert!(token.encrypt(b"payload").is_err());
        assert!(token.decrypt(&[0; 128]).is_err());
        assert!(!token.verify(b"payload", &[0; 128]));

        assert_eq!(mock.calls(Call::Encrypt), 1);
        assert_eq!(mock.calls(Call::Decrypt), 1);
        assert_eq!(mock.calls(Call::Verify), 0);
    }

    #[tokio::test]
    async fn failed_operation_frees_session() {
        let mock = two_cards()
            .failing(Call::Decrypt, RvError::DeviceError)
            .failing(Call::Sign, RvError::DeviceError);
        let (mock, mut token) = bound(mock);
        token.cards();
        let data = token.select_slot("AB0000001", KeyUsage::DigitalSignature);
        token.login(&RecordingPrompt::answering("1234"), &data).await;

        assert!(token.sign(HashAlgorithm::Sha256, &[3; 32]).is_err());
        assert!(token.decrypt(&[0; 128]).is_err());

        // Each failed call ended its operation, so the next one can start.
        let encrypted = token.encrypt(b"payload").unwrap();
        assert_eq!(encrypted.len(), mock.card_key(1).size() as usize);
        assert_eq!(mock.calls(Call::SignInit), 1);
        assert_eq!(mock.calls(Call::DecryptInit), 1);
        assert_eq!(mock.calls(Call::EncryptInit), 1);
        assert_eq!(mock.buffers(Call::Encrypt), vec![None, Some(encrypted.len())]);
    }

    #[tokio::test]
    async fn key_adapter_matches_certificate() {
        let (mock, mut token) = bound(two_cards());
        token.cards();
        let data = token.select_slot("AB0000001", KeyUsage::NonRepudiation);
        let prompt = RecordingPrompt::answering("1234");
        token.login(&prompt, &data).await;

        let key = token.key().unwrap();
        let cert = X509::from_der(&mock.card_certificate(2)).unwrap();
        assert!(key.public_key().public_eq(&cert.public_key().unwrap()));

        let digest = [1; 64];
        assert!(key.sign_digest(HashAlgorithm::Sha512, &digest).is_ok());
    }

    #[test]
    fn unload_invalidates_everything() {
        let (mock, mut token) = bound(two_cards());
        token.cards();
        token.select_slot("AB0000001", KeyUsage::DigitalSignature);

        token.unload_driver();
        assert!(!token.is_loaded());
        assert_eq!(token.selected_slot(), None);
        assert_eq!(mock.open_sessions(), 0);
        assert_eq!(mock.calls(Call::Finalize), 1);
        assert!(token.cards().is_empty());

        token.unload_driver();
        assert_eq!(mock.calls(Call::Finalize), 1);
    }

    #[test]
    fn drop_unloads() {
        let (mock, mut token) = bound(two_cards());
        token.cards();
        token.select_slot("AB0000001", KeyUsage::DigitalSignature);
        drop(token);

        assert_eq!(mock.open_sessions(), 0);
        assert_eq!(mock.calls(Call::Finalize), 1);
    }
}
