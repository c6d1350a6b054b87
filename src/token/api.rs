//! The subset of the PKCS#11 function table used by this crate.
//!
//! Each method corresponds to exactly one `C_*` entry point and keeps its request/response shape. Functions that
//! return variable length output take an `Option<&mut [u8]>`: passing `None` asks the module for the required output
//! length (the "size probe"), passing a buffer asks it to fill the buffer. In both cases the returned `usize` is the
//! length reported by the module.

use cryptoki::error::{Rv, RvError};
use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_MECHANISM_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE,
    CK_SLOT_ID, CK_TOKEN_INFO, CK_USER_TYPE,
};

pub type SlotId = CK_SLOT_ID;
pub type SessionHandle = CK_SESSION_HANDLE;
pub type ObjectHandle = CK_OBJECT_HANDLE;

/// Converts a raw return value into a `Result`.
pub fn check(rv: CK_RV) -> Result<(), RvError> {
    match Rv::from(rv) {
        Rv::Ok => Ok(()),
        Rv::Error(err) => Err(err),
    }
}

/// Runs a variable length output call twice: first without a buffer to learn the output length, then with a buffer
/// of exactly that length. The result is cut to the length reported by the second call.
pub fn fetch_sized<F>(mut call: F) -> Result<Vec<u8>, RvError>
where
    F: FnMut(Option<&mut [u8]>) -> Result<usize, RvError>,
{
    let len = call(None)?;
    let mut out = vec![0; len];
    let len = call(Some(&mut out))?;
    out.truncate(len);
    Ok(out)
}

//------------ TokenInfo -----------------------------------------------------

/// The fields of `CK_TOKEN_INFO` this crate looks at.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TokenInfo {
    pub label: [u8; 32],

    /// Space padded, as returned by the module.
    pub serial_number: [u8; 16],

    pub flags: CK_FLAGS,
}

impl TokenInfo {
    /// The serial number with the blank padding removed.
    pub fn serial(&self) -> String {
        trim_padded(&self.serial_number)
    }

    pub fn label(&self) -> String {
        trim_padded(&self.label)
    }

    pub fn has_flag(&self, flag: CK_FLAGS) -> bool {
        self.flags & flag != 0
    }
}

impl From<&CK_TOKEN_INFO> for TokenInfo {
    fn from(info: &CK_TOKEN_INFO) -> Self {
        TokenInfo {
            label: info.label,
            serial_number: info.serialNumber,
            flags: info.flags,
        }
    }
}

fn trim_padded(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}

//------------ Pkcs11Api -----------------------------------------------------

/// Access to a loaded and initialized PKCS#11 module.
///
/// Implementations must be shareable with the worker thread used for PIN pad logins, hence `Send + Sync`. They are
/// not expected to serialize calls themselves: the caller never has more than one call in flight.
pub trait Pkcs11Api: Send + Sync {
    /// `C_GetSlotList`, including the count/fill round trip.
    fn get_slot_list(&self, token_present: bool) -> Result<Vec<SlotId>, RvError>;

    fn get_token_info(&self, slot: SlotId) -> Result<TokenInfo, RvError>;

    fn open_session(&self, slot: SlotId, flags: CK_FLAGS) -> Result<SessionHandle, RvError>;

    fn close_session(&self, session: SessionHandle) -> Result<(), RvError>;

    /// `C_FindObjectsInit` with a template holding just `CKA_CLASS`.
    fn find_objects_init(&self, session: SessionHandle, class: CK_OBJECT_CLASS) -> Result<(), RvError>;

    fn find_objects(&self, session: SessionHandle, max_count: usize) -> Result<Vec<ObjectHandle>, RvError>;

    fn find_objects_final(&self, session: SessionHandle) -> Result<(), RvError>;

    fn get_attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: CK_ATTRIBUTE_TYPE,
        value: Option<&mut [u8]>,
    ) -> Result<usize, RvError>;

    /// `C_Login`. A `None` pin means the PIN is collected by the device itself.
    fn login(&self, session: SessionHandle, user_type: CK_USER_TYPE, pin: Option<&[u8]>) -> Result<(), RvError>;

    fn logout(&self, session: SessionHandle) -> Result<(), RvError>;

    fn sign_init(&self, session: SessionHandle, mechanism: CK_MECHANISM_TYPE, key: ObjectHandle)
    -> Result<(), RvError>;

    fn sign(&self, session: SessionHandle, data: &[u8], signature: Option<&mut [u8]>) -> Result<usize, RvError>;

    fn verify_init(
        &self,
        session: SessionHandle,
        mechanism: CK_MECHANISM_TYPE,
        key: ObjectHandle,
    ) -> Result<(), RvError>;

    fn verify(&self, session: SessionHandle, data: &[u8], signature: &[u8]) -> Result<(), RvError>;

    fn encrypt_init(
        &self,
        session: SessionHandle,
        mechanism: CK_MECHANISM_TYPE,
        key: ObjectHandle,
    ) -> Result<(), RvError>;

    fn encrypt(&self, session: SessionHandle, data: &[u8], encrypted: Option<&mut [u8]>) -> Result<usize, RvError>;

    fn decrypt_init(
        &self,
        session: SessionHandle,
        mechanism: CK_MECHANISM_TYPE,
        key: ObjectHandle,
    ) -> Result<(), RvError>;

    fn decrypt(&self, session: SessionHandle, encrypted: &[u8], data: Option<&mut [u8]>) -> Result<usize, RvError>;

    /// `C_Finalize`. Called once by the binder when unloading.
    fn finalize(&self) -> Result<(), RvError>;
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use cryptoki_sys::{CKR_OK, CKR_PIN_INCORRECT};

    use super::*;

    #[test]
    fn serial_padding_is_trimmed() {
        let info = TokenInfo {
            serial_number: *b"38001085718     ",
            ..Default::default()
        };
        assert_eq!(info.serial(), "38001085718");
    }

    #[test]
    fn check_maps_return_values() {
        assert!(check(CKR_OK).is_ok());
        assert_eq!(check(CKR_PIN_INCORRECT), Err(RvError::PinIncorrect));
    }
}
