use cryptoki_sys::{CK_ATTRIBUTE_TYPE, CK_INVALID_HANDLE, CK_OBJECT_CLASS, CKA_VALUE, CKO_CERTIFICATE};
use log::{trace, warn};

use super::{
    api::{ObjectHandle, fetch_sized},
    error::TokenError,
    session::Session,
};

/// Finds the first object of the given class in the session.
///
/// Only one result is fetched even if the token holds more. Returns `None` if there is none or the search fails.
pub fn find_object(session: &Session, class: CK_OBJECT_CLASS) -> Option<ObjectHandle> {
    let api = session.api();
    let handle = session.handle();

    if let Err(err) = api.find_objects_init(handle, class) {
        warn!("PKCS#11: C_FindObjectsInit for class {} failed: {}", class, err);
        return None;
    }
    // A session can only have one active search, always finalize before reporting the outcome.
    let found = api.find_objects(handle, 1);
    if let Err(err) = api.find_objects_final(handle) {
        warn!("PKCS#11: C_FindObjectsFinal failed: {}", err);
    }

    match found {
        Ok(objects) => {
            let object = objects.first().copied().filter(|&o| o != CK_INVALID_HANDLE);
            trace!("PKCS#11: Object of class {}: {:?}", class, object);
            object
        }
        Err(err) => {
            warn!("PKCS#11: C_FindObjects for class {} failed: {}", class, err);
            None
        }
    }
}

/// Reads an attribute value: first asks for its length, then fetches it into a buffer of exactly that length.
pub fn read_attribute(
    session: &Session,
    object: ObjectHandle,
    attribute: CK_ATTRIBUTE_TYPE,
) -> Result<Vec<u8>, TokenError> {
    fetch_sized(|value| {
        session
            .api()
            .get_attribute_value(session.handle(), object, attribute, value)
    })
    .map_err(TokenError::pkcs11("C_GetAttributeValue"))
}

/// The DER bytes of the first certificate on the token.
pub fn read_certificate(session: &Session) -> Option<Vec<u8>> {
    let object = find_object(session, CKO_CERTIFICATE)?;
    match read_attribute(session, object, CKA_VALUE) {
        Ok(der) if !der.is_empty() => Some(der),
        Ok(_) => None,
        Err(err) => {
            warn!("PKCS#11: Cannot read certificate: {}", err);
            None
        }
    }
}
