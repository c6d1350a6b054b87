//! RSA PKCS#1 v1.5 operations with the private key of the token.
//!
//! Every operation looks up the first private key object of the session, starts the operation with `CKM_RSA_PKCS`
//! on it, and, where the result has a variable length, asks the module for the length before fetching the result.

use std::fmt;

use cryptoki_sys::{CKM_RSA_PKCS, CKO_PRIVATE_KEY};
use log::{debug, trace, warn};
use openssl::nid::Nid;

use super::{
    api::{ObjectHandle, fetch_sized},
    error::TokenError,
    objects,
    session::Session,
};

//------------ HashAlgorithm -------------------------------------------------

/// The hash algorithm a digest passed to [`sign`] was made with.
///
/// The token does raw PKCS#1 v1.5 signing, so the ASN.1 `DigestInfo` header naming the algorithm has to be put in
/// front of the digest by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,

    /// The concatenated MD5 and SHA-1 digests of TLS 1.0/1.1 client authentication. Signed without a header.
    Md5Sha1,

    /// Anything else. Signed without a header, the digest is expected to already carry one.
    Other,
}

const SHA1_PREFIX: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];
const SHA224_PREFIX: [u8; 19] = [
    0x30, 0x2d, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x04, 0x05, 0x00, 0x04, 0x1c,
];
const SHA256_PREFIX: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00, 0x04, 0x20,
];
const SHA384_PREFIX: [u8; 19] = [
    0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05, 0x00, 0x04, 0x30,
];
const SHA512_PREFIX: [u8; 19] = [
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05, 0x00, 0x04, 0x40,
];

impl HashAlgorithm {
    /// The DER `DigestInfo` header up to and including the length octet of the digest.
    pub fn digest_info_prefix(self) -> &'static [u8] {
        match self {
            HashAlgorithm::Sha1 => &SHA1_PREFIX,
            HashAlgorithm::Sha224 => &SHA224_PREFIX,
            HashAlgorithm::Sha256 => &SHA256_PREFIX,
            HashAlgorithm::Sha384 => &SHA384_PREFIX,
            HashAlgorithm::Sha512 => &SHA512_PREFIX,
            HashAlgorithm::Md5Sha1 | HashAlgorithm::Other => &[],
        }
    }

    /// The length of a digest, if known.
    pub fn digest_len(self) -> Option<usize> {
        match self {
            HashAlgorithm::Sha1 => Some(20),
            HashAlgorithm::Sha224 => Some(28),
            HashAlgorithm::Sha256 => Some(32),
            HashAlgorithm::Sha384 => Some(48),
            HashAlgorithm::Sha512 => Some(64),
            HashAlgorithm::Md5Sha1 => Some(36),
            HashAlgorithm::Other => None,
        }
    }

    pub fn from_nid(nid: Nid) -> Self {
        match nid {
            Nid::SHA1 => HashAlgorithm::Sha1,
            Nid::SHA224 => HashAlgorithm::Sha224,
            Nid::SHA256 => HashAlgorithm::Sha256,
            Nid::SHA384 => HashAlgorithm::Sha384,
            Nid::SHA512 => HashAlgorithm::Sha512,
            Nid::MD5_SHA1 => HashAlgorithm::Md5Sha1,
            _ => HashAlgorithm::Other,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha224 => "SHA-224",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha384 => "SHA-384",
            HashAlgorithm::Sha512 => "SHA-512",
            HashAlgorithm::Md5Sha1 => "MD5+SHA-1",
            HashAlgorithm::Other => "other",
        };
        f.write_str(s)
    }
}

//------------ Operations ----------------------------------------------------

fn private_key(session: &Session) -> Result<ObjectHandle, TokenError> {
    objects::find_object(session, CKO_PRIVATE_KEY).ok_or(TokenError::ObjectNotFound)
}

/// Signs `digest` after prefixing it with the `DigestInfo` header of `algorithm`.
pub fn sign(session: &Session, algorithm: HashAlgorithm, digest: &[u8]) -> Result<Vec<u8>, TokenError> {
    let key = private_key(session)?;
    let api = session.api();
    let handle = session.handle();

    let mut data = Vec::with_capacity(algorithm.digest_info_prefix().len() + digest.len());
    data.extend_from_slice(algorithm.digest_info_prefix());
    data.extend_from_slice(digest);
    trace!("PKCS#11: Signing {}", hex::encode(&data));

    api.sign_init(handle, CKM_RSA_PKCS, key)
        .map_err(TokenError::pkcs11("C_SignInit"))?;
    let signature =
        fetch_sized(|signature| api.sign(handle, &data, signature)).map_err(TokenError::pkcs11("C_Sign"))?;
    debug!("PKCS#11: Signed {} digest, {} byte signature", algorithm, signature.len());
    Ok(signature)
}

/// Checks `signature` over `data` on the token.
///
/// The key passed to `C_VerifyInit` is the private key object, as with the other operations. Modules that only
/// accept public keys for verification report every signature as invalid.
pub fn verify(session: &Session, data: &[u8], signature: &[u8]) -> bool {
    let key = match private_key(session) {
        Ok(key) => key,
        Err(err) => {
            warn!("PKCS#11: Cannot verify: {}", err);
            return false;
        }
    };
    let api = session.api();
    let handle = session.handle();

    if let Err(err) = api.verify_init(handle, CKM_RSA_PKCS, key) {
        warn!("PKCS#11: C_VerifyInit failed: {}", err);
        return false;
    }
    match api.verify(handle, data, signature) {
        Ok(()) => true,
        Err(err) => {
            trace!("PKCS#11: C_Verify: {}", err);
            false
        }
    }
}

pub fn encrypt(session: &Session, data: &[u8]) -> Result<Vec<u8>, TokenError> {
    let key = private_key(session)?;
    let api = session.api();
    let handle = session.handle();

    api.encrypt_init(handle, CKM_RSA_PKCS, key)
        .map_err(TokenError::pkcs11("C_EncryptInit"))?;
    fetch_sized(|encrypted| api.encrypt(handle, data, encrypted)).map_err(TokenError::pkcs11("C_Encrypt"))
}

/// Decrypts `data`. The result is cut to the length reported when fetching it, which may be shorter than what was
/// announced by the size probe.
pub fn decrypt(session: &Session, data: &[u8]) -> Result<Vec<u8>, TokenError> {
    let key = private_key(session)?;
    let api = session.api();
    let handle = session.handle();

    api.decrypt_init(handle, CKM_RSA_PKCS, key)
        .map_err(TokenError::pkcs11("C_DecryptInit"))?;
    fetch_sized(|decrypted| api.decrypt(handle, data, decrypted)).map_err(TokenError::pkcs11("C_Decrypt"))
}

//------------ Tests ---------------------------------------------------------
