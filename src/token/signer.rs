//! The token key as a signing capability for crypto layers that work with public keys and digests.

use std::fmt;

use cryptoki_sys::{CKA_MODULUS, CKA_PUBLIC_EXPONENT, CKO_PRIVATE_KEY};
use log::debug;
use openssl::{
    bn::BigNum,
    pkey::{PKey, Public},
    rsa::Rsa,
};

use super::{
    crypto::{self, HashAlgorithm},
    error::TokenError,
    objects,
    session::Session,
};

/// Something that signs digests with a key whose public half it can hand out.
pub trait DigestSigner {
    fn public_key(&self) -> &PKey<Public>;

    /// Signs a digest made with `algorithm`, PKCS#1 v1.5 style.
    fn sign_digest(&self, algorithm: HashAlgorithm, digest: &[u8]) -> Result<Vec<u8>, TokenError>;
}

//------------ TokenKey ------------------------------------------------------

/// The private key of the selected token, usable while its session stays open.
pub struct TokenKey<'a> {
    session: &'a Session,
    public_key: PKey<Public>,
}

impl<'a> TokenKey<'a> {
    /// Reads the public components of the first private key object of the session.
    pub fn new(session: &'a Session) -> Result<Self, TokenError> {
        let key = objects::find_object(session, CKO_PRIVATE_KEY).ok_or(TokenError::ObjectNotFound)?;
        let modulus = objects::read_attribute(session, key, CKA_MODULUS)?;
        let exponent = objects::read_attribute(session, key, CKA_PUBLIC_EXPONENT)?;

        let rsa = Rsa::from_public_components(BigNum::from_slice(&modulus)?, BigNum::from_slice(&exponent)?)?;
        debug!("PKCS#11: Token key is RSA-{}", rsa.size() * 8);
        let public_key = PKey::from_rsa(rsa)?;
        Ok(TokenKey { session, public_key })
    }
}

impl DigestSigner for TokenKey<'_> {
    fn public_key(&self) -> &PKey<Public> {
        &self.public_key
    }

    fn sign_digest(&self, algorithm: HashAlgorithm, digest: &[u8]) -> Result<Vec<u8>, TokenError> {
        if let Some(expected) = algorithm.digest_len() {
            if expected != digest.len() {
                return Err(TokenError::DigestLength {
                    expected,
                    actual: digest.len(),
                });
            }
        }
        crypto::sign(self.session, algorithm, digest)
    }
}

impl fmt::Debug for TokenKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenKey")
            .field("session", self.session)
            .field("bits", &self.public_key.bits())
            .finish()
    }
}
