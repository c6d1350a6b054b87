//! Certificate inspection: just enough X.509 to tell which key usages a token certificate declares.

use std::{collections::BTreeSet, fmt};

use log::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

//------------ KeyUsage ------------------------------------------------------

/// The purposes of the RFC 5280 key usage extension.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyUsage {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertificateSign,
    CrlSign,
    EncipherOnly,
    DecipherOnly,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            KeyUsage::DigitalSignature => "digitalSignature",
            KeyUsage::NonRepudiation => "nonRepudiation",
            KeyUsage::KeyEncipherment => "keyEncipherment",
            KeyUsage::DataEncipherment => "dataEncipherment",
            KeyUsage::KeyAgreement => "keyAgreement",
            KeyUsage::KeyCertificateSign => "keyCertSign",
            KeyUsage::CrlSign => "cRLSign",
            KeyUsage::EncipherOnly => "encipherOnly",
            KeyUsage::DecipherOnly => "decipherOnly",
        };
        f.write_str(s)
    }
}

//------------ Certificate ---------------------------------------------------

/// A token certificate together with what was learned from it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Certificate {
    der: Vec<u8>,
    subject: String,
    key_usage: BTreeSet<KeyUsage>,
}

impl Certificate {
    pub fn new(der: Vec<u8>, subject: String, key_usage: BTreeSet<KeyUsage>) -> Self {
        Certificate {
            der,
            subject,
            key_usage,
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn key_usage(&self) -> &BTreeSet<KeyUsage> {
        &self.key_usage
    }

    pub fn has_key_usage(&self, usage: KeyUsage) -> bool {
        self.key_usage.contains(&usage)
    }

    /// Whether the key is meant for qualified signatures, which are guarded by the second PIN.
    pub fn is_signing_certificate(&self) -> bool {
        self.has_key_usage(KeyUsage::NonRepudiation)
    }
}

//------------ CertInspector -------------------------------------------------

/// Turns DER certificate bytes into a [`Certificate`].
///
/// Returns `None` if the bytes cannot be parsed; callers treat that like a certificate without the wanted key usage.
pub trait CertInspector: Send + Sync {
    fn inspect(&self, der: &[u8]) -> Option<Certificate>;
}

/// The default inspector, backed by `x509-parser`.
#[derive(Clone, Copy, Debug, Default)]
pub struct X509Inspector;

impl CertInspector for X509Inspector {
    fn inspect(&self, der: &[u8]) -> Option<Certificate> {
        let (_, cert) = match X509Certificate::from_der(der) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("Cannot parse token certificate: {}", err);
                return None;
            }
        };

        let subject = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| cert.subject().to_string());

        let mut key_usage = BTreeSet::new();
        match cert.key_usage() {
            Ok(Some(ext)) => {
                let ku = ext.value;
                let flags = [
                    (ku.digital_signature(), KeyUsage::DigitalSignature),
                    (ku.non_repudiation(), KeyUsage::NonRepudiation),
                    (ku.key_encipherment(), KeyUsage::KeyEncipherment),
                    (ku.data_encipherment(), KeyUsage::DataEncipherment),
                    (ku.key_agreement(), KeyUsage::KeyAgreement),
                    (ku.key_cert_sign(), KeyUsage::KeyCertificateSign),
                    (ku.crl_sign(), KeyUsage::CrlSign),
                    (ku.encipher_only(), KeyUsage::EncipherOnly),
                    (ku.decipher_only(), KeyUsage::DecipherOnly),
                ];
                key_usage.extend(flags.into_iter().filter(|(set, _)| *set).map(|(_, usage)| usage));
            }
            Ok(None) => {}
            Err(err) => debug!("Cannot read key usage of '{}': {}", subject, err),
        }

        Some(Certificate::new(der.to_vec(), subject, key_usage))
    }
}
