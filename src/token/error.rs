use std::fmt;

use cryptoki::error::RvError;

//------------ DriverError ---------------------------------------------------

/// Why a PKCS#11 module could not be bound.
#[derive(Debug)]
pub enum DriverError {
    Load(libloading::Error),
    MissingEntryPoint(libloading::Error),
    FunctionList(RvError),
    Initialize(RvError),
    AlreadyLoaded,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DriverError::Load(e) => write!(f, "Failed to load PKCS#11 module: {}", e),
            DriverError::MissingEntryPoint(e) => write!(f, "PKCS#11 module has no C_GetFunctionList: {}", e),
            DriverError::FunctionList(e) => write!(f, "C_GetFunctionList failed: {}", e),
            DriverError::Initialize(e) => write!(f, "C_Initialize failed: {}", e),
            DriverError::AlreadyLoaded => write!(f, "A PKCS#11 module is already loaded"),
        }
    }
}

impl std::error::Error for DriverError {}

//------------ TokenError ----------------------------------------------------

#[derive(Debug, Eq, PartialEq)]
pub enum TokenError {
    NotLoaded,
    NoSession,
    ObjectNotFound,
    Pkcs11 { function: &'static str, error: RvError },
    DigestLength { expected: usize, actual: usize },
    PublicKey(String),
}

impl TokenError {
    pub fn pkcs11(function: &'static str) -> impl FnOnce(RvError) -> TokenError {
        move |error| TokenError::Pkcs11 { function, error }
    }
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenError::NotLoaded => write!(f, "No PKCS#11 module loaded"),
            TokenError::NoSession => write!(f, "No open session"),
            TokenError::ObjectNotFound => write!(f, "Object not found"),
            TokenError::Pkcs11 { function, error } => write!(f, "{} failed: {}", function, error),
            TokenError::DigestLength { expected, actual } => {
                write!(f, "Digest has {} bytes, expected {}", actual, expected)
            }
            TokenError::PublicKey(e) => write!(f, "Invalid public key on token: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<openssl::error::ErrorStack> for TokenError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        TokenError::PublicKey(e.to_string())
    }
}
