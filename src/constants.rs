//! Various crate-wide constants.

//------------ Environment Variables -----------------------------------------

/// Overrides the default path of the PKCS#11 module.
pub const EID_ENV_DRIVER: &str = "EID_PKCS11_DRIVER";

/// Overrides the default log level.
pub const EID_ENV_LOG_LEVEL: &str = "EID_PKCS11_LOG_LEVEL";

//------------ Defaults ------------------------------------------------------

/// The OpenSC module, found through the library search path unless an absolute path is configured.
#[cfg(target_os = "windows")]
pub const EID_DEFAULT_DRIVER: &str = "opensc-pkcs11.dll";

#[cfg(target_os = "macos")]
pub const EID_DEFAULT_DRIVER: &str = "/Library/OpenSC/lib/opensc-pkcs11.so";

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const EID_DEFAULT_DRIVER: &str = "opensc-pkcs11.so";

pub const EID_DEFAULT_LOG_FILE: &str = "./eid-pkcs11.log";

/// Seconds the user is given to enter the PIN on a PIN pad reader.
pub const EID_DEFAULT_PINPAD_TIMEOUT: u64 = 30;

/// Milliseconds between countdown updates during PIN pad entry.
pub const EID_DEFAULT_PINPAD_TICK: u64 = 1000;
