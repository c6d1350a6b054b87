//! Client side of PKCS#11 eID tokens: find the cards, log in with a PIN, and use the card's private key.
//!
//! ```no_run
//! # async fn run(prompt: &dyn eid_pkcs11::token::PinPrompt) {
//! use eid_pkcs11::{cert::KeyUsage, config::Config, token::{EidToken, HashAlgorithm}};
//!
//! let mut token = EidToken::from_config(&Config::default()).unwrap();
//! for card in token.cards() {
//!     let data = token.select_slot(&card, KeyUsage::NonRepudiation);
//!     if data.is_empty() {
//!         continue;
//!     }
//!     if token.login(prompt, &data).await.is_ok() {
//!         let signature = token.sign(HashAlgorithm::Sha256, &[0; 32]);
//!     }
//! }
//! # }
//! ```

pub mod cert;
pub mod config;
pub mod constants;
pub mod token;
