// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verification of RSA signatures produced by `tpmsign`
//!
//! Needs only the public key. No TPM access.

pub mod error;
pub mod signature;

pub use error::VerifyError;
pub use signature::{public_key_fingerprint, public_key_pem, verify_message, verify_signature, Padding};
