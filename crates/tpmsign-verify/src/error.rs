// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("SHA-256 digest must be 32 bytes, got {0}")]
    DigestLength(usize),

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Public key encoding failed: {0}")]
    Encoding(String),
}
