// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types
//!
//! [`TpmError`] is what a single TPM command can fail with. [`Error`] is what a
//! top-level operation (flush, provision, sign) fails with: the step that
//! failed plus the underlying cause.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::rc::ResponseCode;
use crate::{HashAlg, TpmCc};

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single exchange with the TPM
#[derive(Debug, Error)]
pub enum TpmError {
    #[error("TPM transport I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("TPM did not respond before the deadline")]
    Timeout,

    #[error("TPM2_{command:?} failed: {code}")]
    Response { command: TpmCc, code: ResponseCode },

    #[error("malformed TPM data: {0}")]
    Malformed(String),
}

impl TpmError {
    /// The TPM response code, if the TPM itself rejected the command
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            TpmError::Response { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Reasons a signing request is refused
#[derive(Debug, Error)]
pub enum SignError {
    #[error("hash algorithm {0} is not allowed by the signing policy (only sha256)")]
    UnsupportedHash(HashAlg),

    #[error("{hash} digest must be {expected} bytes, got {actual}")]
    DigestLength {
        hash: HashAlg,
        expected: usize,
        actual: usize,
    },

    #[error("TPM signed with scheme 0x{actual:04X}, expected {expected}")]
    UnexpectedScheme {
        expected: crate::SignatureScheme,
        actual: u16,
    },

    #[error("TPM rejected the sign operation")]
    Rejected(#[source] TpmError),

    #[error("software signing failed")]
    Software(#[from] rsa::Error),
}

/// Failure of a top-level operation
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open TPM device {device}")]
    DeviceOpen {
        device: String,
        #[source]
        source: TpmError,
    },

    #[error("failed to enumerate {kind} handles")]
    HandleEnumeration {
        kind: crate::HandleKind,
        #[source]
        source: TpmError,
    },

    #[error("failed to flush handle 0x{handle:08X}")]
    Flush {
        handle: u32,
        #[source]
        source: TpmError,
    },

    #[error("failed to create primary key")]
    Provisioning(#[source] TpmError),

    #[error("failed to create signing key")]
    KeyCreation(#[source] TpmError),

    #[error("failed to load {object}")]
    Load {
        object: &'static str,
        #[source]
        source: TpmError,
    },

    #[error("failed to {op} handle file {}", .path.display())]
    Persist {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error("TPM timed out during {step}")]
    Timeout { step: &'static str },
}

impl Error {
    /// Map a TPM failure at `step` into a top-level error.
    ///
    /// Timeouts always become [`Error::Timeout`]; everything else goes through `wrap`.
    pub(crate) fn tpm<F>(step: &'static str, wrap: F) -> impl FnOnce(TpmError) -> Error
    where
        F: FnOnce(TpmError) -> Error,
    {
        move |e| match e {
            TpmError::Timeout => Error::Timeout { step },
            e => wrap(e),
        }
    }

    /// The TPM response code behind this error, if there is one
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            Error::DeviceOpen { source, .. }
            | Error::HandleEnumeration { source, .. }
            | Error::Flush { source, .. }
            | Error::Provisioning(source)
            | Error::KeyCreation(source)
            | Error::Load { source, .. }
            | Error::Sign(SignError::Rejected(source)) => source.response_code(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rc;

    #[test]
    fn timeouts_bypass_the_wrapper() {
        let err = Error::tpm("load signing key", |source| Error::Load { object: "signing key", source })(
            TpmError::Timeout,
        );
        assert!(matches!(err, Error::Timeout { step: "load signing key" }));
    }

    #[test]
    fn response_code_is_reachable_from_top_level() {
        let source = TpmError::Response {
            command: TpmCc::ContextLoad,
            code: ResponseCode(rc::parameter(rc::INTEGRITY, 1)),
        };
        let err = Error::Load { object: "signing key", source };
        assert!(err.response_code().unwrap().is(rc::INTEGRITY));
        assert_eq!(
            std::error::Error::source(&err).unwrap().to_string(),
            "TPM2_ContextLoad failed: TPM_RC_INTEGRITY (parameter 1, 0x000001DF)"
        );
    }
}
