// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime configuration
//!
//! Built once at startup and passed by reference to the provisioner and signer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::handles::FlushScope;
use crate::object::PcrSelection;
use crate::{HashAlg, TpmAlg, DEFAULT_DEVICE};

/// RSA signature scheme used for both the key template and each sign call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    /// RSASSA-PKCS1-v1_5
    #[default]
    RsaSsa,
    /// RSASSA-PSS
    RsaPss,
}

impl SignatureScheme {
    pub fn tpm_alg(&self) -> TpmAlg {
        match self {
            SignatureScheme::RsaSsa => TpmAlg::RsaSsa,
            SignatureScheme::RsaPss => TpmAlg::RsaPss,
        }
    }

    pub fn from_tpm_alg(alg: TpmAlg) -> Option<Self> {
        match alg {
            TpmAlg::RsaSsa => Some(SignatureScheme::RsaSsa),
            TpmAlg::RsaPss => Some(SignatureScheme::RsaPss),
            _ => None,
        }
    }
}

impl FromStr for SignatureScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsassa" | "pkcs1v15" => Ok(SignatureScheme::RsaSsa),
            "rsapss" | "pss" => Ok(SignatureScheme::RsaPss),
            other => Err(format!("unknown signature scheme '{}' (expected rsassa or rsapss)", other)),
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tpm_alg().name())
    }
}

/// Parameters of the key hierarchy created by the provisioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPolicy {
    /// PCRs recorded in the creation data of both keys
    pub pcr_selection: PcrSelection,
    pub primary_key_bits: u16,
    pub signing_key_bits: u16,
    pub scheme: SignatureScheme,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            pcr_selection: PcrSelection::new(HashAlg::Sha256, &[0]),
            primary_key_bits: 2048,
            signing_key_bits: 2048,
            scheme: SignatureScheme::RsaSsa,
        }
    }
}

/// Everything a run needs to know
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// TPM character device or Unix socket
    pub device: PathBuf,
    pub primary_handle_file: PathBuf,
    pub key_handle_file: PathBuf,
    pub flush: FlushScope,
    pub policy: KeyPolicy,
    /// Deadline for each TPM command on socket endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            primary_handle_file: PathBuf::from("primary.bin"),
            key_handle_file: PathBuf::from("key.bin"),
            flush: FlushScope::All,
            policy: KeyPolicy::default(),
            command_timeout: None,
        }
    }
}
