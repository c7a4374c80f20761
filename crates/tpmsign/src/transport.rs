// SPDX-License-Identifier: MIT OR Apache-2.0

//! How a [`Tpm`] session reaches the device

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::Tpm;

/// A byte stream carrying TPM commands and responses
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// Something that can open a fresh TPM session on demand
///
/// The provisioner and signer never hold a session longer than one
/// operation, so they take a connector rather than a session.
pub trait Connector {
    /// Open a new session. Failures are reported as [`Error::DeviceOpen`].
    fn connect(&self) -> Result<Tpm>;

    /// Human-readable endpoint, for logs and reports
    fn endpoint(&self) -> String;
}

impl<C: Connector + ?Sized> Connector for &C {
    fn connect(&self) -> Result<Tpm> {
        (**self).connect()
    }

    fn endpoint(&self) -> String {
        (**self).endpoint()
    }
}

/// A TPM reached through a filesystem path (character device or Unix socket)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePath {
    path: PathBuf,
    timeout: Option<Duration>,
}

impl DevicePath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: None,
        }
    }

    /// Bound every read and write (socket endpoints only)
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Connector for DevicePath {
    fn connect(&self) -> Result<Tpm> {
        Tpm::open_with_timeout(&self.path, self.timeout).map_err(|source| Error::DeviceOpen {
            device: self.endpoint(),
            source,
        })
    }

    fn endpoint(&self) -> String {
        self.path.display().to_string()
    }
}
