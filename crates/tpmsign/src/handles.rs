// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handle kinds and enumeration of TPM-resident handles

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TpmError;
use crate::{Tpm, TPM_CAP_HANDLES};

/// Maximum handles requested per TPM2_GetCapability round trip
const HANDLES_PER_QUERY: u32 = 64;

/// Kind of a TPM handle, taken from its most significant byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Sessions currently occupying a session slot
    LoadedSession,
    /// Sessions whose context has been saved out of the TPM
    SavedSession,
    /// Transient objects (keys loaded into object slots)
    Transient,
    /// Objects made persistent in NV memory
    Persistent,
}

impl HandleKind {
    pub fn type_byte(&self) -> u8 {
        match self {
            HandleKind::LoadedSession => 0x02,
            HandleKind::SavedSession => 0x03,
            HandleKind::Transient => 0x80,
            HandleKind::Persistent => 0x81,
        }
    }

    /// First handle value in this kind's range
    pub fn first_handle(&self) -> u32 {
        (self.type_byte() as u32) << 24
    }

    /// Classify a handle by its range
    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x02 => Some(HandleKind::LoadedSession),
            0x03 => Some(HandleKind::SavedSession),
            0x80 => Some(HandleKind::Transient),
            0x81 => Some(HandleKind::Persistent),
            _ => None,
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleKind::LoadedSession => "loaded session",
            HandleKind::SavedSession => "saved session",
            HandleKind::Transient => "transient",
            HandleKind::Persistent => "persistent",
        })
    }
}

/// Which stale handles to flush at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushScope {
    #[default]
    All,
    Loaded,
    Saved,
    Transient,
}

impl FlushScope {
    pub fn kinds(&self) -> &'static [HandleKind] {
        match self {
            FlushScope::All => &[
                HandleKind::LoadedSession,
                HandleKind::SavedSession,
                HandleKind::Transient,
            ],
            FlushScope::Loaded => &[HandleKind::LoadedSession],
            FlushScope::Saved => &[HandleKind::SavedSession],
            FlushScope::Transient => &[HandleKind::Transient],
        }
    }
}

impl FromStr for FlushScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(FlushScope::All),
            "loaded" => Ok(FlushScope::Loaded),
            "saved" => Ok(FlushScope::Saved),
            "transient" => Ok(FlushScope::Transient),
            other => Err(format!(
                "unknown flush scope '{}' (expected all, loaded, saved or transient)",
                other
            )),
        }
    }
}

impl fmt::Display for FlushScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlushScope::All => "all",
            FlushScope::Loaded => "loaded",
            FlushScope::Saved => "saved",
            FlushScope::Transient => "transient",
        })
    }
}

/// Low 24 bits of a handle: its index within the range
const HANDLE_INDEX_MASK: u32 = 0x00FF_FFFF;

/// Handle enumeration
pub trait HandleOps {
    /// List every handle the TPM reports for `kind`
    ///
    /// Session handles are not filtered by range: loaded policy sessions are
    /// reported as `0x03xxxxxx` when loaded sessions are queried, and saved
    /// sessions come back in the `0x02xxxxxx` range.
    fn handles(&mut self, kind: HandleKind) -> Result<Vec<u32>, TpmError>;
}

impl HandleOps for Tpm {
    fn handles(&mut self, kind: HandleKind) -> Result<Vec<u32>, TpmError> {
        let mut handles = Vec::new();
        let mut property = kind.first_handle();

        loop {
            let (more_data, mut resp) = self.get_capability(TPM_CAP_HANDLES, property, HANDLES_PER_QUERY)?;

            // TPML_HANDLE
            let count = resp.read_u32()?;
            let mut last = None;
            for _ in 0..count {
                let handle = resp.read_u32()?;
                handles.push(handle);
                last = Some(handle);
            }

            // Resume after the last index, staying in the queried range
            match last.map(|handle| (handle & HANDLE_INDEX_MASK) + 1) {
                Some(next) if more_data && next <= HANDLE_INDEX_MASK => property = kind.first_handle() | next,
                _ => return Ok(handles),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_kind_from_range() {
        assert_eq!(HandleKind::of(0x80000002), Some(HandleKind::Transient));
        assert_eq!(HandleKind::of(0x02000000), Some(HandleKind::LoadedSession));
        assert_eq!(HandleKind::of(0x03000001), Some(HandleKind::SavedSession));
        assert_eq!(HandleKind::of(0x81010002), Some(HandleKind::Persistent));
        assert_eq!(HandleKind::of(0x40000001), None);
        assert_eq!(HandleKind::Transient.first_handle(), 0x80000000);
    }

    #[test]
    fn flush_scope_selects_kinds() {
        assert_eq!(FlushScope::All.kinds().len(), 3);
        assert_eq!(FlushScope::Saved.kinds(), &[HandleKind::SavedSession]);
        assert!(!FlushScope::All.kinds().contains(&HandleKind::Persistent));
    }

    #[test]
    fn flush_scope_parses() {
        assert_eq!("transient".parse::<FlushScope>().unwrap(), FlushScope::Transient);
        assert_eq!("all".parse::<FlushScope>().unwrap(), FlushScope::All);
        assert!("everything".parse::<FlushScope>().is_err());
    }
}
