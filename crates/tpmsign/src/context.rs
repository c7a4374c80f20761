// SPDX-License-Identifier: MIT OR Apache-2.0

//! Saving and restoring object contexts

use log::debug;
use std::fmt;

use crate::error::TpmError;
use crate::{CommandBuffer, Tpm, TpmCc, TpmSt};

/// A saved object context (TPMS_CONTEXT), as produced by TPM2_ContextSave
///
/// The bytes are opaque: they are written to disk and handed back to
/// TPM2_ContextLoad unchanged. Only the TPM and hierarchy that saved the
/// context can load it again.
#[derive(Clone, PartialEq, Eq)]
pub struct ContextBlob(Vec<u8>);

impl ContextBlob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ContextBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextBlob({} bytes)", self.0.len())
    }
}

/// Context management
pub trait ContextOps {
    /// Save the context of a loaded object. The object stays loaded.
    fn context_save(&mut self, handle: u32) -> Result<ContextBlob, TpmError>;

    /// Load a saved context, returning the new transient handle
    fn context_load(&mut self, context: &ContextBlob) -> Result<u32, TpmError>;
}

impl ContextOps for Tpm {
    fn context_save(&mut self, handle: u32) -> Result<ContextBlob, TpmError> {
        let command = CommandBuffer::new()
            .write_u32(handle)
            .finalize(TpmSt::NoSessions, TpmCc::ContextSave);
        let mut resp = self.transmit(&command)?;

        let context = resp.read_rest();
        if context.is_empty() {
            return Err(TpmError::Malformed("TPM2_ContextSave returned no context".into()));
        }
        debug!("Saved context of 0x{:08X} ({} bytes)", handle, context.len());
        Ok(ContextBlob(context))
    }

    fn context_load(&mut self, context: &ContextBlob) -> Result<u32, TpmError> {
        let command = CommandBuffer::new()
            .write_bytes(context.as_bytes())
            .finalize(TpmSt::NoSessions, TpmCc::ContextLoad);
        let mut resp = self.transmit(&command)?;

        let handle = resp.read_u32()?;
        self.track(handle);
        debug!("Loaded context as 0x{:08X}", handle);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_contents() {
        let blob = ContextBlob::from_bytes(vec![0xAB; 12]);
        assert_eq!(format!("{:?}", blob), "ContextBlob(12 bytes)");
        assert_eq!(blob.len(), 12);
        assert_eq!(blob.into_bytes(), vec![0xAB; 12]);
    }
}
