// SPDX-License-Identifier: MIT OR Apache-2.0

//! Flushing handles left resident by earlier processes

use log::{debug, info};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::handles::{FlushScope, HandleOps};
use crate::Tpm;

/// Handles flushed by one janitor run, in the order they were flushed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub flushed: Vec<u32>,
}

impl FlushReport {
    pub fn count(&self) -> usize {
        self.flushed.len()
    }
}

/// Flush every resident handle of the kinds selected by `scope`
///
/// Persistent handles are never touched. The first enumeration or flush
/// failure aborts the run; handles flushed before it stay flushed.
pub fn flush_stale_handles(tpm: &mut Tpm, scope: FlushScope) -> Result<FlushReport> {
    let mut report = FlushReport::default();

    for &kind in scope.kinds() {
        let handles = tpm
            .handles(kind)
            .map_err(Error::tpm("handle enumeration", |source| Error::HandleEnumeration { kind, source }))?;

        for handle in handles {
            tpm.flush_context(handle)
                .map_err(Error::tpm("flush", |source| Error::Flush { handle, source }))?;
            debug!("Flushed stale {} handle 0x{:08X}", kind, handle);
            report.flushed.push(handle);
        }
    }

    info!("Flushed {} stale handle(s) (scope: {})", report.count(), scope);
    Ok(report)
}
