// SPDX-License-Identifier: MIT OR Apache-2.0

//! TPM 2.0 response codes

use std::fmt;

pub const SUCCESS: u32 = 0x000;

// Format-zero codes
pub const BAD_TAG: u32 = 0x01E;
pub const FAILURE: u32 = 0x101;
pub const AUTH_MISSING: u32 = 0x125;
pub const COMMAND_SIZE: u32 = 0x142;
pub const COMMAND_CODE: u32 = 0x143;
pub const AUTH_SIZE: u32 = 0x144;
pub const AUTH_CONTEXT: u32 = 0x145;
pub const CONTEXT_GAP: u32 = 0x901;
pub const OBJECT_MEMORY: u32 = 0x902;
pub const SESSION_MEMORY: u32 = 0x903;
pub const RETRY: u32 = 0x922;

// Format-one codes, qualified by a handle, session or parameter number
pub const ATTRIBUTES: u32 = 0x082;
pub const HASH: u32 = 0x083;
pub const VALUE: u32 = 0x084;
pub const HIERARCHY: u32 = 0x085;
pub const KEY_SIZE: u32 = 0x087;
pub const TYPE: u32 = 0x08A;
pub const HANDLE: u32 = 0x08B;
pub const AUTH_FAIL: u32 = 0x08E;
pub const SCHEME: u32 = 0x092;
pub const SIZE: u32 = 0x095;
pub const SYMMETRIC: u32 = 0x096;
pub const INSUFFICIENT: u32 = 0x09A;
pub const KEY: u32 = 0x09C;
pub const INTEGRITY: u32 = 0x09F;

const FMT1: u32 = 0x080;
const PARAMETER: u32 = 0x040;
const SESSION: u32 = 0x800;

/// Qualify a format-one code with the parameter it applies to (1-based)
pub const fn parameter(base: u32, n: u32) -> u32 {
    base | PARAMETER | (n << 8)
}

/// Qualify a format-one code with the handle it applies to (1-based)
pub const fn handle(base: u32, n: u32) -> u32 {
    base | (n << 8)
}

/// Qualify a format-one code with the session it applies to (1-based)
pub const fn session(base: u32, n: u32) -> u32 {
    base | SESSION | (n << 8)
}

/// A raw TPM response code with a readable rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u32);

impl ResponseCode {
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The code with any handle/session/parameter qualifier stripped
    pub fn base(&self) -> u32 {
        if self.0 & FMT1 != 0 {
            FMT1 | (self.0 & 0x03F)
        } else {
            self.0 & 0xFFF
        }
    }

    pub fn is(&self, base: u32) -> bool {
        self.base() == base
    }

    pub fn name(&self) -> Option<&'static str> {
        let name = match self.base() {
            BAD_TAG => "TPM_RC_BAD_TAG",
            FAILURE => "TPM_RC_FAILURE",
            AUTH_MISSING => "TPM_RC_AUTH_MISSING",
            COMMAND_SIZE => "TPM_RC_COMMAND_SIZE",
            COMMAND_CODE => "TPM_RC_COMMAND_CODE",
            AUTH_SIZE => "TPM_RC_AUTH_SIZE",
            AUTH_CONTEXT => "TPM_RC_AUTH_CONTEXT",
            CONTEXT_GAP => "TPM_RC_CONTEXT_GAP",
            OBJECT_MEMORY => "TPM_RC_OBJECT_MEMORY",
            SESSION_MEMORY => "TPM_RC_SESSION_MEMORY",
            RETRY => "TPM_RC_RETRY",
            ATTRIBUTES => "TPM_RC_ATTRIBUTES",
            HASH => "TPM_RC_HASH",
            VALUE => "TPM_RC_VALUE",
            HIERARCHY => "TPM_RC_HIERARCHY",
            KEY_SIZE => "TPM_RC_KEY_SIZE",
            TYPE => "TPM_RC_TYPE",
            HANDLE => "TPM_RC_HANDLE",
            AUTH_FAIL => "TPM_RC_AUTH_FAIL",
            SCHEME => "TPM_RC_SCHEME",
            SIZE => "TPM_RC_SIZE",
            SYMMETRIC => "TPM_RC_SYMMETRIC",
            INSUFFICIENT => "TPM_RC_INSUFFICIENT",
            KEY => "TPM_RC_KEY",
            INTEGRITY => "TPM_RC_INTEGRITY",
            _ => return None,
        };
        Some(name)
    }

    /// Which handle, session or parameter a format-one code refers to
    fn qualifier(&self) -> Option<(&'static str, u32)> {
        if self.0 & FMT1 == 0 {
            return None;
        }
        let n = (self.0 >> 8) & 0xF;
        if self.0 & PARAMETER != 0 {
            Some(("parameter", n))
        } else if self.0 & SESSION != 0 {
            Some(("session", n & 0x7))
        } else if n != 0 {
            Some(("handle", n))
        } else {
            None
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name)?,
            None => write!(f, "unknown response code")?,
        }
        match self.qualifier() {
            Some((what, n)) => write!(f, " ({} {}, 0x{:08X})", what, n, self.0),
            None => write!(f, " (0x{:08X})", self.0),
        }
    }
}
