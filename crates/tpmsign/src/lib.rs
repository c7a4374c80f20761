// SPDX-License-Identifier: MIT OR Apache-2.0

//! TPM 2.0 signing key provisioning
//!
//! Talks to the TPM directly over its command/response protocol, through a
//! character device, a Unix socket, or the in-process simulator (`sim`
//! feature).
//!
//! The pieces, leaf first:
//! - [`store`] persists opaque key contexts to files
//! - [`janitor`] flushes stale handles left behind by earlier processes
//! - [`provision`] creates a primary storage key and an RSA signing key under it
//! - [`signer`] signs digests with a persisted key, reloading it on every call
//!
//! Every transient handle a [`Tpm`] session creates or loads is flushed before
//! the session releases the device, on success and error paths alike.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

pub mod config;
pub mod context;
pub mod error;
pub mod handles;
pub mod janitor;
pub mod object;
pub mod provision;
pub mod rc;
pub mod signer;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod store;
pub mod transport;

// Re-export extension traits for convenience
pub use context::ContextOps;
pub use handles::HandleOps;
pub use object::ObjectOps;

pub use config::{Config, KeyPolicy, SignatureScheme};
pub use context::ContextBlob;
pub use error::{Error, Result, SignError, TpmError};
pub use handles::{FlushScope, HandleKind};
pub use janitor::{flush_stale_handles, FlushReport};
pub use object::{PcrSelection, RsaPublicArea};
pub use provision::{HandleFiles, ProvisionedKey, Provisioner};
pub use rc::ResponseCode;
pub use signer::{KeySource, Signer, SoftwareSigner, TpmSigner};
pub use transport::{Connector, DevicePath, Transport};

/// Default TPM device path
pub const DEFAULT_DEVICE: &str = "/dev/tpm0";

/// TPM 2.0 command codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmCc {
    CreatePrimary = 0x00000131,
    Create = 0x00000153,
    Load = 0x00000157,
    Sign = 0x0000015D,
    ContextLoad = 0x00000161,
    ContextSave = 0x00000162,
    FlushContext = 0x00000165,
    ReadPublic = 0x00000173,
    GetCapability = 0x0000017A,
}

impl TpmCc {
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0x00000131 => Some(TpmCc::CreatePrimary),
            0x00000153 => Some(TpmCc::Create),
            0x00000157 => Some(TpmCc::Load),
            0x0000015D => Some(TpmCc::Sign),
            0x00000161 => Some(TpmCc::ContextLoad),
            0x00000162 => Some(TpmCc::ContextSave),
            0x00000165 => Some(TpmCc::FlushContext),
            0x00000173 => Some(TpmCc::ReadPublic),
            0x0000017A => Some(TpmCc::GetCapability),
            _ => None,
        }
    }
}

/// TPM 2.0 structure tags
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    Creation = 0x8021,
    HashCheck = 0x8024,
}

/// TPM 2.0 algorithm identifiers
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TpmAlg {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Aes = 0x0006,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    RsaSsa = 0x0014,
    RsaPss = 0x0016,
    Cfb = 0x0043,
}

impl TpmAlg {
    /// Get the digest size in bytes for hash algorithms
    pub fn digest_size(&self) -> Option<usize> {
        match self {
            TpmAlg::Sha1 => Some(20),
            TpmAlg::Sha256 => Some(32),
            TpmAlg::Sha384 => Some(48),
            TpmAlg::Sha512 => Some(64),
            _ => None,
        }
    }

    /// Get the algorithm name as a string
    pub fn name(&self) -> &'static str {
        match self {
            TpmAlg::Rsa => "rsa",
            TpmAlg::Sha1 => "sha1",
            TpmAlg::Aes => "aes",
            TpmAlg::Sha256 => "sha256",
            TpmAlg::Sha384 => "sha384",
            TpmAlg::Sha512 => "sha512",
            TpmAlg::Null => "null",
            TpmAlg::RsaSsa => "rsassa",
            TpmAlg::RsaPss => "rsapss",
            TpmAlg::Cfb => "cfb",
        }
    }

    /// Try to convert a u16 to a TpmAlg
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x0001 => Some(TpmAlg::Rsa),
            0x0004 => Some(TpmAlg::Sha1),
            0x0006 => Some(TpmAlg::Aes),
            0x000B => Some(TpmAlg::Sha256),
            0x000C => Some(TpmAlg::Sha384),
            0x000D => Some(TpmAlg::Sha512),
            0x0010 => Some(TpmAlg::Null),
            0x0014 => Some(TpmAlg::RsaSsa),
            0x0016 => Some(TpmAlg::RsaPss),
            0x0043 => Some(TpmAlg::Cfb),
            _ => None,
        }
    }

    pub(crate) fn parse(val: u16) -> std::result::Result<Self, TpmError> {
        Self::from_u16(val)
            .ok_or_else(|| TpmError::Malformed(format!("unknown algorithm 0x{:04X}", val)))
    }
}

/// Hash algorithm a digest was computed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn digest_size(&self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }

    pub fn tpm_alg(&self) -> TpmAlg {
        match self {
            HashAlg::Sha1 => TpmAlg::Sha1,
            HashAlg::Sha256 => TpmAlg::Sha256,
            HashAlg::Sha384 => TpmAlg::Sha384,
            HashAlg::Sha512 => TpmAlg::Sha512,
        }
    }

    pub fn from_tpm_alg(alg: TpmAlg) -> Option<Self> {
        match alg {
            TpmAlg::Sha1 => Some(HashAlg::Sha1),
            TpmAlg::Sha256 => Some(HashAlg::Sha256),
            TpmAlg::Sha384 => Some(HashAlg::Sha384),
            TpmAlg::Sha512 => Some(HashAlg::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tpm_alg().name())
    }
}

/// TPM handle for the owner hierarchy
pub const TPM_RH_OWNER: u32 = 0x40000001;

/// TPM handle representing a null handle
pub const TPM_RH_NULL: u32 = 0x40000007;

/// Password authorization session handle
pub const TPM_RS_PW: u32 = 0x40000009;

/// TPM capability types
pub const TPM_CAP_HANDLES: u32 = 0x00000001;

/// Object attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectAttributes(u32);

impl ObjectAttributes {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_value(value: u32) -> Self {
        Self(value)
    }

    pub fn fixed_tpm(mut self) -> Self {
        self.0 |= 1 << 1;
        self
    }

    pub fn fixed_parent(mut self) -> Self {
        self.0 |= 1 << 4;
        self
    }

    pub fn sensitive_data_origin(mut self) -> Self {
        self.0 |= 1 << 5;
        self
    }

    pub fn user_with_auth(mut self) -> Self {
        self.0 |= 1 << 6;
        self
    }

    pub fn restricted(mut self) -> Self {
        self.0 |= 1 << 16;
        self
    }

    pub fn decrypt(mut self) -> Self {
        self.0 |= 1 << 17;
        self
    }

    pub fn sign_encrypt(mut self) -> Self {
        self.0 |= 1 << 18;
        self
    }

    pub fn is_restricted(&self) -> bool {
        self.0 & (1 << 16) != 0
    }

    pub fn is_decrypt(&self) -> bool {
        self.0 & (1 << 17) != 0
    }

    pub fn is_sign(&self) -> bool {
        self.0 & (1 << 18) != 0
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// TPM 2.0 command header
#[derive(Debug)]
struct TpmCommandHeader {
    tag: TpmSt,
    size: u32,
    code: TpmCc,
}

impl TpmCommandHeader {
    /// Create a new command header
    fn new(tag: TpmSt, size: u32, code: TpmCc) -> Self {
        Self { tag, size, code }
    }

    /// Serialize to bytes
    fn to_bytes(&self) -> [u8; 10] {
        let mut bytes = [0u8; 10];
        bytes[0..2].copy_from_slice(&(self.tag as u16).to_be_bytes());
        bytes[2..6].copy_from_slice(&self.size.to_be_bytes());
        bytes[6..10].copy_from_slice(&(self.code as u32).to_be_bytes());
        bytes
    }
}

/// TPM 2.0 response header
#[derive(Debug)]
pub struct TpmResponseHeader {
    pub tag: u16,
    pub size: u32,
    pub code: u32,
}

impl TpmResponseHeader {
    /// Parse a response header from a 10-byte buffer
    fn from_bytes(bytes: &[u8; 10]) -> Self {
        let tag = u16::from_be_bytes([bytes[0], bytes[1]]);
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let code = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        Self { tag, size, code }
    }
}

/// Helper for building TPM commands (and simulator responses) with
/// big-endian serialization
pub(crate) struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub(crate) fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub(crate) fn write_u8(mut self, val: u8) -> Self {
        self.data.push(val);
        self
    }

    pub(crate) fn write_u16(mut self, val: u16) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub(crate) fn write_u32(mut self, val: u32) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    #[cfg(any(test, feature = "sim"))]
    pub(crate) fn write_u64(mut self, val: u64) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub(crate) fn write_bytes(mut self, bytes: &[u8]) -> Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Write a TPM2B (size-prefixed buffer)
    pub(crate) fn write_tpm2b(mut self, bytes: &[u8]) -> Self {
        self.data.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        self.data.extend_from_slice(bytes);
        self
    }

    pub(crate) fn write_auth_empty_pw(self) -> Self {
        // Authorization area (password session with empty password)
        // Size = 4 (sessionHandle) + 2 (nonce) + 1 (attributes) + 2 (password) = 9 bytes
        self.write_u32(9) // authorizationSize
            .write_u32(TPM_RS_PW) // sessionHandle - password session
            .write_u16(0) // nonce - empty
            .write_u8(0) // sessionAttributes - continue session
            .write_u16(0) // password/hmac - empty
    }

    /// Write an empty TPM2B_SENSITIVE_CREATE (no userAuth, no data)
    pub(crate) fn write_sensitive_create_empty(self) -> Self {
        self.write_u16(4)
            .write_u16(0) // userAuth size = 0
            .write_u16(0) // data size = 0
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub(crate) fn finalize(mut self, tag: TpmSt, code: TpmCc) -> Vec<u8> {
        let total_size = 10 + self.data.len(); // header is 10 bytes
        let header = TpmCommandHeader::new(tag, total_size as u32, code);
        let mut result = Vec::new();
        result.extend_from_slice(&header.to_bytes());
        result.append(&mut self.data);
        result
    }
}

/// Helper for parsing TPM responses (and, in the simulator, commands)
pub struct ResponseBuffer {
    data: Vec<u8>,
    offset: usize,
}

type ParseResult<T> = std::result::Result<T, TpmError>;

impl ResponseBuffer {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }

    pub(crate) fn read_u8(&mut self) -> ParseResult<u8> {
        if self.offset >= self.data.len() {
            return Err(TpmError::Malformed("buffer underflow".into()));
        }
        let val = self.data[self.offset];
        self.offset += 1;
        Ok(val)
    }

    pub(crate) fn read_u16(&mut self) -> ParseResult<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> ParseResult<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    #[cfg(any(test, feature = "sim"))]
    pub(crate) fn read_u64(&mut self) -> ParseResult<u64> {
        let hi = self.read_u32()? as u64;
        let lo = self.read_u32()? as u64;
        Ok(hi << 32 | lo)
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> ParseResult<&[u8]> {
        if self.offset + len > self.data.len() {
            return Err(TpmError::Malformed(format!(
                "buffer underflow: trying to read {} bytes at offset {}, but only {} bytes total (remaining: {})",
                len,
                self.offset,
                self.data.len(),
                self.remaining()
            )));
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    /// Read a TPM2B (size-prefixed buffer)
    pub(crate) fn read_tpm2b(&mut self) -> ParseResult<Vec<u8>> {
        let size = self.read_u16()? as usize;
        Ok(self.read_bytes(size)?.to_vec())
    }

    /// Consume everything left in the buffer
    pub(crate) fn read_rest(&mut self) -> Vec<u8> {
        let rest = self.data[self.offset..].to_vec();
        self.offset = self.data.len();
        rest
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    /// Skip any output parameters not parsed by the caller, then check that
    /// exactly `parameter_size` bytes were consumed since `param_start`
    pub(crate) fn finish_parameters(
        &mut self,
        param_start: usize,
        parameter_size: u32,
        command: TpmCc,
    ) -> ParseResult<()> {
        let bytes_read = self.offset - param_start;
        if bytes_read < parameter_size as usize {
            let remaining = parameter_size as usize - bytes_read;
            self.read_bytes(remaining)?;
        }

        let final_bytes_read = self.offset - param_start;
        if final_bytes_read != parameter_size as usize {
            return Err(TpmError::Malformed(format!(
                "parameter size mismatch in {:?}: TPM said {} bytes, we read {} bytes",
                command, parameter_size, final_bytes_read
            )));
        }
        Ok(())
    }
}

/// A TPM 2.0 session over some transport
///
/// The session tracks every transient handle it creates or loads. Those that
/// are still resident when the session ends are flushed before the transport
/// is released, either by [`Tpm::close`] (which reports failures) or by `Drop`.
///
/// A failed transfer (timeout or I/O error) breaks the session: a reply may
/// still be in flight, so no further command is sent over the transport.
/// Owned handles are then abandoned rather than flushed. `/dev/tpmrm0`
/// releases them when the transport is dropped; elsewhere they are left for
/// [`flush_stale_handles`].
pub struct Tpm {
    device: Box<dyn Transport>,
    owned: Vec<u32>,
    broken: bool,
}

impl Tpm {
    /// Open a TPM endpoint, either a character device or a Unix socket
    ///
    /// `timeout` bounds every read and write on socket endpoints. Character
    /// devices block until the TPM answers.
    pub fn open_with_timeout(path: impl AsRef<Path>, timeout: Option<Duration>) -> ParseResult<Self> {
        let path = path.as_ref();
        let is_socket = std::fs::metadata(path)
            .map(|meta| meta.file_type().is_socket())
            .unwrap_or(false);

        if is_socket {
            let stream = UnixStream::connect(path)?;
            stream.set_read_timeout(timeout)?;
            stream.set_write_timeout(timeout)?;
            debug!("Connected to TPM socket {}", path.display());
            return Ok(Self::from_transport(stream));
        }

        let device = OpenOptions::new().read(true).write(true).open(path)?;
        debug!("Opened TPM device {}", path.display());
        Ok(Self::from_transport(device))
    }

    /// Wrap an already-open transport
    pub fn from_transport<T: Transport + 'static>(transport: T) -> Self {
        Self {
            device: Box::new(transport),
            owned: Vec::new(),
            broken: false,
        }
    }

    /// Send a command and receive response
    ///
    /// Returns a ResponseBuffer containing the response body (without the header)
    pub(crate) fn transmit(&mut self, command: &[u8]) -> ParseResult<ResponseBuffer> {
        let code = command
            .get(6..10)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .and_then(TpmCc::from_u32)
            .ok_or_else(|| TpmError::Malformed("command has no valid header".into()))?;
        if self.broken {
            return Err(broken_transport());
        }
        debug!("TPM2_{:?} ({} bytes)", code, command.len());

        let (header, body) = match self.exchange(command) {
            Ok(response) => response,
            Err(e) => {
                self.broken = true;
                return Err(e);
            }
        };

        // Check response code
        if header.code != rc::SUCCESS {
            return Err(TpmError::Response {
                command: code,
                code: ResponseCode(header.code),
            });
        }

        Ok(ResponseBuffer::new(body))
    }

    /// Write one command and read back one complete response
    fn exchange(&mut self, command: &[u8]) -> ParseResult<(TpmResponseHeader, Vec<u8>)> {
        // Write command
        self.device.write_all(command).map_err(transport_error)?;

        // Read response header first (10 bytes)
        let mut header_buf = [0u8; 10];
        self.device.read_exact(&mut header_buf).map_err(transport_error)?;

        // Parse response header
        let header = TpmResponseHeader::from_bytes(&header_buf);

        if header.size < 10 {
            return Err(TpmError::Malformed(format!(
                "invalid TPM response size: {}",
                header.size
            )));
        }

        // Read response body (excluding header)
        let body_size = header.size as usize - 10;
        let mut body = vec![0u8; body_size];
        self.device.read_exact(&mut body).map_err(transport_error)?;

        Ok((header, body))
    }

    /// Flush a context (close a handle)
    pub fn flush_context(&mut self, handle: u32) -> ParseResult<()> {
        self.flush_raw(handle)?;
        self.owned.retain(|&h| h != handle);
        debug!("Flushed handle 0x{:08X}", handle);
        Ok(())
    }

    fn flush_raw(&mut self, handle: u32) -> ParseResult<()> {
        let command = CommandBuffer::new()
            .write_u32(handle)
            .finalize(TpmSt::NoSessions, TpmCc::FlushContext);
        self.transmit(&command)?;
        Ok(())
    }

    /// Execute TPM2_GetCapability command
    ///
    /// Returns (more_data, ResponseBuffer) positioned after capability verification.
    /// The ResponseBuffer is ready to parse capability-specific data.
    pub fn get_capability(
        &mut self,
        capability: u32,
        property: u32,
        property_count: u32,
    ) -> ParseResult<(bool, ResponseBuffer)> {
        let command = CommandBuffer::new()
            .write_u32(capability)
            .write_u32(property)
            .write_u32(property_count)
            .finalize(TpmSt::NoSessions, TpmCc::GetCapability);
        let mut resp = self.transmit(&command)?;

        // Parse common response fields
        let more_data = resp.read_u8()? != 0;
        let returned_capability = resp.read_u32()?;
        if returned_capability != capability {
            return Err(TpmError::Malformed(format!(
                "unexpected capability type: 0x{:08X} (expected 0x{:08X})",
                returned_capability, capability
            )));
        }

        Ok((more_data, resp))
    }

    /// Transient handles this session is responsible for flushing
    pub fn owned_handles(&self) -> &[u32] {
        &self.owned
    }

    /// Whether a failed transfer has made the transport unusable
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Record a transient handle so it is flushed when the session ends
    pub(crate) fn track(&mut self, handle: u32) {
        if HandleKind::of(handle) == Some(HandleKind::Transient) && !self.owned.contains(&handle) {
            self.owned.push(handle);
        }
    }

    /// Flush every handle still owned by this session and release the device
    pub fn close(mut self) -> Result<()> {
        self.release().map_err(|(handle, source)| match source {
            TpmError::Timeout => Error::Timeout { step: "close" },
            source => Error::Flush { handle, source },
        })
    }

    /// Flush owned handles newest first. Keeps going after a failure so one
    /// bad handle does not strand the others, and reports the first failure.
    fn release(&mut self) -> std::result::Result<(), (u32, TpmError)> {
        let owned = std::mem::take(&mut self.owned);
        if self.broken {
            return match owned.last() {
                Some(&handle) => Err((handle, broken_transport())),
                None => Ok(()),
            };
        }

        let mut first_error = None;
        for handle in owned.into_iter().rev() {
            match self.flush_raw(handle) {
                Ok(()) => debug!("Released handle 0x{:08X}", handle),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some((handle, e));
                    }
                }
            }
        }
        match first_error {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl Drop for Tpm {
    fn drop(&mut self) {
        if let Err((handle, e)) = self.release() {
            warn!("Failed to flush handle 0x{:08X} while closing TPM session: {}", handle, e);
        }
    }
}

fn broken_transport() -> TpmError {
    TpmError::Io(io::Error::new(
        ErrorKind::BrokenPipe,
        "TPM session is unusable after a failed transfer",
    ))
}

/// Timeouts surface as their own error so callers can tell a hung TPM from a broken one
fn transport_error(e: io::Error) -> TpmError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => TpmError::Timeout,
        _ => TpmError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays canned reads, `None` being a timeout, and records every write
    struct Scripted {
        reads: VecDeque<Option<Vec<u8>>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Some(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.reads.push_front(Some(chunk.split_off(n)));
                    }
                    Ok(n)
                }
                Some(None) => Err(io::Error::new(ErrorKind::TimedOut, "no reply in time")),
                None => Ok(0),
            }
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn late_reply_is_never_read_as_a_flush_response() {
        let written = Arc::new(Mutex::new(Vec::new()));
        // The reply to the timed-out command shows up afterwards, with a success code
        let late_reply = vec![0x80, 0x01, 0, 0, 0, 10, 0, 0, 0, 0];
        let mut tpm = Tpm::from_transport(Scripted {
            reads: VecDeque::from([None, Some(late_reply)]),
            written: Arc::clone(&written),
        });
        tpm.track(0x80000001);

        let command = CommandBuffer::new()
            .write_u32(0x80000001)
            .finalize(TpmSt::NoSessions, TpmCc::ContextSave);
        assert!(matches!(tpm.transmit(&command), Err(TpmError::Timeout)));
        assert!(tpm.is_broken());

        assert!(matches!(tpm.flush_context(0x80000001), Err(TpmError::Io(_))));
        assert_eq!(tpm.owned_handles(), &[0x80000001]);
        match tpm.close() {
            Err(Error::Flush { handle, .. }) => assert_eq!(handle, 0x80000001),
            other => panic!("expected an abandoned handle, got {:?}", other),
        }

        // Only the timed-out command ever went out
        assert_eq!(*written.lock().unwrap(), command);
    }

    #[test]
    fn healthy_session_flushes_owned_handles_on_close() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let flushed = vec![0x80, 0x01, 0, 0, 0, 10, 0, 0, 0, 0];
        let mut tpm = Tpm::from_transport(Scripted {
            reads: VecDeque::from([Some(flushed)]),
            written: Arc::clone(&written),
        });
        tpm.track(0x80000002);
        tpm.close().unwrap();

        let expected = CommandBuffer::new()
            .write_u32(0x80000002)
            .finalize(TpmSt::NoSessions, TpmCc::FlushContext);
        assert_eq!(*written.lock().unwrap(), expected);
    }

    #[test]
    fn command_header_is_big_endian() {
        let cmd = CommandBuffer::new()
            .write_u32(0x80000001)
            .finalize(TpmSt::NoSessions, TpmCc::FlushContext);
        assert_eq!(
            cmd,
            vec![0x80, 0x01, 0x00, 0x00, 0x00, 0x0E, 0x00, 0x00, 0x01, 0x65, 0x80, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn empty_password_auth_area() {
        let bytes = CommandBuffer::new().write_auth_empty_pw().into_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 9, 0x40, 0, 0, 9, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn response_buffer_underflow_is_malformed() {
        let mut buf = ResponseBuffer::new(vec![0x00, 0x05, 0xAA]);
        assert!(matches!(buf.read_tpm2b(), Err(TpmError::Malformed(_))));
    }

    #[test]
    fn finish_parameters_skips_unread_output() {
        let mut buf = ResponseBuffer::new(vec![0, 0, 0, 4, 1, 2, 3, 4, 0xFF]);
        let size = buf.read_u32().unwrap();
        let start = buf.offset();
        buf.read_u8().unwrap();
        buf.finish_parameters(start, size, TpmCc::Create).unwrap();
        assert_eq!(buf.remaining(), 1);
    }

    #[test]
    fn signing_key_attributes() {
        let attrs = ObjectAttributes::new()
            .fixed_tpm()
            .fixed_parent()
            .sensitive_data_origin()
            .user_with_auth()
            .sign_encrypt();
        assert_eq!(attrs.value(), 0x00040072);
        assert!(attrs.is_sign());
        assert!(!attrs.is_decrypt());
        assert!(!attrs.is_restricted());
    }

    #[test]
    fn algorithm_ids_round_trip() {
        for alg in [TpmAlg::Rsa, TpmAlg::Sha256, TpmAlg::RsaSsa, TpmAlg::RsaPss, TpmAlg::Cfb] {
            assert_eq!(TpmAlg::from_u16(alg as u16), Some(alg));
        }
        assert_eq!(TpmAlg::from_u16(0x7777), None);
        assert_eq!(HashAlg::Sha256.digest_size(), TpmAlg::Sha256.digest_size().unwrap());
    }

    #[test]
    fn timed_out_transport_maps_to_timeout() {
        let err = transport_error(io::Error::new(ErrorKind::TimedOut, "slow"));
        assert!(matches!(err, TpmError::Timeout));
        let err = transport_error(io::Error::new(ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(err, TpmError::Io(_)));
    }
}
