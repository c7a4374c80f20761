// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process software TPM
//!
//! Speaks the same command/response byte protocol as a hardware TPM, for the
//! subset of commands this crate sends, so everything above the transport can
//! run without a device. Behaviour is deterministic for a given seed.
//!
//! Modelled:
//! - primary storage keys derived from the seed, the owner hierarchy proof and the template
//! - child RSA keys whose private blobs are integrity-bound to their parent
//! - saved contexts bound to the seed and the owner hierarchy proof
//! - three transient object slots
//! - session enumeration as the reference TPM reports it: loaded policy
//!   sessions in the `0x03` range, saved sessions in the `0x02` range
//! - exclusive access, like `/dev/tpm0`
//!
//! Objects stay resident across connections, which is what makes stale
//! handles possible in the first place.

use log::debug;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, Pss, RsaPrivateKey};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result, TpmError};
use crate::handles::HandleKind;
use crate::object::{RsaPublicArea, SymmetricDef};
use crate::transport::Connector;
use crate::{
    rc, CommandBuffer, HashAlg, ResponseBuffer, Tpm, TpmAlg, TpmCc, TpmSt, TPM_CAP_HANDLES, TPM_RH_OWNER,
    TPM_RS_PW,
};

const TRANSIENT_SLOTS: usize = 3;
const MAX_CAP_HANDLES: usize = 16;
const MAX_COMMAND_SIZE: usize = 4096;
const SUPPORTED_KEY_BITS: &[u16] = &[1024, 2048, 3072];
/// savedHandle recorded in every object context
const SAVED_OBJECT_HANDLE: u32 = 0x80000000;
const FIRST_PERSISTENT: u32 = 0x81010000;
const HANDLE_INDEX_MASK: u32 = 0x00FF_FFFF;
const HMAC_SESSION_RANGE: u32 = 0x02000000;
const POLICY_SESSION_RANGE: u32 = 0x03000000;

/// Response code the simulator answers a failed command with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rc(u32);

// The command ran out of bytes while being parsed
impl From<TpmError> for Rc {
    fn from(_: TpmError) -> Self {
        Rc(rc::INSUFFICIENT)
    }
}

type SimResult<T> = std::result::Result<T, Rc>;

#[derive(Clone)]
enum Sensitive {
    Storage { seed: [u8; 32] },
    Signing(Box<RsaPrivateKey>),
}

#[derive(Clone)]
struct SimObject {
    public: RsaPublicArea,
    sensitive: Sensitive,
    hierarchy: u32,
}

impl SimObject {
    fn storage_seed(&self) -> Option<[u8; 32]> {
        match &self.sensitive {
            Sensitive::Storage { seed } => Some(*seed),
            Sensitive::Signing(_) => None,
        }
    }

    /// The object as carried inside a saved context
    fn to_payload(&self) -> SimResult<Vec<u8>> {
        let (kind, sensitive) = match &self.sensitive {
            Sensitive::Storage { seed } => (1u8, seed.to_vec()),
            Sensitive::Signing(key) => {
                let der = key.to_pkcs1_der().map_err(|_| Rc(rc::FAILURE))?;
                (2u8, der.as_bytes().to_vec())
            }
        };
        Ok(CommandBuffer::new()
            .write_u8(kind)
            .write_tpm2b(&self.public.to_bytes())
            .write_tpm2b(&sensitive)
            .into_bytes())
    }

    fn from_payload(payload: &[u8], hierarchy: u32) -> SimResult<Self> {
        let mut buf = ResponseBuffer::new(payload.to_vec());
        let kind = buf.read_u8()?;
        let public = RsaPublicArea::from_bytes(&buf.read_tpm2b()?)?;
        let sensitive = buf.read_tpm2b()?;
        let sensitive = match kind {
            1 => Sensitive::Storage {
                seed: sensitive.try_into().map_err(|_| Rc(rc::INTEGRITY))?,
            },
            2 => Sensitive::Signing(Box::new(
                RsaPrivateKey::from_pkcs1_der(&sensitive).map_err(|_| Rc(rc::INTEGRITY))?,
            )),
            _ => return Err(Rc(rc::INTEGRITY)),
        };
        Ok(Self {
            public,
            sensitive,
            hierarchy,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct SimSession {
    policy: bool,
    loaded: bool,
}

impl SimSession {
    /// The handle reported for a session at `index`
    fn handle(&self, index: u32) -> u32 {
        match (self.loaded, self.policy) {
            (true, true) => POLICY_SESSION_RANGE | index,
            _ => HMAC_SESSION_RANGE | index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stall {
    Next,
    On(TpmCc),
}

/// An injected failure for a future command
struct Fault {
    command: TpmCc,
    remaining: usize,
    code: u32,
}

/// Output of a successfully executed command
struct Reply {
    handle: Option<u32>,
    params: Vec<u8>,
}

impl Reply {
    fn params(params: Vec<u8>) -> Self {
        Self { handle: None, params }
    }

    fn with_handle(handle: u32, params: Vec<u8>) -> Self {
        Self {
            handle: Some(handle),
            params,
        }
    }
}

struct SimState {
    seed: u64,
    owner_proof: [u8; 32],
    rng: StdRng,
    connected: bool,
    stall: Option<Stall>,
    /// Transient and persistent objects by handle
    objects: BTreeMap<u32, SimObject>,
    /// Sessions by index. Loaded and saved sessions share one index space.
    sessions: BTreeMap<u32, SimSession>,
    fault: Option<Fault>,
    /// Primary key moduli by derivation value
    primaries: HashMap<[u8; 32], Vec<u8>>,
    context_sequence: u64,
}

impl SimState {
    fn new(seed: u64) -> Self {
        Self {
            seed,
            owner_proof: derive(b"owner", &[&seed.to_be_bytes()]),
            rng: StdRng::seed_from_u64(seed),
            connected: false,
            stall: None,
            objects: BTreeMap::new(),
            sessions: BTreeMap::new(),
            fault: None,
            primaries: HashMap::new(),
            context_sequence: 0,
        }
    }

    /// Handles a TPM_CAP_HANDLES query for `kind` reports, in index order
    fn resident(&self, kind: HandleKind) -> Vec<u32> {
        let sessions = |loaded: bool| -> Vec<u32> {
            self.sessions
                .iter()
                .filter(|(_, session)| session.loaded == loaded)
                .map(|(&index, session)| session.handle(index))
                .collect()
        };
        match kind {
            HandleKind::LoadedSession => sessions(true),
            HandleKind::SavedSession => sessions(false),
            HandleKind::Transient | HandleKind::Persistent => self
                .objects
                .keys()
                .filter(|&&h| HandleKind::of(h) == Some(kind))
                .copied()
                .collect(),
        }
    }

    fn ensure_free_slot(&self) -> SimResult<()> {
        if self.resident(HandleKind::Transient).len() >= TRANSIENT_SLOTS {
            return Err(Rc(rc::OBJECT_MEMORY));
        }
        Ok(())
    }

    fn insert_transient(&mut self, object: SimObject) -> SimResult<u32> {
        self.ensure_free_slot()?;
        let handle = (HandleKind::Transient.first_handle()..)
            .find(|h| !self.objects.contains_key(h))
            .ok_or(Rc(rc::OBJECT_MEMORY))?;
        self.objects.insert(handle, object);
        Ok(handle)
    }

    fn storage_seed(&self, parent: u32) -> SimResult<[u8; 32]> {
        let object = self.objects.get(&parent).ok_or(Rc(rc::handle(rc::HANDLE, 1)))?;
        object.storage_seed().ok_or(Rc(rc::handle(rc::TYPE, 1)))
    }

    fn context_integrity(&self, sequence: u64, saved_handle: u32, hierarchy: u32, payload: &[u8]) -> [u8; 32] {
        derive(
            b"context",
            &[
                &self.seed.to_be_bytes(),
                &self.owner_proof,
                &sequence.to_be_bytes(),
                &saved_handle.to_be_bytes(),
                &hierarchy.to_be_bytes(),
                payload,
            ],
        )
    }

    /// Execute one complete command and return the full response
    fn execute(&mut self, command: &[u8]) -> Vec<u8> {
        match self.dispatch(command) {
            Ok((tag, reply)) => {
                let mut body = CommandBuffer::new();
                if let Some(handle) = reply.handle {
                    body = body.write_u32(handle);
                }
                body = if tag == TpmSt::Sessions {
                    body.write_u32(reply.params.len() as u32)
                        .write_bytes(&reply.params)
                        // Response auth: empty nonce, continueSession, empty hmac
                        .write_u16(0)
                        .write_u8(1)
                        .write_u16(0)
                } else {
                    body.write_bytes(&reply.params)
                };
                frame(tag as u16, rc::SUCCESS, &body.into_bytes())
            }
            Err(Rc(code)) => {
                debug!("Simulator rejected command: {}", rc::ResponseCode(code));
                frame(TpmSt::NoSessions as u16, code, &[])
            }
        }
    }

    fn dispatch(&mut self, command: &[u8]) -> SimResult<(TpmSt, Reply)> {
        let mut cmd = ResponseBuffer::new(command.to_vec());
        let tag = match cmd.read_u16()? {
            t if t == TpmSt::NoSessions as u16 => TpmSt::NoSessions,
            t if t == TpmSt::Sessions as u16 => TpmSt::Sessions,
            _ => return Err(Rc(rc::BAD_TAG)),
        };
        if cmd.read_u32()? as usize != command.len() {
            return Err(Rc(rc::COMMAND_SIZE));
        }
        let code = TpmCc::from_u32(cmd.read_u32()?).ok_or(Rc(rc::COMMAND_CODE))?;
        self.injected_fault(code)?;

        let needs_auth = matches!(
            code,
            TpmCc::CreatePrimary | TpmCc::Create | TpmCc::Load | TpmCc::Sign
        );
        match (needs_auth, tag) {
            (true, TpmSt::NoSessions) => return Err(Rc(rc::AUTH_MISSING)),
            (false, TpmSt::Sessions) => return Err(Rc(rc::AUTH_CONTEXT)),
            _ => {}
        }

        let reply = match code {
            TpmCc::GetCapability => self.get_capability(&mut cmd)?,
            TpmCc::FlushContext => self.flush_context(&mut cmd)?,
            TpmCc::CreatePrimary => self.create_primary(&mut cmd)?,
            TpmCc::Create => self.create(&mut cmd)?,
            TpmCc::Load => self.load(&mut cmd)?,
            TpmCc::ContextSave => self.context_save(&mut cmd)?,
            TpmCc::ContextLoad => self.context_load(&mut cmd)?,
            TpmCc::ReadPublic => self.read_public(&mut cmd)?,
            TpmCc::Sign => self.sign(&mut cmd)?,
        };
        Ok((tag, reply))
    }

    fn injected_fault(&mut self, command: TpmCc) -> SimResult<()> {
        if let Some(fault) = self.fault.as_mut().filter(|fault| fault.command == command) {
            fault.remaining -= 1;
            if fault.remaining == 0 {
                let code = fault.code;
                self.fault = None;
                debug!("Simulator failing TPM2_{:?} on request", command);
                return Err(Rc(code));
            }
        }
        Ok(())
    }

    fn get_capability(&mut self, cmd: &mut ResponseBuffer) -> SimResult<Reply> {
        let capability = cmd.read_u32()?;
        let property = cmd.read_u32()?;
        let count = cmd.read_u32()? as usize;
        finish(cmd)?;
        if capability != TPM_CAP_HANDLES {
            return Err(Rc(rc::parameter(rc::VALUE, 1)));
        }

        let start = property & HANDLE_INDEX_MASK;
        let handles: Vec<u32> = match HandleKind::of(property) {
            Some(kind) => self
                .resident(kind)
                .into_iter()
                .filter(|&h| (h & HANDLE_INDEX_MASK) >= start)
                .collect(),
            None => Vec::new(),
        };
        let take = count.min(MAX_CAP_HANDLES).min(handles.len());
        let more_data = handles.len() > take;

        let mut params = CommandBuffer::new()
            .write_u8(more_data as u8)
            .write_u32(TPM_CAP_HANDLES)
            .write_u32(take as u32);
        for &handle in &handles[..take] {
            params = params.write_u32(handle);
        }
        Ok(Reply::params(params.into_bytes()))
    }

    fn flush_context(&mut self, cmd: &mut ResponseBuffer) -> SimResult<Reply> {
        let handle = cmd.read_u32()?;
        finish(cmd)?;
        let flushed = match HandleKind::of(handle) {
            Some(HandleKind::Transient) => self.objects.remove(&handle).is_some(),
            Some(HandleKind::LoadedSession | HandleKind::SavedSession) => {
                self.sessions.remove(&(handle & HANDLE_INDEX_MASK)).is_some()
            }
            _ => false,
        };
        if !flushed {
            return Err(Rc(rc::parameter(rc::HANDLE, 1)));
        }
        Ok(Reply::params(Vec::new()))
    }

    fn create_primary(&mut self, cmd: &mut ResponseBuffer) -> SimResult<Reply> {
        let hierarchy = cmd.read_u32()?;
        authorize(cmd)?;
        let _in_sensitive = cmd.read_tpm2b()?;
        let template_bytes = cmd.read_tpm2b()?;
        let outside_info = cmd.read_tpm2b()?;
        let pcrs = read_pcr_selection(cmd, 4)?;
        finish(cmd)?;

        if hierarchy != TPM_RH_OWNER {
            return Err(Rc(rc::handle(rc::HIERARCHY, 1)));
        }
        let template = RsaPublicArea::from_bytes(&template_bytes).map_err(|_| Rc(rc::parameter(rc::VALUE, 2)))?;
        check_storage_template(&template, 2)?;
        self.ensure_free_slot()?;

        let derivation = derive(
            b"primary",
            &[&self.seed.to_be_bytes(), &self.owner_proof, template_bytes.as_slice()],
        );
        let modulus = match self.primaries.get(&derivation) {
            Some(modulus) => modulus.clone(),
            None => {
                let mut rng = StdRng::from_seed(derivation);
                let key =
                    RsaPrivateKey::new(&mut rng, template.key_bits as usize).map_err(|_| Rc(rc::FAILURE))?;
                let modulus = key.n().to_bytes_be();
                self.primaries.insert(derivation, modulus.clone());
                modulus
            }
        };

        let mut public = template;
        public.modulus = modulus;
        let handle = self.insert_transient(SimObject {
            public: public.clone(),
            sensitive: Sensitive::Storage {
                seed: derive(b"storage", &[&derivation]),
            },
            hierarchy,
        })?;

        let params = CommandBuffer::new()
            .write_tpm2b(&public.to_bytes())
            .write_bytes(&self.creation_outputs(&pcrs, &hierarchy.to_be_bytes(), &outside_info))
            .write_tpm2b(&public.name())
            .into_bytes();
        Ok(Reply::with_handle(handle, params))
    }

    fn create(&mut self, cmd: &mut ResponseBuffer) -> SimResult<Reply> {
        let parent = cmd.read_u32()?;
        authorize(cmd)?;
        let _in_sensitive = cmd.read_tpm2b()?;
        let template_bytes = cmd.read_tpm2b()?;
        let outside_info = cmd.read_tpm2b()?;
        let pcrs = read_pcr_selection(cmd, 4)?;
        finish(cmd)?;

        let parent_seed = self.storage_seed(parent)?;
        let template = RsaPublicArea::from_bytes(&template_bytes).map_err(|_| Rc(rc::parameter(rc::VALUE, 2)))?;
        check_signing_template(&template, 2)?;

        let key = RsaPrivateKey::new(&mut self.rng, template.key_bits as usize).map_err(|_| Rc(rc::FAILURE))?;
        let der = key.to_pkcs1_der().map_err(|_| Rc(rc::FAILURE))?;
        let mut public = template;
        public.modulus = key.n().to_bytes_be();
        let public_bytes = public.to_bytes();

        let integrity = derive(b"private", &[&parent_seed, public_bytes.as_slice(), der.as_bytes()]);
        let private = [integrity.as_slice(), der.as_bytes()].concat();

        let parent_name = self
            .objects
            .get(&parent)
            .map(|object| object.public.name())
            .unwrap_or_default();
        let params = CommandBuffer::new()
            .write_tpm2b(&private)
            .write_tpm2b(&public_bytes)
            .write_bytes(&self.creation_outputs(&pcrs, &parent_name, &outside_info))
            .into_bytes();
        Ok(Reply::params(params))
    }

    fn load(&mut self, cmd: &mut ResponseBuffer) -> SimResult<Reply> {
        let parent = cmd.read_u32()?;
        authorize(cmd)?;
        let private = cmd.read_tpm2b()?;
        let public_bytes = cmd.read_tpm2b()?;
        finish(cmd)?;

        let parent_seed = self.storage_seed(parent)?;
        let hierarchy = self.objects.get(&parent).map(|o| o.hierarchy).unwrap_or(TPM_RH_OWNER);
        let public = RsaPublicArea::from_bytes(&public_bytes).map_err(|_| Rc(rc::parameter(rc::VALUE, 2)))?;

        if private.len() < 32 {
            return Err(Rc(rc::parameter(rc::INSUFFICIENT, 1)));
        }
        let (integrity, der) = private.split_at(32);
        if derive(b"private", &[&parent_seed, public_bytes.as_slice(), der]).as_slice() != integrity {
            return Err(Rc(rc::parameter(rc::INTEGRITY, 1)));
        }
        let key = RsaPrivateKey::from_pkcs1_der(der).map_err(|_| Rc(rc::parameter(rc::INTEGRITY, 1)))?;
        if key.n().to_bytes_be() != public.modulus {
            return Err(Rc(rc::parameter(rc::KEY, 2)));
        }

        let name = public.name();
        let handle = self.insert_transient(SimObject {
            public,
            sensitive: Sensitive::Signing(Box::new(key)),
            hierarchy,
        })?;
        Ok(Reply::with_handle(handle, CommandBuffer::new().write_tpm2b(&name).into_bytes()))
    }

    fn context_save(&mut self, cmd: &mut ResponseBuffer) -> SimResult<Reply> {
        let handle = cmd.read_u32()?;
        finish(cmd)?;

        let object = self
            .objects
            .get(&handle)
            .filter(|_| HandleKind::of(handle) == Some(HandleKind::Transient))
            .ok_or(Rc(rc::parameter(rc::HANDLE, 1)))?;
        let payload = object.to_payload()?;
        let hierarchy = object.hierarchy;

        self.context_sequence += 1;
        let sequence = self.context_sequence;
        let integrity = self.context_integrity(sequence, SAVED_OBJECT_HANDLE, hierarchy, &payload);

        let params = CommandBuffer::new()
            .write_u64(sequence)
            .write_u32(SAVED_OBJECT_HANDLE)
            .write_u32(hierarchy)
            .write_tpm2b(&[integrity.as_slice(), &payload].concat())
            .into_bytes();
        Ok(Reply::params(params))
    }

    fn context_load(&mut self, cmd: &mut ResponseBuffer) -> SimResult<Reply> {
        let sequence = cmd.read_u64()?;
        let saved_handle = cmd.read_u32()?;
        let hierarchy = cmd.read_u32()?;
        let blob = cmd.read_tpm2b()?;
        if cmd.remaining() != 0 {
            return Err(Rc(rc::parameter(rc::SIZE, 1)));
        }

        if saved_handle != SAVED_OBJECT_HANDLE {
            return Err(Rc(rc::parameter(rc::HANDLE, 1)));
        }
        if hierarchy != TPM_RH_OWNER {
            return Err(Rc(rc::parameter(rc::HIERARCHY, 1)));
        }
        if blob.len() < 32 {
            return Err(Rc(rc::parameter(rc::INSUFFICIENT, 1)));
        }
        let (integrity, payload) = blob.split_at(32);
        if self.context_integrity(sequence, saved_handle, hierarchy, payload).as_slice() != integrity {
            return Err(Rc(rc::parameter(rc::INTEGRITY, 1)));
        }

        let object = SimObject::from_payload(payload, hierarchy)?;
        let handle = self.insert_transient(object)?;
        Ok(Reply::with_handle(handle, Vec::new()))
    }

    fn read_public(&mut self, cmd: &mut ResponseBuffer) -> SimResult<Reply> {
        let handle = cmd.read_u32()?;
        finish(cmd)?;

        let object = self.objects.get(&handle).ok_or(Rc(rc::handle(rc::HANDLE, 1)))?;
        let name = object.public.name();
        let params = CommandBuffer::new()
            .write_tpm2b(&object.public.to_bytes())
            .write_tpm2b(&name)
            .write_tpm2b(&name)
            .into_bytes();
        Ok(Reply::params(params))
    }

    fn sign(&mut self, cmd: &mut ResponseBuffer) -> SimResult<Reply> {
        let handle = cmd.read_u32()?;
        authorize(cmd)?;
        let digest = cmd.read_tpm2b()?;
        let requested = TpmAlg::from_u16(cmd.read_u16()?).ok_or(Rc(rc::parameter(rc::SCHEME, 2)))?;
        let requested_hash = match requested {
            TpmAlg::Null => None,
            _ => Some(TpmAlg::from_u16(cmd.read_u16()?).ok_or(Rc(rc::parameter(rc::HASH, 2)))?),
        };
        let ticket_tag = cmd.read_u16()?;
        let _ticket_hierarchy = cmd.read_u32()?;
        let _ticket_digest = cmd.read_tpm2b()?;
        finish(cmd)?;

        if ticket_tag != TpmSt::HashCheck as u16 {
            return Err(Rc(rc::parameter(rc::VALUE, 3)));
        }
        let object = self.objects.get(&handle).ok_or(Rc(rc::handle(rc::HANDLE, 1)))?;
        let key = match &object.sensitive {
            Sensitive::Signing(key) if object.public.attributes.is_sign() => key,
            _ => return Err(Rc(rc::handle(rc::KEY, 1))),
        };

        let (scheme, hash) = match (requested, requested_hash, object.public.scheme) {
            (TpmAlg::Null, _, Some(fixed)) => (fixed.scheme, fixed.hash),
            (TpmAlg::Null, _, None) => return Err(Rc(rc::parameter(rc::SCHEME, 2))),
            (requested, _, Some(fixed)) if requested != fixed.scheme => {
                return Err(Rc(rc::parameter(rc::SCHEME, 2)))
            }
            (requested, Some(hash), _) => (requested, hash),
            (_, None, _) => return Err(Rc(rc::parameter(rc::HASH, 2))),
        };
        if hash != TpmAlg::Sha256 {
            return Err(Rc(rc::parameter(rc::HASH, 2)));
        }
        if digest.len() != HashAlg::Sha256.digest_size() {
            return Err(Rc(rc::parameter(rc::SIZE, 1)));
        }

        let signature = match scheme {
            TpmAlg::RsaSsa => key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest),
            TpmAlg::RsaPss => key.sign_with_rng(&mut self.rng, Pss::new::<Sha256>(), &digest),
            _ => return Err(Rc(rc::parameter(rc::SCHEME, 2))),
        }
        .map_err(|_| Rc(rc::FAILURE))?;

        let params = CommandBuffer::new()
            .write_u16(scheme as u16)
            .write_u16(hash as u16)
            .write_tpm2b(&signature)
            .into_bytes();
        Ok(Reply::params(params))
    }

    /// creationData, creationHash and creationTicket. PCRs read as all zeros.
    fn creation_outputs(&self, pcrs: &[(HashAlg, Vec<u8>)], parent_name: &[u8], outside_info: &[u8]) -> Vec<u8> {
        let mut pcr_values = Sha256::new();
        let mut data = CommandBuffer::new().write_u32(pcrs.len() as u32);
        for (hash, bitmap) in pcrs {
            data = data
                .write_u16(hash.tpm_alg() as u16)
                .write_u8(bitmap.len() as u8)
                .write_bytes(bitmap);
            let selected: u32 = bitmap.iter().map(|b| b.count_ones()).sum();
            for _ in 0..selected {
                pcr_values.update(vec![0u8; hash.digest_size()]);
            }
        }
        let data = data
            .write_tpm2b(&pcr_values.finalize())
            .write_u8(0) // locality
            .write_u16(TpmAlg::Sha256 as u16)
            .write_tpm2b(parent_name)
            .write_tpm2b(parent_name)
            .write_tpm2b(outside_info)
            .into_bytes();

        let creation_hash = Sha256::digest(&data);
        let ticket = derive(b"ticket", &[&self.owner_proof, creation_hash.as_slice()]);
        CommandBuffer::new()
            .write_tpm2b(&data)
            .write_tpm2b(&creation_hash)
            .write_u16(TpmSt::Creation as u16)
            .write_u32(TPM_RH_OWNER)
            .write_tpm2b(&ticket)
            .into_bytes()
    }
}

fn derive(label: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn frame(tag: u16, code: u32, body: &[u8]) -> Vec<u8> {
    CommandBuffer::new()
        .write_u16(tag)
        .write_u32(10 + body.len() as u32)
        .write_u32(code)
        .write_bytes(body)
        .into_bytes()
}

/// Parameters must end exactly where the command does
fn finish(cmd: &ResponseBuffer) -> SimResult<()> {
    match cmd.remaining() {
        0 => Ok(()),
        _ => Err(Rc(rc::SIZE)),
    }
}

/// Accept a single password session with an empty password
fn authorize(cmd: &mut ResponseBuffer) -> SimResult<()> {
    let size = cmd.read_u32()? as usize;
    let start = cmd.offset();
    if cmd.read_u32()? != TPM_RS_PW {
        return Err(Rc(rc::session(rc::HANDLE, 1)));
    }
    let _nonce = cmd.read_tpm2b()?;
    let _attributes = cmd.read_u8()?;
    if !cmd.read_tpm2b()?.is_empty() {
        return Err(Rc(rc::session(rc::AUTH_FAIL, 1)));
    }
    if cmd.offset() - start != size {
        return Err(Rc(rc::AUTH_SIZE));
    }
    Ok(())
}

fn read_pcr_selection(cmd: &mut ResponseBuffer, param: u32) -> SimResult<Vec<(HashAlg, Vec<u8>)>> {
    let count = cmd.read_u32()?;
    if count > 4 {
        return Err(Rc(rc::parameter(rc::VALUE, param)));
    }
    let mut selections = Vec::new();
    for _ in 0..count {
        let hash = TpmAlg::from_u16(cmd.read_u16()?)
            .and_then(HashAlg::from_tpm_alg)
            .ok_or(Rc(rc::parameter(rc::HASH, param)))?;
        let size = cmd.read_u8()? as usize;
        if !(3..=4).contains(&size) {
            return Err(Rc(rc::parameter(rc::VALUE, param)));
        }
        selections.push((hash, cmd.read_bytes(size)?.to_vec()));
    }
    Ok(selections)
}

fn check_key_parameters(template: &RsaPublicArea, param: u32) -> SimResult<()> {
    if template.name_alg != TpmAlg::Sha256 {
        return Err(Rc(rc::parameter(rc::HASH, param)));
    }
    if !SUPPORTED_KEY_BITS.contains(&template.key_bits) {
        return Err(Rc(rc::parameter(rc::KEY_SIZE, param)));
    }
    if template.exponent != 0 && template.exponent != crate::object::RSA_DEFAULT_EXPONENT {
        return Err(Rc(rc::parameter(rc::VALUE, param)));
    }
    Ok(())
}

fn check_storage_template(template: &RsaPublicArea, param: u32) -> SimResult<()> {
    if !template.is_storage_parent() || template.attributes.is_sign() {
        return Err(Rc(rc::parameter(rc::ATTRIBUTES, param)));
    }
    if template.symmetric != Some(SymmetricDef::AES_128_CFB) {
        return Err(Rc(rc::parameter(rc::SYMMETRIC, param)));
    }
    if template.scheme.is_some() {
        return Err(Rc(rc::parameter(rc::SCHEME, param)));
    }
    check_key_parameters(template, param)
}

fn check_signing_template(template: &RsaPublicArea, param: u32) -> SimResult<()> {
    let attributes = template.attributes;
    if !attributes.is_sign() || attributes.is_decrypt() || attributes.is_restricted() {
        return Err(Rc(rc::parameter(rc::ATTRIBUTES, param)));
    }
    if template.symmetric.is_some() {
        return Err(Rc(rc::parameter(rc::SYMMETRIC, param)));
    }
    if let Some(scheme) = template.scheme {
        if !matches!(scheme.scheme, TpmAlg::RsaSsa | TpmAlg::RsaPss) {
            return Err(Rc(rc::parameter(rc::SCHEME, param)));
        }
        if scheme.hash != TpmAlg::Sha256 {
            return Err(Rc(rc::parameter(rc::HASH, param)));
        }
    }
    check_key_parameters(template, param)
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A software TPM shared by every connection made through it
#[derive(Clone)]
pub struct Simulator {
    seed: u64,
    state: Arc<Mutex<SimState>>,
}

impl Simulator {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            state: Arc::new(Mutex::new(SimState::new(seed))),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Resident handles of `kind`, ascending
    pub fn handles(&self, kind: HandleKind) -> Vec<u32> {
        lock(&self.state).resident(kind)
    }

    /// Leave an HMAC session in a session slot, as a crashed process would.
    /// Returns the handle enumeration reports for it.
    pub fn inject_loaded_session(&self) -> u32 {
        self.inject_session(SimSession {
            policy: false,
            loaded: true,
        })
    }

    /// Leave a policy session in a session slot
    pub fn inject_policy_session(&self) -> u32 {
        self.inject_session(SimSession {
            policy: true,
            loaded: true,
        })
    }

    /// Leave a saved session context behind
    pub fn inject_saved_session(&self) -> u32 {
        self.inject_session(SimSession {
            policy: true,
            loaded: false,
        })
    }

    fn inject_session(&self, session: SimSession) -> u32 {
        let mut state = lock(&self.state);
        let index = (0..HANDLE_INDEX_MASK)
            .find(|index| !state.sessions.contains_key(index))
            .unwrap_or(HANDLE_INDEX_MASK);
        state.sessions.insert(index, session);
        session.handle(index)
    }

    /// Occupy a transient slot with an object nobody owns. `None` when the
    /// slots are full.
    pub fn inject_stale_transient(&self) -> Option<u32> {
        let mut state = lock(&self.state);
        let mut modulus = vec![0u8; 256];
        state.rng.fill_bytes(&mut modulus);
        modulus[0] |= 0x80;
        let mut seed = [0u8; 32];
        state.rng.fill_bytes(&mut seed);

        let mut public = RsaPublicArea::storage_primary(2048);
        public.modulus = modulus;
        state
            .insert_transient(SimObject {
                public,
                sensitive: Sensitive::Storage { seed },
                hierarchy: TPM_RH_OWNER,
            })
            .ok()
    }

    /// Copy a loaded object to the next free persistent handle
    pub fn persist(&self, handle: u32) -> Option<u32> {
        let mut state = lock(&self.state);
        let object = state.objects.get(&handle)?.clone();
        let persistent = (FIRST_PERSISTENT..).find(|h| !state.objects.contains_key(h))?;
        state.objects.insert(persistent, object);
        Some(persistent)
    }

    /// TPM2_Clear: a new owner proof, and every owner object evicted
    pub fn clear_owner(&self) {
        let mut state = lock(&self.state);
        let owner_proof = derive(b"clear", &[&state.owner_proof]);
        state.owner_proof = owner_proof;
        state.objects.retain(|_, object| object.hierarchy != TPM_RH_OWNER);
        debug!("Simulator owner hierarchy cleared");
    }

    /// Make the next command time out without being executed
    pub fn stall_next_command(&self) {
        lock(&self.state).stall = Some(Stall::Next);
    }

    /// Make the next `command` time out without being executed
    pub fn stall_command(&self, command: TpmCc) {
        lock(&self.state).stall = Some(Stall::On(command));
    }

    /// Answer the `occurrence`-th next `command` (1 is the very next one)
    /// with `code` instead of executing it
    pub fn fail_command(&self, command: TpmCc, occurrence: usize, code: u32) {
        lock(&self.state).fault = Some(Fault {
            command,
            remaining: occurrence.max(1),
            code,
        });
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

impl Connector for Simulator {
    fn connect(&self) -> Result<Tpm> {
        let mut state = lock(&self.state);
        if state.connected {
            return Err(Error::DeviceOpen {
                device: self.endpoint(),
                source: TpmError::Io(io::Error::other("TPM simulator is already open")),
            });
        }
        state.connected = true;
        drop(state);
        Ok(Tpm::from_transport(SimConnection {
            state: Arc::clone(&self.state),
            pending: Vec::new(),
            response: Vec::new(),
            read_pos: 0,
            stalled: false,
        }))
    }

    fn endpoint(&self) -> String {
        format!("simulator (seed {})", self.seed)
    }
}

/// One open connection to a [`Simulator`]
struct SimConnection {
    state: Arc<Mutex<SimState>>,
    pending: Vec<u8>,
    response: Vec<u8>,
    read_pos: usize,
    stalled: bool,
}

impl SimConnection {
    /// Length of the first complete command in `pending`, if there is one
    fn complete_command(&self) -> Option<usize> {
        let header = self.pending.get(..10)?;
        let declared = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        let size = declared.clamp(10, MAX_COMMAND_SIZE);
        (self.pending.len() >= size).then_some(size)
    }

    fn submit(&mut self, command: &[u8]) {
        let mut state = lock(&self.state);
        self.read_pos = 0;
        let code = command
            .get(6..10)
            .and_then(|b| TpmCc::from_u32(u32::from_be_bytes([b[0], b[1], b[2], b[3]])));
        let stalled = match state.stall {
            Some(Stall::Next) => true,
            Some(Stall::On(command)) => code == Some(command),
            None => false,
        };
        if stalled {
            state.stall = None;
            self.stalled = true;
            self.response.clear();
            return;
        }
        self.response = state.execute(command);
    }
}

impl Write for SimConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(size) = self.complete_command() {
            let command: Vec<u8> = self.pending.drain(..size).collect();
            self.submit(&command);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stalled {
            self.stalled = false;
            return Err(io::Error::new(ErrorKind::TimedOut, "simulated TPM stall"));
        }
        let available = &self.response[self.read_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.read_pos += n;
        Ok(n)
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        lock(&self.state).connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(sim: &Simulator, command: &[u8]) -> (u16, u32, Vec<u8>) {
        let response = lock(&sim.state).execute(command);
        let mut buf = ResponseBuffer::new(response);
        let tag = buf.read_u16().unwrap();
        let _size = buf.read_u32().unwrap();
        let code = buf.read_u32().unwrap();
        (tag, code, buf.read_rest())
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let sim = Simulator::new(1);
        let mut command = CommandBuffer::new()
            .write_u32(0x80000000)
            .finalize(TpmSt::NoSessions, TpmCc::FlushContext);
        command[1] = 0x07;
        let (_, code, _) = exchange(&sim, &command);
        assert_eq!(code, rc::BAD_TAG);
    }

    #[test]
    fn authorized_command_without_sessions_is_rejected() {
        let sim = Simulator::new(1);
        let command = CommandBuffer::new()
            .write_u32(0x80000000)
            .finalize(TpmSt::NoSessions, TpmCc::Sign);
        let (_, code, _) = exchange(&sim, &command);
        assert_eq!(code, rc::AUTH_MISSING);
    }

    #[test]
    fn non_empty_password_fails_authorization() {
        let sim = Simulator::new(1);
        let handle = sim.inject_stale_transient().unwrap();
        let command = CommandBuffer::new()
            .write_u32(handle)
            .write_u32(10)
            .write_u32(TPM_RS_PW)
            .write_u16(0)
            .write_u8(0)
            .write_tpm2b(&[0x42])
            .write_tpm2b(&[0; 32])
            .write_u16(TpmAlg::RsaSsa as u16)
            .write_u16(TpmAlg::Sha256 as u16)
            .write_u16(TpmSt::HashCheck as u16)
            .write_u32(crate::TPM_RH_NULL)
            .write_u16(0)
            .finalize(TpmSt::Sessions, TpmCc::Sign);
        let (_, code, _) = exchange(&sim, &command);
        assert_eq!(code, rc::session(rc::AUTH_FAIL, 1));
    }

    #[test]
    fn transient_slots_are_limited() {
        let sim = Simulator::new(1);
        for _ in 0..TRANSIENT_SLOTS {
            assert!(sim.inject_stale_transient().is_some());
        }
        assert_eq!(sim.inject_stale_transient(), None);
        assert_eq!(sim.handles(HandleKind::Transient), vec![0x80000000, 0x80000001, 0x80000002]);
    }

    #[test]
    fn capability_pages_are_bounded() {
        let sim = Simulator::new(1);
        for _ in 0..20 {
            sim.inject_saved_session();
        }
        let command = CommandBuffer::new()
            .write_u32(TPM_CAP_HANDLES)
            .write_u32(HandleKind::SavedSession.first_handle())
            .write_u32(64)
            .finalize(TpmSt::NoSessions, TpmCc::GetCapability);
        let (_, code, body) = exchange(&sim, &command);
        assert_eq!(code, rc::SUCCESS);
        let mut buf = ResponseBuffer::new(body);
        assert_eq!(buf.read_u8().unwrap(), 1);
        assert_eq!(buf.read_u32().unwrap(), TPM_CAP_HANDLES);
        assert_eq!(buf.read_u32().unwrap(), MAX_CAP_HANDLES as u32);
    }

    #[test]
    fn second_connection_is_refused() {
        let sim = Simulator::new(1);
        let first = sim.connect().unwrap();
        assert!(sim.is_connected());
        assert!(matches!(sim.connect(), Err(Error::DeviceOpen { .. })));
        drop(first);
        assert!(!sim.is_connected());
        assert!(sim.connect().is_ok());
    }
}
