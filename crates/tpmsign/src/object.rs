// SPDX-License-Identifier: MIT OR Apache-2.0

//! RSA key templates, PCR selections, and the object commands that use them

use log::debug;
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::SignatureScheme;
use crate::error::TpmError;
use crate::{
    CommandBuffer, HashAlg, ObjectAttributes, ResponseBuffer, Tpm, TpmAlg, TpmCc, TpmSt, TPM_RH_NULL,
};

/// Public exponent used when a template leaves the exponent at zero
pub const RSA_DEFAULT_EXPONENT: u32 = 65537;

/// PCR bank and indices (a TPML_PCR_SELECTION with a single entry)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrSelection {
    hash: HashAlg,
    pcrs: Vec<u8>,
}

impl PcrSelection {
    pub fn new(hash: HashAlg, pcrs: &[u8]) -> Self {
        let mut pcrs = pcrs.to_vec();
        pcrs.sort_unstable();
        pcrs.dedup();
        Self { hash, pcrs }
    }

    pub fn hash(&self) -> HashAlg {
        self.hash
    }

    pub fn pcrs(&self) -> &[u8] {
        &self.pcrs
    }

    /// The pcrSelect bitmap. At least 3 octets (PCRs 0-23), more if a higher
    /// index is selected.
    pub fn bitmap(&self) -> Vec<u8> {
        let octets = self
            .pcrs
            .last()
            .map(|&max| (max as usize / 8) + 1)
            .unwrap_or(0)
            .max(3);
        let mut bitmap = vec![0u8; octets];
        for &pcr in &self.pcrs {
            bitmap[pcr as usize / 8] |= 1 << (pcr % 8);
        }
        bitmap
    }

    /// Serialize as TPML_PCR_SELECTION
    pub fn to_bytes(&self) -> Vec<u8> {
        if self.pcrs.is_empty() {
            return 0u32.to_be_bytes().to_vec();
        }
        let bitmap = self.bitmap();
        CommandBuffer::new()
            .write_u32(1) // count
            .write_u16(self.hash.tpm_alg() as u16)
            .write_u8(bitmap.len() as u8)
            .write_bytes(&bitmap)
            .into_bytes()
    }
}

/// Symmetric algorithm a storage key uses to protect its children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymmetricDef {
    pub alg: TpmAlg,
    pub key_bits: u16,
    pub mode: TpmAlg,
}

impl SymmetricDef {
    pub const AES_128_CFB: SymmetricDef = SymmetricDef {
        alg: TpmAlg::Aes,
        key_bits: 128,
        mode: TpmAlg::Cfb,
    };
}

/// Signing scheme fixed in a key's public area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemeDef {
    pub scheme: TpmAlg,
    pub hash: TpmAlg,
}

/// TPMT_PUBLIC for an RSA object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicArea {
    pub name_alg: TpmAlg,
    pub attributes: ObjectAttributes,
    pub auth_policy: Vec<u8>,
    pub symmetric: Option<SymmetricDef>,
    pub scheme: Option<SchemeDef>,
    pub key_bits: u16,
    /// Zero means the default exponent 65537
    pub exponent: u32,
    /// Empty in templates, filled in by the TPM
    pub modulus: Vec<u8>,
}

impl RsaPublicArea {
    /// Template for the primary key: a restricted decryption key that can
    /// parent signing keys
    pub fn storage_primary(key_bits: u16) -> Self {
        Self {
            name_alg: TpmAlg::Sha256,
            attributes: ObjectAttributes::new()
                .fixed_tpm()
                .fixed_parent()
                .sensitive_data_origin()
                .user_with_auth()
                .restricted()
                .decrypt(),
            auth_policy: Vec::new(),
            symmetric: Some(SymmetricDef::AES_128_CFB),
            scheme: None,
            key_bits,
            exponent: 0,
            modulus: Vec::new(),
        }
    }

    /// Template for an unrestricted RSA signing key using SHA-256
    pub fn signing_key(key_bits: u16, scheme: SignatureScheme) -> Self {
        Self {
            name_alg: TpmAlg::Sha256,
            attributes: ObjectAttributes::new()
                .fixed_tpm()
                .fixed_parent()
                .sensitive_data_origin()
                .user_with_auth()
                .sign_encrypt(),
            auth_policy: Vec::new(),
            symmetric: None,
            scheme: Some(SchemeDef {
                scheme: scheme.tpm_alg(),
                hash: TpmAlg::Sha256,
            }),
            key_bits,
            exponent: 0,
            modulus: Vec::new(),
        }
    }

    /// Whether this object can parent other objects
    pub fn is_storage_parent(&self) -> bool {
        self.attributes.is_restricted() && self.attributes.is_decrypt() && self.symmetric.is_some()
    }

    /// The signature scheme fixed in the key, if any
    pub fn signature_scheme(&self) -> Option<SignatureScheme> {
        self.scheme.and_then(|s| SignatureScheme::from_tpm_alg(s.scheme))
    }

    /// Serialize as TPMT_PUBLIC
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new()
            .write_u16(TpmAlg::Rsa as u16)
            .write_u16(self.name_alg as u16)
            .write_u32(self.attributes.value())
            .write_tpm2b(&self.auth_policy);

        // parameters (TPMS_RSA_PARMS)
        // symmetric (TPMT_SYM_DEF_OBJECT)
        buf = match self.symmetric {
            Some(sym) => buf
                .write_u16(sym.alg as u16)
                .write_u16(sym.key_bits)
                .write_u16(sym.mode as u16),
            None => buf.write_u16(TpmAlg::Null as u16),
        };
        // scheme (TPMT_RSA_SCHEME)
        buf = match self.scheme {
            Some(scheme) => buf.write_u16(scheme.scheme as u16).write_u16(scheme.hash as u16),
            None => buf.write_u16(TpmAlg::Null as u16),
        };

        buf.write_u16(self.key_bits)
            .write_u32(self.exponent)
            // unique (TPM2B_PUBLIC_KEY_RSA)
            .write_tpm2b(&self.modulus)
            .into_bytes()
    }

    /// Parse a TPMT_PUBLIC, which must describe an RSA key
    pub fn from_bytes(data: &[u8]) -> Result<Self, TpmError> {
        let mut buf = ResponseBuffer::new(data.to_vec());

        let key_type = buf.read_u16()?;
        if key_type != TpmAlg::Rsa as u16 {
            return Err(TpmError::Malformed(format!(
                "expected an RSA public area, got type 0x{:04X}",
                key_type
            )));
        }
        let name_alg = TpmAlg::parse(buf.read_u16()?)?;
        let attributes = ObjectAttributes::from_value(buf.read_u32()?);
        let auth_policy = buf.read_tpm2b()?;

        let symmetric = match TpmAlg::parse(buf.read_u16()?)? {
            TpmAlg::Null => None,
            alg => Some(SymmetricDef {
                alg,
                key_bits: buf.read_u16()?,
                mode: TpmAlg::parse(buf.read_u16()?)?,
            }),
        };

        // Only read scheme details if scheme is not NULL
        let scheme = match TpmAlg::parse(buf.read_u16()?)? {
            TpmAlg::Null => None,
            scheme => Some(SchemeDef {
                scheme,
                hash: TpmAlg::parse(buf.read_u16()?)?,
            }),
        };

        let key_bits = buf.read_u16()?;
        let exponent = buf.read_u32()?;
        let modulus = buf.read_tpm2b()?;

        if buf.remaining() != 0 {
            return Err(TpmError::Malformed(format!(
                "{} trailing bytes after RSA public area",
                buf.remaining()
            )));
        }

        Ok(Self {
            name_alg,
            attributes,
            auth_policy,
            symmetric,
            scheme,
            key_bits,
            exponent,
            modulus,
        })
    }

    /// The RSA public key held in this area
    pub fn public_key(&self) -> Result<RsaPublicKey, TpmError> {
        if self.modulus.is_empty() {
            return Err(TpmError::Malformed("public area has no modulus".into()));
        }
        let exponent = match self.exponent {
            0 => RSA_DEFAULT_EXPONENT,
            e => e,
        };
        RsaPublicKey::new(BigUint::from_bytes_be(&self.modulus), BigUint::from(exponent))
            .map_err(|e| TpmError::Malformed(format!("invalid RSA public key: {}", e)))
    }

    /// TPM name of the object: nameAlg || H(TPMT_PUBLIC)
    pub fn name(&self) -> Vec<u8> {
        let mut name = (TpmAlg::Sha256 as u16).to_be_bytes().to_vec();
        name.extend_from_slice(&Sha256::digest(self.to_bytes()));
        name
    }
}

/// Result from TPM2_CreatePrimary
#[derive(Debug)]
pub struct PrimaryKeyResult {
    pub handle: u32,
    pub public: RsaPublicArea,
}

/// Result from TPM2_Create
#[derive(Debug, Clone)]
pub struct CreateResult {
    /// TPM2B_PRIVATE contents, only meaningful to the TPM that produced it
    pub private: Vec<u8>,
    pub public: RsaPublicArea,
}

/// TPMT_SIGNATURE for an RSA scheme, algorithm ids as the TPM reported them
#[derive(Debug, Clone)]
pub struct RsaSignature {
    pub scheme: u16,
    pub hash: u16,
    pub signature: Vec<u8>,
}

/// Object creation, loading and use
pub trait ObjectOps {
    /// Create a primary key in `hierarchy` and leave it loaded
    fn create_primary(
        &mut self,
        hierarchy: u32,
        template: &RsaPublicArea,
        creation_pcrs: &PcrSelection,
    ) -> Result<PrimaryKeyResult, TpmError>;

    /// Create a child key under a loaded storage parent. The key is not loaded.
    fn create(
        &mut self,
        parent: u32,
        template: &RsaPublicArea,
        creation_pcrs: &PcrSelection,
    ) -> Result<CreateResult, TpmError>;

    /// Load a child key's blobs under its parent, returning the new handle
    fn load(&mut self, parent: u32, private: &[u8], public: &RsaPublicArea) -> Result<u32, TpmError>;

    fn read_public(&mut self, handle: u32) -> Result<RsaPublicArea, TpmError>;

    /// Sign a precomputed digest with a loaded key
    fn sign(
        &mut self,
        key_handle: u32,
        digest: &[u8],
        scheme: SignatureScheme,
        hash: HashAlg,
    ) -> Result<RsaSignature, TpmError>;
}

impl ObjectOps for Tpm {
    fn create_primary(
        &mut self,
        hierarchy: u32,
        template: &RsaPublicArea,
        creation_pcrs: &PcrSelection,
    ) -> Result<PrimaryKeyResult, TpmError> {
        let command = CommandBuffer::new()
            .write_u32(hierarchy)
            .write_auth_empty_pw()
            // inSensitive (TPM2B_SENSITIVE_CREATE)
            .write_sensitive_create_empty()
            // inPublic (TPM2B_PUBLIC)
            .write_tpm2b(&template.to_bytes())
            // outsideInfo (TPM2B_DATA) - empty
            .write_u16(0)
            // creationPCR (TPML_PCR_SELECTION)
            .write_bytes(&creation_pcrs.to_bytes())
            .finalize(TpmSt::Sessions, TpmCc::CreatePrimary);
        let mut resp = self.transmit(&command)?;

        // Response structure: handle, then parameterSize (when using sessions)
        let handle = resp.read_u32()?;
        self.track(handle);
        let parameter_size = resp.read_u32()?;
        let param_start = resp.offset();

        // outPublic (TPM2B_PUBLIC)
        let public = RsaPublicArea::from_bytes(&resp.read_tpm2b()?)?;

        // Skip creationData, creationHash, creationTicket and name
        resp.finish_parameters(param_start, parameter_size, TpmCc::CreatePrimary)?;

        debug!("Created primary 0x{:08X} ({}-bit RSA)", handle, public.key_bits);
        Ok(PrimaryKeyResult { handle, public })
    }

    fn create(
        &mut self,
        parent: u32,
        template: &RsaPublicArea,
        creation_pcrs: &PcrSelection,
    ) -> Result<CreateResult, TpmError> {
        let command = CommandBuffer::new()
            .write_u32(parent)
            .write_auth_empty_pw()
            .write_sensitive_create_empty()
            .write_tpm2b(&template.to_bytes())
            .write_u16(0)
            .write_bytes(&creation_pcrs.to_bytes())
            .finalize(TpmSt::Sessions, TpmCc::Create);
        let mut resp = self.transmit(&command)?;

        let parameter_size = resp.read_u32()?;
        let param_start = resp.offset();

        // outPrivate (TPM2B_PRIVATE), outPublic (TPM2B_PUBLIC)
        let private = resp.read_tpm2b()?;
        let public = RsaPublicArea::from_bytes(&resp.read_tpm2b()?)?;

        resp.finish_parameters(param_start, parameter_size, TpmCc::Create)?;

        Ok(CreateResult { private, public })
    }

    fn load(&mut self, parent: u32, private: &[u8], public: &RsaPublicArea) -> Result<u32, TpmError> {
        let command = CommandBuffer::new()
            .write_u32(parent)
            .write_auth_empty_pw()
            .write_tpm2b(private)
            .write_tpm2b(&public.to_bytes())
            .finalize(TpmSt::Sessions, TpmCc::Load);
        let mut resp = self.transmit(&command)?;

        let handle = resp.read_u32()?;
        self.track(handle);
        let parameter_size = resp.read_u32()?;
        let param_start = resp.offset();
        // name (TPM2B_NAME)
        resp.finish_parameters(param_start, parameter_size, TpmCc::Load)?;

        debug!("Loaded object 0x{:08X} under parent 0x{:08X}", handle, parent);
        Ok(handle)
    }

    fn read_public(&mut self, handle: u32) -> Result<RsaPublicArea, TpmError> {
        let command = CommandBuffer::new()
            .write_u32(handle)
            .finalize(TpmSt::NoSessions, TpmCc::ReadPublic);
        let mut resp = self.transmit(&command)?;

        // outPublic, then name and qualifiedName which we do not need
        RsaPublicArea::from_bytes(&resp.read_tpm2b()?)
    }

    fn sign(
        &mut self,
        key_handle: u32,
        digest: &[u8],
        scheme: SignatureScheme,
        hash: HashAlg,
    ) -> Result<RsaSignature, TpmError> {
        let command = CommandBuffer::new()
            .write_u32(key_handle)
            .write_auth_empty_pw()
            // digest (TPM2B_DIGEST)
            .write_tpm2b(digest)
            // inScheme (TPMT_SIG_SCHEME)
            .write_u16(scheme.tpm_alg() as u16)
            .write_u16(hash.tpm_alg() as u16)
            // validation (TPMT_TK_HASHCHECK) - NULL ticket
            .write_u16(TpmSt::HashCheck as u16)
            .write_u32(TPM_RH_NULL)
            .write_u16(0)
            .finalize(TpmSt::Sessions, TpmCc::Sign);
        let mut resp = self.transmit(&command)?;

        let parameter_size = resp.read_u32()?;
        let param_start = resp.offset();

        // TPMT_SIGNATURE
        let scheme = resp.read_u16()?;
        let hash = resp.read_u16()?;
        // TPMS_SIGNATURE_RSA
        let signature = resp.read_tpm2b()?;

        resp.finish_parameters(param_start, parameter_size, TpmCc::Sign)?;

        Ok(RsaSignature {
            scheme,
            hash,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcr0_selection_bytes() {
        let selection = PcrSelection::new(HashAlg::Sha256, &[0]);
        assert_eq!(
            selection.to_bytes(),
            vec![0, 0, 0, 1, 0x00, 0x0B, 3, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn pcr_selection_bitmap_grows_past_23() {
        let selection = PcrSelection::new(HashAlg::Sha256, &[23, 7, 7, 24]);
        assert_eq!(selection.pcrs(), &[7, 23, 24]);
        assert_eq!(selection.bitmap(), vec![0x80, 0x00, 0x80, 0x01]);
    }

    #[test]
    fn empty_pcr_selection_has_zero_count() {
        assert_eq!(PcrSelection::new(HashAlg::Sha256, &[]).to_bytes(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn signing_template_layout() {
        let bytes = RsaPublicArea::signing_key(2048, SignatureScheme::RsaSsa).to_bytes();
        let expected = vec![
            0x00, 0x01, // type RSA
            0x00, 0x0B, // nameAlg SHA-256
            0x00, 0x04, 0x00, 0x72, // attributes
            0x00, 0x00, // authPolicy
            0x00, 0x10, // symmetric NULL
            0x00, 0x14, 0x00, 0x0B, // RSASSA / SHA-256
            0x08, 0x00, // keyBits
            0x00, 0x00, 0x00, 0x00, // exponent
            0x00, 0x00, // unique
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn storage_template_parses_back() {
        let template = RsaPublicArea::storage_primary(2048);
        assert!(template.is_storage_parent());
        assert_eq!(template.signature_scheme(), None);
        let parsed = RsaPublicArea::from_bytes(&template.to_bytes()).unwrap();
        assert_eq!(parsed, template);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = RsaPublicArea::signing_key(2048, SignatureScheme::RsaPss).to_bytes();
        bytes.push(0);
        assert!(matches!(RsaPublicArea::from_bytes(&bytes), Err(TpmError::Malformed(_))));
    }

    #[test]
    fn template_without_modulus_has_no_key() {
        let template = RsaPublicArea::signing_key(2048, SignatureScheme::RsaSsa);
        assert!(template.public_key().is_err());
    }
}
