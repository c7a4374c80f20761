// SPDX-License-Identifier: MIT OR Apache-2.0

//! The signing capability and its implementations
//!
//! [`Signer`] is what callers program against. [`TpmSigner`] backs it with a
//! key held by the TPM; [`SoftwareSigner`] backs it with an in-memory RSA key
//! so the same code paths can run without a TPM.

use log::{debug, warn};
use rsa::{Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::PathBuf;

use crate::config::SignatureScheme;
use crate::context::{ContextBlob, ContextOps};
use crate::error::{Error, Result, SignError, TpmError};
use crate::object::{ObjectOps, RsaPublicArea};
use crate::store;
use crate::transport::Connector;
use crate::{HashAlg, Tpm};

/// Signs precomputed digests with an RSA key
pub trait Signer {
    type Error: std::error::Error;

    /// The public half of the signing key
    fn public(&self) -> &RsaPublicKey;

    /// Sign `digest`, which must already be hashed with `hash`
    fn sign(&self, digest: &[u8], hash: HashAlg) -> std::result::Result<Vec<u8>, Self::Error>;
}

/// Where a TPM signing key lives between sign calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// A saved context on disk, loaded and flushed on every call
    ContextFile(PathBuf),
    /// A key already resident at a persistent handle. Never loaded or flushed.
    Persistent(u32),
}

/// A [`Signer`] backed by a TPM-resident key
///
/// No TPM state is held between calls: each [`sign`](Signer::sign) opens a
/// session, loads the key, signs, flushes the key and closes the session.
pub struct TpmSigner<C> {
    connector: C,
    source: KeySource,
    scheme: SignatureScheme,
    public_area: RsaPublicArea,
    public: RsaPublicKey,
}

impl<C: Connector> TpmSigner<C> {
    /// Build a signer, reading the key's public area from the TPM once
    pub fn new(connector: C, source: KeySource, scheme: SignatureScheme) -> Result<Self> {
        let context = match &source {
            KeySource::ContextFile(path) => Some(store::load_context(path)?),
            KeySource::Persistent(_) => None,
        };

        let mut tpm = connector.connect()?;
        let handle = acquire(&mut tpm, &source, context.as_ref())?;
        let public_area = tpm
            .read_public(handle)
            .map_err(Error::tpm("read public area", |source| Error::Load {
                object: "signing key public area",
                source,
            }))?;
        release(&mut tpm, &source, handle)?;
        tpm.close()?;

        if let Some(key_scheme) = public_area.signature_scheme() {
            if key_scheme != scheme {
                warn!("Signing key is fixed to {} but {} was requested", key_scheme, scheme);
            }
        }

        Self::with_public(connector, source, scheme, public_area)
    }

    /// Build a signer from an already known public area without touching the TPM
    pub fn with_public(
        connector: C,
        source: KeySource,
        scheme: SignatureScheme,
        public_area: RsaPublicArea,
    ) -> Result<Self> {
        let public = public_area.public_key().map_err(|source| Error::Load {
            object: "signing key public area",
            source,
        })?;
        Ok(Self {
            connector,
            source,
            scheme,
            public_area,
            public,
        })
    }

    pub fn source(&self) -> &KeySource {
        &self.source
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    pub fn public_area(&self) -> &RsaPublicArea {
        &self.public_area
    }
}

impl<C: Connector> Signer for TpmSigner<C> {
    type Error = Error;

    fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    fn sign(&self, digest: &[u8], hash: HashAlg) -> Result<Vec<u8>> {
        check_digest(digest, hash)?;

        let context = match &self.source {
            KeySource::ContextFile(path) => Some(store::load_context(path)?),
            KeySource::Persistent(_) => None,
        };

        let mut tpm = self.connector.connect()?;
        let handle = acquire(&mut tpm, &self.source, context.as_ref())?;
        let signature = tpm
            .sign(handle, digest, self.scheme, hash)
            .map_err(Error::tpm("sign", |source| SignError::Rejected(source).into()))?;
        release(&mut tpm, &self.source, handle)?;
        tpm.close()?;

        if signature.scheme != self.scheme.tpm_alg() as u16 {
            return Err(SignError::UnexpectedScheme {
                expected: self.scheme,
                actual: signature.scheme,
            }
            .into());
        }
        debug!("Signed {} byte digest ({})", digest.len(), self.scheme);
        Ok(signature.signature)
    }
}

/// Make the key addressable in this session
fn acquire(tpm: &mut Tpm, source: &KeySource, context: Option<&ContextBlob>) -> Result<u32> {
    match (source, context) {
        (KeySource::ContextFile(_), Some(context)) => tpm
            .context_load(context)
            .map_err(Error::tpm("load signing key", |source| Error::Load {
                object: "signing key",
                source,
            })),
        (KeySource::Persistent(handle), _) => Ok(*handle),
        (KeySource::ContextFile(path), None) => Err(Error::Load {
            object: "signing key",
            source: TpmError::Malformed(format!("no context read from {}", path.display())),
        }),
    }
}

/// Undo [`acquire`]. Persistent keys stay where they are.
fn release(tpm: &mut Tpm, source: &KeySource, handle: u32) -> Result<()> {
    match source {
        KeySource::ContextFile(_) => tpm
            .flush_context(handle)
            .map_err(Error::tpm("flush signing key", |source| Error::Flush { handle, source })),
        KeySource::Persistent(_) => Ok(()),
    }
}

/// Only SHA-256 digests of the right length are signed
pub(crate) fn check_digest(digest: &[u8], hash: HashAlg) -> std::result::Result<(), SignError> {
    if hash != HashAlg::Sha256 {
        return Err(SignError::UnsupportedHash(hash));
    }
    if digest.len() != hash.digest_size() {
        return Err(SignError::DigestLength {
            hash,
            expected: hash.digest_size(),
            actual: digest.len(),
        });
    }
    Ok(())
}

/// A [`Signer`] holding its RSA key in memory
pub struct SoftwareSigner {
    key: RsaPrivateKey,
    public: RsaPublicKey,
    scheme: SignatureScheme,
}

impl SoftwareSigner {
    pub fn new(key: RsaPrivateKey, scheme: SignatureScheme) -> Self {
        let public = key.to_public_key();
        Self { key, public, scheme }
    }

    /// Generate a fresh key of `bits` bits
    pub fn generate(bits: usize, scheme: SignatureScheme) -> std::result::Result<Self, SignError> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
        Ok(Self::new(key, scheme))
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}

impl Signer for SoftwareSigner {
    type Error = SignError;

    fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    fn sign(&self, digest: &[u8], hash: HashAlg) -> std::result::Result<Vec<u8>, SignError> {
        check_digest(digest, hash)?;
        let signature = match self.scheme {
            SignatureScheme::RsaSsa => self.key.sign(Pkcs1v15Sign::new::<Sha256>(), digest)?,
            SignatureScheme::RsaPss => {
                self.key
                    .sign_with_rng(&mut rand::thread_rng(), Pss::new::<Sha256>(), digest)?
            }
        };
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest;

    #[test]
    fn only_sha256_digests_are_accepted() {
        assert!(matches!(
            check_digest(&[0; 48], HashAlg::Sha384),
            Err(SignError::UnsupportedHash(HashAlg::Sha384))
        ));
        assert!(matches!(
            check_digest(&[0; 31], HashAlg::Sha256),
            Err(SignError::DigestLength { expected: 32, actual: 31, .. })
        ));
        assert!(check_digest(&[0; 32], HashAlg::Sha256).is_ok());
    }

    #[test]
    fn software_signer_produces_key_sized_signatures() {
        let signer = SoftwareSigner::generate(1024, SignatureScheme::RsaSsa).unwrap();
        let digest = Sha256::digest(b"foo");
        let signature = signer.sign(&digest, HashAlg::Sha256).unwrap();
        assert_eq!(signature.len(), 128);

        let public = signer.public().clone();
        public
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .unwrap();
    }

    #[test]
    fn software_signer_rejects_wrong_hash_before_signing() {
        let signer = SoftwareSigner::generate(1024, SignatureScheme::RsaPss).unwrap();
        assert!(matches!(
            signer.sign(&[0; 20], HashAlg::Sha1),
            Err(SignError::UnsupportedHash(HashAlg::Sha1))
        ));
    }
}
