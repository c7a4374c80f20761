// SPDX-License-Identifier: MIT OR Apache-2.0

//! RSA signature checks and public key encodings

use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Sign, Pss, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::VerifyError;

const SHA256_DIGEST_LEN: usize = 32;

/// RSA signature padding, always with SHA-256
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// RSASSA-PKCS1-v1_5
    Pkcs1v15,
    /// RSASSA-PSS, salt length equal to the digest length
    Pss,
}

/// Verify an RSA signature over a precomputed SHA-256 digest
pub fn verify_signature(
    public_key: &RsaPublicKey,
    padding: Padding,
    digest: &[u8],
    signature: &[u8],
) -> Result<(), VerifyError> {
    if digest.len() != SHA256_DIGEST_LEN {
        return Err(VerifyError::DigestLength(digest.len()));
    }

    let result = match padding {
        Padding::Pkcs1v15 => public_key.verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature),
        Padding::Pss => public_key.verify(Pss::new::<Sha256>(), digest, signature),
    };
    result.map_err(|e| VerifyError::SignatureInvalid(e.to_string()))
}

/// Verify an RSA signature over the SHA-256 hash of `message`
pub fn verify_message(
    public_key: &RsaPublicKey,
    padding: Padding,
    message: &[u8],
    signature: &[u8],
) -> Result<(), VerifyError> {
    let digest = Sha256::digest(message);
    verify_signature(public_key, padding, &digest, signature)
}

/// PEM-encoded SubjectPublicKeyInfo
pub fn public_key_pem(public_key: &RsaPublicKey) -> Result<String, VerifyError> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| VerifyError::Encoding(e.to_string()))
}

/// SHA-256 of the DER-encoded SubjectPublicKeyInfo (hex string)
pub fn public_key_fingerprint(public_key: &RsaPublicKey) -> Result<String, VerifyError> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| VerifyError::Encoding(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(der.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    fn key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap()
    }

    #[test]
    fn pkcs1v15_signature_verifies_and_bit_flip_fails() {
        let key = key();
        let digest = Sha256::digest(b"foo");
        let mut signature = key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
        let public = key.to_public_key();

        verify_signature(&public, Padding::Pkcs1v15, &digest, &signature).unwrap();
        verify_message(&public, Padding::Pkcs1v15, b"foo", &signature).unwrap();

        signature[17] ^= 0x01;
        assert!(matches!(
            verify_signature(&public, Padding::Pkcs1v15, &digest, &signature),
            Err(VerifyError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn pss_signature_does_not_verify_as_pkcs1v15() {
        let key = key();
        let digest = Sha256::digest(b"foo");
        let signature = key
            .sign_with_rng(&mut rand::thread_rng(), Pss::new::<Sha256>(), &digest)
            .unwrap();
        let public = key.to_public_key();

        verify_signature(&public, Padding::Pss, &digest, &signature).unwrap();
        assert!(verify_signature(&public, Padding::Pkcs1v15, &digest, &signature).is_err());
    }

    #[test]
    fn short_digest_is_rejected() {
        let public = key().to_public_key();
        assert!(matches!(
            verify_signature(&public, Padding::Pkcs1v15, &[0; 20], &[0; 128]),
            Err(VerifyError::DigestLength(20))
        ));
    }

    #[test]
    fn pem_and_fingerprint_describe_the_same_key() {
        let public = key().to_public_key();
        let pem = public_key_pem(&public).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));

        let fingerprint = public_key_fingerprint(&public).unwrap();
        assert_eq!(fingerprint.len(), 64);
        assert_eq!(fingerprint, public_key_fingerprint(&public).unwrap());
    }
}
