//! RSA-SHA256 primitives used by the HTTP signature pipeline
//!
//! All operations take explicit byte buffers; PEM import accepts both
//! PKCS#8/SPKI and the older PKCS#1 encodings, since remote servers publish
//! either.

use crate::error::Error;
use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    signature::{SignatureEncoding, Signer, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};

/// A private/public key pair used for HTTP signatures
#[derive(Debug, Clone)]
pub struct Keypair {
    /// Private key in PEM format
    pub private_key: String,
    /// Public key in PEM format
    pub public_key: String,
}

/// Generate a random asymmetric keypair for ActivityPub HTTP signatures.
pub fn generate_actor_keypair() -> Result<Keypair, Error> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).map_err(Error::other)?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok(Keypair {
        private_key: private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(Error::other)?
            .to_string(),
        public_key: public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(Error::other)?,
    })
}

/// Parse a private key from PEM, accepting PKCS#8 and PKCS#1 encodings.
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, Error> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|_| Error::KeyInvalid)
}

/// Parse a public key from PEM, accepting SPKI and PKCS#1 encodings.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, Error> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|_| Error::KeyInvalid)
}

/// Sign `bytes` with RSASSA-PKCS1-v1_5 over SHA-256 and return the raw signature.
pub fn sign(private_key_pem: &str, bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let key = parse_private_key(private_key_pem)?;
    let signer = SigningKey::<Sha256>::new(key);
    let signature = signer.try_sign(bytes).map_err(Error::other)?;
    Ok(signature.to_vec())
}

/// Verify an RSASSA-PKCS1-v1_5 SHA-256 signature over `bytes`.
pub fn verify(public_key_pem: &str, signature: &[u8], bytes: &[u8]) -> Result<bool, Error> {
    let key = parse_public_key(public_key_pem)?;
    let verifier = VerifyingKey::<Sha256>::new(key);
    let signature = match Signature::try_from(signature) {
        Ok(s) => s,
        Err(_) => return Ok(false),
    };
    Ok(verifier.verify(bytes, &signature).is_ok())
}

/// SHA-256 of `bytes`, base64-encoded for use in `Digest` headers.
pub fn digest_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Base64.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_roundtrip() {
        let keypair = generate_actor_keypair().unwrap();
        let message = b"the quick brown fox";
        let signature = sign(&keypair.private_key, message).unwrap();
        assert!(verify(&keypair.public_key, &signature, message).unwrap());
        assert!(!verify(&keypair.public_key, &signature, b"tampered").unwrap());
    }

    #[test]
    fn verify_with_wrong_key_fails() {
        let keypair = generate_actor_keypair().unwrap();
        let other = generate_actor_keypair().unwrap();
        let signature = sign(&keypair.private_key, b"message").unwrap();
        assert!(!verify(&other.public_key, &signature, b"message").unwrap());
    }

    #[test]
    fn garbage_signature_is_rejected_not_an_error() {
        let keypair = generate_actor_keypair().unwrap();
        assert!(!verify(&keypair.public_key, b"not a signature", b"message").unwrap());
    }

    #[test]
    fn digest_matches_known_value() {
        // printf 'Lorem ipsum' | sha256sum | xxd -r -p | base64
        assert_eq!(
            digest_sha256(b"Lorem ipsum"),
            "qaZpePN4RWyBj7ij58atPSyD5ickzL3qezYlP7jfXt0="
        );
    }

    #[test]
    fn pem_forms_are_interchangeable() {
        let keypair = generate_actor_keypair().unwrap();
        // Generated keys are PKCS#8/SPKI; parsing must succeed directly.
        parse_private_key(&keypair.private_key).unwrap();
        parse_public_key(&keypair.public_key).unwrap();
    }
}
