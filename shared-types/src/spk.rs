//! Signed package (`.spk`) header parsing and verification.
//!
//! Format (spec.md §6): an 8-byte magic, a detached Ed25519 signature, then
//! a framed package body. The app's public key doubles as its `AppId`. The
//! package-id is the first 16 bytes of the BLAKE2b hash of the signed body.
//! Grounded in `original_source/src/sandstorm/spk.h`'s `verifySpk`/
//! `unpackSpk` contract; the exact capnp framing of the body is outside the
//! retrieved pack, so the concrete byte layout below (magic, pubkey,
//! signature, body) is this implementation's own choice of a verifiable
//! container, not a translation of upstream bytes.

use blake2::{Blake2b512, Digest};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::ids::{AppId, PackageId, APP_ID_BYTE_SIZE, PACKAGE_ID_BYTE_SIZE};

pub const SPK_MAGIC: &[u8; 8] = b"SNSTORM\0";
const SIGNATURE_SIZE: usize = 64;
const HEADER_SIZE: usize = 8 + APP_ID_BYTE_SIZE + SIGNATURE_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum SpkError {
    #[error("package too short to contain a header")]
    Truncated,
    #[error("bad magic bytes")]
    BadMagic,
    #[error("malformed app public key")]
    BadPublicKey,
    #[error("malformed signature")]
    BadSignature,
    #[error("signature verification failed")]
    SignatureInvalid,
}

pub struct VerifiedPackage {
    pub app_id: AppId,
    pub package_id: PackageId,
    pub body: Vec<u8>,
}

/// Verifies an in-memory `.spk` image: checks magic, extracts the signing
/// key and signature, verifies the signature over the body, and derives the
/// package-id from the body's BLAKE2b digest.
pub fn verify_spk(data: &[u8]) -> Result<VerifiedPackage, SpkError> {
    if data.len() < HEADER_SIZE {
        return Err(SpkError::Truncated);
    }
    let (magic, rest) = data.split_at(8);
    if magic != SPK_MAGIC {
        return Err(SpkError::BadMagic);
    }
    let (pubkey_bytes, rest) = rest.split_at(APP_ID_BYTE_SIZE);
    let (sig_bytes, body) = rest.split_at(SIGNATURE_SIZE);

    let pubkey_arr: [u8; APP_ID_BYTE_SIZE] = pubkey_bytes
        .try_into()
        .map_err(|_| SpkError::BadPublicKey)?;
    let verifying_key =
        VerifyingKey::from_bytes(&pubkey_arr).map_err(|_| SpkError::BadPublicKey)?;

    let sig_arr: [u8; SIGNATURE_SIZE] = sig_bytes.try_into().map_err(|_| SpkError::BadSignature)?;
    let signature = Signature::from_bytes(&sig_arr);

    verifying_key
        .verify(body, &signature)
        .map_err(|_| SpkError::SignatureInvalid)?;

    let package_id = derive_package_id(body);

    Ok(VerifiedPackage {
        app_id: AppId::from_bytes(pubkey_arr),
        package_id,
        body: body.to_vec(),
    })
}

/// Builds a signable `.spk` image from a body and a signing key — used by
/// tests and by tooling outside the core (the spk-signing tool is out of
/// scope per spec.md §1, but the core must still be able to construct
/// fixtures for its own test suite).
pub fn sign_spk(body: &[u8], signing_key: &ed25519_dalek::SigningKey) -> Vec<u8> {
    use ed25519_dalek::Signer;
    let signature = signing_key.sign(body);
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(SPK_MAGIC);
    out.extend_from_slice(signing_key.verifying_key().as_bytes());
    out.extend_from_slice(&signature.to_bytes());
    out.extend_from_slice(body);
    out
}

fn derive_package_id(body: &[u8]) -> PackageId {
    let mut hasher = Blake2b512::new();
    hasher.update(body);
    let digest = hasher.finalize();
    let mut bytes = [0u8; PACKAGE_ID_BYTE_SIZE];
    bytes.copy_from_slice(&digest[..PACKAGE_ID_BYTE_SIZE]);
    PackageId::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn round_trips_sign_and_verify() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let body = b"app binary tree goes here".to_vec();
        let spk = sign_spk(&body, &signing_key);

        let verified = verify_spk(&spk).unwrap();
        assert_eq!(verified.app_id.as_bytes(), signing_key.verifying_key().as_bytes());
        assert_eq!(verified.body, body);
    }

    #[test]
    fn package_id_is_deterministic_for_same_body() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let body = b"identical content".to_vec();
        let a = verify_spk(&sign_spk(&body, &signing_key)).unwrap();
        let b = verify_spk(&sign_spk(&body, &signing_key)).unwrap();
        assert_eq!(a.package_id, b.package_id);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = vec![0u8; HEADER_SIZE + 1];
        data[0..8].copy_from_slice(b"NOTSPK\0\0");
        assert!(matches!(verify_spk(&data), Err(SpkError::BadMagic)));
    }

    #[test]
    fn rejects_tampered_body() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let body = b"original".to_vec();
        let mut spk = sign_spk(&body, &signing_key);
        let last = spk.len() - 1;
        spk[last] ^= 0xFF;
        assert!(matches!(verify_spk(&spk), Err(SpkError::SignatureInvalid)));
    }
}
