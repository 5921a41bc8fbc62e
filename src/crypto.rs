//! EdDSA signing and RSA denomination-key verification.
//!
//! Treated as a thin, black-box boundary per spec §1's Non-goal ("the
//! cryptographic primitives themselves ... are treated as black-box
//! operations with named purposes") — no custom blinding or RSA-PSS
//! implementation lives here, only the signing/verification calls the rest
//! of the crate needs, purpose-tagged so a signature can never be replayed
//! across contexts.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use eyre::{eyre, Result, WrapErr};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::RsaPublicKey;
use std::fmt;
use std::path::Path;

use crate::types::{HashCode, PublicKey32, Signature, SignaturePurpose};

/// An instance's EdDSA signing keypair, loaded from a private-key file per
/// spec §4.1. `Debug` redacts the key material.
pub struct MerchantKeypair {
    signing_key: SigningKey,
}

impl fmt::Debug for MerchantKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MerchantKeypair")
            .field("public_key", &self.public_key())
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

impl MerchantKeypair {
    /// Load a 32-byte seed from `path`, generating and persisting a fresh one
    /// if the file does not yet exist (first-run bootstrap, spec §4.1).
    pub fn load_or_create(path: &Path, file_mode: u32) -> Result<Self> {
        if path.exists() {
            let bytes = std::fs::read(path)
                .wrap_err_with(|| format!("failed to read keyfile {}", path.display()))?;
            let seed: [u8; 32] = bytes
                .get(..32)
                .ok_or_else(|| eyre!("keyfile {} is shorter than 32 bytes", path.display()))?
                .try_into()
                .unwrap();
            return Ok(Self {
                signing_key: SigningKey::from_bytes(&seed),
            });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }
        let mut seed = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut seed);
        std::fs::write(path, seed)
            .wrap_err_with(|| format!("failed to write keyfile {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(file_mode))
                .wrap_err_with(|| format!("failed to chmod keyfile {}", path.display()))?;
        }
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn public_key(&self) -> PublicKey32 {
        HashCode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign `(purpose, payload)`. The purpose tag is prepended to the signed
    /// bytes so the same payload hash can never be reinterpreted under a
    /// different purpose.
    pub fn sign(&self, purpose: SignaturePurpose, payload: &[u8]) -> Signature {
        let mut message = Vec::with_capacity(4 + payload.len());
        message.extend_from_slice(&(purpose as u32).to_be_bytes());
        message.extend_from_slice(payload);
        let sig = self.signing_key.sign(&message);
        Signature(sig.to_bytes())
    }

    pub fn sign_hash(&self, purpose: SignaturePurpose, hash: &HashCode) -> Signature {
        self.sign(purpose, &hash.0)
    }
}

/// Verify a merchant/exchange signature over `(purpose, payload)` against a
/// known public key. Used by the track-transfer reconciler to check the
/// signed payloads an exchange forwards (spec §4.6 step 6).
pub fn verify(
    public_key: &PublicKey32,
    purpose: SignaturePurpose,
    payload: &[u8],
    signature: &Signature,
) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(&public_key.0)
        .map_err(|e| eyre!("invalid public key: {e}"))?;
    let mut message = Vec::with_capacity(4 + payload.len());
    message.extend_from_slice(&(purpose as u32).to_be_bytes());
    message.extend_from_slice(payload);
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    verifying_key
        .verify(&message, &sig)
        .map_err(|e| eyre!("signature verification failed: {e}"))
}

/// Parse a denomination public key as presented in an exchange's `/keys`
/// response (PKCS#1 DER, base32-wrapped at the JSON boundary by callers).
pub fn parse_denomination_key(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_der(der).map_err(|e| eyre!("invalid denomination key: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_shim::TempPath;

    mod tempfile_shim {
        //! Minimal scratch-file helper so crypto tests do not depend on the
        //! `tempfile` crate, which is not part of the ambient stack.
        use std::path::PathBuf;

        pub struct TempPath(pub PathBuf);
        impl TempPath {
            pub fn new(name: &str) -> Self {
                let mut p = std::env::temp_dir();
                p.push(format!("taler-merchant-core-test-{}-{}", std::process::id(), name));
                TempPath(p)
            }
        }
        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }
    }

    #[test]
    fn keypair_roundtrip_sign_verify() {
        let path = TempPath::new("key1");
        let kp = MerchantKeypair::load_or_create(&path.0, 0o600).unwrap();
        let payload = b"hello contract";
        let sig = kp.sign(SignaturePurpose::MerchantContract, payload);
        verify(&kp.public_key(), SignaturePurpose::MerchantContract, payload, &sig).unwrap();
    }

    #[test]
    fn wrong_purpose_fails_verification() {
        let path = TempPath::new("key2");
        let kp = MerchantKeypair::load_or_create(&path.0, 0o600).unwrap();
        let payload = b"hello contract";
        let sig = kp.sign(SignaturePurpose::MerchantContract, payload);
        let result = verify(&kp.public_key(), SignaturePurpose::MerchantPaymentOk, payload, &sig);
        assert!(result.is_err());
    }

    #[test]
    fn load_or_create_is_idempotent() {
        let path = TempPath::new("key3");
        let kp1 = MerchantKeypair::load_or_create(&path.0, 0o600).unwrap();
        let kp2 = MerchantKeypair::load_or_create(&path.0, 0o600).unwrap();
        assert_eq!(kp1.public_key(), kp2.public_key());
    }
}
