//! Optional Ed25519 artifact signing
//!
//! Signing is credential-gated: with no credential configured, artifacts
//! pass through unmodified and clearly labeled `Unsigned`. With a
//! credential configured, any signing failure is fatal for that job:
//! a user who requested signing must never silently receive an
//! unsigned artifact.
//!
//! A signed artifact replaces the original payload with:
//! `payload || signature(64) || pubkey(32) || magic(8)`.
//! The original unsigned payload is not retained.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::artifact::{Artifact, SignatureStatus};

/// Trailer magic identifying a signed payload
pub const TRAILER_MAGIC: &[u8; 8] = b"VSHIPSG1";

/// Total trailer length: signature + public key + magic
pub const TRAILER_LEN: usize = 64 + 32 + 8;

/// Result type for signing operations
pub type SigningResult<T> = Result<T, SigningError>;

/// Errors from signing operations. All are fatal for the affected job.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("keystore parse error: {0}")]
    Keystore(#[from] toml::de::Error),

    #[error("keystore has no key with alias '{0}'")]
    UnknownAlias(String),

    #[error("passphrase mismatch for alias '{0}'")]
    BadPassphrase(String),

    #[error("invalid key material for alias '{alias}': {reason}")]
    InvalidKeyMaterial { alias: String, reason: String },

    #[error("payload has no signing trailer")]
    MissingTrailer,

    #[error("signature verification failed")]
    BadSignature,
}

/// Signing credential as supplied through the secure external channel:
/// keystore path, key alias, passphrase. Never embedded in build
/// definitions.
#[derive(Debug, Clone)]
pub struct SigningCredential {
    /// Path to the keystore TOML file
    pub keystore_path: PathBuf,
    /// Key alias within the keystore
    pub alias: String,
    /// Passphrase guarding the alias
    pub passphrase: String,
}

/// One keystore entry: base64 Ed25519 seed guarded by a passphrase hash.
#[derive(Debug, Deserialize)]
struct KeystoreEntry {
    seed: String,
    passphrase_sha256: String,
}

#[derive(Debug, Deserialize)]
struct Keystore {
    #[serde(default)]
    keys: std::collections::BTreeMap<String, KeystoreEntry>,
}

/// Artifact signer, constructed once per pipeline run.
pub struct ArtifactSigner {
    mode: SignerMode,
}

enum SignerMode {
    /// No credential configured; artifacts pass through unsigned
    Unsigned,
    /// Credential validated, key in memory
    Loaded(SigningKey),
    /// Credential present but unvalidated; loaded at each signing
    /// attempt so a bad credential fails jobs, not the pipeline
    Deferred(SigningCredential),
}

/// Load and validate the signing key named by a credential.
fn load_key(credential: &SigningCredential) -> SigningResult<SigningKey> {
    let raw = fs::read_to_string(&credential.keystore_path)?;
    let keystore: Keystore = toml::from_str(&raw)?;

    let entry = keystore
        .keys
        .get(&credential.alias)
        .ok_or_else(|| SigningError::UnknownAlias(credential.alias.clone()))?;

    let passphrase_digest = hex::encode(Sha256::digest(credential.passphrase.as_bytes()));
    if passphrase_digest != entry.passphrase_sha256 {
        return Err(SigningError::BadPassphrase(credential.alias.clone()));
    }

    let seed_bytes = base64::engine::general_purpose::STANDARD
        .decode(&entry.seed)
        .map_err(|e| SigningError::InvalidKeyMaterial {
            alias: credential.alias.clone(),
            reason: e.to_string(),
        })?;
    let seed: [u8; 32] =
        seed_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SigningError::InvalidKeyMaterial {
                alias: credential.alias.clone(),
                reason: format!("seed must be 32 bytes, got {}", seed_bytes.len()),
            })?;

    Ok(SigningKey::from_bytes(&seed))
}

impl ArtifactSigner {
    /// A signer with no credential: all artifacts pass through unsigned.
    pub fn unsigned() -> Self {
        Self {
            mode: SignerMode::Unsigned,
        }
    }

    /// Load and validate the signing key named by the credential now.
    ///
    /// Fails if the alias is missing, the passphrase does not match, or
    /// the seed is not valid key material.
    pub fn with_credential(credential: &SigningCredential) -> SigningResult<Self> {
        Ok(Self {
            mode: SignerMode::Loaded(load_key(credential)?),
        })
    }

    /// A signer that validates the credential at signing time.
    ///
    /// A rejected credential then surfaces as a signing failure on each
    /// affected job, leaving every variant with a terminal report,
    /// rather than aborting before any job is dispatched.
    pub fn deferred(credential: SigningCredential) -> Self {
        Self {
            mode: SignerMode::Deferred(credential),
        }
    }

    /// Whether a credential is configured.
    pub fn is_configured(&self) -> bool {
        !matches!(self.mode, SignerMode::Unsigned)
    }

    /// Fingerprint of the configured public key, if any loadable.
    pub fn key_fingerprint(&self) -> Option<String> {
        match &self.mode {
            SignerMode::Unsigned => None,
            SignerMode::Loaded(key) => Some(compute_key_fingerprint(&key.verifying_key())),
            SignerMode::Deferred(credential) => load_key(credential)
                .ok()
                .map(|key| compute_key_fingerprint(&key.verifying_key())),
        }
    }

    /// Sign an artifact in place, or pass it through unchanged when no
    /// credential is configured.
    ///
    /// On success with a key, the payload file is rewritten to the
    /// signed bytes and the returned artifact carries
    /// `Signed { key_fingerprint }` and the new size.
    pub fn sign(&self, artifact: Artifact) -> SigningResult<Artifact> {
        let key = match &self.mode {
            SignerMode::Unsigned => return Ok(artifact),
            SignerMode::Loaded(key) => key.clone(),
            SignerMode::Deferred(credential) => load_key(credential)?,
        };

        let payload = fs::read(&artifact.path)?;
        let signature = key.sign(&payload);
        let verifying_key = key.verifying_key();

        let mut signed = payload;
        signed.extend_from_slice(&signature.to_bytes());
        signed.extend_from_slice(verifying_key.as_bytes());
        signed.extend_from_slice(TRAILER_MAGIC);

        // Replace the payload atomically; the unsigned original is gone
        let temp_path = artifact.path.with_extension("signing.tmp");
        fs::write(&temp_path, &signed)?;
        fs::rename(&temp_path, &artifact.path)?;

        Ok(Artifact {
            variant: artifact.variant,
            path: artifact.path,
            size: signed.len() as u64,
            signature: SignatureStatus::Signed {
                key_fingerprint: compute_key_fingerprint(&verifying_key),
            },
        })
    }
}

/// Compute the hex SHA-256 fingerprint of a public key.
pub fn compute_key_fingerprint(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Verify a signed payload's trailer and signature.
///
/// Returns the fingerprint of the embedded public key on success.
pub fn verify_signed_artifact(path: &Path) -> SigningResult<String> {
    let bytes = fs::read(path)?;
    if bytes.len() < TRAILER_LEN || !bytes.ends_with(TRAILER_MAGIC) {
        return Err(SigningError::MissingTrailer);
    }

    let payload_len = bytes.len() - TRAILER_LEN;
    let payload = &bytes[..payload_len];
    let sig_bytes = &bytes[payload_len..payload_len + 64];
    let key_bytes = &bytes[payload_len + 64..payload_len + 96];

    let signature =
        Signature::from_slice(sig_bytes).map_err(|_| SigningError::BadSignature)?;
    let key_array: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| SigningError::BadSignature)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_array).map_err(|_| SigningError::BadSignature)?;

    verifying_key
        .verify(payload, &signature)
        .map_err(|_| SigningError::BadSignature)?;

    Ok(compute_key_fingerprint(&verifying_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use tempfile::TempDir;

    fn write_keystore(dir: &Path, alias: &str, passphrase: &str) -> (PathBuf, SigningKey) {
        let key = SigningKey::generate(&mut OsRng);
        let seed_b64 = base64::engine::general_purpose::STANDARD.encode(key.to_bytes());
        let pass_hash = hex::encode(Sha256::digest(passphrase.as_bytes()));

        let keystore_path = dir.join("keystore.toml");
        fs::write(
            &keystore_path,
            format!("[keys.{alias}]\nseed = \"{seed_b64}\"\npassphrase_sha256 = \"{pass_hash}\"\n"),
        )
        .unwrap();
        (keystore_path, key)
    }

    fn artifact_on_disk(dir: &Path, content: &[u8]) -> Artifact {
        let path = dir.join("app-play-standard.apk");
        fs::write(&path, content).unwrap();
        Artifact::from_file("play-standard", &path).unwrap()
    }

    #[test]
    fn test_unconfigured_signer_passes_through() {
        let temp = TempDir::new().unwrap();
        let artifact = artifact_on_disk(temp.path(), b"payload");

        let signer = ArtifactSigner::unsigned();
        assert!(!signer.is_configured());

        let result = signer.sign(artifact.clone()).unwrap();
        assert_eq!(result.signature, SignatureStatus::Unsigned);
        assert_eq!(fs::read(&result.path).unwrap(), b"payload");
        assert_eq!(result.size, artifact.size);
    }

    #[test]
    fn test_sign_replaces_payload() {
        let temp = TempDir::new().unwrap();
        let (keystore_path, _) = write_keystore(temp.path(), "release", "s3cret");
        let artifact = artifact_on_disk(temp.path(), b"payload");

        let signer = ArtifactSigner::with_credential(&SigningCredential {
            keystore_path,
            alias: "release".to_string(),
            passphrase: "s3cret".to_string(),
        })
        .unwrap();

        let signed = signer.sign(artifact).unwrap();
        assert!(signed.signature.is_signed());
        assert_eq!(signed.size, 7 + TRAILER_LEN as u64);

        let fingerprint = verify_signed_artifact(&signed.path).unwrap();
        match signed.signature {
            SignatureStatus::Signed { key_fingerprint } => {
                assert_eq!(key_fingerprint, fingerprint);
            }
            SignatureStatus::Unsigned => panic!("expected signed status"),
        }
    }

    #[test]
    fn test_deferred_signer_signs_with_valid_credential() {
        let temp = TempDir::new().unwrap();
        let (keystore_path, _) = write_keystore(temp.path(), "release", "s3cret");
        let artifact = artifact_on_disk(temp.path(), b"payload");

        let signer = ArtifactSigner::deferred(SigningCredential {
            keystore_path,
            alias: "release".to_string(),
            passphrase: "s3cret".to_string(),
        });
        assert!(signer.is_configured());
        assert!(signer.key_fingerprint().is_some());

        let signed = signer.sign(artifact).unwrap();
        assert!(signed.signature.is_signed());
        verify_signed_artifact(&signed.path).unwrap();
    }

    #[test]
    fn test_deferred_signer_fails_at_signing_time() {
        let temp = TempDir::new().unwrap();
        let (keystore_path, _) = write_keystore(temp.path(), "release", "s3cret");
        let artifact = artifact_on_disk(temp.path(), b"payload");

        // Construction never fails; the bad passphrase surfaces per sign
        let signer = ArtifactSigner::deferred(SigningCredential {
            keystore_path,
            alias: "release".to_string(),
            passphrase: "wrong".to_string(),
        });
        assert!(signer.is_configured());
        assert!(signer.key_fingerprint().is_none());

        let err = signer.sign(artifact.clone()).unwrap_err();
        assert!(matches!(err, SigningError::BadPassphrase(_)));
        // Payload untouched
        assert_eq!(fs::read(&artifact.path).unwrap(), b"payload");
    }

    #[test]
    fn test_unknown_alias_is_fatal() {
        let temp = TempDir::new().unwrap();
        let (keystore_path, _) = write_keystore(temp.path(), "release", "s3cret");

        let result = ArtifactSigner::with_credential(&SigningCredential {
            keystore_path,
            alias: "missing".to_string(),
            passphrase: "s3cret".to_string(),
        });
        assert!(matches!(result, Err(SigningError::UnknownAlias(_))));
    }

    #[test]
    fn test_bad_passphrase_is_fatal() {
        let temp = TempDir::new().unwrap();
        let (keystore_path, _) = write_keystore(temp.path(), "release", "s3cret");

        let result = ArtifactSigner::with_credential(&SigningCredential {
            keystore_path,
            alias: "release".to_string(),
            passphrase: "wrong".to_string(),
        });
        assert!(matches!(result, Err(SigningError::BadPassphrase(_))));
    }

    #[test]
    fn test_corrupt_seed_is_fatal() {
        let temp = TempDir::new().unwrap();
        let keystore_path = temp.path().join("keystore.toml");
        let pass_hash = hex::encode(Sha256::digest(b"s3cret"));
        fs::write(
            &keystore_path,
            format!("[keys.release]\nseed = \"not-base64!!\"\npassphrase_sha256 = \"{pass_hash}\"\n"),
        )
        .unwrap();

        let result = ArtifactSigner::with_credential(&SigningCredential {
            keystore_path,
            alias: "release".to_string(),
            passphrase: "s3cret".to_string(),
        });
        assert!(matches!(
            result,
            Err(SigningError::InvalidKeyMaterial { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let temp = TempDir::new().unwrap();
        let (keystore_path, _) = write_keystore(temp.path(), "release", "s3cret");
        let artifact = artifact_on_disk(temp.path(), b"payload");

        let signer = ArtifactSigner::with_credential(&SigningCredential {
            keystore_path,
            alias: "release".to_string(),
            passphrase: "s3cret".to_string(),
        })
        .unwrap();
        let signed = signer.sign(artifact).unwrap();

        let mut bytes = fs::read(&signed.path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&signed.path, &bytes).unwrap();

        assert!(matches!(
            verify_signed_artifact(&signed.path),
            Err(SigningError::BadSignature)
        ));
    }

    #[test]
    fn test_verify_rejects_unsigned_payload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plain.apk");
        fs::write(&path, b"plain").unwrap();

        assert!(matches!(
            verify_signed_artifact(&path),
            Err(SigningError::MissingTrailer)
        ));
    }
}
