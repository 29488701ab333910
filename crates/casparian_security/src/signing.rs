//! Identity providers: artifact signing and verification.
//!
//! Two implementations share one [`IdentityProvider`] interface: [`LocalIdentity`]
//! is a symmetric HMAC-SHA256 MAC keyed by a shared secret (no external
//! dependency, suitable for single-operator deployments), and
//! [`FederatedIdentity`] is an asymmetric Ed25519 keypair standing in for a
//! real enterprise identity provider. The network side of a federated
//! provider (token exchange, OIDC discovery) is out of scope here.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hex::FromHex;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("malformed signature hex: {0}")]
    MalformedHex(#[from] hex::FromHexError),
    #[error("malformed key material: {0}")]
    MalformedKey(String),
}

pub type Result<T> = std::result::Result<T, SigningError>;

/// Compute SHA256 hash of data
pub fn sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute a stable artifact hash from multiple components.
///
/// Components are separated with ASCII Unit Separator (0x1f) to avoid ambiguity.
pub fn compute_artifact_hash(
    source_code: &str,
    lockfile_content: &str,
    manifest_json: &str,
    schema_artifacts_json: &str,
) -> String {
    const SEP: u8 = 0x1f;
    let mut hasher = Sha256::new();
    for part in [
        source_code,
        lockfile_content,
        manifest_json,
        schema_artifacts_json,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([SEP]);
    }
    hex::encode(hasher.finalize())
}

/// A caller authenticated by an [`IdentityProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub display_name: String,
    pub external_identity_oid: Option<String>,
}

/// A signature produced by `IdentityProvider::sign`, hex-encoded for storage
/// alongside the manifest row it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedArtifact {
    pub artifact_hash: String,
    pub signature: String,
}

/// Common contract both identity modes satisfy, matching how the artifact
/// gate authenticates a publisher, signs, and later re-verifies a manifest.
pub trait IdentityProvider {
    /// Resolve a bearer token (or the absence of one, for local mode) to a
    /// [`User`].
    fn authenticate(&self, token: Option<&str>) -> Result<User>;

    /// Sign an artifact hash, producing the hex signature stored on the
    /// manifest row.
    fn sign(&self, artifact_hash: &str) -> Result<SignedArtifact>;

    /// Verify a hex-encoded signature against an artifact hash.
    fn verify(&self, artifact_hash: &str, signature: &str) -> Result<bool>;
}

/// Symmetric-MAC identity provider for single-operator deployments: one
/// shared secret signs and verifies, with no external identity system.
pub struct LocalIdentity {
    shared_secret: Vec<u8>,
    display_name: String,
}

impl LocalIdentity {
    pub fn new(shared_secret: impl Into<Vec<u8>>, display_name: impl Into<String>) -> Self {
        Self {
            shared_secret: shared_secret.into(),
            display_name: display_name.into(),
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.shared_secret)
            .map_err(|e| SigningError::MalformedKey(e.to_string()))
    }
}

impl IdentityProvider for LocalIdentity {
    fn authenticate(&self, _token: Option<&str>) -> Result<User> {
        Ok(User {
            display_name: self.display_name.clone(),
            external_identity_oid: None,
        })
    }

    fn sign(&self, artifact_hash: &str) -> Result<SignedArtifact> {
        let mut mac = self.mac()?;
        mac.update(artifact_hash.as_bytes());
        let tag = mac.finalize().into_bytes();
        Ok(SignedArtifact {
            artifact_hash: artifact_hash.to_string(),
            signature: hex::encode(tag),
        })
    }

    fn verify(&self, artifact_hash: &str, signature: &str) -> Result<bool> {
        let mut mac = self.mac()?;
        mac.update(artifact_hash.as_bytes());
        let expected = Vec::from_hex(signature)?;
        Ok(mac.verify_slice(&expected).is_ok())
    }
}

/// Asymmetric Ed25519 identity provider, standing in for a federated
/// enterprise identity until wired to a real provider.
pub struct FederatedIdentity {
    signing_key: SigningKey,
    display_name: String,
    external_identity_oid: Option<String>,
}

impl FederatedIdentity {
    /// Construct from a 32-byte Ed25519 seed.
    pub fn from_seed_bytes(
        seed: &[u8; 32],
        display_name: impl Into<String>,
        external_identity_oid: Option<String>,
    ) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
            display_name: display_name.into(),
            external_identity_oid,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl IdentityProvider for FederatedIdentity {
    fn authenticate(&self, _token: Option<&str>) -> Result<User> {
        // A real federated provider exchanges `token` with its identity
        // service here; that network call is out of scope.
        Ok(User {
            display_name: self.display_name.clone(),
            external_identity_oid: self.external_identity_oid.clone(),
        })
    }

    fn sign(&self, artifact_hash: &str) -> Result<SignedArtifact> {
        let signature: Signature = self.signing_key.sign(artifact_hash.as_bytes());
        Ok(SignedArtifact {
            artifact_hash: artifact_hash.to_string(),
            signature: hex::encode(signature.to_bytes()),
        })
    }

    fn verify(&self, artifact_hash: &str, signature: &str) -> Result<bool> {
        let bytes = Vec::from_hex(signature)?;
        let sig_bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| SigningError::MalformedKey("signature must be 64 bytes".into()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        Ok(self
            .verifying_key()
            .verify(artifact_hash.as_bytes(), &sig)
            .is_ok())
    }
}
