//! Casparian Flow Security Module
//!
//! Provides:
//! - **Gatekeeper**: AST-based Python code validation
//! - **Signing**: HMAC/Ed25519 identity providers for artifact signing and verification

pub mod gatekeeper;
pub mod signing;

pub use gatekeeper::{extract_manifest, Gatekeeper, ManifestSpec, ManifestValue};
pub use signing::{FederatedIdentity, IdentityProvider, LocalIdentity, SignedArtifact, User};
