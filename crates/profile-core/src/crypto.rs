//! Identity/card hashing and Ed25519 signing primitives.
//!
//! IdentityId and CardId are SHA-256 digests, not BLAKE3; the wire format
//! this protocol descends from fixes SHA-256 for both, so this module uses
//! `sha2` rather than the hash this workspace otherwise favors.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::types::{Bytes32, IdentityId, Profile, RelationshipCard, SignedProfile};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// IdentityId = SHA-256(PublicKey).
pub fn identity_id_from_public_key(public_key: &[u8]) -> IdentityId {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    let digest: Bytes32 = hasher.finalize().into();
    IdentityId(digest)
}

/// CardId = SHA-256(card with card_id zeroed), per the relationship card
/// self-referential-hash invariant.
pub fn derive_card_id(card: &RelationshipCard) -> Result<Bytes32> {
    let mut zeroed = card.clone();
    zeroed.card_id = [0u8; 32];
    let bytes = canonical_bytes(&zeroed)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

/// Verify that a card's embedded card_id matches its own hash.
pub fn verify_card_id(card: &RelationshipCard) -> Result<()> {
    let computed = derive_card_id(card)?;
    if computed != card.card_id {
        return Err(Error::HashMismatch {
            computed: hex::encode(computed),
            transmitted: hex::encode(card.card_id),
        });
    }
    Ok(())
}

/// Verify that a SignedProfile's implied IdentityId matches SHA-256 of its
/// carried public key.
pub fn verify_identity_id(signed: &SignedProfile, claimed: &IdentityId) -> Result<()> {
    let computed = identity_id_from_public_key(&signed.profile.public_key);
    if computed != *claimed {
        return Err(Error::HashMismatch {
            computed: computed.to_string(),
            transmitted: claimed.to_string(),
        });
    }
    Ok(())
}

/// Verify the Ed25519 signature over `canonical_bytes(profile)`.
pub fn verify_profile_signature(signed: &SignedProfile) -> Result<()> {
    let verifying_key = parse_verifying_key(&signed.profile.public_key)?;
    let sig_bytes: [u8; 64] = signed
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);
    let message = canonical_bytes(&signed.profile)?;
    verifying_key
        .verify(&message, &signature)
        .map_err(|_| Error::InvalidSignature)
}

/// Verify the issuer's Ed25519 signature over `canonical_bytes(card)`.
pub fn verify_card_signature(
    card: &RelationshipCard,
    issuer_signature: &[u8],
) -> Result<()> {
    let verifying_key = parse_verifying_key(&card.issuer_public_key)?;
    let sig_bytes: [u8; 64] = issuer_signature
        .try_into()
        .map_err(|_| Error::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);
    let message = canonical_bytes(card)?;
    verifying_key
        .verify(&message, &signature)
        .map_err(|_| Error::InvalidSignature)
}

fn parse_verifying_key(public_key: &[u8]) -> Result<VerifyingKey> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| Error::InvalidPublicKey("expected 32-byte Ed25519 key".into()))?;
    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))
}

/// An Ed25519 keypair, used by tests and by tooling that hosts identities
/// locally. The running server never holds a hosted identity's private key
/// (only the signed profile), so this wrapper lives only for test fixtures
/// and the `profiled` bootstrap of its own ServerId key.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate<R: rand::CryptoRng + rand::RngCore>(rng: &mut R) -> Self {
        KeyPair { signing_key: SigningKey::generate(rng) }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        KeyPair { signing_key: SigningKey::from_bytes(seed) }
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }

    pub fn identity_id(&self) -> IdentityId {
        identity_id_from_public_key(&self.public_key_bytes())
    }

    pub fn sign_profile(&self, profile: Profile) -> Result<SignedProfile> {
        let message = canonical_bytes(&profile)?;
        let signature = self.signing_key.sign(&message);
        Ok(SignedProfile { profile, signature: signature.to_bytes().to_vec() })
    }

    pub fn sign_card(&self, mut card: RelationshipCard) -> Result<(RelationshipCard, Vec<u8>)> {
        card.card_id = derive_card_id(&card)?;
        let message = canonical_bytes(&card)?;
        let signature = self.signing_key.sign(&message);
        Ok((card, signature.to_bytes().to_vec()))
    }
}
