//! Pure validation functions for profiles, batch updates, search requests,
//! and relationship cards.
//!
//! Every check reports the first violating field using a dotted path (e.g.
//! `signedProfile.profile.name`), matching the wire-level
//! `ErrorInvalidValue.details` contract: these functions never attempt to
//! report more than one failure per call.

use profile_core::crypto::{verify_identity_id, verify_profile_signature};
use profile_core::types::{
    IdentityId, Location, SignedProfile, SignedRelationshipCard, Version, HASH_LENGTH,
    MAX_EXTRA_DATA_BYTES, MAX_NAME_BYTES, MAX_PUBLIC_KEY_BYTES, MAX_TYPE_BYTES,
};
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid value at {path}: {reason}")]
pub struct ValidationError {
    pub path: String,
    pub reason: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError { path: path.into(), reason: reason.into() }
    }
}

type Result<T> = std::result::Result<T, ValidationError>;

/// Whether the sentinel `InternalInvalidProfileType` placeholder is an
/// acceptable `type_` for this call. A follower may hold a slot with the
/// sentinel while waiting for the origin to redeliver a valid profile; a
/// normal AddProfile/ChangeProfile from a client never may.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SentinelPolicy {
    Reject,
    Allow,
}

/// Validate a signed profile's fields 1-8 in order and, on the first
/// violation, return a dotted field path plus reason.
pub fn validate_signed_profile(
    signed: &SignedProfile,
    claimed_id: &IdentityId,
    sentinel: SentinelPolicy,
) -> Result<()> {
    if !signed.profile.version.is_current() {
        return Err(ValidationError::new(
            "signedProfile.profile.version",
            format!("expected {:?}, got {:?}", Version::CURRENT, signed.profile.version),
        ));
    }

    if signed.profile.public_key.is_empty()
        || signed.profile.public_key.len() > MAX_PUBLIC_KEY_BYTES
    {
        return Err(ValidationError::new(
            "signedProfile.profile.publicKey",
            "public key must be non-empty and at most the configured maximum length",
        ));
    }

    verify_identity_id(signed, claimed_id).map_err(|e| {
        ValidationError::new("signedProfile.profile.publicKey", format!("identity id mismatch: {e}"))
    })?;

    if signed.profile.is_sentinel_type() {
        if sentinel == SentinelPolicy::Reject {
            return Err(ValidationError::new(
                "signedProfile.profile.type",
                "the reserved placeholder type may not be set directly",
            ));
        }
    } else if signed.profile.type_.is_empty() || signed.profile.type_.len() > MAX_TYPE_BYTES {
        return Err(ValidationError::new(
            "signedProfile.profile.type",
            "type must be non-empty and at most the configured maximum length",
        ));
    }

    if signed.profile.name.is_empty() || signed.profile.name.len() > MAX_NAME_BYTES {
        return Err(ValidationError::new(
            "signedProfile.profile.name",
            "name must be non-empty and at most the configured maximum length",
        ));
    }

    if !signed.profile.location.is_valid() {
        return Err(ValidationError::new(
            "signedProfile.profile.location",
            "latitude/longitude out of range",
        ));
    }

    if signed.profile.extra_data.len() > MAX_EXTRA_DATA_BYTES {
        return Err(ValidationError::new(
            "signedProfile.profile.extraData",
            "extra data exceeds the configured maximum length",
        ));
    }

    for (path, hash) in [
        ("signedProfile.profile.profileImageHash", &signed.profile.profile_image_hash),
        ("signedProfile.profile.thumbnailImageHash", &signed.profile.thumbnail_image_hash),
    ] {
        if !hash.is_empty() && hash.len() != HASH_LENGTH {
            return Err(ValidationError::new(path, "image hash must be empty or 32 bytes"));
        }
    }

    verify_profile_signature(signed)
        .map_err(|e| ValidationError::new("signedProfile.signature", e.to_string()))?;

    Ok(())
}

/// The noPropagation flag may only be set from an identity's second update
/// onward, and once set may never be cleared.
pub fn validate_no_propagation_transition(is_first_update: bool, previous: bool, requested: bool) -> Result<()> {
    if is_first_update && requested {
        return Err(ValidationError::new(
            "signedProfile.profile.noPropagation",
            "cannot be set on an identity's initializing update",
        ));
    }
    if previous && !requested {
        return Err(ValidationError::new(
            "signedProfile.profile.noPropagation",
            "cannot be cleared once set",
        ));
    }
    Ok(())
}

/// Detect the first repeated IdentityId in a batch update, per the
/// per-request duplicate-target rule.
pub fn first_duplicate_identity_id(ids: &[IdentityId]) -> Option<IdentityId> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(*id) {
            return Some(*id);
        }
    }
    None
}

/// One item of a `SharedProfileUpdate` batch, as seen by the validator:
/// an update carries the claimed target identity alongside the profile so
/// the duplicate-target and MaxHostedIdentities checks don't need to
/// recompute `identity_id()` themselves.
pub enum BatchEntry<'a> {
    Update { identity_id: IdentityId, signed: &'a SignedProfile, previously_hosted: bool },
    Delete { identity_id: IdentityId },
}

/// Validate an entire `SharedProfileUpdate` batch in index order: each
/// item's own rules (via `validate_signed_profile` for updates), a
/// per-request duplicate-target check, and a running count against
/// `max_hosted_identities` for items that would newly host an identity.
/// Reports the first violation with an `items[{index}].*` dotted path.
pub fn validate_batch(
    entries: &[BatchEntry<'_>],
    existing_hosted_count: usize,
    max_hosted_identities: usize,
) -> Result<()> {
    let mut seen = HashSet::new();
    let mut projected_count = existing_hosted_count;

    for (index, entry) in entries.iter().enumerate() {
        let identity_id = match entry {
            BatchEntry::Update { identity_id, .. } => *identity_id,
            BatchEntry::Delete { identity_id } => *identity_id,
        };
        if !seen.insert(identity_id) {
            return Err(ValidationError::new(
                format!("items[{index}].identityId"),
                "identity id repeated within the same batch",
            ));
        }

        match entry {
            BatchEntry::Update { identity_id, signed, previously_hosted } => {
                validate_signed_profile(signed, identity_id, SentinelPolicy::Reject).map_err(|e| {
                    ValidationError::new(format!("items[{index}].update.{}", e.path), e.reason)
                })?;
                if !previously_hosted {
                    projected_count += 1;
                    if projected_count > max_hosted_identities {
                        return Err(ValidationError::new(
                            format!("items[{index}].update"),
                            "batch would exceed the configured maximum hosted identity count",
                        ));
                    }
                }
            }
            BatchEntry::Delete { .. } => {
                if projected_count > 0 {
                    projected_count -= 1;
                }
            }
        }
    }
    Ok(())
}

/// Bounds for a profile search request.
pub struct SearchRequestLimits {
    pub max_name_filter_len: usize,
    pub max_type_filter_len: usize,
    pub max_extra_data_filter_len: usize,
    pub max_results: u32,
}

impl Default for SearchRequestLimits {
    fn default() -> Self {
        SearchRequestLimits {
            max_name_filter_len: MAX_NAME_BYTES,
            max_type_filter_len: MAX_TYPE_BYTES,
            max_extra_data_filter_len: MAX_EXTRA_DATA_BYTES,
            max_results: 1000,
        }
    }
}

/// Validate a search request's filters: name/type length bounds, a
/// regex-well-formed ExtraData filter within its byte bound, a
/// positive radius whenever a location is supplied, and a bounded
/// maxResults.
pub fn validate_search_request(
    name_filter: Option<&str>,
    type_filter: Option<&str>,
    extra_data_filter: Option<&str>,
    near: Option<&Location>,
    radius_meters: Option<f64>,
    max_results: u32,
    limits: &SearchRequestLimits,
) -> Result<()> {
    if let Some(name) = name_filter {
        if name.len() > limits.max_name_filter_len {
            return Err(ValidationError::new(
                "searchRequest.nameFilter",
                "name filter exceeds the configured maximum length",
            ));
        }
    }
    if let Some(ty) = type_filter {
        if ty.len() > limits.max_type_filter_len {
            return Err(ValidationError::new(
                "searchRequest.typeFilter",
                "type filter exceeds the configured maximum length",
            ));
        }
    }
    if let Some(pattern) = extra_data_filter {
        if pattern.len() > limits.max_extra_data_filter_len {
            return Err(ValidationError::new(
                "searchRequest.extraDataFilter",
                "extra data filter exceeds the configured maximum length",
            ));
        }
        if Regex::new(pattern).is_err() {
            return Err(ValidationError::new(
                "searchRequest.extraDataFilter",
                "must be a well-formed regular expression",
            ));
        }
    }
    match (near, radius_meters) {
        (Some(location), Some(radius)) => {
            if !location.is_valid() || location.is_none() {
                return Err(ValidationError::new(
                    "searchRequest.near",
                    "latitude/longitude out of range",
                ));
            }
            if !(radius > 0.0) {
                return Err(ValidationError::new(
                    "searchRequest.radiusMeters",
                    "must be positive when a location is supplied",
                ));
            }
        }
        (None, None) => {}
        _ => {
            return Err(ValidationError::new(
                "searchRequest.near",
                "near and radiusMeters must be supplied together",
            ));
        }
    }
    if max_results == 0 || max_results > limits.max_results {
        return Err(ValidationError::new(
            "searchRequest.maxResults",
            format!("must be between 1 and {}", limits.max_results),
        ));
    }
    Ok(())
}

/// Validate a signed relationship card: self-referential CardId, issuer
/// signature, and the validity window.
pub fn validate_signed_card(signed: &SignedRelationshipCard) -> Result<()> {
    if !signed.card.version.is_current() {
        return Err(ValidationError::new(
            "signedCard.card.version",
            format!("expected {:?}, got {:?}", Version::CURRENT, signed.card.version),
        ));
    }

    profile_core::crypto::verify_card_id(&signed.card)
        .map_err(|e| ValidationError::new("signedCard.card.cardId", e.to_string()))?;

    if signed.card.valid_from >= signed.card.valid_to {
        return Err(ValidationError::new(
            "signedCard.card.validTo",
            "validTo must be strictly after validFrom",
        ));
    }

    profile_core::crypto::verify_card_signature(&signed.card, &signed.issuer_signature)
        .map_err(|e| ValidationError::new("signedCard.issuerSignature", e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use profile_core::crypto::KeyPair;
    use profile_core::types::{Location, Profile, RelationshipCard};
    use rand::rngs::OsRng;

    fn keypair() -> KeyPair {
        KeyPair::generate(&mut OsRng)
    }

    fn valid_profile(keypair: &KeyPair) -> SignedProfile {
        let profile = Profile {
            version: Version::CURRENT,
            public_key: keypair.public_key_bytes(),
            type_: "Person".into(),
            name: "Alice".into(),
            location: Location::NONE,
            extra_data: String::new(),
            profile_image_hash: vec![],
            thumbnail_image_hash: vec![],
            no_propagation: false,
        };
        keypair.sign_profile(profile).unwrap()
    }

    #[test]
    fn accepts_well_formed_profile() {
        let kp = keypair();
        let signed = valid_profile(&kp);
        assert!(validate_signed_profile(&signed, &kp.identity_id(), SentinelPolicy::Reject).is_ok());
    }

    #[test]
    fn rejects_empty_name_with_dotted_path() {
        let kp = keypair();
        let mut signed = valid_profile(&kp);
        signed.profile.name = String::new();
        let err = validate_signed_profile(&signed, &kp.identity_id(), SentinelPolicy::Reject).unwrap_err();
        assert_eq!(err.path, "signedProfile.profile.name");
    }

    #[test]
    fn rejects_sentinel_type_by_default() {
        let kp = keypair();
        let mut profile = valid_profile(&kp).profile;
        profile.type_ = profile_core::types::INTERNAL_INVALID_PROFILE_TYPE.into();
        let signed = kp.sign_profile(profile).unwrap();
        let err = validate_signed_profile(&signed, &kp.identity_id(), SentinelPolicy::Reject).unwrap_err();
        assert_eq!(err.path, "signedProfile.profile.type");

        assert!(validate_signed_profile(&signed, &kp.identity_id(), SentinelPolicy::Allow).is_ok());
    }

    #[test]
    fn no_propagation_cannot_be_set_on_first_update() {
        let err = validate_no_propagation_transition(true, false, true).unwrap_err();
        assert_eq!(err.path, "signedProfile.profile.noPropagation");
    }

    #[test]
    fn no_propagation_cannot_be_cleared() {
        let err = validate_no_propagation_transition(false, true, false).unwrap_err();
        assert_eq!(err.path, "signedProfile.profile.noPropagation");
    }

    #[test]
    fn no_propagation_can_be_set_on_later_update() {
        assert!(validate_no_propagation_transition(false, false, true).is_ok());
    }

    #[test]
    fn batch_rejects_duplicate_target_with_indexed_path() {
        let kp = keypair();
        let signed = valid_profile(&kp);
        let id = kp.identity_id();
        let entries = vec![
            BatchEntry::Update { identity_id: id, signed: &signed, previously_hosted: false },
            BatchEntry::Delete { identity_id: id },
        ];
        let err = validate_batch(&entries, 0, 100).unwrap_err();
        assert_eq!(err.path, "items[1].identityId");
    }

    #[test]
    fn batch_rejects_over_capacity_additions() {
        let kp = keypair();
        let signed = valid_profile(&kp);
        let entries = vec![BatchEntry::Update { identity_id: kp.identity_id(), signed: &signed, previously_hosted: false }];
        let err = validate_batch(&entries, 5, 5).unwrap_err();
        assert_eq!(err.path, "items[0].update");
    }

    #[test]
    fn batch_accepts_well_formed_updates() {
        let kp = keypair();
        let signed = valid_profile(&kp);
        let entries = vec![BatchEntry::Update { identity_id: kp.identity_id(), signed: &signed, previously_hosted: false }];
        assert!(validate_batch(&entries, 0, 100).is_ok());
    }

    #[test]
    fn search_request_rejects_malformed_regex_filter() {
        let limits = SearchRequestLimits::default();
        let err =
            validate_search_request(None, None, Some("(unclosed"), None, None, 10, &limits)
                .unwrap_err();
        assert_eq!(err.path, "searchRequest.extraDataFilter");
    }

    #[test]
    fn search_request_rejects_non_positive_radius_with_location() {
        let limits = SearchRequestLimits::default();
        let near = Location { latitude: 0, longitude: 0 };
        let err =
            validate_search_request(None, None, None, Some(&near), Some(0.0), 10, &limits)
                .unwrap_err();
        assert_eq!(err.path, "searchRequest.radiusMeters");
    }

    #[test]
    fn search_request_rejects_radius_without_location() {
        let limits = SearchRequestLimits::default();
        let err =
            validate_search_request(None, None, None, None, Some(100.0), 10, &limits).unwrap_err();
        assert_eq!(err.path, "searchRequest.near");
    }

    #[test]
    fn search_request_accepts_well_formed_filters() {
        let limits = SearchRequestLimits::default();
        let near = Location { latitude: 37_000_000, longitude: -122_000_000 };
        assert!(validate_search_request(
            Some("Alice"),
            Some("Person"),
            Some("tag:.*"),
            Some(&near),
            Some(500.0),
            10,
            &limits
        )
        .is_ok());
    }

    #[test]
    fn detects_duplicate_targets() {
        let a = IdentityId([1; 32]);
        let b = IdentityId([2; 32]);
        assert_eq!(first_duplicate_identity_id(&[a, b, a]), Some(a));
        assert_eq!(first_duplicate_identity_id(&[a, b]), None);
    }

    #[test]
    fn validates_relationship_card() {
        let issuer = keypair();
        let card = RelationshipCard {
            card_id: [0; 32],
            version: Version::CURRENT,
            issuer_public_key: issuer.public_key_bytes(),
            recipient_public_key: vec![9; 32],
            card_type: "Colleague".into(),
            valid_from: 0,
            valid_to: 1,
        };
        let (card, issuer_signature) = issuer.sign_card(card).unwrap();
        let signed = SignedRelationshipCard { card, issuer_signature };
        assert!(validate_signed_card(&signed).is_ok());
    }

    #[test]
    fn rejects_card_with_backwards_validity_window() {
        let issuer = keypair();
        let card = RelationshipCard {
            card_id: [0; 32],
            version: Version::CURRENT,
            issuer_public_key: issuer.public_key_bytes(),
            recipient_public_key: vec![9; 32],
            card_type: "Colleague".into(),
            valid_from: 100,
            valid_to: 50,
        };
        let (card, issuer_signature) = issuer.sign_card(card).unwrap();
        let signed = SignedRelationshipCard { card, issuer_signature };
        let err = validate_signed_card(&signed).unwrap_err();
        assert_eq!(err.path, "signedCard.card.validTo");
    }
}
